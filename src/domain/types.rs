//! Orchestrator-facing records
//!
//! Versioned snapshots of Services, Nodes and volume claims as delivered by
//! the host platform. These are deliberately reduced projections: the
//! informer/cache machinery that produces them is an external collaborator.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// =============================================================================
// Service
// =============================================================================

/// Transport protocol of a service port
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Protocol {
    Tcp,
    Udp,
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "TCP"),
            Protocol::Udp => write!(f, "UDP"),
        }
    }
}

/// Session affinity requested on the service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum SessionAffinity {
    #[default]
    None,
    ClientIp,
}

/// External traffic policy of the service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum TrafficPolicy {
    #[default]
    Cluster,
    Local,
}

/// One exposed port of a LoadBalancer-type service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServicePort {
    /// Port name; empty for single-port services
    pub name: String,
    pub protocol: Protocol,
    /// Port the load balancer listens on
    pub external_port: u16,
    /// Port opened on every node for this service
    pub node_port: u16,
    /// Port of the backing pods
    pub target_port: u16,
}

/// Versioned snapshot of a Service of type LoadBalancer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceSpec {
    /// Immutable platform-assigned identity
    pub uid: String,
    pub name: String,
    pub namespace: String,
    pub ports: Vec<ServicePort>,
    #[serde(default)]
    pub session_affinity: SessionAffinity,
    /// CIDRs allowed to reach the listeners; empty means open
    #[serde(default)]
    pub source_cidrs: Vec<String>,
    /// Free-form tuning annotations, `oci-load-balancer-*` keys
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    #[serde(default)]
    pub external_traffic_policy: TrafficPolicy,
    /// Health-check node port assigned when the traffic policy is Local
    #[serde(default)]
    pub health_check_node_port: Option<u16>,
}

impl ServiceSpec {
    /// `namespace/name` identity for logs and events
    pub fn qualified_name(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }

    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.annotations.get(key).map(String::as_str)
    }
}

// =============================================================================
// Node
// =============================================================================

/// A node taint; any taint excludes the node from backend membership
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Taint {
    pub key: String,
    #[serde(default)]
    pub value: String,
    pub effect: String,
}

/// Versioned snapshot of a cluster node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeSpec {
    /// Cloud instance OCID
    pub id: String,
    pub name: String,
    /// Node addresses in preference order; first entry is the backend IP
    pub addresses: Vec<String>,
    pub failure_domain: String,
    pub subnet_id: String,
    pub ready: bool,
    #[serde(default)]
    pub unschedulable: bool,
    #[serde(default)]
    pub taints: Vec<Taint>,
}

impl NodeSpec {
    /// Whether this node may appear in a backend set
    pub fn is_backend_candidate(&self) -> bool {
        self.ready && !self.unschedulable && self.taints.is_empty()
    }

    pub fn primary_address(&self) -> Option<&str> {
        self.addresses.first().map(String::as_str)
    }
}

// =============================================================================
// Volumes
// =============================================================================

/// What happens to the cloud volume when the claim goes away
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ReclaimPolicy {
    #[default]
    Delete,
    Retain,
}

/// Versioned snapshot of a persistent volume claim awaiting provisioning
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeClaim {
    pub uid: String,
    pub name: String,
    pub namespace: String,
    /// Requested capacity in bytes
    pub requested_bytes: u64,
    /// Storage-class parameters: performance tier, kms key, tags, fs type
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
    /// Failure domains permitted by topology constraints; empty means any
    #[serde(default)]
    pub requested_zones: Vec<String>,
    #[serde(default)]
    pub reclaim_policy: ReclaimPolicy,
}

impl VolumeClaim {
    pub fn qualified_name(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }
}

/// Persistent volume published back to the orchestrator after provisioning
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistentVolume {
    pub name: String,
    /// Cloud volume OCID; the CSI volume handle
    pub volume_id: String,
    pub capacity_bytes: u64,
    pub failure_domain: String,
    pub reclaim_policy: ReclaimPolicy,
    pub fs_type: String,
    /// Claim this volume was bound for
    pub claim_uid: String,
}
