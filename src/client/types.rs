//! Cloud resource records
//!
//! Typed projections of the OCI REST resources the operator reads and
//! mutates. Observed resources carry their `etag` and lifecycle state;
//! `Create*Details` records describe intent.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Reserved free-form tag naming the owning cluster
pub const TAG_CLUSTER_OCID: &str = "cluster-ocid";
/// Reserved free-form tag naming this daemon
pub const TAG_MANAGED_BY: &str = "managed-by";
/// Value of the `managed-by` tag
pub const MANAGED_BY_VALUE: &str = "oci-cloud-operator";

pub const GIB: u64 = 1024 * 1024 * 1024;
pub const MIB: u64 = 1024 * 1024;

// =============================================================================
// Lifecycle States
// =============================================================================

/// Load-balancer lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LbLifecycleState {
    Creating,
    Active,
    Updating,
    Failed,
    Deleting,
    Deleted,
}

impl LbLifecycleState {
    /// Whether mutations may be issued in this state
    pub fn accepts_writes(&self) -> bool {
        matches!(self, LbLifecycleState::Active)
    }

    pub fn is_transitional(&self) -> bool {
        matches!(self, LbLifecycleState::Creating | LbLifecycleState::Updating)
    }
}

/// Block-volume lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VolumeState {
    Provisioning,
    Restoring,
    Available,
    Terminating,
    Terminated,
    Faulty,
}

/// Volume-attachment lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AttachmentState {
    Attaching,
    Attached,
    Detaching,
    Detached,
}

/// Asynchronous work-request lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkRequestState {
    Accepted,
    InProgress,
    Succeeded,
    Failed,
}

impl WorkRequestState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, WorkRequestState::Succeeded | WorkRequestState::Failed)
    }
}

/// Asynchronous operation handle returned by LB mutations
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkRequest {
    pub id: String,
    pub lifecycle_state: WorkRequestState,
    #[serde(default)]
    pub message: Option<String>,
}

// =============================================================================
// Load Balancer
// =============================================================================

/// Backend set health check
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthCheck {
    pub protocol: String,
    pub port: u16,
    #[serde(default)]
    pub url_path: Option<String>,
    pub interval_ms: u32,
    pub timeout_ms: u32,
    pub retries: u32,
    pub return_code: u32,
}

impl Default for HealthCheck {
    fn default() -> Self {
        Self {
            protocol: "HTTP".into(),
            port: 10256,
            url_path: Some("/healthz".into()),
            interval_ms: 10_000,
            timeout_ms: 3_000,
            retries: 3,
            return_code: 200,
        }
    }
}

/// SSL termination settings on a listener or backend set
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SslConfiguration {
    pub certificate_name: String,
    #[serde(default)]
    pub verify_depth: u32,
    #[serde(default)]
    pub verify_peer_certificate: bool,
}

/// Cookie-based session persistence on a backend set
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionPersistence {
    pub cookie_name: String,
    #[serde(default)]
    pub disable_fallback: bool,
}

/// One member of a backend set
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Backend {
    pub ip_address: String,
    pub port: u16,
    pub weight: u32,
}

impl Backend {
    /// `ip:port` identity used for membership diffs
    pub fn name(&self) -> String {
        format!("{}:{}", self.ip_address, self.port)
    }
}

/// Named group of backends plus policy and health check
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendSet {
    pub policy: String,
    pub backends: Vec<Backend>,
    pub health_check: HealthCheck,
    #[serde(default)]
    pub session_persistence: Option<SessionPersistence>,
    #[serde(default)]
    pub ssl_config: Option<SslConfiguration>,
}

impl BackendSet {
    /// Backends in the canonical sorted order used for diffing
    pub fn sorted_backends(&self) -> Vec<Backend> {
        let mut b = self.backends.clone();
        b.sort();
        b
    }
}

/// A listener forwarding one port to a backend set
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Listener {
    pub port: u16,
    pub protocol: String,
    pub default_backend_set_name: String,
    #[serde(default)]
    pub ssl_config: Option<SslConfiguration>,
    #[serde(default)]
    pub idle_timeout_sec: Option<u64>,
}

/// An uploaded certificate bundle; immutable once created
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Certificate {
    pub certificate_name: String,
    pub public_certificate: String,
    #[serde(default)]
    pub ca_certificate: String,
    pub private_key: String,
    #[serde(default)]
    pub passphrase: Option<String>,
}

/// An IP address assigned to a load balancer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpAddress {
    pub ip_address: String,
    pub is_public: bool,
}

/// Observed load balancer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadBalancer {
    pub id: String,
    pub display_name: String,
    pub compartment_id: String,
    pub lifecycle_state: LbLifecycleState,
    pub shape: String,
    #[serde(default)]
    pub shape_min_mbps: Option<u32>,
    #[serde(default)]
    pub shape_max_mbps: Option<u32>,
    pub subnet_ids: Vec<String>,
    pub is_private: bool,
    #[serde(default)]
    pub listeners: BTreeMap<String, Listener>,
    #[serde(default)]
    pub backend_sets: BTreeMap<String, BackendSet>,
    #[serde(default)]
    pub certificates: BTreeMap<String, Certificate>,
    #[serde(default)]
    pub ip_addresses: Vec<IpAddress>,
    #[serde(default)]
    pub nsg_ids: Vec<String>,
    #[serde(default)]
    pub freeform_tags: BTreeMap<String, String>,
    #[serde(default)]
    pub defined_tags: BTreeMap<String, BTreeMap<String, String>>,
    #[serde(default)]
    pub etag: Option<String>,
}

impl LoadBalancer {
    /// Whether this resource is owned by the given cluster
    pub fn owned_by_cluster(&self, cluster_ocid: &str) -> bool {
        self.freeform_tags
            .get(TAG_CLUSTER_OCID)
            .map(|v| v == cluster_ocid)
            .unwrap_or(false)
    }
}

/// Intent record for load-balancer creation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateLoadBalancerDetails {
    pub display_name: String,
    pub compartment_id: String,
    pub shape: String,
    #[serde(default)]
    pub shape_min_mbps: Option<u32>,
    #[serde(default)]
    pub shape_max_mbps: Option<u32>,
    pub subnet_ids: Vec<String>,
    pub is_private: bool,
    pub listeners: BTreeMap<String, Listener>,
    pub backend_sets: BTreeMap<String, BackendSet>,
    pub certificates: BTreeMap<String, Certificate>,
    #[serde(default)]
    pub nsg_ids: Vec<String>,
    #[serde(default)]
    pub freeform_tags: BTreeMap<String, String>,
    #[serde(default)]
    pub defined_tags: BTreeMap<String, BTreeMap<String, String>>,
}

// =============================================================================
// Networking
// =============================================================================

/// Observed subnet
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subnet {
    pub id: String,
    pub vcn_id: String,
    pub cidr_block: String,
    /// None for regional subnets
    #[serde(default)]
    pub availability_domain: Option<String>,
    pub security_list_ids: Vec<String>,
}

/// One ingress or egress security rule
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SecurityRule {
    /// Rules authored by this operator carry a reserved description prefix
    #[serde(default)]
    pub description: Option<String>,
    /// Source CIDR for ingress, destination CIDR for egress
    pub cidr: String,
    /// IANA protocol number as a string: "6" TCP, "17" UDP
    pub protocol: String,
    pub port_min: u16,
    pub port_max: u16,
}

/// Observed security list with its optimistic-concurrency token
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityList {
    pub id: String,
    pub display_name: String,
    pub etag: String,
    pub ingress_rules: Vec<SecurityRule>,
    pub egress_rules: Vec<SecurityRule>,
}

// =============================================================================
// Compute
// =============================================================================

/// Observed compute instance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instance {
    pub id: String,
    pub display_name: String,
    pub compartment_id: String,
    pub availability_domain: String,
    pub lifecycle_state: String,
}

/// Observed VNIC attachment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VnicAttachment {
    pub id: String,
    pub instance_id: String,
    pub vnic_id: String,
}

/// Observed VNIC
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Vnic {
    pub id: String,
    pub private_ip: String,
    #[serde(default)]
    pub public_ip: Option<String>,
    pub subnet_id: String,
}

// =============================================================================
// Block Storage
// =============================================================================

/// Performance tier of a block volume
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum PerformanceTier {
    LowCost,
    #[default]
    Balanced,
    HighPerf,
}

impl PerformanceTier {
    /// Volume performance units per GB for this tier
    pub fn vpus_per_gb(&self) -> u32 {
        match self {
            PerformanceTier::LowCost => 0,
            PerformanceTier::Balanced => 10,
            PerformanceTier::HighPerf => 20,
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "low-cost" | "lowcost" => Some(Self::LowCost),
            "balanced" => Some(Self::Balanced),
            "high-perf" | "high-performance" => Some(Self::HighPerf),
            _ => None,
        }
    }
}

/// Observed block volume
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Volume {
    pub id: String,
    pub display_name: String,
    pub compartment_id: String,
    pub availability_domain: String,
    pub size_mbs: u64,
    pub lifecycle_state: VolumeState,
    #[serde(default)]
    pub kms_key_id: Option<String>,
    #[serde(default)]
    pub vpus_per_gb: Option<u32>,
    #[serde(default)]
    pub source_snapshot_id: Option<String>,
    #[serde(default)]
    pub freeform_tags: BTreeMap<String, String>,
    #[serde(default)]
    pub defined_tags: BTreeMap<String, BTreeMap<String, String>>,
    pub time_created: chrono::DateTime<chrono::Utc>,
}

impl Volume {
    pub fn owned_by_cluster(&self, cluster_ocid: &str) -> bool {
        self.freeform_tags
            .get(TAG_CLUSTER_OCID)
            .map(|v| v == cluster_ocid)
            .unwrap_or(false)
    }
}

/// Intent record for block-volume creation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateVolumeDetails {
    pub display_name: String,
    pub compartment_id: String,
    pub availability_domain: String,
    pub size_mbs: u64,
    #[serde(default)]
    pub kms_key_id: Option<String>,
    #[serde(default)]
    pub vpus_per_gb: Option<u32>,
    #[serde(default)]
    pub source_snapshot_id: Option<String>,
    #[serde(default)]
    pub freeform_tags: BTreeMap<String, String>,
    #[serde(default)]
    pub defined_tags: BTreeMap<String, BTreeMap<String, String>>,
}

/// Attachment transport flavor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AttachmentType {
    #[default]
    Iscsi,
    Paravirtualized,
}

/// Observed volume attachment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeAttachment {
    pub id: String,
    pub volume_id: String,
    pub instance_id: String,
    pub attachment_type: AttachmentType,
    pub lifecycle_state: AttachmentState,
    #[serde(default)]
    pub iqn: Option<String>,
    #[serde(default)]
    pub ipv4: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub chap_username: Option<String>,
    #[serde(default)]
    pub chap_secret: Option<String>,
    #[serde(default)]
    pub is_multipath: bool,
    /// Device path reported for paravirtualized attachments
    #[serde(default)]
    pub device: Option<String>,
}

/// Intent record for volume attachment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttachVolumeDetails {
    pub volume_id: String,
    pub instance_id: String,
    pub attachment_type: AttachmentType,
    #[serde(default)]
    pub is_read_only: bool,
}

// =============================================================================
// Identity
// =============================================================================

/// Availability domain within the region
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvailabilityDomain {
    pub name: String,
}

/// Observed compartment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Compartment {
    pub id: String,
    pub name: String,
}

/// Standard freeform tags stamped on every created resource.
pub fn cluster_tags(cluster_ocid: &str) -> BTreeMap<String, String> {
    let mut tags = BTreeMap::new();
    tags.insert(TAG_CLUSTER_OCID.to_string(), cluster_ocid.to_string());
    tags.insert(TAG_MANAGED_BY.to_string(), MANAGED_BY_VALUE.to_string());
    tags
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifecycle_write_gate() {
        assert!(LbLifecycleState::Active.accepts_writes());
        assert!(!LbLifecycleState::Creating.accepts_writes());
        assert!(!LbLifecycleState::Failed.accepts_writes());
        assert!(LbLifecycleState::Updating.is_transitional());
    }

    #[test]
    fn test_backend_ordering_is_deterministic() {
        let set = BackendSet {
            policy: "ROUND_ROBIN".into(),
            backends: vec![
                Backend {
                    ip_address: "10.0.0.2".into(),
                    port: 32080,
                    weight: 1,
                },
                Backend {
                    ip_address: "10.0.0.1".into(),
                    port: 32080,
                    weight: 1,
                },
            ],
            health_check: HealthCheck::default(),
            session_persistence: None,
            ssl_config: None,
        };
        let sorted = set.sorted_backends();
        assert_eq!(sorted[0].ip_address, "10.0.0.1");
        assert_eq!(sorted[1].ip_address, "10.0.0.2");
    }

    #[test]
    fn test_cluster_ownership_tag() {
        let mut vol = Volume {
            id: "ocid1.volume.oc1..v".into(),
            display_name: "pv-1".into(),
            compartment_id: "c".into(),
            availability_domain: "AD-1".into(),
            size_mbs: 51200,
            lifecycle_state: VolumeState::Available,
            kms_key_id: None,
            vpus_per_gb: None,
            source_snapshot_id: None,
            freeform_tags: cluster_tags("ocid1.cluster.oc1..me"),
            defined_tags: BTreeMap::new(),
            time_created: chrono::Utc::now(),
        };
        assert!(vol.owned_by_cluster("ocid1.cluster.oc1..me"));
        assert!(!vol.owned_by_cluster("ocid1.cluster.oc1..other"));

        vol.freeform_tags.clear();
        assert!(!vol.owned_by_cluster("ocid1.cluster.oc1..me"));
    }

    #[test]
    fn test_performance_tier_vpus() {
        assert_eq!(PerformanceTier::LowCost.vpus_per_gb(), 0);
        assert_eq!(PerformanceTier::Balanced.vpus_per_gb(), 10);
        assert_eq!(PerformanceTier::HighPerf.vpus_per_gb(), 20);
        assert_eq!(
            PerformanceTier::parse("high-perf"),
            Some(PerformanceTier::HighPerf)
        );
        assert_eq!(PerformanceTier::parse("bogus"), None);
    }
}
