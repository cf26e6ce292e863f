//! Desired load-balancer state
//!
//! Translates one Service snapshot plus the current backend-candidate nodes
//! into the exact cloud-side shape the reconciler should converge on.
//! Annotation parsing and validation happen here, before any cloud call, so
//! misconfigured services fail fast with a terminal error.

use crate::client::types::*;
use crate::config::{CloudConfig, SecurityListManagementMode};
use crate::domain::{NodeSpec, ServicePort, ServiceSpec, SessionAffinity, TrafficPolicy};
use crate::error::{Error, Result};
use std::collections::{BTreeMap, BTreeSet};

pub const ANNOTATION_INTERNAL: &str = "service.beta.kubernetes.io/oci-load-balancer-internal";
pub const ANNOTATION_SHAPE: &str = "service.beta.kubernetes.io/oci-load-balancer-shape";
pub const ANNOTATION_SHAPE_FLEX_MIN: &str =
    "service.beta.kubernetes.io/oci-load-balancer-shape-flex-min";
pub const ANNOTATION_SHAPE_FLEX_MAX: &str =
    "service.beta.kubernetes.io/oci-load-balancer-shape-flex-max";
pub const ANNOTATION_SUBNET1: &str = "service.beta.kubernetes.io/oci-load-balancer-subnet1";
pub const ANNOTATION_SUBNET2: &str = "service.beta.kubernetes.io/oci-load-balancer-subnet2";
pub const ANNOTATION_SSL_PORTS: &str = "service.beta.kubernetes.io/oci-load-balancer-ssl-ports";
pub const ANNOTATION_TLS_SECRET: &str = "service.beta.kubernetes.io/oci-load-balancer-tls-secret";
pub const ANNOTATION_IDLE_TIMEOUT: &str =
    "service.beta.kubernetes.io/oci-load-balancer-connection-idle-timeout";
pub const ANNOTATION_SECLIST_MODE: &str =
    "service.beta.kubernetes.io/oci-load-balancer-security-list-management-mode";
pub const ANNOTATION_BACKEND_PROTOCOL: &str =
    "service.beta.kubernetes.io/oci-load-balancer-backend-protocol";
pub const ANNOTATION_HEALTH_CHECK_RETRIES: &str =
    "service.beta.kubernetes.io/oci-load-balancer-health-check-retries";
pub const ANNOTATION_HEALTH_CHECK_INTERVAL: &str =
    "service.beta.kubernetes.io/oci-load-balancer-health-check-interval";
pub const ANNOTATION_HEALTH_CHECK_TIMEOUT: &str =
    "service.beta.kubernetes.io/oci-load-balancer-health-check-timeout";
pub const ANNOTATION_NSG_IDS: &str = "service.beta.kubernetes.io/oci-network-security-groups";

/// The cloud API caps network security groups per balancer
const MAX_NSG_IDS: usize = 5;

/// Default fixed shape when none is annotated
const DEFAULT_SHAPE: &str = "100Mbps";
/// Flexible-shape bandwidth bounds, Mbps
const FLEX_SHAPE_MIN_MBPS: u32 = 10;
const FLEX_SHAPE_MAX_MBPS: u32 = 8192;

/// Display names are capped by the cloud API
const MAX_DISPLAY_NAME_LEN: usize = 1024;

/// The derived display name: `namespace/name/uid`, truncated to the API cap.
///
/// The uid suffix keeps recreated services from adopting a stale balancer.
pub fn load_balancer_name(svc: &ServiceSpec) -> String {
    let full = format!("{}/{}/{}", svc.namespace, svc.name, svc.uid);
    match full.char_indices().nth(MAX_DISPLAY_NAME_LEN) {
        Some((idx, _)) => full[..idx].to_string(),
        None => full,
    }
}

// =============================================================================
// Per-Service Settings
// =============================================================================

/// Validated per-service settings parsed from annotations, with the cloud
/// config supplying defaults.
#[derive(Debug, Clone)]
pub struct LbServiceConfig {
    pub internal: bool,
    pub shape: String,
    pub shape_min_mbps: Option<u32>,
    pub shape_max_mbps: Option<u32>,
    pub subnet1: Option<String>,
    pub subnet2: Option<String>,
    pub ssl_ports: BTreeSet<u16>,
    pub tls_secret: Option<String>,
    pub idle_timeout_sec: Option<u64>,
    pub management_mode: SecurityListManagementMode,
    pub backend_protocol: Option<String>,
    pub health_check_retries: Option<u32>,
    pub health_check_interval_ms: Option<u32>,
    pub health_check_timeout_ms: Option<u32>,
    pub nsg_ids: Vec<String>,
}

impl LbServiceConfig {
    /// Parse and validate the service's annotations against the cloud config.
    pub fn parse(svc: &ServiceSpec, cloud: &CloudConfig) -> Result<Self> {
        if svc.session_affinity == SessionAffinity::ClientIp {
            return Err(Error::InvalidConfiguration(format!(
                "service {}: ClientIP session affinity is not supported",
                svc.qualified_name()
            )));
        }
        if svc.ports.is_empty() {
            return Err(Error::InvalidConfiguration(format!(
                "service {}: no ports",
                svc.qualified_name()
            )));
        }

        let internal = annotation_bool(svc, ANNOTATION_INTERNAL)?;
        let subnet1 = svc
            .annotation(ANNOTATION_SUBNET1)
            .map(str::to_string)
            .or_else(|| cloud.load_balancer.subnet1.clone());
        let subnet2 = svc
            .annotation(ANNOTATION_SUBNET2)
            .map(str::to_string)
            .or_else(|| cloud.load_balancer.subnet2.clone());
        if internal && svc.annotation(ANNOTATION_SUBNET2).is_some() {
            return Err(Error::InvalidConfiguration(format!(
                "service {}: internal load balancers take a single subnet; \
                 the subnet2 annotation contradicts the internal annotation",
                svc.qualified_name()
            )));
        }

        let shape = svc
            .annotation(ANNOTATION_SHAPE)
            .unwrap_or(DEFAULT_SHAPE)
            .to_string();
        let shape_min_mbps = annotation_u32(svc, ANNOTATION_SHAPE_FLEX_MIN)?;
        let shape_max_mbps = annotation_u32(svc, ANNOTATION_SHAPE_FLEX_MAX)?;
        if shape.eq_ignore_ascii_case("flexible") {
            let (min, max) = match (shape_min_mbps, shape_max_mbps) {
                (Some(min), Some(max)) => (min, max),
                _ => {
                    return Err(Error::InvalidConfiguration(format!(
                        "service {}: flexible shape requires both flex-min and flex-max",
                        svc.qualified_name()
                    )))
                }
            };
            if !(FLEX_SHAPE_MIN_MBPS..=FLEX_SHAPE_MAX_MBPS).contains(&min)
                || !(FLEX_SHAPE_MIN_MBPS..=FLEX_SHAPE_MAX_MBPS).contains(&max)
                || min > max
            {
                return Err(Error::InvalidConfiguration(format!(
                    "service {}: flexible shape bandwidth must satisfy {} <= min <= max <= {}",
                    svc.qualified_name(),
                    FLEX_SHAPE_MIN_MBPS,
                    FLEX_SHAPE_MAX_MBPS
                )));
            }
        } else if shape_min_mbps.is_some() || shape_max_mbps.is_some() {
            return Err(Error::InvalidConfiguration(format!(
                "service {}: flex-min/flex-max require the flexible shape",
                svc.qualified_name()
            )));
        }

        let ssl_ports = parse_ssl_ports(svc)?;
        let tls_secret = svc.annotation(ANNOTATION_TLS_SECRET).map(str::to_string);
        if !ssl_ports.is_empty() && tls_secret.is_none() {
            return Err(Error::InvalidConfiguration(format!(
                "service {}: ssl-ports set without a tls-secret annotation",
                svc.qualified_name()
            )));
        }

        let management_mode = match svc.annotation(ANNOTATION_SECLIST_MODE) {
            Some(raw) => SecurityListManagementMode::parse(raw)?,
            None => cloud.load_balancer.management_mode(),
        };

        let nsg_ids: Vec<String> = svc
            .annotation(ANNOTATION_NSG_IDS)
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        if nsg_ids.len() > MAX_NSG_IDS {
            return Err(Error::InvalidConfiguration(format!(
                "service {}: at most {} network security groups are allowed",
                svc.qualified_name(),
                MAX_NSG_IDS
            )));
        }

        Ok(Self {
            internal,
            shape,
            shape_min_mbps,
            shape_max_mbps,
            subnet1,
            subnet2,
            ssl_ports,
            tls_secret,
            idle_timeout_sec: annotation_u64(svc, ANNOTATION_IDLE_TIMEOUT)?,
            management_mode,
            backend_protocol: svc
                .annotation(ANNOTATION_BACKEND_PROTOCOL)
                .map(str::to_string),
            health_check_retries: annotation_u32(svc, ANNOTATION_HEALTH_CHECK_RETRIES)?,
            health_check_interval_ms: annotation_u32(svc, ANNOTATION_HEALTH_CHECK_INTERVAL)?,
            health_check_timeout_ms: annotation_u32(svc, ANNOTATION_HEALTH_CHECK_TIMEOUT)?,
            nsg_ids,
        })
    }

    /// The subnet OCIDs the balancer attaches to: one for internal, two
    /// otherwise.
    pub fn subnet_ids(&self, svc: &ServiceSpec) -> Result<Vec<String>> {
        let subnet1 = self.subnet1.clone().ok_or_else(|| {
            Error::InvalidConfiguration(format!(
                "service {}: no load balancer subnet1 configured or annotated",
                svc.qualified_name()
            ))
        })?;
        if self.internal {
            return Ok(vec![subnet1]);
        }
        let subnet2 = self.subnet2.clone().ok_or_else(|| {
            Error::InvalidConfiguration(format!(
                "service {}: public load balancers require subnet2",
                svc.qualified_name()
            ))
        })?;
        if subnet1 == subnet2 {
            return Err(Error::InvalidConfiguration(format!(
                "service {}: subnet1 and subnet2 must differ",
                svc.qualified_name()
            )));
        }
        Ok(vec![subnet1, subnet2])
    }
}

fn annotation_bool(svc: &ServiceSpec, key: &str) -> Result<bool> {
    match svc.annotation(key) {
        None => Ok(false),
        Some(raw) => raw.parse::<bool>().map_err(|_| {
            Error::InvalidConfiguration(format!(
                "service {}: annotation {} is not a boolean: {:?}",
                svc.qualified_name(),
                key,
                raw
            ))
        }),
    }
}

fn annotation_u32(svc: &ServiceSpec, key: &str) -> Result<Option<u32>> {
    svc.annotation(key)
        .map(|raw| {
            raw.parse::<u32>().map_err(|_| {
                Error::InvalidConfiguration(format!(
                    "service {}: annotation {} is not an integer: {:?}",
                    svc.qualified_name(),
                    key,
                    raw
                ))
            })
        })
        .transpose()
}

fn annotation_u64(svc: &ServiceSpec, key: &str) -> Result<Option<u64>> {
    svc.annotation(key)
        .map(|raw| {
            raw.parse::<u64>().map_err(|_| {
                Error::InvalidConfiguration(format!(
                    "service {}: annotation {} is not an integer: {:?}",
                    svc.qualified_name(),
                    key,
                    raw
                ))
            })
        })
        .transpose()
}

/// The ssl-ports annotation: comma-separated listener ports or port names.
fn parse_ssl_ports(svc: &ServiceSpec) -> Result<BTreeSet<u16>> {
    let Some(raw) = svc.annotation(ANNOTATION_SSL_PORTS) else {
        return Ok(BTreeSet::new());
    };
    let mut ports = BTreeSet::new();
    for token in raw.split(',').map(str::trim).filter(|t| !t.is_empty()) {
        let port = if let Ok(p) = token.parse::<u16>() {
            p
        } else if let Some(p) = svc.ports.iter().find(|p| p.name == token) {
            p.external_port
        } else {
            return Err(Error::InvalidConfiguration(format!(
                "service {}: ssl port {:?} matches no service port",
                svc.qualified_name(),
                token
            )));
        };
        if !svc.ports.iter().any(|p| p.external_port == port) {
            return Err(Error::InvalidConfiguration(format!(
                "service {}: ssl port {} is not exposed by the service",
                svc.qualified_name(),
                port
            )));
        }
        ports.insert(port);
    }
    Ok(ports)
}

// =============================================================================
// Desired State
// =============================================================================

/// The exact cloud-side shape one service should converge on.
#[derive(Debug, Clone)]
pub struct DesiredLoadBalancer {
    pub name: String,
    pub shape: String,
    pub shape_min_mbps: Option<u32>,
    pub shape_max_mbps: Option<u32>,
    pub subnet_ids: Vec<String>,
    pub is_private: bool,
    pub listeners: BTreeMap<String, Listener>,
    pub backend_sets: BTreeMap<String, BackendSet>,
    pub certificates: BTreeMap<String, Certificate>,
    pub nsg_ids: Vec<String>,
    pub freeform_tags: BTreeMap<String, String>,
    pub defined_tags: BTreeMap<String, BTreeMap<String, String>>,
}

impl DesiredLoadBalancer {
    pub fn create_details(&self, compartment_id: &str) -> CreateLoadBalancerDetails {
        CreateLoadBalancerDetails {
            display_name: self.name.clone(),
            compartment_id: compartment_id.to_string(),
            shape: self.shape.clone(),
            shape_min_mbps: self.shape_min_mbps,
            shape_max_mbps: self.shape_max_mbps,
            subnet_ids: self.subnet_ids.clone(),
            is_private: self.is_private,
            listeners: self.listeners.clone(),
            backend_sets: self.backend_sets.clone(),
            certificates: self.certificates.clone(),
            nsg_ids: self.nsg_ids.clone(),
            freeform_tags: self.freeform_tags.clone(),
            defined_tags: self.defined_tags.clone(),
        }
    }
}

/// Listener and backend-set name for one service port: `PROTOCOL-port`.
pub fn port_resource_name(port: &ServicePort) -> String {
    format!("{}-{}", port.protocol, port.external_port)
}

/// Build the desired state for one service against the current node set.
///
/// `tls_certificate` is the uploaded bundle for the annotated tls-secret,
/// resolved by the caller; it is required when any ssl port is configured.
pub fn build_desired(
    svc: &ServiceSpec,
    nodes: &[NodeSpec],
    cfg: &LbServiceConfig,
    cloud: &CloudConfig,
    tls_certificate: Option<Certificate>,
) -> Result<DesiredLoadBalancer> {
    let subnet_ids = cfg.subnet_ids(svc)?;
    let backends = backend_members(nodes);

    let mut certificates = BTreeMap::new();
    let certificate_name = match (cfg.ssl_ports.is_empty(), tls_certificate) {
        (false, Some(cert)) => {
            let name = cert.certificate_name.clone();
            certificates.insert(name.clone(), cert);
            Some(name)
        }
        (false, None) => {
            return Err(Error::InvalidConfiguration(format!(
                "service {}: tls secret {:?} could not be resolved",
                svc.qualified_name(),
                cfg.tls_secret
            )))
        }
        (true, _) => None,
    };

    let mut listeners = BTreeMap::new();
    let mut backend_sets = BTreeMap::new();
    for port in &svc.ports {
        let name = port_resource_name(port);
        backend_sets.insert(
            name.clone(),
            BackendSet {
                policy: "ROUND_ROBIN".into(),
                backends: backends
                    .iter()
                    .map(|(ip, _)| Backend {
                        ip_address: ip.clone(),
                        port: port.node_port,
                        weight: 1,
                    })
                    .collect(),
                health_check: health_check(svc, cfg),
                session_persistence: None,
                ssl_config: None,
            },
        );

        let ssl_config = if cfg.ssl_ports.contains(&port.external_port) {
            certificate_name.as_ref().map(|name| SslConfiguration {
                certificate_name: name.clone(),
                verify_depth: 0,
                verify_peer_certificate: false,
            })
        } else {
            None
        };
        listeners.insert(
            name.clone(),
            Listener {
                port: port.external_port,
                protocol: cfg
                    .backend_protocol
                    .clone()
                    .unwrap_or_else(|| port.protocol.to_string()),
                default_backend_set_name: name,
                ssl_config,
                idle_timeout_sec: cfg.idle_timeout_sec,
            },
        );
    }

    let mut freeform_tags = cloud.freeform_tags.clone();
    freeform_tags.extend(cluster_tags(&cloud.cluster_ocid));

    Ok(DesiredLoadBalancer {
        name: load_balancer_name(svc),
        shape: cfg.shape.clone(),
        shape_min_mbps: cfg.shape_min_mbps,
        shape_max_mbps: cfg.shape_max_mbps,
        subnet_ids,
        is_private: cfg.internal,
        listeners,
        backend_sets,
        certificates,
        // Applied at create time; group membership changes are managed on
        // the NSG side, not by this reconciler.
        nsg_ids: cfg.nsg_ids.clone(),
        freeform_tags,
        defined_tags: cloud.defined_tags.clone(),
    })
}

/// Backend membership: candidate nodes in deterministic (instance id) order.
fn backend_members(nodes: &[NodeSpec]) -> Vec<(String, String)> {
    let mut members: Vec<(String, String)> = nodes
        .iter()
        .filter(|n| n.is_backend_candidate())
        .filter_map(|n| n.primary_address().map(|ip| (ip.to_string(), n.id.clone())))
        .collect();
    members.sort_by(|a, b| a.1.cmp(&b.1));
    members
}

/// Health check for the service's backend sets.
///
/// With the Local traffic policy the platform-assigned health-check node port
/// is probed so only nodes actually hosting endpoints pass.
fn health_check(svc: &ServiceSpec, cfg: &LbServiceConfig) -> HealthCheck {
    let mut check = HealthCheck::default();
    if svc.external_traffic_policy == TrafficPolicy::Local {
        if let Some(port) = svc.health_check_node_port {
            check.port = port;
        }
    }
    if let Some(retries) = cfg.health_check_retries {
        check.retries = retries;
    }
    if let Some(interval) = cfg.health_check_interval_ms {
        check.interval_ms = interval;
    }
    if let Some(timeout) = cfg.health_check_timeout_ms {
        check.timeout_ms = timeout;
    }
    check
}
