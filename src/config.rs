//! Cloud configuration
//!
//! The operator reads one YAML file at start-up into an immutable
//! [`CloudConfig`] record, validates it once, and passes it by `Arc` to every
//! constructor. There is no mutable global configuration state.

use crate::error::{Error, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Default on-disk location of the cloud config
pub const DEFAULT_CONFIG_PATH: &str = "/etc/oci/config.yaml";

const CONFIG_FILE_NAME: &str = "config.yaml";

// =============================================================================
// Security List Management
// =============================================================================

/// How aggressively the reconciler manages security-list rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
pub enum SecurityListManagementMode {
    /// Manage rules on the load-balancer subnets and all node subnets.
    #[default]
    All,
    /// Manage rules on the load-balancer subnets only; node subnets are
    /// assumed to be externally managed.
    Frontend,
    /// Do not touch security lists.
    None,
}

impl SecurityListManagementMode {
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "All" => Ok(Self::All),
            "Frontend" => Ok(Self::Frontend),
            "None" => Ok(Self::None),
            other => Err(Error::InvalidConfiguration(format!(
                "unknown security list management mode {:?}",
                other
            ))),
        }
    }
}

// =============================================================================
// Configuration Sections
// =============================================================================

/// API signing identity.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct AuthConfig {
    pub region: String,
    #[serde(default)]
    pub tenancy: String,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub key: String,
    #[serde(default)]
    pub fingerprint: String,
    #[serde(default)]
    pub passphrase: Option<String>,
}

/// Load-balancer subnet pinning and security-list authority.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct LoadBalancerConfig {
    #[serde(default)]
    pub subnet1: Option<String>,
    #[serde(default)]
    pub subnet2: Option<String>,
    #[serde(default)]
    pub security_list_management_mode: SecurityListManagementMode,
    #[serde(default)]
    pub disable_security_list_management: bool,
}

impl LoadBalancerConfig {
    /// Effective management mode after the legacy disable switch.
    pub fn management_mode(&self) -> SecurityListManagementMode {
        if self.disable_security_list_management {
            SecurityListManagementMode::None
        } else {
            self.security_list_management_mode
        }
    }
}

/// Cloud client token-bucket settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimiterConfig {
    /// Steady-state refill rate, tokens per second
    #[serde(default = "default_qps")]
    pub qps: f64,
    /// Burst capacity of the bucket
    #[serde(default = "default_bucket")]
    pub bucket: u32,
}

fn default_qps() -> f64 {
    10.0
}

fn default_bucket() -> u32 {
    20
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            qps: default_qps(),
            bucket: default_bucket(),
        }
    }
}

/// Telemetry push destination. Absent section disables the pusher.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsConfig {
    pub namespace: String,
    pub compartment_id: String,
    #[serde(default)]
    pub resource_group: String,
    #[serde(default)]
    pub prefix: String,
}

// =============================================================================
// Cloud Config
// =============================================================================

/// Top-level operator configuration, deserialized from YAML once at start-up.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloudConfig {
    pub auth: AuthConfig,
    pub vcn: String,
    pub compartment: String,
    /// OCID of the owning cluster; stamped on every cloud resource the
    /// operator creates and used as the ownership gate on mutation.
    pub cluster_ocid: String,
    #[serde(default)]
    pub load_balancer: LoadBalancerConfig,
    #[serde(default)]
    pub rate_limiter: RateLimiterConfig,
    #[serde(default)]
    pub metrics: Option<MetricsConfig>,
    #[serde(default)]
    pub use_instance_principals: bool,
    /// Free-form tags applied to every created resource, merged under the
    /// reserved cluster tags.
    #[serde(default)]
    pub freeform_tags: BTreeMap<String, String>,
    /// Defined-tag namespaces passed through unchanged.
    #[serde(default)]
    pub defined_tags: BTreeMap<String, BTreeMap<String, String>>,
}

impl CloudConfig {
    /// Load and parse the config file at `path`.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml(&raw)
    }

    /// Parse a config from its YAML text.
    pub fn from_yaml(raw: &str) -> Result<Self> {
        let cfg: CloudConfig = serde_yaml::from_str(raw)?;
        Ok(cfg)
    }

    /// Validate the parsed configuration, rejecting contradictory options.
    pub fn validate(&self) -> Result<()> {
        if self.auth.region.is_empty() {
            return Err(Error::InvalidConfiguration("auth.region is empty".into()));
        }
        if !self.use_instance_principals {
            if self.auth.tenancy.is_empty() {
                return Err(Error::InvalidConfiguration(
                    "auth.tenancy is required unless useInstancePrincipals is set".into(),
                ));
            }
            if self.auth.user.is_empty() || self.auth.fingerprint.is_empty() {
                return Err(Error::InvalidConfiguration(
                    "auth.user and auth.fingerprint are required unless useInstancePrincipals is set"
                        .into(),
                ));
            }
        }
        if self.compartment.is_empty() {
            return Err(Error::InvalidConfiguration("compartment is empty".into()));
        }
        if self.cluster_ocid.is_empty() {
            return Err(Error::InvalidConfiguration("clusterOcid is empty".into()));
        }
        if let (Some(s1), Some(s2)) = (
            self.load_balancer.subnet1.as_deref(),
            self.load_balancer.subnet2.as_deref(),
        ) {
            if s1 == s2 {
                return Err(Error::InvalidConfiguration(
                    "loadBalancer.subnet1 and loadBalancer.subnet2 must differ".into(),
                ));
            }
        }
        if self.rate_limiter.qps <= 0.0 || self.rate_limiter.bucket == 0 {
            return Err(Error::InvalidConfiguration(
                "rateLimiter.qps and rateLimiter.bucket must be positive".into(),
            ));
        }
        Ok(())
    }
}

// =============================================================================
// Path Resolution
// =============================================================================

/// Resolve the config file location from the environment.
///
/// Precedence follows the legacy deployment layouts: `CONFIG_YAML_FILENAME`,
/// then `OCI_CONFIG_FILE`, then `OCI_FLEXD_DRIVER_DIRECTORY/config.yaml`,
/// then the packaged default.
pub fn config_path_from_env() -> PathBuf {
    if let Ok(p) = std::env::var("CONFIG_YAML_FILENAME") {
        return PathBuf::from(p);
    }
    if let Ok(p) = std::env::var("OCI_CONFIG_FILE") {
        return PathBuf::from(p);
    }
    if let Ok(dir) = std::env::var("OCI_FLEXD_DRIVER_DIRECTORY") {
        return PathBuf::from(dir).join(CONFIG_FILE_NAME);
    }
    PathBuf::from(DEFAULT_CONFIG_PATH)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
auth:
  region: us-phoenix-1
  tenancy: ocid1.tenancy.oc1..aaaa
  user: ocid1.user.oc1..bbbb
  key: key.pem
  fingerprint: "aa:bb:cc"
vcn: ocid1.vcn.oc1..cccc
compartment: ocid1.compartment.oc1..dddd
clusterOcid: ocid1.cluster.oc1..eeee
loadBalancer:
  subnet1: ocid1.subnet.oc1..s1
  subnet2: ocid1.subnet.oc1..s2
  securityListManagementMode: Frontend
rateLimiter:
  qps: 8.0
  bucket: 16
metrics:
  namespace: oke
  compartmentId: ocid1.compartment.oc1..dddd
  resourceGroup: ccm
  prefix: oke_
"#;

    #[test]
    fn test_parse_full_config() {
        let cfg = CloudConfig::from_yaml(SAMPLE).unwrap();
        cfg.validate().unwrap();

        assert_eq!(cfg.auth.region, "us-phoenix-1");
        assert_eq!(cfg.load_balancer.subnet2.as_deref(), Some("ocid1.subnet.oc1..s2"));
        assert_eq!(
            cfg.load_balancer.management_mode(),
            SecurityListManagementMode::Frontend
        );
        assert_eq!(cfg.rate_limiter.qps, 8.0);
        assert_eq!(cfg.metrics.as_ref().unwrap().prefix, "oke_");
    }

    #[test]
    fn test_from_file_reads_yaml() {
        use std::io::Write;
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();
        let cfg = CloudConfig::from_file(file.path()).unwrap();
        assert_eq!(cfg.vcn, "ocid1.vcn.oc1..cccc");
    }

    #[test]
    fn test_validate_rejects_duplicate_subnets() {
        let mut cfg = CloudConfig::from_yaml(SAMPLE).unwrap();
        cfg.load_balancer.subnet2 = cfg.load_balancer.subnet1.clone();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_validate_instance_principals_skips_user_auth() {
        let mut cfg = CloudConfig::from_yaml(SAMPLE).unwrap();
        cfg.use_instance_principals = true;
        cfg.auth.tenancy.clear();
        cfg.auth.user.clear();
        cfg.auth.fingerprint.clear();
        cfg.validate().unwrap();
    }

    #[test]
    fn test_disable_switch_forces_none_mode() {
        let mut cfg = CloudConfig::from_yaml(SAMPLE).unwrap();
        cfg.load_balancer.disable_security_list_management = true;
        assert_eq!(
            cfg.load_balancer.management_mode(),
            SecurityListManagementMode::None
        );
    }

    #[test]
    fn test_metrics_section_optional() {
        let cfg = CloudConfig::from_yaml(
            r#"
auth:
  region: us-ashburn-1
  tenancy: t
  user: u
  fingerprint: f
vcn: v
compartment: c
clusterOcid: cl
"#,
        )
        .unwrap();
        assert!(cfg.metrics.is_none());
        cfg.validate().unwrap();
    }
}
