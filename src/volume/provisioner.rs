//! Claim-driven block-volume provisioning
//!
//! Turns volume claims into cloud block volumes: size validation against the
//! service floor, availability-domain placement, idempotent creation keyed on
//! the claim uid, reclaim-policy-aware deletion, and a periodic sweep that
//! deletes volumes this cluster created but never bound.

use crate::client::types::*;
use crate::client::{CallContext, CloudClient};
use crate::config::CloudConfig;
use crate::domain::{EventRecorderRef, ObjectSourceRef, PersistentVolume, ReclaimPolicy, VolumeClaim};
use crate::error::{Error, Result};
use crate::metrics::{dimensions, Metric, MetricSink};
use chrono::Utc;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Smallest volume the cloud sells, in MB
pub const MINIMUM_VOLUME_SIZE_MB: u64 = 50 * 1024;

/// Poll interval while a created volume settles
const VOLUME_POLL_BASE: Duration = Duration::from_secs(1);
const VOLUME_POLL_CAP: Duration = Duration::from_secs(10);

/// Orphan sweep cadence and minimum orphan age
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(600);
pub const ORPHAN_MIN_AGE: chrono::Duration = chrono::Duration::hours(1);

/// Storage-class parameter keys
pub const PARAM_PERFORMANCE_TIER: &str = "performanceTier";
pub const PARAM_KMS_KEY_ID: &str = "kmsKeyId";
pub const PARAM_FS_TYPE: &str = "fsType";

const DEFAULT_FS_TYPE: &str = "ext4";

/// Metric dimension naming this component
const COMPONENT: &str = "volume-provisioner";

// =============================================================================
// Sizing
// =============================================================================

/// Requested bytes rounded up to whole megabytes.
pub fn requested_size_mb(requested_bytes: u64) -> u64 {
    requested_bytes.div_ceil(MIB)
}

/// Apply the service floor. With rounding enabled an undersized request is
/// silently raised to the floor; otherwise it is a terminal error.
pub fn effective_size_mb(requested_mb: u64, minimum_mb: u64, rounding_enabled: bool) -> Result<u64> {
    if requested_mb >= minimum_mb {
        return Ok(requested_mb);
    }
    if rounding_enabled {
        Ok(minimum_mb)
    } else {
        Err(Error::InvalidSize {
            requested_mb,
            minimum_mb,
        })
    }
}

/// Idempotency token for one claim: stable across retries and restarts.
pub fn client_token(claim_uid: &str) -> String {
    let digest = Sha256::digest(claim_uid.as_bytes());
    format!("{:x}", digest)
}

// =============================================================================
// Provisioner
// =============================================================================

pub struct VolumeProvisioner {
    client: CloudClient,
    config: Arc<CloudConfig>,
    pv_source: ObjectSourceRef<PersistentVolume>,
    recorder: EventRecorderRef,
    metrics: MetricSink,
    rounding_enabled: bool,
    minimum_size_mb: u64,
}

impl VolumeProvisioner {
    pub fn new(
        client: CloudClient,
        config: Arc<CloudConfig>,
        pv_source: ObjectSourceRef<PersistentVolume>,
        recorder: EventRecorderRef,
        metrics: MetricSink,
        rounding_enabled: bool,
    ) -> Self {
        Self {
            client,
            config,
            pv_source,
            recorder,
            metrics,
            rounding_enabled,
            minimum_size_mb: MINIMUM_VOLUME_SIZE_MB,
        }
    }

    /// Override the provisioning floor, deployment-wide.
    pub fn with_minimum_size_mb(mut self, minimum_mb: u64) -> Self {
        self.minimum_size_mb = minimum_mb;
        self
    }

    /// Provision the volume for one claim and return the volume record to
    /// publish. Safe to call repeatedly for the same claim.
    pub async fn provision(
        &self,
        ctx: &CallContext,
        claim: &VolumeClaim,
    ) -> Result<PersistentVolume> {
        match self.provision_inner(ctx, claim).await {
            Ok(pv) => {
                self.metrics.emit(
                    Metric::PvProvisionSuccess,
                    dimensions(COMPONENT, &claim.qualified_name()),
                );
                Ok(pv)
            }
            Err(e) => {
                self.metrics.emit(
                    Metric::PvProvisionFailure,
                    dimensions(COMPONENT, &claim.qualified_name()),
                );
                Err(e)
            }
        }
    }

    async fn provision_inner(
        &self,
        ctx: &CallContext,
        claim: &VolumeClaim,
    ) -> Result<PersistentVolume> {
        let size_mb = effective_size_mb(
            requested_size_mb(claim.requested_bytes),
            self.minimum_size_mb,
            self.rounding_enabled,
        )?;
        let tier = match claim.parameters.get(PARAM_PERFORMANCE_TIER) {
            Some(raw) => PerformanceTier::parse(raw).ok_or_else(|| {
                Error::InvalidConfiguration(format!(
                    "claim {}: unknown performance tier {:?}",
                    claim.qualified_name(),
                    raw
                ))
            })?,
            None => PerformanceTier::default(),
        };
        let fs_type = claim
            .parameters
            .get(PARAM_FS_TYPE)
            .cloned()
            .unwrap_or_else(|| DEFAULT_FS_TYPE.to_string());

        let availability_domain = self.pick_availability_domain(ctx, claim).await?;

        let mut freeform_tags = self.config.freeform_tags.clone();
        freeform_tags.extend(cluster_tags(&self.config.cluster_ocid));
        let details = CreateVolumeDetails {
            display_name: claim.qualified_name(),
            compartment_id: self.config.compartment.clone(),
            availability_domain: availability_domain.clone(),
            size_mbs: size_mb,
            kms_key_id: claim.parameters.get(PARAM_KMS_KEY_ID).cloned(),
            vpus_per_gb: Some(tier.vpus_per_gb()),
            source_snapshot_id: None,
            freeform_tags,
            defined_tags: self.config.defined_tags.clone(),
        };

        let volume = self
            .client
            .create_volume(ctx, &details, &client_token(&claim.uid))
            .await?;
        let volume = self.await_available(ctx, volume).await?;
        info!(
            claim = %claim.qualified_name(),
            volume_id = %volume.id,
            availability_domain = %volume.availability_domain,
            size_mb = volume.size_mbs,
            "volume provisioned"
        );
        self.recorder.event(
            &claim.qualified_name(),
            "ProvisionedVolume",
            &format!("provisioned volume {}", volume.id),
        );

        Ok(PersistentVolume {
            name: format!("pv-{}", claim.uid),
            volume_id: volume.id,
            capacity_bytes: volume.size_mbs * MIB,
            failure_domain: volume.availability_domain,
            reclaim_policy: claim.reclaim_policy,
            fs_type,
            claim_uid: claim.uid.clone(),
        })
    }

    /// Release the cloud volume behind a deleted claim, honoring the reclaim
    /// policy. Absent and already-terminating volumes count as success.
    pub async fn delete(&self, ctx: &CallContext, pv: &PersistentVolume) -> Result<()> {
        match self.delete_inner(ctx, pv).await {
            Ok(()) => {
                self.metrics
                    .emit(Metric::PvDeleteSuccess, dimensions(COMPONENT, &pv.name));
                Ok(())
            }
            Err(e) => {
                self.metrics
                    .emit(Metric::PvDeleteFailure, dimensions(COMPONENT, &pv.name));
                Err(e)
            }
        }
    }

    async fn delete_inner(&self, ctx: &CallContext, pv: &PersistentVolume) -> Result<()> {
        if pv.reclaim_policy == ReclaimPolicy::Retain {
            self.recorder.event(
                &pv.name,
                "RetainedVolume",
                &format!("volume {} retained by reclaim policy", pv.volume_id),
            );
            return Ok(());
        }
        let volume = match self.client.get_volume(ctx, &pv.volume_id).await {
            Ok(v) => v,
            Err(Error::NotFound { .. }) => return Ok(()),
            Err(e) => return Err(e),
        };
        if !volume.owned_by_cluster(&self.config.cluster_ocid) {
            return Err(Error::Forbidden {
                message: format!(
                    "volume {} is not tagged for cluster {}",
                    volume.id, self.config.cluster_ocid
                ),
                request_id: None,
            });
        }
        match volume.lifecycle_state {
            VolumeState::Terminating | VolumeState::Terminated => return Ok(()),
            _ => {}
        }
        match self.client.delete_volume(ctx, &volume.id).await {
            Ok(()) | Err(Error::NotFound { .. }) => {}
            Err(e) => return Err(e),
        }
        info!(volume_id = %volume.id, "volume deleted");
        Ok(())
    }

    // =========================================================================
    // Placement
    // =========================================================================

    /// Choose the availability domain: the topology-permitted domain with the
    /// fewest cluster-owned volumes, ties broken lexicographically.
    async fn pick_availability_domain(
        &self,
        ctx: &CallContext,
        claim: &VolumeClaim,
    ) -> Result<String> {
        let all = self
            .client
            .list_availability_domains(ctx, &self.config.compartment)
            .await?;
        let mut candidates: Vec<String> = all
            .into_iter()
            .map(|ad| ad.name)
            .filter(|name| claim.requested_zones.is_empty() || claim.requested_zones.contains(name))
            .collect();
        if candidates.is_empty() {
            return Err(Error::InvalidConfiguration(format!(
                "claim {}: no availability domain satisfies zones {:?}",
                claim.qualified_name(),
                claim.requested_zones
            )));
        }
        candidates.sort();

        let volumes = self
            .client
            .list_volumes(ctx, &self.config.compartment)
            .await?;
        let mut counts: BTreeMap<&str, usize> =
            candidates.iter().map(|c| (c.as_str(), 0)).collect();
        for v in &volumes {
            if v.owned_by_cluster(&self.config.cluster_ocid) {
                if let Some(count) = counts.get_mut(v.availability_domain.as_str()) {
                    *count += 1;
                }
            }
        }
        let chosen = candidates
            .iter()
            .min_by_key(|c| counts[c.as_str()])
            .cloned()
            .unwrap_or_else(|| candidates[0].clone());
        debug!(claim = %claim.qualified_name(), availability_domain = %chosen, "placement chosen");
        Ok(chosen)
    }

    async fn await_available(&self, ctx: &CallContext, mut volume: Volume) -> Result<Volume> {
        let mut delay = VOLUME_POLL_BASE;
        loop {
            match volume.lifecycle_state {
                VolumeState::Available => return Ok(volume),
                VolumeState::Faulty => {
                    return Err(Error::Fatal(format!("volume {} is faulty", volume.id)))
                }
                VolumeState::Terminating | VolumeState::Terminated => {
                    return Err(Error::try_again(format!(
                        "volume {} terminated while provisioning",
                        volume.id
                    )))
                }
                VolumeState::Provisioning | VolumeState::Restoring => {
                    if ctx.expired() {
                        return Err(Error::try_again(format!(
                            "volume {} still provisioning at deadline",
                            volume.id
                        )));
                    }
                    tokio::time::sleep(delay.min(ctx.remaining())).await;
                    delay = (delay * 2).min(VOLUME_POLL_CAP);
                    volume = self.client.get_volume(ctx, &volume.id).await?;
                }
            }
        }
    }

    // =========================================================================
    // Orphan Sweep
    // =========================================================================

    /// Delete cluster-owned AVAILABLE volumes at least an hour old that no
    /// published volume references. Returns the number deleted.
    pub async fn sweep_orphans(&self, ctx: &CallContext) -> Result<usize> {
        let referenced: HashSet<String> = self
            .pv_source
            .list()
            .await?
            .into_iter()
            .map(|pv| pv.volume_id)
            .collect();
        let volumes = self
            .client
            .list_volumes(ctx, &self.config.compartment)
            .await?;
        let cutoff = Utc::now() - ORPHAN_MIN_AGE;

        let mut deleted = 0;
        for volume in volumes {
            if !volume.owned_by_cluster(&self.config.cluster_ocid)
                || volume.lifecycle_state != VolumeState::Available
                || volume.time_created > cutoff
                || referenced.contains(&volume.id)
            {
                continue;
            }
            warn!(
                volume_id = %volume.id,
                created = %volume.time_created,
                "deleting orphaned volume"
            );
            match self.client.delete_volume(ctx, &volume.id).await {
                Ok(()) => deleted += 1,
                Err(Error::NotFound { .. }) => {}
                Err(e) => {
                    warn!(volume_id = %volume.id, error = %e, "orphan delete failed");
                }
            }
        }
        Ok(deleted)
    }

    /// Run the orphan sweep on its cadence until cancelled.
    pub async fn run_sweeper(self: Arc<Self>, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(SWEEP_INTERVAL) => {}
            }
            let ctx = CallContext::new(Duration::from_secs(300), cancel.clone());
            match self.sweep_orphans(&ctx).await {
                Ok(0) => {}
                Ok(n) => info!(deleted = n, "orphan sweep complete"),
                Err(e) => warn!(error = %e, "orphan sweep failed"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::fake::FakeCloud;
    use crate::config::RateLimiterConfig;
    use crate::domain::ObjectSource;
    use assert_matches::assert_matches;
    use async_trait::async_trait;
    use parking_lot::Mutex;

    struct StaticPvs(Mutex<Vec<PersistentVolume>>);

    #[async_trait]
    impl ObjectSource<PersistentVolume> for StaticPvs {
        async fn get(&self, key: &str) -> Result<Option<PersistentVolume>> {
            Ok(self.0.lock().iter().find(|pv| pv.name == key).cloned())
        }

        async fn list(&self) -> Result<Vec<PersistentVolume>> {
            Ok(self.0.lock().clone())
        }
    }

    struct NullRecorder;

    impl crate::domain::EventRecorder for NullRecorder {
        fn event(&self, _object: &str, _reason: &str, _message: &str) {}
    }

    fn cloud_config() -> CloudConfig {
        CloudConfig::from_yaml(
            r#"
auth:
  region: us-phoenix-1
  tenancy: t
  user: u
  fingerprint: f
vcn: ocid1.vcn.oc1..v
compartment: ocid1.compartment.oc1..c
clusterOcid: ocid1.cluster.oc1..cl
"#,
        )
        .unwrap()
    }

    struct Fixture {
        fake: Arc<FakeCloud>,
        pvs: Arc<StaticPvs>,
        provisioner: VolumeProvisioner,
    }

    fn fixture(rounding_enabled: bool) -> Fixture {
        let fake = Arc::new(FakeCloud::new("ocid1.compartment.oc1..c"));
        let pvs = Arc::new(StaticPvs(Mutex::new(vec![])));
        let client = CloudClient::new(fake.clone(), "us-phoenix-1", RateLimiterConfig::default());
        let provisioner = VolumeProvisioner::new(
            client,
            Arc::new(cloud_config()),
            pvs.clone(),
            Arc::new(NullRecorder),
            MetricSink::disabled(),
            rounding_enabled,
        );
        Fixture {
            fake,
            pvs,
            provisioner,
        }
    }

    fn claim(uid: &str, bytes: u64) -> VolumeClaim {
        VolumeClaim {
            uid: uid.into(),
            name: format!("data-{}", uid),
            namespace: "prod".into(),
            requested_bytes: bytes,
            parameters: BTreeMap::new(),
            requested_zones: vec![],
            reclaim_policy: ReclaimPolicy::Delete,
        }
    }

    #[test]
    fn test_size_floor() {
        assert_eq!(
            effective_size_mb(60 * 1024, MINIMUM_VOLUME_SIZE_MB, false).unwrap(),
            60 * 1024
        );
        // Exactly at the floor: no rounding in either mode.
        assert_eq!(
            effective_size_mb(MINIMUM_VOLUME_SIZE_MB, MINIMUM_VOLUME_SIZE_MB, false).unwrap(),
            MINIMUM_VOLUME_SIZE_MB
        );
        assert_eq!(
            effective_size_mb(10 * 1024, MINIMUM_VOLUME_SIZE_MB, true).unwrap(),
            MINIMUM_VOLUME_SIZE_MB
        );
        assert_matches!(
            effective_size_mb(10 * 1024, MINIMUM_VOLUME_SIZE_MB, false),
            Err(Error::InvalidSize {
                requested_mb: 10240,
                minimum_mb: MINIMUM_VOLUME_SIZE_MB,
            })
        );
    }

    #[test]
    fn test_size_floor_is_configurable() {
        assert_eq!(effective_size_mb(30 * 1024, 20 * 1024, false).unwrap(), 30 * 1024);
        assert_eq!(effective_size_mb(10 * 1024, 20 * 1024, true).unwrap(), 20 * 1024);
        assert_matches!(
            effective_size_mb(10 * 1024, 20 * 1024, false),
            Err(Error::InvalidSize { minimum_mb: 20480, .. })
        );
    }

    #[test]
    fn test_requested_size_rounds_up_to_mb() {
        assert_eq!(requested_size_mb(MIB), 1);
        assert_eq!(requested_size_mb(MIB + 1), 2);
        assert_eq!(requested_size_mb(50 * GIB), 50 * 1024);
    }

    #[test]
    fn test_client_token_is_stable() {
        assert_eq!(client_token("uid-1"), client_token("uid-1"));
        assert_ne!(client_token("uid-1"), client_token("uid-2"));
    }

    #[tokio::test]
    async fn test_provision_creates_tagged_volume() {
        let fx = fixture(true);
        let ctx = CallContext::background();

        let pv = fx
            .provisioner
            .provision(&ctx, &claim("uid-1", 60 * GIB))
            .await
            .unwrap();
        assert_eq!(pv.capacity_bytes, 60 * GIB);
        assert_eq!(pv.fs_type, "ext4");

        let state = fx.fake.get_volume_state(&pv.volume_id).unwrap();
        assert_eq!(state, VolumeState::Available);
    }

    #[tokio::test]
    async fn test_provision_is_idempotent_per_claim() {
        let fx = fixture(true);
        let ctx = CallContext::background();
        let c = claim("uid-1", 60 * GIB);

        let first = fx.provisioner.provision(&ctx, &c).await.unwrap();
        let second = fx.provisioner.provision(&ctx, &c).await.unwrap();
        assert_eq!(first.volume_id, second.volume_id);
        assert_eq!(fx.fake.volume_count(), 1);
    }

    #[tokio::test]
    async fn test_undersized_claim_rejected_without_rounding() {
        let fx = fixture(false);
        let ctx = CallContext::background();
        assert_matches!(
            fx.provisioner.provision(&ctx, &claim("uid-1", GIB)).await,
            Err(Error::InvalidSize { .. })
        );
        assert_eq!(fx.fake.volume_count(), 0);
    }

    #[tokio::test]
    async fn test_custom_floor_applies_to_claims() {
        let mut fx = fixture(false);
        fx.provisioner = fx.provisioner.with_minimum_size_mb(20 * 1024);
        let ctx = CallContext::background();

        let pv = fx
            .provisioner
            .provision(&ctx, &claim("uid-1", 30 * GIB))
            .await
            .unwrap();
        assert_eq!(pv.capacity_bytes, 30 * GIB);

        assert_matches!(
            fx.provisioner.provision(&ctx, &claim("uid-2", 10 * GIB)).await,
            Err(Error::InvalidSize { minimum_mb: 20480, .. })
        );
    }

    #[tokio::test]
    async fn test_placement_spreads_across_domains() {
        let fx = fixture(true);
        let ctx = CallContext::background();
        // AD-1 already carries a cluster volume; AD-2 is empty.
        fx.fake.seed_volume(
            "existing",
            "AD-1",
            51_200,
            cluster_tags("ocid1.cluster.oc1..cl"),
        );

        let pv = fx
            .provisioner
            .provision(&ctx, &claim("uid-1", 60 * GIB))
            .await
            .unwrap();
        assert_eq!(pv.failure_domain, "AD-2");
    }

    #[tokio::test]
    async fn test_placement_honors_requested_zones() {
        let fx = fixture(true);
        let ctx = CallContext::background();
        let mut c = claim("uid-1", 60 * GIB);
        c.requested_zones = vec!["AD-1".into()];

        let pv = fx.provisioner.provision(&ctx, &c).await.unwrap();
        assert_eq!(pv.failure_domain, "AD-1");

        c.requested_zones = vec!["AD-9".into()];
        c.uid = "uid-2".into();
        assert_matches!(
            fx.provisioner.provision(&ctx, &c).await,
            Err(Error::InvalidConfiguration(_))
        );
    }

    #[tokio::test]
    async fn test_delete_honors_retain_policy() {
        let fx = fixture(true);
        let ctx = CallContext::background();
        let mut c = claim("uid-1", 60 * GIB);
        c.reclaim_policy = ReclaimPolicy::Retain;
        let pv = fx.provisioner.provision(&ctx, &c).await.unwrap();

        fx.provisioner.delete(&ctx, &pv).await.unwrap();
        assert_eq!(
            fx.fake.get_volume_state(&pv.volume_id),
            Some(VolumeState::Available)
        );
    }

    #[tokio::test]
    async fn test_delete_terminates_and_tolerates_absent() {
        let fx = fixture(true);
        let ctx = CallContext::background();
        let pv = fx
            .provisioner
            .provision(&ctx, &claim("uid-1", 60 * GIB))
            .await
            .unwrap();

        fx.provisioner.delete(&ctx, &pv).await.unwrap();
        assert_eq!(
            fx.fake.get_volume_state(&pv.volume_id),
            Some(VolumeState::Terminated)
        );
        // Second delete sees a terminated volume and succeeds quietly.
        fx.provisioner.delete(&ctx, &pv).await.unwrap();
    }

    #[tokio::test]
    async fn test_delete_refuses_foreign_volume() {
        let fx = fixture(true);
        let ctx = CallContext::background();
        let foreign = fx.fake.seed_volume(
            "foreign",
            "AD-1",
            51_200,
            cluster_tags("ocid1.cluster.oc1..other"),
        );
        let pv = PersistentVolume {
            name: "pv-x".into(),
            volume_id: foreign.clone(),
            capacity_bytes: 50 * GIB,
            failure_domain: "AD-1".into(),
            reclaim_policy: ReclaimPolicy::Delete,
            fs_type: "ext4".into(),
            claim_uid: "uid-x".into(),
        };

        assert_matches!(
            fx.provisioner.delete(&ctx, &pv).await,
            Err(Error::Forbidden { .. })
        );
        assert_eq!(
            fx.fake.get_volume_state(&foreign),
            Some(VolumeState::Available)
        );
    }

    #[tokio::test]
    async fn test_orphan_sweep_scope() {
        let fx = fixture(true);
        let ctx = CallContext::background();
        let old = Utc::now() - chrono::Duration::hours(2);

        // Orphan: cluster-tagged, old, unreferenced.
        let orphan = fx.fake.seed_volume(
            "orphan",
            "AD-1",
            51_200,
            cluster_tags("ocid1.cluster.oc1..cl"),
        );
        fx.fake.set_volume_created_at(&orphan, old);

        // Referenced by a published volume.
        let bound = fx.fake.seed_volume(
            "bound",
            "AD-1",
            51_200,
            cluster_tags("ocid1.cluster.oc1..cl"),
        );
        fx.fake.set_volume_created_at(&bound, old);
        fx.pvs.0.lock().push(PersistentVolume {
            name: "pv-bound".into(),
            volume_id: bound.clone(),
            capacity_bytes: 50 * GIB,
            failure_domain: "AD-1".into(),
            reclaim_policy: ReclaimPolicy::Delete,
            fs_type: "ext4".into(),
            claim_uid: "uid-b".into(),
        });

        // Too young to sweep.
        let young = fx.fake.seed_volume(
            "young",
            "AD-1",
            51_200,
            cluster_tags("ocid1.cluster.oc1..cl"),
        );

        // Another cluster's volume, old and unreferenced.
        let foreign = fx.fake.seed_volume(
            "foreign",
            "AD-1",
            51_200,
            cluster_tags("ocid1.cluster.oc1..other"),
        );
        fx.fake.set_volume_created_at(&foreign, old);

        let deleted = fx.provisioner.sweep_orphans(&ctx).await.unwrap();
        assert_eq!(deleted, 1);
        assert_eq!(fx.fake.get_volume_state(&orphan), Some(VolumeState::Terminated));
        assert_eq!(fx.fake.get_volume_state(&bound), Some(VolumeState::Available));
        assert_eq!(fx.fake.get_volume_state(&young), Some(VolumeState::Available));
        assert_eq!(fx.fake.get_volume_state(&foreign), Some(VolumeState::Available));
    }
}
