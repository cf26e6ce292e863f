//! Load-balancer reconciliation
//!
//! Converges one cloud load balancer per LoadBalancer-type service: derive
//! the desired shape from the service and node snapshots, create or adopt the
//! balancer, apply the ordered mutation plan one work request at a time, then
//! converge the subnet security lists. All mutations are gated on cluster
//! ownership and on the balancer accepting writes.

pub mod diff;
pub mod security_lists;
pub mod spec;

use crate::client::types::*;
use crate::client::{CallContext, CloudClient};
use crate::config::CloudConfig;
use crate::domain::{EventRecorderRef, NodeSpec, ObjectSourceRef, ServiceSpec};
use crate::error::{Error, Result};
use crate::metrics::{dimensions, Metric, MetricSink};
use async_trait::async_trait;
use diff::LbAction;
use security_lists::SecurityListManager;
use spec::{load_balancer_name, DesiredLoadBalancer, LbServiceConfig};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Initial lifecycle poll interval while a balancer is transitional
const LIFECYCLE_POLL_BASE: Duration = Duration::from_secs(3);
/// Lifecycle poll ceiling
const LIFECYCLE_POLL_CAP: Duration = Duration::from_secs(30);

/// Metric dimension naming this component
const COMPONENT: &str = "lb-reconciler";

/// Resolves the annotated tls-secret reference into an uploadable bundle.
#[async_trait]
pub trait CertificateSource: Send + Sync {
    /// `secret` is the `name` or `namespace/name` the service annotated;
    /// `svc_uid` scopes the generated certificate name to the service.
    async fn resolve(
        &self,
        namespace: &str,
        secret: &str,
        svc_uid: &str,
    ) -> Result<Option<Certificate>>;
}

pub type CertificateSourceRef = Arc<dyn CertificateSource>;

// =============================================================================
// Reconciler
// =============================================================================

pub struct LbReconciler {
    client: CloudClient,
    config: Arc<CloudConfig>,
    node_source: ObjectSourceRef<NodeSpec>,
    certificates: CertificateSourceRef,
    recorder: EventRecorderRef,
    metrics: MetricSink,
}

impl LbReconciler {
    pub fn new(
        client: CloudClient,
        config: Arc<CloudConfig>,
        node_source: ObjectSourceRef<NodeSpec>,
        certificates: CertificateSourceRef,
        recorder: EventRecorderRef,
        metrics: MetricSink,
    ) -> Self {
        Self {
            client,
            config,
            node_source,
            certificates,
            recorder,
            metrics,
        }
    }

    /// Converge the balancer for `svc` and return its ingress addresses.
    pub async fn ensure(&self, ctx: &CallContext, svc: &ServiceSpec) -> Result<Vec<IpAddress>> {
        let existed = self
            .client
            .get_load_balancer_by_name(ctx, &self.config.compartment, &load_balancer_name(svc))
            .await?
            .is_some();
        let (success, failure) = if existed {
            (Metric::LbUpdateSuccess, Metric::LbUpdateFailure)
        } else {
            (Metric::LbProvisionSuccess, Metric::LbProvisionFailure)
        };

        match self.ensure_inner(ctx, svc).await {
            Ok(ips) => {
                self.metrics
                    .emit(success, dimensions(COMPONENT, &svc.qualified_name()));
                Ok(ips)
            }
            Err(e) => {
                self.metrics
                    .emit(failure, dimensions(COMPONENT, &svc.qualified_name()));
                Err(e)
            }
        }
    }

    async fn ensure_inner(&self, ctx: &CallContext, svc: &ServiceSpec) -> Result<Vec<IpAddress>> {
        let cfg = LbServiceConfig::parse(svc, &self.config)?;
        let nodes = self.node_source.list().await?;

        let tls_certificate = match &cfg.tls_secret {
            Some(secret) => {
                self.certificates
                    .resolve(&svc.namespace, secret, &svc.uid)
                    .await?
            }
            None => None,
        };
        let mut desired = spec::build_desired(svc, &nodes, &cfg, &self.config, tls_certificate)?;
        self.resolve_subnet_placement(ctx, svc, &mut desired).await?;

        let lb = match self.find_owned(ctx, &desired.name).await? {
            Some(lb) => self.await_writable(ctx, svc, lb).await?,
            None => self.provision(ctx, svc, &desired).await?,
        };

        let actions = diff::plan(&desired, &lb);
        if !actions.is_empty() {
            info!(
                service = %svc.qualified_name(),
                lb_id = %lb.id,
                actions = actions.len(),
                "applying load balancer plan"
            );
            for action in &actions {
                self.apply(ctx, &lb.id, action).await?;
            }
            self.recorder.event(
                &svc.qualified_name(),
                "EnsuredLoadBalancer",
                &format!("applied {} change(s) to {}", actions.len(), lb.display_name),
            );
        }

        self.reconcile_security_lists(ctx, svc, &cfg, &desired, &nodes)
            .await?;

        let lb = self.client.get_load_balancer(ctx, &lb.id).await?;
        Ok(lb.ip_addresses)
    }

    /// Current addresses without mutating anything.
    pub async fn get_status(
        &self,
        ctx: &CallContext,
        svc: &ServiceSpec,
    ) -> Result<Option<Vec<IpAddress>>> {
        let lb = self
            .client
            .get_load_balancer_by_name(ctx, &self.config.compartment, &load_balancer_name(svc))
            .await?;
        Ok(lb.map(|lb| lb.ip_addresses))
    }

    /// Tear down the balancer and the rules authored for the service.
    pub async fn ensure_deleted(&self, ctx: &CallContext, svc: &ServiceSpec) -> Result<()> {
        match self.ensure_deleted_inner(ctx, svc).await {
            Ok(()) => {
                self.metrics.emit(
                    Metric::LbDeleteSuccess,
                    dimensions(COMPONENT, &svc.qualified_name()),
                );
                Ok(())
            }
            Err(e) => {
                self.metrics.emit(
                    Metric::LbDeleteFailure,
                    dimensions(COMPONENT, &svc.qualified_name()),
                );
                Err(e)
            }
        }
    }

    async fn ensure_deleted_inner(&self, ctx: &CallContext, svc: &ServiceSpec) -> Result<()> {
        let cfg = LbServiceConfig::parse(svc, &self.config)?;
        let Some(lb) = self.find_owned(ctx, &load_balancer_name(svc)).await? else {
            debug!(service = %svc.qualified_name(), "load balancer already absent");
            return Ok(());
        };

        // Listeners first so nothing forwards to a vanishing backend set.
        for name in lb.listeners.keys() {
            self.tolerate_not_found(
                self.apply(ctx, &lb.id, &LbAction::DeleteListener { name: name.clone() })
                    .await,
            )?;
        }
        for name in lb.backend_sets.keys() {
            self.tolerate_not_found(
                self.apply(
                    ctx,
                    &lb.id,
                    &LbAction::DeleteBackendSet { name: name.clone() },
                )
                .await,
            )?;
        }
        match self.client.delete_load_balancer(ctx, &lb.id).await {
            Ok(wr) => {
                self.client.await_work_request(ctx, &wr).await?;
            }
            Err(Error::NotFound { .. }) => {}
            Err(e) => return Err(e),
        }

        let manager = SecurityListManager::new(self.client.clone(), cfg.management_mode);
        let mut subnet_ids: BTreeSet<String> = lb.subnet_ids.iter().cloned().collect();
        for node in self.node_source.list().await? {
            subnet_ids.insert(node.subnet_id);
        }
        let subnet_ids: Vec<String> = subnet_ids.into_iter().collect();
        manager.cleanup(ctx, svc, &subnet_ids).await?;

        self.recorder.event(
            &svc.qualified_name(),
            "DeletedLoadBalancer",
            &format!("deleted load balancer {}", lb.display_name),
        );
        info!(service = %svc.qualified_name(), lb_id = %lb.id, "load balancer deleted");
        Ok(())
    }

    // =========================================================================
    // Internals
    // =========================================================================

    /// Look up the balancer by name and enforce the cluster ownership gate.
    async fn find_owned(&self, ctx: &CallContext, name: &str) -> Result<Option<LoadBalancer>> {
        let Some(lb) = self
            .client
            .get_load_balancer_by_name(ctx, &self.config.compartment, name)
            .await?
        else {
            return Ok(None);
        };
        if !lb.owned_by_cluster(&self.config.cluster_ocid) {
            return Err(Error::Forbidden {
                message: format!(
                    "load balancer {} ({}) is not tagged for cluster {}",
                    lb.display_name, lb.id, self.config.cluster_ocid
                ),
                request_id: None,
            });
        }
        Ok(Some(lb))
    }

    /// Public balancers span two subnets in distinct failure domains.
    ///
    /// Subnets are ordered by (availability domain, OCID) so the attachment
    /// order is stable across reconciles; regional subnets span every domain
    /// and never conflict.
    async fn resolve_subnet_placement(
        &self,
        ctx: &CallContext,
        svc: &ServiceSpec,
        desired: &mut DesiredLoadBalancer,
    ) -> Result<()> {
        if desired.subnet_ids.len() < 2 {
            return Ok(());
        }
        let mut placed = Vec::with_capacity(desired.subnet_ids.len());
        for id in &desired.subnet_ids {
            let subnet = self.client.get_subnet(ctx, id).await?;
            placed.push((subnet.availability_domain, subnet.id));
        }
        let mut domains = BTreeSet::new();
        for (domain, _) in &placed {
            if let Some(domain) = domain {
                if !domains.insert(domain.clone()) {
                    return Err(Error::InvalidConfiguration(format!(
                        "service {}: load balancer subnets are both in failure domain {}; \
                         two distinct domains are required",
                        svc.qualified_name(),
                        domain
                    )));
                }
            }
        }
        placed.sort();
        desired.subnet_ids = placed.into_iter().map(|(_, id)| id).collect();
        Ok(())
    }

    async fn provision(
        &self,
        ctx: &CallContext,
        svc: &ServiceSpec,
        desired: &DesiredLoadBalancer,
    ) -> Result<LoadBalancer> {
        info!(service = %svc.qualified_name(), name = %desired.name, "creating load balancer");
        let wr = self
            .client
            .create_load_balancer(ctx, &desired.create_details(&self.config.compartment))
            .await?;
        self.client.await_work_request(ctx, &wr).await?;

        let lb = self
            .find_owned(ctx, &desired.name)
            .await?
            .ok_or_else(|| Error::try_again(format!("created {} not yet visible", desired.name)))?;
        self.recorder.event(
            &svc.qualified_name(),
            "CreatedLoadBalancer",
            &format!("created load balancer {}", lb.display_name),
        );
        self.await_writable(ctx, svc, lb).await
    }

    /// Wait out transitional lifecycle states; a Failed balancer is deleted
    /// so the next pass recreates it from scratch.
    async fn await_writable(
        &self,
        ctx: &CallContext,
        svc: &ServiceSpec,
        mut lb: LoadBalancer,
    ) -> Result<LoadBalancer> {
        let mut delay = LIFECYCLE_POLL_BASE;
        loop {
            match lb.lifecycle_state {
                LbLifecycleState::Active => return Ok(lb),
                LbLifecycleState::Failed => {
                    warn!(
                        service = %svc.qualified_name(),
                        lb_id = %lb.id,
                        "load balancer is in Failed state, deleting for recreation"
                    );
                    match self.client.delete_load_balancer(ctx, &lb.id).await {
                        Ok(wr) => {
                            self.client.await_work_request(ctx, &wr).await?;
                        }
                        Err(Error::NotFound { .. }) => {}
                        Err(e) => return Err(e),
                    }
                    return Err(Error::try_again(format!(
                        "failed load balancer {} deleted; recreating on next pass",
                        lb.display_name
                    )));
                }
                LbLifecycleState::Deleting | LbLifecycleState::Deleted => {
                    return Err(Error::try_again(format!(
                        "load balancer {} is being deleted",
                        lb.display_name
                    )))
                }
                LbLifecycleState::Creating | LbLifecycleState::Updating => {
                    if ctx.expired() {
                        return Err(Error::try_again(format!(
                            "load balancer {} still {:?} at deadline",
                            lb.display_name, lb.lifecycle_state
                        )));
                    }
                    tokio::time::sleep(delay.min(ctx.remaining())).await;
                    delay = (delay * 2).min(LIFECYCLE_POLL_CAP);
                    lb = self.client.get_load_balancer(ctx, &lb.id).await?;
                }
            }
        }
    }

    /// Apply one planned mutation and drive its work request to completion.
    async fn apply(&self, ctx: &CallContext, lb_id: &str, action: &LbAction) -> Result<()> {
        debug!(lb_id, action = %action.describe(), "applying");
        let wr = match action {
            LbAction::EnsureCertificate(cert) => {
                self.client.create_certificate(ctx, lb_id, cert).await?
            }
            LbAction::CreateBackendSet { name, spec } => {
                self.client.create_backend_set(ctx, lb_id, name, spec).await?
            }
            LbAction::CreateListener { name, spec } => {
                self.client.create_listener(ctx, lb_id, name, spec).await?
            }
            LbAction::UpdateListener { name, spec } => {
                self.client.update_listener(ctx, lb_id, name, spec).await?
            }
            LbAction::UpdateBackendSet { name, spec } => {
                self.client.update_backend_set(ctx, lb_id, name, spec).await?
            }
            LbAction::DeleteListener { name } => {
                self.client.delete_listener(ctx, lb_id, name).await?
            }
            LbAction::DeleteBackendSet { name } => {
                self.client.delete_backend_set(ctx, lb_id, name).await?
            }
            LbAction::DeleteCertificate { name } => {
                self.client.delete_certificate(ctx, lb_id, name).await?
            }
        };
        self.client.await_work_request(ctx, &wr).await?;
        Ok(())
    }

    async fn reconcile_security_lists(
        &self,
        ctx: &CallContext,
        svc: &ServiceSpec,
        cfg: &LbServiceConfig,
        desired: &DesiredLoadBalancer,
        nodes: &[NodeSpec],
    ) -> Result<()> {
        let manager = SecurityListManager::new(self.client.clone(), cfg.management_mode);
        let node_subnets: Vec<String> = nodes
            .iter()
            .filter(|n| n.is_backend_candidate())
            .map(|n| n.subnet_id.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let health_check_port = desired
            .backend_sets
            .values()
            .next()
            .map(|b| b.health_check.port)
            .unwrap_or_else(|| HealthCheck::default().port);
        manager
            .reconcile(ctx, svc, &desired.subnet_ids, &node_subnets, health_check_port)
            .await
    }

    fn tolerate_not_found(&self, result: Result<()>) -> Result<()> {
        match result {
            Err(Error::NotFound { .. }) => Ok(()),
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::api::LoadBalancerApi;
    use crate::client::fake::FakeCloud;
    use crate::config::RateLimiterConfig;
    use crate::domain::{ObjectSource, Protocol, ServicePort, SessionAffinity, TrafficPolicy};
    use assert_matches::assert_matches;
    use parking_lot::Mutex;
    use std::collections::BTreeMap;

    struct StaticNodes(Mutex<Vec<NodeSpec>>);

    #[async_trait]
    impl ObjectSource<NodeSpec> for StaticNodes {
        async fn get(&self, key: &str) -> Result<Option<NodeSpec>> {
            Ok(self.0.lock().iter().find(|n| n.name == key).cloned())
        }

        async fn list(&self) -> Result<Vec<NodeSpec>> {
            Ok(self.0.lock().clone())
        }
    }

    struct NullRecorder;

    impl crate::domain::EventRecorder for NullRecorder {
        fn event(&self, _object: &str, _reason: &str, _message: &str) {}
    }

    struct NoCertificates;

    #[async_trait]
    impl CertificateSource for NoCertificates {
        async fn resolve(
            &self,
            _namespace: &str,
            _secret: &str,
            _svc_uid: &str,
        ) -> Result<Option<Certificate>> {
            Ok(None)
        }
    }

    struct Fixture {
        fake: Arc<FakeCloud>,
        reconciler: LbReconciler,
        nodes: Arc<StaticNodes>,
        svc: ServiceSpec,
    }

    fn fixture() -> Fixture {
        fixture_with_domains("AD-2")
    }

    fn fixture_with_domains(subnet2_domain: &str) -> Fixture {
        let fake = Arc::new(FakeCloud::new("ocid1.compartment.oc1..c"));
        let s1 = fake.seed_subnet(Some("AD-1"), "10.0.1.0/24");
        fake.seed_security_list(&s1);
        let s2 = fake.seed_subnet(Some(subnet2_domain), "10.0.2.0/24");
        fake.seed_security_list(&s2);
        let node_subnet = fake.seed_subnet(Some("AD-1"), "10.0.10.0/24");
        fake.seed_security_list(&node_subnet);

        let config: CloudConfig = CloudConfig::from_yaml(&format!(
            r#"
auth:
  region: us-phoenix-1
  tenancy: t
  user: u
  fingerprint: f
vcn: ocid1.vcn.oc1..v
compartment: ocid1.compartment.oc1..c
clusterOcid: ocid1.cluster.oc1..cl
loadBalancer:
  subnet1: {}
  subnet2: {}
"#,
            s1, s2
        ))
        .unwrap();

        let nodes = Arc::new(StaticNodes(Mutex::new(vec![NodeSpec {
            id: "ocid1.instance.oc1..n1".into(),
            name: "node-1".into(),
            addresses: vec!["10.0.10.1".into()],
            failure_domain: "AD-1".into(),
            subnet_id: node_subnet,
            ready: true,
            unschedulable: false,
            taints: vec![],
        }])));

        let client = CloudClient::new(fake.clone(), "us-phoenix-1", RateLimiterConfig::default());
        let reconciler = LbReconciler::new(
            client,
            Arc::new(config),
            nodes.clone(),
            Arc::new(NoCertificates),
            Arc::new(NullRecorder),
            MetricSink::disabled(),
        );

        let svc = ServiceSpec {
            uid: "uid-1".into(),
            name: "web".into(),
            namespace: "prod".into(),
            ports: vec![ServicePort {
                name: "http".into(),
                protocol: Protocol::Tcp,
                external_port: 80,
                node_port: 30080,
                target_port: 8080,
            }],
            session_affinity: SessionAffinity::None,
            source_cidrs: vec![],
            annotations: BTreeMap::new(),
            external_traffic_policy: TrafficPolicy::Cluster,
            health_check_node_port: None,
        };

        Fixture {
            fake,
            reconciler,
            nodes,
            svc,
        }
    }

    #[tokio::test]
    async fn test_ensure_creates_balancer_with_full_shape() {
        let fx = fixture();
        let ctx = CallContext::background();

        let ips = fx.reconciler.ensure(&ctx, &fx.svc).await.unwrap();
        assert_eq!(ips.len(), 1);
        assert!(ips[0].is_public);

        let lb = fx.fake.lb_by_name("prod/web/uid-1").unwrap();
        assert!(lb.owned_by_cluster("ocid1.cluster.oc1..cl"));
        assert!(lb.listeners.contains_key("TCP-80"));
        let set = &lb.backend_sets["TCP-80"];
        assert_eq!(set.backends.len(), 1);
        assert_eq!(set.backends[0].ip_address, "10.0.10.1");
    }

    #[tokio::test]
    async fn test_subnets_sharing_a_failure_domain_rejected() {
        let fx = fixture_with_domains("AD-1");
        let ctx = CallContext::background();

        let err = fx.reconciler.ensure(&ctx, &fx.svc).await.unwrap_err();
        assert_matches!(err, Error::InvalidConfiguration(_));
        // Nothing was created.
        assert!(fx.fake.lb_by_name("prod/web/uid-1").is_none());
    }

    #[tokio::test]
    async fn test_second_ensure_is_quiescent() {
        let fx = fixture();
        let ctx = CallContext::background();
        fx.reconciler.ensure(&ctx, &fx.svc).await.unwrap();

        fx.fake.clear_call_log();
        fx.reconciler.ensure(&ctx, &fx.svc).await.unwrap();
        assert_eq!(fx.fake.calls_for("create_load_balancer"), 0);
        assert_eq!(fx.fake.calls_for("update_backend_set"), 0);
        assert_eq!(fx.fake.calls_for("update_listener"), 0);
        assert_eq!(fx.fake.calls_for("update_security_list"), 0);
    }

    #[tokio::test]
    async fn test_node_change_updates_backend_set() {
        let fx = fixture();
        let ctx = CallContext::background();
        fx.reconciler.ensure(&ctx, &fx.svc).await.unwrap();

        let subnet_id = fx.nodes.0.lock()[0].subnet_id.clone();
        fx.nodes.0.lock().push(NodeSpec {
            id: "ocid1.instance.oc1..n2".into(),
            name: "node-2".into(),
            addresses: vec!["10.0.10.2".into()],
            failure_domain: "AD-1".into(),
            subnet_id,
            ready: true,
            unschedulable: false,
            taints: vec![],
        });

        fx.fake.clear_call_log();
        fx.reconciler.ensure(&ctx, &fx.svc).await.unwrap();
        assert_eq!(fx.fake.calls_for("update_backend_set"), 1);

        let lb = fx.fake.lb_by_name("prod/web/uid-1").unwrap();
        assert_eq!(lb.backend_sets["TCP-80"].backends.len(), 2);
    }

    #[tokio::test]
    async fn test_failed_balancer_deleted_for_recreation() {
        let fx = fixture();
        let ctx = CallContext::background();
        fx.reconciler.ensure(&ctx, &fx.svc).await.unwrap();
        let lb = fx.fake.lb_by_name("prod/web/uid-1").unwrap();
        fx.fake.set_lb_state(&lb.id, LbLifecycleState::Failed);

        let err = fx.reconciler.ensure(&ctx, &fx.svc).await.unwrap_err();
        assert_matches!(err, Error::TryAgain { .. });
        assert!(fx.fake.lb_by_name("prod/web/uid-1").is_none());

        // The next pass recreates from scratch.
        fx.reconciler.ensure(&ctx, &fx.svc).await.unwrap();
        assert!(fx.fake.lb_by_name("prod/web/uid-1").is_some());
    }

    #[tokio::test]
    async fn test_foreign_balancer_is_never_touched() {
        let fx = fixture();
        let ctx = CallContext::background();

        // Same derived name, but tagged for another cluster.
        let mut details = fx.fake.sample_lb_details("prod/web/uid-1");
        details
            .freeform_tags
            .insert(TAG_CLUSTER_OCID.into(), "ocid1.cluster.oc1..other".into());
        fx.fake.create_load_balancer(&ctx, &details).await.unwrap();

        assert_matches!(
            fx.reconciler.ensure(&ctx, &fx.svc).await,
            Err(Error::Forbidden { .. })
        );
        assert_matches!(
            fx.reconciler.ensure_deleted(&ctx, &fx.svc).await,
            Err(Error::Forbidden { .. })
        );
        assert!(fx.fake.lb_by_name("prod/web/uid-1").is_some());
    }

    #[tokio::test]
    async fn test_ensure_deleted_tears_down_and_sweeps_rules() {
        let fx = fixture();
        let ctx = CallContext::background();
        fx.reconciler.ensure(&ctx, &fx.svc).await.unwrap();
        let lb = fx.fake.lb_by_name("prod/web/uid-1").unwrap();

        fx.reconciler.ensure_deleted(&ctx, &fx.svc).await.unwrap();
        assert!(fx.fake.lb_by_name("prod/web/uid-1").is_none());

        // No operator rule survives on any involved subnet.
        let desc = security_lists::rule_description(&fx.svc);
        for subnet_id in &lb.subnet_ids {
            let subnet = fx.reconciler.client.get_subnet(&ctx, subnet_id).await.unwrap();
            let list = fx
                .reconciler
                .client
                .get_security_list(&ctx, &subnet.security_list_ids[0])
                .await
                .unwrap();
            assert!(!security_lists::has_rules_for(&list, &desc));
        }
    }

    #[tokio::test]
    async fn test_ensure_deleted_of_absent_balancer_is_ok() {
        let fx = fixture();
        let ctx = CallContext::background();
        fx.reconciler.ensure_deleted(&ctx, &fx.svc).await.unwrap();
    }

    #[tokio::test]
    async fn test_get_status_reports_addresses() {
        let fx = fixture();
        let ctx = CallContext::background();
        assert!(fx
            .reconciler
            .get_status(&ctx, &fx.svc)
            .await
            .unwrap()
            .is_none());

        fx.reconciler.ensure(&ctx, &fx.svc).await.unwrap();
        let ips = fx.reconciler.get_status(&ctx, &fx.svc).await.unwrap().unwrap();
        assert_eq!(ips.len(), 1);
    }
}
