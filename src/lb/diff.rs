//! Load-balancer convergence planning
//!
//! Pure diff between the desired shape and the observed balancer. The plan is
//! a fixed-order action sequence safe to apply one work request at a time:
//! certificates land before anything references them, backend sets before the
//! listeners that forward to them, and deletions run in the reverse direction
//! so nothing is removed while still referenced.

use super::spec::DesiredLoadBalancer;
use crate::client::types::{BackendSet, Certificate, Listener, LoadBalancer};

/// One mutation toward the desired state.
#[derive(Debug, Clone, PartialEq)]
pub enum LbAction {
    EnsureCertificate(Certificate),
    CreateBackendSet { name: String, spec: BackendSet },
    CreateListener { name: String, spec: Listener },
    UpdateListener { name: String, spec: Listener },
    UpdateBackendSet { name: String, spec: BackendSet },
    DeleteListener { name: String },
    DeleteBackendSet { name: String },
    DeleteCertificate { name: String },
}

impl LbAction {
    /// Short form for logs and events.
    pub fn describe(&self) -> String {
        match self {
            LbAction::EnsureCertificate(c) => {
                format!("create certificate {}", c.certificate_name)
            }
            LbAction::CreateBackendSet { name, .. } => format!("create backend set {}", name),
            LbAction::CreateListener { name, .. } => format!("create listener {}", name),
            LbAction::UpdateListener { name, .. } => format!("update listener {}", name),
            LbAction::UpdateBackendSet { name, .. } => format!("update backend set {}", name),
            LbAction::DeleteListener { name } => format!("delete listener {}", name),
            LbAction::DeleteBackendSet { name } => format!("delete backend set {}", name),
            LbAction::DeleteCertificate { name } => format!("delete certificate {}", name),
        }
    }
}

/// Whether two backend sets agree, with membership order normalized.
fn backend_sets_equal(desired: &BackendSet, actual: &BackendSet) -> bool {
    desired.policy == actual.policy
        && desired.health_check == actual.health_check
        && desired.session_persistence == actual.session_persistence
        && desired.ssl_config == actual.ssl_config
        && desired.sorted_backends() == actual.sorted_backends()
}

/// Compute the ordered action sequence converging `actual` on `desired`.
///
/// An empty plan means the balancer already matches.
pub fn plan(desired: &DesiredLoadBalancer, actual: &LoadBalancer) -> Vec<LbAction> {
    let mut actions = Vec::new();

    // Certificates are immutable; only presence is reconciled.
    for (name, cert) in &desired.certificates {
        if !actual.certificates.contains_key(name) {
            actions.push(LbAction::EnsureCertificate(cert.clone()));
        }
    }

    for (name, spec) in &desired.backend_sets {
        if !actual.backend_sets.contains_key(name) {
            actions.push(LbAction::CreateBackendSet {
                name: name.clone(),
                spec: spec.clone(),
            });
        }
    }

    for (name, spec) in &desired.listeners {
        if !actual.listeners.contains_key(name) {
            actions.push(LbAction::CreateListener {
                name: name.clone(),
                spec: spec.clone(),
            });
        }
    }

    for (name, spec) in &desired.listeners {
        if let Some(existing) = actual.listeners.get(name) {
            if existing != spec {
                actions.push(LbAction::UpdateListener {
                    name: name.clone(),
                    spec: spec.clone(),
                });
            }
        }
    }

    // Backend-set updates replace the whole set; membership deltas are not
    // expressed as per-backend calls.
    for (name, spec) in &desired.backend_sets {
        if let Some(existing) = actual.backend_sets.get(name) {
            if !backend_sets_equal(spec, existing) {
                actions.push(LbAction::UpdateBackendSet {
                    name: name.clone(),
                    spec: spec.clone(),
                });
            }
        }
    }

    for name in actual.listeners.keys() {
        if !desired.listeners.contains_key(name) {
            actions.push(LbAction::DeleteListener { name: name.clone() });
        }
    }

    for name in actual.backend_sets.keys() {
        if !desired.backend_sets.contains_key(name) {
            actions.push(LbAction::DeleteBackendSet { name: name.clone() });
        }
    }

    for name in actual.certificates.keys() {
        if !desired.certificates.contains_key(name) {
            actions.push(LbAction::DeleteCertificate { name: name.clone() });
        }
    }

    actions
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::types::*;
    use std::collections::BTreeMap;

    fn backend_set(ips: &[&str]) -> BackendSet {
        BackendSet {
            policy: "ROUND_ROBIN".into(),
            backends: ips
                .iter()
                .map(|ip| Backend {
                    ip_address: ip.to_string(),
                    port: 30080,
                    weight: 1,
                })
                .collect(),
            health_check: HealthCheck::default(),
            session_persistence: None,
            ssl_config: None,
        }
    }

    fn listener(port: u16, set: &str) -> Listener {
        Listener {
            port,
            protocol: "TCP".into(),
            default_backend_set_name: set.into(),
            ssl_config: None,
            idle_timeout_sec: None,
        }
    }

    fn desired(
        listeners: BTreeMap<String, Listener>,
        backend_sets: BTreeMap<String, BackendSet>,
    ) -> DesiredLoadBalancer {
        DesiredLoadBalancer {
            name: "prod/web/uid".into(),
            shape: "100Mbps".into(),
            shape_min_mbps: None,
            shape_max_mbps: None,
            subnet_ids: vec!["s1".into(), "s2".into()],
            is_private: false,
            listeners,
            backend_sets,
            certificates: BTreeMap::new(),
            nsg_ids: Vec::new(),
            freeform_tags: BTreeMap::new(),
            defined_tags: BTreeMap::new(),
        }
    }

    fn actual(
        listeners: BTreeMap<String, Listener>,
        backend_sets: BTreeMap<String, BackendSet>,
    ) -> LoadBalancer {
        LoadBalancer {
            id: "ocid1.loadbalancer.oc1..lb".into(),
            display_name: "prod/web/uid".into(),
            compartment_id: "c".into(),
            lifecycle_state: LbLifecycleState::Active,
            shape: "100Mbps".into(),
            shape_min_mbps: None,
            shape_max_mbps: None,
            subnet_ids: vec!["s1".into(), "s2".into()],
            is_private: false,
            listeners,
            backend_sets,
            certificates: BTreeMap::new(),
            ip_addresses: vec![],
            nsg_ids: vec![],
            freeform_tags: BTreeMap::new(),
            defined_tags: BTreeMap::new(),
            etag: None,
        }
    }

    #[test]
    fn test_converged_balancer_plans_nothing() {
        let listeners = BTreeMap::from([("TCP-80".to_string(), listener(80, "TCP-80"))]);
        let sets = BTreeMap::from([("TCP-80".to_string(), backend_set(&["10.0.0.1"]))]);
        assert!(plan(
            &desired(listeners.clone(), sets.clone()),
            &actual(listeners, sets)
        )
        .is_empty());
    }

    #[test]
    fn test_backend_order_does_not_trigger_update() {
        let listeners = BTreeMap::from([("TCP-80".to_string(), listener(80, "TCP-80"))]);
        let want = BTreeMap::from([(
            "TCP-80".to_string(),
            backend_set(&["10.0.0.1", "10.0.0.2"]),
        )]);
        let have = BTreeMap::from([(
            "TCP-80".to_string(),
            backend_set(&["10.0.0.2", "10.0.0.1"]),
        )]);
        assert!(plan(&desired(listeners.clone(), want), &actual(listeners, have)).is_empty());
    }

    #[test]
    fn test_membership_drift_updates_whole_set() {
        let listeners = BTreeMap::from([("TCP-80".to_string(), listener(80, "TCP-80"))]);
        let want = BTreeMap::from([(
            "TCP-80".to_string(),
            backend_set(&["10.0.0.1", "10.0.0.3"]),
        )]);
        let have = BTreeMap::from([(
            "TCP-80".to_string(),
            backend_set(&["10.0.0.1", "10.0.0.2"]),
        )]);

        let actions = plan(&desired(listeners.clone(), want.clone()), &actual(listeners, have));
        assert_eq!(actions.len(), 1);
        assert_eq!(
            actions[0],
            LbAction::UpdateBackendSet {
                name: "TCP-80".into(),
                spec: want["TCP-80"].clone(),
            }
        );
    }

    #[test]
    fn test_port_swap_orders_creates_before_deletes() {
        // Service moved from port 80 to 443.
        let want_listeners = BTreeMap::from([("TCP-443".to_string(), listener(443, "TCP-443"))]);
        let want_sets = BTreeMap::from([("TCP-443".to_string(), backend_set(&["10.0.0.1"]))]);
        let have_listeners = BTreeMap::from([("TCP-80".to_string(), listener(80, "TCP-80"))]);
        let have_sets = BTreeMap::from([("TCP-80".to_string(), backend_set(&["10.0.0.1"]))]);

        let actions = plan(
            &desired(want_listeners, want_sets.clone()),
            &actual(have_listeners, have_sets),
        );
        let descriptions: Vec<String> = actions.iter().map(LbAction::describe).collect();
        assert_eq!(
            descriptions,
            vec![
                "create backend set TCP-443",
                "create listener TCP-443",
                "delete listener TCP-80",
                "delete backend set TCP-80",
            ]
        );
    }

    #[test]
    fn test_certificate_rotation_creates_then_deletes() {
        let listeners = BTreeMap::from([("TCP-80".to_string(), listener(80, "TCP-80"))]);
        let sets = BTreeMap::from([("TCP-80".to_string(), backend_set(&["10.0.0.1"]))]);

        let mut want = desired(listeners.clone(), sets.clone());
        want.certificates.insert(
            "tls-v2".into(),
            Certificate {
                certificate_name: "tls-v2".into(),
                public_certificate: "CERT".into(),
                ca_certificate: String::new(),
                private_key: "KEY".into(),
                passphrase: None,
            },
        );
        let mut have = actual(listeners, sets);
        have.certificates.insert(
            "tls-v1".into(),
            Certificate {
                certificate_name: "tls-v1".into(),
                public_certificate: "OLD".into(),
                ca_certificate: String::new(),
                private_key: "OLDKEY".into(),
                passphrase: None,
            },
        );

        let actions = plan(&want, &have);
        assert_matches::assert_matches!(actions.first(), Some(LbAction::EnsureCertificate(_)));
        assert_eq!(
            actions.last(),
            Some(&LbAction::DeleteCertificate {
                name: "tls-v1".into()
            })
        );
    }
}
