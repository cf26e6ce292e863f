//! Benchmark for the load-balancer diff planner
//!
//! The planner runs on every reconcile pass of every service, usually against
//! an already-converged balancer, so the converged no-op case is the one that
//! matters.

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use oci_cloud_operator::client::types::{
    Backend, BackendSet, HealthCheck, LbLifecycleState, Listener, LoadBalancer,
};
use oci_cloud_operator::lb::diff::plan;
use oci_cloud_operator::lb::spec::DesiredLoadBalancer;
use std::collections::BTreeMap;

fn backend_set(nodes: usize, port: u16) -> BackendSet {
    BackendSet {
        policy: "ROUND_ROBIN".to_string(),
        backends: (0..nodes)
            .map(|i| Backend {
                ip_address: format!("10.0.{}.{}", i / 256, i % 256),
                port,
                weight: 1,
            })
            .collect(),
        health_check: HealthCheck::default(),
        session_persistence: None,
        ssl_config: None,
    }
}

fn listener(port: u16, backend_set: &str) -> Listener {
    Listener {
        port,
        protocol: "TCP".to_string(),
        default_backend_set_name: backend_set.to_string(),
        ssl_config: None,
        idle_timeout_sec: None,
    }
}

fn desired(ports: &[u16], nodes: usize) -> DesiredLoadBalancer {
    let mut listeners = BTreeMap::new();
    let mut backend_sets = BTreeMap::new();
    for &port in ports {
        let name = format!("TCP-{}", port);
        listeners.insert(name.clone(), listener(port, &name));
        backend_sets.insert(name, backend_set(nodes, 30000 + port));
    }
    DesiredLoadBalancer {
        name: "default/bench/uid-1".to_string(),
        shape: "100Mbps".to_string(),
        shape_min_mbps: None,
        shape_max_mbps: None,
        subnet_ids: vec!["subnet-1".to_string()],
        is_private: false,
        listeners,
        backend_sets,
        certificates: BTreeMap::new(),
        nsg_ids: Vec::new(),
        freeform_tags: BTreeMap::new(),
        defined_tags: BTreeMap::new(),
    }
}

fn actual_from(desired: &DesiredLoadBalancer) -> LoadBalancer {
    LoadBalancer {
        id: "lb-1".to_string(),
        display_name: desired.name.clone(),
        compartment_id: "compartment-1".to_string(),
        lifecycle_state: LbLifecycleState::Active,
        shape: desired.shape.clone(),
        shape_min_mbps: desired.shape_min_mbps,
        shape_max_mbps: desired.shape_max_mbps,
        subnet_ids: desired.subnet_ids.clone(),
        is_private: desired.is_private,
        listeners: desired.listeners.clone(),
        backend_sets: desired.backend_sets.clone(),
        certificates: desired.certificates.clone(),
        ip_addresses: Vec::new(),
        nsg_ids: Vec::new(),
        freeform_tags: desired.freeform_tags.clone(),
        defined_tags: desired.defined_tags.clone(),
        etag: None,
    }
}

fn bench_converged(c: &mut Criterion) {
    let mut group = c.benchmark_group("lb_diff");
    group.throughput(Throughput::Elements(1));

    for nodes in [10usize, 100, 1000] {
        let want = desired(&[80, 443, 8080], nodes);
        let have = actual_from(&want);
        group.bench_function(format!("converged_{}_nodes", nodes), |b| {
            b.iter(|| {
                let actions = plan(black_box(&want), black_box(&have));
                assert!(actions.is_empty());
            });
        });
    }

    group.finish();
}

fn bench_node_churn(c: &mut Criterion) {
    let mut group = c.benchmark_group("lb_diff");
    group.throughput(Throughput::Elements(1));

    // One node replaced across every backend set; the common drift case.
    let want = desired(&[80, 443, 8080], 100);
    let mut have = actual_from(&want);
    for set in have.backend_sets.values_mut() {
        set.backends[0].ip_address = "10.9.9.9".to_string();
    }
    group.bench_function("one_node_replaced_100_nodes", |b| {
        b.iter(|| {
            let actions = plan(black_box(&want), black_box(&have));
            assert_eq!(actions.len(), 3);
        });
    });

    group.finish();
}

fn bench_port_swap(c: &mut Criterion) {
    let mut group = c.benchmark_group("lb_diff");
    group.throughput(Throughput::Elements(1));

    let want = desired(&[80, 443], 100);
    let have = actual_from(&desired(&[80, 8443], 100));
    group.bench_function("port_swapped_100_nodes", |b| {
        b.iter(|| {
            let actions = plan(black_box(&want), black_box(&have));
            black_box(actions);
        });
    });

    group.finish();
}

criterion_group!(benches, bench_converged, bench_node_churn, bench_port_swap);
criterion_main!(benches);
