//! # OCI Cloud Operator
//!
//! Kubernetes-facing control plane for Oracle Cloud Infrastructure: keeps
//! cloud load balancers converged on LoadBalancer-type services, provisions
//! and attaches block volumes for persistent volume claims, and pushes
//! operation metrics to the cloud telemetry service.
//!
//! ## Architecture
//!
//! ```text
//!     +--------------------+     +---------------------+
//!     |   ReconcileHost    |     |    ReconcileHost    |
//!     |  (services queue)  |     |   (claims queue)    |
//!     +---------+----------+     +----------+----------+
//!               |                           |
//!        +------v-------+          +--------v---------+     +-----------------+
//!        | LbReconciler |          |VolumeProvisioner |     |NodeVolumeManager|
//!        +------+-------+          +--------+---------+     +--------+--------+
//!               |                           |                        |
//!               +-----------+---------------+------------------------+
//!                           |
//!                   +-------v-------+        +--------------+
//!                   |  CloudClient  |------->| MetricPusher |
//!                   | retry + rate  |        | (telemetry)  |
//!                   +-------+-------+        +--------------+
//!                           |
//!                      OCI REST APIs
//! ```
//!
//! The [`client::CloudClient`] is the single choke point for cloud traffic:
//! per-service token-bucket rate limiting, idempotence-classified retry with
//! jittered backoff, and request-id propagation. Everything above it is a
//! pure control loop over typed snapshots.

pub mod client;
pub mod config;
pub mod domain;
pub mod error;
pub mod lb;
pub mod locks;
pub mod metrics;
pub mod reconcile;
pub mod volume;

pub use client::{CallContext, CloudClient};
pub use config::CloudConfig;
pub use error::{Error, ErrorAction, Result};
pub use lb::LbReconciler;
pub use locks::VolumeLocks;
pub use metrics::{MetricPusher, MetricSink};
pub use reconcile::{ReconcileHost, Reconciler, WorkQueue};
pub use volume::{NodeVolumeManager, VolumeProvisioner};

/// Operator version, from the crate manifest
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Operator name used in logs and events
pub const NAME: &str = "oci-cloud-operator";
