//! Operation metric pipeline
//!
//! Components record operation outcomes through a cheap, non-blocking
//! [`MetricSink`]; a single [`MetricPusher`] drains the shared queue on a
//! jittered tick and posts batches to the telemetry endpoint. Telemetry is
//! strictly best effort: a full queue drops the oldest samples, a failing
//! endpoint drops the batch after bounded retries, and a disabled sink makes
//! every recording a no-op.

use crate::config::MetricsConfig;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rand::Rng;
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Queue capacity; beyond this the oldest samples are dropped
pub const QUEUE_CAPACITY: usize = 1024;
/// Samples posted per tick at most
pub const MAX_BATCH: usize = 50;
/// Base tick interval, jittered ±10 %
pub const PUSH_INTERVAL: Duration = Duration::from_secs(1);
/// Post retries before a batch is discarded
pub const PUSH_RETRIES: u32 = 2;

/// Placeholder for empty dimension values
const UNKNOWN_DIMENSION: &str = "unknown";

// =============================================================================
// Metric Names
// =============================================================================

/// The closed set of operation outcome metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Metric {
    LbProvisionSuccess,
    LbProvisionFailure,
    LbUpdateSuccess,
    LbUpdateFailure,
    LbDeleteSuccess,
    LbDeleteFailure,
    PvProvisionSuccess,
    PvProvisionFailure,
    PvAttachSuccess,
    PvAttachFailure,
    PvDetachSuccess,
    PvDetachFailure,
    PvDeleteSuccess,
    PvDeleteFailure,
}

impl Metric {
    pub fn name(&self) -> &'static str {
        match self {
            Metric::LbProvisionSuccess => "LB_PROVISION_SUCCESS",
            Metric::LbProvisionFailure => "LB_PROVISION_FAILURE",
            Metric::LbUpdateSuccess => "LB_UPDATE_SUCCESS",
            Metric::LbUpdateFailure => "LB_UPDATE_FAILURE",
            Metric::LbDeleteSuccess => "LB_DELETE_SUCCESS",
            Metric::LbDeleteFailure => "LB_DELETE_FAILURE",
            Metric::PvProvisionSuccess => "PV_PROVISION_SUCCESS",
            Metric::PvProvisionFailure => "PV_PROVISION_FAILURE",
            Metric::PvAttachSuccess => "PV_ATTACH_SUCCESS",
            Metric::PvAttachFailure => "PV_ATTACH_FAILURE",
            Metric::PvDetachSuccess => "PV_DETACH_SUCCESS",
            Metric::PvDetachFailure => "PV_DETACH_FAILURE",
            Metric::PvDeleteSuccess => "PV_DELETE_SUCCESS",
            Metric::PvDeleteFailure => "PV_DELETE_FAILURE",
        }
    }
}

/// One queued observation.
#[derive(Debug, Clone)]
pub struct MetricSample {
    pub metric: Metric,
    pub dimensions: BTreeMap<String, String>,
    pub value: f64,
    pub timestamp: DateTime<Utc>,
}

// =============================================================================
// Sink
// =============================================================================

struct SinkShared {
    queue: Mutex<VecDeque<MetricSample>>,
    dropped: AtomicU64,
}

/// Cheap cloneable handle components record through.
///
/// A sink built with [`MetricSink::disabled`] accepts and discards every
/// sample, so callers never branch on whether telemetry is configured.
#[derive(Clone)]
pub struct MetricSink {
    shared: Option<Arc<SinkShared>>,
}

impl MetricSink {
    pub fn new() -> Self {
        Self {
            shared: Some(Arc::new(SinkShared {
                queue: Mutex::new(VecDeque::with_capacity(QUEUE_CAPACITY)),
                dropped: AtomicU64::new(0),
            })),
        }
    }

    /// A sink that drops everything.
    pub fn disabled() -> Self {
        Self { shared: None }
    }

    /// Queue one count-of-one observation. Never blocks; when the queue is
    /// full the oldest sample is evicted to make room.
    pub fn emit(&self, metric: Metric, dimensions: BTreeMap<String, String>) {
        let Some(shared) = &self.shared else {
            return;
        };
        let mut queue = shared.queue.lock();
        if queue.len() >= QUEUE_CAPACITY {
            queue.pop_front();
            shared.dropped.fetch_add(1, Ordering::Relaxed);
        }
        queue.push_back(MetricSample {
            metric,
            dimensions,
            value: 1.0,
            timestamp: Utc::now(),
        });
    }

    /// Samples evicted because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.shared
            .as_ref()
            .map(|s| s.dropped.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn queued(&self) -> usize {
        self.shared
            .as_ref()
            .map(|s| s.queue.lock().len())
            .unwrap_or(0)
    }

    fn drain(&self, max: usize) -> Vec<MetricSample> {
        let Some(shared) = &self.shared else {
            return Vec::new();
        };
        let mut queue = shared.queue.lock();
        let n = queue.len().min(max);
        queue.drain(..n).collect()
    }
}

impl Default for MetricSink {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Poster
// =============================================================================

/// Wire form of one posted datapoint.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryDatapoint {
    pub namespace: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource_group: Option<String>,
    pub compartment_id: String,
    pub name: String,
    pub dimensions: BTreeMap<String, String>,
    pub timestamp: DateTime<Utc>,
    pub value: f64,
}

/// Transport a batch of datapoints to the telemetry service.
#[async_trait]
pub trait TelemetryPoster: Send + Sync {
    async fn post(&self, datapoints: &[TelemetryDatapoint]) -> anyhow::Result<()>;
}

pub type TelemetryPosterRef = Arc<dyn TelemetryPoster>;

/// Posts batches to the monitoring ingestion endpoint over HTTPS.
pub struct HttpTelemetryPoster {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpTelemetryPoster {
    pub fn new(endpoint: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.to_string(),
        }
    }
}

#[async_trait]
impl TelemetryPoster for HttpTelemetryPoster {
    async fn post(&self, datapoints: &[TelemetryDatapoint]) -> anyhow::Result<()> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(&serde_json::json!({ "metricData": datapoints }))
            .send()
            .await?;
        response.error_for_status()?;
        Ok(())
    }
}

// =============================================================================
// Pusher
// =============================================================================

/// Drains the sink on a jittered tick and posts batches.
pub struct MetricPusher {
    sink: MetricSink,
    poster: TelemetryPosterRef,
    config: MetricsConfig,
}

impl MetricPusher {
    pub fn new(sink: MetricSink, poster: TelemetryPosterRef, config: MetricsConfig) -> Self {
        Self {
            sink,
            poster,
            config,
        }
    }

    fn datapoints(&self, samples: Vec<MetricSample>) -> Vec<TelemetryDatapoint> {
        samples
            .into_iter()
            .map(|s| TelemetryDatapoint {
                namespace: self.config.namespace.clone(),
                resource_group: if self.config.resource_group.is_empty() {
                    None
                } else {
                    Some(self.config.resource_group.clone())
                },
                compartment_id: self.config.compartment_id.clone(),
                name: format!("{}{}", self.config.prefix, s.metric.name()),
                dimensions: normalize_dimensions(s.dimensions),
                timestamp: s.timestamp,
                value: s.value,
            })
            .collect()
    }

    async fn push_batch(&self, datapoints: &[TelemetryDatapoint]) {
        for attempt in 0..=PUSH_RETRIES {
            match self.poster.post(datapoints).await {
                Ok(()) => return,
                Err(e) if attempt < PUSH_RETRIES => {
                    debug!(attempt, error = %e, "metric post failed, retrying");
                }
                Err(e) => {
                    warn!(
                        count = datapoints.len(),
                        error = %e,
                        "discarding metric batch after retries"
                    );
                }
            }
        }
    }

    async fn tick(&self) {
        let batch = self.sink.drain(MAX_BATCH);
        if batch.is_empty() {
            return;
        }
        let datapoints = self.datapoints(batch);
        self.push_batch(&datapoints).await;
    }

    /// Run until cancelled; drains once more on the way out.
    pub async fn run(self, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(jittered(PUSH_INTERVAL)) => self.tick().await,
            }
        }
        self.tick().await;
    }
}

/// Empty dimension values are replaced so the telemetry service does not
/// reject the datapoint.
fn normalize_dimensions(dimensions: BTreeMap<String, String>) -> BTreeMap<String, String> {
    dimensions
        .into_iter()
        .map(|(k, v)| {
            if v.is_empty() {
                (k, UNKNOWN_DIMENSION.to_string())
            } else {
                (k, v)
            }
        })
        .collect()
}

/// `base` ±10 %, de-synchronizing pushers across daemons.
fn jittered(base: Duration) -> Duration {
    let factor = rand::thread_rng().gen_range(0.9..1.1);
    base.mul_f64(factor)
}

/// Standard dimensions for one component's observation.
pub fn dimensions(component: &str, resource: &str) -> BTreeMap<String, String> {
    let mut d = BTreeMap::new();
    d.insert("component".to_string(), component.to_string());
    d.insert("resource".to_string(), resource.to_string());
    d
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct RecordingPoster {
        batches: Mutex<Vec<Vec<TelemetryDatapoint>>>,
        fail_first: AtomicUsize,
    }

    impl RecordingPoster {
        fn new(fail_first: usize) -> Arc<Self> {
            Arc::new(Self {
                batches: Mutex::new(Vec::new()),
                fail_first: AtomicUsize::new(fail_first),
            })
        }
    }

    #[async_trait]
    impl TelemetryPoster for RecordingPoster {
        async fn post(&self, datapoints: &[TelemetryDatapoint]) -> anyhow::Result<()> {
            let remaining = self.fail_first.load(Ordering::SeqCst);
            if remaining > 0 {
                self.fail_first.store(remaining - 1, Ordering::SeqCst);
                anyhow::bail!("telemetry unavailable");
            }
            self.batches.lock().push(datapoints.to_vec());
            Ok(())
        }
    }

    fn config() -> MetricsConfig {
        MetricsConfig {
            namespace: "oci_operator".into(),
            compartment_id: "ocid1.compartment.oc1..c".into(),
            resource_group: String::new(),
            prefix: String::new(),
        }
    }

    #[test]
    fn test_disabled_sink_is_a_noop() {
        let sink = MetricSink::disabled();
        sink.emit(Metric::LbProvisionSuccess, BTreeMap::new());
        assert_eq!(sink.queued(), 0);
        assert_eq!(sink.dropped(), 0);
    }

    #[test]
    fn test_full_queue_drops_oldest() {
        let sink = MetricSink::new();
        for _ in 0..QUEUE_CAPACITY + 3 {
            sink.emit(Metric::PvAttachSuccess, BTreeMap::new());
        }
        assert_eq!(sink.queued(), QUEUE_CAPACITY);
        assert_eq!(sink.dropped(), 3);
    }

    #[test]
    fn test_drain_respects_batch_limit() {
        let sink = MetricSink::new();
        for _ in 0..80 {
            sink.emit(Metric::LbUpdateSuccess, BTreeMap::new());
        }
        assert_eq!(sink.drain(MAX_BATCH).len(), MAX_BATCH);
        assert_eq!(sink.queued(), 30);
    }

    #[test]
    fn test_empty_dimensions_become_unknown() {
        let mut dims = BTreeMap::new();
        dims.insert("component".to_string(), "".to_string());
        dims.insert("resource".to_string(), "svc-a".to_string());
        let normalized = normalize_dimensions(dims);
        assert_eq!(normalized["component"], "unknown");
        assert_eq!(normalized["resource"], "svc-a");
    }

    #[tokio::test]
    async fn test_batch_survives_transient_post_failures() {
        let sink = MetricSink::new();
        sink.emit(
            Metric::PvProvisionSuccess,
            dimensions("volume-provisioner", "pvc-1"),
        );
        let poster = RecordingPoster::new(PUSH_RETRIES as usize);
        let pusher = MetricPusher::new(sink, poster.clone(), config());

        pusher.tick().await;
        let batches = poster.batches.lock();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0][0].name, "PV_PROVISION_SUCCESS");
    }

    #[tokio::test]
    async fn test_batch_discarded_after_retries_exhausted() {
        let sink = MetricSink::new();
        sink.emit(Metric::LbDeleteFailure, BTreeMap::new());
        let poster = RecordingPoster::new(PUSH_RETRIES as usize + 1);
        let pusher = MetricPusher::new(sink.clone(), poster.clone(), config());

        pusher.tick().await;
        assert!(poster.batches.lock().is_empty());
        // Batch was drained regardless; it is not re-queued.
        assert_eq!(sink.queued(), 0);
    }

    #[tokio::test]
    async fn test_prefix_applied_to_metric_names() {
        let sink = MetricSink::new();
        sink.emit(Metric::LbProvisionSuccess, BTreeMap::new());
        let poster = RecordingPoster::new(0);
        let mut cfg = config();
        cfg.prefix = "k8s_".into();
        let pusher = MetricPusher::new(sink, poster.clone(), cfg);

        pusher.tick().await;
        assert_eq!(poster.batches.lock()[0][0].name, "k8s_LB_PROVISION_SUCCESS");
    }
}
