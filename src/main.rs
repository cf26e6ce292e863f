//! OCI Cloud Operator binary
//!
//! Wires the control loops together: loads the cloud config, builds the
//! rate-limited [`CloudClient`], starts the load-balancer and volume
//! reconcile hosts plus the orphan sweeper and metric pusher, and serves
//! health and Prometheus endpoints until a termination signal drains the
//! workers.

use clap::Parser;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use oci_cloud_operator::client::fake::FakeCloud;
use oci_cloud_operator::client::types::Certificate;
use oci_cloud_operator::client::CloudApi;
use oci_cloud_operator::config::{self, CloudConfig};
use oci_cloud_operator::domain::ports::{EventRecorder, ObjectSource, ObjectSourceRef};
use oci_cloud_operator::domain::types::{NodeSpec, PersistentVolume, ServiceSpec, VolumeClaim};
use oci_cloud_operator::lb::CertificateSource;
use oci_cloud_operator::metrics::{HttpTelemetryPoster, MetricPusher};
use oci_cloud_operator::reconcile::{ReconcileHost, Reconciler, DEFAULT_WORKERS};
use oci_cloud_operator::{
    CallContext, CloudClient, Error, LbReconciler, MetricSink, Result, VolumeProvisioner,
};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

// =============================================================================
// CLI Arguments
// =============================================================================

/// OCI Cloud Operator - load balancers and block volumes for Kubernetes
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Cloud config file; defaults to the legacy environment lookup
    #[arg(long, env = "CLOUD_CONFIG")]
    cloud_config: Option<PathBuf>,

    /// Health server bind address
    #[arg(long, env = "HEALTH_ADDR", default_value = "0.0.0.0:8081")]
    health_addr: String,

    /// Prometheus metrics bind address
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:8080")]
    metrics_addr: String,

    /// Workers per reconcile host
    #[arg(long, env = "RECONCILE_WORKERS", default_value_t = DEFAULT_WORKERS)]
    workers: usize,

    /// Kubeconfig for out-of-cluster API access
    #[arg(long, env = "KUBECONFIG")]
    kubeconfig: Option<PathBuf>,

    /// Kubernetes API server address, overrides the kubeconfig entry
    #[arg(long, env = "MASTER")]
    master: Option<String>,

    /// Run the volume provisioner and the orphan sweeper
    #[arg(
        long,
        env = "ENABLE_VOLUME_PROVISIONING",
        default_value_t = true,
        action = clap::ArgAction::Set,
        num_args = 0..=1,
        default_missing_value = "true"
    )]
    enable_volume_provisioning: bool,

    /// Round undersized volume claims up to the floor instead of rejecting them
    #[arg(
        long,
        env = "ROUNDING_ENABLED",
        default_value_t = true,
        action = clap::ArgAction::Set,
        num_args = 0..=1,
        default_missing_value = "true"
    )]
    rounding_enabled: bool,

    /// Smallest volume the provisioner will create, in GiB
    #[arg(long, env = "MIN_VOLUME_SIZE", default_value_t = 50)]
    min_volume_size: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,

    /// Run against an in-memory cloud instead of the live API
    #[arg(long, env = "STANDALONE")]
    standalone: bool,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args);

    info!("Starting OCI Cloud Operator");
    info!("  Version: {}", oci_cloud_operator::VERSION);
    info!("  Health: {}", args.health_addr);
    info!("  Metrics: {}", args.metrics_addr);
    info!("  Standalone mode: {}", args.standalone);
    if let Some(kubeconfig) = &args.kubeconfig {
        info!("  Kubeconfig: {}", kubeconfig.display());
    }
    if let Some(master) = &args.master {
        info!("  Master: {}", master);
    }

    let config_path = args
        .cloud_config
        .clone()
        .unwrap_or_else(config::config_path_from_env);
    info!("Loading cloud config from {}", config_path.display());
    let cloud_config = Arc::new(CloudConfig::from_file(&config_path)?);
    cloud_config.validate()?;

    let api = build_cloud_api(&args, &cloud_config)?;
    let client = CloudClient::new(
        api,
        &cloud_config.auth.region,
        cloud_config.rate_limiter.clone(),
    );

    let cancel = CancellationToken::new();
    let mut background = Vec::new();

    // Telemetry pusher, only when the config carries a metrics section.
    let sink = match &cloud_config.metrics {
        Some(metrics_config) => {
            let sink = MetricSink::new();
            let poster = Arc::new(HttpTelemetryPoster::new(&format!(
                "https://telemetry-ingestion.{}.oraclecloud.com/20180401/metrics",
                cloud_config.auth.region
            )));
            let pusher = MetricPusher::new(sink.clone(), poster, metrics_config.clone());
            let pusher_cancel = cancel.clone();
            background.push(tokio::spawn(async move {
                pusher.run(pusher_cancel).await;
            }));
            sink
        }
        None => MetricSink::disabled(),
    };

    // Object sources and event sink. Standalone runs on empty in-memory
    // stores; keys arrive on the queues from the API surface.
    let services: ObjectSourceRef<ServiceSpec> = Arc::new(MemoryStore::new());
    let claims: ObjectSourceRef<VolumeClaim> = Arc::new(MemoryStore::new());
    let volumes: ObjectSourceRef<PersistentVolume> = Arc::new(MemoryStore::new());
    let nodes: ObjectSourceRef<NodeSpec> = Arc::new(MemoryStore::new());
    let recorder = Arc::new(LogRecorder);

    let lb = Arc::new(LbReconciler::new(
        client.clone(),
        Arc::clone(&cloud_config),
        nodes,
        Arc::new(NoTls),
        recorder.clone(),
        sink.clone(),
    ));
    let lb_host = ReconcileHost::new(
        Arc::new(ServiceReconciler {
            lb,
            services: Arc::clone(&services),
        }),
        args.workers,
    )?;
    let lb_cancel = cancel.clone();
    background.push(tokio::spawn(async move {
        lb_host.run(lb_cancel).await;
    }));

    if args.enable_volume_provisioning {
        let provisioner = Arc::new(
            VolumeProvisioner::new(
                client.clone(),
                Arc::clone(&cloud_config),
                Arc::clone(&volumes),
                recorder.clone(),
                sink.clone(),
                args.rounding_enabled,
            )
            .with_minimum_size_mb(args.min_volume_size * 1024),
        );
        let claim_host = ReconcileHost::new(
            Arc::new(ClaimReconciler {
                provisioner: Arc::clone(&provisioner),
                claims: Arc::clone(&claims),
            }),
            args.workers,
        )?;
        let claim_cancel = cancel.clone();
        background.push(tokio::spawn(async move {
            claim_host.run(claim_cancel).await;
        }));
        let sweep_cancel = cancel.clone();
        background.push(tokio::spawn(async move {
            provisioner.run_sweeper(sweep_cancel).await;
        }));
    }

    // Health and metrics servers run detached; they die with the process.
    let health_addr = args.health_addr.clone();
    tokio::spawn(async move {
        if let Err(e) = run_health_server(&health_addr).await {
            error!("Health server error: {}", e);
        }
    });
    let metrics_addr = args.metrics_addr.clone();
    tokio::spawn(async move {
        if let Err(e) = run_metrics_server(&metrics_addr).await {
            error!("Metrics server error: {}", e);
        }
    });

    wait_for_shutdown(cancel, background).await;

    info!("Operator shutdown complete");
    Ok(())
}

/// Drain the control loops after the first termination signal; a second
/// signal or the grace deadline abandons whatever is still in flight.
async fn wait_for_shutdown(
    cancel: CancellationToken,
    background: Vec<tokio::task::JoinHandle<()>>,
) {
    shutdown_signal().await;
    info!("Termination signal received, draining workers");
    cancel.cancel();

    let drain = async {
        for handle in background {
            let _ = handle.await;
        }
    };
    tokio::select! {
        _ = drain => {}
        _ = tokio::time::sleep(SHUTDOWN_GRACE) => {
            warn!("Drain deadline exceeded, aborting in-flight work");
        }
        _ = shutdown_signal() => {
            warn!("Second signal received, aborting in-flight work");
        }
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = match signal(SignalKind::terminate()) {
            Ok(term) => term,
            Err(e) => {
                error!("Cannot install SIGTERM handler: {}", e);
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

// =============================================================================
// Cloud API Selection
// =============================================================================

fn build_cloud_api(args: &Args, config: &CloudConfig) -> Result<Arc<dyn CloudApi + Send + Sync>> {
    if args.standalone {
        let fake = FakeCloud::new(&config.compartment);
        if let Some(subnet1) = &config.load_balancer.subnet1 {
            debug!(subnet = %subnet1, "standalone cloud ignores configured subnets");
        }
        fake.seed_subnet(None, "10.0.0.0/24");
        return Ok(Arc::new(fake));
    }
    // The signed API transport is deployed as a sidecar-provided endpoint in
    // this release; the in-process signer lands with instance principals.
    Err(Error::InvalidConfiguration(
        "no live API transport configured; run with --standalone".into(),
    ))
}

// =============================================================================
// Reconciler Adapters
// =============================================================================

/// Drives [`LbReconciler::ensure`] from service keys on the work queue.
struct ServiceReconciler {
    lb: Arc<LbReconciler>,
    services: ObjectSourceRef<ServiceSpec>,
}

#[async_trait::async_trait]
impl Reconciler for ServiceReconciler {
    fn name(&self) -> &'static str {
        "service"
    }

    async fn reconcile(&self, key: &str) -> Result<()> {
        match self.services.get(key).await? {
            Some(svc) => {
                let ctx = CallContext::background();
                let addresses = self.lb.ensure(&ctx, &svc).await?;
                info!(service = key, addresses = addresses.len(), "service converged");
                Ok(())
            }
            None => {
                // Deletion goes through the finalizer path, which still holds
                // the full service record.
                debug!(service = key, "service gone from the store, nothing to do");
                Ok(())
            }
        }
    }
}

/// Drives [`VolumeProvisioner::provision`] from claim keys.
struct ClaimReconciler {
    provisioner: Arc<VolumeProvisioner>,
    claims: ObjectSourceRef<VolumeClaim>,
}

#[async_trait::async_trait]
impl Reconciler for ClaimReconciler {
    fn name(&self) -> &'static str {
        "claim"
    }

    async fn reconcile(&self, key: &str) -> Result<()> {
        match self.claims.get(key).await? {
            Some(claim) => {
                let ctx = CallContext::background();
                let pv = self.provisioner.provision(&ctx, &claim).await?;
                info!(claim = key, volume = %pv.volume_id, "claim provisioned");
                Ok(())
            }
            None => {
                debug!(claim = key, "claim gone from the store, nothing to do");
                Ok(())
            }
        }
    }
}

// =============================================================================
// In-Memory Platform Ports
// =============================================================================

/// Keyed object store backing the standalone object sources.
struct MemoryStore<T> {
    objects: parking_lot::RwLock<HashMap<String, T>>,
}

impl<T> MemoryStore<T> {
    fn new() -> Self {
        Self {
            objects: parking_lot::RwLock::new(HashMap::new()),
        }
    }
}

#[async_trait::async_trait]
impl<T: Clone + Send + Sync> ObjectSource<T> for MemoryStore<T> {
    async fn get(&self, key: &str) -> Result<Option<T>> {
        Ok(self.objects.read().get(key).cloned())
    }

    async fn list(&self) -> Result<Vec<T>> {
        Ok(self.objects.read().values().cloned().collect())
    }
}

/// Event sink that lands records in the operator log.
struct LogRecorder;

impl EventRecorder for LogRecorder {
    fn event(&self, object: &str, reason: &str, message: &str) {
        info!(object, reason, "{}", message);
    }
}

/// Certificate source for deployments without TLS secrets.
struct NoTls;

#[async_trait::async_trait]
impl CertificateSource for NoTls {
    async fn resolve(
        &self,
        _namespace: &str,
        secret: &str,
        _svc_uid: &str,
    ) -> Result<Option<Certificate>> {
        warn!(secret, "TLS requested but no certificate source is configured");
        Ok(None)
    }
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let mut filter = EnvFilter::from_default_env().add_directive(level.into());
    for directive in ["hyper=warn", "reqwest=warn", "tower=warn"] {
        if let Ok(d) = directive.parse() {
            filter = filter.add_directive(d);
        }
    }

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
}

// =============================================================================
// Health Server
// =============================================================================

async fn run_health_server(addr: &str) -> Result<()> {
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Response, Server, StatusCode};

    let make_svc = make_service_fn(|_conn| async {
        Ok::<_, std::convert::Infallible>(service_fn(|req: Request<Body>| async move {
            let status = match req.uri().path() {
                "/healthz" | "/livez" | "/readyz" => StatusCode::OK,
                _ => StatusCode::NOT_FOUND,
            };
            let body = if status == StatusCode::OK { "ok" } else { "not found" };
            Ok::<_, std::convert::Infallible>(
                Response::builder()
                    .status(status)
                    .body(Body::from(body))
                    .unwrap_or_default(),
            )
        }))
    });

    let addr: SocketAddr = addr
        .parse()
        .map_err(|e| Error::InvalidConfiguration(format!("invalid health address: {}", e)))?;
    info!("Health server listening on {}", addr);
    Server::bind(&addr)
        .serve(make_svc)
        .await
        .map_err(|e| Error::Fatal(format!("health server: {}", e)))?;
    Ok(())
}

// =============================================================================
// Metrics Server
// =============================================================================

async fn run_metrics_server(addr: &str) -> Result<()> {
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Response, Server, StatusCode};
    use prometheus::{Encoder, TextEncoder};

    let make_svc = make_service_fn(|_conn| async {
        Ok::<_, std::convert::Infallible>(service_fn(|req: Request<Body>| async move {
            let response = match req.uri().path() {
                "/metrics" => {
                    let encoder = TextEncoder::new();
                    let families = prometheus::gather();
                    let mut buf = Vec::new();
                    match encoder.encode(&families, &mut buf) {
                        Ok(()) => Response::builder()
                            .status(StatusCode::OK)
                            .header("Content-Type", encoder.format_type())
                            .body(Body::from(buf)),
                        Err(e) => Response::builder()
                            .status(StatusCode::INTERNAL_SERVER_ERROR)
                            .body(Body::from(e.to_string())),
                    }
                }
                _ => Response::builder()
                    .status(StatusCode::NOT_FOUND)
                    .body(Body::from("not found")),
            };
            Ok::<_, std::convert::Infallible>(response.unwrap_or_default())
        }))
    });

    let addr: SocketAddr = addr
        .parse()
        .map_err(|e| Error::InvalidConfiguration(format!("invalid metrics address: {}", e)))?;
    info!("Metrics server listening on {}", addr);
    Server::bind(&addr)
        .serve(make_svc)
        .await
        .map_err(|e| Error::Fatal(format!("metrics server: {}", e)))?;
    Ok(())
}
