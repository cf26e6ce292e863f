//! Typed, retrying cloud client
//!
//! [`CloudClient`] is the single process-wide façade over the OCI APIs. It
//! wraps every call of the raw transport with classified retry, exponential
//! backoff with jitter, per-service rate limiting, request-id propagation and
//! cancellation, and owns the reusable work-request await primitive.

pub mod api;
pub mod fake;
pub mod rate_limit;
pub mod retry;
pub mod types;

pub use api::{ApiResult, CallContext, CloudApi, CloudError};
pub use rate_limit::{ApiService, RateLimiter};
pub use retry::CallClass;

use crate::config::RateLimiterConfig;
use crate::error::{Error, Result};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};
use types::*;

/// Initial work-request poll interval
const WORK_REQUEST_POLL_BASE: Duration = Duration::from_secs(3);
/// Work-request poll ceiling
const WORK_REQUEST_POLL_CAP: Duration = Duration::from_secs(30);

/// Process-wide cloud client; cheap to clone, safe for concurrent use.
#[derive(Clone)]
pub struct CloudClient {
    api: Arc<dyn CloudApi + Send + Sync>,
    limiter: Arc<RateLimiter>,
}

impl CloudClient {
    pub fn new(
        api: Arc<dyn CloudApi + Send + Sync>,
        region: &str,
        rate: RateLimiterConfig,
    ) -> Self {
        Self {
            api,
            limiter: Arc::new(RateLimiter::new(region, rate)),
        }
    }

    /// Run one raw call under the retry policy for its idempotence class.
    ///
    /// `kind`/`name` identify the target resource for error classification.
    async fn invoke<T, F, Fut>(
        &self,
        service: ApiService,
        class: CallClass,
        kind: &'static str,
        name: &str,
        ctx: &CallContext,
        mut call: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = ApiResult<T>>,
    {
        self.limiter.acquire(service, ctx.deadline).await?;

        let started = Instant::now();
        let attempts = AtomicU32::new(0);
        let policy = retry::backoff_policy(ctx.remaining());

        let outcome = backoff::future::retry(policy, || {
            let fut = call();
            let attempts = &attempts;
            async move {
                if ctx.cancel.is_cancelled() {
                    return Err(backoff::Error::permanent(CloudError::transport(
                        "operation cancelled",
                    )));
                }
                let attempt = attempts.fetch_add(1, Ordering::SeqCst) + 1;
                match fut.await {
                    Ok(v) => Ok(v),
                    Err(e) => {
                        let retryable = attempt < retry::MAX_ATTEMPTS
                            && retry::should_retry(class, &e, started.elapsed());
                        if retryable {
                            debug!(
                                request_id = %ctx.request_id,
                                attempt,
                                error = %e,
                                "retrying {} {}", kind, name,
                            );
                            Err(backoff::Error::transient(e))
                        } else {
                            Err(backoff::Error::permanent(e))
                        }
                    }
                }
            }
        })
        .await;

        outcome.map_err(|e| {
            warn!(request_id = %ctx.request_id, error = %e, "cloud call failed: {} {}", kind, name);
            retry::classify(e, kind, name)
        })
    }

    // =========================================================================
    // Work Requests
    // =========================================================================

    /// Drive an asynchronous work request to a terminal state.
    ///
    /// Polls with capped exponential spacing; a deadline or cancellation
    /// surfaces `TryAgain` so the outer loop can pick the operation back up.
    pub async fn await_work_request(&self, ctx: &CallContext, id: &str) -> Result<WorkRequest> {
        let mut delay = WORK_REQUEST_POLL_BASE;
        loop {
            let wr = self
                .invoke(
                    ApiService::LoadBalancer,
                    CallClass::IdempotentRead,
                    "WorkRequest",
                    id,
                    ctx,
                    || self.api.get_work_request(ctx, id),
                )
                .await?;
            match wr.lifecycle_state {
                WorkRequestState::Succeeded => return Ok(wr),
                WorkRequestState::Failed => {
                    return Err(Error::WorkRequestFailed {
                        id: id.to_string(),
                        message: wr.message.unwrap_or_default(),
                    })
                }
                _ => {}
            }
            if ctx.expired() {
                return Err(Error::try_again(format!(
                    "work request {} not terminal before deadline",
                    id
                )));
            }
            tokio::select! {
                _ = ctx.cancel.cancelled() => {
                    return Err(Error::try_again("cancelled awaiting work request"));
                }
                _ = tokio::time::sleep(delay.min(ctx.remaining())) => {}
            }
            delay = (delay * 2).min(WORK_REQUEST_POLL_CAP);
        }
    }

    // =========================================================================
    // Compute
    // =========================================================================

    pub async fn get_instance(&self, ctx: &CallContext, id: &str) -> Result<Instance> {
        self.invoke(
            ApiService::Compute,
            CallClass::IdempotentRead,
            "Instance",
            id,
            ctx,
            || self.api.get_instance(ctx, id),
        )
        .await
    }

    pub async fn list_vnic_attachments(
        &self,
        ctx: &CallContext,
        compartment_id: &str,
        instance_id: &str,
    ) -> Result<Vec<VnicAttachment>> {
        self.invoke(
            ApiService::Compute,
            CallClass::IdempotentRead,
            "VnicAttachment",
            instance_id,
            ctx,
            || self.api.list_vnic_attachments(ctx, compartment_id, instance_id),
        )
        .await
    }

    pub async fn get_vnic(&self, ctx: &CallContext, id: &str) -> Result<Vnic> {
        self.invoke(
            ApiService::Compute,
            CallClass::IdempotentRead,
            "Vnic",
            id,
            ctx,
            || self.api.get_vnic(ctx, id),
        )
        .await
    }

    // =========================================================================
    // Networking
    // =========================================================================

    pub async fn get_subnet(&self, ctx: &CallContext, id: &str) -> Result<Subnet> {
        self.invoke(
            ApiService::Networking,
            CallClass::IdempotentRead,
            "Subnet",
            id,
            ctx,
            || self.api.get_subnet(ctx, id),
        )
        .await
    }

    pub async fn get_security_list(&self, ctx: &CallContext, id: &str) -> Result<SecurityList> {
        self.invoke(
            ApiService::Networking,
            CallClass::IdempotentRead,
            "SecurityList",
            id,
            ctx,
            || self.api.get_security_list(ctx, id),
        )
        .await
    }

    /// Etag-guarded full replacement of a security list's rule sets.
    /// A moved etag surfaces `Conflict` for the caller's read-modify-write loop.
    pub async fn update_security_list(
        &self,
        ctx: &CallContext,
        id: &str,
        if_match: &str,
        ingress: Vec<SecurityRule>,
        egress: Vec<SecurityRule>,
    ) -> Result<SecurityList> {
        self.invoke(
            ApiService::Networking,
            CallClass::NonIdempotentWrite,
            "SecurityList",
            id,
            ctx,
            || {
                self.api
                    .update_security_list(ctx, id, if_match, ingress.clone(), egress.clone())
            },
        )
        .await
    }

    // =========================================================================
    // Block Storage
    // =========================================================================

    pub async fn create_volume(
        &self,
        ctx: &CallContext,
        details: &CreateVolumeDetails,
        client_token: &str,
    ) -> Result<Volume> {
        self.invoke(
            ApiService::BlockStorage,
            CallClass::TokenedWrite,
            "Volume",
            &details.display_name,
            ctx,
            || self.api.create_volume(ctx, details, client_token),
        )
        .await
    }

    pub async fn get_volume(&self, ctx: &CallContext, id: &str) -> Result<Volume> {
        self.invoke(
            ApiService::BlockStorage,
            CallClass::IdempotentRead,
            "Volume",
            id,
            ctx,
            || self.api.get_volume(ctx, id),
        )
        .await
    }

    pub async fn list_volumes(&self, ctx: &CallContext, compartment_id: &str) -> Result<Vec<Volume>> {
        self.invoke(
            ApiService::BlockStorage,
            CallClass::IdempotentRead,
            "Volume",
            compartment_id,
            ctx,
            || self.api.list_volumes(ctx, compartment_id),
        )
        .await
    }

    pub async fn delete_volume(&self, ctx: &CallContext, id: &str) -> Result<()> {
        self.invoke(
            ApiService::BlockStorage,
            CallClass::TokenedWrite,
            "Volume",
            id,
            ctx,
            || self.api.delete_volume(ctx, id),
        )
        .await
    }

    pub async fn attach_volume(
        &self,
        ctx: &CallContext,
        details: &AttachVolumeDetails,
    ) -> Result<VolumeAttachment> {
        self.invoke(
            ApiService::BlockStorage,
            CallClass::NonIdempotentWrite,
            "VolumeAttachment",
            &details.volume_id,
            ctx,
            || self.api.attach_volume(ctx, details),
        )
        .await
    }

    pub async fn get_volume_attachment(
        &self,
        ctx: &CallContext,
        id: &str,
    ) -> Result<VolumeAttachment> {
        self.invoke(
            ApiService::BlockStorage,
            CallClass::IdempotentRead,
            "VolumeAttachment",
            id,
            ctx,
            || self.api.get_volume_attachment(ctx, id),
        )
        .await
    }

    pub async fn list_volume_attachments(
        &self,
        ctx: &CallContext,
        compartment_id: &str,
        volume_id: &str,
    ) -> Result<Vec<VolumeAttachment>> {
        self.invoke(
            ApiService::BlockStorage,
            CallClass::IdempotentRead,
            "VolumeAttachment",
            volume_id,
            ctx,
            || self.api.list_volume_attachments(ctx, compartment_id, volume_id),
        )
        .await
    }

    pub async fn detach_volume(&self, ctx: &CallContext, attachment_id: &str) -> Result<()> {
        self.invoke(
            ApiService::BlockStorage,
            CallClass::TokenedWrite,
            "VolumeAttachment",
            attachment_id,
            ctx,
            || self.api.detach_volume(ctx, attachment_id),
        )
        .await
    }

    // =========================================================================
    // Load Balancer
    // =========================================================================

    pub async fn list_load_balancers(
        &self,
        ctx: &CallContext,
        compartment_id: &str,
    ) -> Result<Vec<LoadBalancer>> {
        self.invoke(
            ApiService::LoadBalancer,
            CallClass::IdempotentRead,
            "LoadBalancer",
            compartment_id,
            ctx,
            || self.api.list_load_balancers(ctx, compartment_id),
        )
        .await
    }

    pub async fn get_load_balancer(&self, ctx: &CallContext, id: &str) -> Result<LoadBalancer> {
        self.invoke(
            ApiService::LoadBalancer,
            CallClass::IdempotentRead,
            "LoadBalancer",
            id,
            ctx,
            || self.api.get_load_balancer(ctx, id),
        )
        .await
    }

    /// Look up a load balancer by its derived display name.
    pub async fn get_load_balancer_by_name(
        &self,
        ctx: &CallContext,
        compartment_id: &str,
        name: &str,
    ) -> Result<Option<LoadBalancer>> {
        let all = self.list_load_balancers(ctx, compartment_id).await?;
        Ok(all.into_iter().find(|lb| lb.display_name == name))
    }

    pub async fn create_load_balancer(
        &self,
        ctx: &CallContext,
        details: &CreateLoadBalancerDetails,
    ) -> Result<String> {
        self.invoke(
            ApiService::LoadBalancer,
            CallClass::NonIdempotentWrite,
            "LoadBalancer",
            &details.display_name,
            ctx,
            || self.api.create_load_balancer(ctx, details),
        )
        .await
    }

    pub async fn delete_load_balancer(&self, ctx: &CallContext, id: &str) -> Result<String> {
        self.invoke(
            ApiService::LoadBalancer,
            CallClass::TokenedWrite,
            "LoadBalancer",
            id,
            ctx,
            || self.api.delete_load_balancer(ctx, id),
        )
        .await
    }

    pub async fn create_backend_set(
        &self,
        ctx: &CallContext,
        lb_id: &str,
        name: &str,
        spec: &BackendSet,
    ) -> Result<String> {
        self.invoke(
            ApiService::LoadBalancer,
            CallClass::NonIdempotentWrite,
            "BackendSet",
            name,
            ctx,
            || self.api.create_backend_set(ctx, lb_id, name, spec),
        )
        .await
    }

    pub async fn update_backend_set(
        &self,
        ctx: &CallContext,
        lb_id: &str,
        name: &str,
        spec: &BackendSet,
    ) -> Result<String> {
        self.invoke(
            ApiService::LoadBalancer,
            CallClass::NonIdempotentWrite,
            "BackendSet",
            name,
            ctx,
            || self.api.update_backend_set(ctx, lb_id, name, spec),
        )
        .await
    }

    pub async fn delete_backend_set(
        &self,
        ctx: &CallContext,
        lb_id: &str,
        name: &str,
    ) -> Result<String> {
        self.invoke(
            ApiService::LoadBalancer,
            CallClass::TokenedWrite,
            "BackendSet",
            name,
            ctx,
            || self.api.delete_backend_set(ctx, lb_id, name),
        )
        .await
    }

    pub async fn create_listener(
        &self,
        ctx: &CallContext,
        lb_id: &str,
        name: &str,
        spec: &Listener,
    ) -> Result<String> {
        self.invoke(
            ApiService::LoadBalancer,
            CallClass::NonIdempotentWrite,
            "Listener",
            name,
            ctx,
            || self.api.create_listener(ctx, lb_id, name, spec),
        )
        .await
    }

    pub async fn update_listener(
        &self,
        ctx: &CallContext,
        lb_id: &str,
        name: &str,
        spec: &Listener,
    ) -> Result<String> {
        self.invoke(
            ApiService::LoadBalancer,
            CallClass::NonIdempotentWrite,
            "Listener",
            name,
            ctx,
            || self.api.update_listener(ctx, lb_id, name, spec),
        )
        .await
    }

    pub async fn delete_listener(
        &self,
        ctx: &CallContext,
        lb_id: &str,
        name: &str,
    ) -> Result<String> {
        self.invoke(
            ApiService::LoadBalancer,
            CallClass::TokenedWrite,
            "Listener",
            name,
            ctx,
            || self.api.delete_listener(ctx, lb_id, name),
        )
        .await
    }

    pub async fn create_certificate(
        &self,
        ctx: &CallContext,
        lb_id: &str,
        cert: &Certificate,
    ) -> Result<String> {
        self.invoke(
            ApiService::LoadBalancer,
            CallClass::NonIdempotentWrite,
            "Certificate",
            &cert.certificate_name,
            ctx,
            || self.api.create_certificate(ctx, lb_id, cert),
        )
        .await
    }

    pub async fn delete_certificate(
        &self,
        ctx: &CallContext,
        lb_id: &str,
        name: &str,
    ) -> Result<String> {
        self.invoke(
            ApiService::LoadBalancer,
            CallClass::TokenedWrite,
            "Certificate",
            name,
            ctx,
            || self.api.delete_certificate(ctx, lb_id, name),
        )
        .await
    }

    // =========================================================================
    // Identity
    // =========================================================================

    pub async fn list_availability_domains(
        &self,
        ctx: &CallContext,
        compartment_id: &str,
    ) -> Result<Vec<AvailabilityDomain>> {
        self.invoke(
            ApiService::Identity,
            CallClass::IdempotentRead,
            "AvailabilityDomain",
            compartment_id,
            ctx,
            || self.api.list_availability_domains(ctx, compartment_id),
        )
        .await
    }

    pub async fn get_compartment(&self, ctx: &CallContext, id: &str) -> Result<Compartment> {
        self.invoke(
            ApiService::Identity,
            CallClass::IdempotentRead,
            "Compartment",
            id,
            ctx,
            || self.api.get_compartment(ctx, id),
        )
        .await
    }
}
