//! Raw cloud API surface
//!
//! Trait definitions for the typed OCI transport, grouped by service the way
//! the cloud groups its endpoints. Implementations (the signed SDK transport
//! in production, [`crate::client::fake::FakeCloud`] in tests) perform a
//! single call attempt; retry, rate limiting and error classification live in
//! [`crate::client::CloudClient`].

use super::types::*;
use async_trait::async_trait;
use reqwest::StatusCode;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

// =============================================================================
// Call Context
// =============================================================================

/// Per-call cancellation, deadline and request-id propagation.
#[derive(Debug, Clone)]
pub struct CallContext {
    /// `opc-request-id` sent with every attempt of this call
    pub request_id: String,
    pub deadline: Instant,
    pub cancel: CancellationToken,
}

impl CallContext {
    pub fn new(timeout: Duration, cancel: CancellationToken) -> Self {
        Self {
            request_id: new_request_id(),
            deadline: Instant::now() + timeout,
            cancel,
        }
    }

    /// Context with the default five-minute operation budget.
    pub fn background() -> Self {
        Self::new(Duration::from_secs(300), CancellationToken::new())
    }

    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    pub fn expired(&self) -> bool {
        self.cancel.is_cancelled() || Instant::now() >= self.deadline
    }
}

/// Fresh random request id in the cloud's 32-hex-digit format.
pub fn new_request_id() -> String {
    format!("{:032X}", rand::random::<u128>())
}

// =============================================================================
// Cloud Error
// =============================================================================

/// A single failed call attempt, before classification.
#[derive(Debug, Clone)]
pub struct CloudError {
    /// HTTP status, when a response was received
    pub status: Option<StatusCode>,
    /// Service error code from the response body, e.g. `LimitExceeded`
    pub code: Option<String>,
    pub message: String,
    /// `opc-request-id` echoed by the server, when one was received
    pub request_id: Option<String>,
}

impl CloudError {
    pub fn transport(message: impl Into<String>) -> Self {
        Self {
            status: None,
            code: None,
            message: message.into(),
            request_id: None,
        }
    }

    pub fn http(status: StatusCode, code: Option<&str>, message: impl Into<String>) -> Self {
        Self {
            status: Some(status),
            code: code.map(str::to_string),
            message: message.into(),
            request_id: None,
        }
    }

    pub fn with_request_id(mut self, request_id: &str) -> Self {
        self.request_id = Some(request_id.to_string());
        self
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::http(StatusCode::NOT_FOUND, Some("NotAuthorizedOrNotFound"), message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::http(StatusCode::CONFLICT, Some("Conflict"), message)
    }

    pub fn precondition_failed(message: impl Into<String>) -> Self {
        Self::http(StatusCode::PRECONDITION_FAILED, Some("NoEtagMatch"), message)
    }

    /// Whether the request demonstrably reached the server. Non-idempotent
    /// writes may only be retried when this is false.
    pub fn received_by_server(&self) -> bool {
        self.status.is_some() || self.request_id.is_some()
    }

    pub fn is_throttle(&self) -> bool {
        self.status == Some(StatusCode::TOO_MANY_REQUESTS)
    }

    pub fn is_quota(&self) -> bool {
        self.is_throttle()
            && matches!(
                self.code.as_deref(),
                Some("LimitExceeded") | Some("QuotaExceeded")
            )
    }

    pub fn is_server_error(&self) -> bool {
        self.status.map(|s| s.is_server_error()).unwrap_or(false)
    }

    pub fn is_not_found(&self) -> bool {
        self.status == Some(StatusCode::NOT_FOUND)
    }

    pub fn is_conflict(&self) -> bool {
        matches!(
            self.status,
            Some(StatusCode::CONFLICT) | Some(StatusCode::PRECONDITION_FAILED)
        )
    }
}

impl std::fmt::Display for CloudError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.status, self.code.as_deref()) {
            (Some(s), Some(c)) => write!(f, "{} ({}): {}", s, c, self.message),
            (Some(s), None) => write!(f, "{}: {}", s, self.message),
            _ => write!(f, "transport error: {}", self.message),
        }
    }
}

impl std::error::Error for CloudError {}

pub type ApiResult<T> = std::result::Result<T, CloudError>;

// =============================================================================
// Service Traits
// =============================================================================

/// Compute: instance reads and VNIC attachment discovery.
#[async_trait]
pub trait ComputeApi: Send + Sync {
    async fn get_instance(&self, ctx: &CallContext, id: &str) -> ApiResult<Instance>;

    async fn list_vnic_attachments(
        &self,
        ctx: &CallContext,
        compartment_id: &str,
        instance_id: &str,
    ) -> ApiResult<Vec<VnicAttachment>>;

    async fn get_vnic(&self, ctx: &CallContext, id: &str) -> ApiResult<Vnic>;
}

/// Networking: subnets and security-list read-modify-write.
#[async_trait]
pub trait NetworkingApi: Send + Sync {
    async fn get_subnet(&self, ctx: &CallContext, id: &str) -> ApiResult<Subnet>;

    async fn get_security_list(&self, ctx: &CallContext, id: &str) -> ApiResult<SecurityList>;

    /// Replaces the full rule sets, guarded by `if_match` etag.
    async fn update_security_list(
        &self,
        ctx: &CallContext,
        id: &str,
        if_match: &str,
        ingress: Vec<SecurityRule>,
        egress: Vec<SecurityRule>,
    ) -> ApiResult<SecurityList>;
}

/// Block storage: volume and attachment CRUD.
#[async_trait]
pub trait BlockStorageApi: Send + Sync {
    /// `client_token` makes retried submissions collapse server-side.
    async fn create_volume(
        &self,
        ctx: &CallContext,
        details: &CreateVolumeDetails,
        client_token: &str,
    ) -> ApiResult<Volume>;

    async fn get_volume(&self, ctx: &CallContext, id: &str) -> ApiResult<Volume>;

    async fn list_volumes(&self, ctx: &CallContext, compartment_id: &str) -> ApiResult<Vec<Volume>>;

    async fn delete_volume(&self, ctx: &CallContext, id: &str) -> ApiResult<()>;

    async fn attach_volume(
        &self,
        ctx: &CallContext,
        details: &AttachVolumeDetails,
    ) -> ApiResult<VolumeAttachment>;

    async fn get_volume_attachment(&self, ctx: &CallContext, id: &str)
        -> ApiResult<VolumeAttachment>;

    async fn list_volume_attachments(
        &self,
        ctx: &CallContext,
        compartment_id: &str,
        volume_id: &str,
    ) -> ApiResult<Vec<VolumeAttachment>>;

    async fn detach_volume(&self, ctx: &CallContext, attachment_id: &str) -> ApiResult<()>;
}

/// Load balancer: LB, listener, backend-set and certificate CRUD.
///
/// Every mutation returns a work-request id to be driven to completion via
/// [`LoadBalancerApi::get_work_request`].
#[async_trait]
pub trait LoadBalancerApi: Send + Sync {
    async fn list_load_balancers(
        &self,
        ctx: &CallContext,
        compartment_id: &str,
    ) -> ApiResult<Vec<LoadBalancer>>;

    async fn get_load_balancer(&self, ctx: &CallContext, id: &str) -> ApiResult<LoadBalancer>;

    async fn create_load_balancer(
        &self,
        ctx: &CallContext,
        details: &CreateLoadBalancerDetails,
    ) -> ApiResult<String>;

    async fn delete_load_balancer(&self, ctx: &CallContext, id: &str) -> ApiResult<String>;

    async fn create_backend_set(
        &self,
        ctx: &CallContext,
        lb_id: &str,
        name: &str,
        spec: &BackendSet,
    ) -> ApiResult<String>;

    async fn update_backend_set(
        &self,
        ctx: &CallContext,
        lb_id: &str,
        name: &str,
        spec: &BackendSet,
    ) -> ApiResult<String>;

    async fn delete_backend_set(&self, ctx: &CallContext, lb_id: &str, name: &str)
        -> ApiResult<String>;

    async fn create_listener(
        &self,
        ctx: &CallContext,
        lb_id: &str,
        name: &str,
        spec: &Listener,
    ) -> ApiResult<String>;

    async fn update_listener(
        &self,
        ctx: &CallContext,
        lb_id: &str,
        name: &str,
        spec: &Listener,
    ) -> ApiResult<String>;

    async fn delete_listener(&self, ctx: &CallContext, lb_id: &str, name: &str)
        -> ApiResult<String>;

    async fn create_certificate(
        &self,
        ctx: &CallContext,
        lb_id: &str,
        cert: &Certificate,
    ) -> ApiResult<String>;

    async fn delete_certificate(
        &self,
        ctx: &CallContext,
        lb_id: &str,
        name: &str,
    ) -> ApiResult<String>;

    async fn get_work_request(&self, ctx: &CallContext, id: &str) -> ApiResult<WorkRequest>;
}

/// Identity: compartment and availability-domain reads.
#[async_trait]
pub trait IdentityApi: Send + Sync {
    async fn list_availability_domains(
        &self,
        ctx: &CallContext,
        compartment_id: &str,
    ) -> ApiResult<Vec<AvailabilityDomain>>;

    async fn get_compartment(&self, ctx: &CallContext, id: &str) -> ApiResult<Compartment>;
}

/// The full transport, one trait object for the whole cloud.
pub trait CloudApi:
    ComputeApi + NetworkingApi + BlockStorageApi + LoadBalancerApi + IdentityApi
{
}

impl<T> CloudApi for T where
    T: ComputeApi + NetworkingApi + BlockStorageApi + LoadBalancerApi + IdentityApi
{
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_received_by_server() {
        assert!(!CloudError::transport("connection refused").received_by_server());
        assert!(CloudError::not_found("no such volume").received_by_server());
        assert!(CloudError::transport("reset mid-response")
            .with_request_id("req-1")
            .received_by_server());
    }

    #[test]
    fn test_quota_detection() {
        let quota = CloudError::http(
            StatusCode::TOO_MANY_REQUESTS,
            Some("LimitExceeded"),
            "lb limit reached",
        );
        assert!(quota.is_quota());

        let throttle = CloudError::http(StatusCode::TOO_MANY_REQUESTS, Some("TooManyRequests"), "");
        assert!(throttle.is_throttle());
        assert!(!throttle.is_quota());
    }

    #[test]
    fn test_request_id_format() {
        let id = new_request_id();
        assert_eq!(id.len(), 32);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
