//! Domain Ports - trait seams to the host platform and the node OS
//!
//! These traits define the boundaries between the control loops and their
//! external collaborators: the orchestrator's object store, its event sink,
//! and the node-local mount/iSCSI tooling driven during volume staging.

use crate::error::Result;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

// =============================================================================
// Orchestrator Ports
// =============================================================================

/// Read access to versioned object snapshots held by the host platform.
///
/// Backed by the orchestrator's informer cache in production; a later version
/// of an object always wins over earlier state.
#[async_trait]
pub trait ObjectSource<T>: Send + Sync {
    /// Fetch the current snapshot of one object by key
    async fn get(&self, key: &str) -> Result<Option<T>>;

    /// List current snapshots of all objects
    async fn list(&self) -> Result<Vec<T>>;
}

/// Emits user-visible events against orchestrator objects.
pub trait EventRecorder: Send + Sync {
    /// Record an event; `object` is the `namespace/name` identity
    fn event(&self, object: &str, reason: &str, message: &str);
}

// =============================================================================
// Node OS Ports
// =============================================================================

/// Filesystem mount operations on the local node.
#[async_trait]
pub trait Mounter: Send + Sync {
    /// Whether the device already carries a filesystem
    async fn has_filesystem(&self, device: &str) -> Result<bool>;

    /// Create `fs_type` on the device and mount it at `target`
    async fn format_and_mount(
        &self,
        device: &str,
        target: &str,
        fs_type: &str,
        options: &[String],
    ) -> Result<()>;

    /// Mount an existing filesystem at `target`
    async fn mount(&self, device: &str, target: &str, fs_type: &str, options: &[String])
        -> Result<()>;

    /// Bind-mount `source` onto `target`
    async fn bind_mount(&self, source: &str, target: &str) -> Result<()>;

    /// Unmount `target`
    async fn unmount(&self, target: &str) -> Result<()>;

    /// Mount points currently backed by the device
    async fn mount_points(&self, device: &str) -> Result<Vec<String>>;
}

/// iSCSI initiator administration on the local node.
#[async_trait]
pub trait IscsiAdmin: Send + Sync {
    async fn login(&self, iqn: &str, ipv4: &str, port: u16) -> Result<()>;

    async fn logout(&self, iqn: &str, ipv4: &str, port: u16) -> Result<()>;

    /// Store CHAP credentials for the target before login
    async fn set_chap(&self, iqn: &str, username: &str, secret: &str) -> Result<()>;
}

/// Resolves attached cloud volumes to local block-device paths.
#[async_trait]
pub trait DeviceResolver: Send + Sync {
    /// Device node behind the predictable iSCSI by-path symlink, if present
    async fn device_by_path(&self, iqn: &str, ipv4: &str, port: u16) -> Result<Option<String>>;

    /// Device node whose serial matches, if present (paravirtualized)
    async fn device_by_serial(&self, serial: &str) -> Result<Option<String>>;
}

/// Poll a resolver until a device appears or the wait budget runs out.
pub async fn wait_for_device<F, Fut>(mut probe: F, timeout: Duration) -> Result<Option<String>>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<Option<String>>>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if let Some(dev) = probe().await? {
            return Ok(Some(dev));
        }
        if tokio::time::Instant::now() >= deadline {
            return Ok(None);
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
}

// =============================================================================
// Type Aliases for Arc'd Traits
// =============================================================================

pub type ObjectSourceRef<T> = Arc<dyn ObjectSource<T>>;
pub type EventRecorderRef = Arc<dyn EventRecorder>;
pub type MounterRef = Arc<dyn Mounter>;
pub type IscsiAdminRef = Arc<dyn IscsiAdmin>;
pub type DeviceResolverRef = Arc<dyn DeviceResolver>;
