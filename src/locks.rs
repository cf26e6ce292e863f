//! Per-volume operation locks
//!
//! Attach, detach and delete must never run concurrently for the same
//! volume. Acquisition is non-blocking: a second caller gets
//! [`Error::AlreadyInProgress`] and is expected to requeue rather than wait.

use crate::error::{Error, Result};
use dashmap::DashMap;
use std::sync::Arc;
use tracing::trace;

#[derive(Clone, Default)]
pub struct VolumeLocks {
    held: Arc<DashMap<String, ()>>,
}

impl VolumeLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the lock for `volume_id`, or fail immediately when another
    /// operation holds it. The returned guard releases on drop.
    pub fn try_acquire(&self, volume_id: &str) -> Result<VolumeLockGuard> {
        match self.held.entry(volume_id.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(Error::AlreadyInProgress {
                volume_id: volume_id.to_string(),
            }),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(());
                trace!(volume_id, "volume lock acquired");
                Ok(VolumeLockGuard {
                    held: Arc::clone(&self.held),
                    volume_id: volume_id.to_string(),
                })
            }
        }
    }

    pub fn is_held(&self, volume_id: &str) -> bool {
        self.held.contains_key(volume_id)
    }
}

#[derive(Debug)]
pub struct VolumeLockGuard {
    held: Arc<DashMap<String, ()>>,
    volume_id: String,
}

impl Drop for VolumeLockGuard {
    fn drop(&mut self) {
        self.held.remove(&self.volume_id);
        trace!(volume_id = %self.volume_id, "volume lock released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_second_acquire_fails_fast() {
        let locks = VolumeLocks::new();
        let _guard = locks.try_acquire("ocid1.volume.oc1..v1").unwrap();
        assert_matches!(
            locks.try_acquire("ocid1.volume.oc1..v1"),
            Err(Error::AlreadyInProgress { volume_id }) if volume_id == "ocid1.volume.oc1..v1"
        );
    }

    #[test]
    fn test_distinct_volumes_do_not_contend() {
        let locks = VolumeLocks::new();
        let _a = locks.try_acquire("v1").unwrap();
        let _b = locks.try_acquire("v2").unwrap();
        assert!(locks.is_held("v1"));
        assert!(locks.is_held("v2"));
    }

    #[test]
    fn test_drop_releases() {
        let locks = VolumeLocks::new();
        {
            let _guard = locks.try_acquire("v1").unwrap();
            assert!(locks.is_held("v1"));
        }
        assert!(!locks.is_held("v1"));
        locks.try_acquire("v1").unwrap();
    }
}
