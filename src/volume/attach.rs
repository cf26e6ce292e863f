//! Node-side volume attachment and staging
//!
//! Runs on each node: attach the cloud volume to this instance, surface it as
//! a local block device (iSCSI login or paravirtualized passthrough), stage a
//! filesystem on it, and bind-mount the staged filesystem into workload
//! targets. Every volume operation holds the per-volume lock so attach,
//! detach and delete never interleave for one volume.

use crate::client::types::*;
use crate::client::{CallContext, CloudClient};
use crate::domain::{
    wait_for_device, DeviceResolverRef, IscsiAdminRef, MounterRef,
};
use crate::error::{Error, Result};
use crate::locks::VolumeLocks;
use crate::metrics::{dimensions, Metric, MetricSink};
use std::time::Duration;
use tracing::{debug, info};

/// Budget for the block device to appear after attachment
const DEVICE_WAIT_TIMEOUT: Duration = Duration::from_secs(60);

/// Poll interval while an attachment settles
const ATTACHMENT_POLL_BASE: Duration = Duration::from_secs(1);
const ATTACHMENT_POLL_CAP: Duration = Duration::from_secs(10);

/// Metric dimension naming this component
const COMPONENT: &str = "node-volume-manager";

pub struct NodeVolumeManager {
    client: CloudClient,
    locks: VolumeLocks,
    mounter: MounterRef,
    iscsi: IscsiAdminRef,
    resolver: DeviceResolverRef,
    /// OCID of the instance this manager runs on
    instance_id: String,
    compartment_id: String,
    metrics: MetricSink,
}

impl NodeVolumeManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        client: CloudClient,
        locks: VolumeLocks,
        mounter: MounterRef,
        iscsi: IscsiAdminRef,
        resolver: DeviceResolverRef,
        instance_id: &str,
        compartment_id: &str,
        metrics: MetricSink,
    ) -> Self {
        Self {
            client,
            locks,
            mounter,
            iscsi,
            resolver,
            instance_id: instance_id.to_string(),
            compartment_id: compartment_id.to_string(),
            metrics,
        }
    }

    /// Attach the volume to this instance and mount its filesystem at
    /// `staging_path`, formatting a fresh volume on first use.
    pub async fn stage(
        &self,
        ctx: &CallContext,
        volume_id: &str,
        fs_type: &str,
        staging_path: &str,
        attachment_type: AttachmentType,
    ) -> Result<()> {
        match self
            .stage_inner(ctx, volume_id, fs_type, staging_path, attachment_type)
            .await
        {
            Ok(()) => {
                self.metrics
                    .emit(Metric::PvAttachSuccess, dimensions(COMPONENT, volume_id));
                Ok(())
            }
            Err(e) => {
                self.metrics
                    .emit(Metric::PvAttachFailure, dimensions(COMPONENT, volume_id));
                Err(e)
            }
        }
    }

    async fn stage_inner(
        &self,
        ctx: &CallContext,
        volume_id: &str,
        fs_type: &str,
        staging_path: &str,
        attachment_type: AttachmentType,
    ) -> Result<()> {
        let _guard = self.locks.try_acquire(volume_id)?;

        let attachment = self.ensure_attached(ctx, volume_id, attachment_type).await?;
        let device = self.surface_device(&attachment).await?;

        if self.mounter.has_filesystem(&device).await? {
            self.mounter.mount(&device, staging_path, fs_type, &[]).await?;
        } else {
            self.mounter
                .format_and_mount(&device, staging_path, fs_type, &[])
                .await?;
        }
        info!(volume_id, device = %device, staging_path, "volume staged");
        Ok(())
    }

    /// Unmount the staged filesystem and log out of the iSCSI session once no
    /// mount remains. The cloud attachment stays in place for [`Self::detach`].
    pub async fn unstage(&self, ctx: &CallContext, volume_id: &str, staging_path: &str) -> Result<()> {
        let _guard = self.locks.try_acquire(volume_id)?;

        self.mounter.unmount(staging_path).await?;

        if let Some(attachment) = self.find_attachment(ctx, volume_id).await? {
            if attachment.attachment_type == AttachmentType::Iscsi {
                let (iqn, ipv4, port) = iscsi_target(&attachment)?;
                let device = self
                    .resolver
                    .device_by_path(&iqn, &ipv4, port)
                    .await?;
                let busy = match &device {
                    Some(dev) => !self.mounter.mount_points(dev).await?.is_empty(),
                    None => false,
                };
                if !busy {
                    self.iscsi.logout(&iqn, &ipv4, port).await?;
                    debug!(volume_id, iqn = %iqn, "iscsi session closed");
                }
            }
        }
        info!(volume_id, staging_path, "volume unstaged");
        Ok(())
    }

    /// Detach the volume from this instance and wait until the cloud reports
    /// it detached. A volume with no attachment to this instance is a no-op.
    pub async fn detach(&self, ctx: &CallContext, volume_id: &str) -> Result<()> {
        match self.detach_inner(ctx, volume_id).await {
            Ok(()) => {
                self.metrics
                    .emit(Metric::PvDetachSuccess, dimensions(COMPONENT, volume_id));
                Ok(())
            }
            Err(e) => {
                self.metrics
                    .emit(Metric::PvDetachFailure, dimensions(COMPONENT, volume_id));
                Err(e)
            }
        }
    }

    async fn detach_inner(&self, ctx: &CallContext, volume_id: &str) -> Result<()> {
        let _guard = self.locks.try_acquire(volume_id)?;

        let Some(attachment) = self.find_attachment(ctx, volume_id).await? else {
            debug!(volume_id, "no attachment to this instance");
            return Ok(());
        };
        match self.client.detach_volume(ctx, &attachment.id).await {
            Ok(()) | Err(Error::NotFound { .. }) => {}
            Err(e) => return Err(e),
        }
        self.await_attachment_state(ctx, &attachment.id, AttachmentState::Detached)
            .await?;
        info!(volume_id, attachment_id = %attachment.id, "volume detached");
        Ok(())
    }

    /// Bind-mount the staged filesystem into a workload target.
    pub async fn publish(&self, staging_path: &str, target_path: &str) -> Result<()> {
        self.mounter.bind_mount(staging_path, target_path).await
    }

    pub async fn unpublish(&self, target_path: &str) -> Result<()> {
        self.mounter.unmount(target_path).await
    }

    // =========================================================================
    // Internals
    // =========================================================================

    async fn find_attachment(
        &self,
        ctx: &CallContext,
        volume_id: &str,
    ) -> Result<Option<VolumeAttachment>> {
        let attachments = self
            .client
            .list_volume_attachments(ctx, &self.compartment_id, volume_id)
            .await?;
        Ok(attachments.into_iter().find(|a| {
            a.instance_id == self.instance_id && a.lifecycle_state != AttachmentState::Detached
        }))
    }

    /// Reuse a live attachment to this instance or create one; a live
    /// attachment to a different instance blocks the stage.
    async fn ensure_attached(
        &self,
        ctx: &CallContext,
        volume_id: &str,
        attachment_type: AttachmentType,
    ) -> Result<VolumeAttachment> {
        let attachments = self
            .client
            .list_volume_attachments(ctx, &self.compartment_id, volume_id)
            .await?;
        for attachment in attachments {
            if attachment.lifecycle_state == AttachmentState::Detached {
                continue;
            }
            if attachment.instance_id == self.instance_id {
                debug!(volume_id, attachment_id = %attachment.id, "reusing attachment");
                return self
                    .await_attachment_state(ctx, &attachment.id, AttachmentState::Attached)
                    .await;
            }
            return Err(Error::conflict(format!(
                "volume {} is attached to instance {}",
                volume_id, attachment.instance_id
            )));
        }

        let attachment = self
            .client
            .attach_volume(
                ctx,
                &AttachVolumeDetails {
                    volume_id: volume_id.to_string(),
                    instance_id: self.instance_id.clone(),
                    attachment_type,
                    is_read_only: false,
                },
            )
            .await?;
        self.await_attachment_state(ctx, &attachment.id, AttachmentState::Attached)
            .await
    }

    async fn await_attachment_state(
        &self,
        ctx: &CallContext,
        attachment_id: &str,
        want: AttachmentState,
    ) -> Result<VolumeAttachment> {
        let mut delay = ATTACHMENT_POLL_BASE;
        loop {
            let attachment = self.client.get_volume_attachment(ctx, attachment_id).await?;
            if attachment.lifecycle_state == want {
                return Ok(attachment);
            }
            if ctx.expired() {
                return Err(Error::try_again(format!(
                    "attachment {} still {:?} at deadline",
                    attachment_id, attachment.lifecycle_state
                )));
            }
            tokio::time::sleep(delay.min(ctx.remaining())).await;
            delay = (delay * 2).min(ATTACHMENT_POLL_CAP);
        }
    }

    /// Surface the attachment as a local block device path.
    async fn surface_device(&self, attachment: &VolumeAttachment) -> Result<String> {
        match attachment.attachment_type {
            AttachmentType::Iscsi => {
                let (iqn, ipv4, port) = iscsi_target(attachment)?;
                if let (Some(user), Some(secret)) =
                    (&attachment.chap_username, &attachment.chap_secret)
                {
                    self.iscsi.set_chap(&iqn, user, secret).await?;
                }
                self.iscsi.login(&iqn, &ipv4, port).await?;
                let resolver = self.resolver.clone();
                wait_for_device(
                    || {
                        let resolver = resolver.clone();
                        let iqn = iqn.clone();
                        let ipv4 = ipv4.clone();
                        async move { resolver.device_by_path(&iqn, &ipv4, port).await }
                    },
                    DEVICE_WAIT_TIMEOUT,
                )
                .await?
                .ok_or_else(|| Error::DeviceNotFound {
                    volume_id: attachment.volume_id.clone(),
                    reason: format!("no device behind iscsi target {}", iqn),
                })
            }
            AttachmentType::Paravirtualized => {
                if let Some(device) = &attachment.device {
                    return Ok(device.clone());
                }
                let resolver = self.resolver.clone();
                let serial = attachment.id.clone();
                wait_for_device(
                    || {
                        let resolver = resolver.clone();
                        let serial = serial.clone();
                        async move { resolver.device_by_serial(&serial).await }
                    },
                    DEVICE_WAIT_TIMEOUT,
                )
                .await?
                .ok_or_else(|| Error::DeviceNotFound {
                    volume_id: attachment.volume_id.clone(),
                    reason: "no paravirtualized device reported".into(),
                })
            }
        }
    }
}

fn iscsi_target(attachment: &VolumeAttachment) -> Result<(String, String, u16)> {
    match (&attachment.iqn, &attachment.ipv4, attachment.port) {
        (Some(iqn), Some(ipv4), Some(port)) => Ok((iqn.clone(), ipv4.clone(), port)),
        _ => Err(Error::DeviceNotFound {
            volume_id: attachment.volume_id.clone(),
            reason: format!("attachment {} has no iscsi target details", attachment.id),
        }),
    }
}
