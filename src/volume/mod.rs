//! Block-volume provisioning and node attachment
//!
//! [`provisioner::VolumeProvisioner`] owns the claim-to-volume lifecycle in
//! the cloud; [`attach::NodeVolumeManager`] runs on each node and drives
//! attach, stage, publish and their inverses against the local OS.

pub mod attach;
pub mod provisioner;

pub use attach::NodeVolumeManager;
pub use provisioner::VolumeProvisioner;
