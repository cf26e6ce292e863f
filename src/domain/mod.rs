//! Core domain types and ports
//!
//! Orchestrator-facing records and the trait seams behind which the host
//! platform, the node OS and the CSI adapter live.

pub mod ports;
pub mod types;

pub use ports::{
    wait_for_device, DeviceResolver, DeviceResolverRef, EventRecorder, EventRecorderRef,
    IscsiAdmin, IscsiAdminRef, Mounter, MounterRef, ObjectSource, ObjectSourceRef,
};
pub use types::{
    NodeSpec, PersistentVolume, Protocol, ReclaimPolicy, ServicePort, ServiceSpec,
    SessionAffinity, Taint, TrafficPolicy, VolumeClaim,
};
