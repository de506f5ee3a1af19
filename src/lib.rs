//! stackbd - layered block device processing engine
//!
//! Satellite-side engine that converges stacks of block device layers
//! (DRBD replication, LUKS encryption, dm-writecache, NVMe-oF) over
//! physical storage providers (LVM, ZFS, SPDK) towards the state a
//! controller describes.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      DeviceProcessor                        │
//! │   size negotiation → prepare → snapshots(del) → process →   │
//! │   snapshots(new) → notifications → free-space report        │
//! ├─────────────────────────────────────────────────────────────┤
//! │                       LayerRegistry                         │
//! │  ┌───────┐ ┌──────┐ ┌────────────┐ ┌──────┐ ┌────────────┐  │
//! │  │ DRBD  │ │ LUKS │ │ Writecache │ │ NVMe │ │  Storage   │  │
//! │  └───┬───┘ └──┬───┘ └─────┬──────┘ └──┬───┘ └─────┬──────┘  │
//! │      └────────┴───────────┴───────────┴───────────┘         │
//! │            recursive processing over the LayerTree          │
//! ├─────────────────────────────────────────────────────────────┤
//! │                      Tool adapters                          │
//! │   lvm · zfs/zpool · rpc.py · cryptsetup · dmsetup ·         │
//! │   drbdadm/drbdsetup/drbdmeta · nvme-cli                     │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`tree`]: per-resource layer node trees and volume data
//! - [`layers`]: the [`layers::DeviceLayer`] contract and its implementations
//! - [`adapters`]: external tool wrappers with enforced timeouts
//! - [`orchestrator`]: the batch processing pass
//! - [`shipping`]: snapshot shipping worker supervision
//! - [`sizes`], [`props`], [`batch`], [`error`]: shared building blocks

pub mod adapters;
pub mod batch;
pub mod error;
pub mod layers;
pub mod orchestrator;
pub mod props;
pub mod shipping;
pub mod sizes;
pub mod tree;

// Re-export commonly used types
pub use batch::{BatchContext, PoolCapacity};
pub use error::{Error, ErrorDisposition, Result};
pub use layers::{
    DeviceLayer, LayerKind, LayerRegistry, LogNotifier, NotificationSink, ProcessResult,
    ResponseEntry, ResponseSink, Severity, UsageNotification,
};
pub use layers::drbd::{DrbdAdmOps, DrbdLayer, DrbdOps};
pub use layers::luks::{CryptOps, CryptsetupOps, LuksLayer};
pub use layers::nvme::{NvmeCliOps, NvmeLayer, NvmeOps};
pub use layers::storage::{
    lvm::LvmProvider, spdk::SpdkProvider, zfs::ZfsProvider, LvInfo, PoolInfo, ProviderOps,
    SnapshotPhase, StorageLayer,
};
pub use layers::writecache::{DmOps, DmsetupOps, WritecacheLayer};
pub use orchestrator::{BatchReport, DeviceProcessor};
pub use shipping::{GroupResult, ShippingJob, ShippingOutcome, SnapshotShippingManager};
pub use tree::{
    DrbdResourceDef, LayerNode, LayerTree, NodeId, NvmeTargetDef, ProviderKind, Resource,
    ResourceFlags, Snapshot, SnapshotFlags, SnapshotVolume, VolumeData, VolumeDefinition,
    VolumeFlags, VolumeState,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
