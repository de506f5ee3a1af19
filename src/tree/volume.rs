//! Volume layer data
//!
//! Each layer node carries one [`VolumeData`] per volume number: the common
//! size/existence bookkeeping in [`VolumeState`] plus a [`LayerPayload`]
//! variant specific to the layer kind.

use crate::error::{Error, Result};
use crate::sizes::SizeState;
use serde::{Deserialize, Serialize};

// =============================================================================
// Common state
// =============================================================================

/// Fields shared by every layer kind.
///
/// `exists == false` implies `device_path == None`; `allocated_kib` is only
/// meaningful while the backing object exists.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VolumeState {
    pub exists: bool,
    pub failed: bool,
    pub device_path: Option<String>,
    pub allocated_kib: u64,
    pub usable_kib: u64,
    /// Size this layer is expected to allocate below, set by the downward
    /// size negotiation before discovery
    pub expected_kib: u64,
    pub size_state: Option<SizeState>,
    /// Name of the underlying OS object (LV name, dm name, ...)
    pub identifier: String,
}

impl VolumeState {
    pub fn set_exists(&mut self, exists: bool) {
        self.exists = exists;
        if !exists {
            self.device_path = None;
            self.size_state = None;
        }
    }
}

// =============================================================================
// Provider kinds
// =============================================================================

/// Physical storage provider families
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Lvm,
    LvmThin,
    Zfs,
    ZfsThin,
    Spdk,
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProviderKind::Lvm => write!(f, "lvm"),
            ProviderKind::LvmThin => write!(f, "lvm-thin"),
            ProviderKind::Zfs => write!(f, "zfs"),
            ProviderKind::ZfsThin => write!(f, "zfs-thin"),
            ProviderKind::Spdk => write!(f, "spdk"),
        }
    }
}

// =============================================================================
// Per-kind payloads
// =============================================================================

/// DRBD-specific volume data
#[derive(Debug, Clone, Default)]
pub struct DrbdVlm {
    pub minor: u32,
    /// Last disk state reported by drbdsetup ("UpToDate", "Inconsistent", ...)
    pub disk_state: Option<String>,
    /// Local resource role ("Primary"/"Secondary") at the last status query
    pub role: Option<String>,
    /// Whether DRBD would currently allow a promotion to Primary
    pub may_promote: bool,
    /// Metadata verified or created during this pass
    pub has_meta_data: bool,
}

/// LUKS-specific volume data
#[derive(Debug, Clone, Default)]
pub struct LuksVlm {
    /// Decrypted key material; volatile, never persisted
    pub key: Option<Vec<u8>>,
    /// A LUKS volume can exist on disk but not be mapped
    pub opened: bool,
    pub formatted: bool,
}

/// Write-cache-specific volume data
#[derive(Debug, Clone, Default)]
pub struct WritecacheVlm {
    /// Whether the cache device is driven in persistent-memory mode
    pub pmem_mode: bool,
    /// Whether the dm device is currently held suspended
    pub suspended: bool,
}

/// NVMe/Openflex-specific volume data
#[derive(Debug, Clone, Default)]
pub struct NvmeVlm {
    pub connected: bool,
}

/// Storage-provider-specific volume data
#[derive(Debug, Clone)]
pub struct StorageVlm {
    /// Volume group, zpool (possibly with dataset path) or SPDK lvol store
    pub pool: String,
    pub provider: ProviderKind,
    /// Allocation extent of the pool, filled during discovery
    pub extent_kib: u64,
}

/// Closed set of per-layer-kind payloads
#[derive(Debug, Clone)]
pub enum LayerPayload {
    Drbd(DrbdVlm),
    Luks(LuksVlm),
    Writecache(WritecacheVlm),
    Nvme(NvmeVlm),
    Openflex(NvmeVlm),
    Storage(StorageVlm),
}

// =============================================================================
// Volume data
// =============================================================================

/// Common state plus the layer-kind payload
#[derive(Debug, Clone)]
pub struct VolumeData {
    pub state: VolumeState,
    pub payload: LayerPayload,
}

impl VolumeData {
    pub fn new(payload: LayerPayload) -> Self {
        Self {
            state: VolumeState::default(),
            payload,
        }
    }

    pub fn new_storage(pool: impl Into<String>, provider: ProviderKind) -> Self {
        Self::new(LayerPayload::Storage(StorageVlm {
            pool: pool.into(),
            provider,
            extent_kib: 0,
        }))
    }

    pub fn as_storage(&self) -> Result<&StorageVlm> {
        match &self.payload {
            LayerPayload::Storage(data) => Ok(data),
            other => Err(payload_mismatch("storage", other)),
        }
    }

    pub fn as_storage_mut(&mut self) -> Result<&mut StorageVlm> {
        match &mut self.payload {
            LayerPayload::Storage(data) => Ok(data),
            other => Err(payload_mismatch("storage", other)),
        }
    }

    pub fn as_luks(&self) -> Result<&LuksVlm> {
        match &self.payload {
            LayerPayload::Luks(data) => Ok(data),
            other => Err(payload_mismatch("luks", other)),
        }
    }

    pub fn as_luks_mut(&mut self) -> Result<&mut LuksVlm> {
        match &mut self.payload {
            LayerPayload::Luks(data) => Ok(data),
            other => Err(payload_mismatch("luks", other)),
        }
    }

    pub fn as_drbd(&self) -> Result<&DrbdVlm> {
        match &self.payload {
            LayerPayload::Drbd(data) => Ok(data),
            other => Err(payload_mismatch("drbd", other)),
        }
    }

    pub fn as_drbd_mut(&mut self) -> Result<&mut DrbdVlm> {
        match &mut self.payload {
            LayerPayload::Drbd(data) => Ok(data),
            other => Err(payload_mismatch("drbd", other)),
        }
    }

    pub fn as_writecache(&self) -> Result<&WritecacheVlm> {
        match &self.payload {
            LayerPayload::Writecache(data) => Ok(data),
            other => Err(payload_mismatch("writecache", other)),
        }
    }

    pub fn as_writecache_mut(&mut self) -> Result<&mut WritecacheVlm> {
        match &mut self.payload {
            LayerPayload::Writecache(data) => Ok(data),
            other => Err(payload_mismatch("writecache", other)),
        }
    }

    pub fn as_nvme_mut(&mut self) -> Result<&mut NvmeVlm> {
        match &mut self.payload {
            LayerPayload::Nvme(data) | LayerPayload::Openflex(data) => Ok(data),
            other => Err(payload_mismatch("nvme", other)),
        }
    }
}

fn payload_mismatch(expected: &str, got: &LayerPayload) -> Error {
    let got = match got {
        LayerPayload::Drbd(_) => "drbd",
        LayerPayload::Luks(_) => "luks",
        LayerPayload::Writecache(_) => "writecache",
        LayerPayload::Nvme(_) => "nvme",
        LayerPayload::Openflex(_) => "openflex",
        LayerPayload::Storage(_) => "storage",
    };
    Error::Internal(format!(
        "expected {} volume payload, found {}",
        expected, got
    ))
}

// =============================================================================
// Definition data
// =============================================================================

/// Static DRBD configuration attached above the per-node data
#[derive(Debug, Clone)]
pub struct DrbdResourceDef {
    pub port: u16,
    pub transport: String,
    pub shared_secret: String,
    pub node_id: u32,
    pub peer_slots: u8,
    pub al_stripes: u32,
}

impl Default for DrbdResourceDef {
    fn default() -> Self {
        Self {
            port: 7000,
            transport: "tcp".to_string(),
            shared_secret: String::new(),
            node_id: 0,
            peer_slots: 7,
            al_stripes: 1,
        }
    }
}

/// NVMe-oF / Openflex target definition
#[derive(Debug, Clone)]
pub struct NvmeTargetDef {
    /// Qualified name of the target subsystem
    pub nqn: String,
    pub transport_address: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_exists_clears_device_path() {
        let mut state = VolumeState {
            exists: true,
            device_path: Some("/dev/vg0/lv0".into()),
            size_state: Some(SizeState::AsExpected),
            ..Default::default()
        };
        state.set_exists(false);
        assert!(!state.exists);
        assert!(state.device_path.is_none());
        assert!(state.size_state.is_none());
    }

    #[test]
    fn test_payload_accessors() {
        let mut data = VolumeData::new_storage("vg0", ProviderKind::LvmThin);
        assert_eq!(data.as_storage().unwrap().pool, "vg0");
        assert!(data.as_luks_mut().is_err());
    }
}
