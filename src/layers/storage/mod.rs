//! Storage provider layer
//!
//! The leaf of every stack: creates, resizes and deletes the actual block
//! devices on LVM volume groups, ZFS pools or SPDK lvol stores. All
//! provider families share the convergence logic here; the family-specific
//! tool calls sit behind [`ProviderOps`] so the layer can be exercised
//! against mocks.

pub mod lvm;
pub mod spdk;
pub mod zfs;

use crate::batch::{BatchContext, PoolCapacity};
use crate::error::{Error, Result};
use crate::layers::{
    DeviceLayer, LayerKind, LayerRegistry, NotificationSink, ProcessResult, ResponseSink,
    UsageNotification,
};
use crate::props::{keys, PriorityProps};
use crate::sizes::{classify, round_up, SizeState};
use crate::tree::{LayerTree, NodeId, ProviderKind};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

// =============================================================================
// Provider port
// =============================================================================

/// One discovered volume or snapshot on a pool
#[derive(Debug, Clone)]
pub struct LvInfo {
    pub identifier: String,
    pub size_kib: u64,
    pub device_path: Option<String>,
    pub is_snapshot: bool,
}

/// Pool-level discovery data
#[derive(Debug, Clone, Copy)]
pub struct PoolInfo {
    pub free_kib: u64,
    pub total_kib: u64,
    /// Allocation granularity; sizes are rounded up to this
    pub extent_kib: u64,
}

/// Tool port for one provider family.
///
/// `info_list` is the only bulk query; everything else operates on a single
/// object. Implementations must treat "object not found" during discovery
/// as an empty result, not an error.
#[async_trait]
pub trait ProviderOps: Send + Sync {
    fn kind(&self) -> ProviderKind;

    /// One batched query for every pool the batch touches
    async fn info_list(
        &self,
        ctx: &BatchContext,
        pools: &[String],
    ) -> Result<HashMap<String, Vec<LvInfo>>>;

    async fn pool_info(&self, ctx: &BatchContext, pool: &str) -> Result<PoolInfo>;

    async fn create(
        &self,
        ctx: &BatchContext,
        pool: &str,
        identifier: &str,
        size_kib: u64,
        props: &PriorityProps,
    ) -> Result<()>;

    async fn resize(
        &self,
        ctx: &BatchContext,
        pool: &str,
        identifier: &str,
        size_kib: u64,
    ) -> Result<()>;

    async fn delete(&self, ctx: &BatchContext, pool: &str, identifier: &str) -> Result<()>;

    async fn create_snapshot(
        &self,
        ctx: &BatchContext,
        pool: &str,
        identifier: &str,
        snap_name: &str,
    ) -> Result<()>;

    async fn delete_snapshot(
        &self,
        ctx: &BatchContext,
        pool: &str,
        identifier: &str,
        snap_name: &str,
    ) -> Result<()>;

    /// Restore a snapshot into a new volume
    async fn restore_snapshot(
        &self,
        ctx: &BatchContext,
        pool: &str,
        identifier: &str,
        snap_name: &str,
        target_identifier: &str,
    ) -> Result<()>;

    /// Roll an existing volume back in place
    async fn rollback(
        &self,
        ctx: &BatchContext,
        pool: &str,
        identifier: &str,
        snap_name: &str,
    ) -> Result<()>;

    fn device_path(&self, pool: &str, identifier: &str) -> String;

    /// Name under which a snapshot of `identifier` is stored
    fn snapshot_identifier(&self, identifier: &str, snap_name: &str) -> String;
}

pub type ProviderOpsRef = Arc<dyn ProviderOps>;

// =============================================================================
// Identifier scheme
// =============================================================================

/// Backing object name for a volume: resource name (with node suffix)
/// plus the zero-padded volume number
pub fn volume_identifier(suffixed_name: &str, vlm_nr: u32) -> String {
    format!("{}_{:05}", suffixed_name, vlm_nr)
}

/// Which phase of snapshot handling a pass is in; deletions run before
/// resource convergence, creations after it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotPhase {
    Deleting,
    Creating,
}

// =============================================================================
// Layer
// =============================================================================

/// Discovery cache: (provider, pool) -> identifier -> info
type InfoCache = HashMap<(ProviderKind, String), HashMap<String, LvInfo>>;

pub struct StorageLayer {
    providers: BTreeMap<ProviderKind, ProviderOpsRef>,
    info_cache: Mutex<InfoCache>,
    /// Which provider family each discovered pool belongs to, for the
    /// free-space queries at the end of a batch
    pool_providers: Mutex<HashMap<String, ProviderKind>>,
}

impl StorageLayer {
    pub fn new(providers: Vec<ProviderOpsRef>) -> Self {
        Self {
            providers: providers.into_iter().map(|p| (p.kind(), p)).collect(),
            info_cache: Mutex::new(HashMap::new()),
            pool_providers: Mutex::new(HashMap::new()),
        }
    }

    fn provider(&self, kind: ProviderKind) -> Result<ProviderOpsRef> {
        self.providers
            .get(&kind)
            .cloned()
            .ok_or_else(|| Error::Configuration(format!("no provider registered for '{}'", kind)))
    }

    fn cached_info(&self, kind: ProviderKind, pool: &str, identifier: &str) -> Option<LvInfo> {
        self.info_cache
            .lock()
            .get(&(kind, pool.to_string()))
            .and_then(|per_pool| per_pool.get(identifier))
            .cloned()
    }

    /// Pool free space for the batch-end report
    pub async fn pool_capacity(&self, ctx: &BatchContext, pool: &str) -> Result<PoolCapacity> {
        let kind = self
            .pool_providers
            .lock()
            .get(pool)
            .copied()
            .ok_or_else(|| Error::PoolNotFound {
                pool: pool.to_string(),
            })?;
        let info = self.provider(kind)?.pool_info(ctx, pool).await?;
        let capacity = PoolCapacity {
            free_kib: info.free_kib,
            total_kib: info.total_kib,
        };
        ctx.cache_capacity(pool, capacity);
        Ok(capacity)
    }

    // -------------------------------------------------------------------------
    // Snapshots
    // -------------------------------------------------------------------------

    /// Converge the snapshots of a storage node. Deletions run in their own
    /// phase before resources are processed so the space is free when a
    /// resize follows; creations run afterwards against the settled volume.
    pub async fn process_snapshots(
        &self,
        ctx: &BatchContext,
        tree: &mut LayerTree,
        node: NodeId,
        phase: SnapshotPhase,
        sink: &mut ResponseSink,
    ) -> Result<()> {
        let rsc_name = tree.node(node)?.resource.clone();
        let suffixed = tree.node(node)?.suffixed_name();
        let vlm_nrs = tree.vlm_nrs(node)?;

        for vlm_nr in vlm_nrs {
            let (pool, kind) = {
                let storage = tree.vlm(node, vlm_nr)?.as_storage()?;
                (storage.pool.clone(), storage.provider)
            };
            let provider = self.provider(kind)?;
            let base_id = volume_identifier(&suffixed, vlm_nr);

            let snaps: Vec<(usize, String, bool, bool)> = tree
                .resource(&rsc_name)?
                .snapshots
                .iter()
                .enumerate()
                .map(|(idx, snap)| {
                    let exists = snap
                        .volumes
                        .get(&vlm_nr)
                        .map(|sv| sv.exists)
                        .unwrap_or(false);
                    (idx, snap.name.clone(), snap.flags.delete, exists)
                })
                .collect();

            for (idx, snap_name, delete, exists) in snaps {
                match phase {
                    SnapshotPhase::Deleting if delete && exists => {
                        provider
                            .delete_snapshot(ctx, &pool, &base_id, &snap_name)
                            .await?;
                        ctx.add_changed_pool(&pool);
                        sink.info(format!(
                            "Snapshot '{}' of volume {} deleted",
                            snap_name, vlm_nr
                        ));
                        if let Some(sv) = tree
                            .resource_mut(&rsc_name)?
                            .snapshots[idx]
                            .volumes
                            .get_mut(&vlm_nr)
                        {
                            sv.exists = false;
                        }
                    }
                    SnapshotPhase::Creating if !delete && !exists => {
                        let vlm_exists = tree.vlm(node, vlm_nr)?.state.exists;
                        if !vlm_exists {
                            continue;
                        }
                        provider
                            .create_snapshot(ctx, &pool, &base_id, &snap_name)
                            .await?;
                        ctx.add_changed_pool(&pool);
                        sink.info(format!(
                            "Snapshot '{}' of volume {} created",
                            snap_name, vlm_nr
                        ));
                        let snap_id = provider.snapshot_identifier(&base_id, &snap_name);
                        let sv = tree
                            .resource_mut(&rsc_name)?
                            .snapshots[idx]
                            .volumes
                            .entry(vlm_nr)
                            .or_default();
                        sv.exists = true;
                        sv.identifier = snap_id;
                    }
                    _ => {}
                }
            }
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Per-volume convergence
    // -------------------------------------------------------------------------

    async fn process_volume(
        &self,
        ctx: &BatchContext,
        tree: &mut LayerTree,
        node: NodeId,
        vlm_nr: u32,
        sink: &mut ResponseSink,
    ) -> Result<()> {
        let rsc_name = tree.node(node)?.resource.clone();
        let suffixed = tree.node(node)?.suffixed_name();
        let identifier = volume_identifier(&suffixed, vlm_nr);

        let should_exist = tree.resource(&rsc_name)?.should_exist();
        let vlm_delete = tree
            .resource(&rsc_name)?
            .volume_dfns
            .get(&vlm_nr)
            .map(|dfn| dfn.flags.delete)
            .unwrap_or(false);
        let resize_requested = tree
            .resource(&rsc_name)?
            .volume_dfns
            .get(&vlm_nr)
            .map(|dfn| dfn.flags.resize)
            .unwrap_or(false);
        let rollback_target = tree
            .resource(&rsc_name)?
            .props
            .get(keys::ROLLBACK_TARGET)
            .map(str::to_string);
        let restore_source = {
            let props = &tree.resource(&rsc_name)?.props;
            match (
                props.get(keys::RESTORE_SOURCE),
                props.get(keys::RESTORE_SNAPSHOT),
            ) {
                (Some(source), Some(snap)) => Some((source.to_string(), snap.to_string())),
                _ => None,
            }
        };

        let (pool, kind, extent, exists, expected) = {
            let data = tree.vlm(node, vlm_nr)?;
            let storage = data.as_storage()?;
            (
                storage.pool.clone(),
                storage.provider,
                storage.extent_kib,
                data.state.exists,
                data.state.expected_kib,
            )
        };
        let provider = self.provider(kind)?;

        if !should_exist || vlm_delete {
            if exists {
                provider.delete(ctx, &pool, &identifier).await?;
                ctx.add_changed_pool(&pool);
                sink.info(format!("Volume {} of '{}' deleted", vlm_nr, rsc_name));
                let data = tree.vlm_mut(node, vlm_nr)?;
                data.state.set_exists(false);
                data.state.allocated_kib = 0;
            }
            return Ok(());
        }

        if !exists {
            match &restore_source {
                Some((source_rsc, snap_name)) => {
                    // the source carries the same node suffix as this volume
                    let source_suffixed =
                        format!("{}{}", source_rsc, &suffixed[rsc_name.len()..]);
                    let source_id = volume_identifier(&source_suffixed, vlm_nr);
                    provider
                        .restore_snapshot(ctx, &pool, &source_id, snap_name, &identifier)
                        .await?;
                    sink.info(format!(
                        "Volume {} of '{}' restored from snapshot '{}' of '{}'",
                        vlm_nr, rsc_name, snap_name, source_rsc
                    ));
                }
                None => {
                    provider
                        .create(
                            ctx,
                            &pool,
                            &identifier,
                            expected,
                            &tree.resource(&rsc_name)?.props.clone(),
                        )
                        .await?;
                    sink.info(format!(
                        "Volume {} of '{}' created ({} KiB)",
                        vlm_nr, rsc_name, expected
                    ));
                }
            }
            ctx.add_changed_pool(&pool);
            let allocated = round_up(expected, extent);
            let device_path = provider.device_path(&pool, &identifier);
            let data = tree.vlm_mut(node, vlm_nr)?;
            data.state.exists = true;
            data.state.identifier = identifier.clone();
            data.state.device_path = Some(device_path);
            data.state.allocated_kib = allocated;
            data.state.usable_kib = allocated;
            data.state.size_state = Some(classify(allocated, expected, extent));
            return Ok(());
        }

        if let Some(target) = rollback_target {
            provider.rollback(ctx, &pool, &identifier, &target).await?;
            ctx.add_changed_pool(&pool);
            sink.info(format!(
                "Volume {} of '{}' rolled back to snapshot '{}'",
                vlm_nr, rsc_name, target
            ));
        }

        let allocated = tree.vlm(node, vlm_nr)?.state.allocated_kib;
        let size_state = classify(allocated, expected, extent);
        let needs_resize = match size_state {
            SizeState::TooSmall => true,
            SizeState::TooLarge => resize_requested,
            _ => false,
        };

        if needs_resize {
            provider.resize(ctx, &pool, &identifier, expected).await?;
            ctx.add_changed_pool(&pool);
            sink.info(format!(
                "Volume {} of '{}' resized to {} KiB",
                vlm_nr, rsc_name, expected
            ));
            let allocated = round_up(expected, extent);
            let data = tree.vlm_mut(node, vlm_nr)?;
            data.state.allocated_kib = allocated;
            data.state.usable_kib = allocated;
            data.state.size_state = Some(classify(allocated, expected, extent));
        } else {
            let data = tree.vlm_mut(node, vlm_nr)?;
            data.state.usable_kib = data.state.allocated_kib;
            data.state.size_state = Some(size_state);
        }
        Ok(())
    }
}

// =============================================================================
// DeviceLayer impl
// =============================================================================

#[async_trait]
impl DeviceLayer for StorageLayer {
    fn kind(&self) -> LayerKind {
        LayerKind::Storage
    }

    async fn prepare(
        &self,
        ctx: &BatchContext,
        tree: &mut LayerTree,
        nodes: &[NodeId],
    ) -> Result<()> {
        // group the batch's volumes by provider family and pool, then issue
        // one discovery query per family
        let mut pools_by_kind: BTreeMap<ProviderKind, Vec<String>> = BTreeMap::new();
        for &node in nodes {
            for vlm_nr in tree.vlm_nrs(node)? {
                let storage = tree.vlm(node, vlm_nr)?.as_storage()?;
                let pools = pools_by_kind.entry(storage.provider).or_default();
                if !pools.contains(&storage.pool) {
                    pools.push(storage.pool.clone());
                }
            }
        }

        for (kind, pools) in &pools_by_kind {
            let provider = self.provider(*kind)?;
            let listed = provider.info_list(ctx, pools).await?;
            let mut cache = self.info_cache.lock();
            let mut pool_providers = self.pool_providers.lock();
            for pool in pools {
                pool_providers.insert(pool.clone(), *kind);
                let per_pool: HashMap<String, LvInfo> = listed
                    .get(pool)
                    .map(|infos| {
                        infos
                            .iter()
                            .map(|info| (info.identifier.clone(), info.clone()))
                            .collect()
                    })
                    .unwrap_or_default();
                cache.insert((*kind, pool.clone()), per_pool);
            }
        }

        // pool extents, queried once per pool
        let mut extents: HashMap<String, u64> = HashMap::new();
        for (kind, pools) in &pools_by_kind {
            let provider = self.provider(*kind)?;
            for pool in pools {
                let info = provider.pool_info(ctx, pool).await?;
                extents.insert(pool.clone(), info.extent_kib);
                ctx.cache_capacity(
                    pool,
                    PoolCapacity {
                        free_kib: info.free_kib,
                        total_kib: info.total_kib,
                    },
                );
            }
        }

        for &node in nodes {
            let suffixed = tree.node(node)?.suffixed_name();
            for vlm_nr in tree.vlm_nrs(node)? {
                let identifier = volume_identifier(&suffixed, vlm_nr);
                let (kind, pool) = {
                    let storage = tree.vlm(node, vlm_nr)?.as_storage()?;
                    (storage.provider, storage.pool.clone())
                };
                let found = self.cached_info(kind, &pool, &identifier);
                let extent = extents.get(&pool).copied().unwrap_or(0);

                let data = tree.vlm_mut(node, vlm_nr)?;
                data.as_storage_mut()?.extent_kib = extent;
                match found {
                    Some(info) => {
                        data.state.exists = true;
                        data.state.identifier = identifier;
                        data.state.allocated_kib = info.size_kib;
                        data.state.device_path = info.device_path;
                    }
                    None => {
                        data.state.set_exists(false);
                        data.state.identifier = identifier;
                        data.state.allocated_kib = 0;
                    }
                }

                // snapshot existence from the same listing
                let rsc_name = tree.node(node)?.resource.clone();
                let provider = self.provider(kind)?;
                let base_id = volume_identifier(&tree.node(node)?.suffixed_name(), vlm_nr);
                let snap_names: Vec<String> = tree
                    .resource(&rsc_name)?
                    .snapshots
                    .iter()
                    .map(|s| s.name.clone())
                    .collect();
                for snap_name in snap_names {
                    let snap_id = provider.snapshot_identifier(&base_id, &snap_name);
                    let snap_exists = self.cached_info(kind, &pool, &snap_id).is_some();
                    let rsc = tree.resource_mut(&rsc_name)?;
                    if let Some(snap) = rsc.snapshots.iter_mut().find(|s| s.name == snap_name) {
                        let sv = snap.volumes.entry(vlm_nr).or_default();
                        sv.exists = snap_exists;
                        if snap_exists {
                            sv.identifier = snap_id;
                        }
                    }
                }
            }
        }
        Ok(())
    }

    async fn process(
        &self,
        _registry: &LayerRegistry,
        ctx: &BatchContext,
        tree: &mut LayerTree,
        node: NodeId,
        sink: &mut ResponseSink,
    ) -> Result<ProcessResult> {
        for vlm_nr in tree.vlm_nrs(node)? {
            self.process_volume(ctx, tree, node, vlm_nr, sink).await?;
        }
        Ok(ProcessResult::Success)
    }

    fn resource_finished(
        &self,
        tree: &LayerTree,
        node: NodeId,
        notifier: &dyn NotificationSink,
    ) -> Result<bool> {
        let rsc = tree.resource_of(node)?;
        if rsc.flags.delete {
            notifier.notify(UsageNotification::Deleted {
                resource: rsc.name.clone(),
            });
        } else {
            let ready = tree
                .node(node)?
                .volumes
                .values()
                .all(|data| data.state.exists && !data.state.failed);
            notifier.notify(UsageNotification::Created {
                resource: rsc.name.clone(),
                ready,
            });
        }
        Ok(true)
    }

    fn update_allocated_from_usable(
        &self,
        _registry: &LayerRegistry,
        tree: &mut LayerTree,
        node: NodeId,
        vlm_nr: u32,
    ) -> Result<()> {
        // leaf of the negotiation: the requested allocation is the usable
        // size asked for from above, gross of the pool's extent rounding
        let data = tree.vlm_mut(node, vlm_nr)?;
        data.state.expected_kib = data.state.usable_kib;
        Ok(())
    }

    fn update_usable_from_allocated(
        &self,
        _registry: &LayerRegistry,
        tree: &mut LayerTree,
        node: NodeId,
        vlm_nr: u32,
    ) -> Result<()> {
        let data = tree.vlm_mut(node, vlm_nr)?;
        data.state.usable_kib = data.state.allocated_kib;
        Ok(())
    }

    fn clear_cache(&self) {
        self.info_cache.lock().clear();
        self.pool_providers.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::{Resource, VolumeData, VolumeDefinition, VolumeFlags};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct MockProvider {
        kind: ProviderKind,
        existing: Mutex<HashMap<String, Vec<LvInfo>>>,
        creates: AtomicUsize,
        resizes: AtomicUsize,
        deletes: AtomicUsize,
        restores: Mutex<Vec<(String, String, String)>>,
    }

    impl MockProvider {
        fn new(kind: ProviderKind) -> Self {
            Self {
                kind,
                existing: Mutex::new(HashMap::new()),
                creates: AtomicUsize::new(0),
                resizes: AtomicUsize::new(0),
                deletes: AtomicUsize::new(0),
                restores: Mutex::new(Vec::new()),
            }
        }

        fn with_volume(self, pool: &str, identifier: &str, size_kib: u64) -> Self {
            self.existing.lock().entry(pool.to_string()).or_default().push(LvInfo {
                identifier: identifier.to_string(),
                size_kib,
                device_path: Some(format!("/dev/{}/{}", pool, identifier)),
                is_snapshot: false,
            });
            self
        }
    }

    #[async_trait]
    impl ProviderOps for MockProvider {
        fn kind(&self) -> ProviderKind {
            self.kind
        }

        async fn info_list(
            &self,
            _ctx: &BatchContext,
            pools: &[String],
        ) -> Result<HashMap<String, Vec<LvInfo>>> {
            let existing = self.existing.lock();
            Ok(pools
                .iter()
                .map(|p| (p.clone(), existing.get(p).cloned().unwrap_or_default()))
                .collect())
        }

        async fn pool_info(&self, _ctx: &BatchContext, _pool: &str) -> Result<PoolInfo> {
            Ok(PoolInfo {
                free_kib: 10 * crate::sizes::GIB_IN_KIB,
                total_kib: 20 * crate::sizes::GIB_IN_KIB,
                extent_kib: 4096,
            })
        }

        async fn create(
            &self,
            _ctx: &BatchContext,
            _pool: &str,
            _identifier: &str,
            _size_kib: u64,
            _props: &PriorityProps,
        ) -> Result<()> {
            self.creates.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn resize(
            &self,
            _ctx: &BatchContext,
            _pool: &str,
            _identifier: &str,
            _size_kib: u64,
        ) -> Result<()> {
            self.resizes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn delete(&self, _ctx: &BatchContext, _pool: &str, _identifier: &str) -> Result<()> {
            self.deletes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn create_snapshot(
            &self,
            _ctx: &BatchContext,
            _pool: &str,
            _identifier: &str,
            _snap_name: &str,
        ) -> Result<()> {
            Ok(())
        }

        async fn delete_snapshot(
            &self,
            _ctx: &BatchContext,
            _pool: &str,
            _identifier: &str,
            _snap_name: &str,
        ) -> Result<()> {
            Ok(())
        }

        async fn restore_snapshot(
            &self,
            _ctx: &BatchContext,
            _pool: &str,
            identifier: &str,
            snap_name: &str,
            target_identifier: &str,
        ) -> Result<()> {
            self.restores.lock().push((
                identifier.to_string(),
                snap_name.to_string(),
                target_identifier.to_string(),
            ));
            Ok(())
        }

        async fn rollback(
            &self,
            _ctx: &BatchContext,
            _pool: &str,
            _identifier: &str,
            _snap_name: &str,
        ) -> Result<()> {
            Ok(())
        }

        fn device_path(&self, pool: &str, identifier: &str) -> String {
            format!("/dev/{}/{}", pool, identifier)
        }

        fn snapshot_identifier(&self, identifier: &str, snap_name: &str) -> String {
            format!("{}_{}", identifier, snap_name)
        }
    }

    fn single_storage_tree(size_kib: u64) -> (LayerTree, NodeId) {
        let mut tree = LayerTree::new();
        let mut rsc = Resource::new("rsc1");
        rsc.volume_dfns.insert(
            0,
            VolumeDefinition {
                size_kib,
                flags: VolumeFlags::default(),
            },
        );
        tree.add_resource(rsc);
        let node = tree.add_node("rsc1", LayerKind::Storage, "", None).unwrap();
        tree.add_volume(node, 0, VolumeData::new_storage("vg0", ProviderKind::Lvm))
            .unwrap();
        (tree, node)
    }

    #[tokio::test]
    async fn test_create_missing_volume() {
        let provider = Arc::new(MockProvider::new(ProviderKind::Lvm));
        let layer = StorageLayer::new(vec![provider.clone()]);
        let ctx = BatchContext::default();
        let (mut tree, node) = single_storage_tree(crate::sizes::GIB_IN_KIB);
        tree.vlm_mut(node, 0).unwrap().state.expected_kib = crate::sizes::GIB_IN_KIB;

        layer.prepare(&ctx, &mut tree, &[node]).await.unwrap();
        assert!(!tree.vlm(node, 0).unwrap().state.exists);

        let registry = LayerRegistry::new();
        let mut sink = ResponseSink::new();
        layer
            .process(&registry, &ctx, &mut tree, node, &mut sink)
            .await
            .unwrap();

        assert_eq!(provider.creates.load(Ordering::SeqCst), 1);
        let state = &tree.vlm(node, 0).unwrap().state;
        assert!(state.exists);
        assert_eq!(state.identifier, "rsc1_00000");
        assert_eq!(state.device_path.as_deref(), Some("/dev/vg0/rsc1_00000"));
        assert!(state.size_state.unwrap().is_as_expected());
        assert_eq!(ctx.changed_pools(), vec!["vg0"]);
    }

    #[tokio::test]
    async fn test_existing_as_expected_volume_untouched() {
        let size = crate::sizes::GIB_IN_KIB;
        let provider = Arc::new(
            MockProvider::new(ProviderKind::Lvm).with_volume("vg0", "rsc1_00000", size),
        );
        let layer = StorageLayer::new(vec![provider.clone()]);
        let ctx = BatchContext::default();
        let (mut tree, node) = single_storage_tree(size);
        tree.vlm_mut(node, 0).unwrap().state.expected_kib = size;

        layer.prepare(&ctx, &mut tree, &[node]).await.unwrap();
        let registry = LayerRegistry::new();
        let mut sink = ResponseSink::new();
        layer
            .process(&registry, &ctx, &mut tree, node, &mut sink)
            .await
            .unwrap();

        assert_eq!(provider.creates.load(Ordering::SeqCst), 0);
        assert_eq!(provider.resizes.load(Ordering::SeqCst), 0);
        assert!(ctx.changed_pools().is_empty());
    }

    #[tokio::test]
    async fn test_too_small_volume_grown() {
        let size = crate::sizes::GIB_IN_KIB;
        let provider = Arc::new(
            MockProvider::new(ProviderKind::Lvm).with_volume("vg0", "rsc1_00000", size / 2),
        );
        let layer = StorageLayer::new(vec![provider.clone()]);
        let ctx = BatchContext::default();
        let (mut tree, node) = single_storage_tree(size);
        tree.vlm_mut(node, 0).unwrap().state.expected_kib = size;

        layer.prepare(&ctx, &mut tree, &[node]).await.unwrap();
        let registry = LayerRegistry::new();
        let mut sink = ResponseSink::new();
        layer
            .process(&registry, &ctx, &mut tree, node, &mut sink)
            .await
            .unwrap();

        assert_eq!(provider.resizes.load(Ordering::SeqCst), 1);
        assert_eq!(tree.vlm(node, 0).unwrap().state.allocated_kib, size);
    }

    #[tokio::test]
    async fn test_too_large_needs_resize_flag() {
        let size = crate::sizes::GIB_IN_KIB;
        // far above the 3-extent tolerance
        let provider = Arc::new(
            MockProvider::new(ProviderKind::Lvm).with_volume("vg0", "rsc1_00000", size * 2),
        );
        let layer = StorageLayer::new(vec![provider.clone()]);
        let ctx = BatchContext::default();
        let (mut tree, node) = single_storage_tree(size);
        tree.vlm_mut(node, 0).unwrap().state.expected_kib = size;

        layer.prepare(&ctx, &mut tree, &[node]).await.unwrap();
        let registry = LayerRegistry::new();
        let mut sink = ResponseSink::new();
        layer
            .process(&registry, &ctx, &mut tree, node, &mut sink)
            .await
            .unwrap();
        // shrink withheld without the explicit resize flag
        assert_eq!(provider.resizes.load(Ordering::SeqCst), 0);
        assert_eq!(
            tree.vlm(node, 0).unwrap().state.size_state,
            Some(SizeState::TooLarge)
        );

        tree.resource_mut("rsc1")
            .unwrap()
            .volume_dfns
            .get_mut(&0)
            .unwrap()
            .flags
            .resize = true;
        layer
            .process(&registry, &ctx, &mut tree, node, &mut sink)
            .await
            .unwrap();
        assert_eq!(provider.resizes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_missing_volume_restored_from_snapshot() {
        let provider = Arc::new(MockProvider::new(ProviderKind::Lvm));
        let layer = StorageLayer::new(vec![provider.clone()]);
        let ctx = BatchContext::default();
        let (mut tree, node) = single_storage_tree(crate::sizes::GIB_IN_KIB);
        tree.vlm_mut(node, 0).unwrap().state.expected_kib = crate::sizes::GIB_IN_KIB;
        tree.resource_mut("rsc1").unwrap().props = PriorityProps::new()
            .with_entry(keys::RESTORE_SOURCE, "base")
            .with_entry(keys::RESTORE_SNAPSHOT, "snap1");

        layer.prepare(&ctx, &mut tree, &[node]).await.unwrap();
        let registry = LayerRegistry::new();
        let mut sink = ResponseSink::new();
        layer
            .process(&registry, &ctx, &mut tree, node, &mut sink)
            .await
            .unwrap();

        assert_eq!(provider.creates.load(Ordering::SeqCst), 0);
        assert_eq!(
            provider.restores.lock().as_slice(),
            [(
                "base_00000".to_string(),
                "snap1".to_string(),
                "rsc1_00000".to_string()
            )]
        );
        let state = &tree.vlm(node, 0).unwrap().state;
        assert!(state.exists);
        assert_eq!(state.device_path.as_deref(), Some("/dev/vg0/rsc1_00000"));
        assert_eq!(ctx.changed_pools(), vec!["vg0"]);
    }

    #[tokio::test]
    async fn test_delete_flag_removes_volume() {
        let size = crate::sizes::GIB_IN_KIB;
        let provider = Arc::new(
            MockProvider::new(ProviderKind::Lvm).with_volume("vg0", "rsc1_00000", size),
        );
        let layer = StorageLayer::new(vec![provider.clone()]);
        let ctx = BatchContext::default();
        let (mut tree, node) = single_storage_tree(size);
        tree.resource_mut("rsc1").unwrap().flags.delete = true;

        layer.prepare(&ctx, &mut tree, &[node]).await.unwrap();
        let registry = LayerRegistry::new();
        let mut sink = ResponseSink::new();
        layer
            .process(&registry, &ctx, &mut tree, node, &mut sink)
            .await
            .unwrap();

        assert_eq!(provider.deletes.load(Ordering::SeqCst), 1);
        assert!(!tree.vlm(node, 0).unwrap().state.exists);
    }

    #[test]
    fn test_volume_identifier_format() {
        assert_eq!(volume_identifier("rsc1", 0), "rsc1_00000");
        assert_eq!(volume_identifier("rsc1_meta", 12), "rsc1_meta_00012");
    }
}
