//! Write-cache layer
//!
//! Builds a device-mapper writecache target over a data child and a cache
//! child. The cache device size defaults to 5% of the usable size and is
//! controlled by properties, as are the dm-writecache tuning options.

use crate::adapters::dmsetup;
use crate::batch::BatchContext;
use crate::error::{Error, Result};
use crate::layers::{
    suffixes, DeviceLayer, LayerKind, LayerRegistry, NotificationSink, ProcessResult,
    ResponseSink, UsageNotification,
};
use crate::props::{keys, namespaces, PriorityProps};
use crate::sizes::eval_size_or_percent;
use crate::tree::{LayerTree, NodeId};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;

const DEFAULT_CACHE_SIZE: &str = "5%";
const DEFAULT_BLOCK_SIZE: u32 = 4096;

/// dm-writecache tuning options accepted from the property namespace;
/// anything else is ignored with a warning
const ALLOWED_OPTIONS: &[&str] = &[
    "start_sector",
    "high_watermark",
    "low_watermark",
    "writeback_jobs",
    "autocommit_blocks",
    "autocommit_time",
    "fua",
];

// =============================================================================
// Device-mapper port
// =============================================================================

#[async_trait]
pub trait DmOps: Send + Sync {
    /// Names of existing dm devices with the writecache target
    async fn list(&self, ctx: &BatchContext) -> Result<HashSet<String>>;

    #[allow(clippy::too_many_arguments)]
    async fn create(
        &self,
        ctx: &BatchContext,
        name: &str,
        data_device: &str,
        cache_device: &str,
        data_size_kib: u64,
        pmem_mode: bool,
        block_size: u32,
        options: &str,
    ) -> Result<()>;

    async fn remove(&self, ctx: &BatchContext, name: &str) -> Result<()>;
    async fn flush(&self, ctx: &BatchContext, name: &str) -> Result<()>;
    async fn suspend(&self, ctx: &BatchContext, name: &str) -> Result<()>;
    async fn resume(&self, ctx: &BatchContext, name: &str) -> Result<()>;
}

/// Production implementation over dmsetup
pub struct DmsetupOps;

#[async_trait]
impl DmOps for DmsetupOps {
    async fn list(&self, ctx: &BatchContext) -> Result<HashSet<String>> {
        dmsetup::list(ctx.runner(), "writecache").await
    }

    async fn create(
        &self,
        ctx: &BatchContext,
        name: &str,
        data_device: &str,
        cache_device: &str,
        data_size_kib: u64,
        pmem_mode: bool,
        block_size: u32,
        options: &str,
    ) -> Result<()> {
        dmsetup::create_writecache(
            ctx.runner(),
            name,
            data_device,
            cache_device,
            data_size_kib,
            pmem_mode,
            block_size,
            options,
        )
        .await
    }

    async fn remove(&self, ctx: &BatchContext, name: &str) -> Result<()> {
        dmsetup::remove(ctx.runner(), name).await
    }

    async fn flush(&self, ctx: &BatchContext, name: &str) -> Result<()> {
        dmsetup::flush(ctx.runner(), name).await
    }

    async fn suspend(&self, ctx: &BatchContext, name: &str) -> Result<()> {
        dmsetup::suspend(ctx.runner(), name).await
    }

    async fn resume(&self, ctx: &BatchContext, name: &str) -> Result<()> {
        dmsetup::resume(ctx.runner(), name).await
    }
}

// =============================================================================
// Layer
// =============================================================================

/// dm device name for a write-cache volume
pub fn writecache_name(suffixed_name: &str, vlm_nr: u32) -> String {
    format!("stackbd_writecache_{}_{:05}", suffixed_name, vlm_nr)
}

/// Render the dm-writecache optional argument string (leading argument
/// count, then `key value` pairs; `fua` is a bare flag)
pub fn render_options(props: &PriorityProps, sink: &mut ResponseSink) -> String {
    let raw = props.render_namespace(namespaces::WRITECACHE_OPTIONS);
    let mut tokens: Vec<String> = Vec::new();
    for (key, value) in raw {
        if !ALLOWED_OPTIONS.contains(&key.as_str()) {
            sink.warn(format!("Unknown write-cache option '{}' ignored", key));
            continue;
        }
        if key == "fua" {
            match value.as_str() {
                "on" => tokens.push("fua".to_string()),
                "off" => tokens.push("nofua".to_string()),
                other => sink.warn(format!("Invalid fua value '{}' ignored", other)),
            }
        } else {
            tokens.push(key);
            tokens.push(value);
        }
    }
    let mut out = tokens.len().to_string();
    for token in tokens {
        out.push(' ');
        out.push_str(&token);
    }
    out
}

pub struct WritecacheLayer {
    ops: Arc<dyn DmOps>,
    existing: Mutex<Option<HashSet<String>>>,
}

impl WritecacheLayer {
    pub fn new(ops: Arc<dyn DmOps>) -> Self {
        Self {
            ops,
            existing: Mutex::new(None),
        }
    }

    fn data_child(tree: &LayerTree, node: NodeId) -> Result<NodeId> {
        tree.child_by_suffix(node, suffixes::DATA)?
            .ok_or_else(|| Error::Internal(format!("writecache node {} has no data child", node)))
    }

    /// Detect whether the cache child is persistent memory; a pmem request
    /// on a non-pmem device degrades to SSD mode with a warning
    fn pmem_mode(
        props: &PriorityProps,
        cache_device: &str,
        sink: &mut ResponseSink,
    ) -> bool {
        let requested = props
            .get(keys::WRITECACHE_POOL_PMEM)
            .map(|v| v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);
        if !requested {
            return false;
        }
        if cache_device.starts_with("/dev/pmem") {
            true
        } else {
            sink.warn(format!(
                "Cache device '{}' is not persistent memory. Falling back to 's' mode",
                cache_device
            ));
            false
        }
    }

    async fn process_volume(
        &self,
        ctx: &BatchContext,
        tree: &mut LayerTree,
        node: NodeId,
        data_child: NodeId,
        cache_child: NodeId,
        vlm_nr: u32,
        sink: &mut ResponseSink,
    ) -> Result<()> {
        let rsc_name = tree.node(node)?.resource.clone();
        let suffixed = tree.node(node)?.suffixed_name();
        let name = writecache_name(&suffixed, vlm_nr);

        let data_device = tree
            .vlm(data_child, vlm_nr)?
            .state
            .device_path
            .clone()
            .ok_or_else(|| {
                Error::Internal(format!("data child of writecache node {} has no device", node))
            })?;
        let cache_device = tree
            .vlm(cache_child, vlm_nr)?
            .state
            .device_path
            .clone()
            .ok_or_else(|| {
                Error::Internal(format!("cache child of writecache node {} has no device", node))
            })?;
        let data_usable = tree.vlm(data_child, vlm_nr)?.state.usable_kib;
        let cache_allocated = tree.vlm(cache_child, vlm_nr)?.state.allocated_kib;

        let exists = tree.vlm(node, vlm_nr)?.state.exists;
        if !exists {
            let props = tree.resource(&rsc_name)?.props.clone();
            let pmem = Self::pmem_mode(&props, &cache_device, sink);
            let options = render_options(&props, sink);
            self.ops
                .create(
                    ctx,
                    &name,
                    &data_device,
                    &cache_device,
                    data_usable,
                    pmem,
                    DEFAULT_BLOCK_SIZE,
                    &options,
                )
                .await?;
            sink.info(format!("Write cache for volume {} created", vlm_nr));
            tree.vlm_mut(node, vlm_nr)?.as_writecache_mut()?.pmem_mode = pmem;
        }

        let suspend_io = tree.resource(&rsc_name)?.suspend_io;
        let was_suspended = tree.vlm(node, vlm_nr)?.as_writecache()?.suspended;
        if suspend_io && !was_suspended {
            // get dirty blocks onto the backing device, then hold the dm
            // device until the change below has settled
            self.ops.flush(ctx, &name).await?;
            self.ops.suspend(ctx, &name).await?;
            tree.vlm_mut(node, vlm_nr)?.as_writecache_mut()?.suspended = true;
        } else if !suspend_io && was_suspended {
            self.ops.resume(ctx, &name).await?;
            tree.vlm_mut(node, vlm_nr)?.as_writecache_mut()?.suspended = false;
        }

        let data_size_state = tree.vlm(data_child, vlm_nr)?.state.size_state;
        let data = tree.vlm_mut(node, vlm_nr)?;
        data.state.exists = true;
        data.state.identifier = name.clone();
        data.state.device_path = Some(dmsetup::mapper_path(&name));
        data.state.usable_kib = data_usable;
        data.state.allocated_kib = data_usable + cache_allocated;
        data.state.size_state = data_size_state;
        Ok(())
    }
}

#[async_trait]
impl DeviceLayer for WritecacheLayer {
    fn kind(&self) -> LayerKind {
        LayerKind::Writecache
    }

    async fn prepare(
        &self,
        ctx: &BatchContext,
        tree: &mut LayerTree,
        nodes: &[NodeId],
    ) -> Result<()> {
        let listed = self.ops.list(ctx).await?;
        for &node in nodes {
            let suffixed = tree.node(node)?.suffixed_name();
            for vlm_nr in tree.vlm_nrs(node)? {
                let name = writecache_name(&suffixed, vlm_nr);
                let data = tree.vlm_mut(node, vlm_nr)?;
                data.state.identifier = name.clone();
                if listed.contains(&name) {
                    data.state.exists = true;
                    data.state.device_path = Some(dmsetup::mapper_path(&name));
                } else {
                    data.state.set_exists(false);
                }
            }
        }
        *self.existing.lock() = Some(listed);
        Ok(())
    }

    async fn process(
        &self,
        registry: &LayerRegistry,
        ctx: &BatchContext,
        tree: &mut LayerTree,
        node: NodeId,
        sink: &mut ResponseSink,
    ) -> Result<ProcessResult> {
        let data_child = Self::data_child(tree, node)?;
        let cache_child = tree.child_by_suffix(node, suffixes::CACHE)?;
        let rsc_name = tree.node(node)?.resource.clone();
        let deleting = !tree.resource(&rsc_name)?.should_exist();

        if deleting {
            let suffixed = tree.node(node)?.suffixed_name();
            for vlm_nr in tree.vlm_nrs(node)? {
                if tree.vlm(node, vlm_nr)?.state.exists {
                    let name = writecache_name(&suffixed, vlm_nr);
                    self.ops.remove(ctx, &name).await?;
                    tree.vlm_mut(node, vlm_nr)?.state.set_exists(false);
                    sink.info(format!("Write cache for volume {} removed", vlm_nr));
                }
            }
            let result = registry.process_node(ctx, tree, data_child, sink).await?;
            if let Some(cache) = cache_child {
                registry.process_node(ctx, tree, cache, sink).await?;
            }
            return Ok(result);
        }

        let data_result = registry.process_node(ctx, tree, data_child, sink).await?;
        if data_result == ProcessResult::NoDevicesProvided {
            return Ok(ProcessResult::NoDevicesProvided);
        }
        // a missing cache child means this node only passes the data path
        // through (the cache sits on a peer)
        let Some(cache_child) = cache_child else {
            return Ok(ProcessResult::NoDevicesProvided);
        };
        registry.process_node(ctx, tree, cache_child, sink).await?;

        for vlm_nr in tree.vlm_nrs(node)? {
            self.process_volume(ctx, tree, node, data_child, cache_child, vlm_nr, sink)
                .await?;
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
        registry: &LayerRegistry,
        tree: &mut LayerTree,
        node: NodeId,
        vlm_nr: u32,
    ) -> Result<()> {
        let data_child = Self::data_child(tree, node)?;
        let cache_child = tree.child_by_suffix(node, suffixes::CACHE)?;
        let rsc_name = tree.node(node)?.resource.clone();
        let usable = tree.vlm(node, vlm_nr)?.state.usable_kib;

        tree.vlm_mut(node, vlm_nr)?.state.expected_kib = usable;
        tree.vlm_mut(data_child, vlm_nr)?.state.usable_kib = usable;
        registry.update_allocated_from_usable(tree, data_child, vlm_nr)?;

        if let Some(cache) = cache_child {
            let size_prop = tree
                .resource(&rsc_name)?
                .props
                .get_or(keys::WRITECACHE_SIZE, DEFAULT_CACHE_SIZE)
                .to_string();
            let cache_kib = eval_size_or_percent(&size_prop, usable)?;
            tree.vlm_mut(cache, vlm_nr)?.state.usable_kib = cache_kib;
            registry.update_allocated_from_usable(tree, cache, vlm_nr)?;
        }
        Ok(())
    }

    fn update_usable_from_allocated(
        &self,
        registry: &LayerRegistry,
        tree: &mut LayerTree,
        node: NodeId,
        vlm_nr: u32,
    ) -> Result<()> {
        let data_child = Self::data_child(tree, node)?;
        let cache_child = tree.child_by_suffix(node, suffixes::CACHE)?;

        registry.update_usable_from_allocated(tree, data_child, vlm_nr)?;
        let data_usable = tree.vlm(data_child, vlm_nr)?.state.usable_kib;

        let mut cache_allocated = 0;
        if let Some(cache) = cache_child {
            registry.update_usable_from_allocated(tree, cache, vlm_nr)?;
            cache_allocated = tree.vlm(cache, vlm_nr)?.state.allocated_kib;
        }

        let data = tree.vlm_mut(node, vlm_nr)?;
        data.state.usable_kib = data_usable;
        data.state.allocated_kib = data_usable + cache_allocated;
        Ok(())
    }

    fn clear_cache(&self) {
        *self.existing.lock() = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::{LayerPayload, ProviderKind, Resource, VolumeData, WritecacheVlm};

    #[derive(Default)]
    struct MockDm {
        log: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl DmOps for MockDm {
        async fn list(&self, _ctx: &BatchContext) -> Result<HashSet<String>> {
            Ok(HashSet::new())
        }

        async fn create(
            &self,
            _ctx: &BatchContext,
            name: &str,
            _data_device: &str,
            _cache_device: &str,
            _data_size_kib: u64,
            _pmem_mode: bool,
            _block_size: u32,
            _options: &str,
        ) -> Result<()> {
            self.log.lock().push(format!("create {}", name));
            Ok(())
        }

        async fn remove(&self, _ctx: &BatchContext, name: &str) -> Result<()> {
            self.log.lock().push(format!("remove {}", name));
            Ok(())
        }

        async fn flush(&self, _ctx: &BatchContext, name: &str) -> Result<()> {
            self.log.lock().push(format!("flush {}", name));
            Ok(())
        }

        async fn suspend(&self, _ctx: &BatchContext, name: &str) -> Result<()> {
            self.log.lock().push(format!("suspend {}", name));
            Ok(())
        }

        async fn resume(&self, _ctx: &BatchContext, name: &str) -> Result<()> {
            self.log.lock().push(format!("resume {}", name));
            Ok(())
        }
    }

    fn writecache_tree() -> (LayerTree, NodeId, NodeId, NodeId) {
        let mut tree = LayerTree::new();
        tree.add_resource(Resource::new("rsc1"));
        let node = tree
            .add_node("rsc1", LayerKind::Writecache, "", None)
            .unwrap();
        let data = tree
            .add_node("rsc1", LayerKind::Storage, suffixes::DATA, Some(node))
            .unwrap();
        let cache = tree
            .add_node("rsc1", LayerKind::Storage, suffixes::CACHE, Some(node))
            .unwrap();
        let mut vlm = VolumeData::new(LayerPayload::Writecache(WritecacheVlm::default()));
        vlm.state.exists = true;
        tree.add_volume(node, 0, vlm).unwrap();
        let mut data_vlm = VolumeData::new_storage("vg0", ProviderKind::Lvm);
        data_vlm.state.exists = true;
        data_vlm.state.device_path = Some("/dev/vg0/rsc1_data_00000".into());
        data_vlm.state.usable_kib = crate::sizes::GIB_IN_KIB;
        tree.add_volume(data, 0, data_vlm).unwrap();
        let mut cache_vlm = VolumeData::new_storage("vg0", ProviderKind::Lvm);
        cache_vlm.state.exists = true;
        cache_vlm.state.device_path = Some("/dev/vg0/rsc1_cache_00000".into());
        tree.add_volume(cache, 0, cache_vlm).unwrap();
        (tree, node, data, cache)
    }

    #[tokio::test]
    async fn test_suspend_flushes_then_halts_and_resumes() {
        let ops = Arc::new(MockDm::default());
        let layer = WritecacheLayer::new(ops.clone());
        let ctx = BatchContext::default();
        let (mut tree, node, data, cache) = writecache_tree();

        tree.resource_mut("rsc1").unwrap().suspend_io = true;
        let mut sink = ResponseSink::new();
        layer
            .process_volume(&ctx, &mut tree, node, data, cache, 0, &mut sink)
            .await
            .unwrap();
        assert_eq!(
            ops.log.lock().as_slice(),
            [
                "flush stackbd_writecache_rsc1_00000",
                "suspend stackbd_writecache_rsc1_00000"
            ]
        );
        assert!(tree.vlm(node, 0).unwrap().as_writecache().unwrap().suspended);

        // a second pass with the flag still set does not repeat the calls
        layer
            .process_volume(&ctx, &mut tree, node, data, cache, 0, &mut sink)
            .await
            .unwrap();
        assert_eq!(ops.log.lock().len(), 2);

        tree.resource_mut("rsc1").unwrap().suspend_io = false;
        layer
            .process_volume(&ctx, &mut tree, node, data, cache, 0, &mut sink)
            .await
            .unwrap();
        assert_eq!(
            ops.log.lock().last().map(String::as_str),
            Some("resume stackbd_writecache_rsc1_00000")
        );
        assert!(!tree.vlm(node, 0).unwrap().as_writecache().unwrap().suspended);
    }

    #[test]
    fn test_writecache_name() {
        assert_eq!(
            writecache_name("rsc1", 0),
            "stackbd_writecache_rsc1_00000"
        );
    }

    #[test]
    fn test_render_options_with_fua() {
        let props = PriorityProps::new()
            .with_entry("Writecache/Opts/high_watermark", "60")
            .with_entry("Writecache/Opts/fua", "off");
        let mut sink = ResponseSink::new();
        let rendered = render_options(&props, &mut sink);
        // BTreeMap ordering: fua before high_watermark
        assert_eq!(rendered, "3 nofua high_watermark 60");
        assert!(sink.entries().is_empty());
    }

    #[test]
    fn test_render_options_rejects_unknown_keys() {
        let props = PriorityProps::new().with_entry("Writecache/Opts/bogus", "1");
        let mut sink = ResponseSink::new();
        let rendered = render_options(&props, &mut sink);
        assert_eq!(rendered, "0");
        assert_eq!(sink.entries().len(), 1);
    }

    #[test]
    fn test_pmem_fallback_warning() {
        let props = PriorityProps::new().with_entry(keys::WRITECACHE_POOL_PMEM, "true");
        let mut sink = ResponseSink::new();
        assert!(WritecacheLayer::pmem_mode(&props, "/dev/pmem0", &mut sink));
        assert!(sink.entries().is_empty());

        assert!(!WritecacheLayer::pmem_mode(
            &props,
            "/dev/vg0/rsc1_cache_00000",
            &mut sink
        ));
        assert_eq!(sink.entries().len(), 1);
        assert!(sink.entries()[0].message.contains("Falling back to 's' mode"));
    }
}
