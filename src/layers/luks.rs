//! LUKS encryption layer
//!
//! Wraps its single child in a LUKS2 mapping. The passphrase arrives with
//! the resource data, lives only in memory and is fed to cryptsetup over
//! stdin. The usable size above this layer is the child size minus the
//! fixed header overhead.

use crate::adapters::cryptsetup;
use crate::batch::BatchContext;
use crate::error::{Error, Result};
use crate::layers::{
    DeviceLayer, LayerKind, LayerRegistry, NotificationSink, ProcessResult, ResponseSink,
    UsageNotification,
};
use crate::sizes::LUKS_HEADER_KIB;
use crate::tree::{LayerTree, NodeId};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

// =============================================================================
// Crypt port
// =============================================================================

/// Tool port for LUKS handling, mockable in tests
#[async_trait]
pub trait CryptOps: Send + Sync {
    async fn is_luks(&self, ctx: &BatchContext, device: &str) -> Result<bool>;
    async fn format(&self, ctx: &BatchContext, device: &str, key: &[u8]) -> Result<()>;
    async fn open(&self, ctx: &BatchContext, device: &str, target: &str, key: &[u8])
        -> Result<()>;
    /// `size_kib == None` grows the mapping to fill the backing device
    async fn resize(
        &self,
        ctx: &BatchContext,
        target: &str,
        size_kib: Option<u64>,
        key: &[u8],
    ) -> Result<()>;
    async fn close(&self, ctx: &BatchContext, target: &str) -> Result<()>;
    async fn is_open(&self, ctx: &BatchContext, target: &str) -> Result<bool>;
    async fn shred_header(&self, ctx: &BatchContext, device: &str) -> Result<()>;
}

/// Production implementation over the cryptsetup binary
pub struct CryptsetupOps;

#[async_trait]
impl CryptOps for CryptsetupOps {
    async fn is_luks(&self, ctx: &BatchContext, device: &str) -> Result<bool> {
        cryptsetup::is_luks(ctx.runner(), device).await
    }

    async fn format(&self, ctx: &BatchContext, device: &str, key: &[u8]) -> Result<()> {
        cryptsetup::luks_format(ctx.runner(), device, key).await
    }

    async fn open(
        &self,
        ctx: &BatchContext,
        device: &str,
        target: &str,
        key: &[u8],
    ) -> Result<()> {
        cryptsetup::open(ctx.runner(), device, target, key).await
    }

    async fn resize(
        &self,
        ctx: &BatchContext,
        target: &str,
        size_kib: Option<u64>,
        key: &[u8],
    ) -> Result<()> {
        cryptsetup::resize(ctx.runner(), target, size_kib, key).await
    }

    async fn close(&self, ctx: &BatchContext, target: &str) -> Result<()> {
        cryptsetup::close(ctx.runner(), target).await
    }

    async fn is_open(&self, ctx: &BatchContext, target: &str) -> Result<bool> {
        cryptsetup::is_open(ctx.runner(), target).await
    }

    async fn shred_header(&self, ctx: &BatchContext, device: &str) -> Result<()> {
        cryptsetup::shred_header(ctx.runner(), device).await
    }
}

// =============================================================================
// Layer
// =============================================================================

/// Mapper target name for a LUKS volume
pub fn crypt_target_name(suffixed_name: &str, vlm_nr: u32) -> String {
    format!("stackbd_crypt_{}_{:05}", suffixed_name, vlm_nr)
}

pub struct LuksLayer {
    ops: Arc<dyn CryptOps>,
}

impl LuksLayer {
    pub fn new(ops: Arc<dyn CryptOps>) -> Self {
        Self { ops }
    }

    fn single_child(tree: &LayerTree, node: NodeId) -> Result<NodeId> {
        tree.node(node)?
            .children
            .values()
            .next()
            .copied()
            .ok_or_else(|| Error::Internal(format!("luks node {} has no child", node)))
    }

    async fn delete_volume(
        &self,
        ctx: &BatchContext,
        tree: &mut LayerTree,
        node: NodeId,
        child: NodeId,
        vlm_nr: u32,
        sink: &mut ResponseSink,
    ) -> Result<()> {
        let suffixed = tree.node(node)?.suffixed_name();
        let target = crypt_target_name(&suffixed, vlm_nr);

        if tree.vlm(node, vlm_nr)?.as_luks()?.opened {
            self.ops.close(ctx, &target).await?;
            let data = tree.vlm_mut(node, vlm_nr)?;
            data.as_luks_mut()?.opened = false;
            data.state.set_exists(false);
        }
        // destroy the header so the ciphertext is unrecoverable once the
        // backing device is released
        let child_device = tree.vlm(child, vlm_nr)?.state.device_path.clone();
        let child_exists = tree.vlm(child, vlm_nr)?.state.exists;
        if let (true, Some(device)) = (child_exists, child_device) {
            self.ops.shred_header(ctx, &device).await?;
            sink.info(format!("Encryption header of volume {} erased", vlm_nr));
        }
        Ok(())
    }

    /// A requested shrink narrows the mapping before the backing device
    /// shrinks under it; growing runs the other way around and is handled
    /// after the child has been processed
    async fn shrink_volume(
        &self,
        ctx: &BatchContext,
        tree: &mut LayerTree,
        node: NodeId,
        child: NodeId,
        vlm_nr: u32,
        sink: &mut ResponseSink,
    ) -> Result<()> {
        let rsc_name = tree.node(node)?.resource.clone();
        let resize_requested = tree
            .resource(&rsc_name)?
            .volume_dfns
            .get(&vlm_nr)
            .map(|dfn| dfn.flags.resize)
            .unwrap_or(false);
        if !resize_requested {
            return Ok(());
        }
        let (opened, expected, target_usable, key) = {
            let data = tree.vlm(node, vlm_nr)?;
            let luks = data.as_luks()?;
            (
                luks.opened,
                data.state.expected_kib,
                data.state.usable_kib,
                luks.key.clone(),
            )
        };
        let child_allocated = tree.vlm(child, vlm_nr)?.state.allocated_kib;
        if !opened || expected == 0 || child_allocated <= expected {
            return Ok(());
        }
        let key = key
            .ok_or_else(|| Error::abort(&rsc_name, "no passphrase given for encrypted volume"))?;
        let suffixed = tree.node(node)?.suffixed_name();
        let target = crypt_target_name(&suffixed, vlm_nr);
        self.ops
            .resize(ctx, &target, Some(target_usable), &key)
            .await?;
        sink.info(format!(
            "Encrypted volume {} shrunk ahead of its backing device",
            vlm_nr
        ));
        Ok(())
    }

    async fn process_volume(
        &self,
        ctx: &BatchContext,
        tree: &mut LayerTree,
        node: NodeId,
        child: NodeId,
        vlm_nr: u32,
        sink: &mut ResponseSink,
    ) -> Result<()> {
        let rsc_name = tree.node(node)?.resource.clone();
        let suffixed = tree.node(node)?.suffixed_name();
        let target = crypt_target_name(&suffixed, vlm_nr);

        let key = tree
            .vlm(node, vlm_nr)?
            .as_luks()?
            .key
            .clone()
            .ok_or_else(|| Error::abort(&rsc_name, "no passphrase given for encrypted volume"))?;

        let child_state = &tree.vlm(child, vlm_nr)?.state;
        let child_device = child_state
            .device_path
            .clone()
            .ok_or_else(|| Error::Internal(format!("child of luks node {} has no device", node)))?;
        let child_usable = child_state.usable_kib;

        let formatted = self.ops.is_luks(ctx, &child_device).await?;
        if !formatted {
            self.ops.format(ctx, &child_device, &key).await?;
            sink.info(format!("Volume {} encrypted", vlm_nr));
        }
        tree.vlm_mut(node, vlm_nr)?.as_luks_mut()?.formatted = true;

        let opened = tree.vlm(node, vlm_nr)?.as_luks()?.opened;
        if !opened {
            self.ops.open(ctx, &child_device, &target, &key).await?;
            debug!("Opened LUKS mapping {}", target);
        } else {
            // the backing device may have grown since the mapping was set
            // up; growing the mapping is always safe
            let usable = tree.vlm(node, vlm_nr)?.state.usable_kib;
            if child_usable > usable + LUKS_HEADER_KIB {
                self.ops.resize(ctx, &target, None, &key).await?;
                sink.info(format!("Encrypted volume {} grown", vlm_nr));
            }
        }

        let child_size_state = tree.vlm(child, vlm_nr)?.state.size_state;
        let data = tree.vlm_mut(node, vlm_nr)?;
        data.as_luks_mut()?.opened = true;
        data.state.exists = true;
        data.state.identifier = target.clone();
        data.state.device_path = Some(cryptsetup::mapper_path(&target));
        data.state.allocated_kib = child_usable;
        data.state.usable_kib = child_usable.saturating_sub(LUKS_HEADER_KIB);
        data.state.size_state = child_size_state;
        Ok(())
    }
}

#[async_trait]
impl DeviceLayer for LuksLayer {
    fn kind(&self) -> LayerKind {
        LayerKind::Luks
    }

    async fn prepare(
        &self,
        ctx: &BatchContext,
        tree: &mut LayerTree,
        nodes: &[NodeId],
    ) -> Result<()> {
        for &node in nodes {
            let suffixed = tree.node(node)?.suffixed_name();
            for vlm_nr in tree.vlm_nrs(node)? {
                let target = crypt_target_name(&suffixed, vlm_nr);
                let opened = self.ops.is_open(ctx, &target).await?;
                let data = tree.vlm_mut(node, vlm_nr)?;
                data.as_luks_mut()?.opened = opened;
                data.state.identifier = target.clone();
                if opened {
                    data.state.exists = true;
                    data.state.device_path = Some(cryptsetup::mapper_path(&target));
                } else {
                    data.state.set_exists(false);
                }
            }
        }
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
        let child = Self::single_child(tree, node)?;
        let rsc_name = tree.node(node)?.resource.clone();
        let deleting = {
            let rsc = tree.resource(&rsc_name)?;
            !rsc.should_exist()
        };

        if deleting {
            // top-down: drop the mapping and erase the header before the
            // child releases the backing device
            for vlm_nr in tree.vlm_nrs(node)? {
                self.delete_volume(ctx, tree, node, child, vlm_nr, sink)
                    .await?;
            }
            return registry.process_node(ctx, tree, child, sink).await;
        }

        for vlm_nr in tree.vlm_nrs(node)? {
            self.shrink_volume(ctx, tree, node, child, vlm_nr, sink)
                .await?;
        }
        let child_result = registry.process_node(ctx, tree, child, sink).await?;
        if child_result == ProcessResult::NoDevicesProvided {
            return Ok(ProcessResult::NoDevicesProvided);
        }

        for vlm_nr in tree.vlm_nrs(node)? {
            let vlm_delete = tree
                .resource(&rsc_name)?
                .volume_dfns
                .get(&vlm_nr)
                .map(|dfn| dfn.flags.delete)
                .unwrap_or(false);
            if vlm_delete {
                self.delete_volume(ctx, tree, node, child, vlm_nr, sink)
                    .await?;
            } else {
                self.process_volume(ctx, tree, node, child, vlm_nr, sink)
                    .await?;
            }
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
        let child = Self::single_child(tree, node)?;
        let usable = tree.vlm(node, vlm_nr)?.state.usable_kib;
        let gross = usable + LUKS_HEADER_KIB;
        tree.vlm_mut(node, vlm_nr)?.state.expected_kib = gross;
        tree.vlm_mut(child, vlm_nr)?.state.usable_kib = gross;
        registry.update_allocated_from_usable(tree, child, vlm_nr)
    }

    fn update_usable_from_allocated(
        &self,
        registry: &LayerRegistry,
        tree: &mut LayerTree,
        node: NodeId,
        vlm_nr: u32,
    ) -> Result<()> {
        let child = Self::single_child(tree, node)?;
        registry.update_usable_from_allocated(tree, child, vlm_nr)?;
        let child_usable = tree.vlm(child, vlm_nr)?.state.usable_kib;
        let data = tree.vlm_mut(node, vlm_nr)?;
        data.state.allocated_kib = child_usable;
        data.state.usable_kib = child_usable.saturating_sub(LUKS_HEADER_KIB);
        Ok(())
    }

    fn clear_cache(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::{LayerPayload, LuksVlm, Resource, VolumeData};
    use parking_lot::Mutex;

    #[derive(Default)]
    struct MockCrypt {
        luks_devices: Mutex<Vec<String>>,
        open_targets: Mutex<Vec<String>>,
        shredded: Mutex<Vec<String>>,
        resizes: Mutex<Vec<(String, Option<u64>)>>,
    }

    #[async_trait]
    impl CryptOps for MockCrypt {
        async fn is_luks(&self, _ctx: &BatchContext, device: &str) -> Result<bool> {
            Ok(self.luks_devices.lock().contains(&device.to_string()))
        }

        async fn format(&self, _ctx: &BatchContext, device: &str, _key: &[u8]) -> Result<()> {
            self.luks_devices.lock().push(device.to_string());
            Ok(())
        }

        async fn open(
            &self,
            _ctx: &BatchContext,
            _device: &str,
            target: &str,
            _key: &[u8],
        ) -> Result<()> {
            self.open_targets.lock().push(target.to_string());
            Ok(())
        }

        async fn resize(
            &self,
            _ctx: &BatchContext,
            target: &str,
            size_kib: Option<u64>,
            _key: &[u8],
        ) -> Result<()> {
            self.resizes.lock().push((target.to_string(), size_kib));
            Ok(())
        }

        async fn close(&self, _ctx: &BatchContext, target: &str) -> Result<()> {
            self.open_targets.lock().retain(|t| t != target);
            Ok(())
        }

        async fn is_open(&self, _ctx: &BatchContext, target: &str) -> Result<bool> {
            Ok(self.open_targets.lock().contains(&target.to_string()))
        }

        async fn shred_header(&self, _ctx: &BatchContext, device: &str) -> Result<()> {
            self.shredded.lock().push(device.to_string());
            Ok(())
        }
    }

    fn luks_vlm(key: Option<&[u8]>) -> VolumeData {
        VolumeData::new(LayerPayload::Luks(LuksVlm {
            key: key.map(<[u8]>::to_vec),
            ..Default::default()
        }))
    }

    #[test]
    fn test_crypt_target_name() {
        assert_eq!(crypt_target_name("rsc1", 0), "stackbd_crypt_rsc1_00000");
    }

    #[tokio::test]
    async fn test_missing_key_aborts_resource() {
        let ops = Arc::new(MockCrypt::default());
        let layer = LuksLayer::new(ops);
        let ctx = BatchContext::default();

        let mut tree = LayerTree::new();
        tree.add_resource(Resource::new("rsc1"));
        let node = tree.add_node("rsc1", LayerKind::Luks, "", None).unwrap();
        let child = tree
            .add_node("rsc1", LayerKind::Storage, "data", Some(node))
            .unwrap();
        tree.add_volume(node, 0, luks_vlm(None)).unwrap();
        let mut child_vlm =
            VolumeData::new_storage("vg0", crate::tree::ProviderKind::Lvm);
        child_vlm.state.exists = true;
        child_vlm.state.device_path = Some("/dev/vg0/rsc1_00000".into());
        tree.add_volume(child, 0, child_vlm).unwrap();

        let mut sink = ResponseSink::new();
        let err = layer
            .process_volume(&ctx, &mut tree, node, child, 0, &mut sink)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ResourceAbort { .. }));
        assert!(err.is_resource_scoped());
    }

    #[tokio::test]
    async fn test_format_and_open_fresh_volume() {
        let ops = Arc::new(MockCrypt::default());
        let layer = LuksLayer::new(ops.clone());
        let ctx = BatchContext::default();

        let mut tree = LayerTree::new();
        tree.add_resource(Resource::new("rsc1"));
        let node = tree.add_node("rsc1", LayerKind::Luks, "", None).unwrap();
        let child = tree
            .add_node("rsc1", LayerKind::Storage, "data", Some(node))
            .unwrap();
        tree.add_volume(node, 0, luks_vlm(Some(b"secret"))).unwrap();
        let mut child_vlm =
            VolumeData::new_storage("vg0", crate::tree::ProviderKind::Lvm);
        child_vlm.state.exists = true;
        child_vlm.state.device_path = Some("/dev/vg0/rsc1_00000".into());
        child_vlm.state.usable_kib = crate::sizes::GIB_IN_KIB + LUKS_HEADER_KIB;
        tree.add_volume(child, 0, child_vlm).unwrap();

        let mut sink = ResponseSink::new();
        layer
            .process_volume(&ctx, &mut tree, node, child, 0, &mut sink)
            .await
            .unwrap();

        assert_eq!(ops.luks_devices.lock().len(), 1);
        assert_eq!(ops.open_targets.lock().len(), 1);
        let state = &tree.vlm(node, 0).unwrap().state;
        assert!(state.exists);
        assert_eq!(
            state.device_path.as_deref(),
            Some("/dev/mapper/stackbd_crypt_rsc1_00000")
        );
        // header overhead subtracted from what the child provides
        assert_eq!(state.usable_kib, crate::sizes::GIB_IN_KIB);
    }

    #[tokio::test]
    async fn test_shrink_request_narrows_mapping_before_child() {
        use crate::tree::{VolumeDefinition, VolumeFlags};

        let ops = Arc::new(MockCrypt::default());
        let layer = LuksLayer::new(ops.clone());
        let ctx = BatchContext::default();

        let target_usable = crate::sizes::GIB_IN_KIB / 2;
        let mut tree = LayerTree::new();
        let mut rsc = Resource::new("rsc1");
        rsc.volume_dfns.insert(
            0,
            VolumeDefinition {
                size_kib: target_usable,
                flags: VolumeFlags::default(),
            },
        );
        tree.add_resource(rsc);
        let node = tree.add_node("rsc1", LayerKind::Luks, "", None).unwrap();
        let child = tree
            .add_node("rsc1", LayerKind::Storage, "data", Some(node))
            .unwrap();
        let mut vlm = luks_vlm(Some(b"secret"));
        vlm.as_luks_mut().unwrap().opened = true;
        vlm.state.exists = true;
        vlm.state.usable_kib = target_usable;
        vlm.state.expected_kib = target_usable + LUKS_HEADER_KIB;
        tree.add_volume(node, 0, vlm).unwrap();
        let mut child_vlm = VolumeData::new_storage("vg0", crate::tree::ProviderKind::Lvm);
        child_vlm.state.exists = true;
        child_vlm.state.device_path = Some("/dev/vg0/rsc1_00000".into());
        child_vlm.state.allocated_kib = crate::sizes::GIB_IN_KIB + LUKS_HEADER_KIB;
        tree.add_volume(child, 0, child_vlm).unwrap();

        // without the resize flag the oversized mapping is left alone
        let mut sink = ResponseSink::new();
        layer
            .shrink_volume(&ctx, &mut tree, node, child, 0, &mut sink)
            .await
            .unwrap();
        assert!(ops.resizes.lock().is_empty());

        tree.resource_mut("rsc1")
            .unwrap()
            .volume_dfns
            .get_mut(&0)
            .unwrap()
            .flags
            .resize = true;
        layer
            .shrink_volume(&ctx, &mut tree, node, child, 0, &mut sink)
            .await
            .unwrap();
        assert_eq!(
            ops.resizes.lock().as_slice(),
            [(
                "stackbd_crypt_rsc1_00000".to_string(),
                Some(target_usable)
            )]
        );
    }

    #[tokio::test]
    async fn test_delete_closes_and_shreds() {
        let ops = Arc::new(MockCrypt::default());
        let layer = LuksLayer::new(ops.clone());
        let ctx = BatchContext::default();

        let mut tree = LayerTree::new();
        tree.add_resource(Resource::new("rsc1"));
        let node = tree.add_node("rsc1", LayerKind::Luks, "", None).unwrap();
        let child = tree
            .add_node("rsc1", LayerKind::Storage, "data", Some(node))
            .unwrap();
        let mut vlm = luks_vlm(Some(b"secret"));
        vlm.as_luks_mut().unwrap().opened = true;
        vlm.state.exists = true;
        tree.add_volume(node, 0, vlm).unwrap();
        ops.open_targets
            .lock()
            .push("stackbd_crypt_rsc1_00000".to_string());
        let mut child_vlm =
            VolumeData::new_storage("vg0", crate::tree::ProviderKind::Lvm);
        child_vlm.state.exists = true;
        child_vlm.state.device_path = Some("/dev/vg0/rsc1_00000".into());
        tree.add_volume(child, 0, child_vlm).unwrap();

        let mut sink = ResponseSink::new();
        layer
            .delete_volume(&ctx, &mut tree, node, child, 0, &mut sink)
            .await
            .unwrap();

        assert!(ops.open_targets.lock().is_empty());
        assert_eq!(ops.shredded.lock().as_slice(), ["/dev/vg0/rsc1_00000"]);
        assert!(!tree.vlm(node, 0).unwrap().state.exists);
    }
}
