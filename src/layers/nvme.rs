//! NVMe-oF layer (and its Openflex variant)
//!
//! A node with children is the target side: it exports the child device
//! through the kernel nvmet configfs tree and provides no local device to
//! layers above. A node without children is the initiator side: it
//! connects to the remote subsystem by NQN and surfaces the fabric block
//! device. The Openflex variant is initiator-only; the target is an
//! external appliance.

use crate::adapters::nvme as nvme_cli;
use crate::batch::BatchContext;
use crate::error::{Error, Result};
use crate::layers::{
    DeviceLayer, LayerKind, LayerRegistry, NotificationSink, ProcessResult, ResponseSink,
    UsageNotification,
};
use crate::tree::{LayerTree, NodeId, NvmeTargetDef};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

const DEFAULT_TRANSPORT: &str = "tcp";
const DEFAULT_PORT: u16 = 4420;

// =============================================================================
// NVMe port
// =============================================================================

#[async_trait]
pub trait NvmeOps: Send + Sync {
    async fn connect(
        &self,
        ctx: &BatchContext,
        nqn: &str,
        transport: &str,
        address: &str,
        port: u16,
    ) -> Result<()>;
    async fn disconnect(&self, ctx: &BatchContext, nqn: &str) -> Result<()>;
    /// Local block device for namespace `nsid` of a connected subsystem
    async fn device_path(
        &self,
        ctx: &BatchContext,
        nqn: &str,
        nsid: u32,
    ) -> Result<Option<String>>;

    async fn target_exists(&self, ctx: &BatchContext, nqn: &str) -> Result<bool>;
    async fn create_target_namespace(
        &self,
        ctx: &BatchContext,
        nqn: &str,
        nsid: u32,
        device: &str,
    ) -> Result<()>;
    async fn delete_target(&self, ctx: &BatchContext, nqn: &str) -> Result<()>;
}

/// Production implementation: nvme-cli on the initiator side, the nvmet
/// configfs tree on the target side
pub struct NvmeCliOps {
    nvmet_dir: String,
}

impl NvmeCliOps {
    pub fn new(nvmet_dir: impl Into<String>) -> Self {
        Self {
            nvmet_dir: nvmet_dir.into(),
        }
    }

    fn subsystem_dir(&self, nqn: &str) -> String {
        format!("{}/subsystems/{}", self.nvmet_dir, nqn)
    }
}

impl Default for NvmeCliOps {
    fn default() -> Self {
        Self::new("/sys/kernel/config/nvmet")
    }
}

#[async_trait]
impl NvmeOps for NvmeCliOps {
    async fn connect(
        &self,
        ctx: &BatchContext,
        nqn: &str,
        transport: &str,
        address: &str,
        port: u16,
    ) -> Result<()> {
        nvme_cli::connect(ctx.runner(), nqn, transport, address, port).await
    }

    async fn disconnect(&self, ctx: &BatchContext, nqn: &str) -> Result<()> {
        nvme_cli::disconnect(ctx.runner(), nqn).await
    }

    async fn device_path(
        &self,
        ctx: &BatchContext,
        nqn: &str,
        nsid: u32,
    ) -> Result<Option<String>> {
        let subsystems = nvme_cli::list_subsystems(ctx.runner()).await?;
        Ok(subsystems
            .into_iter()
            .find(|s| s.nqn == nqn)
            .map(|s| nvme_cli::namespace_path(&s.controller, nsid)))
    }

    async fn target_exists(&self, _ctx: &BatchContext, nqn: &str) -> Result<bool> {
        Ok(tokio::fs::try_exists(self.subsystem_dir(nqn)).await?)
    }

    async fn create_target_namespace(
        &self,
        _ctx: &BatchContext,
        nqn: &str,
        nsid: u32,
        device: &str,
    ) -> Result<()> {
        let subsys = self.subsystem_dir(nqn);
        let ns_dir = format!("{}/namespaces/{}", subsys, nsid);
        tokio::fs::create_dir_all(&ns_dir).await?;
        tokio::fs::write(format!("{}/attr_allow_any_host", subsys), "1").await?;
        tokio::fs::write(format!("{}/device_path", ns_dir), device).await?;
        tokio::fs::write(format!("{}/enable", ns_dir), "1").await?;

        // expose the subsystem on the first configured port
        let link = format!("{}/ports/1/subsystems/{}", self.nvmet_dir, nqn);
        if !tokio::fs::try_exists(&link).await? {
            std::os::unix::fs::symlink(&subsys, &link)?;
        }
        Ok(())
    }

    async fn delete_target(&self, _ctx: &BatchContext, nqn: &str) -> Result<()> {
        let link = format!("{}/ports/1/subsystems/{}", self.nvmet_dir, nqn);
        if tokio::fs::try_exists(&link).await? {
            tokio::fs::remove_file(&link).await?;
        }
        let subsys = self.subsystem_dir(nqn);
        let ns_root = format!("{}/namespaces", subsys);
        if tokio::fs::try_exists(&ns_root).await? {
            let mut entries = tokio::fs::read_dir(&ns_root).await?;
            while let Some(entry) = entries.next_entry().await? {
                tokio::fs::remove_dir(entry.path()).await?;
            }
            tokio::fs::remove_dir(&subsys).await?;
        }
        Ok(())
    }
}

// =============================================================================
// Layer
// =============================================================================

pub struct NvmeLayer {
    ops: Arc<dyn NvmeOps>,
    kind: LayerKind,
}

impl NvmeLayer {
    pub fn new(ops: Arc<dyn NvmeOps>) -> Self {
        Self {
            ops,
            kind: LayerKind::Nvme,
        }
    }

    /// Initiator-only variant for external appliance targets
    pub fn openflex(ops: Arc<dyn NvmeOps>) -> Self {
        Self {
            ops,
            kind: LayerKind::Openflex,
        }
    }

    fn def_of(tree: &LayerTree, node: NodeId) -> Result<NvmeTargetDef> {
        tree.resource_of(node)?.nvme_def.clone().ok_or_else(|| {
            Error::Configuration(format!(
                "resource '{}' carries an NVMe layer without a target definition",
                tree.node(node).map(|n| n.resource.clone()).unwrap_or_default()
            ))
        })
    }

    fn is_target(&self, tree: &LayerTree, node: NodeId) -> Result<bool> {
        let has_children = !tree.node(node)?.children.is_empty();
        if has_children && self.kind == LayerKind::Openflex {
            return Err(Error::Configuration(
                "openflex resources cannot be a local target".to_string(),
            ));
        }
        Ok(has_children)
    }

    fn single_child(tree: &LayerTree, node: NodeId) -> Result<NodeId> {
        tree.node(node)?
            .children
            .values()
            .next()
            .copied()
            .ok_or_else(|| Error::Internal(format!("nvme target node {} has no child", node)))
    }

    async fn process_initiator(
        &self,
        ctx: &BatchContext,
        tree: &mut LayerTree,
        node: NodeId,
        sink: &mut ResponseSink,
        deleting: bool,
    ) -> Result<ProcessResult> {
        let def = Self::def_of(tree, node)?;
        let rsc_name = tree.node(node)?.resource.clone();
        let vlm_nrs = tree.vlm_nrs(node)?;

        if deleting {
            let any_connected = vlm_nrs
                .iter()
                .any(|nr| tree.vlm(node, *nr).map(|v| v.state.exists).unwrap_or(false));
            if any_connected {
                self.ops.disconnect(ctx, &def.nqn).await?;
                sink.info(format!("Disconnected from '{}'", def.nqn));
            }
            for vlm_nr in vlm_nrs {
                let data = tree.vlm_mut(node, vlm_nr)?;
                data.as_nvme_mut()?.connected = false;
                data.state.set_exists(false);
            }
            return Ok(ProcessResult::Success);
        }

        let connected = self.ops.device_path(ctx, &def.nqn, 1).await?.is_some();
        if !connected {
            self.ops
                .connect(
                    ctx,
                    &def.nqn,
                    DEFAULT_TRANSPORT,
                    &def.transport_address,
                    DEFAULT_PORT,
                )
                .await?;
            debug!("Connected to NVMe subsystem {}", def.nqn);
        }

        for vlm_nr in vlm_nrs {
            let nsid = vlm_nr + 1;
            let path = self
                .ops
                .device_path(ctx, &def.nqn, nsid)
                .await?
                .ok_or_else(|| {
                    Error::abort(
                        &rsc_name,
                        format!("namespace {} of '{}' did not appear", nsid, def.nqn),
                    )
                })?;
            let data = tree.vlm_mut(node, vlm_nr)?;
            data.as_nvme_mut()?.connected = true;
            data.state.exists = true;
            data.state.identifier = def.nqn.clone();
            data.state.device_path = Some(path);
            // the remote side guarantees the negotiated size
            data.state.usable_kib = data.state.expected_kib;
            data.state.allocated_kib = data.state.expected_kib;
        }
        Ok(ProcessResult::Success)
    }

    async fn process_target(
        &self,
        registry: &LayerRegistry,
        ctx: &BatchContext,
        tree: &mut LayerTree,
        node: NodeId,
        sink: &mut ResponseSink,
        deleting: bool,
    ) -> Result<ProcessResult> {
        let def = Self::def_of(tree, node)?;
        let child = Self::single_child(tree, node)?;

        if deleting {
            if self.ops.target_exists(ctx, &def.nqn).await? {
                self.ops.delete_target(ctx, &def.nqn).await?;
                sink.info(format!("Target '{}' removed", def.nqn));
            }
            for vlm_nr in tree.vlm_nrs(node)? {
                tree.vlm_mut(node, vlm_nr)?.state.set_exists(false);
            }
            return registry.process_node(ctx, tree, child, sink).await;
        }

        let child_result = registry.process_node(ctx, tree, child, sink).await?;
        if child_result == ProcessResult::NoDevicesProvided {
            return Ok(ProcessResult::NoDevicesProvided);
        }

        for vlm_nr in tree.vlm_nrs(node)? {
            let device = tree
                .vlm(child, vlm_nr)?
                .state
                .device_path
                .clone()
                .ok_or_else(|| {
                    Error::Internal(format!("child of nvme target node {} has no device", node))
                })?;
            self.ops
                .create_target_namespace(ctx, &def.nqn, vlm_nr + 1, &device)
                .await?;
            let child_usable = tree.vlm(child, vlm_nr)?.state.usable_kib;
            let child_allocated = tree.vlm(child, vlm_nr)?.state.allocated_kib;
            let data = tree.vlm_mut(node, vlm_nr)?;
            data.as_nvme_mut()?.connected = true;
            data.state.exists = true;
            data.state.identifier = def.nqn.clone();
            data.state.usable_kib = child_usable;
            data.state.allocated_kib = child_allocated;
        }
        // the device lives behind the fabric; nothing stacks locally on top
        Ok(ProcessResult::NoDevicesProvided)
    }
}

#[async_trait]
impl DeviceLayer for NvmeLayer {
    fn kind(&self) -> LayerKind {
        self.kind
    }

    async fn prepare(
        &self,
        ctx: &BatchContext,
        tree: &mut LayerTree,
        nodes: &[NodeId],
    ) -> Result<()> {
        for &node in nodes {
            if tree.node(node)?.kind != self.kind {
                continue;
            }
            let def = Self::def_of(tree, node)?;
            if self.is_target(tree, node)? {
                let exists = self.ops.target_exists(ctx, &def.nqn).await?;
                for vlm_nr in tree.vlm_nrs(node)? {
                    let data = tree.vlm_mut(node, vlm_nr)?;
                    data.as_nvme_mut()?.connected = exists;
                    data.state.exists = exists;
                    data.state.identifier = def.nqn.clone();
                }
            } else {
                for vlm_nr in tree.vlm_nrs(node)? {
                    let path = self.ops.device_path(ctx, &def.nqn, vlm_nr + 1).await?;
                    let data = tree.vlm_mut(node, vlm_nr)?;
                    data.as_nvme_mut()?.connected = path.is_some();
                    data.state.identifier = def.nqn.clone();
                    match path {
                        Some(path) => {
                            data.state.exists = true;
                            data.state.device_path = Some(path);
                        }
                        None => data.state.set_exists(false),
                    }
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
        let rsc_name = tree.node(node)?.resource.clone();
        let deleting = !tree.resource(&rsc_name)?.should_exist();
        if self.is_target(tree, node)? {
            self.process_target(registry, ctx, tree, node, sink, deleting)
                .await
        } else {
            self.process_initiator(ctx, tree, node, sink, deleting).await
        }
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
        let usable = tree.vlm(node, vlm_nr)?.state.usable_kib;
        tree.vlm_mut(node, vlm_nr)?.state.expected_kib = usable;
        if !tree.node(node)?.children.is_empty() {
            let child = Self::single_child(tree, node)?;
            tree.vlm_mut(child, vlm_nr)?.state.usable_kib = usable;
            registry.update_allocated_from_usable(tree, child, vlm_nr)?;
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
        if tree.node(node)?.children.is_empty() {
            let data = tree.vlm_mut(node, vlm_nr)?;
            data.state.usable_kib = data.state.allocated_kib;
        } else {
            let child = Self::single_child(tree, node)?;
            registry.update_usable_from_allocated(tree, child, vlm_nr)?;
            let child_usable = tree.vlm(child, vlm_nr)?.state.usable_kib;
            let child_allocated = tree.vlm(child, vlm_nr)?.state.allocated_kib;
            let data = tree.vlm_mut(node, vlm_nr)?;
            data.state.usable_kib = child_usable;
            data.state.allocated_kib = child_allocated;
        }
        Ok(())
    }

    fn clear_cache(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::{LayerPayload, NvmeVlm, Resource, VolumeData};
    use parking_lot::Mutex;

    #[derive(Default)]
    struct MockNvme {
        connected: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl NvmeOps for MockNvme {
        async fn connect(
            &self,
            _ctx: &BatchContext,
            nqn: &str,
            _transport: &str,
            _address: &str,
            _port: u16,
        ) -> Result<()> {
            self.connected.lock().push(nqn.to_string());
            Ok(())
        }

        async fn disconnect(&self, _ctx: &BatchContext, nqn: &str) -> Result<()> {
            self.connected.lock().retain(|n| n != nqn);
            Ok(())
        }

        async fn device_path(
            &self,
            _ctx: &BatchContext,
            nqn: &str,
            nsid: u32,
        ) -> Result<Option<String>> {
            Ok(self
                .connected
                .lock()
                .contains(&nqn.to_string())
                .then(|| format!("/dev/nvme0n{}", nsid)))
        }

        async fn target_exists(&self, _ctx: &BatchContext, _nqn: &str) -> Result<bool> {
            Ok(false)
        }

        async fn create_target_namespace(
            &self,
            _ctx: &BatchContext,
            _nqn: &str,
            _nsid: u32,
            _device: &str,
        ) -> Result<()> {
            Ok(())
        }

        async fn delete_target(&self, _ctx: &BatchContext, _nqn: &str) -> Result<()> {
            Ok(())
        }
    }

    fn initiator_tree(kind: LayerKind) -> (LayerTree, NodeId) {
        let mut tree = LayerTree::new();
        let mut rsc = Resource::new("rsc1");
        rsc.nvme_def = Some(NvmeTargetDef {
            nqn: "nqn.2014-08.io.stackbd:rsc1".to_string(),
            transport_address: "192.168.1.10".to_string(),
        });
        tree.add_resource(rsc);
        let node = tree.add_node("rsc1", kind, "", None).unwrap();
        let mut vlm = VolumeData::new(LayerPayload::Nvme(NvmeVlm::default()));
        vlm.state.expected_kib = crate::sizes::GIB_IN_KIB;
        tree.add_volume(node, 0, vlm).unwrap();
        (tree, node)
    }

    #[tokio::test]
    async fn test_initiator_connects_and_finds_device() {
        let ops = Arc::new(MockNvme::default());
        let layer = NvmeLayer::new(ops.clone());
        let ctx = BatchContext::default();
        let (mut tree, node) = initiator_tree(LayerKind::Nvme);

        let mut sink = ResponseSink::new();
        let result = layer
            .process_initiator(&ctx, &mut tree, node, &mut sink, false)
            .await
            .unwrap();
        assert_eq!(result, ProcessResult::Success);

        let state = &tree.vlm(node, 0).unwrap().state;
        assert!(state.exists);
        assert_eq!(state.device_path.as_deref(), Some("/dev/nvme0n1"));
        assert_eq!(state.usable_kib, crate::sizes::GIB_IN_KIB);
        assert_eq!(ops.connected.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_initiator_disconnects_on_delete() {
        let ops = Arc::new(MockNvme::default());
        let layer = NvmeLayer::new(ops.clone());
        let ctx = BatchContext::default();
        let (mut tree, node) = initiator_tree(LayerKind::Nvme);

        ops.connected
            .lock()
            .push("nqn.2014-08.io.stackbd:rsc1".to_string());
        tree.vlm_mut(node, 0).unwrap().state.exists = true;
        tree.resource_mut("rsc1").unwrap().flags.delete = true;

        let mut sink = ResponseSink::new();
        layer
            .process_initiator(&ctx, &mut tree, node, &mut sink, true)
            .await
            .unwrap();
        assert!(ops.connected.lock().is_empty());
        assert!(!tree.vlm(node, 0).unwrap().state.exists);
    }

    #[test]
    fn test_openflex_rejects_target_role() {
        let ops = Arc::new(MockNvme::default());
        let layer = NvmeLayer::openflex(ops);
        let (mut tree, node) = initiator_tree(LayerKind::Openflex);
        tree.add_node("rsc1", LayerKind::Storage, "data", Some(node))
            .unwrap();
        assert!(layer.is_target(&tree, node).is_err());
    }
}
