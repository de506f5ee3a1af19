//! DRBD replication layer
//!
//! Renders one resource file per resource, converges kernel state through
//! `drbdadm adjust` and manages metadata. Children must have settled at
//! their expected sizes before metadata is created or an adjust is issued;
//! anything else risks replicating into a short device.

use crate::adapters::drbd::{self, DrbdStatus};
use crate::batch::BatchContext;
use crate::error::{Error, Result};
use crate::layers::{
    suffixes, DeviceLayer, LayerKind, LayerRegistry, NotificationSink, ProcessResult,
    ResponseSink, UsageNotification,
};
use crate::sizes::drbd_external_meta_size_kib;
use crate::tree::{DrbdResourceDef, LayerTree, NodeId};
use async_trait::async_trait;
use std::fmt::Write as _;
use std::sync::Arc;
use tracing::debug;

// =============================================================================
// DRBD port
// =============================================================================

#[async_trait]
pub trait DrbdOps: Send + Sync {
    async fn status(&self, ctx: &BatchContext, resource: &str) -> Result<Option<DrbdStatus>>;
    async fn adjust(&self, ctx: &BatchContext, resource: &str) -> Result<()>;
    async fn down(&self, ctx: &BatchContext, resource: &str) -> Result<()>;
    async fn suspend_io(&self, ctx: &BatchContext, resource: &str) -> Result<()>;
    async fn resume_io(&self, ctx: &BatchContext, resource: &str) -> Result<()>;
    async fn resize(&self, ctx: &BatchContext, resource: &str, vlm_nr: u32) -> Result<()>;
    async fn create_md(
        &self,
        ctx: &BatchContext,
        resource: &str,
        vlm_nr: u32,
        peer_slots: u8,
    ) -> Result<()>;
    async fn has_meta_data(
        &self,
        ctx: &BatchContext,
        minor: u32,
        meta_device: &str,
        internal: bool,
    ) -> Result<bool>;
    async fn wipe_md(&self, ctx: &BatchContext, resource: &str, vlm_nr: u32) -> Result<()>;
    async fn write_res_file(&self, resource: &str, content: &str) -> Result<()>;
    async fn delete_res_file(&self, resource: &str) -> Result<()>;
}

/// Production implementation over drbd-utils and the config directory
pub struct DrbdAdmOps {
    config_dir: String,
}

impl DrbdAdmOps {
    pub fn new(config_dir: impl Into<String>) -> Self {
        Self {
            config_dir: config_dir.into(),
        }
    }

    fn res_path(&self, resource: &str) -> String {
        format!("{}/{}.res", self.config_dir, resource)
    }
}

#[async_trait]
impl DrbdOps for DrbdAdmOps {
    async fn status(&self, ctx: &BatchContext, resource: &str) -> Result<Option<DrbdStatus>> {
        drbd::status(ctx.runner(), resource).await
    }

    async fn adjust(&self, ctx: &BatchContext, resource: &str) -> Result<()> {
        drbd::adjust(ctx.runner(), &self.config_dir, resource).await
    }

    async fn down(&self, ctx: &BatchContext, resource: &str) -> Result<()> {
        drbd::down(ctx.runner(), &self.config_dir, resource).await
    }

    async fn suspend_io(&self, ctx: &BatchContext, resource: &str) -> Result<()> {
        drbd::suspend_io(ctx.runner(), &self.config_dir, resource).await
    }

    async fn resume_io(&self, ctx: &BatchContext, resource: &str) -> Result<()> {
        drbd::resume_io(ctx.runner(), &self.config_dir, resource).await
    }

    async fn resize(&self, ctx: &BatchContext, resource: &str, vlm_nr: u32) -> Result<()> {
        drbd::resize(ctx.runner(), &self.config_dir, resource, vlm_nr).await
    }

    async fn create_md(
        &self,
        ctx: &BatchContext,
        resource: &str,
        vlm_nr: u32,
        peer_slots: u8,
    ) -> Result<()> {
        drbd::create_md(ctx.runner(), &self.config_dir, resource, vlm_nr, peer_slots).await
    }

    async fn has_meta_data(
        &self,
        ctx: &BatchContext,
        minor: u32,
        meta_device: &str,
        internal: bool,
    ) -> Result<bool> {
        drbd::has_meta_data(ctx.runner(), minor, meta_device, internal).await
    }

    async fn wipe_md(&self, ctx: &BatchContext, resource: &str, vlm_nr: u32) -> Result<()> {
        drbd::wipe_md(ctx.runner(), &self.config_dir, resource, vlm_nr).await
    }

    async fn write_res_file(&self, resource: &str, content: &str) -> Result<()> {
        tokio::fs::write(self.res_path(resource), content).await?;
        Ok(())
    }

    async fn delete_res_file(&self, resource: &str) -> Result<()> {
        match tokio::fs::remove_file(self.res_path(resource)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

// =============================================================================
// Resource file rendering
// =============================================================================

/// Render the local view of a resource file: definition data plus one
/// volume section per volume with its backing (and metadata) device
pub fn render_res_file(tree: &LayerTree, node: NodeId) -> Result<String> {
    let layer_node = tree.node(node)?;
    let rsc = tree.resource_of(node)?;
    let def = rsc
        .drbd_def
        .as_ref()
        .ok_or_else(|| Error::Configuration(format!("resource '{}' has no DRBD definition", rsc.name)))?;

    let data_child = tree
        .child_by_suffix(node, suffixes::DATA)?
        .ok_or_else(|| Error::Internal(format!("drbd node {} has no data child", node)))?;
    let meta_child = tree.child_by_suffix(node, suffixes::META)?;

    let mut out = String::new();
    writeln!(out, "resource \"{}\" {{", layer_node.resource).ok();
    writeln!(out, "    options {{").ok();
    writeln!(out, "        quorum majority;").ok();
    writeln!(out, "        on-no-quorum io-error;").ok();
    writeln!(out, "    }}").ok();
    writeln!(out, "    net {{").ok();
    writeln!(out, "        cram-hmac-alg sha1;").ok();
    writeln!(out, "        shared-secret \"{}\";", def.shared_secret).ok();
    writeln!(out, "        transport \"{}\";", def.transport).ok();
    writeln!(out, "    }}").ok();
    writeln!(out, "    on \"localhost\" {{").ok();
    writeln!(out, "        node-id {};", def.node_id).ok();
    for (vlm_nr, data) in &layer_node.volumes {
        let drbd_vlm = data.as_drbd()?;
        let backing = tree
            .vlm(data_child, *vlm_nr)?
            .state
            .device_path
            .clone()
            .unwrap_or_else(|| "none".to_string());
        writeln!(out, "        volume {} {{", vlm_nr).ok();
        writeln!(out, "            device minor {};", drbd_vlm.minor).ok();
        writeln!(out, "            disk \"{}\";", backing).ok();
        match meta_child {
            Some(meta) => {
                let meta_device = tree
                    .vlm(meta, *vlm_nr)?
                    .state
                    .device_path
                    .clone()
                    .unwrap_or_else(|| "none".to_string());
                writeln!(out, "            meta-disk \"{}\";", meta_device).ok();
            }
            None => {
                writeln!(out, "            meta-disk internal;").ok();
            }
        }
        writeln!(out, "        }}").ok();
    }
    writeln!(out, "    }}").ok();
    writeln!(out, "}}").ok();
    Ok(out)
}

// =============================================================================
// Layer
// =============================================================================

pub struct DrbdLayer {
    ops: Arc<dyn DrbdOps>,
}

impl DrbdLayer {
    pub fn new(ops: Arc<dyn DrbdOps>) -> Self {
        Self { ops }
    }

    fn data_child(tree: &LayerTree, node: NodeId) -> Result<NodeId> {
        tree.child_by_suffix(node, suffixes::DATA)?
            .ok_or_else(|| Error::Internal(format!("drbd node {} has no data child", node)))
    }

    fn def_of(tree: &LayerTree, node: NodeId) -> Result<DrbdResourceDef> {
        tree.resource_of(node)?
            .drbd_def
            .clone()
            .ok_or_else(|| {
                Error::Configuration(format!(
                    "resource '{}' carries a DRBD layer without a DRBD definition",
                    tree.node(node).map(|n| n.resource.clone()).unwrap_or_default()
                ))
            })
    }

    /// Children must have converged to their expected sizes before DRBD is
    /// told about them
    fn verify_children_sizes(
        tree: &LayerTree,
        node: NodeId,
        rsc_name: &str,
    ) -> Result<()> {
        let data_child = Self::data_child(tree, node)?;
        let meta_child = tree.child_by_suffix(node, suffixes::META)?;
        for vlm_nr in tree.vlm_nrs(node)? {
            let data_ok = tree
                .vlm(data_child, vlm_nr)?
                .state
                .size_state
                .map(|s| s.is_as_expected())
                .unwrap_or(false);
            let meta_ok = match meta_child {
                Some(meta) => tree
                    .vlm(meta, vlm_nr)?
                    .state
                    .size_state
                    .map(|s| s.is_as_expected())
                    .unwrap_or(false),
                None => true,
            };
            if !data_ok || !meta_ok {
                return Err(Error::abort(
                    rsc_name,
                    format!(
                        "backing device of volume {} has not settled at its expected size",
                        vlm_nr
                    ),
                ));
            }
        }
        Ok(())
    }

    async fn ensure_meta_data(
        &self,
        ctx: &BatchContext,
        tree: &mut LayerTree,
        node: NodeId,
        rsc_name: &str,
        def: &DrbdResourceDef,
    ) -> Result<()> {
        let data_child = Self::data_child(tree, node)?;
        let meta_child = tree.child_by_suffix(node, suffixes::META)?;
        for vlm_nr in tree.vlm_nrs(node)? {
            if tree.vlm(node, vlm_nr)?.as_drbd()?.has_meta_data {
                continue;
            }
            let minor = tree.vlm(node, vlm_nr)?.as_drbd()?.minor;
            let (meta_device, internal) = match meta_child {
                Some(meta) => (
                    tree.vlm(meta, vlm_nr)?
                        .state
                        .device_path
                        .clone()
                        .ok_or_else(|| {
                            Error::Internal(format!("meta child of node {} has no device", node))
                        })?,
                    false,
                ),
                None => (
                    tree.vlm(data_child, vlm_nr)?
                        .state
                        .device_path
                        .clone()
                        .ok_or_else(|| {
                            Error::Internal(format!("data child of node {} has no device", node))
                        })?,
                    true,
                ),
            };
            let present = self
                .ops
                .has_meta_data(ctx, minor, &meta_device, internal)
                .await?;
            if !present {
                self.ops
                    .create_md(ctx, rsc_name, vlm_nr, def.peer_slots)
                    .await?;
                debug!("Created DRBD metadata for {}/{}", rsc_name, vlm_nr);
            }
            tree.vlm_mut(node, vlm_nr)?.as_drbd_mut()?.has_meta_data = true;
        }
        Ok(())
    }

    /// Full teardown of a deleting resource: down, wipe the metadata while
    /// the res file still exists, then drop the res file
    async fn tear_down(
        &self,
        ctx: &BatchContext,
        tree: &mut LayerTree,
        node: NodeId,
        rsc_name: &str,
        sink: &mut ResponseSink,
    ) -> Result<()> {
        let any_exists = tree
            .vlm_nrs(node)?
            .iter()
            .any(|nr| tree.vlm(node, *nr).map(|v| v.state.exists).unwrap_or(false));
        if any_exists {
            self.ops.down(ctx, rsc_name).await?;
            sink.info(format!("DRBD resource '{}' taken down", rsc_name));
            for vlm_nr in tree.vlm_nrs(node)? {
                let vlm = tree.vlm(node, vlm_nr)?;
                if vlm.state.exists && vlm.as_drbd()?.has_meta_data {
                    self.ops.wipe_md(ctx, rsc_name, vlm_nr).await?;
                    tree.vlm_mut(node, vlm_nr)?.as_drbd_mut()?.has_meta_data = false;
                }
            }
        }
        self.ops.delete_res_file(rsc_name).await?;
        for vlm_nr in tree.vlm_nrs(node)? {
            tree.vlm_mut(node, vlm_nr)?.state.set_exists(false);
        }
        Ok(())
    }
}

#[async_trait]
impl DeviceLayer for DrbdLayer {
    fn kind(&self) -> LayerKind {
        LayerKind::Drbd
    }

    async fn prepare(
        &self,
        ctx: &BatchContext,
        tree: &mut LayerTree,
        nodes: &[NodeId],
    ) -> Result<()> {
        for &node in nodes {
            let rsc_name = tree.node(node)?.resource.clone();
            let status = self.ops.status(ctx, &rsc_name).await?;
            let role = status.as_ref().map(|s| s.role.clone());
            let may_promote = status.as_ref().map(|s| s.may_promote).unwrap_or(false);
            for vlm_nr in tree.vlm_nrs(node)? {
                let disk_state = status.as_ref().and_then(|s| {
                    s.devices
                        .iter()
                        .find(|(nr, _)| *nr == vlm_nr)
                        .map(|(_, state)| state.clone())
                });
                let data = tree.vlm_mut(node, vlm_nr)?;
                let minor = data.as_drbd()?.minor;
                {
                    let drbd = data.as_drbd_mut()?;
                    drbd.disk_state = disk_state.clone();
                    drbd.role = role.clone();
                    drbd.may_promote = may_promote;
                }
                if disk_state.is_some() {
                    data.state.exists = true;
                    data.state.device_path = Some(drbd::drbd_device_path(minor));
                    // the kernel knows the device, so metadata must exist
                    data.as_drbd_mut()?.has_meta_data = true;
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
        let data_child = Self::data_child(tree, node)?;
        let meta_child = tree.child_by_suffix(node, suffixes::META)?;
        let rsc_name = tree.node(node)?.resource.clone();
        let deleting = !tree.resource(&rsc_name)?.should_exist();

        if deleting {
            self.tear_down(ctx, tree, node, &rsc_name, sink).await?;
            let result = registry.process_node(ctx, tree, data_child, sink).await?;
            if let Some(meta) = meta_child {
                registry.process_node(ctx, tree, meta, sink).await?;
            }
            return Ok(result);
        }

        let data_result = registry.process_node(ctx, tree, data_child, sink).await?;
        if let Some(meta) = meta_child {
            registry.process_node(ctx, tree, meta, sink).await?;
        }
        if data_result == ProcessResult::NoDevicesProvided {
            // diskless on this node; the resource file still has to exist
            // so the connection can be established
            let content = render_res_file(tree, node)?;
            self.ops.write_res_file(&rsc_name, &content).await?;
            self.ops.adjust(ctx, &rsc_name).await?;
            return Ok(ProcessResult::NoDevicesProvided);
        }

        let def = Self::def_of(tree, node)?;
        Self::verify_children_sizes(tree, node, &rsc_name)?;
        self.ensure_meta_data(ctx, tree, node, &rsc_name, &def)
            .await?;

        let content = render_res_file(tree, node)?;
        self.ops.write_res_file(&rsc_name, &content).await?;
        self.ops.adjust(ctx, &rsc_name).await?;

        // explicit resize requests propagate into the replication size
        for vlm_nr in tree.vlm_nrs(node)? {
            let resize = tree
                .resource(&rsc_name)?
                .volume_dfns
                .get(&vlm_nr)
                .map(|dfn| dfn.flags.resize)
                .unwrap_or(false);
            if resize && tree.vlm(node, vlm_nr)?.state.exists {
                self.ops.resize(ctx, &rsc_name, vlm_nr).await?;
                sink.info(format!("DRBD volume {} resized", vlm_nr));
            }
        }

        let suspend = tree.resource(&rsc_name)?.suspend_io;
        let post_status = self.ops.status(ctx, &rsc_name).await?;
        let currently_suspended = post_status.as_ref().map(|s| s.suspended).unwrap_or(false);
        if suspend && !currently_suspended {
            self.ops.suspend_io(ctx, &rsc_name).await?;
            sink.info(format!("IO on '{}' suspended", rsc_name));
        } else if !suspend && currently_suspended {
            self.ops.resume_io(ctx, &rsc_name).await?;
            sink.info(format!("IO on '{}' resumed", rsc_name));
        }

        let data_usable = |tree: &LayerTree, vlm_nr: u32| -> Result<u64> {
            Ok(tree.vlm(data_child, vlm_nr)?.state.usable_kib)
        };
        for vlm_nr in tree.vlm_nrs(node)? {
            let child_usable = data_usable(tree, vlm_nr)?;
            let child_allocated = tree.vlm(data_child, vlm_nr)?.state.allocated_kib;
            let meta_allocated = match meta_child {
                Some(meta) => tree.vlm(meta, vlm_nr)?.state.allocated_kib,
                None => 0,
            };
            let usable = match meta_child {
                Some(_) => child_usable,
                None => child_usable.saturating_sub(drbd_external_meta_size_kib(
                    child_usable,
                    def.peer_slots,
                    def.al_stripes,
                )),
            };
            let data = tree.vlm_mut(node, vlm_nr)?;
            let minor = data.as_drbd()?.minor;
            {
                let drbd = data.as_drbd_mut()?;
                drbd.role = post_status.as_ref().map(|s| s.role.clone());
                drbd.may_promote = post_status.as_ref().map(|s| s.may_promote).unwrap_or(false);
                let disk_state = post_status.as_ref().and_then(|s| {
                    s.devices
                        .iter()
                        .find(|(nr, _)| *nr == vlm_nr)
                        .map(|(_, state)| state.clone())
                });
                if disk_state.is_some() {
                    drbd.disk_state = disk_state;
                }
            }
            data.state.exists = true;
            data.state.identifier = format!("{}/{}", rsc_name, vlm_nr);
            data.state.device_path = Some(drbd::drbd_device_path(minor));
            data.state.usable_kib = usable;
            data.state.allocated_kib = child_allocated + meta_allocated;
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
            let volumes = &tree.node(node)?.volumes;
            let converged = volumes.values().all(|data| {
                data.state.exists
                    && !data.state.failed
                    && data
                        .as_drbd()
                        .map(|d| d.has_meta_data)
                        .unwrap_or(false)
            });
            // usable means DRBD would let this node take over, or already has
            let promotable = volumes.values().all(|data| {
                data.as_drbd()
                    .map(|d| d.may_promote || d.role.as_deref() == Some("Primary"))
                    .unwrap_or(false)
            });
            notifier.notify(UsageNotification::Created {
                resource: rsc.name.clone(),
                ready: converged && promotable,
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
        let meta_child = tree.child_by_suffix(node, suffixes::META)?;
        let def = Self::def_of(tree, node)?;
        let usable = tree.vlm(node, vlm_nr)?.state.usable_kib;

        let data_gross = match meta_child {
            // external metadata: the data device only carries payload
            Some(_) => usable,
            // internal metadata shares the data device
            None => usable + drbd_external_meta_size_kib(usable, def.peer_slots, def.al_stripes),
        };
        tree.vlm_mut(node, vlm_nr)?.state.expected_kib = data_gross;
        tree.vlm_mut(data_child, vlm_nr)?.state.usable_kib = data_gross;
        registry.update_allocated_from_usable(tree, data_child, vlm_nr)?;

        if let Some(meta) = meta_child {
            let meta_kib = drbd_external_meta_size_kib(data_gross, def.peer_slots, def.al_stripes);
            tree.vlm_mut(meta, vlm_nr)?.state.usable_kib = meta_kib;
            registry.update_allocated_from_usable(tree, meta, vlm_nr)?;
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
        let meta_child = tree.child_by_suffix(node, suffixes::META)?;
        let def = Self::def_of(tree, node)?;

        registry.update_usable_from_allocated(tree, data_child, vlm_nr)?;
        let child_usable = tree.vlm(data_child, vlm_nr)?.state.usable_kib;
        let child_allocated = tree.vlm(data_child, vlm_nr)?.state.allocated_kib;

        let mut meta_allocated = 0;
        if let Some(meta) = meta_child {
            registry.update_usable_from_allocated(tree, meta, vlm_nr)?;
            meta_allocated = tree.vlm(meta, vlm_nr)?.state.allocated_kib;
        }

        let usable = match meta_child {
            Some(_) => child_usable,
            None => child_usable.saturating_sub(drbd_external_meta_size_kib(
                child_usable,
                def.peer_slots,
                def.al_stripes,
            )),
        };
        let data = tree.vlm_mut(node, vlm_nr)?;
        data.state.usable_kib = usable;
        data.state.allocated_kib = child_allocated + meta_allocated;
        Ok(())
    }

    fn clear_cache(&self) {}
}
