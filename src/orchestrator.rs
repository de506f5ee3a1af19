//! Batch orchestrator
//!
//! Drives one processing pass over a set of resources: size negotiation,
//! batched discovery, snapshot deletion, per-resource convergence, snapshot
//! creation, notifications and the free-space report. A failure in one
//! resource marks that resource failed and never stops the batch.

use crate::batch::BatchContext;
use crate::error::{Error, Result};
use crate::layers::{
    LayerKind, LayerRegistry, NotificationSink, ResponseEntry, ResponseSink, UsageNotification,
};
use crate::layers::storage::{SnapshotPhase, StorageLayer};
use crate::tree::{LayerTree, NodeId};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// Outcome of one dispatch pass
#[derive(Debug, Default)]
pub struct BatchReport {
    /// Diagnostic entries per resource
    pub responses: BTreeMap<String, Vec<ResponseEntry>>,
    /// Resources that failed this pass
    pub failed: Vec<String>,
}

impl BatchReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

pub struct DeviceProcessor {
    registry: Arc<LayerRegistry>,
    storage: Arc<StorageLayer>,
    notifier: Arc<dyn NotificationSink>,
    tool_timeout: Duration,
}

impl DeviceProcessor {
    pub fn new(
        registry: Arc<LayerRegistry>,
        storage: Arc<StorageLayer>,
        notifier: Arc<dyn NotificationSink>,
        tool_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            storage,
            notifier,
            tool_timeout,
        }
    }

    /// Process every named resource in `tree` as one batch
    pub async fn dispatch(&self, tree: &mut LayerTree, resources: &[String]) -> Result<BatchReport> {
        let ctx = BatchContext::new(self.tool_timeout);
        let mut report = BatchReport::default();
        info!("Processing batch of {} resources", resources.len());

        let roots = self.collect_roots(tree, resources)?;

        // downward size negotiation before anything touches the system
        for (rsc_name, root) in &roots {
            if let Err(e) = self.negotiate_sizes(tree, rsc_name, *root) {
                self.fail_resource(tree, rsc_name, &e, &mut report);
            }
        }

        // batched discovery, grouped per layer kind
        let active_roots: Vec<NodeId> = roots
            .iter()
            .filter(|(name, _)| !report.failed.contains(name))
            .map(|(_, root)| *root)
            .collect();
        let grouped = tree.group_by_kind(&active_roots)?;
        for (kind, nodes) in &grouped {
            let layer = self.registry.get(*kind)?;
            layer.prepare(&ctx, tree, nodes).await?;
        }

        // snapshots marked for deletion go first so their space is free
        // before resizes run
        for (rsc_name, root) in &roots {
            if report.failed.contains(rsc_name) {
                continue;
            }
            let mut sink = ResponseSink::new();
            let result = self
                .snapshots_for_resource(&ctx, tree, *root, SnapshotPhase::Deleting, &mut sink)
                .await;
            report
                .responses
                .entry(rsc_name.clone())
                .or_default()
                .extend(sink.take());
            if let Err(e) = result {
                self.fail_resource(tree, rsc_name, &e, &mut report);
            }
        }

        // per-resource convergence with failure isolation
        for (rsc_name, root) in &roots {
            if report.failed.contains(rsc_name) {
                continue;
            }
            let mut sink = ResponseSink::new();
            let result = self.registry.process_node(&ctx, tree, *root, &mut sink).await;
            report
                .responses
                .entry(rsc_name.clone())
                .or_default()
                .extend(sink.take());
            match result {
                Ok(_) => {
                    // feed the discovered sizes back up the stack
                    for vlm_nr in tree.vlm_nrs(*root)? {
                        self.registry
                            .update_usable_from_allocated(tree, *root, vlm_nr)?;
                    }
                }
                Err(e) => self.fail_resource(tree, rsc_name, &e, &mut report),
            }
        }

        // snapshots to be taken run against the settled volumes
        for (rsc_name, root) in &roots {
            if report.failed.contains(rsc_name) {
                continue;
            }
            let mut sink = ResponseSink::new();
            let result = self
                .snapshots_for_resource(&ctx, tree, *root, SnapshotPhase::Creating, &mut sink)
                .await;
            report
                .responses
                .entry(rsc_name.clone())
                .or_default()
                .extend(sink.take());
            if let Err(e) = result {
                self.fail_resource(tree, rsc_name, &e, &mut report);
            }
        }

        // exactly one usage notification per resource; failed resources
        // were already notified when they failed
        for (rsc_name, root) in &roots {
            if report.failed.contains(rsc_name) {
                continue;
            }
            self.registry
                .resource_finished(tree, *root, self.notifier.as_ref())?;
        }

        // free space of every pool the batch touched
        for pool in ctx.changed_pools() {
            match self.storage.pool_capacity(&ctx, &pool).await {
                Ok(capacity) => {
                    self.notifier
                        .free_space(&pool, capacity.free_kib, capacity.total_kib)
                }
                Err(e) => warn!("Free space query for pool '{}' failed: {}", pool, e),
            }
        }

        self.registry.clear_caches();
        info!(
            "Batch finished: {} ok, {} failed",
            roots.len() - report.failed.len(),
            report.failed.len()
        );
        Ok(report)
    }

    fn collect_roots(
        &self,
        tree: &LayerTree,
        resources: &[String],
    ) -> Result<Vec<(String, NodeId)>> {
        let mut roots = Vec::new();
        for name in resources {
            let root = tree.resource(name)?.root.ok_or_else(|| {
                Error::Internal(format!("resource '{}' has no layer tree", name))
            })?;
            roots.push((name.clone(), root));
        }
        Ok(roots)
    }

    fn negotiate_sizes(&self, tree: &mut LayerTree, rsc_name: &str, root: NodeId) -> Result<()> {
        let dfns: Vec<(u32, u64)> = tree
            .resource(rsc_name)?
            .volume_dfns
            .iter()
            .map(|(nr, dfn)| (*nr, dfn.size_kib))
            .collect();
        for (vlm_nr, size_kib) in dfns {
            tree.vlm_mut(root, vlm_nr)?.state.usable_kib = size_kib;
            self.registry.update_allocated_from_usable(tree, root, vlm_nr)?;
        }
        Ok(())
    }

    async fn snapshots_for_resource(
        &self,
        ctx: &BatchContext,
        tree: &mut LayerTree,
        root: NodeId,
        phase: SnapshotPhase,
        sink: &mut ResponseSink,
    ) -> Result<()> {
        let storage_nodes: Vec<NodeId> = tree
            .subtree(root)?
            .into_iter()
            .filter(|id| {
                tree.node(*id)
                    .map(|n| n.kind == LayerKind::Storage)
                    .unwrap_or(false)
            })
            .collect();
        for node in storage_nodes {
            self.storage
                .process_snapshots(ctx, tree, node, phase, sink)
                .await?;
        }
        Ok(())
    }

    fn fail_resource(
        &self,
        tree: &mut LayerTree,
        rsc_name: &str,
        err: &Error,
        report: &mut BatchReport,
    ) {
        error!("Resource '{}' failed: {}", rsc_name, err);
        if let Err(mark_err) = tree.mark_resource_failed(rsc_name) {
            error!("Could not mark '{}' failed: {}", rsc_name, mark_err);
        }
        report
            .responses
            .entry(rsc_name.to_string())
            .or_default()
            .push(ResponseEntry {
                severity: crate::layers::Severity::Error,
                message: err.to_string(),
            });
        report.failed.push(rsc_name.to_string());
        self.notifier.notify(UsageNotification::Failed {
            resource: rsc_name.to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layers::UsageNotification;
    use parking_lot::Mutex;

    #[derive(Default)]
    pub struct RecordingNotifier {
        pub notifications: Mutex<Vec<UsageNotification>>,
        pub free_space: Mutex<Vec<(String, u64, u64)>>,
    }

    impl NotificationSink for RecordingNotifier {
        fn notify(&self, notification: UsageNotification) {
            self.notifications.lock().push(notification);
        }

        fn free_space(&self, pool: &str, free_kib: u64, total_kib: u64) {
            self.free_space
                .lock()
                .push((pool.to_string(), free_kib, total_kib));
        }
    }

    #[test]
    fn test_batch_report_clean() {
        let mut report = BatchReport::default();
        assert!(report.is_clean());
        report.failed.push("rsc1".to_string());
        assert!(!report.is_clean());
    }
}
