//! Layer implementations
//!
//! Every layer kind (DRBD, LUKS, write-cache, NVMe, Openflex, storage)
//! implements the [`DeviceLayer`] contract; the orchestrator and the size
//! negotiation protocol dispatch through the [`LayerRegistry`], never
//! through type inspection of concrete payloads.

pub mod drbd;
pub mod luks;
pub mod nvme;
pub mod storage;
pub mod writecache;

use crate::batch::BatchContext;
use crate::error::{Error, Result};
use crate::tree::{LayerTree, NodeId};
use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

// =============================================================================
// Layer Kinds
// =============================================================================

/// Closed set of layer kinds a node can have
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LayerKind {
    Drbd,
    Luks,
    Writecache,
    Nvme,
    Openflex,
    Storage,
}

impl std::fmt::Display for LayerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LayerKind::Drbd => write!(f, "drbd"),
            LayerKind::Luks => write!(f, "luks"),
            LayerKind::Writecache => write!(f, "writecache"),
            LayerKind::Nvme => write!(f, "nvme"),
            LayerKind::Openflex => write!(f, "openflex"),
            LayerKind::Storage => write!(f, "storage"),
        }
    }
}

/// Well-known child suffixes
pub mod suffixes {
    /// The main data path below a layer
    pub const DATA: &str = "data";
    /// External DRBD metadata
    pub const META: &str = "meta";
    /// Write-cache cache device
    pub const CACHE: &str = "cache";
}

// =============================================================================
// Process result
// =============================================================================

/// Outcome of processing one layer node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessResult {
    Success,
    /// The layer (or a child) provides no local device; upper layers
    /// short-circuit without treating this as a failure
    NoDevicesProvided,
}

// =============================================================================
// Response sink
// =============================================================================

/// Severity of a response entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

/// One diagnostic entry produced while processing a resource
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseEntry {
    pub severity: Severity,
    pub message: String,
}

/// Collects response entries for the resource currently being processed
#[derive(Debug, Default)]
pub struct ResponseSink {
    entries: Vec<ResponseEntry>,
}

impl ResponseSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn info(&mut self, message: impl Into<String>) {
        self.entries.push(ResponseEntry {
            severity: Severity::Info,
            message: message.into(),
        });
    }

    pub fn warn(&mut self, message: impl Into<String>) {
        self.entries.push(ResponseEntry {
            severity: Severity::Warning,
            message: message.into(),
        });
    }

    pub fn error(&mut self, message: impl Into<String>) {
        self.entries.push(ResponseEntry {
            severity: Severity::Error,
            message: message.into(),
        });
    }

    pub fn entries(&self) -> &[ResponseEntry] {
        &self.entries
    }

    pub fn take(&mut self) -> Vec<ResponseEntry> {
        std::mem::take(&mut self.entries)
    }
}

// =============================================================================
// Usage notifications
// =============================================================================

/// Terminal per-resource notification, sent exactly once per pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UsageNotification {
    Created { resource: String, ready: bool },
    Deleted { resource: String },
    Failed { resource: String },
}

/// Upward port towards the device manager / resource state publisher
pub trait NotificationSink: Send + Sync {
    fn notify(&self, notification: UsageNotification);

    /// Pool-scoped capacity report after a batch
    fn free_space(&self, pool: &str, free_kib: u64, total_kib: u64);
}

/// Default sink that just logs
pub struct LogNotifier;

impl NotificationSink for LogNotifier {
    fn notify(&self, notification: UsageNotification) {
        tracing::info!("Resource notification: {:?}", notification);
    }

    fn free_space(&self, pool: &str, free_kib: u64, total_kib: u64) {
        tracing::debug!(
            "Pool {}: {} KiB free of {} KiB",
            pool,
            free_kib,
            total_kib
        );
    }
}

// =============================================================================
// Device Layer contract
// =============================================================================

/// Lifecycle contract implemented once per layer kind
#[async_trait]
pub trait DeviceLayer: Send + Sync {
    fn kind(&self) -> LayerKind;

    /// Batched discovery: query the external tool once for the whole batch
    /// and populate exists/device_path/identifier on each volume, without
    /// side effects on the system. A failing discovery command raises
    /// `StorageQuery`; "object not found" is a normal state, not an error.
    async fn prepare(
        &self,
        ctx: &BatchContext,
        tree: &mut LayerTree,
        nodes: &[NodeId],
    ) -> Result<()>;

    /// Converge one resource's node to its desired state. Children converge
    /// before the parent is built on top of them; deletion is top-down,
    /// each layer removes its own object before delegating to children.
    async fn process(
        &self,
        registry: &LayerRegistry,
        ctx: &BatchContext,
        tree: &mut LayerTree,
        node: NodeId,
        sink: &mut ResponseSink,
    ) -> Result<ProcessResult>;

    /// Emit the usage notification once the top-most relevant layer's work
    /// for a resource is complete. Returns whether a notification was sent.
    fn resource_finished(
        &self,
        tree: &LayerTree,
        node: NodeId,
        notifier: &dyn NotificationSink,
    ) -> Result<bool>;

    /// Downward size negotiation: given this volume's usable size, compute
    /// the allocation requested from each child and recurse.
    fn update_allocated_from_usable(
        &self,
        registry: &LayerRegistry,
        tree: &mut LayerTree,
        node: NodeId,
        vlm_nr: u32,
    ) -> Result<()>;

    /// Upward size negotiation: given the actually-allocated size found on
    /// the child, compute what this layer exposes upward.
    fn update_usable_from_allocated(
        &self,
        registry: &LayerRegistry,
        tree: &mut LayerTree,
        node: NodeId,
        vlm_nr: u32,
    ) -> Result<()>;

    /// Discard in-process cached discovery results
    fn clear_cache(&self);
}

pub type DeviceLayerRef = Arc<dyn DeviceLayer>;

// =============================================================================
// Registry
// =============================================================================

/// Maps layer kinds to their implementation; the dispatch point for both
/// recursive processing and the size protocol
#[derive(Default)]
pub struct LayerRegistry {
    layers: BTreeMap<LayerKind, DeviceLayerRef>,
}

impl LayerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, layer: DeviceLayerRef) {
        self.layers.insert(layer.kind(), layer);
    }

    pub fn get(&self, kind: LayerKind) -> Result<DeviceLayerRef> {
        self.layers
            .get(&kind)
            .cloned()
            .ok_or_else(|| Error::LayerNotRegistered {
                kind: kind.to_string(),
            })
    }

    pub fn kinds(&self) -> impl Iterator<Item = LayerKind> + '_ {
        self.layers.keys().copied()
    }

    /// Recursive processing entry point; layers call this for their
    /// children instead of touching sibling implementations directly
    pub fn process_node<'a>(
        &'a self,
        ctx: &'a BatchContext,
        tree: &'a mut LayerTree,
        node: NodeId,
        sink: &'a mut ResponseSink,
    ) -> BoxFuture<'a, Result<ProcessResult>> {
        Box::pin(async move {
            let kind = tree.node(node)?.kind;
            let layer = self.get(kind)?;
            layer.process(self, ctx, tree, node, sink).await
        })
    }

    /// Downward size negotiation dispatch
    pub fn update_allocated_from_usable(
        &self,
        tree: &mut LayerTree,
        node: NodeId,
        vlm_nr: u32,
    ) -> Result<()> {
        let kind = tree.node(node)?.kind;
        self.get(kind)?
            .update_allocated_from_usable(self, tree, node, vlm_nr)
    }

    /// Upward size negotiation dispatch
    pub fn update_usable_from_allocated(
        &self,
        tree: &mut LayerTree,
        node: NodeId,
        vlm_nr: u32,
    ) -> Result<()> {
        let kind = tree.node(node)?.kind;
        self.get(kind)?
            .update_usable_from_allocated(self, tree, node, vlm_nr)
    }

    /// `resource_finished` dispatch for a resource's topmost layer
    pub fn resource_finished(
        &self,
        tree: &LayerTree,
        node: NodeId,
        notifier: &dyn NotificationSink,
    ) -> Result<bool> {
        let kind = tree.node(node)?.kind;
        self.get(kind)?.resource_finished(tree, node, notifier)
    }

    pub fn clear_caches(&self) {
        for layer in self.layers.values() {
            layer.clear_cache();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layer_kind_display() {
        assert_eq!(format!("{}", LayerKind::Drbd), "drbd");
        assert_eq!(format!("{}", LayerKind::Writecache), "writecache");
        assert_eq!(format!("{}", LayerKind::Storage), "storage");
    }

    #[test]
    fn test_response_sink_collects() {
        let mut sink = ResponseSink::new();
        sink.info("created");
        sink.warn("mixed pmem");
        assert_eq!(sink.entries().len(), 2);
        assert_eq!(sink.entries()[1].severity, Severity::Warning);
        let drained = sink.take();
        assert_eq!(drained.len(), 2);
        assert!(sink.entries().is_empty());
    }

    #[test]
    fn test_registry_unknown_kind() {
        let registry = LayerRegistry::new();
        assert!(registry.get(LayerKind::Luks).is_err());
    }
}
