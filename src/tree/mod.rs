//! Layer node tree
//!
//! Per-resource tree of layer nodes, stored as an arena indexed by
//! [`NodeId`]. Children are owned indices keyed by their name suffix;
//! the parent is a plain non-owning index used only for lookup. This
//! avoids reference-counting cycles while keeping both directions cheap.

pub mod volume;

pub use volume::{
    DrbdResourceDef, DrbdVlm, LayerPayload, LuksVlm, NvmeTargetDef, NvmeVlm, ProviderKind,
    StorageVlm, VolumeData, VolumeState, WritecacheVlm,
};

use crate::error::{Error, Result};
use crate::layers::LayerKind;
use crate::props::PriorityProps;
use indexmap::IndexMap;
use std::collections::BTreeMap;

// =============================================================================
// Identifiers & Flags
// =============================================================================

/// Stable arena index of a layer node
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(pub usize);

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Resource-level convergence flags
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResourceFlags {
    pub delete: bool,
    pub inactive: bool,
}

/// Volume-level convergence flags
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VolumeFlags {
    pub delete: bool,
    /// Explicit resize request; allows shrinking a TOO_LARGE volume
    pub resize: bool,
}

/// Snapshot-level flags
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SnapshotFlags {
    pub delete: bool,
}

// =============================================================================
// Definitions
// =============================================================================

/// Static per-volume configuration shared by all layers of a resource
#[derive(Debug, Clone)]
pub struct VolumeDefinition {
    pub size_kib: u64,
    pub flags: VolumeFlags,
}

/// Shadow data for one snapshot of a resource
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub name: String,
    pub flags: SnapshotFlags,
    /// Per volume-number bookkeeping, largely immutable once taken
    pub volumes: BTreeMap<u32, SnapshotVolume>,
}

/// Provider-side bookkeeping for one snapshot volume
#[derive(Debug, Clone, Default)]
pub struct SnapshotVolume {
    pub identifier: String,
    pub exists: bool,
    pub allocated_kib: u64,
}

// =============================================================================
// Resource
// =============================================================================

/// One resource with its layer tree, definitions and snapshots
#[derive(Debug)]
pub struct Resource {
    pub name: String,
    pub flags: ResourceFlags,
    pub root: Option<NodeId>,
    pub volume_dfns: BTreeMap<u32, VolumeDefinition>,
    pub props: PriorityProps,
    pub snapshots: Vec<Snapshot>,
    /// DRBD definition data, present when the stack contains a DRBD layer
    pub drbd_def: Option<DrbdResourceDef>,
    /// NVMe/Openflex target definition data
    pub nvme_def: Option<NvmeTargetDef>,
    /// Suspend-IO is layer-global per resource; set on the root and
    /// propagated to lower write-cache layers so they can flush
    pub suspend_io: bool,
}

impl Resource {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            flags: ResourceFlags::default(),
            root: None,
            volume_dfns: BTreeMap::new(),
            props: PriorityProps::new(),
            snapshots: Vec::new(),
            drbd_def: None,
            nvme_def: None,
            suspend_io: false,
        }
    }

    pub fn should_exist(&self) -> bool {
        !self.flags.delete && !self.flags.inactive
    }
}

// =============================================================================
// Layer Node
// =============================================================================

/// One node of a resource's layer tree
#[derive(Debug)]
pub struct LayerNode {
    pub id: NodeId,
    pub resource: String,
    pub kind: LayerKind,
    /// Distinguishes sibling roles below the same parent ("data", "meta",
    /// "cache"); empty for the default path
    pub suffix: String,
    /// Non-owning back reference, lookup only
    pub parent: Option<NodeId>,
    /// Owned children, keyed by suffix; suffixes are unique per node
    pub children: IndexMap<String, NodeId>,
    pub volumes: BTreeMap<u32, VolumeData>,
}

impl LayerNode {
    /// Resource name plus this node's suffix, used in object identifiers
    pub fn suffixed_name(&self) -> String {
        if self.suffix.is_empty() {
            self.resource.clone()
        } else {
            format!("{}_{}", self.resource, self.suffix)
        }
    }
}

// =============================================================================
// Tree (arena)
// =============================================================================

/// Arena of layer nodes plus the resource table
#[derive(Debug, Default)]
pub struct LayerTree {
    nodes: Vec<LayerNode>,
    resources: BTreeMap<String, Resource>,
}

impl LayerTree {
    pub fn new() -> Self {
        Self::default()
    }

    // -------------------------------------------------------------------------
    // Construction
    // -------------------------------------------------------------------------

    pub fn add_resource(&mut self, resource: Resource) {
        self.resources.insert(resource.name.clone(), resource);
    }

    /// Allocate a node and attach it to its parent (or set it as the
    /// resource root). The tree shape is fixed at creation time.
    pub fn add_node(
        &mut self,
        resource: &str,
        kind: LayerKind,
        suffix: impl Into<String>,
        parent: Option<NodeId>,
    ) -> Result<NodeId> {
        let suffix = suffix.into();
        let id = NodeId(self.nodes.len());
        if let Some(parent_id) = parent {
            let parent_node = self.node_mut(parent_id)?;
            if parent_node.children.contains_key(&suffix) {
                return Err(Error::Internal(format!(
                    "duplicate child suffix '{}' below node {}",
                    suffix, parent_id
                )));
            }
            parent_node.children.insert(suffix.clone(), id);
        } else {
            let rsc = self
                .resources
                .get_mut(resource)
                .ok_or_else(|| Error::ResourceNotFound {
                    name: resource.to_string(),
                })?;
            rsc.root = Some(id);
        }
        self.nodes.push(LayerNode {
            id,
            resource: resource.to_string(),
            kind,
            suffix,
            parent,
            children: IndexMap::new(),
            volumes: BTreeMap::new(),
        });
        Ok(id)
    }

    /// Insert volume data on a node
    pub fn add_volume(&mut self, node: NodeId, vlm_nr: u32, data: VolumeData) -> Result<()> {
        self.node_mut(node)?.volumes.insert(vlm_nr, data);
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Lookup
    // -------------------------------------------------------------------------

    pub fn node(&self, id: NodeId) -> Result<&LayerNode> {
        self.nodes.get(id.0).ok_or(Error::NodeNotFound { node_id: id.0 })
    }

    pub fn node_mut(&mut self, id: NodeId) -> Result<&mut LayerNode> {
        self.nodes
            .get_mut(id.0)
            .ok_or(Error::NodeNotFound { node_id: id.0 })
    }

    pub fn resource(&self, name: &str) -> Result<&Resource> {
        self.resources.get(name).ok_or_else(|| Error::ResourceNotFound {
            name: name.to_string(),
        })
    }

    pub fn resource_mut(&mut self, name: &str) -> Result<&mut Resource> {
        self.resources
            .get_mut(name)
            .ok_or_else(|| Error::ResourceNotFound {
                name: name.to_string(),
            })
    }

    pub fn resources(&self) -> impl Iterator<Item = &Resource> {
        self.resources.values()
    }

    /// The resource owning a node
    pub fn resource_of(&self, node: NodeId) -> Result<&Resource> {
        let name = self.node(node)?.resource.clone();
        self.resource(&name)
    }

    /// Child of `node` with the given suffix
    pub fn child_by_suffix(&self, node: NodeId, suffix: &str) -> Result<Option<NodeId>> {
        Ok(self.node(node)?.children.get(suffix).copied())
    }

    /// Volume data accessors
    pub fn vlm(&self, node: NodeId, vlm_nr: u32) -> Result<&VolumeData> {
        self.node(node)?
            .volumes
            .get(&vlm_nr)
            .ok_or_else(|| Error::Internal(format!("volume {} missing on node {}", vlm_nr, node)))
    }

    pub fn vlm_mut(&mut self, node: NodeId, vlm_nr: u32) -> Result<&mut VolumeData> {
        let id = node;
        self.node_mut(node)?
            .volumes
            .get_mut(&vlm_nr)
            .ok_or_else(|| Error::Internal(format!("volume {} missing on node {}", vlm_nr, id)))
    }

    /// Volume numbers present on a node
    pub fn vlm_nrs(&self, node: NodeId) -> Result<Vec<u32>> {
        Ok(self.node(node)?.volumes.keys().copied().collect())
    }

    /// Breadth-first collection of a subtree, root included
    pub fn subtree(&self, root: NodeId) -> Result<Vec<NodeId>> {
        let mut out = Vec::new();
        let mut queue = std::collections::VecDeque::new();
        queue.push_back(root);
        while let Some(id) = queue.pop_front() {
            out.push(id);
            for child in self.node(id)?.children.values() {
                queue.push_back(*child);
            }
        }
        Ok(out)
    }

    /// Group every node of the given resource roots by layer kind,
    /// batch-wide, for the grouped `prepare` calls
    pub fn group_by_kind(&self, roots: &[NodeId]) -> Result<BTreeMap<LayerKind, Vec<NodeId>>> {
        let mut grouped: BTreeMap<LayerKind, Vec<NodeId>> = BTreeMap::new();
        for root in roots {
            for id in self.subtree(*root)? {
                let kind = self.node(id)?.kind;
                grouped.entry(kind).or_default().push(id);
            }
        }
        Ok(grouped)
    }

    /// Mark every volume of a resource's whole tree as failed
    pub fn mark_resource_failed(&mut self, resource: &str) -> Result<()> {
        let root = self
            .resource(resource)?
            .root
            .ok_or_else(|| Error::Internal(format!("resource '{}' has no root node", resource)))?;
        for id in self.subtree(root)? {
            for data in self.node_mut(id)?.volumes.values_mut() {
                data.state.failed = true;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layers::LayerKind;

    fn storage_vlm(pool: &str) -> VolumeData {
        VolumeData::new_storage(pool, ProviderKind::Lvm)
    }

    #[test]
    fn test_tree_construction_and_lookup() {
        let mut tree = LayerTree::new();
        tree.add_resource(Resource::new("rsc1"));

        let root = tree.add_node("rsc1", LayerKind::Drbd, "", None).unwrap();
        let data = tree
            .add_node("rsc1", LayerKind::Storage, "data", Some(root))
            .unwrap();
        let meta = tree
            .add_node("rsc1", LayerKind::Storage, "meta", Some(root))
            .unwrap();

        tree.add_volume(data, 0, storage_vlm("vg0")).unwrap();

        assert_eq!(tree.resource("rsc1").unwrap().root, Some(root));
        assert_eq!(tree.child_by_suffix(root, "data").unwrap(), Some(data));
        assert_eq!(tree.child_by_suffix(root, "meta").unwrap(), Some(meta));
        assert_eq!(tree.node(data).unwrap().parent, Some(root));
        assert_eq!(tree.subtree(root).unwrap(), vec![root, data, meta]);
        assert_eq!(tree.node(meta).unwrap().suffixed_name(), "rsc1_meta");
    }

    #[test]
    fn test_duplicate_suffix_rejected() {
        let mut tree = LayerTree::new();
        tree.add_resource(Resource::new("rsc1"));
        let root = tree.add_node("rsc1", LayerKind::Luks, "", None).unwrap();
        tree.add_node("rsc1", LayerKind::Storage, "data", Some(root))
            .unwrap();
        assert!(tree
            .add_node("rsc1", LayerKind::Storage, "data", Some(root))
            .is_err());
    }

    #[test]
    fn test_group_by_kind() {
        let mut tree = LayerTree::new();
        tree.add_resource(Resource::new("a"));
        tree.add_resource(Resource::new("b"));
        let root_a = tree.add_node("a", LayerKind::Luks, "", None).unwrap();
        tree.add_node("a", LayerKind::Storage, "data", Some(root_a))
            .unwrap();
        let root_b = tree.add_node("b", LayerKind::Storage, "", None).unwrap();

        let grouped = tree.group_by_kind(&[root_a, root_b]).unwrap();
        assert_eq!(grouped[&LayerKind::Luks].len(), 1);
        assert_eq!(grouped[&LayerKind::Storage].len(), 2);
    }

    #[test]
    fn test_mark_resource_failed() {
        let mut tree = LayerTree::new();
        tree.add_resource(Resource::new("rsc1"));
        let root = tree.add_node("rsc1", LayerKind::Storage, "", None).unwrap();
        tree.add_volume(root, 0, storage_vlm("vg0")).unwrap();
        tree.mark_resource_failed("rsc1").unwrap();
        assert!(tree.vlm(root, 0).unwrap().state.failed);
    }
}
