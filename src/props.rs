//! Priority-ordered property lookup
//!
//! Layers read their configuration (write-cache watermark options, LVM
//! creation type, rollback targets) from a stack of property maps resolved
//! in priority order: volume, volume definition, resource, resource group,
//! node, global satellite config. The first map that carries a key wins.

use std::collections::BTreeMap;

/// Property namespaces used by the shipped layers
pub mod namespaces {
    pub const WRITECACHE: &str = "Writecache";
    pub const WRITECACHE_OPTIONS: &str = "Writecache/Opts";
    pub const STOR_DRIVER: &str = "StorDriver";
}

/// Well-known property keys
pub mod keys {
    pub const WRITECACHE_SIZE: &str = "Writecache/Size";
    pub const WRITECACHE_POOL_PMEM: &str = "StorDriver/Pmem";
    pub const LVCREATE_OPTIONS: &str = "StorDriver/LvcreateOptions";
    pub const ZFSCREATE_OPTIONS: &str = "StorDriver/ZfscreateOptions";
    pub const ROLLBACK_TARGET: &str = "StorDriver/RollbackTarget";
    pub const RESTORE_SOURCE: &str = "StorDriver/RestoreSource";
    pub const RESTORE_SNAPSHOT: &str = "StorDriver/RestoreSnapshot";
}

/// A stack of property maps resolved in priority order
#[derive(Debug, Clone, Default)]
pub struct PriorityProps {
    /// Highest priority first
    maps: Vec<BTreeMap<String, String>>,
}

impl PriorityProps {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a property map with the next-lower priority
    pub fn with_map(mut self, map: BTreeMap<String, String>) -> Self {
        self.maps.push(map);
        self
    }

    /// Append a single-entry map, mainly for tests and defaults
    pub fn with_entry(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let mut map = BTreeMap::new();
        map.insert(key.into(), value.into());
        self.maps.push(map);
        self
    }

    /// Resolve a key; the highest-priority map carrying it wins
    pub fn get(&self, key: &str) -> Option<&str> {
        self.maps
            .iter()
            .find_map(|map| map.get(key).map(String::as_str))
    }

    /// Resolve a key with a fallback default
    pub fn get_or<'a>(&'a self, key: &str, default: &'a str) -> &'a str {
        self.get(key).unwrap_or(default)
    }

    /// Collect every key under `namespace/` with the prefix stripped,
    /// respecting priority per key
    pub fn render_namespace(&self, namespace: &str) -> BTreeMap<String, String> {
        let prefix = format!("{}/", namespace);
        let mut out = BTreeMap::new();
        // iterate lowest priority first so higher maps overwrite
        for map in self.maps.iter().rev() {
            for (key, value) in map {
                if let Some(stripped) = key.strip_prefix(&prefix) {
                    out.insert(stripped.to_string(), value.clone());
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_order() {
        let props = PriorityProps::new()
            .with_entry("a", "volume")
            .with_entry("a", "resource")
            .with_entry("b", "resource");

        assert_eq!(props.get("a"), Some("volume"));
        assert_eq!(props.get("b"), Some("resource"));
        assert_eq!(props.get("c"), None);
        assert_eq!(props.get_or("c", "dflt"), "dflt");
    }

    #[test]
    fn test_render_namespace() {
        let props = PriorityProps::new()
            .with_entry("Writecache/Opts/high_watermark", "60")
            .with_map(BTreeMap::from([
                ("Writecache/Opts/high_watermark".to_string(), "50".to_string()),
                ("Writecache/Opts/fua".to_string(), "on".to_string()),
            ]));

        let opts = props.render_namespace("Writecache/Opts");
        assert_eq!(opts.get("high_watermark").map(String::as_str), Some("60"));
        assert_eq!(opts.get("fua").map(String::as_str), Some("on"));
        assert_eq!(opts.len(), 2);
    }
}
