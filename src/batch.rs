//! Batch-scoped processing context
//!
//! One [`BatchContext`] lives for exactly one processing pass. It carries
//! the shared tool runner and the mutable caches that would otherwise be
//! ambient global state: the set of storage pools touched by the batch and
//! the pool capacity cache used for free-space reporting.

use crate::adapters::ToolRunner;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::time::Duration;

/// Pool capacity snapshot in KiB
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolCapacity {
    pub free_kib: u64,
    pub total_kib: u64,
}

/// Context object passed into every adapter call during a batch
pub struct BatchContext {
    runner: ToolRunner,
    /// Pools whose objects were touched this pass; only these are
    /// re-queried for free space at the end of the batch
    changed_pools: Mutex<HashSet<String>>,
    capacity_cache: Mutex<HashMap<String, PoolCapacity>>,
}

impl BatchContext {
    pub fn new(tool_timeout: Duration) -> Self {
        Self {
            runner: ToolRunner::new(tool_timeout),
            changed_pools: Mutex::new(HashSet::new()),
            capacity_cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn runner(&self) -> &ToolRunner {
        &self.runner
    }

    /// Record that a pool was touched by this batch
    pub fn add_changed_pool(&self, pool: &str) {
        self.changed_pools.lock().insert(pool.to_string());
    }

    pub fn changed_pools(&self) -> Vec<String> {
        let mut pools: Vec<String> = self.changed_pools.lock().iter().cloned().collect();
        pools.sort();
        pools
    }

    pub fn cache_capacity(&self, pool: &str, capacity: PoolCapacity) {
        self.capacity_cache
            .lock()
            .insert(pool.to_string(), capacity);
    }

    pub fn cached_capacity(&self, pool: &str) -> Option<PoolCapacity> {
        self.capacity_cache.lock().get(pool).copied()
    }

    /// Reset the per-batch caches; called at batch boundaries
    pub fn clear(&self) {
        self.changed_pools.lock().clear();
        self.capacity_cache.lock().clear();
    }
}

impl Default for BatchContext {
    fn default() -> Self {
        Self::new(Duration::from_secs(60))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_changed_pools_deduplicated_and_sorted() {
        let ctx = BatchContext::default();
        ctx.add_changed_pool("vg1");
        ctx.add_changed_pool("vg0");
        ctx.add_changed_pool("vg1");
        assert_eq!(ctx.changed_pools(), vec!["vg0", "vg1"]);

        ctx.clear();
        assert!(ctx.changed_pools().is_empty());
    }

    #[test]
    fn test_capacity_cache() {
        let ctx = BatchContext::default();
        assert!(ctx.cached_capacity("vg0").is_none());
        ctx.cache_capacity(
            "vg0",
            PoolCapacity {
                free_kib: 100,
                total_kib: 200,
            },
        );
        assert_eq!(ctx.cached_capacity("vg0").unwrap().total_kib, 200);
    }
}
