//! SPDK provider
//!
//! Logical volumes on SPDK lvol stores, managed through the RPC client.
//! The bdevs have no local block device node; the "device path" is the
//! bdev alias, which the NVMe target side exports.

use super::{LvInfo, PoolInfo, ProviderOps};
use crate::adapters::spdk;
use crate::batch::BatchContext;
use crate::error::{Error, Result};
use crate::props::PriorityProps;
use crate::tree::ProviderKind;
use async_trait::async_trait;
use std::collections::HashMap;

pub struct SpdkProvider;

impl SpdkProvider {
    pub fn new() -> Self {
        Self
    }

    fn alias(pool: &str, identifier: &str) -> String {
        format!("{}/{}", pool, identifier)
    }
}

impl Default for SpdkProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProviderOps for SpdkProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Spdk
    }

    async fn info_list(
        &self,
        ctx: &BatchContext,
        pools: &[String],
    ) -> Result<HashMap<String, Vec<LvInfo>>> {
        let lvols = spdk::get_lvols(ctx.runner()).await?;

        let mut out: HashMap<String, Vec<LvInfo>> = HashMap::new();
        for pool in pools {
            out.insert(pool.clone(), Vec::new());
        }
        for lvol in lvols {
            let Some((store, identifier)) = lvol.alias.split_once('/') else {
                continue;
            };
            let Some(infos) = out.get_mut(store) else {
                continue;
            };
            infos.push(LvInfo {
                identifier: identifier.to_string(),
                size_kib: lvol.size_kib,
                device_path: (!lvol.is_snapshot).then(|| lvol.alias.clone()),
                is_snapshot: lvol.is_snapshot,
            });
        }
        Ok(out)
    }

    async fn pool_info(&self, ctx: &BatchContext, pool: &str) -> Result<PoolInfo> {
        let stores = spdk::get_lvol_stores(ctx.runner()).await?;
        let store = stores
            .iter()
            .find(|s| s.name == pool)
            .ok_or_else(|| Error::PoolNotFound {
                pool: pool.to_string(),
            })?;
        Ok(PoolInfo {
            free_kib: store.free_kib,
            total_kib: store.total_kib,
            extent_kib: store.cluster_size_kib,
        })
    }

    async fn create(
        &self,
        ctx: &BatchContext,
        pool: &str,
        identifier: &str,
        size_kib: u64,
        _props: &PriorityProps,
    ) -> Result<()> {
        spdk::create_lvol(ctx.runner(), pool, identifier, size_kib).await
    }

    async fn resize(
        &self,
        ctx: &BatchContext,
        pool: &str,
        identifier: &str,
        size_kib: u64,
    ) -> Result<()> {
        spdk::resize_lvol(ctx.runner(), &Self::alias(pool, identifier), size_kib).await
    }

    async fn delete(&self, ctx: &BatchContext, pool: &str, identifier: &str) -> Result<()> {
        spdk::delete_lvol(ctx.runner(), &Self::alias(pool, identifier)).await
    }

    async fn create_snapshot(
        &self,
        ctx: &BatchContext,
        pool: &str,
        identifier: &str,
        snap_name: &str,
    ) -> Result<()> {
        let snap_id = self.snapshot_identifier(identifier, snap_name);
        spdk::snapshot_lvol(ctx.runner(), &Self::alias(pool, identifier), &snap_id).await
    }

    async fn delete_snapshot(
        &self,
        ctx: &BatchContext,
        pool: &str,
        identifier: &str,
        snap_name: &str,
    ) -> Result<()> {
        let snap_id = self.snapshot_identifier(identifier, snap_name);
        spdk::delete_lvol(ctx.runner(), &Self::alias(pool, &snap_id)).await
    }

    async fn restore_snapshot(
        &self,
        ctx: &BatchContext,
        pool: &str,
        identifier: &str,
        snap_name: &str,
        target_identifier: &str,
    ) -> Result<()> {
        let snap_id = self.snapshot_identifier(identifier, snap_name);
        spdk::clone_lvol(ctx.runner(), &Self::alias(pool, &snap_id), target_identifier).await
    }

    async fn rollback(
        &self,
        _ctx: &BatchContext,
        _pool: &str,
        _identifier: &str,
        _snap_name: &str,
    ) -> Result<()> {
        // lvols cannot be rolled back in place; restore into a clone instead
        Err(Error::Configuration(
            "in-place rollback is not supported on SPDK pools".to_string(),
        ))
    }

    fn device_path(&self, pool: &str, identifier: &str) -> String {
        Self::alias(pool, identifier)
    }

    fn snapshot_identifier(&self, identifier: &str, snap_name: &str) -> String {
        format!("{}_{}", identifier, snap_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alias() {
        assert_eq!(SpdkProvider::alias("store0", "rsc1_00000"), "store0/rsc1_00000");
    }
}
