//! ZFS provider
//!
//! Pools are dataset paths ("rpool" or "rpool/stackbd"); volumes become
//! zvols below them. The thin variant creates sparse zvols. Snapshots are
//! native `dataset@name` snapshots.

use super::{LvInfo, PoolInfo, ProviderOps};
use crate::adapters::zfs;
use crate::batch::BatchContext;
use crate::error::Result;
use crate::props::{keys, PriorityProps};
use crate::tree::ProviderKind;
use async_trait::async_trait;
use std::collections::HashMap;

/// Default zvol block size, used as the allocation extent
const DEFAULT_EXTENT_KIB: u64 = 8;

pub struct ZfsProvider {
    thin: bool,
}

impl ZfsProvider {
    pub fn thick() -> Self {
        Self { thin: false }
    }

    pub fn thin() -> Self {
        Self { thin: true }
    }

    fn dataset(pool: &str, identifier: &str) -> String {
        format!("{}/{}", pool, identifier)
    }

    /// The zpool is the first path component of the dataset
    fn zpool_of(pool: &str) -> &str {
        pool.split('/').next().unwrap_or(pool)
    }
}

#[async_trait]
impl ProviderOps for ZfsProvider {
    fn kind(&self) -> ProviderKind {
        if self.thin {
            ProviderKind::ZfsThin
        } else {
            ProviderKind::Zfs
        }
    }

    async fn info_list(
        &self,
        ctx: &BatchContext,
        pools: &[String],
    ) -> Result<HashMap<String, Vec<LvInfo>>> {
        let pool_refs: Vec<&str> = pools.iter().map(String::as_str).collect();
        let entries = zfs::list(ctx.runner(), &pool_refs).await?;

        let mut out: HashMap<String, Vec<LvInfo>> = HashMap::new();
        for pool in pools {
            out.insert(pool.clone(), Vec::new());
        }
        for entry in entries {
            // "rpool/stackbd/rsc1_00000" or "rpool/stackbd/rsc1_00000@snap"
            let Some((parent, identifier)) = entry.name.rsplit_once('/') else {
                continue;
            };
            let Some(infos) = out.get_mut(parent) else {
                continue;
            };
            infos.push(LvInfo {
                identifier: identifier.to_string(),
                size_kib: entry.volsize_kib,
                device_path: (!entry.is_snapshot).then(|| zfs::zvol_path(&entry.name)),
                is_snapshot: entry.is_snapshot,
            });
        }
        Ok(out)
    }

    async fn pool_info(&self, ctx: &BatchContext, pool: &str) -> Result<PoolInfo> {
        let (free_kib, total_kib) = zfs::zpool_capacity(ctx.runner(), Self::zpool_of(pool)).await?;
        Ok(PoolInfo {
            free_kib,
            total_kib,
            extent_kib: DEFAULT_EXTENT_KIB,
        })
    }

    async fn create(
        &self,
        ctx: &BatchContext,
        pool: &str,
        identifier: &str,
        size_kib: u64,
        props: &PriorityProps,
    ) -> Result<()> {
        let options: Vec<String> = props
            .get(keys::ZFSCREATE_OPTIONS)
            .map(|raw| raw.split_whitespace().map(str::to_string).collect())
            .unwrap_or_default();
        zfs::create_zvol(
            ctx.runner(),
            &Self::dataset(pool, identifier),
            size_kib,
            self.thin,
            &options,
        )
        .await
    }

    async fn resize(
        &self,
        ctx: &BatchContext,
        pool: &str,
        identifier: &str,
        size_kib: u64,
    ) -> Result<()> {
        zfs::resize_zvol(ctx.runner(), &Self::dataset(pool, identifier), size_kib).await
    }

    async fn delete(&self, ctx: &BatchContext, pool: &str, identifier: &str) -> Result<()> {
        zfs::destroy(ctx.runner(), &Self::dataset(pool, identifier)).await
    }

    async fn create_snapshot(
        &self,
        ctx: &BatchContext,
        pool: &str,
        identifier: &str,
        snap_name: &str,
    ) -> Result<()> {
        zfs::snapshot(ctx.runner(), &Self::dataset(pool, identifier), snap_name).await
    }

    async fn delete_snapshot(
        &self,
        ctx: &BatchContext,
        pool: &str,
        identifier: &str,
        snap_name: &str,
    ) -> Result<()> {
        zfs::destroy_snapshot(ctx.runner(), &Self::dataset(pool, identifier), snap_name).await
    }

    async fn restore_snapshot(
        &self,
        ctx: &BatchContext,
        pool: &str,
        identifier: &str,
        snap_name: &str,
        target_identifier: &str,
    ) -> Result<()> {
        zfs::clone_snapshot(
            ctx.runner(),
            &Self::dataset(pool, identifier),
            snap_name,
            &Self::dataset(pool, target_identifier),
        )
        .await
    }

    async fn rollback(
        &self,
        ctx: &BatchContext,
        pool: &str,
        identifier: &str,
        snap_name: &str,
    ) -> Result<()> {
        zfs::rollback(ctx.runner(), &Self::dataset(pool, identifier), snap_name).await
    }

    fn device_path(&self, pool: &str, identifier: &str) -> String {
        zfs::zvol_path(&Self::dataset(pool, identifier))
    }

    fn snapshot_identifier(&self, identifier: &str, snap_name: &str) -> String {
        format!("{}@{}", identifier, snap_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dataset_and_zpool() {
        assert_eq!(
            ZfsProvider::dataset("rpool/stackbd", "rsc1_00000"),
            "rpool/stackbd/rsc1_00000"
        );
        assert_eq!(ZfsProvider::zpool_of("rpool/stackbd"), "rpool");
        assert_eq!(ZfsProvider::zpool_of("rpool"), "rpool");
    }

    #[test]
    fn test_snapshot_identifier() {
        let p = ZfsProvider::thin();
        assert_eq!(
            p.snapshot_identifier("rsc1_00000", "backup1"),
            "rsc1_00000@backup1"
        );
    }
}
