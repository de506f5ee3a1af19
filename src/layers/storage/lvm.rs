//! LVM provider
//!
//! Covers both thick and thin provisioning. Thick pools are named by the
//! volume group ("vg0"); thin pools carry the thin-pool LV after a slash
//! ("vg0/thinpool").

use super::{LvInfo, PoolInfo, ProviderOps};
use crate::adapters::lvm;
use crate::batch::BatchContext;
use crate::error::{Error, Result};
use crate::props::{keys, PriorityProps};
use crate::tree::ProviderKind;
use async_trait::async_trait;
use std::collections::HashMap;

pub struct LvmProvider {
    thin: bool,
}

impl LvmProvider {
    pub fn thick() -> Self {
        Self { thin: false }
    }

    pub fn thin() -> Self {
        Self { thin: true }
    }

    fn split_pool<'a>(&self, pool: &'a str) -> Result<(&'a str, Option<&'a str>)> {
        match (self.thin, pool.split_once('/')) {
            (true, Some((vg, thin_pool))) => Ok((vg, Some(thin_pool))),
            (true, None) => Err(Error::Configuration(format!(
                "thin pool '{}' must be of the form vg/thinpool",
                pool
            ))),
            (false, None) => Ok((pool, None)),
            (false, Some(_)) => Err(Error::Configuration(format!(
                "volume group name '{}' must not contain '/'",
                pool
            ))),
        }
    }

    fn extra_options(props: &PriorityProps) -> Vec<String> {
        props
            .get(keys::LVCREATE_OPTIONS)
            .map(|raw| raw.split_whitespace().map(str::to_string).collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl ProviderOps for LvmProvider {
    fn kind(&self) -> ProviderKind {
        if self.thin {
            ProviderKind::LvmThin
        } else {
            ProviderKind::Lvm
        }
    }

    async fn info_list(
        &self,
        ctx: &BatchContext,
        pools: &[String],
    ) -> Result<HashMap<String, Vec<LvInfo>>> {
        let mut vgs: Vec<&str> = Vec::new();
        for pool in pools {
            let (vg, _) = self.split_pool(pool)?;
            if !vgs.contains(&vg) {
                vgs.push(vg);
            }
        }
        let entries = lvm::lvs(ctx.runner(), &vgs).await?;

        let mut out: HashMap<String, Vec<LvInfo>> = HashMap::new();
        for pool in pools {
            let (vg, thin_pool) = self.split_pool(pool)?;
            let infos = entries
                .iter()
                .filter(|lv| lv.vg_name == vg)
                // never list the thin pool LV itself as a volume
                .filter(|lv| thin_pool != Some(lv.lv_name.as_str()))
                .filter(|lv| match thin_pool {
                    Some(tp) => lv.pool_lv == tp,
                    None => lv.pool_lv.is_empty(),
                })
                .map(|lv| LvInfo {
                    identifier: lv.lv_name.clone(),
                    size_kib: lv.size_kib,
                    device_path: (!lv.lv_path.is_empty()).then(|| lv.lv_path.clone()),
                    is_snapshot: lv.attributes.starts_with('s'),
                })
                .collect();
            out.insert(pool.clone(), infos);
        }
        Ok(out)
    }

    async fn pool_info(&self, ctx: &BatchContext, pool: &str) -> Result<PoolInfo> {
        let (vg, _) = self.split_pool(pool)?;
        let entries = lvm::vgs(ctx.runner(), &[vg]).await?;
        let entry = entries
            .iter()
            .find(|e| e.vg_name == vg)
            .ok_or_else(|| Error::PoolNotFound {
                pool: pool.to_string(),
            })?;
        Ok(PoolInfo {
            free_kib: entry.free_kib,
            total_kib: entry.size_kib,
            extent_kib: entry.extent_size_kib,
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
        let (vg, thin_pool) = self.split_pool(pool)?;
        let options = Self::extra_options(props);
        match thin_pool {
            Some(tp) => {
                lvm::lvcreate_thin(ctx.runner(), vg, tp, identifier, size_kib, &options).await
            }
            None => lvm::lvcreate(ctx.runner(), vg, identifier, size_kib, &options).await,
        }
    }

    async fn resize(
        &self,
        ctx: &BatchContext,
        pool: &str,
        identifier: &str,
        size_kib: u64,
    ) -> Result<()> {
        let (vg, _) = self.split_pool(pool)?;
        lvm::lvresize(ctx.runner(), vg, identifier, size_kib).await
    }

    async fn delete(&self, ctx: &BatchContext, pool: &str, identifier: &str) -> Result<()> {
        let (vg, _) = self.split_pool(pool)?;
        lvm::lvremove(ctx.runner(), vg, identifier).await
    }

    async fn create_snapshot(
        &self,
        ctx: &BatchContext,
        pool: &str,
        identifier: &str,
        snap_name: &str,
    ) -> Result<()> {
        let (vg, _) = self.split_pool(pool)?;
        let snap_id = self.snapshot_identifier(identifier, snap_name);
        lvm::lvcreate_snapshot(ctx.runner(), vg, identifier, &snap_id).await
    }

    async fn delete_snapshot(
        &self,
        ctx: &BatchContext,
        pool: &str,
        identifier: &str,
        snap_name: &str,
    ) -> Result<()> {
        let (vg, _) = self.split_pool(pool)?;
        let snap_id = self.snapshot_identifier(identifier, snap_name);
        lvm::lvremove(ctx.runner(), vg, &snap_id).await
    }

    async fn restore_snapshot(
        &self,
        ctx: &BatchContext,
        pool: &str,
        identifier: &str,
        snap_name: &str,
        target_identifier: &str,
    ) -> Result<()> {
        let (vg, _) = self.split_pool(pool)?;
        let snap_id = self.snapshot_identifier(identifier, snap_name);
        lvm::lvcreate_from_snapshot(ctx.runner(), vg, &snap_id, target_identifier).await
    }

    async fn rollback(
        &self,
        ctx: &BatchContext,
        pool: &str,
        identifier: &str,
        snap_name: &str,
    ) -> Result<()> {
        let (vg, _) = self.split_pool(pool)?;
        let snap_id = self.snapshot_identifier(identifier, snap_name);
        lvm::lvconvert_merge(ctx.runner(), vg, &snap_id).await
    }

    fn device_path(&self, pool: &str, identifier: &str) -> String {
        let vg = pool.split('/').next().unwrap_or(pool);
        format!("/dev/{}/{}", vg, identifier)
    }

    fn snapshot_identifier(&self, identifier: &str, snap_name: &str) -> String {
        format!("{}_{}", identifier, snap_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_pool() {
        let thick = LvmProvider::thick();
        assert_eq!(thick.split_pool("vg0").unwrap(), ("vg0", None));
        assert!(thick.split_pool("vg0/tp").is_err());

        let thin = LvmProvider::thin();
        assert_eq!(thin.split_pool("vg0/tp").unwrap(), ("vg0", Some("tp")));
        assert!(thin.split_pool("vg0").is_err());
    }

    #[test]
    fn test_snapshot_identifier() {
        let p = LvmProvider::thin();
        assert_eq!(
            p.snapshot_identifier("rsc1_00000", "backup1"),
            "rsc1_00000_backup1"
        );
    }

    #[test]
    fn test_device_path_uses_vg_only() {
        let p = LvmProvider::thin();
        assert_eq!(p.device_path("vg0/tp", "rsc1_00000"), "/dev/vg0/rsc1_00000");
    }
}
