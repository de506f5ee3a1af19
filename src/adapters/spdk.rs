//! SPDK RPC wrappers
//!
//! Drives the SPDK application through its `rpc.py` client. Responses are
//! JSON; sizes come back in bytes and are converted to KiB here.

use super::{parse_json, ToolRunner};
use crate::error::{Error, Result};

const RPC: &str = "rpc.py";

/// One logical volume bdev
#[derive(Debug, Clone)]
pub struct LvolEntry {
    /// Alias of the form "store/name"
    pub alias: String,
    pub size_kib: u64,
    pub is_snapshot: bool,
}

/// One lvol store
#[derive(Debug, Clone)]
pub struct LvolStoreEntry {
    pub name: String,
    pub free_kib: u64,
    pub total_kib: u64,
    pub cluster_size_kib: u64,
}

/// List every lvol bdev known to the SPDK app
pub async fn get_lvols(runner: &ToolRunner) -> Result<Vec<LvolEntry>> {
    let out = runner
        .run(RPC, &["bdev_get_bdevs"])
        .await
        .map_err(|e| Error::StorageQuery(format!("bdev_get_bdevs failed: {}", e)))?;
    let json = parse_json("bdev_get_bdevs", &out.stdout)?;

    let mut entries = Vec::new();
    for bdev in json.as_array().into_iter().flatten() {
        let lvol = &bdev["driver_specific"]["lvol"];
        if lvol.is_null() {
            continue;
        }
        let alias = bdev["aliases"]
            .as_array()
            .and_then(|a| a.first())
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        let block_size = bdev["block_size"].as_u64().unwrap_or(512);
        let num_blocks = bdev["num_blocks"].as_u64().unwrap_or(0);
        entries.push(LvolEntry {
            alias,
            size_kib: block_size * num_blocks / 1024,
            is_snapshot: lvol["snapshot"].as_bool().unwrap_or(false),
        });
    }
    Ok(entries)
}

/// List lvol stores with capacity information
pub async fn get_lvol_stores(runner: &ToolRunner) -> Result<Vec<LvolStoreEntry>> {
    let out = runner
        .run(RPC, &["bdev_lvol_get_lvstores"])
        .await
        .map_err(|e| Error::StorageQuery(format!("bdev_lvol_get_lvstores failed: {}", e)))?;
    let json = parse_json("bdev_lvol_get_lvstores", &out.stdout)?;

    let mut entries = Vec::new();
    for store in json.as_array().into_iter().flatten() {
        let cluster_size = store["cluster_size"].as_u64().unwrap_or(0);
        let total_clusters = store["total_data_clusters"].as_u64().unwrap_or(0);
        let free_clusters = store["free_clusters"].as_u64().unwrap_or(0);
        entries.push(LvolStoreEntry {
            name: store["name"].as_str().unwrap_or_default().to_string(),
            free_kib: cluster_size * free_clusters / 1024,
            total_kib: cluster_size * total_clusters / 1024,
            cluster_size_kib: cluster_size / 1024,
        });
    }
    Ok(entries)
}

/// Create an lvol; SPDK takes the size in MiB
pub async fn create_lvol(
    runner: &ToolRunner,
    store: &str,
    name: &str,
    size_kib: u64,
) -> Result<()> {
    let size_mib = size_kib.div_ceil(1024).to_string();
    runner
        .run(RPC, &["bdev_lvol_create", "-l", store, name, &size_mib])
        .await?;
    Ok(())
}

pub async fn resize_lvol(runner: &ToolRunner, alias: &str, size_kib: u64) -> Result<()> {
    let size_mib = size_kib.div_ceil(1024).to_string();
    runner
        .run(RPC, &["bdev_lvol_resize", alias, &size_mib])
        .await?;
    Ok(())
}

pub async fn delete_lvol(runner: &ToolRunner, alias: &str) -> Result<()> {
    runner.run(RPC, &["bdev_lvol_delete", alias]).await?;
    Ok(())
}

pub async fn snapshot_lvol(runner: &ToolRunner, alias: &str, snap_name: &str) -> Result<()> {
    runner
        .run(RPC, &["bdev_lvol_snapshot", alias, snap_name])
        .await?;
    Ok(())
}

pub async fn clone_lvol(runner: &ToolRunner, snap_alias: &str, clone_name: &str) -> Result<()> {
    runner
        .run(RPC, &["bdev_lvol_clone", snap_alias, clone_name])
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lvol_parsing() {
        let json: serde_json::Value = serde_json::from_str(
            r#"[{"aliases":["store0/rsc1_00000"],"block_size":512,"num_blocks":2097152,
                 "driver_specific":{"lvol":{"snapshot":false}}},
                {"aliases":["nvme0n1"],"block_size":512,"num_blocks":100,
                 "driver_specific":{}}]"#,
        )
        .unwrap();
        let bdevs = json.as_array().unwrap();
        assert!(bdevs[0]["driver_specific"]["lvol"].is_object());
        assert!(bdevs[1]["driver_specific"]["lvol"].is_null());
        // 512 * 2097152 bytes = 1 GiB
        let kib = bdevs[0]["block_size"].as_u64().unwrap()
            * bdevs[0]["num_blocks"].as_u64().unwrap()
            / 1024;
        assert_eq!(kib, 1024 * 1024);
    }
}
