//! ZFS command wrappers
//!
//! Uses the scripting-friendly `-Hp` output (tab separated, exact byte
//! values), so sizes arrive in bytes and are converted to KiB here.

use super::ToolRunner;
use crate::error::{Error, Result};

/// One zvol or snapshot as reported by `zfs list`
#[derive(Debug, Clone)]
pub struct ZfsEntry {
    /// Full dataset name including the pool ("rpool/stackbd/rsc1_00000")
    pub name: String,
    pub volsize_kib: u64,
    pub is_snapshot: bool,
}

/// List zvols and snapshots below the given datasets
pub async fn list(runner: &ToolRunner, datasets: &[&str]) -> Result<Vec<ZfsEntry>> {
    let mut args = vec![
        "list",
        "-Hp",
        "-r",
        "-t",
        "volume,snapshot",
        "-o",
        "name,volsize,type",
    ];
    args.extend(datasets);
    let out = runner
        .run("zfs", &args)
        .await
        .map_err(|e| Error::StorageQuery(format!("zfs list failed: {}", e)))?;

    let mut entries = Vec::new();
    for line in out.stdout.lines() {
        let mut fields = line.split('\t');
        let name = fields.next().unwrap_or_default();
        let volsize = fields.next().unwrap_or("0");
        let dataset_type = fields.next().unwrap_or_default();
        if name.is_empty() {
            continue;
        }
        // snapshots report volsize "-"
        let volsize_bytes: u64 = volsize.parse().unwrap_or(0);
        entries.push(ZfsEntry {
            name: name.to_string(),
            volsize_kib: volsize_bytes / 1024,
            is_snapshot: dataset_type == "snapshot",
        });
    }
    Ok(entries)
}

/// Block size of a dataset in KiB; used as the allocation extent
pub async fn volblocksize_kib(runner: &ToolRunner, dataset: &str) -> Result<u64> {
    let out = runner
        .run(
            "zfs",
            &["get", "-Hp", "-o", "value", "volblocksize", dataset],
        )
        .await
        .map_err(|e| Error::StorageQuery(format!("zfs get volblocksize failed: {}", e)))?;
    let bytes: u64 = out
        .stdout
        .trim()
        .parse()
        .map_err(|_| Error::CapacityParse(out.stdout.trim().to_string()))?;
    Ok(bytes / 1024)
}

/// Pool capacity in KiB (free, total)
pub async fn zpool_capacity(runner: &ToolRunner, zpool: &str) -> Result<(u64, u64)> {
    let out = runner
        .run("zpool", &["get", "-Hp", "-o", "value", "free,size", zpool])
        .await
        .map_err(|e| Error::StorageQuery(format!("zpool get failed: {}", e)))?;
    let mut lines = out.stdout.lines();
    let free: u64 = lines
        .next()
        .and_then(|l| l.trim().parse().ok())
        .ok_or_else(|| Error::CapacityParse(out.stdout.clone()))?;
    let size: u64 = lines
        .next()
        .and_then(|l| l.trim().parse().ok())
        .ok_or_else(|| Error::CapacityParse(out.stdout.clone()))?;
    Ok((free / 1024, size / 1024))
}

/// Create a zvol; `sparse` yields a thin-provisioned volume
pub async fn create_zvol(
    runner: &ToolRunner,
    dataset: &str,
    size_kib: u64,
    sparse: bool,
    extra_options: &[String],
) -> Result<()> {
    let size = format!("{}K", size_kib);
    let mut args: Vec<&str> = vec!["create"];
    if sparse {
        args.push("-s");
    }
    for opt in extra_options {
        args.push(opt);
    }
    args.extend(["-V", &size, dataset]);
    runner.run("zfs", &args).await?;
    Ok(())
}

pub async fn resize_zvol(runner: &ToolRunner, dataset: &str, size_kib: u64) -> Result<()> {
    let volsize = format!("volsize={}K", size_kib);
    runner.run("zfs", &["set", &volsize, dataset]).await?;
    Ok(())
}

pub async fn destroy(runner: &ToolRunner, dataset: &str) -> Result<()> {
    runner.run("zfs", &["destroy", "-r", dataset]).await?;
    Ok(())
}

pub async fn snapshot(runner: &ToolRunner, dataset: &str, snap_name: &str) -> Result<()> {
    let full = format!("{}@{}", dataset, snap_name);
    runner.run("zfs", &["snapshot", &full]).await?;
    Ok(())
}

/// Roll a zvol back to a snapshot, destroying more recent snapshots
pub async fn rollback(runner: &ToolRunner, dataset: &str, snap_name: &str) -> Result<()> {
    let full = format!("{}@{}", dataset, snap_name);
    runner.run("zfs", &["rollback", "-r", &full]).await?;
    Ok(())
}

/// Restore a snapshot into a new zvol
pub async fn clone_snapshot(
    runner: &ToolRunner,
    dataset: &str,
    snap_name: &str,
    target_dataset: &str,
) -> Result<()> {
    let full = format!("{}@{}", dataset, snap_name);
    runner.run("zfs", &["clone", &full, target_dataset]).await?;
    Ok(())
}

pub async fn destroy_snapshot(runner: &ToolRunner, dataset: &str, snap_name: &str) -> Result<()> {
    let full = format!("{}@{}", dataset, snap_name);
    runner.run("zfs", &["destroy", &full]).await?;
    Ok(())
}

/// Device path of a zvol
pub fn zvol_path(dataset: &str) -> String {
    format!("/dev/zvol/{}", dataset)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zvol_path() {
        assert_eq!(
            zvol_path("rpool/stackbd/rsc1_00000"),
            "/dev/zvol/rpool/stackbd/rsc1_00000"
        );
    }
}
