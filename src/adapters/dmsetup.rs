//! dmsetup command wrappers
//!
//! Used by the write-cache layer to build and manage device-mapper
//! targets, and for suspend/flush coordination.

use super::ToolRunner;
use crate::error::Result;
use std::collections::HashSet;

/// List device-mapper device names with the given target type
pub async fn list(runner: &ToolRunner, target: &str) -> Result<HashSet<String>> {
    let out = runner
        .run_unchecked("dmsetup", &["ls", "--target", target])
        .await?;
    let mut names = HashSet::new();
    if !out.success() {
        // no device-mapper support or no devices; both mean "nothing found"
        return Ok(names);
    }
    for line in out.stdout.lines() {
        if line.starts_with("No devices found") {
            continue;
        }
        if let Some(name) = line.split_whitespace().next() {
            names.insert(name.to_string());
        }
    }
    Ok(names)
}

/// Create a writecache device over a data and a cache device.
///
/// `pmem_mode` selects the `p` (persistent memory) vs `s` (SSD) operating
/// mode; `options` is the pre-rendered dmsetup option string including its
/// leading argument count.
pub async fn create_writecache(
    runner: &ToolRunner,
    name: &str,
    data_device: &str,
    cache_device: &str,
    data_size_kib: u64,
    pmem_mode: bool,
    block_size: u32,
    options: &str,
) -> Result<()> {
    let sectors = data_size_kib * 2;
    let table = format!(
        "0 {} writecache {} {} {} {} {}",
        sectors,
        if pmem_mode { "p" } else { "s" },
        data_device,
        cache_device,
        block_size,
        options,
    );
    runner
        .run("dmsetup", &["create", name, "--table", &table])
        .await?;
    Ok(())
}

pub async fn remove(runner: &ToolRunner, name: &str) -> Result<()> {
    runner.run("dmsetup", &["remove", "--retry", name]).await?;
    Ok(())
}

pub async fn suspend(runner: &ToolRunner, name: &str) -> Result<()> {
    runner.run("dmsetup", &["suspend", name]).await?;
    Ok(())
}

pub async fn resume(runner: &ToolRunner, name: &str) -> Result<()> {
    runner.run("dmsetup", &["resume", name]).await?;
    Ok(())
}

/// Ask a writecache target to flush to the backing device
pub async fn flush(runner: &ToolRunner, name: &str) -> Result<()> {
    runner.run("dmsetup", &["message", name, "0", "flush"]).await?;
    Ok(())
}

/// Mapper path of a dm device
pub fn mapper_path(name: &str) -> String {
    format!("/dev/mapper/{}", name)
}
