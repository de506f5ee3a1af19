//! drbd-utils command wrappers
//!
//! The DRBD layer renders a resource file per resource and converges the
//! kernel state with `drbdadm adjust`; metadata handling goes through
//! `drbdmeta`, state queries through `drbdsetup status --json`.

use super::{parse_json, ToolRunner};
use crate::error::{Error, Result};

/// Per-resource state as reported by drbdsetup
#[derive(Debug, Clone, Default)]
pub struct DrbdStatus {
    pub role: String,
    pub may_promote: bool,
    /// (volume number, disk state)
    pub devices: Vec<(u32, String)>,
    pub suspended: bool,
}

/// Converge a resource towards its configuration file
pub async fn adjust(runner: &ToolRunner, config_dir: &str, resource: &str) -> Result<()> {
    runner
        .run("drbdadm", &["-c", config_dir, "adjust", resource])
        .await?;
    Ok(())
}

/// Tear down a resource
pub async fn down(runner: &ToolRunner, config_dir: &str, resource: &str) -> Result<()> {
    runner
        .run("drbdadm", &["-c", config_dir, "down", resource])
        .await?;
    Ok(())
}

pub async fn suspend_io(runner: &ToolRunner, config_dir: &str, resource: &str) -> Result<()> {
    runner
        .run("drbdadm", &["-c", config_dir, "suspend-io", resource])
        .await?;
    Ok(())
}

pub async fn resume_io(runner: &ToolRunner, config_dir: &str, resource: &str) -> Result<()> {
    runner
        .run("drbdadm", &["-c", config_dir, "resume-io", resource])
        .await?;
    Ok(())
}

/// Let DRBD pick up a grown backing device
pub async fn resize(
    runner: &ToolRunner,
    config_dir: &str,
    resource: &str,
    vlm_nr: u32,
) -> Result<()> {
    let target = format!("{}/{}", resource, vlm_nr);
    runner
        .run("drbdadm", &["-c", config_dir, "resize", &target])
        .await?;
    Ok(())
}

/// Initialize metadata for one volume
pub async fn create_md(
    runner: &ToolRunner,
    config_dir: &str,
    resource: &str,
    vlm_nr: u32,
    peer_slots: u8,
) -> Result<()> {
    let target = format!("{}/{}", resource, vlm_nr);
    let peers = peer_slots.to_string();
    runner
        .run(
            "drbdadm",
            &[
                "-c",
                config_dir,
                "--max-peers",
                &peers,
                "--force",
                "create-md",
                &target,
            ],
        )
        .await?;
    Ok(())
}

/// Check whether valid metadata exists for a volume.
/// A failing probe is the normal "no metadata yet" answer.
pub async fn has_meta_data(
    runner: &ToolRunner,
    minor: u32,
    meta_device: &str,
    internal: bool,
) -> Result<bool> {
    let minor_str = minor.to_string();
    let index = if internal { "internal" } else { "flex-external" };
    let out = runner
        .run_unchecked(
            "drbdmeta",
            &[&minor_str, "v09", meta_device, index, "get-gi", "--force"],
        )
        .await?;
    Ok(out.success())
}

/// Wipe the metadata of a volume before the backing device is released
pub async fn wipe_md(runner: &ToolRunner, config_dir: &str, resource: &str, vlm_nr: u32) -> Result<()> {
    let target = format!("{}/{}", resource, vlm_nr);
    runner
        .run("drbdadm", &["-c", config_dir, "--force", "wipe-md", &target])
        .await?;
    Ok(())
}

/// Query the current state of a resource; `None` if DRBD does not know it
pub async fn status(runner: &ToolRunner, resource: &str) -> Result<Option<DrbdStatus>> {
    let out = runner
        .run_unchecked("drbdsetup", &["status", resource, "--json"])
        .await?;
    if !out.success() {
        return Ok(None);
    }
    let json = parse_json("drbdsetup status", &out.stdout)?;
    let rsc = json
        .as_array()
        .and_then(|a| a.first())
        .ok_or_else(|| Error::ToolOutputParse {
            command: "drbdsetup status".into(),
            reason: "empty status array".into(),
        })?;

    let mut devices = Vec::new();
    for dev in rsc["devices"].as_array().into_iter().flatten() {
        devices.push((
            dev["volume"].as_u64().unwrap_or(0) as u32,
            dev["disk-state"].as_str().unwrap_or("Unknown").to_string(),
        ));
    }
    Ok(Some(DrbdStatus {
        role: rsc["role"].as_str().unwrap_or("Unknown").to_string(),
        may_promote: rsc["may-promote"].as_bool().unwrap_or(false),
        devices,
        suspended: rsc["suspended"].as_bool().unwrap_or(false),
    }))
}

/// Device path for a DRBD minor
pub fn drbd_device_path(minor: u32) -> String {
    format!("/dev/drbd{}", minor)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_parsing() {
        let json: serde_json::Value = serde_json::from_str(
            r#"[{"name":"rsc1","role":"Secondary","may-promote":true,"suspended":false,
                 "devices":[{"volume":0,"disk-state":"UpToDate"}]}]"#,
        )
        .unwrap();
        let rsc = &json[0];
        assert_eq!(rsc["role"].as_str().unwrap(), "Secondary");
        assert!(rsc["may-promote"].as_bool().unwrap());
        assert_eq!(rsc["devices"][0]["disk-state"].as_str().unwrap(), "UpToDate");
    }

    #[test]
    fn test_device_path() {
        assert_eq!(drbd_device_path(1005), "/dev/drbd1005");
    }
}
