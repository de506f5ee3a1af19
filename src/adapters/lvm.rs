//! LVM command wrappers
//!
//! Built on the JSON report format of lvm2 so no column-position parsing
//! is needed. All sizes are requested in KiB without suffix.

use super::{parse_json, ToolRunner};
use crate::error::{Error, Result};

/// One logical volume as reported by `lvs`
#[derive(Debug, Clone)]
pub struct LvsEntry {
    pub vg_name: String,
    pub lv_name: String,
    pub lv_path: String,
    pub size_kib: u64,
    pub attributes: String,
    /// Thin pool the LV lives in, empty for thick LVs
    pub pool_lv: String,
}

/// Volume group capacity as reported by `vgs`
#[derive(Debug, Clone)]
pub struct VgsEntry {
    pub vg_name: String,
    pub size_kib: u64,
    pub free_kib: u64,
    pub extent_size_kib: u64,
}

const LVS_COLUMNS: &str = "vg_name,lv_name,lv_path,lv_size,lv_attr,pool_lv";
const VGS_COLUMNS: &str = "vg_name,vg_size,vg_free,vg_extent_size";

/// List all logical volumes of the given volume groups
pub async fn lvs(runner: &ToolRunner, volume_groups: &[&str]) -> Result<Vec<LvsEntry>> {
    let mut args = vec![
        "-o",
        LVS_COLUMNS,
        "--units",
        "k",
        "--nosuffix",
        "--reportformat",
        "json",
    ];
    args.extend(volume_groups);
    let out = runner
        .run("lvs", &args)
        .await
        .map_err(|e| Error::StorageQuery(format!("lvs failed: {}", e)))?;

    let json = parse_json("lvs", &out.stdout)?;
    let mut entries = Vec::new();
    for report in json["report"].as_array().into_iter().flatten() {
        for lv in report["lv"].as_array().into_iter().flatten() {
            entries.push(LvsEntry {
                vg_name: str_field(lv, "vg_name"),
                lv_name: str_field(lv, "lv_name"),
                lv_path: str_field(lv, "lv_path"),
                size_kib: kib_field(lv, "lv_size")?,
                attributes: str_field(lv, "lv_attr"),
                pool_lv: str_field(lv, "pool_lv"),
            });
        }
    }
    Ok(entries)
}

/// Query capacity and extent size of the given volume groups
pub async fn vgs(runner: &ToolRunner, volume_groups: &[&str]) -> Result<Vec<VgsEntry>> {
    let mut args = vec![
        "-o",
        VGS_COLUMNS,
        "--units",
        "k",
        "--nosuffix",
        "--reportformat",
        "json",
    ];
    args.extend(volume_groups);
    let out = runner
        .run("vgs", &args)
        .await
        .map_err(|e| Error::StorageQuery(format!("vgs failed: {}", e)))?;

    let json = parse_json("vgs", &out.stdout)?;
    let mut entries = Vec::new();
    for report in json["report"].as_array().into_iter().flatten() {
        for vg in report["vg"].as_array().into_iter().flatten() {
            entries.push(VgsEntry {
                vg_name: str_field(vg, "vg_name"),
                size_kib: kib_field(vg, "vg_size")?,
                free_kib: kib_field(vg, "vg_free")?,
                extent_size_kib: kib_field(vg, "vg_extent_size")?,
            });
        }
    }
    Ok(entries)
}

/// Create a thick LV
pub async fn lvcreate(
    runner: &ToolRunner,
    vg: &str,
    lv: &str,
    size_kib: u64,
    extra_options: &[String],
) -> Result<()> {
    let size = format!("{}k", size_kib);
    let mut args: Vec<&str> = vec![
        "--size",
        &size,
        "--name",
        lv,
        "--yes",
        "--wipesignatures",
        "y",
    ];
    for opt in extra_options {
        args.push(opt);
    }
    args.push(vg);
    runner.run("lvcreate", &args).await?;
    Ok(())
}

/// Create a thin LV inside `vg/thin_pool`
pub async fn lvcreate_thin(
    runner: &ToolRunner,
    vg: &str,
    thin_pool: &str,
    lv: &str,
    size_kib: u64,
    extra_options: &[String],
) -> Result<()> {
    let size = format!("{}k", size_kib);
    let pool = format!("{}/{}", vg, thin_pool);
    let mut args: Vec<&str> = vec![
        "--virtualsize",
        &size,
        "--thinpool",
        &pool,
        "--name",
        lv,
        "--yes",
    ];
    for opt in extra_options {
        args.push(opt);
    }
    runner.run("lvcreate", &args).await?;
    Ok(())
}

pub async fn lvresize(runner: &ToolRunner, vg: &str, lv: &str, size_kib: u64) -> Result<()> {
    let size = format!("{}k", size_kib);
    let target = format!("{}/{}", vg, lv);
    runner
        .run("lvresize", &["--size", &size, "--force", "--yes", &target])
        .await?;
    Ok(())
}

pub async fn lvremove(runner: &ToolRunner, vg: &str, lv: &str) -> Result<()> {
    let target = format!("{}/{}", vg, lv);
    runner.run("lvremove", &["--force", &target]).await?;
    Ok(())
}

/// Snapshot an LV under a deterministic snapshot name
pub async fn lvcreate_snapshot(
    runner: &ToolRunner,
    vg: &str,
    lv: &str,
    snap_name: &str,
) -> Result<()> {
    let origin = format!("{}/{}", vg, lv);
    runner
        .run(
            "lvcreate",
            &[
                "--snapshot",
                "--name",
                snap_name,
                "--setactivationskip",
                "n",
                &origin,
            ],
        )
        .await?;
    Ok(())
}

/// Roll an LV back to a snapshot (merges the snapshot into the origin)
pub async fn lvconvert_merge(runner: &ToolRunner, vg: &str, snap_name: &str) -> Result<()> {
    let target = format!("{}/{}", vg, snap_name);
    runner.run("lvconvert", &["--merge", &target]).await?;
    Ok(())
}

/// Create a new LV from a snapshot without destroying the snapshot
pub async fn lvcreate_from_snapshot(
    runner: &ToolRunner,
    vg: &str,
    snap_name: &str,
    new_lv: &str,
) -> Result<()> {
    let origin = format!("{}/{}", vg, snap_name);
    runner
        .run(
            "lvcreate",
            &[
                "--snapshot",
                "--name",
                new_lv,
                "--setactivationskip",
                "n",
                &origin,
            ],
        )
        .await?;
    Ok(())
}

fn str_field(value: &serde_json::Value, key: &str) -> String {
    value[key].as_str().unwrap_or_default().to_string()
}

fn kib_field(value: &serde_json::Value, key: &str) -> Result<u64> {
    let raw = value[key].as_str().unwrap_or("0");
    // lvm reports "1048576.00" style values with --units k --nosuffix
    raw.split('.')
        .next()
        .unwrap_or("0")
        .parse()
        .map_err(|_| Error::CapacityParse(format!("{}={}", key, raw)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kib_field_parses_decimal_report() {
        let value = serde_json::json!({ "lv_size": "1048576.00" });
        assert_eq!(kib_field(&value, "lv_size").unwrap(), 1048576);
    }

    #[test]
    fn test_lvs_report_shape() {
        let json: serde_json::Value = serde_json::from_str(
            r#"{"report":[{"lv":[{"vg_name":"vg0","lv_name":"rsc1_00000",
                "lv_path":"/dev/vg0/rsc1_00000","lv_size":"1048576.00",
                "lv_attr":"-wi-a-----","pool_lv":""}]}]}"#,
        )
        .unwrap();
        let lv = &json["report"][0]["lv"][0];
        assert_eq!(str_field(lv, "vg_name"), "vg0");
        assert_eq!(kib_field(lv, "lv_size").unwrap(), 1048576);
    }
}
