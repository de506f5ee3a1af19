//! cryptsetup command wrappers
//!
//! Key material is always fed over stdin (`--key-file=-`), never through
//! the argument list where it would be visible in the process table.

use super::ToolRunner;
use crate::error::Result;

/// Check whether a device already carries a LUKS header.
/// A negative answer is a normal state, not a failure.
pub async fn is_luks(runner: &ToolRunner, device: &str) -> Result<bool> {
    let out = runner.run_unchecked("cryptsetup", &["isLuks", device]).await?;
    Ok(out.success())
}

/// Format a device as LUKS2
pub async fn luks_format(runner: &ToolRunner, device: &str, key: &[u8]) -> Result<()> {
    runner
        .run_with_stdin(
            "cryptsetup",
            &["-q", "luksFormat", "--type", "luks2", "--key-file=-", device],
            key,
        )
        .await?;
    Ok(())
}

/// Map a LUKS device under `/dev/mapper/<target_name>`
pub async fn open(
    runner: &ToolRunner,
    device: &str,
    target_name: &str,
    key: &[u8],
) -> Result<()> {
    runner
        .run_with_stdin(
            "cryptsetup",
            &["open", "--key-file=-", device, target_name],
            key,
        )
        .await?;
    Ok(())
}

/// Resize an open mapping to fill the (possibly grown) backing device,
/// or shrink it to `size_kib` sectors worth of payload
pub async fn resize(
    runner: &ToolRunner,
    target_name: &str,
    size_kib: Option<u64>,
    key: &[u8],
) -> Result<()> {
    let size_arg;
    let mut args = vec!["resize", "--key-file=-"];
    if let Some(kib) = size_kib {
        // cryptsetup takes the new size in 512-byte sectors
        size_arg = format!("{}", kib * 2);
        args.extend(["--size", &size_arg]);
    }
    args.push(target_name);
    runner.run_with_stdin("cryptsetup", &args, key).await?;
    Ok(())
}

pub async fn close(runner: &ToolRunner, target_name: &str) -> Result<()> {
    runner.run("cryptsetup", &["close", target_name]).await?;
    Ok(())
}

/// Whether a mapping with this name is currently open
pub async fn is_open(runner: &ToolRunner, target_name: &str) -> Result<bool> {
    let out = runner
        .run_unchecked("cryptsetup", &["status", target_name])
        .await?;
    Ok(out.success())
}

/// Securely erase the LUKS header region before the device is released
pub async fn shred_header(runner: &ToolRunner, device: &str) -> Result<()> {
    runner
        .run("shred", &["--size=16M", "--iterations=3", "--zero", device])
        .await?;
    Ok(())
}

/// Mapper path for an open target
pub fn mapper_path(target_name: &str) -> String {
    format!("/dev/mapper/{}", target_name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mapper_path() {
        assert_eq!(
            mapper_path("stackbd_crypt_rsc1_00000"),
            "/dev/mapper/stackbd_crypt_rsc1_00000"
        );
    }
}
