//! nvme-cli command wrappers
//!
//! Initiator-side NVMe-oF handling: connect to a remote subsystem by NQN
//! and discover which local controller the kernel assigned to it.

use super::{parse_json, ToolRunner};
use crate::error::Result;

/// A connected NVMe-oF subsystem
#[derive(Debug, Clone)]
pub struct NvmeSubsystem {
    pub nqn: String,
    /// Controller name, e.g. "nvme0"
    pub controller: String,
}

/// Connect to a remote subsystem
pub async fn connect(
    runner: &ToolRunner,
    nqn: &str,
    transport: &str,
    address: &str,
    port: u16,
) -> Result<()> {
    let port_str = port.to_string();
    runner
        .run(
            "nvme",
            &[
                "connect",
                "--transport",
                transport,
                "--traddr",
                address,
                "--trsvcid",
                &port_str,
                "--nqn",
                nqn,
            ],
        )
        .await?;
    Ok(())
}

/// Disconnect every controller of a subsystem
pub async fn disconnect(runner: &ToolRunner, nqn: &str) -> Result<()> {
    runner.run("nvme", &["disconnect", "--nqn", nqn]).await?;
    Ok(())
}

/// List connected subsystems with their local controller names
pub async fn list_subsystems(runner: &ToolRunner) -> Result<Vec<NvmeSubsystem>> {
    let out = runner
        .run_unchecked("nvme", &["list-subsys", "-o", "json"])
        .await?;
    if !out.success() || out.stdout.trim().is_empty() {
        return Ok(Vec::new());
    }
    let json = parse_json("nvme list-subsys", &out.stdout)?;

    let mut subsystems = Vec::new();
    for subsys in json["Subsystems"].as_array().into_iter().flatten() {
        let nqn = subsys["NQN"].as_str().unwrap_or_default();
        let controller = subsys["Paths"]
            .as_array()
            .and_then(|p| p.first())
            .and_then(|p| p["Name"].as_str());
        if let (false, Some(ctrl)) = (nqn.is_empty(), controller) {
            subsystems.push(NvmeSubsystem {
                nqn: nqn.to_string(),
                controller: ctrl.to_string(),
            });
        }
    }
    Ok(subsystems)
}

/// First namespace of a controller
pub fn namespace_path(controller: &str, namespace: u32) -> String {
    format!("/dev/{}n{}", controller, namespace)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subsys_parsing() {
        let json: serde_json::Value = serde_json::from_str(
            r#"{"Subsystems":[{"Name":"nvme-subsys0",
                 "NQN":"nqn.2014-08.io.stackbd:rsc1",
                 "Paths":[{"Name":"nvme0","Transport":"tcp","State":"live"}]}]}"#,
        )
        .unwrap();
        let subsys = &json["Subsystems"][0];
        assert_eq!(
            subsys["NQN"].as_str().unwrap(),
            "nqn.2014-08.io.stackbd:rsc1"
        );
        assert_eq!(subsys["Paths"][0]["Name"].as_str().unwrap(), "nvme0");
    }

    #[test]
    fn test_namespace_path() {
        assert_eq!(namespace_path("nvme0", 1), "/dev/nvme0n1");
    }
}
