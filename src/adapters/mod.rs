//! External tool adapters
//!
//! Thin wrappers around the platform utilities the layers drive
//! (lvm tools, zfs/zpool, cryptsetup, dmsetup, drbd-utils, nvme-cli,
//! SPDK RPC). Every operation is one external command with an argv list
//! built from typed parameters; exit code 0 plus the absence of a
//! recognized error token in stderr means success. A hung process is
//! killed after the configured timeout.

pub mod cryptsetup;
pub mod dmsetup;
pub mod drbd;
pub mod lvm;
pub mod nvme;
pub mod spdk;
pub mod zfs;

use crate::error::{Error, Result};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::trace;

// =============================================================================
// Command output
// =============================================================================

/// Captured output of one external command
#[derive(Debug, Clone)]
pub struct CmdOutput {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CmdOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

// =============================================================================
// Tool runner
// =============================================================================

/// Executes external commands with an enforced timeout
#[derive(Debug, Clone)]
pub struct ToolRunner {
    timeout: Duration,
}

impl ToolRunner {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// Run a command; non-zero exit raises `ToolExecution`
    pub async fn run(&self, program: &str, args: &[&str]) -> Result<CmdOutput> {
        let output = self.spawn(program, args, None).await?;
        self.check(program, args, output)
    }

    /// Run a command and additionally treat any of `error_tokens` appearing
    /// in stderr as a failure even on exit code 0
    pub async fn run_checked(
        &self,
        program: &str,
        args: &[&str],
        error_tokens: &[&str],
    ) -> Result<CmdOutput> {
        let output = self.run(program, args).await?;
        let stderr_lower = output.stderr.to_lowercase();
        for token in error_tokens {
            if stderr_lower.contains(&token.to_lowercase()) {
                return Err(Error::ToolExecution {
                    command: render_command(program, args),
                    exit_code: output.exit_code,
                    stdout: output.stdout,
                    stderr: output.stderr,
                });
            }
        }
        Ok(output)
    }

    /// Run a command feeding `input` on stdin (key material, tables)
    pub async fn run_with_stdin(
        &self,
        program: &str,
        args: &[&str],
        input: &[u8],
    ) -> Result<CmdOutput> {
        let output = self.spawn(program, args, Some(input)).await?;
        self.check(program, args, output)
    }

    /// Run a command where a non-zero exit is a meaningful answer rather
    /// than a failure (e.g. `cryptsetup isLuks`)
    pub async fn run_unchecked(&self, program: &str, args: &[&str]) -> Result<CmdOutput> {
        self.spawn(program, args, None).await
    }

    async fn spawn(&self, program: &str, args: &[&str], input: Option<&[u8]>) -> Result<CmdOutput> {
        trace!("Executing: {}", render_command(program, args));

        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(if input.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // dropping the wait future at timeout must take the process with it
            .kill_on_drop(true);

        let fut = async {
            let mut child = cmd.spawn()?;
            if let Some(bytes) = input {
                if let Some(mut stdin) = child.stdin.take() {
                    stdin.write_all(bytes).await?;
                    stdin.shutdown().await?;
                }
            }
            child.wait_with_output().await
        };

        let output = tokio::time::timeout(self.timeout, fut)
            .await
            .map_err(|_| Error::ToolTimeout {
                command: render_command(program, args),
                timeout: self.timeout,
            })??;

        Ok(CmdOutput {
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    fn check(&self, program: &str, args: &[&str], output: CmdOutput) -> Result<CmdOutput> {
        if output.success() {
            Ok(output)
        } else {
            Err(Error::ToolExecution {
                command: render_command(program, args),
                exit_code: output.exit_code,
                stdout: output.stdout,
                stderr: output.stderr,
            })
        }
    }
}

fn render_command(program: &str, args: &[&str]) -> String {
    let mut out = String::from(program);
    for arg in args {
        out.push(' ');
        out.push_str(arg);
    }
    out
}

/// Parse a command's JSON output, mapping failures to `ToolOutputParse`
pub fn parse_json(command: &str, stdout: &str) -> Result<serde_json::Value> {
    serde_json::from_str(stdout).map_err(|e| Error::ToolOutputParse {
        command: command.to_string(),
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn runner() -> ToolRunner {
        ToolRunner::new(Duration::from_secs(5))
    }

    #[tokio::test]
    async fn test_run_success() {
        let out = runner().run("echo", &["hello"]).await.unwrap();
        assert!(out.success());
        assert_eq!(out.stdout.trim(), "hello");
    }

    #[tokio::test]
    async fn test_run_failure() {
        let err = runner().run("false", &[]).await.unwrap_err();
        assert_matches!(err, Error::ToolExecution { .. });
    }

    #[tokio::test]
    async fn test_run_unchecked_keeps_exit_code() {
        let out = runner().run_unchecked("false", &[]).await.unwrap();
        assert_eq!(out.exit_code, Some(1));
    }

    #[tokio::test]
    async fn test_timeout_kills() {
        let short = ToolRunner::new(Duration::from_millis(50));
        let err = short.run("sleep", &["5"]).await.unwrap_err();
        assert_matches!(err, Error::ToolTimeout { .. });
    }

    #[tokio::test]
    async fn test_stdin_is_forwarded() {
        let out = runner().run_with_stdin("cat", &[], b"key-material").await.unwrap();
        assert_eq!(out.stdout, "key-material");
    }

    #[tokio::test]
    async fn test_error_token_detection() {
        // sh writes to stderr but exits 0
        let err = runner()
            .run_checked("sh", &["-c", "echo 'WARNING: something failed' >&2"], &["failed"])
            .await
            .unwrap_err();
        assert_matches!(err, Error::ToolExecution { .. });
    }
}
