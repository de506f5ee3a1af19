//! Snapshot shipping
//!
//! Runs snapshot send/receive pipelines as supervised worker processes.
//! Jobs are grouped per shipping operation; the group completes when every
//! job finished, and the first failing job cancels the rest of its group.

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// One shipping worker: a shell pipeline moving one snapshot volume
#[derive(Debug, Clone)]
pub struct ShippingJob {
    pub snapshot: String,
    /// Full pipeline, run through `sh -c`
    pub command: String,
}

/// Terminal state of one job
#[derive(Debug, Clone)]
pub struct ShippingOutcome {
    pub group_id: String,
    pub snapshot: String,
    pub success: bool,
    pub finished_at: DateTime<Utc>,
    /// Set when the whole group finished with this job
    pub group_done: Option<GroupResult>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupResult {
    Success,
    Failed,
}

struct GroupState {
    remaining: usize,
    failed: bool,
    cancel: CancellationToken,
    started_at: DateTime<Utc>,
}

/// Supervises shipping worker processes
pub struct SnapshotShippingManager {
    groups: DashMap<String, GroupState>,
    outcome_tx: mpsc::UnboundedSender<ShippingOutcome>,
}

impl SnapshotShippingManager {
    /// Returns the manager and the stream of job outcomes
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<ShippingOutcome>) {
        let (outcome_tx, outcome_rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                groups: DashMap::new(),
                outcome_tx,
            }),
            outcome_rx,
        )
    }

    /// Launch every job of a shipping group
    pub fn start_group(self: &Arc<Self>, group_id: &str, jobs: Vec<ShippingJob>) -> Result<()> {
        if jobs.is_empty() {
            return Err(Error::ShippingFailed {
                group: group_id.to_string(),
                reason: "shipping group has no jobs".to_string(),
            });
        }
        let cancel = CancellationToken::new();
        self.groups.insert(
            group_id.to_string(),
            GroupState {
                remaining: jobs.len(),
                failed: false,
                cancel: cancel.clone(),
                started_at: Utc::now(),
            },
        );
        info!("Shipping group '{}' started with {} jobs", group_id, jobs.len());

        for job in jobs {
            let manager = Arc::clone(self);
            let group = group_id.to_string();
            let token = cancel.clone();
            tokio::spawn(async move {
                let success = manager.run_job(&group, &job, token).await;
                manager.job_finished(&group, &job.snapshot, success);
            });
        }
        Ok(())
    }

    /// Cancel a running group; its jobs report as failed
    pub fn abort_group(&self, group_id: &str) -> Result<()> {
        let group = self
            .groups
            .get(group_id)
            .ok_or_else(|| Error::ShippingGroupNotFound {
                group: group_id.to_string(),
            })?;
        group.cancel.cancel();
        Ok(())
    }

    pub fn active_groups(&self) -> Vec<String> {
        self.groups.iter().map(|e| e.key().clone()).collect()
    }

    async fn run_job(&self, group_id: &str, job: &ShippingJob, token: CancellationToken) -> bool {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", &job.command])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                warn!("Shipping job for '{}' failed to spawn: {}", job.snapshot, e);
                return false;
            }
        };

        // stream progress lines while waiting, so a cancelled group kills
        // the pipeline mid-transfer
        let stdout = child.stdout.take();
        let snapshot = job.snapshot.clone();
        let log_task = tokio::spawn(async move {
            if let Some(stdout) = stdout {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!("[{}] {}", snapshot, line);
                }
            }
        });

        let status = tokio::select! {
            status = child.wait() => status,
            _ = token.cancelled() => {
                warn!(
                    "Shipping job for '{}' in group '{}' cancelled",
                    job.snapshot, group_id
                );
                if let Err(e) = child.kill().await {
                    warn!("Could not kill shipping worker: {}", e);
                }
                log_task.abort();
                return false;
            }
        };
        log_task.abort();

        match status {
            Ok(status) if status.success() => true,
            Ok(status) => {
                warn!(
                    "Shipping job for '{}' exited with {:?}",
                    job.snapshot,
                    status.code()
                );
                false
            }
            Err(e) => {
                warn!("Shipping job for '{}' failed: {}", job.snapshot, e);
                false
            }
        }
    }

    fn job_finished(&self, group_id: &str, snapshot: &str, success: bool) {
        let mut group_done = None;
        if let Some(mut group) = self.groups.get_mut(group_id) {
            group.remaining -= 1;
            if !success && !group.failed {
                // first failure wins: tear the rest of the group down
                group.failed = true;
                group.cancel.cancel();
            }
            if group.remaining == 0 {
                group_done = Some(if group.failed {
                    GroupResult::Failed
                } else {
                    GroupResult::Success
                });
                info!(
                    "Shipping group '{}' finished after {}s: {:?}",
                    group_id,
                    (Utc::now() - group.started_at).num_seconds(),
                    group_done
                );
            }
        }
        if group_done.is_some() {
            self.groups.remove(group_id);
        }
        // receiver may be gone during shutdown
        let _ = self.outcome_tx.send(ShippingOutcome {
            group_id: group_id.to_string(),
            snapshot: snapshot.to_string(),
            success,
            finished_at: Utc::now(),
            group_done,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_group_success() {
        let (manager, mut outcomes) = SnapshotShippingManager::new();
        manager
            .start_group(
                "grp1",
                vec![
                    ShippingJob {
                        snapshot: "snap_a".to_string(),
                        command: "true".to_string(),
                    },
                    ShippingJob {
                        snapshot: "snap_b".to_string(),
                        command: "true".to_string(),
                    },
                ],
            )
            .unwrap();

        let first = outcomes.recv().await.unwrap();
        let second = outcomes.recv().await.unwrap();
        assert!(first.success && second.success);
        assert_eq!(second.group_done, Some(GroupResult::Success));
        assert!(manager.active_groups().is_empty());
    }

    #[tokio::test]
    async fn test_first_failure_cancels_group() {
        let (manager, mut outcomes) = SnapshotShippingManager::new();
        manager
            .start_group(
                "grp1",
                vec![
                    ShippingJob {
                        snapshot: "fast_fail".to_string(),
                        command: "false".to_string(),
                    },
                    ShippingJob {
                        snapshot: "slow".to_string(),
                        command: "sleep 30".to_string(),
                    },
                ],
            )
            .unwrap();

        let mut results = Vec::new();
        while let Some(outcome) = outcomes.recv().await {
            let done = outcome.group_done;
            results.push(outcome);
            if done.is_some() {
                break;
            }
        }
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|o| !o.success));
        assert_eq!(results[1].group_done, Some(GroupResult::Failed));
    }

    #[tokio::test]
    async fn test_abort_unknown_group() {
        let (manager, _outcomes) = SnapshotShippingManager::new();
        assert!(manager.abort_group("nope").is_err());
    }

    #[tokio::test]
    async fn test_empty_group_rejected() {
        let (manager, _outcomes) = SnapshotShippingManager::new();
        assert!(manager.start_group("grp1", Vec::new()).is_err());
    }
}
