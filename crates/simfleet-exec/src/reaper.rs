//! Periodic collection of exited-but-uncollected child processes.

use std::time::Duration;

use nix::errno::Errno;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::sys::{self, ReapOutcome};

/// Outcome of one reaping pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReapReport {
    /// Zombie children found by the scan.
    pub found: usize,
    pub reaped: Vec<i32>,
    pub failed: Vec<i32>,
}

/// Keeps the process table clear of zombies left by helper processes.
pub struct ZombieReaper {
    interval: Duration,
}

impl ZombieReaper {
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Scan once and collect every zombie child found.
    pub async fn reap_once(&self) -> ReapReport {
        let zombies = match tokio::task::spawn_blocking(sys::zombie_children).await {
            Ok(Ok(zombies)) => zombies,
            Ok(Err(e)) => {
                warn!(error = %e, "failed to list child processes");
                return ReapReport::default();
            }
            Err(e) => {
                warn!(error = %e, "child process scan panicked");
                return ReapReport::default();
            }
        };
        reap_all(&zombies, sys::reap)
    }

    /// Run until `shutdown` flips.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        // The first tick completes immediately.
        ticker.tick().await;
        info!(interval = ?self.interval, "zombie reaper started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let report = self.reap_once().await;
                    if report.found > 0 {
                        info!(
                            found = report.found,
                            reaped = report.reaped.len(),
                            failed = report.failed.len(),
                            "zombie reaping pass"
                        );
                    }
                }
                _ = shutdown.changed() => {
                    debug!("zombie reaper shutting down");
                    break;
                }
            }
        }
    }
}

/// Reap each pid independently; one failure never stops the rest.
fn reap_all<F>(pids: &[i32], mut reap: F) -> ReapReport
where
    F: FnMut(i32) -> Result<ReapOutcome, Errno>,
{
    let mut report = ReapReport {
        found: pids.len(),
        ..ReapReport::default()
    };
    for &pid in pids {
        match reap(pid) {
            Ok(ReapOutcome::Collected(code)) => {
                debug!(pid, ?code, "zombie reaped");
                report.reaped.push(pid);
            }
            Ok(ReapOutcome::StillRunning) => {
                debug!(pid, "child not ready to be reaped");
            }
            Ok(ReapOutcome::NotChild) => {
                debug!(pid, "child already collected");
            }
            Err(e) => {
                warn!(pid, error = %e, "failed to reap zombie");
                report.failed.push(pid);
            }
        }
    }
    report
}
