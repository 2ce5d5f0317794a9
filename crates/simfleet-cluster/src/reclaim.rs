//! Background release of devices whose lease ran out.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::leases::ActiveDevices;

const MIN_SLEEP: Duration = Duration::from_secs(1);
const DEFAULT_MAX_SLEEP: Duration = Duration::from_secs(60);
/// How long one release may take before the loop stops waiting for it.
const RELEASE_TIMEOUT: Duration = Duration::from_secs(120);
const REASON: &str = "lease expired";

pub struct LeaseReclaimer {
    active_devices: Arc<ActiveDevices>,
    max_sleep: Duration,
    release_timeout: Duration,
}

impl LeaseReclaimer {
    pub fn new(active_devices: Arc<ActiveDevices>) -> Self {
        Self {
            active_devices,
            max_sleep: DEFAULT_MAX_SLEEP,
            release_timeout: RELEASE_TIMEOUT,
        }
    }

    pub fn with_max_sleep(mut self, max_sleep: Duration) -> Self {
        self.max_sleep = max_sleep.max(MIN_SLEEP);
        self
    }

    pub fn with_release_timeout(mut self, timeout: Duration) -> Self {
        self.release_timeout = timeout;
        self
    }

    /// Release every expired lease. Returns how many devices were released.
    ///
    /// Expired leases leave the table before any node is contacted. Each
    /// release runs in its own task; one that hangs past the release timeout
    /// is left running and counted as not released.
    pub async fn reclaim_once(&self) -> usize {
        let expired = self.active_devices.take_expired();
        if expired.is_empty() {
            return 0;
        }
        info!(count = expired.len(), "reclaiming expired leases");

        let releases = expired.into_iter().map(|(reference, node)| {
            let timeout = self.release_timeout;
            async move {
                info!(device = %reference, node = %node.public_host(), reason = REASON, "releasing leased device");
                let task = {
                    let reference = reference.clone();
                    tokio::spawn(async move { node.delete_release(&reference, REASON).await })
                };
                match tokio::time::timeout(timeout, task).await {
                    Ok(Ok(released)) => released,
                    Ok(Err(e)) => {
                        warn!(device = %reference, error = %e, "release task failed");
                        false
                    }
                    Err(_) => {
                        warn!(device = %reference, ?timeout, "release still running, moving on");
                        false
                    }
                }
            }
        });
        join_all(releases).await.into_iter().filter(|released| *released).count()
    }

    /// Time until the next lease deadline, clamped to `[1s, max_sleep]`.
    pub fn next_sleep(&self) -> Duration {
        let until = self
            .active_devices
            .next_release_at()
            .saturating_duration_since(Instant::now());
        until.min(self.max_sleep).max(MIN_SLEEP)
    }

    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(max_sleep = ?self.max_sleep, "lease reclaimer started");
        loop {
            let released = self.reclaim_once().await;
            if released > 0 {
                debug!(released, "leases reclaimed");
            }
            tokio::select! {
                _ = tokio::time::sleep(self.next_sleep()) => {}
                _ = shutdown.changed() => {
                    info!("lease reclaimer shutting down");
                    break;
                }
            }
        }
    }
}
