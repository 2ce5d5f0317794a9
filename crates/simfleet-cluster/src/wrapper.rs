//! NodeWrapper: the orchestrator's view of one configured node.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use std::time::Duration;

use tokio::sync::{Mutex as AsyncMutex, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use simfleet_device::{HealthStatus, HealthTracker};
use simfleet_node::{Node, NodeResult};

use crate::registry::NodeRegistry;

const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(60);
const DEFAULT_MAX_ATTEMPTS: u32 = 6;

struct HealthSlot {
    handle: JoinHandle<()>,
    shutdown_tx: watch::Sender<bool>,
}

/// Flags are plain atomics: only the health loop and explicit
/// start/stop/enable calls write them.
pub struct NodeWrapper {
    node: Arc<dyn Node>,
    started: AtomicBool,
    reachable: AtomicBool,
    enabled: AtomicBool,
    last_error: RwLock<Option<String>>,
    /// Serializes start and stop.
    lifecycle: AsyncMutex<()>,
    health: Mutex<Option<HealthSlot>>,
    check_interval: Duration,
    max_attempts: u32,
}

impl NodeWrapper {
    pub fn new(node: Arc<dyn Node>) -> Self {
        Self {
            node,
            started: AtomicBool::new(false),
            reachable: AtomicBool::new(false),
            enabled: AtomicBool::new(true),
            last_error: RwLock::new(None),
            lifecycle: AsyncMutex::new(()),
            health: Mutex::new(None),
            check_interval: DEFAULT_CHECK_INTERVAL,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    /// Probe every `interval`; deregister after `max_attempts` misses in a row.
    pub fn with_health_check(mut self, interval: Duration, max_attempts: u32) -> Self {
        self.check_interval = interval;
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn node(&self) -> Arc<dyn Node> {
        self.node.clone()
    }

    pub fn public_host(&self) -> &str {
        self.node.public_host()
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    pub fn is_reachable(&self) -> bool {
        self.reachable.load(Ordering::Acquire)
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Started and reachable.
    pub fn is_alive(&self) -> bool {
        self.is_started() && self.is_reachable()
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_error(&self, error: Option<String>) {
        *self.last_error.write().unwrap_or_else(PoisonError::into_inner) = error;
    }

    pub fn enable(&self) {
        self.enabled.store(true, Ordering::Release);
        info!(node = %self.public_host(), "node enabled");
    }

    /// Stop new placements without tearing the node down.
    pub fn disable(&self) {
        self.enabled.store(false, Ordering::Release);
        info!(node = %self.public_host(), "node disabled");
    }

    /// Probe and prepare the node. `false` if it was already started or
    /// could not be started; the reason is kept in `last_error`.
    pub async fn start(&self) -> bool {
        let _guard = self.lifecycle.lock().await;
        if self.is_started() {
            return false;
        }
        let host = self.public_host();

        if !self.node.is_reachable().await {
            self.reachable.store(false, Ordering::Release);
            self.set_error(Some(format!("node {host} is not reachable")));
            warn!(node = %host, "node unreachable, not starting");
            return false;
        }
        self.reachable.store(true, Ordering::Release);

        match self.node.prepare().await {
            Ok(()) => {
                self.started.store(true, Ordering::Release);
                self.set_error(None);
                info!(node = %host, kind = %self.node.kind(), "node started");
                true
            }
            Err(e) => {
                error!(node = %host, error = %e, "node preparation failed");
                self.set_error(Some(e.to_string()));
                false
            }
        }
    }

    /// Stop health checks and dispose every device. Never fails.
    pub async fn stop(&self) {
        let _guard = self.lifecycle.lock().await;
        self.stop_health_check();
        self.node.dispose().await;
        self.started.store(false, Ordering::Release);
        debug!(node = %self.public_host(), "node stopped");
    }

    pub async fn reboot(&self) -> NodeResult<()> {
        self.node.reboot().await
    }

    /// Re-probe reachability on a fixed interval. After `max_attempts`
    /// consecutive failures the node is marked unreachable and removed
    /// from `registry`, once, and the loop ends.
    pub fn start_periodic_health_check(self: &Arc<Self>, registry: Weak<NodeRegistry>) {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let wrapper = Arc::downgrade(self);
        let interval = self.check_interval;
        let max_attempts = self.max_attempts;
        let handle = tokio::spawn(health_loop(wrapper, registry, interval, max_attempts, shutdown_rx));

        let previous = self
            .health
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(HealthSlot {
                handle,
                shutdown_tx,
            });
        if let Some(old) = previous {
            let _ = old.shutdown_tx.send(true);
            old.handle.abort();
        }
        debug!(node = %self.public_host(), ?interval, max_attempts, "health check started");
    }

    pub fn stop_health_check(&self) {
        let slot = self
            .health
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(slot) = slot {
            let _ = slot.shutdown_tx.send(true);
            slot.handle.abort();
            debug!(node = %self.public_host(), "health check stopped");
        }
    }

    pub fn is_health_checking(&self) -> bool {
        self.health
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|slot| !slot.handle.is_finished())
    }
}

impl Drop for NodeWrapper {
    fn drop(&mut self) {
        if let Some(slot) = self.health.get_mut().unwrap_or_else(PoisonError::into_inner).take() {
            slot.handle.abort();
        }
    }
}

async fn health_loop(
    wrapper: Weak<NodeWrapper>,
    registry: Weak<NodeRegistry>,
    interval: Duration,
    max_attempts: u32,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut tracker = HealthTracker::new(max_attempts);
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = shutdown.changed() => break,
        }
        let Some(wrapper) = wrapper.upgrade() else {
            break;
        };
        let host = wrapper.public_host().to_string();

        let reachable = wrapper.node.is_reachable().await;
        if reachable {
            wrapper.reachable.store(true, Ordering::Release);
        }
        match tracker.record(reachable.into()) {
            HealthStatus::Unhealthy => {
                wrapper.reachable.store(false, Ordering::Release);
                let message = format!(
                    "node failed {} consecutive reachability checks",
                    tracker.consecutive_failures()
                );
                error!(node = %host, error = %message, "deregistering node");
                wrapper.set_error(Some(message));
                if let Some(registry) = registry.upgrade() {
                    registry.remove_if_present(&host).await;
                }
                break;
            }
            status => {
                if !reachable {
                    warn!(
                        node = %host,
                        failures = tracker.consecutive_failures(),
                        max_attempts,
                        "node reachability check failed"
                    );
                }
                debug!(node = %host, ?status, "node health checked");
            }
        }
    }
}
