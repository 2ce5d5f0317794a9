//! NodeRegistrar: keeps the registry in line with the configured nodes
//! and drives fleet restarts.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::watch;
use tracing::{error, info, warn};

use simfleet_core::FleetConfig;
use simfleet_node::NodeFactory;

use crate::error::ClusterResult;
use crate::registry::NodeRegistry;
use crate::wrapper::NodeWrapper;

/// Wait before probing a rebooting node again.
const REBOOT_SETTLE: Duration = Duration::from_secs(30);
const REBOOT_POLL: Duration = Duration::from_secs(10);
const REBOOT_TIMEOUT: Duration = Duration::from_secs(10 * 60);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RestartOptions {
    /// Restart all nodes at once instead of one by one.
    pub parallel: bool,
    /// Restart even nodes holding leases that never expire.
    pub force: bool,
    /// Reboot the machine between stop and start.
    pub reboot: bool,
}

pub struct NodeRegistrar {
    wrappers: Vec<Arc<NodeWrapper>>,
    registry: Arc<NodeRegistry>,
    interval: Duration,
    restarting: AtomicBool,
}

impl NodeRegistrar {
    /// One wrapper per configured node, built once up front.
    pub fn new(
        config: &FleetConfig,
        factory: &dyn NodeFactory,
        registry: Arc<NodeRegistry>,
    ) -> ClusterResult<Self> {
        let orchestrator = &config.orchestrator;
        let wrappers = config
            .nodes
            .iter()
            .map(|node| -> ClusterResult<Arc<NodeWrapper>> {
                Ok(Arc::new(NodeWrapper::new(factory.build(node)?).with_health_check(
                    orchestrator.node_check_interval(),
                    orchestrator.max_health_check_attempts,
                )))
            })
            .collect::<ClusterResult<Vec<_>>>()?;
        Ok(Self::from_wrappers(wrappers, registry).with_interval(orchestrator.registration_interval()))
    }

    pub fn from_wrappers(wrappers: Vec<Arc<NodeWrapper>>, registry: Arc<NodeRegistry>) -> Self {
        Self {
            wrappers,
            registry,
            interval: Duration::from_secs(60),
            restarting: AtomicBool::new(false),
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn registry(&self) -> &Arc<NodeRegistry> {
        &self.registry
    }

    pub fn wrappers(&self) -> &[Arc<NodeWrapper>] {
        &self.wrappers
    }

    /// Start and register every configured node that is not registered.
    /// Returns how many nodes were newly registered.
    pub async fn auto_register(&self) -> usize {
        let mut pending = Vec::new();
        for wrapper in &self.wrappers {
            if !self.registry.contains(wrapper.public_host()).await {
                pending.push(wrapper.clone());
            }
        }

        let registered = join_all(pending.iter().map(|w| self.register(w)))
            .await
            .into_iter()
            .filter(|ok| *ok)
            .count();
        if !pending.is_empty() {
            info!(
                registered,
                pending = pending.len(),
                total = self.wrappers.len(),
                "auto-registration pass finished"
            );
        }
        self.registry.mark_initial_registration_complete();
        registered
    }

    async fn register(&self, wrapper: &Arc<NodeWrapper>) -> bool {
        wrapper.stop().await;
        if !wrapper.start().await {
            warn!(
                node = %wrapper.public_host(),
                error = wrapper.last_error().as_deref().unwrap_or("unknown"),
                "node not registered"
            );
            return false;
        }
        wrapper.enable();
        if !self.registry.add(wrapper.clone()).await {
            return false;
        }
        wrapper.start_periodic_health_check(Arc::downgrade(&self.registry));
        true
    }

    /// Register immediately, then every interval until shutdown.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(interval = ?self.interval, nodes = self.wrappers.len(), "node registrar started");
        loop {
            if !self.restarting.load(Ordering::Acquire) {
                self.auto_register().await;
            }
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {}
                _ = shutdown.changed() => {
                    info!("node registrar shutting down");
                    break;
                }
            }
        }
    }

    pub fn is_restarting(&self) -> bool {
        self.restarting.load(Ordering::Acquire)
    }

    /// Restart every registered node. `false` if a restart is already
    /// in progress; nodes that refuse to restart are left running.
    pub async fn restart_nodes_gracefully(&self, options: RestartOptions) -> bool {
        if self.restarting.swap(true, Ordering::AcqRel) {
            warn!("node restart already in progress");
            return false;
        }
        let nodes = self.registry.all().await;
        info!(count = nodes.len(), ?options, "restarting nodes");

        let restarted = if options.parallel {
            join_all(nodes.iter().map(|w| self.restart_node(w, options)))
                .await
                .into_iter()
                .filter(|ok| *ok)
                .count()
        } else {
            let mut count = 0;
            for wrapper in &nodes {
                if self.restart_node(wrapper, options).await {
                    count += 1;
                }
            }
            count
        };

        info!(restarted, total = nodes.len(), "node restart finished");
        self.restarting.store(false, Ordering::Release);
        true
    }

    async fn restart_node(&self, wrapper: &Arc<NodeWrapper>, options: RestartOptions) -> bool {
        let host = wrapper.public_host().to_string();
        wrapper.disable();

        let leases = self.registry.active_devices();
        if !options.force && leases.has_unexpiring_leases(&host) {
            warn!(node = %host, "node holds leases that never expire, skipping restart");
            wrapper.enable();
            return false;
        }

        let held = leases.active_devices_by_node(&host);
        if !held.is_empty() {
            info!(node = %host, count = held.len(), "releasing leased devices before restart");
            leases.release_devices(&held, "node restart").await;
        }

        wrapper.stop().await;
        if options.reboot {
            if let Err(e) = wrapper.reboot().await {
                error!(node = %host, error = %e, "node reboot failed");
            } else {
                wait_until_reachable(wrapper).await;
            }
        }

        if !wrapper.start().await {
            error!(
                node = %host,
                error = wrapper.last_error().as_deref().unwrap_or("unknown"),
                "node failed to restart, deregistering"
            );
            // Auto-registration picks it up again once it recovers.
            self.registry.remove_if_present(&host).await;
            return false;
        }
        wrapper.enable();
        wrapper.start_periodic_health_check(Arc::downgrade(&self.registry));
        info!(node = %host, "node restarted");
        true
    }
}

async fn wait_until_reachable(wrapper: &NodeWrapper) {
    tokio::time::sleep(REBOOT_SETTLE).await;
    let deadline = tokio::time::Instant::now() + REBOOT_TIMEOUT;
    while tokio::time::Instant::now() < deadline {
        if wrapper.node().is_reachable().await {
            return;
        }
        tokio::time::sleep(REBOOT_POLL).await;
    }
    warn!(node = %wrapper.public_host(), "node still unreachable after reboot");
}
