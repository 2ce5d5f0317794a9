//! NodeRegistry: the registered nodes, placement across them, and the
//! lease table.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::future::join_all;
use rand::seq::SliceRandom;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use simfleet_core::{Criteria, DeviceHandle, DeviceRef, StatusSnapshot};

use crate::error::{ClusterError, ClusterResult, NodeFailure};
use crate::leases::ActiveDevices;
use crate::wrapper::NodeWrapper;

pub struct NodeRegistry {
    nodes: RwLock<HashMap<String, Arc<NodeWrapper>>>,
    active_devices: Arc<ActiveDevices>,
    /// Lease timeout of new devices; `None` never expires.
    device_timeout: Option<Duration>,
    initial_registration_complete: AtomicBool,
}

impl NodeRegistry {
    pub fn new(active_devices: Arc<ActiveDevices>) -> Self {
        Self {
            nodes: RwLock::new(HashMap::new()),
            active_devices,
            device_timeout: None,
            initial_registration_complete: AtomicBool::new(false),
        }
    }

    pub fn with_device_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.device_timeout = timeout;
        self
    }

    pub fn active_devices(&self) -> &Arc<ActiveDevices> {
        &self.active_devices
    }

    /// Register `wrapper` under its public host. `false` if the host is
    /// already registered; the existing wrapper is kept.
    pub async fn add(&self, wrapper: Arc<NodeWrapper>) -> bool {
        let host = wrapper.public_host().to_string();
        let mut nodes = self.nodes.write().await;
        if nodes.contains_key(&host) {
            warn!(node = %host, "node already registered");
            return false;
        }
        nodes.insert(host.clone(), wrapper);
        info!(node = %host, registered = nodes.len(), "node registered");
        true
    }

    /// Deregister `host` and drop its leases. `true` only for the call
    /// that actually removed it.
    pub async fn remove_if_present(&self, host: &str) -> bool {
        let removed = self.nodes.write().await.remove(host);
        if removed.is_none() {
            return false;
        }
        self.active_devices.unregister_node_devices(host);
        warn!(node = %host, "node deregistered");
        true
    }

    pub async fn contains(&self, host: &str) -> bool {
        self.nodes.read().await.contains_key(host)
    }

    pub async fn get(&self, host: &str) -> Option<Arc<NodeWrapper>> {
        self.nodes.read().await.get(host).cloned()
    }

    pub async fn all(&self) -> Vec<Arc<NodeWrapper>> {
        self.nodes.read().await.values().cloned().collect()
    }

    /// Nodes eligible for placement: enabled, started and reachable.
    pub async fn alive(&self) -> Vec<Arc<NodeWrapper>> {
        self.nodes
            .read()
            .await
            .values()
            .filter(|w| w.is_enabled() && w.is_alive())
            .cloned()
            .collect()
    }

    pub async fn capacities_total(&self, criteria: &Criteria) -> u32 {
        let alive = self.alive().await;
        join_all(alive.iter().map(|w| async move { w.node().total_capacity(criteria).await }))
            .await
            .into_iter()
            .sum()
    }

    pub async fn has_capacity(&self, criteria: &Criteria) -> bool {
        let alive = self.alive().await;
        join_all(alive.iter().map(|w| async move { w.node().capacity_remaining(criteria).await }))
            .await
            .into_iter()
            .any(|remaining| remaining > 0.0)
    }

    pub fn mark_initial_registration_complete(&self) {
        if !self.initial_registration_complete.swap(true, Ordering::AcqRel) {
            info!("initial node registration complete");
        }
    }

    pub fn is_initial_registration_complete(&self) -> bool {
        self.initial_registration_complete.load(Ordering::Acquire)
    }

    /// Place a device on the alive node with the most free capacity and
    /// lease it to `owner`.
    ///
    /// The lease is registered as soon as the node accepts the request;
    /// the device is still preparing. Poll [`NodeRegistry::device_state`]
    /// for readiness.
    pub async fn create_device_async(
        &self,
        criteria: &Criteria,
        owner: Option<&str>,
    ) -> ClusterResult<DeviceHandle> {
        let nodes = self.all().await;
        if nodes.is_empty() {
            return Err(ClusterError::NoNodesRegistered);
        }

        let mut alive: Vec<_> = nodes
            .iter()
            .filter(|w| w.is_enabled() && w.is_alive())
            .collect();
        if alive.is_empty() {
            let failures = nodes
                .iter()
                .map(|w| NodeFailure {
                    node: w.public_host().to_string(),
                    error: w.last_error(),
                })
                .collect();
            return Err(ClusterError::NoAliveNodes { failures });
        }

        // Ties go to a random node.
        alive.shuffle(&mut rand::rng());
        let remaining = join_all(
            alive
                .iter()
                .map(|w| async move { w.node().capacity_remaining(criteria).await }),
        )
        .await;
        let (target, capacity) = alive
            .into_iter()
            .zip(remaining)
            .max_by(|a, b| a.1.total_cmp(&b.1))
            .ok_or(ClusterError::NoNodesRegistered)?;
        debug!(node = %target.public_host(), capacity, "placement target selected");

        let node = target.node();
        let handle = node.create_device_async(criteria).await?;
        self.active_devices.register(
            handle.reference.clone(),
            node,
            self.device_timeout,
            owner.map(String::from),
        );
        info!(device = %handle.reference, node = %handle.node, ?owner, "device leased");
        Ok(handle)
    }

    pub async fn device_state(&self, reference: &DeviceRef) -> ClusterResult<StatusSnapshot> {
        let node = self.active_devices.get_node_for(reference)?;
        Ok(node.state(reference).await?)
    }

    pub async fn reset_device(&self, reference: &DeviceRef) -> ClusterResult<()> {
        let node = self.active_devices.get_node_for(reference)?;
        Ok(node.reset_async(reference).await?)
    }

    pub async fn renew_device(&self, reference: &DeviceRef) -> ClusterResult<()> {
        let node = self.active_devices.get_node_for(reference)?;
        Ok(node.renew_async(reference).await?)
    }

    pub async fn delete_release_device(&self, reference: &DeviceRef, reason: &str) -> bool {
        let released = self.active_devices.release_device(reference, reason).await;
        if !released {
            warn!(device = %reference, "release requested for unknown device");
        }
        released
    }

    /// Devices hosted by every registered node.
    pub async fn list_devices(&self) -> Vec<DeviceHandle> {
        let nodes = self.all().await;
        join_all(nodes.iter().map(|w| async move { w.node().list().await }))
            .await
            .into_iter()
            .flatten()
            .collect()
    }

    /// Stop every node in parallel and empty the registry.
    pub async fn dispose(&self) {
        let nodes: Vec<_> = self.nodes.write().await.drain().map(|(_, w)| w).collect();
        info!(count = nodes.len(), "disposing nodes");
        join_all(nodes.iter().map(|w| w.stop())).await;
    }
}
