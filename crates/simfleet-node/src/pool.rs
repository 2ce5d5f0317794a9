//! The one `Node` implementation, generic over its backend.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use simfleet_core::{Criteria, DeviceHandle, DeviceRef, NodeConfig, NodeKind, StatusSnapshot};
use simfleet_device::{Device, DeviceContext, DeviceSettings, PortAllocator};
use simfleet_exec::{Env, RemoteExecutor};

use crate::backend::{Backend, describe};
use crate::error::{NodeError, NodeResult};
use crate::node::Node;

const REBOOT_TIMEOUT: Duration = Duration::from_secs(30);

/// Devices hosted by the node plus creates still picking a unit.
/// Never held across an await.
#[derive(Default)]
struct Slots {
    devices: HashMap<DeviceRef, Arc<Device>>,
    pending: u32,
}

impl Slots {
    fn used(&self) -> u32 {
        self.devices.len() as u32 + self.pending
    }

    fn serials(&self) -> HashSet<String> {
        self.devices.values().map(|d| d.unit().serial.clone()).collect()
    }
}

/// A capacity slot taken by an in-flight create; given back on drop.
struct Reservation<'a> {
    slots: &'a Mutex<Slots>,
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        slots.pending = slots.pending.saturating_sub(1);
    }
}

pub struct PoolNode {
    config: NodeConfig,
    executor: Arc<RemoteExecutor>,
    backend: Arc<dyn Backend>,
    ports: Arc<PortAllocator>,
    context: DeviceContext,
    slots: Mutex<Slots>,
}

impl PoolNode {
    pub fn new(
        config: NodeConfig,
        executor: Arc<RemoteExecutor>,
        backend: Arc<dyn Backend>,
        ports: Arc<PortAllocator>,
        settings: DeviceSettings,
    ) -> Self {
        let context = DeviceContext {
            control: backend.control(),
            executor: executor.clone(),
            boot_pool: Arc::new(Semaphore::new(config.concurrent_boots.max(1) as usize)),
            settings,
        };
        Self {
            config,
            executor,
            backend,
            ports,
            context,
            slots: Mutex::new(Slots::default()),
        }
    }

    /// Configured capacity, capped by what the backend can physically host.
    pub fn capacity(&self) -> u32 {
        match self.backend.unit_limit() {
            Some(limit) => self.config.capacity.min(limit),
            None => self.config.capacity,
        }
    }

    fn slots(&self) -> MutexGuard<'_, Slots> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn device(&self, reference: &DeviceRef) -> NodeResult<Arc<Device>> {
        self.slots()
            .devices
            .get(reference)
            .cloned()
            .ok_or_else(|| NodeError::DeviceNotFound(reference.clone()))
    }

    /// Take a capacity slot and snapshot the serials already in use.
    fn reserve(&self, criteria: &Criteria) -> NodeResult<(Reservation<'_>, HashSet<String>)> {
        let capacity = self.capacity();
        let mut slots = self.slots();
        if slots.used() >= capacity || !self.backend.supports(criteria) {
            return Err(NodeError::OverCapacity {
                node: self.public_host().to_string(),
                capacity,
            });
        }
        slots.pending += 1;
        let in_use = slots.serials();
        Ok((Reservation { slots: &self.slots }, in_use))
    }
}

#[async_trait]
impl Node for PoolNode {
    fn public_host(&self) -> &str {
        self.config.public_host()
    }

    fn kind(&self) -> NodeKind {
        self.backend.kind()
    }

    async fn is_reachable(&self) -> bool {
        self.executor.is_reachable().await
    }

    async fn prepare(&self) -> NodeResult<()> {
        info!(node = %self.public_host(), kind = %self.kind(), "preparing node");
        self.backend.prepare_node().await
    }

    async fn dispose(&self) {
        let devices: Vec<Arc<Device>> = self.slots().devices.drain().map(|(_, d)| d).collect();
        if devices.is_empty() {
            return;
        }
        info!(node = %self.public_host(), count = devices.len(), "disposing devices");
        join_all(devices.iter().map(|device| async move {
            device.release("node disposed").await;
            self.ports.deallocate_device_ports(device.ports());
        }))
        .await;
    }

    async fn reboot(&self) -> NodeResult<()> {
        warn!(node = %self.public_host(), "rebooting node");
        let result = self
            .executor
            .exec(&["sudo", "-n", "shutdown", "-r", "now"], &Env::new(), REBOOT_TIMEOUT, true)
            .await?;
        if !result.success && !result.timed_out {
            return Err(NodeError::Lifecycle(format!(
                "reboot of {} failed: {}",
                self.public_host(),
                result.stderr.trim()
            )));
        }
        Ok(())
    }

    async fn create_device_async(&self, criteria: &Criteria) -> NodeResult<DeviceHandle> {
        let (_reservation, in_use) = self.reserve(criteria)?;
        let unit = self.backend.provide_unit(criteria, &in_use).await?;

        let mut slots = self.slots();
        if slots.devices.values().any(|d| d.unit().serial == unit.serial) {
            debug!(node = %self.public_host(), udid = %unit.serial, "unit taken by a concurrent request");
            return Err(NodeError::NoMatchingUnit {
                node: self.public_host().to_string(),
                criteria: describe(criteria),
            });
        }
        let ports = self.ports.allocate_device_ports()?;
        let device = Device::new(unit, self.public_host(), ports, criteria.use_driver, &self.context);
        if let Err(e) = device.prepare_async() {
            self.ports.deallocate_device_ports(&ports);
            return Err(e.into());
        }
        slots.devices.insert(device.reference().clone(), device.clone());
        info!(
            node = %self.public_host(),
            device = %device.reference(),
            udid = %device.unit().serial,
            in_use = slots.devices.len(),
            capacity = self.capacity(),
            "device reserved"
        );
        Ok(device.handle())
    }

    async fn total_capacity(&self, criteria: &Criteria) -> u32 {
        if self.backend.supports(criteria) {
            self.capacity()
        } else {
            0
        }
    }

    async fn capacity_remaining(&self, criteria: &Criteria) -> f32 {
        let total = self.total_capacity(criteria).await;
        if total == 0 {
            return 0.0;
        }
        let used = self.slots().used();
        total.saturating_sub(used) as f32 / total as f32
    }

    async fn delete_release(&self, reference: &DeviceRef, reason: &str) -> bool {
        let Ok(device) = self.device(reference) else {
            warn!(node = %self.public_host(), device = %reference, "release of unknown device");
            return false;
        };
        device.release(reason).await;
        let removed = self.slots().devices.remove(reference).is_some();
        if removed {
            self.ports.deallocate_device_ports(device.ports());
        }
        true
    }

    async fn reset_async(&self, reference: &DeviceRef) -> NodeResult<()> {
        self.device(reference)?.reset_async()?;
        Ok(())
    }

    async fn renew_async(&self, reference: &DeviceRef) -> NodeResult<()> {
        self.device(reference)?.renew_async()?;
        Ok(())
    }

    async fn state(&self, reference: &DeviceRef) -> NodeResult<StatusSnapshot> {
        let device = self.device(reference)?;
        Ok(device.status_snapshot().await)
    }

    async fn list(&self) -> Vec<DeviceHandle> {
        self.slots().devices.values().map(|d| d.handle()).collect()
    }
}
