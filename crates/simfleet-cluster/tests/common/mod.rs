#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use simfleet_cluster::{ActiveDevices, NodeRegistry, NodeWrapper};
use simfleet_core::{
    AllocatedPorts, Criteria, DeviceHandle, DeviceRef, DeviceState, NodeKind, StatusSnapshot,
    UnitInfo,
};
use simfleet_node::{Node, NodeError, NodeResult};

/// In-memory node with switchable reachability and call counters.
pub struct FakeNode {
    host: String,
    capacity: u32,
    /// Overrides the computed remaining share when set.
    remaining: Mutex<Option<f32>>,
    pub reachable: AtomicBool,
    pub fail_prepare: AtomicBool,
    /// `delete_release` never returns.
    pub hang_on_release: AtomicBool,
    pub probes: AtomicU32,
    pub prepares: AtomicU32,
    pub disposals: AtomicU32,
    pub reboots: AtomicU32,
    devices: Mutex<HashMap<DeviceRef, DeviceHandle>>,
    pub released: Mutex<Vec<DeviceRef>>,
    next_unit: AtomicU32,
}

impl FakeNode {
    pub fn new(host: &str, capacity: u32) -> Arc<Self> {
        Arc::new(Self {
            host: host.to_string(),
            capacity,
            remaining: Mutex::new(None),
            reachable: AtomicBool::new(true),
            fail_prepare: AtomicBool::new(false),
            hang_on_release: AtomicBool::new(false),
            probes: AtomicU32::new(0),
            prepares: AtomicU32::new(0),
            disposals: AtomicU32::new(0),
            reboots: AtomicU32::new(0),
            devices: Mutex::new(HashMap::new()),
            released: Mutex::new(Vec::new()),
            next_unit: AtomicU32::new(0),
        })
    }

    pub fn with_remaining(self: Arc<Self>, remaining: f32) -> Arc<Self> {
        *self.remaining.lock().unwrap() = Some(remaining);
        self
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    pub fn device_count(&self) -> usize {
        self.devices.lock().unwrap().len()
    }

    pub fn released(&self) -> Vec<DeviceRef> {
        self.released.lock().unwrap().clone()
    }
}

#[async_trait]
impl Node for FakeNode {
    fn public_host(&self) -> &str {
        &self.host
    }

    fn kind(&self) -> NodeKind {
        NodeKind::Simulators
    }

    async fn is_reachable(&self) -> bool {
        self.probes.fetch_add(1, Ordering::SeqCst);
        self.reachable.load(Ordering::SeqCst)
    }

    async fn prepare(&self) -> NodeResult<()> {
        self.prepares.fetch_add(1, Ordering::SeqCst);
        if self.fail_prepare.load(Ordering::SeqCst) {
            return Err(NodeError::Lifecycle("tooling missing".into()));
        }
        Ok(())
    }

    async fn dispose(&self) {
        tokio::time::sleep(Duration::from_millis(10)).await;
        self.disposals.fetch_add(1, Ordering::SeqCst);
        self.devices.lock().unwrap().clear();
    }

    async fn reboot(&self) -> NodeResult<()> {
        self.reboots.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn create_device_async(&self, _criteria: &Criteria) -> NodeResult<DeviceHandle> {
        let mut devices = self.devices.lock().unwrap();
        if devices.len() as u32 >= self.capacity {
            return Err(NodeError::OverCapacity {
                node: self.host.clone(),
                capacity: self.capacity,
            });
        }
        let n = self.next_unit.fetch_add(1, Ordering::SeqCst);
        let serial = format!("UNIT-{n}");
        let handle = DeviceHandle {
            reference: DeviceRef::derive(&serial, &self.host),
            unit: UnitInfo {
                serial: serial.clone(),
                name: "iPhone 15".into(),
                model: "iPhone 15".into(),
                os: "iOS 17.4".into(),
            },
            node: self.host.clone(),
            ports: AllocatedPorts {
                driver: 42000,
                companion: 42001,
                video: 42002,
                instrumentation: 42003,
            },
            state: DeviceState::Creating,
        };
        devices.insert(handle.reference.clone(), handle.clone());
        Ok(handle)
    }

    async fn total_capacity(&self, _criteria: &Criteria) -> u32 {
        self.capacity
    }

    async fn capacity_remaining(&self, _criteria: &Criteria) -> f32 {
        if let Some(remaining) = *self.remaining.lock().unwrap() {
            return remaining;
        }
        let used = self.devices.lock().unwrap().len() as u32;
        self.capacity.saturating_sub(used) as f32 / self.capacity.max(1) as f32
    }

    async fn delete_release(&self, reference: &DeviceRef, _reason: &str) -> bool {
        if self.hang_on_release.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        self.released.lock().unwrap().push(reference.clone());
        self.devices.lock().unwrap().remove(reference).is_some()
    }

    async fn reset_async(&self, reference: &DeviceRef) -> NodeResult<()> {
        if self.devices.lock().unwrap().contains_key(reference) {
            Ok(())
        } else {
            Err(NodeError::DeviceNotFound(reference.clone()))
        }
    }

    async fn renew_async(&self, reference: &DeviceRef) -> NodeResult<()> {
        self.reset_async(reference).await
    }

    async fn state(&self, reference: &DeviceRef) -> NodeResult<StatusSnapshot> {
        let devices = self.devices.lock().unwrap();
        let handle = devices
            .get(reference)
            .ok_or_else(|| NodeError::DeviceNotFound(reference.clone()))?;
        Ok(StatusSnapshot {
            reference: handle.reference.clone(),
            state: DeviceState::Created,
            ready: true,
            driver_healthy: true,
            companion_healthy: true,
            last_error: None,
        })
    }

    async fn list(&self) -> Vec<DeviceHandle> {
        self.devices.lock().unwrap().values().cloned().collect()
    }
}

pub fn registry(device_timeout: Option<Duration>) -> Arc<NodeRegistry> {
    Arc::new(NodeRegistry::new(Arc::new(ActiveDevices::new())).with_device_timeout(device_timeout))
}

/// Start `node`, register it and return its wrapper.
pub async fn register_started(registry: &Arc<NodeRegistry>, node: Arc<FakeNode>) -> Arc<NodeWrapper> {
    let wrapper = Arc::new(NodeWrapper::new(node));
    assert!(wrapper.start().await);
    assert!(registry.add(wrapper.clone()).await);
    wrapper
}
