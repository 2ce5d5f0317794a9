//! The capability contract between the orchestrator and a worker machine.

use async_trait::async_trait;

use simfleet_core::{Criteria, DeviceHandle, DeviceRef, NodeKind, StatusSnapshot};

use crate::error::NodeResult;

#[async_trait]
pub trait Node: Send + Sync {
    /// Identity of the node.
    fn public_host(&self) -> &str;

    fn kind(&self) -> NodeKind;

    async fn is_reachable(&self) -> bool;

    /// One-time preparation before the node hosts devices.
    async fn prepare(&self) -> NodeResult<()>;

    /// Release every device. Errors are logged, never raised.
    async fn dispose(&self);

    async fn reboot(&self) -> NodeResult<()>;

    /// Reserve a unit and schedule its preparation. Returns before the
    /// device is ready; poll [`Node::state`] for readiness.
    async fn create_device_async(&self, criteria: &Criteria) -> NodeResult<DeviceHandle>;

    /// Devices matching `criteria` this node hosts at most.
    async fn total_capacity(&self, criteria: &Criteria) -> u32;

    /// Free share of `total_capacity`, in `0.0..=1.0`.
    async fn capacity_remaining(&self, criteria: &Criteria) -> f32;

    /// Release and forget a device. `false` if the node does not know it.
    async fn delete_release(&self, reference: &DeviceRef, reason: &str) -> bool;

    async fn reset_async(&self, reference: &DeviceRef) -> NodeResult<()>;

    async fn renew_async(&self, reference: &DeviceRef) -> NodeResult<()>;

    async fn state(&self, reference: &DeviceRef) -> NodeResult<StatusSnapshot>;

    async fn list(&self) -> Vec<DeviceHandle>;
}
