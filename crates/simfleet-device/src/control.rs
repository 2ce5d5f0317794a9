//! Backend seam: the unit-level operations a device needs from its node.

use async_trait::async_trait;

use simfleet_core::{AllocatedPorts, UnitInfo};
use simfleet_exec::ProcessSpec;

use crate::error::DeviceResult;

/// Power state reported by the backend tooling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitStatus {
    Booted,
    Shutdown,
    /// Booting or shutting down.
    Transitioning,
    Unknown,
}

/// What a backend can do with its units.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    /// Units can be booted and shut down (not true for physical devices).
    pub power_cycle: bool,
    /// Units can be snapshotted to a clean backup and restored.
    pub backups: bool,
    /// Starting the companion process is what boots the unit.
    pub boot_via_companion: bool,
}

#[async_trait]
pub trait UnitControl: Send + Sync {
    fn capabilities(&self) -> Capabilities;

    /// Kill processes left over from earlier sessions on this unit.
    async fn kill_stale_processes(&self, unit: &UnitInfo) -> DeviceResult<()>;

    async fn status(&self, unit: &UnitInfo) -> DeviceResult<UnitStatus>;

    async fn boot(&self, unit: &UnitInfo) -> DeviceResult<()>;

    async fn shutdown(&self, unit: &UnitInfo) -> DeviceResult<()>;

    async fn erase(&self, unit: &UnitInfo) -> DeviceResult<()>;

    async fn backup_exists(&self, unit: &UnitInfo) -> DeviceResult<bool>;

    async fn create_backup(&self, unit: &UnitInfo) -> DeviceResult<()>;

    async fn restore_backup(&self, unit: &UnitInfo) -> DeviceResult<()>;

    /// Whether the unit's diagnostic log has appeared after boot.
    async fn diagnostic_log_ready(&self, unit: &UnitInfo) -> DeviceResult<bool>;

    /// Helper process kept running while the unit is booted. Started after
    /// boot, or as the boot itself with `boot_via_companion`.
    fn companion(&self, unit: &UnitInfo, ports: &AllocatedPorts) -> Option<ProcessSpec>;

    /// Automation driver process, with its health probe.
    fn driver(&self, unit: &UnitInfo, ports: &AllocatedPorts) -> Option<ProcessSpec>;
}
