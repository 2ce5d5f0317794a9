//! simfleet-device: lifecycle of a single device.
//!
//! # Architecture
//!
//! ```text
//! Device (one per unit handed out by a node)
//!   ├── critical lock: prepare / reset / renew / release never overlap
//!   ├── in-flight task + CancellationToken
//!   ├── UnitControl (backend: boot, shutdown, erase, backups)
//!   ├── ProcessSupervisor × 2 (companion helper, automation driver)
//!   ├── boot pool (node-wide Semaphore)
//!   └── health loop → HealthTracker per probe → Failed past threshold
//!
//! PortAllocator: node-independent pool of TCP ports
//! ```

pub mod control;
pub mod device;
pub mod error;
pub mod health;
pub mod poll;
pub mod ports;

pub use control::{Capabilities, UnitControl, UnitStatus};
pub use device::{Device, DeviceContext, DeviceSettings};
pub use error::{DeviceError, DeviceResult};
pub use health::{DriverStatusCheck, HealthStatus, HealthTracker, ProbeResult};
pub use ports::PortAllocator;
