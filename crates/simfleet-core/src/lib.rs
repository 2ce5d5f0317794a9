//! simfleet-core: shared types for the simfleet device orchestrator.
//!
//! Everything the other crates agree on lives here: the fleet
//! configuration file, device references, lifecycle states, placement
//! criteria and the snapshots handed back to callers.
//!
//! # Layout
//!
//! ```text
//! FleetConfig
//!   ├── timeouts (named overrides, "device" = lease timeout)
//!   ├── ports (PortAllocator range)
//!   ├── orchestrator (loop intervals, health-check attempts)
//!   └── nodes: Vec<NodeConfig>
//!         ├── kind: simulators | devices | emulators
//!         ├── devices (known-device allowlist)
//!         └── flags, environment
//! ```

pub mod config;
pub mod types;

pub use config::{
    ConfigError, ConfigResult, FleetConfig, KnownDevice, NodeConfig, NodeFlags, NodeKind,
    OrchestratorConfig, PortRange,
};
pub use types::*;
