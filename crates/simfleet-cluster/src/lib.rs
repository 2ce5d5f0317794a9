//! simfleet-cluster: orchestration across nodes.
//!
//! # Architecture
//!
//! ```text
//! NodeRegistrar
//!   ├── NodeWrapper per configured node (built once)
//!   ├── auto-registration loop: start unregistered nodes, add on success
//!   └── graceful restart: disable → release leases → stop → [reboot] → start → enable
//!
//! NodeRegistry
//!   ├── registered NodeWrappers (public host → wrapper)
//!   │     └── health loop: N missed probes → remove_if_present
//!   ├── placement: alive node with the most capacity remaining
//!   └── ActiveDevices (lease table)
//!         └── LeaseReclaimer: releases expired leases
//! ```

pub mod error;
pub mod leases;
pub mod reclaim;
pub mod registrar;
pub mod registry;
pub mod wrapper;

pub use error::{ClusterError, ClusterResult, NodeFailure};
pub use leases::ActiveDevices;
pub use reclaim::LeaseReclaimer;
pub use registrar::{NodeRegistrar, RestartOptions};
pub use registry::NodeRegistry;
pub use wrapper::NodeWrapper;
