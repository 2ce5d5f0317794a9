//! simfleet-node: one worker machine and the devices it hosts.
//!
//! The orchestrator only ever talks to [`Node`]. Every backend is the
//! same [`PoolNode`] parameterised with a [`Backend`], picked from the
//! node's configured kind by the [`NodeFactory`].
//!
//! ```text
//! PoolNode
//!   ├── RemoteExecutor (local | ssh)
//!   ├── Backend ── SimulatorBackend | PhysicalBackend | EmulatorBackend
//!   │     └── UnitControl handed to every Device
//!   ├── devices: DeviceRef → Device (never more than capacity)
//!   ├── boot pool (Semaphore, concurrent_boots permits)
//!   └── shared PortAllocator
//! ```

pub mod backend;
pub mod backends;
pub mod error;
pub mod factory;
pub mod node;
pub mod pool;

pub use backend::Backend;
pub use error::{NodeError, NodeResult};
pub use factory::{DefaultNodeFactory, NodeFactory};
pub use node::Node;
pub use pool::PoolNode;
