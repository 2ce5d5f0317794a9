//! Node error types.

use thiserror::Error;

use simfleet_core::DeviceRef;
use simfleet_device::DeviceError;
use simfleet_exec::ExecError;

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("node {node} is at capacity ({capacity} devices)")]
    OverCapacity { node: String, capacity: u32 },

    #[error("device not found: {0}")]
    DeviceNotFound(DeviceRef),

    #[error("no free unit on {node} matches {criteria}")]
    NoMatchingUnit { node: String, criteria: String },

    #[error("node lifecycle error: {0}")]
    Lifecycle(String),

    #[error("unexpected output from {tool}: {message}")]
    Parse { tool: &'static str, message: String },

    #[error(transparent)]
    Device(#[from] DeviceError),

    #[error(transparent)]
    Exec(#[from] ExecError),
}

pub type NodeResult<T> = Result<T, NodeError>;
