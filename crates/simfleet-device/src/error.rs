//! Device error types.

use thiserror::Error;

use simfleet_core::{DeviceRef, DeviceState};
use simfleet_exec::ExecError;

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("port pool exhausted: requested {requested}, {available} available")]
    PortsExhausted { requested: usize, available: usize },

    #[error("device {reference} cannot {operation} while {state}")]
    InvalidTransition {
        reference: DeviceRef,
        operation: &'static str,
        state: DeviceState,
    },

    #[error("device {0} already has an operation in flight")]
    Busy(DeviceRef),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("device creation failed: {0}")]
    Creation(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error(transparent)]
    Exec(#[from] ExecError),
}

pub type DeviceResult<T> = Result<T, DeviceError>;
