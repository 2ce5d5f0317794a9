//! Execution error types.

use std::time::Duration;

use thiserror::Error;

use crate::result::CommandResult;

/// Errors raised by the process substrate.
#[derive(Debug, Error)]
pub enum ExecError {
    /// The SSH transport could not reach the host.
    #[error("transport failure reaching {host}: {message}")]
    Transport { host: String, message: String },

    /// The command ran and exited non-zero.
    #[error("command `{command}` exited with {exit_code}: {stderr}")]
    CommandFailure {
        command: String,
        exit_code: i32,
        stderr: String,
    },

    /// The command outlived its timeout. Output read so far is kept.
    #[error("command `{command}` timed out after {timeout:?}")]
    Timeout {
        command: String,
        timeout: Duration,
        result: Box<CommandResult>,
    },

    #[error("failed to spawn `{command}`: {source}")]
    Spawn {
        command: String,
        source: std::io::Error,
    },

    #[error("empty command")]
    EmptyCommand,

    #[error("process {0} is still running, kill it first")]
    AlreadyRunning(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ExecError {
    /// Whether a retry could reasonably succeed.
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport { .. })
    }
}

pub type ExecResult<T> = Result<T, ExecError>;
