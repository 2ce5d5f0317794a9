//! Cluster error types.

use std::fmt;

use thiserror::Error;

use simfleet_core::DeviceRef;
use simfleet_device::DeviceError;
use simfleet_node::NodeError;

/// Why one registered node could not take a placement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeFailure {
    pub node: String,
    pub error: Option<String>,
}

impl fmt::Display for NodeFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.error {
            Some(error) => write!(f, "{}: {error}", self.node),
            None => write!(f, "{}: not alive", self.node),
        }
    }
}

fn summarize(failures: &[NodeFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("no nodes registered")]
    NoNodesRegistered,

    #[error("no alive nodes ({})", summarize(.failures))]
    NoAliveNodes { failures: Vec<NodeFailure> },

    #[error("device not found: {0}")]
    DeviceNotFound(DeviceRef),

    #[error(transparent)]
    Node(#[from] NodeError),
}

impl ClusterError {
    /// Whether the same request may succeed if retried later.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::NoAliveNodes { .. } => true,
            Self::Node(NodeError::OverCapacity { .. } | NodeError::NoMatchingUnit { .. }) => true,
            Self::Node(NodeError::Device(DeviceError::Busy(_) | DeviceError::PortsExhausted { .. })) => true,
            Self::Node(NodeError::Exec(e)) => e.is_transport(),
            _ => false,
        }
    }
}

pub type ClusterResult<T> = Result<T, ClusterError>;
