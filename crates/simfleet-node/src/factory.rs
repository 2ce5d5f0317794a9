//! Builds a [`Node`] from its configuration.

use std::sync::Arc;

use simfleet_core::{NodeConfig, NodeKind};
use simfleet_device::{DeviceSettings, PortAllocator};
use simfleet_exec::RemoteExecutor;

use crate::backend::Backend;
use crate::backends::{EmulatorBackend, PhysicalBackend, SimulatorBackend};
use crate::error::{NodeError, NodeResult};
use crate::node::Node;
use crate::pool::PoolNode;

pub trait NodeFactory: Send + Sync {
    fn build(&self, config: &NodeConfig) -> NodeResult<Arc<dyn Node>>;
}

/// Picks the backend from the configured kind. All nodes draw device
/// ports from the same allocator.
pub struct DefaultNodeFactory {
    ports: Arc<PortAllocator>,
    settings: DeviceSettings,
}

impl DefaultNodeFactory {
    pub fn new(ports: Arc<PortAllocator>) -> Self {
        Self {
            ports,
            settings: DeviceSettings::default(),
        }
    }

    pub fn with_settings(mut self, settings: DeviceSettings) -> Self {
        self.settings = settings;
        self
    }
}

impl NodeFactory for DefaultNodeFactory {
    fn build(&self, config: &NodeConfig) -> NodeResult<Arc<dyn Node>> {
        if config.capacity == 0 {
            return Err(NodeError::Lifecycle(format!(
                "node {} has zero capacity",
                config.public_host()
            )));
        }
        let executor = Arc::new(RemoteExecutor::for_node(config));
        let backend: Arc<dyn Backend> = match config.kind {
            NodeKind::Simulators => Arc::new(SimulatorBackend::new(config.clone(), executor.clone())),
            NodeKind::Devices => Arc::new(PhysicalBackend::new(config.clone(), executor.clone())),
            NodeKind::Emulators => Arc::new(EmulatorBackend::new(config.clone(), executor.clone())),
        };
        Ok(Arc::new(PoolNode::new(
            config.clone(),
            executor,
            backend,
            self.ports.clone(),
            self.settings.clone(),
        )))
    }
}

#[cfg(test)]
mod tests {
    use simfleet_core::Criteria;

    use super::*;

    #[tokio::test]
    async fn builds_node_of_configured_kind() {
        let factory = DefaultNodeFactory::new(Arc::new(PortAllocator::default()));
        let config = NodeConfig::new("localhost")
            .with_public_host("emu-01")
            .with_kind(NodeKind::Emulators);
        let node = factory.build(&config).unwrap();
        assert_eq!(node.kind(), NodeKind::Emulators);
        assert_eq!(node.public_host(), "emu-01");
        assert_eq!(node.total_capacity(&Criteria::default().with_os("Android 14")).await, 6);
        assert_eq!(node.total_capacity(&Criteria::default().with_os("iOS 17")).await, 0);
    }

    #[test]
    fn zero_capacity_is_rejected() {
        let factory = DefaultNodeFactory::new(Arc::new(PortAllocator::default()));
        let config = NodeConfig::new("localhost").with_capacity(0);
        assert!(matches!(factory.build(&config), Err(NodeError::Lifecycle(_))));
    }
}
