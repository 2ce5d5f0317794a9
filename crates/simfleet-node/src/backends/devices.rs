//! Physical iOS devices attached over USB.
//!
//! Units are never power cycled or restored: a reset only kills
//! whatever was left running against them. Only serials on the node's
//! allowlist are ever handed out.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use simfleet_core::{AllocatedPorts, Criteria, KnownDevice, NodeConfig, NodeKind, UnitInfo};
use simfleet_device::{Capabilities, DeviceResult, DriverStatusCheck, UnitControl, UnitStatus};
use simfleet_exec::{Env, ProcessSpec, RemoteExecutor};

use super::{Tool, WDA_READY_FIELD, has_prefix};
use crate::backend::{Backend, describe, matches};
use crate::error::{NodeError, NodeResult};

const DRIVER_BUNDLE: &str = "com.facebook.WebDriverAgentRunner.xctrunner";
/// Port the driver listens on inside the device.
const DEVICE_DRIVER_PORT: u16 = 8100;

fn parse_udids(output: &str) -> Vec<String> {
    output
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(String::from)
        .collect()
}

pub(crate) struct PhysicalControl {
    tool: Tool,
    public_host: String,
}

impl PhysicalControl {
    async fn connected(&self) -> DeviceResult<Vec<String>> {
        let result = self.tool.run(&["idevice_id", "-l"]).await?;
        Ok(parse_udids(&result.stdout))
    }

    async fn info(&self, udid: &str, key: &str) -> Option<String> {
        match self.tool.try_run(&["ideviceinfo", "-u", udid, "-k", key]).await {
            Ok(result) if result.success => Some(result.stdout_trimmed().to_string()),
            Ok(result) => {
                debug!(%udid, key, stderr = %result.stderr.trim(), "ideviceinfo failed");
                None
            }
            Err(e) => {
                debug!(%udid, key, error = %e, "ideviceinfo failed");
                None
            }
        }
    }
}

#[async_trait]
impl UnitControl for PhysicalControl {
    fn capabilities(&self) -> Capabilities {
        Capabilities {
            power_cycle: false,
            backups: false,
            boot_via_companion: false,
        }
    }

    async fn kill_stale_processes(&self, unit: &UnitInfo) -> DeviceResult<()> {
        for pattern in stale_process_patterns(&unit.serial) {
            self.tool.try_run(&["pkill", "-f", "--", pattern.as_str()]).await?;
        }
        Ok(())
    }

    /// A connected device counts as booted.
    async fn status(&self, unit: &UnitInfo) -> DeviceResult<UnitStatus> {
        Ok(if self.connected().await?.contains(&unit.serial) {
            UnitStatus::Booted
        } else {
            UnitStatus::Unknown
        })
    }

    async fn boot(&self, _unit: &UnitInfo) -> DeviceResult<()> {
        Ok(())
    }

    async fn shutdown(&self, _unit: &UnitInfo) -> DeviceResult<()> {
        Ok(())
    }

    async fn erase(&self, _unit: &UnitInfo) -> DeviceResult<()> {
        Ok(())
    }

    async fn backup_exists(&self, _unit: &UnitInfo) -> DeviceResult<bool> {
        Ok(false)
    }

    async fn create_backup(&self, _unit: &UnitInfo) -> DeviceResult<()> {
        Ok(())
    }

    async fn restore_backup(&self, _unit: &UnitInfo) -> DeviceResult<()> {
        Ok(())
    }

    async fn diagnostic_log_ready(&self, _unit: &UnitInfo) -> DeviceResult<bool> {
        Ok(true)
    }

    /// USB port forward from the node to the driver inside the device.
    fn companion(&self, unit: &UnitInfo, ports: &AllocatedPorts) -> Option<ProcessSpec> {
        Some(ProcessSpec::new(vec![
            "iproxy".to_string(),
            format!("{}:{DEVICE_DRIVER_PORT}", ports.driver),
            "-u".to_string(),
            unit.serial.clone(),
        ]))
    }

    fn driver(&self, unit: &UnitInfo, ports: &AllocatedPorts) -> Option<ProcessSpec> {
        let env = Env::from([(
            "DEVICECTL_CHILD_USE_PORT".to_string(),
            DEVICE_DRIVER_PORT.to_string(),
        )]);
        let status = DriverStatusCheck::new(format!("{}:{}", self.public_host, ports.driver), "/status")
            .with_ready_field(WDA_READY_FIELD);
        Some(
            ProcessSpec::new(
                [
                    "xcrun",
                    "devicectl",
                    "device",
                    "process",
                    "launch",
                    "--console",
                    "--terminate-existing",
                    "--device",
                    unit.serial.as_str(),
                    DRIVER_BUNDLE,
                ]
                .map(String::from)
                .to_vec(),
            )
            .with_env(env)
            .with_probe(Arc::new(status)),
        )
    }
}

/// `pkill -f` patterns for the port forward and driver launched for `udid`.
fn stale_process_patterns(udid: &str) -> [String; 2] {
    [
        format!("iproxy .* -u {udid}$"),
        format!(
            "devicectl device process launch .* --device {udid} {}",
            DRIVER_BUNDLE.replace('.', "\\.")
        ),
    ]
}

pub struct PhysicalBackend {
    config: NodeConfig,
    control: Arc<PhysicalControl>,
}

impl PhysicalBackend {
    pub fn new(config: NodeConfig, executor: Arc<RemoteExecutor>) -> Self {
        let control = PhysicalControl {
            tool: Tool::new(executor),
            public_host: config.public_host().to_string(),
        };
        Self {
            config,
            control: Arc::new(control),
        }
    }
}

/// Allowlisted, connected, free serials in allowlist order.
fn candidates<'a>(
    allowlist: &'a [KnownDevice],
    connected: &[String],
    criteria: &Criteria,
    in_use: &HashSet<String>,
) -> Vec<&'a KnownDevice> {
    allowlist
        .iter()
        .filter(|known| {
            connected.contains(&known.serial)
                && !in_use.contains(&known.serial)
                && matches(criteria.serial.as_deref(), &known.serial)
        })
        .collect()
}

#[async_trait]
impl Backend for PhysicalBackend {
    fn kind(&self) -> NodeKind {
        NodeKind::Devices
    }

    fn supports(&self, criteria: &Criteria) -> bool {
        criteria.os.as_deref().is_none_or(|os| has_prefix(os, "iOS"))
    }

    fn unit_limit(&self) -> Option<u32> {
        Some(self.config.devices.len() as u32)
    }

    async fn prepare_node(&self) -> NodeResult<()> {
        let tool = &self.control.tool;
        tool.try_run(&["pkill", "-f", "iproxy"]).await?;
        let connected = self.control.connected().await?;
        for known in &self.config.devices {
            if !connected.contains(&known.serial) {
                warn!(node = %self.config.public_host(), udid = %known.serial, "allowlisted device not connected");
            }
        }
        Ok(())
    }

    async fn provide_unit(&self, criteria: &Criteria, in_use: &HashSet<String>) -> NodeResult<UnitInfo> {
        let connected = self.control.connected().await?;
        for known in candidates(&self.config.devices, &connected, criteria, in_use) {
            let model = match self.control.info(&known.serial, "ProductType").await {
                Some(model) => model,
                None => continue,
            };
            let os = self
                .control
                .info(&known.serial, "ProductVersion")
                .await
                .map(|v| format!("iOS {v}"))
                .unwrap_or_else(|| "iOS".to_string());
            let name = known.name.clone().unwrap_or_else(|| model.clone());
            let model_ok = matches(criteria.model.as_deref(), &model)
                || matches(criteria.model.as_deref(), &name);
            if model_ok && matches(criteria.os.as_deref(), &os) {
                return Ok(UnitInfo {
                    serial: known.serial.clone(),
                    name,
                    model,
                    os,
                });
            }
        }
        Err(NodeError::NoMatchingUnit {
            node: self.config.public_host().to_string(),
            criteria: describe(criteria),
        })
    }

    fn control(&self) -> Arc<dyn UnitControl> {
        self.control.clone()
    }
}
