//! iOS simulators driven through `xcrun simctl`.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, info, warn};

use simfleet_core::{AllocatedPorts, Criteria, NodeConfig, NodeKind, UnitInfo};
use simfleet_device::{
    Capabilities, DeviceError, DeviceResult, DriverStatusCheck, UnitControl, UnitStatus,
};
use simfleet_exec::{Env, ProcessSpec, RemoteExecutor, escape};

use super::{DirBackup, Tool, WDA_READY_FIELD, has_prefix};
use crate::backend::{Backend, describe, matches};
use crate::error::{NodeError, NodeResult};

const RUNTIME_PREFIX: &str = "com.apple.CoreSimulator.SimRuntime.";
const DEVICES_ROOT: &str = "\"$HOME\"/Library/Developer/CoreSimulator/Devices";
const DRIVER_BUNDLE: &str = "com.facebook.WebDriverAgentRunner.xctrunner";

#[derive(Debug, Deserialize)]
struct DeviceList {
    devices: BTreeMap<String, Vec<SimDevice>>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SimDevice {
    udid: String,
    name: String,
    state: String,
    #[serde(default = "available")]
    is_available: bool,
}

fn available() -> bool {
    true
}

/// `com.apple.CoreSimulator.SimRuntime.iOS-17-4` → `iOS 17.4`.
fn runtime_name(identifier: &str) -> String {
    let short = identifier.strip_prefix(RUNTIME_PREFIX).unwrap_or(identifier);
    match short.split_once('-') {
        Some((family, version)) => format!("{family} {}", version.replace('-', ".")),
        None => short.to_string(),
    }
}

/// Flatten `simctl list devices --json` into `(os, device)` pairs.
fn parse_devices(json: &str) -> NodeResult<Vec<(String, SimDevice)>> {
    let list: DeviceList = serde_json::from_str(json).map_err(|e| NodeError::Parse {
        tool: "simctl",
        message: e.to_string(),
    })?;
    Ok(list
        .devices
        .into_iter()
        .flat_map(|(runtime, devices)| {
            let os = runtime_name(&runtime);
            devices.into_iter().map(move |d| (os.clone(), d))
        })
        .collect())
}

fn unit_status(state: &str) -> UnitStatus {
    match state {
        "Booted" => UnitStatus::Booted,
        "Shutdown" => UnitStatus::Shutdown,
        "Booting" | "Shutting Down" | "Creating" => UnitStatus::Transitioning,
        _ => UnitStatus::Unknown,
    }
}

pub(crate) struct SimulatorControl {
    tool: Tool,
    public_host: String,
    backups: DirBackup,
}

impl SimulatorControl {
    async fn devices(&self) -> NodeResult<Vec<(String, SimDevice)>> {
        let result = self
            .tool
            .run(&["xcrun", "simctl", "list", "devices", "--json"])
            .await?;
        parse_devices(&result.stdout)
    }
}

#[async_trait]
impl UnitControl for SimulatorControl {
    fn capabilities(&self) -> Capabilities {
        Capabilities {
            power_cycle: true,
            backups: true,
            boot_via_companion: false,
        }
    }

    async fn kill_stale_processes(&self, unit: &UnitInfo) -> DeviceResult<()> {
        for pattern in stale_process_patterns(&unit.serial) {
            self.tool.try_run(&["pkill", "-f", "--", pattern.as_str()]).await?;
        }
        self.tool
            .try_run(&["xcrun", "simctl", "terminate", unit.serial.as_str(), DRIVER_BUNDLE])
            .await?;
        Ok(())
    }

    async fn status(&self, unit: &UnitInfo) -> DeviceResult<UnitStatus> {
        let devices = self
            .devices()
            .await
            .map_err(|e| DeviceError::Creation(e.to_string()))?;
        Ok(devices
            .iter()
            .find(|(_, d)| d.udid == unit.serial)
            .map_or(UnitStatus::Unknown, |(_, d)| unit_status(&d.state)))
    }

    async fn boot(&self, unit: &UnitInfo) -> DeviceResult<()> {
        let result = self
            .tool
            .try_run(&["xcrun", "simctl", "boot", unit.serial.as_str()])
            .await?;
        if !result.success {
            // Already booted is reported as a failure; the status poll decides.
            warn!(udid = %unit.serial, stderr = %result.stderr.trim(), "simctl boot failed");
        }
        Ok(())
    }

    async fn shutdown(&self, unit: &UnitInfo) -> DeviceResult<()> {
        self.tool
            .try_run(&["xcrun", "simctl", "shutdown", unit.serial.as_str()])
            .await?;
        Ok(())
    }

    async fn erase(&self, unit: &UnitInfo) -> DeviceResult<()> {
        self.tool
            .run(&["xcrun", "simctl", "erase", unit.serial.as_str()])
            .await?;
        Ok(())
    }

    async fn backup_exists(&self, unit: &UnitInfo) -> DeviceResult<bool> {
        Ok(self.backups.exists(&self.tool, &unit.serial).await?)
    }

    async fn create_backup(&self, unit: &UnitInfo) -> DeviceResult<()> {
        info!(udid = %unit.serial, "backing up simulator");
        Ok(self.backups.create(&self.tool, &unit.serial).await?)
    }

    async fn restore_backup(&self, unit: &UnitInfo) -> DeviceResult<()> {
        info!(udid = %unit.serial, "restoring simulator from backup");
        Ok(self.backups.restore(&self.tool, &unit.serial).await?)
    }

    async fn diagnostic_log_ready(&self, unit: &UnitInfo) -> DeviceResult<bool> {
        let script = format!(
            "test -f \"$HOME\"/Library/Logs/CoreSimulator/{}/system.log",
            escape(&unit.serial)
        );
        Ok(self.tool.script(&script, true).await?.success)
    }

    fn companion(&self, unit: &UnitInfo, _ports: &AllocatedPorts) -> Option<ProcessSpec> {
        Some(ProcessSpec::new(
            ["xcrun", "simctl", "spawn", unit.serial.as_str(), "log", "stream", "--level", "error"]
                .map(String::from)
                .to_vec(),
        ))
    }

    fn driver(&self, unit: &UnitInfo, ports: &AllocatedPorts) -> Option<ProcessSpec> {
        let env = Env::from([("SIMCTL_CHILD_USE_PORT".to_string(), ports.driver.to_string())]);
        let status = DriverStatusCheck::new(format!("{}:{}", self.public_host, ports.driver), "/status")
            .with_ready_field(WDA_READY_FIELD);
        Some(
            ProcessSpec::new(
                [
                    "xcrun",
                    "simctl",
                    "launch",
                    "--console-pty",
                    "--terminate-running-process",
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

/// `pkill -f` patterns for the companion and driver launched for `udid`.
fn stale_process_patterns(udid: &str) -> [String; 2] {
    [
        format!("simctl spawn {udid} log stream"),
        format!("simctl launch .* {udid} {}", DRIVER_BUNDLE.replace('.', "\\.")),
    ]
}

/// Every available simulator on the node is a candidate unit.
pub struct SimulatorBackend {
    config: NodeConfig,
    control: Arc<SimulatorControl>,
}

impl SimulatorBackend {
    pub fn new(config: NodeConfig, executor: Arc<RemoteExecutor>) -> Self {
        let control = SimulatorControl {
            tool: Tool::new(executor),
            public_host: config.public_host().to_string(),
            backups: DirBackup::new(DEVICES_ROOT, "", config.flags.backup_dir.clone()),
        };
        Self {
            config,
            control: Arc::new(control),
        }
    }
}

fn pick_unit(
    candidates: Vec<(String, SimDevice)>,
    criteria: &Criteria,
    in_use: &HashSet<String>,
) -> Option<UnitInfo> {
    candidates
        .into_iter()
        .filter(|(os, d)| {
            d.is_available
                && !in_use.contains(&d.udid)
                && matches(criteria.model.as_deref(), &d.name)
                && matches(criteria.os.as_deref(), os)
                && matches(criteria.serial.as_deref(), &d.udid)
        })
        .map(|(os, d)| UnitInfo {
            serial: d.udid,
            model: d.name.clone(),
            name: d.name,
            os,
        })
        .next()
}

#[async_trait]
impl Backend for SimulatorBackend {
    fn kind(&self) -> NodeKind {
        NodeKind::Simulators
    }

    fn supports(&self, criteria: &Criteria) -> bool {
        criteria.os.as_deref().is_none_or(|os| has_prefix(os, "iOS"))
    }

    async fn prepare_node(&self) -> NodeResult<()> {
        let tool = &self.control.tool;
        tool.try_run(&["pkill", "-f", DRIVER_BUNDLE]).await?;
        tool.script(
            &format!("mkdir -p {}", escape(&self.config.flags.backup_dir)),
            false,
        )
        .await?;
        let devices = self.control.devices().await?;
        debug!(node = %self.config.public_host(), simulators = devices.len(), "simulators listed");
        Ok(())
    }

    async fn provide_unit(&self, criteria: &Criteria, in_use: &HashSet<String>) -> NodeResult<UnitInfo> {
        let candidates = self.control.devices().await?;
        pick_unit(candidates, criteria, in_use).ok_or_else(|| NodeError::NoMatchingUnit {
            node: self.config.public_host().to_string(),
            criteria: describe(criteria),
        })
    }

    fn control(&self) -> Arc<dyn UnitControl> {
        self.control.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LISTING: &str = r#"{
      "devices": {
        "com.apple.CoreSimulator.SimRuntime.iOS-17-4": [
          {"udid": "AAA", "name": "iPhone 15", "state": "Booted", "isAvailable": true},
          {"udid": "BBB", "name": "iPhone 15", "state": "Shutdown", "isAvailable": true},
          {"udid": "CCC", "name": "iPad Air", "state": "Shutdown", "isAvailable": false}
        ],
        "com.apple.CoreSimulator.SimRuntime.iOS-16-0": [
          {"udid": "DDD", "name": "iPhone 14", "state": "Shutting Down", "isAvailable": true}
        ]
      }
    }"#;

    #[test]
    fn runtime_identifiers_become_os_names() {
        assert_eq!(runtime_name("com.apple.CoreSimulator.SimRuntime.iOS-17-4"), "iOS 17.4");
        assert_eq!(runtime_name("com.apple.CoreSimulator.SimRuntime.watchOS-10-0"), "watchOS 10.0");
        assert_eq!(runtime_name("custom"), "custom");
    }

    #[test]
    fn listing_is_flattened_with_os() {
        let devices = parse_devices(LISTING).unwrap();
        assert_eq!(devices.len(), 4);
        let (os, ddd) = devices.iter().find(|(_, d)| d.udid == "DDD").unwrap();
        assert_eq!(os, "iOS 16.0");
        assert_eq!(unit_status(&ddd.state), UnitStatus::Transitioning);
    }

    #[test]
    fn garbage_listing_is_a_parse_error() {
        assert!(matches!(
            parse_devices("not json").unwrap_err(),
            NodeError::Parse { tool: "simctl", .. }
        ));
    }

    #[test]
    fn picks_free_matching_unit() {
        let in_use = HashSet::from(["AAA".to_string()]);
        let criteria = Criteria::default().with_model("iphone 15").with_os("iOS 17.4");
        let unit = pick_unit(parse_devices(LISTING).unwrap(), &criteria, &in_use).unwrap();
        assert_eq!(unit.serial, "BBB");
        assert_eq!(unit.os, "iOS 17.4");

        let ipad = Criteria::default().with_model("iPad Air");
        assert!(pick_unit(parse_devices(LISTING).unwrap(), &ipad, &HashSet::new()).is_none());

        let pinned = Criteria::default().with_serial("DDD");
        let unit = pick_unit(parse_devices(LISTING).unwrap(), &pinned, &HashSet::new()).unwrap();
        assert_eq!(unit.model, "iPhone 14");
    }

    #[test]
    fn helper_processes_target_the_unit() {
        let config = NodeConfig::new("localhost").with_public_host("mac-01");
        let backend = SimulatorBackend::new(config, Arc::new(RemoteExecutor::local()));
        let unit = UnitInfo {
            serial: "BBB".into(),
            name: "iPhone 15".into(),
            model: "iPhone 15".into(),
            os: "iOS 17.4".into(),
        };
        let ports = AllocatedPorts {
            driver: 8100,
            companion: 8101,
            video: 8102,
            instrumentation: 8103,
        };
        let control = backend.control();
        let driver = control.driver(&unit, &ports).unwrap();
        assert!(driver.command.contains(&"BBB".to_string()));
        assert_eq!(driver.env.get("SIMCTL_CHILD_USE_PORT").map(String::as_str), Some("8100"));
        assert!(driver.probe.is_some());
        let companion = control.companion(&unit, &ports).unwrap();
        assert_eq!(&companion.command[..4], ["xcrun", "simctl", "spawn", "BBB"]);
        assert!(control.capabilities().backups);
    }

    #[test]
    fn stale_patterns_match_only_this_units_helpers() {
        let backend = SimulatorBackend::new(NodeConfig::new("localhost"), Arc::new(RemoteExecutor::local()));
        let control = backend.control();
        let unit = UnitInfo {
            serial: "BBB-1".into(),
            name: "iPhone 15".into(),
            model: "iPhone 15".into(),
            os: "iOS 17.4".into(),
        };
        let ports = AllocatedPorts {
            driver: 8100,
            companion: 8101,
            video: 8102,
            instrumentation: 8103,
        };
        let companion = control.companion(&unit, &ports).unwrap().command.join(" ");
        let driver = control.driver(&unit, &ports).unwrap().command.join(" ");

        let patterns: Vec<regex::Regex> = stale_process_patterns("BBB-1")
            .iter()
            .map(|p| regex::Regex::new(p).unwrap())
            .collect();
        let matched = |line: &str| patterns.iter().any(|p| p.is_match(line));
        assert!(matched(&companion));
        assert!(matched(&driver));

        let other = driver.replace("BBB-1", "CCC-2");
        assert!(!matched(&other));
        assert!(!matched("tail -f /var/log/simfleet/BBB-1.log"));
        assert!(!matched("/Applications/Simulator.app/Contents/MacOS/Simulator -CurrentDeviceUDID BBB-1"));
    }

    #[test]
    fn only_ios_is_supported() {
        let backend = SimulatorBackend::new(NodeConfig::new("localhost"), Arc::new(RemoteExecutor::local()));
        assert!(backend.supports(&Criteria::default()));
        assert!(backend.supports(&Criteria::default().with_os("iOS 17.4")));
        assert!(!backend.supports(&Criteria::default().with_os("Android 14")));
    }
}
