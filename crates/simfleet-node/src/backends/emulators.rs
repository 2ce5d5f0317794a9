//! Android emulators: one AVD per unit, booted by running the emulator
//! process itself.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use simfleet_core::{AllocatedPorts, Criteria, NodeConfig, NodeKind, UnitInfo};
use simfleet_device::{Capabilities, DeviceResult, DriverStatusCheck, UnitControl, UnitStatus};
use simfleet_exec::{ProcessSpec, RemoteExecutor, escape};

use super::{DirBackup, Tool, has_prefix};
use crate::backend::{Backend, describe, matches};
use crate::error::{NodeError, NodeResult};

const AVD_ROOT: &str = "\"$HOME\"/.android/avd";
/// Port the instrumentation server listens on inside the emulator.
const DEVICE_DRIVER_PORT: u16 = 6790;
const INSTRUMENTATION: &str =
    "io.appium.uiautomator2.server.test/androidx.test.runner.AndroidJUnitRunner";

/// Serials of running emulators from `adb devices`.
fn parse_adb_devices(output: &str) -> Vec<String> {
    output
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let serial = fields.next()?;
            (serial.starts_with("emulator-") && fields.next().is_some()).then(|| serial.to_string())
        })
        .collect()
}

/// API level from an AVD `config.ini`, e.g. `system-images/android-34/...`.
fn parse_api_level(config_ini: &str) -> Option<String> {
    config_ini.lines().find_map(|line| {
        let (key, value) = line.split_once('=')?;
        if key.trim() != "image.sysdir.1" {
            return None;
        }
        value
            .trim()
            .split('/')
            .find_map(|part| part.strip_prefix("android-"))
            .map(str::to_string)
    })
}

/// Shell snippet resolving the adb serial of `avd` into `$serial`.
fn resolve_serial_script(avd: &str) -> String {
    format!(
        "serial=''; for s in $(adb devices | awk '/^emulator-/ {{print $1}}'); do \
         if [ \"$(adb -s \"$s\" emu avd name 2>/dev/null | head -n 1 | tr -d '\\r')\" = {avd} ]; \
         then serial=\"$s\"; fi; done",
        avd = escape(avd),
    )
}

pub(crate) struct EmulatorControl {
    tool: Tool,
    public_host: String,
    headless: bool,
    backups: DirBackup,
}

impl EmulatorControl {
    async fn serial_of(&self, avd: &str) -> DeviceResult<Option<String>> {
        let listing = self.tool.try_run(&["adb", "devices"]).await?;
        for serial in parse_adb_devices(&listing.stdout) {
            let name = self
                .tool
                .try_run(&["adb", "-s", serial.as_str(), "emu", "avd", "name"])
                .await?;
            if name.lines().next().map(str::trim) == Some(avd) {
                return Ok(Some(serial));
            }
        }
        Ok(None)
    }
}

#[async_trait]
impl UnitControl for EmulatorControl {
    fn capabilities(&self) -> Capabilities {
        Capabilities {
            power_cycle: true,
            backups: true,
            boot_via_companion: true,
        }
    }

    async fn kill_stale_processes(&self, unit: &UnitInfo) -> DeviceResult<()> {
        let pattern = format!("-avd {}", unit.serial);
        self.tool.try_run(&["pkill", "-f", "--", pattern.as_str()]).await?;
        Ok(())
    }

    async fn status(&self, unit: &UnitInfo) -> DeviceResult<UnitStatus> {
        let Some(serial) = self.serial_of(&unit.serial).await? else {
            return Ok(UnitStatus::Shutdown);
        };
        let result = self
            .tool
            .try_run(&["adb", "-s", serial.as_str(), "shell", "getprop", "sys.boot_completed"])
            .await?;
        Ok(if result.stdout_trimmed() == "1" {
            UnitStatus::Booted
        } else {
            UnitStatus::Transitioning
        })
    }

    /// Booting happens by starting the companion.
    async fn boot(&self, _unit: &UnitInfo) -> DeviceResult<()> {
        Ok(())
    }

    async fn shutdown(&self, unit: &UnitInfo) -> DeviceResult<()> {
        if let Some(serial) = self.serial_of(&unit.serial).await? {
            debug!(avd = %unit.serial, %serial, "killing emulator");
            self.tool.try_run(&["adb", "-s", serial.as_str(), "emu", "kill"]).await?;
        }
        Ok(())
    }

    async fn erase(&self, unit: &UnitInfo) -> DeviceResult<()> {
        let script = format!(
            "rm -rf {root}/{avd}/userdata-qemu.img {root}/{avd}/snapshots",
            root = AVD_ROOT,
            avd = escape(&format!("{}.avd", unit.serial)),
        );
        self.tool.script(&script, false).await?;
        Ok(())
    }

    async fn backup_exists(&self, unit: &UnitInfo) -> DeviceResult<bool> {
        Ok(self.backups.exists(&self.tool, &unit.serial).await?)
    }

    async fn create_backup(&self, unit: &UnitInfo) -> DeviceResult<()> {
        info!(avd = %unit.serial, "backing up emulator");
        Ok(self.backups.create(&self.tool, &unit.serial).await?)
    }

    async fn restore_backup(&self, unit: &UnitInfo) -> DeviceResult<()> {
        info!(avd = %unit.serial, "restoring emulator from backup");
        Ok(self.backups.restore(&self.tool, &unit.serial).await?)
    }

    async fn diagnostic_log_ready(&self, _unit: &UnitInfo) -> DeviceResult<bool> {
        Ok(true)
    }

    /// The emulator process; running it is what boots the unit.
    fn companion(&self, unit: &UnitInfo, _ports: &AllocatedPorts) -> Option<ProcessSpec> {
        let mut command: Vec<String> = ["emulator", "-avd", unit.serial.as_str(), "-no-snapshot-save", "-no-boot-anim"]
            .map(String::from)
            .to_vec();
        if self.headless {
            command.push("-no-window".to_string());
        }
        Some(ProcessSpec::new(command))
    }

    fn driver(&self, unit: &UnitInfo, ports: &AllocatedPorts) -> Option<ProcessSpec> {
        let script = format!(
            "{resolve}; [ -n \"$serial\" ] || exit 1; \
             adb -s \"$serial\" forward tcp:{local} tcp:{DEVICE_DRIVER_PORT} && \
             exec adb -s \"$serial\" shell am instrument -w {INSTRUMENTATION}",
            resolve = resolve_serial_script(&unit.serial),
            local = ports.driver,
        );
        let status = DriverStatusCheck::new(format!("{}:{}", self.public_host, ports.driver), "/wd/hub/status");
        Some(
            ProcessSpec::new(vec!["/bin/bash".to_string(), "-c".to_string(), script])
                .with_probe(Arc::new(status)),
        )
    }
}

pub struct EmulatorBackend {
    config: NodeConfig,
    control: Arc<EmulatorControl>,
}

impl EmulatorBackend {
    pub fn new(config: NodeConfig, executor: Arc<RemoteExecutor>) -> Self {
        let control = EmulatorControl {
            tool: Tool::new(executor),
            public_host: config.public_host().to_string(),
            headless: config.flags.headless,
            backups: DirBackup::new(AVD_ROOT, ".avd", config.flags.backup_dir.clone()),
        };
        Self {
            config,
            control: Arc::new(control),
        }
    }

    async fn os_of(&self, avd: &str) -> String {
        let script = format!("cat {AVD_ROOT}/{}/config.ini", escape(&format!("{avd}.avd")));
        match self.control.tool.script(&script, true).await {
            Ok(result) if result.success => parse_api_level(&result.stdout)
                .map(|level| format!("Android {level}"))
                .unwrap_or_else(|| "Android".to_string()),
            _ => "Android".to_string(),
        }
    }
}

#[async_trait]
impl Backend for EmulatorBackend {
    fn kind(&self) -> NodeKind {
        NodeKind::Emulators
    }

    fn supports(&self, criteria: &Criteria) -> bool {
        criteria.os.as_deref().is_none_or(|os| has_prefix(os, "Android"))
    }

    async fn prepare_node(&self) -> NodeResult<()> {
        let tool = &self.control.tool;
        tool.run(&["emulator", "-list-avds"]).await?;
        tool.run(&["adb", "start-server"]).await?;
        tool.script(
            &format!("mkdir -p {}", escape(&self.config.flags.backup_dir)),
            false,
        )
        .await?;
        Ok(())
    }

    async fn provide_unit(&self, criteria: &Criteria, in_use: &HashSet<String>) -> NodeResult<UnitInfo> {
        let listing = self.control.tool.run(&["emulator", "-list-avds"]).await?;
        let avds = listing
            .lines()
            .map(str::trim)
            .filter(|avd| !avd.is_empty() && !avd.starts_with("INFO"))
            .filter(|avd| !in_use.contains(*avd))
            .filter(|avd| matches(criteria.model.as_deref(), avd) && matches(criteria.serial.as_deref(), avd))
            .map(String::from)
            .collect::<Vec<_>>();

        for avd in avds {
            let os = self.os_of(&avd).await;
            if matches(criteria.os.as_deref(), &os) {
                return Ok(UnitInfo {
                    serial: avd.clone(),
                    name: avd.clone(),
                    model: avd,
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn adb_listing_keeps_emulators_only() {
        let output = "List of devices attached\nemulator-5554\tdevice\nR58M1234\tdevice\nemulator-5556\toffline\n\n";
        assert_eq!(parse_adb_devices(output), vec!["emulator-5554", "emulator-5556"]);
    }

    #[test]
    fn api_level_from_config_ini() {
        let ini = "avd.ini.encoding=UTF-8\nimage.sysdir.1 = system-images/android-34/google_apis/x86_64/\n";
        assert_eq!(parse_api_level(ini).as_deref(), Some("34"));
        assert_eq!(parse_api_level("hw.lcd.density=420\n"), None);
    }

    #[test]
    fn headless_emulators_run_without_window() {
        let config = NodeConfig::new("localhost").with_kind(NodeKind::Emulators);
        let backend = EmulatorBackend::new(config, Arc::new(RemoteExecutor::local()));
        let unit = UnitInfo {
            serial: "Pixel_7_API_34".into(),
            name: "Pixel_7_API_34".into(),
            model: "Pixel_7_API_34".into(),
            os: "Android 34".into(),
        };
        let ports = AllocatedPorts {
            driver: 41800,
            companion: 41801,
            video: 41802,
            instrumentation: 41803,
        };
        let control = backend.control();
        assert!(control.capabilities().boot_via_companion);
        let companion = control.companion(&unit, &ports).unwrap();
        assert_eq!(companion.command[..3], ["emulator", "-avd", "Pixel_7_API_34"]);
        assert_eq!(companion.command.last().map(String::as_str), Some("-no-window"));

        let driver = control.driver(&unit, &ports).unwrap();
        assert!(driver.command[2].contains("forward tcp:41800 tcp:6790"));
        assert!(driver.probe.is_some());
    }

    #[test]
    fn only_android_is_supported() {
        let backend = EmulatorBackend::new(NodeConfig::new("localhost"), Arc::new(RemoteExecutor::local()));
        assert!(backend.supports(&Criteria::default().with_os("android 14")));
        assert!(!backend.supports(&Criteria::default().with_os("iOS 17.4")));
    }
}
