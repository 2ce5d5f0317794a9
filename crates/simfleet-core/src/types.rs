//! Device-level types shared across the orchestrator.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Opaque external reference of a device.
///
/// Derived from the unit serial and the public host name of the node
/// hosting it, so the same unit on two nodes never collides.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceRef(String);

impl DeviceRef {
    /// Build the reference of `serial` hosted on `public_host`.
    ///
    /// Every character outside `[-A-Za-z0-9_]` becomes `-`.
    pub fn derive(serial: &str, public_host: &str) -> Self {
        let sanitized = format!("{serial}-{public_host}")
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                    c
                } else {
                    '-'
                }
            })
            .collect();
        Self(sanitized)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for DeviceRef {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for DeviceRef {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for DeviceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifecycle state of a single device.
///
/// ```text
/// None ──prepare──▶ Creating ──▶ Created ──reset──▶ Resetting ──▶ Created
///                      │            ▲                   │
///                      ▼            │                   ▼
///                    Failed ──renew──▶ Reviving ─────▶ Failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DeviceState {
    #[default]
    None,
    Creating,
    Resetting,
    Created,
    Reviving,
    Failed,
}

impl DeviceState {
    /// Whether an asynchronous operation is currently driving the device.
    pub fn is_transitioning(self) -> bool {
        matches!(self, Self::Creating | Self::Resetting | Self::Reviving)
    }
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::None => "none",
            Self::Creating => "creating",
            Self::Resetting => "resetting",
            Self::Created => "created",
            Self::Reviving => "reviving",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Placement criteria for a new device request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Criteria {
    /// Device model, e.g. "iPhone 15" or an AVD name.
    #[serde(default)]
    pub model: Option<String>,
    /// OS version, e.g. "iOS 17.4".
    #[serde(default)]
    pub os: Option<String>,
    /// Pin the request to one specific unit serial.
    #[serde(default)]
    pub serial: Option<String>,
    /// Host architecture constraint (simulators only).
    #[serde(default)]
    pub arch: Option<String>,
    #[serde(default = "default_true")]
    pub headless: bool,
    /// Start the automation driver as part of preparation.
    #[serde(default = "default_true")]
    pub use_driver: bool,
}

fn default_true() -> bool {
    true
}

impl Default for Criteria {
    fn default() -> Self {
        Self {
            model: None,
            os: None,
            serial: None,
            arch: None,
            headless: true,
            use_driver: true,
        }
    }
}

impl Criteria {
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_os(mut self, os: impl Into<String>) -> Self {
        self.os = Some(os.into());
        self
    }

    pub fn with_serial(mut self, serial: impl Into<String>) -> Self {
        self.serial = Some(serial.into());
        self
    }

    pub fn without_driver(mut self) -> Self {
        self.use_driver = false;
        self
    }
}

/// TCP ports reserved for one device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AllocatedPorts {
    /// Automation driver HTTP port.
    pub driver: u16,
    /// Companion helper (boot helper, emulator console).
    pub companion: u16,
    /// Screen stream port.
    pub video: u16,
    /// Instrumentation / debugger port.
    pub instrumentation: u16,
}

impl AllocatedPorts {
    /// Number of ports carved out of the pool per device.
    pub const COUNT: usize = 4;

    pub fn to_vec(&self) -> Vec<u16> {
        vec![self.driver, self.companion, self.video, self.instrumentation]
    }
}

/// Static description of a unit a node can host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitInfo {
    pub serial: String,
    pub name: String,
    pub model: String,
    pub os: String,
}

/// Returned to callers when a node accepts a placement request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceHandle {
    pub reference: DeviceRef,
    pub unit: UnitInfo,
    /// Public host name of the hosting node.
    pub node: String,
    pub ports: AllocatedPorts,
    pub state: DeviceState,
}

impl DeviceHandle {
    /// Base URL of the device's automation driver.
    pub fn driver_url(&self) -> String {
        format!("http://{}:{}", self.node, self.ports.driver)
    }
}

/// Point-in-time view of a device, including live probe results.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub reference: DeviceRef,
    pub state: DeviceState,
    /// Created and every probe healthy.
    pub ready: bool,
    pub driver_healthy: bool,
    pub companion_healthy: bool,
    pub last_error: Option<String>,
}

/// Current Unix epoch seconds.
pub fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
