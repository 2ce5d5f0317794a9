//! Concrete backends and the command helpers they share.

mod devices;
mod emulators;
mod simulators;

use std::sync::Arc;
use std::time::Duration;

use simfleet_exec::{CommandResult, Env, ExecResult, RemoteExecutor, escape};

pub use devices::PhysicalBackend;
pub use emulators::EmulatorBackend;
pub use simulators::SimulatorBackend;

/// Bound on one tooling invocation (list, boot, copy...).
const TOOL_TIMEOUT: Duration = Duration::from_secs(120);

/// WebDriverAgent's `/status` reports readiness here.
const WDA_READY_FIELD: &str = "/value/ready";

/// Thin wrapper running backend tooling on the node.
#[derive(Clone)]
pub(crate) struct Tool {
    executor: Arc<RemoteExecutor>,
}

impl Tool {
    pub(crate) fn new(executor: Arc<RemoteExecutor>) -> Self {
        Self { executor }
    }

    /// Run and fail on a non-zero exit.
    pub(crate) async fn run(&self, command: &[&str]) -> ExecResult<CommandResult> {
        self.executor
            .exec(command, &Env::new(), TOOL_TIMEOUT, false)
            .await
    }

    /// Run and hand back whatever happened.
    pub(crate) async fn try_run(&self, command: &[&str]) -> ExecResult<CommandResult> {
        self.executor
            .exec(command, &Env::new(), TOOL_TIMEOUT, true)
            .await
    }

    pub(crate) async fn script(&self, script: &str, tolerate: bool) -> ExecResult<CommandResult> {
        self.executor.shell(script, TOOL_TIMEOUT, tolerate).await
    }
}

/// Clean copies of a unit's data directory, kept next to it on the node.
///
/// `root` may reference `$HOME`; it is left unescaped so the node's
/// shell expands it.
#[derive(Debug, Clone)]
pub(crate) struct DirBackup {
    root: String,
    suffix: &'static str,
    backup_dir: String,
}

impl DirBackup {
    pub(crate) fn new(root: impl Into<String>, suffix: &'static str, backup_dir: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            suffix,
            backup_dir: backup_dir.into(),
        }
    }

    fn source(&self, name: &str) -> String {
        format!("{}/{}", self.root, escape(&format!("{name}{}", self.suffix)))
    }

    fn target(&self, name: &str) -> String {
        format!("{}/{}", escape(&self.backup_dir), escape(&format!("{name}{}", self.suffix)))
    }

    pub(crate) fn exists_script(&self, name: &str) -> String {
        format!("test -d {}", self.target(name))
    }

    pub(crate) fn create_script(&self, name: &str) -> String {
        format!(
            "mkdir -p {dir} && rm -rf {dst} && cp -Rp {src} {dst}",
            dir = escape(&self.backup_dir),
            src = self.source(name),
            dst = self.target(name),
        )
    }

    pub(crate) fn restore_script(&self, name: &str) -> String {
        format!(
            "rm -rf {src} && cp -Rp {dst} {src}",
            src = self.source(name),
            dst = self.target(name),
        )
    }

    pub(crate) async fn exists(&self, tool: &Tool, name: &str) -> ExecResult<bool> {
        Ok(tool.script(&self.exists_script(name), true).await?.success)
    }

    pub(crate) async fn create(&self, tool: &Tool, name: &str) -> ExecResult<()> {
        tool.script(&self.create_script(name), false).await?;
        Ok(())
    }

    pub(crate) async fn restore(&self, tool: &Tool, name: &str) -> ExecResult<()> {
        tool.script(&self.restore_script(name), false).await?;
        Ok(())
    }
}

/// Case-insensitive "starts with" used for OS family checks.
pub(crate) fn has_prefix(value: &str, prefix: &str) -> bool {
    value
        .get(..prefix.len())
        .is_some_and(|head| head.eq_ignore_ascii_case(prefix))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backup_scripts_quote_names_not_home() {
        let backup = DirBackup::new(
            "\"$HOME\"/Library/Developer/CoreSimulator/Devices",
            "",
            "/var/tmp/sim backups",
        );
        assert_eq!(backup.exists_script("ABC-1"), "test -d /var/tmp/sim\\ backups/ABC-1");
        assert_eq!(
            backup.create_script("ABC-1"),
            "mkdir -p /var/tmp/sim\\ backups && rm -rf /var/tmp/sim\\ backups/ABC-1 \
             && cp -Rp \"$HOME\"/Library/Developer/CoreSimulator/Devices/ABC-1 /var/tmp/sim\\ backups/ABC-1"
        );
        assert_eq!(
            backup.restore_script("ABC-1"),
            "rm -rf \"$HOME\"/Library/Developer/CoreSimulator/Devices/ABC-1 \
             && cp -Rp /var/tmp/sim\\ backups/ABC-1 \"$HOME\"/Library/Developer/CoreSimulator/Devices/ABC-1"
        );
    }

    #[test]
    fn suffix_is_appended() {
        let backup = DirBackup::new("\"$HOME\"/.android/avd", ".avd", "/b");
        assert_eq!(backup.exists_script("Pixel_7"), "test -d /b/Pixel_7.avd");
    }

    #[test]
    fn prefix_check_ignores_case() {
        assert!(has_prefix("ios 17.4", "iOS"));
        assert!(has_prefix("Android 14", "android"));
        assert!(!has_prefix("iO", "iOS"));
    }

    #[tokio::test]
    async fn backup_round_trip_on_local_host() {
        let root = tempfile::tempdir().unwrap();
        let units = root.path().join("units");
        let store = root.path().join("store");
        std::fs::create_dir_all(units.join("U1")).unwrap();
        std::fs::write(units.join("U1").join("data"), "clean").unwrap();

        let tool = Tool::new(Arc::new(RemoteExecutor::local()));
        let backup = DirBackup::new(units.display().to_string(), "", store.display().to_string());
        assert!(!backup.exists(&tool, "U1").await.unwrap());
        backup.create(&tool, "U1").await.unwrap();
        assert!(backup.exists(&tool, "U1").await.unwrap());

        std::fs::write(units.join("U1").join("data"), "dirty").unwrap();
        backup.restore(&tool, "U1").await.unwrap();
        assert_eq!(std::fs::read_to_string(units.join("U1").join("data")).unwrap(), "clean");
    }
}
