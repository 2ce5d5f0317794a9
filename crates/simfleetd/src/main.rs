//! simfleetd, the simfleet daemon.
//!
//! Loads the fleet configuration, registers every reachable node and keeps
//! the background loops running until Ctrl-C:
//! - node auto-registration (with per-node health checks)
//! - expired lease reclamation
//! - zombie process reaping
//!
//! # Usage
//!
//! ```text
//! simfleetd run --config /etc/simfleet/simfleet.toml
//! simfleetd check --config simfleet.toml --probe
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use futures::future::join_all;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use simfleet_cluster::{ActiveDevices, LeaseReclaimer, NodeRegistrar, NodeRegistry};
use simfleet_core::{FleetConfig, NodeConfig};
use simfleet_device::{DeviceSettings, PortAllocator};
use simfleet_exec::{RemoteExecutor, ZombieReaper};
use simfleet_node::DefaultNodeFactory;

const DEFAULT_FILTER: &str = "info,simfleetd=debug,simfleet=debug";
const DEFAULT_CONFIG: &str = "/etc/simfleet/simfleet.toml";

#[derive(Parser)]
#[command(name = "simfleetd", about = "simfleet device orchestrator daemon")]
struct Cli {
    /// Log output format.
    #[arg(long, value_enum, default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Command {
    /// Run the orchestrator until interrupted.
    Run {
        #[arg(long, short, default_value = DEFAULT_CONFIG)]
        config: PathBuf,
    },
    /// Validate a configuration file and print the configured nodes.
    Check {
        #[arg(long, short, default_value = DEFAULT_CONFIG)]
        config: PathBuf,

        /// Also test whether each node answers a remote command.
        #[arg(long)]
        probe: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    match cli.command {
        Command::Run { config } => run(&config).await,
        Command::Check { config, probe } => check(&config, probe).await,
    }
}

fn init_tracing(format: LogFormat) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

fn load_config(path: &Path) -> anyhow::Result<FleetConfig> {
    FleetConfig::from_file(path)
        .with_context(|| format!("failed to load configuration from {}", path.display()))
}

/// Device timings with `[timeouts]` overrides applied.
fn device_settings(config: &FleetConfig) -> DeviceSettings {
    let mut settings = DeviceSettings::default();
    let overrides = [
        ("prepare", &mut settings.prepare_timeout),
        ("reset", &mut settings.reset_timeout),
        ("boot", &mut settings.boot_timeout),
        ("shutdown", &mut settings.shutdown_timeout),
        ("driver_health", &mut settings.driver_health_timeout),
    ];
    for (name, slot) in overrides {
        if let Some(timeout) = config.timeout(name) {
            *slot = timeout;
        }
    }
    settings
}

async fn run(path: &Path) -> anyhow::Result<()> {
    let config = load_config(path)?;
    info!(path = %path.display(), nodes = config.nodes.len(), "simfleet daemon starting");

    let orchestrator = &config.orchestrator;
    let ports = Arc::new(PortAllocator::from_range(config.ports));
    let factory = DefaultNodeFactory::new(ports.clone()).with_settings(device_settings(&config));

    let active_devices = Arc::new(ActiveDevices::new());
    let registry = Arc::new(
        NodeRegistry::new(active_devices.clone()).with_device_timeout(config.device_timeout()),
    );
    let registrar = Arc::new(NodeRegistrar::new(&config, &factory, registry.clone())?);
    let reclaimer = Arc::new(
        LeaseReclaimer::new(active_devices.clone()).with_max_sleep(orchestrator.max_reclaim_sleep()),
    );
    let reaper = ZombieReaper::new(orchestrator.zombie_reap_interval());
    info!(
        ports = ports.available(),
        device_timeout = ?config.device_timeout(),
        "orchestrator initialized"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let handles = vec![
        tokio::spawn({
            let registrar = registrar.clone();
            let shutdown = shutdown_rx.clone();
            async move { registrar.run(shutdown).await }
        }),
        tokio::spawn({
            let reclaimer = reclaimer.clone();
            let shutdown = shutdown_rx.clone();
            async move { reclaimer.run(shutdown).await }
        }),
        tokio::spawn(async move { reaper.run(shutdown_rx).await }),
    ];

    tokio::signal::ctrl_c()
        .await
        .context("failed to install Ctrl-C handler")?;
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);

    for result in join_all(handles).await {
        if let Err(e) = result {
            warn!(error = %e, "background task ended abnormally");
        }
    }

    let leased = active_devices.device_refs();
    if !leased.is_empty() {
        let released = active_devices
            .release_devices(&leased, "daemon shutdown")
            .await;
        info!(released, leased = leased.len(), "leases released");
    }
    registry.dispose().await;

    info!("simfleet daemon stopped");
    Ok(())
}

async fn check(path: &Path, probe: bool) -> anyhow::Result<()> {
    let config = load_config(path)?;
    println!("{}: ok", path.display());
    println!(
        "ports {}..={}, lease timeout {}",
        config.ports.start,
        config.ports.end,
        config
            .device_timeout()
            .map_or_else(|| "none".to_string(), |t| format!("{}s", t.as_secs())),
    );

    for node in &config.nodes {
        let line = describe(node);
        if probe {
            let reachable = RemoteExecutor::for_node(node).is_reachable().await;
            let status = if reachable { "reachable" } else { "UNREACHABLE" };
            println!("  {line} [{status}]");
        } else {
            println!("  {line}");
        }
    }
    Ok(())
}

/// One summary line per node.
fn describe(node: &NodeConfig) -> String {
    let target = if node.is_local() {
        "local".to_string()
    } else if node.user.is_empty() {
        format!("ssh {}", node.host)
    } else {
        format!("ssh {}@{}", node.user, node.host)
    };
    let mut line = format!(
        "{} ({}, {target}): capacity {}, {} concurrent boots",
        node.public_host(),
        node.kind,
        node.capacity,
        node.concurrent_boots,
    );
    if !node.devices.is_empty() {
        line.push_str(&format!(", {} known devices", node.devices.len()));
    }
    if !node.flags.headless {
        line.push_str(", windowed");
    }
    line
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::time::Duration;

    use clap::CommandFactory;
    use simfleet_core::NodeKind;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_run_with_json_logs() {
        let cli = Cli::try_parse_from([
            "simfleetd",
            "--log-format",
            "json",
            "run",
            "--config",
            "fleet.toml",
        ])
        .unwrap();
        assert_eq!(cli.log_format, LogFormat::Json);
        match cli.command {
            Command::Run { config } => assert_eq!(config, PathBuf::from("fleet.toml")),
            Command::Check { .. } => panic!("expected run"),
        }
    }

    #[test]
    fn check_defaults_to_no_probe() {
        let cli = Cli::try_parse_from(["simfleetd", "check"]).unwrap();
        assert_eq!(cli.log_format, LogFormat::Text);
        match cli.command {
            Command::Check { config, probe } => {
                assert_eq!(config, PathBuf::from(DEFAULT_CONFIG));
                assert!(!probe);
            }
            Command::Run { .. } => panic!("expected check"),
        }
    }

    #[test]
    fn timeout_overrides_apply_to_device_settings() {
        let config = FleetConfig::from_toml(
            r#"
            [timeouts]
            device = 600
            prepare = 300
            boot = 45
            "#,
        )
        .unwrap();
        let settings = device_settings(&config);
        let defaults = DeviceSettings::default();

        assert_eq!(settings.prepare_timeout, Duration::from_secs(300));
        assert_eq!(settings.boot_timeout, Duration::from_secs(45));
        assert_eq!(settings.reset_timeout, defaults.reset_timeout);
    }

    #[test]
    fn loads_config_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
            [[nodes]]
            host = "mac-01.local"
            user = "ci"
            capacity = 4
            "#
        )
        .unwrap();

        let config = load_config(file.path()).unwrap();
        assert_eq!(config.nodes.len(), 1);
        assert!(load_config(Path::new("/nonexistent/simfleet.toml")).is_err());
    }

    #[test]
    fn describes_remote_and_local_nodes() {
        let mut remote = NodeConfig::new("mac-01.local").with_capacity(4);
        remote.user = "ci".into();
        let line = describe(&remote);
        assert!(line.starts_with("mac-01.local (simulators, ssh ci@mac-01.local)"));
        assert!(line.contains("capacity 4"));

        let local = NodeConfig::new("localhost").with_kind(NodeKind::Emulators);
        assert!(describe(&local).contains("emulators, local"));
    }
}
