//! Command execution on the local machine or over SSH.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use simfleet_core::NodeConfig;

use crate::error::{ExecError, ExecResult};
use crate::escape::join_escaped;
use crate::result::CommandResult;
use crate::signal;

/// Per-call environment overrides.
pub type Env = HashMap<String, String>;

/// Exit code ssh reserves for its own failures.
const SSH_TRANSPORT_EXIT: i32 = 255;

/// Ambient variables the executor lets through to every command.
const PASSTHROUGH_VARS: &[&str] = &[
    "PATH",
    "HOME",
    "USER",
    "LOGNAME",
    "LANG",
    "TMPDIR",
    "SSH_AUTH_SOCK",
];

const DEFAULT_PATH: &str = "/usr/local/bin:/usr/bin:/bin:/usr/sbin:/sbin";

/// How long readers may keep draining pipes after the process exited.
const DRAIN_TIMEOUT: Duration = Duration::from_millis(250);

const REACHABILITY_TIMEOUT: Duration = Duration::from_secs(20);

/// Where commands run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    Local,
    /// `destination` is `host` or `user@host`.
    Ssh { host: String, destination: String },
}

/// Runs commands on one host, locally or through `ssh`.
#[derive(Debug, Clone)]
pub struct RemoteExecutor {
    target: Target,
    common_env: Env,
    connect_timeout: Duration,
    kill_grace: Duration,
}

impl RemoteExecutor {
    pub fn local() -> Self {
        Self {
            target: Target::Local,
            common_env: Env::new(),
            connect_timeout: Duration::from_secs(10),
            kill_grace: Duration::from_secs(2),
        }
    }

    pub fn ssh(host: impl Into<String>, user: &str) -> Self {
        let host = host.into();
        let destination = if user.is_empty() {
            host.clone()
        } else {
            format!("{user}@{host}")
        };
        Self {
            target: Target::Ssh { host, destination },
            ..Self::local()
        }
    }

    /// Executor for a configured node, carrying its common environment.
    pub fn for_node(config: &NodeConfig) -> Self {
        let executor = if config.is_local() {
            Self::local()
        } else {
            Self::ssh(config.host.clone(), &config.user)
        };
        executor.with_common_env(config.environment.clone())
    }

    pub fn with_common_env(mut self, env: Env) -> Self {
        self.common_env = env;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Grace window between SIGTERM and SIGKILL.
    pub fn with_kill_grace(mut self, grace: Duration) -> Self {
        self.kill_grace = grace;
        self
    }

    pub fn kill_grace(&self) -> Duration {
        self.kill_grace
    }

    pub fn is_local(&self) -> bool {
        self.target == Target::Local
    }

    pub fn host(&self) -> &str {
        match &self.target {
            Target::Local => "localhost",
            Target::Ssh { host, .. } => host,
        }
    }

    /// Run `command` to completion.
    ///
    /// A non-zero exit is an error only when `tolerate_failure` is false.
    /// An ssh transport failure is always an error.
    pub async fn exec<S: AsRef<str>>(
        &self,
        command: &[S],
        env: &Env,
        timeout: Duration,
        tolerate_failure: bool,
    ) -> ExecResult<CommandResult> {
        let rendered = render(command);
        let mut cmd = self.build_command(command, env)?;
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .process_group(0);

        let mut child = cmd.spawn().map_err(|source| ExecError::Spawn {
            command: rendered.clone(),
            source,
        })?;
        let pid = child.id();
        debug!(host = %self.host(), ?pid, command = %rendered, "exec");

        let stdout = Arc::new(Mutex::new(String::new()));
        let stderr = Arc::new(Mutex::new(String::new()));
        let mut readers = Vec::with_capacity(2);
        if let Some(out) = child.stdout.take() {
            readers.push(collect(out, stdout.clone()));
        }
        if let Some(err) = child.stderr.take() {
            readers.push(collect(err, stderr.clone()));
        }

        let (exit_code, timed_out) = match tokio::time::timeout(timeout, child.wait()).await {
            Ok(status) => (status?.code().unwrap_or(-1), false),
            Err(_) => {
                warn!(host = %self.host(), ?pid, command = %rendered, ?timeout, "command timed out");
                signal::terminate(&mut child, self.kill_grace).await;
                (-1, true)
            }
        };

        let _ = tokio::time::timeout(DRAIN_TIMEOUT, async {
            for reader in readers.iter_mut() {
                let _ = reader.await;
            }
        })
        .await;
        for reader in &readers {
            reader.abort();
        }

        let result = CommandResult {
            command: rendered.clone(),
            stdout: take(&stdout),
            stderr: take(&stderr),
            exit_code,
            success: exit_code == 0 && !timed_out,
            pid,
            timed_out,
        };

        if let Target::Ssh { host, .. } = &self.target {
            if exit_code == SSH_TRANSPORT_EXIT {
                return Err(ExecError::Transport {
                    host: host.clone(),
                    message: result.stderr.trim().to_string(),
                });
            }
        }

        if tolerate_failure || result.success {
            return Ok(result);
        }
        if timed_out {
            return Err(ExecError::Timeout {
                command: rendered,
                timeout,
                result: Box::new(result),
            });
        }
        Err(ExecError::CommandFailure {
            command: rendered,
            exit_code,
            stderr: result.stderr.trim().to_string(),
        })
    }

    /// Spawn a long-running process with piped output in its own process group.
    pub fn start<S: AsRef<str>>(&self, command: &[S], env: &Env) -> ExecResult<Child> {
        let rendered = render(command);
        let mut cmd = self.build_command(command, env)?;
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .process_group(0);
        let child = cmd.spawn().map_err(|source| ExecError::Spawn {
            command: rendered.clone(),
            source,
        })?;
        debug!(host = %self.host(), pid = ?child.id(), command = %rendered, "started");
        Ok(child)
    }

    /// Run a `bash -c` script, retrying once on a transport failure.
    pub async fn shell(
        &self,
        script: &str,
        timeout: Duration,
        tolerate_failure: bool,
    ) -> ExecResult<CommandResult> {
        let command = ["/bin/bash", "-c", script];
        match self.exec(&command, &Env::new(), timeout, tolerate_failure).await {
            Err(e) if e.is_transport() => {
                warn!(host = %self.host(), error = %e, "transport failure, retrying once");
                self.exec(&command, &Env::new(), timeout, tolerate_failure)
                    .await
            }
            other => other,
        }
    }

    /// Whether the host answers a trivial command.
    pub async fn is_reachable(&self) -> bool {
        match self
            .exec(&["echo", "1"], &Env::new(), REACHABILITY_TIMEOUT, true)
            .await
        {
            Ok(result) => result.success,
            Err(e) => {
                debug!(host = %self.host(), error = %e, "reachability probe failed");
                false
            }
        }
    }

    fn build_command<S: AsRef<str>>(&self, command: &[S], env: &Env) -> ExecResult<Command> {
        let (program, args) = command.split_first().ok_or(ExecError::EmptyCommand)?;

        let mut merged = base_environment();
        merged.extend(self.common_env.clone());
        merged.extend(env.clone());

        let mut cmd = match &self.target {
            Target::Local => {
                let mut cmd = Command::new(program.as_ref());
                cmd.args(args.iter().map(AsRef::as_ref));
                cmd
            }
            Target::Ssh { destination, .. } => {
                let mut cmd = Command::new("ssh");
                cmd.arg("-o")
                    .arg(format!("ConnectTimeout={}", self.connect_timeout.as_secs()))
                    .arg("-o")
                    .arg("PreferredAuthentications=publickey")
                    .arg("-q")
                    .arg("-T");
                let mut forwarded: Vec<&String> = self
                    .common_env
                    .keys()
                    .chain(env.keys())
                    .collect();
                forwarded.sort();
                forwarded.dedup();
                for name in forwarded {
                    cmd.arg("-o").arg(format!("SendEnv={name}"));
                }
                cmd.arg(destination).arg(join_escaped(command));
                cmd
            }
        };
        cmd.env_clear().envs(merged);
        Ok(cmd)
    }
}

/// Whitelisted slice of the orchestrator's own environment.
fn base_environment() -> Env {
    let mut env: Env = PASSTHROUGH_VARS
        .iter()
        .filter_map(|name| std::env::var(name).ok().map(|v| (name.to_string(), v)))
        .collect();
    env.entry("PATH".to_string())
        .or_insert_with(|| DEFAULT_PATH.to_string());
    env
}

fn render<S: AsRef<str>>(command: &[S]) -> String {
    command
        .iter()
        .map(AsRef::as_ref)
        .collect::<Vec<_>>()
        .join(" ")
}

fn collect<R>(stream: R, buffer: Arc<Mutex<String>>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if let Ok(mut buf) = buffer.lock() {
                buf.push_str(&line);
                buf.push('\n');
            }
        }
    })
}

fn take(buffer: &Mutex<String>) -> String {
    buffer
        .lock()
        .map(|mut b| std::mem::take(&mut *b))
        .unwrap_or_default()
}
