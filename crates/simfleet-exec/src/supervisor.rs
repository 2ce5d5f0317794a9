//! Supervision of one long-running helper process.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Child;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::error::{ExecError, ExecResult};
use crate::executor::{Env, RemoteExecutor};
use crate::signal;

/// Receives one line of helper output at a time.
pub type LineSink = Arc<dyn Fn(&str) + Send + Sync>;

/// Out-of-band health check layered on top of process liveness.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn is_healthy(&self) -> bool;
}

/// What to run, and how to tell whether it is healthy.
#[derive(Clone)]
pub struct ProcessSpec {
    pub command: Vec<String>,
    pub env: Env,
    pub probe: Option<Arc<dyn HealthProbe>>,
}

impl ProcessSpec {
    pub fn new(command: Vec<String>) -> Self {
        Self {
            command,
            env: Env::new(),
            probe: None,
        }
    }

    pub fn with_env(mut self, env: Env) -> Self {
        self.env = env;
        self
    }

    pub fn with_probe(mut self, probe: Arc<dyn HealthProbe>) -> Self {
        self.probe = Some(probe);
        self
    }
}

struct Running {
    child: Child,
    pid: Option<u32>,
    probe: Option<Arc<dyn HealthProbe>>,
    readers: Vec<JoinHandle<()>>,
}

/// Owns at most one running instance of a helper process.
pub struct ProcessSupervisor {
    name: String,
    executor: Arc<RemoteExecutor>,
    stdout: LineSink,
    stderr: LineSink,
    running: Mutex<Option<Running>>,
}

impl ProcessSupervisor {
    /// Supervisor whose output is forwarded to `tracing` at debug level.
    pub fn new(name: impl Into<String>, executor: Arc<RemoteExecutor>) -> Self {
        let name = name.into();
        let out_name = name.clone();
        let err_name = name.clone();
        Self {
            name,
            executor,
            stdout: Arc::new(move |line| debug!(process = %out_name, stream = "stdout", "{line}")),
            stderr: Arc::new(move |line| debug!(process = %err_name, stream = "stderr", "{line}")),
            running: Mutex::new(None),
        }
    }

    pub fn with_sinks(mut self, stdout: LineSink, stderr: LineSink) -> Self {
        self.stdout = stdout;
        self.stderr = stderr;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Start the process. Fails while a previous instance is still held.
    pub async fn start(&self, spec: ProcessSpec) -> ExecResult<()> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Err(ExecError::AlreadyRunning(self.name.clone()));
        }

        let mut child = self.executor.start(&spec.command, &spec.env)?;
        let pid = child.id();
        let mut readers = Vec::with_capacity(2);
        if let Some(out) = child.stdout.take() {
            readers.push(forward(out, self.stdout.clone()));
        }
        if let Some(err) = child.stderr.take() {
            readers.push(forward(err, self.stderr.clone()));
        }

        info!(process = %self.name, ?pid, "helper process started");
        *running = Some(Running {
            child,
            pid,
            probe: spec.probe,
            readers,
        });
        Ok(())
    }

    pub async fn pid(&self) -> Option<u32> {
        self.running.lock().await.as_ref().and_then(|r| r.pid)
    }

    pub async fn is_alive(&self) -> bool {
        let mut running = self.running.lock().await;
        match running.as_mut() {
            Some(r) => matches!(r.child.try_wait(), Ok(None)),
            None => false,
        }
    }

    /// Alive, and the probe (if any) agrees.
    pub async fn is_healthy(&self) -> bool {
        let probe = {
            let mut running = self.running.lock().await;
            let Some(r) = running.as_mut() else {
                return false;
            };
            if !matches!(r.child.try_wait(), Ok(None)) {
                return false;
            }
            r.probe.clone()
        };
        match probe {
            Some(probe) => probe.is_healthy().await,
            None => true,
        }
    }

    /// Stop the process: SIGTERM, wait out the grace window, SIGKILL.
    ///
    /// Killing a supervisor with nothing running is a no-op.
    pub async fn kill(&self) {
        let Some(mut running) = self.running.lock().await.take() else {
            return;
        };

        match running.child.try_wait() {
            Ok(Some(status)) => {
                debug!(process = %self.name, pid = ?running.pid, %status, "helper already exited");
            }
            _ => {
                let status = signal::terminate(&mut running.child, self.executor.kill_grace()).await;
                info!(process = %self.name, pid = ?running.pid, ?status, "helper process killed");
            }
        }
        for reader in running.readers {
            reader.abort();
        }
    }
}

impl Drop for ProcessSupervisor {
    fn drop(&mut self) {
        if let Some(running) = self.running.get_mut().as_mut() {
            if let Some(pid) = running.pid {
                signal::signal_group(pid, nix::sys::signal::Signal::SIGKILL);
            }
        }
    }
}

fn forward<R>(stream: R, sink: LineSink) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            sink(&line);
        }
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;

    struct FlagProbe(AtomicBool);

    #[async_trait]
    impl HealthProbe for FlagProbe {
        async fn is_healthy(&self) -> bool {
            self.0.load(Ordering::SeqCst)
        }
    }

    fn executor() -> Arc<RemoteExecutor> {
        Arc::new(RemoteExecutor::local().with_kill_grace(Duration::from_millis(300)))
    }

    async fn wait_healthy(supervisor: &ProcessSupervisor, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            if supervisor.is_healthy().await {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        false
    }

    fn sleeper() -> ProcessSpec {
        ProcessSpec::new(vec!["/bin/sh".into(), "-c".into(), "sleep 30".into()])
    }

    #[tokio::test]
    async fn start_then_kill() {
        let supervisor = ProcessSupervisor::new("driver", executor());
        supervisor.start(sleeper()).await.unwrap();
        assert!(supervisor.is_alive().await);
        assert!(supervisor.pid().await.is_some());

        supervisor.kill().await;
        assert!(!supervisor.is_alive().await);
        assert!(supervisor.pid().await.is_none());
    }

    #[tokio::test]
    async fn second_start_requires_kill() {
        let supervisor = ProcessSupervisor::new("driver", executor());
        supervisor.start(sleeper()).await.unwrap();
        let err = supervisor.start(sleeper()).await.unwrap_err();
        assert!(matches!(err, ExecError::AlreadyRunning(ref name) if name == "driver"));

        supervisor.kill().await;
        supervisor.start(sleeper()).await.unwrap();
        supervisor.kill().await;
    }

    #[tokio::test]
    async fn kill_without_process_is_noop() {
        let supervisor = ProcessSupervisor::new("idle", executor());
        supervisor.kill().await;
        supervisor.kill().await;
        assert!(!supervisor.is_alive().await);
    }

    #[tokio::test]
    async fn health_is_liveness_and_probe() {
        let probe = Arc::new(FlagProbe(AtomicBool::new(false)));
        let supervisor = ProcessSupervisor::new("driver", executor());
        assert!(!supervisor.is_healthy().await);

        supervisor
            .start(sleeper().with_probe(probe.clone()))
            .await
            .unwrap();
        assert!(!supervisor.is_healthy().await);

        probe.0.store(true, Ordering::SeqCst);
        assert!(supervisor.is_healthy().await);

        supervisor.kill().await;
        assert!(!supervisor.is_healthy().await);
    }

    #[tokio::test]
    async fn exited_process_is_unhealthy_while_driver_answers() {
        let answering = Arc::new(FlagProbe(AtomicBool::new(true)));
        let supervisor = ProcessSupervisor::new("driver", executor());
        supervisor
            .start(
                ProcessSpec::new(vec!["/bin/sh".into(), "-c".into(), "exit 3".into()])
                    .with_probe(answering),
            )
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;

        assert!(!supervisor.is_healthy().await);
        // Still held until killed.
        assert!(supervisor.pid().await.is_some());
        supervisor.kill().await;
    }

    #[tokio::test]
    async fn exited_process_is_not_alive() {
        let supervisor = ProcessSupervisor::new("oneshot", executor());
        supervisor
            .start(ProcessSpec::new(vec!["/bin/sh".into(), "-c".into(), "exit 0".into()]))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(!supervisor.is_alive().await);
        supervisor.kill().await;
    }

    #[tokio::test]
    async fn output_reaches_sinks_line_by_line() {
        let lines = Arc::new(StdMutex::new(Vec::new()));
        let captured = lines.clone();
        let sink: LineSink = Arc::new(move |line| captured.lock().unwrap().push(line.to_string()));
        let supervisor = ProcessSupervisor::new("syslog", executor())
            .with_sinks(sink, Arc::new(|_| {}));

        supervisor
            .start(ProcessSpec::new(vec![
                "/bin/sh".into(),
                "-c".into(),
                "echo one; echo two; sleep 30".into(),
            ]))
            .await
            .unwrap();
        let healthy = wait_healthy(&supervisor, Duration::from_secs(2)).await;
        assert!(healthy);
        for _ in 0..40 {
            if lines.lock().unwrap().len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        supervisor.kill().await;
        assert_eq!(*lines.lock().unwrap(), vec!["one".to_string(), "two".to_string()]);
    }

    #[tokio::test]
    async fn kill_escalates_when_term_is_ignored() {
        let supervisor = ProcessSupervisor::new("stubborn", executor());
        supervisor
            .start(ProcessSpec::new(vec![
                "/bin/sh".into(),
                "-c".into(),
                "trap '' TERM; while true; do sleep 1; done".into(),
            ]))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let started = std::time::Instant::now();
        supervisor.kill().await;
        assert!(!supervisor.is_alive().await);
        assert!(started.elapsed() >= Duration::from_millis(250));
    }
}
