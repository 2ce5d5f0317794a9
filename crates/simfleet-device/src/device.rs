//! Per-device lifecycle state machine.
//!
//! Every state-changing operation (prepare, reset, renew, release) runs
//! under the device's critical lock, and the state itself is only ever
//! written while that lock is held. Asynchronous operations run as one
//! spawned task per device carrying a `CancellationToken`; `release`
//! cancels it and waits for it to wind down before tearing the unit down.

use std::sync::{Arc, Mutex as StdMutex, MutexGuard as StdMutexGuard, PoisonError, RwLock, Weak};
use std::time::Duration;

use tokio::sync::{Mutex, MutexGuard, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use simfleet_core::{AllocatedPorts, DeviceHandle, DeviceRef, DeviceState, StatusSnapshot, UnitInfo};
use simfleet_exec::{ProcessSupervisor, RemoteExecutor};

use crate::control::{UnitControl, UnitStatus};
use crate::error::{DeviceError, DeviceResult};
use crate::health::{HealthStatus, HealthTracker, ProbeResult};
use crate::poll::{checkpoint, poll_until};

/// Timeouts and thresholds of the device lifecycle.
#[derive(Debug, Clone)]
pub struct DeviceSettings {
    /// Bound on a whole prepare or renew.
    pub prepare_timeout: Duration,
    /// Bound on a whole reset.
    pub reset_timeout: Duration,
    pub shutdown_timeout: Duration,
    pub boot_timeout: Duration,
    /// How long to wait for the diagnostic log after boot.
    pub log_timeout: Duration,
    pub driver_start_attempts: u32,
    /// Per attempt.
    pub driver_health_timeout: Duration,
    pub poll_interval: Duration,
    pub health_interval: Duration,
    pub health_failure_threshold: u32,
}

impl Default for DeviceSettings {
    fn default() -> Self {
        Self {
            prepare_timeout: Duration::from_secs(4 * 60),
            reset_timeout: Duration::from_secs(5 * 60),
            shutdown_timeout: Duration::from_secs(60),
            boot_timeout: Duration::from_secs(90),
            log_timeout: Duration::from_secs(60),
            driver_start_attempts: 3,
            driver_health_timeout: Duration::from_secs(60),
            poll_interval: Duration::from_millis(500),
            health_interval: Duration::from_secs(15),
            health_failure_threshold: 4,
        }
    }
}

/// Collaborators shared by every device on one node.
#[derive(Clone)]
pub struct DeviceContext {
    pub control: Arc<dyn UnitControl>,
    pub executor: Arc<RemoteExecutor>,
    /// Bounds concurrent boots on the node.
    pub boot_pool: Arc<Semaphore>,
    pub settings: DeviceSettings,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Operation {
    Prepare,
    Reset,
    Renew,
}

impl Operation {
    fn name(self) -> &'static str {
        match self {
            Self::Prepare => "prepare",
            Self::Reset => "reset",
            Self::Renew => "renew",
        }
    }

    fn accepts(self, state: DeviceState) -> bool {
        match self {
            Self::Prepare => state == DeviceState::None,
            Self::Reset => state == DeviceState::Created,
            Self::Renew => state == DeviceState::Failed,
        }
    }

    fn transient_state(self) -> DeviceState {
        match self {
            Self::Prepare => DeviceState::Creating,
            Self::Reset => DeviceState::Resetting,
            Self::Renew => DeviceState::Reviving,
        }
    }

    fn timeout(self, settings: &DeviceSettings) -> Duration {
        match self {
            Self::Reset => settings.reset_timeout,
            Self::Prepare | Self::Renew => settings.prepare_timeout,
        }
    }
}

#[derive(Debug, Default)]
struct Status {
    state: DeviceState,
    last_error: Option<String>,
}

struct TaskSlot {
    handle: JoinHandle<()>,
    cancel: CancellationToken,
}

impl TaskSlot {
    fn stop(self) {
        self.cancel.cancel();
        self.handle.abort();
    }
}

struct Trackers {
    unit: HealthTracker,
    driver: HealthTracker,
    companion: HealthTracker,
}

impl Trackers {
    fn new(threshold: u32) -> Self {
        Self {
            unit: HealthTracker::new(threshold),
            driver: HealthTracker::new(threshold),
            companion: HealthTracker::new(threshold),
        }
    }
}

/// One unit handed out by a node.
pub struct Device {
    reference: DeviceRef,
    unit: UnitInfo,
    node: String,
    ports: AllocatedPorts,
    has_driver: bool,
    has_companion: bool,
    control: Arc<dyn UnitControl>,
    boot_pool: Arc<Semaphore>,
    settings: DeviceSettings,
    critical: Mutex<()>,
    status: RwLock<Status>,
    companion: ProcessSupervisor,
    driver: ProcessSupervisor,
    task: StdMutex<Option<TaskSlot>>,
    health_loop: StdMutex<Option<TaskSlot>>,
    trackers: StdMutex<Trackers>,
}

impl Device {
    pub fn new(
        unit: UnitInfo,
        public_host: &str,
        ports: AllocatedPorts,
        use_driver: bool,
        context: &DeviceContext,
    ) -> Arc<Self> {
        let reference = DeviceRef::derive(&unit.serial, public_host);
        let has_driver = use_driver && context.control.driver(&unit, &ports).is_some();
        let has_companion = context.control.companion(&unit, &ports).is_some();
        Arc::new(Self {
            companion: ProcessSupervisor::new(format!("{reference}/companion"), context.executor.clone()),
            driver: ProcessSupervisor::new(format!("{reference}/driver"), context.executor.clone()),
            reference,
            unit,
            node: public_host.to_string(),
            ports,
            has_driver,
            has_companion,
            control: context.control.clone(),
            boot_pool: context.boot_pool.clone(),
            trackers: StdMutex::new(Trackers::new(context.settings.health_failure_threshold)),
            settings: context.settings.clone(),
            critical: Mutex::new(()),
            status: RwLock::new(Status::default()),
            task: StdMutex::new(None),
            health_loop: StdMutex::new(None),
        })
    }

    pub fn reference(&self) -> &DeviceRef {
        &self.reference
    }

    pub fn unit(&self) -> &UnitInfo {
        &self.unit
    }

    pub fn ports(&self) -> &AllocatedPorts {
        &self.ports
    }

    pub fn state(&self) -> DeviceState {
        self.status.read().unwrap_or_else(PoisonError::into_inner).state
    }

    pub fn last_error(&self) -> Option<String> {
        self.status
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .last_error
            .clone()
    }

    pub fn handle(&self) -> DeviceHandle {
        DeviceHandle {
            reference: self.reference.clone(),
            unit: self.unit.clone(),
            node: self.node.clone(),
            ports: self.ports,
            state: self.state(),
        }
    }

    /// Whether an asynchronous operation is still running.
    pub fn is_busy(&self) -> bool {
        lock(&self.task)
            .as_ref()
            .is_some_and(|slot| !slot.handle.is_finished())
    }

    /// `None → Creating → Created | Failed`, in the background.
    pub fn prepare_async(self: &Arc<Self>) -> DeviceResult<()> {
        self.spawn_operation(Operation::Prepare)
    }

    /// `Created → Resetting → Created | Failed`, in the background.
    pub fn reset_async(self: &Arc<Self>) -> DeviceResult<()> {
        self.spawn_operation(Operation::Reset)
    }

    /// `Failed → Reviving → Created | Failed`, in the background.
    pub fn renew_async(self: &Arc<Self>) -> DeviceResult<()> {
        self.spawn_operation(Operation::Renew)
    }

    /// Cancel any in-flight operation, then kill helpers and shut the unit down.
    ///
    /// Never fails: teardown errors are logged so the slot can be reused.
    pub async fn release(&self, reason: &str) {
        info!(device = %self.reference, %reason, "releasing device");

        let in_flight = lock(&self.task).take();
        if let Some(slot) = in_flight {
            slot.cancel.cancel();
            if let Err(e) = slot.handle.await {
                warn!(device = %self.reference, error = %e, "in-flight operation ended abnormally");
            }
        }
        self.stop_health_loop();

        let guard = self.critical.lock().await;
        self.kill_helpers().await;
        if self.control.capabilities().power_cycle {
            if let Err(e) = self.shutdown_unit(&CancellationToken::new()).await {
                warn!(device = %self.reference, error = %e, "shutdown during release failed");
            }
        }
        self.set_state(&guard, DeviceState::None, None);
        info!(device = %self.reference, "device released");
    }

    /// Re-probe a `Created` device and mark it `Failed` once any probe
    /// crosses its failure threshold. Returns the resulting state.
    pub async fn refresh_health(&self) -> DeviceState {
        if self.state() != DeviceState::Created {
            return self.state();
        }

        let failure = match self.control.status(&self.unit).await {
            Ok(UnitStatus::Booted) => {
                let (driver_ok, companion_ok) =
                    tokio::join!(self.driver_healthy(), self.companion_healthy());
                let mut trackers = lock(&self.trackers);
                trackers.unit.record(ProbeResult::Healthy);
                let driver = trackers.driver.record(driver_ok.into());
                let companion = trackers.companion.record(companion_ok.into());
                if driver == HealthStatus::Unhealthy {
                    Some(format!(
                        "automation driver failed {} consecutive health checks",
                        trackers.driver.consecutive_failures()
                    ))
                } else if companion == HealthStatus::Unhealthy {
                    Some(format!(
                        "companion process failed {} consecutive health checks",
                        trackers.companion.consecutive_failures()
                    ))
                } else {
                    None
                }
            }
            Ok(other) => {
                let mut trackers = lock(&self.trackers);
                (trackers.unit.record(ProbeResult::Unhealthy) == HealthStatus::Unhealthy)
                    .then(|| format!("unit is {other:?}, expected booted"))
            }
            Err(e) => {
                let mut trackers = lock(&self.trackers);
                (trackers.unit.record(ProbeResult::Failed) == HealthStatus::Unhealthy)
                    .then(|| format!("unit status check failed: {e}"))
            }
        };

        if let Some(message) = failure {
            self.mark_failed(message);
        }
        self.state()
    }

    /// Snapshot including live probe results.
    pub async fn status_snapshot(&self) -> StatusSnapshot {
        let state = self.state();
        let (driver_healthy, companion_healthy) = if state == DeviceState::Created {
            tokio::join!(self.driver_healthy(), self.companion_healthy())
        } else {
            (false, false)
        };
        StatusSnapshot {
            reference: self.reference.clone(),
            state,
            ready: state == DeviceState::Created && driver_healthy && companion_healthy,
            driver_healthy,
            companion_healthy,
            last_error: self.last_error(),
        }
    }

    fn spawn_operation(self: &Arc<Self>, operation: Operation) -> DeviceResult<()> {
        let mut slot = lock(&self.task);
        if slot.as_ref().is_some_and(|s| !s.handle.is_finished()) {
            return Err(DeviceError::Busy(self.reference.clone()));
        }

        let state = self.state();
        if !operation.accepts(state) {
            return Err(DeviceError::InvalidTransition {
                reference: self.reference.clone(),
                operation: operation.name(),
                state,
            });
        }

        let cancel = CancellationToken::new();
        let device = Arc::clone(self);
        let token = cancel.clone();
        let handle = tokio::spawn(async move { device.run_operation(operation, token).await });
        *slot = Some(TaskSlot { handle, cancel });
        debug!(device = %self.reference, operation = operation.name(), "operation scheduled");
        Ok(())
    }

    async fn run_operation(self: Arc<Self>, operation: Operation, cancel: CancellationToken) {
        let guard = match self.critical.try_lock() {
            Ok(guard) => guard,
            Err(_) => {
                debug!(device = %self.reference, operation = operation.name(), "waiting for device lock");
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return,
                    guard = self.critical.lock() => guard,
                }
            }
        };

        let state = self.state();
        if !operation.accepts(state) {
            warn!(device = %self.reference, operation = operation.name(), %state, "operation no longer applicable");
            return;
        }

        self.stop_health_loop();
        self.set_state(&guard, operation.transient_state(), None);
        info!(device = %self.reference, operation = operation.name(), "operation started");

        let timeout = operation.timeout(&self.settings);
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(DeviceError::Cancelled),
            result = tokio::time::timeout(timeout, self.perform(operation, &cancel)) => {
                result.unwrap_or_else(|_| Err(DeviceError::Timeout(format!(
                    "{} of {} exceeded {timeout:?}",
                    operation.name(),
                    self.unit.serial
                ))))
            }
        };

        match outcome {
            Ok(()) => {
                *lock(&self.trackers) = Trackers::new(self.settings.health_failure_threshold);
                self.set_state(&guard, DeviceState::Created, None);
                info!(device = %self.reference, operation = operation.name(), "device created");
                self.start_health_loop();
            }
            Err(DeviceError::Cancelled) => {
                info!(device = %self.reference, operation = operation.name(), "operation cancelled");
                self.set_state(&guard, DeviceState::Failed, Some("operation cancelled".to_string()));
            }
            Err(e) => {
                error!(device = %self.reference, operation = operation.name(), error = %e, "operation failed");
                self.set_state(&guard, DeviceState::Failed, Some(e.to_string()));
            }
        }
    }

    async fn perform(&self, operation: Operation, cancel: &CancellationToken) -> DeviceResult<()> {
        match operation {
            Operation::Prepare | Operation::Renew => self.prepare_unit(cancel).await,
            Operation::Reset => self.reset_unit(cancel).await,
        }
    }

    async fn prepare_unit(&self, cancel: &CancellationToken) -> DeviceResult<()> {
        self.kill_helpers().await;
        self.control.kill_stale_processes(&self.unit).await?;
        checkpoint(cancel)?;
        self.shutdown_unit(cancel).await?;

        if self.control.capabilities().backups {
            if self.control.backup_exists(&self.unit).await? {
                self.control.restore_backup(&self.unit).await?;
            } else {
                self.create_clean_backup(cancel).await?;
            }
        }
        checkpoint(cancel)?;
        self.boot_and_start_driver(cancel).await
    }

    async fn reset_unit(&self, cancel: &CancellationToken) -> DeviceResult<()> {
        self.kill_helpers().await;
        self.shutdown_unit(cancel).await?;

        if self.control.capabilities().backups {
            if !self.control.backup_exists(&self.unit).await? {
                return Err(DeviceError::Creation(format!(
                    "no clean backup for {}",
                    self.unit.serial
                )));
            }
            self.control.restore_backup(&self.unit).await?;
        } else {
            self.control.kill_stale_processes(&self.unit).await?;
        }
        checkpoint(cancel)?;
        self.boot_and_start_driver(cancel).await
    }

    async fn create_clean_backup(&self, cancel: &CancellationToken) -> DeviceResult<()> {
        info!(device = %self.reference, "creating clean backup");
        self.control.erase(&self.unit).await?;
        self.boot_unit(cancel).await?;
        self.shutdown_unit(cancel).await?;
        self.control.create_backup(&self.unit).await?;
        Ok(())
    }

    async fn boot_and_start_driver(&self, cancel: &CancellationToken) -> DeviceResult<()> {
        self.boot_unit(cancel).await?;
        checkpoint(cancel)?;
        if self.has_driver {
            self.start_driver(cancel).await?;
        }
        Ok(())
    }

    async fn boot_unit(&self, cancel: &CancellationToken) -> DeviceResult<()> {
        let _permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(DeviceError::Cancelled),
            permit = self.boot_pool.acquire() => permit
                .map_err(|_| DeviceError::Creation("boot pool closed".to_string()))?,
        };
        debug!(device = %self.reference, "boot slot acquired");

        let capabilities = self.control.capabilities();
        if capabilities.boot_via_companion {
            self.start_companion().await?;
        } else if capabilities.power_cycle {
            self.control.boot(&self.unit).await?;
        }

        let booted = poll_until(cancel, self.settings.boot_timeout, self.settings.poll_interval, move || async move {
            Ok::<_, DeviceError>(self.control.status(&self.unit).await? == UnitStatus::Booted)
        })
        .await?;
        if !booted {
            return Err(DeviceError::Timeout(format!(
                "{} did not boot within {:?}",
                self.unit.serial, self.settings.boot_timeout
            )));
        }

        let log_ready = poll_until(cancel, self.settings.log_timeout, self.settings.poll_interval, move || {
            self.control.diagnostic_log_ready(&self.unit)
        })
        .await?;
        if !log_ready {
            warn!(device = %self.reference, "diagnostic log did not appear, continuing");
        }
        if !capabilities.boot_via_companion {
            self.start_companion().await?;
        }
        info!(device = %self.reference, "unit booted");
        Ok(())
    }

    async fn start_companion(&self) -> DeviceResult<()> {
        if let Some(spec) = self.control.companion(&self.unit, &self.ports) {
            self.companion.kill().await;
            self.companion.start(spec).await?;
        }
        Ok(())
    }

    async fn start_driver(&self, cancel: &CancellationToken) -> DeviceResult<()> {
        let Some(spec) = self.control.driver(&self.unit, &self.ports) else {
            return Ok(());
        };
        let attempts = self.settings.driver_start_attempts.max(1);
        for attempt in 1..=attempts {
            checkpoint(cancel)?;
            self.driver.kill().await;
            self.driver.start(spec.clone()).await?;

            let healthy = poll_until(
                cancel,
                self.settings.driver_health_timeout,
                self.settings.poll_interval,
                move || async move { Ok::<_, DeviceError>(self.driver.is_healthy().await) },
            )
            .await?;
            if healthy {
                info!(device = %self.reference, attempt, "automation driver healthy");
                return Ok(());
            }
            warn!(device = %self.reference, attempt, attempts, "automation driver did not become healthy");
        }
        self.driver.kill().await;
        Err(DeviceError::Timeout(format!(
            "automation driver for {} not healthy after {attempts} attempts",
            self.unit.serial
        )))
    }

    async fn shutdown_unit(&self, cancel: &CancellationToken) -> DeviceResult<()> {
        if !self.control.capabilities().power_cycle {
            self.companion.kill().await;
            return Ok(());
        }
        self.control.shutdown(&self.unit).await?;
        let down = poll_until(cancel, self.settings.shutdown_timeout, self.settings.poll_interval, move || async move {
            Ok::<_, DeviceError>(self.control.status(&self.unit).await? == UnitStatus::Shutdown)
        })
        .await?;
        self.companion.kill().await;
        if !down {
            return Err(DeviceError::Timeout(format!(
                "{} did not shut down within {:?}",
                self.unit.serial, self.settings.shutdown_timeout
            )));
        }
        Ok(())
    }

    async fn kill_helpers(&self) {
        tokio::join!(self.driver.kill(), self.companion.kill());
    }

    async fn driver_healthy(&self) -> bool {
        !self.has_driver || self.driver.is_healthy().await
    }

    async fn companion_healthy(&self) -> bool {
        !self.has_companion || self.companion.is_healthy().await
    }

    fn mark_failed(&self, message: String) {
        // A running operation owns the state; its outcome wins.
        let Ok(guard) = self.critical.try_lock() else {
            debug!(device = %self.reference, "device busy, not marking failed");
            return;
        };
        if self.state() == DeviceState::Created {
            error!(device = %self.reference, error = %message, "device failed health checks");
            self.set_state(&guard, DeviceState::Failed, Some(message));
        }
    }

    fn start_health_loop(self: &Arc<Self>) {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let device: Weak<Self> = Arc::downgrade(self);
        let interval = self.settings.health_interval;

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
                let Some(device) = device.upgrade() else {
                    break;
                };
                let state = device.refresh_health().await;
                if state != DeviceState::Created {
                    debug!(device = %device.reference, %state, "health loop stopping");
                    break;
                }
            }
        });

        if let Some(old) = lock(&self.health_loop).replace(TaskSlot { handle, cancel }) {
            old.stop();
        }
    }

    fn stop_health_loop(&self) {
        if let Some(slot) = lock(&self.health_loop).take() {
            slot.stop();
        }
    }

    /// The guard proves the caller holds the critical lock.
    fn set_state(&self, _guard: &MutexGuard<'_, ()>, state: DeviceState, last_error: Option<String>) {
        let mut status = self.status.write().unwrap_or_else(PoisonError::into_inner);
        if status.state != state {
            debug!(device = %self.reference, from = %status.state, to = %state, "state transition");
        }
        status.state = state;
        if last_error.is_some() || state != DeviceState::Failed {
            status.last_error = last_error;
        }
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        if let Some(slot) = lock(&self.task).take() {
            slot.stop();
        }
        self.stop_health_loop();
    }
}

fn lock<T>(mutex: &StdMutex<T>) -> StdMutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
