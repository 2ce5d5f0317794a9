//! Signal delivery to supervised process groups.

use std::process::ExitStatus;
use std::time::Duration;

use nix::sys::signal::{Signal, killpg};
use nix::unistd::Pid;
use tokio::process::Child;
use tracing::debug;

/// Send `signal` to the process group led by `pid`.
pub(crate) fn signal_group(pid: u32, signal: Signal) {
    if let Err(e) = killpg(Pid::from_raw(pid as i32), signal) {
        debug!(pid, ?signal, error = %e, "signal delivery failed");
    }
}

/// SIGTERM the child's group, wait up to `grace`, then SIGKILL.
pub(crate) async fn terminate(child: &mut Child, grace: Duration) -> Option<ExitStatus> {
    let Some(pid) = child.id() else {
        // Already collected.
        return child.try_wait().ok().flatten();
    };

    signal_group(pid, Signal::SIGTERM);
    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => Some(status),
        Ok(Err(e)) => {
            debug!(pid, error = %e, "wait after SIGTERM failed");
            None
        }
        Err(_) => {
            debug!(pid, ?grace, "grace period elapsed, sending SIGKILL");
            signal_group(pid, Signal::SIGKILL);
            if let Err(e) = child.kill().await {
                debug!(pid, error = %e, "forced kill failed");
            }
            child.try_wait().ok().flatten()
        }
    }
}
