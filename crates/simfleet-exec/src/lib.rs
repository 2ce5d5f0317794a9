//! simfleet-exec: the process substrate every device operation runs on.
//!
//! # Architecture
//!
//! ```text
//! RemoteExecutor (local | ssh user@host)
//!   ├── exec(command, env, timeout, tolerate) → CommandResult
//!   │     └── timeout → SIGTERM process group → grace → SIGKILL
//!   ├── start(command, env) → Child (piped, own process group)
//!   └── shell(script): retried once on TransportError
//!
//! ProcessSupervisor (one long-running helper)
//!   ├── start(ProcessSpec) → line sinks for stdout/stderr
//!   ├── is_alive / is_healthy (alive AND HealthProbe)
//!   └── kill(): graceful, then forced
//!
//! ZombieReaper
//!   └── every tick: sys::zombie_children() → sys::reap(pid) (WNOHANG)
//! ```

pub mod error;
pub mod escape;
pub mod executor;
pub mod reaper;
pub mod result;
pub mod supervisor;

mod signal;
mod sys;

pub use error::{ExecError, ExecResult};
pub use escape::{escape, join_escaped};
pub use executor::{Env, RemoteExecutor, Target};
pub use reaper::{ReapReport, ZombieReaper};
pub use result::CommandResult;
pub use supervisor::{HealthProbe, LineSink, ProcessSpec, ProcessSupervisor};
