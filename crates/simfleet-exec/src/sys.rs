//! Platform shim: find uncollected children and collect them.

use std::io;

use nix::errno::Errno;
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::Pid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReapOutcome {
    /// Exit status collected. Carries the exit code when there is one.
    Collected(Option<i32>),
    StillRunning,
    /// Someone else already collected it.
    NotChild,
}

/// Direct children of this process in the zombie state.
#[cfg(target_os = "linux")]
pub(crate) fn zombie_children() -> io::Result<Vec<i32>> {
    let me = std::process::id() as i32;
    let mut zombies = Vec::new();
    for entry in std::fs::read_dir("/proc")?.flatten() {
        let Some(pid) = entry
            .file_name()
            .to_str()
            .and_then(|name| name.parse::<i32>().ok())
        else {
            continue;
        };
        // The process may vanish between listing and reading.
        let Ok(stat) = std::fs::read_to_string(entry.path().join("stat")) else {
            continue;
        };
        if let Some(('Z', ppid)) = parse_stat(&stat) {
            if ppid == me {
                zombies.push(pid);
            }
        }
    }
    Ok(zombies)
}

#[cfg(not(target_os = "linux"))]
pub(crate) fn zombie_children() -> io::Result<Vec<i32>> {
    let output = std::process::Command::new("ps")
        .args(["-A", "-o", "pid=,ppid=,stat="])
        .output()?;
    Ok(parse_ps(
        &String::from_utf8_lossy(&output.stdout),
        std::process::id() as i32,
    ))
}

/// Non-blocking `waitpid` on one pid.
pub(crate) fn reap(pid: i32) -> Result<ReapOutcome, Errno> {
    match waitpid(Pid::from_raw(pid), Some(WaitPidFlag::WNOHANG)) {
        Ok(WaitStatus::StillAlive) => Ok(ReapOutcome::StillRunning),
        Ok(WaitStatus::Exited(_, code)) => Ok(ReapOutcome::Collected(Some(code))),
        Ok(_) => Ok(ReapOutcome::Collected(None)),
        Err(Errno::ECHILD) => Ok(ReapOutcome::NotChild),
        Err(e) => Err(e),
    }
}

/// `/proc/<pid>/stat` is `pid (comm) state ppid ...`; comm may hold spaces.
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn parse_stat(stat: &str) -> Option<(char, i32)> {
    let rest = &stat[stat.rfind(')')? + 1..];
    let mut fields = rest.split_whitespace();
    let state = fields.next()?.chars().next()?;
    let ppid = fields.next()?.parse().ok()?;
    Some((state, ppid))
}

/// Lines of `ps -o pid=,ppid=,stat=`.
#[cfg_attr(target_os = "linux", allow(dead_code))]
fn parse_ps(output: &str, parent: i32) -> Vec<i32> {
    output
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let pid = fields.next()?.parse::<i32>().ok()?;
            let ppid = fields.next()?.parse::<i32>().ok()?;
            let stat = fields.next()?;
            (ppid == parent && stat.starts_with('Z')).then_some(pid)
        })
        .collect()
}
