//! Terminating processes: graceful-then-forceful, plus an OS-native fallback.

use std::collections::BTreeSet;
use std::time::{Duration, Instant};

use sysinfo::{Pid, ProcessRefreshKind, ProcessStatus, ProcessesToUpdate, Signal, System};

use super::GRACEFUL_SHUTDOWN_TIMEOUT;
use crate::error::{AppError, Result};

pub trait Terminate: Send + Sync {
    /// Signal every PID. Errors only when no PID could be signaled at all.
    fn kill(&self, pids: &BTreeSet<u32>) -> Result<()>;
}

/// One way of delivering termination signals.
pub trait KillStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Returns the PIDs that were confirmed signaled. Per-PID failures are swallowed.
    fn kill(&self, pids: &BTreeSet<u32>) -> BTreeSet<u32>;
}

/// Runs every strategy against every PID; success if any PID was signaled by any of them.
pub struct Terminator {
    strategies: Vec<Box<dyn KillStrategy>>,
}

impl Terminator {
    pub fn new(strategies: Vec<Box<dyn KillStrategy>>) -> Self {
        Self { strategies }
    }

    /// Process-table graceful kill followed by the OS-native forceful kill.
    pub fn system() -> Self {
        Self::new(vec![
            Box::new(GracefulThenForce::new(GRACEFUL_SHUTDOWN_TIMEOUT)),
            Box::new(NativeForceKill),
        ])
    }
}

impl Terminate for Terminator {
    fn kill(&self, pids: &BTreeSet<u32>) -> Result<()> {
        if pids.is_empty() {
            return Ok(());
        }

        let mut signaled = BTreeSet::new();
        // Not short-circuited: either strategy may silently miss some PIDs.
        for strategy in &self.strategies {
            let hit = strategy.kill(pids);
            log::debug!("{} signaled {:?} of {:?}", strategy.name(), hit, pids);
            signaled.extend(hit);
        }

        if signaled.is_empty() {
            let pids: Vec<u32> = pids.iter().copied().collect();
            log::error!("Failed to signal any of PIDs {:?}", pids);
            return Err(AppError::termination_failed(&pids));
        }
        Ok(())
    }
}

/// Terminate through the process table, wait, then kill whatever is left.
pub struct GracefulThenForce {
    timeout: Duration,
}

impl GracefulThenForce {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl KillStrategy for GracefulThenForce {
    fn name(&self) -> &'static str {
        "graceful"
    }

    fn kill(&self, pids: &BTreeSet<u32>) -> BTreeSet<u32> {
        let mut system = System::new();
        refresh(&mut system, pids);

        let mut signaled = BTreeSet::new();
        for &pid in pids {
            let Some(process) = system.process(Pid::from_u32(pid)) else {
                continue;
            };
            // Windows has no SIGTERM; `kill` is TerminateProcess there.
            let delivered = process
                .kill_with(Signal::Term)
                .unwrap_or_else(|| process.kill());
            if delivered {
                signaled.insert(pid);
            } else {
                log::warn!("Graceful terminate failed for PID {pid}");
            }
        }

        if signaled.is_empty() {
            return signaled;
        }

        let deadline = Instant::now() + self.timeout;
        let mut remaining = signaled.clone();
        while Instant::now() < deadline {
            refresh(&mut system, &remaining);
            remaining.retain(|&pid| is_alive(&system, pid));
            if remaining.is_empty() {
                return signaled;
            }
            std::thread::sleep(Duration::from_millis(100));
        }

        for &pid in &remaining {
            if let Some(process) = system.process(Pid::from_u32(pid)) {
                log::warn!(
                    "PID {pid} did not exit within {}s, force killing",
                    self.timeout.as_secs()
                );
                if !process.kill_with(Signal::Kill).unwrap_or_else(|| process.kill()) {
                    log::error!("Failed to force kill PID {pid}");
                }
            }
        }
        signaled
    }
}

/// `taskkill /T /F` on Windows; SIGKILL to the process group elsewhere.
pub struct NativeForceKill;

impl KillStrategy for NativeForceKill {
    fn name(&self) -> &'static str {
        "native"
    }

    fn kill(&self, pids: &BTreeSet<u32>) -> BTreeSet<u32> {
        let mut system = System::new();
        refresh(&mut system, pids);

        pids.iter()
            .copied()
            // On Unix a dead PID could already be reused; only touch live ones.
            .filter(|&pid| cfg!(target_os = "windows") || is_alive(&system, pid))
            .filter(|&pid| match force_kill(pid) {
                Ok(()) => true,
                Err(e) => {
                    log::debug!("Native kill for PID {pid}: {e}");
                    false
                }
            })
            .collect()
    }
}

fn refresh(system: &mut System, pids: &BTreeSet<u32>) {
    let targets: Vec<Pid> = pids.iter().copied().map(Pid::from_u32).collect();
    system.refresh_processes_specifics(
        ProcessesToUpdate::Some(&targets),
        true,
        ProcessRefreshKind::everything(),
    );
}

fn is_alive(system: &System, pid: u32) -> bool {
    system
        .process(Pid::from_u32(pid))
        .is_some_and(|p| !matches!(p.status(), ProcessStatus::Zombie | ProcessStatus::Dead))
}

#[cfg(target_os = "windows")]
pub fn force_kill(pid: u32) -> Result<()> {
    let mut cmd = std::process::Command::new("taskkill");
    cmd.args(["/PID", &pid.to_string(), "/T", "/F"]);
    super::os_cmd::hide_console(&mut cmd);
    let output = cmd
        .output()
        .map_err(|e| AppError::process(format!("Failed to run taskkill: {e}")))?;

    if output.status.success() {
        Ok(())
    } else {
        let stderr = super::os_cmd::decode_output(&output.stderr);
        let stdout = super::os_cmd::decode_output(&output.stdout);
        let detail = stderr.trim();
        let detail = if detail.is_empty() {
            stdout.trim()
        } else {
            detail
        };
        Err(AppError::process(format!(
            "taskkill failed for pid {}: {}",
            pid,
            if detail.is_empty() {
                "(no output)"
            } else {
                detail
            }
        )))
    }
}

#[cfg(not(target_os = "windows"))]
pub fn force_kill(pid: u32) -> Result<()> {
    use nix::sys::signal::{kill, killpg, Signal};
    use nix::unistd::{getpgid, getpgrp, Pid};

    let raw =
        i32::try_from(pid).map_err(|_| AppError::process(format!("PID {pid} out of range")))?;
    let target = Pid::from_raw(raw);
    match getpgid(Some(target)) {
        // Never take down our own group; that is the launcher itself.
        Ok(pgid) if pgid != getpgrp() => killpg(pgid, Signal::SIGKILL).map_err(|e| {
            AppError::process(format!(
                "Failed to kill process group {} (from pid {}): {}",
                pgid.as_raw(),
                pid,
                e
            ))
        }),
        _ => kill(target, Signal::SIGKILL)
            .map_err(|e| AppError::process(format!("Failed to kill process {}: {}", pid, e))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    /// Strategy that "signals" only the PIDs it was told to accept.
    struct Scripted {
        accepts: BTreeSet<u32>,
        seen: Mutex<Vec<u32>>,
    }

    impl Scripted {
        fn accepting(pids: &[u32]) -> Self {
            Self {
                accepts: pids.iter().copied().collect(),
                seen: Mutex::new(Vec::new()),
            }
        }
    }

    impl KillStrategy for Arc<Scripted> {
        fn name(&self) -> &'static str {
            "scripted"
        }

        fn kill(&self, pids: &BTreeSet<u32>) -> BTreeSet<u32> {
            self.seen.lock().unwrap().extend(pids.iter().copied());
            pids.intersection(&self.accepts).copied().collect()
        }
    }

    fn scripted(accepts: &[u32]) -> Arc<Scripted> {
        Arc::new(Scripted::accepting(accepts))
    }

    #[test]
    fn partial_graceful_plus_full_fallback_succeeds() {
        let graceful = scripted(&[2]);
        let native = scripted(&[1, 2]);
        let terminator = Terminator::new(vec![
            Box::new(Arc::clone(&graceful)),
            Box::new(Arc::clone(&native)),
        ]);

        terminator.kill(&BTreeSet::from([1, 2])).unwrap();
        assert_eq!(*native.seen.lock().unwrap(), vec![1, 2]);
    }

    #[test]
    fn fallback_runs_even_when_first_strategy_succeeds() {
        let graceful = scripted(&[1]);
        let native = scripted(&[]);
        let terminator = Terminator::new(vec![
            Box::new(Arc::clone(&graceful)),
            Box::new(Arc::clone(&native)),
        ]);

        terminator.kill(&BTreeSet::from([1])).unwrap();
        assert_eq!(*native.seen.lock().unwrap(), vec![1]);
    }

    #[test]
    fn total_failure_is_an_error() {
        let terminator = Terminator::new(vec![Box::new(scripted(&[])), Box::new(scripted(&[]))]);
        let err = terminator.kill(&BTreeSet::from([7, 8])).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::TerminationFailed);
        assert_eq!(err.payload("pids"), Some("7,8"));
    }

    #[test]
    fn empty_set_is_a_no_op() {
        let terminator = Terminator::new(Vec::new());
        assert!(terminator.kill(&BTreeSet::new()).is_ok());
    }

    #[cfg(unix)]
    #[test]
    fn system_terminator_stops_a_real_child() {
        use std::os::unix::process::CommandExt as _;

        let mut child = std::process::Command::new("sleep")
            .arg("30")
            .process_group(0)
            .spawn()
            .unwrap();
        let pid = child.id();

        Terminator::system().kill(&BTreeSet::from([pid])).unwrap();
        let status = child.wait().unwrap();
        assert!(!status.success());
    }

    #[test]
    fn vanished_pid_cannot_be_signaled() {
        let strategy = GracefulThenForce::new(Duration::from_millis(100));
        assert!(strategy.kill(&BTreeSet::from([u32::MAX - 1])).is_empty());
    }
}
