//! Spawning the managed process and the owned handle to it.

use std::process::Stdio;

use tokio::io::{AsyncBufReadExt as _, AsyncRead, BufReader};
use tokio::process::{Child, Command};

use super::command::{check_interpreter, LaunchSpec};
use super::INTERPRETER_CHECK_TIMEOUT;
use crate::error::{AppError, Result};

/// A process this launcher spawned itself.
pub trait ManagedChild: Send {
    fn pid(&self) -> u32;

    /// `Some(exit code)` once the process has exited; never blocks.
    /// The code is `None` when the process was killed by a signal.
    fn poll(&mut self) -> Option<Option<i32>>;
}

pub trait Spawn: Send + Sync {
    /// Cheap executability check of the interpreter. Blocking.
    fn check_interpreter(&self, spec: &LaunchSpec) -> Result<()>;

    /// Spawn the process described by `spec`. Must be called inside a Tokio runtime.
    fn spawn(&self, spec: &LaunchSpec) -> Result<Box<dyn ManagedChild>>;
}

pub struct ProcessSpawner;

impl Spawn for ProcessSpawner {
    fn check_interpreter(&self, spec: &LaunchSpec) -> Result<()> {
        let version = check_interpreter(&spec.interpreter, INTERPRETER_CHECK_TIMEOUT)?;
        log::info!("Using interpreter {} ({})", spec.interpreter.display(), version);
        Ok(())
    }

    fn spawn(&self, spec: &LaunchSpec) -> Result<Box<dyn ManagedChild>> {
        let mut cmd = Command::new(&spec.interpreter);
        cmd.args(&spec.args)
            .current_dir(&spec.cwd)
            .envs(&spec.env)
            .env_remove("PYTHONHOME")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        #[cfg(target_os = "windows")]
        {
            use windows::Win32::System::Threading::CREATE_NO_WINDOW;
            cmd.creation_flags(CREATE_NO_WINDOW.0);
        }

        #[cfg(unix)]
        {
            cmd.process_group(0);
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| AppError::spawn_failed(format!("Failed to start ComfyUI: {e}")))?;

        let pid = child
            .id()
            .ok_or_else(|| AppError::spawn_failed("Failed to get process ID"))?;

        if let Some(stdout) = child.stdout.take() {
            forward_lines(stdout, "stdout", false);
        }
        if let Some(stderr) = child.stderr.take() {
            forward_lines(stderr, "stderr", true);
        }

        log::info!("Spawned ComfyUI (pid: {}, port: {})", pid, spec.port);
        Ok(Box::new(OwnedChild { child, pid }))
    }
}

fn forward_lines<R>(stream: R, label: &'static str, is_stderr: bool)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let mut lines = BufReader::new(stream).lines();
    tokio::spawn(async move {
        while let Ok(Some(line)) = lines.next_line().await {
            // Python logs everything to stderr, so it is not an error level signal.
            if is_stderr {
                log::warn!("[ComfyUI {label}] {line}");
            } else {
                log::info!("[ComfyUI {label}] {line}");
            }
        }
    });
}

struct OwnedChild {
    child: Child,
    pid: u32,
}

impl ManagedChild for OwnedChild {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn poll(&mut self) -> Option<Option<i32>> {
        match self.child.try_wait() {
            Ok(Some(status)) => Some(status.code()),
            Ok(None) => None,
            Err(e) => {
                log::warn!("Failed to poll PID {}: {e}", self.pid);
                None
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::time::Duration;

    fn spec(program: &str, args: &[&str]) -> LaunchSpec {
        LaunchSpec {
            interpreter: program.into(),
            entry_script: "unused".into(),
            args: args.iter().map(|a| a.to_string()).collect(),
            env: BTreeMap::new(),
            cwd: std::env::temp_dir(),
            port: 8188,
        }
    }

    #[tokio::test]
    async fn poll_reports_exit_code() {
        let mut child = ProcessSpawner.spawn(&spec("sh", &["-c", "exit 3"])).unwrap();
        let mut exit = None;
        for _ in 0..100 {
            exit = child.poll();
            if exit.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(exit, Some(Some(3)));
    }

    #[tokio::test]
    async fn missing_program_is_spawn_failure() {
        let err = ProcessSpawner
            .spawn(&spec("/nonexistent/python-xyz", &[]))
            .err()
            .unwrap();
        assert_eq!(err.kind(), crate::error::ErrorKind::SpawnFailed);
    }

    #[test]
    fn non_executable_interpreter_fails_check() {
        let dir = tempfile::tempdir().unwrap();
        let fake = dir.path().join("python3");
        std::fs::write(&fake, "not a binary").unwrap();
        let err = ProcessSpawner
            .check_interpreter(&spec(fake.to_str().unwrap(), &[]))
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::PreconditionFailed);
    }
}
