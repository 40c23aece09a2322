//! Deciding whether a PID belongs to the managed application.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};

use super::os_cmd::{run_captured, ProbeError};
use super::OS_COMMAND_TIMEOUT;
use crate::config::ConfigStore;
use crate::paths::{absolutize, ENTRY_SCRIPT};

const ROOT_KEY: &str = "paths.comfyui_root";

/// Lower-cased tokens that mark a process as the managed application.
#[derive(Debug, Clone)]
pub struct Signature {
    pub entry_script: String,
    pub app_token: String,
    pub build_marker: String,
    pub root: Option<String>,
}

impl Signature {
    pub fn new(root: Option<&Path>) -> Self {
        Self {
            entry_script: ENTRY_SCRIPT.to_string(),
            app_token: "comfyui".to_string(),
            build_marker: "--windows-standalone-build".to_string(),
            root: root
                .filter(|r| !r.as_os_str().is_empty())
                .map(|r| absolutize(r).to_string_lossy().to_lowercase()),
        }
    }

    /// Strict rule: entry script on the command line plus token, marker or root.
    pub fn matches_strictly(&self, cmdline: &str, exe: &str, cwd: &str) -> bool {
        let (cmdline, exe, cwd) = (cmdline.to_lowercase(), exe.to_lowercase(), cwd.to_lowercase());
        if !cmdline.contains(&self.entry_script) {
            return false;
        }
        cmdline.contains(&self.app_token)
            || cwd.contains(&self.app_token)
            || cmdline.contains(&self.build_marker)
            || self
                .root
                .as_deref()
                .is_some_and(|root| {
                    cmdline.contains(root) || cwd.starts_with(root) || exe.starts_with(root)
                })
    }

    /// Loose rule: strict match, or the app token anywhere in what we can see.
    pub fn matches(&self, cmdline: &str, exe: &str, cwd: &str) -> bool {
        self.matches_strictly(cmdline, exe, cwd)
            || [cmdline, exe, cwd]
                .iter()
                .any(|field| field.to_lowercase().contains(&self.app_token))
    }

    /// Match raw output of the privileged query tool.
    pub fn matches_query_output(&self, output: &str) -> bool {
        let output = output.to_lowercase();
        if output.contains(&self.app_token) {
            return true;
        }
        if output.contains(&self.entry_script) && output.contains(&self.build_marker) {
            return true;
        }
        self.root.as_deref().is_some_and(|root| output.contains(root))
    }
}

pub trait Identify: Send + Sync {
    /// Whether `pid` looks like the managed application. False when unsure.
    fn is_managed(&self, pid: u32) -> bool;

    /// Every running process matching the strict signature, excluding ourselves.
    fn find_managed(&self) -> BTreeSet<u32>;
}

/// What the process table told us about one PID.
struct ProcessFacts {
    cmdline: String,
    exe: String,
    cwd: String,
}

enum Inspection {
    Facts(ProcessFacts),
    Gone,
    Unavailable,
}

/// Availability of the privileged query tool, probed once per session.
#[derive(Debug, Default)]
struct QueryTool {
    available: Option<bool>,
}

impl QueryTool {
    fn detect_once(&mut self, probe: impl FnOnce() -> bool) -> bool {
        if let Some(available) = self.available {
            return available;
        }
        let available = probe();
        if !available {
            log::info!("Process query tool unavailable, relying on the process table only");
        }
        self.available = Some(available);
        available
    }

    fn mark_missing(&mut self) {
        if self.available != Some(false) {
            log::info!("Process query tool not found, disabling it for this session");
        }
        self.available = Some(false);
    }
}

/// Signature together with the raw root it was built from.
struct CachedSignature {
    raw_root: String,
    signature: Signature,
}

/// Identifier backed by `sysinfo`, with `wmic` (Windows) or `ps` (Unix) as fallback.
pub struct ProcessIdentifier {
    signature: Mutex<CachedSignature>,
    config: Option<Arc<ConfigStore>>,
    system: Mutex<System>,
    query_tool: Mutex<QueryTool>,
    command_timeout: Duration,
}

impl ProcessIdentifier {
    /// Identifier with a signature that never changes.
    pub fn new(signature: Signature) -> Self {
        Self {
            signature: Mutex::new(CachedSignature {
                raw_root: String::new(),
                signature,
            }),
            config: None,
            system: Mutex::new(System::new()),
            query_tool: Mutex::new(QueryTool::default()),
            command_timeout: OS_COMMAND_TIMEOUT,
        }
    }

    /// Identifier that follows `paths.comfyui_root` as the config changes.
    pub fn from_config(config: Arc<ConfigStore>) -> Self {
        Self {
            config: Some(config),
            ..Self::new(Signature::new(None))
        }
    }

    /// Current signature, rebuilt when the configured root has moved.
    pub fn signature(&self) -> Signature {
        let mut cached = self.signature.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(config) = &self.config {
            let raw_root = configured_root(config);
            if raw_root != cached.raw_root {
                log::debug!("Application root changed to {raw_root:?}");
                cached.signature = Signature::new(Some(Path::new(&raw_root)));
                cached.raw_root = raw_root;
            }
        }
        cached.signature.clone()
    }

    fn inspect(&self, pid: u32) -> Inspection {
        let mut system = self.system.lock().unwrap_or_else(|e| e.into_inner());
        let target = Pid::from_u32(pid);
        system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[target]),
            true,
            ProcessRefreshKind::everything(),
        );

        let Some(process) = system.process(target) else {
            return Inspection::Gone;
        };
        let facts = facts_of(process);
        // Without privileges the table hands back a process with nothing filled in.
        if facts.cmdline.is_empty() && facts.exe.is_empty() && facts.cwd.is_empty() {
            return Inspection::Unavailable;
        }
        Inspection::Facts(facts)
    }

    fn query_with_tool(&self, pid: u32) -> bool {
        let mut tool = self.query_tool.lock().unwrap_or_else(|e| e.into_inner());
        let timeout = self.command_timeout;
        if !tool.detect_once(|| query_tool_present(timeout)) {
            return false;
        }

        match query_process(pid, self.command_timeout) {
            Ok(output) => self.signature().matches_query_output(&output),
            Err(ProbeError::ToolMissing(_)) => {
                tool.mark_missing();
                false
            }
            Err(e) => {
                log::debug!("Process query for PID {pid}: {e}");
                false
            }
        }
    }
}

impl Identify for ProcessIdentifier {
    fn is_managed(&self, pid: u32) -> bool {
        match self.inspect(pid) {
            Inspection::Facts(facts) => {
                self.signature()
                    .matches(&facts.cmdline, &facts.exe, &facts.cwd)
            }
            Inspection::Gone => false,
            Inspection::Unavailable => self.query_with_tool(pid),
        }
    }

    fn find_managed(&self) -> BTreeSet<u32> {
        let signature = self.signature();
        let mut system = self.system.lock().unwrap_or_else(|e| e.into_inner());
        system.refresh_processes_specifics(
            ProcessesToUpdate::All,
            true,
            ProcessRefreshKind::everything(),
        );

        let own_pid = std::process::id();
        system
            .processes()
            .iter()
            .filter(|(pid, _)| pid.as_u32() != own_pid)
            .filter(|(_, process)| {
                let facts = facts_of(process);
                signature.matches_strictly(&facts.cmdline, &facts.exe, &facts.cwd)
            })
            .map(|(pid, _)| pid.as_u32())
            .collect()
    }
}

fn configured_root(config: &ConfigStore) -> String {
    config.get_str(ROOT_KEY, "").trim().to_string()
}

fn facts_of(process: &sysinfo::Process) -> ProcessFacts {
    let cmdline = process
        .cmd()
        .iter()
        .map(|part| part.to_string_lossy())
        .collect::<Vec<_>>()
        .join(" ");
    let path_text = |p: Option<&Path>| p.map(|p| p.to_string_lossy().into_owned()).unwrap_or_default();
    ProcessFacts {
        cmdline,
        exe: path_text(process.exe()),
        cwd: path_text(process.cwd()),
    }
}

#[cfg(target_os = "windows")]
fn query_tool_present(timeout: Duration) -> bool {
    !matches!(
        run_captured("wmic", &["os", "get", "Caption"], timeout),
        Err(ProbeError::ToolMissing(_))
    )
}

#[cfg(not(target_os = "windows"))]
fn query_tool_present(timeout: Duration) -> bool {
    let own_pid = std::process::id().to_string();
    !matches!(
        run_captured("ps", &["-o", "pid=", "-p", &own_pid], timeout),
        Err(ProbeError::ToolMissing(_))
    )
}

#[cfg(target_os = "windows")]
fn query_process(pid: u32, timeout: Duration) -> Result<String, ProbeError> {
    let filter = format!("ProcessId={pid}");
    run_captured(
        "wmic",
        &[
            "process",
            "where",
            &filter,
            "get",
            "CommandLine,ExecutablePath",
            "/format:list",
        ],
        timeout,
    )
}

#[cfg(not(target_os = "windows"))]
fn query_process(pid: u32, timeout: Duration) -> Result<String, ProbeError> {
    let pid = pid.to_string();
    run_captured("ps", &["-ww", "-o", "args=", "-p", &pid], timeout)
}
