//! Process lifecycle and liveness detection for the managed application.

mod child;
mod command;
mod control;
mod health;
mod identify;
mod os_cmd;
mod probe;
mod supervisor;

use std::time::Duration;

pub use child::{ManagedChild, ProcessSpawner, Spawn};
pub use command::{
    browser_policy, check_interpreter, configured_port, split_extra_args, BrowserPolicy,
    CommandBuilder, LaunchSpec,
};
pub use control::{force_kill, GracefulThenForce, KillStrategy, NativeForceKill, Terminate, Terminator};
pub use health::{fetch_system_stats, stats_client, SystemStats};
pub use identify::{Identify, ProcessIdentifier, Signature};
#[cfg(target_os = "windows")]
pub(crate) use os_cmd::hide_console;
pub use probe::{parse_netstat_pids, PortProbe, SystemProbe};
pub use supervisor::{
    ProcessSupervisor, Services, StatusReport, StopOutcome, SupervisorTimings, ToggleOutcome,
};

/// Port ComfyUI listens on unless configured otherwise. Never passed explicitly.
pub const DEFAULT_PORT: u16 = 8188;

/// Loopback connect timeout for the fast reachability check.
const CONNECT_TIMEOUT: Duration = Duration::from_millis(400);

/// Upper bound for netstat/lsof/wmic/ps invocations.
const OS_COMMAND_TIMEOUT: Duration = Duration::from_secs(10);

/// Timeout for graceful shutdown before force killing.
const GRACEFUL_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(3);

/// Timeout for `<python> --version`.
const INTERPRETER_CHECK_TIMEOUT: Duration = Duration::from_secs(10);

/// Runtime monitor tick interval.
const MONITOR_INTERVAL: Duration = Duration::from_secs(2);

/// Delay after spawn before checking for a crash on launch.
const SETTLE_DELAY: Duration = Duration::from_secs(2);

/// How long to wait for the web UI before giving up on opening the browser.
const BROWSER_POLL_TIMEOUT: Duration = Duration::from_secs(120);

const BROWSER_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Local web UI address for `port`.
pub fn web_ui_url(port: u16) -> String {
    format!("http://127.0.0.1:{port}/")
}
