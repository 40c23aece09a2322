//! Owner of the managed process handle and the start/stop state machine.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::child::{ManagedChild, ProcessSpawner, Spawn};
use super::command::{browser_policy, configured_port, BrowserPolicy, CommandBuilder, LaunchSpec};
use super::control::{Terminate, Terminator};
use super::identify::{Identify, ProcessIdentifier};
use super::probe::{PortProbe, SystemProbe};
use super::{
    web_ui_url, BROWSER_POLL_INTERVAL, BROWSER_POLL_TIMEOUT, MONITOR_INTERVAL, SETTLE_DELAY,
};
use crate::config::ConfigStore;
use crate::error::{AppError, ErrorKind, Result};
use crate::ui::{
    BrowserOpener, FixedChoice, OccupiedChoice, OccupiedPrompt, SystemBrowser, UiEvent, UiSender,
};
use crate::version::{ConfiguredGit, VersionControl};

/// Collaborators the supervisor needs, and nothing else.
#[derive(Clone)]
pub struct Services {
    pub config: Arc<ConfigStore>,
    pub version: Arc<dyn VersionControl>,
    pub probe: Arc<dyn PortProbe>,
    pub identifier: Arc<dyn Identify>,
    pub terminator: Arc<dyn Terminate>,
    pub spawner: Arc<dyn Spawn>,
    pub prompt: Arc<dyn OccupiedPrompt>,
    pub browser: Arc<dyn BrowserOpener>,
}

impl Services {
    /// Real OS-backed collaborators. The occupied-port prompt defaults to cancel.
    pub fn system(config: Arc<ConfigStore>) -> Self {
        let version = ConfiguredGit::from_config(&config);
        Self {
            version: Arc::new(version),
            probe: Arc::new(SystemProbe::new()),
            identifier: Arc::new(ProcessIdentifier::from_config(Arc::clone(&config))),
            terminator: Arc::new(Terminator::system()),
            spawner: Arc::new(ProcessSpawner),
            prompt: Arc::new(FixedChoice(OccupiedChoice::Cancel)),
            browser: Arc::new(SystemBrowser),
            config,
        }
    }

    pub fn with_prompt(mut self, prompt: Arc<dyn OccupiedPrompt>) -> Self {
        self.prompt = prompt;
        self
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SupervisorTimings {
    pub settle: Duration,
    pub monitor_interval: Duration,
    pub browser_poll_timeout: Duration,
    pub browser_poll_interval: Duration,
}

impl Default for SupervisorTimings {
    fn default() -> Self {
        Self {
            settle: SETTLE_DELAY,
            monitor_interval: MONITOR_INTERVAL,
            browser_poll_timeout: BROWSER_POLL_TIMEOUT,
            browser_poll_interval: BROWSER_POLL_INTERVAL,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StopOutcome {
    /// Whether a termination signal reached at least one process.
    pub killed: bool,
    pub pids: BTreeSet<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToggleOutcome {
    /// A start was already in flight.
    Ignored,
    Started { pid: u32 },
    Stopped(StopOutcome),
    OpenedExisting,
    Cancelled,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub port: u16,
    pub reachable: bool,
    pub owned_pid: Option<u32>,
    pub port_pids: BTreeSet<u32>,
    pub managed_pids: BTreeSet<u32>,
}

enum HandleStatus {
    Empty,
    Alive(u32),
    Exited { pid: u32, code: Option<i32> },
}

/// Clears the launching flag however the start attempt ends.
struct LaunchGuard<'a>(&'a AtomicBool);

impl<'a> LaunchGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for LaunchGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Run a blocking probe on the blocking pool, falling back if the worker panics.
async fn off_thread<T, F>(fallback: T, f: F) -> T
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(value) => value,
        Err(e) => {
            log::error!("Background worker failed: {e}");
            fallback
        }
    }
}

fn start_failure_text(err: &AppError) -> String {
    match err.kind() {
        ErrorKind::FastCrash => {
            format!("进程退出 (exit code: {})", err.payload("exit_code").unwrap_or("unknown"))
        }
        _ => err.to_string(),
    }
}

/// Reconciles the owned handle, the process table and port occupancy into one state.
///
/// All UI effects go out as [`UiEvent`]s; nothing here touches the front end.
pub struct ProcessSupervisor {
    services: Services,
    timings: SupervisorTimings,
    handle: Mutex<Option<Box<dyn ManagedChild>>>,
    launching: AtomicBool,
    shutdown: AtomicBool,
    /// Bumped on every successful start; stale browser watchers compare against it.
    launches: AtomicU64,
    ui: UiSender,
}

impl ProcessSupervisor {
    pub fn new(services: Services, ui: UiSender) -> Self {
        Self::with_timings(services, ui, SupervisorTimings::default())
    }

    pub fn with_timings(services: Services, ui: UiSender, timings: SupervisorTimings) -> Self {
        Self {
            services,
            timings,
            handle: Mutex::new(None),
            launching: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
            launches: AtomicU64::new(0),
            ui,
        }
    }

    pub fn port(&self) -> u16 {
        configured_port(&self.services.config)
    }

    pub fn is_launching(&self) -> bool {
        self.launching.load(Ordering::Acquire)
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// PID of the owned process, if it is still alive.
    pub fn owned_pid(&self) -> Option<u32> {
        match self.poll_handle() {
            HandleStatus::Alive(pid) => Some(pid),
            HandleStatus::Exited { pid, code } => {
                log::info!("ComfyUI process {pid} exited with {code:?}");
                self.post(UiEvent::ProcessExited(code));
                None
            }
            HandleStatus::Empty => None,
        }
    }

    fn post(&self, event: UiEvent) {
        if self.ui.send(event).is_err() {
            log::debug!("UI pump is gone, dropping event");
        }
    }

    fn poll_handle(&self) -> HandleStatus {
        let mut slot = self.handle.lock().unwrap_or_else(|e| e.into_inner());
        let Some(child) = slot.as_mut() else {
            return HandleStatus::Empty;
        };
        let pid = child.pid();
        match child.poll() {
            None => HandleStatus::Alive(pid),
            Some(code) => {
                *slot = None;
                HandleStatus::Exited { pid, code }
            }
        }
    }

    fn install_handle(&self, child: Box<dyn ManagedChild>) {
        let mut slot = self.handle.lock().unwrap_or_else(|e| e.into_inner());
        *slot = Some(child);
    }

    fn clear_handle(&self, expected_pid: u32) {
        let mut slot = self.handle.lock().unwrap_or_else(|e| e.into_inner());
        if slot.as_ref().is_some_and(|child| child.pid() == expected_pid) {
            *slot = None;
        }
    }

    async fn reachable(&self, port: u16) -> bool {
        let probe = Arc::clone(&self.services.probe);
        off_thread(false, move || probe.is_reachable(port)).await
    }

    async fn port_pids(&self, port: u16) -> BTreeSet<u32> {
        let probe = Arc::clone(&self.services.probe);
        off_thread(BTreeSet::new(), move || probe.find_pids_by_port(port)).await
    }

    /// Owned handle first, then the port.
    pub async fn is_running(&self) -> bool {
        self.owned_pid().is_some() || self.reachable(self.port()).await
    }

    /// Stop if anything is running, otherwise start (asking first if the port is taken).
    pub async fn toggle(self: &Arc<Self>) -> Result<ToggleOutcome> {
        if self.is_launching() {
            log::info!("Start already in progress, ignoring toggle");
            return Ok(ToggleOutcome::Ignored);
        }

        if self.is_running().await {
            return self.stop(true).await.map(ToggleOutcome::Stopped);
        }
        self.start_checked().await
    }

    /// Start, unless the port is already held; then the prompt decides.
    pub async fn start_checked(self: &Arc<Self>) -> Result<ToggleOutcome> {
        let port = self.port();
        let pids = self.port_pids(port).await;
        if pids.is_empty() {
            return self.start().await.map(|pid| ToggleOutcome::Started { pid });
        }

        log::info!("Port {port} is already in use by {pids:?}");
        let prompt = Arc::clone(&self.services.prompt);
        let choice = off_thread(OccupiedChoice::Cancel, move || prompt.ask(port, &pids)).await;

        match choice {
            OccupiedChoice::OpenExisting => {
                let url = web_ui_url(port);
                if let Err(e) = self.services.browser.open(&url) {
                    log::warn!("{e}");
                    self.post(UiEvent::Notice(format!("请在浏览器中打开 {url}")));
                }
                self.post(UiEvent::ReachabilityChanged(true));
                Ok(ToggleOutcome::OpenedExisting)
            }
            OccupiedChoice::Restart => {
                self.stop(true).await?;
                self.start().await.map(|pid| ToggleOutcome::Started { pid })
            }
            OccupiedChoice::Cancel => {
                log::info!("Start cancelled, port {port} left to its current owner");
                Ok(ToggleOutcome::Cancelled)
            }
        }
    }

    pub async fn start(self: &Arc<Self>) -> Result<u32> {
        let Some(_guard) = LaunchGuard::acquire(&self.launching) else {
            log::info!("Start already in progress");
            return Err(AppError::already_starting());
        };

        if let Some(pid) = self.owned_pid() {
            log::warn!("Refusing to start: owned process {pid} is still running");
            self.post(UiEvent::Notice(format!("ComfyUI 已在运行 (PID {pid})")));
            return Err(AppError::instance_running());
        }

        self.post(UiEvent::Starting);
        match self.launch().await {
            Ok((pid, spec)) => {
                let generation = self.launches.fetch_add(1, Ordering::AcqRel) + 1;
                log::info!("ComfyUI started (pid: {}, port: {})", pid, spec.port);
                self.post(UiEvent::ProcessStarted { pid });
                if browser_policy(&self.services.config) == BrowserPolicy::FirstReachable {
                    self.watch_for_browser(spec.port, generation);
                }
                Ok(pid)
            }
            Err(e) => {
                log::error!("Failed to start ComfyUI: {e}");
                self.post(UiEvent::StartFailed(start_failure_text(&e)));
                Err(e)
            }
        }
    }

    /// build -> validate -> spawn -> settle check, strictly in order.
    async fn launch(&self) -> Result<(u32, LaunchSpec)> {
        let spec = CommandBuilder::new(&self.services.config, self.services.version.as_ref())
            .build()?;

        if !spec.interpreter.is_file() {
            return Err(AppError::precondition(format!(
                "Interpreter not found: {}",
                spec.interpreter.display()
            )));
        }
        if !spec.entry_script.is_file() {
            return Err(AppError::precondition(format!(
                "Entry script not found: {}",
                spec.entry_script.display()
            )));
        }

        let spawner = Arc::clone(&self.services.spawner);
        let check_spec = spec.clone();
        off_thread(
            Err(AppError::other("Interpreter check worker failed")),
            move || spawner.check_interpreter(&check_spec),
        )
        .await?;

        let child = self.services.spawner.spawn(&spec)?;
        let pid = child.pid();
        self.install_handle(child);

        tokio::time::sleep(self.timings.settle).await;

        match self.poll_handle() {
            HandleStatus::Alive(_) => Ok((pid, spec)),
            HandleStatus::Exited { code, .. } => {
                log::error!("ComfyUI exited during startup (pid: {pid}, code: {code:?})");
                Err(AppError::fast_crash(code))
            }
            HandleStatus::Empty => Err(AppError::process("Launch was interrupted by a stop")),
        }
    }

    fn watch_for_browser(self: &Arc<Self>, port: u16, generation: u64) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let deadline = Instant::now() + this.timings.browser_poll_timeout;
            while Instant::now() < deadline {
                if this.is_shutting_down() || this.launches.load(Ordering::Acquire) != generation {
                    return;
                }
                if this.reachable(port).await {
                    let url = web_ui_url(port);
                    log::info!("Web UI reachable, opening {url}");
                    if let Err(e) = this.services.browser.open(&url) {
                        log::warn!("{e}");
                    }
                    return;
                }
                tokio::time::sleep(this.timings.browser_poll_interval).await;
            }
            log::warn!(
                "Web UI on port {port} not reachable after {:?}, not opening browser",
                this.timings.browser_poll_timeout
            );
        });
    }

    /// Stop the owned process, or anything that looks like the managed app.
    ///
    /// Safe to call when nothing runs. Termination errors are returned only when
    /// `user_initiated`; internal sweeps just log them. Whatever still holds the
    /// port after the identified targets are gone is killed as a last resort.
    pub async fn stop(&self, user_initiated: bool) -> Result<StopOutcome> {
        self.post(UiEvent::Stopping);
        let port = self.port();
        let own_pid = std::process::id();
        let owned = self.owned_pid();
        let port_pids = self.port_pids(port).await;

        let mut targets = BTreeSet::new();
        if let Some(pid) = owned {
            targets.insert(pid);
        } else {
            let identifier = Arc::clone(&self.services.identifier);
            let swept = off_thread(BTreeSet::new(), move || identifier.find_managed()).await;
            for pid in &swept {
                log::warn!("Stopping managed-looking process {pid}");
            }
            targets.extend(swept);
        }

        if !port_pids.is_empty() {
            let identifier = Arc::clone(&self.services.identifier);
            let candidates = port_pids.clone();
            let identified = off_thread(BTreeSet::new(), move || {
                candidates
                    .into_iter()
                    .filter(|pid| identifier.is_managed(*pid))
                    .collect::<BTreeSet<u32>>()
            })
            .await;
            targets.extend(identified);
        }
        targets.remove(&own_pid);

        let mut killed = false;
        let mut failure = None;
        if !targets.is_empty() {
            match self.terminate(&targets).await {
                Ok(()) => {
                    killed = true;
                    if let Some(pid) = owned {
                        self.clear_handle(pid);
                    }
                }
                Err(e) => failure = Some(e),
            }
        }

        let occupants = if targets.is_empty() {
            port_pids
        } else {
            self.port_pids(port).await
        };
        let leftovers: BTreeSet<u32> = occupants
            .into_iter()
            .filter(|pid| *pid != own_pid && !targets.contains(pid))
            .collect();
        if !leftovers.is_empty() {
            log::warn!(
                "Port {port} is still held by unidentified {leftovers:?}, killing as last resort"
            );
            match self.terminate(&leftovers).await {
                Ok(()) => killed = true,
                Err(e) => {
                    failure.get_or_insert(e);
                }
            }
            targets.extend(leftovers);
        }

        if targets.is_empty() {
            log::info!("Nothing to stop on port {port}");
        }

        if let Some(e) = failure {
            if user_initiated {
                log::error!("Failed to stop ComfyUI: {e}");
                self.post(UiEvent::StopFailed(e.to_string()));
                self.refresh().await;
                return Err(e);
            }
            log::warn!("Best-effort stop failed: {e}");
        }

        let reachable = self.reachable(port).await || self.owned_pid().is_some();
        self.post(UiEvent::Stopped { killed, reachable });
        Ok(StopOutcome {
            killed,
            pids: targets,
        })
    }

    async fn terminate(&self, pids: &BTreeSet<u32>) -> Result<()> {
        let terminator = Arc::clone(&self.services.terminator);
        let victims = pids.clone();
        off_thread(
            Err(AppError::other("Termination worker failed")),
            move || terminator.kill(&victims),
        )
        .await
    }

    /// Re-derive the running state from the handle and a fresh probe.
    pub async fn refresh(&self) -> bool {
        match self.poll_handle() {
            HandleStatus::Exited { pid, code } => {
                log::info!("ComfyUI process {pid} exited with {code:?}");
                self.on_process_ended(code).await
            }
            HandleStatus::Alive(_) => {
                self.post(UiEvent::ReachabilityChanged(true));
                true
            }
            HandleStatus::Empty => {
                let reachable = self.reachable(self.port()).await;
                self.post(UiEvent::ReachabilityChanged(reachable));
                reachable
            }
        }
    }

    /// The owned process has exited. Returns whether the port is still served.
    pub async fn on_process_ended(&self, code: Option<i32>) -> bool {
        {
            let mut slot = self.handle.lock().unwrap_or_else(|e| e.into_inner());
            *slot = None;
        }
        self.post(UiEvent::ProcessExited(code));

        let port = self.port();
        let reachable = self.reachable(port).await;
        if reachable {
            log::info!("Port {port} is still served by another process");
        }
        self.post(UiEvent::ReachabilityChanged(reachable));
        reachable
    }

    pub async fn status(&self) -> StatusReport {
        let port = self.port();
        let owned_pid = self.owned_pid();
        let reachable = self.reachable(port).await;
        let port_pids = self.port_pids(port).await;
        let identifier = Arc::clone(&self.services.identifier);
        let managed_pids = off_thread(BTreeSet::new(), move || identifier.find_managed()).await;
        StatusReport {
            port,
            reachable,
            owned_pid,
            port_pids,
            managed_pids,
        }
    }

    /// Periodic refresh until [`shutdown`](Self::shutdown) is requested.
    pub fn start_monitor(self: &Arc<Self>) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(this.timings.monitor_interval);
            loop {
                interval.tick().await;
                if this.is_shutting_down() {
                    break;
                }
                this.refresh().await;
            }
            log::debug!("Runtime monitor stopped");
        })
    }

    /// Stop background loops; optionally stop the managed process as a best effort.
    pub async fn shutdown(&self, stop_instance: bool) {
        self.shutdown.store(true, Ordering::Release);
        if stop_instance {
            if let Err(e) = self.stop(false).await {
                log::warn!("Stop during shutdown failed: {e}");
            }
        }
    }

    pub fn spawn_toggle(self: &Arc<Self>) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = this.toggle().await {
                log::warn!("Toggle failed: {e}");
            }
        })
    }

    pub fn spawn_stop(self: &Arc<Self>) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = this.stop(true).await {
                log::warn!("Stop failed: {e}");
            }
        })
    }

    pub fn spawn_refresh(self: &Arc<Self>) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            this.refresh().await;
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::default_table;
    use crate::ui::{channel, ButtonState, UiPump};
    use crate::ui::tests::RecordingSink;
    use std::path::PathBuf;
    use std::sync::atomic::AtomicUsize;

    type ChildState = Arc<Mutex<Option<Option<i32>>>>;

    #[derive(Default)]
    struct FakeProbe {
        reachable: AtomicBool,
        pids: Mutex<BTreeSet<u32>>,
        /// Reachability checks left that blow up instead of answering.
        failing_checks: AtomicUsize,
        checks: AtomicUsize,
    }

    impl FakeProbe {
        fn occupy(&self, pids: &[u32]) {
            *self.pids.lock().unwrap() = pids.iter().copied().collect();
        }

        fn release(&self) {
            self.reachable.store(false, Ordering::SeqCst);
            self.pids.lock().unwrap().clear();
        }
    }

    impl PortProbe for FakeProbe {
        fn is_reachable(&self, _port: u16) -> bool {
            self.checks.fetch_add(1, Ordering::SeqCst);
            let failing = self
                .failing_checks
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
            if failing.is_ok() {
                std::panic::panic_any("socket table unavailable");
            }
            self.reachable.load(Ordering::SeqCst)
        }

        fn find_pids_by_port(&self, _port: u16) -> BTreeSet<u32> {
            self.pids.lock().unwrap().clone()
        }
    }

    #[derive(Default)]
    struct FakeIdentifier {
        strict: Mutex<BTreeSet<u32>>,
        loose: Mutex<BTreeSet<u32>>,
    }

    impl Identify for FakeIdentifier {
        fn is_managed(&self, pid: u32) -> bool {
            self.loose.lock().unwrap().contains(&pid)
        }

        fn find_managed(&self) -> BTreeSet<u32> {
            self.strict.lock().unwrap().clone()
        }
    }

    struct FakeTerminator {
        probe: Arc<FakeProbe>,
        identifier: Arc<FakeIdentifier>,
        child: ChildState,
        fail: AtomicBool,
        /// When set, only killing this PID frees the port.
        port_holder: Mutex<Option<u32>>,
        calls: Mutex<Vec<BTreeSet<u32>>>,
    }

    impl Terminate for FakeTerminator {
        fn kill(&self, pids: &BTreeSet<u32>) -> Result<()> {
            self.calls.lock().unwrap().push(pids.clone());
            if self.fail.load(Ordering::SeqCst) {
                let pids: Vec<u32> = pids.iter().copied().collect();
                return Err(AppError::termination_failed(&pids));
            }
            let holder = *self.port_holder.lock().unwrap();
            if holder.is_none_or(|pid| pids.contains(&pid)) {
                self.probe.release();
            }
            self.identifier.strict.lock().unwrap().clear();
            let mut child = self.child.lock().unwrap();
            if child.is_none() {
                *child = Some(None);
            }
            Ok(())
        }
    }

    struct FakeChild {
        pid: u32,
        state: ChildState,
    }

    impl ManagedChild for FakeChild {
        fn pid(&self) -> u32 {
            self.pid
        }

        fn poll(&mut self) -> Option<Option<i32>> {
            *self.state.lock().unwrap()
        }
    }

    struct FakeSpawner {
        child: ChildState,
        exit_on_spawn: Option<Option<i32>>,
        check_delay: Duration,
        spawned: AtomicUsize,
    }

    impl Spawn for FakeSpawner {
        fn check_interpreter(&self, _spec: &LaunchSpec) -> Result<()> {
            std::thread::sleep(self.check_delay);
            Ok(())
        }

        fn spawn(&self, _spec: &LaunchSpec) -> Result<Box<dyn ManagedChild>> {
            self.spawned.fetch_add(1, Ordering::SeqCst);
            *self.child.lock().unwrap() = self.exit_on_spawn;
            Ok(Box::new(FakeChild {
                pid: 4242,
                state: Arc::clone(&self.child),
            }))
        }
    }

    struct FakePrompt {
        choice: OccupiedChoice,
        asked: AtomicUsize,
    }

    impl OccupiedPrompt for FakePrompt {
        fn ask(&self, _port: u16, _pids: &BTreeSet<u32>) -> OccupiedChoice {
            self.asked.fetch_add(1, Ordering::SeqCst);
            self.choice
        }
    }

    #[derive(Default)]
    struct FakeBrowser {
        opened: Mutex<Vec<String>>,
    }

    impl BrowserOpener for FakeBrowser {
        fn open(&self, url: &str) -> Result<()> {
            self.opened.lock().unwrap().push(url.to_string());
            Ok(())
        }
    }

    struct Harness {
        _dir: tempfile::TempDir,
        root: PathBuf,
        sup: Arc<ProcessSupervisor>,
        pump: UiPump,
        sink: RecordingSink,
        probe: Arc<FakeProbe>,
        identifier: Arc<FakeIdentifier>,
        terminator: Arc<FakeTerminator>,
        spawner: Arc<FakeSpawner>,
        prompt: Arc<FakePrompt>,
        browser: Arc<FakeBrowser>,
        child: ChildState,
    }

    impl Harness {
        fn state(&mut self) -> ButtonState {
            self.pump.drain(&mut self.sink);
            self.pump.state()
        }

        fn spawned(&self) -> usize {
            self.spawner.spawned.load(Ordering::SeqCst)
        }

        fn kills(&self) -> Vec<BTreeSet<u32>> {
            self.terminator.calls.lock().unwrap().clone()
        }

        fn exit_child(&self, code: Option<i32>) {
            *self.child.lock().unwrap() = Some(code);
        }
    }

    struct Setup {
        choice: OccupiedChoice,
        exit_on_spawn: Option<Option<i32>>,
        check_delay: Duration,
        open_browser: &'static str,
    }

    impl Default for Setup {
        fn default() -> Self {
            Self {
                choice: OccupiedChoice::Cancel,
                exit_on_spawn: None,
                check_delay: Duration::ZERO,
                open_browser: "never",
            }
        }
    }

    fn harness(setup: Setup) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("ComfyUI");
        std::fs::create_dir_all(&root).unwrap();
        std::fs::write(root.join("main.py"), "").unwrap();
        let python = dir.path().join("python3");
        std::fs::write(&python, "").unwrap();

        let config = ConfigStore::in_memory(default_table());
        config
            .set("paths.comfyui_root", root.to_string_lossy().into_owned())
            .unwrap();
        config
            .set("paths.python_path", python.to_string_lossy().into_owned())
            .unwrap();
        config
            .set("launch_options.open_browser", setup.open_browser)
            .unwrap();
        let config = Arc::new(config);

        let child: ChildState = Arc::new(Mutex::new(None));
        let probe = Arc::new(FakeProbe::default());
        let identifier = Arc::new(FakeIdentifier::default());
        let terminator = Arc::new(FakeTerminator {
            probe: Arc::clone(&probe),
            identifier: Arc::clone(&identifier),
            child: Arc::clone(&child),
            fail: AtomicBool::new(false),
            port_holder: Mutex::new(None),
            calls: Mutex::new(Vec::new()),
        });
        let spawner = Arc::new(FakeSpawner {
            child: Arc::clone(&child),
            exit_on_spawn: setup.exit_on_spawn,
            check_delay: setup.check_delay,
            spawned: AtomicUsize::new(0),
        });
        let prompt = Arc::new(FakePrompt {
            choice: setup.choice,
            asked: AtomicUsize::new(0),
        });
        let browser = Arc::new(FakeBrowser::default());

        let services = Services {
            version: Arc::new(ConfiguredGit::from_config(&config)),
            config,
            probe: Arc::clone(&probe) as Arc<dyn PortProbe>,
            identifier: Arc::clone(&identifier) as Arc<dyn Identify>,
            terminator: Arc::clone(&terminator) as Arc<dyn Terminate>,
            spawner: Arc::clone(&spawner) as Arc<dyn Spawn>,
            prompt: Arc::clone(&prompt) as Arc<dyn OccupiedPrompt>,
            browser: Arc::clone(&browser) as Arc<dyn BrowserOpener>,
        };
        let timings = SupervisorTimings {
            settle: Duration::from_millis(30),
            monitor_interval: Duration::from_millis(20),
            browser_poll_timeout: Duration::from_secs(2),
            browser_poll_interval: Duration::from_millis(10),
        };
        let (tx, pump) = channel();
        Harness {
            _dir: dir,
            root,
            sup: Arc::new(ProcessSupervisor::with_timings(services, tx, timings)),
            pump,
            sink: RecordingSink::default(),
            probe,
            identifier,
            terminator,
            spawner,
            prompt,
            browser,
            child,
        }
    }

    #[tokio::test]
    async fn second_stop_after_exit_is_a_no_op() {
        let mut h = harness(Setup::default());
        h.sup.start().await.unwrap();
        assert_eq!(h.state(), ButtonState::Running);

        let first = h.sup.stop(true).await.unwrap();
        assert!(first.killed);
        assert_eq!(first.pids, BTreeSet::from([4242]));

        let second = h.sup.stop(true).await.unwrap();
        assert!(!second.killed);
        assert_eq!(h.kills().len(), 1);
        assert_eq!(h.state(), ButtonState::Idle);
    }

    #[tokio::test]
    async fn occupied_port_never_spawns_without_confirmation() {
        let mut h = harness(Setup::default());
        h.probe.occupy(&[999]);

        let outcome = h.sup.toggle().await.unwrap();
        assert_eq!(outcome, ToggleOutcome::Cancelled);
        assert_eq!(h.prompt.asked.load(Ordering::SeqCst), 1);
        assert_eq!(h.spawned(), 0);
        assert_eq!(h.state(), ButtonState::Idle);
    }

    #[tokio::test]
    async fn open_existing_points_browser_at_occupant() {
        let mut h = harness(Setup {
            choice: OccupiedChoice::OpenExisting,
            ..Setup::default()
        });
        h.probe.occupy(&[999]);

        let outcome = h.sup.start_checked().await.unwrap();
        assert_eq!(outcome, ToggleOutcome::OpenedExisting);
        assert_eq!(*h.browser.opened.lock().unwrap(), vec!["http://127.0.0.1:8188/"]);
        assert_eq!(h.spawned(), 0);
        assert_eq!(h.state(), ButtonState::Running);
    }

    #[tokio::test]
    async fn restart_stops_occupant_before_spawning() {
        let h = harness(Setup {
            choice: OccupiedChoice::Restart,
            ..Setup::default()
        });
        h.probe.occupy(&[999]);
        h.identifier.loose.lock().unwrap().insert(999);

        let outcome = h.sup.start_checked().await.unwrap();
        assert_eq!(outcome, ToggleOutcome::Started { pid: 4242 });
        assert_eq!(h.kills(), vec![BTreeSet::from([999])]);
        assert_eq!(h.spawned(), 1);
    }

    #[tokio::test]
    async fn fast_crash_is_reported_and_clears_handle() {
        let mut h = harness(Setup {
            exit_on_spawn: Some(Some(1)),
            ..Setup::default()
        });

        let err = h.sup.start().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::FastCrash);
        assert_eq!(err.payload("exit_code"), Some("1"));
        assert_eq!(h.sup.owned_pid(), None);
        assert!(!h.sup.is_launching());
        assert_eq!(h.state(), ButtonState::Idle);
        assert!(h.sink.notices.iter().any(|(_, m)| m.contains("进程退出")));
    }

    #[tokio::test]
    async fn exited_handle_goes_idle_when_port_is_free() {
        let mut h = harness(Setup::default());
        h.sup.start().await.unwrap();
        h.exit_child(Some(0));

        assert!(!h.sup.refresh().await);
        assert_eq!(h.sup.owned_pid(), None);
        assert_eq!(h.state(), ButtonState::Idle);
    }

    #[tokio::test]
    async fn exited_handle_stays_running_with_external_occupant() {
        let mut h = harness(Setup::default());
        h.sup.start().await.unwrap();
        h.exit_child(Some(0));
        h.probe.reachable.store(true, Ordering::SeqCst);

        assert!(h.sup.refresh().await);
        assert_eq!(h.sup.owned_pid(), None);
        assert_eq!(h.state(), ButtonState::Running);
    }

    #[tokio::test]
    async fn toggle_during_launch_is_ignored() {
        let h = harness(Setup {
            check_delay: Duration::from_millis(200),
            ..Setup::default()
        });
        let sup = Arc::clone(&h.sup);
        let pending = tokio::spawn(async move { sup.start().await });
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(h.sup.is_launching());
        assert_eq!(h.sup.toggle().await.unwrap(), ToggleOutcome::Ignored);
        assert_eq!(
            h.sup.start().await.unwrap_err().kind(),
            ErrorKind::AlreadyStarting
        );

        assert_eq!(pending.await.unwrap().unwrap(), 4242);
        assert!(!h.sup.is_launching());
        assert_eq!(h.spawned(), 1);
    }

    #[tokio::test]
    async fn live_handle_rejects_second_start() {
        let h = harness(Setup::default());
        h.sup.start().await.unwrap();
        let err = h.sup.start().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InstanceRunning);
        assert_eq!(h.spawned(), 1);
    }

    #[tokio::test]
    async fn missing_entry_script_is_precondition_failure() {
        let h = harness(Setup::default());
        std::fs::remove_file(h.root.join("main.py")).unwrap();
        let err = h.sup.start().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PreconditionFailed);
        assert_eq!(h.spawned(), 0);
    }

    #[tokio::test]
    async fn sweep_without_handle_targets_identified_processes() {
        let h = harness(Setup::default());
        h.identifier.strict.lock().unwrap().extend([11, 12]);
        h.probe.occupy(&[13]);

        let outcome = h.sup.stop(true).await.unwrap();
        assert!(outcome.killed);
        assert_eq!(h.kills(), vec![BTreeSet::from([11, 12])]);
    }

    #[tokio::test]
    async fn unidentified_port_occupant_is_killed_as_last_resort() {
        let h = harness(Setup::default());
        h.probe.occupy(&[77]);

        let outcome = h.sup.stop(true).await.unwrap();
        assert!(outcome.killed);
        assert_eq!(outcome.pids, BTreeSet::from([77]));
    }

    #[tokio::test]
    async fn port_still_held_after_sweep_falls_back_to_occupant() {
        let mut h = harness(Setup::default());
        h.identifier.strict.lock().unwrap().insert(11);
        h.probe.occupy(&[13]);
        h.probe.reachable.store(true, Ordering::SeqCst);
        *h.terminator.port_holder.lock().unwrap() = Some(13);

        let outcome = h.sup.stop(true).await.unwrap();
        assert!(outcome.killed);
        assert_eq!(outcome.pids, BTreeSet::from([11, 13]));
        assert_eq!(h.kills(), vec![BTreeSet::from([11]), BTreeSet::from([13])]);
        assert_eq!(h.state(), ButtonState::Idle);
    }

    #[tokio::test]
    async fn monitor_refresh_does_not_interrupt_stop_state() {
        let mut h = harness(Setup::default());
        h.sup.start().await.unwrap();
        h.state();
        h.sup.post(UiEvent::Stopping);
        h.sup.refresh().await;
        assert_eq!(h.state(), ButtonState::Stopping);
    }

    #[tokio::test]
    async fn termination_failure_surfaces_only_when_user_initiated() {
        let mut h = harness(Setup::default());
        h.identifier.strict.lock().unwrap().insert(5);
        h.terminator.fail.store(true, Ordering::SeqCst);

        let err = h.sup.stop(true).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TerminationFailed);
        h.state();
        assert!(h.sink.notices.iter().any(|(_, m)| m.contains("停止失败")));

        let outcome = h.sup.stop(false).await.unwrap();
        assert!(!outcome.killed);
    }

    #[tokio::test]
    async fn browser_opens_once_when_first_reachable() {
        let h = harness(Setup {
            open_browser: "first_reachable",
            ..Setup::default()
        });
        h.sup.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(h.browser.opened.lock().unwrap().is_empty());

        h.probe.reachable.store(true, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(h.browser.opened.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn monitor_clears_exited_handle_and_ends_on_shutdown() {
        let mut h = harness(Setup::default());
        h.sup.start().await.unwrap();
        let monitor = h.sup.start_monitor();

        h.exit_child(Some(0));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(h.state(), ButtonState::Idle);

        h.sup.shutdown(false).await;
        tokio::time::timeout(Duration::from_secs(1), monitor)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn monitor_survives_failing_reachability_checks() {
        let mut h = harness(Setup::default());
        h.probe.reachable.store(true, Ordering::SeqCst);
        h.probe.failing_checks.store(3, Ordering::SeqCst);

        // Failed checks fall back to "not reachable".
        assert!(!h.sup.refresh().await);
        assert_eq!(h.state(), ButtonState::Idle);

        let monitor = h.sup.start_monitor();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!monitor.is_finished());
        assert_eq!(h.probe.failing_checks.load(Ordering::SeqCst), 0);
        assert!(h.probe.checks.load(Ordering::SeqCst) > 3);
        assert_eq!(h.state(), ButtonState::Running);

        h.sup.shutdown(false).await;
        tokio::time::timeout(Duration::from_secs(1), monitor)
            .await
            .unwrap()
            .unwrap();
    }
}
