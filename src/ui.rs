//! Boundary between the process core and whatever front end drives it.
//!
//! Background workers never touch the front end directly. They post
//! [`UiEvent`]s over a channel and a single [`UiPump`], living on the UI
//! thread, applies them to a [`UiSink`].

use std::collections::BTreeSet;
use std::process::Command;

use tokio::sync::mpsc;

use crate::error::{AppError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ButtonState {
    Idle,
    Starting,
    Running,
    Stopping,
}

impl ButtonState {
    pub fn name(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Idle => "一键启动",
            Self::Starting => "启动中…",
            Self::Running => "停止",
            Self::Stopping => "停止中…",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeLevel {
    Info,
    Warning,
    Error,
}

/// Messages posted from background work to the UI thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UiEvent {
    Starting,
    ProcessStarted { pid: u32 },
    StartFailed(String),
    Stopping,
    /// Stop finished; `reachable` is whether the port is still served.
    Stopped { killed: bool, reachable: bool },
    StopFailed(String),
    ProcessExited(Option<i32>),
    ReachabilityChanged(bool),
    Notice(String),
}

/// State and label sink of the front end.
pub trait UiSink: Send {
    fn set_state(&mut self, state: ButtonState);
    fn set_text(&mut self, text: &str);
    fn notify(&mut self, level: NoticeLevel, message: &str);
}

/// User's answer when the port is already held by another process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OccupiedChoice {
    OpenExisting,
    Restart,
    Cancel,
}

pub trait OccupiedPrompt: Send + Sync {
    fn ask(&self, port: u16, pids: &BTreeSet<u32>) -> OccupiedChoice;
}

/// Prompt that always gives the same answer, for headless use.
pub struct FixedChoice(pub OccupiedChoice);

impl OccupiedPrompt for FixedChoice {
    fn ask(&self, port: u16, pids: &BTreeSet<u32>) -> OccupiedChoice {
        log::info!("Port {port} is held by {pids:?}, answering {:?}", self.0);
        self.0
    }
}

pub trait BrowserOpener: Send + Sync {
    fn open(&self, url: &str) -> Result<()>;
}

/// Opens URLs with the platform's default handler.
pub struct SystemBrowser;

impl BrowserOpener for SystemBrowser {
    fn open(&self, url: &str) -> Result<()> {
        let mut cmd = browser_command(url);
        cmd.spawn()
            .map(|_| ())
            .map_err(|e| AppError::process(format!("Failed to open browser for {url}: {e}")))
    }
}

#[cfg(target_os = "windows")]
fn browser_command(url: &str) -> Command {
    let mut cmd = Command::new("cmd");
    cmd.args(["/C", "start", "", url]);
    crate::process::hide_console(&mut cmd);
    cmd
}

#[cfg(target_os = "macos")]
fn browser_command(url: &str) -> Command {
    let mut cmd = Command::new("open");
    cmd.arg(url);
    cmd
}

#[cfg(not(any(target_os = "windows", target_os = "macos")))]
fn browser_command(url: &str) -> Command {
    let mut cmd = Command::new("xdg-open");
    cmd.arg(url);
    cmd
}

pub type UiSender = mpsc::UnboundedSender<UiEvent>;

/// Create the channel background workers post into, and the pump that drains it.
pub fn channel() -> (UiSender, UiPump) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        tx,
        UiPump {
            rx,
            state: ButtonState::Idle,
        },
    )
}

/// Single consumer of [`UiEvent`]s; the only code that calls the sink.
pub struct UiPump {
    rx: mpsc::UnboundedReceiver<UiEvent>,
    state: ButtonState,
}

impl UiPump {
    pub fn state(&self) -> ButtonState {
        self.state
    }

    /// Apply everything queued so far. For front ends with their own event loop.
    pub fn drain(&mut self, sink: &mut dyn UiSink) -> usize {
        let mut applied = 0;
        while let Ok(event) = self.rx.try_recv() {
            self.apply(sink, event);
            applied += 1;
        }
        applied
    }

    /// Apply events until every sender is gone.
    pub async fn run(mut self, sink: &mut dyn UiSink) {
        while let Some(event) = self.rx.recv().await {
            self.apply(sink, event);
        }
    }

    pub fn apply(&mut self, sink: &mut dyn UiSink, event: UiEvent) {
        match event {
            UiEvent::Starting => self.transition(sink, ButtonState::Starting),
            UiEvent::ProcessStarted { pid } => {
                self.transition(sink, ButtonState::Running);
                sink.notify(NoticeLevel::Info, &format!("ComfyUI 已启动 (PID {pid})"));
            }
            UiEvent::StartFailed(reason) => {
                self.transition(sink, ButtonState::Idle);
                sink.notify(NoticeLevel::Error, &format!("启动失败: {reason}"));
            }
            UiEvent::Stopping => self.transition(sink, ButtonState::Stopping),
            UiEvent::Stopped { killed, reachable } => {
                self.transition(sink, Self::running_or_idle(reachable));
                if killed {
                    sink.notify(NoticeLevel::Info, "ComfyUI 已停止");
                }
            }
            UiEvent::StopFailed(reason) => {
                // Something survived; a refresh settles the real state.
                self.transition(sink, ButtonState::Running);
                sink.notify(NoticeLevel::Error, &format!("停止失败: {reason}"));
            }
            UiEvent::ProcessExited(code) => {
                let code = code.map_or_else(|| "signal".to_string(), |c| c.to_string());
                sink.notify(NoticeLevel::Warning, &format!("ComfyUI 进程已退出 ({code})"));
            }
            UiEvent::ReachabilityChanged(reachable) => {
                // A pending start or stop owns the button until it reports back.
                if matches!(self.state, ButtonState::Starting | ButtonState::Stopping) {
                    return;
                }
                self.transition(sink, Self::running_or_idle(reachable));
            }
            UiEvent::Notice(message) => sink.notify(NoticeLevel::Info, &message),
        }
    }

    fn running_or_idle(reachable: bool) -> ButtonState {
        if reachable {
            ButtonState::Running
        } else {
            ButtonState::Idle
        }
    }

    fn transition(&mut self, sink: &mut dyn UiSink, next: ButtonState) {
        if self.state == next {
            return;
        }
        self.state = next;
        sink.set_state(next);
        sink.set_text(next.label());
    }
}

/// Sink that reports through the log, for headless runs.
#[derive(Debug, Default)]
pub struct LogSink;

impl UiSink for LogSink {
    fn set_state(&mut self, state: ButtonState) {
        log::info!("State: {}", state.name());
    }

    fn set_text(&mut self, _text: &str) {}

    fn notify(&mut self, level: NoticeLevel, message: &str) {
        match level {
            NoticeLevel::Info => log::info!("{message}"),
            NoticeLevel::Warning => log::warn!("{message}"),
            NoticeLevel::Error => log::error!("{message}"),
        }
    }
}
