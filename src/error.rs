//! Application error types.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

/// Launcher error carrying a kind and a small key/value payload.
#[derive(Debug)]
pub struct AppError {
    payload: BTreeMap<String, String>,
    kind: ErrorKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// An owned instance is already live
    InstanceRunning,
    /// Another start request is in flight
    AlreadyStarting,
    /// Configuration error
    Config,
    /// File system error
    Io,
    /// Network error
    Network,
    /// Interpreter could not be resolved
    InterpreterNotFound,
    /// Interpreter or entry script unusable
    PreconditionFailed,
    /// OS refused to spawn the process
    SpawnFailed,
    /// Process exited inside the settle window
    FastCrash,
    /// No PID could be signaled by any strategy
    TerminationFailed,
    /// Port is occupied by another process
    PortOccupied,
    /// Process error
    Process,
    /// General error
    Other,
}

impl ErrorKind {
    pub fn code(&self) -> u32 {
        match self {
            Self::InstanceRunning => 1002,
            Self::AlreadyStarting => 1006,
            Self::Config => 2001,
            Self::Io => 2002,
            Self::Network => 2003,
            Self::InterpreterNotFound => 3002,
            Self::Process => 3003,
            Self::PortOccupied => 3004,
            Self::PreconditionFailed => 3006,
            Self::SpawnFailed => 3007,
            Self::FastCrash => 3008,
            Self::TerminationFailed => 3009,
            Self::Other => 9999,
        }
    }
}

impl AppError {
    pub fn new(kind: ErrorKind, payload: BTreeMap<String, String>) -> Self {
        Self { payload, kind }
    }

    /// Create an error with a single "detail" key from a non-empty string,
    /// or an empty payload if the string is empty.
    fn with_detail(kind: ErrorKind, detail: impl Into<String>) -> Self {
        let detail = detail.into();
        let payload = if detail.is_empty() {
            BTreeMap::new()
        } else {
            BTreeMap::from([("detail".to_string(), detail)])
        };
        Self::new(kind, payload)
    }

    pub fn instance_running() -> Self {
        Self::new(ErrorKind::InstanceRunning, BTreeMap::new())
    }

    pub fn already_starting() -> Self {
        Self::new(ErrorKind::AlreadyStarting, BTreeMap::new())
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::with_detail(ErrorKind::Config, message)
    }

    pub fn io(message: impl Into<String>) -> Self {
        Self::with_detail(ErrorKind::Io, message)
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::with_detail(ErrorKind::Network, message)
    }

    pub fn interpreter_not_found(path: &Path) -> Self {
        Self::new(
            ErrorKind::InterpreterNotFound,
            BTreeMap::from([("path".to_string(), path.display().to_string())]),
        )
    }

    pub fn precondition(message: impl Into<String>) -> Self {
        Self::with_detail(ErrorKind::PreconditionFailed, message)
    }

    pub fn spawn_failed(message: impl Into<String>) -> Self {
        Self::with_detail(ErrorKind::SpawnFailed, message)
    }

    pub fn fast_crash(code: Option<i32>) -> Self {
        let code = code.map_or_else(|| "unknown".to_string(), |c| c.to_string());
        Self::new(
            ErrorKind::FastCrash,
            BTreeMap::from([("exit_code".to_string(), code)]),
        )
    }

    pub fn termination_failed(pids: &[u32]) -> Self {
        let pids: Vec<String> = pids.iter().map(u32::to_string).collect();
        Self::new(
            ErrorKind::TerminationFailed,
            BTreeMap::from([("pids".to_string(), pids.join(","))]),
        )
    }

    pub fn port_occupied(port: u16) -> Self {
        Self::new(
            ErrorKind::PortOccupied,
            BTreeMap::from([("port".to_string(), port.to_string())]),
        )
    }

    pub fn process(message: impl Into<String>) -> Self {
        Self::with_detail(ErrorKind::Process, message)
    }

    pub fn other(message: impl Into<String>) -> Self {
        Self::with_detail(ErrorKind::Other, message)
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn payload(&self, key: &str) -> Option<&str> {
        self.payload.get(key).map(String::as_str)
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.payload.is_empty() {
            write!(f, "{:?}", self.kind)
        } else {
            let pairs: Vec<String> = self
                .payload
                .iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect();
            write!(f, "{:?}: {}", self.kind, pairs.join(", "))
        }
    }
}

impl std::error::Error for AppError {}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::io(err.to_string())
    }
}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        Self::config(err.to_string())
    }
}

impl From<toml::ser::Error> for AppError {
    fn from(err: toml::ser::Error) -> Self {
        Self::config(err.to_string())
    }
}

impl From<reqwest::Error> for AppError {
    fn from(err: reqwest::Error) -> Self {
        Self::network(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        Self::config(err.to_string())
    }
}

/// Convenient Result type alias.
pub type Result<T> = std::result::Result<T, AppError>;
