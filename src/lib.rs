pub mod config;
pub mod error;
pub mod paths;
pub mod process;
pub mod ui;
pub mod version;

pub use config::ConfigStore;
pub use error::{AppError, ErrorKind, Result};
pub use process::{ProcessSupervisor, Services};
