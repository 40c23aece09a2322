use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use comfy_launcher::ui::OccupiedChoice;

#[derive(Debug, Parser)]
#[command(name = "comfy-launcher", about = "Start, stop and inspect a local ComfyUI", version)]
pub struct Cli {
    /// Config file (default: ~/.comfy_launcher/config.toml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Start ComfyUI and stay attached until it exits
    Start {
        /// What to do when the port is already in use
        #[arg(long, value_enum, default_value_t = OnOccupied::Cancel)]
        on_occupied: OnOccupied,
    },
    /// Stop ComfyUI, including instances started elsewhere
    Stop,
    /// Show reachability and the processes holding the port
    Status {
        #[arg(long)]
        json: bool,
    },
    /// Start ComfyUI and keep monitoring it until Ctrl-C
    Run {
        #[arg(long, value_enum, default_value_t = OnOccupied::Cancel)]
        on_occupied: OnOccupied,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OnOccupied {
    Open,
    Restart,
    Cancel,
}

impl From<OnOccupied> for OccupiedChoice {
    fn from(value: OnOccupied) -> Self {
        match value {
            OnOccupied::Open => Self::OpenExisting,
            OnOccupied::Restart => Self::Restart,
            OnOccupied::Cancel => Self::Cancel,
        }
    }
}
