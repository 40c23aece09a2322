mod cli;

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser as _;
use comfy_launcher::error::AppError;
use comfy_launcher::process::{
    fetch_system_stats, stats_client, web_ui_url, StatusReport, SystemStats, ToggleOutcome,
};
use comfy_launcher::ui::{self, FixedChoice, LogSink, UiPump, UiSender};
use comfy_launcher::{paths, ConfigStore, ProcessSupervisor, Result, Services};
use env_logger::Target;
use serde::Serialize;

use cli::{Cli, Command, OnOccupied};

#[tokio::main]
async fn main() -> ExitCode {
    // stdout carries command output; logs go to stderr.
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .target(Target::Stderr)
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config_path = match cli.config {
        Some(path) => path,
        None => paths::config_path()?,
    };
    let config = Arc::new(ConfigStore::open(config_path)?);
    let (ui, pump) = ui::channel();

    match cli.command {
        Command::Start { on_occupied } => {
            attach(supervisor(config, on_occupied, ui), pump, false).await
        }
        Command::Run { on_occupied } => attach(supervisor(config, on_occupied, ui), pump, true).await,
        Command::Stop => stop(supervisor(config, OnOccupied::Cancel, ui), pump).await,
        Command::Status { json } => status(supervisor(config, OnOccupied::Cancel, ui), json).await,
    }
}

fn supervisor(config: Arc<ConfigStore>, on_occupied: OnOccupied, ui: UiSender) -> Arc<ProcessSupervisor> {
    let services =
        Services::system(config).with_prompt(Arc::new(FixedChoice(on_occupied.into())));
    Arc::new(ProcessSupervisor::new(services, ui))
}

/// Start, then stay in the foreground. Ctrl-C stops the instance.
///
/// With `keep_monitoring` the monitor loop runs and the command only ends on
/// Ctrl-C; otherwise it ends when the owned process exits.
async fn attach(sup: Arc<ProcessSupervisor>, pump: UiPump, keep_monitoring: bool) -> Result<()> {
    let pump_task = tokio::spawn(async move {
        let mut sink = LogSink;
        pump.run(&mut sink).await;
    });

    match sup.start_checked().await? {
        ToggleOutcome::Started { pid } => log::info!("Web UI: {} (pid {pid})", web_ui_url(sup.port())),
        ToggleOutcome::OpenedExisting if keep_monitoring => {}
        ToggleOutcome::OpenedExisting => return Ok(()),
        ToggleOutcome::Cancelled => return Err(AppError::port_occupied(sup.port())),
        ToggleOutcome::Ignored | ToggleOutcome::Stopped(_) => return Ok(()),
    }

    let monitor = keep_monitoring.then(|| sup.start_monitor());
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            result = &mut ctrl_c => {
                if let Err(e) = result {
                    log::warn!("Failed to listen for Ctrl-C: {e}");
                }
                log::info!("Interrupted, stopping ComfyUI");
                sup.shutdown(true).await;
                break;
            }
            () = tokio::time::sleep(Duration::from_secs(1)) => {
                if !keep_monitoring && sup.owned_pid().is_none() {
                    log::info!("ComfyUI is no longer running");
                    sup.shutdown(false).await;
                    break;
                }
            }
        }
    }

    if let Some(monitor) = monitor {
        if let Err(e) = monitor.await {
            log::warn!("Monitor task failed: {e}");
        }
    }
    drop(sup);
    let _ = tokio::time::timeout(Duration::from_secs(1), pump_task).await;
    Ok(())
}

async fn stop(sup: Arc<ProcessSupervisor>, mut pump: UiPump) -> Result<()> {
    let result = sup.stop(true).await;
    pump.drain(&mut LogSink);
    let outcome = result?;
    if outcome.killed {
        println!("Stopped {:?}", outcome.pids);
    } else {
        println!("ComfyUI is not running");
    }
    Ok(())
}

#[derive(Serialize)]
struct StatusOutput {
    #[serde(flatten)]
    report: StatusReport,
    system_stats: Option<SystemStats>,
}

async fn status(sup: Arc<ProcessSupervisor>, json: bool) -> Result<()> {
    let report = sup.status().await;
    let system_stats = if report.reachable {
        match stats_client() {
            Ok(client) => match fetch_system_stats(&client, report.port).await {
                Ok(stats) => Some(stats),
                Err(e) => {
                    log::debug!("No system stats: {e}");
                    None
                }
            },
            Err(e) => {
                log::warn!("{e}");
                None
            }
        }
    } else {
        None
    };

    if json {
        let output = StatusOutput {
            report,
            system_stats,
        };
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    println!("Port:        {}", report.port);
    println!("Reachable:   {}", if report.reachable { "yes" } else { "no" });
    println!("Port PIDs:   {:?}", report.port_pids);
    println!("Managed:     {:?}", report.managed_pids);
    if let Some(stats) = system_stats {
        println!("ComfyUI:     {}", stats.comfyui_version.as_deref().unwrap_or("unknown"));
        println!("Python:      {}", stats.python_version.as_deref().unwrap_or("unknown"));
        for device in &stats.devices {
            println!("Device:      {device}");
        }
    }
    Ok(())
}
