//! `/system_stats` query for status reporting.

use std::time::Duration;

use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};

/// Response structure for the /system_stats endpoint.
#[derive(Debug, Deserialize)]
struct SystemStatsResponse {
    system: SystemSection,
    #[serde(default)]
    devices: Vec<DeviceSection>,
}

#[derive(Debug, Deserialize)]
struct SystemSection {
    #[serde(default)]
    comfyui_version: Option<String>,
    #[serde(default)]
    python_version: Option<String>,
    #[serde(default)]
    os: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DeviceSection {
    name: String,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct SystemStats {
    pub comfyui_version: Option<String>,
    pub python_version: Option<String>,
    pub os: Option<String>,
    pub devices: Vec<String>,
}

pub fn stats_client() -> Result<Client> {
    Client::builder()
        .timeout(Duration::from_secs(3))
        .build()
        .map_err(AppError::from)
}

/// Fetch version information from a running instance.
pub async fn fetch_system_stats(client: &Client, port: u16) -> Result<SystemStats> {
    let url = format!("http://127.0.0.1:{}/system_stats", port);

    let resp = client.get(&url).send().await?;
    if !resp.status().is_success() {
        return Err(AppError::network(format!("{url}: {}", resp.status())));
    }
    let body = resp.text().await?;
    parse_system_stats(&body)
}

fn parse_system_stats(body: &str) -> Result<SystemStats> {
    let data: SystemStatsResponse = serde_json::from_str(body)?;
    Ok(SystemStats {
        comfyui_version: data.system.comfyui_version,
        python_version: data.system.python_version,
        os: data.system.os,
        devices: data.devices.into_iter().map(|d| d.name).collect(),
    })
}
