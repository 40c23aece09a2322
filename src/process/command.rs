//! Building the launch command for the managed application.

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::os_cmd::run_captured;
use super::DEFAULT_PORT;
use crate::config::ConfigStore;
use crate::error::{AppError, Result};
use crate::paths::{get_embedded_python, get_entry_script};
use crate::version::VersionControl;

const LISTEN_ALL_ADDRESS: &str = "0.0.0.0";
const HF_MIRROR_ENDPOINT: &str = "https://hf-mirror.com";
const GH_PROXY_BASE: &str = "https://gh-proxy.com/";
const GITHUB_UPSTREAM: &str = "https://github.com";

/// Everything needed to spawn one instance. Built fresh per start attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub interpreter: PathBuf,
    pub entry_script: PathBuf,
    /// Arguments after the interpreter, starting with the entry script.
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub cwd: PathBuf,
    pub port: u16,
}

impl LaunchSpec {
    pub fn has_flag(&self, flag: &str) -> bool {
        self.args.iter().any(|a| a == flag)
    }

    /// Value following `flag`, if present.
    pub fn flag_value(&self, flag: &str) -> Option<&str> {
        let idx = self.args.iter().position(|a| a == flag)?;
        self.args.get(idx + 1).map(String::as_str)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrowserPolicy {
    FirstReachable,
    Never,
}

/// Browser-open policy from `launch_options.open_browser`.
pub fn browser_policy(config: &ConfigStore) -> BrowserPolicy {
    match config.get_str("launch_options.open_browser", "first_reachable").as_str() {
        "never" | "" => BrowserPolicy::Never,
        _ => BrowserPolicy::FirstReachable,
    }
}

/// Port the managed application listens on, from `launch_options.custom_port`.
pub fn configured_port(config: &ConfigStore) -> u16 {
    let raw = config.get_str("launch_options.custom_port", &DEFAULT_PORT.to_string());
    raw.trim().parse::<u16>().ok().filter(|p| *p != 0).unwrap_or(DEFAULT_PORT)
}

pub struct CommandBuilder<'a> {
    config: &'a ConfigStore,
    version: &'a dyn VersionControl,
}

impl<'a> CommandBuilder<'a> {
    pub fn new(config: &'a ConfigStore, version: &'a dyn VersionControl) -> Self {
        Self { config, version }
    }

    pub fn build(&self) -> Result<LaunchSpec> {
        let root = PathBuf::from(self.config.get_str("paths.comfyui_root", "").trim());
        if root.as_os_str().is_empty() {
            return Err(AppError::precondition("paths.comfyui_root is not configured"));
        }

        let interpreter = self.resolve_interpreter(&root)?;
        let entry_script = get_entry_script(&root);
        let port = configured_port(self.config);

        Ok(LaunchSpec {
            args: self.build_args(&entry_script, port),
            env: self.build_env(),
            cwd: root,
            interpreter,
            entry_script,
            port,
        })
    }

    /// Configured interpreter, or the embedded one when the configured path is gone.
    fn resolve_interpreter(&self, root: &Path) -> Result<PathBuf> {
        let configured = self.config.get_str("paths.python_path", "");
        let configured = configured.trim();
        let embedded = get_embedded_python(root);

        let resolved = if configured.is_empty() {
            if !embedded.exists() {
                return Err(AppError::interpreter_not_found(&embedded));
            }
            embedded
        } else {
            let primary = PathBuf::from(configured);
            if primary.exists() {
                primary
            } else if embedded.exists() {
                log::warn!(
                    "Configured interpreter {} is missing, using {}",
                    primary.display(),
                    embedded.display()
                );
                embedded
            } else {
                return Err(AppError::interpreter_not_found(&primary));
            }
        };

        if resolved.as_os_str() != configured {
            let value = resolved.to_string_lossy().into_owned();
            if let Err(e) = self
                .config
                .set("paths.python_path", value)
                .and_then(|()| self.config.save())
            {
                log::debug!("Could not persist resolved interpreter path: {e}");
            }
        }

        Ok(resolved)
    }

    fn build_args(&self, entry_script: &Path, port: u16) -> Vec<String> {
        let mut args = vec![entry_script.to_string_lossy().into_owned()];

        if cfg!(target_os = "windows") {
            args.push("--windows-standalone-build".to_string());
        }
        if self.config.get_str("launch_options.compute_mode", "gpu") == "cpu" {
            args.push("--cpu".to_string());
        }
        if self.config.get_bool("launch_options.fast_mode", false) {
            args.push("--fast".to_string());
        }
        if self.config.get_bool("launch_options.listen_all", false) {
            args.push("--listen".to_string());
            args.push(LISTEN_ALL_ADDRESS.to_string());
        }
        if port != DEFAULT_PORT {
            args.push("--port".to_string());
            args.push(port.to_string());
        }
        if self.config.get_bool("launch_options.enable_cors", false) {
            args.push("--enable-cors-header".to_string());
            args.push("*".to_string());
        }

        let extra = self.config.get_str("launch_options.extra_args", "");
        args.extend(split_extra_args(&extra));
        args
    }

    fn build_env(&self) -> BTreeMap<String, String> {
        let mut env = BTreeMap::from([
            ("PYTHONUNBUFFERED".to_string(), "1".to_string()),
            ("PYTHONIOENCODING".to_string(), "utf-8".to_string()),
        ]);

        let mirror = match self.config.get_str("proxy_settings.hf_mirror", "none").as_str() {
            "hf-mirror" => HF_MIRROR_ENDPOINT.to_string(),
            "custom" => self.config.get_str("proxy_settings.hf_mirror_url", ""),
            _ => String::new(),
        };
        let mirror = mirror.trim();
        if !mirror.is_empty() {
            env.insert("HF_ENDPOINT".to_string(), mirror.to_string());
        }

        let proxy_base = match self.config.get_str("proxy_settings.github_proxy_mode", "none").as_str() {
            "gh-proxy" => GH_PROXY_BASE.to_string(),
            "custom" => self.config.get_str("proxy_settings.github_proxy_url", ""),
            _ => String::new(),
        };
        let proxy_base = proxy_base.trim();
        if !proxy_base.is_empty() {
            env.insert(
                "GITHUB_ENDPOINT".to_string(),
                self.version.rewrite_url(proxy_base, GITHUB_UPSTREAM),
            );
        }

        if !self.version.uses_default_git() {
            if let Some(path) = self.git_path_env() {
                env.insert("PATH".to_string(), path);
            }
        }

        env
    }

    /// PATH with the configured git binary's directory in front.
    fn git_path_env(&self) -> Option<String> {
        let git = self.version.git_executable()?;
        let git_dir = git.parent().filter(|d| !d.as_os_str().is_empty())?;
        let current = std::env::var_os("PATH").unwrap_or_default();
        let mut parts: Vec<PathBuf> = vec![git_dir.to_path_buf()];
        parts.extend(std::env::split_paths(&current));
        std::env::join_paths(parts)
            .ok()
            .map(|p: OsString| p.to_string_lossy().into_owned())
    }
}

/// Shell-aware split, falling back to whitespace when quoting is unbalanced.
pub fn split_extra_args(extra: &str) -> Vec<String> {
    let extra = extra.trim();
    if extra.is_empty() {
        return Vec::new();
    }
    shell_words::split(extra).unwrap_or_else(|e| {
        log::warn!("Could not parse extra args ({e}), splitting on whitespace");
        extra.split_whitespace().map(str::to_string).collect()
    })
}

/// Run `<interpreter> --version`; fails if the interpreter cannot execute.
pub fn check_interpreter(interpreter: &Path, timeout: Duration) -> Result<String> {
    let program = interpreter.to_string_lossy();
    run_captured(&program, &["--version"], timeout)
        .map(|out| out.trim().to_string())
        .map_err(|e| {
            AppError::precondition(format!(
                "Interpreter {} is not executable: {e}",
                interpreter.display()
            ))
        })
}
