//! Centralized path utilities for the launcher.

use std::path::{Path, PathBuf};

use crate::error::{AppError, Result};

/// Entry script of the managed application, relative to its root.
pub const ENTRY_SCRIPT: &str = "main.py";

/// Directory of the embedded interpreter shipped with portable builds,
/// a sibling of the application root.
const EMBEDDED_PYTHON_DIR: &str = "python_embeded";

/// Get the root data directory for the launcher (~/.comfy_launcher).
pub fn get_data_dir() -> Result<PathBuf> {
    let home = dirs::home_dir().ok_or_else(|| AppError::io("Cannot find home directory"))?;
    Ok(home.join(".comfy_launcher"))
}

/// Get the path to the config file.
pub fn config_path() -> Result<PathBuf> {
    Ok(get_data_dir()?.join("config.toml"))
}

/// Get the entry script path for an application root.
pub fn get_entry_script(root: &Path) -> PathBuf {
    root.join(ENTRY_SCRIPT)
}

/// Get the path to the Python executable inside a standalone Python directory.
pub fn get_python_exe_path(python_dir: &Path) -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        python_dir.join("python.exe")
    }

    #[cfg(not(target_os = "windows"))]
    {
        python_dir.join("bin").join("python3")
    }
}

/// Conventional embedded interpreter location relative to the application root.
pub fn get_embedded_python(root: &Path) -> PathBuf {
    let base = root.parent().unwrap_or(root);
    get_python_exe_path(&base.join(EMBEDDED_PYTHON_DIR))
}

/// Absolute form of `path`, falling back to the input when it cannot be resolved.
pub fn absolutize(path: &Path) -> PathBuf {
    let canonical = path.canonicalize().map(|p| {
        // Verbatim `\\?\` paths never appear in command lines.
        match p.to_str().and_then(|s| s.strip_prefix(r"\\?\")) {
            Some(stripped) => PathBuf::from(stripped),
            None => p,
        }
    });
    canonical.unwrap_or_else(|_| {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            std::env::current_dir()
                .map(|cwd| cwd.join(path))
                .unwrap_or_else(|_| path.to_path_buf())
        }
    })
}
