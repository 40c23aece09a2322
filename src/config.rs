//! Launcher configuration backed by a TOML document with dotted key paths.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

use toml::{Table, Value};

use crate::error::{AppError, Result};

const DEFAULT_CONFIG: &str = r#"
[paths]
comfyui_root = ""
python_path = ""
git_path = ""

[launch_options]
compute_mode = "gpu"
fast_mode = false
listen_all = false
custom_port = "8188"
enable_cors = false
extra_args = ""
open_browser = "first_reachable"

[proxy_settings]
hf_mirror = "none"
hf_mirror_url = ""
github_proxy_mode = "none"
github_proxy_url = ""
"#;

/// Built-in defaults, also written to disk when no config file exists yet.
pub fn default_table() -> Table {
    toml::from_str::<Table>(DEFAULT_CONFIG).unwrap_or_default()
}

/// Shared configuration accessor.
///
/// Reads go through an `Arc` snapshot; writes are serialized by `write_lock`
/// and only become visible once applied to the cache.
pub struct ConfigStore {
    path: Option<PathBuf>,
    write_lock: Mutex<()>,
    cache: RwLock<Arc<Table>>,
}

impl ConfigStore {
    /// Load from `path`, creating the file with defaults if it does not exist.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let table = if path.exists() {
            let content = fs::read_to_string(&path).map_err(|e| AppError::config(e.to_string()))?;
            let mut table = default_table();
            merge(&mut table, toml::from_str::<Table>(&content)?);
            table
        } else {
            let table = default_table();
            write_table(&path, &table)?;
            table
        };

        Ok(Self {
            path: Some(path),
            write_lock: Mutex::new(()),
            cache: RwLock::new(Arc::new(table)),
        })
    }

    /// A store with no backing file; `save` is a no-op.
    pub fn in_memory(table: Table) -> Self {
        Self {
            path: None,
            write_lock: Mutex::new(()),
            cache: RwLock::new(Arc::new(table)),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn snapshot(&self) -> Arc<Table> {
        let table = self.cache.read().unwrap_or_else(|e| e.into_inner());
        Arc::clone(&table)
    }

    pub fn get(&self, key_path: &str) -> Option<Value> {
        lookup(&self.snapshot(), key_path).cloned()
    }

    pub fn get_str(&self, key_path: &str, default: &str) -> String {
        match self.get(key_path) {
            Some(Value::String(s)) => s,
            Some(Value::Integer(i)) => i.to_string(),
            _ => default.to_string(),
        }
    }

    pub fn get_bool(&self, key_path: &str, default: bool) -> bool {
        match self.get(key_path) {
            Some(Value::Boolean(b)) => b,
            _ => default,
        }
    }

    /// Set a value in memory, creating intermediate tables as needed.
    pub fn set(&self, key_path: &str, value: impl Into<Value>) -> Result<()> {
        let value = value.into();
        self.update(|table| insert(table, key_path, value))
    }

    /// Persist the current snapshot to disk.
    pub fn save(&self) -> Result<()> {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        match &self.path {
            Some(path) => write_table(path, &self.snapshot()),
            None => Ok(()),
        }
    }

    /// Read-modify-write under the write lock, then persist.
    pub fn with_config_mut<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Table) -> Result<T>,
    {
        let result = self.update(f)?;
        self.save()?;
        Ok(result)
    }

    fn update<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Table) -> Result<T>,
    {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut updated = (*self.snapshot()).clone();
        let result = f(&mut updated)?;
        *self.cache.write().unwrap_or_else(|e| e.into_inner()) = Arc::new(updated);
        Ok(result)
    }
}

fn lookup<'a>(table: &'a Table, key_path: &str) -> Option<&'a Value> {
    let mut parts = key_path.split('.');
    let first = parts.next()?;
    let mut current = table.get(first)?;
    for part in parts {
        current = current.as_table()?.get(part)?;
    }
    Some(current)
}

fn insert(table: &mut Table, key_path: &str, value: Value) -> Result<()> {
    let mut parts: Vec<&str> = key_path.split('.').collect();
    let Some(last) = parts.pop() else {
        return Err(AppError::config("empty key path"));
    };
    if last.is_empty() {
        return Err(AppError::config(format!("invalid key path: {key_path}")));
    }

    let mut current = table;
    for part in parts {
        let entry = current
            .entry(part.to_string())
            .or_insert_with(|| Value::Table(Table::new()));
        current = entry
            .as_table_mut()
            .ok_or_else(|| AppError::config(format!("{part} in {key_path} is not a table")))?;
    }
    current.insert(last.to_string(), value);
    Ok(())
}

/// Overlay `src` onto `dst`, recursing into tables so missing keys keep their defaults.
fn merge(dst: &mut Table, src: Table) {
    for (key, value) in src {
        match (dst.get_mut(&key), value) {
            (Some(Value::Table(existing)), Value::Table(incoming)) => merge(existing, incoming),
            (_, value) => {
                dst.insert(key, value);
            }
        }
    }
}

fn write_table(path: &Path, table: &Table) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| AppError::config(e.to_string()))?;
    }
    let content = toml::to_string_pretty(table)?;
    let tmp = path.with_extension("toml.tmp");
    fs::write(&tmp, content).map_err(|e| AppError::config(e.to_string()))?;
    fs::rename(&tmp, path).map_err(|e| AppError::config(e.to_string()))
}
