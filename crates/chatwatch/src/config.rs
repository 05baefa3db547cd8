//! Layered configuration.
//!
//! Sources, lowest precedence first: built-in defaults, the TOML config file,
//! then environment variables prefixed `CHATWATCH__` (`.env` in the working
//! directory, overridden by the process environment). The bare
//! `INCLUDE_STATUS_MESSAGES` / `INCLUDE_MUTED_MESSAGES` variables are honoured
//! last for the filter switches.

use std::collections::HashMap;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use config::{Config, Environment, File, FileFormat};
use log::warn;
use serde::{Deserialize, Serialize};

use crate::attention::AttentionConfig;
use crate::broadcast::{DEFAULT_QUEUE_CAPACITY, DEFAULT_WRITE_TIMEOUT};
use crate::classifier::FilterConfig;
use crate::client::BridgeConfig;
use crate::store::{DEFAULT_MAX_ROWS, DEFAULT_TRIM_TO_ROWS, RetentionLimits, StoreResult};

pub const APP_NAME: &str = "chatwatch";

const INCLUDE_STATUS_VAR: &str = "INCLUDE_STATUS_MESSAGES";
const INCLUDE_MUTED_VAR: &str = "INCLUDE_MUTED_MESSAGES";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub filters: FilterConfig,
    pub store: StoreConfig,
    pub socket: SocketConfig,
    pub bridge: BridgeConfig,
    pub attention: AttentionConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// SQLite history database.
    pub path: PathBuf,
    pub max_rows: i64,
    pub trim_to_rows: i64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_data_dir().join("history.db"),
            max_rows: DEFAULT_MAX_ROWS,
            trim_to_rows: DEFAULT_TRIM_TO_ROWS,
        }
    }
}

impl StoreConfig {
    pub fn limits(&self) -> StoreResult<RetentionLimits> {
        RetentionLimits::new(self.max_rows, self.trim_to_rows)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SocketConfig {
    /// Unix socket display clients connect to.
    pub path: PathBuf,
    /// Per-frame write deadline before a peer is dropped.
    pub write_timeout_ms: u64,
    /// Frames buffered per peer before it is considered stalled.
    pub queue_capacity: usize,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            path: default_socket_path(),
            write_timeout_ms: DEFAULT_WRITE_TIMEOUT.as_millis() as u64,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

impl SocketConfig {
    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }
}

/// Load configuration from `config_path` (or the default location) and the
/// current environment.
pub fn load(config_path: Option<&Path>) -> Result<AppConfig> {
    let (path, required) = match config_path {
        Some(path) => (path.to_path_buf(), true),
        None => (default_config_path()?, false),
    };
    load_from(&path, required, environment(Path::new(".env")))
}

/// Load configuration from an explicit file and environment map.
pub fn load_from(path: &Path, required: bool, env: HashMap<String, String>) -> Result<AppConfig> {
    let built = Config::builder()
        .add_source(Config::try_from(&AppConfig::default()).context("encoding default config")?)
        .add_source(
            File::from(path)
                .format(FileFormat::Toml)
                .required(required),
        )
        .add_source(
            Environment::with_prefix(&env_prefix())
                .separator("__")
                .try_parsing(true)
                .source(Some(env.clone())),
        )
        .build()
        .with_context(|| format!("loading config from {}", path.display()))?;

    let mut config: AppConfig = built
        .try_deserialize()
        .context("deserializing config")?;

    if let Some(value) = env.get(INCLUDE_STATUS_VAR) {
        config.filters.include_status_messages = env_flag(value);
    }
    if let Some(value) = env.get(INCLUDE_MUTED_VAR) {
        config.filters.include_muted_messages = env_flag(value);
    }

    config.store.path = expand_path(&config.store.path)?;
    config.socket.path = expand_path(&config.socket.path)?;
    config.attention.socket = expand_path(&config.attention.socket)?;

    Ok(config)
}

/// Process environment layered over the variables in `dotenv`, if it exists.
/// Unreadable entries are logged and skipped.
pub fn environment(dotenv: &Path) -> HashMap<String, String> {
    let mut vars = HashMap::new();
    if let Ok(entries) = dotenvy::from_path_iter(dotenv) {
        for entry in entries {
            match entry {
                Ok((key, value)) => {
                    vars.insert(key, value);
                }
                Err(e) => warn!("Skipping entry in {}: {}", dotenv.display(), e),
            }
        }
    }
    vars.extend(env::vars());
    vars
}

fn env_flag(value: &str) -> bool {
    value.trim().eq_ignore_ascii_case("true")
}

pub fn env_prefix() -> String {
    APP_NAME
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect()
}

fn expand_path(path: &Path) -> Result<PathBuf> {
    match path.to_str() {
        Some(text) => {
            let expanded = shellexpand::full(text)
                .with_context(|| format!("expanding path {text}"))?;
            Ok(PathBuf::from(expanded.as_ref()))
        }
        None => Ok(path.to_path_buf()),
    }
}

pub fn default_config_path() -> Result<PathBuf> {
    Ok(default_config_dir()?.join("config.toml"))
}

fn default_config_dir() -> Result<PathBuf> {
    if let Some(dir) = env::var_os("XDG_CONFIG_HOME").filter(|v| !v.is_empty()) {
        return Ok(PathBuf::from(dir).join(APP_NAME));
    }

    if let Some(dir) = dirs::config_dir() {
        return Ok(dir.join(APP_NAME));
    }

    dirs::home_dir()
        .map(|home| home.join(".config").join(APP_NAME))
        .ok_or_else(|| anyhow!("unable to determine configuration directory"))
}

fn default_data_dir() -> PathBuf {
    if let Some(dir) = env::var_os("XDG_DATA_HOME").filter(|v| !v.is_empty()) {
        return PathBuf::from(dir).join(APP_NAME);
    }

    dirs::data_dir()
        .or_else(|| dirs::home_dir().map(|home| home.join(".local").join("share")))
        .map(|dir| dir.join(APP_NAME))
        .unwrap_or_else(|| PathBuf::from(APP_NAME))
}

fn default_runtime_dir() -> PathBuf {
    env::var_os("XDG_RUNTIME_DIR")
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
        .or_else(dirs::runtime_dir)
        .unwrap_or_else(env::temp_dir)
}

fn default_socket_path() -> PathBuf {
    default_runtime_dir()
        .join(APP_NAME)
        .join(format!("{APP_NAME}.sock"))
}
