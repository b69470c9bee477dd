//! Host configuration – reads/writes `~/.heartbeat/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};

use heartbeat_kernel::DEFAULT_EVENT_CAPACITY;
use heartbeat_kernel::env::DEFAULT_BLOCK_INTERVAL_SECS;
use heartbeat_types::{
    DEFAULT_KERNEL_DESCRIPTION, DEFAULT_KERNEL_NAME, DEFAULT_KERNEL_VERSION, KernelIdentity,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::store::write_owner_only;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config at {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("failed to write config at {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Persisted host configuration stored in `~/.heartbeat/config.toml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_kernel_name")]
    pub kernel_name: String,

    #[serde(default = "default_kernel_version")]
    pub kernel_version: String,

    #[serde(default = "default_kernel_description")]
    pub kernel_description: String,

    /// Hex Ed25519 public key of the trusted authority used by `deploy`.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub authority_public_key: String,

    /// Directory holding `deployment.json`.  Defaults to `~/.heartbeat`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_dir: Option<PathBuf>,

    /// Seconds per block when deriving heights from the wall clock.
    #[serde(default = "default_block_interval")]
    pub block_interval_secs: u64,

    /// Deploy new kernels with single-use (nonce) enforcement.
    #[serde(default)]
    pub replay_protection: bool,

    /// Newest heartbeat events kept in `deployment.json`.
    #[serde(default = "default_max_events")]
    pub max_events: usize,
}

fn default_kernel_name() -> String {
    DEFAULT_KERNEL_NAME.to_string()
}
fn default_kernel_version() -> String {
    DEFAULT_KERNEL_VERSION.to_string()
}
fn default_kernel_description() -> String {
    DEFAULT_KERNEL_DESCRIPTION.to_string()
}
fn default_block_interval() -> u64 {
    DEFAULT_BLOCK_INTERVAL_SECS
}
fn default_max_events() -> usize {
    DEFAULT_EVENT_CAPACITY
}

impl Default for Config {
    fn default() -> Self {
        Self {
            kernel_name: default_kernel_name(),
            kernel_version: default_kernel_version(),
            kernel_description: default_kernel_description(),
            authority_public_key: String::new(),
            state_dir: None,
            block_interval_secs: default_block_interval(),
            replay_protection: false,
            max_events: default_max_events(),
        }
    }
}

impl Config {
    pub fn identity(&self) -> KernelIdentity {
        KernelIdentity::new(
            &self.kernel_name,
            &self.kernel_version,
            &self.kernel_description,
        )
    }

    /// Directory for deployment state, falling back to `~/.heartbeat`.
    pub fn resolved_state_dir(&self) -> PathBuf {
        self.state_dir
            .clone()
            .unwrap_or_else(|| heartbeat_dir_for_home(&home_dir()))
    }
}

fn home_dir() -> String {
    std::env::var("HOME")
        .or_else(|_| std::env::var("USERPROFILE"))
        .unwrap_or_else(|_| ".".to_string())
}

pub(crate) fn heartbeat_dir_for_home(home: &str) -> PathBuf {
    PathBuf::from(home).join(".heartbeat")
}

/// Return the path to `~/.heartbeat/config.toml`.
pub fn config_path() -> PathBuf {
    heartbeat_dir_for_home(&home_dir()).join("config.toml")
}

/// Load the config, falling back to defaults when the file does not exist.
/// Environment overrides are applied in both cases.
pub fn load() -> Result<Config, ConfigError> {
    let mut cfg = load_from(&config_path())?.unwrap_or_default();
    apply_env_overrides(&mut cfg);
    Ok(cfg)
}

/// Load the config from a specific path.  Returns `None` if it does not exist.
pub(crate) fn load_from(path: &Path) -> Result<Option<Config>, ConfigError> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(Some(toml::from_str(&raw)?))
}

/// Apply `HEARTBEAT_*` environment variable overrides to `cfg`.
///
/// | Variable | Config field |
/// |---|---|
/// | `HEARTBEAT_AUTHORITY_KEY` | `authority_public_key` |
/// | `HEARTBEAT_STATE_DIR` | `state_dir` |
/// | `HEARTBEAT_BLOCK_INTERVAL_SECS` | `block_interval_secs` |
/// | `HEARTBEAT_REPLAY_PROTECTION` | `replay_protection` (`true`/`false`/`1`/`0`) |
/// | `HEARTBEAT_MAX_EVENTS` | `max_events` |
pub fn apply_env_overrides(cfg: &mut Config) {
    if let Ok(v) = std::env::var("HEARTBEAT_AUTHORITY_KEY") {
        cfg.authority_public_key = v;
    }
    if let Ok(v) = std::env::var("HEARTBEAT_STATE_DIR") {
        cfg.state_dir = Some(PathBuf::from(v));
    }
    if let Ok(v) = std::env::var("HEARTBEAT_BLOCK_INTERVAL_SECS")
        && let Ok(secs) = v.parse::<u64>()
    {
        cfg.block_interval_secs = secs;
    }
    if let Ok(v) = std::env::var("HEARTBEAT_MAX_EVENTS")
        && let Ok(n) = v.parse::<usize>()
    {
        cfg.max_events = n;
    }
    if let Ok(v) = std::env::var("HEARTBEAT_REPLAY_PROTECTION") {
        match v.trim() {
            "1" | "true" => cfg.replay_protection = true,
            "0" | "false" => cfg.replay_protection = false,
            _ => {}
        }
    }
}

/// Save the config to `~/.heartbeat/config.toml`.
pub fn save(cfg: &Config) -> Result<(), ConfigError> {
    save_to(cfg, &config_path())
}

/// Save the config to a specific path, creating the parent directory.
pub(crate) fn save_to(cfg: &Config, path: &Path) -> Result<(), ConfigError> {
    let raw = toml::to_string_pretty(cfg)?;
    write_owner_only(path, raw.as_bytes(), false).map_err(|source| ConfigError::Write {
        path: path.to_path_buf(),
        source,
    })
}
