use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};

use crate::error::ErrorCode;
use crate::reconcile::Phase;
use crate::snapshot::DriftLevel;
use crate::store::EventLogStore;

/// Project-relative location of the config file.
pub const CONFIG_PATH: &str = ".laneway/config.toml";

/// Environment override for the per-node state directory.
pub const HOME_ENV: &str = "LANEWAY_HOME";

/// Typed cause behind a rejected config file. Recover it from the
/// `anyhow::Error` with `downcast_ref::<ConfigError>()`.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid config {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

impl ConfigError {
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::Parse { .. } => ErrorCode::ConfigParseError,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectConfig {
    #[serde(default)]
    pub status: StatusConfig,
    #[serde(default)]
    pub reconcile: ReconcileConfig,
    #[serde(default)]
    pub sync: SyncConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusConfig {
    #[serde(default)]
    pub phase: Phase,
    #[serde(default)]
    pub drift: DriftLevel,
    /// Directory holding one sub-directory per feature, relative to the
    /// project root.
    #[serde(default = "default_features_dir")]
    pub features_dir: PathBuf,
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self {
            phase: Phase::default(),
            drift: DriftLevel::default(),
            features_dir: default_features_dir(),
        }
    }
}

impl StatusConfig {
    /// Event log store rooted at this project's features directory.
    #[must_use]
    pub fn store(&self, project_root: &Path) -> EventLogStore {
        EventLogStore::new(project_root.join(&self.features_dir))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileConfig {
    /// Branch that WP branches merge into. Guessed when unset.
    #[serde(default)]
    pub mainline: Option<String>,
    #[serde(default = "default_scan_timeout_secs")]
    pub scan_timeout_secs: u64,
    /// Extra repositories scanned alongside the project itself.
    #[serde(default)]
    pub repos: Vec<PathBuf>,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            mainline: None,
            scan_timeout_secs: default_scan_timeout_secs(),
            repos: Vec::new(),
        }
    }
}

impl ReconcileConfig {
    /// The project root followed by every configured repository, with
    /// relative entries resolved against the project root.
    #[must_use]
    pub fn repo_paths(&self, project_root: &Path) -> Vec<PathBuf> {
        std::iter::once(project_root.to_path_buf())
            .chain(self.repos.iter().map(|repo| project_root.join(repo)))
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncConfig {
    #[serde(default)]
    pub server_url: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            server_url: None,
            batch_size: default_batch_size(),
            request_timeout_secs: default_request_timeout_secs(),
            interval_secs: default_interval_secs(),
            max_queue_size: default_max_queue_size(),
        }
    }
}

/// Load `<project_root>/.laneway/config.toml`, defaulting when absent.
///
/// # Errors
///
/// Fails if the file exists but cannot be read, or with a
/// [`ConfigError::Parse`] cause if it is not valid config.
pub fn load_project_config(project_root: &Path) -> Result<ProjectConfig> {
    let path = project_root.join(CONFIG_PATH);
    if !path.exists() {
        return Ok(ProjectConfig::default());
    }

    let content = std::fs::read_to_string(&path)
        .with_context(|| format!("Failed to read {}", path.display()))?;

    let config = toml::from_str::<ProjectConfig>(&content)
        .map_err(|source| ConfigError::Parse { path, source })?;
    Ok(config)
}

/// Per-node state directory: `$LANEWAY_HOME`, else `~/.laneway`.
///
/// # Errors
///
/// Fails when no override is set and the home directory is unknown.
pub fn laneway_home() -> Result<PathBuf> {
    resolve_home(env::var_os(HOME_ENV).map(PathBuf::from), dirs::home_dir())
}

fn resolve_home(env_override: Option<PathBuf>, home: Option<PathBuf>) -> Result<PathBuf> {
    if let Some(dir) = env_override.filter(|dir| !dir.as_os_str().is_empty()) {
        return Ok(dir);
    }
    home.map(|home| home.join(".laneway"))
        .with_context(|| format!("Cannot locate home directory; set {HOME_ENV}"))
}

fn default_features_dir() -> PathBuf {
    PathBuf::from("features")
}

const fn default_scan_timeout_secs() -> u64 {
    30
}

const fn default_batch_size() -> usize {
    1000
}

const fn default_request_timeout_secs() -> u64 {
    30
}

const fn default_interval_secs() -> u64 {
    300
}

const fn default_max_queue_size() -> usize {
    10_000
}
