use crate::error::{KeeperError, Result};
use crate::integrity::DEFAULT_MIN_ARTIFACT_BYTES;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable overriding `paths.models_dir`
pub const ENV_MODELS_DIR: &str = "MODELKEEPER_MODELS_DIR";
/// Environment variable overriding `app.version`
pub const ENV_APP_VERSION: &str = "MODELKEEPER_APP_VERSION";

/// Main configuration structure
#[derive(Deserialize, Serialize, Clone, Debug, Default)]
pub struct Config {
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub app: AppConfig,
    #[serde(default)]
    pub download: DownloadConfig,
    #[serde(default)]
    pub verify: VerifyConfig,
    #[serde(default)]
    pub backup: BackupConfig,
    #[serde(default)]
    pub resources: ResourceConfig,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default)]
pub struct PathsConfig {
    pub models_dir: Option<PathBuf>,
    /// Defaults to `<models_dir>/registry.json`
    pub registry_path: Option<PathBuf>,
    /// Defaults to `<models_dir>/local-state.json`
    pub state_path: Option<PathBuf>,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct AppConfig {
    /// Host application version used for compatibility checks
    #[serde(default = "default_app_version")]
    pub version: String,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct DownloadConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default = "default_attempt_timeout_secs")]
    pub attempt_timeout_secs: u64,
    #[serde(default = "default_overall_timeout_secs")]
    pub overall_timeout_secs: u64,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    /// Free space kept on top of the artifact size
    #[serde(default = "default_disk_buffer_mb")]
    pub disk_buffer_mb: u64,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct VerifyConfig {
    #[serde(default)]
    pub require_checksum: bool,
    #[serde(default = "default_min_artifact_bytes")]
    pub min_artifact_bytes: u64,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct BackupConfig {
    #[serde(default = "default_keep_count")]
    pub keep_count: usize,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct ResourceConfig {
    #[serde(default = "default_true")]
    pub enforce_ram: bool,
}

// Default value functions
fn default_app_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}
const fn default_max_retries() -> u32 {
    3
}
const fn default_retry_delay_ms() -> u64 {
    2000
}
const fn default_attempt_timeout_secs() -> u64 {
    60 * 60
}
const fn default_overall_timeout_secs() -> u64 {
    4 * 60 * 60
}
fn default_user_agent() -> String {
    format!("modelkeeper/{}", env!("CARGO_PKG_VERSION"))
}
const fn default_disk_buffer_mb() -> u64 {
    100
}
const fn default_min_artifact_bytes() -> u64 {
    DEFAULT_MIN_ARTIFACT_BYTES
}
const fn default_keep_count() -> usize {
    2
}
const fn default_true() -> bool {
    true
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            version: default_app_version(),
        }
    }
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            attempt_timeout_secs: default_attempt_timeout_secs(),
            overall_timeout_secs: default_overall_timeout_secs(),
            user_agent: default_user_agent(),
            disk_buffer_mb: default_disk_buffer_mb(),
        }
    }
}

impl Default for VerifyConfig {
    fn default() -> Self {
        Self {
            require_checksum: false,
            min_artifact_bytes: default_min_artifact_bytes(),
        }
    }
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            keep_count: default_keep_count(),
        }
    }
}

impl Default for ResourceConfig {
    fn default() -> Self {
        Self {
            enforce_ram: default_true(),
        }
    }
}

impl DownloadConfig {
    #[must_use]
    pub const fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    #[must_use]
    pub const fn attempt_timeout(&self) -> Duration {
        Duration::from_secs(self.attempt_timeout_secs)
    }

    #[must_use]
    pub const fn overall_timeout(&self) -> Duration {
        Duration::from_secs(self.overall_timeout_secs)
    }
}

impl Config {
    /// Load config from the default location, falling back to defaults,
    /// then apply environment overrides
    pub fn load() -> Result<Self> {
        let mut config = match config_path() {
            Some(path) if path.exists() => Self::load_from(&path)?,
            _ => Self::default(),
        };
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Parse a config file
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            KeeperError::Config(format!("Failed to read {}: {e}", path.display()))
        })?;

        toml::from_str(&content).map_err(|e| {
            KeeperError::Config(format!("Failed to parse {}: {e}", path.display()))
        })
    }

    /// Apply `MODELKEEPER_*` environment overrides
    pub fn apply_env(&mut self) {
        if let Ok(dir) = std::env::var(ENV_MODELS_DIR) {
            if !dir.trim().is_empty() {
                self.paths.models_dir = Some(PathBuf::from(dir));
            }
        }
        if let Ok(version) = std::env::var(ENV_APP_VERSION) {
            if !version.trim().is_empty() {
                self.app.version = version.trim().to_string();
            }
        }
    }

    /// Reject settings that would break the lifecycle guarantees
    pub fn validate(&self) -> Result<()> {
        if self.download.max_retries == 0 {
            return Err(KeeperError::Config(
                "download.max_retries must be at least 1".to_string(),
            ));
        }
        if self.backup.keep_count == 0 {
            return Err(KeeperError::Config(
                "backup.keep_count must be at least 1 so rollback stays possible".to_string(),
            ));
        }
        if !crate::version::is_well_formed(&self.app.version) {
            return Err(KeeperError::Config(format!(
                "app.version '{}' is not a dotted numeric version",
                self.app.version
            )));
        }
        Ok(())
    }

    /// Directory holding installed artifacts
    pub fn models_dir(&self) -> Result<PathBuf> {
        match &self.paths.models_dir {
            Some(dir) => Ok(dir.clone()),
            None => dirs::data_dir()
                .map(|d| d.join("modelkeeper").join("models"))
                .ok_or_else(|| {
                    KeeperError::Config("Cannot determine data directory".to_string())
                }),
        }
    }

    pub fn registry_path(&self) -> Result<PathBuf> {
        match &self.paths.registry_path {
            Some(path) => Ok(path.clone()),
            None => Ok(self.models_dir()?.join("registry.json")),
        }
    }

    pub fn state_path(&self) -> Result<PathBuf> {
        match &self.paths.state_path {
            Some(path) => Ok(path.clone()),
            None => Ok(self.models_dir()?.join("local-state.json")),
        }
    }
}

/// `$XDG_CONFIG_HOME/modelkeeper/config.toml`
#[must_use]
pub fn config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("modelkeeper").join("config.toml"))
}
