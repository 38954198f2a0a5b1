use crate::models::manager::Stage;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Main error type for modelkeeper
#[derive(Error, Debug)]
pub enum KeeperError {
    #[error("Network error fetching {url}: {reason}\n\nTroubleshooting:\n- Check internet connection\n- Verify the download URL in the registry is reachable\n- Downloads are retried automatically; raise download.max_retries for flaky links")]
    Network { url: String, reason: String },

    #[error("Integrity error: {0}\n\nTroubleshooting:\n- The file was deleted and nothing was installed\n- Refresh the registry in case the artifact was republished\n- Report the mismatch to the registry maintainer if it persists")]
    Integrity(#[from] IntegrityError),

    #[error("Model '{model_id}' {version} is not compatible: {reason}")]
    Compatibility {
        model_id: String,
        version: String,
        reason: String,
    },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("State file {} is corrupted: {reason}\n\nTroubleshooting:\n- The file is never repaired automatically\n- Fix the JSON by hand, or move it aside to start from an empty document", path.display())]
    StateCorruption { path: PathBuf, reason: String },

    #[error("Backup unavailable for '{model_id}' {version}: {reason}")]
    BackupUnavailable {
        model_id: String,
        version: String,
        reason: String,
    },

    #[error("Insufficient resources: {0}")]
    Resource(String),

    #[error("Config error: {0}\n\nTroubleshooting:\n- Check config file: ~/.config/modelkeeper/config.toml\n- MODELKEEPER_MODELS_DIR and MODELKEEPER_APP_VERSION override the file\n- Run with RUST_LOG=debug for more details")]
    Config(String),

    #[error("IPC error: {0}\n\nTroubleshooting:\n- Is the daemon running? Start with: modelkeeper daemon\n- Check socket path: $XDG_RUNTIME_DIR/modelkeeper.sock")]
    Ipc(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl KeeperError {
    /// Short machine-readable name of the error class
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Network { .. } => "network",
            Self::Integrity(_) => "integrity",
            Self::Compatibility { .. } => "compatibility",
            Self::NotFound(_) => "not_found",
            Self::StateCorruption { .. } => "state_corruption",
            Self::BackupUnavailable { .. } => "backup_unavailable",
            Self::Resource(_) => "resource",
            Self::Config(_) => "config",
            Self::Ipc(_) => "ipc",
            Self::Io(_) => "io",
        }
    }
}

/// Verification failures, one variant per checked dimension
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IntegrityError {
    #[error("size mismatch for {}: expected {expected} bytes, found {actual}", path.display())]
    SizeMismatch {
        path: PathBuf,
        expected: u64,
        actual: u64,
    },

    #[error("checksum mismatch for {}: expected {expected}, computed {actual}", path.display())]
    ChecksumMismatch {
        path: PathBuf,
        expected: String,
        actual: String,
    },

    #[error("structure check failed for {}: {reason}", path.display())]
    Structure { path: PathBuf, reason: String },

    #[error("unsupported checksum algorithm '{0}'")]
    UnsupportedAlgorithm(String),

    #[error("no checksum published for {0} and checksums are required")]
    MissingChecksum(String),

    #[error("cannot read {}: {reason}", path.display())]
    Unreadable { path: PathBuf, reason: String },
}

impl IntegrityError {
    /// Whether downloading the file again could change the outcome
    ///
    /// Checksum policy failures come from registry metadata, not from the bytes.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        !matches!(
            self,
            Self::UnsupportedAlgorithm(_) | Self::MissingChecksum(_)
        )
    }
}

/// Errors produced by a single download attempt
#[derive(Error, Debug)]
pub enum DownloadError {
    #[error("request to {url} failed: {reason}")]
    Network { url: String, reason: String },

    #[error("{url} returned HTTP {status}")]
    Status { url: String, status: u16 },

    #[error("transfer timed out after {0:?}")]
    Timeout(Duration),

    #[error(transparent)]
    Integrity(#[from] IntegrityError),

    #[error("cannot write {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("not enough disk space: {required} bytes required, {available} available")]
    InsufficientSpace { required: u64, available: u64 },
}

impl DownloadError {
    /// Whether another attempt can reasonably succeed
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Network { .. } | Self::Status { .. } | Self::Timeout(_) => true,
            Self::Integrity(e) => e.is_retryable(),
            Self::Io { .. } | Self::InsufficientSpace { .. } => false,
        }
    }

    fn url_or_unknown(url: Option<&str>) -> String {
        url.unwrap_or("<unknown>").to_string()
    }

    /// Convert into the crate error, attaching the URL for timeouts
    #[must_use]
    pub fn into_keeper(self, url: Option<&str>) -> KeeperError {
        match self {
            Self::Network { url, reason } => KeeperError::Network { url, reason },
            Self::Status { url, status } => KeeperError::Network {
                url,
                reason: format!("HTTP {status}"),
            },
            Self::Timeout(after) => KeeperError::Network {
                url: Self::url_or_unknown(url),
                reason: format!("timed out after {after:?}"),
            },
            Self::Integrity(e) => KeeperError::Integrity(e),
            Self::Io { source, .. } => KeeperError::Io(source),
            Self::InsufficientSpace {
                required,
                available,
            } => KeeperError::Resource(format!(
                "not enough disk space: {required} bytes required, {available} available"
            )),
        }
    }
}

impl From<DownloadError> for KeeperError {
    fn from(err: DownloadError) -> Self {
        err.into_keeper(None)
    }
}

/// Failure of an orchestrated operation, with where it stopped
#[derive(Error, Debug)]
#[error("{stage} failed for '{model_id}'{}: {source}", .version.as_deref().map(|v| format!(" {v}")).unwrap_or_default())]
pub struct OperationError {
    pub model_id: String,
    pub version: Option<String>,
    pub stage: Stage,
    /// Any file left behind by the failed operation
    pub partial_artifact: Option<PathBuf>,
    pub source: KeeperError,
}

impl OperationError {
    pub fn new(
        model_id: impl Into<String>,
        version: Option<String>,
        stage: Stage,
        source: KeeperError,
    ) -> Self {
        Self {
            model_id: model_id.into(),
            version,
            stage,
            partial_artifact: None,
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, KeeperError>;
