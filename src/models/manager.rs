use crate::config::schema::Config;
use crate::error::{KeeperError, OperationError, Result};
use crate::integrity::{IntegrityVerifier, SizeCheck, VerificationReport};
use crate::models::backup::BackupManager;
use crate::models::download::{
    verify_blocking, FetchRequest, HttpTransport, LogReporter, ModelDownloader, ProgressReporter,
    RetryPolicy, Transport,
};
use crate::models::local_state::{state_key, InstalledModel, LocalStateStore};
use crate::models::registry::{ModelVersion, Registry, RECOMMENDED_TAG};
use crate::store::{FileLock, StoreLock};
use crate::version::{self, UpdateType};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, SystemTime};
use tokio::sync::OwnedMutexGuard;
use tokio::task::JoinSet;

/// Directory under the models directory holding per-model lock files
pub const LOCK_DIR: &str = ".locks";

/// Suffix of in-flight downloads and restores
pub const PARTIAL_SUFFIX: &str = "partial";

/// Where an operation is in its lifecycle
///
/// Install, update and rollback all move through
/// `Checking -> BackingUp -> Downloading -> Verifying -> Committing -> Done`.
/// A failure moves to `Failing` and ends in `RolledBack` when the prior state is
/// intact, or in `Failed` when it could not be restored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Idle,
    Checking,
    BackingUp,
    Downloading,
    Verifying,
    Committing,
    Done,
    Failing,
    RolledBack,
    Failed,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Checking => "checking",
            Self::BackingUp => "backing up",
            Self::Downloading => "downloading",
            Self::Verifying => "verifying",
            Self::Committing => "committing",
            Self::Done => "done",
            Self::Failing => "failing",
            Self::RolledBack => "rolled back",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// What a successful operation did
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Installed,
    Updated,
    Downgraded,
    Reinstalled,
    RolledBack,
    AlreadyInstalled,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Installed => "installed",
            Self::Updated => "updated",
            Self::Downgraded => "downgraded",
            Self::Reinstalled => "reinstalled",
            Self::RolledBack => "rolled back",
            Self::AlreadyInstalled => "already installed",
        };
        f.write_str(name)
    }
}

/// Request to place a model version on disk
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallRequest {
    pub model_id: String,
    /// Registry current version when unset
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub variant: Option<String>,
    #[serde(default)]
    pub force: bool,
}

impl InstallRequest {
    #[must_use]
    pub fn new(model_id: impl Into<String>) -> Self {
        Self {
            model_id: model_id.into(),
            version: None,
            variant: None,
            force: false,
        }
    }

    #[must_use]
    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    #[must_use]
    pub fn variant(mut self, variant: impl Into<String>) -> Self {
        self.variant = Some(variant.into());
        self
    }

    #[must_use]
    pub const fn force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }
}

/// Result of a successful install, update or rollback
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationReport {
    pub action: Action,
    pub model_id: String,
    pub variant: String,
    pub version: String,
    pub previous_version: Option<String>,
    pub file_path: PathBuf,
    /// The artifact came from a local backup rather than the network
    pub restored_from_backup: bool,
    /// Whether the replaced version was backed up; `None` when nothing was replaced
    pub backup_created: Option<bool>,
    pub low_trust: bool,
    pub bytes_written: u64,
    pub attempts: u32,
}

impl OperationReport {
    fn unchanged(installed: &InstalledModel) -> Self {
        Self {
            action: Action::AlreadyInstalled,
            model_id: installed.model_id.clone(),
            variant: installed.variant.clone(),
            version: installed.version.clone(),
            previous_version: Some(installed.version.clone()),
            file_path: installed.file_path.clone(),
            restored_from_backup: false,
            backup_created: None,
            low_trust: installed.low_trust,
            bytes_written: 0,
            attempts: 0,
        }
    }
}

/// Serializable form of an `OperationError`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureReport {
    pub model_id: String,
    pub version: Option<String>,
    pub stage: Stage,
    pub kind: String,
    pub message: String,
    pub partial_artifact: Option<PathBuf>,
}

impl From<&OperationError> for FailureReport {
    fn from(err: &OperationError) -> Self {
        Self {
            model_id: err.model_id.clone(),
            version: err.version.clone(),
            stage: err.stage,
            kind: err.source.kind().to_string(),
            message: err.to_string(),
            partial_artifact: err.partial_artifact.clone(),
        }
    }
}

/// An installed model with a newer compatible registry version
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateCandidate {
    pub model_id: String,
    pub variant: String,
    pub installed_version: String,
    pub available_version: String,
    pub update_type: UpdateType,
    pub is_breaking: bool,
    pub size_bytes: u64,
    pub changelog: String,
}

/// Outcome of `update`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateSummary {
    pub applied: Vec<OperationReport>,
    /// Breaking updates left alone because `force` was not given
    pub skipped: Vec<UpdateCandidate>,
    pub failed: Vec<FailureReport>,
}

/// A backup as shown to users
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupSummary {
    pub model_id: String,
    pub version: String,
    pub path: PathBuf,
    pub size_bytes: u64,
}

/// Everything on disk, tracked or not
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Inventory {
    pub installed: Vec<InstalledModel>,
    pub backups: Vec<BackupSummary>,
    /// Artifacts in the models directory that no state entry points at
    pub untracked: Vec<PathBuf>,
}

/// Outcome of `cleanup`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupReport {
    pub pruned_backups: Vec<PathBuf>,
    pub removed_partials: Vec<PathBuf>,
}

/// Re-verification of one installed artifact
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifyResult {
    pub model_id: String,
    pub variant: String,
    pub version: String,
    pub file_path: PathBuf,
    pub ok: bool,
    pub error: Option<String>,
}

/// Everything needed to build a `ModelManager` besides the transport
#[derive(Debug, Clone)]
pub struct ManagerOptions {
    pub models_dir: PathBuf,
    pub registry_path: PathBuf,
    pub state_path: PathBuf,
    pub app_version: String,
    pub retry: RetryPolicy,
    pub verifier: IntegrityVerifier,
    pub keep_count: usize,
    pub enforce_ram: bool,
    /// Detected at construction when unset
    pub system_ram_gb: Option<f64>,
    pub disk_buffer_mb: u64,
    /// Cross-process lock for the registry, local state and per-model lock files
    pub lock: Arc<dyn StoreLock>,
}

impl ManagerOptions {
    /// Defaults rooted at `models_dir`
    #[must_use]
    pub fn new(models_dir: impl Into<PathBuf>, app_version: impl Into<String>) -> Self {
        let models_dir = models_dir.into();
        Self {
            registry_path: models_dir.join("registry.json"),
            state_path: models_dir.join("local-state.json"),
            models_dir,
            app_version: app_version.into(),
            retry: RetryPolicy::default(),
            verifier: IntegrityVerifier::default(),
            keep_count: 2,
            enforce_ram: true,
            system_ram_gb: None,
            disk_buffer_mb: 100,
            lock: Arc::new(FileLock),
        }
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        Ok(Self {
            models_dir: config.models_dir()?,
            registry_path: config.registry_path()?,
            state_path: config.state_path()?,
            app_version: config.app.version.clone(),
            retry: RetryPolicy::from_config(&config.download),
            verifier: IntegrityVerifier::from_config(&config.verify),
            keep_count: config.backup.keep_count,
            enforce_ram: config.resources.enforce_ram,
            system_ram_gb: None,
            disk_buffer_mb: config.download.disk_buffer_mb,
            lock: Arc::new(FileLock),
        })
    }
}

/// Keeps the models directory, registry and local state consistent
#[derive(Clone)]
pub struct ModelManager {
    models_dir: PathBuf,
    app_version: String,
    registry: Registry,
    state: LocalStateStore,
    downloader: ModelDownloader,
    backups: BackupManager,
    keep_count: usize,
    enforce_ram: bool,
    system_ram_gb: Option<f64>,
    reporter: Arc<dyn ProgressReporter>,
    pair_locks: Arc<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>,
    file_lock: Arc<dyn StoreLock>,
}

/// Both halves of a per-model lock; released on drop
struct PairGuard {
    _file: Box<dyn Send>,
    _local: OwnedMutexGuard<()>,
}

/// Stage tracking for one operation
struct Op {
    model_id: String,
    version: Option<String>,
    stage: Stage,
}

impl Op {
    fn new(model_id: &str) -> Self {
        Self {
            model_id: model_id.to_string(),
            version: None,
            stage: Stage::Idle,
        }
    }

    fn advance(&mut self, stage: Stage) {
        tracing::debug!("{}: {} -> {}", self.model_id, self.stage, stage);
        self.stage = stage;
    }

    /// Error for a failure where nothing on disk or in state changed
    fn fail(&self, source: KeeperError) -> OperationError {
        self.finish_failure(source, true)
    }

    fn finish_failure(&self, source: KeeperError, prior_state_intact: bool) -> OperationError {
        let terminal = if prior_state_intact {
            Stage::RolledBack
        } else {
            Stage::Failed
        };
        tracing::debug!("{}: {} -> {}", self.model_id, self.stage, Stage::Failing);
        tracing::debug!("{}: {} -> {}", self.model_id, Stage::Failing, terminal);
        tracing::warn!(
            "{} of '{}' failed: {source}",
            self.stage,
            self.model_id
        );
        OperationError::new(&self.model_id, self.version.clone(), self.stage, source)
    }
}

impl ModelManager {
    /// Build a manager from configuration with the HTTP transport
    pub fn from_config(config: &Config) -> Result<Self> {
        let transport = HttpTransport::new(&config.download.user_agent)?;
        Self::new(ManagerOptions::from_config(config)?, Arc::new(transport))
    }

    /// Build a manager over an arbitrary transport
    pub fn new(options: ManagerOptions, transport: Arc<dyn Transport>) -> Result<Self> {
        std::fs::create_dir_all(&options.models_dir)?;

        let downloader = ModelDownloader::new(transport, options.verifier, options.retry)
            .with_disk_buffer_mb(options.disk_buffer_mb);

        Ok(Self {
            registry: Registry::new_with_lock(options.registry_path, Arc::clone(&options.lock)),
            state: LocalStateStore::new_with_lock(options.state_path, Arc::clone(&options.lock)),
            backups: BackupManager::new(&options.models_dir),
            downloader,
            app_version: options.app_version,
            keep_count: options.keep_count,
            enforce_ram: options.enforce_ram,
            system_ram_gb: options.system_ram_gb.or_else(detect_system_ram_gb),
            reporter: Arc::new(LogReporter),
            pair_locks: Arc::new(Mutex::new(HashMap::new())),
            file_lock: options.lock,
            models_dir: options.models_dir,
        })
    }

    /// Replace the progress reporter used for downloads
    #[must_use]
    pub fn with_reporter(mut self, reporter: Arc<dyn ProgressReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    #[must_use]
    pub fn models_dir(&self) -> &Path {
        &self.models_dir
    }

    #[must_use]
    pub fn app_version(&self) -> &str {
        &self.app_version
    }

    #[must_use]
    pub const fn registry(&self) -> &Registry {
        &self.registry
    }

    #[must_use]
    pub const fn state(&self) -> &LocalStateStore {
        &self.state
    }

    #[must_use]
    pub const fn backups(&self) -> &BackupManager {
        &self.backups
    }

    /// Path an installed artifact lives at
    #[must_use]
    pub fn artifact_path(&self, model_id: &str, variant: &str, ext: &str) -> PathBuf {
        self.models_dir.join(format!("{model_id}-{variant}.{ext}"))
    }

    /// Install a model version, the registry's current one by default
    ///
    /// Installing the version that is already present is a no-op unless
    /// `force` is set: no network access and no state write.
    pub async fn install(
        &self,
        request: InstallRequest,
    ) -> std::result::Result<OperationReport, OperationError> {
        let mut op = Op::new(&request.model_id);
        op.advance(Stage::Checking);

        let registry = self.registry.load().map_err(|e| op.fail(e))?;
        let model = registry.get(&request.model_id).map_err(|e| op.fail(e))?;
        let wanted = request
            .version
            .clone()
            .unwrap_or_else(|| model.current_version.clone());
        op.version = Some(wanted.clone());

        let target = model
            .resolve(&wanted, request.variant.as_deref())
            .cloned()
            .ok_or_else(|| {
                op.fail(KeeperError::NotFound(format!(
                    "Version {wanted}{} of '{}' is not in the registry\n\nAvailable versions: {}\nAvailable variants: {}",
                    request
                        .variant
                        .as_deref()
                        .map(|v| format!(" ({v})"))
                        .unwrap_or_default(),
                    request.model_id,
                    model.versions.keys().cloned().collect::<Vec<_>>().join(", "),
                    model.variants().into_iter().collect::<Vec<_>>().join(", ")
                )))
            })?;

        self.check_compatibility(&target).map_err(|e| op.fail(e))?;
        self.execute(op, target, request.force, false).await
    }

    /// Install several models concurrently, one task per request
    pub async fn install_many(
        &self,
        requests: Vec<InstallRequest>,
    ) -> Vec<std::result::Result<OperationReport, OperationError>> {
        let mut tasks = JoinSet::new();
        for (index, request) in requests.into_iter().enumerate() {
            let manager = self.clone();
            tasks.spawn(async move { (index, manager.install(request).await) });
        }

        let mut results = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(result) => results.push(result),
                Err(e) => tracing::error!("Install task panicked: {e}"),
            }
        }

        results.sort_by_key(|(index, _)| *index);
        results.into_iter().map(|(_, result)| result).collect()
    }

    /// Install every registry model tagged `recommended`
    pub async fn install_recommended(
        &self,
    ) -> Result<Vec<std::result::Result<OperationReport, OperationError>>> {
        let registry = self.registry.load()?;
        let requests: Vec<InstallRequest> = registry
            .tagged(RECOMMENDED_TAG)
            .into_iter()
            .map(|m| InstallRequest::new(&m.id))
            .collect();

        if requests.is_empty() {
            tracing::info!("No models in the registry are tagged '{RECOMMENDED_TAG}'");
        }
        Ok(self.install_many(requests).await)
    }

    /// Installed models with a newer compatible version in the registry
    ///
    /// Records the check time in local state.
    pub async fn check_for_updates(&self) -> Result<Vec<UpdateCandidate>> {
        let registry = self.registry.load()?;
        let state = self.state.load()?;
        let mut candidates = Vec::new();

        for installed in state.installed_models.values() {
            let Ok(model) = registry.get(&installed.model_id) else {
                tracing::warn!(
                    "Installed model '{}' is no longer in the registry",
                    installed.model_id
                );
                continue;
            };
            let Some(latest) = model.current(Some(&installed.variant)) else {
                tracing::debug!(
                    "No current {} build of '{}'",
                    installed.variant,
                    installed.model_id
                );
                continue;
            };
            if version::compare(&latest.version, &installed.version) != Ordering::Greater {
                continue;
            }
            if !latest.is_compatible_with(&self.app_version) {
                tracing::info!(
                    "'{}' {} needs a newer host than {}",
                    installed.model_id,
                    latest.version,
                    self.app_version
                );
                continue;
            }

            candidates.push(UpdateCandidate {
                model_id: installed.model_id.clone(),
                variant: installed.variant.clone(),
                installed_version: installed.version.clone(),
                available_version: latest.version.clone(),
                update_type: version::classify_update(&installed.version, &latest.version),
                is_breaking: version::is_breaking(&installed.version, &latest.version),
                size_bytes: latest.size_bytes,
                changelog: latest.changelog.clone(),
            });
        }

        let store = self.state.clone();
        blocking(move || store.record_check(Utc::now())).await?;
        tracing::info!("{} update(s) available", candidates.len());
        Ok(candidates)
    }

    /// Apply available updates, to one model or all of them
    ///
    /// Breaking updates are skipped unless `force` is set.
    pub async fn update(&self, model_id: Option<&str>, force: bool) -> Result<UpdateSummary> {
        if let Some(id) = model_id {
            if self.state.load()?.variants_of(id).is_empty() {
                return Err(KeeperError::NotFound(format!(
                    "Model '{id}' is not installed\n\nInstall it first:\n  modelkeeper install {id}"
                )));
            }
        }

        let mut summary = UpdateSummary::default();
        for candidate in self.check_for_updates().await? {
            if model_id.is_some_and(|id| id != candidate.model_id) {
                continue;
            }
            if candidate.is_breaking && !force {
                tracing::warn!(
                    "Skipping breaking update of '{}' {} -> {} (use --force)",
                    candidate.model_id,
                    candidate.installed_version,
                    candidate.available_version
                );
                summary.skipped.push(candidate);
                continue;
            }

            let request = InstallRequest::new(&candidate.model_id)
                .version(&candidate.available_version)
                .variant(&candidate.variant);
            match self.install(request).await {
                Ok(report) => summary.applied.push(report),
                Err(e) => summary.failed.push(FailureReport::from(&e)),
            }
        }

        Ok(summary)
    }

    /// Move an installed model back to an earlier version
    ///
    /// Without `version` the closest lower registry version is used. A local
    /// backup is preferred over downloading when one exists and verifies.
    pub async fn rollback(
        &self,
        model_id: &str,
        version: Option<&str>,
        variant: Option<&str>,
    ) -> std::result::Result<OperationReport, OperationError> {
        let mut op = Op::new(model_id);
        op.advance(Stage::Checking);

        let state = self.state.load().map_err(|e| op.fail(e))?;
        let installed = pick_installed(&state.variants_of(model_id), model_id, variant)
            .map_err(|e| op.fail(e))?
            .clone();

        let registry = self.registry.load().map_err(|e| op.fail(e))?;
        let model = registry.get(model_id).map_err(|e| op.fail(e))?;
        let target = match version {
            Some(v) => model.resolve(v, Some(&installed.variant)),
            None => model.previous_version(&installed.version, &installed.variant),
        }
        .cloned()
        .ok_or_else(|| {
            op.fail(KeeperError::NotFound(match version {
                Some(v) => format!("Version {v} ({}) of '{model_id}' is not in the registry", installed.variant),
                None => format!(
                    "No version of '{model_id}' ({}) older than {} in the registry",
                    installed.variant, installed.version
                ),
            }))
        })?;
        op.version = Some(target.version.clone());

        self.check_compatibility(&target).map_err(|e| op.fail(e))?;
        self.execute(op, target, false, true).await
    }

    /// Installed models, backups, and artifacts nothing tracks
    pub fn list(&self) -> Result<Inventory> {
        let state = self.state.load()?;
        let untracked = state.untracked_artifacts(&self.models_dir)?;
        for path in &untracked {
            tracing::warn!(
                "{} is not tracked in local state; remove it or reinstall the model",
                path.display()
            );
        }

        let backups = self
            .backups
            .list()?
            .into_iter()
            .map(|b| BackupSummary {
                model_id: b.model_id,
                version: b.version,
                path: b.path,
                size_bytes: b.size_bytes,
            })
            .collect();

        Ok(Inventory {
            installed: state.installed_models.into_values().collect(),
            backups,
            untracked,
        })
    }

    /// Prune backups and remove stale partial files
    ///
    /// The backup of each installed model's immediate predecessor is kept
    /// regardless of age, unless `keep_count` is explicitly zero.
    pub fn cleanup(&self, keep_count: Option<usize>) -> Result<CleanupReport> {
        let keep_count = keep_count.unwrap_or(self.keep_count);
        let protected = if keep_count == 0 {
            BTreeSet::new()
        } else {
            self.predecessor_backups()?
        };

        let pruned_backups = self.backups.prune_protecting(keep_count, &protected)?;
        let removed_partials = self.remove_stale_partials()?;

        tracing::info!(
            "Cleanup removed {} backup(s) and {} partial file(s)",
            pruned_backups.len(),
            removed_partials.len()
        );
        Ok(CleanupReport {
            pruned_backups,
            removed_partials,
        })
    }

    /// Delete an installed model's artifact and state entry
    pub async fn remove(
        &self,
        model_id: &str,
        variant: Option<&str>,
    ) -> std::result::Result<InstalledModel, OperationError> {
        let mut op = Op::new(model_id);
        op.advance(Stage::Checking);

        let state = self.state.load().map_err(|e| op.fail(e))?;
        let installed = pick_installed(&state.variants_of(model_id), model_id, variant)
            .map_err(|e| op.fail(e))?
            .clone();
        op.version = Some(installed.version.clone());

        let _guard = self
            .lock_pair(model_id, &installed.variant)
            .await
            .map_err(|e| op.fail(e))?;

        op.advance(Stage::Committing);
        let store = self.state.clone();
        let (id, pair_variant) = (model_id.to_string(), installed.variant.clone());
        let removed = blocking(move || store.remove(&id, &pair_variant))
            .await
            .map_err(|e| op.fail(e))?;

        match tokio::fs::remove_file(&removed.file_path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                let mut err = op.finish_failure(e.into(), false);
                err.partial_artifact = Some(removed.file_path.clone());
                return Err(err);
            }
        }

        op.advance(Stage::Done);
        tracing::info!(
            "Removed '{model_id}' {} ({})",
            removed.version,
            removed.variant
        );
        Ok(removed)
    }

    /// Re-check installed artifacts against their recorded digests
    pub async fn verify_installed(&self, model_id: Option<&str>) -> Result<Vec<VerifyResult>> {
        let state = self.state.load()?;
        let verifier = *self.downloader.verifier();
        let mut results = Vec::new();

        for installed in state.installed_models.values() {
            if model_id.is_some_and(|id| id != installed.model_id) {
                continue;
            }

            let format = crate::integrity::ArtifactFormat::from_extension(
                installed
                    .file_path
                    .extension()
                    .and_then(|e| e.to_str())
                    .unwrap_or_default(),
            );
            let outcome = verify_blocking(
                verifier,
                installed.file_path.clone(),
                Some(installed.size_bytes),
                Some(installed.checksum.clone()),
                format,
                SizeCheck::Exact,
            )
            .await;

            if let Err(e) = &outcome {
                tracing::warn!(
                    "'{}' ({}) failed verification: {e}",
                    installed.model_id,
                    installed.variant
                );
            }
            results.push(VerifyResult {
                model_id: installed.model_id.clone(),
                variant: installed.variant.clone(),
                version: installed.version.clone(),
                file_path: installed.file_path.clone(),
                ok: outcome.is_ok(),
                error: outcome.err().map(|e| e.to_string()),
            });
        }

        if let Some(id) = model_id {
            if results.is_empty() {
                return Err(KeeperError::NotFound(format!("Model '{id}' is not installed")));
            }
        }
        Ok(results)
    }

    /// Replace the local registry with the document served at `url`
    pub async fn refresh_registry(&self, url: &str) -> Result<usize> {
        let raw = self
            .downloader
            .fetch_bytes(url)
            .await
            .map_err(|e| e.into_keeper(Some(url)))?;
        let doc = self.registry.refresh_from_bytes(&raw)?;
        tracing::info!(
            "Registry refreshed from {url}: {} model(s), version {}",
            doc.models.len(),
            doc.registry_version
        );
        Ok(doc.models.len())
    }

    /// Mark a model as used now
    pub fn touch(&self, model_id: &str, variant: Option<&str>) -> Result<()> {
        let state = self.state.load()?;
        let installed = pick_installed(&state.variants_of(model_id), model_id, variant)?;
        self.state
            .touch(model_id, &installed.variant, Utc::now())
            .map(|_| ())
    }

    /// Shared tail of install and rollback: back up, acquire, verify, commit
    async fn execute(
        &self,
        mut op: Op,
        target: ModelVersion,
        force: bool,
        prefer_backup: bool,
    ) -> std::result::Result<OperationReport, OperationError> {
        let model_id = target.model_id.clone();
        let variant = target.variant.clone();

        let _guard = self
            .lock_pair(&model_id, &variant)
            .await
            .map_err(|e| op.fail(e))?;

        // Re-read under the lock; another process may have finished first
        let state = self.state.load().map_err(|e| op.fail(e))?;
        let existing = state.get(&model_id, &variant).cloned();

        if let Some(current) = &existing {
            let same = version::compare(&current.version, &target.version) == Ordering::Equal;
            if same && !force && current.file_path.exists() {
                op.advance(Stage::Done);
                tracing::info!(
                    "'{model_id}' {} ({variant}) is already installed",
                    current.version
                );
                return Ok(OperationReport::unchanged(current));
            }
        }

        if target.deprecated {
            tracing::warn!(
                "'{model_id}' {} is deprecated; consider a newer version",
                target.version
            );
        }

        self.downloader
            .verifier()
            .expected_checksum(
                target.checksum.as_deref(),
                &format!("'{model_id}' {} ({variant})", target.version),
            )
            .map_err(|e| op.fail(e.into()))?;

        let final_path = self.artifact_path(&model_id, &variant, &target.extension());
        let partial = partial_path(&final_path);

        op.advance(Stage::BackingUp);
        let backup_created = match &existing {
            Some(current) if current.file_path.is_file() => {
                match self
                    .backups
                    .backup(&model_id, &current.version, &current.file_path)
                    .await
                {
                    Ok(_) => Some(true),
                    Err(e) => {
                        tracing::warn!(
                            "{e}; rolling back to {} will require a download",
                            current.version
                        );
                        Some(false)
                    }
                }
            }
            Some(_) => Some(false),
            None => None,
        };

        op.advance(Stage::Downloading);
        let restored = if prefer_backup {
            self.restore_verified(&target, &partial).await
        } else {
            None
        };

        let restored_from_backup = restored.is_some();
        let (verification, bytes_written, attempts) = match restored {
            Some(report) => {
                let size = report.size_bytes;
                (report, size, 0)
            }
            None => {
                let request = FetchRequest {
                    url: &target.download_url,
                    dest: &partial,
                    expected_size: (target.size_bytes > 0).then_some(target.size_bytes),
                    expected_checksum: target.checksum.as_deref(),
                    format: target.format(),
                };
                match self.downloader.fetch(&request, self.reporter.as_ref()).await {
                    Ok(outcome) => (outcome.report, outcome.bytes_written, outcome.attempts),
                    Err(e) => {
                        if matches!(e, crate::error::DownloadError::Integrity(_)) {
                            op.advance(Stage::Verifying);
                        }
                        return Err(op.fail(e.into_keeper(Some(&target.download_url))));
                    }
                }
            }
        };
        op.advance(Stage::Verifying);
        if verification.is_low_trust() {
            tracing::warn!(
                "'{model_id}' {} has no registry checksum; installed as low trust",
                target.version
            );
        }

        op.advance(Stage::Committing);
        if let Err(e) = tokio::fs::rename(&partial, &final_path).await {
            let _ = tokio::fs::remove_file(&partial).await;
            return Err(op.fail(e.into()));
        }

        let installed = InstalledModel {
            model_id: model_id.clone(),
            version: target.version.clone(),
            variant: variant.clone(),
            installed_at: Utc::now(),
            last_used: existing.as_ref().and_then(|e| e.last_used),
            file_path: final_path.clone(),
            checksum: verification.digest.clone(),
            size_bytes: verification.size_bytes,
            low_trust: verification.is_low_trust(),
        };

        let store = self.state.clone();
        if let Err(e) = blocking(move || store.commit(installed)).await {
            return Err(self
                .recover_failed_commit(&op, existing.as_ref(), &final_path, e)
                .await);
        }

        if let Some(previous) = &existing {
            if previous.file_path != final_path {
                if let Err(e) = tokio::fs::remove_file(&previous.file_path).await {
                    tracing::warn!(
                        "Failed to remove replaced artifact {}: {e}",
                        previous.file_path.display()
                    );
                }
            }
        }

        let action = if prefer_backup {
            Action::RolledBack
        } else {
            match existing
                .as_ref()
                .map(|e| version::compare(&e.version, &target.version))
            {
                None => Action::Installed,
                Some(Ordering::Less) => Action::Updated,
                Some(Ordering::Equal) => Action::Reinstalled,
                Some(Ordering::Greater) => Action::Downgraded,
            }
        };

        op.advance(Stage::Done);
        tracing::info!(
            "'{model_id}' {} ({variant}) {action}",
            target.version
        );

        Ok(OperationReport {
            action,
            model_id,
            variant,
            version: target.version,
            previous_version: existing.map(|e| e.version),
            file_path: final_path,
            restored_from_backup,
            backup_created,
            low_trust: verification.is_low_trust(),
            bytes_written,
            attempts,
        })
    }

    /// Copy a backup of `target` to `partial` and verify it against the registry
    ///
    /// Backups are keyed by version only, so a backup of another variant fails
    /// the checksum here and the caller downloads instead.
    async fn restore_verified(
        &self,
        target: &ModelVersion,
        partial: &Path,
    ) -> Option<VerificationReport> {
        match self
            .backups
            .restore(&target.model_id, &target.version, partial)
            .await
        {
            Ok(true) => {}
            Ok(false) => return None,
            Err(e) => {
                tracing::warn!("Restoring backup of {} failed: {e}", target.version);
                let _ = tokio::fs::remove_file(partial).await;
                return None;
            }
        }

        let outcome = verify_blocking(
            *self.downloader.verifier(),
            partial.to_path_buf(),
            (target.size_bytes > 0).then_some(target.size_bytes),
            target.checksum.clone(),
            target.format(),
            SizeCheck::Tolerant,
        )
        .await;

        match outcome {
            Ok(report) => Some(report),
            Err(e) => {
                tracing::warn!(
                    "Backup of '{}' {} failed verification ({e}); downloading instead",
                    target.model_id,
                    target.version
                );
                let _ = tokio::fs::remove_file(partial).await;
                None
            }
        }
    }

    /// The artifact is in place but the state write failed
    ///
    /// Puts the previous artifact back when possible so disk and state agree
    /// again; otherwise the file is left for manual intervention.
    async fn recover_failed_commit(
        &self,
        op: &Op,
        previous: Option<&InstalledModel>,
        final_path: &Path,
        source: KeeperError,
    ) -> OperationError {
        let repaired = match previous {
            None => tokio::fs::remove_file(final_path).await.is_ok(),
            Some(prev) if prev.file_path == final_path => {
                let partial = partial_path(final_path);
                match self
                    .backups
                    .restore(&prev.model_id, &prev.version, &partial)
                    .await
                {
                    Ok(true) => tokio::fs::rename(&partial, final_path).await.is_ok(),
                    _ => false,
                }
            }
            // The previous artifact is still at its own path
            Some(_) => tokio::fs::remove_file(final_path).await.is_ok(),
        };

        if repaired {
            tracing::warn!(
                "State write failed for '{}'; the previous artifact was put back",
                op.model_id
            );
            return op.finish_failure(source, true);
        }

        tracing::error!(
            "State write failed after placing {} for '{}': {source}. Manual intervention required: \
             the file is on disk but not recorded in local state",
            final_path.display(),
            op.model_id
        );
        let mut err = op.finish_failure(source, false);
        err.partial_artifact = Some(final_path.to_path_buf());
        err
    }

    fn check_compatibility(&self, target: &ModelVersion) -> Result<()> {
        if !target.is_compatible_with(&self.app_version) {
            return Err(KeeperError::Compatibility {
                model_id: target.model_id.clone(),
                version: target.version.clone(),
                reason: format!(
                    "host version {} does not satisfy [{}]",
                    self.app_version,
                    target.compatibility.join(", ")
                ),
            });
        }

        if !self.enforce_ram {
            return Ok(());
        }
        let Some(ram) = self.system_ram_gb else {
            return Ok(());
        };

        if target.minimum_ram_gb > 0.0 && ram < target.minimum_ram_gb {
            return Err(KeeperError::Compatibility {
                model_id: target.model_id.clone(),
                version: target.version.clone(),
                reason: format!(
                    "requires {:.1} GB of RAM, this system has {ram:.1} GB",
                    target.minimum_ram_gb
                ),
            });
        }
        if target.recommended_ram_gb > 0.0 && ram < target.recommended_ram_gb {
            tracing::warn!(
                "'{}' {} recommends {:.1} GB of RAM, this system has {ram:.1} GB",
                target.model_id,
                target.version,
                target.recommended_ram_gb
            );
        }
        Ok(())
    }

    /// Serialize work on one `(model, variant)` pair across tasks and processes
    async fn lock_pair(&self, model_id: &str, variant: &str) -> Result<PairGuard> {
        let key = state_key(model_id, variant);
        let local = {
            let mut locks = self
                .pair_locks
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            Arc::clone(locks.entry(key.clone()).or_default())
        };
        let local = local.lock_owned().await;

        let lock_path = self.models_dir.join(LOCK_DIR).join(&key);
        let file_lock = Arc::clone(&self.file_lock);
        let file = blocking(move || file_lock.acquire(&lock_path)).await?;

        Ok(PairGuard {
            _file: file,
            _local: local,
        })
    }

    /// Backup paths of each installed model's immediate predecessor
    fn predecessor_backups(&self) -> Result<BTreeSet<PathBuf>> {
        let state = self.state.load()?;
        let registry = self.registry.load()?;
        let mut protected = BTreeSet::new();

        for installed in state.installed_models.values() {
            let Ok(model) = registry.get(&installed.model_id) else {
                continue;
            };
            if let Some(prev) = model.previous_version(&installed.version, &installed.variant) {
                if let Some(backup) = self.backups.find(&installed.model_id, &prev.version) {
                    protected.insert(backup.path);
                }
            }
        }
        Ok(protected)
    }

    /// Remove `*.partial` files no download has written to recently
    fn remove_stale_partials(&self) -> Result<Vec<PathBuf>> {
        let stale_after = self
            .downloader
            .policy()
            .attempt_timeout
            .unwrap_or(Duration::from_secs(60 * 60));
        let now = SystemTime::now();
        let mut removed = Vec::new();

        for entry in std::fs::read_dir(&self.models_dir)?.flatten() {
            let path = entry.path();
            let is_partial = path
                .extension()
                .is_some_and(|ext| ext == PARTIAL_SUFFIX);
            if !is_partial || !path.is_file() {
                continue;
            }

            let age = entry
                .metadata()
                .and_then(|m| m.modified())
                .ok()
                .and_then(|modified| now.duration_since(modified).ok())
                .unwrap_or_default();
            if age < stale_after {
                tracing::debug!("Keeping recent partial file {}", path.display());
                continue;
            }

            std::fs::remove_file(&path)?;
            tracing::info!("Removed stale partial file {}", path.display());
            removed.push(path);
        }

        removed.sort();
        Ok(removed)
    }
}

/// Run lock or store work on the blocking pool
async fn blocking<R, F>(f: F) -> Result<R>
where
    F: FnOnce() -> Result<R> + Send + 'static,
    R: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| KeeperError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?
}

/// Choose the installed variant an operation applies to
fn pick_installed<'a>(
    candidates: &[&'a InstalledModel],
    model_id: &str,
    variant: Option<&str>,
) -> Result<&'a InstalledModel> {
    match variant {
        Some(v) => candidates
            .iter()
            .copied()
            .find(|m| m.variant == v)
            .ok_or_else(|| KeeperError::NotFound(format!("Model '{model_id}' ({v}) is not installed"))),
        None => match candidates {
            [] => Err(KeeperError::NotFound(format!(
                "Model '{model_id}' is not installed\n\nSee installed models:\n  modelkeeper list"
            ))),
            [only] => Ok(only),
            many => Err(KeeperError::Config(format!(
                "Model '{model_id}' has several installed variants ({}); pass --variant",
                many.iter().map(|m| m.variant.as_str()).collect::<Vec<_>>().join(", ")
            ))),
        },
    }
}

/// `<final>.partial` next to the final artifact
fn partial_path(final_path: &Path) -> PathBuf {
    let mut name = final_path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".");
    name.push(PARTIAL_SUFFIX);
    final_path.with_file_name(name)
}

/// Total physical memory in GiB, when the platform reports it
#[cfg(target_os = "linux")]
#[allow(clippy::cast_precision_loss)]
fn detect_system_ram_gb() -> Option<f64> {
    match nix::sys::sysinfo::sysinfo() {
        Ok(info) => Some(info.ram_total() as f64 / (1024.0 * 1024.0 * 1024.0)),
        Err(e) => {
            tracing::debug!("Cannot read system memory: {e}");
            None
        }
    }
}

#[cfg(not(target_os = "linux"))]
fn detect_system_ram_gb() -> Option<f64> {
    None
}
