use crate::error::{KeeperError, Result};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

/// Name of the backup directory inside the models directory
pub const BACKUP_DIR: &str = "backups";

/// A retained copy of a previously installed artifact
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupEntry {
    pub model_id: String,
    pub version: String,
    pub path: PathBuf,
    pub size_bytes: u64,
    pub modified: SystemTime,
}

/// Snapshots and restores artifacts under `<models_dir>/backups/<model_id>-<version>.<ext>`
#[derive(Debug, Clone)]
pub struct BackupManager {
    backup_dir: PathBuf,
}

impl BackupManager {
    #[must_use]
    pub fn new(models_dir: &Path) -> Self {
        Self {
            backup_dir: models_dir.join(BACKUP_DIR),
        }
    }

    #[must_use]
    pub fn backup_dir(&self) -> &Path {
        &self.backup_dir
    }

    /// Path a backup of `(model_id, version)` with extension `ext` lives at
    #[must_use]
    pub fn backup_path(&self, model_id: &str, version: &str, ext: &str) -> PathBuf {
        self.backup_dir.join(format!("{model_id}-{version}.{ext}"))
    }

    /// Copy `source` into the backup directory
    ///
    /// The copy lands under a temp name first, so a half-copied file is never
    /// mistaken for a restorable backup.
    pub async fn backup(&self, model_id: &str, version: &str, source: &Path) -> Result<PathBuf> {
        let unavailable = |reason: String| KeeperError::BackupUnavailable {
            model_id: model_id.to_string(),
            version: version.to_string(),
            reason,
        };

        if !source.is_file() {
            return Err(unavailable(format!("{} does not exist", source.display())));
        }

        tokio::fs::create_dir_all(&self.backup_dir)
            .await
            .map_err(|e| unavailable(format!("cannot create backup directory: {e}")))?;

        let ext = source
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or(crate::models::registry::DEFAULT_EXTENSION);
        let target = self.backup_path(model_id, version, ext);
        let tmp = target.with_extension(format!("{ext}.tmp"));

        let copy = async {
            tokio::fs::copy(source, &tmp).await?;
            tokio::fs::File::open(&tmp).await?.sync_all().await?;
            tokio::fs::rename(&tmp, &target).await
        };

        if let Err(e) = copy.await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(unavailable(format!("copy failed: {e}")));
        }

        tracing::info!("Backed up {model_id} {version} to {}", target.display());
        Ok(target)
    }

    /// Find the backup for `(model_id, version)`, whatever its extension
    ///
    /// Looks the file up by its exact name rather than by parsing names, so
    /// versions containing `-` are found.
    #[must_use]
    pub fn find(&self, model_id: &str, version: &str) -> Option<BackupEntry> {
        let prefix = format!("{model_id}-{version}.");
        let entries = match fs::read_dir(&self.backup_dir) {
            Ok(entries) => entries,
            Err(e) => {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!("Cannot read {}: {e}", self.backup_dir.display());
                }
                return None;
            }
        };

        entries.flatten().find_map(|entry| {
            let name = entry.file_name();
            let ext = name.to_str()?.strip_prefix(&prefix)?;
            if ext.is_empty() || ext.contains('.') {
                return None;
            }
            let metadata = entry.metadata().ok().filter(fs::Metadata::is_file)?;
            Some(BackupEntry {
                model_id: model_id.to_string(),
                version: version.to_string(),
                path: entry.path(),
                size_bytes: metadata.len(),
                modified: metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH),
            })
        })
    }

    /// Copy a backup to `target`
    ///
    /// Returns `false` when no backup exists, so the caller can fall back to a
    /// fresh download.
    pub async fn restore(&self, model_id: &str, version: &str, target: &Path) -> Result<bool> {
        let Some(entry) = self.find(model_id, version) else {
            tracing::debug!("No backup for {model_id} {version}");
            return Ok(false);
        };

        tokio::fs::copy(&entry.path, target).await?;
        tokio::fs::File::open(target).await?.sync_all().await?;

        tracing::info!(
            "Restored {model_id} {version} from {}",
            entry.path.display()
        );
        Ok(true)
    }

    /// All backups, newest first
    pub fn list(&self) -> Result<Vec<BackupEntry>> {
        if !self.backup_dir.exists() {
            return Ok(Vec::new());
        }

        let mut entries = Vec::new();
        for entry in fs::read_dir(&self.backup_dir)?.flatten() {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let Some((model_id, version)) = parse_backup_name(&entry.file_name().to_string_lossy())
            else {
                continue;
            };
            let metadata = entry.metadata()?;
            entries.push(BackupEntry {
                model_id,
                version,
                path,
                size_bytes: metadata.len(),
                modified: metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH),
            });
        }

        entries.sort_by(|a, b| b.modified.cmp(&a.modified).then(a.path.cmp(&b.path)));
        Ok(entries)
    }

    /// Keep the newest `keep_count` backups per model and delete the rest
    pub fn prune(&self, keep_count: usize) -> Result<Vec<PathBuf>> {
        self.prune_protecting(keep_count, &BTreeSet::new())
    }

    /// Like `prune`, but never deletes paths in `protected`
    pub fn prune_protecting(
        &self,
        keep_count: usize,
        protected: &BTreeSet<PathBuf>,
    ) -> Result<Vec<PathBuf>> {
        let mut by_model: BTreeMap<String, Vec<BackupEntry>> = BTreeMap::new();
        for entry in self.list()? {
            by_model.entry(entry.model_id.clone()).or_default().push(entry);
        }

        let mut removed = Vec::new();
        for (model_id, entries) in by_model {
            // Entries arrive newest first
            for entry in entries.into_iter().skip(keep_count) {
                if protected.contains(&entry.path) {
                    tracing::debug!("Keeping protected backup {}", entry.path.display());
                    continue;
                }
                fs::remove_file(&entry.path)?;
                tracing::info!("Pruned backup {model_id} {}", entry.version);
                removed.push(entry.path);
            }
        }

        Ok(removed)
    }
}

/// Split `<model_id>-<version>.<ext>` into its parts
///
/// The version starts after the last `-` followed by a dotted numeric core
/// (`1.0.0`, `1.0.0-rc1`, `2.1+f16`), falling back to the last `-` followed by
/// a digit for single-number versions.
fn parse_backup_name(name: &str) -> Option<(String, String)> {
    if name.ends_with(".tmp") {
        return None;
    }
    let (stem, ext) = name.rsplit_once('.')?;
    if ext.is_empty() {
        return None;
    }

    let dashes: Vec<usize> = stem.match_indices('-').map(|(i, _)| i).rev().collect();
    let split = dashes
        .iter()
        .copied()
        .find(|&i| has_dotted_core(&stem[i + 1..]))
        .or_else(|| {
            dashes
                .iter()
                .copied()
                .find(|&i| stem[i + 1..].starts_with(|c: char| c.is_ascii_digit()))
        })?;

    let (model_id, version) = (&stem[..split], &stem[split + 1..]);
    if model_id.is_empty() {
        return None;
    }
    Some((model_id.to_string(), version.to_string()))
}

/// `N.N[.N...]` optionally followed by a `-pre` or `+build` suffix
fn has_dotted_core(version: &str) -> bool {
    let core = version.split(['-', '+']).next().unwrap_or_default();
    let mut parts = core.split('.');
    let numeric = |p: &str| !p.is_empty() && p.chars().all(|c| c.is_ascii_digit());
    parts.clone().count() >= 2 && parts.all(numeric)
}
