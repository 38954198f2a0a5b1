use crate::error::{KeeperError, Result};
use crate::store::{Store, StoreLock};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Information about an installed model
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InstalledModel {
    pub model_id: String,
    pub version: String,
    pub variant: String,
    pub installed_at: DateTime<Utc>,
    pub last_used: Option<DateTime<Utc>>,
    pub file_path: PathBuf,
    /// Digest of the file as installed, `sha256:<hex>`
    pub checksum: String,
    pub size_bytes: u64,
    /// Installed without a registry checksum to compare against
    #[serde(default)]
    pub low_trust: bool,
}

impl InstalledModel {
    #[must_use]
    pub fn key(&self) -> String {
        state_key(&self.model_id, &self.variant)
    }
}

/// Key of an installed entry: `<model_id>-<variant>`
#[must_use]
pub fn state_key(model_id: &str, variant: &str) -> String {
    format!("{model_id}-{variant}")
}

/// Record of what is installed on this machine (`local-state.json`)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct LocalState {
    #[serde(default)]
    pub installed_models: BTreeMap<String, InstalledModel>,
    #[serde(default)]
    pub last_check: Option<DateTime<Utc>>,
    #[serde(default)]
    pub auto_update_enabled: bool,
}

impl LocalState {
    /// Insert or overwrite the entry for the model's `(model_id, variant)` pair
    pub fn upsert(&mut self, model: InstalledModel) -> Option<InstalledModel> {
        self.installed_models.insert(model.key(), model)
    }

    /// Remove the entry for a pair
    pub fn remove(&mut self, model_id: &str, variant: &str) -> Result<InstalledModel> {
        self.installed_models
            .remove(&state_key(model_id, variant))
            .ok_or_else(|| {
                KeeperError::NotFound(format!(
                    "Model '{model_id}' ({variant}) is not installed"
                ))
            })
    }

    #[must_use]
    pub fn get(&self, model_id: &str, variant: &str) -> Option<&InstalledModel> {
        self.installed_models.get(&state_key(model_id, variant))
    }

    /// All installed variants of one model
    #[must_use]
    pub fn variants_of(&self, model_id: &str) -> Vec<&InstalledModel> {
        self.installed_models
            .values()
            .filter(|m| m.model_id == model_id)
            .collect()
    }

    /// Artifact files in `models_dir` that no entry points at
    ///
    /// These are what a failed state write leaves behind after a successful download.
    pub fn untracked_artifacts(&self, models_dir: &Path) -> Result<Vec<PathBuf>> {
        if !models_dir.exists() {
            return Ok(Vec::new());
        }

        let tracked: BTreeSet<&Path> = self
            .installed_models
            .values()
            .map(|m| m.file_path.as_path())
            .collect();

        let mut untracked = Vec::new();
        for entry in fs::read_dir(models_dir)?.flatten() {
            let path = entry.path();
            if !path.is_file() || tracked.contains(path.as_path()) {
                continue;
            }
            let name = entry.file_name();
            let name = name.to_string_lossy();
            let bookkeeping = name.starts_with('.')
                || name.ends_with(".json")
                || name.ends_with(".lock")
                || name.ends_with(".partial")
                || name.contains(".tmp");
            if !bookkeeping {
                untracked.push(path);
            }
        }

        untracked.sort();
        Ok(untracked)
    }
}

/// Local state backed by `local-state.json`
#[derive(Clone)]
pub struct LocalStateStore {
    store: Store<LocalState>,
}

impl LocalStateStore {
    #[must_use]
    pub fn new(path: PathBuf) -> Self {
        Self {
            store: Store::new(path),
        }
    }

    #[must_use]
    pub fn new_with_lock(path: PathBuf, lock: Arc<dyn StoreLock>) -> Self {
        Self {
            store: Store::new_with_lock(path, lock),
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        self.store.path()
    }

    /// Last committed state
    pub fn load(&self) -> Result<LocalState> {
        self.store.load()
    }

    /// Commit an installed entry, re-reading the document under the lock
    pub fn commit(&self, model: InstalledModel) -> Result<Option<InstalledModel>> {
        self.store.update(|state| Ok(state.upsert(model)))
    }

    pub fn remove(&self, model_id: &str, variant: &str) -> Result<InstalledModel> {
        self.store.update(|state| state.remove(model_id, variant))
    }

    pub fn record_check(&self, at: DateTime<Utc>) -> Result<()> {
        self.store.update(|state| {
            state.last_check = Some(at);
            Ok(())
        })
    }

    pub fn set_auto_update(&self, enabled: bool) -> Result<()> {
        self.store.update(|state| {
            state.auto_update_enabled = enabled;
            Ok(())
        })
    }

    /// Stamp `last_used`; a no-op for models that are not installed
    pub fn touch(&self, model_id: &str, variant: &str, at: DateTime<Utc>) -> Result<bool> {
        self.store.update(|state| {
            Ok(state
                .installed_models
                .get_mut(&state_key(model_id, variant))
                .map(|m| m.last_used = Some(at))
                .is_some())
        })
    }
}
