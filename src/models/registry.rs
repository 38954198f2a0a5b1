use crate::error::{KeeperError, Result};
use crate::integrity::ArtifactFormat;
use crate::store::{StoreLock, Store};
use crate::version;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;

/// Variant used when the registry does not name one
pub const DEFAULT_VARIANT: &str = "default";

/// Extension used when the download URL has none
pub const DEFAULT_EXTENSION: &str = "bin";

/// Tag marking models installed by `install --recommended`
pub const RECOMMENDED_TAG: &str = "recommended";

/// One downloadable artifact
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelVersion {
    pub model_id: String,
    pub version: String,
    #[serde(default = "default_variant")]
    pub variant: String,
    pub download_url: String,
    pub size_bytes: u64,
    /// Algorithm-tagged, e.g. `sha256:<hex>`
    #[serde(default)]
    pub checksum: Option<String>,
    #[serde(default)]
    pub compatibility: Vec<String>,
    #[serde(default)]
    pub minimum_ram_gb: f64,
    #[serde(default)]
    pub recommended_ram_gb: f64,
    #[serde(default)]
    pub release_date: String,
    #[serde(default)]
    pub changelog: String,
    #[serde(default)]
    pub deprecated: bool,
}

fn default_variant() -> String {
    DEFAULT_VARIANT.to_string()
}

impl ModelVersion {
    /// File extension taken from the download URL
    #[must_use]
    pub fn extension(&self) -> String {
        let path = self
            .download_url
            .split(['?', '#'])
            .next()
            .unwrap_or_default();
        let file_name = path.rsplit('/').next().unwrap_or_default();

        match file_name.rsplit_once('.') {
            Some((stem, ext))
                if !stem.is_empty()
                    && !ext.is_empty()
                    && ext.len() <= 16
                    && ext.chars().all(|c| c.is_ascii_alphanumeric()) =>
            {
                ext.to_ascii_lowercase()
            }
            _ => DEFAULT_EXTENSION.to_string(),
        }
    }

    #[must_use]
    pub fn format(&self) -> ArtifactFormat {
        ArtifactFormat::from_extension(&self.extension())
    }

    #[must_use]
    pub fn is_compatible_with(&self, app_version: &str) -> bool {
        version::satisfies(app_version, &self.compatibility)
    }
}

/// One logical model and all its published versions
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelInfo {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub current_version: String,
    pub versions: BTreeMap<String, ModelVersion>,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default)]
    pub category: String,
}

impl ModelInfo {
    /// Find the entry for `version`, optionally restricted to one variant
    ///
    /// The entry keyed by the exact version string wins over other keys that
    /// carry the same version (e.g. `1.1.0+int8`).
    #[must_use]
    pub fn resolve(&self, version: &str, variant: Option<&str>) -> Option<&ModelVersion> {
        let matches = |v: &ModelVersion| {
            version::compare(&v.version, version) == Ordering::Equal
                && variant.map_or(true, |wanted| v.variant == wanted)
        };

        if let Some(exact) = self.versions.get(version).filter(|v| matches(v)) {
            return Some(exact);
        }

        self.versions.values().find(|v| matches(v))
    }

    /// The registry's current version for a variant
    #[must_use]
    pub fn current(&self, variant: Option<&str>) -> Option<&ModelVersion> {
        self.resolve(&self.current_version, variant)
    }

    /// Highest version of `variant` strictly below `installed`
    #[must_use]
    pub fn previous_version(&self, installed: &str, variant: &str) -> Option<&ModelVersion> {
        self.versions
            .values()
            .filter(|v| v.variant == variant)
            .filter(|v| version::compare(&v.version, installed) == Ordering::Less)
            .max_by(|a, b| version::compare(&a.version, &b.version))
    }

    /// Distinct variants published for this model
    #[must_use]
    pub fn variants(&self) -> BTreeSet<&str> {
        self.versions.values().map(|v| v.variant.as_str()).collect()
    }
}

/// The whole registry document (`registry.json`)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RegistryDocument {
    #[serde(default)]
    pub models: BTreeMap<String, ModelInfo>,
    #[serde(default = "default_registry_version")]
    pub registry_version: String,
    #[serde(default = "Utc::now")]
    pub last_updated: DateTime<Utc>,
}

fn default_registry_version() -> String {
    "1.0.0".to_string()
}

impl Default for RegistryDocument {
    fn default() -> Self {
        Self {
            models: BTreeMap::new(),
            registry_version: default_registry_version(),
            last_updated: Utc::now(),
        }
    }
}

impl RegistryDocument {
    /// Look up a model, with a suggestion when the id is close to a known one
    pub fn get(&self, model_id: &str) -> Result<&ModelInfo> {
        self.models.get(model_id).ok_or_else(|| {
            let hint = self
                .suggest(model_id)
                .map(|s| format!(". Did you mean '{s}'?"))
                .unwrap_or_default();
            KeeperError::NotFound(format!("Model '{model_id}' is not in the registry{hint}"))
        })
    }

    /// Find closest match using Levenshtein distance
    #[must_use]
    pub fn suggest(&self, name: &str) -> Option<&str> {
        if name.is_empty() {
            return None;
        }

        self.models
            .keys()
            .map(|id| (id.as_str(), levenshtein_distance(name, id)))
            .min_by_key(|(_, dist)| *dist)
            .filter(|(_, dist)| *dist <= 2) // Only suggest if within 2 edits
            .map(|(model_id, _)| model_id)
    }

    /// Models carrying a tag, e.g. `recommended`
    #[must_use]
    pub fn tagged(&self, tag: &str) -> Vec<&ModelInfo> {
        self.models.values().filter(|m| m.tags.contains(tag)).collect()
    }

    /// Structural checks applied before a refreshed document replaces the old one
    pub fn validate(&self) -> Result<()> {
        for (id, model) in &self.models {
            if &model.id != id {
                return Err(KeeperError::Config(format!(
                    "registry key '{id}' holds model with id '{}'",
                    model.id
                )));
            }
            if model.current(None).is_none() {
                return Err(KeeperError::Config(format!(
                    "model '{id}' current_version {} has no entry in versions",
                    model.current_version
                )));
            }
            if let Some(bad) = model.versions.values().find(|v| &v.model_id != id) {
                return Err(KeeperError::Config(format!(
                    "model '{id}' version {} claims model_id '{}'",
                    bad.version, bad.model_id
                )));
            }
        }
        Ok(())
    }
}

/// Registry backed by `registry.json`
#[derive(Clone)]
pub struct Registry {
    store: Store<RegistryDocument>,
}

impl Registry {
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

    /// Snapshot of the committed registry, used unchanged for one operation
    pub fn load(&self) -> Result<RegistryDocument> {
        self.store.load()
    }

    /// Replace the registry as a whole after validating it
    pub fn replace(&self, doc: &RegistryDocument) -> Result<()> {
        doc.validate()?;
        self.store.replace(doc)?;
        tracing::info!(
            "Registry replaced: {} models, version {}",
            doc.models.len(),
            doc.registry_version
        );
        Ok(())
    }

    /// Parse raw bytes from a refresh feed and replace the registry
    pub fn refresh_from_bytes(&self, raw: &[u8]) -> Result<RegistryDocument> {
        let doc: RegistryDocument =
            serde_json::from_slice(raw).map_err(|e| KeeperError::StateCorruption {
                path: self.store.path().to_path_buf(),
                reason: format!("refreshed registry is not valid JSON: {e}"),
            })?;
        self.replace(&doc)?;
        Ok(doc)
    }
}

/// Calculate Levenshtein distance between two strings
#[allow(clippy::needless_range_loop)]
fn levenshtein_distance(s1: &str, s2: &str) -> usize {
    let len1 = s1.chars().count();
    let len2 = s2.chars().count();

    if len1 == 0 {
        return len2;
    }
    if len2 == 0 {
        return len1;
    }

    let mut matrix = vec![vec![0; len2 + 1]; len1 + 1];

    for i in 0..=len1 {
        matrix[i][0] = i;
    }
    for j in 0..=len2 {
        matrix[0][j] = j;
    }

    let s1_chars: Vec<char> = s1.chars().collect();
    let s2_chars: Vec<char> = s2.chars().collect();

    for (i, c1) in s1_chars.iter().enumerate() {
        for (j, c2) in s2_chars.iter().enumerate() {
            let cost = usize::from(c1 != c2);
            matrix[i + 1][j + 1] = (matrix[i][j + 1] + 1)
                .min(matrix[i + 1][j] + 1)
                .min(matrix[i][j] + cost);
        }
    }

    matrix[len1][len2]
}
