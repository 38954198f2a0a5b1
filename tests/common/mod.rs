#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream;
use futures_util::StreamExt;
use modelkeeper::error::{DownloadError, KeeperError};
use modelkeeper::models::download::{RetryPolicy, Transport, TransportResponse};
use modelkeeper::models::manager::{ManagerOptions, ModelManager};
use modelkeeper::models::registry::{ModelInfo, ModelVersion, Registry, RegistryDocument};
use modelkeeper::models::download::NoopReporter;
use modelkeeper::store::{FileLock, LockGuard, StoreLock};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const HOST_VERSION: &str = "1.0.0";
pub const MAX_RETRIES: u32 = 3;

/// In-memory transport serving fixed payloads and counting requests
#[derive(Default)]
pub struct MockTransport {
    files: Mutex<HashMap<String, Vec<u8>>>,
    calls: Mutex<HashMap<String, usize>>,
    total: AtomicUsize,
    corrupt: AtomicBool,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn serve(&self, url: &str, body: Vec<u8>) {
        self.files.lock().unwrap().insert(url.to_string(), body);
    }

    /// Flip the last byte of every body served from now on
    pub fn corrupt(&self, on: bool) {
        self.corrupt.store(on, Ordering::SeqCst);
    }

    pub fn total_calls(&self) -> usize {
        self.total.load(Ordering::SeqCst)
    }

    pub fn calls_for(&self, url: &str) -> usize {
        self.calls.lock().unwrap().get(url).copied().unwrap_or(0)
    }

    pub fn reset_calls(&self) {
        self.total.store(0, Ordering::SeqCst);
        self.calls.lock().unwrap().clear();
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn get(&self, url: &str) -> Result<TransportResponse, DownloadError> {
        self.total.fetch_add(1, Ordering::SeqCst);
        *self
            .calls
            .lock()
            .unwrap()
            .entry(url.to_string())
            .or_default() += 1;

        let Some(mut body) = self.files.lock().unwrap().get(url).cloned() else {
            return Ok(TransportResponse {
                status: 404,
                content_length: None,
                body: stream::empty().boxed(),
            });
        };
        if self.corrupt.load(Ordering::SeqCst) {
            if let Some(last) = body.last_mut() {
                *last ^= 0xff;
            }
        }

        let chunks: Vec<_> = body
            .chunks(700)
            .map(|c| Ok(Bytes::copy_from_slice(c)))
            .collect();
        Ok(TransportResponse {
            status: 200,
            content_length: Some(body.len() as u64),
            body: stream::iter(chunks).boxed(),
        })
    }
}

/// File lock that refuses one document once armed, like a read-only state directory
#[derive(Debug, Default)]
pub struct FailingLock {
    refuse: Mutex<Option<String>>,
}

impl FailingLock {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Fail every write to a document whose file name is `name`
    pub fn refuse(&self, name: &str) {
        *self.refuse.lock().unwrap() = Some(name.to_string());
    }
}

impl StoreLock for FailingLock {
    fn acquire(&self, path: &Path) -> modelkeeper::Result<LockGuard> {
        let refused = self.refuse.lock().unwrap().clone();
        if refused.is_some_and(|name| path.file_name().is_some_and(|f| f == name.as_str())) {
            return Err(KeeperError::Io(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                format!("{} is read-only", path.display()),
            )));
        }
        FileLock.acquire(path)
    }
}

/// A GGUF-looking payload unique to `seed`
pub fn artifact(seed: u8) -> Vec<u8> {
    let mut data = b"GGUF".to_vec();
    data.extend((0..4096u32).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)));
    data
}

pub fn checksum_of(data: &[u8]) -> String {
    format!("sha256:{:x}", Sha256::digest(data))
}

pub fn url_for(model_id: &str, version: &str) -> String {
    format!("https://models.example.com/{model_id}/{version}/model.gguf")
}

/// Registry entry for a served artifact
pub fn version_entry(model_id: &str, version: &str, data: &[u8]) -> ModelVersion {
    ModelVersion {
        model_id: model_id.to_string(),
        version: version.to_string(),
        variant: "q4".to_string(),
        download_url: url_for(model_id, version),
        size_bytes: data.len() as u64,
        checksum: Some(checksum_of(data)),
        compatibility: vec![">=1.0.0".to_string()],
        minimum_ram_gb: 4.0,
        recommended_ram_gb: 8.0,
        release_date: "2026-01-15".to_string(),
        changelog: format!("Release {version}"),
        deprecated: false,
    }
}

pub fn model(id: &str, current: &str, versions: Vec<ModelVersion>) -> ModelInfo {
    ModelInfo {
        id: id.to_string(),
        name: id.to_string(),
        description: String::new(),
        current_version: current.to_string(),
        versions: versions
            .into_iter()
            .map(|v| (v.version.clone(), v))
            .collect::<BTreeMap<_, _>>(),
        tags: BTreeSet::new(),
        category: "llm".to_string(),
    }
}

pub fn write_registry(models_dir: &Path, models: Vec<ModelInfo>) {
    let doc = RegistryDocument {
        models: models.into_iter().map(|m| (m.id.clone(), m)).collect(),
        ..RegistryDocument::default()
    };
    Registry::new(models_dir.join("registry.json"))
        .replace(&doc)
        .unwrap();
}

/// Publish `versions` of `model_id` on the transport and in the registry
pub fn publish(
    models_dir: &Path,
    transport: &MockTransport,
    model_id: &str,
    current: &str,
    versions: &[(&str, u8)],
) -> Vec<ModelVersion> {
    let entries: Vec<_> = versions
        .iter()
        .map(|(version, seed)| {
            let data = artifact(*seed);
            transport.serve(&url_for(model_id, version), data.clone());
            version_entry(model_id, version, &data)
        })
        .collect();
    write_registry(models_dir, vec![model(model_id, current, entries.clone())]);
    entries
}

pub fn options(models_dir: &Path) -> ManagerOptions {
    let mut options = ManagerOptions::new(models_dir, HOST_VERSION);
    options.retry = RetryPolicy::new(MAX_RETRIES, Duration::ZERO);
    options.system_ram_gb = Some(64.0);
    options.disk_buffer_mb = 0;
    options
}

pub fn manager(models_dir: &Path, transport: Arc<MockTransport>) -> ModelManager {
    manager_with(options(models_dir), transport)
}

pub fn manager_with(options: ManagerOptions, transport: Arc<MockTransport>) -> ModelManager {
    ModelManager::new(options, transport)
        .unwrap()
        .with_reporter(Arc::new(NoopReporter))
}
