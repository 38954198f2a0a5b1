use crate::error::{KeeperError, Result};
use nix::fcntl::{Flock, FlockArg};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Held for the duration of a write; releasing it is dropping it
pub type LockGuard = Box<dyn Send>;

/// Exclusive lock provider for store writers
///
/// Writes take the lock, re-read the document, apply the change and replace
/// the file through a temp-file rename.
pub trait StoreLock: Send + Sync + std::fmt::Debug {
    /// Block until the lock for `path` is held
    fn acquire(&self, path: &Path) -> Result<LockGuard>;
}

/// OS-level `flock` on a sidecar `<document>.lock` file
#[derive(Debug, Default, Clone, Copy)]
pub struct FileLock;

impl StoreLock for FileLock {
    fn acquire(&self, path: &Path) -> Result<LockGuard> {
        let lock_path = lock_path_for(path);
        if let Some(parent) = lock_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path)?;

        let guard = Flock::lock(file, FlockArg::LockExclusive).map_err(|(_, errno)| {
            KeeperError::Io(std::io::Error::from_raw_os_error(errno as i32))
        })?;

        tracing::trace!("Acquired lock {}", lock_path.display());
        Ok(Box::new(guard))
    }
}

/// Lock that never blocks, for single-process tests
#[derive(Debug, Default, Clone, Copy)]
pub struct NoLock;

impl StoreLock for NoLock {
    fn acquire(&self, _path: &Path) -> Result<LockGuard> {
        Ok(Box::new(()))
    }
}

/// Sidecar lock file used for a document
#[must_use]
pub fn lock_path_for(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".lock");
    path.with_file_name(name)
}

/// A whole-document JSON store with atomic replace semantics
pub struct Store<T> {
    path: PathBuf,
    lock: Arc<dyn StoreLock>,
    _doc: std::marker::PhantomData<fn() -> T>,
}

impl<T> Clone for Store<T> {
    fn clone(&self) -> Self {
        Self {
            path: self.path.clone(),
            lock: Arc::clone(&self.lock),
            _doc: std::marker::PhantomData,
        }
    }
}

impl<T> Store<T>
where
    T: Serialize + DeserializeOwned + Default,
{
    /// Create a store with the default filesystem lock
    #[must_use]
    pub fn new(path: PathBuf) -> Self {
        Self::new_with_lock(path, Arc::new(FileLock))
    }

    /// Create a store with a custom lock provider
    #[must_use]
    pub fn new_with_lock(path: PathBuf, lock: Arc<dyn StoreLock>) -> Self {
        Self {
            path,
            lock,
            _doc: std::marker::PhantomData,
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the last committed document
    ///
    /// A missing file is bootstrapped with the default document and persisted.
    /// A malformed file is reported as `StateCorruption` and left untouched.
    pub fn load(&self) -> Result<T> {
        match self.read()? {
            Some(doc) => Ok(doc),
            None => {
                let _guard = self.lock.acquire(&self.path)?;
                // Another writer may have created it while we waited
                if let Some(doc) = self.read()? {
                    return Ok(doc);
                }
                tracing::info!("No document at {}, creating default", self.path.display());
                let doc = T::default();
                self.write(&doc)?;
                Ok(doc)
            }
        }
    }

    /// Read-modify-write under the store lock
    ///
    /// The closure sees the freshly re-read document, never a cached copy.
    /// Returning an error leaves the file untouched.
    pub fn update<R, F>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut T) -> Result<R>,
    {
        let _guard = self.lock.acquire(&self.path)?;
        let mut doc = self.read()?.unwrap_or_default();
        let result = f(&mut doc)?;
        self.write(&doc)?;
        Ok(result)
    }

    /// Replace the whole document
    pub fn replace(&self, doc: &T) -> Result<()> {
        let _guard = self.lock.acquire(&self.path)?;
        self.write(doc)
    }

    fn read(&self) -> Result<Option<T>> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        serde_json::from_str(&content)
            .map(Some)
            .map_err(|e| KeeperError::StateCorruption {
                path: self.path.clone(),
                reason: e.to_string(),
            })
    }

    /// Write to a temp file in the same directory, sync, then rename over the target
    fn write(&self, doc: &T) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let content = serde_json::to_string_pretty(doc).map_err(|e| {
            KeeperError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e))
        })?;

        let tmp_path = self.path.with_extension(format!("tmp.{}", std::process::id()));
        let result = (|| -> std::io::Result<()> {
            let mut file = File::create(&tmp_path)?;
            file.write_all(content.as_bytes())?;
            file.sync_all()?;
            fs::rename(&tmp_path, &self.path)
        })();

        if let Err(e) = result {
            let _ = fs::remove_file(&tmp_path);
            return Err(e.into());
        }

        tracing::debug!("Wrote {}", self.path.display());
        Ok(())
    }
}
