//! Durable key-value backends with versioned (compare-and-set) writes.

use async_trait::async_trait;
use fs2::FileExt;
use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;

use super::StoreError;

/// A stored value and the version it was written as. Versions start at 1.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Versioned {
    pub version: u64,
    pub value: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CasOutcome {
    Written(u64),
    /// The stored version no longer matches the expected one.
    Conflict,
}

/// Durable store boundary. Values are opaque bytes; the store enforces no schema.
#[async_trait]
pub trait DurableStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Versioned>, StoreError>;

    /// Write `value` only if the key is currently at `expected` (`None` = absent).
    async fn compare_and_set(
        &self,
        key: &str,
        expected: Option<u64>,
        value: Vec<u8>,
    ) -> Result<CasOutcome, StoreError>;

    /// Remove the key. Removing an absent key succeeds.
    async fn delete(&self, key: &str) -> Result<(), StoreError>;
}

#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<HashMap<String, Versioned>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.is_empty()
    }
}

#[async_trait]
impl DurableStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Versioned>, StoreError> {
        Ok(self.inner.read().await.get(key).cloned())
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expected: Option<u64>,
        value: Vec<u8>,
    ) -> Result<CasOutcome, StoreError> {
        let mut g = self.inner.write().await;
        let current = g.get(key).map(|v| v.version);
        if current != expected {
            return Ok(CasOutcome::Conflict);
        }
        let version = current.unwrap_or(0) + 1;
        g.insert(key.to_string(), Versioned { version, value });
        Ok(CasOutcome::Written(version))
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.inner.write().await.remove(key);
        Ok(())
    }
}

/// Directory-backed store: one file per key (`<hex key>.rec`, holding the version line then
/// the value). Writes run under an exclusive lock on `<root>/.lock`, so several processes can
/// share one directory.
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn record_path(root: &Path, key: &str) -> PathBuf {
        let name: String = key.bytes().map(|b| format!("{:02x}", b)).collect();
        root.join(format!("{}.rec", name))
    }

    /// Run file IO off the async runtime. A record that cannot be parsed is `Corrupt`; any
    /// other IO failure is `Unavailable`.
    async fn blocking<T, F>(&self, key: &str, op: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&Path) -> io::Result<T> + Send + 'static,
    {
        let root = self.root.clone();
        tokio::task::spawn_blocking(move || op(&root))
            .await
            .map_err(|e| StoreError::Unavailable(format!("file store task failed: {}", e)))?
            .map_err(|e| match e.kind() {
                io::ErrorKind::InvalidData => StoreError::Corrupt {
                    key: key.to_string(),
                    reason: e.to_string(),
                },
                _ => StoreError::Unavailable(e.to_string()),
            })
    }
}

fn read_record(path: &Path) -> io::Result<Option<Versioned>> {
    let bytes = match std::fs::read(path) {
        Ok(b) => b,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };
    let split = bytes
        .iter()
        .position(|b| *b == b'\n')
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "record has no version line"))?;
    let version = std::str::from_utf8(&bytes[..split])
        .ok()
        .and_then(|s| s.trim().parse::<u64>().ok())
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "record version is not a number"))?;
    Ok(Some(Versioned {
        version,
        value: bytes[split + 1..].to_vec(),
    }))
}

fn with_lock<T>(root: &Path, op: impl FnOnce() -> io::Result<T>) -> io::Result<T> {
    std::fs::create_dir_all(root)?;
    let lock = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(false)
        .open(root.join(".lock"))?;
    lock.lock_exclusive()?;
    let result = op();
    FileExt::unlock(&lock)?;
    result
}

#[async_trait]
impl DurableStore for FileStore {
    async fn get(&self, key: &str) -> Result<Option<Versioned>, StoreError> {
        let owned = key.to_string();
        self.blocking(key, move |root| read_record(&FileStore::record_path(root, &owned)))
            .await
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expected: Option<u64>,
        value: Vec<u8>,
    ) -> Result<CasOutcome, StoreError> {
        let owned = key.to_string();
        self.blocking(key, move |root| {
            with_lock(root, || {
                let path = FileStore::record_path(root, &owned);
                let current = read_record(&path)?.map(|v| v.version);
                if current != expected {
                    return Ok(CasOutcome::Conflict);
                }
                let version = current.unwrap_or(0) + 1;
                let tmp = path.with_extension("tmp");
                {
                    let mut f = std::fs::File::create(&tmp)?;
                    writeln!(f, "{}", version)?;
                    f.write_all(&value)?;
                    f.sync_all()?;
                }
                std::fs::rename(&tmp, &path)?;
                Ok(CasOutcome::Written(version))
            })
        })
        .await
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let owned = key.to_string();
        self.blocking(key, move |root| {
            with_lock(root, || {
                match std::fs::remove_file(FileStore::record_path(root, &owned)) {
                    Ok(()) => Ok(()),
                    Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
                    Err(e) => Err(e),
                }
            })
        })
        .await
    }
}
