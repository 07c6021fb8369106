//! Ledger storage backends
//!
//! The ledger is one document replaced atomically on every mutation. A
//! backend also provides the cross-process half of the ledger lock.

use async_trait::async_trait;
use std::ffi::OsString;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::position::types::LedgerState;

/// Poll interval while waiting on another process' lock marker
const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Durable home of the ledger aggregate
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Read the persisted aggregate, `None` if nothing was written yet
    async fn load(&self) -> Result<Option<LedgerState>>;

    /// Replace the persisted aggregate; never leaves a partial document
    async fn persist(&self, state: &LedgerState) -> Result<()>;

    /// Take the cross-process writer lock, waiting at most `timeout`
    async fn acquire(&self, timeout: Duration) -> Result<()>;

    async fn release(&self) -> Result<()>;

    /// Human-readable location for logs
    fn describe(&self) -> String;
}

/// JSON document on disk with a `.lock` marker next to it
pub struct JsonFileStore {
    path: PathBuf,
    tmp_path: PathBuf,
    lock_path: PathBuf,
    stale_after: Duration,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>, stale_after: Duration) -> Self {
        let path = path.into();
        Self {
            tmp_path: with_suffix(&path, ".tmp"),
            lock_path: with_suffix(&path, ".lock"),
            path,
            stale_after,
        }
    }

    async fn ensure_parent(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| Error::LedgerPersistence(format!("{}: {}", parent.display(), e)))?;
            }
        }
        Ok(())
    }

    /// A marker left behind by a crashed process
    async fn lock_is_stale(&self) -> bool {
        let modified = match tokio::fs::metadata(&self.lock_path).await {
            Ok(meta) => meta.modified().ok(),
            Err(_) => return false,
        };
        modified
            .and_then(|m| SystemTime::now().duration_since(m).ok())
            .map_or(false, |age| age > self.stale_after)
    }
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name: OsString = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

#[async_trait]
impl LedgerStore for JsonFileStore {
    async fn load(&self) -> Result<Option<LedgerState>> {
        let data = match tokio::fs::read_to_string(&self.path).await {
            Ok(data) => data,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(Error::LedgerPersistence(format!(
                    "{}: {}",
                    self.path.display(),
                    e
                )))
            }
        };

        let state: LedgerState = serde_json::from_str(&data)
            .map_err(|e| Error::LedgerPersistence(format!("{}: {}", self.path.display(), e)))?;
        Ok(Some(state))
    }

    async fn persist(&self, state: &LedgerState) -> Result<()> {
        self.ensure_parent().await?;
        let data = serde_json::to_vec_pretty(state)?;

        let write = async {
            let mut file = tokio::fs::File::create(&self.tmp_path).await?;
            file.write_all(&data).await?;
            file.sync_all().await?;
            drop(file);
            tokio::fs::rename(&self.tmp_path, &self.path).await
        };

        if let Err(e) = write.await {
            let _ = tokio::fs::remove_file(&self.tmp_path).await;
            return Err(Error::LedgerPersistence(format!(
                "{}: {}",
                self.path.display(),
                e
            )));
        }

        debug!(
            path = %self.path.display(),
            positions = state.positions.len(),
            trades = state.trades.len(),
            "Ledger persisted"
        );
        Ok(())
    }

    async fn acquire(&self, timeout: Duration) -> Result<()> {
        self.ensure_parent().await?;
        let started = Instant::now();

        loop {
            let attempt = tokio::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&self.lock_path)
                .await;

            match attempt {
                Ok(mut file) => {
                    let stamp = format!("{} {}\n", std::process::id(), chrono::Utc::now().to_rfc3339());
                    // Marker content is informational only
                    let _ = file.write_all(stamp.as_bytes()).await;
                    return Ok(());
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    if self.lock_is_stale().await {
                        warn!(lock = %self.lock_path.display(), "Reclaiming stale ledger lock");
                        let _ = tokio::fs::remove_file(&self.lock_path).await;
                        continue;
                    }
                    if started.elapsed() >= timeout {
                        return Err(Error::LedgerLockTimeout(timeout.as_millis() as u64));
                    }
                    tokio::time::sleep(LOCK_POLL_INTERVAL).await;
                }
                Err(e) => {
                    return Err(Error::LedgerPersistence(format!(
                        "{}: {}",
                        self.lock_path.display(),
                        e
                    )))
                }
            }
        }
    }

    async fn release(&self) -> Result<()> {
        match tokio::fs::remove_file(&self.lock_path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::LedgerPersistence(format!(
                "{}: {}",
                self.lock_path.display(),
                e
            ))),
        }
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

/// Volatile backend for tests and ephemeral paper sessions
#[derive(Default)]
pub struct MemoryStore {
    state: RwLock<Option<LedgerState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LedgerStore for MemoryStore {
    async fn load(&self) -> Result<Option<LedgerState>> {
        Ok(self.state.read().await.clone())
    }

    async fn persist(&self, state: &LedgerState) -> Result<()> {
        *self.state.write().await = Some(state.clone());
        Ok(())
    }

    // Single process only; the ledger's own mutex is the whole lock
    async fn acquire(&self, _timeout: Duration) -> Result<()> {
        Ok(())
    }

    async fn release(&self) -> Result<()> {
        Ok(())
    }

    fn describe(&self) -> String {
        "(in-memory)".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_file_loads_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path().join("ledger.json"), Duration::from_secs(60));
        assert!(store.load().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_persist_replaces_document() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path().join("nested/ledger.json"), Duration::from_secs(60));

        let mut state = LedgerState::new(1000.0);
        store.persist(&state).await.unwrap();
        state.balance_usd = 900.0;
        store.persist(&state).await.unwrap();

        let loaded = store.load().await.unwrap().unwrap();
        assert_eq!(loaded.balance_usd, 900.0);
        assert!(!dir.path().join("nested/ledger.json.tmp").exists());
    }

    #[tokio::test]
    async fn test_lock_is_exclusive() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.json");
        let first = JsonFileStore::new(&path, Duration::from_secs(60));
        let second = JsonFileStore::new(&path, Duration::from_secs(60));

        first.acquire(Duration::from_millis(100)).await.unwrap();
        assert!(first.lock_path.exists());

        let err = second.acquire(Duration::from_millis(100)).await.unwrap_err();
        assert!(matches!(err, Error::LedgerLockTimeout(100)));

        first.release().await.unwrap();
        assert!(!first.lock_path.exists());
        second.acquire(Duration::from_millis(100)).await.unwrap();
        second.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_stale_lock_is_reclaimed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.json");
        std::fs::write(with_suffix(&path, ".lock"), "crashed").unwrap();

        let store = JsonFileStore::new(&path, Duration::ZERO);
        tokio::time::sleep(Duration::from_millis(20)).await;
        store.acquire(Duration::from_millis(200)).await.unwrap();
        store.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_corrupt_document_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.json");
        std::fs::write(&path, "{ not json").unwrap();

        let store = JsonFileStore::new(&path, Duration::from_secs(60));
        assert!(matches!(store.load().await, Err(Error::LedgerPersistence(_))));
    }
}
