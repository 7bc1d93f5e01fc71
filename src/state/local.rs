//! Local file-based state backend.
//!
//! State lives in `<dir>/state.json` next to a `state.lock` file. Saves go
//! through a temporary file that is synced and renamed over the old state,
//! so a crash never leaves a partially written state file.
//!
//! The lock file is published with a hard link, which fails if the target
//! already exists, so exactly one of several concurrent acquirers wins. An
//! expired lock is first renamed aside; only one taker can move it.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{ProvisioError, Result, StateError};

use super::backend::StateBackend;
use super::lock::{LockInfo, LOCK_EXPIRY_SECS};
use super::types::StateSnapshot;

/// Default state directory name.
pub const STATE_DIR: &str = ".provisio";

/// State file name.
const STATE_FILE: &str = "state.json";

/// Lock file name.
const LOCK_FILE: &str = "state.lock";

/// Attempts at creating the lock file before giving up on a contended lock.
const MAX_LOCK_ATTEMPTS: usize = 5;

/// Local file-based state backend.
#[derive(Debug)]
pub struct LocalStateBackend {
    /// Base directory for state files.
    base_dir: PathBuf,
    /// Path to the state file.
    state_path: PathBuf,
    /// Path to the lock file.
    lock_path: PathBuf,
}

fn backend_err(context: &str, e: impl std::fmt::Display) -> ProvisioError {
    ProvisioError::State(StateError::backend(format!("{context}: {e}")))
}

fn lock_err(context: &str, e: impl std::fmt::Display) -> ProvisioError {
    ProvisioError::State(StateError::LockFailed {
        message: format!("{context}: {e}"),
    })
}

fn locked_by(existing: &LockInfo) -> ProvisioError {
    ProvisioError::State(StateError::LockedByOther {
        holder: existing.holder.clone(),
        since: existing.acquired_at.to_rfc3339(),
    })
}

fn lock_json(lock_info: &LockInfo) -> Result<String> {
    serde_json::to_string_pretty(lock_info).map_err(|e| {
        ProvisioError::State(StateError::serialization(format!("Failed to serialize lock: {e}")))
    })
}

/// A sibling path unique to this call, e.g. `state.lock.3f2a....tmp`.
fn unique_sibling(path: &Path, suffix: &str) -> PathBuf {
    let name = path.file_name().map_or_else(String::new, |n| n.to_string_lossy().to_string());
    path.with_file_name(format!("{name}.{}.{suffix}", Uuid::new_v4().simple()))
}

async fn remove_quietly(path: &Path) {
    if let Err(e) = fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!("Failed to remove {}: {e}", path.display());
        }
    }
}

impl LocalStateBackend {
    /// Creates a backend rooted at `.provisio` in the current directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the current directory cannot be determined.
    pub fn new() -> Result<Self> {
        let base_dir = std::env::current_dir()
            .map_err(|e| ProvisioError::internal(format!("Cannot determine current directory: {e}")))?
            .join(STATE_DIR);

        Ok(Self::with_base_dir(base_dir))
    }

    /// Creates a backend with a custom base directory.
    #[must_use]
    pub fn with_base_dir(base_dir: impl Into<PathBuf>) -> Self {
        let base_dir = base_dir.into();
        let state_path = base_dir.join(STATE_FILE);
        let lock_path = base_dir.join(LOCK_FILE);

        Self {
            base_dir,
            state_path,
            lock_path,
        }
    }

    /// Returns the state file path.
    #[must_use]
    pub fn state_path(&self) -> &Path {
        &self.state_path
    }

    async fn ensure_dir(&self) -> Result<()> {
        if !self.base_dir.exists() {
            debug!("Creating state directory: {}", self.base_dir.display());
            fs::create_dir_all(&self.base_dir)
                .await
                .map_err(|e| backend_err("Failed to create state directory", e))?;
        }
        Ok(())
    }

    async fn read_lock_file(&self) -> Result<Option<LockInfo>> {
        Self::read_lock_at(&self.lock_path).await
    }

    async fn read_lock_at(path: &Path) -> Result<Option<LockInfo>> {
        let content = match fs::read_to_string(path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(ProvisioError::State(StateError::Corrupted {
                    message: format!("Failed to read lock file: {e}"),
                }));
            }
        };

        let lock_info: LockInfo = serde_json::from_str(&content).map_err(|e| {
            ProvisioError::State(StateError::Corrupted {
                message: format!("Failed to parse lock file: {e}"),
            })
        })?;

        Ok(Some(lock_info))
    }

    /// Writes a fully synced file and links it into place as the lock.
    ///
    /// Returns `false` if a lock file already exists.
    async fn create_lock_file(&self, content: &str) -> Result<bool> {
        let temp_path = unique_sibling(&self.lock_path, "tmp");
        if let Err(e) = Self::write_synced(&temp_path, content).await {
            remove_quietly(&temp_path).await;
            return Err(e);
        }

        let linked = match fs::hard_link(&temp_path, &self.lock_path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(lock_err("Failed to create lock file", e)),
        };

        remove_quietly(&temp_path).await;
        linked
    }

    /// Moves an expired lock out of the way.
    ///
    /// The rename is atomic, so of several processes taking over the same
    /// expired lock only one moves it. If the moved file turns out to be a
    /// lock created after `expired` was read, it is put back.
    async fn remove_expired_lock(&self, expired: &LockInfo) -> Result<()> {
        let stale_path = unique_sibling(&self.lock_path, "stale");

        match fs::rename(&self.lock_path, &stale_path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(lock_err("Failed to move expired lock", e)),
        }

        if let Ok(Some(displaced)) = Self::read_lock_at(&stale_path).await {
            if displaced.lock_id != expired.lock_id && !displaced.is_expired() {
                debug!("Restoring lock {} moved during takeover", displaced.lock_id);
                match fs::hard_link(&stale_path, &self.lock_path).await {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {}
                    Err(e) => warn!("Failed to restore lock {}: {e}", displaced.lock_id),
                }
            }
        }

        remove_quietly(&stale_path).await;
        debug!("Removed expired lock {}", expired.lock_id);
        Ok(())
    }

    /// Creates `path` (which must not exist) with `content` and syncs it.
    async fn write_synced(path: &Path, content: &str) -> Result<()> {
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .await
            .map_err(|e| backend_err("Failed to create temp file", e))?;
        file.write_all(content.as_bytes())
            .await
            .map_err(|e| backend_err("Failed to write temp file", e))?;
        file.sync_all()
            .await
            .map_err(|e| backend_err("Failed to sync temp file", e))
    }

    /// Writes `content` to `path` through a synced temporary file.
    async fn write_atomic(path: &Path, content: &str) -> Result<()> {
        let temp_path = unique_sibling(path, "tmp");

        if let Err(e) = Self::write_synced(&temp_path, content).await {
            remove_quietly(&temp_path).await;
            return Err(e);
        }

        if let Err(e) = fs::rename(&temp_path, path).await {
            remove_quietly(&temp_path).await;
            return Err(backend_err("Failed to rename temp file", e));
        }

        Ok(())
    }

    async fn delete_lock_file(&self) -> Result<()> {
        match fs::remove_file(&self.lock_path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(ProvisioError::State(StateError::LockFailed {
                message: format!("Failed to delete lock file: {e}"),
            })),
        }
    }
}

#[async_trait]
impl StateBackend for LocalStateBackend {
    async fn load(&self) -> Result<Option<StateSnapshot>> {
        let content = match fs::read_to_string(&self.state_path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("State file does not exist: {}", self.state_path.display());
                return Ok(None);
            }
            Err(e) => {
                return Err(ProvisioError::State(StateError::Corrupted {
                    message: format!("Failed to read state file: {e}"),
                }));
            }
        };

        info!("Loading state from: {}", self.state_path.display());

        let snapshot: StateSnapshot = serde_json::from_str(&content).map_err(|e| {
            ProvisioError::State(StateError::Corrupted {
                message: format!("Failed to parse state file: {e}"),
            })
        })?;

        Ok(Some(snapshot))
    }

    async fn save(&self, snapshot: &StateSnapshot) -> Result<()> {
        self.ensure_dir().await?;

        debug!(
            "Saving state serial {} to: {}",
            snapshot.serial,
            self.state_path.display()
        );

        let content = serde_json::to_string_pretty(snapshot).map_err(|e| {
            ProvisioError::State(StateError::serialization(format!("Failed to serialize state: {e}")))
        })?;

        Self::write_atomic(&self.state_path, &content).await
    }

    async fn delete(&self) -> Result<()> {
        match fs::remove_file(&self.state_path).await {
            Ok(()) => info!("Deleted state file: {}", self.state_path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(backend_err("Failed to delete state file", e)),
        }

        self.delete_lock_file().await
    }

    async fn exists(&self) -> Result<bool> {
        Ok(self.state_path.exists())
    }

    async fn acquire_lock(&self, holder: &str) -> Result<LockInfo> {
        self.ensure_dir().await?;

        let lock_info = LockInfo::new(holder);
        let content = lock_json(&lock_info)?;

        for _ in 0..MAX_LOCK_ATTEMPTS {
            if self.create_lock_file(&content).await? {
                info!(
                    "Acquired state lock: {} (expires in {}s)",
                    lock_info.lock_id, LOCK_EXPIRY_SECS
                );
                return Ok(lock_info);
            }

            match self.read_lock_file().await? {
                // released between our attempt and the read
                None => {}
                Some(existing) if !existing.is_expired() => return Err(locked_by(&existing)),
                Some(existing) => {
                    debug!("Expired lock {} found, taking over", existing.lock_id);
                    self.remove_expired_lock(&existing).await?;
                }
            }
        }

        Err(ProvisioError::State(StateError::LockFailed {
            message: format!(
                "lock file {} kept changing, gave up after {MAX_LOCK_ATTEMPTS} attempts",
                self.lock_path.display()
            ),
        }))
    }

    async fn renew_lock(&self, lock_id: &str) -> Result<LockInfo> {
        let current = self.read_lock_file().await?;
        let Some(current) = current.filter(|l| l.lock_id == lock_id) else {
            return Err(ProvisioError::State(StateError::LockLost {
                lock_id: lock_id.to_string(),
            }));
        };

        let renewed = current.renewed();
        Self::write_atomic(&self.lock_path, &lock_json(&renewed)?)
            .await
            .map_err(|e| lock_err("Failed to renew lock", e))?;

        debug!("Renewed state lock {lock_id} until {}", renewed.expires_at.to_rfc3339());
        Ok(renewed)
    }

    async fn release_lock(&self, lock_id: &str) -> Result<()> {
        if let Some(existing) = self.read_lock_file().await? {
            if existing.lock_id == lock_id {
                self.delete_lock_file().await?;
                info!("Released state lock: {lock_id}");
            } else {
                debug!("Lock ID mismatch: expected {lock_id}, found {}", existing.lock_id);
            }
        }
        Ok(())
    }

    async fn get_lock_info(&self) -> Result<Option<LockInfo>> {
        self.read_lock_file().await
    }

    fn backend_type(&self) -> &'static str {
        "local"
    }

    fn location(&self) -> String {
        self.state_path.display().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn create_test_backend() -> (LocalStateBackend, TempDir) {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let backend = LocalStateBackend::with_base_dir(temp_dir.path().join("state"));
        (backend, temp_dir)
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let (backend, _temp) = create_test_backend();

        let mut snapshot = StateSnapshot::new();
        snapshot.serial = 7;
        backend.save(&snapshot).await.expect("Failed to save state");

        let loaded = backend
            .load()
            .await
            .expect("Failed to load state")
            .expect("State should exist");

        assert_eq!(loaded.lineage, snapshot.lineage);
        assert_eq!(loaded.serial, 7);
        assert!(!backend.state_path().with_extension("tmp").exists());
    }

    #[tokio::test]
    async fn test_load_nonexistent() {
        let (backend, _temp) = create_test_backend();

        assert!(backend.load().await.expect("Load should not fail").is_none());
        assert!(!backend.exists().await.unwrap());
    }

    #[tokio::test]
    async fn test_corrupted_state() {
        let (backend, _temp) = create_test_backend();
        std::fs::create_dir_all(backend.state_path().parent().unwrap()).unwrap();
        std::fs::write(backend.state_path(), "{ not json").unwrap();

        let err = backend.load().await.unwrap_err();
        assert!(matches!(err, ProvisioError::State(StateError::Corrupted { .. })));
    }

    #[tokio::test]
    async fn test_lock_acquire_release() {
        let (backend, _temp) = create_test_backend();

        let lock = backend.acquire_lock("test-holder").await.expect("Failed to acquire lock");
        assert!(backend.is_locked().await.expect("is_locked failed"));

        let conflict = backend.acquire_lock("holder-2").await;
        assert!(matches!(
            conflict,
            Err(ProvisioError::State(StateError::LockedByOther { .. }))
        ));

        backend.release_lock("someone-else").await.unwrap();
        assert!(backend.is_locked().await.unwrap());

        backend.release_lock(&lock.lock_id).await.expect("Failed to release lock");
        assert!(!backend.is_locked().await.expect("is_locked failed"));
    }

    #[tokio::test]
    async fn test_delete_removes_state_and_lock() {
        let (backend, _temp) = create_test_backend();
        backend.save(&StateSnapshot::new()).await.unwrap();
        backend.acquire_lock("h").await.unwrap();

        backend.delete().await.unwrap();
        assert!(!backend.exists().await.unwrap());
        assert!(!backend.is_locked().await.unwrap());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_acquire_has_one_winner() {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().join("state");

        for trial in 0..50 {
            let a = LocalStateBackend::with_base_dir(&dir);
            let b = LocalStateBackend::with_base_dir(&dir);

            let (first, second) = tokio::join!(a.acquire_lock("a"), b.acquire_lock("b"));
            let winners: Vec<LockInfo> = [first, second].into_iter().filter_map(Result::ok).collect();
            assert_eq!(winners.len(), 1, "trial {trial} had {} winners", winners.len());

            let on_disk = a.get_lock_info().await.unwrap().unwrap();
            assert_eq!(on_disk.lock_id, winners[0].lock_id);

            a.release_lock(&winners[0].lock_id).await.unwrap();
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_takeover_of_expired_lock() {
        let (backend, _temp) = create_test_backend();

        for trial in 0..20 {
            let mut stale = LockInfo::new("crashed");
            stale.expires_at = chrono::Utc::now() - chrono::Duration::seconds(1);
            std::fs::create_dir_all(backend.state_path().parent().unwrap()).unwrap();
            std::fs::write(&backend.lock_path, serde_json::to_string(&stale).unwrap()).unwrap();

            let other = LocalStateBackend::with_base_dir(backend.state_path().parent().unwrap());
            let (first, second) = tokio::join!(backend.acquire_lock("a"), other.acquire_lock("b"));
            let winners: Vec<LockInfo> = [first, second].into_iter().filter_map(Result::ok).collect();
            assert_eq!(winners.len(), 1, "trial {trial} had {} winners", winners.len());

            let on_disk = backend.get_lock_info().await.unwrap().unwrap();
            assert_eq!(on_disk.lock_id, winners[0].lock_id);

            backend.release_lock(&winners[0].lock_id).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_renew_extends_only_own_lock() {
        let (backend, _temp) = create_test_backend();
        let lock = backend.acquire_lock("holder").await.unwrap();

        let renewed = backend.renew_lock(&lock.lock_id).await.unwrap();
        assert_eq!(renewed.lock_id, lock.lock_id);
        assert!(renewed.expires_at >= lock.expires_at);
        assert_eq!(backend.get_lock_info().await.unwrap(), Some(renewed));

        let err = backend.renew_lock("someone-else").await.unwrap_err();
        assert!(matches!(err, ProvisioError::State(StateError::LockLost { .. })));

        backend.release_lock(&lock.lock_id).await.unwrap();
        assert!(backend.renew_lock(&lock.lock_id).await.is_err());
    }

    #[tokio::test]
    async fn test_no_temp_files_left_behind() {
        let (backend, _temp) = create_test_backend();
        backend.save(&StateSnapshot::new()).await.unwrap();
        let lock = backend.acquire_lock("holder").await.unwrap();
        backend.renew_lock(&lock.lock_id).await.unwrap();
        assert!(backend.acquire_lock("other").await.is_err());

        let mut names: Vec<String> = std::fs::read_dir(backend.state_path().parent().unwrap())
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        names.sort();
        assert_eq!(names, vec![String::from("state.json"), String::from("state.lock")]);
    }
}
