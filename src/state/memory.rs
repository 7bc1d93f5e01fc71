//! In-process state backend.
//!
//! Nothing survives the process. Used by `state.backend: memory` and by tests.

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::error::{ProvisioError, Result, StateError};

use super::backend::StateBackend;
use super::lock::LockInfo;
use super::types::StateSnapshot;

/// In-memory state backend.
#[derive(Debug, Default)]
pub struct MemoryStateBackend {
    snapshot: Mutex<Option<StateSnapshot>>,
    lock: Mutex<Option<LockInfo>>,
}

impl MemoryStateBackend {
    /// Creates an empty backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a backend pre-loaded with a snapshot.
    #[must_use]
    pub fn with_snapshot(snapshot: StateSnapshot) -> Self {
        Self {
            snapshot: Mutex::new(Some(snapshot)),
            lock: Mutex::new(None),
        }
    }
}

#[async_trait]
impl StateBackend for MemoryStateBackend {
    async fn load(&self) -> Result<Option<StateSnapshot>> {
        Ok(self.snapshot.lock().await.clone())
    }

    async fn save(&self, snapshot: &StateSnapshot) -> Result<()> {
        *self.snapshot.lock().await = Some(snapshot.clone());
        Ok(())
    }

    async fn delete(&self) -> Result<()> {
        *self.snapshot.lock().await = None;
        *self.lock.lock().await = None;
        Ok(())
    }

    async fn exists(&self) -> Result<bool> {
        Ok(self.snapshot.lock().await.is_some())
    }

    async fn acquire_lock(&self, holder: &str) -> Result<LockInfo> {
        let mut lock = self.lock.lock().await;

        if let Some(existing) = lock.as_ref().filter(|l| !l.is_expired()) {
            return Err(ProvisioError::State(StateError::LockedByOther {
                holder: existing.holder.clone(),
                since: existing.acquired_at.to_rfc3339(),
            }));
        }

        let info = LockInfo::new(holder);
        *lock = Some(info.clone());
        Ok(info)
    }

    async fn renew_lock(&self, lock_id: &str) -> Result<LockInfo> {
        let mut lock = self.lock.lock().await;

        let Some(current) = lock.as_ref().filter(|l| l.lock_id == lock_id) else {
            return Err(ProvisioError::State(StateError::LockLost {
                lock_id: lock_id.to_string(),
            }));
        };

        let renewed = current.renewed();
        *lock = Some(renewed.clone());
        Ok(renewed)
    }

    async fn release_lock(&self, lock_id: &str) -> Result<()> {
        let mut lock = self.lock.lock().await;
        if lock.as_ref().is_some_and(|l| l.lock_id == lock_id) {
            *lock = None;
        }
        Ok(())
    }

    async fn get_lock_info(&self) -> Result<Option<LockInfo>> {
        Ok(self.lock.lock().await.clone())
    }

    fn backend_type(&self) -> &'static str {
        "memory"
    }

    fn location(&self) -> String {
        String::from("memory")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_err, assert_ok};

    #[tokio::test]
    async fn test_lock_exclusive() {
        let backend = MemoryStateBackend::new();

        let lock = assert_ok!(backend.acquire_lock("a").await);
        assert_err!(backend.acquire_lock("b").await);

        assert_ok!(backend.release_lock(&lock.lock_id).await);
        assert_ok!(backend.acquire_lock("b").await);
    }

    #[tokio::test]
    async fn test_renew_requires_ownership() {
        let backend = MemoryStateBackend::new();
        assert_err!(backend.renew_lock("nobody").await);

        let lock = assert_ok!(backend.acquire_lock("a").await);
        let renewed = assert_ok!(backend.renew_lock(&lock.lock_id).await);
        assert_eq!(renewed.lock_id, lock.lock_id);
        assert_err!(backend.renew_lock("other").await);
    }

    #[tokio::test]
    async fn test_save_load() {
        let backend = MemoryStateBackend::new();
        assert!(backend.load().await.unwrap().is_none());

        let snapshot = StateSnapshot::new();
        backend.save(&snapshot).await.unwrap();
        assert_eq!(backend.load().await.unwrap(), Some(snapshot));
    }
}
