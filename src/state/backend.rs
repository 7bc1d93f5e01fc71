//! State backend trait definition.
//!
//! A backend persists whole [`StateSnapshot`]s and a lock document. Record
//! level concurrency lives in [`super::StateStore`].

use async_trait::async_trait;

use super::lock::LockInfo;
use super::types::StateSnapshot;
use crate::error::Result;

/// Trait for state persistence backends.
#[async_trait]
pub trait StateBackend: Send + Sync {
    /// Loads the snapshot. Returns `None` if no state exists yet.
    async fn load(&self) -> Result<Option<StateSnapshot>>;

    /// Saves the snapshot. Must be all-or-nothing.
    async fn save(&self, snapshot: &StateSnapshot) -> Result<()>;

    /// Deletes the state and any lock.
    async fn delete(&self) -> Result<()>;

    /// Checks if state exists.
    async fn exists(&self) -> Result<bool>;

    /// Acquires the lock, taking over an expired one.
    ///
    /// Two concurrent callers must never both succeed.
    async fn acquire_lock(&self, holder: &str) -> Result<LockInfo>;

    /// Extends the expiry of the lock held as `lock_id`.
    ///
    /// Fails with `StateError::LockLost` if `lock_id` no longer holds it.
    async fn renew_lock(&self, lock_id: &str) -> Result<LockInfo>;

    /// Releases the lock if `lock_id` still holds it.
    async fn release_lock(&self, lock_id: &str) -> Result<()>;

    /// Gets current lock information if locked.
    async fn get_lock_info(&self) -> Result<Option<LockInfo>>;

    /// Checks if an unexpired lock is held.
    async fn is_locked(&self) -> Result<bool> {
        Ok(self.get_lock_info().await?.is_some_and(|l| !l.is_expired()))
    }

    /// Gets the backend type name.
    fn backend_type(&self) -> &'static str;

    /// Describes where the state lives.
    fn location(&self) -> String;
}
