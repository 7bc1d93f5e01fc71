//! The state store.
//!
//! [`StateStore`] is the only owner of persisted records during a run. It is
//! opened around one plan-apply cycle: `open` takes the backend lock and
//! loads one snapshot, `close` releases the lock.
//!
//! Writes use optimistic concurrency. Each caller passes the record serial it
//! last read; a mismatch is a [`StateError::Conflict`]. Writers on the same
//! address are serialized by a per-address async mutex, and whole-snapshot
//! saves are serialized by a single persist mutex so that a later save always
//! includes every earlier commit. A write returns only after the snapshot
//! holding it has been saved, and readers only see a change once its save
//! has succeeded.
//!
//! While open, the store renews its backend lock in the background, and
//! every save first renews it in the foreground. A store whose lock was
//! released or taken over fails its writes with [`StateError::LockLost`]
//! instead of overwriting another holder's state.

use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{ProvisioError, Result, StateError};
use crate::graph::ResourceAddress;

use super::backend::StateBackend;
use super::lock::{LockInfo, LOCK_RENEW_INTERVAL_SECS};
use super::types::{HistoryEntry, StateRecord, StateSnapshot, STATE_VERSION};

/// Record-level access to persisted state.
pub struct StateStore {
    backend: Arc<dyn StateBackend>,
    snapshot: RwLock<StateSnapshot>,
    address_locks: std::sync::Mutex<HashMap<ResourceAddress, Arc<Mutex<()>>>>,
    persist: Mutex<()>,
    lock: std::sync::Mutex<Option<LockInfo>>,
    heartbeat: std::sync::Mutex<Option<JoinHandle<()>>>,
    writable: bool,
    closed: AtomicBool,
}

impl StateStore {
    /// Locks the backend and loads the current snapshot for reading and writing.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is held elsewhere or the state cannot be loaded.
    pub async fn open(backend: Arc<dyn StateBackend>, holder: &str) -> Result<Self> {
        let lock = backend.acquire_lock(holder).await?;

        let snapshot = match Self::load_snapshot(backend.as_ref()).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                if let Err(release_err) = backend.release_lock(&lock.lock_id).await {
                    warn!("Failed to release state lock after load error: {release_err}");
                }
                return Err(e);
            }
        };

        info!(
            "Opened {} state at {} (serial {}, {} records)",
            backend.backend_type(),
            backend.location(),
            snapshot.serial,
            snapshot.len()
        );

        let heartbeat = Self::spawn_heartbeat(Arc::clone(&backend), lock.lock_id.clone());
        let store = Self::from_parts(backend, snapshot, Some(lock), true);
        *store.heartbeat.lock().unwrap_or_else(PoisonError::into_inner) = Some(heartbeat);
        Ok(store)
    }

    /// Loads the current snapshot without locking. Writes are rejected.
    ///
    /// # Errors
    ///
    /// Returns an error if the state cannot be loaded.
    pub async fn read_only(backend: Arc<dyn StateBackend>) -> Result<Self> {
        let snapshot = Self::load_snapshot(backend.as_ref()).await?;
        debug!("Opened read-only state (serial {})", snapshot.serial);
        Ok(Self::from_parts(backend, snapshot, None, false))
    }

    fn from_parts(
        backend: Arc<dyn StateBackend>,
        snapshot: StateSnapshot,
        lock: Option<LockInfo>,
        writable: bool,
    ) -> Self {
        Self {
            backend,
            snapshot: RwLock::new(snapshot),
            address_locks: std::sync::Mutex::new(HashMap::new()),
            persist: Mutex::new(()),
            lock: std::sync::Mutex::new(lock),
            heartbeat: std::sync::Mutex::new(None),
            writable,
            closed: AtomicBool::new(false),
        }
    }

    /// Renews the lock every [`LOCK_RENEW_INTERVAL_SECS`] until it is lost.
    fn spawn_heartbeat(backend: Arc<dyn StateBackend>, lock_id: String) -> JoinHandle<()> {
        tokio::spawn(async move {
            let period = Duration::from_secs(LOCK_RENEW_INTERVAL_SECS);
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                ticker.tick().await;
                match backend.renew_lock(&lock_id).await {
                    Ok(renewed) => debug!("Renewed state lock {lock_id} until {}", renewed.expires_at),
                    Err(e) => {
                        warn!("Stopped renewing state lock {lock_id}: {e}");
                        break;
                    }
                }
            }
        })
    }

    fn stop_heartbeat(&self) {
        if let Some(heartbeat) = self.heartbeat.lock().unwrap_or_else(PoisonError::into_inner).take() {
            heartbeat.abort();
        }
    }

    async fn load_snapshot(backend: &dyn StateBackend) -> Result<StateSnapshot> {
        let Some(snapshot) = backend.load().await? else {
            return Ok(StateSnapshot::new());
        };

        if snapshot.version != STATE_VERSION {
            return Err(ProvisioError::State(StateError::VersionMismatch {
                expected: STATE_VERSION.to_string(),
                found: snapshot.version,
            }));
        }

        Ok(snapshot)
    }

    /// Returns the record at `address`, if any.
    ///
    /// Readers take no address lock and may see the value from before an
    /// in-flight write to the same address commits.
    #[must_use]
    pub fn get(&self, address: &ResourceAddress) -> Option<StateRecord> {
        self.read_snapshot().records.get(address).cloned()
    }

    /// Returns a copy of the whole snapshot.
    #[must_use]
    pub fn snapshot(&self) -> StateSnapshot {
        self.read_snapshot().clone()
    }

    /// Returns the state lineage.
    #[must_use]
    pub fn lineage(&self) -> String {
        self.read_snapshot().lineage.clone()
    }

    /// Returns the snapshot serial.
    #[must_use]
    pub fn serial(&self) -> u64 {
        self.read_snapshot().serial
    }

    /// Returns the record addresses in order.
    #[must_use]
    pub fn addresses(&self) -> Vec<ResourceAddress> {
        self.read_snapshot().records.keys().cloned().collect()
    }

    /// Returns the lock held by this store, if any.
    #[must_use]
    pub fn lock_info(&self) -> Option<LockInfo> {
        self.lock.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Returns the backend.
    #[must_use]
    pub fn backend(&self) -> &Arc<dyn StateBackend> {
        &self.backend
    }

    /// Writes a record.
    ///
    /// `expected` is the serial the caller last read, `None` when the record
    /// is expected to be absent. The stored record gets the next serial and
    /// keeps its original creation time.
    ///
    /// # Errors
    ///
    /// Returns a conflict if the stored serial differs from `expected`, or a
    /// backend error if the save fails (the write is then rolled back).
    pub async fn put(&self, mut record: StateRecord, expected: Option<u64>) -> Result<StateRecord> {
        self.ensure_writable()?;
        let _address_guard = self.lock_address(&record.address).await;

        let current = self.get(&record.address);
        Self::check_serial(&record.address, expected, current.as_ref())?;

        let now = Utc::now();
        record.serial = current.as_ref().map_or(1, |c| c.serial + 1);
        record.created_at = current.as_ref().map_or(now, |c| c.created_at);
        record.updated_at = now;

        let address = record.address.clone();
        let stored = record.clone();
        self.commit(move |snapshot| {
            snapshot.records.insert(address, record);
        })
        .await?;

        debug!("Committed {} (serial {})", stored.address, stored.serial);
        Ok(stored)
    }

    /// Removes a record.
    ///
    /// Removing an absent record with `expected == None` is a no-op.
    ///
    /// # Errors
    ///
    /// Returns a conflict if the stored serial differs from `expected`, or a
    /// backend error if the save fails.
    pub async fn delete(&self, address: &ResourceAddress, expected: Option<u64>) -> Result<()> {
        self.ensure_writable()?;
        let _address_guard = self.lock_address(address).await;

        let current = self.get(address);
        Self::check_serial(address, expected, current.as_ref())?;

        if current.is_none() {
            return Ok(());
        }

        let address = address.clone();
        let removed = address.clone();
        self.commit(move |snapshot| {
            snapshot.records.remove(&address);
        })
        .await?;

        debug!("Removed {} from state", removed);
        Ok(())
    }

    /// Appends a run history entry.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is not writable or the save fails.
    pub async fn add_history(&self, entry: HistoryEntry) -> Result<()> {
        self.ensure_writable()?;
        self.commit(move |snapshot| snapshot.push_history(entry)).await
    }

    /// Re-reads the snapshot from the backend, discarding the in-memory copy.
    ///
    /// # Errors
    ///
    /// Returns an error if the state cannot be loaded.
    pub async fn reload(&self) -> Result<()> {
        let _persist = self.persist.lock().await;
        let fresh = Self::load_snapshot(self.backend.as_ref()).await?;
        info!("Reloaded state (serial {})", fresh.serial);
        *self.write_snapshot() = fresh;
        Ok(())
    }

    /// Releases the backend lock. Further writes fail with [`StateError::Closed`].
    ///
    /// Calling `close` more than once is harmless.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock cannot be released.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        // Wait for any in-flight save.
        let _persist = self.persist.lock().await;
        self.stop_heartbeat();

        let held = self.lock.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(lock) = held {
            self.backend.release_lock(&lock.lock_id).await?;
        }

        debug!("Closed state store");
        Ok(())
    }

    fn ensure_writable(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ProvisioError::State(StateError::Closed));
        }
        if !self.writable {
            return Err(ProvisioError::State(StateError::ReadOnly));
        }
        Ok(())
    }

    fn check_serial(address: &ResourceAddress, expected: Option<u64>, current: Option<&StateRecord>) -> Result<()> {
        let found = current.map(|c| c.serial);
        if found == expected {
            Ok(())
        } else {
            Err(ProvisioError::State(StateError::conflict(address.to_string(), expected, found)))
        }
    }

    async fn lock_address(&self, address: &ResourceAddress) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.address_locks.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(locks.entry(address.clone()).or_default())
        };
        lock.lock_owned().await
    }

    /// Applies `change` to a copy of the snapshot, bumps the serial, saves,
    /// and only then publishes the copy.
    async fn commit<F>(&self, change: F) -> Result<()>
    where
        F: FnOnce(&mut StateSnapshot),
    {
        let _persist = self.persist.lock().await;
        self.renew_held_lock().await?;

        let mut next = self.read_snapshot().clone();
        change(&mut next);
        next.serial += 1;
        next.last_updated = Utc::now();

        if let Err(e) = self.backend.save(&next).await {
            warn!("State save failed, serial {} not committed: {e}", next.serial);
            return Err(e);
        }

        *self.write_snapshot() = next;
        Ok(())
    }

    /// Confirms the backend lock is still ours and extends it.
    async fn renew_held_lock(&self) -> Result<()> {
        let lock_id = self
            .lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|l| l.lock_id.clone());

        if let Some(lock_id) = lock_id {
            let renewed = self.backend.renew_lock(&lock_id).await?;
            *self.lock.lock().unwrap_or_else(PoisonError::into_inner) = Some(renewed);
        }
        Ok(())
    }

    fn read_snapshot(&self) -> std::sync::RwLockReadGuard<'_, StateSnapshot> {
        self.snapshot.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_snapshot(&self) -> std::sync::RwLockWriteGuard<'_, StateSnapshot> {
        self.snapshot.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for StateStore {
    fn drop(&mut self) {
        self.stop_heartbeat();
    }
}

impl std::fmt::Debug for StateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateStore")
            .field("backend", &self.backend.backend_type())
            .field("serial", &self.serial())
            .field("writable", &self.writable)
            .finish_non_exhaustive()
    }
}
