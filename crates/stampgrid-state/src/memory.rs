//! MemoryWorkerTable: in-process reference implementation of
//! [`WorkerTable`].
//!
//! Share one instance behind an `Arc` between every simulated worker of a
//! site. The lock never expires and a second acquire fails immediately
//! with a conflict.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::table::{DEFAULT_STALE_THRESHOLD, TableLock, WorkerTable};
use crate::types::{WorkerInfo, WorkerKey};

#[derive(Default)]
struct MemoryState {
    workers: BTreeMap<WorkerKey, WorkerInfo>,
    manager: Option<WorkerKey>,
    lock: Option<TableLock>,
    manager_writes: u64,
}

/// In-memory worker table for one site.
pub struct MemoryWorkerTable {
    site_name: String,
    stale_threshold: Duration,
    inner: Mutex<MemoryState>,
}

impl MemoryWorkerTable {
    /// Create an empty table for `site_name`.
    pub fn new(site_name: &str) -> Self {
        Self {
            site_name: site_name.to_string(),
            stale_threshold: DEFAULT_STALE_THRESHOLD,
            inner: Mutex::new(MemoryState::default()),
        }
    }

    /// Set the age after which rows read as stale.
    pub fn with_stale_threshold(mut self, threshold: Duration) -> Self {
        self.stale_threshold = threshold;
        self
    }

    pub fn stale_threshold(&self) -> Duration {
        self.stale_threshold
    }

    /// Store a row verbatim, keeping its `last_modified_utc`. Used to seed
    /// rows with a known age.
    pub async fn put_row(&self, worker: &WorkerInfo) -> StateResult<()> {
        self.check_site(worker)?;
        let mut state = self.inner.lock().await;
        state.workers.insert(worker.key(), worker.clone());
        Ok(())
    }

    /// Whether the table lock is currently held.
    pub async fn is_locked(&self) -> bool {
        self.inner.lock().await.lock.is_some()
    }

    /// Number of manager slot writes since creation.
    pub async fn manager_writes(&self) -> u64 {
        self.inner.lock().await.manager_writes
    }

    fn check_site(&self, worker: &WorkerInfo) -> StateResult<()> {
        if worker.site_name != self.site_name {
            return Err(StateError::SiteMismatch {
                expected: self.site_name.clone(),
                actual: worker.site_name.clone(),
            });
        }
        Ok(())
    }

    fn with_staleness(&self, worker: &WorkerInfo) -> WorkerInfo {
        let mut row = worker.clone();
        row.is_stale = row.is_stale_at(Utc::now(), self.stale_threshold);
        row
    }
}

#[async_trait]
impl WorkerTable for MemoryWorkerTable {
    fn site_name(&self) -> &str {
        &self.site_name
    }

    async fn acquire_lock(&self) -> StateResult<TableLock> {
        let mut state = self.inner.lock().await;
        if let Some(held) = &state.lock {
            return Err(StateError::LockConflict {
                site: self.site_name.clone(),
                holder: held.id.clone(),
            });
        }
        let lock = TableLock::new(&self.site_name);
        state.lock = Some(lock.clone());
        debug!(site = %self.site_name, lock_id = %lock.id, "table lock acquired");
        Ok(lock)
    }

    async fn release_lock(&self, lock: TableLock) -> StateResult<()> {
        let mut state = self.inner.lock().await;
        match &state.lock {
            Some(held) if held.id == lock.id => {
                state.lock = None;
                debug!(site = %self.site_name, lock_id = %lock.id, "table lock released");
                Ok(())
            }
            _ => Err(StateError::LockLost {
                site: self.site_name.clone(),
                lock_id: lock.id,
            }),
        }
    }

    async fn add_or_update(&self, worker: &WorkerInfo) -> StateResult<()> {
        self.check_site(worker)?;
        let mut state = self.inner.lock().await;
        let key = worker.key();

        let mut row = worker.clone();
        row.is_stale = false;
        row.last_modified_utc = Utc::now();
        // Keep the timestamp strictly increasing per row.
        if let Some(previous) = state.workers.get(&key)
            && row.last_modified_utc <= previous.last_modified_utc
        {
            row.last_modified_utc = previous.last_modified_utc + chrono::Duration::microseconds(1);
        }

        state.workers.insert(key, row);
        debug!(worker = %worker, load_factor = worker.load_factor, "worker row stored");
        Ok(())
    }

    async fn delete(&self, worker: &WorkerInfo) -> StateResult<()> {
        let mut state = self.inner.lock().await;
        let existed = state.workers.remove(&worker.key()).is_some();
        debug!(worker = %worker, existed, "worker row deleted");
        Ok(())
    }

    async fn list(&self) -> StateResult<Vec<WorkerInfo>> {
        let state = self.inner.lock().await;
        Ok(state.workers.values().map(|w| self.with_staleness(w)).collect())
    }

    async fn get_manager(&self) -> StateResult<Option<WorkerInfo>> {
        let state = self.inner.lock().await;
        let manager = state
            .manager
            .as_ref()
            .and_then(|key| state.workers.get(key))
            .map(|w| self.with_staleness(w));
        Ok(manager)
    }

    async fn set_manager(&self, worker: &WorkerInfo) -> StateResult<()> {
        self.check_site(worker)?;
        let mut state = self.inner.lock().await;
        state.manager = Some(worker.key());
        state.manager_writes += 1;
        debug!(worker = %worker, "manager slot stored");
        Ok(())
    }
}
