//! RedbWorkerTable: durable [`WorkerTable`] backed by redb.
//!
//! Worker rows, the manager slot, and the lock lease are JSON-serialized
//! into redb's `&[u8]` value columns. One database can hold many sites;
//! [`RedbWorkerTable::for_site`] hands out another site-scoped view over
//! the same `Arc<Database>`.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redb::{Database, ReadableDatabase, ReadableTable};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::table::{DEFAULT_STALE_THRESHOLD, TableLock, WorkerTable};
use crate::tables::*;
use crate::types::{WorkerInfo, WorkerKey};

/// Default lease on the table lock.
pub const DEFAULT_LOCK_LEASE: Duration = Duration::from_secs(60);

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Row keys are `{site}/{stamp}:{worker}`; a `/` in the site would let one
/// site's prefix scan match another's rows.
fn check_site_name(site_name: &str) -> StateResult<()> {
    if site_name.is_empty() || site_name.contains('/') {
        return Err(StateError::InvalidSiteName(site_name.to_string()));
    }
    Ok(())
}

/// Persisted lock lease for one site.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct LockLease {
    id: String,
    acquired_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

/// Site-scoped worker table backed by redb.
#[derive(Clone)]
pub struct RedbWorkerTable {
    db: Arc<Database>,
    site_name: String,
    stale_threshold: Duration,
    lock_lease: Duration,
}

impl RedbWorkerTable {
    /// Open (or create) a persistent table at the given path.
    pub fn open(path: &Path, site_name: &str) -> StateResult<Self> {
        check_site_name(site_name)?;
        let db = Database::create(path).map_err(map_err!(Open))?;
        let table = Self::with_db(Arc::new(db), site_name);
        table.ensure_tables()?;
        debug!(?path, site = %site_name, "worker table opened");
        Ok(table)
    }

    /// Create an ephemeral in-memory table (for testing).
    pub fn open_in_memory(site_name: &str) -> StateResult<Self> {
        check_site_name(site_name)?;
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let table = Self::with_db(Arc::new(db), site_name);
        table.ensure_tables()?;
        debug!(site = %site_name, "in-memory worker table opened");
        Ok(table)
    }

    fn with_db(db: Arc<Database>, site_name: &str) -> Self {
        Self {
            db,
            site_name: site_name.to_string(),
            stale_threshold: DEFAULT_STALE_THRESHOLD,
            lock_lease: DEFAULT_LOCK_LEASE,
        }
    }

    /// A view of another site over the same database.
    pub fn for_site(&self, site_name: &str) -> StateResult<Self> {
        check_site_name(site_name)?;
        Ok(Self {
            db: Arc::clone(&self.db),
            site_name: site_name.to_string(),
            stale_threshold: self.stale_threshold,
            lock_lease: self.lock_lease,
        })
    }

    /// Set the age after which rows read as stale.
    pub fn with_stale_threshold(mut self, threshold: Duration) -> Self {
        self.stale_threshold = threshold;
        self
    }

    /// Set how long an acquired lock stays valid without release.
    pub fn with_lock_lease(mut self, lease: Duration) -> Self {
        self.lock_lease = lease;
        self
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(WORKERS).map_err(map_err!(Table))?;
        txn.open_table(MANAGERS).map_err(map_err!(Table))?;
        txn.open_table(LOCKS).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
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

    fn decode_row(&self, bytes: &[u8], now: DateTime<Utc>) -> StateResult<WorkerInfo> {
        let mut row: WorkerInfo = serde_json::from_slice(bytes).map_err(map_err!(Deserialize))?;
        row.is_stale = row.is_stale_at(now, self.stale_threshold);
        Ok(row)
    }

    // ── Lock ───────────────────────────────────────────────────────

    fn try_lock(&self) -> StateResult<TableLock> {
        let lock = TableLock::new(&self.site_name);
        let lease_len = chrono::Duration::from_std(self.lock_lease).map_err(map_err!(Write))?;
        let lease = LockLease {
            id: lock.id.clone(),
            acquired_at: lock.acquired_at,
            expires_at: lock.acquired_at + lease_len,
        };
        let value = serde_json::to_vec(&lease).map_err(map_err!(Serialize))?;

        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(LOCKS).map_err(map_err!(Table))?;
            let held: Option<LockLease> = match table.get(self.site_name.as_str()).map_err(map_err!(Read))? {
                Some(guard) => Some(serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?),
                None => None,
            };
            if let Some(held) = held {
                if held.expires_at > lock.acquired_at {
                    // Dropping the transaction aborts it.
                    return Err(StateError::LockConflict {
                        site: self.site_name.clone(),
                        holder: held.id,
                    });
                }
                debug!(site = %self.site_name, expired = %held.id, "taking over expired table lock");
            }
            table
                .insert(self.site_name.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(site = %self.site_name, lock_id = %lock.id, "table lock acquired");
        Ok(lock)
    }

    fn unlock(&self, lock: &TableLock) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(LOCKS).map_err(map_err!(Table))?;
            let held: Option<LockLease> = match table.get(self.site_name.as_str()).map_err(map_err!(Read))? {
                Some(guard) => Some(serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?),
                None => None,
            };
            match held {
                Some(held) if held.id == lock.id => {
                    table.remove(self.site_name.as_str()).map_err(map_err!(Write))?;
                }
                _ => {
                    return Err(StateError::LockLost {
                        site: self.site_name.clone(),
                        lock_id: lock.id.clone(),
                    });
                }
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(site = %self.site_name, lock_id = %lock.id, "table lock released");
        Ok(())
    }

    // ── Workers ────────────────────────────────────────────────────

    fn put_worker(&self, worker: &WorkerInfo) -> StateResult<()> {
        self.check_site(worker)?;
        let key = worker.table_key();
        let mut row = worker.clone();
        row.last_modified_utc = Utc::now();

        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(WORKERS).map_err(map_err!(Table))?;
            let previous: Option<WorkerInfo> = match table.get(key.as_str()).map_err(map_err!(Read))? {
                Some(guard) => Some(serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?),
                None => None,
            };
            // Keep the timestamp strictly increasing per row.
            if let Some(previous) = previous
                && row.last_modified_utc <= previous.last_modified_utc
            {
                row.last_modified_utc = previous.last_modified_utc + chrono::Duration::microseconds(1);
            }
            let value = serde_json::to_vec(&row).map_err(map_err!(Serialize))?;
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%key, load_factor = worker.load_factor, "worker row stored");
        Ok(())
    }

    /// Store a row verbatim, keeping its `last_modified_utc`.
    pub fn put_row(&self, worker: &WorkerInfo) -> StateResult<()> {
        self.check_site(worker)?;
        let key = worker.table_key();
        let value = serde_json::to_vec(worker).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(WORKERS).map_err(map_err!(Table))?;
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    fn delete_worker(&self, worker: &WorkerInfo) -> StateResult<bool> {
        let key = worker.table_key();
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(WORKERS).map_err(map_err!(Table))?;
            existed = table.remove(key.as_str()).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%key, existed, "worker row deleted");
        Ok(existed)
    }

    fn list_workers(&self) -> StateResult<Vec<WorkerInfo>> {
        let prefix = format!("{}/", self.site_name);
        let now = Utc::now();
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(WORKERS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if key.value().starts_with(&prefix) {
                results.push(self.decode_row(value.value(), now)?);
            }
        }
        Ok(results)
    }

    // ── Manager slot ───────────────────────────────────────────────

    fn read_manager(&self) -> StateResult<Option<WorkerInfo>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let managers = txn.open_table(MANAGERS).map_err(map_err!(Table))?;
        let key: WorkerKey = match managers.get(self.site_name.as_str()).map_err(map_err!(Read))? {
            Some(guard) => serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?,
            None => return Ok(None),
        };

        let workers = txn.open_table(WORKERS).map_err(map_err!(Table))?;
        match workers.get(key.table_key().as_str()).map_err(map_err!(Read))? {
            Some(guard) => Ok(Some(self.decode_row(guard.value(), Utc::now())?)),
            // The manager's row was deleted: the slot reads as empty.
            None => Ok(None),
        }
    }

    fn write_manager(&self, worker: &WorkerInfo) -> StateResult<()> {
        self.check_site(worker)?;
        let value = serde_json::to_vec(&worker.key()).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(MANAGERS).map_err(map_err!(Table))?;
            table
                .insert(self.site_name.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(worker = %worker, "manager slot stored");
        Ok(())
    }
}

#[async_trait]
impl WorkerTable for RedbWorkerTable {
    fn site_name(&self) -> &str {
        &self.site_name
    }

    async fn acquire_lock(&self) -> StateResult<TableLock> {
        self.try_lock()
    }

    async fn release_lock(&self, lock: TableLock) -> StateResult<()> {
        self.unlock(&lock)
    }

    async fn add_or_update(&self, worker: &WorkerInfo) -> StateResult<()> {
        self.put_worker(worker)
    }

    async fn delete(&self, worker: &WorkerInfo) -> StateResult<()> {
        self.delete_worker(worker).map(|_| ())
    }

    async fn list(&self) -> StateResult<Vec<WorkerInfo>> {
        self.list_workers()
    }

    async fn get_manager(&self) -> StateResult<Option<WorkerInfo>> {
        self.read_manager()
    }

    async fn set_manager(&self, worker: &WorkerInfo) -> StateResult<()> {
        self.write_manager(worker)
    }
}
