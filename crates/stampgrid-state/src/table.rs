//! The `WorkerTable` contract shared by every table implementation.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::StateResult;
use crate::types::WorkerInfo;

/// Default age after which a row reads as stale.
pub const DEFAULT_STALE_THRESHOLD: Duration = Duration::from_secs(300);

/// Handle for a held table lock. Give it back with
/// [`WorkerTable::release_lock`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableLock {
    pub id: String,
    pub site_name: String,
    pub acquired_at: DateTime<Utc>,
}

impl TableLock {
    pub(crate) fn new(site_name: &str) -> Self {
        Self {
            id: uuid::Uuid::new_v4().simple().to_string(),
            site_name: site_name.to_string(),
            acquired_at: Utc::now(),
        }
    }
}

/// Durable, shared registry of the worker rows of one site, plus the
/// site's manager slot and an exclusive table lock.
///
/// Upserts and deletes are idempotent. Only the manager slot write is
/// expected to run under the lock.
#[async_trait]
pub trait WorkerTable: Send + Sync {
    /// The site this table is scoped to.
    fn site_name(&self) -> &str;

    /// Take the table-wide lock. Fails with
    /// [`StateError::LockConflict`](crate::StateError::LockConflict) if it
    /// is already held; never blocks.
    async fn acquire_lock(&self) -> StateResult<TableLock>;

    /// Release a lock taken with [`acquire_lock`](Self::acquire_lock).
    async fn release_lock(&self, lock: TableLock) -> StateResult<()>;

    /// Insert or refresh a row, stamping `last_modified_utc`.
    async fn add_or_update(&self, worker: &WorkerInfo) -> StateResult<()>;

    /// Delete a row. Deleting a missing row is not an error.
    async fn delete(&self, worker: &WorkerInfo) -> StateResult<()>;

    /// All rows of the site, with `is_stale` derived.
    async fn list(&self) -> StateResult<Vec<WorkerInfo>>;

    /// The current manager's row, or `None` if the slot is empty or names
    /// a worker that no longer has a row.
    async fn get_manager(&self) -> StateResult<Option<WorkerInfo>>;

    /// Point the manager slot at `worker`.
    async fn set_manager(&self, worker: &WorkerInfo) -> StateResult<()>;

    async fn list_non_stale(&self) -> StateResult<Vec<WorkerInfo>> {
        let workers = self.list().await?;
        Ok(workers.into_iter().filter(|w| !w.is_stale).collect())
    }

    async fn list_stale(&self) -> StateResult<Vec<WorkerInfo>> {
        let workers = self.list().await?;
        Ok(workers.into_iter().filter(|w| w.is_stale).collect())
    }
}
