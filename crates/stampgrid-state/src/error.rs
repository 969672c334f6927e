//! Error types for the worker table.

use thiserror::Error;

/// Result type alias for worker table operations.
pub type StateResult<T> = Result<T, StateError>;

/// Errors that can occur during worker table operations.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("failed to open database: {0}")]
    Open(String),

    #[error("transaction error: {0}")]
    Transaction(String),

    #[error("table error: {0}")]
    Table(String),

    #[error("read error: {0}")]
    Read(String),

    #[error("write error: {0}")]
    Write(String),

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("deserialization error: {0}")]
    Deserialize(String),

    /// The table lock for this site is already held.
    #[error("table lock for site {site} is held by {holder}")]
    LockConflict { site: String, holder: String },

    /// The lease behind a lock handle expired and was taken over.
    #[error("table lock {lock_id} for site {site} is no longer held")]
    LockLost { site: String, lock_id: String },

    /// Site names delimit row keys and may not contain `/`.
    #[error("invalid site name {0:?}")]
    InvalidSiteName(String),

    /// A row for another site was written through a site-scoped table.
    #[error("worker belongs to site {actual}, table is scoped to {expected}")]
    SiteMismatch { expected: String, actual: String },
}

impl StateError {
    /// Whether this error is a conflict on the table lock.
    pub fn is_lock_conflict(&self) -> bool {
        matches!(self, StateError::LockConflict { .. })
    }
}
