//! Scale manager error types.

use stampgrid_state::StateError;
use thiserror::Error;

/// Errors that can end a scale manager tick.
#[derive(Debug, Error)]
pub enum ScaleError {
    /// The fabric no longer recognizes this worker as a member of the
    /// site. The instance must stop acting as part of the fleet.
    #[error("worker {worker} does not belong to the site")]
    NotOwned { worker: String },

    #[error("worker table error: {0}")]
    State(#[from] StateError),

    #[error("scale handler error: {0}")]
    Handler(anyhow::Error),

    #[error("worker info provider error: {0}")]
    Provider(anyhow::Error),

    #[error("invalid scale settings: {0}")]
    Config(String),
}

impl ScaleError {
    /// The instance must leave the fleet.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ScaleError::NotOwned { .. })
    }

    pub fn is_lock_conflict(&self) -> bool {
        matches!(self, ScaleError::State(e) if e.is_lock_conflict())
    }
}

pub type ScaleResult<T> = Result<T, ScaleError>;
