//! stampgrid-state: the shared worker table for stampgrid.
//!
//! Every running worker of a site self-reports a [`WorkerInfo`] row into a
//! [`WorkerTable`]. The table also holds the site's single manager slot and
//! a table-wide exclusive lock used to serialize manager election.
//!
//! # Implementations
//!
//! - [`MemoryWorkerTable`]: in-process reference implementation, shared
//!   behind an `Arc` by every simulated instance.
//! - [`RedbWorkerTable`]: durable implementation backed by
//!   [redb](https://docs.rs/redb). Rows are JSON-serialized into `&[u8]`
//!   value columns under composite keys `{site}/{stamp}:{worker}`; the lock
//!   is a lease row with an expiry so a crashed holder cannot wedge the site.
//!
//! Both implementations derive `is_stale` on read from the row's
//! `last_modified_utc` and the table's staleness threshold, and resolve the
//! manager slot against the live worker rows, so deleting the manager's row
//! clears the slot implicitly.

pub mod error;
pub mod memory;
pub mod store;
pub mod table;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use memory::MemoryWorkerTable;
pub use store::{DEFAULT_LOCK_LEASE, RedbWorkerTable};
pub use table::{DEFAULT_STALE_THRESHOLD, TableLock, WorkerTable};
pub use types::*;
