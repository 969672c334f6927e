//! stampgrid-scale: the per-site scale manager.
//!
//! Every worker instance of a site runs a [`ScaleManager`] on a timer. Each
//! tick the instance re-registers itself, takes part in electing the site's
//! manager, and, when it is the manager, applies the scale heuristics and
//! sweeps stale workers.
//!
//! # Election
//!
//! ```text
//! current manager valid?
//!   yes → home worker replacing a slave manager? → set_manager
//!         otherwise keep it
//!   no  → home worker                            → set_manager
//!         slave worker, live home worker exists  → defer (None)
//!         slave worker, no home worker           → set_manager
//! ```
//!
//! `set_manager` is a compare-and-set on the manager slot under the
//! table lock: a caller that lost the race gets the winner back.
//!
//! The fabric ([`ScaleHandler`]), the self snapshot
//! ([`WorkerInfoProvider`]), the diagnostics sink ([`ScaleTracer`]) and the
//! [`WorkerTable`](stampgrid_state::WorkerTable) are injected.

pub mod debounce;
pub mod error;
pub mod handler;
pub mod manager;
pub mod policy;
pub mod settings;
pub mod testing;
pub mod throttle;
pub mod tracer;
pub mod workers;

pub use error::{ScaleError, ScaleResult};
pub use handler::{ScaleHandler, WorkerInfoProvider};
pub use manager::{Nudger, ScaleManager};
pub use policy::{Heuristic, ScaleActions, default_heuristics};
pub use settings::{ScaleConfig, ScaleSettings, parse_duration};
pub use tracer::{ScaleTracer, TracingScaleTracer};
