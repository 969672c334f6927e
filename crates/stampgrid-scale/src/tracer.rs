//! Diagnostic sink for scale manager activity.
//!
//! Every trace carries the tick's activity id and the worker it is about.
//! [`TracingScaleTracer`] forwards them to `tracing`.

use stampgrid_state::WorkerInfo;
use tracing::{error, info, warn};

/// Structured trace sink injected into the scale manager.
pub trait ScaleTracer: Send + Sync {
    fn trace_information(&self, activity_id: &str, worker: &WorkerInfo, message: &str);

    fn trace_warning(&self, activity_id: &str, worker: &WorkerInfo, message: &str);

    fn trace_error(&self, activity_id: &str, worker: &WorkerInfo, message: &str);

    /// A worker was added to the site.
    fn trace_add_worker(&self, activity_id: &str, worker: &WorkerInfo, message: &str);

    /// A worker row was removed from the site.
    fn trace_remove_worker(&self, activity_id: &str, worker: &WorkerInfo, message: &str);

    /// A worker row was refreshed.
    fn trace_update_worker(&self, activity_id: &str, worker: &WorkerInfo, message: &str);
}

/// Default tracer: one `tracing` event per trace.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingScaleTracer;

impl ScaleTracer for TracingScaleTracer {
    fn trace_information(&self, activity_id: &str, worker: &WorkerInfo, message: &str) {
        info!(
            %activity_id,
            site = %worker.site_name,
            stamp = %worker.stamp_name,
            worker = %worker.worker_name,
            "{message}"
        );
    }

    fn trace_warning(&self, activity_id: &str, worker: &WorkerInfo, message: &str) {
        warn!(
            %activity_id,
            site = %worker.site_name,
            stamp = %worker.stamp_name,
            worker = %worker.worker_name,
            "{message}"
        );
    }

    fn trace_error(&self, activity_id: &str, worker: &WorkerInfo, message: &str) {
        error!(
            %activity_id,
            site = %worker.site_name,
            stamp = %worker.stamp_name,
            worker = %worker.worker_name,
            "{message}"
        );
    }

    fn trace_add_worker(&self, activity_id: &str, worker: &WorkerInfo, message: &str) {
        info!(
            %activity_id,
            action = "add",
            site = %worker.site_name,
            stamp = %worker.stamp_name,
            worker = %worker.worker_name,
            "{message}"
        );
    }

    fn trace_remove_worker(&self, activity_id: &str, worker: &WorkerInfo, message: &str) {
        info!(
            %activity_id,
            action = "remove",
            site = %worker.site_name,
            stamp = %worker.stamp_name,
            worker = %worker.worker_name,
            "{message}"
        );
    }

    fn trace_update_worker(&self, activity_id: &str, worker: &WorkerInfo, message: &str) {
        info!(
            %activity_id,
            action = "update",
            site = %worker.site_name,
            stamp = %worker.stamp_name,
            worker = %worker.worker_name,
            load_factor = worker.load_factor,
            "{message}"
        );
    }
}
