//! Fabric-facing collaborators of the scale manager.

use async_trait::async_trait;
use stampgrid_state::WorkerInfo;

/// Physically adds, removes, and pings workers through the hosting fabric.
#[async_trait]
pub trait ScaleHandler: Send + Sync {
    /// Ask the fabric for `count` new workers on one of `stamp_names`.
    ///
    /// Returns the stamp that accepted the request, or `None` when no
    /// candidate stamp had capacity.
    async fn try_add_worker(
        &self,
        activity_id: &str,
        stamp_names: &[String],
        count: u32,
    ) -> anyhow::Result<Option<String>>;

    /// Release a worker back to the fabric.
    async fn remove_worker(&self, activity_id: &str, worker: &WorkerInfo) -> anyhow::Result<()>;

    /// Check that `worker` is still assigned to the site.
    ///
    /// `Ok(false)` means the fabric positively rejected the worker; an
    /// error means it could not be reached.
    async fn ping_worker(&self, activity_id: &str, worker: &WorkerInfo) -> anyhow::Result<bool>;
}

/// Builds this instance's own current snapshot.
#[async_trait]
pub trait WorkerInfoProvider: Send + Sync {
    async fn get_worker_info(&self, activity_id: &str) -> anyhow::Result<WorkerInfo>;
}
