//! ScaleManager: the per-instance reconciliation tick.
//!
//! Every instance of a site runs one `ScaleManager`. A tick pings this
//! instance's own row, settles which worker leads the site, and, only on
//! the leader, runs the scale decision chain and the stale worker sweep.
//!
//! ```text
//! process_work_item
//!   ├─ provider.get_worker_info          self snapshot
//!   ├─ ping_worker                       throttled self-ping + row refresh
//!   ├─ ensure_manager                    election (lock + compare-and-set)
//!   └─ if leader:
//!        ├─ make_scale_decision          first acting heuristic wins
//!        └─ check_stale_worker           throttled sweep of stale rows
//! ```
//!
//! There is no coordinator between instances: the table lock around the
//! manager slot is the only mutual exclusion.

use std::sync::Arc;

use stampgrid_state::{WorkerInfo, WorkerKey, WorkerTable};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::debounce::{DebounceHandle, Debouncer};
use crate::error::{ScaleError, ScaleResult};
use crate::handler::{ScaleHandler, WorkerInfoProvider};
use crate::policy::{Heuristic, ScaleActions, default_heuristics};
use crate::settings::ScaleSettings;
use crate::throttle::Throttle;
use crate::tracer::ScaleTracer;
use crate::workers::{same_manager, worker_summary};

/// Requests an extra tick from a running [`ScaleManager`]. Bursts of
/// nudges within `nudge_debounce` collapse into one tick.
#[derive(Debug, Clone)]
pub struct Nudger {
    handle: DebounceHandle,
}

impl Nudger {
    pub fn nudge(&self) {
        self.handle.trigger();
    }
}

/// Scale manager of one worker instance.
pub struct ScaleManager {
    provider: Arc<dyn WorkerInfoProvider>,
    actions: ScaleActions,
    heuristics: Vec<Box<dyn Heuristic>>,
    ping_throttle: Throttle,
    manager_throttle: Throttle,
    scale_throttle: Throttle,
    stale_throttle: Throttle,
    last_pinged: Option<WorkerKey>,
    last_worker: Option<WorkerInfo>,
    nudge_handle: DebounceHandle,
    debouncer: Debouncer,
}

impl ScaleManager {
    pub fn new(
        provider: Arc<dyn WorkerInfoProvider>,
        table: Arc<dyn WorkerTable>,
        handler: Arc<dyn ScaleHandler>,
        tracer: Arc<dyn ScaleTracer>,
        settings: ScaleSettings,
    ) -> Self {
        let (nudge_handle, debouncer) = Debouncer::channel(settings.nudge_debounce);
        Self {
            provider,
            ping_throttle: Throttle::new(settings.worker_ping_interval),
            manager_throttle: Throttle::new(settings.manager_check_interval),
            scale_throttle: Throttle::new(settings.scale_check_interval),
            stale_throttle: Throttle::new(settings.stale_worker_check_interval),
            actions: ScaleActions::new(table, handler, tracer, settings),
            heuristics: default_heuristics(),
            last_pinged: None,
            last_worker: None,
            nudge_handle,
            debouncer,
        }
    }

    /// Replace the decision chain.
    pub fn with_heuristics(mut self, heuristics: Vec<Box<dyn Heuristic>>) -> Self {
        self.heuristics = heuristics;
        self
    }

    pub fn settings(&self) -> &ScaleSettings {
        self.actions.settings()
    }

    pub fn nudger(&self) -> Nudger {
        Nudger {
            handle: self.nudge_handle.clone(),
        }
    }

    /// The snapshot this instance reported on its last tick.
    pub fn last_worker(&self) -> Option<&WorkerInfo> {
        self.last_worker.as_ref()
    }

    fn table(&self) -> &dyn WorkerTable {
        self.actions.table().as_ref()
    }

    fn tracer(&self) -> &dyn ScaleTracer {
        self.actions.tracer()
    }

    // ── Tick ───────────────────────────────────────────────────

    /// Run one reconciliation tick.
    ///
    /// Any error ends the tick. [`ScaleError::NotOwned`] means this
    /// instance must leave the fleet.
    pub async fn process_work_item(&mut self, activity_id: &str) -> ScaleResult<()> {
        let worker = self
            .provider
            .get_worker_info(activity_id)
            .await
            .map_err(ScaleError::Provider)?;
        self.last_worker = Some(worker.clone());

        self.ping_worker(activity_id, &worker).await?;

        let current = self.ensure_manager(activity_id, &worker).await?;
        if same_manager(current.as_ref(), Some(&worker)) {
            self.make_scale_decision(activity_id, &worker).await?;
            self.check_stale_worker(activity_id, &worker).await?;
        }
        Ok(())
    }

    /// Tick immediately, then every `worker_update_interval` and on every
    /// debounced nudge, until `shutdown` flips or a tick fails.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) -> ScaleResult<()> {
        let mut interval = tokio::time::interval(self.settings().worker_update_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = self.debouncer.fired() => {
                    debug!("scale manager nudged");
                }
                _ = shutdown.changed() => {
                    info!("scale manager shutting down");
                    break;
                }
            }
            if *shutdown.borrow() {
                info!("scale manager shutting down");
                break;
            }

            let activity_id = Uuid::new_v4().to_string();
            if let Err(e) = self.process_work_item(&activity_id).await {
                let message = format!("Scale manager tick failed: {e}");
                match &self.last_worker {
                    Some(worker) => self.tracer().trace_error(&activity_id, worker, &message),
                    None => error!(%activity_id, error = %e, "scale manager tick failed"),
                }
                return Err(e);
            }
        }
        Ok(())
    }

    // ── Self-ping ──────────────────────────────────────────────

    /// Confirm with the fabric that `worker` still belongs to the site and
    /// refresh its row. At most once per `worker_ping_interval` for the
    /// same worker; calls inside the window do nothing.
    pub async fn ping_worker(&mut self, activity_id: &str, worker: &WorkerInfo) -> ScaleResult<()> {
        let key = worker.key();
        if self.last_pinged.as_ref() == Some(&key) && !self.ping_throttle.is_ready() {
            return Ok(());
        }

        let ok = self
            .actions
            .handler()
            .ping_worker(activity_id, worker)
            .await
            .map_err(ScaleError::Handler)?;
        self.ping_throttle.arm();
        self.last_pinged = Some(key);

        if ok {
            self.table().add_or_update(worker).await?;
            self.tracer().trace_update_worker(activity_id, worker, "Worker updated.");
            return Ok(());
        }

        self.tracer()
            .trace_warning(activity_id, worker, "Worker does not belong to the site.");
        self.table().delete(worker).await?;
        self.tracer()
            .trace_remove_worker(activity_id, worker, "Worker removed.");
        Err(ScaleError::NotOwned {
            worker: worker.display_name(),
        })
    }

    // ── Election ───────────────────────────────────────────────

    /// Settle which worker leads the site, preferring home-stamp workers.
    ///
    /// Returns `None` when a slave-stamp worker defers to a live home-stamp
    /// worker, or when the table lock was busy this tick.
    pub async fn ensure_manager(
        &mut self,
        activity_id: &str,
        worker: &WorkerInfo,
    ) -> ScaleResult<Option<WorkerInfo>> {
        if !self.manager_throttle.is_ready() {
            return Ok(self.table().get_manager().await?);
        }
        self.manager_throttle.arm();

        let current = self.table().get_manager().await?;
        if let Some(manager) = current.as_ref().filter(|m| !m.is_stale) {
            if !(worker.is_home_stamp && !manager.is_home_stamp) {
                return Ok(current);
            }
        } else if !worker.is_home_stamp {
            let live = self.table().list_non_stale().await?;
            if live.iter().any(|w| w.is_home_stamp) {
                debug!(worker = %worker, "deferring election to a home stamp worker");
                return Ok(None);
            }
        }
        self.try_set_manager(activity_id, worker, current.as_ref()).await
    }

    async fn try_set_manager(
        &self,
        activity_id: &str,
        worker: &WorkerInfo,
        expected: Option<&WorkerInfo>,
    ) -> ScaleResult<Option<WorkerInfo>> {
        match self.set_manager(activity_id, worker, expected).await {
            Err(e) if e.is_lock_conflict() => {
                self.tracer().trace_warning(
                    activity_id,
                    worker,
                    &format!("Unable to acquire table lock, skipping manager election: {e}"),
                );
                Ok(None)
            }
            other => other,
        }
    }

    /// Compare-and-set on the manager slot under the table lock.
    ///
    /// Writes `worker` only if the slot still names `expected`; otherwise
    /// returns the manager another instance elected. The lock is released
    /// on every path once acquired.
    pub async fn set_manager(
        &self,
        activity_id: &str,
        worker: &WorkerInfo,
        expected: Option<&WorkerInfo>,
    ) -> ScaleResult<Option<WorkerInfo>> {
        let lock = self.table().acquire_lock().await?;
        let lock_id = lock.id.clone();
        self.tracer()
            .trace_information(activity_id, worker, &format!("Acquire table lock id: {lock_id}"));

        let result = self.swap_manager(activity_id, worker, expected).await;

        let released = self.table().release_lock(lock).await;
        self.tracer()
            .trace_information(activity_id, worker, &format!("Release table lock id: {lock_id}"));

        let elected = result?;
        released?;
        Ok(elected)
    }

    async fn swap_manager(
        &self,
        activity_id: &str,
        worker: &WorkerInfo,
        expected: Option<&WorkerInfo>,
    ) -> ScaleResult<Option<WorkerInfo>> {
        let other = self.table().get_manager().await?;
        if !same_manager(other.as_ref(), expected) {
            debug!(worker = %worker, "manager changed since it was read, keeping the winner");
            return Ok(other);
        }

        self.table().set_manager(worker).await?;
        self.tracer()
            .trace_information(activity_id, worker, "This worker is set to be a manager.");
        Ok(Some(worker.clone()))
    }

    // ── Leader duties ──────────────────────────────────────────

    /// Run the heuristic chain over the live workers. At most once per
    /// `scale_check_interval`. Returns whether a heuristic acted.
    pub async fn make_scale_decision(
        &mut self,
        activity_id: &str,
        manager: &WorkerInfo,
    ) -> ScaleResult<bool> {
        if !self.scale_throttle.is_ready() {
            return Ok(false);
        }
        self.scale_throttle.arm();

        let workers = self.table().list_non_stale().await?;
        self.tracer()
            .trace_information(activity_id, manager, &worker_summary("NonStale", &workers));

        for heuristic in &self.heuristics {
            if heuristic
                .try_apply(&self.actions, activity_id, &workers, manager)
                .await?
            {
                debug!(heuristic = heuristic.name(), "scale heuristic acted");
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Ping every stale worker and clean up the ones that are gone. At
    /// most once per `stale_worker_check_interval`.
    pub async fn check_stale_worker(&mut self, activity_id: &str, manager: &WorkerInfo) -> ScaleResult<()> {
        if !self.stale_throttle.is_ready() {
            return Ok(());
        }
        self.stale_throttle.arm();

        let (stale, _fresh): (Vec<WorkerInfo>, Vec<WorkerInfo>) =
            self.table().list().await?.into_iter().partition(|w| w.is_stale);
        self.tracer()
            .trace_information(activity_id, manager, &worker_summary("Stale", &stale));

        for worker in &stale {
            match self.actions.handler().ping_worker(activity_id, worker).await {
                Ok(true) => {
                    debug!(worker = %worker, "stale worker answered ping, keeping row");
                }
                Ok(false) => {
                    self.tracer()
                        .trace_warning(activity_id, worker, "Worker does not belong to the site.");
                    self.table().delete(worker).await?;
                    self.tracer().trace_remove_worker(
                        activity_id,
                        worker,
                        &format!("Worker removed by manager ({})", manager.display_name()),
                    );
                }
                Err(e) => {
                    self.tracer().trace_warning(
                        activity_id,
                        worker,
                        &format!(
                            "Stale worker (LastModifiedTimeUtc={}) failed ping request: {e:#}",
                            worker.last_modified_utc.to_rfc3339()
                        ),
                    );
                    if let Err(e) = self
                        .actions
                        .request_remove_worker(activity_id, manager, worker)
                        .await
                    {
                        self.tracer().trace_warning(
                            activity_id,
                            worker,
                            &format!("Unable to remove stale worker: {e:#}"),
                        );
                    }
                }
            }
        }
        Ok(())
    }

    // ── Requests ───────────────────────────────────────────────

    pub async fn request_add_worker(
        &self,
        activity_id: &str,
        workers: &[WorkerInfo],
        manager: &WorkerInfo,
        force: bool,
        burst: u32,
    ) -> ScaleResult<bool> {
        self.actions
            .request_add_worker(activity_id, workers, manager, force, burst)
            .await
    }

    pub async fn request_remove_worker(
        &self,
        activity_id: &str,
        manager: &WorkerInfo,
        to_remove: &WorkerInfo,
    ) -> ScaleResult<bool> {
        self.actions
            .request_remove_worker(activity_id, manager, to_remove)
            .await
    }
}
