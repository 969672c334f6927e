//! Scale decision policy: the ordered heuristic chain run by the manager.
//!
//! Each [`Heuristic`] looks at the live workers of the site and either
//! acts (returns `true`, ending the chain for this tick) or passes. They
//! mutate the fleet only through [`ScaleActions`], which owns the
//! add/remove request paths.
//!
//! # Default chain
//!
//! ```text
//! 1. RemoveIfMaxWorkers          count > max_workers       → remove excess
//! 2. AddIfLoadFactorMaxWorker    any load == MAX           → add one
//! 3. SwapIfLoadFactorMinWorker   any load == MIN           → forced add, remove it
//! 4. AddIfMaxBusyWorkerRatio     busy ratio > max          → add one
//! 5. RemoveIfMaxFreeWorkerRatio  free ratio > max          → remove one
//! 6. RemoveSlaveWorker           no busy worker, a slave   → add on home, remove slave
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use stampgrid_state::{WorkerInfo, WorkerTable};
use tracing::debug;

use crate::error::{ScaleError, ScaleResult};
use crate::handler::ScaleHandler;
use crate::settings::ScaleSettings;
use crate::tracer::ScaleTracer;
use crate::workers::{candidate_stamps, sort_by_removing_order};

/// The add/remove request paths shared by the manager and its heuristics.
#[derive(Clone)]
pub struct ScaleActions {
    table: Arc<dyn WorkerTable>,
    handler: Arc<dyn ScaleHandler>,
    tracer: Arc<dyn ScaleTracer>,
    settings: ScaleSettings,
}

impl ScaleActions {
    pub fn new(
        table: Arc<dyn WorkerTable>,
        handler: Arc<dyn ScaleHandler>,
        tracer: Arc<dyn ScaleTracer>,
        settings: ScaleSettings,
    ) -> Self {
        Self {
            table,
            handler,
            tracer,
            settings,
        }
    }

    pub fn settings(&self) -> &ScaleSettings {
        &self.settings
    }

    pub fn table(&self) -> &Arc<dyn WorkerTable> {
        &self.table
    }

    pub fn handler(&self) -> &Arc<dyn ScaleHandler> {
        &self.handler
    }

    pub fn tracer(&self) -> &dyn ScaleTracer {
        self.tracer.as_ref()
    }

    /// Ask the fabric for `burst` more workers on one of the stamps
    /// already hosting `workers`.
    ///
    /// Unless `force` is set, refuses without calling the handler when the
    /// site is already at `max_workers`. Returns whether a stamp accepted.
    pub async fn request_add_worker(
        &self,
        activity_id: &str,
        workers: &[WorkerInfo],
        manager: &WorkerInfo,
        force: bool,
        burst: u32,
    ) -> ScaleResult<bool> {
        let max_workers = self.settings.max_workers;
        if !force && workers.len() >= max_workers {
            self.tracer.trace_warning(
                activity_id,
                manager,
                &format!("Unable to add new worker due to maximum number of workers ({max_workers}) allowed."),
            );
            return Ok(false);
        }

        let stamp_names = candidate_stamps(workers);
        let added = self
            .handler
            .try_add_worker(activity_id, &stamp_names, burst)
            .await
            .map_err(ScaleError::Handler)?;

        match added {
            Some(stamp) if !stamp.is_empty() => {
                self.tracer
                    .trace_add_worker(activity_id, manager, &format!("New worker added to {stamp} stamp"));
                Ok(true)
            }
            _ => {
                self.tracer.trace_warning(
                    activity_id,
                    manager,
                    &format!("Unable to add worker to existing [{}] stamps.", stamp_names.join(", ")),
                );
                Ok(false)
            }
        }
    }

    /// Release `to_remove` to the fabric, then drop its row.
    pub async fn request_remove_worker(
        &self,
        activity_id: &str,
        manager: &WorkerInfo,
        to_remove: &WorkerInfo,
    ) -> ScaleResult<bool> {
        self.handler
            .remove_worker(activity_id, to_remove)
            .await
            .map_err(ScaleError::Handler)?;
        self.table.delete(to_remove).await?;

        self.tracer.trace_remove_worker(
            activity_id,
            to_remove,
            &format!("Worker removed by manager ({})", manager.display_name()),
        );
        Ok(true)
    }
}

/// One step of the scale decision chain.
#[async_trait]
pub trait Heuristic: Send + Sync {
    fn name(&self) -> &'static str;

    /// Act on `workers` if this heuristic's trigger holds. Returns whether
    /// it acted.
    async fn try_apply(
        &self,
        actions: &ScaleActions,
        activity_id: &str,
        workers: &[WorkerInfo],
        manager: &WorkerInfo,
    ) -> ScaleResult<bool>;
}

/// The six heuristics in evaluation order.
pub fn default_heuristics() -> Vec<Box<dyn Heuristic>> {
    vec![
        Box::new(RemoveIfMaxWorkers),
        Box::new(AddIfLoadFactorMaxWorker),
        Box::new(SwapIfLoadFactorMinWorker),
        Box::new(AddIfMaxBusyWorkerRatio),
        Box::new(RemoveIfMaxFreeWorkerRatio),
        Box::new(RemoveSlaveWorker),
    ]
}

fn ratio(count: usize, total: usize) -> f64 {
    if total == 0 {
        0.0
    } else {
        count as f64 / total as f64
    }
}

/// Trim the site back to `max_workers`.
pub struct RemoveIfMaxWorkers;

#[async_trait]
impl Heuristic for RemoveIfMaxWorkers {
    fn name(&self) -> &'static str {
        "remove_if_max_workers"
    }

    async fn try_apply(
        &self,
        actions: &ScaleActions,
        activity_id: &str,
        workers: &[WorkerInfo],
        manager: &WorkerInfo,
    ) -> ScaleResult<bool> {
        let count = workers.len();
        let max_workers = actions.settings().max_workers;
        if count <= max_workers {
            return Ok(false);
        }

        actions.tracer().trace_information(
            activity_id,
            manager,
            &format!("Number of workers ({count}) exceeds maximum number of workers ({max_workers}) allowed."),
        );

        for to_remove in sort_by_removing_order(workers).iter().take(count - max_workers) {
            actions.request_remove_worker(activity_id, manager, to_remove).await?;
        }
        Ok(true)
    }
}

/// A worker demanded scale-out.
pub struct AddIfLoadFactorMaxWorker;

#[async_trait]
impl Heuristic for AddIfLoadFactorMaxWorker {
    fn name(&self) -> &'static str {
        "add_if_load_factor_max_worker"
    }

    async fn try_apply(
        &self,
        actions: &ScaleActions,
        activity_id: &str,
        workers: &[WorkerInfo],
        manager: &WorkerInfo,
    ) -> ScaleResult<bool> {
        let Some(demanding) = workers.iter().find(|w| w.demands_scale_out()) else {
            return Ok(false);
        };

        actions
            .tracer()
            .trace_information(activity_id, demanding, "Worker has maximum load factor.");
        actions
            .request_add_worker(activity_id, workers, manager, false, 1)
            .await?;
        Ok(true)
    }
}

/// A worker asked to retire: bring up a replacement, then remove it.
/// One swap per tick.
pub struct SwapIfLoadFactorMinWorker;

#[async_trait]
impl Heuristic for SwapIfLoadFactorMinWorker {
    fn name(&self) -> &'static str {
        "swap_if_load_factor_min_worker"
    }

    async fn try_apply(
        &self,
        actions: &ScaleActions,
        activity_id: &str,
        workers: &[WorkerInfo],
        manager: &WorkerInfo,
    ) -> ScaleResult<bool> {
        let Some(retiring) = sort_by_removing_order(workers)
            .into_iter()
            .find(|w| w.requests_swap())
        else {
            return Ok(false);
        };

        actions
            .tracer()
            .trace_information(activity_id, &retiring, "Worker has minimum load factor.");

        // The swap goes ahead whether or not the replacement was placed.
        actions
            .request_add_worker(activity_id, workers, manager, true, 1)
            .await?;
        actions
            .request_remove_worker(activity_id, manager, &retiring)
            .await?;
        Ok(true)
    }
}

/// Too many busy workers.
pub struct AddIfMaxBusyWorkerRatio;

#[async_trait]
impl Heuristic for AddIfMaxBusyWorkerRatio {
    fn name(&self) -> &'static str {
        "add_if_max_busy_worker_ratio"
    }

    async fn try_apply(
        &self,
        actions: &ScaleActions,
        activity_id: &str,
        workers: &[WorkerInfo],
        manager: &WorkerInfo,
    ) -> ScaleResult<bool> {
        let settings = actions.settings();
        let busy = workers
            .iter()
            .filter(|w| w.load_factor >= settings.busy_worker_load_factor)
            .count();
        let busy_ratio = ratio(busy, workers.len());
        if busy_ratio <= settings.max_busy_worker_ratio {
            return Ok(false);
        }

        actions.tracer().trace_information(
            activity_id,
            manager,
            &format!(
                "Busy worker ratio ({busy_ratio:.3}) exceeds maximum busy worker ratio ({:.3}).",
                settings.max_busy_worker_ratio
            ),
        );
        actions
            .request_add_worker(activity_id, workers, manager, false, 1)
            .await?;
        Ok(true)
    }
}

/// Too many free workers: drop the first in removing order, which is a
/// slave-stamp worker whenever one exists.
pub struct RemoveIfMaxFreeWorkerRatio;

#[async_trait]
impl Heuristic for RemoveIfMaxFreeWorkerRatio {
    fn name(&self) -> &'static str {
        "remove_if_max_free_worker_ratio"
    }

    async fn try_apply(
        &self,
        actions: &ScaleActions,
        activity_id: &str,
        workers: &[WorkerInfo],
        manager: &WorkerInfo,
    ) -> ScaleResult<bool> {
        let settings = actions.settings();
        let free = workers
            .iter()
            .filter(|w| w.load_factor <= settings.free_worker_load_factor)
            .count();
        let free_ratio = ratio(free, workers.len());
        if free_ratio <= settings.max_free_worker_ratio {
            return Ok(false);
        }

        actions.tracer().trace_information(
            activity_id,
            manager,
            &format!(
                "Free worker ratio ({free_ratio:.3}) exceeds maximum free worker ratio ({:.3}).",
                settings.max_free_worker_ratio
            ),
        );
        if let Some(to_remove) = sort_by_removing_order(workers).first() {
            actions
                .request_remove_worker(activity_id, manager, to_remove)
                .await?;
        }
        Ok(true)
    }
}

/// With no busy worker left, move slave-stamp capacity back to the home
/// stamp: the slave worker goes only once a home-stamp worker was added.
pub struct RemoveSlaveWorker;

#[async_trait]
impl Heuristic for RemoveSlaveWorker {
    fn name(&self) -> &'static str {
        "remove_slave_worker"
    }

    async fn try_apply(
        &self,
        actions: &ScaleActions,
        activity_id: &str,
        workers: &[WorkerInfo],
        manager: &WorkerInfo,
    ) -> ScaleResult<bool> {
        let busy_load = actions.settings().busy_worker_load_factor;
        if workers.iter().any(|w| w.load_factor >= busy_load) {
            return Ok(false);
        }
        let Some(to_remove) = sort_by_removing_order(workers)
            .into_iter()
            .find(|w| !w.is_home_stamp)
        else {
            return Ok(false);
        };

        actions.tracer().trace_information(
            activity_id,
            &to_remove,
            &format!(
                "Try remove slave worker to scale back to home stamp by manager ({}).",
                manager.display_name()
            ),
        );

        // No candidate stamps: the fabric places the worker on the home stamp.
        if actions
            .request_add_worker(activity_id, &[], manager, true, 1)
            .await?
        {
            actions
                .request_remove_worker(activity_id, manager, &to_remove)
                .await?;
        } else {
            debug!(worker = %to_remove, "home stamp has no capacity, keeping slave worker");
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{HandlerCall, RecordingHandler, RecordingTracer, TraceKind};
    use stampgrid_state::{LOAD_FACTOR_MAX, LOAD_FACTOR_MIN, MemoryWorkerTable};

    const SITE: &str = "site";
    const HOME: &str = "home";
    const SLAVE: &str = "slave";

    fn worker(stamp: &str, name: &str, load: i32) -> WorkerInfo {
        WorkerInfo::new(SITE, stamp, name, HOME).with_load_factor(load)
    }

    struct Fixture {
        table: Arc<MemoryWorkerTable>,
        handler: Arc<RecordingHandler>,
        tracer: Arc<RecordingTracer>,
        actions: ScaleActions,
    }

    async fn fixture(settings: ScaleSettings, workers: &[WorkerInfo]) -> Fixture {
        let table = Arc::new(MemoryWorkerTable::new(SITE));
        for w in workers {
            table.add_or_update(w).await.unwrap();
        }
        let handler = Arc::new(RecordingHandler::new());
        let tracer = Arc::new(RecordingTracer::new());
        let actions = ScaleActions::new(table.clone(), handler.clone(), tracer.clone(), settings);
        Fixture {
            table,
            handler,
            tracer,
            actions,
        }
    }

    fn four_workers() -> Vec<WorkerInfo> {
        vec![
            worker(HOME, "home-free", 10),
            worker(HOME, "home-busy", 90),
            worker(SLAVE, "slave-free", 10),
            worker(SLAVE, "slave-busy", 90),
        ]
    }

    fn settings_with_max(max_workers: usize) -> ScaleSettings {
        ScaleSettings {
            max_workers,
            ..ScaleSettings::default()
        }
    }

    #[tokio::test]
    async fn request_add_refuses_at_capacity_without_force() {
        let workers = four_workers();
        let f = fixture(settings_with_max(4), &workers).await;

        let added = f
            .actions
            .request_add_worker("act", &workers, &workers[0], false, 1)
            .await
            .unwrap();

        assert!(!added);
        assert!(f.handler.calls().is_empty());
        assert_eq!(f.tracer.count(TraceKind::Warning), 1);
    }

    #[tokio::test]
    async fn request_add_forced_ignores_capacity() {
        let workers = four_workers();
        let f = fixture(settings_with_max(4), &workers).await;
        f.handler.set_add_result(Some("home"));

        let added = f
            .actions
            .request_add_worker("act", &workers, &workers[0], true, 1)
            .await
            .unwrap();

        assert!(added);
        assert_eq!(
            f.handler.calls(),
            vec![HandlerCall::Add {
                stamps: vec![HOME.to_string(), SLAVE.to_string()],
                count: 1
            }]
        );
        assert_eq!(f.tracer.count(TraceKind::AddWorker), 1);
    }

    #[tokio::test]
    async fn request_add_without_capacity_anywhere_returns_false() {
        let workers = vec![worker(HOME, "w1", 90)];
        let f = fixture(settings_with_max(4), &workers).await;
        f.handler.set_add_result(None);

        let added = f
            .actions
            .request_add_worker("act", &workers, &workers[0], false, 1)
            .await
            .unwrap();

        assert!(!added);
        assert_eq!(f.handler.add_calls(), 1);
        assert_eq!(f.tracer.count(TraceKind::Warning), 1);
    }

    #[tokio::test]
    async fn request_remove_releases_then_deletes_row() {
        let workers = four_workers();
        let f = fixture(ScaleSettings::default(), &workers).await;

        let removed = f
            .actions
            .request_remove_worker("act", &workers[0], &workers[2])
            .await
            .unwrap();

        assert!(removed);
        assert_eq!(f.handler.removed(), vec![workers[2].key()]);
        assert_eq!(f.table.list().await.unwrap().len(), 3);
        assert_eq!(f.tracer.count(TraceKind::RemoveWorker), 1);
    }

    #[tokio::test]
    async fn excess_workers_are_removed_slaves_first() {
        let workers = four_workers();
        let f = fixture(settings_with_max(2), &workers).await;

        let acted = RemoveIfMaxWorkers
            .try_apply(&f.actions, "act", &workers, &workers[0])
            .await
            .unwrap();

        assert!(acted);
        let removed: Vec<String> = f.handler.removed().into_iter().map(|k| k.worker_name).collect();
        assert_eq!(removed, ["slave-free", "slave-busy"]);
    }

    #[tokio::test]
    async fn within_capacity_nothing_is_removed() {
        let workers = four_workers();
        let f = fixture(settings_with_max(4), &workers).await;

        let acted = RemoveIfMaxWorkers
            .try_apply(&f.actions, "act", &workers, &workers[0])
            .await
            .unwrap();

        assert!(!acted);
        assert!(f.handler.calls().is_empty());
    }

    #[tokio::test]
    async fn max_load_factor_requests_one_worker() {
        let workers = vec![worker(HOME, "w1", 10), worker(SLAVE, "w2", LOAD_FACTOR_MAX)];
        let f = fixture(ScaleSettings::default(), &workers).await;
        f.handler.set_add_result(Some(HOME));

        let acted = AddIfLoadFactorMaxWorker
            .try_apply(&f.actions, "act", &workers, &workers[0])
            .await
            .unwrap();

        assert!(acted);
        assert_eq!(f.handler.add_calls(), 1);
    }

    #[tokio::test]
    async fn max_load_factor_at_capacity_still_acts_without_adding() {
        let workers = vec![worker(HOME, "w1", LOAD_FACTOR_MAX)];
        let f = fixture(settings_with_max(1), &workers).await;

        let acted = AddIfLoadFactorMaxWorker
            .try_apply(&f.actions, "act", &workers, &workers[0])
            .await
            .unwrap();

        assert!(acted);
        assert_eq!(f.handler.add_calls(), 0);
    }

    #[tokio::test]
    async fn min_load_factor_swaps_the_worker() {
        let workers = vec![worker(HOME, "w1", 50), worker(HOME, "w2", LOAD_FACTOR_MIN)];
        let f = fixture(settings_with_max(2), &workers).await;
        f.handler.set_add_result(None);

        let acted = SwapIfLoadFactorMinWorker
            .try_apply(&f.actions, "act", &workers, &workers[0])
            .await
            .unwrap();

        assert!(acted);
        // Forced past max_workers, and the removal happens even though no
        // stamp had capacity.
        assert_eq!(f.handler.add_calls(), 1);
        assert_eq!(f.handler.removed(), vec![workers[1].key()]);
    }

    #[tokio::test]
    async fn busy_ratio_above_max_adds() {
        let workers = vec![
            worker(HOME, "w1", 85),
            worker(HOME, "w2", 95),
            worker(HOME, "w3", 80),
        ];
        let f = fixture(ScaleSettings::default(), &workers).await;
        f.handler.set_add_result(Some(HOME));

        let acted = AddIfMaxBusyWorkerRatio
            .try_apply(&f.actions, "act", &workers, &workers[0])
            .await
            .unwrap();

        assert!(acted);
        assert_eq!(f.handler.add_calls(), 1);
    }

    #[tokio::test]
    async fn busy_ratio_at_max_passes() {
        // 4 of 5 busy is exactly 0.8.
        let workers = vec![
            worker(HOME, "w1", 85),
            worker(HOME, "w2", 95),
            worker(HOME, "w3", 80),
            worker(HOME, "w4", 90),
            worker(HOME, "w5", 10),
        ];
        let f = fixture(ScaleSettings::default(), &workers).await;

        let acted = AddIfMaxBusyWorkerRatio
            .try_apply(&f.actions, "act", &workers, &workers[0])
            .await
            .unwrap();

        assert!(!acted);
    }

    #[tokio::test]
    async fn empty_listing_triggers_no_ratio_heuristic() {
        let f = fixture(ScaleSettings::default(), &[]).await;
        let manager = worker(HOME, "w1", 0);

        assert!(!AddIfMaxBusyWorkerRatio.try_apply(&f.actions, "act", &[], &manager).await.unwrap());
        assert!(!RemoveIfMaxFreeWorkerRatio.try_apply(&f.actions, "act", &[], &manager).await.unwrap());
        assert!(!RemoveSlaveWorker.try_apply(&f.actions, "act", &[], &manager).await.unwrap());
    }

    #[tokio::test]
    async fn free_ratio_removes_a_slave_worker_first() {
        let workers = vec![
            worker(HOME, "h1", 5),
            worker(HOME, "h2", 10),
            worker(SLAVE, "s1", 15),
        ];
        let f = fixture(ScaleSettings::default(), &workers).await;

        let acted = RemoveIfMaxFreeWorkerRatio
            .try_apply(&f.actions, "act", &workers, &workers[0])
            .await
            .unwrap();

        assert!(acted);
        assert_eq!(f.handler.removed(), vec![workers[2].key()]);
    }

    #[tokio::test]
    async fn slave_worker_is_consolidated_when_home_accepts() {
        let workers = vec![worker(HOME, "h1", 50), worker(SLAVE, "s1", 50)];
        let f = fixture(ScaleSettings::default(), &workers).await;
        f.handler.set_add_result(Some(HOME));

        let acted = RemoveSlaveWorker
            .try_apply(&f.actions, "act", &workers, &workers[0])
            .await
            .unwrap();

        assert!(acted);
        // The add is asked with no candidate stamps.
        assert_eq!(
            f.handler.calls()[0],
            HandlerCall::Add {
                stamps: vec![],
                count: 1
            }
        );
        assert_eq!(f.handler.removed(), vec![workers[1].key()]);
    }

    #[tokio::test]
    async fn slave_worker_stays_when_home_is_full() {
        let workers = vec![worker(HOME, "h1", 50), worker(SLAVE, "s1", 50)];
        let f = fixture(ScaleSettings::default(), &workers).await;
        f.handler.set_add_result(None);

        let acted = RemoveSlaveWorker
            .try_apply(&f.actions, "act", &workers, &workers[0])
            .await
            .unwrap();

        assert!(acted);
        assert!(f.handler.removed().is_empty());
        assert_eq!(f.table.list().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn busy_site_keeps_slave_workers() {
        let workers = vec![worker(HOME, "h1", 50), worker(SLAVE, "s1", 85)];
        let f = fixture(ScaleSettings::default(), &workers).await;

        let acted = RemoveSlaveWorker
            .try_apply(&f.actions, "act", &workers, &workers[0])
            .await
            .unwrap();

        assert!(!acted);
        assert!(f.handler.calls().is_empty());
    }
}
