//! Fleet simulation: many scale managers against one worker table.
//!
//! Every simulated instance runs its own [`ScaleManager`] loop in a task.
//! The fabric hands out new identities as the managers scale out, and the
//! loop starts an instance for each. An instance whose self-ping is
//! rejected leaves the fleet.

use std::fmt::Write as _;
use std::sync::Arc;

use stampgrid_scale::{ScaleManager, ScaleResult, ScaleSettings, ScaleTracer, TracingScaleTracer};
use stampgrid_state::{MemoryWorkerTable, RedbWorkerTable, WorkerInfo, WorkerTable};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::SimulationPlan;
use crate::fabric::SimulatedFabric;
use crate::provider::{Demand, SimulatedProvider};

/// Final state of a simulation run.
#[derive(Debug)]
pub struct SimulationReport {
    pub workers: Vec<WorkerInfo>,
    pub manager: Option<WorkerInfo>,
    pub started: usize,
    pub departed: usize,
}

impl SimulationReport {
    pub fn render(&self) -> String {
        let mut out = String::new();
        let manager = self
            .manager
            .as_ref()
            .map_or_else(|| "(none)".to_string(), WorkerInfo::display_name);
        let _ = writeln!(out, "manager: {manager}");
        let _ = writeln!(
            out,
            "instances: {} started, {} left the fleet",
            self.started, self.departed
        );
        let _ = writeln!(out, "workers ({}):", self.workers.len());
        for w in &self.workers {
            let _ = writeln!(
                out,
                "  {:<40} load={:<4} home={:<5} stale={}",
                w.display_name(),
                w.load_factor,
                w.is_home_stamp,
                w.is_stale
            );
        }
        out
    }
}

struct Fleet {
    table: Arc<dyn WorkerTable>,
    fabric: Arc<SimulatedFabric>,
    tracer: Arc<dyn ScaleTracer>,
    demand: Demand,
    settings: ScaleSettings,
    shutdown: watch::Receiver<bool>,
    tasks: JoinSet<(WorkerInfo, ScaleResult<()>)>,
    started: usize,
    departed: usize,
}

impl Fleet {
    fn launch(&mut self, worker: WorkerInfo) {
        let provider = Arc::new(SimulatedProvider::new(
            worker.clone(),
            self.demand.clone(),
            self.table.clone(),
        ));
        let mut manager = ScaleManager::new(
            provider,
            self.table.clone(),
            self.fabric.clone(),
            self.tracer.clone(),
            self.settings.clone(),
        );
        self.fabric.register(&worker, manager.nudger());

        info!(worker = %worker, "instance started");
        self.started += 1;
        let shutdown = self.shutdown.clone();
        self.tasks.spawn(async move {
            let result = manager.run(shutdown).await;
            (worker, result)
        });
    }

    fn record_exit(&mut self, joined: Result<(WorkerInfo, ScaleResult<()>), tokio::task::JoinError>) {
        match joined {
            Ok((worker, Ok(()))) => debug!(worker = %worker, "instance stopped"),
            Ok((worker, Err(e))) if e.is_fatal() => {
                self.departed += 1;
                info!(worker = %worker, "instance left the fleet");
            }
            Ok((worker, Err(e))) => {
                self.departed += 1;
                warn!(worker = %worker, error = %e, "instance failed");
            }
            Err(e) => warn!(error = %e, "instance task panicked"),
        }
    }
}

fn open_table(plan: &SimulationPlan) -> anyhow::Result<Arc<dyn WorkerTable>> {
    let threshold = plan.settings.stale_worker_threshold;
    match &plan.data_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let path = dir.join("stampd.redb");
            let table = RedbWorkerTable::open(&path, &plan.site)?.with_stale_threshold(threshold);
            info!(path = ?path, "worker table opened");
            Ok(Arc::new(table))
        }
        None => Ok(Arc::new(
            MemoryWorkerTable::new(&plan.site).with_stale_threshold(threshold),
        )),
    }
}

/// Run the fleet for `plan.duration`, then shut every instance down and
/// report the table.
pub async fn run(plan: SimulationPlan) -> anyhow::Result<SimulationReport> {
    let table = open_table(&plan)?;
    let (fabric, mut spawned) = SimulatedFabric::new(
        &plan.site,
        &plan.home_stamp,
        &plan.slave_stamps,
        plan.stamp_capacity,
    );
    let fabric = Arc::new(fabric);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut fleet = Fleet {
        table: table.clone(),
        fabric: fabric.clone(),
        tracer: Arc::new(TracingScaleTracer),
        demand: Demand::new(plan.demand),
        settings: plan.settings.clone(),
        shutdown: shutdown_rx,
        tasks: JoinSet::new(),
        started: 0,
        departed: 0,
    };

    // ── Initial fleet ──────────────────────────────────────────

    for _ in 0..plan.home_workers {
        match fabric.provision(&plan.home_stamp) {
            Some(worker) => fleet.launch(worker),
            None => warn!(stamp = %plan.home_stamp, "home stamp is full"),
        }
    }
    for i in 0..plan.slave_workers {
        let stamp = &plan.slave_stamps[i % plan.slave_stamps.len()];
        match fabric.provision(stamp) {
            Some(worker) => fleet.launch(worker),
            None => warn!(%stamp, "slave stamp is full"),
        }
    }

    info!(
        site = %plan.site,
        instances = fleet.started,
        demand = plan.demand,
        duration = ?plan.duration,
        "simulation running"
    );

    // ── Run ────────────────────────────────────────────────────

    let deadline = Instant::now() + plan.duration;
    loop {
        tokio::select! {
            Some(worker) = spawned.recv() => fleet.launch(worker),
            Some(joined) = fleet.tasks.join_next() => fleet.record_exit(joined),
            _ = tokio::time::sleep_until(deadline) => break,
        }
    }

    let _ = shutdown_tx.send(true);
    while let Some(joined) = fleet.tasks.join_next().await {
        fleet.record_exit(joined);
    }

    let report = SimulationReport {
        workers: table.list().await?,
        manager: table.get_manager().await?,
        started: fleet.started,
        departed: fleet.departed,
    };
    info!(
        workers = report.workers.len(),
        departed = report.departed,
        "simulation finished"
    );
    Ok(report)
}
