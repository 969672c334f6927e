//! Simulated self snapshot: load is the site demand split evenly across
//! the live workers.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use stampgrid_scale::WorkerInfoProvider;
use stampgrid_state::{WorkerInfo, WorkerTable};

/// Site-wide demand shared by every simulated instance.
#[derive(Debug, Clone, Default)]
pub struct Demand(Arc<AtomicU32>);

impl Demand {
    pub fn new(value: u32) -> Self {
        Self(Arc::new(AtomicU32::new(value)))
    }

    pub fn get(&self) -> u32 {
        self.0.load(Ordering::Relaxed)
    }

    pub fn set(&self, value: u32) {
        self.0.store(value, Ordering::Relaxed);
    }
}

pub struct SimulatedProvider {
    identity: WorkerInfo,
    demand: Demand,
    table: Arc<dyn WorkerTable>,
}

impl SimulatedProvider {
    pub fn new(identity: WorkerInfo, demand: Demand, table: Arc<dyn WorkerTable>) -> Self {
        Self {
            identity,
            demand,
            table,
        }
    }
}

/// `demand / live_workers`, clamped to 0..=100. An empty site counts as
/// one worker.
pub fn load_factor(demand: u32, live_workers: usize) -> i32 {
    let per_worker = u64::from(demand) / live_workers.max(1) as u64;
    per_worker.min(100) as i32
}

#[async_trait]
impl WorkerInfoProvider for SimulatedProvider {
    async fn get_worker_info(&self, _activity_id: &str) -> anyhow::Result<WorkerInfo> {
        let live = self.table.list_non_stale().await?.len();
        Ok(self
            .identity
            .clone()
            .with_load_factor(load_factor(self.demand.get(), live)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stampgrid_state::MemoryWorkerTable;

    #[test]
    fn load_is_split_and_clamped() {
        assert_eq!(load_factor(250, 5), 50);
        assert_eq!(load_factor(250, 1), 100);
        assert_eq!(load_factor(0, 3), 0);
        assert_eq!(load_factor(40, 0), 40);
    }

    #[tokio::test]
    async fn snapshot_tracks_the_live_fleet() {
        let table = Arc::new(MemoryWorkerTable::new("site"));
        let me = WorkerInfo::new("site", "home", "w1", "home");
        let demand = Demand::new(120);
        let provider = SimulatedProvider::new(me.clone(), demand.clone(), table.clone());

        assert_eq!(provider.get_worker_info("a1").await.unwrap().load_factor, 100);

        table.add_or_update(&me).await.unwrap();
        table
            .add_or_update(&WorkerInfo::new("site", "home", "w2", "home"))
            .await
            .unwrap();
        assert_eq!(provider.get_worker_info("a2").await.unwrap().load_factor, 60);

        demand.set(20);
        assert_eq!(provider.get_worker_info("a3").await.unwrap().load_factor, 10);
    }
}
