//! In-process stand-in for the hosting fabric.
//!
//! Tracks which workers each stamp hosts. Adding a worker assigns a fresh
//! name on a stamp with free capacity and hands the new identity to the
//! simulation, which starts an instance for it. Removing a worker
//! unassigns it, so its next self-ping is rejected. The last worker of the
//! site is never released.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use stampgrid_scale::{Nudger, ScaleHandler};
use stampgrid_state::{WorkerInfo, WorkerKey};
use tokio::sync::mpsc;
use tracing::{debug, info};

struct Stamp {
    capacity: usize,
    assigned: BTreeSet<String>,
}

#[derive(Default)]
struct FabricState {
    stamps: BTreeMap<String, Stamp>,
    nudgers: HashMap<WorkerKey, Nudger>,
    next_id: u64,
}

/// Simulated fabric for one site.
pub struct SimulatedFabric {
    site_name: String,
    home_stamp: String,
    state: Mutex<FabricState>,
    spawn_tx: mpsc::UnboundedSender<WorkerInfo>,
}

impl SimulatedFabric {
    /// Create a fabric over `stamps`, each hosting up to `capacity`
    /// workers. The receiver yields every worker added through
    /// [`ScaleHandler::try_add_worker`].
    pub fn new(
        site_name: &str,
        home_stamp: &str,
        stamps: &[String],
        capacity: usize,
    ) -> (Self, mpsc::UnboundedReceiver<WorkerInfo>) {
        let (spawn_tx, spawn_rx) = mpsc::unbounded_channel();
        let mut state = FabricState::default();
        for stamp in std::iter::once(home_stamp).chain(stamps.iter().map(String::as_str)) {
            state.stamps.entry(stamp.to_string()).or_insert(Stamp {
                capacity,
                assigned: BTreeSet::new(),
            });
        }
        let fabric = Self {
            site_name: site_name.to_string(),
            home_stamp: home_stamp.to_string(),
            state: Mutex::new(state),
            spawn_tx,
        };
        (fabric, spawn_rx)
    }

    fn state(&self) -> MutexGuard<'_, FabricState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Assign a new worker on `stamp`, or `None` when it is full or
    /// unknown.
    pub fn provision(&self, stamp: &str) -> Option<WorkerInfo> {
        let mut state = self.state();
        state.next_id += 1;
        let name = format!("{stamp}-w{}", state.next_id);
        let slot = state.stamps.get_mut(stamp)?;
        if slot.assigned.len() >= slot.capacity {
            return None;
        }
        slot.assigned.insert(name.clone());
        Some(WorkerInfo::new(&self.site_name, stamp, &name, &self.home_stamp))
    }

    /// Let removals wake the removed worker's instance.
    pub fn register(&self, worker: &WorkerInfo, nudger: Nudger) {
        self.state().nudgers.insert(worker.key(), nudger);
    }

    pub fn is_assigned(&self, worker: &WorkerInfo) -> bool {
        self.state()
            .stamps
            .get(&worker.stamp_name)
            .is_some_and(|s| s.assigned.contains(&worker.worker_name))
    }

    /// Number of workers assigned to `stamp`.
    pub fn assigned(&self, stamp: &str) -> usize {
        self.state().stamps.get(stamp).map_or(0, |s| s.assigned.len())
    }

    pub fn total_assigned(&self) -> usize {
        self.state().stamps.values().map(|s| s.assigned.len()).sum()
    }

    /// The home stamp first, then `stamp_names` in order, without repeats.
    fn placement_order(&self, stamp_names: &[String]) -> Vec<String> {
        let mut order = vec![self.home_stamp.clone()];
        for stamp in stamp_names {
            if !order.contains(stamp) {
                order.push(stamp.clone());
            }
        }
        order
    }
}

#[async_trait]
impl ScaleHandler for SimulatedFabric {
    async fn try_add_worker(
        &self,
        activity_id: &str,
        stamp_names: &[String],
        count: u32,
    ) -> anyhow::Result<Option<String>> {
        for stamp in self.placement_order(stamp_names) {
            let added: Vec<WorkerInfo> = (0..count).map_while(|_| self.provision(&stamp)).collect();
            if added.is_empty() {
                debug!(%activity_id, %stamp, "stamp has no capacity");
                continue;
            }
            for worker in added {
                info!(%activity_id, worker = %worker, "fabric assigned worker");
                self.spawn_tx.send(worker)?;
            }
            return Ok(Some(stamp));
        }
        Ok(None)
    }

    async fn remove_worker(&self, activity_id: &str, worker: &WorkerInfo) -> anyhow::Result<()> {
        let nudger = {
            let mut state = self.state();
            let total: usize = state.stamps.values().map(|s| s.assigned.len()).sum();
            if total <= 1 {
                debug!(%activity_id, worker = %worker, "keeping the last worker of the site");
                return Ok(());
            }
            if let Some(stamp) = state.stamps.get_mut(&worker.stamp_name) {
                stamp.assigned.remove(&worker.worker_name);
            }
            state.nudgers.remove(&worker.key())
        };
        info!(%activity_id, worker = %worker, "fabric released worker");
        if let Some(nudger) = nudger {
            nudger.nudge();
        }
        Ok(())
    }

    async fn ping_worker(&self, _activity_id: &str, worker: &WorkerInfo) -> anyhow::Result<bool> {
        if worker.site_name != self.site_name {
            return Ok(false);
        }
        Ok(self.is_assigned(worker))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fabric(capacity: usize) -> (SimulatedFabric, mpsc::UnboundedReceiver<WorkerInfo>) {
        SimulatedFabric::new("site", "home", &["slave-a".to_string(), "slave-b".to_string()], capacity)
    }

    #[tokio::test]
    async fn adds_go_to_the_home_stamp_first() {
        let (fabric, mut spawned) = fabric(2);

        let stamp = fabric
            .try_add_worker("a1", &["slave-a".to_string()], 1)
            .await
            .unwrap();

        assert_eq!(stamp.as_deref(), Some("home"));
        let worker = spawned.recv().await.unwrap();
        assert!(worker.is_home_stamp);
        assert!(fabric.is_assigned(&worker));
    }

    #[tokio::test]
    async fn full_home_stamp_falls_back_to_candidates() {
        let (fabric, _spawned) = fabric(1);
        fabric.provision("home").unwrap();

        let stamp = fabric
            .try_add_worker("a1", &["slave-b".to_string(), "slave-a".to_string()], 1)
            .await
            .unwrap();

        assert_eq!(stamp.as_deref(), Some("slave-b"));
        assert_eq!(fabric.assigned("slave-b"), 1);
    }

    #[tokio::test]
    async fn no_capacity_anywhere_returns_none() {
        let (fabric, _spawned) = fabric(1);
        fabric.provision("home").unwrap();
        fabric.provision("slave-a").unwrap();

        let stamp = fabric
            .try_add_worker("a1", &["slave-a".to_string()], 1)
            .await
            .unwrap();

        assert!(stamp.is_none());
    }

    #[tokio::test]
    async fn burst_fills_what_the_stamp_can_take() {
        let (fabric, mut spawned) = fabric(2);

        let stamp = fabric.try_add_worker("a1", &[], 3).await.unwrap();

        assert_eq!(stamp.as_deref(), Some("home"));
        assert_eq!(fabric.assigned("home"), 2);
        assert!(spawned.recv().await.is_some());
        assert!(spawned.recv().await.is_some());
        assert!(spawned.try_recv().is_err());
    }

    #[tokio::test]
    async fn removed_worker_fails_its_ping() {
        let (fabric, _spawned) = fabric(2);
        fabric.provision("home").unwrap();
        let worker = fabric.provision("slave-a").unwrap();
        assert!(fabric.ping_worker("a1", &worker).await.unwrap());

        fabric.remove_worker("a2", &worker).await.unwrap();

        assert!(!fabric.ping_worker("a3", &worker).await.unwrap());
        assert_eq!(fabric.assigned("slave-a"), 0);
    }

    #[tokio::test]
    async fn last_worker_is_kept() {
        let (fabric, _spawned) = fabric(2);
        let worker = fabric.provision("home").unwrap();

        fabric.remove_worker("a1", &worker).await.unwrap();

        assert!(fabric.ping_worker("a2", &worker).await.unwrap());
        assert_eq!(fabric.total_assigned(), 1);
    }

    #[tokio::test]
    async fn foreign_site_is_never_owned() {
        let (fabric, _spawned) = fabric(2);
        let stranger = WorkerInfo::new("other", "home", "home-w1", "home");
        assert!(!fabric.ping_worker("a1", &stranger).await.unwrap());
    }
}
