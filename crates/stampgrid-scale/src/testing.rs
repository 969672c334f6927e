//! Recording fakes for the scale manager's collaborators.
//!
//! Used by this crate's tests and by downstream crates that drive a
//! [`ScaleManager`](crate::ScaleManager) without a real fabric.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use stampgrid_state::{WorkerInfo, WorkerKey};

use crate::handler::{ScaleHandler, WorkerInfoProvider};
use crate::tracer::ScaleTracer;

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

// ── Handler ────────────────────────────────────────────────────

/// How [`RecordingHandler`] answers a ping for one worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PingOutcome {
    /// `Ok(true)`
    Owned,
    /// `Ok(false)`
    Rejected,
    /// `Err(..)`
    Unreachable,
}

/// One call observed by [`RecordingHandler`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandlerCall {
    Add { stamps: Vec<String>, count: u32 },
    Remove { worker: WorkerKey },
    Ping { worker: WorkerKey },
}

#[derive(Default)]
struct HandlerState {
    calls: Vec<HandlerCall>,
    pings: HashMap<WorkerKey, PingOutcome>,
    add_result: Option<String>,
    fail_removals: bool,
}

/// [`ScaleHandler`] that records every call and answers from a script.
///
/// Pings answer [`PingOutcome::Owned`] unless overridden. Adds answer
/// `None` until [`set_add_result`](Self::set_add_result) is called.
#[derive(Default)]
pub struct RecordingHandler {
    state: Mutex<HandlerState>,
}

impl RecordingHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_ping(&self, worker: &WorkerInfo, outcome: PingOutcome) {
        locked(&self.state).pings.insert(worker.key(), outcome);
    }

    /// The stamp every later add reports as accepted, or `None` for no
    /// capacity.
    pub fn set_add_result(&self, stamp: Option<&str>) {
        locked(&self.state).add_result = stamp.map(str::to_string);
    }

    /// Make every later removal fail.
    pub fn fail_removals(&self) {
        locked(&self.state).fail_removals = true;
    }

    pub fn calls(&self) -> Vec<HandlerCall> {
        locked(&self.state).calls.clone()
    }

    pub fn add_calls(&self) -> usize {
        locked(&self.state)
            .calls
            .iter()
            .filter(|c| matches!(c, HandlerCall::Add { .. }))
            .count()
    }

    /// Keys of removed workers, in call order.
    pub fn removed(&self) -> Vec<WorkerKey> {
        locked(&self.state)
            .calls
            .iter()
            .filter_map(|c| match c {
                HandlerCall::Remove { worker } => Some(worker.clone()),
                _ => None,
            })
            .collect()
    }

    /// Keys of pinged workers, in call order.
    pub fn pinged(&self) -> Vec<WorkerKey> {
        locked(&self.state)
            .calls
            .iter()
            .filter_map(|c| match c {
                HandlerCall::Ping { worker } => Some(worker.clone()),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl ScaleHandler for RecordingHandler {
    async fn try_add_worker(
        &self,
        _activity_id: &str,
        stamp_names: &[String],
        count: u32,
    ) -> anyhow::Result<Option<String>> {
        let mut state = locked(&self.state);
        state.calls.push(HandlerCall::Add {
            stamps: stamp_names.to_vec(),
            count,
        });
        Ok(state.add_result.clone())
    }

    async fn remove_worker(&self, _activity_id: &str, worker: &WorkerInfo) -> anyhow::Result<()> {
        let mut state = locked(&self.state);
        state.calls.push(HandlerCall::Remove { worker: worker.key() });
        if state.fail_removals {
            anyhow::bail!("fabric refused to release {worker}");
        }
        Ok(())
    }

    async fn ping_worker(&self, _activity_id: &str, worker: &WorkerInfo) -> anyhow::Result<bool> {
        let mut state = locked(&self.state);
        let key = worker.key();
        let outcome = state.pings.get(&key).copied().unwrap_or(PingOutcome::Owned);
        state.calls.push(HandlerCall::Ping { worker: key });
        match outcome {
            PingOutcome::Owned => Ok(true),
            PingOutcome::Rejected => Ok(false),
            PingOutcome::Unreachable => anyhow::bail!("{worker} did not answer"),
        }
    }
}

// ── Tracer ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceKind {
    Information,
    Warning,
    Error,
    AddWorker,
    RemoveWorker,
    UpdateWorker,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceEvent {
    pub kind: TraceKind,
    pub activity_id: String,
    pub worker: WorkerKey,
    pub message: String,
}

/// [`ScaleTracer`] that keeps every event in memory.
#[derive(Default)]
pub struct RecordingTracer {
    events: Mutex<Vec<TraceEvent>>,
}

impl RecordingTracer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<TraceEvent> {
        locked(&self.events).clone()
    }

    pub fn count(&self, kind: TraceKind) -> usize {
        locked(&self.events).iter().filter(|e| e.kind == kind).count()
    }

    /// Whether any event's message contains `needle`.
    pub fn contains(&self, needle: &str) -> bool {
        locked(&self.events).iter().any(|e| e.message.contains(needle))
    }

    fn record(&self, kind: TraceKind, activity_id: &str, worker: &WorkerInfo, message: &str) {
        locked(&self.events).push(TraceEvent {
            kind,
            activity_id: activity_id.to_string(),
            worker: worker.key(),
            message: message.to_string(),
        });
    }
}

impl ScaleTracer for RecordingTracer {
    fn trace_information(&self, activity_id: &str, worker: &WorkerInfo, message: &str) {
        self.record(TraceKind::Information, activity_id, worker, message);
    }

    fn trace_warning(&self, activity_id: &str, worker: &WorkerInfo, message: &str) {
        self.record(TraceKind::Warning, activity_id, worker, message);
    }

    fn trace_error(&self, activity_id: &str, worker: &WorkerInfo, message: &str) {
        self.record(TraceKind::Error, activity_id, worker, message);
    }

    fn trace_add_worker(&self, activity_id: &str, worker: &WorkerInfo, message: &str) {
        self.record(TraceKind::AddWorker, activity_id, worker, message);
    }

    fn trace_remove_worker(&self, activity_id: &str, worker: &WorkerInfo, message: &str) {
        self.record(TraceKind::RemoveWorker, activity_id, worker, message);
    }

    fn trace_update_worker(&self, activity_id: &str, worker: &WorkerInfo, message: &str) {
        self.record(TraceKind::UpdateWorker, activity_id, worker, message);
    }
}

// ── Provider ───────────────────────────────────────────────────

/// [`WorkerInfoProvider`] returning a fixed snapshot.
pub struct FixedProvider {
    worker: Mutex<WorkerInfo>,
    fail: Mutex<bool>,
}

impl FixedProvider {
    pub fn new(worker: WorkerInfo) -> Self {
        Self {
            worker: Mutex::new(worker),
            fail: Mutex::new(false),
        }
    }

    /// Make later calls fail (or succeed again).
    pub fn set_failing(&self, fail: bool) {
        *locked(&self.fail) = fail;
    }

    pub fn worker(&self) -> WorkerInfo {
        locked(&self.worker).clone()
    }
}

#[async_trait]
impl WorkerInfoProvider for FixedProvider {
    async fn get_worker_info(&self, _activity_id: &str) -> anyhow::Result<WorkerInfo> {
        if *locked(&self.fail) {
            anyhow::bail!("worker info unavailable");
        }
        Ok(self.worker())
    }
}
