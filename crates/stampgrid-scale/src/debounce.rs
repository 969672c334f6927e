//! Debounced triggers.
//!
//! A [`DebounceHandle`] can be cloned and fired from anywhere; the paired
//! [`Debouncer`] resolves once per burst, after `quiet` has passed with no
//! further trigger. Each trigger restarts the quiet period.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;

/// Sending half: fire a trigger.
#[derive(Debug, Clone)]
pub struct DebounceHandle {
    tx: mpsc::Sender<()>,
}

impl DebounceHandle {
    /// Fire a trigger. Never blocks; a trigger that finds the slot
    /// occupied is already covered by the pending one.
    pub fn trigger(&self) {
        let _ = self.tx.try_send(());
    }
}

/// Receiving half: wait for a quiet burst.
#[derive(Debug)]
pub struct Debouncer {
    rx: mpsc::Receiver<()>,
    quiet: Duration,
    deadline: Option<Instant>,
}

impl Debouncer {
    /// Create a linked handle/debouncer pair.
    pub fn channel(quiet: Duration) -> (DebounceHandle, Debouncer) {
        let (tx, rx) = mpsc::channel(1);
        (
            DebounceHandle { tx },
            Debouncer {
                rx,
                quiet,
                deadline: None,
            },
        )
    }

    /// Resolve once the current burst has gone quiet.
    ///
    /// Cancel-safe: a pending burst survives being dropped from a
    /// `select!` and resumes on the next call. Once every handle is gone
    /// and no burst is pending, this never resolves.
    pub async fn fired(&mut self) {
        loop {
            match self.deadline {
                None => match self.rx.recv().await {
                    Some(()) => self.deadline = Some(Instant::now() + self.quiet),
                    None => std::future::pending::<()>().await,
                },
                Some(deadline) => {
                    tokio::select! {
                        _ = tokio::time::sleep_until(deadline) => {
                            self.deadline = None;
                            return;
                        }
                        msg = self.rx.recv() => match msg {
                            Some(()) => self.deadline = Some(Instant::now() + self.quiet),
                            None => {
                                tokio::time::sleep_until(deadline).await;
                                self.deadline = None;
                                return;
                            }
                        },
                    }
                }
            }
        }
    }
}
