//! Per-operation throttle windows.

use std::time::Duration;

use tokio::time::Instant;

/// Lets an operation run at most once per `interval`. A fresh throttle is
/// ready immediately.
#[derive(Debug, Clone)]
pub struct Throttle {
    interval: Duration,
    next_eligible: Option<Instant>,
}

impl Throttle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            next_eligible: None,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.next_eligible.is_none_or(|next| Instant::now() >= next)
    }

    /// Start a new window from now.
    pub fn arm(&mut self) {
        self.next_eligible = Some(Instant::now() + self.interval);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn window_closes_then_reopens() {
        let mut throttle = Throttle::new(Duration::from_secs(30));
        assert!(throttle.is_ready());

        throttle.arm();
        assert!(!throttle.is_ready());

        tokio::time::advance(Duration::from_secs(29)).await;
        assert!(!throttle.is_ready());

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(throttle.is_ready());
    }

    #[tokio::test(start_paused = true)]
    async fn zero_interval_never_blocks() {
        let mut throttle = Throttle::new(Duration::ZERO);
        throttle.arm();
        assert!(throttle.is_ready());
    }
}
