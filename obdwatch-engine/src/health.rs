//! Connection health as seen by the acquisition loop.

use atomic_enum::atomic_enum;
use log::{info, warn};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use crate::channel::TransportError;

#[atomic_enum]
#[derive(PartialEq, Eq)]
pub enum ConnectionHealth {
    Healthy,
    /// Repeated or connection-level transport failures; the loop is backing off
    Degraded,
}

/// Counts consecutive transport failures and derives the health state and
/// the reconnect backoff from them
pub struct HealthTracker {
    state: Arc<AtomicConnectionHealth>,
    consecutive_failures: u32,
    degraded_after: u32,
    backoff: Duration,
    backoff_initial: Duration,
    backoff_max: Duration,
}

impl HealthTracker {
    pub fn new(degraded_after: u32, backoff_initial: Duration, backoff_max: Duration) -> Self {
        Self {
            state: Arc::new(AtomicConnectionHealth::new(ConnectionHealth::Healthy)),
            consecutive_failures: 0,
            degraded_after: degraded_after.max(1),
            backoff: backoff_initial,
            backoff_initial,
            backoff_max: backoff_max.max(backoff_initial),
        }
    }

    /// Lock-free view of the health state for observers on other threads
    pub fn shared(&self) -> Arc<AtomicConnectionHealth> {
        self.state.clone()
    }

    pub fn get(&self) -> ConnectionHealth {
        self.state.load(Ordering::Acquire)
    }

    pub fn is_degraded(&self) -> bool {
        self.get() == ConnectionHealth::Degraded
    }

    /// A transaction completed (with or without data)
    pub fn record_success(&mut self) {
        self.consecutive_failures = 0;
        self.backoff = self.backoff_initial;
        if self.is_degraded() {
            info!("Channel recovered");
            self.state.store(ConnectionHealth::Healthy, Ordering::Release);
        }
    }

    pub fn record_failure(&mut self, error: &TransportError) {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        let degrade =
            error.is_connection_loss() || self.consecutive_failures >= self.degraded_after;
        if degrade && !self.is_degraded() {
            warn!(
                "Channel degraded after {} consecutive failure(s): {error}",
                self.consecutive_failures
            );
            self.state.store(ConnectionHealth::Degraded, Ordering::Release);
        }
    }

    /// Delay before the next reconnect attempt; doubles up to the cap
    pub fn next_backoff(&mut self) -> Duration {
        let delay = self.backoff;
        self.backoff = (self.backoff * 2).min(self.backoff_max);
        delay
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }
}
