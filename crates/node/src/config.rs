//! Handover configuration.

use std::time::Duration;

/// Handover broker settings shared by both sides.
#[derive(Debug, Clone)]
pub struct HandoverConfig {
    /// Challenges X must accept before a `Ready` can be answered positively.
    pub min_challenge_count: u64,

    /// Further accepted challenges between a positive `Ready` and `Finish`.
    pub ready_end_delta: u64,

    /// Minimum wait between two `Ready` messages from Y.
    pub interval_ready: Duration,
}

impl Default for HandoverConfig {
    fn default() -> Self {
        Self {
            min_challenge_count: 2,
            ready_end_delta: 3,
            interval_ready: Duration::from_millis(333),
        }
    }
}

impl HandoverConfig {
    /// Set the minimum challenge count.
    pub fn with_min_challenge_count(mut self, n: u64) -> Self {
        self.min_challenge_count = n;
        self
    }

    /// Set the ready end delta.
    pub fn with_ready_end_delta(mut self, n: u64) -> Self {
        self.ready_end_delta = n;
        self
    }

    /// Set the wait between `Ready` messages.
    pub fn with_interval_ready(mut self, d: Duration) -> Self {
        self.interval_ready = d;
        self
    }
}
