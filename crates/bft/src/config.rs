//! Consensus parameters.

use isaac_types::{NetworkId, Threshold};
use std::time::Duration;

/// Parameters shared by the ballotbox, the stuck resolver and the state
/// handlers.
#[derive(Debug, Clone)]
pub struct IsaacParams {
    /// Network id mixed into every signature.
    pub network_id: NetworkId,

    /// Voting threshold.
    pub threshold: Threshold,

    /// Interval between re-broadcasts of the current ballot.
    pub interval_broadcast_ballot: Duration,

    /// Wait before the next INIT ballot after a block is saved.
    ///
    /// Gives the proposer time to build the next proposal.
    pub wait_preparing_init_ballot: Duration,

    /// Wait before asking peers for ballots still missing at a stage-point.
    pub ballot_stuck_wait: Duration,

    /// Wait before expelling nodes that never voted at a stage-point.
    pub ballot_stuck_resolve_after: Duration,

    /// Capacity of the voteproof channel between ballotbox and states.
    ///
    /// A full channel blocks counting, which slows down ballot ingestion.
    pub voteproof_channel_capacity: usize,

    /// Consecutive failed switches tolerated before forcing `Broken`.
    pub max_switch_escalations: usize,

    /// Vote records kept for reuse after their stage-point is cleaned.
    pub vote_records_pool_size: usize,

    /// Attempts of a retryable proposal processor call.
    pub processor_retry_limit: usize,

    /// Wait between proposal processor retries.
    pub processor_retry_interval: Duration,

    /// Heights an expel operation stays valid for, from its start height.
    pub expel_lifespan: i64,
}

impl Default for IsaacParams {
    fn default() -> Self {
        Self {
            network_id: NetworkId::new("isaac"),
            threshold: Threshold::DEFAULT,
            interval_broadcast_ballot: Duration::from_secs(3),
            wait_preparing_init_ballot: Duration::from_secs(5),
            ballot_stuck_wait: Duration::from_secs(9),
            ballot_stuck_resolve_after: Duration::from_secs(18),
            voteproof_channel_capacity: u16::MAX as usize,
            max_switch_escalations: 3,
            vote_records_pool_size: 64,
            processor_retry_limit: 15,
            processor_retry_interval: Duration::from_millis(600),
            expel_lifespan: 3,
        }
    }
}

impl IsaacParams {
    /// Default parameters for `network_id`.
    pub fn new(network_id: NetworkId) -> Self {
        Self {
            network_id,
            ..Default::default()
        }
    }

    /// Set the threshold.
    pub fn with_threshold(mut self, threshold: Threshold) -> Self {
        self.threshold = threshold;
        self
    }

    /// Set the ballot broadcast interval.
    pub fn with_interval_broadcast_ballot(mut self, d: Duration) -> Self {
        self.interval_broadcast_ballot = d;
        self
    }

    /// Set the wait before the next INIT ballot.
    pub fn with_wait_preparing_init_ballot(mut self, d: Duration) -> Self {
        self.wait_preparing_init_ballot = d;
        self
    }

    /// Set the stuck detection waits.
    pub fn with_ballot_stuck(mut self, wait: Duration, resolve_after: Duration) -> Self {
        self.ballot_stuck_wait = wait;
        self.ballot_stuck_resolve_after = resolve_after;
        self
    }

    /// Set the escalation limit.
    pub fn with_max_switch_escalations(mut self, n: usize) -> Self {
        self.max_switch_escalations = n;
        self
    }

    /// Set processor retries.
    pub fn with_processor_retry(mut self, limit: usize, interval: Duration) -> Self {
        self.processor_retry_limit = limit;
        self.processor_retry_interval = interval;
        self
    }
}
