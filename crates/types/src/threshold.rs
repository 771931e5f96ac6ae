//! Voting thresholds and vote results.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Voting threshold as a percentage of the suffrage, in `(0, 100]`.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Threshold(f64);

/// Outcome of a finished vote.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VoteResult {
    /// No fact reached the threshold.
    Draw,
    /// One fact reached the threshold.
    Majority,
}

/// Outcome of counting a set of votes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoteDecision {
    /// Not enough votes to decide.
    Pending,
    /// No fact can reach the threshold any more.
    Draw,
    /// The fact at this index of the count set reached the threshold.
    Majority(usize),
}

impl Threshold {
    /// Every node must agree.
    pub const MAX: Self = Threshold(100.0);

    /// Two-thirds-plus threshold used by default.
    pub const DEFAULT: Self = Threshold(67.0);

    /// Create a threshold, rejecting values outside `(0, 100]`.
    pub fn new(percent: f64) -> Option<Self> {
        if percent > 0.0 && percent <= 100.0 {
            Some(Self(percent))
        } else {
            None
        }
    }

    /// Threshold percentage.
    pub fn percent(&self) -> f64 {
        self.0
    }

    /// Whether the value is inside `(0, 100]`.
    pub fn is_valid(&self) -> bool {
        self.0 > 0.0 && self.0 <= 100.0
    }

    /// Number of votes needed out of `quorum`: `ceil(quorum × percent / 100)`.
    pub fn count(&self, quorum: usize) -> usize {
        let needed = (quorum as f64 * self.0 / 100.0).ceil() as usize;
        needed.min(quorum)
    }

    /// Decide a vote given the per-fact counts, in first-seen order.
    ///
    /// A fact at or above the threshold count wins. Once the remaining
    /// uncast votes cannot lift any fact to the threshold, the result is a
    /// draw.
    pub fn decide(&self, quorum: usize, counts: &[usize]) -> VoteDecision {
        let needed = self.count(quorum);
        if needed == 0 || counts.is_empty() {
            return VoteDecision::Pending;
        }

        if let Some(index) = counts.iter().position(|&c| c >= needed) {
            return VoteDecision::Majority(index);
        }

        let total: usize = counts.iter().sum();
        let highest = counts.iter().copied().max().unwrap_or(0);
        let remaining = quorum.saturating_sub(total);

        if total >= needed && highest + remaining < needed {
            VoteDecision::Draw
        } else {
            VoteDecision::Pending
        }
    }
}

impl Default for Threshold {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl fmt::Display for Threshold {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}%", self.0)
    }
}
