//! Consensus positions: points, stages and stage-points.
//!
//! A [`StagePoint`] orders lexicographically by `(height, round, stage)` with
//! `INIT < ACCEPT`. [`LastPoint`] is the monotonic cursor the ballotbox and
//! the state handlers use to decide whether a ballot or voteproof is new.

use crate::{Height, Round};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// `(height, round)` pair.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct Point {
    /// Block height.
    pub height: Height,
    /// Round within the height.
    pub round: Round,
}

impl Point {
    /// Create a point.
    pub fn new(height: Height, round: Round) -> Self {
        Self { height, round }
    }

    /// Same height, next round.
    pub fn next_round(self) -> Self {
        Self::new(self.height, self.round.next())
    }

    /// Next height, round 0.
    pub fn next_height(self) -> Self {
        Self::new(self.height.next(), Round(0))
    }
}

impl fmt::Display for Point {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.height, self.round)
    }
}

/// Voting stage within a round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Stage {
    /// Agree on the proposal and previous block.
    Init,
    /// Agree on the new block produced by processing the proposal.
    Accept,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Init => write!(f, "INIT"),
            Stage::Accept => write!(f, "ACCEPT"),
        }
    }
}

/// A point plus a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StagePoint {
    /// Height and round.
    pub point: Point,
    /// Stage.
    pub stage: Stage,
}

impl StagePoint {
    /// Sentinel that compares below every real stage-point.
    pub const ZERO: Self = Self {
        point: Point {
            height: Height::NIL,
            round: Round(0),
        },
        stage: Stage::Init,
    };

    /// Create a stage-point.
    pub fn new(point: Point, stage: Stage) -> Self {
        Self { point, stage }
    }

    /// Shorthand for `StagePoint::new(Point::new(height, round), stage)`.
    pub fn at(height: i64, round: u64, stage: Stage) -> Self {
        Self::new(Point::new(Height(height), Round(round)), stage)
    }

    /// Height.
    pub fn height(&self) -> Height {
        self.point.height
    }

    /// Round.
    pub fn round(&self) -> Round {
        self.point.round
    }

    /// True for [`StagePoint::ZERO`].
    pub fn is_zero(&self) -> bool {
        *self == Self::ZERO
    }

    /// Same point with a different stage.
    pub fn with_stage(self, stage: Stage) -> Self {
        Self::new(self.point, stage)
    }

    /// The stage-point immediately before this one.
    ///
    /// `ACCEPT` steps back to `INIT` of the same point; `INIT` steps back to
    /// `ACCEPT` of the previous round, or of round 0 at the previous height.
    pub fn decrease(self) -> Self {
        match self.stage {
            Stage::Accept => self.with_stage(Stage::Init),
            Stage::Init if self.point.round.0 > 0 => Self::new(
                Point::new(self.point.height, Round(self.point.round.0 - 1)),
                Stage::Accept,
            ),
            Stage::Init => Self::new(Point::new(self.point.height.prev(), Round(0)), Stage::Accept),
        }
    }
}

impl PartialOrd for StagePoint {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for StagePoint {
    fn cmp(&self, other: &Self) -> Ordering {
        self.point
            .cmp(&other.point)
            .then_with(|| self.stage.cmp(&other.stage))
    }
}

impl fmt::Display for StagePoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.point, self.stage)
    }
}

/// The last stage-point a voteproof was emitted for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LastPoint {
    /// Stage-point of the voteproof.
    pub stage_point: StagePoint,
    /// Whether the voteproof had a majority.
    pub is_majority: bool,
    /// Whether the voteproof confirmed a suffrage change.
    pub is_suffrage_confirm: bool,
}

impl LastPoint {
    /// Nothing emitted yet.
    pub const ZERO: Self = Self {
        stage_point: StagePoint::ZERO,
        is_majority: false,
        is_suffrage_confirm: false,
    };

    /// Create a last point.
    pub fn new(stage_point: StagePoint, is_majority: bool, is_suffrage_confirm: bool) -> Self {
        Self {
            stage_point,
            is_majority,
            is_suffrage_confirm,
        }
    }

    /// True when nothing has been recorded.
    pub fn is_zero(&self) -> bool {
        self.stage_point.is_zero()
    }

    /// Whether `next` should replace this last point.
    ///
    /// A strictly greater stage-point always wins. At the same stage-point a
    /// suffrage-confirm result replaces a plain one, and a majority replaces a
    /// draw.
    pub fn is_replaced_by(&self, next: &LastPoint) -> bool {
        if self.is_zero() {
            return true;
        }

        match next.stage_point.cmp(&self.stage_point) {
            Ordering::Greater => true,
            Ordering::Less => false,
            Ordering::Equal => {
                if next.is_suffrage_confirm != self.is_suffrage_confirm {
                    return next.is_suffrage_confirm;
                }
                next.is_majority && !self.is_majority
            }
        }
    }

    /// Whether a ballot at `stage_point` can still produce a newer result.
    pub fn accepts_ballot(&self, stage_point: StagePoint, is_suffrage_confirm: bool) -> bool {
        if self.is_zero() {
            return true;
        }

        match stage_point.cmp(&self.stage_point) {
            Ordering::Greater => true,
            Ordering::Less => false,
            Ordering::Equal => is_suffrage_confirm && !self.is_suffrage_confirm,
        }
    }
}

impl Default for LastPoint {
    fn default() -> Self {
        Self::ZERO
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_point_order() {
        let a = StagePoint::at(33, 0, Stage::Init);
        let b = StagePoint::at(33, 0, Stage::Accept);
        let c = StagePoint::at(33, 1, Stage::Init);
        let d = StagePoint::at(34, 0, Stage::Init);

        assert!(a < b && b < c && c < d);
        assert!(StagePoint::ZERO < StagePoint::at(0, 0, Stage::Init));
    }

    #[test]
    fn test_decrease() {
        assert_eq!(
            StagePoint::at(3, 2, Stage::Accept).decrease(),
            StagePoint::at(3, 2, Stage::Init)
        );
        assert_eq!(
            StagePoint::at(3, 2, Stage::Init).decrease(),
            StagePoint::at(3, 1, Stage::Accept)
        );
        assert_eq!(
            StagePoint::at(3, 0, Stage::Init).decrease(),
            StagePoint::at(2, 0, Stage::Accept)
        );
        assert_eq!(
            StagePoint::at(0, 0, Stage::Init).decrease(),
            StagePoint::at(-1, 0, Stage::Accept)
        );
    }

    #[test]
    fn test_majority_replaces_draw_at_same_point() {
        let sp = StagePoint::at(10, 0, Stage::Init);
        let draw = LastPoint::new(sp, false, false);
        let majority = LastPoint::new(sp, true, false);

        assert!(draw.is_replaced_by(&majority));
        assert!(!majority.is_replaced_by(&draw));
        assert!(!majority.is_replaced_by(&majority));
    }

    #[test]
    fn test_suffrage_confirm_replaces_plain_init() {
        let sp = StagePoint::at(10, 0, Stage::Init);
        let plain = LastPoint::new(sp, true, false);
        let confirm = LastPoint::new(sp, true, true);

        assert!(plain.is_replaced_by(&confirm));
        assert!(!confirm.is_replaced_by(&plain));
        assert!(plain.accepts_ballot(sp, true));
        assert!(!plain.accepts_ballot(sp, false));
        assert!(!confirm.accepts_ballot(sp, true));
    }

    #[test]
    fn test_older_point_never_replaces() {
        let last = LastPoint::new(StagePoint::at(33, 1, Stage::Accept), true, false);
        let older = LastPoint::new(StagePoint::at(33, 1, Stage::Init), true, false);

        assert!(!last.is_replaced_by(&older));
        assert!(!last.accepts_ballot(StagePoint::at(33, 1, Stage::Init), false));
        assert!(last.accepts_ballot(StagePoint::at(34, 0, Stage::Init), false));
    }
}
