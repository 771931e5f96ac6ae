//! Ballot broadcast with local echo.
//!
//! Every ballot the node signs is voted into the local ballotbox before it is
//! handed to the membership layer, so the node counts its own vote without a
//! network round trip. The last ballot per stage-point is kept for peers that
//! ask for it again.
//!
//! Repeated broadcasts run on three named timers, one per ballot kind. At
//! most one of them runs at a time: starting one stops the others.

use crate::StatesError;
use isaac_bft::{Ballotbox, IsaacParams};
use isaac_core::{MessageSender, OutboundMessage};
use isaac_messages::BallotGossip;
use isaac_types::{Ballot, BallotFact, StagePoint};
use isaac_util::{ContextTimer, IntervalFunc, TimerCallback, TimerError, TimerId, Timers};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace, warn};

/// Timer re-broadcasting the INIT ballot.
pub const TIMER_INIT_BALLOT: TimerId = TimerId::new("broadcast-init-ballot");

/// Timer re-broadcasting the suffrage-confirm ballot.
pub const TIMER_SUFFRAGE_CONFIRM_BALLOT: TimerId =
    TimerId::new("broadcast-suffrage-confirm-ballot");

/// Timer re-broadcasting the ACCEPT ballot.
pub const TIMER_ACCEPT_BALLOT: TimerId = TimerId::new("broadcast-accept-ballot");

/// Timer carrying `fact`.
pub fn ballot_timer(fact: &BallotFact) -> TimerId {
    match fact {
        BallotFact::Init(_) | BallotFact::EmptyProposalInit(_) => TIMER_INIT_BALLOT,
        BallotFact::SuffrageConfirm(_) => TIMER_SUFFRAGE_CONFIRM_BALLOT,
        _ => TIMER_ACCEPT_BALLOT,
    }
}

type RetainKey = (StagePoint, bool);

struct Inner {
    params: Arc<IsaacParams>,
    ballotbox: Arc<Ballotbox>,
    sender: Arc<dyn MessageSender>,
    retained: Mutex<BTreeMap<RetainKey, Ballot>>,
}

impl Inner {
    fn broadcast(&self, ballot: Ballot) -> Result<(), StatesError> {
        let key = (ballot.stage_point(), ballot.is_suffrage_confirm());

        self.ballotbox.vote(ballot.clone(), self.params.threshold)?;
        self.retain(key, ballot.clone());

        self.sender
            .send(OutboundMessage::Ballot(Box::new(BallotGossip::new(ballot))))?;
        trace!(stage_point = %key.0, suffrage_confirm = key.1, "ballot broadcast");
        Ok(())
    }

    /// Keep ballots of the newest height and the one before it.
    fn retain(&self, key: RetainKey, ballot: Ballot) {
        let mut retained = self.retained.lock();
        retained.insert(key, ballot);

        let top = retained
            .keys()
            .next_back()
            .map(|(sp, _)| sp.height())
            .unwrap_or(key.0.height());
        retained.retain(|(sp, _), _| sp.height() >= top.prev());
    }
}

/// Ballot sender of the state handlers, with one repeating timer per ballot
/// kind and the recently sent ballots.
pub struct BallotBroadcaster {
    inner: Arc<Inner>,
    timers: Timers,
}

impl BallotBroadcaster {
    pub fn new(
        params: Arc<IsaacParams>,
        ballotbox: Arc<Ballotbox>,
        sender: Arc<dyn MessageSender>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                params,
                ballotbox,
                sender,
                retained: Mutex::new(BTreeMap::new()),
            }),
            timers: Timers::new(
                &[
                    TIMER_INIT_BALLOT,
                    TIMER_SUFFRAGE_CONFIRM_BALLOT,
                    TIMER_ACCEPT_BALLOT,
                ],
                false,
            ),
        }
    }

    /// Vote `ballot` locally, then send it once.
    pub fn broadcast(&self, ballot: Ballot) -> Result<(), StatesError> {
        self.inner.broadcast(ballot)
    }

    /// Broadcast `ballot` after `initial_wait`, then every
    /// `interval_broadcast_ballot` until another ballot timer starts or the
    /// timers stop. A zero wait fires immediately.
    pub fn broadcast_with_timer(
        &self,
        ballot: Ballot,
        initial_wait: Duration,
    ) -> Result<(), StatesError> {
        let id = ballot_timer(ballot.fact());
        let interval = self.inner.params.interval_broadcast_ballot;
        let first = initial_wait.max(Duration::from_nanos(1));

        let sp = ballot.stage_point();
        let interval_func: IntervalFunc =
            Arc::new(move |count| if count == 0 { first } else { interval });

        let inner = self.inner.clone();
        let callback: TimerCallback = Arc::new(move |_| {
            let inner = inner.clone();
            let ballot = ballot.clone();
            Box::pin(async move {
                // A failed send is retried by the next tick.
                if let Err(e) = inner.broadcast(ballot) {
                    warn!(error = %e, "failed to broadcast ballot; keep going");
                }
                Ok::<_, TimerError>(true)
            })
        });

        self.timers
            .set_timer(ContextTimer::new(id.clone(), interval_func, callback))?;
        self.timers.start_timers(&[id.clone()], true)?;
        debug!(timer = %id, stage_point = %sp, wait = ?initial_wait, "ballot timer started");
        Ok(())
    }

    /// Last ballot sent at `stage_point`.
    pub fn ballot(&self, stage_point: StagePoint, is_suffrage_confirm: bool) -> Option<Ballot> {
        self.inner
            .retained
            .lock()
            .get(&(stage_point, is_suffrage_confirm))
            .cloned()
    }

    pub fn is_started(&self, id: &TimerId) -> bool {
        self.timers.is_started(id)
    }

    /// Stop every ballot timer.
    pub fn stop_timers(&self) {
        self.timers.stop_all();
    }
}
