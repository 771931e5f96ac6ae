//! Node state machine.
//!
//! A node is always in exactly one [`StateType`]. Each state has a handler
//! with `enter`/`exit` hooks; a single event loop owns the current handler and
//! feeds it voteproofs from the ballotbox and the stuck resolver, results of
//! background work (proposal processing, syncing), and switch requests.
//!
//! ```text
//!   Booting ──► Joining ──► Consensus ◄──► Handover
//!      │           │   ▲        │              │
//!      ▼           ▼   │        ▼              ▼
//!   Syncing ◄──────────┴──── Syncing ◄──── Syncing
//!
//!   any ──► Broken          any ──► Stopped ──► Booting | Broken
//! ```
//!
//! # Switching
//!
//! - A handler returns the next [`SwitchContext`] from any hook; `enter` may
//!   redirect immediately (Booting always does)
//! - A handler error escalates to `Broken`; after
//!   `max_switch_escalations` failures in one switch, `Broken` is forced
//! - `Joining` and `Consensus` are only reachable while consensus is
//!   allowed; otherwise the node goes to `Syncing`
//! - A switch to the current state re-enters it (Syncing raises its target)

mod booting;
mod broken;
mod consensus;
mod joining;
mod stopped;
mod syncing;

use crate::handover::{HandoverXBroker, HandoverYBroker};
use crate::{BallotBroadcaster, HandoverConfig, MimicBallots, StatesError};
use async_trait::async_trait;
use booting::BootingHandler;
use broken::BrokenHandler;
use consensus::ConsensusHandler;
use isaac_bft::{
    BallotStuckResolver, Ballotbox, IsaacParams, LastVoteproofs, LastVoteproofsHandler,
    ProposalProcessors,
};
use isaac_core::{
    ProcessorError, ProcessorFactory, ProposalSelector, SuffrageProvider, Syncer, SyncerError,
};
use isaac_storage::PermanentDatabase;
use isaac_types::{
    Ballot, BallotFact, BallotSignFact, BlockMap, Hash, Height, InitBallotFact, LocalNode,
    Manifest, Point, ProposalSignFact, Stage, StagePoint, Voteproof,
};
use joining::JoiningHandler;
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use stopped::StoppedHandler;
use syncing::SyncingHandler;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

/// States of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StateType {
    /// Before the event loop starts.
    Empty,
    Stopped,
    Booting,
    Joining,
    Consensus,
    Syncing,
    /// Consensus in quiet mode while another process with the same identity
    /// still votes.
    Handover,
    Broken,
}

impl fmt::Display for StateType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StateType::Empty => "empty",
            StateType::Stopped => "stopped",
            StateType::Booting => "booting",
            StateType::Joining => "joining",
            StateType::Consensus => "consensus",
            StateType::Syncing => "syncing",
            StateType::Handover => "handover",
            StateType::Broken => "broken",
        };
        f.write_str(s)
    }
}

/// Request to move to a state, with what the next handler starts from.
#[derive(Debug, Clone)]
pub enum SwitchContext {
    Stopped,
    Booting,
    /// Join from `vp`, or from the last stored voteproof.
    Joining { vp: Option<Voteproof> },
    /// Start consensus from a majority INIT voteproof.
    Consensus { ivp: Voteproof },
    /// Sync up to `height`.
    Syncing { height: Height },
    /// Follow the handover X from `vp`.
    Handover { vp: Option<Voteproof> },
    Broken { err: String },
}

impl SwitchContext {
    /// Target state.
    pub fn state(&self) -> StateType {
        match self {
            SwitchContext::Stopped => StateType::Stopped,
            SwitchContext::Booting => StateType::Booting,
            SwitchContext::Joining { .. } => StateType::Joining,
            SwitchContext::Consensus { .. } => StateType::Consensus,
            SwitchContext::Syncing { .. } => StateType::Syncing,
            SwitchContext::Handover { .. } => StateType::Handover,
            SwitchContext::Broken { .. } => StateType::Broken,
        }
    }

    pub fn broken(err: impl fmt::Display) -> Self {
        SwitchContext::Broken {
            err: err.to_string(),
        }
    }
}

/// Results of background work, delivered to the event loop.
#[derive(Debug)]
pub(crate) enum Event {
    /// Voteproof from outside the ballotbox, eg. forwarded by handover X.
    Voteproof(Voteproof),
    Processed {
        ivp: Voteproof,
        result: Result<Manifest, ProcessorError>,
    },
    SyncFinished(Height),
    SyncFailed(SyncerError),
    HandoverXCanceled,
    HandoverYFinished {
        ivp: Voteproof,
        proposal: Option<ProposalSignFact>,
    },
    HandoverYCanceled,
}

/// Creates a syncer targeting a height.
pub type NewSyncer = Arc<dyn Fn(Height) -> Result<Arc<dyn Syncer>, StatesError> + Send + Sync>;

/// Called after a block is saved.
pub type WhenNewBlockSaved = Arc<dyn Fn(&BlockMap) + Send + Sync>;

/// Called once a saved block is final, after its expels are confirmed.
pub type WhenNewBlockConfirmed = Arc<dyn Fn(Height) + Send + Sync>;

/// Collaborators of the state machine.
pub struct StatesArgs {
    pub params: Arc<IsaacParams>,
    pub local: LocalNode,
    pub ballotbox: Arc<Ballotbox>,
    pub stuck: Arc<BallotStuckResolver>,
    pub processors: Arc<ProposalProcessors>,
    pub factory: Arc<dyn ProcessorFactory>,
    pub selector: Arc<dyn ProposalSelector>,
    pub suffrage: Arc<dyn SuffrageProvider>,
    pub permanent: Arc<dyn PermanentDatabase>,
    pub broadcaster: Arc<BallotBroadcaster>,
    pub mimic: Arc<MimicBallots>,
    pub new_syncer: NewSyncer,
    pub when_new_block_saved: WhenNewBlockSaved,
    pub when_new_block_confirmed: WhenNewBlockConfirmed,
    pub handover: HandoverConfig,
}

pub(crate) struct Shared {
    allow_consensus: AtomicBool,
    state: watch::Sender<StateType>,
    last_voteproofs: LastVoteproofsHandler,
    handover_x: Mutex<Option<Arc<HandoverXBroker>>>,
    handover_y: Mutex<Option<Arc<HandoverYBroker>>>,
    events: mpsc::UnboundedSender<Event>,
    switches: mpsc::UnboundedSender<SwitchContext>,
}

/// What every handler works with.
#[derive(Clone)]
pub(crate) struct Ctx {
    pub(crate) args: Arc<StatesArgs>,
    pub(crate) shared: Arc<Shared>,
}

impl Ctx {
    pub(crate) fn last_block_map(&self) -> Option<BlockMap> {
        self.args.permanent.last_block_map()
    }

    pub(crate) fn last_height(&self) -> Height {
        self.last_block_map()
            .map(|m| m.height())
            .unwrap_or(Height::NIL)
    }

    /// Whether the local node votes at `height`. An unknown suffrage counts
    /// as not being in it.
    pub(crate) fn in_suffrage(&self, height: Height) -> Result<bool, StatesError> {
        Ok(self
            .args
            .suffrage
            .suffrage(height)?
            .map(|s| s.exists(self.args.local.address()))
            .unwrap_or(false))
    }

    pub(crate) fn allow_consensus(&self) -> bool {
        self.shared.allow_consensus.load(Ordering::SeqCst)
    }

    pub(crate) fn last_voteproofs(&self) -> LastVoteproofs {
        self.shared.last_voteproofs.last()
    }

    pub(crate) fn handover_y(&self) -> Option<Arc<HandoverYBroker>> {
        self.shared.handover_y.lock().clone()
    }

    pub(crate) fn send_event(&self, event: Event) {
        if self.shared.events.send(event).is_err() {
            trace!("event dropped; states stopped");
        }
    }

    pub(crate) fn sign(&self, fact: BallotFact) -> BallotSignFact {
        BallotSignFact::new(fact, &self.args.local, &self.args.params.network_id)
    }

    /// Select the proposal for `point` and broadcast the INIT ballot after
    /// `wait`, in the background.
    ///
    /// When nothing was proposed, the ballot carries an empty-proposal fact.
    /// Expels of a stuck `vp` still valid at `point` go into the ballot.
    pub(crate) fn prepare_init_ballot(
        &self,
        cancel: CancellationToken,
        point: Point,
        previous_block: Option<Hash>,
        vp: Voteproof,
        wait: Duration,
    ) {
        let ctx = self.clone();
        tokio::spawn(async move {
            let expels: Vec<_> = if vp.is_stuck() {
                vp.expels()
                    .iter()
                    .filter(|op| op.fact.is_valid_at(point.height))
                    .cloned()
                    .collect()
            } else {
                Vec::new()
            };

            let proposal = match ctx
                .args
                .selector
                .select(cancel.clone(), point, previous_block)
                .await
            {
                Ok(pr) => Some(pr.hash()),
                Err(ProcessorError::NotFound(reason)) => {
                    debug!(%point, reason = %reason, "no proposal; empty proposal INIT");
                    None
                }
                Err(e) => {
                    if !cancel.is_cancelled() {
                        warn!(%point, error = %e, "failed to select proposal");
                    }
                    return;
                }
            };
            if cancel.is_cancelled() {
                return;
            }

            let fact = InitBallotFact {
                point,
                previous_block,
                proposal: proposal.unwrap_or(Hash::ZERO),
                expels: expels.iter().map(|op| op.fact_hash()).collect(),
            };
            let fact = match proposal {
                Some(_) => BallotFact::Init(fact),
                None => BallotFact::EmptyProposalInit(fact),
            };
            let ballot = Ballot::new(Some(vp), ctx.sign(fact), expels);

            if let Err(e) = ctx.args.broadcaster.broadcast_with_timer(ballot, wait) {
                warn!(%point, error = %e, "failed to broadcast INIT ballot");
                return;
            }
            ctx.args
                .stuck
                .new_point(StagePoint::new(point, Stage::Init));
        });
    }
}

/// Height to sync up to after seeing `vp`: its height once finalized,
/// otherwise the one before.
pub(crate) fn sync_target(vp: &Voteproof) -> Height {
    let height = vp.stage_point().height();
    match (vp.stage(), vp.majority()) {
        (Stage::Accept, Some(_)) => height,
        _ => height.prev(),
    }
}

pub(crate) type SwitchResult = Result<Option<SwitchContext>, StatesError>;

/// Hooks of one state.
#[async_trait]
pub(crate) trait Handler: Send {
    fn state(&self) -> StateType;

    /// Start the state. `Some` redirects to another state right away.
    async fn enter(&mut self, from: StateType, sctx: SwitchContext) -> SwitchResult;

    /// Leave the state for `to`.
    async fn exit(&mut self, to: &SwitchContext);

    async fn new_voteproof(&mut self, _vp: Voteproof) -> SwitchResult {
        Ok(None)
    }

    async fn on_event(&mut self, _event: Event) -> SwitchResult {
        Ok(None)
    }

    /// Switch to the current state again.
    async fn reenter(&mut self, _sctx: SwitchContext) -> SwitchResult {
        Ok(None)
    }
}

struct EmptyHandler;

#[async_trait]
impl Handler for EmptyHandler {
    fn state(&self) -> StateType {
        StateType::Empty
    }

    async fn enter(&mut self, _from: StateType, _sctx: SwitchContext) -> SwitchResult {
        Ok(None)
    }

    async fn exit(&mut self, _to: &SwitchContext) {}
}

struct Receivers {
    events: mpsc::UnboundedReceiver<Event>,
    switches: mpsc::UnboundedReceiver<SwitchContext>,
}

/// The node state machine.
///
/// # Example
///
/// ```ignore
/// let states = Arc::new(States::new(args));
/// let handle = states.start(cancel.clone())?;
/// // ballots from the network
/// states.vote(ballot)?;
/// ```
pub struct States {
    ctx: Ctx,
    receivers: Mutex<Option<Receivers>>,
}

impl States {
    pub fn new(args: StatesArgs) -> Self {
        let (events_tx, events) = mpsc::unbounded_channel();
        let (switches_tx, switches) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(StateType::Empty);

        Self {
            ctx: Ctx {
                args: Arc::new(args),
                shared: Arc::new(Shared {
                    allow_consensus: AtomicBool::new(true),
                    state,
                    last_voteproofs: LastVoteproofsHandler::new(),
                    handover_x: Mutex::new(None),
                    handover_y: Mutex::new(None),
                    events: events_tx,
                    switches: switches_tx,
                }),
            },
            receivers: Mutex::new(Some(Receivers { events, switches })),
        }
    }

    /// Spawn the event loop; the node boots right away. Runs until `cancel`.
    pub fn start(&self, cancel: CancellationToken) -> Result<JoinHandle<()>, StatesError> {
        let receivers = self
            .receivers
            .lock()
            .take()
            .ok_or(StatesError::AlreadyStarted)?;
        let voteproofs = self
            .ctx
            .args
            .ballotbox
            .voteproof_receiver()
            .ok_or(StatesError::AlreadyStarted)?;
        let stuck = self
            .ctx
            .args
            .stuck
            .voteproof_receiver()
            .ok_or(StatesError::AlreadyStarted)?;

        let driver = Driver::new(self.ctx.clone(), Box::new(new_handler));
        Ok(tokio::spawn(driver.run(cancel, receivers, voteproofs, stuck)))
    }

    /// Ask the event loop to switch.
    pub fn ask_move_state(&self, sctx: SwitchContext) -> Result<(), StatesError> {
        self.ctx
            .shared
            .switches
            .send(sctx)
            .map_err(|_| StatesError::Stopped)
    }

    /// Move to `Stopped`.
    pub fn hold(&self) -> Result<(), StatesError> {
        self.ask_move_state(SwitchContext::Stopped)
    }

    pub fn current(&self) -> StateType {
        *self.ctx.shared.state.borrow()
    }

    /// Watch state changes.
    pub fn subscribe(&self) -> watch::Receiver<StateType> {
        self.ctx.shared.state.subscribe()
    }

    pub fn allow_consensus(&self) -> bool {
        self.ctx.allow_consensus()
    }

    pub fn set_allow_consensus(&self, allow: bool) {
        if self.ctx.shared.allow_consensus.swap(allow, Ordering::SeqCst) != allow {
            info!(allow, "allow consensus changed");
        }
    }

    /// Vote a ballot received from the network. The ballot is also offered
    /// to the mimic.
    pub fn vote(&self, ballot: Ballot) -> Result<bool, StatesError> {
        let args = &self.ctx.args;
        let voted = args.ballotbox.vote(ballot.clone(), args.params.threshold)?;
        if let Err(e) = args.mimic.observe(&ballot) {
            debug!(error = %e, "failed to mimic ballot");
        }
        Ok(voted)
    }

    pub fn last_voteproofs(&self) -> LastVoteproofs {
        self.ctx.last_voteproofs()
    }

    /// Store the voteproofs of an imported block.
    pub fn set_last_voteproofs(&self, ivp: &Voteproof, avp: &Voteproof) {
        self.ctx.shared.last_voteproofs.force_set(ivp);
        self.ctx.shared.last_voteproofs.force_set(avp);
    }

    /// Height of the last stored block.
    pub fn last_height(&self) -> Height {
        self.ctx.last_height()
    }

    pub fn local(&self) -> &LocalNode {
        &self.ctx.args.local
    }

    pub fn handover_x(&self) -> Option<Arc<HandoverXBroker>> {
        self.ctx.shared.handover_x.lock().clone()
    }

    pub fn handover_y(&self) -> Option<Arc<HandoverYBroker>> {
        self.ctx.handover_y()
    }

    pub(crate) fn set_handover_x(&self, broker: Option<Arc<HandoverXBroker>>) {
        *self.ctx.shared.handover_x.lock() = broker;
    }

    pub(crate) fn set_handover_y(&self, broker: Option<Arc<HandoverYBroker>>) {
        *self.ctx.shared.handover_y.lock() = broker;
    }

    pub(crate) fn events(&self) -> mpsc::UnboundedSender<Event> {
        self.ctx.shared.events.clone()
    }

    pub(crate) fn handover_config(&self) -> &HandoverConfig {
        &self.ctx.args.handover
    }
}

type HandlerFactory = Box<dyn Fn(&Ctx, StateType) -> Box<dyn Handler> + Send>;

fn new_handler(ctx: &Ctx, state: StateType) -> Box<dyn Handler> {
    let ctx = ctx.clone();
    match state {
        StateType::Empty => Box::new(EmptyHandler),
        StateType::Stopped => Box::new(StoppedHandler::new(ctx)),
        StateType::Booting => Box::new(BootingHandler::new(ctx)),
        StateType::Joining => Box::new(JoiningHandler::new(ctx)),
        StateType::Consensus => Box::new(ConsensusHandler::new(ctx, false)),
        StateType::Handover => Box::new(ConsensusHandler::new(ctx, true)),
        StateType::Syncing => Box::new(SyncingHandler::new(ctx)),
        StateType::Broken => Box::new(BrokenHandler::new(ctx)),
    }
}

struct Driver {
    ctx: Ctx,
    handlers: HandlerFactory,
    current: Box<dyn Handler>,
    /// `current` was left and waits for its replacement.
    exited: bool,
}

impl Driver {
    fn new(ctx: Ctx, handlers: HandlerFactory) -> Self {
        Self {
            ctx,
            handlers,
            current: Box::new(EmptyHandler),
            exited: false,
        }
    }

    async fn run(
        mut self,
        cancel: CancellationToken,
        mut receivers: Receivers,
        mut voteproofs: mpsc::Receiver<Voteproof>,
        mut stuck: mpsc::UnboundedReceiver<Voteproof>,
    ) {
        info!(node = %self.ctx.args.local.address(), "states started");
        self.switch(SwitchContext::Booting).await;

        loop {
            let result = tokio::select! {
                biased;

                _ = cancel.cancelled() => break,

                Some(sctx) = receivers.switches.recv() => Ok(Some(sctx)),

                Some(event) = receivers.events.recv() => self.on_event(event).await,

                Some(vp) = voteproofs.recv() => self.on_voteproof(vp).await,

                Some(vp) = stuck.recv() => self.on_voteproof(vp).await,
            };

            match result {
                Ok(None) => {}
                Ok(Some(sctx)) => self.switch(sctx).await,
                Err(e) => {
                    warn!(state = %self.current.state(), error = %e, "handler failed");
                    self.switch(SwitchContext::broken(e)).await;
                }
            }
        }

        self.exit_current(&SwitchContext::Stopped).await;
        self.publish(StateType::Stopped);
        info!("states stopped");
    }

    /// Leave the current handler; a handler is left once.
    async fn exit_current(&mut self, to: &SwitchContext) {
        if self.exited {
            return;
        }
        self.exited = true;
        self.current.exit(to).await;
    }

    fn set_current(&mut self, handler: Box<dyn Handler>) {
        let state = handler.state();
        self.current = handler;
        self.exited = false;
        self.publish(state);
    }

    fn publish(&self, state: StateType) {
        self.ctx.shared.state.send_replace(state);
    }

    async fn on_voteproof(&mut self, vp: Voteproof) -> SwitchResult {
        let shared = &self.ctx.shared;
        if !shared.last_voteproofs.set(&vp) {
            trace!(stage_point = %vp.stage_point(), "old voteproof ignored");
            return Ok(None);
        }
        self.ctx.args.ballotbox.set_last_point_from_voteproof(&vp);

        debug!(
            stage_point = %vp.stage_point(),
            result = ?vp.result(),
            kind = ?vp.kind(),
            state = %self.current.state(),
            "new voteproof"
        );

        let x = shared.handover_x.lock().clone();
        if let Some(x) = x {
            match x.send_voteproof(vp.clone()) {
                Ok(true) => {
                    *shared.handover_x.lock() = None;
                    shared.allow_consensus.store(false, Ordering::SeqCst);
                    info!(stage_point = %vp.stage_point(), "handover finished; consensus moved to the other process");
                    return Ok(Some(SwitchContext::Syncing {
                        height: self.ctx.last_height(),
                    }));
                }
                Ok(false) => {}
                Err(e) => {
                    warn!(error = %e, "failed to send voteproof to handover y");
                    x.cancel(Some(e));
                }
            }
        }

        self.current.new_voteproof(vp).await
    }

    async fn on_event(&mut self, event: Event) -> SwitchResult {
        match event {
            Event::Voteproof(vp) => self.on_voteproof(vp).await,
            Event::HandoverXCanceled => {
                *self.ctx.shared.handover_x.lock() = None;
                Ok(None)
            }
            Event::HandoverYFinished { ivp, proposal } => {
                *self.ctx.shared.handover_y.lock() = None;
                self.ctx.shared.allow_consensus.store(true, Ordering::SeqCst);
                info!(
                    stage_point = %ivp.stage_point(),
                    proposal = proposal.is_some(),
                    "handover finished; moving to consensus"
                );
                Ok(Some(SwitchContext::Consensus { ivp }))
            }
            Event::HandoverYCanceled => {
                *self.ctx.shared.handover_y.lock() = None;
                if self.current.state() == StateType::Handover {
                    return Ok(Some(SwitchContext::Syncing {
                        height: self.ctx.last_height(),
                    }));
                }
                Ok(None)
            }
            event => self.current.on_event(event).await,
        }
    }

    /// Apply the switch rules to a requested switch.
    fn check(&self, from: StateType, sctx: SwitchContext) -> Result<SwitchContext, StatesError> {
        let to = sctx.state();
        if from == StateType::Stopped && !matches!(to, StateType::Booting | StateType::Broken) {
            return Err(StatesError::WrongSwitch { from, to });
        }

        match to {
            StateType::Joining | StateType::Consensus if !self.ctx.allow_consensus() => {
                debug!(%to, "consensus not allowed; syncing instead");
                Ok(SwitchContext::Syncing {
                    height: self.ctx.last_height(),
                })
            }
            StateType::Handover if self.ctx.handover_y().is_none() => {
                debug!("no handover broker; syncing instead");
                Ok(SwitchContext::Syncing {
                    height: self.ctx.last_height(),
                })
            }
            _ => Ok(sctx),
        }
    }

    async fn switch(&mut self, sctx: SwitchContext) {
        let max = self.ctx.args.params.max_switch_escalations;
        let mut escalations = 0;
        let mut sctx = sctx;

        loop {
            let from = self.current.state();
            let next = match self.check(from, sctx) {
                Ok(next) => next,
                Err(e) => {
                    debug!(error = %e, "switch ignored");
                    return;
                }
            };
            let to = next.state();

            let result = if from == to && !self.exited {
                trace!(state = %to, "re-enter state");
                self.current.reenter(next).await
            } else {
                self.exit_current(&next).await;
                let mut handler = (self.handlers)(&self.ctx, to);
                let result = handler.enter(from, next).await;
                if result.is_ok() {
                    self.set_current(handler);
                    info!(%from, %to, "state switched");
                }
                result
            };

            match result {
                Ok(None) => return,
                Ok(Some(redirect)) => sctx = redirect,
                Err(e) => {
                    escalations += 1;
                    warn!(%from, %to, error = %e, escalations, "failed to switch state");
                    if escalations >= max {
                        self.force_broken(e).await;
                        return;
                    }
                    sctx = SwitchContext::broken(e);
                }
            }
        }
    }

    /// Broken regardless of what its `enter` returns.
    async fn force_broken(&mut self, e: StatesError) {
        error!(error = %e, "too many failed switches; forcing broken");
        let sctx = SwitchContext::broken(&e);
        self.exit_current(&sctx).await;

        let from = self.current.state();
        let mut handler = (self.handlers)(&self.ctx, StateType::Broken);
        match handler.enter(from, sctx).await {
            Ok(Some(redirect)) => {
                warn!(to = %redirect.state(), "forced broken ignores redirect")
            }
            Ok(None) => {}
            Err(e) => error!(error = %e, "failed to enter forced broken"),
        }
        self.set_current(handler);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use isaac_core::{ProposalProcessor, StaticSuffrage};
    use isaac_storage::MemoryPermanentDatabase;
    use isaac_test_helpers::{
        accept_voteproof, init_fact, init_voteproof, make_draw_voteproof, make_nodes,
        make_suffrage, network_id, point,
    };
    use isaac_types::{NodeAddress, Threshold};
    use tracing_test::traced_test;

    struct NoProposals;

    #[async_trait]
    impl ProcessorFactory for NoProposals {
        async fn proposal(
            &self,
            _cancel: CancellationToken,
            hash: &Hash,
        ) -> Result<ProposalSignFact, ProcessorError> {
            Err(ProcessorError::NotFound(hash.to_string()))
        }

        async fn manifest(&self, _height: Height) -> Result<Option<Manifest>, ProcessorError> {
            Ok(None)
        }

        fn new_processor(
            &self,
            _proposal: ProposalSignFact,
            _previous: Option<Manifest>,
        ) -> Result<Arc<dyn ProposalProcessor>, ProcessorError> {
            Err(ProcessorError::NotFound("processor".into()))
        }
    }

    #[async_trait]
    impl ProposalSelector for NoProposals {
        async fn select(
            &self,
            _cancel: CancellationToken,
            point: Point,
            _previous_block: Option<Hash>,
        ) -> Result<ProposalSignFact, ProcessorError> {
            Err(ProcessorError::NotFound(point.to_string()))
        }
    }

    fn new_ctx() -> Ctx {
        let local = make_nodes(1).remove(0);
        let params = Arc::new(IsaacParams::new(network_id()));
        let suffrage: Arc<dyn SuffrageProvider> =
            Arc::new(StaticSuffrage(make_suffrage(&[local.clone()])));
        let ballotbox = Arc::new(Ballotbox::new(network_id(), suffrage.clone(), 64, 16));
        let stuck = Arc::new(BallotStuckResolver::new(
            params.clone(),
            local.clone(),
            ballotbox.clone(),
            Arc::new(|_: StagePoint, _: Vec<NodeAddress>| {}),
        ));
        let proposals = Arc::new(NoProposals);
        let processors = Arc::new(ProposalProcessors::new(
            proposals.clone(),
            3,
            Duration::from_millis(10),
        ));
        let (tx, _) = mpsc::unbounded_channel();
        let broadcaster = Arc::new(BallotBroadcaster::new(
            params.clone(),
            ballotbox.clone(),
            Arc::new(tx),
        ));
        let mimic = Arc::new(MimicBallots::new(
            local.clone(),
            network_id(),
            suffrage.clone(),
            broadcaster.clone(),
        ));

        let states = States::new(StatesArgs {
            params,
            local,
            ballotbox,
            stuck,
            processors,
            factory: proposals.clone(),
            selector: proposals,
            suffrage,
            permanent: Arc::new(MemoryPermanentDatabase::new()),
            broadcaster,
            mimic,
            new_syncer: Arc::new(|_: Height| -> Result<Arc<dyn Syncer>, StatesError> {
                Err(StatesError::Stopped)
            }),
            when_new_block_saved: Arc::new(|_: &BlockMap| {}),
            when_new_block_confirmed: Arc::new(|_: Height| {}),
            handover: HandoverConfig::default(),
        });
        states.ctx.clone()
    }

    /// Handler that records its hooks.
    struct Recorded {
        state: StateType,
        fail_enter: bool,
        log: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Handler for Recorded {
        fn state(&self) -> StateType {
            self.state
        }

        async fn enter(&mut self, _from: StateType, _sctx: SwitchContext) -> SwitchResult {
            self.log.lock().push(format!("enter {}", self.state));
            if self.fail_enter {
                return Err(StatesError::UnknownSuffrage(33));
            }
            Ok(None)
        }

        async fn exit(&mut self, _to: &SwitchContext) {
            self.log.lock().push(format!("exit {}", self.state));
        }
    }

    /// Driver in syncing whose handlers fail to enter `failing`.
    fn recorded_driver(failing: &'static [StateType]) -> (Driver, Arc<Mutex<Vec<String>>>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let l = log.clone();
        let mut driver = Driver::new(
            new_ctx(),
            Box::new(move |_: &Ctx, state: StateType| -> Box<dyn Handler> {
                Box::new(Recorded {
                    state,
                    fail_enter: failing.contains(&state),
                    log: l.clone(),
                })
            }),
        );
        driver.current = Box::new(Recorded {
            state: StateType::Syncing,
            fail_enter: false,
            log: log.clone(),
        });
        (driver, log)
    }

    fn count(log: &Mutex<Vec<String>>, entry: &str) -> usize {
        log.lock().iter().filter(|e| *e == entry).count()
    }

    #[tokio::test]
    async fn test_failed_enter_exits_once() {
        let (mut driver, log) = recorded_driver(&[StateType::Joining]);

        driver.switch(SwitchContext::Joining { vp: None }).await;
        assert_eq!(
            *log.lock(),
            vec!["exit syncing", "enter joining", "enter broken"]
        );
        assert_eq!(driver.current.state(), StateType::Broken);
        assert_eq!(*driver.ctx.shared.state.borrow(), StateType::Broken);

        driver
            .switch(SwitchContext::Syncing { height: Height(3) })
            .await;
        assert_eq!(driver.current.state(), StateType::Syncing);
        assert_eq!(count(&log, "exit syncing"), 1);
        assert_eq!(count(&log, "exit broken"), 1);
        assert_eq!(count(&log, "enter syncing"), 1);
    }

    #[traced_test]
    #[tokio::test]
    async fn test_forced_broken() {
        let (mut driver, log) = recorded_driver(&[StateType::Joining, StateType::Broken]);

        driver.switch(SwitchContext::Joining { vp: None }).await;

        // two escalations, then the forced one
        assert_eq!(count(&log, "enter broken"), 3);
        assert_eq!(count(&log, "exit syncing"), 1);
        assert_eq!(driver.current.state(), StateType::Broken);
        assert_eq!(*driver.ctx.shared.state.borrow(), StateType::Broken);
        assert!(logs_contain("failed to enter forced broken"));
    }

    #[test]
    fn test_sync_target() {
        let nodes = make_nodes(3);

        assert_eq!(sync_target(&accept_voteproof(33, &nodes)), Height(33));
        assert_eq!(sync_target(&init_voteproof(point(33, 0), &nodes)), Height(32));

        let mut other = init_fact(point(33, 1));
        if let BallotFact::Init(f) = &mut other {
            f.proposal = Hash::from_bytes(b"other");
        }
        let draw = make_draw_voteproof(
            &[
                (init_fact(point(33, 1)), &nodes[0]),
                (other.clone(), &nodes[1]),
                (other, &nodes[2]),
            ],
            Threshold::MAX,
        );
        assert_eq!(sync_target(&draw), Height(32));
    }

    #[test]
    fn test_switch_context_state() {
        assert_eq!(SwitchContext::Booting.state(), StateType::Booting);
        assert_eq!(
            SwitchContext::Syncing { height: Height(3) }.state(),
            StateType::Syncing
        );
        assert_eq!(
            SwitchContext::broken("boom").state(),
            StateType::Broken
        );
        assert_eq!(StateType::Handover.to_string(), "handover");
    }
}
