//! Consensus: vote INIT and ACCEPT ballots, process proposals and save
//! blocks.
//!
//! The same handler runs the `Handover` state in quiet mode: it follows the
//! voteproofs handover X forwards, processes and saves like a voting node,
//! but signs no ballots. Each step is reported to X as a challenge instead.

use super::{sync_target, Ctx, Event, Handler, StateType, SwitchContext, SwitchResult};
use crate::handover::HandoverYBroker;
use crate::StatesError;
use async_trait::async_trait;
use isaac_core::ProcessorError;
use isaac_types::{
    AcceptBallotFact, Ballot, BallotFact, BlockMap, Hash, Height, Manifest, Stage, StagePoint,
    Voteproof,
};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

pub(crate) struct ConsensusHandler {
    ctx: Ctx,
    quiet: bool,
    handover: Option<Arc<HandoverYBroker>>,
    cancel: CancellationToken,
    /// INIT voteproof of the current point.
    ivp: Option<Voteproof>,
    processed: bool,
    manifest: Option<Manifest>,
    /// ACCEPT majority that arrived before processing returned.
    pending_avp: Option<Voteproof>,
    /// Saved height waiting for its expels to be confirmed.
    unconfirmed: Option<Height>,
}

impl ConsensusHandler {
    pub(crate) fn new(ctx: Ctx, quiet: bool) -> Self {
        Self {
            ctx,
            quiet,
            handover: None,
            cancel: CancellationToken::new(),
            ivp: None,
            processed: false,
            manifest: None,
            pending_avp: None,
            unconfirmed: None,
        }
    }

    fn is_old_init(&self, ivp: &Voteproof) -> bool {
        let Some(current) = &self.ivp else {
            return false;
        };
        let (sp, current_sp) = (ivp.stage_point(), current.stage_point());
        sp < current_sp
            || (sp == current_sp && !(ivp.is_suffrage_confirm() && !current.is_suffrage_confirm()))
    }

    async fn new_init(&mut self, ivp: Voteproof) -> SwitchResult {
        if self.is_old_init(&ivp) {
            return Ok(None);
        }

        let sp = ivp.stage_point();
        let height = sp.height();
        let last = self.ctx.last_block_map();
        let last_height = last.as_ref().map(|m| m.height()).unwrap_or(Height::NIL);

        if height <= last_height {
            return Ok(None);
        }
        if height > last_height.next() {
            return Ok(Some(SwitchContext::Syncing {
                height: sync_target(&ivp),
            }));
        }
        if !self.quiet && !self.ctx.in_suffrage(height)? {
            debug!(%height, "not in suffrage; syncing");
            return Ok(Some(SwitchContext::Syncing {
                height: last_height,
            }));
        }

        let Some(fact) = ivp.majority().cloned() else {
            self.challenge(sp);
            return self.next_round(ivp);
        };

        if fact.previous_block() != last.as_ref().map(|m| m.manifest.hash()) {
            debug!(%height, "INIT majority on another previous block; syncing");
            self.cancel_processing().await;
            return Ok(Some(SwitchContext::Syncing {
                height: last_height,
            }));
        }

        if let Some(h) = self.unconfirmed.take() {
            (self.ctx.args.when_new_block_confirmed)(h);
        }

        if matches!(fact, BallotFact::EmptyProposalInit(_)) {
            debug!(stage_point = %sp, "empty proposal; next round");
            self.challenge(sp);
            return self.next_round(ivp);
        }

        if ivp.is_expel() && !ivp.is_suffrage_confirm() {
            self.ivp = Some(ivp.clone());
            if !self.quiet {
                self.suffrage_confirm(&ivp, &fact)?;
            }
            return Ok(None);
        }

        self.process(ivp, fact.proposal());
        Ok(None)
    }

    /// Vote that the expels of `ivp` are ratified before processing.
    fn suffrage_confirm(&self, ivp: &Voteproof, fact: &BallotFact) -> Result<(), StatesError> {
        let BallotFact::Init(init) = fact else {
            return Ok(());
        };
        debug!(stage_point = %ivp.stage_point(), expels = ivp.expels().len(), "suffrage confirm");

        let ballot = Ballot::new(
            Some(ivp.clone()),
            self.ctx.sign(BallotFact::SuffrageConfirm(init.clone())),
            ivp.expels().to_vec(),
        );
        self.ctx
            .args
            .broadcaster
            .broadcast_with_timer(ballot, Duration::ZERO)
    }

    fn process(&mut self, ivp: Voteproof, proposal: Hash) {
        self.ctx.args.stuck.clean();
        self.ivp = Some(ivp.clone());
        self.processed = false;
        self.manifest = None;
        self.pending_avp = None;

        let ctx = self.ctx.clone();
        let cancel = self.cancel.child_token();
        let point = ivp.stage_point().point;

        tokio::spawn(async move {
            let result: Result<Manifest, ProcessorError> = async {
                let previous = ctx.args.factory.manifest(point.height.prev()).await?;
                ctx.args
                    .processors
                    .process(cancel, point, proposal, previous, &ivp)
                    .await
            }
            .await;
            ctx.send_event(Event::Processed { ivp, result });
        });
    }

    async fn processed(
        &mut self,
        ivp: Voteproof,
        result: Result<Manifest, ProcessorError>,
    ) -> SwitchResult {
        if !matches!(&self.ivp, Some(current) if current.id() == ivp.id()) {
            return Ok(None);
        }
        let Some(majority) = ivp.majority() else {
            return Ok(None);
        };

        let sp = ivp.stage_point();
        let accept = |new_block| AcceptBallotFact {
            point: sp.point,
            proposal: majority.proposal(),
            new_block,
            expels: Vec::new(),
        };
        let fact = match result {
            Ok(manifest) => {
                let fact = BallotFact::Accept(accept(manifest.hash()));
                self.manifest = Some(manifest);
                fact
            }
            Err(ProcessorError::EmptyOperations) => {
                BallotFact::EmptyOperationsAccept(accept(Hash::ZERO))
            }
            Err(ProcessorError::NotProposalProcessorProcessed | ProcessorError::Canceled) => {
                if self.cancel.is_cancelled() {
                    return Ok(None);
                }
                BallotFact::NotProcessedAccept(accept(Hash::ZERO))
            }
            Err(e) => return Err(e.into()),
        };
        self.processed = true;
        debug!(stage_point = %sp, new_block = ?fact.new_block(), "proposal processed");

        if self.quiet {
            self.challenge(sp);
            self.ready(sp);
        } else {
            let ballot = Ballot::new(Some(ivp.clone()), self.ctx.sign(fact), Vec::new());
            let args = &self.ctx.args;
            args.broadcaster
                .broadcast_with_timer(ballot, args.params.wait_preparing_init_ballot)?;
            args.stuck.new_point(sp.with_stage(Stage::Accept));
        }

        match self.pending_avp.take() {
            Some(avp) => self.new_accept(avp).await,
            None => Ok(None),
        }
    }

    async fn new_accept(&mut self, avp: Voteproof) -> SwitchResult {
        let sp = avp.stage_point();
        let Some(ivp) = self.ivp.clone() else {
            let target = sync_target(&avp);
            if target > self.ctx.last_height() {
                return Ok(Some(SwitchContext::Syncing { height: target }));
            }
            return Ok(None);
        };

        let current = ivp.stage_point().point;
        if sp.height() > current.height {
            self.cancel_processing().await;
            return Ok(Some(SwitchContext::Syncing {
                height: sync_target(&avp),
            }));
        }
        if sp.point < current {
            return Ok(None);
        }

        let majority = avp.majority().cloned();
        if sp.point > current {
            return match majority {
                None => {
                    self.challenge(sp);
                    self.next_round(avp)
                }
                Some(_) => {
                    self.cancel_processing().await;
                    Ok(Some(SwitchContext::Syncing {
                        height: sp.height(),
                    }))
                }
            };
        }

        let Some(fact) = majority else {
            debug!(stage_point = %sp, "ACCEPT draw; syncing");
            self.cancel_processing().await;
            return Ok(Some(SwitchContext::Syncing {
                height: sync_target(&avp),
            }));
        };
        if matches!(
            fact,
            BallotFact::EmptyOperationsAccept(_) | BallotFact::NotProcessedAccept(_)
        ) {
            debug!(stage_point = %sp, "no block at this round; next round");
            self.challenge(sp);
            return self.next_round(avp);
        }

        if !self.processed {
            trace!(stage_point = %sp, "ACCEPT majority before processed; pending");
            self.pending_avp = Some(avp);
            return Ok(None);
        }
        let Some(manifest) = &self.manifest else {
            self.cancel_processing().await;
            return Ok(Some(SwitchContext::Syncing {
                height: sp.height(),
            }));
        };
        if fact.new_block() != Some(manifest.hash()) {
            debug!(stage_point = %sp, "ACCEPT majority on another block; syncing");
            self.cancel_processing().await;
            return Ok(Some(SwitchContext::Syncing {
                height: sp.height(),
            }));
        }

        self.save(avp, fact.proposal()).await
    }

    async fn save(&mut self, avp: Voteproof, proposal: Hash) -> SwitchResult {
        let sp = avp.stage_point();
        let args = &self.ctx.args;

        let map = match args
            .processors
            .save(self.cancel.child_token(), proposal, &avp)
            .await
        {
            Ok(map) => map,
            Err(ProcessorError::AlreadySaved) => match args.permanent.block_map(sp.height()) {
                Some(map) => map,
                None => return Ok(None),
            },
            Err(ProcessorError::NotProposalProcessorProcessed) => {
                return Ok(Some(SwitchContext::Syncing {
                    height: sp.height(),
                }))
            }
            Err(e) => return Err(e.into()),
        };
        self.manifest = None;
        info!(height = %map.height(), block = %map.manifest.hash(), "new block saved");

        (args.when_new_block_saved)(&map);
        if avp.is_expel() {
            self.unconfirmed = Some(map.height());
        } else {
            (args.when_new_block_confirmed)(map.height());
        }

        if self.quiet {
            self.challenge_block_map(sp, map);
            return Ok(None);
        }
        self.next_block(avp, &map);
        Ok(None)
    }

    fn next_block(&self, avp: Voteproof, map: &BlockMap) {
        let point = avp.stage_point().point.next_height();
        self.ctx.prepare_init_ballot(
            self.cancel.child_token(),
            point,
            Some(map.manifest.hash()),
            avp,
            self.ctx.args.params.wait_preparing_init_ballot,
        );
    }

    fn next_round(&self, vp: Voteproof) -> SwitchResult {
        if self.quiet {
            return Ok(None);
        }
        let point = vp.stage_point().point.next_round();
        let previous = self.ctx.last_block_map().map(|m| m.manifest.hash());
        debug!(%point, "next round");
        self.ctx
            .prepare_init_ballot(self.cancel.child_token(), point, previous, vp, Duration::ZERO);
        Ok(None)
    }

    async fn cancel_processing(&mut self) {
        self.ctx.args.processors.cancel().await;
        self.manifest = None;
        self.pending_avp = None;
    }

    fn challenge(&self, sp: StagePoint) {
        if let Some(y) = &self.handover {
            if let Err(e) = y.challenge_stage_point(sp) {
                debug!(stage_point = %sp, error = %e, "failed to challenge stage point");
            }
        }
    }

    fn challenge_block_map(&self, sp: StagePoint, map: BlockMap) {
        if let Some(y) = &self.handover {
            if let Err(e) = y.challenge_block_map(sp, map) {
                debug!(stage_point = %sp, error = %e, "failed to challenge block map");
            }
        }
    }

    fn ready(&self, sp: StagePoint) {
        if let Some(y) = &self.handover {
            if let Err(e) = y.ready(sp) {
                debug!(stage_point = %sp, error = %e, "failed to send ready");
            }
        }
    }
}

#[async_trait]
impl Handler for ConsensusHandler {
    fn state(&self) -> StateType {
        if self.quiet {
            StateType::Handover
        } else {
            StateType::Consensus
        }
    }

    async fn enter(&mut self, from: StateType, sctx: SwitchContext) -> SwitchResult {
        self.ctx.args.mimic.stop();

        match sctx {
            SwitchContext::Consensus { ivp } if !self.quiet => {
                self.ctx.shared.last_voteproofs.set(&ivp);
                self.new_init(ivp).await
            }
            SwitchContext::Handover { vp } if self.quiet => {
                self.handover = self.ctx.handover_y();
                if self.handover.is_none() {
                    return Ok(Some(SwitchContext::Syncing {
                        height: self.ctx.last_height(),
                    }));
                }
                match vp {
                    Some(vp) => self.new_voteproof(vp).await,
                    None => Ok(None),
                }
            }
            other => Err(StatesError::WrongSwitch {
                from,
                to: other.state(),
            }),
        }
    }

    async fn exit(&mut self, to: &SwitchContext) {
        self.cancel.cancel();
        let args = &self.ctx.args;
        args.broadcaster.stop_timers();
        args.stuck.clean();
        if !matches!(
            to,
            SwitchContext::Consensus { .. } | SwitchContext::Handover { .. }
        ) {
            args.processors.cancel().await;
        }
    }

    async fn new_voteproof(&mut self, vp: Voteproof) -> SwitchResult {
        match vp.stage() {
            Stage::Init => self.new_init(vp).await,
            Stage::Accept => self.new_accept(vp).await,
        }
    }

    async fn on_event(&mut self, event: Event) -> SwitchResult {
        match event {
            Event::Processed { ivp, result } => self.processed(ivp, result).await,
            _ => Ok(None),
        }
    }
}
