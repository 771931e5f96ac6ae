//! Handover Y: the process taking over consensus.
//!
//! Y follows the voteproofs X forwards without voting, and proves it keeps
//! up by challenging X with each processed stage-point and saved block map.
//! Every challenge must be answered positively; anything else cancels the
//! handover.

use super::x::WhenCanceled;
use crate::{HandoverConfig, HandoverError};
use isaac_core::{MessageSender, OutboundMessage};
use isaac_messages::{HandoverBody, HandoverData, HandoverMessage};
use isaac_types::{BlockMap, ConnInfo, ProposalSignFact, StagePoint, Voteproof};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, trace, warn};

/// Receives voteproofs forwarded by X.
pub type WhenNewVoteproof = Arc<dyn Fn(Voteproof) + Send + Sync>;

/// Receives proposals forwarded by X.
pub type WhenNewProposal = Arc<dyn Fn(ProposalSignFact) + Send + Sync>;

/// Called once with the INIT voteproof Y starts consensus from.
pub type WhenFinished = Arc<dyn Fn(Voteproof, Option<ProposalSignFact>) + Send + Sync>;

#[derive(Debug, Default)]
struct YState {
    last_challenge: Option<StagePoint>,
    accepted: u64,
    last_ready: Option<(StagePoint, Instant)>,
}

/// Broker on the following side of a handover.
pub struct HandoverYBroker {
    id: String,
    config: HandoverConfig,
    x: ConnInfo,
    sender: Arc<dyn MessageSender>,
    when_new_voteproof: WhenNewVoteproof,
    when_new_proposal: Option<WhenNewProposal>,
    when_finished: WhenFinished,
    when_canceled: WhenCanceled,
    state: Mutex<YState>,
    done: AtomicBool,
}

impl HandoverYBroker {
    /// Broker for the handover `id` X created.
    pub fn new(
        config: HandoverConfig,
        id: impl Into<String>,
        x: ConnInfo,
        sender: Arc<dyn MessageSender>,
        when_new_voteproof: WhenNewVoteproof,
        when_finished: WhenFinished,
        when_canceled: WhenCanceled,
    ) -> Self {
        Self {
            id: id.into(),
            config,
            x,
            sender,
            when_new_voteproof,
            when_new_proposal: None,
            when_finished,
            when_canceled,
            state: Mutex::new(YState::default()),
            done: AtomicBool::new(false),
        }
    }

    pub fn with_proposal_handler(mut self, f: WhenNewProposal) -> Self {
        self.when_new_proposal = Some(f);
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::SeqCst)
    }

    /// Challenges X answered positively.
    pub fn accepted(&self) -> u64 {
        self.state.lock().accepted
    }

    /// Handle a message from X.
    pub fn receive(&self, message: HandoverMessage) -> Result<(), HandoverError> {
        if message.id != self.id {
            return Err(HandoverError::Ignore(format!(
                "unknown handover id {}",
                message.id
            )));
        }
        if self.is_done() {
            return Err(HandoverError::Canceled("broker done".into()));
        }

        let result = match message.body {
            HandoverBody::Data(HandoverData::Voteproof(vp)) => {
                trace!(id = %self.id, stage_point = %vp.stage_point(), "voteproof from x");
                (self.when_new_voteproof)(vp);
                Ok(())
            }
            HandoverBody::Data(HandoverData::Proposal(pr)) => {
                if let Some(f) = &self.when_new_proposal {
                    f(pr);
                }
                Ok(())
            }
            HandoverBody::ChallengeResponse { point, ok, err } => {
                self.challenge_response(point, ok, err)
            }
            HandoverBody::ReadyResponse { point, ok, err } => {
                debug!(id = %self.id, %point, ok, err = ?err, "ready response");
                Ok(())
            }
            HandoverBody::Finish {
                voteproof,
                proposal,
            } => return self.finish(voteproof, proposal),
            HandoverBody::Cancel { err } => {
                let reason = err.unwrap_or_else(|| "canceled by x".into());
                self.close(HandoverError::Canceled(reason));
                return Ok(());
            }
            other => Err(HandoverError::Ignore(format!("unexpected {}", other.kind()))),
        };

        if let Err(e @ HandoverError::Canceled(_)) = &result {
            self.cancel(Some(e.clone()));
        }
        result
    }

    fn challenge_response(
        &self,
        point: StagePoint,
        ok: bool,
        err: Option<String>,
    ) -> Result<(), HandoverError> {
        let mut state = self.state.lock();
        if state.last_challenge != Some(point) {
            return Err(HandoverError::Canceled(format!(
                "response for unknown challenge {point}"
            )));
        }
        if !ok {
            return Err(HandoverError::Canceled(
                err.unwrap_or_else(|| format!("challenge {point} rejected")),
            ));
        }
        state.accepted += 1;
        Ok(())
    }

    fn finish(
        &self,
        voteproof: Option<Voteproof>,
        proposal: Option<ProposalSignFact>,
    ) -> Result<(), HandoverError> {
        let Some(ivp) = voteproof.filter(Voteproof::is_init) else {
            let e = HandoverError::Canceled("finish without INIT voteproof".into());
            self.cancel(Some(e.clone()));
            return Err(e);
        };
        if self.done.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        info!(id = %self.id, stage_point = %ivp.stage_point(), "handover y finished");
        (self.when_finished)(ivp, proposal);
        Ok(())
    }

    /// Tell X the voteproof at `point` was processed.
    pub fn challenge_stage_point(&self, point: StagePoint) -> Result<(), HandoverError> {
        self.challenge(point, HandoverBody::ChallengeStagePoint { point })
    }

    /// Tell X the block finalized at `point` was saved.
    pub fn challenge_block_map(&self, point: StagePoint, map: BlockMap) -> Result<(), HandoverError> {
        self.challenge(point, HandoverBody::ChallengeBlockMap { point, map })
    }

    fn challenge(&self, point: StagePoint, body: HandoverBody) -> Result<(), HandoverError> {
        if self.is_done() {
            return Err(HandoverError::Canceled("broker done".into()));
        }
        self.state.lock().last_challenge = Some(point);
        self.send(body)
    }

    /// Tell X that Y is in step at `point`. Sent only after enough accepted
    /// challenges, for a newer point, and not more often than
    /// `interval_ready`. Returns whether it was sent.
    pub fn ready(&self, point: StagePoint) -> Result<bool, HandoverError> {
        if self.is_done() {
            return Err(HandoverError::Canceled("broker done".into()));
        }

        let mut state = self.state.lock();
        if state.accepted < self.config.min_challenge_count {
            return Ok(false);
        }
        if let Some((last, at)) = state.last_ready {
            if point <= last || at.elapsed() < self.config.interval_ready {
                return Ok(false);
            }
        }
        state.last_ready = Some((point, Instant::now()));
        drop(state);

        self.send(HandoverBody::Ready { point })?;
        debug!(id = %self.id, %point, "ready sent");
        Ok(true)
    }

    fn send(&self, body: HandoverBody) -> Result<(), HandoverError> {
        self.sender.send(OutboundMessage::Handover {
            to: self.x.clone(),
            message: Box::new(HandoverMessage::new(self.id.clone(), body)),
        })?;
        Ok(())
    }

    /// Cancel the handover and tell X. Idempotent.
    pub fn cancel(&self, err: Option<HandoverError>) {
        let err = err.unwrap_or_else(|| HandoverError::Canceled("canceled".into()));
        if self.done.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(e) = self.send(HandoverBody::Cancel {
            err: Some(err.to_string()),
        }) {
            warn!(id = %self.id, error = %e, "failed to send cancel to x");
        }
        info!(id = %self.id, error = %err, "handover y canceled");
        (self.when_canceled)(err);
    }

    fn close(&self, err: HandoverError) {
        if self.done.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(id = %self.id, error = %err, "handover y closed by x");
        (self.when_canceled)(err);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use isaac_test_helpers::{init_voteproof, make_nodes, point, stage_point};
    use isaac_types::Stage;
    use std::time::Duration;
    use tokio::sync::mpsc;

    struct Fixture {
        y: HandoverYBroker,
        rx: mpsc::UnboundedReceiver<OutboundMessage>,
        voteproofs: Arc<Mutex<Vec<Voteproof>>>,
        finished: Arc<Mutex<Vec<Voteproof>>>,
        canceled: Arc<Mutex<Vec<HandoverError>>>,
    }

    fn fixture(interval_ready: Duration) -> Fixture {
        let (tx, rx) = mpsc::unbounded_channel();
        let voteproofs = Arc::new(Mutex::new(Vec::new()));
        let finished = Arc::new(Mutex::new(Vec::new()));
        let canceled = Arc::new(Mutex::new(Vec::new()));

        let (v, f, c) = (voteproofs.clone(), finished.clone(), canceled.clone());
        let y = HandoverYBroker::new(
            HandoverConfig::default().with_interval_ready(interval_ready),
            "handover-1",
            ConnInfo("x:4321".into()),
            Arc::new(tx),
            Arc::new(move |vp| v.lock().push(vp)),
            Arc::new(move |ivp, _| f.lock().push(ivp)),
            Arc::new(move |e| c.lock().push(e)),
        );
        Fixture {
            y,
            rx,
            voteproofs,
            finished,
            canceled,
        }
    }

    fn message(body: HandoverBody) -> HandoverMessage {
        HandoverMessage::new("handover-1", body)
    }

    fn response(point: StagePoint, ok: bool) -> HandoverMessage {
        message(HandoverBody::ChallengeResponse {
            point,
            ok,
            err: None,
        })
    }

    fn sent(rx: &mut mpsc::UnboundedReceiver<OutboundMessage>) -> HandoverBody {
        match rx.try_recv().unwrap() {
            OutboundMessage::Handover { message, .. } => message.body,
            other => panic!("unexpected {}", other.type_name()),
        }
    }

    #[test]
    fn test_data_and_challenges() {
        let mut f = fixture(Duration::ZERO);
        let nodes = make_nodes(1);
        let ivp = init_voteproof(point(33, 0), &nodes);

        f.y.receive(message(HandoverBody::Data(HandoverData::Voteproof(ivp.clone()))))
            .unwrap();
        assert_eq!(f.voteproofs.lock().as_slice(), &[ivp]);

        let sp = stage_point(33, 0, Stage::Init);
        f.y.challenge_stage_point(sp).unwrap();
        assert!(matches!(
            sent(&mut f.rx),
            HandoverBody::ChallengeStagePoint { point } if point == sp
        ));

        // not enough accepted challenges
        assert!(!f.y.ready(sp).unwrap());

        f.y.receive(response(sp, true)).unwrap();
        let sp = stage_point(33, 0, Stage::Accept);
        f.y.challenge_stage_point(sp).unwrap();
        sent(&mut f.rx);
        f.y.receive(response(sp, true)).unwrap();
        assert_eq!(f.y.accepted(), 2);

        assert!(f.y.ready(sp).unwrap());
        assert!(matches!(sent(&mut f.rx), HandoverBody::Ready { .. }));
        // same point again
        assert!(!f.y.ready(sp).unwrap());
        assert!(f.y.ready(stage_point(34, 0, Stage::Init)).unwrap());

        // unknown id
        let r = f.y.receive(HandoverMessage::new("other", HandoverBody::Cancel { err: None }));
        assert!(r.unwrap_err().is_ignore());
        assert!(!f.y.is_done());
    }

    #[test]
    fn test_ready_interval() {
        let mut f = fixture(Duration::from_secs(60));
        for (h, stage) in [(33, Stage::Init), (33, Stage::Accept)] {
            let sp = stage_point(h, 0, stage);
            f.y.challenge_stage_point(sp).unwrap();
            f.y.receive(response(sp, true)).unwrap();
        }
        while f.rx.try_recv().is_ok() {}

        assert!(f.y.ready(stage_point(34, 0, Stage::Init)).unwrap());
        assert!(!f.y.ready(stage_point(35, 0, Stage::Init)).unwrap());
    }

    #[test]
    fn test_rejected_challenge_cancels() {
        let mut f = fixture(Duration::ZERO);
        let sp = stage_point(33, 0, Stage::Init);
        f.y.challenge_stage_point(sp).unwrap();
        sent(&mut f.rx);

        let r = f.y.receive(response(sp, false));
        assert!(r.unwrap_err().is_canceled());
        assert!(f.y.is_done());
        assert!(matches!(sent(&mut f.rx), HandoverBody::Cancel { .. }));
        assert_eq!(f.canceled.lock().len(), 1);
    }

    #[test]
    fn test_unknown_challenge_response_cancels() {
        let mut f = fixture(Duration::ZERO);
        f.y.challenge_stage_point(stage_point(33, 0, Stage::Init))
            .unwrap();
        sent(&mut f.rx);

        let r = f.y.receive(response(stage_point(32, 0, Stage::Accept), true));
        assert!(r.unwrap_err().is_canceled());
        assert_eq!(f.canceled.lock().len(), 1);
    }

    #[test]
    fn test_finish_once() {
        let mut f = fixture(Duration::ZERO);
        let nodes = make_nodes(1);
        let ivp = init_voteproof(point(34, 0), &nodes);

        let finish = || {
            message(HandoverBody::Finish {
                voteproof: Some(ivp.clone()),
                proposal: None,
            })
        };
        f.y.receive(finish()).unwrap();
        assert!(f.y.receive(finish()).unwrap_err().is_canceled());

        assert_eq!(f.finished.lock().as_slice(), &[ivp]);
        assert!(f.canceled.lock().is_empty());
        assert!(f.rx.try_recv().is_err());
    }
}
