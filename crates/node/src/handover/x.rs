//! Handover X: the process leaving consensus.
//!
//! X forwards every voteproof it gets to Y and checks Y's challenges
//! against what it sent. Once Y answered enough challenges in a row after a
//! positive `Ready`, the next INIT voteproof is sent as `Finish` and X stops
//! voting.

use crate::{HandoverConfig, HandoverError};
use isaac_core::{MessageSender, OutboundMessage};
use isaac_messages::{new_handover_id, HandoverBody, HandoverData, HandoverMessage};
use isaac_types::{BlockMap, ConnInfo, LocalNode, Stage, StagePoint, Voteproof};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

/// Whether X may finish; checked on each `Ready`.
pub type CheckIsReady = Arc<dyn Fn() -> Result<bool, HandoverError> + Send + Sync>;

/// Called once when a broker is canceled.
pub type WhenCanceled = Arc<dyn Fn(HandoverError) + Send + Sync>;

#[derive(Debug, Default)]
struct XState {
    last_voteproof: Option<Voteproof>,
    last_received: Option<StagePoint>,
    success_count: u64,
    challenge_count: u64,
    last_challenge_count: u64,
    ready_end: u64,
    previous_ready: Option<StagePoint>,
}

impl XState {
    fn is_finished(&self, config: &HandoverConfig) -> bool {
        self.ready_end > 0
            && self.success_count >= self.ready_end
            && self.success_count >= config.min_challenge_count
    }

    /// Count an accepted challenge; a gap in the sent voteproofs restarts
    /// the run.
    fn accepted(&mut self, point: StagePoint) {
        if self.challenge_count == self.last_challenge_count + 1 {
            self.success_count += 1;
        } else {
            self.success_count = 1;
        }
        self.last_challenge_count = self.challenge_count;
        self.last_received = Some(point);
    }

    fn is_old(&self, point: StagePoint) -> bool {
        matches!(self.last_received, Some(last) if point < last)
    }
}

/// Broker on the consensus side of a handover.
pub struct HandoverXBroker {
    id: String,
    config: HandoverConfig,
    local: LocalNode,
    y: ConnInfo,
    sender: Arc<dyn MessageSender>,
    check_is_ready: CheckIsReady,
    when_canceled: WhenCanceled,
    state: Mutex<XState>,
    done: AtomicBool,
}

impl HandoverXBroker {
    pub fn new(
        config: HandoverConfig,
        local: LocalNode,
        y: ConnInfo,
        sender: Arc<dyn MessageSender>,
        check_is_ready: CheckIsReady,
        when_canceled: WhenCanceled,
    ) -> Self {
        Self {
            id: new_handover_id(),
            config,
            local,
            y,
            sender,
            check_is_ready,
            when_canceled,
            state: Mutex::new(XState::default()),
            done: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Whether the broker stopped, finished or canceled.
    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::SeqCst)
    }

    pub fn is_finished(&self) -> bool {
        self.state.lock().is_finished(&self.config)
    }

    pub fn success_count(&self) -> u64 {
        self.state.lock().success_count
    }

    /// Forward `vp` to Y. Returns `true` when the handover finished with it:
    /// the voteproof went out as `Finish` and the local node must stop
    /// voting.
    pub fn send_voteproof(&self, vp: Voteproof) -> Result<bool, HandoverError> {
        if self.is_done() {
            return Err(HandoverError::Canceled("broker done".into()));
        }

        let mut state = self.state.lock();
        if vp.is_init() && state.is_finished(&self.config) {
            drop(state);
            let sp = vp.stage_point();
            self.send(HandoverBody::Finish {
                voteproof: Some(vp),
                proposal: None,
            })?;
            self.done.store(true, Ordering::SeqCst);
            info!(id = %self.id, stage_point = %sp, "handover x finished");
            return Ok(true);
        }

        state.last_voteproof = Some(vp.clone());
        state.challenge_count += 1;
        drop(state);

        self.send(HandoverBody::Data(HandoverData::Voteproof(vp)))?;
        Ok(false)
    }

    /// Handle a message from Y.
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
            HandoverBody::ChallengeStagePoint { point } => self.challenge_stage_point(point),
            HandoverBody::ChallengeBlockMap { point, map } => self.challenge_block_map(point, &map),
            HandoverBody::Ready { point } => self.ready(point),
            HandoverBody::Cancel { err } => {
                let reason = err.unwrap_or_else(|| "canceled by y".into());
                self.close(HandoverError::Canceled(reason));
                return Ok(());
            }
            other => Err(HandoverError::Ignore(format!("unexpected {}", other.kind()))),
        };

        match &result {
            Err(HandoverError::Reset(reason)) => {
                debug!(id = %self.id, reason = %reason, "handover x reset");
                self.state.lock().ready_end = 0;
            }
            Err(e @ HandoverError::Canceled(_)) => self.cancel(Some(e.clone())),
            Err(e) => trace!(id = %self.id, error = %e, "handover message ignored"),
            Ok(()) => {}
        }
        result
    }

    fn challenge_stage_point(&self, point: StagePoint) -> Result<(), HandoverError> {
        let mut state = self.state.lock();
        if state.is_old(point) {
            return Err(HandoverError::Ignore(format!("old challenge {point}")));
        }
        let Some(last) = &state.last_voteproof else {
            return Err(HandoverError::Reset("no voteproof sent yet".into()));
        };

        let expected = last.stage_point();
        if last.stage() == Stage::Accept && last.majority().is_some() {
            return Err(HandoverError::Reset(format!(
                "block map expected for {expected}"
            )));
        }
        if point != expected {
            return Err(HandoverError::Reset(format!(
                "challenge {point} does not match {expected}"
            )));
        }

        state.accepted(point);
        trace!(id = %self.id, %point, success = state.success_count, "stage point challenge accepted");
        drop(state);
        self.respond(point)
    }

    fn challenge_block_map(&self, point: StagePoint, map: &BlockMap) -> Result<(), HandoverError> {
        match &map.sign {
            Some(sign)
                if &sign.node == self.local.address()
                    && sign.signer == self.local.public_key() => {}
            _ => {
                return Err(HandoverError::Reset(
                    "block map not signed by the local node".into(),
                ))
            }
        }

        let mut state = self.state.lock();
        if state.is_old(point) {
            return Err(HandoverError::Ignore(format!("old challenge {point}")));
        }
        let Some(last) = &state.last_voteproof else {
            return Err(HandoverError::Reset("no voteproof sent yet".into()));
        };

        let expected = last.stage_point();
        let Some(fact) = last.majority().filter(|_| last.stage() == Stage::Accept) else {
            return Err(HandoverError::Reset(format!(
                "no ACCEPT majority at {expected}"
            )));
        };
        if point != expected {
            return Err(HandoverError::Reset(format!(
                "challenge {point} does not match {expected}"
            )));
        }
        if fact.new_block() != Some(map.manifest.hash()) {
            return Err(HandoverError::Reset(format!(
                "block map of {point} does not match the ACCEPT majority"
            )));
        }

        state.accepted(point);
        trace!(id = %self.id, %point, success = state.success_count, "block map challenge accepted");
        drop(state);
        self.respond(point)
    }

    fn ready(&self, point: StagePoint) -> Result<(), HandoverError> {
        let mut state = self.state.lock();
        let Some(last) = &state.last_voteproof else {
            return Err(HandoverError::Reset("no voteproof sent yet".into()));
        };
        if point.point > last.stage_point().point {
            return Err(HandoverError::Reset(format!("ready {point} ahead of x")));
        }
        if matches!(state.previous_ready, Some(previous) if point <= previous) {
            return Err(HandoverError::Reset(format!("ready {point} not increasing")));
        }
        state.previous_ready = Some(point);

        let (ok, err) = match (self.check_is_ready)() {
            Ok(ok) => (ok, None),
            Err(e) => (false, Some(e.to_string())),
        };
        if ok && state.success_count >= self.config.min_challenge_count {
            state.ready_end = state.success_count + self.config.ready_end_delta;
            debug!(id = %self.id, %point, ready_end = state.ready_end, "handover x ready");
        }
        drop(state);

        self.send(HandoverBody::ReadyResponse { point, ok, err })
    }

    fn respond(&self, point: StagePoint) -> Result<(), HandoverError> {
        self.send(HandoverBody::ChallengeResponse {
            point,
            ok: true,
            err: None,
        })
    }

    fn send(&self, body: HandoverBody) -> Result<(), HandoverError> {
        self.sender.send(OutboundMessage::Handover {
            to: self.y.clone(),
            message: Box::new(HandoverMessage::new(self.id.clone(), body)),
        })?;
        Ok(())
    }

    /// Cancel the handover and tell Y. Idempotent.
    pub fn cancel(&self, err: Option<HandoverError>) {
        let err = err.unwrap_or_else(|| HandoverError::Canceled("canceled".into()));
        if self.done.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(e) = self.send(HandoverBody::Cancel {
            err: Some(err.to_string()),
        }) {
            warn!(id = %self.id, error = %e, "failed to send cancel to y");
        }
        info!(id = %self.id, error = %err, "handover x canceled");
        (self.when_canceled)(err);
    }

    /// Cancel without telling Y.
    fn close(&self, err: HandoverError) {
        if self.done.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(id = %self.id, error = %err, "handover x closed by y");
        (self.when_canceled)(err);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use isaac_test_helpers::{
        accept_voteproof, init_voteproof, make_manifest, make_nodes, network_id, point,
        stage_point,
    };
    use isaac_types::{AcceptBallotFact, BallotFact, Threshold};
    use tokio::sync::mpsc;
    use tracing_test::traced_test;

    struct Fixture {
        x: HandoverXBroker,
        rx: mpsc::UnboundedReceiver<OutboundMessage>,
        canceled: Arc<Mutex<Vec<HandoverError>>>,
        local: LocalNode,
    }

    fn fixture(ready: bool) -> Fixture {
        let local = make_nodes(1).remove(0);
        let (tx, rx) = mpsc::unbounded_channel();
        let canceled = Arc::new(Mutex::new(Vec::new()));
        let c = canceled.clone();
        let x = HandoverXBroker::new(
            HandoverConfig::default(),
            local.clone(),
            ConnInfo("y:4321".into()),
            Arc::new(tx),
            Arc::new(move || Ok(ready)),
            Arc::new(move |e| c.lock().push(e)),
        );
        Fixture {
            x,
            rx,
            canceled,
            local,
        }
    }

    fn body(rx: &mut mpsc::UnboundedReceiver<OutboundMessage>) -> HandoverBody {
        match rx.try_recv().unwrap() {
            OutboundMessage::Handover { message, .. } => message.body,
            other => panic!("unexpected {}", other.type_name()),
        }
    }

    fn message(x: &HandoverXBroker, body: HandoverBody) -> HandoverMessage {
        HandoverMessage::new(x.id(), body)
    }

    /// Accept voteproof whose majority block is the manifest of `height`.
    fn accept_of(height: i64, local: &LocalNode) -> (Voteproof, BlockMap) {
        let manifest = make_manifest(height);
        let fact = BallotFact::Accept(AcceptBallotFact {
            point: point(height, 0),
            proposal: manifest.proposal,
            new_block: manifest.hash(),
            expels: vec![],
        });
        let vp = isaac_test_helpers::make_voteproof(&fact, &[local.clone()], Threshold::MAX);
        let mut map = BlockMap::new(manifest);
        map.sign(local, &network_id());
        (vp, map)
    }

    #[test]
    fn test_stage_point_challenge() {
        let mut f = fixture(true);
        let nodes = vec![f.local.clone()];

        // nothing sent yet
        let sp = stage_point(33, 0, Stage::Init);
        let r = f.x.receive(message(&f.x, HandoverBody::ChallengeStagePoint { point: sp }));
        assert!(r.unwrap_err().is_reset());

        assert!(!f.x.send_voteproof(init_voteproof(point(33, 0), &nodes)).unwrap());
        assert!(matches!(
            body(&mut f.rx),
            HandoverBody::Data(HandoverData::Voteproof(_))
        ));

        f.x.receive(message(&f.x, HandoverBody::ChallengeStagePoint { point: sp }))
            .unwrap();
        assert!(matches!(
            body(&mut f.rx),
            HandoverBody::ChallengeResponse { ok: true, .. }
        ));
        assert_eq!(f.x.success_count(), 1);

        // mismatched point resets without a response
        let wrong = stage_point(33, 1, Stage::Init);
        let r = f.x.receive(message(&f.x, HandoverBody::ChallengeStagePoint { point: wrong }));
        assert!(r.unwrap_err().is_reset());
        assert!(f.rx.try_recv().is_err());

        // unknown id
        let r = f.x.receive(HandoverMessage::new(
            "other",
            HandoverBody::ChallengeStagePoint { point: sp },
        ));
        assert!(r.unwrap_err().is_ignore());
        assert!(f.canceled.lock().is_empty());
    }

    #[test]
    fn test_block_map_challenge() {
        let mut f = fixture(true);
        let nodes = vec![f.local.clone()];
        let (avp, map) = accept_of(33, &f.local);
        let sp = avp.stage_point();

        f.x.send_voteproof(avp).unwrap();
        body(&mut f.rx);

        // stage point challenge on an ACCEPT majority
        let r = f.x.receive(message(&f.x, HandoverBody::ChallengeStagePoint { point: sp }));
        assert!(r.unwrap_err().is_reset());

        // another block
        let (_, other) = accept_of(34, &f.local);
        let r = f.x.receive(message(
            &f.x,
            HandoverBody::ChallengeBlockMap {
                point: sp,
                map: other,
            },
        ));
        assert!(r.unwrap_err().is_reset());

        // signed by someone else
        let mut foreign = map.clone();
        foreign.sign(&make_nodes(2)[1], &network_id());
        let r = f.x.receive(message(
            &f.x,
            HandoverBody::ChallengeBlockMap {
                point: sp,
                map: foreign,
            },
        ));
        assert!(r.unwrap_err().is_reset());

        f.x.receive(message(&f.x, HandoverBody::ChallengeBlockMap { point: sp, map }))
            .unwrap();
        assert!(matches!(
            body(&mut f.rx),
            HandoverBody::ChallengeResponse { ok: true, .. }
        ));
        assert_eq!(f.x.success_count(), 1);

        // an older challenge is ignored
        f.x.send_voteproof(init_voteproof(point(34, 0), &nodes)).unwrap();
        body(&mut f.rx);
        let old = stage_point(32, 0, Stage::Init);
        let r = f.x.receive(message(&f.x, HandoverBody::ChallengeStagePoint { point: old }));
        assert!(r.unwrap_err().is_ignore());
    }

    #[test]
    fn test_gap_restarts_success_count() {
        let mut f = fixture(true);
        let nodes = vec![f.local.clone()];

        f.x.send_voteproof(init_voteproof(point(33, 0), &nodes)).unwrap();
        f.x.receive(message(
            &f.x,
            HandoverBody::ChallengeStagePoint {
                point: stage_point(33, 0, Stage::Init),
            },
        ))
        .unwrap();

        // two voteproofs, only the second one challenged
        f.x.send_voteproof(accept_voteproof(33, &nodes)).unwrap();
        f.x.send_voteproof(init_voteproof(point(34, 0), &nodes)).unwrap();
        f.x.receive(message(
            &f.x,
            HandoverBody::ChallengeStagePoint {
                point: stage_point(34, 0, Stage::Init),
            },
        ))
        .unwrap();
        assert_eq!(f.x.success_count(), 1);
        while f.rx.try_recv().is_ok() {}
    }

    #[test]
    fn test_ready_and_finish() {
        let mut f = fixture(true);
        let nodes = vec![f.local.clone()];
        let min = HandoverConfig::default().min_challenge_count;
        let delta = HandoverConfig::default().ready_end_delta;

        let mut height = 33;
        let challenge_init = |f: &mut Fixture, h: i64| {
            f.x.send_voteproof(init_voteproof(point(h, 0), &nodes)).unwrap();
            f.x.receive(message(
                &f.x,
                HandoverBody::ChallengeStagePoint {
                    point: stage_point(h, 0, Stage::Init),
                },
            ))
            .unwrap();
            while f.rx.try_recv().is_ok() {}
        };

        // ready before enough challenges
        challenge_init(&mut f, height);
        f.x.receive(message(
            &f.x,
            HandoverBody::Ready {
                point: stage_point(height, 0, Stage::Init),
            },
        ))
        .unwrap();
        assert!(matches!(
            body(&mut f.rx),
            HandoverBody::ReadyResponse { ok: true, .. }
        ));
        assert!(!f.x.is_finished());

        while f.x.success_count() < min {
            height += 1;
            challenge_init(&mut f, height);
        }
        f.x.receive(message(
            &f.x,
            HandoverBody::Ready {
                point: stage_point(height, 0, Stage::Init),
            },
        ))
        .unwrap();
        body(&mut f.rx);

        // a ready that does not move forward resets
        let r = f.x.receive(message(
            &f.x,
            HandoverBody::Ready {
                point: stage_point(height, 0, Stage::Init),
            },
        ));
        assert!(r.unwrap_err().is_reset());

        height += 1;
        challenge_init(&mut f, height);
        f.x.receive(message(
            &f.x,
            HandoverBody::Ready {
                point: stage_point(height, 0, Stage::Init),
            },
        ))
        .unwrap();
        body(&mut f.rx);
        let end = f.x.success_count() + delta;

        while f.x.success_count() < end {
            height += 1;
            challenge_init(&mut f, height);
        }
        assert!(f.x.is_finished());

        // ACCEPT voteproofs are still data
        assert!(!f.x.send_voteproof(accept_voteproof(height, &nodes)).unwrap());
        body(&mut f.rx);

        assert!(f.x.send_voteproof(init_voteproof(point(height + 1, 0), &nodes)).unwrap());
        match body(&mut f.rx) {
            HandoverBody::Finish { voteproof, .. } => {
                assert_eq!(voteproof.unwrap().stage_point().height().0, height + 1)
            }
            other => panic!("unexpected {}", other.kind()),
        }
        assert!(f.x.is_done());
        assert!(f.canceled.lock().is_empty());
    }

    #[test]
    #[traced_test]
    fn test_cancel() {
        let mut f = fixture(false);

        f.x.cancel(None);
        assert!(logs_contain("handover x canceled"));
        assert!(matches!(body(&mut f.rx), HandoverBody::Cancel { .. }));
        f.x.cancel(None);
        assert!(f.rx.try_recv().is_err());
        assert_eq!(f.canceled.lock().len(), 1);

        let nodes = vec![f.local.clone()];
        assert!(f
            .x
            .send_voteproof(init_voteproof(point(33, 0), &nodes))
            .unwrap_err()
            .is_canceled());
    }

    #[test]
    fn test_cancel_from_y() {
        let mut f = fixture(false);
        f.x.receive(message(
            &f.x,
            HandoverBody::Cancel {
                err: Some("y stopped".into()),
            },
        ))
        .unwrap();

        assert!(f.x.is_done());
        assert!(f.rx.try_recv().is_err());
        assert_eq!(
            f.canceled.lock().as_slice(),
            &[HandoverError::Canceled("y stopped".into())]
        );
    }
}
