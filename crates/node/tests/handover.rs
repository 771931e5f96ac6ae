//! X and Y brokers talking through channels until the seat moves.

use isaac_core::OutboundMessage;
use isaac_node::{HandoverConfig, HandoverError, HandoverXBroker, HandoverYBroker};
use isaac_test_helpers::{
    init_voteproof, make_manifest, make_nodes, make_voteproof, network_id, point, stage_point,
};
use isaac_types::{
    AcceptBallotFact, BallotFact, BlockMap, ConnInfo, LocalNode, ProposalSignFact, Stage,
    Threshold, Voteproof,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

type Outbox = mpsc::UnboundedReceiver<OutboundMessage>;

struct Pair {
    local: LocalNode,
    x: HandoverXBroker,
    y: HandoverYBroker,
    to_y: Outbox,
    to_x: Outbox,
    /// Voteproofs Y got as data, in order.
    received: Arc<Mutex<Vec<Voteproof>>>,
    finished: Arc<Mutex<Vec<(Voteproof, Option<ProposalSignFact>)>>>,
    x_canceled: Arc<Mutex<Vec<HandoverError>>>,
    y_canceled: Arc<Mutex<Vec<HandoverError>>>,
    /// Block maps Y saved, by ACCEPT voteproof height.
    maps: HashMap<i64, BlockMap>,
}

fn pair() -> Pair {
    let local = make_nodes(1).remove(0);
    let config = HandoverConfig::default()
        .with_min_challenge_count(2)
        .with_ready_end_delta(3)
        .with_interval_ready(Duration::ZERO);

    let (x_tx, to_y) = mpsc::unbounded_channel();
    let (y_tx, to_x) = mpsc::unbounded_channel();
    let x_canceled = Arc::new(Mutex::new(Vec::new()));
    let y_canceled = Arc::new(Mutex::new(Vec::new()));
    let received = Arc::new(Mutex::new(Vec::new()));
    let finished = Arc::new(Mutex::new(Vec::new()));

    let xc = x_canceled.clone();
    let x = HandoverXBroker::new(
        config.clone(),
        local.clone(),
        ConnInfo("y:4321".into()),
        Arc::new(x_tx),
        Arc::new(|| Ok(true)),
        Arc::new(move |e| xc.lock().push(e)),
    );

    let (r, f, yc) = (received.clone(), finished.clone(), y_canceled.clone());
    let y = HandoverYBroker::new(
        config,
        x.id(),
        ConnInfo("x:4321".into()),
        Arc::new(y_tx),
        Arc::new(move |vp| r.lock().push(vp)),
        Arc::new(move |ivp, pr| f.lock().push((ivp, pr))),
        Arc::new(move |e| yc.lock().push(e)),
    );

    Pair {
        local,
        x,
        y,
        to_y,
        to_x,
        received,
        finished,
        x_canceled,
        y_canceled,
        maps: HashMap::new(),
    }
}

impl Pair {
    /// Deliver queued messages both ways until both queues are empty.
    /// Returns what X rejected.
    fn pump(&mut self) -> Vec<HandoverError> {
        let mut rejected = vec![];
        loop {
            let mut moved = false;
            while let Ok(OutboundMessage::Handover { message, .. }) = self.to_y.try_recv() {
                moved = true;
                let _ = self.y.receive(*message);
            }
            while let Ok(OutboundMessage::Handover { message, .. }) = self.to_x.try_recv() {
                moved = true;
                if let Err(e) = self.x.receive(*message) {
                    rejected.push(e);
                }
            }
            if !moved {
                return rejected;
            }
        }
    }

    /// X forwards the ACCEPT voteproof of `height`; Y saves the same block.
    fn accept(&mut self, height: i64) -> Result<bool, HandoverError> {
        let manifest = make_manifest(height);
        let fact = BallotFact::Accept(AcceptBallotFact {
            point: point(height, 0),
            proposal: manifest.proposal,
            new_block: manifest.hash(),
            expels: vec![],
        });
        let vp = make_voteproof(&fact, &[self.local.clone()], Threshold::MAX);

        let mut map = BlockMap::new(manifest);
        map.sign(&self.local, &network_id());
        self.maps.insert(height, map);

        self.x.send_voteproof(vp)
    }

    fn init(&mut self, height: i64) -> Result<bool, HandoverError> {
        self.x
            .send_voteproof(init_voteproof(point(height, 0), &[self.local.clone()]))
    }

    /// Y challenges the last voteproof it got.
    fn challenge_last(&mut self) {
        let vp = self.received.lock().last().cloned().unwrap();
        let sp = vp.stage_point();
        match vp.stage() {
            Stage::Accept => {
                let map = self.maps[&sp.point.height.0].clone();
                self.y.challenge_block_map(sp, map).unwrap();
            }
            _ => self.y.challenge_stage_point(sp).unwrap(),
        }
    }
}

#[test]
fn test_handover_moves_seat() {
    let mut p = pair();

    assert!(!p.init(10).unwrap());
    assert!(p.pump().is_empty());
    p.challenge_last();
    assert!(p.pump().is_empty());
    assert_eq!(p.y.accepted(), 1);

    // not enough challenges yet
    let sp = p.received.lock().last().unwrap().stage_point();
    assert!(!p.y.ready(sp).unwrap());

    assert!(!p.accept(10).unwrap());
    p.pump();
    p.challenge_last();
    assert!(p.pump().is_empty());
    assert_eq!(p.x.success_count(), 2);

    let sp = p.received.lock().last().unwrap().stage_point();
    assert!(p.y.ready(sp).unwrap());
    assert!(p.pump().is_empty());
    assert!(!p.x.is_finished());

    // ready end is success + 3
    for h in 11..=12 {
        assert!(!p.init(h).unwrap());
        p.pump();
        p.challenge_last();
        p.pump();

        assert!(!p.accept(h).unwrap());
        p.pump();
        p.challenge_last();
        p.pump();
    }
    assert_eq!(p.x.success_count(), 6);
    assert!(p.x.is_finished());
    assert!(!p.x.is_done());

    // the next INIT goes out as finish
    assert!(p.init(13).unwrap());
    assert!(p.x.is_done());
    p.pump();

    assert!(p.y.is_done());
    {
        let finished = p.finished.lock();
        assert_eq!(finished.len(), 1);
        assert!(finished[0].0.is_init());
        assert_eq!(finished[0].0.stage_point().point, point(13, 0));
        assert!(finished[0].1.is_none());
    }

    // the finishing INIT is not sent as data
    assert!(p
        .received
        .lock()
        .iter()
        .all(|vp| vp.stage_point().point.height.0 <= 12));

    assert!(p.x_canceled.lock().is_empty());
    assert!(p.y_canceled.lock().is_empty());
    assert!(p.init(14).is_err());
}

#[test]
fn test_wrong_challenge_resets() {
    let mut p = pair();

    p.init(10).unwrap();
    p.pump();
    p.challenge_last();
    p.pump();
    p.accept(10).unwrap();
    p.pump();

    // stage point where the block map is expected
    let sp = p.received.lock().last().unwrap().stage_point();
    p.y.challenge_stage_point(sp).unwrap();
    let rejected = p.pump();
    assert_eq!(rejected.len(), 1);
    assert!(rejected[0].is_reset());
    assert_eq!(p.x.success_count(), 1);

    // no response; the run restarts with the next answered challenge
    p.init(11).unwrap();
    p.pump();
    p.challenge_last();
    p.pump();
    assert_eq!(p.x.success_count(), 1);
    assert!(!p.x.is_done());
    assert!(p.x_canceled.lock().is_empty());
}

#[test]
fn test_cancel_reaches_peer() {
    let mut p = pair();
    p.init(10).unwrap();
    p.pump();

    p.x.cancel(None);
    p.pump();

    assert!(p.x.is_done());
    assert!(p.y.is_done());
    assert_eq!(p.x_canceled.lock().len(), 1);
    assert_eq!(p.y_canceled.lock().len(), 1);

    // done brokers refuse more work
    assert!(p.init(11).is_err());
    assert!(p.y.ready(stage_point(10, 0, Stage::Init)).is_err());
}
