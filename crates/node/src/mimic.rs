//! Mimic ballots.
//!
//! A node that is syncing or broken does not author ballots, but the rest of
//! the suffrage would treat its silence as a stopped node and expel it. While
//! active, [`MimicBallots`] re-signs ballots observed from sync sources with
//! the local key and broadcasts them.

use crate::{BallotBroadcaster, StatesError};
use isaac_core::SuffrageProvider;
use isaac_types::{Ballot, BallotSignFact, LocalNode, NetworkId, NodeAddress, StagePoint};
use parking_lot::{Mutex, RwLock};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, trace};

/// Re-broadcasts ballots of in-sync peers as the local node.
pub struct MimicBallots {
    local: LocalNode,
    network_id: NetworkId,
    suffrage: Arc<dyn SuffrageProvider>,
    broadcaster: Arc<BallotBroadcaster>,
    sources: RwLock<HashSet<NodeAddress>>,
    last: Mutex<Option<(StagePoint, bool)>>,
    active: AtomicBool,
}

impl MimicBallots {
    pub fn new(
        local: LocalNode,
        network_id: NetworkId,
        suffrage: Arc<dyn SuffrageProvider>,
        broadcaster: Arc<BallotBroadcaster>,
    ) -> Self {
        Self {
            local,
            network_id,
            suffrage,
            broadcaster,
            sources: RwLock::new(HashSet::new()),
            last: Mutex::new(None),
            active: AtomicBool::new(false),
        }
    }

    /// Mimic ballots of `node` from now on.
    pub fn add_source(&self, node: NodeAddress) {
        self.sources.write().insert(node);
    }

    pub fn remove_source(&self, node: &NodeAddress) {
        self.sources.write().remove(node);
    }

    pub fn start(&self) {
        if !self.active.swap(true, Ordering::SeqCst) {
            debug!("mimic ballots started");
        }
    }

    pub fn stop(&self) {
        if self.active.swap(false, Ordering::SeqCst) {
            *self.last.lock() = None;
            debug!("mimic ballots stopped");
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Re-sign and broadcast `ballot` if it comes from a source, is newer
    /// than the last mimicked ballot, and the local node votes at its height.
    ///
    /// Expels against the local node are dropped from the new ballot.
    pub fn observe(&self, ballot: &Ballot) -> Result<bool, StatesError> {
        if !self.is_active()
            || ballot.node() == self.local.address()
            || !self.sources.read().contains(ballot.node())
        {
            return Ok(false);
        }

        let key = (ballot.stage_point(), ballot.is_suffrage_confirm());
        {
            let mut last = self.last.lock();
            if matches!(*last, Some(l) if key <= l) {
                return Ok(false);
            }

            match self.suffrage.suffrage(key.0.height())? {
                Some(s) if s.exists(self.local.address()) => {}
                _ => return Ok(false),
            }
            *last = Some(key);
        }

        let mut fact = ballot.fact().clone();
        let mut expels = Vec::with_capacity(ballot.expels.len());
        for op in &ballot.expels {
            if op.expelled() == self.local.address() {
                fact = fact.without_expel(&op.fact_hash());
            } else {
                expels.push(op.clone());
            }
        }

        let mimic = Ballot::new(
            ballot.voteproof.clone(),
            BallotSignFact::new(fact, &self.local, &self.network_id),
            expels,
        );
        trace!(stage_point = %key.0, from = %ballot.node(), "mimic ballot");
        self.broadcaster.broadcast(mimic)?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use isaac_bft::{Ballotbox, IsaacParams};
    use isaac_core::{OutboundMessage, StaticSuffrage};
    use isaac_test_helpers::{init_ballot, make_nodes, make_suffrage, network_id, point};
    use isaac_types::{BallotFact, ExpelFact, ExpelOperation, Height};
    use tokio::sync::mpsc;

    fn new_mimic(
        nodes: &[LocalNode],
    ) -> (MimicBallots, mpsc::UnboundedReceiver<OutboundMessage>) {
        let suffrage: Arc<dyn SuffrageProvider> = Arc::new(StaticSuffrage(make_suffrage(nodes)));
        let ballotbox = Arc::new(Ballotbox::new(network_id(), suffrage.clone(), 16, 4));
        let (tx, rx) = mpsc::unbounded_channel();
        let broadcaster = Arc::new(BallotBroadcaster::new(
            Arc::new(IsaacParams::new(network_id())),
            ballotbox,
            Arc::new(tx),
        ));
        (
            MimicBallots::new(nodes[0].clone(), network_id(), suffrage, broadcaster),
            rx,
        )
    }

    fn sent(rx: &mut mpsc::UnboundedReceiver<OutboundMessage>) -> Ballot {
        match rx.try_recv().unwrap() {
            OutboundMessage::Ballot(g) => g.into_ballot(),
            other => panic!("unexpected {}", other.type_name()),
        }
    }

    #[tokio::test]
    async fn test_mimic_source_ballots() {
        let nodes = make_nodes(3);
        let (mimic, mut rx) = new_mimic(&nodes);
        let ballot = init_ballot(&nodes[1], point(33, 0), &nodes);

        // inactive
        assert!(!mimic.observe(&ballot).unwrap());

        mimic.start();
        // not a source
        assert!(!mimic.observe(&ballot).unwrap());

        mimic.add_source(nodes[1].address().clone());
        assert!(mimic.observe(&ballot).unwrap());
        let m = sent(&mut rx);
        assert_eq!(m.node(), nodes[0].address());
        assert_eq!(m.fact(), ballot.fact());
        assert!(m.is_valid(&network_id()).is_ok());

        // same stage-point again
        let other = init_ballot(&nodes[2], point(33, 0), &nodes);
        mimic.add_source(nodes[2].address().clone());
        assert!(!mimic.observe(&other).unwrap());

        mimic.stop();
        assert!(!mimic.observe(&init_ballot(&nodes[1], point(34, 0), &nodes)).unwrap());
    }

    #[tokio::test]
    async fn test_local_expel_dropped() {
        let nodes = make_nodes(3);
        let (mimic, mut rx) = new_mimic(&nodes);
        mimic.start();
        mimic.add_source(nodes[1].address().clone());

        let expel = |target: &LocalNode| {
            let mut op = ExpelOperation::new(ExpelFact {
                node: target.address().clone(),
                reason: "stopped".into(),
                valid_start: Height(33),
                valid_end: Height(35),
            });
            op.sign(&nodes[1], &network_id());
            op
        };
        let expels = vec![expel(&nodes[0]), expel(&nodes[2])];

        let base = init_ballot(&nodes[1], point(33, 0), &nodes);
        let mut fact = match base.fact().clone() {
            BallotFact::Init(f) => f,
            _ => unreachable!(),
        };
        fact.expels = expels.iter().map(|e| e.fact_hash()).collect();
        let ballot = Ballot::new(
            base.voteproof.clone(),
            BallotSignFact::new(
                BallotFact::Init(fact),
                &nodes[1],
                &network_id(),
            ),
            expels.clone(),
        );

        assert!(mimic.observe(&ballot).unwrap());
        let m = sent(&mut rx);
        assert_eq!(m.expels, vec![expels[1].clone()]);
        assert_eq!(m.fact().expels(), &[expels[1].fact_hash()]);
    }
}
