//! Ballotbox: vote records by stage-point and ordered voteproof emission.
//!
//! `vote` never waits on counting. A validated ballot schedules a count job
//! on the box's worker task, which first emits the ballot's embedded
//! voteproof when it is newer than the last point, then counts the records
//! of the ballot's stage-point.
//!
//! # Ordering
//!
//! Every emission goes through [`LastPoint::is_replaced_by`] under the count
//! lock, so voteproofs leave the box in strictly increasing last-point order.
//! The voteproof channel is bounded; a slow consumer blocks the worker.

use crate::vote_records::{VoteRecords, VoteRecordsKey};
use isaac_core::SuffrageProvider;
use isaac_types::{
    Ballot, ExpelOperation, LastPoint, NetworkId, NodeAddress, Point, Round, Stage, StagePoint,
    Threshold, Voteproof,
};
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, trace};

/// Ballotbox errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BallotboxError {
    /// The counting worker stopped.
    #[error("ballotbox closed")]
    Closed,
}

struct CountJob {
    key: VoteRecordsKey,
    voteproof: Option<Voteproof>,
    threshold: Threshold,
}

struct Inner {
    network_id: NetworkId,
    provider: Arc<dyn SuffrageProvider>,
    vrs: RwLock<BTreeMap<VoteRecordsKey, Arc<VoteRecords>>>,
    pool: Mutex<Vec<VoteRecords>>,
    pool_size: usize,
    lsp: Mutex<LastPoint>,
    count_lock: tokio::sync::Mutex<()>,
    vp_tx: mpsc::Sender<Voteproof>,
}

/// Collects ballots and emits voteproofs.
pub struct Ballotbox {
    inner: Arc<Inner>,
    count_tx: mpsc::UnboundedSender<CountJob>,
    vp_rx: Mutex<Option<mpsc::Receiver<Voteproof>>>,
}

impl Ballotbox {
    /// Create a ballotbox and start its counting worker.
    ///
    /// Must be called inside a tokio runtime. The worker stops when the
    /// ballotbox is dropped.
    pub fn new(
        network_id: NetworkId,
        provider: Arc<dyn SuffrageProvider>,
        channel_capacity: usize,
        pool_size: usize,
    ) -> Self {
        let (vp_tx, vp_rx) = mpsc::channel(channel_capacity.max(1));
        let (count_tx, count_rx) = mpsc::unbounded_channel();

        let inner = Arc::new(Inner {
            network_id,
            provider,
            vrs: RwLock::new(BTreeMap::new()),
            pool: Mutex::new(Vec::new()),
            pool_size,
            lsp: Mutex::new(LastPoint::ZERO),
            count_lock: tokio::sync::Mutex::new(()),
            vp_tx,
        });

        tokio::spawn(run_counter(inner.clone(), count_rx));

        Self {
            inner,
            count_tx,
            vp_rx: Mutex::new(Some(vp_rx)),
        }
    }

    /// Receiver of emitted voteproofs; `None` after the first call.
    pub fn voteproof_receiver(&self) -> Option<mpsc::Receiver<Voteproof>> {
        self.vp_rx.lock().take()
    }

    /// Last emitted point.
    pub fn last_point(&self) -> LastPoint {
        *self.inner.lsp.lock()
    }

    /// Number of live vote records.
    pub fn len(&self) -> usize {
        self.inner.vrs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Record a ballot; returns whether it was accepted.
    ///
    /// Ballots at or before the last point are dropped, except a
    /// suffrage-confirm ballot at the point of a plain INIT result.
    pub fn vote(&self, ballot: Ballot, threshold: Threshold) -> Result<bool, BallotboxError> {
        let key = VoteRecordsKey::of(&ballot);

        let vr = {
            let mut vrs = self.inner.vrs.write();
            if !self
                .inner
                .lsp
                .lock()
                .accepts_ballot(key.stage_point, key.is_suffrage_confirm)
            {
                trace!(stage_point = %key.stage_point, node = %ballot.node(), "old ballot dropped");
                return Ok(false);
            }

            vrs.entry(key)
                .or_insert_with(|| Arc::new(self.inner.new_vote_records(key)))
                .clone()
        };

        let voteproof = ballot.voteproof.clone();
        let outcome = vr.vote(ballot);
        if outcome.voted && outcome.validated {
            self.count_tx
                .send(CountJob {
                    key,
                    voteproof,
                    threshold,
                })
                .map_err(|_| BallotboxError::Closed)?;
        }

        Ok(outcome.voted)
    }

    /// Count every unfinished record.
    ///
    /// Records at the last point's height are counted from the highest
    /// stage-point down and stop at the first result; a later round decided
    /// there is what counts. Records of later heights are counted upwards.
    pub async fn count(&self, threshold: Threshold) {
        self.inner.count_all(threshold).await
    }

    /// Advance the last point to `vp`'s, following the replace rule.
    pub fn set_last_point_from_voteproof(&self, vp: &Voteproof) -> bool {
        self.inner.set_last_point(vp.last_point())
    }

    /// Suffrage nodes that have not voted at a stage-point; `None` while the
    /// suffrage is unknown.
    pub fn missing_nodes(
        &self,
        stage_point: StagePoint,
        is_suffrage_confirm: bool,
    ) -> Option<Vec<NodeAddress>> {
        let key = VoteRecordsKey {
            stage_point,
            is_suffrage_confirm,
        };
        let vr = self.inner.vrs.read().get(&key).cloned();
        match vr {
            Some(vr) => vr.missing_nodes(),
            None => match self.inner.provider.suffrage(stage_point.height()) {
                Ok(Some(s)) => Some(s.nodes().iter().map(|n| n.address.clone()).collect()),
                _ => None,
            },
        }
    }

    /// Stuck voteproof from the votes at `stage_point` plus `expels`.
    ///
    /// A produced voteproof advances the last point but is not sent on the
    /// voteproof channel; the caller delivers it.
    pub fn stuck_voteproof(
        &self,
        stage_point: StagePoint,
        threshold: Threshold,
        expels: Vec<ExpelOperation>,
    ) -> Option<Voteproof> {
        let key = VoteRecordsKey {
            stage_point,
            is_suffrage_confirm: false,
        };
        let vr = self.inner.vrs.read().get(&key).cloned()?;
        if !vr.has_voters() {
            return None;
        }

        let vp = vr.stuck_voteproof(threshold, expels)?;
        if !self.inner.set_last_point(vp.last_point()) {
            return None;
        }
        debug!(stage_point = %stage_point, "stuck voteproof");
        Some(vp)
    }
}

async fn run_counter(inner: Arc<Inner>, mut rx: mpsc::UnboundedReceiver<CountJob>) {
    while let Some(job) = rx.recv().await {
        let _guard = inner.count_lock.lock().await;

        if let Some(vp) = job.voteproof {
            inner.emit(vp).await;
        }
        inner.count_with_vr(job.key, job.threshold).await;
        inner.clean();
    }
    trace!("ballotbox counter stopped");
}

impl Inner {
    fn new_vote_records(&self, key: VoteRecordsKey) -> VoteRecords {
        match self.pool.lock().pop() {
            Some(mut vr) => {
                vr.reset(key);
                vr
            }
            None => VoteRecords::new(key, self.network_id.clone(), self.provider.clone()),
        }
    }

    fn set_last_point(&self, next: LastPoint) -> bool {
        let mut lsp = self.lsp.lock();
        if lsp.is_replaced_by(&next) {
            *lsp = next;
            true
        } else {
            false
        }
    }

    /// Send `vp` if it replaces the last point. Caller holds the count lock.
    async fn emit(&self, vp: Voteproof) -> bool {
        if !self.set_last_point(vp.last_point()) {
            return false;
        }

        debug!(
            stage_point = %vp.stage_point(),
            result = ?vp.result(),
            kind = ?vp.kind(),
            "voteproof emitted"
        );
        if self.vp_tx.send(vp).await.is_err() {
            trace!("voteproof receiver dropped");
        }
        true
    }

    /// Count one record. Caller holds the count lock.
    async fn count_with_vr(&self, key: VoteRecordsKey, threshold: Threshold) -> bool {
        if key.stage_point.is_zero() {
            return false;
        }

        let Some(vr) = self.vrs.read().get(&key).cloned() else {
            return false;
        };
        if vr.key() != key {
            return false;
        }

        let lsp = *self.lsp.lock();
        if !lsp.accepts_ballot(key.stage_point, key.is_suffrage_confirm) {
            return false;
        }

        let mut emitted = false;
        let mut vps = vr.count(&lsp, threshold);
        vps.sort_by_key(|vp| vp.stage_point());
        for vp in vps {
            emitted |= self.emit(vp).await;
        }
        emitted
    }

    async fn count_all(&self, threshold: Threshold) {
        let _guard = self.count_lock.lock().await;

        let (rvrs, nvrs) = self.not_finished_vote_records();

        for key in rvrs.into_iter().rev() {
            if self.count_with_vr(key, threshold).await {
                break;
            }
        }

        for key in nvrs {
            let has_suffrage = self
                .vrs
                .read()
                .get(&key)
                .map(|vr| vr.has_suffrage())
                .unwrap_or(false);
            if !has_suffrage && self.provider.suffrage(key.stage_point.height()).ok().flatten().is_none() {
                continue;
            }
            self.count_with_vr(key, threshold).await;
        }

        self.clean();
    }

    /// Unfinished records split into round-advanced ones (ascending) and
    /// height-advanced ones (ascending), relative to the last point.
    fn not_finished_vote_records(&self) -> (Vec<VoteRecordsKey>, Vec<VoteRecordsKey>) {
        let lsp = *self.lsp.lock();
        let keys: Vec<VoteRecordsKey> = self
            .vrs
            .read()
            .iter()
            .filter(|(_, vr)| !vr.is_finished())
            .map(|(key, _)| *key)
            .collect();
        split_not_finished(&lsp, keys)
    }

    /// Drop records at or before the stage-point preceding the last point.
    fn clean(&self) {
        let lsp = *self.lsp.lock();
        if lsp.is_zero() {
            return;
        }
        let bound = lsp.stage_point.decrease();

        let removed: Vec<Arc<VoteRecords>> = {
            let mut vrs = self.vrs.write();
            let keys: Vec<VoteRecordsKey> = vrs
                .keys()
                .take_while(|k| k.stage_point <= bound)
                .copied()
                .collect();
            keys.iter().filter_map(|k| vrs.remove(k)).collect()
        };
        if removed.is_empty() {
            return;
        }
        trace!(count = removed.len(), bound = %bound, "vote records cleaned");

        let mut pool = self.pool.lock();
        for vr in removed {
            if pool.len() >= self.pool_size {
                break;
            }
            if let Ok(mut vr) = Arc::try_unwrap(vr) {
                vr.reset(VoteRecordsKey {
                    stage_point: StagePoint::ZERO,
                    is_suffrage_confirm: false,
                });
                pool.push(vr);
            }
        }
    }
}

/// Split unfinished record keys against the last point.
///
/// The reference point `p` is the last point moved back one step: an ACCEPT
/// becomes the INIT of the same point, an INIT becomes the round 0 ACCEPT of
/// the previous height. Records at `p`'s height other than the INIT of `p`
/// are round-advanced; the rest newer than `p` are height-advanced. Keys come
/// in ascending order and keep it.
fn split_not_finished(
    lsp: &LastPoint,
    keys: impl IntoIterator<Item = VoteRecordsKey>,
) -> (Vec<VoteRecordsKey>, Vec<VoteRecordsKey>) {
    let mut rvrs = Vec::new();
    let mut nvrs = Vec::new();

    if lsp.is_zero() {
        nvrs.extend(keys);
        return (rvrs, nvrs);
    }

    let last = lsp.stage_point;
    let p = match last.stage {
        Stage::Accept => last.with_stage(Stage::Init),
        Stage::Init => StagePoint::new(Point::new(last.height().prev(), Round(0)), Stage::Accept),
    };
    let p_init = p.with_stage(Stage::Init);

    for key in keys {
        let sp = key.stage_point;
        if sp.height() == p.height() && sp != p_init {
            rvrs.push(key);
        } else if sp > p {
            nvrs.push(key);
        }
    }
    (rvrs, nvrs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use isaac_core::StaticSuffrage;
    use isaac_test_helpers::{
        accept_ballot, init_ballot, init_voteproof, make_nodes, make_suffrage, network_id, point,
        stage_point,
    };
    use isaac_types::{LocalNode, Stage, VoteResult};
    use std::time::Duration;
    use tokio::time::timeout;
    use tracing_test::traced_test;

    fn new_box(suffrage_nodes: &[LocalNode]) -> (Ballotbox, mpsc::Receiver<Voteproof>) {
        let b = Ballotbox::new(
            network_id(),
            Arc::new(StaticSuffrage(make_suffrage(suffrage_nodes))),
            16,
            4,
        );
        let rx = b.voteproof_receiver().unwrap();
        (b, rx)
    }

    async fn next_vp(rx: &mut mpsc::Receiver<Voteproof>) -> Voteproof {
        timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("voteproof within 1s")
            .expect("channel open")
    }

    async fn no_vp(rx: &mut mpsc::Receiver<Voteproof>) {
        assert!(timeout(Duration::from_millis(100), rx.recv()).await.is_err());
    }

    #[traced_test]
    #[tokio::test]
    async fn test_single_node_majority() {
        let nodes = make_nodes(1);
        let (bb, mut rx) = new_box(&nodes);
        let p = point(33, 0);

        let ballot = init_ballot(&nodes[0], p, &nodes);
        let sf = ballot.sign_fact.clone();
        assert!(bb.vote(ballot, Threshold::MAX).unwrap());

        // embedded ACCEPT voteproof of height 32 comes first
        let digged = next_vp(&mut rx).await;
        assert_eq!(digged.stage_point(), stage_point(32, 0, Stage::Accept));

        let vp = next_vp(&mut rx).await;
        assert_eq!(vp.stage_point(), stage_point(33, 0, Stage::Init));
        assert_eq!(vp.result(), VoteResult::Majority);
        assert_eq!(vp.sign_facts(), &[sf]);
        assert_eq!(bb.last_point().stage_point, vp.stage_point());
    }

    #[tokio::test]
    async fn test_out_of_order_same_point() {
        let nodes = make_nodes(3);
        let suffrage = &nodes[..2];
        let (bb, mut rx) = new_box(suffrage);
        let p = point(33, 1);

        assert!(bb.vote(accept_ballot(&nodes[0], p, suffrage), Threshold::MAX).unwrap());
        assert_eq!(
            next_vp(&mut rx).await.stage_point(),
            stage_point(33, 1, Stage::Init)
        );

        assert!(bb.vote(accept_ballot(&nodes[1], p, suffrage), Threshold::MAX).unwrap());
        let vp = next_vp(&mut rx).await;
        assert_eq!(vp.stage_point(), stage_point(33, 1, Stage::Accept));
        assert_eq!(vp.result(), VoteResult::Majority);

        assert!(!bb.vote(accept_ballot(&nodes[2], p, suffrage), Threshold::MAX).unwrap());
        assert!(!bb.vote(init_ballot(&nodes[0], p, suffrage), Threshold::MAX).unwrap());
        no_vp(&mut rx).await;
    }

    #[tokio::test]
    async fn test_round_reset() {
        let nodes = make_nodes(3);
        let (bb, mut rx) = new_box(&nodes);

        let ivp = init_voteproof(point(33, 0), &nodes);
        assert!(bb.set_last_point_from_voteproof(&ivp));

        assert!(bb
            .vote(init_ballot(&nodes[0], point(33, 1), &nodes), Threshold::MAX)
            .unwrap());

        // the embedded draw of (33,0) ACCEPT is newer than the last point
        let vp = next_vp(&mut rx).await;
        assert_eq!(vp.stage_point(), stage_point(33, 0, Stage::Accept));
        assert_eq!(vp.result(), VoteResult::Draw);
        no_vp(&mut rx).await;
    }

    #[tokio::test]
    async fn test_emission_is_monotonic() {
        let nodes = make_nodes(1);
        let (bb, mut rx) = new_box(&nodes);

        for h in [35, 33, 34] {
            bb.vote(init_ballot(&nodes[0], point(h, 0), &nodes), Threshold::MAX)
                .unwrap();
        }

        let mut last = LastPoint::ZERO;
        while let Ok(Some(vp)) = timeout(Duration::from_millis(200), rx.recv()).await {
            assert!(last.is_replaced_by(&vp.last_point()));
            last = vp.last_point();
        }
        assert_eq!(last.stage_point, stage_point(35, 0, Stage::Init));
    }

    #[tokio::test]
    async fn test_clean_old_records() {
        let nodes = make_nodes(1);
        let (bb, mut rx) = new_box(&nodes);

        bb.vote(init_ballot(&nodes[0], point(33, 0), &nodes), Threshold::MAX)
            .unwrap();
        next_vp(&mut rx).await;
        next_vp(&mut rx).await;

        bb.vote(init_ballot(&nodes[0], point(34, 0), &nodes), Threshold::MAX)
            .unwrap();
        next_vp(&mut rx).await;
        next_vp(&mut rx).await;

        assert_eq!(bb.len(), 1);
    }

    #[tokio::test]
    async fn test_missing_nodes() {
        let nodes = make_nodes(3);
        let (bb, _rx) = new_box(&nodes);
        let sp = stage_point(33, 0, Stage::Init);

        assert_eq!(bb.missing_nodes(sp, false).unwrap().len(), 3);

        bb.vote(init_ballot(&nodes[0], point(33, 0), &nodes), Threshold::MAX)
            .unwrap();
        assert_eq!(
            bb.missing_nodes(sp, false).unwrap(),
            vec![nodes[1].address().clone(), nodes[2].address().clone()]
        );
    }

    fn keys(sps: &[(i64, u64, Stage)]) -> Vec<VoteRecordsKey> {
        let mut keys: Vec<VoteRecordsKey> = sps
            .iter()
            .map(|&(h, r, st)| VoteRecordsKey {
                stage_point: stage_point(h, r, st),
                is_suffrage_confirm: false,
            })
            .collect();
        keys.sort();
        keys
    }

    #[test]
    fn test_split_after_accept() {
        let lsp = LastPoint::new(stage_point(33, 0, Stage::Accept), true, false);
        let (rvrs, nvrs) = split_not_finished(
            &lsp,
            keys(&[
                (32, 0, Stage::Accept),
                (33, 0, Stage::Init),
                (33, 0, Stage::Accept),
                (33, 1, Stage::Init),
                (33, 1, Stage::Accept),
                (34, 0, Stage::Init),
            ]),
        );

        // rounds of the same height, newest counted first by the caller
        assert_eq!(
            rvrs,
            keys(&[
                (33, 0, Stage::Accept),
                (33, 1, Stage::Init),
                (33, 1, Stage::Accept),
            ])
        );
        assert_eq!(nvrs, keys(&[(34, 0, Stage::Init)]));
    }

    #[test]
    fn test_split_after_init() {
        let lsp = LastPoint::new(stage_point(33, 1, Stage::Init), true, false);
        let (rvrs, nvrs) = split_not_finished(
            &lsp,
            keys(&[
                (31, 0, Stage::Accept),
                (32, 0, Stage::Init),
                (32, 1, Stage::Accept),
                (33, 0, Stage::Accept),
                (33, 1, Stage::Accept),
                (34, 0, Stage::Init),
            ]),
        );

        // the reference point steps back to the ACCEPT of height 32
        assert_eq!(rvrs, keys(&[(32, 1, Stage::Accept)]));
        assert_eq!(
            nvrs,
            keys(&[
                (33, 0, Stage::Accept),
                (33, 1, Stage::Accept),
                (34, 0, Stage::Init),
            ])
        );
    }

    #[test]
    fn test_split_at_genesis_and_zero() {
        let all = keys(&[(0, 0, Stage::Init), (0, 0, Stage::Accept), (1, 0, Stage::Init)]);

        let (rvrs, nvrs) = split_not_finished(&LastPoint::ZERO, all.clone());
        assert!(rvrs.is_empty());
        assert_eq!(nvrs, all);

        // height 0 steps back to NIL without wrapping
        let lsp = LastPoint::new(stage_point(0, 0, Stage::Init), true, false);
        let (rvrs, nvrs) = split_not_finished(&lsp, all.clone());
        assert!(rvrs.is_empty());
        assert_eq!(nvrs, all);
    }
}
