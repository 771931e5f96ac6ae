//! Resolves stage-points where some nodes stopped voting.
//!
//! When the node votes at a stage-point the resolver starts a watcher. After
//! `ballot_stuck_wait` it asks for the ballots of the nodes that have not
//! voted, repeating every `ballot_stuck_wait`. After
//! `ballot_stuck_resolve_after` it signs expel operations against the nodes
//! still missing and asks the ballotbox for a stuck voteproof, which is
//! emitted on the resolver's own channel.

use crate::{Ballotbox, IsaacParams};
use isaac_types::{
    ExpelFact, ExpelOperation, Height, LocalNode, NodeAddress, StagePoint, Voteproof,
};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Called with the stage-point and the nodes whose ballots are missing.
pub type RequestMissingBallots = Arc<dyn Fn(StagePoint, Vec<NodeAddress>) + Send + Sync>;

/// Per stage-point stuck watcher.
pub struct BallotStuckResolver {
    params: Arc<IsaacParams>,
    local: LocalNode,
    ballotbox: Arc<Ballotbox>,
    request_missing: RequestMissingBallots,
    vp_tx: mpsc::UnboundedSender<Voteproof>,
    vp_rx: Mutex<Option<mpsc::UnboundedReceiver<Voteproof>>>,
    current: Mutex<Option<(StagePoint, CancellationToken)>>,
}

impl BallotStuckResolver {
    pub fn new(
        params: Arc<IsaacParams>,
        local: LocalNode,
        ballotbox: Arc<Ballotbox>,
        request_missing: RequestMissingBallots,
    ) -> Self {
        let (vp_tx, vp_rx) = mpsc::unbounded_channel();
        Self {
            params,
            local,
            ballotbox,
            request_missing,
            vp_tx,
            vp_rx: Mutex::new(Some(vp_rx)),
            current: Mutex::new(None),
        }
    }

    /// Receiver of stuck voteproofs; `None` after the first call.
    pub fn voteproof_receiver(&self) -> Option<mpsc::UnboundedReceiver<Voteproof>> {
        self.vp_rx.lock().take()
    }

    /// Stage-point being watched.
    pub fn watching(&self) -> Option<StagePoint> {
        self.current.lock().as_ref().map(|(sp, _)| *sp)
    }

    /// Watch `sp`, replacing the current watcher. Returns `false` when `sp`
    /// is already watched or older than it.
    pub fn new_point(&self, sp: StagePoint) -> bool {
        let mut current = self.current.lock();
        if let Some((watched, cancel)) = current.as_ref() {
            if sp <= *watched {
                return false;
            }
            cancel.cancel();
        }

        let cancel = CancellationToken::new();
        *current = Some((sp, cancel.clone()));

        let watcher = Watcher {
            params: self.params.clone(),
            local: self.local.clone(),
            ballotbox: self.ballotbox.clone(),
            request_missing: self.request_missing.clone(),
            vp_tx: self.vp_tx.clone(),
        };
        tokio::spawn(async move { watcher.run(sp, cancel).await });
        true
    }

    /// Stop the current watcher.
    pub fn clean(&self) {
        if let Some((_, cancel)) = self.current.lock().take() {
            cancel.cancel();
        }
    }
}

impl Drop for BallotStuckResolver {
    fn drop(&mut self) {
        self.clean();
    }
}

struct Watcher {
    params: Arc<IsaacParams>,
    local: LocalNode,
    ballotbox: Arc<Ballotbox>,
    request_missing: RequestMissingBallots,
    vp_tx: mpsc::UnboundedSender<Voteproof>,
}

impl Watcher {
    async fn run(self, sp: StagePoint, cancel: CancellationToken) {
        let wait = self.params.ballot_stuck_wait;
        let resolve_at = Instant::now() + self.params.ballot_stuck_resolve_after;

        let mut next = Instant::now() + wait;
        while next < resolve_at {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep_until(next) => {}
            }

            match self.ballotbox.missing_nodes(sp, false) {
                Some(nodes) if nodes.is_empty() => return,
                Some(nodes) => {
                    debug!(stage_point = %sp, missing = nodes.len(), "request missing ballots");
                    (self.request_missing)(sp, nodes);
                }
                None => {}
            }
            next += wait.max(std::time::Duration::from_millis(1));
        }

        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep_until(resolve_at) => {}
        }

        let Some(missing) = self.ballotbox.missing_nodes(sp, false) else {
            return;
        };
        if missing.is_empty() {
            return;
        }

        let expels = self.expels(sp, &missing);
        match self
            .ballotbox
            .stuck_voteproof(sp, self.params.threshold, expels)
        {
            Some(vp) => {
                info!(stage_point = %sp, expelled = ?missing, "stuck voteproof");
                let _ = self.vp_tx.send(vp);
            }
            None => debug!(stage_point = %sp, "no stuck voteproof"),
        }
    }

    fn expels(&self, sp: StagePoint, nodes: &[NodeAddress]) -> Vec<ExpelOperation> {
        let start = sp.height();
        let end = Height(start.0 + self.params.expel_lifespan);

        nodes
            .iter()
            .map(|node| {
                let mut op = ExpelOperation::new(ExpelFact {
                    node: node.clone(),
                    reason: format!("no ballot at {sp}"),
                    valid_start: start,
                    valid_end: end,
                });
                op.sign(&self.local, &self.params.network_id);
                op
            })
            .collect()
    }
}
