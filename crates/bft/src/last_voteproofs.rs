//! Last voteproofs seen by the state machine.

use isaac_types::{Height, LastPoint, Stage, Voteproof};
use parking_lot::RwLock;

/// Snapshot of the last INIT, ACCEPT and majority voteproofs.
#[derive(Debug, Clone, Default)]
pub struct LastVoteproofs {
    ivp: Option<Voteproof>,
    avp: Option<Voteproof>,
    mvp: Option<Voteproof>,
}

impl LastVoteproofs {
    /// Last INIT voteproof.
    pub fn init(&self) -> Option<&Voteproof> {
        self.ivp.as_ref()
    }

    /// Last ACCEPT voteproof.
    pub fn accept(&self) -> Option<&Voteproof> {
        self.avp.as_ref()
    }

    /// Last voteproof with a majority, of either stage.
    pub fn majority(&self) -> Option<&Voteproof> {
        self.mvp.as_ref()
    }

    /// The higher of the last INIT and ACCEPT voteproofs.
    pub fn cap(&self) -> Option<&Voteproof> {
        match (&self.ivp, &self.avp) {
            (Some(i), Some(a)) => Some(if i.stage_point() > a.stage_point() { i } else { a }),
            (Some(i), None) => Some(i),
            (None, Some(a)) => Some(a),
            (None, None) => None,
        }
    }

    /// The lower of the last INIT and ACCEPT voteproofs.
    pub fn pre(&self) -> Option<&Voteproof> {
        match (&self.ivp, &self.avp) {
            (Some(i), Some(a)) => Some(if i.stage_point() > a.stage_point() { a } else { i }),
            _ => None,
        }
    }

    /// Whether the last majority is an ACCEPT of `height`, ie. the block at
    /// `height` was finalized.
    pub fn is_majority_accept_of(&self, height: Height) -> bool {
        matches!(
            &self.mvp,
            Some(vp) if vp.stage() == Stage::Accept && vp.stage_point().height() == height
        )
    }

    fn last_point(&self) -> LastPoint {
        self.cap().map(Voteproof::last_point).unwrap_or(LastPoint::ZERO)
    }

    fn store(&mut self, vp: Voteproof) {
        if vp.majority().is_some() {
            self.mvp = Some(vp.clone());
        }
        match vp.stage() {
            Stage::Init => self.ivp = Some(vp),
            Stage::Accept => self.avp = Some(vp),
        }
    }
}

/// Filters stale voteproofs and keeps the last ones.
#[derive(Debug, Default)]
pub struct LastVoteproofsHandler {
    inner: RwLock<LastVoteproofs>,
}

impl LastVoteproofsHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `vp` replaces the current highest voteproof.
    pub fn is_new(&self, vp: &Voteproof) -> bool {
        self.inner.read().last_point().is_replaced_by(&vp.last_point())
    }

    /// Store `vp` if it is new.
    pub fn set(&self, vp: &Voteproof) -> bool {
        let mut inner = self.inner.write();
        if !inner.last_point().is_replaced_by(&vp.last_point()) {
            return false;
        }
        inner.store(vp.clone());
        true
    }

    /// Store `vp` unconditionally; used after sync and handover.
    pub fn force_set(&self, vp: &Voteproof) {
        self.inner.write().store(vp.clone());
    }

    pub fn last(&self) -> LastVoteproofs {
        self.inner.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use isaac_test_helpers::{
        accept_fact_with_block, accept_voteproof, init_voteproof, make_draw_voteproof, make_nodes,
        point,
    };
    use isaac_types::{Hash, Threshold};

    #[test]
    fn test_cap_and_pre() {
        let nodes = make_nodes(2);
        let h = LastVoteproofsHandler::new();
        assert!(h.last().cap().is_none());

        let avp = accept_voteproof(32, &nodes);
        let ivp = init_voteproof(point(33, 0), &nodes);
        assert!(h.set(&avp));
        assert!(h.set(&ivp));

        let last = h.last();
        assert_eq!(last.cap().map(|v| v.id()), Some(ivp.id()));
        assert_eq!(last.pre().map(|v| v.id()), Some(avp.id()));
        assert_eq!(last.majority().map(|v| v.id()), Some(ivp.id()));
        assert!(!last.is_majority_accept_of(Height(32)));
    }

    #[test]
    fn test_stale_rejected() {
        let nodes = make_nodes(2);
        let h = LastVoteproofsHandler::new();

        assert!(h.set(&init_voteproof(point(33, 0), &nodes)));
        let old = accept_voteproof(32, &nodes);
        assert!(!h.is_new(&old));
        assert!(!h.set(&old));

        h.force_set(&old);
        assert!(h.last().is_majority_accept_of(Height(32)));
    }

    #[test]
    fn test_majority_replaces_draw() {
        let nodes = make_nodes(2);
        let h = LastVoteproofsHandler::new();
        let p = point(33, 0);

        let draw = make_draw_voteproof(
            &[
                (accept_fact_with_block(p, Hash::from_bytes(b"a")), &nodes[0]),
                (accept_fact_with_block(p, Hash::from_bytes(b"b")), &nodes[1]),
            ],
            Threshold::MAX,
        );
        assert!(h.set(&draw));
        assert!(h.last().majority().is_none());
        assert!(!h.set(&draw));

        assert!(h.set(&accept_voteproof(33, &nodes)));
        assert!(h.last().is_majority_accept_of(Height(33)));
    }
}
