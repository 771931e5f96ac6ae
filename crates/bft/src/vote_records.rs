//! Tally of ballots at one stage-point.
//!
//! Ballots arrive before the suffrage of their height may be known (a node
//! that is still syncing). Those are parked and validated later, when a
//! counting pass finds the suffrage. Validated ballots wait in `voted` until
//! the next pass moves their sign facts into the counted set.

use indexmap::IndexMap;
use isaac_core::SuffrageProvider;
use isaac_types::{
    now_millis, Ballot, BallotFact, BallotSignFact, ExpelOperation, Hash, LastPoint, NetworkId,
    NodeAddress, StagePoint, Suffrage, Threshold, ValidationError, VoteDecision, Voteproof,
    VoteproofBody, VoteproofKind,
};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, trace};

/// Map key of a [`VoteRecords`]; suffrage-confirm ballots share the INIT
/// stage-point but are tallied apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) struct VoteRecordsKey {
    pub stage_point: StagePoint,
    pub is_suffrage_confirm: bool,
}

impl VoteRecordsKey {
    pub fn of(ballot: &Ballot) -> Self {
        Self {
            stage_point: ballot.stage_point(),
            is_suffrage_confirm: ballot.is_suffrage_confirm(),
        }
    }
}

/// Outcome of [`VoteRecords::vote`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct VoteOutcome {
    /// The ballot was recorded (validated or parked).
    pub voted: bool,
    /// The ballot passed the suffrage checks.
    pub validated: bool,
}

impl VoteOutcome {
    const REJECTED: Self = Self {
        voted: false,
        validated: false,
    };
}

struct Inner {
    key: VoteRecordsKey,
    voted: IndexMap<NodeAddress, Ballot>,
    ballots: IndexMap<NodeAddress, Ballot>,
    facts: HashMap<Hash, BallotFact>,
    expels: HashMap<Hash, ExpelOperation>,
    set: Vec<Hash>,
    sfs: Vec<BallotSignFact>,
    nodes: HashSet<NodeAddress>,
    suffrage: Option<Suffrage>,
    digged: Option<Voteproof>,
    finished: bool,
}

impl Inner {
    fn new(key: VoteRecordsKey) -> Self {
        Self {
            key,
            voted: IndexMap::new(),
            ballots: IndexMap::new(),
            facts: HashMap::new(),
            expels: HashMap::new(),
            set: Vec::new(),
            sfs: Vec::new(),
            nodes: HashSet::new(),
            suffrage: None,
            digged: None,
            finished: false,
        }
    }

    fn reset(&mut self, key: VoteRecordsKey) {
        self.key = key;
        self.voted.clear();
        self.ballots.clear();
        self.facts.clear();
        self.expels.clear();
        self.set.clear();
        self.sfs.clear();
        self.nodes.clear();
        self.suffrage = None;
        self.digged = None;
        self.finished = false;
    }

    fn has_node(&self, node: &NodeAddress) -> bool {
        self.nodes.contains(node) || self.ballots.contains_key(node)
    }
}

/// Ballots of one stage-point.
pub(crate) struct VoteRecords {
    network_id: NetworkId,
    provider: Arc<dyn SuffrageProvider>,
    inner: Mutex<Inner>,
}

impl VoteRecords {
    pub fn new(
        key: VoteRecordsKey,
        network_id: NetworkId,
        provider: Arc<dyn SuffrageProvider>,
    ) -> Self {
        Self {
            network_id,
            provider,
            inner: Mutex::new(Inner::new(key)),
        }
    }

    /// Reuse for another stage-point; every reference is dropped.
    pub fn reset(&mut self, key: VoteRecordsKey) {
        self.inner.get_mut().reset(key);
    }

    pub fn key(&self) -> VoteRecordsKey {
        self.inner.lock().key
    }

    pub fn stage_point(&self) -> StagePoint {
        self.inner.lock().key.stage_point
    }

    pub fn is_finished(&self) -> bool {
        self.inner.lock().finished
    }

    pub fn has_suffrage(&self) -> bool {
        self.inner.lock().suffrage.is_some()
    }

    /// Whether any node voted.
    pub fn has_voters(&self) -> bool {
        let inner = self.inner.lock();
        !inner.nodes.is_empty() || !inner.ballots.is_empty()
    }

    /// Record a ballot.
    ///
    /// A second ballot from the same node is rejected. Without a known
    /// suffrage the ballot is parked (`voted`, not `validated`).
    pub fn vote(&self, ballot: Ballot) -> VoteOutcome {
        let mut inner = self.inner.lock();

        if inner.finished || inner.has_node(ballot.node()) {
            return VoteOutcome::REJECTED;
        }
        if VoteRecordsKey::of(&ballot) != inner.key {
            return VoteOutcome::REJECTED;
        }

        if let Err(e) = ballot.is_valid(&self.network_id) {
            debug!(
                node = %ballot.node(),
                stage_point = %inner.key.stage_point,
                error = %e,
                "invalid ballot dropped"
            );
            return VoteOutcome::REJECTED;
        }

        if !self.load_suffrage(&mut inner) {
            trace!(node = %ballot.node(), "suffrage unknown; ballot parked");
            let node = ballot.node().clone();
            inner.ballots.insert(node, ballot);
            return VoteOutcome {
                voted: true,
                validated: false,
            };
        }

        if self.accept_validated(&mut inner, ballot) {
            VoteOutcome {
                voted: true,
                validated: true,
            }
        } else {
            VoteOutcome::REJECTED
        }
    }

    /// Validate parked ballots, dig the newest embedded voteproof and count.
    ///
    /// Returns at most two voteproofs: the digged one first, then the local
    /// result.
    pub fn count(&self, last_point: &LastPoint, threshold: Threshold) -> Vec<Voteproof> {
        let mut inner = self.inner.lock();
        if inner.finished {
            return Vec::new();
        }

        if !self.load_suffrage(&mut inner) {
            return Vec::new();
        }

        let parked: Vec<Ballot> = inner.ballots.drain(..).map(|(_, b)| b).collect();
        for ballot in parked {
            self.accept_validated(&mut inner, ballot);
        }

        let mut vps = Vec::with_capacity(2);
        if let Some(digged) = inner.digged.take() {
            if last_point.is_replaced_by(&digged.last_point())
                && digged.threshold().percent() >= threshold.percent()
            {
                vps.push(digged);
            }
        }

        if let Some(vp) = self.count_from_voted(&mut inner, threshold) {
            vps.push(vp);
        }
        vps
    }

    /// Suffrage members that have not voted; `None` while the suffrage is
    /// unknown.
    pub fn missing_nodes(&self) -> Option<Vec<NodeAddress>> {
        let mut inner = self.inner.lock();
        if !self.load_suffrage(&mut inner) {
            return None;
        }

        let suffrage = inner.suffrage.as_ref()?;
        Some(
            suffrage
                .nodes()
                .iter()
                .map(|n| n.address.clone())
                .filter(|a| !inner.has_node(a))
                .collect(),
        )
    }

    /// Draw voteproof from the votes so far, removing the nodes `expels`
    /// names from the suffrage.
    ///
    /// `None` if the vote already finished, nobody voted, an expel targets a
    /// voter, or the remaining votes do not reach the threshold of the
    /// reduced suffrage. A produced voteproof finishes the records.
    pub fn stuck_voteproof(
        &self,
        threshold: Threshold,
        expels: Vec<ExpelOperation>,
    ) -> Option<Voteproof> {
        let mut inner = self.inner.lock();
        if inner.finished || expels.is_empty() || !self.load_suffrage(&mut inner) {
            return None;
        }

        let pending: Vec<Ballot> = inner.voted.drain(..).map(|(_, b)| b).collect();
        for ballot in pending {
            Self::add_counted(&mut inner, ballot);
        }
        if inner.sfs.is_empty() {
            return None;
        }

        let expelled: HashSet<&NodeAddress> = expels.iter().map(|e| e.expelled()).collect();
        if inner.sfs.iter().any(|sf| expelled.contains(&sf.node)) {
            debug!(stage_point = %inner.key.stage_point, "stuck expel targets a voter");
            return None;
        }

        let quorum = inner
            .suffrage
            .as_ref()
            .map(|s| s.len().saturating_sub(expelled.len()))
            .unwrap_or(0);
        if inner.sfs.len() < threshold.count(quorum) {
            return None;
        }

        let vp = Voteproof::new(VoteproofBody {
            point: inner.key.stage_point,
            threshold,
            majority: None,
            sign_facts: inner.sfs.clone(),
            finished_at: now_millis(),
            expels,
            kind: VoteproofKind::Stuck,
        });
        inner.finished = true;
        Some(vp)
    }

    fn load_suffrage(&self, inner: &mut Inner) -> bool {
        if inner.suffrage.is_some() {
            return true;
        }

        match self.provider.suffrage(inner.key.stage_point.height()) {
            Ok(Some(s)) => {
                inner.suffrage = Some(s);
                true
            }
            Ok(None) => false,
            Err(e) => {
                debug!(stage_point = %inner.key.stage_point, error = %e, "suffrage lookup failed");
                false
            }
        }
    }

    fn accept_validated(&self, inner: &mut Inner, ballot: Ballot) -> bool {
        let Some(suffrage) = inner.suffrage.as_ref() else {
            return false;
        };

        if let Err(e) = self.validate_with_suffrage(&ballot, suffrage, inner.key.stage_point) {
            debug!(
                node = %ballot.node(),
                stage_point = %inner.key.stage_point,
                error = %e,
                "ballot rejected by suffrage"
            );
            return false;
        }

        if let Some(vp) = &ballot.voteproof {
            let newer = inner
                .digged
                .as_ref()
                .map(|d| d.last_point().is_replaced_by(&vp.last_point()))
                .unwrap_or(true);
            if newer {
                inner.digged = Some(vp.clone());
            }
        }

        let node = ballot.node().clone();
        inner.nodes.insert(node.clone());
        inner.voted.insert(node, ballot);
        true
    }

    fn validate_with_suffrage(
        &self,
        ballot: &Ballot,
        suffrage: &Suffrage,
        stage_point: StagePoint,
    ) -> Result<(), ValidationError> {
        let sf = &ballot.sign_fact;
        if !suffrage.exists_public_key(&sf.node, &sf.signer) {
            return Err(ValidationError::NotInSuffrage(sf.node.clone()));
        }
        for expel in &ballot.expels {
            expel.is_valid_with_suffrage(suffrage)?;
            if !expel.fact.is_valid_at(stage_point.height()) {
                return Err(ValidationError::invalid(
                    "ballot",
                    format!("expel not valid at {}", stage_point.height()),
                ));
            }
        }

        let Some(vp) = &ballot.voteproof else {
            return Ok(());
        };

        let vh = vp.stage_point().height();
        if vh == stage_point.height() {
            return vp.is_valid_with_suffrage(suffrage);
        }
        match self.provider.suffrage(vh) {
            Ok(Some(s)) => vp.is_valid_with_suffrage(&s),
            Ok(None) | Err(_) => {
                trace!(height = vh.0, "suffrage of voteproof unknown; skip check");
                Ok(())
            }
        }
    }

    fn add_counted(inner: &mut Inner, ballot: Ballot) {
        let fact_hash = ballot.fact().hash();

        for expel in ballot.expels {
            match inner.expels.get_mut(&expel.fact_hash()) {
                Some(known) => {
                    for sign in expel.signs {
                        if !known.signs.iter().any(|s| s.node == sign.node) {
                            known.signs.push(sign);
                        }
                    }
                }
                None => {
                    inner.expels.insert(expel.fact_hash(), expel);
                }
            }
        }

        inner
            .facts
            .entry(fact_hash)
            .or_insert_with(|| ballot.sign_fact.fact.clone());
        inner.set.push(fact_hash);
        inner.sfs.push(ballot.sign_fact);
    }

    fn count_from_voted(&self, inner: &mut Inner, threshold: Threshold) -> Option<Voteproof> {
        let pending: Vec<Ballot> = inner.voted.drain(..).map(|(_, b)| b).collect();
        for ballot in pending {
            Self::add_counted(inner, ballot);
        }

        let quorum = inner.suffrage.as_ref()?.len();

        let mut counts: IndexMap<Hash, usize> = IndexMap::new();
        for h in &inner.set {
            *counts.entry(*h).or_default() += 1;
        }

        // A fact that expels nodes is decided against the reduced suffrage.
        let expel_majority = counts.iter().find_map(|(h, c)| {
            let fact = inner.facts.get(h)?;
            let expels = fact.expels().len();
            (expels > 0 && *c >= threshold.count(quorum.saturating_sub(expels))).then_some(*h)
        });

        let majority = match expel_majority {
            Some(h) => Some(h),
            None => {
                if inner.set.len() < threshold.count(quorum) {
                    return None;
                }
                let values: Vec<usize> = counts.values().copied().collect();
                match threshold.decide(quorum, &values) {
                    VoteDecision::Pending => return None,
                    VoteDecision::Draw => None,
                    VoteDecision::Majority(i) => counts.get_index(i).map(|(h, _)| *h),
                }
            }
        };

        let majority = majority.and_then(|h| inner.facts.get(&h).cloned());
        let vp = self.make_voteproof(inner, threshold, majority)?;
        inner.finished = true;
        Some(vp)
    }

    fn make_voteproof(
        &self,
        inner: &Inner,
        threshold: Threshold,
        majority: Option<BallotFact>,
    ) -> Option<Voteproof> {
        let (kind, expels) = match &majority {
            Some(fact) if !fact.expels().is_empty() => {
                let expels: Vec<ExpelOperation> = fact
                    .expels()
                    .iter()
                    .filter_map(|h| inner.expels.get(h).cloned())
                    .collect();
                if expels.len() != fact.expels().len() {
                    debug!(stage_point = %inner.key.stage_point, "expel operations missing");
                    return None;
                }
                (VoteproofKind::Expel, expels)
            }
            _ => (VoteproofKind::Plain, Vec::new()),
        };

        let expelled: HashSet<&NodeAddress> = expels.iter().map(|e| e.expelled()).collect();
        let sign_facts = inner
            .sfs
            .iter()
            .filter(|sf| !expelled.contains(&sf.node))
            .cloned()
            .collect();

        Some(Voteproof::new(VoteproofBody {
            point: inner.key.stage_point,
            threshold,
            majority,
            sign_facts,
            finished_at: now_millis(),
            expels,
            kind,
        }))
    }
}
