//! Voteproofs: the signed outcome of a finished vote.
//!
//! A voteproof is either INIT or ACCEPT. Beyond plain majority/draw results it
//! can carry expel operations: an *expel* voteproof has a majority whose fact
//! lists expels, a *stuck* voteproof is a draw produced when nodes stopped
//! voting, with the expel operations that remove them.

use crate::{
    BallotFact, BallotSignFact, ExpelOperation, Hash, LastPoint, NetworkId, NodeAddress, Stage,
    StagePoint, Suffrage, Threshold, ValidationError, VoteResult,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::{SystemTime, UNIX_EPOCH};

/// Flavor of a voteproof.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VoteproofKind {
    /// Majority or draw without expels.
    Plain,
    /// Majority whose fact expels nodes.
    Expel,
    /// Draw forced by unresponsive nodes, carrying their expels.
    Stuck,
}

/// Contents shared by INIT and ACCEPT voteproofs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoteproofBody {
    /// Stage-point decided.
    pub point: StagePoint,
    /// Threshold the vote was counted with.
    pub threshold: Threshold,
    /// Winning fact; `None` for a draw.
    pub majority: Option<BallotFact>,
    /// Every counted sign fact.
    pub sign_facts: Vec<BallotSignFact>,
    /// Unix milliseconds when the vote finished.
    pub finished_at: u64,
    /// Expel operations for [`VoteproofKind::Expel`] and [`VoteproofKind::Stuck`].
    pub expels: Vec<ExpelOperation>,
    /// Flavor.
    pub kind: VoteproofKind,
}

/// Signed outcome of a vote.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "stage", content = "voteproof")]
pub enum Voteproof {
    /// Result of an INIT vote.
    Init(VoteproofBody),
    /// Result of an ACCEPT vote.
    Accept(VoteproofBody),
}

/// Current time as unix milliseconds.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

impl Voteproof {
    /// Wrap a body into the variant matching its stage.
    pub fn new(body: VoteproofBody) -> Self {
        match body.point.stage {
            Stage::Init => Voteproof::Init(body),
            Stage::Accept => Voteproof::Accept(body),
        }
    }

    /// Body.
    pub fn body(&self) -> &VoteproofBody {
        match self {
            Voteproof::Init(b) | Voteproof::Accept(b) => b,
        }
    }

    /// Stage-point.
    pub fn stage_point(&self) -> StagePoint {
        self.body().point
    }

    /// Stage.
    pub fn stage(&self) -> Stage {
        match self {
            Voteproof::Init(_) => Stage::Init,
            Voteproof::Accept(_) => Stage::Accept,
        }
    }

    /// Whether this is an INIT voteproof.
    pub fn is_init(&self) -> bool {
        matches!(self, Voteproof::Init(_))
    }

    /// Majority fact, if any.
    pub fn majority(&self) -> Option<&BallotFact> {
        self.body().majority.as_ref()
    }

    /// Majority or draw.
    pub fn result(&self) -> VoteResult {
        if self.body().majority.is_some() {
            VoteResult::Majority
        } else {
            VoteResult::Draw
        }
    }

    /// Threshold used.
    pub fn threshold(&self) -> Threshold {
        self.body().threshold
    }

    /// Counted sign facts.
    pub fn sign_facts(&self) -> &[BallotSignFact] {
        &self.body().sign_facts
    }

    /// Expel operations carried.
    pub fn expels(&self) -> &[ExpelOperation] {
        &self.body().expels
    }

    /// Flavor.
    pub fn kind(&self) -> VoteproofKind {
        self.body().kind
    }

    /// Majority with expels.
    pub fn is_expel(&self) -> bool {
        self.body().kind == VoteproofKind::Expel
    }

    /// Draw forced by unresponsive nodes.
    pub fn is_stuck(&self) -> bool {
        self.body().kind == VoteproofKind::Stuck
    }

    /// Majority fact is suffrage-confirm.
    pub fn is_suffrage_confirm(&self) -> bool {
        self.majority().map(|f| f.is_suffrage_confirm()).unwrap_or(false)
    }

    /// The [`LastPoint`] this voteproof would set.
    pub fn last_point(&self) -> LastPoint {
        LastPoint::new(
            self.stage_point(),
            self.majority().is_some(),
            self.is_suffrage_confirm(),
        )
    }

    /// Content hash used as the voteproof id.
    pub fn id(&self) -> Hash {
        Hash::of_json(b"voteproof", self)
    }

    /// Nodes removed by the carried expels.
    pub fn expelled_nodes(&self) -> HashSet<&NodeAddress> {
        self.expels().iter().map(|e| e.expelled()).collect()
    }

    /// Structure and signatures.
    pub fn is_valid(&self, network_id: &NetworkId) -> Result<(), ValidationError> {
        let body = self.body();
        let sp = body.point;

        if sp.stage != self.stage() {
            return Err(ValidationError::invalid("voteproof", "stage mismatch"));
        }
        if sp.height().is_nil() {
            return Err(ValidationError::invalid("voteproof", "nil height"));
        }
        if !body.threshold.is_valid() {
            return Err(ValidationError::invalid("voteproof", "threshold out of range"));
        }
        if body.sign_facts.is_empty() {
            return Err(ValidationError::invalid("voteproof", "empty sign facts"));
        }

        let mut nodes = HashSet::with_capacity(body.sign_facts.len());
        for sf in &body.sign_facts {
            if !nodes.insert(&sf.node) {
                return Err(ValidationError::invalid(
                    "voteproof",
                    format!("duplicated sign fact of {}", sf.node),
                ));
            }
            if sf.fact.stage_point() != sp {
                return Err(ValidationError::invalid(
                    "voteproof",
                    format!("sign fact at {} in voteproof of {}", sf.fact.stage_point(), sp),
                ));
            }
            sf.is_valid(network_id)?;
        }

        if let Some(majority) = &body.majority {
            if majority.stage_point() != sp {
                return Err(ValidationError::invalid("voteproof", "majority at other point"));
            }
            let mh = majority.hash();
            if !body.sign_facts.iter().any(|sf| sf.fact.hash() == mh) {
                return Err(ValidationError::invalid("voteproof", "majority not in sign facts"));
            }
        }

        for expel in &body.expels {
            expel.is_valid(network_id)?;
        }

        match body.kind {
            VoteproofKind::Plain if !body.expels.is_empty() => {
                Err(ValidationError::invalid("voteproof", "plain voteproof with expels"))
            }
            VoteproofKind::Expel => {
                let Some(majority) = &body.majority else {
                    return Err(ValidationError::invalid("voteproof", "expel without majority"));
                };
                let mut carried: Vec<Hash> = body.expels.iter().map(|e| e.fact_hash()).collect();
                let mut voted = majority.expels().to_vec();
                carried.sort();
                voted.sort();
                if voted.is_empty() || carried != voted {
                    return Err(ValidationError::invalid(
                        "voteproof",
                        "expels do not match majority",
                    ));
                }
                Ok(())
            }
            VoteproofKind::Stuck if body.majority.is_some() || body.expels.is_empty() => Err(
                ValidationError::invalid("voteproof", "stuck voteproof needs draw and expels"),
            ),
            _ => Ok(()),
        }
    }

    /// Signers belong to `suffrage` and the counts reach the threshold.
    pub fn is_valid_with_suffrage(&self, suffrage: &Suffrage) -> Result<(), ValidationError> {
        let body = self.body();
        let expelled = self.expelled_nodes();

        for sf in &body.sign_facts {
            if !suffrage.exists_public_key(&sf.node, &sf.signer) {
                return Err(ValidationError::NotInSuffrage(sf.node.clone()));
            }
            if expelled.contains(&sf.node) {
                return Err(ValidationError::invalid(
                    "voteproof",
                    format!("expelled node {} voted", sf.node),
                ));
            }
        }
        for expel in &body.expels {
            expel.is_valid_with_suffrage(suffrage)?;
        }

        let quorum = suffrage.len().saturating_sub(expelled.len());
        let needed = body.threshold.count(quorum);

        let counted = match &body.majority {
            Some(majority) => {
                let mh = majority.hash();
                body.sign_facts
                    .iter()
                    .filter(|sf| sf.fact.hash() == mh)
                    .count()
            }
            None => body.sign_facts.len(),
        };

        if counted < needed {
            return Err(ValidationError::invalid(
                "voteproof",
                format!("not enough votes, {counted} < {needed}"),
            ));
        }
        Ok(())
    }
}
