//! Ballot facts, sign facts and ballots.
//!
//! A ballot is one node's signed vote for a [`BallotFact`] at a stage-point.
//! It carries the voteproof that justified casting it (the previous stage's
//! result) and the full expel operations referenced by the fact.

use crate::signing::ballot_message;
use crate::{
    ExpelOperation, Hash, LocalNode, NetworkId, NodeAddress, Point, PublicKey, Signature, Stage,
    StagePoint, ValidationError, Voteproof,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Fact body shared by INIT-stage facts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitBallotFact {
    /// Point voted on.
    pub point: Point,
    /// Hash of the block at `height - 1`; `None` only at genesis.
    pub previous_block: Option<Hash>,
    /// Proposal hash.
    pub proposal: Hash,
    /// Expel fact hashes.
    pub expels: Vec<Hash>,
}

/// Fact body shared by ACCEPT-stage facts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcceptBallotFact {
    /// Point voted on.
    pub point: Point,
    /// Proposal hash.
    pub proposal: Hash,
    /// Manifest hash of the block produced by the proposal.
    pub new_block: Hash,
    /// Expel fact hashes.
    pub expels: Vec<Hash>,
}

/// What a ballot votes for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "fact")]
pub enum BallotFact {
    /// Vote for a proposal on top of the previous block.
    Init(InitBallotFact),
    /// Confirms the expel operations ratified by the INIT vote of the same point.
    SuffrageConfirm(InitBallotFact),
    /// INIT vote when no proposal could be selected; `proposal` is zero.
    EmptyProposalInit(InitBallotFact),
    /// Vote for the block produced by the proposal.
    Accept(AcceptBallotFact),
    /// ACCEPT vote for a block whose proposal had no operations.
    EmptyOperationsAccept(AcceptBallotFact),
    /// ACCEPT vote from a node that could not process the proposal.
    NotProcessedAccept(AcceptBallotFact),
}

impl BallotFact {
    /// Point voted on.
    pub fn point(&self) -> Point {
        match self {
            BallotFact::Init(f) | BallotFact::SuffrageConfirm(f) | BallotFact::EmptyProposalInit(f) => {
                f.point
            }
            BallotFact::Accept(f)
            | BallotFact::EmptyOperationsAccept(f)
            | BallotFact::NotProcessedAccept(f) => f.point,
        }
    }

    /// Stage of the fact.
    pub fn stage(&self) -> Stage {
        match self {
            BallotFact::Init(_) | BallotFact::SuffrageConfirm(_) | BallotFact::EmptyProposalInit(_) => {
                Stage::Init
            }
            _ => Stage::Accept,
        }
    }

    /// Point plus stage.
    pub fn stage_point(&self) -> StagePoint {
        StagePoint::new(self.point(), self.stage())
    }

    /// Content hash; ballots agree when their fact hashes are equal.
    pub fn hash(&self) -> Hash {
        Hash::of_json(b"ballot_fact", self)
    }

    /// Proposal hash.
    pub fn proposal(&self) -> Hash {
        match self {
            BallotFact::Init(f) | BallotFact::SuffrageConfirm(f) | BallotFact::EmptyProposalInit(f) => {
                f.proposal
            }
            BallotFact::Accept(f)
            | BallotFact::EmptyOperationsAccept(f)
            | BallotFact::NotProcessedAccept(f) => f.proposal,
        }
    }

    /// Previous block hash of INIT-stage facts.
    pub fn previous_block(&self) -> Option<Hash> {
        match self {
            BallotFact::Init(f) | BallotFact::SuffrageConfirm(f) | BallotFact::EmptyProposalInit(f) => {
                f.previous_block
            }
            _ => None,
        }
    }

    /// New block hash of ACCEPT-stage facts.
    pub fn new_block(&self) -> Option<Hash> {
        match self {
            BallotFact::Accept(f)
            | BallotFact::EmptyOperationsAccept(f)
            | BallotFact::NotProcessedAccept(f) => Some(f.new_block),
            _ => None,
        }
    }

    /// Expel fact hashes.
    pub fn expels(&self) -> &[Hash] {
        match self {
            BallotFact::Init(f) | BallotFact::SuffrageConfirm(f) | BallotFact::EmptyProposalInit(f) => {
                &f.expels
            }
            BallotFact::Accept(f)
            | BallotFact::EmptyOperationsAccept(f)
            | BallotFact::NotProcessedAccept(f) => &f.expels,
        }
    }

    /// Whether this is a suffrage-confirm fact.
    pub fn is_suffrage_confirm(&self) -> bool {
        matches!(self, BallotFact::SuffrageConfirm(_))
    }

    /// Copy of the fact without one expel fact hash.
    pub fn without_expel(&self, expel: &Hash) -> Self {
        let mut fact = self.clone();
        match &mut fact {
            BallotFact::Init(f) | BallotFact::SuffrageConfirm(f) | BallotFact::EmptyProposalInit(f) => {
                f.expels.retain(|h| h != expel)
            }
            BallotFact::Accept(f)
            | BallotFact::EmptyOperationsAccept(f)
            | BallotFact::NotProcessedAccept(f) => f.expels.retain(|h| h != expel),
        }
        fact
    }

    /// Structural validity.
    pub fn is_valid(&self) -> Result<(), ValidationError> {
        let point = self.point();
        if point.height.is_nil() {
            return Err(ValidationError::invalid("ballot fact", "nil height"));
        }

        let mut seen = HashSet::new();
        if !self.expels().iter().all(|h| seen.insert(*h)) {
            return Err(ValidationError::invalid("ballot fact", "duplicated expels"));
        }

        match self {
            BallotFact::Init(f) | BallotFact::SuffrageConfirm(f) | BallotFact::EmptyProposalInit(f) => {
                match (point.height.0 == 0, f.previous_block) {
                    (true, Some(_)) => {
                        return Err(ValidationError::invalid(
                            "ballot fact",
                            "genesis INIT has previous block",
                        ))
                    }
                    (false, None) => {
                        return Err(ValidationError::invalid(
                            "ballot fact",
                            "empty previous block",
                        ))
                    }
                    _ => {}
                }
            }
            _ => {}
        }

        match self {
            BallotFact::SuffrageConfirm(f) if f.expels.is_empty() => Err(
                ValidationError::invalid("ballot fact", "suffrage confirm without expels"),
            ),
            BallotFact::EmptyProposalInit(f) if !f.proposal.is_zero() => Err(
                ValidationError::invalid("ballot fact", "empty proposal fact carries proposal"),
            ),
            _ => Ok(()),
        }
    }
}

/// A ballot fact signed by one node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BallotSignFact {
    /// Fact.
    pub fact: BallotFact,
    /// Signing node.
    pub node: NodeAddress,
    /// Key used.
    pub signer: PublicKey,
    /// Signature over the domain-separated fact hash.
    pub signature: Signature,
}

impl BallotSignFact {
    /// Sign `fact` as the local node.
    pub fn new(fact: BallotFact, local: &LocalNode, network_id: &NetworkId) -> Self {
        let signature = local.sign(&ballot_message(network_id, &fact.hash()));
        Self {
            fact,
            node: local.address().clone(),
            signer: local.public_key(),
            signature,
        }
    }

    /// Fact validity and signature.
    pub fn is_valid(&self, network_id: &NetworkId) -> Result<(), ValidationError> {
        self.fact.is_valid()?;

        if !self
            .signer
            .verify(&ballot_message(network_id, &self.fact.hash()), &self.signature)
        {
            return Err(ValidationError::Signature {
                what: "ballot sign fact",
                node: self.node.clone(),
            });
        }
        Ok(())
    }
}

/// A signed vote plus its justification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ballot {
    /// Voteproof of the previous stage; absent only for genesis INIT.
    pub voteproof: Option<Voteproof>,
    /// Signed fact.
    pub sign_fact: BallotSignFact,
    /// Full expel operations referenced by the fact.
    pub expels: Vec<ExpelOperation>,
}

impl Ballot {
    /// Create a ballot.
    pub fn new(
        voteproof: Option<Voteproof>,
        sign_fact: BallotSignFact,
        expels: Vec<ExpelOperation>,
    ) -> Self {
        Self {
            voteproof,
            sign_fact,
            expels,
        }
    }

    /// Fact.
    pub fn fact(&self) -> &BallotFact {
        &self.sign_fact.fact
    }

    /// Voting node.
    pub fn node(&self) -> &NodeAddress {
        &self.sign_fact.node
    }

    /// Stage-point of the fact.
    pub fn stage_point(&self) -> StagePoint {
        self.sign_fact.fact.stage_point()
    }

    /// Whether the fact is suffrage-confirm.
    pub fn is_suffrage_confirm(&self) -> bool {
        self.sign_fact.fact.is_suffrage_confirm()
    }

    /// Signature, expels and voteproof linkage.
    ///
    /// Suffrage membership is checked separately, once the suffrage of the
    /// ballot's height is known.
    pub fn is_valid(&self, network_id: &NetworkId) -> Result<(), ValidationError> {
        self.sign_fact.is_valid(network_id)?;

        let mut expel_hashes: Vec<Hash> = self.expels.iter().map(|e| e.fact_hash()).collect();
        let mut fact_expels = self.fact().expels().to_vec();
        expel_hashes.sort();
        fact_expels.sort();
        if expel_hashes != fact_expels {
            return Err(ValidationError::invalid(
                "ballot",
                "expels do not match fact",
            ));
        }
        for expel in &self.expels {
            expel.is_valid(network_id)?;
            if expel.expelled() == self.node() {
                return Err(ValidationError::invalid("ballot", "signer is expelled"));
            }
        }

        let sp = self.stage_point();
        let vp = match &self.voteproof {
            Some(vp) => vp,
            None if sp.height().0 == 0 && sp.round().0 == 0 && sp.stage == Stage::Init => {
                return Ok(())
            }
            None => return Err(ValidationError::invalid("ballot", "empty voteproof")),
        };

        vp.is_valid(network_id)?;
        self.check_voteproof_link(vp)
    }

    fn check_voteproof_link(&self, vp: &Voteproof) -> Result<(), ValidationError> {
        let sp = self.stage_point();
        let vsp = vp.stage_point();
        let wrong = |reason: &str| {
            Err(ValidationError::invalid(
                "ballot",
                format!("{reason}; ballot={sp} voteproof={vsp}"),
            ))
        };

        match self.fact() {
            BallotFact::SuffrageConfirm(_) => {
                if vsp != sp || !vp.is_expel() || vp.majority().is_none() {
                    return wrong("suffrage confirm needs the expel INIT voteproof");
                }
                Ok(())
            }
            BallotFact::Init(_) | BallotFact::EmptyProposalInit(_) => {
                if vsp >= sp {
                    return wrong("voteproof is not before ballot");
                }
                if sp.round().0 == 0 {
                    let Some(majority) = vp.majority() else {
                        return wrong("round 0 INIT needs a majority voteproof");
                    };
                    if vsp.stage != Stage::Accept || vsp.height() != sp.height().prev() {
                        return wrong("round 0 INIT needs ACCEPT voteproof of previous height");
                    }
                    if majority.new_block() != self.fact().previous_block() {
                        return wrong("previous block does not match voteproof");
                    }
                } else if vsp.height() != sp.height() || vsp.round().0 + 1 != sp.round().0 {
                    return wrong("next round INIT needs voteproof of previous round");
                }
                Ok(())
            }
            _ => {
                if vsp != sp.with_stage(Stage::Init) || vp.majority().is_none() {
                    return wrong("ACCEPT needs majority INIT voteproof of same point");
                }
                Ok(())
            }
        }
    }
}
