//! Signed fixtures for tests.
//!
//! Nodes are derived from fixed seeds so every test run signs with the same
//! keys. Voteproof builders sign each fact with the given nodes, so the
//! results pass `is_valid` and `is_valid_with_suffrage`.

use isaac_types::{
    now_millis, AcceptBallotFact, Ballot, BallotFact, BallotSignFact, Hash, Height,
    InitBallotFact, KeyPair, LocalNode, Manifest, NetworkId, Node, NodeAddress, Point, Round,
    Stage, StagePoint, Suffrage, Threshold, Voteproof, VoteproofBody, VoteproofKind,
};

/// Network id used by every fixture.
pub fn network_id() -> NetworkId {
    NetworkId::new("isaac-test")
}

/// `n` local nodes named `n0..n{n-1}` with deterministic keys.
pub fn make_nodes(n: usize) -> Vec<LocalNode> {
    (0..n)
        .map(|i| {
            let mut seed = [0u8; 32];
            seed[0] = i as u8 + 1;
            seed[31] = 0x5a;
            LocalNode::new(NodeAddress::new(format!("n{i}")), KeyPair::from_seed(&seed))
        })
        .collect()
}

/// Suffrage of the given nodes.
pub fn make_suffrage(nodes: &[LocalNode]) -> Suffrage {
    Suffrage::new(
        nodes
            .iter()
            .map(|n| Node::new(n.address().clone(), n.public_key()))
            .collect(),
    )
    .expect("fixture suffrage is valid")
}

/// Deterministic block hash for `height`.
pub fn block_hash(height: i64) -> Hash {
    Hash::from_bytes(format!("block-{height}").as_bytes())
}

/// Deterministic proposal hash for a point.
pub fn proposal_hash(point: Point) -> Hash {
    Hash::from_bytes(format!("proposal-{point}").as_bytes())
}

/// Point shorthand.
pub fn point(height: i64, round: u64) -> Point {
    Point::new(Height(height), Round(round))
}

/// INIT fact building on [`block_hash`] of the previous height.
pub fn init_fact(point: Point) -> BallotFact {
    BallotFact::Init(InitBallotFact {
        point,
        previous_block: (point.height.0 > 0).then(|| block_hash(point.height.0 - 1)),
        proposal: proposal_hash(point),
        expels: vec![],
    })
}

/// ACCEPT fact for [`block_hash`] of the point's height.
pub fn accept_fact(point: Point) -> BallotFact {
    accept_fact_with_block(point, block_hash(point.height.0))
}

/// ACCEPT fact for an explicit new block.
pub fn accept_fact_with_block(point: Point, new_block: Hash) -> BallotFact {
    BallotFact::Accept(AcceptBallotFact {
        point,
        proposal: proposal_hash(point),
        new_block,
        expels: vec![],
    })
}

/// Majority voteproof for `fact` signed by every node in `signers`.
pub fn make_voteproof(fact: &BallotFact, signers: &[LocalNode], threshold: Threshold) -> Voteproof {
    let sign_facts = signers
        .iter()
        .map(|n| BallotSignFact::new(fact.clone(), n, &network_id()))
        .collect();

    Voteproof::new(VoteproofBody {
        point: fact.stage_point(),
        threshold,
        majority: Some(fact.clone()),
        sign_facts,
        finished_at: now_millis(),
        expels: vec![],
        kind: VoteproofKind::Plain,
    })
}

/// Draw voteproof where each signer votes for its own fact.
pub fn make_draw_voteproof(facts: &[(BallotFact, &LocalNode)], threshold: Threshold) -> Voteproof {
    let sp: StagePoint = facts[0].0.stage_point();
    let sign_facts = facts
        .iter()
        .map(|(f, n)| BallotSignFact::new(f.clone(), n, &network_id()))
        .collect();

    Voteproof::new(VoteproofBody {
        point: sp,
        threshold,
        majority: None,
        sign_facts,
        finished_at: now_millis(),
        expels: vec![],
        kind: VoteproofKind::Plain,
    })
}

/// ACCEPT majority voteproof of `height`, round 0, for [`block_hash`].
pub fn accept_voteproof(height: i64, signers: &[LocalNode]) -> Voteproof {
    make_voteproof(&accept_fact(point(height, 0)), signers, Threshold::MAX)
}

/// INIT majority voteproof of `point` for [`init_fact`].
pub fn init_voteproof(point: Point, signers: &[LocalNode]) -> Voteproof {
    make_voteproof(&init_fact(point), signers, Threshold::MAX)
}

/// Round 0 INIT ballot justified by the previous height's ACCEPT voteproof.
pub fn init_ballot(local: &LocalNode, point: Point, signers: &[LocalNode]) -> Ballot {
    let voteproof = if point.round.0 == 0 {
        accept_voteproof(point.height.0 - 1, signers)
    } else {
        let prev = Point::new(point.height, Round(point.round.0 - 1));
        let facts: Vec<(BallotFact, &LocalNode)> = signers
            .iter()
            .enumerate()
            .map(|(i, n)| {
                let f = accept_fact_with_block(prev, Hash::from_bytes(&[i as u8]));
                (f, n)
            })
            .collect();
        make_draw_voteproof(&facts, Threshold::MAX)
    };

    Ballot::new(
        Some(voteproof),
        BallotSignFact::new(init_fact(point), local, &network_id()),
        vec![],
    )
}

/// ACCEPT ballot justified by the INIT voteproof of the same point.
pub fn accept_ballot(local: &LocalNode, point: Point, signers: &[LocalNode]) -> Ballot {
    Ballot::new(
        Some(init_voteproof(point, signers)),
        BallotSignFact::new(accept_fact(point), local, &network_id()),
        vec![],
    )
}

/// Stage-point shorthand.
pub fn stage_point(height: i64, round: u64, stage: Stage) -> StagePoint {
    StagePoint::new(point(height, round), stage)
}

/// Manifest of `height` chained on [`block_hash`] of the previous height.
pub fn make_manifest(height: i64) -> Manifest {
    Manifest {
        height: Height(height),
        previous: (height > 0).then(|| block_hash(height - 1)),
        proposal: proposal_hash(point(height, 0)),
        operations_tree: None,
        states_tree: None,
        suffrage: None,
        proposed_at: now_millis(),
    }
}
