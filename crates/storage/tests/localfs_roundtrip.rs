//! A full block written by `LocalFsWriter` reads back item by item.

use isaac_core::JsonEncoder;
use isaac_storage::localfs::decode_voteproofs;
use isaac_storage::{BlockItem, LocalFsError, LocalFsReader, LocalFsWriter};
use isaac_test_helpers::{
    accept_voteproof, init_voteproof, make_manifest, make_nodes, network_id, point,
};
use isaac_types::{
    BlockItemType, FixedTree, Height, Operation, ProposalFact, ProposalSignFact, State,
    StateValue,
};
use std::io::{BufRead, Read};
use tempfile::TempDir;

const HEIGHT: i64 = 33;

struct Block {
    operations: Vec<Operation>,
    states: Vec<State>,
    operations_tree: FixedTree,
    states_tree: FixedTree,
}

fn block() -> Block {
    let operations: Vec<Operation> = (0..33).map(|i| Operation::new(format!("op-{i}"))).collect();
    let states: Vec<State> = (0..33)
        .map(|i| State {
            key: format!("k{i:02}"),
            value: StateValue::Data(format!("v{i}")),
            height: Height(HEIGHT),
            previous: None,
            operations: vec![operations[i].fact_hash],
        })
        .collect();

    let operations_tree = FixedTree::new(
        operations
            .iter()
            .map(|op| (op.fact_hash.to_hex(), op.hash))
            .collect(),
    );
    let states_tree = FixedTree::new(states.iter().map(|s| (s.key.clone(), s.hash())).collect());

    Block {
        operations,
        states,
        operations_tree,
        states_tree,
    }
}

#[test]
fn test_written_block_reads_back() {
    let dir = TempDir::new().unwrap();
    let nodes = make_nodes(3);
    let b = block();

    let mut manifest = make_manifest(HEIGHT);
    manifest.operations_tree = Some(b.operations_tree.root());
    manifest.states_tree = Some(b.states_tree.root());

    let proposal = ProposalSignFact::new(
        ProposalFact {
            point: point(HEIGHT, 0),
            proposer: nodes[0].address().clone(),
            previous_block: manifest.previous,
            operations: b.operations.iter().map(|op| (op.hash, op.fact_hash)).collect(),
            proposed_at: manifest.proposed_at,
        },
        &nodes[0],
        &network_id(),
    );
    let ivp = init_voteproof(point(HEIGHT, 0), &nodes);
    let avp = accept_voteproof(HEIGHT, &nodes);

    let writer = LocalFsWriter::new(
        dir.path(),
        Height(HEIGHT),
        JsonEncoder,
        nodes[0].clone(),
        network_id(),
    )
    .unwrap();
    writer.set_manifest(manifest.clone()).unwrap();
    writer.set_proposal(&proposal).unwrap();
    // Records arrive out of order; readers sort by index.
    for (i, op) in b.operations.iter().enumerate().rev() {
        writer.set_operation(i as u64, op).unwrap();
    }
    for (i, st) in b.states.iter().enumerate() {
        writer.set_state(i as u64, st).unwrap();
    }
    writer.set_operations_tree(b.operations_tree.clone()).unwrap();
    writer.set_states_tree(b.states_tree.clone()).unwrap();
    writer.set_init_voteproof(&ivp).unwrap();
    writer.set_accept_voteproof(&avp).unwrap();

    let saved = writer.save().unwrap();
    assert!(saved.is_valid(&network_id()).is_ok());
    assert_eq!(saved.item(BlockItemType::Operations).unwrap().count, 33);
    assert_eq!(saved.item(BlockItemType::States).unwrap().count, 33);
    assert!(writer.save().is_err());

    let reader = LocalFsReader::new(dir.path(), Height(HEIGHT), JsonEncoder).unwrap();
    assert_eq!(reader.map().unwrap(), saved);

    for t in BlockItemType::ITEMS {
        let recorded = saved.item(t).unwrap();

        let mut raw = reader.reader(t).unwrap().unwrap();
        let mut buf = Vec::new();
        raw.read_to_end(&mut buf).unwrap();
        assert_eq!(raw.checksum(), recorded.checksum, "{t}");

        assert!(reader.item(t).unwrap().is_some(), "{t}");
    }

    // Plain items read back line by line as written.
    let lines: Vec<String> = reader
        .uncompressed_reader(BlockItemType::Voteproofs)
        .unwrap()
        .unwrap()
        .lines()
        .map(Result::unwrap)
        .filter(|l| !l.is_empty())
        .collect();
    assert_eq!(lines.len(), 2);
    let (read_ivp, read_avp) =
        decode_voteproofs(&JsonEncoder, lines.join("\n").as_bytes()).unwrap();
    assert_eq!((read_ivp, read_avp), (ivp.clone(), avp.clone()));

    let mut decoded = String::new();
    reader
        .uncompressed_reader(BlockItemType::States)
        .unwrap()
        .unwrap()
        .read_to_string(&mut decoded)
        .unwrap();
    assert_eq!(decoded.lines().filter(|l| !l.is_empty()).count(), 33);
    assert!(reader
        .uncompressed_reader(BlockItemType::OperationsTree)
        .unwrap()
        .is_some());

    match reader.item(BlockItemType::Operations).unwrap().as_deref() {
        Some(BlockItem::Operations(ops)) => assert_eq!(ops, &b.operations),
        other => panic!("unexpected operations item: {other:?}"),
    }
    match reader.item(BlockItemType::States).unwrap().as_deref() {
        Some(BlockItem::States(states)) => assert_eq!(states, &b.states),
        other => panic!("unexpected states item: {other:?}"),
    }
    match reader.item(BlockItemType::StatesTree).unwrap().as_deref() {
        Some(BlockItem::StatesTree(tree)) => assert_eq!(tree.root(), b.states_tree.root()),
        other => panic!("unexpected states tree item: {other:?}"),
    }
    assert_eq!(reader.proposal().unwrap(), Some(proposal));
    assert_eq!(reader.voteproofs().unwrap(), Some((ivp, avp)));

    let again = LocalFsWriter::new(
        dir.path(),
        Height(HEIGHT),
        JsonEncoder,
        nodes[0].clone(),
        network_id(),
    )
    .unwrap();
    again.set_manifest(manifest).unwrap();
    assert!(matches!(again.save(), Err(LocalFsError::AlreadyExists(_))));
}

#[test]
fn test_missing_block() {
    let dir = TempDir::new().unwrap();
    assert!(matches!(
        LocalFsReader::new(dir.path(), Height(HEIGHT), JsonEncoder),
        Err(LocalFsError::NotFound(_))
    ));
}
