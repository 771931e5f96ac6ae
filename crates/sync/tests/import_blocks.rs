//! Importing a chain of blocks from another block directory.

use isaac_core::{JsonEncoder, Syncer};
use isaac_storage::localfs::{block_directory, item_file_name};
use isaac_storage::{
    BlockWriteDatabase, DatabaseError, MemoryBlockWriteDatabase, MemoryPermanentDatabase,
    PermanentDatabase, WrittenBlock,
};
use isaac_sync::{BlockSyncer, ImportBlocks, ImportError, LocalFsFetcher, SyncConfig};
use isaac_test_helpers::{make_nodes, make_voteproof, network_id, point};
use isaac_types::{
    AcceptBallotFact, BallotFact, BlockItemType, BlockMap, FixedTree, Hash, Height, InitBallotFact, Manifest,
    Node, Operation, ProposalFact, ProposalSignFact, State, StateValue, SuffrageProof, Threshold,
    Voteproof, SUFFRAGE_STATE_KEY,
};
use isaac_storage::LocalFsWriter;
use parking_lot::Mutex;
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

const TOP: i64 = 33;

struct Source {
    _dir: TempDir,
    root: std::path::PathBuf,
    db: MemoryPermanentDatabase,
    last_voteproofs: (Voteproof, Voteproof),
}

/// Blocks `0..=TOP`, each with three operations and a state per operation.
/// Genesis also sets the suffrage.
fn source() -> Source {
    let dir = TempDir::new().unwrap();
    let root = dir.path().to_path_buf();
    let nodes = make_nodes(3);
    let db = MemoryPermanentDatabase::new();

    let mut previous: Option<Manifest> = None;
    let mut last_voteproofs = None;
    for h in 0..=TOP {
        let operations: Vec<Operation> = (0..3)
            .map(|i| Operation::new(format!("op-{h}-{i}")))
            .collect();
        let mut states: Vec<State> = operations
            .iter()
            .enumerate()
            .map(|(i, op)| State {
                key: format!("k-{i}"),
                value: StateValue::Data(format!("{h}-{i}")),
                height: Height(h),
                previous: None,
                operations: vec![op.fact_hash],
            })
            .collect();
        if h == 0 {
            states.push(State {
                key: SUFFRAGE_STATE_KEY.into(),
                value: StateValue::Suffrage {
                    nodes: nodes
                        .iter()
                        .map(|n| Node::new(n.address().clone(), n.public_key()))
                        .collect(),
                },
                height: Height(h),
                previous: None,
                operations: vec![],
            });
        }

        let operations_tree = FixedTree::new(
            operations
                .iter()
                .map(|op| (op.fact_hash.to_hex(), op.hash))
                .collect(),
        );
        let states_tree =
            FixedTree::new(states.iter().map(|s| (s.key.clone(), s.hash())).collect());

        let p = point(h, 0);
        let proposal = ProposalSignFact::new(
            ProposalFact {
                point: p,
                proposer: nodes[0].address().clone(),
                previous_block: previous.as_ref().map(Manifest::hash),
                operations: operations.iter().map(|op| (op.hash, op.fact_hash)).collect(),
                proposed_at: 1_000 + h as u64,
            },
            &nodes[0],
            &network_id(),
        );
        let manifest = Manifest {
            height: Height(h),
            previous: previous.as_ref().map(Manifest::hash),
            proposal: proposal.hash(),
            operations_tree: Some(operations_tree.root()),
            states_tree: Some(states_tree.root()),
            suffrage: None,
            proposed_at: 1_000 + h as u64,
        };

        let ivp = make_voteproof(
            &BallotFact::Init(InitBallotFact {
                point: p,
                previous_block: manifest.previous,
                proposal: manifest.proposal,
                expels: vec![],
            }),
            &nodes,
            Threshold::MAX,
        );
        let avp = make_voteproof(
            &BallotFact::Accept(AcceptBallotFact {
                point: p,
                proposal: manifest.proposal,
                new_block: manifest.hash(),
                expels: vec![],
            }),
            &nodes,
            Threshold::MAX,
        );

        let w = LocalFsWriter::new(&root, Height(h), JsonEncoder, nodes[0].clone(), network_id())
            .unwrap();
        w.set_manifest(manifest.clone()).unwrap();
        w.set_proposal(&proposal).unwrap();
        for (i, op) in operations.iter().enumerate() {
            w.set_operation(i as u64, op).unwrap();
        }
        for (i, st) in states.iter().enumerate() {
            w.set_state(i as u64, st).unwrap();
        }
        w.set_operations_tree(operations_tree).unwrap();
        w.set_states_tree(states_tree.clone()).unwrap();
        w.set_init_voteproof(&ivp).unwrap();
        w.set_accept_voteproof(&avp).unwrap();
        let map = w.save().unwrap();

        let wdb = MemoryBlockWriteDatabase::new(Height(h));
        wdb.set_block_map(&map).unwrap();
        wdb.set_operations(&operations.iter().map(|op| op.fact_hash).collect::<Vec<_>>())
            .unwrap();
        wdb.set_states(&states).unwrap();
        if let Some(st) = states.iter().find(|s| s.is_suffrage_state()) {
            wdb.set_suffrage_proof(SuffrageProof {
                map: map.clone(),
                state: st.clone(),
                proof: states_tree.proof(&st.key).unwrap(),
                voteproof: avp.clone(),
            })
            .unwrap();
        }
        wdb.write().unwrap();
        db.merge(wdb.written().unwrap()).unwrap();

        previous = Some(manifest);
        last_voteproofs = Some((ivp, avp));
    }

    Source {
        _dir: dir,
        root,
        db,
        last_voteproofs: last_voteproofs.unwrap(),
    }
}

fn import_into(
    src: &Path,
    dst: &Path,
    target: Arc<MemoryPermanentDatabase>,
) -> (ImportBlocks, Arc<Mutex<Option<(Voteproof, Voteproof)>>>) {
    let last = Arc::new(Mutex::new(None));
    let set = last.clone();

    let import = ImportBlocks::new(
        dst,
        JsonEncoder,
        network_id(),
        SyncConfig::with_batch_limit(3).with_database_batch_limit(2),
        Arc::new(LocalFsFetcher::new(src, JsonEncoder)),
        target,
    )
    .with_set_last_voteproofs(Arc::new(move |ivp, avp| {
        *set.lock() = Some((ivp, avp));
        Ok(())
    }));
    (import, last)
}

#[tokio::test]
async fn test_import_range() {
    let source = source();
    let dst = TempDir::new().unwrap();
    let target = Arc::new(MemoryPermanentDatabase::new());
    let (import, last) = import_into(&source.root, dst.path(), target.clone());

    import
        .import(CancellationToken::new(), Height(0), Height(TOP))
        .await
        .unwrap();

    assert_eq!(target.last_block_map(), source.db.last_block_map());
    for h in 0..=TOP {
        assert_eq!(target.block_map(Height(h)), source.db.block_map(Height(h)), "{h}");

        for i in 0..3 {
            let op = Operation::new(format!("op-{h}-{i}"));
            assert!(source.db.exists_known_operation(&op.fact_hash));
            assert!(target.exists_known_operation(&op.fact_hash));
            assert!(source.db.exists_in_state_operation(&op.fact_hash));
            assert!(target.exists_in_state_operation(&op.fact_hash));
        }
    }
    for i in 0..3 {
        let key = format!("k-{i}");
        assert_eq!(target.state(&key), source.db.state(&key));
        assert_eq!(target.state(&key).unwrap().height, Height(TOP));
    }

    let proof = target.last_suffrage_proof().unwrap();
    assert_eq!(Some(proof.clone()), source.db.last_suffrage_proof());
    assert!(proof.is_valid(&network_id()).is_ok());

    assert_eq!(last.lock().clone(), Some(source.last_voteproofs.clone()));
    assert_eq!(std::fs::read_dir(dst.path().join("temp")).unwrap().count(), 0);
}

#[tokio::test]
async fn test_corrupted_item_stops_import() {
    let source = source();
    let corrupted = block_directory(&source.root, Height(5))
        .join(item_file_name(&JsonEncoder, BlockItemType::Proposal));
    std::fs::OpenOptions::new()
        .append(true)
        .open(&corrupted)
        .unwrap()
        .write_all(b" ")
        .unwrap();

    let dst = TempDir::new().unwrap();
    let target = Arc::new(MemoryPermanentDatabase::new());
    let (import, last) = import_into(&source.root, dst.path(), target.clone());

    let err = import
        .import(CancellationToken::new(), Height(0), Height(TOP))
        .await
        .unwrap_err();
    assert!(matches!(err, ImportError::Checksum { .. }), "{err}");

    // The batch of 3..=5 is dropped; 0..=2 stay merged.
    assert_eq!(target.last_height(), Height(2));
    assert!(!block_directory(dst.path(), Height(3)).exists());
    assert_eq!(std::fs::read_dir(dst.path().join("temp")).unwrap().count(), 0);
    assert!(last.lock().is_none());
}

#[tokio::test]
async fn test_syncer_follows_top() {
    let source = source();
    let dst = TempDir::new().unwrap();
    let target = Arc::new(MemoryPermanentDatabase::new());
    let (import, _) = import_into(&source.root, dst.path(), target.clone());

    let syncer = BlockSyncer::start(Arc::new(import), Height(10));
    let mut finished = syncer.finished();

    tokio::time::timeout(Duration::from_secs(10), finished.wait_for(|h| *h >= Height(10)))
        .await
        .unwrap()
        .unwrap();
    assert!(syncer.add(Height(TOP)));
    assert_eq!(syncer.top(), Height(TOP));

    tokio::time::timeout(Duration::from_secs(10), finished.wait_for(|h| *h >= Height(TOP)))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(syncer.is_finished(), (Height(TOP), true));
    assert_eq!(target.last_height(), Height(TOP));
    assert!(syncer.error().is_none());

    syncer.cancel().await.unwrap();
    assert!(!syncer.add(Height(TOP + 1)));
}

/// Write database whose `write` fails once while `fail` is set.
struct FlakyWriteDatabase {
    inner: MemoryBlockWriteDatabase,
    fail: Arc<AtomicBool>,
}

impl BlockWriteDatabase for FlakyWriteDatabase {
    fn height(&self) -> Height {
        self.inner.height()
    }

    fn set_block_map(&self, map: &BlockMap) -> Result<(), DatabaseError> {
        self.inner.set_block_map(map)
    }

    fn set_operations(&self, operations: &[Hash]) -> Result<(), DatabaseError> {
        self.inner.set_operations(operations)
    }

    fn set_states(&self, states: &[State]) -> Result<(), DatabaseError> {
        self.inner.set_states(states)
    }

    fn set_suffrage_proof(&self, proof: SuffrageProof) -> Result<(), DatabaseError> {
        self.inner.set_suffrage_proof(proof)
    }

    fn write(&self) -> Result<(), DatabaseError> {
        if self.fail.swap(false, Ordering::SeqCst) {
            return Err(DatabaseError::Invalid("disk full".into()));
        }
        self.inner.write()
    }

    fn cancel(&self) -> Result<(), DatabaseError> {
        self.inner.cancel()
    }

    fn written(&self) -> Result<WrittenBlock, DatabaseError> {
        self.inner.written()
    }
}

#[tokio::test]
async fn test_failed_save_keeps_saved_blocks() {
    let source = source();
    let dst = TempDir::new().unwrap();
    let target = Arc::new(MemoryPermanentDatabase::new());
    let fail = Arc::new(AtomicBool::new(false));

    let (import, last) = import_into(&source.root, dst.path(), target.clone());
    let flaky = fail.clone();
    let import = import.with_write_database(Arc::new(move |height| {
        Arc::new(FlakyWriteDatabase {
            inner: MemoryBlockWriteDatabase::new(height),
            fail: Arc::new(AtomicBool::new(
                height == Height(4) && flaky.load(Ordering::SeqCst),
            )),
        }) as Arc<dyn BlockWriteDatabase>
    }));

    // Height 4 fails to save in the middle of the batch 3..=5.
    fail.store(true, Ordering::SeqCst);
    let err = import
        .import(CancellationToken::new(), Height(0), Height(TOP))
        .await
        .unwrap_err();
    assert!(matches!(err, ImportError::Database(_)), "{err}");

    // Height 3 was published, so it is merged too.
    assert_eq!(target.last_height(), Height(3));
    assert!(block_directory(dst.path(), Height(3)).exists());
    assert!(!block_directory(dst.path(), Height(4)).exists());
    assert!(!block_directory(dst.path(), Height(5)).exists());
    assert_eq!(std::fs::read_dir(dst.path().join("temp")).unwrap().count(), 0);
    assert!(last.lock().is_none());

    // The retry picks up after the merged height.
    fail.store(false, Ordering::SeqCst);
    import
        .import(
            CancellationToken::new(),
            target.last_height().next(),
            Height(TOP),
        )
        .await
        .unwrap();

    assert_eq!(target.last_block_map(), source.db.last_block_map());
    for h in 0..=TOP {
        assert_eq!(target.block_map(Height(h)), source.db.block_map(Height(h)), "{h}");
    }
    assert_eq!(last.lock().clone(), Some(source.last_voteproofs.clone()));
}
