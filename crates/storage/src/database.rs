//! Block databases.
//!
//! A block is staged in a [`BlockWriteDatabase`], one per height, and then
//! merged into the [`PermanentDatabase`] that answers lookups. The in-memory
//! implementations back tests and single-process deployments.

use isaac_core::{SuffrageError, SuffrageProvider};
use isaac_types::{BlockMap, Hash, Height, State, Suffrage, SuffrageProof};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::debug;

/// Database errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DatabaseError {
    /// The write database was canceled.
    #[error("write database canceled")]
    Canceled,

    /// The write database was already written.
    #[error("write database already written")]
    AlreadyWritten,

    /// The write database has not been written yet.
    #[error("write database not written")]
    NotWritten,

    /// Value does not fit the database.
    #[error("invalid: {0}")]
    Invalid(String),
}

/// Everything a written block database hands to the permanent database.
#[derive(Debug, Clone, PartialEq)]
pub struct WrittenBlock {
    pub map: BlockMap,
    /// Fact hashes of every operation of the block.
    pub operations: Vec<Hash>,
    /// Operations that ended up in a state.
    pub in_state_operations: Vec<Hash>,
    pub states: Vec<State>,
    pub suffrage_proof: Option<SuffrageProof>,
}

/// Staging database of one block.
pub trait BlockWriteDatabase: Send + Sync {
    /// Height being written.
    fn height(&self) -> Height;

    fn set_block_map(&self, map: &BlockMap) -> Result<(), DatabaseError>;

    /// Add operation fact hashes.
    fn set_operations(&self, operations: &[Hash]) -> Result<(), DatabaseError>;

    /// Add states; later states replace earlier ones with the same key.
    fn set_states(&self, states: &[State]) -> Result<(), DatabaseError>;

    fn set_suffrage_proof(&self, proof: SuffrageProof) -> Result<(), DatabaseError>;

    /// Finish staging. Further sets fail.
    fn write(&self) -> Result<(), DatabaseError>;

    /// Discard everything staged. Idempotent.
    fn cancel(&self) -> Result<(), DatabaseError>;

    /// Staged block; only after [`BlockWriteDatabase::write`].
    fn written(&self) -> Result<WrittenBlock, DatabaseError>;
}

/// Finalized blocks.
pub trait PermanentDatabase: Send + Sync {
    /// Map of the highest stored block.
    fn last_block_map(&self) -> Option<BlockMap>;

    fn block_map(&self, height: Height) -> Option<BlockMap>;

    /// Latest version of the state `key`.
    fn state(&self, key: &str) -> Option<State>;

    /// Whether the operation was included in a block.
    fn exists_known_operation(&self, fact_hash: &Hash) -> bool;

    /// Whether the operation produced a state.
    fn exists_in_state_operation(&self, fact_hash: &Hash) -> bool;

    /// Proof of the last suffrage change.
    fn last_suffrage_proof(&self) -> Option<SuffrageProof>;

    /// Proof of the suffrage change made at exactly `height`.
    fn suffrage_proof(&self, height: Height) -> Option<SuffrageProof>;

    /// Promote a written block.
    fn merge(&self, block: WrittenBlock) -> Result<(), DatabaseError>;
}

#[derive(Default)]
struct WriteInner {
    map: Option<BlockMap>,
    operations: Vec<Hash>,
    in_state_operations: Vec<Hash>,
    states: BTreeMap<String, State>,
    suffrage_proof: Option<SuffrageProof>,
    written: bool,
    canceled: bool,
}

impl WriteInner {
    fn check_writable(&self) -> Result<(), DatabaseError> {
        if self.canceled {
            return Err(DatabaseError::Canceled);
        }
        if self.written {
            return Err(DatabaseError::AlreadyWritten);
        }
        Ok(())
    }
}

/// In-memory [`BlockWriteDatabase`].
pub struct MemoryBlockWriteDatabase {
    height: Height,
    inner: Mutex<WriteInner>,
}

impl MemoryBlockWriteDatabase {
    pub fn new(height: Height) -> Self {
        Self {
            height,
            inner: Mutex::new(WriteInner::default()),
        }
    }

    /// Number of staged states.
    pub fn states_len(&self) -> usize {
        self.inner.lock().states.len()
    }

    /// Number of staged operations.
    pub fn operations_len(&self) -> usize {
        self.inner.lock().operations.len()
    }

    pub fn is_canceled(&self) -> bool {
        self.inner.lock().canceled
    }
}

impl BlockWriteDatabase for MemoryBlockWriteDatabase {
    fn height(&self) -> Height {
        self.height
    }

    fn set_block_map(&self, map: &BlockMap) -> Result<(), DatabaseError> {
        let mut inner = self.inner.lock();
        inner.check_writable()?;
        if map.height() != self.height {
            return Err(DatabaseError::Invalid(format!(
                "block map of {} in write database of {}",
                map.height(),
                self.height
            )));
        }
        inner.map = Some(map.clone());
        Ok(())
    }

    fn set_operations(&self, operations: &[Hash]) -> Result<(), DatabaseError> {
        let mut inner = self.inner.lock();
        inner.check_writable()?;
        inner.operations.extend_from_slice(operations);
        Ok(())
    }

    fn set_states(&self, states: &[State]) -> Result<(), DatabaseError> {
        let mut inner = self.inner.lock();
        inner.check_writable()?;
        for st in states {
            inner.in_state_operations.extend(st.operations.iter().copied());
            inner.states.insert(st.key.clone(), st.clone());
        }
        Ok(())
    }

    fn set_suffrage_proof(&self, proof: SuffrageProof) -> Result<(), DatabaseError> {
        let mut inner = self.inner.lock();
        inner.check_writable()?;
        if proof.height() != self.height {
            return Err(DatabaseError::Invalid(format!(
                "suffrage proof of {} in write database of {}",
                proof.height(),
                self.height
            )));
        }
        inner.suffrage_proof = Some(proof);
        Ok(())
    }

    fn write(&self) -> Result<(), DatabaseError> {
        let mut inner = self.inner.lock();
        inner.check_writable()?;
        if inner.map.is_none() {
            return Err(DatabaseError::Invalid("empty block map".into()));
        }
        inner.written = true;
        Ok(())
    }

    fn cancel(&self) -> Result<(), DatabaseError> {
        let mut inner = self.inner.lock();
        if !inner.canceled {
            debug!(height = self.height.0, "write database canceled");
        }
        *inner = WriteInner {
            canceled: true,
            ..Default::default()
        };
        Ok(())
    }

    fn written(&self) -> Result<WrittenBlock, DatabaseError> {
        let inner = self.inner.lock();
        if inner.canceled {
            return Err(DatabaseError::Canceled);
        }
        let (true, Some(map)) = (inner.written, inner.map.as_ref()) else {
            return Err(DatabaseError::NotWritten);
        };

        Ok(WrittenBlock {
            map: map.clone(),
            operations: inner.operations.clone(),
            in_state_operations: inner.in_state_operations.clone(),
            states: inner.states.values().cloned().collect(),
            suffrage_proof: inner.suffrage_proof.clone(),
        })
    }
}

#[derive(Default)]
struct PermanentInner {
    maps: BTreeMap<Height, BlockMap>,
    states: HashMap<String, State>,
    known: HashSet<Hash>,
    in_state: HashSet<Hash>,
    proofs: BTreeMap<Height, SuffrageProof>,
}

/// In-memory [`PermanentDatabase`].
///
/// Also a [`SuffrageProvider`]: the suffrage of height `h` is the one of the
/// last proof below `h`, known once block `h - 1` is stored.
#[derive(Default)]
pub struct MemoryPermanentDatabase {
    inner: RwLock<PermanentInner>,
}

impl MemoryPermanentDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    /// Height of the highest stored block; [`Height::NIL`] when empty.
    pub fn last_height(&self) -> Height {
        self.inner
            .read()
            .maps
            .keys()
            .next_back()
            .copied()
            .unwrap_or(Height::NIL)
    }
}

impl PermanentDatabase for MemoryPermanentDatabase {
    fn last_block_map(&self) -> Option<BlockMap> {
        self.inner.read().maps.values().next_back().cloned()
    }

    fn block_map(&self, height: Height) -> Option<BlockMap> {
        self.inner.read().maps.get(&height).cloned()
    }

    fn state(&self, key: &str) -> Option<State> {
        self.inner.read().states.get(key).cloned()
    }

    fn exists_known_operation(&self, fact_hash: &Hash) -> bool {
        self.inner.read().known.contains(fact_hash)
    }

    fn exists_in_state_operation(&self, fact_hash: &Hash) -> bool {
        self.inner.read().in_state.contains(fact_hash)
    }

    fn last_suffrage_proof(&self) -> Option<SuffrageProof> {
        self.inner.read().proofs.values().next_back().cloned()
    }

    fn suffrage_proof(&self, height: Height) -> Option<SuffrageProof> {
        self.inner.read().proofs.get(&height).cloned()
    }

    fn merge(&self, block: WrittenBlock) -> Result<(), DatabaseError> {
        let mut inner = self.inner.write();
        let height = block.map.height();

        if let Some(proof) = block.suffrage_proof {
            inner.proofs.insert(height, proof);
        }
        for st in block.states {
            let replace = inner
                .states
                .get(&st.key)
                .map(|old| old.height <= st.height)
                .unwrap_or(true);
            if replace {
                inner.states.insert(st.key.clone(), st);
            }
        }
        inner.known.extend(block.operations);
        inner.in_state.extend(block.in_state_operations);
        inner.maps.insert(height, block.map);

        debug!(height = height.0, "block merged");
        Ok(())
    }
}

impl SuffrageProvider for MemoryPermanentDatabase {
    fn suffrage(&self, height: Height) -> Result<Option<Suffrage>, SuffrageError> {
        let inner = self.inner.read();
        let last = inner.maps.keys().next_back().copied().unwrap_or(Height::NIL);
        if last < height.prev() {
            return Ok(None);
        }

        match inner.proofs.range(..height).next_back() {
            Some((_, proof)) => Ok(Some(proof.suffrage()?)),
            None => Ok(None),
        }
    }
}
