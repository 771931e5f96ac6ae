//! Imports one remote block.
//!
//! Item bytes are copied untouched into the local block directory and, at the
//! same time, decoded into the block write database. The copy is what gets
//! checksummed, so a block that imports cleanly is byte-identical to the
//! source.

use crate::ImportError;
use flate2::read::GzDecoder;
use isaac_core::{Encoder, JsonEncoder};
use isaac_storage::localfs::{
    decode_tree, decode_voteproofs, for_each_line, split_indexed, ChecksumReader,
};
use isaac_storage::{BlockWriteDatabase, LocalFsImporter, WrittenBlock};
use isaac_types::{
    BlockItemType, BlockMap, FixedTree, Height, NetworkId, Operation, State, SuffrageProof,
    ValidationError, Voteproof,
};
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::io::{self, BufRead, BufReader, Read, Write};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, trace};

/// Copies everything read from `inner` into `w`.
struct TeeReader<R, W> {
    inner: R,
    w: W,
}

impl<R: Read, W: Write> Read for TeeReader<R, W> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.w.write_all(&buf[..n])?;
        Ok(n)
    }
}

#[derive(Default)]
struct Decoded {
    unfinished: BTreeSet<BlockItemType>,
    suffrage_state: Option<State>,
    states_tree: Option<FixedTree>,
    accept_voteproof: Option<Voteproof>,
    saved: bool,
}

/// Importer of one block height.
///
/// [`BlockImporter::write_item`] may be called for different items from
/// different threads; [`BlockImporter::save`] publishes the block once every
/// item listed in the block map was written.
pub struct BlockImporter<E: Encoder = JsonEncoder> {
    map: BlockMap,
    enc: E,
    network_id: NetworkId,
    bwdb: Arc<dyn BlockWriteDatabase>,
    localfs: LocalFsImporter<E>,
    batch_limit: usize,
    decoded: Mutex<Decoded>,
}

impl<E: Encoder> BlockImporter<E> {
    pub fn new(
        root: impl AsRef<Path>,
        map: BlockMap,
        enc: E,
        network_id: NetworkId,
        bwdb: Arc<dyn BlockWriteDatabase>,
        batch_limit: usize,
    ) -> Result<Self, ImportError> {
        if bwdb.height() != map.height() {
            return Err(ImportError::WrongBlockMap {
                height: map.height(),
                reason: format!("write database of {}", bwdb.height()),
            });
        }

        bwdb.set_block_map(&map)?;
        let localfs = LocalFsImporter::new(root, map.clone(), enc.clone())?;

        let decoded = Decoded {
            unfinished: map.items.keys().copied().collect(),
            ..Default::default()
        };

        Ok(Self {
            map,
            enc,
            network_id,
            bwdb,
            localfs,
            batch_limit: batch_limit.max(1),
            decoded: Mutex::new(decoded),
        })
    }

    pub fn height(&self) -> Height {
        self.map.height()
    }

    pub fn map(&self) -> &BlockMap {
        &self.map
    }

    /// Items listed in the block map and not written yet.
    pub fn unfinished(&self) -> Vec<BlockItemType> {
        self.decoded.lock().unfinished.iter().copied().collect()
    }

    /// Copy and decode item `t` from `r`, which yields the item file as
    /// stored at the source, compression included.
    pub fn write_item(&self, t: BlockItemType, r: impl Read) -> Result<(), ImportError> {
        let item = self.map.item(t).ok_or_else(|| {
            ImportError::NotFound(format!("{t} not in block map of {}", self.height()))
        })?;

        let mut tee = TeeReader {
            inner: ChecksumReader::new(r),
            w: self.localfs.item_writer(t)?,
        };

        {
            let mut br: Box<dyn BufRead + '_> = if item.compressed {
                Box::new(BufReader::new(GzDecoder::new(&mut tee)))
            } else {
                Box::new(BufReader::new(&mut tee))
            };
            self.decode(t, &mut *br)?;
        }

        // The decoder may stop before the end, e.g. ahead of the gzip trailer.
        io::copy(&mut tee, &mut io::sink())?;
        tee.w.flush()?;

        let got = tee.inner.checksum();
        if got != item.checksum {
            return Err(ImportError::Checksum {
                height: self.height(),
                item: t,
                expected: item.checksum.clone(),
                got,
            });
        }

        self.decoded.lock().unfinished.remove(&t);
        trace!(height = self.height().0, item = %t, "item imported");
        Ok(())
    }

    fn decode(&self, t: BlockItemType, r: &mut dyn BufRead) -> Result<(), ImportError> {
        match t {
            BlockItemType::States => self.decode_states(r),
            BlockItemType::Operations => self.decode_operations(r),
            BlockItemType::StatesTree => {
                let mut b = Vec::new();
                r.read_to_end(&mut b)?;
                let tree = decode_tree(&self.enc, &b)?;
                if Some(tree.root()) != self.map.manifest.states_tree {
                    return Err(ImportError::WrongBlockMap {
                        height: self.height(),
                        reason: "states tree root does not match manifest".into(),
                    });
                }
                self.decoded.lock().states_tree = Some(tree);
                Ok(())
            }
            BlockItemType::Voteproofs => {
                let mut b = Vec::new();
                r.read_to_end(&mut b)?;
                let (ivp, avp) = decode_voteproofs(&self.enc, &b)?;
                self.check_voteproofs(&ivp, &avp)?;
                self.decoded.lock().accept_voteproof = Some(avp);
                Ok(())
            }
            _ => {
                io::copy(r, &mut io::sink())?;
                Ok(())
            }
        }
    }

    fn decode_states(&self, r: &mut dyn BufRead) -> Result<(), ImportError> {
        let mut batch: Vec<State> = Vec::with_capacity(self.batch_limit);
        let mut suffrage_state = None;

        for_each_line(r, |line| -> Result<(), ImportError> {
            let (_, b) = split_indexed(line)?;
            let st: State = self.enc.unmarshal(b)?;
            if st.is_suffrage_state() {
                suffrage_state = Some(st.clone());
            }

            batch.push(st);
            if batch.len() >= self.batch_limit {
                self.bwdb.set_states(&batch)?;
                batch.clear();
            }
            Ok(())
        })?;

        if !batch.is_empty() {
            self.bwdb.set_states(&batch)?;
        }
        if suffrage_state.is_some() {
            self.decoded.lock().suffrage_state = suffrage_state;
        }
        Ok(())
    }

    fn decode_operations(&self, r: &mut dyn BufRead) -> Result<(), ImportError> {
        let mut batch = Vec::with_capacity(self.batch_limit);

        for_each_line(r, |line| -> Result<(), ImportError> {
            let (_, b) = split_indexed(line)?;
            let op: Operation = self.enc.unmarshal(b)?;

            batch.push(op.fact_hash);
            if batch.len() >= self.batch_limit {
                self.bwdb.set_operations(&batch)?;
                batch.clear();
            }
            Ok(())
        })?;

        if !batch.is_empty() {
            self.bwdb.set_operations(&batch)?;
        }
        Ok(())
    }

    /// The voteproofs finalize this block.
    fn check_voteproofs(&self, ivp: &Voteproof, avp: &Voteproof) -> Result<(), ImportError> {
        ivp.is_valid(&self.network_id)?;
        avp.is_valid(&self.network_id)?;

        let height = self.height();
        if ivp.stage_point().height() != height || avp.stage_point().height() != height {
            return Err(ValidationError::invalid("voteproofs", "height does not match block").into());
        }
        if ivp.stage_point().point != avp.stage_point().point {
            return Err(ValidationError::invalid("voteproofs", "different points").into());
        }

        match avp.majority().and_then(|m| m.new_block()) {
            Some(h) if h == self.map.manifest.hash() => Ok(()),
            _ => Err(
                ValidationError::invalid("voteproofs", "accept voteproof does not finalize block")
                    .into(),
            ),
        }
    }

    /// Build the suffrage proof, write the database and publish the block.
    /// Saving an already saved block is a no-op.
    pub fn save(&self) -> Result<(), ImportError> {
        let mut decoded = self.decoded.lock();
        if decoded.saved {
            return Ok(());
        }
        if let Some(t) = decoded.unfinished.iter().next() {
            return Err(ImportError::NotFound(format!(
                "{t} of {} not imported",
                self.height()
            )));
        }

        if let Some(st) = decoded.suffrage_state.clone() {
            let proof = decoded
                .states_tree
                .as_ref()
                .and_then(|tree| tree.proof(&st.key))
                .ok_or_else(|| ImportError::WrongBlockMap {
                    height: self.height(),
                    reason: "suffrage state not in states tree".into(),
                })?;
            let voteproof = decoded.accept_voteproof.clone().ok_or_else(|| {
                ImportError::NotFound(format!("accept voteproof of {}", self.height()))
            })?;

            self.bwdb.set_suffrage_proof(SuffrageProof {
                map: self.map.clone(),
                state: st,
                proof,
                voteproof,
            })?;
        }

        self.bwdb.write()?;
        self.localfs.save()?;
        decoded.saved = true;

        debug!(height = self.height().0, "block imported");
        Ok(())
    }

    /// Staged block for the permanent database; only after
    /// [`BlockImporter::save`].
    pub fn written(&self) -> Result<WrittenBlock, ImportError> {
        Ok(self.bwdb.written()?)
    }

    /// Discard the write database and the temporary directory.
    pub fn cancel_import(&self) -> Result<(), ImportError> {
        if self.decoded.lock().saved {
            return Ok(());
        }
        self.bwdb.cancel()?;
        self.localfs.cancel()?;
        Ok(())
    }
}
