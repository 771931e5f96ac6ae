//! Block storage on the local filesystem.
//!
//! Each block lives in its own directory (see [`height_directory`]) holding
//! one file per item plus the signed block map:
//!
//! ```text
//! <root>/
//!   temp/<height>-<ulid>/          block being written
//!   000/000/000/033/
//!     map.json                     signed block map
//!     proposal.json                proposal sign fact
//!     operations.ndjson.gz         "<index>,<operation>" per line
//!     operations_tree.ndjson.gz    tree hint, then "<index>,<node>" per line
//!     states.ndjson.gz             "<index>,<state>" per line
//!     states_tree.ndjson.gz        tree hint, then "<index>,<node>" per line
//!     voteproofs.ndjson            INIT and ACCEPT voteproofs
//! ```
//!
//! The SHA-256 of every item file is recorded in the block map. A block is
//! written into its temporary directory and published by renaming that
//! directory, so a block directory is either complete or absent.

mod checksum;
mod importer;
mod path;
mod reader;
mod writer;

pub use checksum::{sha256_hex, ChecksumReader, ChecksumWriter};
pub use importer::LocalFsImporter;
pub use path::{block_directory, height_directory, item_file_name, temp_directory, TEMP_DIR};
pub use reader::LocalFsReader;
pub use writer::LocalFsWriter;

use flate2::write::GzEncoder;
use flate2::Compression;
use isaac_core::{EncodeError, Encoder, ProcessorError};
use isaac_types::{
    BlockItemType, BlockMapItem, FixedTree, FixedTreeNode, Operation, ProposalSignFact, State,
    Voteproof, FIXED_TREE_HINT,
};
use rayon::prelude::*;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs::File;
use std::io::{self, BufRead, BufWriter, Write};
use std::path::{Path, PathBuf};

/// Local filesystem errors.
#[derive(Debug, thiserror::Error)]
pub enum LocalFsError {
    #[error("io: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Encode(#[from] EncodeError),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists, {}", .0.display())]
    AlreadyExists(PathBuf),

    #[error("checksum mismatch of {item}: expected {expected}, got {got}")]
    Checksum {
        item: BlockItemType,
        expected: String,
        got: String,
    },

    #[error("invalid: {0}")]
    Invalid(String),

    #[error("local fs writer canceled")]
    Canceled,
}

impl LocalFsError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, LocalFsError::NotFound(_))
    }
}

impl From<LocalFsError> for ProcessorError {
    fn from(e: LocalFsError) -> Self {
        match e {
            LocalFsError::Canceled => ProcessorError::Canceled,
            LocalFsError::NotFound(s) => ProcessorError::NotFound(s),
            LocalFsError::Io(e) => ProcessorError::Retry(e.to_string()),
            e => ProcessorError::StopProcessingRetry(e.to_string()),
        }
    }
}

/// A decoded block item.
#[derive(Debug, Clone, PartialEq)]
pub enum BlockItem {
    Proposal(ProposalSignFact),
    Operations(Vec<Operation>),
    OperationsTree(FixedTree),
    States(Vec<State>),
    StatesTree(FixedTree),
    /// INIT and ACCEPT voteproofs.
    Voteproofs(Voteproof, Voteproof),
}

enum Sink {
    Plain(ChecksumWriter<BufWriter<File>>),
    Gzip(GzEncoder<ChecksumWriter<BufWriter<File>>>),
}

/// Writes one item file, counting records and checksumming the on-disk
/// bytes.
pub(crate) struct ItemFile {
    sink: Sink,
    path: PathBuf,
    count: u64,
}

impl ItemFile {
    pub(crate) fn create(path: PathBuf, compressed: bool) -> Result<Self, LocalFsError> {
        let w = ChecksumWriter::new(BufWriter::new(File::create(&path)?));
        let sink = if compressed {
            Sink::Gzip(GzEncoder::new(w, Compression::default()))
        } else {
            Sink::Plain(w)
        };
        Ok(Self {
            sink,
            path,
            count: 0,
        })
    }

    fn writer(&mut self) -> &mut dyn Write {
        match &mut self.sink {
            Sink::Plain(w) => w,
            Sink::Gzip(w) => w,
        }
    }

    /// Write one record line.
    pub(crate) fn write_line<E: Encoder, T: Serialize + ?Sized>(
        &mut self,
        enc: &E,
        value: &T,
    ) -> Result<(), LocalFsError> {
        let b = enc.marshal(value)?;
        let w = self.writer();
        w.write_all(&b)?;
        w.write_all(b"\n")?;
        self.count += 1;
        Ok(())
    }

    /// Write one `<index>,<value>` record line.
    pub(crate) fn write_indexed<E: Encoder, T: Serialize + ?Sized>(
        &mut self,
        enc: &E,
        index: u64,
        value: &T,
    ) -> Result<(), LocalFsError> {
        let b = enc.marshal(value)?;
        let w = self.writer();
        write!(w, "{index},")?;
        w.write_all(&b)?;
        w.write_all(b"\n")?;
        self.count += 1;
        Ok(())
    }

    /// Write a line that is not a record, like a tree hint.
    pub(crate) fn write_raw_line(&mut self, line: &[u8]) -> Result<(), LocalFsError> {
        let w = self.writer();
        w.write_all(line)?;
        w.write_all(b"\n")?;
        Ok(())
    }

    pub(crate) fn count(&self) -> u64 {
        self.count
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    /// Flush and return the block map entry.
    pub(crate) fn finish(self) -> Result<BlockMapItem, LocalFsError> {
        let (cw, compressed) = match self.sink {
            Sink::Plain(w) => (w, false),
            Sink::Gzip(w) => (w.finish()?, true),
        };
        let checksum = cw.checksum();
        cw.into_inner().flush()?;

        Ok(BlockMapItem {
            checksum,
            count: self.count,
            compressed,
        })
    }
}

/// Split a `<index>,<value>` line.
pub fn split_indexed(line: &[u8]) -> Result<(u64, &[u8]), LocalFsError> {
    let pos = line
        .iter()
        .position(|b| *b == b',')
        .ok_or_else(|| LocalFsError::Invalid("missing index".into()))?;

    let index = std::str::from_utf8(&line[..pos])
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .ok_or_else(|| LocalFsError::Invalid("wrong index".into()))?;
    Ok((index, &line[pos + 1..]))
}

fn non_empty_lines(b: &[u8]) -> Vec<&[u8]> {
    b.split(|c| *c == b'\n').filter(|l| !l.is_empty()).collect()
}

/// Decode `<index>,<value>` lines in parallel, ordered by index.
pub(crate) fn decode_indexed_lines<E: Encoder, T: DeserializeOwned + Send>(
    enc: &E,
    lines: &[&[u8]],
) -> Result<Vec<T>, LocalFsError> {
    let mut decoded: Vec<(u64, T)> = lines
        .par_iter()
        .map(|line| {
            let (index, b) = split_indexed(line)?;
            Ok((index, enc.unmarshal(b)?))
        })
        .collect::<Result<_, LocalFsError>>()?;

    decoded.sort_by_key(|(i, _)| *i);
    Ok(decoded.into_iter().map(|(_, v)| v).collect())
}

/// Decode a tree: the hint line, then `<index>,<node>` lines.
pub fn decode_tree<E: Encoder>(enc: &E, b: &[u8]) -> Result<FixedTree, LocalFsError> {
    let lines = non_empty_lines(b);
    match lines.first() {
        Some(hint) if *hint == FIXED_TREE_HINT.as_bytes() => {}
        _ => return Err(LocalFsError::Invalid("unknown tree hint".into())),
    }

    let nodes: Vec<FixedTreeNode> = decode_indexed_lines(enc, &lines[1..])?;
    FixedTree::from_nodes(nodes).map_err(LocalFsError::Invalid)
}

/// Decode the uncompressed bytes of an item file.
pub(crate) fn decode_item<E: Encoder>(
    enc: &E,
    t: BlockItemType,
    b: &[u8],
) -> Result<BlockItem, LocalFsError> {
    match t {
        BlockItemType::Map => Err(LocalFsError::Invalid("map is not an item".into())),
        BlockItemType::Proposal => Ok(BlockItem::Proposal(enc.unmarshal(b)?)),
        BlockItemType::Operations => Ok(BlockItem::Operations(decode_indexed_lines(
            enc,
            &non_empty_lines(b),
        )?)),
        BlockItemType::States => Ok(BlockItem::States(decode_indexed_lines(
            enc,
            &non_empty_lines(b),
        )?)),
        BlockItemType::OperationsTree => Ok(BlockItem::OperationsTree(decode_tree(enc, b)?)),
        BlockItemType::StatesTree => Ok(BlockItem::StatesTree(decode_tree(enc, b)?)),
        BlockItemType::Voteproofs => {
            let (ivp, avp) = decode_voteproofs(enc, b)?;
            Ok(BlockItem::Voteproofs(ivp, avp))
        }
    }
}

/// Decode the INIT and ACCEPT voteproof lines.
pub fn decode_voteproofs<E: Encoder>(
    enc: &E,
    b: &[u8],
) -> Result<(Voteproof, Voteproof), LocalFsError> {
    let lines = non_empty_lines(b);
    let [i, a] = lines.as_slice() else {
        return Err(LocalFsError::Invalid(format!(
            "expected 2 voteproofs, got {}",
            lines.len()
        )));
    };

    let ivp: Voteproof = enc.unmarshal(i)?;
    let avp: Voteproof = enc.unmarshal(a)?;
    if !ivp.is_init() || avp.is_init() {
        return Err(LocalFsError::Invalid("voteproofs out of order".into()));
    }
    Ok((ivp, avp))
}

/// Call `f` with every non-empty line of `r`, without the newline.
pub fn for_each_line<E: From<io::Error>>(
    r: &mut dyn BufRead,
    mut f: impl FnMut(&[u8]) -> Result<(), E>,
) -> Result<(), E> {
    let mut line = Vec::new();
    loop {
        line.clear();
        if r.read_until(b'\n', &mut line)? == 0 {
            return Ok(());
        }
        let l = line.strip_suffix(b"\n").unwrap_or(&line);
        if !l.is_empty() {
            f(l)?;
        }
    }
}
