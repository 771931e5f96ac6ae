//! Reads a published block.

use super::path::{block_directory, item_file_name};
use super::{decode_item, BlockItem, ChecksumReader, LocalFsError};
use flate2::read::GzDecoder;
use isaac_core::{Encoder, JsonEncoder};
use isaac_types::{BlockItemType, BlockMap, Height, ProposalSignFact, Voteproof};
use isaac_util::{LockedMapError, SingleLockedMap};
use parking_lot::Mutex;
use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::trace;

/// Reader of one block directory.
///
/// The block map and decoded items are cached. Decoding an item verifies
/// the file checksum against the block map.
pub struct LocalFsReader<E: Encoder = JsonEncoder> {
    dir: PathBuf,
    height: Height,
    enc: E,
    map: Mutex<Option<BlockMap>>,
    items: SingleLockedMap<BlockItemType, Arc<BlockItem>>,
}

impl<E: Encoder> LocalFsReader<E> {
    /// Open the block at `height`; [`LocalFsError::NotFound`] without a
    /// block map.
    pub fn new(root: impl AsRef<Path>, height: Height, enc: E) -> Result<Self, LocalFsError> {
        let dir = block_directory(root.as_ref(), height);
        if !dir.join(item_file_name(&enc, BlockItemType::Map)).is_file() {
            return Err(LocalFsError::NotFound(format!("block map of {height}")));
        }

        Ok(Self {
            dir,
            height,
            enc,
            map: Mutex::new(None),
            items: SingleLockedMap::new(),
        })
    }

    pub fn height(&self) -> Height {
        self.height
    }

    fn path(&self, t: BlockItemType) -> PathBuf {
        self.dir.join(item_file_name(&self.enc, t))
    }

    pub fn map(&self) -> Result<BlockMap, LocalFsError> {
        let mut cached = self.map.lock();
        if let Some(map) = cached.as_ref() {
            return Ok(map.clone());
        }

        let b = std::fs::read(self.path(BlockItemType::Map))?;
        let map: BlockMap = self.enc.unmarshal(&b)?;
        if map.height() != self.height {
            return Err(LocalFsError::Invalid(format!(
                "block map of {} under {}",
                map.height(),
                self.height
            )));
        }
        *cached = Some(map.clone());
        Ok(map)
    }

    /// Raw file of an item; `None` when the file does not exist.
    pub fn reader(
        &self,
        t: BlockItemType,
    ) -> Result<Option<ChecksumReader<BufReader<File>>>, LocalFsError> {
        match File::open(self.path(t)) {
            Ok(f) => Ok(Some(ChecksumReader::new(BufReader::new(f)))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Item file with compression removed.
    pub fn uncompressed_reader(
        &self,
        t: BlockItemType,
    ) -> Result<Option<Box<dyn BufRead + Send>>, LocalFsError> {
        let Some(r) = self.reader(t)? else {
            return Ok(None);
        };
        if t.is_compressed() {
            Ok(Some(Box::new(BufReader::new(GzDecoder::new(r)))))
        } else {
            Ok(Some(Box::new(BufReader::new(r))))
        }
    }

    /// Decoded item; `None` when the block has no such item.
    pub fn item(&self, t: BlockItemType) -> Result<Option<Arc<BlockItem>>, LocalFsError> {
        if let Some(item) = self.items.value(&t) {
            return Ok(Some(item));
        }

        let mut failed = None;
        let created = self.items.get_or_create(t, || match self.load(t) {
            Ok(item) => Ok(Arc::new(item)),
            Err(e) => {
                failed = Some(e);
                Err(LockedMapError::SetIgnore)
            }
        });

        match (created, failed) {
            (_, Some(LocalFsError::NotFound(_))) => Ok(None),
            (_, Some(e)) => Err(e),
            (Ok((item, _)), None) => Ok(Some(item)),
            (Err(e), None) => Err(LocalFsError::Invalid(e.to_string())),
        }
    }

    pub fn proposal(&self) -> Result<Option<ProposalSignFact>, LocalFsError> {
        Ok(self
            .item(BlockItemType::Proposal)?
            .and_then(|item| match item.as_ref() {
                BlockItem::Proposal(pr) => Some(pr.clone()),
                _ => None,
            }))
    }

    /// INIT and ACCEPT voteproofs that finalized the block.
    pub fn voteproofs(&self) -> Result<Option<(Voteproof, Voteproof)>, LocalFsError> {
        Ok(self
            .item(BlockItemType::Voteproofs)?
            .and_then(|item| match item.as_ref() {
                BlockItem::Voteproofs(ivp, avp) => Some((ivp.clone(), avp.clone())),
                _ => None,
            }))
    }

    fn load(&self, t: BlockItemType) -> Result<BlockItem, LocalFsError> {
        let map = self.map()?;
        let entry = map
            .item(t)
            .ok_or_else(|| LocalFsError::NotFound(format!("{t} of {}", self.height)))?;
        let mut raw = self
            .reader(t)?
            .ok_or_else(|| LocalFsError::Invalid(format!("{t} listed in map but missing")))?;

        let mut b = Vec::new();
        if entry.compressed {
            GzDecoder::new(&mut raw).read_to_end(&mut b)?;
        } else {
            raw.read_to_end(&mut b)?;
        }

        let got = raw.drain()?;
        if got != entry.checksum {
            return Err(LocalFsError::Checksum {
                item: t,
                expected: entry.checksum.clone(),
                got,
            });
        }

        trace!(height = self.height.0, item = %t, bytes = b.len(), "item loaded");
        decode_item(&self.enc, t, &b)
    }
}
