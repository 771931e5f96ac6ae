//! Sources of remote blocks.

use crate::ImportError;
use async_trait::async_trait;
use isaac_core::{Encoder, JsonEncoder};
use isaac_storage::{LocalFsError, LocalFsReader};
use isaac_types::{BlockItemType, BlockMap, Height};
use std::io::Read;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;

/// Raw item file, as stored at the source.
pub type ItemReader = Box<dyn Read + Send>;

/// Fetches block maps and raw item files from a peer.
#[async_trait]
pub trait BlockFetcher: Send + Sync {
    /// Block map at `height`; `None` when the source does not have it.
    async fn block_map(
        &self,
        cancel: CancellationToken,
        height: Height,
    ) -> Result<Option<BlockMap>, ImportError>;

    /// Item file `t` of `height`; `None` when the source does not have it.
    async fn item(
        &self,
        cancel: CancellationToken,
        height: Height,
        t: BlockItemType,
    ) -> Result<Option<ItemReader>, ImportError>;
}

/// Reads blocks from another local block directory, like a mounted mirror.
pub struct LocalFsFetcher<E: Encoder = JsonEncoder> {
    root: PathBuf,
    enc: E,
}

impl<E: Encoder> LocalFsFetcher<E> {
    pub fn new(root: impl Into<PathBuf>, enc: E) -> Self {
        Self {
            root: root.into(),
            enc,
        }
    }

    fn reader(&self, height: Height) -> Result<Option<LocalFsReader<E>>, ImportError> {
        match LocalFsReader::new(&self.root, height, self.enc.clone()) {
            Ok(r) => Ok(Some(r)),
            Err(LocalFsError::NotFound(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl<E: Encoder> BlockFetcher for LocalFsFetcher<E> {
    async fn block_map(
        &self,
        cancel: CancellationToken,
        height: Height,
    ) -> Result<Option<BlockMap>, ImportError> {
        if cancel.is_cancelled() {
            return Err(ImportError::Canceled);
        }
        match self.reader(height)? {
            Some(r) => Ok(Some(r.map()?)),
            None => Ok(None),
        }
    }

    async fn item(
        &self,
        cancel: CancellationToken,
        height: Height,
        t: BlockItemType,
    ) -> Result<Option<ItemReader>, ImportError> {
        if cancel.is_cancelled() {
            return Err(ImportError::Canceled);
        }
        let Some(r) = self.reader(height)? else {
            return Ok(None);
        };
        Ok(r.reader(t)?.map(|f| Box::new(f) as ItemReader))
    }
}
