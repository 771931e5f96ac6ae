//! Imports a range of blocks in batches.
//!
//! For every batch of `batch_limit` heights:
//!
//! 1. fetch the block maps of the batch at once and check them against the
//!    chain built so far
//! 2. fetch every listed item of every block through a bounded
//!    [`ErrgroupWorker`], streaming each into its [`BlockImporter`]
//! 3. save the blocks in height order
//!
//! The write databases of a saved batch are merged into the permanent
//! database before the next batch starts, so an interrupted import resumes
//! from the last merged height. When a save fails midway, the blocks already
//! published in that batch are merged too, keeping the block directory and
//! the permanent database at the same height. After the last batch the
//! voteproofs of the top block are handed to the state machine. Any error
//! cancels the whole import and removes what the unsaved importers staged.

use crate::{BlockFetcher, BlockImporter, ImportError, SyncConfig};
use isaac_core::{Encoder, JsonEncoder};
use isaac_storage::{
    BlockWriteDatabase, LocalFsReader, MemoryBlockWriteDatabase, PermanentDatabase,
};
use isaac_types::{BlockItemType, BlockMap, Height, NetworkId, Voteproof};
use isaac_util::ErrgroupWorker;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Creates the write database of a height.
pub type NewWriteDatabase = Arc<dyn Fn(Height) -> Arc<dyn BlockWriteDatabase> + Send + Sync>;

/// Receives the INIT and ACCEPT voteproofs of the last imported block.
pub type SetLastVoteproofs =
    Arc<dyn Fn(Voteproof, Voteproof) -> Result<(), ImportError> + Send + Sync>;

/// Block range importer.
pub struct ImportBlocks<E: Encoder = JsonEncoder> {
    root: PathBuf,
    enc: E,
    network_id: NetworkId,
    config: SyncConfig,
    fetcher: Arc<dyn BlockFetcher>,
    permanent: Arc<dyn PermanentDatabase>,
    new_write_database: NewWriteDatabase,
    set_last_voteproofs: SetLastVoteproofs,
}

impl<E: Encoder> ImportBlocks<E> {
    /// Importer into the block directory `root` and `permanent`, with
    /// in-memory write databases.
    pub fn new(
        root: impl Into<PathBuf>,
        enc: E,
        network_id: NetworkId,
        config: SyncConfig,
        fetcher: Arc<dyn BlockFetcher>,
        permanent: Arc<dyn PermanentDatabase>,
    ) -> Self {
        Self {
            root: root.into(),
            enc,
            network_id,
            config,
            fetcher,
            permanent,
            new_write_database: Arc::new(|height| {
                Arc::new(MemoryBlockWriteDatabase::new(height)) as Arc<dyn BlockWriteDatabase>
            }),
            set_last_voteproofs: Arc::new(|_, _| Ok(())),
        }
    }

    pub fn with_write_database(mut self, f: NewWriteDatabase) -> Self {
        self.new_write_database = f;
        self
    }

    pub fn with_set_last_voteproofs(mut self, f: SetLastVoteproofs) -> Self {
        self.set_last_voteproofs = f;
        self
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn permanent(&self) -> &Arc<dyn PermanentDatabase> {
        &self.permanent
    }

    /// Import `from..=to`. An empty range does nothing.
    pub async fn import(
        &self,
        cancel: CancellationToken,
        from: Height,
        to: Height,
    ) -> Result<(), ImportError> {
        if to < from {
            return Ok(());
        }
        info!(from = from.0, to = to.0, "importing blocks");

        let mut previous = if from > Height::GENESIS {
            self.permanent.block_map(from.prev())
        } else {
            None
        };

        let mut start = from;
        while start <= to {
            if cancel.is_cancelled() {
                return Err(ImportError::Canceled);
            }

            let end = Height((start.0 + self.config.batch_limit as i64 - 1).min(to.0));
            self.import_batch(cancel.clone(), start, end, &mut previous)
                .await?;

            start = end.next();
        }

        let reader = LocalFsReader::new(&self.root, to, self.enc.clone())?;
        let (ivp, avp) = reader
            .voteproofs()?
            .ok_or_else(|| ImportError::NotFound(format!("voteproofs of {to}")))?;
        (self.set_last_voteproofs)(ivp, avp)?;

        info!(from = from.0, to = to.0, "blocks imported");
        Ok(())
    }

    async fn import_batch(
        &self,
        cancel: CancellationToken,
        from: Height,
        to: Height,
        previous: &mut Option<BlockMap>,
    ) -> Result<(), ImportError> {
        let maps = futures::future::try_join_all(
            (from.0..=to.0).map(|h| self.fetch_block_map(cancel.clone(), Height(h))),
        )
        .await?;

        for map in &maps {
            self.check_block_map(previous.as_ref(), map)?;
            *previous = Some(map.clone());
        }

        let mut importers = Vec::with_capacity(maps.len());
        for map in maps {
            let bwdb = (self.new_write_database)(map.height());
            match BlockImporter::new(
                &self.root,
                map,
                self.enc.clone(),
                self.network_id.clone(),
                bwdb,
                self.config.database_batch_limit,
            ) {
                Ok(imp) => importers.push(Arc::new(imp)),
                Err(e) => {
                    cancel_imports(&importers);
                    return Err(e);
                }
            }
        }

        if let Err(e) = self.fetch_items(cancel, &importers).await {
            cancel_imports(&importers);
            return Err(e);
        }

        for (i, imp) in importers.iter().enumerate() {
            if let Err(e) = imp.save() {
                cancel_imports(&importers[i..]);
                // Blocks before `i` are published; keep them so a retry
                // resumes right after them.
                self.merge(&importers[..i])?;
                warn!(height = imp.height().0, error = %e, "failed to save imported block");
                return Err(e);
            }
        }
        self.merge(&importers)?;

        debug!(from = from.0, to = to.0, "batch imported");
        Ok(())
    }

    fn merge(&self, importers: &[Arc<BlockImporter<E>>]) -> Result<(), ImportError> {
        for imp in importers {
            self.permanent.merge(imp.written()?)?;
        }
        Ok(())
    }

    async fn fetch_items(
        &self,
        cancel: CancellationToken,
        importers: &[Arc<BlockImporter<E>>],
    ) -> Result<(), ImportError> {
        let worker = ErrgroupWorker::<ImportError>::with_cancel(
            self.config.max_parallel_fetches,
            cancel,
        );

        let mut scheduled = Ok(());
        'schedule: for imp in importers {
            for t in BlockItemType::ITEMS {
                if imp.map().item(t).is_none() {
                    continue;
                }

                let imp = imp.clone();
                let fetcher = self.fetcher.clone();
                let config = self.config.clone();
                let job = worker.new_job(move |cancel| async move {
                    let height = imp.height();
                    let r = with_retry(&config, height, || {
                        fetch_with_timeout(&config, height, fetcher.item(cancel.clone(), height, t))
                    })
                    .await?
                    .ok_or_else(|| ImportError::NotFound(format!("{t} of {height}")))?;

                    tokio::task::spawn_blocking(move || imp.write_item(t, r))
                        .await
                        .map_err(|e| ImportError::Fetch(format!("write {t}: {e}")))?
                });
                if let Err(e) = job.await {
                    scheduled = Err(e);
                    break 'schedule;
                }
            }
        }

        // A failed job stops scheduling; its error wins over the worker's.
        worker.wait().await?;
        Ok(scheduled?)
    }

    async fn fetch_block_map(
        &self,
        cancel: CancellationToken,
        height: Height,
    ) -> Result<BlockMap, ImportError> {
        with_retry(&self.config, height, || {
            fetch_with_timeout(
                &self.config,
                height,
                self.fetcher.block_map(cancel.clone(), height),
            )
        })
        .await?
        .ok_or_else(|| ImportError::NotFound(format!("block map of {height}")))
    }

    /// Signed by a known producer, at the right height, and chained on the
    /// previous block.
    fn check_block_map(
        &self,
        previous: Option<&BlockMap>,
        map: &BlockMap,
    ) -> Result<(), ImportError> {
        map.is_valid(&self.network_id)?;

        let Some(prev) = previous else {
            return Ok(());
        };
        if map.height() != prev.height().next() {
            return Err(ImportError::WrongBlockMap {
                height: map.height(),
                reason: format!("expected height {}", prev.height().next()),
            });
        }
        if map.manifest.previous != Some(prev.manifest.hash()) {
            return Err(ImportError::WrongBlockMap {
                height: map.height(),
                reason: "previous block does not match".into(),
            });
        }
        Ok(())
    }
}

fn cancel_imports<E: Encoder>(importers: &[Arc<BlockImporter<E>>]) {
    for imp in importers {
        if let Err(e) = imp.cancel_import() {
            warn!(height = imp.height().0, error = %e, "failed to cancel import");
        }
    }
}

async fn fetch_with_timeout<T>(
    config: &SyncConfig,
    height: Height,
    f: impl Future<Output = Result<T, ImportError>>,
) -> Result<T, ImportError> {
    tokio::time::timeout(config.fetch_timeout, f)
        .await
        .map_err(|_| ImportError::Timeout(height))?
}

async fn with_retry<T, F, Fut>(
    config: &SyncConfig,
    height: Height,
    mut f: F,
) -> Result<T, ImportError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ImportError>>,
{
    let mut retries = 0;
    loop {
        match f().await {
            Err(e) if e.is_retryable() && retries < config.max_retries_per_block => {
                retries += 1;
                debug!(height = height.0, retries, error = %e, "retrying fetch");
                tokio::time::sleep(config.retry_interval).await;
            }
            other => return other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use crate::ItemReader;
    use isaac_storage::MemoryPermanentDatabase;
    use isaac_test_helpers::network_id;
    use parking_lot::Mutex;
    use std::time::Duration;
    use tempfile::TempDir;

    struct FailingFetcher {
        calls: Mutex<usize>,
    }

    #[async_trait]
    impl BlockFetcher for FailingFetcher {
        async fn block_map(
            &self,
            _cancel: CancellationToken,
            _height: Height,
        ) -> Result<Option<BlockMap>, ImportError> {
            *self.calls.lock() += 1;
            Err(ImportError::Fetch("unreachable".into()))
        }

        async fn item(
            &self,
            _cancel: CancellationToken,
            _height: Height,
            _t: BlockItemType,
        ) -> Result<Option<ItemReader>, ImportError> {
            Ok(None)
        }
    }

    #[tokio::test]
    async fn test_fetch_retries_then_fails() {
        let dir = TempDir::new().unwrap();
        let fetcher = Arc::new(FailingFetcher {
            calls: Mutex::new(0),
        });
        let import = ImportBlocks::new(
            dir.path(),
            JsonEncoder,
            network_id(),
            SyncConfig::default().with_retries(2, Duration::from_millis(1)),
            fetcher.clone(),
            Arc::new(MemoryPermanentDatabase::new()),
        );

        let err = import
            .import(CancellationToken::new(), Height(0), Height(0))
            .await
            .unwrap_err();
        assert!(matches!(err, ImportError::Fetch(_)));
        assert_eq!(*fetcher.calls.lock(), 3);
    }

    #[tokio::test]
    async fn test_empty_range() {
        let dir = TempDir::new().unwrap();
        let import = ImportBlocks::new(
            dir.path(),
            JsonEncoder,
            network_id(),
            SyncConfig::default(),
            Arc::new(FailingFetcher {
                calls: Mutex::new(0),
            }),
            Arc::new(MemoryPermanentDatabase::new()),
        );

        import
            .import(CancellationToken::new(), Height(3), Height(2))
            .await
            .unwrap();
    }
}
