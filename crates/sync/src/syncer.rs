//! [`Syncer`] over [`ImportBlocks`].

use crate::{ImportBlocks, ImportError};
use async_trait::async_trait;
use isaac_core::{Encoder, Syncer, SyncerError};
use isaac_types::Height;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::{watch, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

struct Progress {
    top: Height,
    error: Option<SyncerError>,
    done: bool,
}

/// Imports blocks from the last stored height up to a moving top.
///
/// [`Syncer::add`] raises the top; a background task imports the missing
/// range whenever the top moves past the stored height. An import error
/// stops the syncer; the error is kept for [`Syncer::error`]. The task runs
/// until the syncer stops or is canceled.
pub struct BlockSyncer<E: Encoder> {
    import: Arc<ImportBlocks<E>>,
    progress: Mutex<Progress>,
    finished_tx: watch::Sender<Height>,
    wake: Notify,
    cancel: CancellationToken,
}

impl<E: Encoder> BlockSyncer<E> {
    /// Start syncing up to `top`.
    pub fn start(import: Arc<ImportBlocks<E>>, top: Height) -> Arc<Self> {
        let last = import
            .permanent()
            .last_block_map()
            .map(|m| m.height())
            .unwrap_or(Height::NIL);
        let (finished_tx, _) = watch::channel(last);

        let syncer = Arc::new(Self {
            import,
            progress: Mutex::new(Progress {
                top: top.max(last),
                error: None,
                done: false,
            }),
            finished_tx,
            wake: Notify::new(),
            cancel: CancellationToken::new(),
        });

        let s = syncer.clone();
        tokio::spawn(async move { s.run().await });

        syncer
    }

    async fn run(&self) {
        loop {
            let last = *self.finished_tx.borrow();
            let top = self.progress.lock().top;

            if last < top {
                debug!(from = last.next().0, to = top.0, "syncing");
                if let Err(e) = self.import.import(self.cancel.clone(), last.next(), top).await {
                    self.stop(e);
                    return;
                }
                self.finished_tx.send_replace(top);
                continue;
            }

            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = self.wake.notified() => {}
            }
        }
    }

    fn stop(&self, e: ImportError) {
        let e = SyncerError::from(e);
        if e != SyncerError::Canceled {
            warn!(error = %e, "syncer stopped");
        }

        let mut progress = self.progress.lock();
        progress.done = true;
        progress.error.get_or_insert(e);
        drop(progress);

        self.cancel.cancel();
        // wake watchers so they read the error
        self.finished_tx.send_modify(|_| {});
    }
}

#[async_trait]
impl<E: Encoder> Syncer for BlockSyncer<E> {
    fn add(&self, height: Height) -> bool {
        let mut progress = self.progress.lock();
        if progress.done {
            return false;
        }
        if height > progress.top {
            progress.top = height;
            self.wake.notify_one();
        }
        true
    }

    fn top(&self) -> Height {
        self.progress.lock().top
    }

    fn finished(&self) -> watch::Receiver<Height> {
        self.finished_tx.subscribe()
    }

    fn is_finished(&self) -> (Height, bool) {
        let last = *self.finished_tx.borrow();
        (last, last == self.progress.lock().top)
    }

    fn error(&self) -> Option<SyncerError> {
        self.progress.lock().error.clone()
    }

    async fn cancel(&self) -> Result<(), SyncerError> {
        let mut progress = self.progress.lock();
        if progress.done {
            return Ok(());
        }
        progress.done = true;
        drop(progress);

        self.cancel.cancel();
        Ok(())
    }
}
