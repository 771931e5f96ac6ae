//! Syncing: fetch blocks up to a target, then join when allowed.

use super::{sync_target, Ctx, Event, Handler, StateType, SwitchContext, SwitchResult};
use crate::StatesError;
use async_trait::async_trait;
use isaac_core::{Syncer, SyncerError};
use isaac_types::{Height, Voteproof};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub(crate) struct SyncingHandler {
    ctx: Ctx,
    cancel: CancellationToken,
    syncer: Option<Arc<dyn Syncer>>,
}

impl SyncingHandler {
    pub(crate) fn new(ctx: Ctx) -> Self {
        Self {
            ctx,
            cancel: CancellationToken::new(),
            syncer: None,
        }
    }

    fn start_syncer(&mut self, height: Height) -> Result<(), StatesError> {
        let syncer = (self.ctx.args.new_syncer)(height)?;
        let mut finished = syncer.finished();
        let cancel = self.cancel.clone();
        let ctx = self.ctx.clone();
        let watched = syncer.clone();

        tokio::spawn(async move {
            loop {
                if let Some(e) = watched.error() {
                    ctx.send_event(Event::SyncFailed(e));
                    return;
                }
                let height = *finished.borrow_and_update();
                ctx.send_event(Event::SyncFinished(height));

                tokio::select! {
                    _ = cancel.cancelled() => return,
                    changed = finished.changed() => {
                        if changed.is_err() {
                            if let Some(e) = watched.error() {
                                ctx.send_event(Event::SyncFailed(e));
                            }
                            return;
                        }
                    }
                }
            }
        });

        debug!(%height, "syncer started");
        self.syncer = Some(syncer);
        Ok(())
    }

    fn add(&mut self, height: Height) -> Result<(), StatesError> {
        match &self.syncer {
            Some(s) if s.add(height) => Ok(()),
            _ => self.start_syncer(height),
        }
    }

    fn after_synced(&self) -> SwitchResult {
        let Some(syncer) = &self.syncer else {
            return Ok(None);
        };
        let (height, done) = syncer.is_finished();
        if !done {
            return Ok(None);
        }

        if !self.ctx.allow_consensus() {
            if self.ctx.handover_y().is_some() {
                return Ok(Some(SwitchContext::Handover {
                    vp: self.ctx.last_voteproofs().cap().cloned(),
                }));
            }
            return Ok(None);
        }
        if !self.ctx.in_suffrage(height.next())? {
            debug!(%height, "synced, but not in suffrage; keep following");
            return Ok(None);
        }

        info!(%height, "synced; joining");
        Ok(Some(SwitchContext::Joining {
            vp: self.ctx.last_voteproofs().cap().cloned(),
        }))
    }
}

#[async_trait]
impl Handler for SyncingHandler {
    fn state(&self) -> StateType {
        StateType::Syncing
    }

    async fn enter(&mut self, from: StateType, sctx: SwitchContext) -> SwitchResult {
        let SwitchContext::Syncing { height } = sctx else {
            return Err(StatesError::WrongSwitch {
                from,
                to: sctx.state(),
            });
        };

        let args = &self.ctx.args;
        args.broadcaster.stop_timers();
        args.processors.cancel().await;
        args.stuck.clean();
        args.mimic.start();

        self.start_syncer(height)?;
        Ok(None)
    }

    async fn exit(&mut self, _to: &SwitchContext) {
        self.cancel.cancel();
        if let Some(syncer) = self.syncer.take() {
            if let Err(e) = syncer.cancel().await {
                warn!(error = %e, "failed to cancel syncer");
            }
        }
        self.ctx.args.mimic.stop();
    }

    async fn new_voteproof(&mut self, vp: Voteproof) -> SwitchResult {
        let target = sync_target(&vp);
        if matches!(&self.syncer, Some(s) if target > s.top()) {
            self.add(target)?;
        }
        Ok(None)
    }

    async fn on_event(&mut self, event: Event) -> SwitchResult {
        match event {
            Event::SyncFinished(_) => self.after_synced(),
            Event::SyncFailed(SyncerError::Canceled) => Ok(None),
            Event::SyncFailed(e) => Err(e.into()),
            _ => Ok(None),
        }
    }

    async fn reenter(&mut self, sctx: SwitchContext) -> SwitchResult {
        if let SwitchContext::Syncing { height } = sctx {
            self.add(height)?;
        }
        self.after_synced()
    }
}
