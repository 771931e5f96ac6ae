//! Joining: the node has the last block and waits for the network's next
//! INIT majority to start voting.

use super::{sync_target, Ctx, Handler, StateType, SwitchContext, SwitchResult};
use crate::StatesError;
use async_trait::async_trait;
use isaac_types::{Height, Point, Round, Stage, Voteproof};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub(crate) struct JoiningHandler {
    ctx: Ctx,
    cancel: CancellationToken,
}

impl JoiningHandler {
    pub(crate) fn new(ctx: Ctx) -> Self {
        Self {
            ctx,
            cancel: CancellationToken::new(),
        }
    }

    fn next_round(&self, vp: Voteproof) {
        let point = vp.stage_point().point.next_round();
        let previous = self.ctx.last_block_map().map(|m| m.manifest.hash());
        self.ctx
            .prepare_init_ballot(self.cancel.child_token(), point, previous, vp, Duration::ZERO);
    }
}

#[async_trait]
impl Handler for JoiningHandler {
    fn state(&self) -> StateType {
        StateType::Joining
    }

    async fn enter(&mut self, from: StateType, sctx: SwitchContext) -> SwitchResult {
        let SwitchContext::Joining { vp } = sctx else {
            return Err(StatesError::WrongSwitch {
                from,
                to: sctx.state(),
            });
        };
        self.ctx.args.mimic.stop();

        let Some(last) = self.ctx.last_block_map() else {
            return Ok(Some(SwitchContext::Syncing {
                height: Height::GENESIS,
            }));
        };
        if !self.ctx.in_suffrage(last.height().next())? {
            return Ok(Some(SwitchContext::Syncing {
                height: last.height(),
            }));
        }

        match vp.or_else(|| self.ctx.last_voteproofs().cap().cloned()) {
            Some(vp) => self.new_voteproof(vp).await,
            None => Ok(None),
        }
    }

    async fn exit(&mut self, _to: &SwitchContext) {
        self.cancel.cancel();
        self.ctx.args.broadcaster.stop_timers();
    }

    async fn new_voteproof(&mut self, vp: Voteproof) -> SwitchResult {
        let last = self.ctx.last_block_map();
        let last_height = last.as_ref().map(|m| m.height()).unwrap_or(Height::NIL);
        let last_block = last.as_ref().map(|m| m.manifest.hash());
        let expected = last_height.next();
        let height = vp.stage_point().height();

        match (vp.stage(), vp.majority()) {
            (Stage::Accept, Some(_)) if height == last_height => {
                debug!(%height, "last block finalized; preparing next INIT ballot");
                let point = Point::new(expected, Round(0));
                let wait = self.ctx.args.params.wait_preparing_init_ballot;
                self.ctx
                    .prepare_init_ballot(self.cancel.child_token(), point, last_block, vp, wait);
                Ok(None)
            }
            _ if height < expected => Ok(None),
            _ if height > expected => Ok(Some(SwitchContext::Syncing {
                height: sync_target(&vp),
            })),
            (Stage::Init, Some(fact)) => {
                if fact.previous_block() != last_block {
                    debug!(%height, "INIT majority on another previous block; syncing");
                    return Ok(Some(SwitchContext::Syncing { height: last_height }));
                }
                Ok(Some(SwitchContext::Consensus { ivp: vp }))
            }
            (Stage::Accept, Some(_)) => Ok(Some(SwitchContext::Syncing { height })),
            (_, None) => {
                self.next_round(vp);
                Ok(None)
            }
        }
    }
}
