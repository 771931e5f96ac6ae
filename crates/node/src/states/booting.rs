//! Booting: decide where a starting node goes.

use super::{Ctx, Handler, StateType, SwitchContext, SwitchResult};
use crate::StatesError;
use async_trait::async_trait;
use isaac_types::Height;
use tracing::debug;

pub(crate) struct BootingHandler {
    ctx: Ctx,
}

impl BootingHandler {
    pub(crate) fn new(ctx: Ctx) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl Handler for BootingHandler {
    fn state(&self) -> StateType {
        StateType::Booting
    }

    async fn enter(&mut self, from: StateType, sctx: SwitchContext) -> SwitchResult {
        if !matches!(sctx, SwitchContext::Booting) {
            return Err(StatesError::WrongSwitch {
                from,
                to: sctx.state(),
            });
        }

        let Some(last) = self.ctx.last_block_map() else {
            debug!("empty storage; sync from genesis");
            return Ok(Some(SwitchContext::Syncing {
                height: Height::GENESIS,
            }));
        };

        let next = last.height().next();
        if !self.ctx.in_suffrage(next)? {
            debug!(height = %next, "not in suffrage; syncing");
            return Ok(Some(SwitchContext::Syncing {
                height: last.height(),
            }));
        }

        Ok(Some(SwitchContext::Joining {
            vp: self.ctx.last_voteproofs().cap().cloned(),
        }))
    }

    async fn exit(&mut self, _to: &SwitchContext) {}
}
