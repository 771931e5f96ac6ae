//! Stopped: no voting, no syncing. Only `Booting` or `Broken` follow.

use super::{Ctx, Handler, StateType, SwitchContext, SwitchResult};
use async_trait::async_trait;

pub(crate) struct StoppedHandler {
    ctx: Ctx,
}

impl StoppedHandler {
    pub(crate) fn new(ctx: Ctx) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl Handler for StoppedHandler {
    fn state(&self) -> StateType {
        StateType::Stopped
    }

    async fn enter(&mut self, _from: StateType, _sctx: SwitchContext) -> SwitchResult {
        let args = &self.ctx.args;
        args.broadcaster.stop_timers();
        args.processors.cancel().await;
        args.stuck.clean();
        args.mimic.stop();
        Ok(None)
    }

    async fn exit(&mut self, _to: &SwitchContext) {}
}
