//! Broken: the node stopped voting after a failure. It keeps mimicking
//! ballots so it is not expelled, and leaves only on request.

use super::{Ctx, Handler, StateType, SwitchContext, SwitchResult};
use async_trait::async_trait;
use tracing::error;

pub(crate) struct BrokenHandler {
    ctx: Ctx,
}

impl BrokenHandler {
    pub(crate) fn new(ctx: Ctx) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl Handler for BrokenHandler {
    fn state(&self) -> StateType {
        StateType::Broken
    }

    async fn enter(&mut self, from: StateType, sctx: SwitchContext) -> SwitchResult {
        if let SwitchContext::Broken { err } = &sctx {
            error!(%from, err = %err, "node broken");
        }

        let args = &self.ctx.args;
        args.broadcaster.stop_timers();
        args.processors.cancel().await;
        args.stuck.clean();
        args.mimic.start();
        Ok(None)
    }

    async fn exit(&mut self, _to: &SwitchContext) {
        self.ctx.args.mimic.stop();
    }
}
