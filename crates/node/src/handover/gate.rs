//! Handover negotiation.
//!
//! A handover moves the consensus seat of one node identity from a running
//! process (X) to a new one (Y):
//!
//! 1. An operator asks Y to start; Y checks X with `CheckHandover`
//! 2. Y asks X with `AskHandover`; X creates its broker and answers its id,
//!    or tells Y to take over right away when X is not voting
//! 3. The brokers exchange handover messages until X sends `Finish`
//!
//! [`HandoverGate`] runs the checks on both sides and routes incoming
//! handover messages to the broker they belong to.

use super::{HandoverXBroker, HandoverYBroker};
use crate::states::{sync_target, Event};
use crate::{HandoverError, StateType, States, SwitchContext};
use async_trait::async_trait;
use isaac_core::MessageSender;
use isaac_messages::{
    AskHandoverRequest, AskHandoverResponse, CheckHandoverRequest, HandoverAckResponse,
    HandoverMessage, StartHandoverRequest,
};
use isaac_types::{ConnInfo, NodeAddress};
use std::sync::Arc;
use tracing::{debug, info};

/// Requests Y makes to X.
#[async_trait]
pub trait HandoverTransport: Send + Sync {
    async fn check_handover(
        &self,
        x: &ConnInfo,
        request: CheckHandoverRequest,
    ) -> Result<HandoverAckResponse, HandoverError>;

    async fn ask_handover(
        &self,
        x: &ConnInfo,
        request: AskHandoverRequest,
    ) -> Result<AskHandoverResponse, HandoverError>;
}

/// Whether the node joined the membership layer.
pub type IsJoinedMemberlist = Arc<dyn Fn() -> bool + Send + Sync>;

/// Adds a peer to sync from.
pub type AddSyncSource = Arc<dyn Fn(&ConnInfo) + Send + Sync>;

fn move_consensus() -> AskHandoverResponse {
    AskHandoverResponse {
        id: String::new(),
        can_move_consensus: true,
    }
}

/// Gatekeeper of both handover sides of one process.
pub struct HandoverGate {
    states: Arc<States>,
    conn_info: ConnInfo,
    sender: Arc<dyn MessageSender>,
    transport: Arc<dyn HandoverTransport>,
    is_joined: IsJoinedMemberlist,
    add_sync_source: Option<AddSyncSource>,
}

impl HandoverGate {
    pub fn new(
        states: Arc<States>,
        conn_info: ConnInfo,
        sender: Arc<dyn MessageSender>,
        transport: Arc<dyn HandoverTransport>,
        is_joined: IsJoinedMemberlist,
    ) -> Self {
        Self {
            states,
            conn_info,
            sender,
            transport,
            is_joined,
            add_sync_source: None,
        }
    }

    pub fn with_sync_source(mut self, f: AddSyncSource) -> Self {
        self.add_sync_source = Some(f);
        self
    }

    fn check_identity(
        &self,
        node: &NodeAddress,
        peer: &ConnInfo,
    ) -> Result<(), HandoverError> {
        if node != self.states.local().address() {
            return Err(HandoverError::NotAllowed(format!(
                "handover for another node {node}"
            )));
        }
        if peer == &self.conn_info {
            return Err(HandoverError::NotAllowed(format!(
                "handover with itself, {}",
                peer.0
            )));
        }
        Ok(())
    }

    /// Y side: start a handover from the process at `request.x_conn_info`.
    pub async fn start_handover_y(
        &self,
        request: StartHandoverRequest,
    ) -> Result<(), HandoverError> {
        let x = request.x_conn_info;
        self.check_identity(&request.node, &x)?;
        if self.states.allow_consensus() {
            return Err(HandoverError::NotAllowed("consensus allowed".into()));
        }
        if self.states.handover_y().is_some() {
            return Err(HandoverError::NotAllowed("handover y already started".into()));
        }

        let ack = self
            .transport
            .check_handover(
                &x,
                CheckHandoverRequest::new(request.node.clone(), self.conn_info.clone()),
            )
            .await?;
        if !ack.ok {
            return Err(HandoverError::NotAllowed(
                ack.err.unwrap_or_else(|| "rejected by x".into()),
            ));
        }

        if let Some(f) = &self.add_sync_source {
            f(&x);
        }

        let asked = self
            .transport
            .ask_handover(
                &x,
                AskHandoverRequest::new(request.node, self.conn_info.clone()),
            )
            .await?;

        if asked.can_move_consensus {
            info!(x = %x.0, "x is not voting; moving to consensus");
            self.states.set_allow_consensus(true);
            self.nudge();
            return Ok(());
        }

        let events = self.states.events();
        let (e1, e2, e3) = (events.clone(), events.clone(), events);
        let broker = HandoverYBroker::new(
            self.states.handover_config().clone(),
            asked.id,
            x.clone(),
            self.sender.clone(),
            Arc::new(move |vp| {
                let _ = e1.send(Event::Voteproof(vp));
            }),
            Arc::new(move |ivp, proposal| {
                let _ = e2.send(Event::HandoverYFinished { ivp, proposal });
            }),
            Arc::new(move |_| {
                let _ = e3.send(Event::HandoverYCanceled);
            }),
        );
        info!(x = %x.0, id = broker.id(), "handover y started");
        self.states.set_handover_y(Some(Arc::new(broker)));
        self.nudge();
        Ok(())
    }

    /// X side: whether Y may ask for a handover.
    pub fn check_handover_x(&self, request: &CheckHandoverRequest) -> Result<(), HandoverError> {
        self.check_identity(&request.node, &request.y_conn_info)?;
        if !self.states.allow_consensus() {
            return Err(HandoverError::NotAllowed("consensus not allowed".into()));
        }
        if self.states.handover_x().is_some() {
            return Err(HandoverError::NotAllowed("handover x already started".into()));
        }
        if !(self.is_joined)() {
            return Err(HandoverError::NotAllowed("not joined memberlist".into()));
        }

        match self.states.current() {
            StateType::Syncing | StateType::Consensus | StateType::Joining | StateType::Booting => {
                Ok(())
            }
            state => Err(HandoverError::NotAllowed(format!("in {state} state"))),
        }
    }

    /// X side: Y asks for the handover. X leaves consensus to Y right away
    /// unless it is voting, in which case a broker is created.
    pub fn ask_handover_received(
        &self,
        request: &AskHandoverRequest,
    ) -> Result<AskHandoverResponse, HandoverError> {
        self.check_identity(&request.node, &request.y_conn_info)?;
        if !self.states.allow_consensus() {
            return Ok(move_consensus());
        }
        if self.states.handover_x().is_some() {
            return Err(HandoverError::NotAllowed("handover x already started".into()));
        }

        let state = self.states.current();
        if !matches!(
            state,
            StateType::Consensus | StateType::Joining | StateType::Booting
        ) {
            info!(%state, "not voting; leaving consensus to y");
            self.states.set_allow_consensus(false);
            return Ok(move_consensus());
        }

        let watch = self.states.subscribe();
        let events = self.states.events();
        let broker = HandoverXBroker::new(
            self.states.handover_config().clone(),
            self.states.local().clone(),
            request.y_conn_info.clone(),
            self.sender.clone(),
            Arc::new(move || Ok(*watch.borrow() == StateType::Consensus)),
            Arc::new(move |_| {
                let _ = events.send(Event::HandoverXCanceled);
            }),
        );
        let id = broker.id().to_string();
        info!(y = %request.y_conn_info.0, %id, "handover x started");
        self.states.set_handover_x(Some(Arc::new(broker)));

        Ok(AskHandoverResponse {
            id,
            can_move_consensus: false,
        })
    }

    /// Route a handover message to its broker.
    pub fn receive(&self, message: HandoverMessage) -> Result<(), HandoverError> {
        if let Some(x) = self.states.handover_x().filter(|x| x.id() == message.id) {
            return x.receive(message);
        }
        if let Some(y) = self.states.handover_y().filter(|y| y.id() == message.id) {
            return y.receive(message);
        }

        debug!(id = %message.id, kind = message.kind(), "handover message for no broker");
        Err(HandoverError::Ignore(format!(
            "no broker for handover {}",
            message.id
        )))
    }

    /// Cancel whichever brokers run.
    pub fn cancel(&self) {
        if let Some(x) = self.states.handover_x() {
            x.cancel(None);
        }
        if let Some(y) = self.states.handover_y() {
            y.cancel(None);
        }
    }

    fn nudge(&self) {
        let last = self.states.last_height();
        let height = self
            .states
            .last_voteproofs()
            .cap()
            .map(sync_target)
            .map_or(last, |h| h.max(last));
        if let Err(e) = self.states.ask_move_state(SwitchContext::Syncing { height }) {
            debug!(error = %e, "failed to ask syncing");
        }
    }
}
