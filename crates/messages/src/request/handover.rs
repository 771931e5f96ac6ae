//! Handover negotiation requests.

use crate::response::{AskHandoverResponse, HandoverAckResponse};
use crate::{NetworkMessage, Request};
use isaac_types::{ConnInfo, NodeAddress};
use serde::{Deserialize, Serialize};

/// Asks the joining node (Y) to take over consensus from the node at
/// `x_conn_info`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartHandoverRequest {
    /// Node address shared by X and Y.
    pub node: NodeAddress,
    /// Where X listens.
    pub x_conn_info: ConnInfo,
}

impl StartHandoverRequest {
    /// Create a new start request.
    pub fn new(node: NodeAddress, x_conn_info: ConnInfo) -> Self {
        Self { node, x_conn_info }
    }
}

impl NetworkMessage for StartHandoverRequest {
    fn message_type_id() -> &'static str {
        "handover.start.request"
    }
}

impl Request for StartHandoverRequest {
    type Response = HandoverAckResponse;
}

/// Sent by Y to X before starting: can X hand over to `y_conn_info`?
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckHandoverRequest {
    /// Node address shared by X and Y.
    pub node: NodeAddress,
    /// Where Y listens.
    pub y_conn_info: ConnInfo,
}

impl CheckHandoverRequest {
    /// Create a new check request.
    pub fn new(node: NodeAddress, y_conn_info: ConnInfo) -> Self {
        Self { node, y_conn_info }
    }
}

impl NetworkMessage for CheckHandoverRequest {
    fn message_type_id() -> &'static str {
        "handover.check.request"
    }
}

impl Request for CheckHandoverRequest {
    type Response = HandoverAckResponse;
}

/// Sent by Y's broker to X to open a handover session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AskHandoverRequest {
    /// Node address shared by X and Y.
    pub node: NodeAddress,
    /// Where Y listens.
    pub y_conn_info: ConnInfo,
}

impl AskHandoverRequest {
    /// Create a new ask request.
    pub fn new(node: NodeAddress, y_conn_info: ConnInfo) -> Self {
        Self { node, y_conn_info }
    }
}

impl NetworkMessage for AskHandoverRequest {
    fn message_type_id() -> &'static str {
        "handover.ask.request"
    }
}

impl Request for AskHandoverRequest {
    type Response = AskHandoverResponse;
}
