//! Capability traits.

use crate::{OutboundMessage, ProcessorError, SendError, SuffrageError, SyncerError};
use async_trait::async_trait;
use isaac_types::{
    BlockMap, Hash, Height, Manifest, Point, ProposalSignFact, Suffrage, Voteproof,
};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

/// Executes one proposal and persists the resulting block.
///
/// A processor is created per proposal. The state machine drives it through
/// two steps:
///
/// - **process**: after a majority INIT voteproof, execute the proposal on top
///   of the previous block and return the new [`Manifest`]; its hash is what
///   the node votes for in its ACCEPT ballot
/// - **save**: after a majority ACCEPT voteproof, write the block and return
///   its signed [`BlockMap`]
///
/// # Errors
///
/// - [`ProcessorError::EmptyOperations`] from `process`: the node votes an
///   empty-operations ACCEPT fact
/// - [`ProcessorError::NotProposalProcessorProcessed`] from `save`: the
///   voteproof is not for the processed proposal
/// - [`ProcessorError::AlreadySaved`] from `save`: treated as success
///
/// # Example
///
/// ```ignore
/// let manifest = processor.process(cancel.clone(), &ivp).await?;
/// // ... broadcast ACCEPT ballot for manifest.hash(), collect votes ...
/// let map = processor.save(cancel, &avp).await?;
/// ```
#[async_trait]
pub trait ProposalProcessor: Send + Sync {
    /// Proposal being processed.
    fn proposal(&self) -> &ProposalSignFact;

    /// Execute the proposal.
    async fn process(
        &self,
        cancel: CancellationToken,
        ivp: &Voteproof,
    ) -> Result<Manifest, ProcessorError>;

    /// Persist the block finalized by `avp`.
    async fn save(
        &self,
        cancel: CancellationToken,
        avp: &Voteproof,
    ) -> Result<BlockMap, ProcessorError>;

    /// Abort processing and discard anything staged.
    async fn cancel(&self) -> Result<(), ProcessorError>;
}

/// Creates proposal processors and supplies their inputs.
#[async_trait]
pub trait ProcessorFactory: Send + Sync {
    /// Proposal with the given fact hash, from the local pool or from peers.
    async fn proposal(
        &self,
        cancel: CancellationToken,
        hash: &Hash,
    ) -> Result<ProposalSignFact, ProcessorError>;

    /// Manifest of the stored block at `height`; `None` below genesis.
    async fn manifest(&self, height: Height) -> Result<Option<Manifest>, ProcessorError>;

    /// Processor for `proposal` on top of `previous`.
    fn new_processor(
        &self,
        proposal: ProposalSignFact,
        previous: Option<Manifest>,
    ) -> Result<Arc<dyn ProposalProcessor>, ProcessorError>;
}

/// Picks the proposal a node votes for in its INIT ballot.
#[async_trait]
pub trait ProposalSelector: Send + Sync {
    /// Proposal for `point` on top of `previous_block`.
    ///
    /// [`ProcessorError::NotFound`] means no proposer produced anything; the
    /// node then votes an empty-proposal INIT fact.
    async fn select(
        &self,
        cancel: CancellationToken,
        point: Point,
        previous_block: Option<Hash>,
    ) -> Result<ProposalSignFact, ProcessorError>;
}

/// Consensus nodes allowed to vote at a height.
///
/// Called from inside the ballotbox counting path, so implementations must not
/// call back into the ballotbox.
pub trait SuffrageProvider: Send + Sync {
    /// Suffrage at `height`; `None` when it is not known yet.
    fn suffrage(&self, height: Height) -> Result<Option<Suffrage>, SuffrageError>;
}

/// The same suffrage at every height.
#[derive(Debug, Clone)]
pub struct StaticSuffrage(pub Suffrage);

impl SuffrageProvider for StaticSuffrage {
    fn suffrage(&self, _height: Height) -> Result<Option<Suffrage>, SuffrageError> {
        Ok(Some(self.0.clone()))
    }
}

/// Hands messages to the membership layer; fire-and-forget.
pub trait MessageSender: Send + Sync {
    /// Queue `message` for delivery.
    fn send(&self, message: OutboundMessage) -> Result<(), SendError>;
}

impl MessageSender for mpsc::UnboundedSender<OutboundMessage> {
    fn send(&self, message: OutboundMessage) -> Result<(), SendError> {
        mpsc::UnboundedSender::send(self, message).map_err(|_| SendError::Closed)
    }
}

/// Catches the local node up to a target height.
#[async_trait]
pub trait Syncer: Send + Sync {
    /// Raise the target height. Returns `false` once the syncer is done or
    /// canceled.
    fn add(&self, height: Height) -> bool;

    /// Current target height.
    fn top(&self) -> Height;

    /// Last synced height, updated as blocks are stored.
    fn finished(&self) -> watch::Receiver<Height>;

    /// Last synced height and whether it equals the target.
    fn is_finished(&self) -> (Height, bool);

    /// Error that stopped the syncer, if any.
    fn error(&self) -> Option<SyncerError>;

    /// Stop syncing.
    async fn cancel(&self) -> Result<(), SyncerError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use isaac_messages::BallotGossip;
    use isaac_test_helpers::{init_ballot, make_nodes, make_suffrage, point};

    #[test]
    fn test_static_suffrage() {
        let nodes = make_nodes(3);
        let provider = StaticSuffrage(make_suffrage(&nodes));

        let s = provider.suffrage(Height(33)).unwrap().unwrap();
        assert_eq!(s.len(), 3);
        assert!(s.exists(nodes[2].address()));
    }

    #[tokio::test]
    async fn test_channel_sender() {
        let nodes = make_nodes(1);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sender: Arc<dyn MessageSender> = Arc::new(tx);

        let ballot = init_ballot(&nodes[0], point(33, 0), &nodes);
        sender
            .send(OutboundMessage::Ballot(Box::new(BallotGossip::new(ballot))))
            .unwrap();

        let received = rx.recv().await.unwrap();
        assert_eq!(received.type_name(), "Ballot");
        assert!(received.is_broadcast());

        drop(rx);
        let ballot = init_ballot(&nodes[0], point(34, 0), &nodes);
        assert_eq!(
            sender
                .send(OutboundMessage::Ballot(Box::new(BallotGossip::new(ballot))))
                .unwrap_err(),
            SendError::Closed
        );
    }
}
