//! Proposal processor wrapper.
//!
//! Holds the one active [`ProposalProcessor`]. Starting another proposal
//! cancels the active one first; `save` only succeeds for the proposal that
//! went through `process`.

use isaac_core::{ProcessorError, ProcessorFactory, ProposalProcessor};
use isaac_types::{BlockMap, Hash, Manifest, Point, Voteproof};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

struct Active {
    proposal: Hash,
    processor: Arc<dyn ProposalProcessor>,
    manifest: Option<Manifest>,
}

/// Runs proposals through processors created by a [`ProcessorFactory`].
pub struct ProposalProcessors {
    factory: Arc<dyn ProcessorFactory>,
    retry_limit: usize,
    retry_interval: Duration,
    active: tokio::sync::Mutex<Option<Active>>,
}

impl ProposalProcessors {
    pub fn new(
        factory: Arc<dyn ProcessorFactory>,
        retry_limit: usize,
        retry_interval: Duration,
    ) -> Self {
        Self {
            factory,
            retry_limit: retry_limit.max(1),
            retry_interval,
            active: tokio::sync::Mutex::new(None),
        }
    }

    /// Hash of the active proposal and its manifest once processed.
    pub async fn processed(&self) -> Option<(Hash, Option<Manifest>)> {
        self.active
            .lock()
            .await
            .as_ref()
            .map(|a| (a.proposal, a.manifest.clone()))
    }

    /// Process the proposal `proposal_hash` at `point`.
    ///
    /// Processing the same proposal again returns the stored manifest.
    pub async fn process(
        &self,
        cancel: CancellationToken,
        point: Point,
        proposal_hash: Hash,
        previous: Option<Manifest>,
        ivp: &Voteproof,
    ) -> Result<Manifest, ProcessorError> {
        let mut active = self.active.lock().await;

        if let Some(a) = active.as_ref() {
            if a.proposal == proposal_hash {
                if let Some(m) = &a.manifest {
                    return Ok(m.clone());
                }
            }
        }
        if let Some(old) = active.take() {
            debug!(proposal = %old.proposal, "cancel previous processor");
            if let Err(e) = old.processor.cancel().await {
                warn!(error = %e, "failed to cancel previous processor");
            }
        }

        let proposal = self
            .retry(&cancel, || self.factory.proposal(cancel.clone(), &proposal_hash))
            .await?;
        if proposal.fact.point != point {
            return Err(ProcessorError::Invalid(isaac_types::ValidationError::invalid(
                "proposal",
                format!("proposal for {} used at {}", proposal.fact.point, point),
            )));
        }

        let processor = self.factory.new_processor(proposal, previous)?;
        *active = Some(Active {
            proposal: proposal_hash,
            processor: processor.clone(),
            manifest: None,
        });

        let result = self
            .retry(&cancel, || processor.process(cancel.clone(), ivp))
            .await;

        match result {
            Ok(manifest) => {
                if let Some(a) = active.as_mut() {
                    a.manifest = Some(manifest.clone());
                }
                Ok(manifest)
            }
            Err(ProcessorError::EmptyOperations) => Err(ProcessorError::EmptyOperations),
            Err(e) => {
                if let Some(a) = active.take() {
                    let _ = a.processor.cancel().await;
                }
                Err(e)
            }
        }
    }

    /// Save the block of the processed proposal `proposal_hash`.
    pub async fn save(
        &self,
        cancel: CancellationToken,
        proposal_hash: Hash,
        avp: &Voteproof,
    ) -> Result<BlockMap, ProcessorError> {
        let mut active = self.active.lock().await;

        let processor = match active.as_ref() {
            Some(a) if a.proposal == proposal_hash && a.manifest.is_some() => a.processor.clone(),
            _ => return Err(ProcessorError::NotProposalProcessorProcessed),
        };

        let result = self
            .retry(&cancel, || processor.save(cancel.clone(), avp))
            .await;

        match result {
            Ok(map) => {
                *active = None;
                Ok(map)
            }
            Err(ProcessorError::AlreadySaved) => {
                *active = None;
                Err(ProcessorError::AlreadySaved)
            }
            Err(e) => Err(e),
        }
    }

    /// Cancel and drop the active processor.
    pub async fn cancel(&self) {
        if let Some(a) = self.active.lock().await.take() {
            if let Err(e) = a.processor.cancel().await {
                warn!(proposal = %a.proposal, error = %e, "failed to cancel processor");
            }
        }
    }

    async fn retry<T, F, Fut>(&self, cancel: &CancellationToken, mut f: F) -> Result<T, ProcessorError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ProcessorError>>,
    {
        let mut attempt = 0;
        loop {
            if cancel.is_cancelled() {
                return Err(ProcessorError::Canceled);
            }

            let err = tokio::select! {
                _ = cancel.cancelled() => return Err(ProcessorError::Canceled),
                r = f() => match r {
                    Ok(v) => return Ok(v),
                    Err(e) if e.is_retryable() => e,
                    Err(e) => return Err(e),
                },
            };

            attempt += 1;
            if attempt >= self.retry_limit {
                return Err(err);
            }
            debug!(attempt, error = %err, "retry processor call");

            tokio::select! {
                _ = cancel.cancelled() => return Err(ProcessorError::Canceled),
                _ = tokio::time::sleep(self.retry_interval) => {}
            }
        }
    }
}
