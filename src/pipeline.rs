//! Stage handlers and the generic runner that binds each one to its inbound queue.
//!
//! `order.created` → [`ProcessingHandler`] → `order.enrichment.requested` →
//! [`EnrichmentHandler`] → `order.enriched` → [`FinalizationHandler`].

pub mod enrichment;
pub mod finalization;
pub mod processing;
pub mod retry;
pub mod runner;

use std::fmt;

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

use crate::broker::{BrokerError, Delivery, Route};
use crate::store::models::{OrderStatus, StatusTransition, TransitionOutcome};

pub use enrichment::{EnrichmentError, EnrichmentHandler, EnrichmentProvider, SimulatedEnrichment};
pub use finalization::FinalizationHandler;
pub use processing::ProcessingHandler;
pub use retry::{RetryPolicy, RetryState};
pub use runner::PipelineRunner;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Processing,
    Enrichment,
    Finalization,
}

impl Stage {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Processing => "processing",
            Stage::Enrichment => "enrichment",
            Stage::Finalization => "finalization",
        }
    }

    /// Queue this stage consumes from.
    #[must_use]
    pub fn inbound_route(self) -> Route {
        match self {
            Stage::Processing => Route::OrderCreated,
            Stage::Enrichment => Route::EnrichmentRequested,
            Stage::Finalization => Route::OrderEnriched,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum StageError {
    #[error("malformed order event: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("order store failure: {0:#}")]
    Store(#[source] anyhow::Error),
    #[error(transparent)]
    Publish(#[from] BrokerError),
    #[error("order {order_id} not found")]
    OrderNotFound { order_id: Uuid },
    #[error("order {order_id} cannot move to {target} from {current}")]
    InvalidTransition {
        order_id: Uuid,
        current: OrderStatus,
        target: OrderStatus,
    },
    #[error(transparent)]
    Enrichment(#[from] EnrichmentError),
}

impl StageError {
    /// Maps a compare-and-set outcome to success (applied now or by an earlier delivery).
    pub(crate) fn check_transition(
        order_id: Uuid,
        transition: StatusTransition,
        outcome: TransitionOutcome,
    ) -> Result<TransitionOutcome, StageError> {
        match outcome {
            TransitionOutcome::Applied | TransitionOutcome::AlreadyApplied => Ok(outcome),
            TransitionOutcome::Rejected { current } => Err(StageError::InvalidTransition {
                order_id,
                current,
                target: transition.target(),
            }),
            TransitionOutcome::NotFound => Err(StageError::OrderNotFound { order_id }),
        }
    }
}

/// One pipeline stage. Returning `Ok` acknowledges the delivery; `Err` rejects it without
/// requeue, leaving the outcome to the queue's dead-letter policy.
#[async_trait]
pub trait StageHandler: Send + Sync {
    fn stage(&self) -> Stage;

    async fn handle(&self, delivery: &Delivery) -> Result<(), StageError>;
}
