//! OrderStore trait - durable record access for the order pipeline

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

use super::models::{
    CreateOrderOutcome, EnrichmentInsert, IdempotencyKey, NewOrder, Order, OrderEnrichment,
    StatusTransition, TransitionOutcome,
};

#[async_trait]
pub trait OrderStore: Send + Sync {
    /// Looks up the order bound to an idempotency token.
    async fn find_idempotency_key(&self, key: &str) -> Result<Option<IdempotencyKey>>;

    /// Persists the order, its items and the idempotency key in one transaction.
    ///
    /// When the key is already bound (a concurrent admission won), nothing is written and
    /// the winning order id is returned.
    async fn create_order(&self, order: NewOrder, key: &str) -> Result<CreateOrderOutcome>;

    async fn get_order(&self, id: Uuid) -> Result<Option<Order>>;

    /// Compare-and-set status update from `transition.source()` to `transition.target()`.
    async fn transition_status(
        &self,
        id: Uuid,
        transition: StatusTransition,
    ) -> Result<TransitionOutcome>;

    /// Inserts the enrichment artifact unless one already exists for the order.
    async fn insert_enrichment(&self, order_id: Uuid, data: Value) -> Result<EnrichmentInsert>;

    async fn get_enrichment(&self, order_id: Uuid) -> Result<Option<OrderEnrichment>>;

    async fn ping(&self) -> Result<()>;
}

/// Classifies a compare-and-set that matched no row, given the order's current status.
pub(crate) fn unapplied_outcome(
    transition: StatusTransition,
    current: Option<super::models::OrderStatus>,
) -> TransitionOutcome {
    match current {
        None => TransitionOutcome::NotFound,
        Some(status) if status == transition.target() => TransitionOutcome::AlreadyApplied,
        Some(current) => TransitionOutcome::Rejected { current },
    }
}
