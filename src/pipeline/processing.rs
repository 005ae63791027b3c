use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tracing::info;

use super::{Stage, StageError, StageHandler};
use crate::broker::{Delivery, MessageBroker, Route, publish_json};
use crate::store::OrderStore;
use crate::store::models::{Order, OrderStatus, StatusTransition, TransitionOutcome};

/// Moves an admitted order to `processing` and requests enrichment.
pub struct ProcessingHandler {
    store: Arc<dyn OrderStore>,
    broker: Arc<dyn MessageBroker>,
}

impl ProcessingHandler {
    #[must_use]
    pub fn new(store: Arc<dyn OrderStore>, broker: Arc<dyn MessageBroker>) -> Self {
        Self { store, broker }
    }
}

#[async_trait]
impl StageHandler for ProcessingHandler {
    fn stage(&self) -> Stage {
        Stage::Processing
    }

    async fn handle(&self, delivery: &Delivery) -> Result<(), StageError> {
        let mut order: Order = delivery.decode()?;
        let transition = StatusTransition::BeginProcessing;

        let outcome = self
            .store
            .transition_status(order.id, transition)
            .await
            .map_err(StageError::Store)?;
        let outcome = StageError::check_transition(order.id, transition, outcome)?;

        order.status = OrderStatus::Processing;
        order.updated_at = Utc::now();

        // An already-applied transition still republishes: the earlier delivery may have
        // committed and then failed to publish.
        publish_json(self.broker.as_ref(), Route::EnrichmentRequested, &order).await?;

        info!(
            order_id = %order.id,
            redelivered = outcome == TransitionOutcome::AlreadyApplied,
            "order processing started; enrichment requested"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{InMemoryBroker, InMemoryOrderStore, sample_order, test_delivery};

    fn handler() -> (ProcessingHandler, Arc<InMemoryOrderStore>, Arc<InMemoryBroker>) {
        let store = Arc::new(InMemoryOrderStore::new());
        let broker = Arc::new(InMemoryBroker::new());
        (
            ProcessingHandler::new(store.clone(), broker.clone()),
            store,
            broker,
        )
    }

    #[tokio::test]
    async fn moves_pending_order_to_processing_and_publishes() {
        let (handler, store, broker) = handler();
        let order = store.seed(sample_order("cust-1"));
        let (delivery, _log) = test_delivery(&order, 0);

        handler.handle(&delivery).await.expect("handled");

        assert_eq!(store.status_of(order.id), Some(OrderStatus::Processing));
        let published = broker.published_orders(Route::EnrichmentRequested);
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].id, order.id);
        assert_eq!(published[0].status, OrderStatus::Processing);
        assert_eq!(published[0].items, order.items);
    }

    #[tokio::test]
    async fn redelivery_republishes_without_second_transition() {
        let (handler, store, broker) = handler();
        let order = store.seed(sample_order("cust-1"));

        for _ in 0..2 {
            let (delivery, _log) = test_delivery(&order, 0);
            handler.handle(&delivery).await.expect("handled");
        }

        assert_eq!(
            store.status_history(order.id),
            vec![OrderStatus::Pending, OrderStatus::Processing]
        );
        assert_eq!(broker.published(Route::EnrichmentRequested).len(), 2);
    }

    #[tokio::test]
    async fn completed_order_is_not_moved_backwards() {
        let (handler, store, broker) = handler();
        let mut order = sample_order("cust-1");
        order.status = OrderStatus::Completed;
        let order = store.seed(order);
        let (delivery, _log) = test_delivery(&order, 0);

        let error = handler.handle(&delivery).await.expect_err("rejected");

        assert!(matches!(error, StageError::InvalidTransition { .. }));
        assert_eq!(store.status_of(order.id), Some(OrderStatus::Completed));
        assert!(broker.published(Route::EnrichmentRequested).is_empty());
    }

    #[tokio::test]
    async fn malformed_body_is_a_decode_error() {
        let (handler, _store, _broker) = handler();
        let (delivery, _log) = crate::test_support::raw_delivery(b"{not json".to_vec(), 0);

        let error = handler.handle(&delivery).await.expect_err("bad body");

        assert!(matches!(error, StageError::Decode(_)));
    }

    #[tokio::test]
    async fn unknown_order_is_reported() {
        let (handler, _store, _broker) = handler();
        let (delivery, _log) = test_delivery(&sample_order("cust-1"), 0);

        let error = handler.handle(&delivery).await.expect_err("missing order");

        assert!(matches!(error, StageError::OrderNotFound { .. }));
    }
}
