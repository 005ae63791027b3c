use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use super::{Stage, StageError, StageHandler};
use crate::broker::Delivery;
use crate::store::OrderStore;
use crate::store::models::{Order, StatusTransition, TransitionOutcome};

/// Marks an enriched order `completed`.
pub struct FinalizationHandler {
    store: Arc<dyn OrderStore>,
}

impl FinalizationHandler {
    #[must_use]
    pub fn new(store: Arc<dyn OrderStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl StageHandler for FinalizationHandler {
    fn stage(&self) -> Stage {
        Stage::Finalization
    }

    async fn handle(&self, delivery: &Delivery) -> Result<(), StageError> {
        let order: Order = delivery.decode()?;
        let transition = StatusTransition::Complete;

        let outcome = self
            .store
            .transition_status(order.id, transition)
            .await
            .map_err(StageError::Store)?;
        let outcome = StageError::check_transition(order.id, transition, outcome)?;

        info!(
            order_id = %order.id,
            redelivered = outcome == TransitionOutcome::AlreadyApplied,
            "order completed"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::models::OrderStatus;
    use crate::test_support::{InMemoryOrderStore, sample_order, test_delivery};

    #[tokio::test]
    async fn completes_processing_order() {
        let store = Arc::new(InMemoryOrderStore::new());
        let handler = FinalizationHandler::new(store.clone());
        let mut order = sample_order("cust-1");
        order.status = OrderStatus::Processing;
        let order = store.seed(order);
        let (delivery, _log) = test_delivery(&order, 0);

        handler.handle(&delivery).await.expect("handled");
        handler.handle(&delivery).await.expect("redelivery is idempotent");

        assert_eq!(
            store.status_history(order.id),
            vec![OrderStatus::Processing, OrderStatus::Completed]
        );
    }

    #[tokio::test]
    async fn pending_order_cannot_skip_processing() {
        let store = Arc::new(InMemoryOrderStore::new());
        let handler = FinalizationHandler::new(store.clone());
        let order = store.seed(sample_order("cust-1"));
        let (delivery, _log) = test_delivery(&order, 0);

        let error = handler.handle(&delivery).await.expect_err("skip rejected");

        assert!(matches!(
            error,
            StageError::InvalidTransition {
                current: OrderStatus::Pending,
                target: OrderStatus::Completed,
                ..
            }
        ));
        assert_eq!(store.status_of(order.id), Some(OrderStatus::Pending));
    }

    #[tokio::test]
    async fn failed_order_stays_failed() {
        let store = Arc::new(InMemoryOrderStore::new());
        let handler = FinalizationHandler::new(store.clone());
        let mut order = sample_order("cust-1");
        order.status = OrderStatus::Failed;
        let order = store.seed(order);
        let (delivery, _log) = test_delivery(&order, 0);

        assert!(handler.handle(&delivery).await.is_err());
        assert_eq!(store.status_of(order.id), Some(OrderStatus::Failed));
    }
}
