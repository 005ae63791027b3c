use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use thiserror::Error;
use tracing::{debug, info, warn};

use super::retry::{RetryPolicy, RetryState};
use super::{Stage, StageError, StageHandler};
use crate::broker::{Delivery, MessageBroker, Route, publish_json};
use crate::observability::Telemetry;
use crate::store::OrderStore;
use crate::store::models::{EnrichmentInsert, Order, StatusTransition, TransitionOutcome};

#[derive(Debug, Error)]
pub enum EnrichmentError {
    #[error("enrichment provider unavailable for customer {customer_id}")]
    Unavailable { customer_id: String },
}

/// Source of enrichment payloads for an order.
#[async_trait]
pub trait EnrichmentProvider: Send + Sync {
    async fn enrich(&self, order: &Order) -> Result<Value, EnrichmentError>;
}

/// Stand-in provider: fails for customers whose id contains the trigger, otherwise works for
/// `work_duration` and returns a fixed payload.
#[derive(Debug, Clone)]
pub struct SimulatedEnrichment {
    failure_trigger: String,
    work_duration: Duration,
}

impl SimulatedEnrichment {
    /// An empty `failure_trigger` never fails.
    #[must_use]
    pub fn new(failure_trigger: impl Into<String>, work_duration: Duration) -> Self {
        Self {
            failure_trigger: failure_trigger.into(),
            work_duration,
        }
    }

    fn should_fail(&self, order: &Order) -> bool {
        !self.failure_trigger.is_empty() && order.customer_id.contains(&self.failure_trigger)
    }
}

#[async_trait]
impl EnrichmentProvider for SimulatedEnrichment {
    async fn enrich(&self, order: &Order) -> Result<Value, EnrichmentError> {
        if self.should_fail(order) {
            return Err(EnrichmentError::Unavailable {
                customer_id: order.customer_id.clone(),
            });
        }

        tokio::time::sleep(self.work_duration).await;
        Ok(json!({ "message": "enriched" }))
    }
}

/// Enriches processing orders, relying on the broker's delay queue for retries.
///
/// A failed attempt rejects the delivery, which dead-letters it into the retry queue; once the
/// redelivery count reaches the policy maximum the order is marked `failed` and the delivery is
/// acknowledged.
pub struct EnrichmentHandler {
    store: Arc<dyn OrderStore>,
    broker: Arc<dyn MessageBroker>,
    provider: Arc<dyn EnrichmentProvider>,
    policy: RetryPolicy,
    telemetry: Telemetry,
}

impl EnrichmentHandler {
    #[must_use]
    pub fn new(
        store: Arc<dyn OrderStore>,
        broker: Arc<dyn MessageBroker>,
        provider: Arc<dyn EnrichmentProvider>,
        policy: RetryPolicy,
        telemetry: Telemetry,
    ) -> Self {
        Self {
            store,
            broker,
            provider,
            policy,
            telemetry,
        }
    }

    /// Terminal path. Always acknowledges, since rejecting here would dead-letter again.
    async fn give_up(&self, order: &Order, redeliveries: u32) -> Result<(), StageError> {
        let outcome = self
            .store
            .transition_status(order.id, StatusTransition::Fail)
            .await
            .map_err(StageError::Store)?;

        match outcome {
            TransitionOutcome::Applied => {
                self.telemetry.metrics().enrichment_exhausted.inc();
                warn!(
                    order_id = %order.id,
                    redeliveries,
                    max_retries = self.policy.max_retries(),
                    "enrichment retries exhausted; order failed"
                );
            }
            TransitionOutcome::AlreadyApplied => {
                info!(order_id = %order.id, "order already failed");
            }
            TransitionOutcome::Rejected { current } => {
                warn!(
                    order_id = %order.id,
                    %current,
                    "enrichment retries exhausted but order is no longer processing; dropping"
                );
            }
            TransitionOutcome::NotFound => {
                warn!(order_id = %order.id, "enrichment retries exhausted for unknown order; dropping");
            }
        }
        Ok(())
    }
}

#[async_trait]
impl StageHandler for EnrichmentHandler {
    fn stage(&self) -> Stage {
        Stage::Enrichment
    }

    async fn handle(&self, delivery: &Delivery) -> Result<(), StageError> {
        let order: Order = delivery.decode()?;
        let redeliveries = delivery.redeliveries();

        match self.policy.classify(redeliveries) {
            RetryState::Exhausted => return self.give_up(&order, redeliveries).await,
            RetryState::Fresh => debug!(order_id = %order.id, "enriching order"),
            RetryState::Retry(attempt) => info!(
                order_id = %order.id,
                attempt,
                max_retries = self.policy.max_retries(),
                "retrying enrichment"
            ),
        }

        let payload = match self.provider.enrich(&order).await {
            Ok(payload) => payload,
            Err(error) => {
                self.telemetry.metrics().enrichment_retries.inc();
                warn!(
                    order_id = %order.id,
                    redeliveries,
                    retry_in_ms = u64::try_from(self.policy.backoff().as_millis()).unwrap_or(u64::MAX),
                    %error,
                    "enrichment failed; dead-lettering for retry"
                );
                return Err(error.into());
            }
        };

        match self
            .store
            .insert_enrichment(order.id, payload)
            .await
            .map_err(StageError::Store)?
        {
            EnrichmentInsert::Inserted(enrichment) => {
                info!(order_id = %order.id, enrichment_id = enrichment.id, "enrichment stored");
            }
            EnrichmentInsert::AlreadyPresent => {
                info!(order_id = %order.id, "enrichment already stored; republishing");
            }
        }

        publish_json(self.broker.as_ref(), Route::OrderEnriched, &order).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::models::OrderStatus;
    use crate::test_support::{InMemoryBroker, InMemoryOrderStore, sample_order, test_delivery};

    struct Fixture {
        handler: EnrichmentHandler,
        store: Arc<InMemoryOrderStore>,
        broker: Arc<InMemoryBroker>,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(InMemoryOrderStore::new());
        let broker = Arc::new(InMemoryBroker::new());
        let handler = EnrichmentHandler::new(
            store.clone(),
            broker.clone(),
            Arc::new(SimulatedEnrichment::new("f", Duration::from_secs(5))),
            RetryPolicy::default(),
            Telemetry::new().expect("telemetry"),
        );
        Fixture {
            handler,
            store,
            broker,
        }
    }

    fn processing_order(customer_id: &str) -> Order {
        let mut order = sample_order(customer_id);
        order.status = OrderStatus::Processing;
        order
    }

    #[tokio::test(start_paused = true)]
    async fn successful_enrichment_stores_artifact_and_publishes() {
        let fx = fixture();
        let order = fx.store.seed(processing_order("cust-1"));
        let (delivery, _log) = test_delivery(&order, 0);

        fx.handler.handle(&delivery).await.expect("enriched");

        let enrichment = fx.store.enrichment_for(order.id).expect("artifact stored");
        assert_eq!(enrichment.data, json!({"message": "enriched"}));
        assert_eq!(fx.broker.published_orders(Route::OrderEnriched).len(), 1);
        assert_eq!(fx.store.status_of(order.id), Some(OrderStatus::Processing));
    }

    #[tokio::test(start_paused = true)]
    async fn redelivery_after_stored_artifact_republishes() {
        let fx = fixture();
        let order = fx.store.seed(processing_order("cust-1"));

        for _ in 0..2 {
            let (delivery, _log) = test_delivery(&order, 0);
            fx.handler.handle(&delivery).await.expect("enriched");
        }

        assert_eq!(fx.store.enrichment_count(), 1);
        assert_eq!(fx.broker.published(Route::OrderEnriched).len(), 2);
    }

    #[tokio::test]
    async fn failing_customer_is_rejected_until_exhausted() {
        let fx = fixture();
        let order = fx.store.seed(processing_order("cust-f1"));

        for redeliveries in 0..3 {
            let (delivery, _log) = test_delivery(&order, redeliveries);
            let error = fx.handler.handle(&delivery).await.expect_err("simulated failure");
            assert!(matches!(error, StageError::Enrichment(_)));
            assert_eq!(fx.store.status_of(order.id), Some(OrderStatus::Processing));
        }

        let (delivery, _log) = test_delivery(&order, 3);
        fx.handler.handle(&delivery).await.expect("exhausted is acked");

        assert_eq!(fx.store.status_of(order.id), Some(OrderStatus::Failed));
        assert_eq!(fx.store.enrichment_count(), 0);
        assert!(fx.broker.published(Route::OrderEnriched).is_empty());
        let metrics = fx.handler.telemetry.metrics();
        assert_eq!(metrics.enrichment_retries.get(), 3);
        assert_eq!(metrics.enrichment_exhausted.get(), 1);
    }

    #[tokio::test]
    async fn exhausted_delivery_never_calls_provider() {
        let fx = fixture();
        // A healthy customer with an exhausted count still goes terminal.
        let order = fx.store.seed(processing_order("cust-1"));
        let (delivery, _log) = test_delivery(&order, 7);

        fx.handler.handle(&delivery).await.expect("acked");

        assert_eq!(fx.store.status_of(order.id), Some(OrderStatus::Failed));
        assert_eq!(fx.store.enrichment_count(), 0);
    }

    #[tokio::test]
    async fn exhausted_delivery_for_completed_order_is_dropped() {
        let fx = fixture();
        let mut order = processing_order("cust-f1");
        order.status = OrderStatus::Completed;
        let order = fx.store.seed(order);
        let (delivery, _log) = test_delivery(&order, 3);

        fx.handler.handle(&delivery).await.expect("acked");

        assert_eq!(fx.store.status_of(order.id), Some(OrderStatus::Completed));
    }

    #[tokio::test]
    async fn simulated_provider_honours_trigger() {
        let provider = SimulatedEnrichment::new("f", Duration::ZERO);
        assert!(provider.enrich(&sample_order("cust-f")).await.is_err());
        assert!(provider.enrich(&sample_order("cust-1")).await.is_ok());

        let disabled = SimulatedEnrichment::new("", Duration::ZERO);
        assert!(disabled.enrich(&sample_order("cust-f")).await.is_ok());
    }
}
