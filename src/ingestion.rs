//! Ingestion gate: validates new orders, enforces idempotent creation and emits the
//! `order.created` event.

pub mod validator;

use std::sync::Arc;

use chrono::Utc;
use serde::Deserialize;
use thiserror::Error;
use tracing::{info, instrument};
use uuid::Uuid;

use crate::broker::{BrokerError, MessageBroker, Route, publish_json};
use crate::observability::Telemetry;
use crate::store::OrderStore;
use crate::store::models::{CreateOrderOutcome, NewOrder, NewOrderItem, Order};
use crate::util::redact::redact;

pub use validator::{ValidationErrors, validate_order};

/// Client-supplied order. Missing fields decode to empty values and fail validation.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct OrderRequest {
    #[serde(default)]
    pub customer_id: String,
    #[serde(default)]
    pub total_amount: f64,
    #[serde(default)]
    pub items: Vec<OrderItemRequest>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct OrderItemRequest {
    #[serde(default)]
    pub sku: String,
    #[serde(default)]
    pub qty: i32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Admission {
    Created(Order),
    /// The token was already bound; nothing was written or published.
    AlreadyExists(Uuid),
    Invalid(ValidationErrors),
}

impl Admission {
    #[must_use]
    pub fn order_id(&self) -> Option<Uuid> {
        match self {
            Admission::Created(order) => Some(order.id),
            Admission::AlreadyExists(id) => Some(*id),
            Admission::Invalid(_) => None,
        }
    }

    fn outcome_label(&self) -> &'static str {
        match self {
            Admission::Created(_) => "created",
            Admission::AlreadyExists(_) => "already_exists",
            Admission::Invalid(_) => "invalid",
        }
    }
}

#[derive(Debug, Error)]
pub enum AdmitError {
    #[error("idempotency token must not be empty")]
    MissingToken,
    #[error("order store failure: {0:#}")]
    Store(#[source] anyhow::Error),
    #[error("failed to publish order.created: {0}")]
    Publish(#[from] BrokerError),
}

#[derive(Clone)]
pub struct IngestionGate {
    store: Arc<dyn OrderStore>,
    broker: Arc<dyn MessageBroker>,
    telemetry: Telemetry,
}

impl IngestionGate {
    #[must_use]
    pub fn new(
        store: Arc<dyn OrderStore>,
        broker: Arc<dyn MessageBroker>,
        telemetry: Telemetry,
    ) -> Self {
        Self {
            store,
            broker,
            telemetry,
        }
    }

    /// Admits an order under an idempotency token.
    ///
    /// A token seen before returns [`Admission::AlreadyExists`] with the original order id and
    /// performs no writes. Otherwise the request is validated, the order, its items and the
    /// token are committed together, and the stored order is published on `order.created`.
    ///
    /// # Errors
    /// [`AdmitError::MissingToken`] for a blank token; store and publish failures otherwise.
    /// Non-blank tokens are matched byte for byte, surrounding whitespace included.
    #[instrument(skip_all, fields(idempotency_key = %redact(token)))]
    pub async fn admit(&self, token: &str, request: OrderRequest) -> Result<Admission, AdmitError> {
        if token.trim().is_empty() {
            return Err(AdmitError::MissingToken);
        }

        let admission = self.admit_with_token(token, request).await?;
        self.telemetry
            .metrics()
            .orders_admitted
            .with_label_values(&[admission.outcome_label()])
            .inc();
        Ok(admission)
    }

    async fn admit_with_token(
        &self,
        token: &str,
        request: OrderRequest,
    ) -> Result<Admission, AdmitError> {
        if let Some(existing) = self
            .store
            .find_idempotency_key(token)
            .await
            .map_err(AdmitError::Store)?
        {
            info!(order_id = %existing.order_id, "idempotency key replayed");
            return Ok(Admission::AlreadyExists(existing.order_id));
        }

        if let Err(errors) = validate_order(&request) {
            info!(violations = errors.len(), "order request rejected by validation");
            return Ok(Admission::Invalid(errors));
        }

        let new_order = NewOrder {
            id: Uuid::new_v4(),
            customer_id: request.customer_id,
            total_amount: request.total_amount,
            created_at: Utc::now(),
            items: request
                .items
                .into_iter()
                .map(|item| NewOrderItem {
                    sku: item.sku,
                    qty: item.qty,
                })
                .collect(),
        };

        match self
            .store
            .create_order(new_order, token)
            .await
            .map_err(AdmitError::Store)?
        {
            CreateOrderOutcome::Created(order) => {
                publish_json(self.broker.as_ref(), Route::OrderCreated, &order).await?;
                info!(order_id = %order.id, status = %order.status, "order created");
                Ok(Admission::Created(order))
            }
            CreateOrderOutcome::Existing(order_id) => {
                info!(%order_id, "lost idempotency race; returning existing order");
                Ok(Admission::AlreadyExists(order_id))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::models::OrderStatus;
    use crate::test_support::{InMemoryBroker, InMemoryOrderStore};

    fn gate() -> (IngestionGate, Arc<InMemoryOrderStore>, Arc<InMemoryBroker>) {
        let store = Arc::new(InMemoryOrderStore::new());
        let broker = Arc::new(InMemoryBroker::new());
        let gate = IngestionGate::new(
            store.clone(),
            broker.clone(),
            Telemetry::new().expect("telemetry"),
        );
        (gate, store, broker)
    }

    fn valid_request() -> OrderRequest {
        OrderRequest {
            customer_id: "cust-1".to_string(),
            total_amount: 10.0,
            items: vec![OrderItemRequest {
                sku: "X".to_string(),
                qty: 2,
            }],
        }
    }

    #[tokio::test]
    async fn admit_creates_order_and_publishes_once() {
        let (gate, store, broker) = gate();

        let admission = gate.admit("abc", valid_request()).await.expect("admit");

        let Admission::Created(order) = admission else {
            panic!("expected created, got {admission:?}");
        };
        assert_eq!(order.status, OrderStatus::Pending);
        assert_eq!(order.items.len(), 1);
        assert_eq!(order.items[0].order_id, order.id);
        assert_eq!(store.order_count(), 1);

        let published = broker.published_orders(Route::OrderCreated);
        assert_eq!(published, vec![order]);
    }

    #[tokio::test]
    async fn replayed_token_returns_same_order_without_publishing() {
        let (gate, store, broker) = gate();

        let first = gate.admit("abc", valid_request()).await.expect("first");
        let second = gate.admit("abc", valid_request()).await.expect("second");

        assert!(matches!(second, Admission::AlreadyExists(_)));
        assert_eq!(first.order_id(), second.order_id());
        assert_eq!(store.order_count(), 1);
        assert_eq!(broker.published(Route::OrderCreated).len(), 1);
    }

    #[tokio::test]
    async fn replayed_token_skips_validation() {
        let (gate, _store, _broker) = gate();
        let first = gate.admit("abc", valid_request()).await.expect("first");

        let second = gate
            .admit("abc", OrderRequest::default())
            .await
            .expect("second");

        assert_eq!(second, Admission::AlreadyExists(first.order_id().expect("id")));
    }

    #[tokio::test]
    async fn invalid_request_writes_nothing() {
        let (gate, store, broker) = gate();
        let request = OrderRequest {
            customer_id: String::new(),
            total_amount: -5.0,
            items: vec![],
        };

        let admission = gate.admit("abc", request).await.expect("admit");

        let Admission::Invalid(errors) = admission else {
            panic!("expected invalid, got {admission:?}");
        };
        assert_eq!(errors.len(), 2);
        assert_eq!(store.order_count(), 0);
        assert!(broker.published(Route::OrderCreated).is_empty());
        // The token stays unbound so a corrected request can reuse it.
        let retry = gate.admit("abc", valid_request()).await.expect("retry");
        assert!(matches!(retry, Admission::Created(_)));
    }

    #[tokio::test]
    async fn blank_token_is_rejected() {
        let (gate, store, _broker) = gate();

        let error = gate
            .admit("   ", valid_request())
            .await
            .expect_err("blank token");

        assert!(matches!(error, AdmitError::MissingToken));
        assert_eq!(store.order_count(), 0);
    }

    #[tokio::test]
    async fn padded_token_is_a_distinct_key() {
        let (gate, store, broker) = gate();

        let bare = gate.admit("abc", valid_request()).await.expect("bare");
        let padded = gate.admit(" abc ", valid_request()).await.expect("padded");

        assert!(matches!(bare, Admission::Created(_)));
        assert!(matches!(padded, Admission::Created(_)));
        assert_ne!(bare.order_id(), padded.order_id());
        assert_eq!(store.order_count(), 2);
        assert_eq!(broker.published(Route::OrderCreated).len(), 2);

        let replay = gate.admit(" abc ", valid_request()).await.expect("replay");
        assert_eq!(replay, Admission::AlreadyExists(padded.order_id().expect("id")));
    }

    #[tokio::test]
    async fn store_failure_surfaces_as_error() {
        let (gate, store, broker) = gate();
        store.set_should_fail(true);

        let error = gate
            .admit("abc", valid_request())
            .await
            .expect_err("store down");

        assert!(matches!(error, AdmitError::Store(_)));
        assert!(broker.published(Route::OrderCreated).is_empty());
    }

    #[tokio::test]
    async fn publish_failure_surfaces_after_commit() {
        let (gate, store, broker) = gate();
        broker.set_should_fail_publish(true);

        let error = gate
            .admit("abc", valid_request())
            .await
            .expect_err("broker down");

        assert!(matches!(error, AdmitError::Publish(_)));
        assert_eq!(store.order_count(), 1);
    }

    #[tokio::test]
    async fn admissions_are_counted_by_outcome() {
        let (gate, _store, _broker) = gate();

        gate.admit("a", valid_request()).await.expect("created");
        gate.admit("a", valid_request()).await.expect("replayed");
        gate.admit("b", OrderRequest::default()).await.expect("invalid");

        let metrics = gate.telemetry.metrics();
        for outcome in ["created", "already_exists", "invalid"] {
            assert_eq!(
                metrics.orders_admitted.with_label_values(&[outcome]).get(),
                1,
                "{outcome}"
            );
        }
    }
}
