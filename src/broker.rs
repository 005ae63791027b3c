pub mod delivery;
pub mod rabbitmq;
pub mod topology;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::Serialize;
use thiserror::Error;

pub use delivery::{Acknowledge, Delivery};
pub use rabbitmq::RabbitMqBroker;
pub use topology::Route;

pub type DeliveryStream = BoxStream<'static, Result<Delivery, BrokerError>>;

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("broker connection failed: {0}")]
    Connection(String),
    #[error("failed to declare {name}: {message}")]
    Topology { name: String, message: String },
    #[error("publish to {route} failed: {message}")]
    Publish { route: Route, message: String },
    #[error("consume from {route} failed: {message}")]
    Consume { route: Route, message: String },
    #[error("acknowledgement failed: {0}")]
    Acknowledge(String),
    #[error("failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Durable, routed publish/subscribe transport with manual acknowledgement.
#[async_trait]
pub trait MessageBroker: Send + Sync {
    /// Publishes a persistent JSON message and waits for the broker's confirm.
    async fn publish(&self, route: Route, body: &[u8]) -> Result<(), BrokerError>;

    /// Opens a subscription on the queue bound to `route`.
    async fn consume(&self, route: Route) -> Result<DeliveryStream, BrokerError>;

    async fn ping(&self) -> Result<(), BrokerError>;
}

/// Serializes `value` as JSON and publishes it on `route`.
///
/// # Errors
/// Returns [`BrokerError::Encode`] when serialization fails, or the broker's publish error.
pub async fn publish_json<T>(
    broker: &dyn MessageBroker,
    route: Route,
    value: &T,
) -> Result<(), BrokerError>
where
    T: Serialize + Sync + ?Sized,
{
    let body = serde_json::to_vec(value)?;
    broker.publish(route, &body).await
}
