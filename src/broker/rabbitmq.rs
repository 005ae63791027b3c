//! RabbitMQ implementation of [`MessageBroker`] using the `lapin` crate.
//!
//! Topology declared by [`RabbitMqBroker::declare_topology`]:
//! - direct exchange `order.events`, one durable queue per [`Route`] bound by its routing key
//! - the enrichment queue dead-letters rejected messages to `order.events.retry`
//! - `order.events.retry` feeds a delay queue whose `x-message-ttl` is the retry backoff; expired
//!   messages dead-letter back to `order.events` under their original routing key
//!
//! The redelivery count is read from the `x-death` header RabbitMQ maintains on every
//! dead-lettered message.

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use lapin::acker::Acker;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions, BasicQosOptions,
    ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::{AMQPValue, FieldTable};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind};
use tracing::{debug, info};
use uuid::Uuid;

use super::delivery::{Acknowledge, Delivery};
use super::topology::{
    ENRICHMENT_RETRY_QUEUE, ORDER_EVENTS_EXCHANGE, ORDER_EVENTS_RETRY_EXCHANGE, Route,
};
use super::{BrokerError, DeliveryStream, MessageBroker};

#[derive(Debug)]
pub struct RabbitMqBroker {
    connection: Connection,
    channel: Channel,
    retry_delay: Duration,
}

impl RabbitMqBroker {
    /// Opens a connection and a confirm-mode channel with the given prefetch.
    ///
    /// # Errors
    /// Returns [`BrokerError::Connection`] when the broker is unreachable or rejects the channel
    /// setup.
    pub async fn connect(
        url: &str,
        prefetch: u16,
        retry_delay: Duration,
    ) -> Result<Self, BrokerError> {
        let connection = Connection::connect(
            url,
            ConnectionProperties::default().with_connection_name("order-pipeline".into()),
        )
        .await
        .map_err(|e| BrokerError::Connection(format!("RabbitMQ connection failed: {e}")))?;

        let channel = connection
            .create_channel()
            .await
            .map_err(|e| BrokerError::Connection(format!("RabbitMQ channel creation failed: {e}")))?;

        // One in-flight delivery per consumer unless configured otherwise
        channel
            .basic_qos(prefetch, BasicQosOptions::default())
            .await
            .map_err(|e| BrokerError::Connection(format!("failed to set QoS: {e}")))?;

        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| BrokerError::Connection(format!("failed to enable confirms: {e}")))?;

        info!(prefetch, "connected to RabbitMQ");

        Ok(Self {
            connection,
            channel,
            retry_delay,
        })
    }

    /// Declares exchanges, queues, bindings and dead-letter arguments. Safe to repeat.
    ///
    /// # Errors
    /// Returns [`BrokerError::Topology`] naming the object the broker refused.
    pub async fn declare_topology(&self) -> Result<(), BrokerError> {
        self.declare_exchange(ORDER_EVENTS_EXCHANGE).await?;
        self.declare_exchange(ORDER_EVENTS_RETRY_EXCHANGE).await?;

        for route in Route::ALL {
            let mut args = FieldTable::default();
            if route.has_retry_queue() {
                // Routing key is preserved when x-dead-letter-routing-key is absent
                args.insert(
                    "x-dead-letter-exchange".into(),
                    AMQPValue::LongString(ORDER_EVENTS_RETRY_EXCHANGE.into()),
                );
            }
            self.declare_queue(route.queue(), args).await?;
            self.bind_queue(route.queue(), ORDER_EVENTS_EXCHANGE, route.routing_key())
                .await?;
        }

        let ttl_ms = i64::try_from(self.retry_delay.as_millis()).map_err(|_| {
            BrokerError::Topology {
                name: ENRICHMENT_RETRY_QUEUE.to_string(),
                message: "retry delay does not fit x-message-ttl".to_string(),
            }
        })?;
        let mut retry_args = FieldTable::default();
        retry_args.insert("x-message-ttl".into(), AMQPValue::LongLongInt(ttl_ms));
        retry_args.insert(
            "x-dead-letter-exchange".into(),
            AMQPValue::LongString(ORDER_EVENTS_EXCHANGE.into()),
        );
        self.declare_queue(ENRICHMENT_RETRY_QUEUE, retry_args)
            .await?;
        self.bind_queue(
            ENRICHMENT_RETRY_QUEUE,
            ORDER_EVENTS_RETRY_EXCHANGE,
            Route::EnrichmentRequested.routing_key(),
        )
        .await?;

        info!(retry_delay_ms = ttl_ms, "broker topology declared");
        Ok(())
    }

    async fn declare_exchange(&self, name: &str) -> Result<(), BrokerError> {
        self.channel
            .exchange_declare(
                name,
                ExchangeKind::Direct,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| BrokerError::Topology {
                name: name.to_string(),
                message: format!("exchange declaration failed: {e}"),
            })
    }

    async fn declare_queue(&self, name: &str, args: FieldTable) -> Result<(), BrokerError> {
        self.channel
            .queue_declare(
                name,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                args,
            )
            .await
            .map(|_| ())
            .map_err(|e| BrokerError::Topology {
                name: name.to_string(),
                message: format!("queue declaration failed: {e}"),
            })
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError> {
        self.channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| BrokerError::Topology {
                name: queue.to_string(),
                message: format!("binding to {exchange} failed: {e}"),
            })
    }
}

#[async_trait]
impl MessageBroker for RabbitMqBroker {
    async fn publish(&self, route: Route, body: &[u8]) -> Result<(), BrokerError> {
        let confirm = self
            .channel
            .basic_publish(
                ORDER_EVENTS_EXCHANGE,
                route.routing_key(),
                BasicPublishOptions::default(),
                body,
                BasicProperties::default()
                    .with_delivery_mode(2) // Persistent
                    .with_content_type("application/json".into()),
            )
            .await
            .map_err(|e| BrokerError::Publish {
                route,
                message: e.to_string(),
            })?;

        let confirmation = confirm.await.map_err(|e| BrokerError::Publish {
            route,
            message: format!("publish confirmation failed: {e}"),
        })?;
        if confirmation.is_nack() {
            return Err(BrokerError::Publish {
                route,
                message: "broker nacked the message".to_string(),
            });
        }

        debug!(%route, bytes = body.len(), "published event");
        Ok(())
    }

    async fn consume(&self, route: Route) -> Result<DeliveryStream, BrokerError> {
        let consumer_tag = format!("{}-{}", route.queue(), Uuid::new_v4());
        let consumer = self
            .channel
            .basic_consume(
                route.queue(),
                &consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| BrokerError::Consume {
                route,
                message: e.to_string(),
            })?;

        info!(%route, consumer_tag, "consumer registered");

        let stream = consumer.map(move |result| match result {
            Ok(delivery) => {
                let redeliveries =
                    death_count(delivery.properties.headers().as_ref(), route.queue());
                Ok(Delivery::new(
                    delivery.data,
                    redeliveries,
                    Box::new(LapinAcker(delivery.acker)),
                ))
            }
            Err(e) => Err(BrokerError::Consume {
                route,
                message: e.to_string(),
            }),
        });

        Ok(stream.boxed())
    }

    async fn ping(&self) -> Result<(), BrokerError> {
        if !self.connection.status().connected() {
            return Err(BrokerError::Connection(
                "RabbitMQ connection is not open".to_string(),
            ));
        }
        if !self.channel.status().connected() {
            return Err(BrokerError::Connection(
                "RabbitMQ channel is not open".to_string(),
            ));
        }
        Ok(())
    }
}

struct LapinAcker(Acker);

#[async_trait]
impl Acknowledge for LapinAcker {
    async fn ack(&self) -> Result<(), BrokerError> {
        self.0
            .ack(BasicAckOptions::default())
            .await
            .map_err(|e| BrokerError::Acknowledge(format!("ack failed: {e}")))
    }

    async fn reject(&self) -> Result<(), BrokerError> {
        self.0
            .nack(BasicNackOptions {
                requeue: false,
                ..Default::default()
            })
            .await
            .map_err(|e| BrokerError::Acknowledge(format!("nack failed: {e}")))
    }
}

/// Number of times a message was rejected from `queue` and routed back, per `x-death`.
///
/// Prefers the entry for `queue` with reason `rejected`; otherwise the largest count present.
/// Missing or malformed headers count as a fresh delivery.
pub(crate) fn death_count(headers: Option<&FieldTable>, queue: &str) -> u32 {
    let Some(AMQPValue::FieldArray(deaths)) = headers.and_then(|h| field(h, "x-death")) else {
        return 0;
    };

    let entries: Vec<&FieldTable> = deaths
        .as_slice()
        .iter()
        .filter_map(|value| match value {
            AMQPValue::FieldTable(entry) => Some(entry),
            _ => None,
        })
        .collect();

    let matching = entries.iter().find(|entry| {
        field(entry, "queue").is_some_and(|value| text_equals(value, queue))
            && field(entry, "reason").is_some_and(|value| text_equals(value, "rejected"))
    });

    if let Some(count) = matching.and_then(|entry| field(entry, "count").and_then(as_count)) {
        return count;
    }

    entries
        .iter()
        .filter_map(|entry| field(entry, "count").and_then(as_count))
        .max()
        .unwrap_or(0)
}

fn field<'a>(table: &'a FieldTable, name: &str) -> Option<&'a AMQPValue> {
    table
        .inner()
        .iter()
        .find(|(key, _)| key.as_str() == name)
        .map(|(_, value)| value)
}

fn text_equals(value: &AMQPValue, expected: &str) -> bool {
    match value {
        AMQPValue::LongString(text) => text.as_bytes() == expected.as_bytes(),
        AMQPValue::ShortString(text) => text.as_str() == expected,
        _ => false,
    }
}

fn as_count(value: &AMQPValue) -> Option<u32> {
    match value {
        AMQPValue::LongLongInt(n) => u32::try_from(*n).ok(),
        AMQPValue::LongInt(n) => u32::try_from(*n).ok(),
        AMQPValue::LongUInt(n) => Some(*n),
        AMQPValue::ShortInt(n) => u32::try_from(*n).ok(),
        AMQPValue::ShortUInt(n) => Some(u32::from(*n)),
        AMQPValue::ShortShortInt(n) => u32::try_from(*n).ok(),
        AMQPValue::ShortShortUInt(n) => Some(u32::from(*n)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use lapin::types::FieldArray;

    use super::*;

    fn death_entry(queue: &str, reason: &str, count: i64) -> AMQPValue {
        let mut entry = FieldTable::default();
        entry.insert("queue".into(), AMQPValue::LongString(queue.into()));
        entry.insert("reason".into(), AMQPValue::LongString(reason.into()));
        entry.insert("count".into(), AMQPValue::LongLongInt(count));
        entry.insert(
            "exchange".into(),
            AMQPValue::LongString(ORDER_EVENTS_EXCHANGE.into()),
        );
        AMQPValue::FieldTable(entry)
    }

    fn headers(entries: Vec<AMQPValue>) -> FieldTable {
        let mut table = FieldTable::default();
        table.insert(
            "x-death".into(),
            AMQPValue::FieldArray(FieldArray::from(entries)),
        );
        table
    }

    #[test]
    fn absent_headers_mean_fresh_delivery() {
        assert_eq!(death_count(None, Route::EnrichmentRequested.queue()), 0);
        assert_eq!(
            death_count(Some(&FieldTable::default()), Route::EnrichmentRequested.queue()),
            0
        );
    }

    #[test]
    fn reads_rejected_entry_for_consuming_queue() {
        let table = headers(vec![
            death_entry(ENRICHMENT_RETRY_QUEUE, "expired", 5),
            death_entry(Route::EnrichmentRequested.queue(), "rejected", 2),
        ]);

        assert_eq!(
            death_count(Some(&table), Route::EnrichmentRequested.queue()),
            2
        );
    }

    #[test]
    fn falls_back_to_largest_count() {
        let table = headers(vec![
            death_entry("some.other.queue", "rejected", 1),
            death_entry(ENRICHMENT_RETRY_QUEUE, "expired", 3),
        ]);

        assert_eq!(
            death_count(Some(&table), Route::EnrichmentRequested.queue()),
            3
        );
    }

    #[test]
    fn malformed_header_counts_as_fresh() {
        let mut table = FieldTable::default();
        table.insert(
            "x-death".into(),
            AMQPValue::LongString("not-an-array".into()),
        );

        assert_eq!(
            death_count(Some(&table), Route::EnrichmentRequested.queue()),
            0
        );
    }

    #[test]
    fn negative_counts_are_ignored() {
        let table = headers(vec![death_entry(
            Route::EnrichmentRequested.queue(),
            "rejected",
            -1,
        )]);

        assert_eq!(
            death_count(Some(&table), Route::EnrichmentRequested.queue()),
            0
        );
    }
}
