use std::fmt;

use async_trait::async_trait;
use serde::de::DeserializeOwned;

use super::BrokerError;

/// Settles a single delivery with the broker.
#[async_trait]
pub trait Acknowledge: Send + Sync {
    async fn ack(&self) -> Result<(), BrokerError>;

    /// Negative acknowledgement without requeue; the queue's dead-letter policy decides
    /// what happens next.
    async fn reject(&self) -> Result<(), BrokerError>;
}

/// One message received from a stage queue.
pub struct Delivery {
    body: Vec<u8>,
    redeliveries: u32,
    acker: Box<dyn Acknowledge>,
}

impl Delivery {
    #[must_use]
    pub fn new(body: Vec<u8>, redeliveries: u32, acker: Box<dyn Acknowledge>) -> Self {
        Self {
            body,
            redeliveries,
            acker,
        }
    }

    #[must_use]
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Times this message has been dead-lettered back to its queue.
    #[must_use]
    pub fn redeliveries(&self) -> u32 {
        self.redeliveries
    }

    /// Decodes the JSON body.
    ///
    /// # Errors
    /// Returns the deserialization error when the body is not a valid `T`.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }

    /// # Errors
    /// Propagates the broker's acknowledgement failure.
    pub async fn ack(self) -> Result<(), BrokerError> {
        self.acker.ack().await
    }

    /// # Errors
    /// Propagates the broker's acknowledgement failure.
    pub async fn reject(self) -> Result<(), BrokerError> {
        self.acker.reject().await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("body_len", &self.body.len())
            .field("redeliveries", &self.redeliveries)
            .finish_non_exhaustive()
    }
}
