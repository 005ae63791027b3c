//! Cache-aside read path for order views.
//!
//! Entries are never invalidated on status change; a cached view may lag the store by up to
//! the cache TTL.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cache::{CacheError, OrderCache};
use crate::observability::Telemetry;
use crate::store::OrderStore;
use crate::store::models::{Order, OrderEnrichment, OrderStatus};

#[must_use]
pub fn cache_key(order_id: Uuid) -> String {
    format!("order:{order_id}")
}

#[derive(Debug, Serialize)]
struct OrderView<'a> {
    order: &'a Order,
    order_enriched: Option<&'a OrderEnrichment>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewSource {
    Cache,
    Store,
}

/// Serialized `{order, order_enriched}` view and where it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderLookup {
    pub body: String,
    pub source: ViewSource,
}

#[derive(Debug, Error)]
pub enum ReadError {
    #[error("order {0} not found")]
    NotFound(Uuid),
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error("order store failure: {0:#}")]
    Store(#[source] anyhow::Error),
    #[error("failed to encode order view: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Clone)]
pub struct OrderReader {
    store: Arc<dyn OrderStore>,
    cache: Arc<dyn OrderCache>,
    ttl: Duration,
    telemetry: Telemetry,
}

impl OrderReader {
    #[must_use]
    pub fn new(
        store: Arc<dyn OrderStore>,
        cache: Arc<dyn OrderCache>,
        ttl: Duration,
        telemetry: Telemetry,
    ) -> Self {
        Self {
            store,
            cache,
            ttl,
            telemetry,
        }
    }

    /// Returns the order view, from the cache when present.
    ///
    /// On a miss the order (and its enrichment, only once completed) is read from the store and
    /// written back to the cache; a failed write-back is logged and ignored.
    ///
    /// # Errors
    /// [`ReadError::NotFound`] for an unknown order; cache read and store failures otherwise.
    pub async fn get_order(&self, order_id: Uuid) -> Result<OrderLookup, ReadError> {
        let key = cache_key(order_id);
        let metrics = self.telemetry.metrics();

        if let Some(body) = self.cache.get(&key).await? {
            metrics.cache_hits.inc();
            debug!(%order_id, "returning cached order");
            return Ok(OrderLookup {
                body,
                source: ViewSource::Cache,
            });
        }
        metrics.cache_misses.inc();

        let order = self
            .store
            .get_order(order_id)
            .await
            .map_err(ReadError::Store)?
            .ok_or(ReadError::NotFound(order_id))?;

        let enrichment = if order.status == OrderStatus::Completed {
            let enrichment = self
                .store
                .get_enrichment(order_id)
                .await
                .map_err(ReadError::Store)?;
            if enrichment.is_none() {
                warn!(%order_id, "completed order has no enrichment record");
            }
            enrichment
        } else {
            None
        };

        let body = serde_json::to_string(&OrderView {
            order: &order,
            order_enriched: enrichment.as_ref(),
        })?;

        match self.cache.set(&key, &body, self.ttl).await {
            Ok(()) => info!(%order_id, status = %order.status, "order view cached"),
            Err(error) => warn!(%order_id, %error, "could not save order to cache"),
        }

        Ok(OrderLookup {
            body,
            source: ViewSource::Store,
        })
    }
}
