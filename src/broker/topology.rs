use std::fmt;

/// Direct exchange every pipeline event is published to.
pub const ORDER_EVENTS_EXCHANGE: &str = "order.events";
/// Dead-letter exchange for rejected enrichment deliveries.
pub const ORDER_EVENTS_RETRY_EXCHANGE: &str = "order.events.retry";
/// Delay queue; expired messages dead-letter back to [`ORDER_EVENTS_EXCHANGE`].
pub const ENRICHMENT_RETRY_QUEUE: &str = "order.enrichment.requested.retry";

/// Event routes between pipeline stages. Each route's queue shares its name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Route {
    OrderCreated,
    EnrichmentRequested,
    OrderEnriched,
}

impl Route {
    pub const ALL: [Route; 3] = [
        Route::OrderCreated,
        Route::EnrichmentRequested,
        Route::OrderEnriched,
    ];

    #[must_use]
    pub fn routing_key(self) -> &'static str {
        match self {
            Route::OrderCreated => "order.created",
            Route::EnrichmentRequested => "order.enrichment.requested",
            Route::OrderEnriched => "order.enriched",
        }
    }

    #[must_use]
    pub fn queue(self) -> &'static str {
        self.routing_key()
    }

    /// Whether rejected deliveries on this route come back after the retry delay.
    #[must_use]
    pub fn has_retry_queue(self) -> bool {
        matches!(self, Route::EnrichmentRequested)
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.routing_key())
    }
}
