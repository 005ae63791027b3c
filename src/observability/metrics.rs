//! Prometheus metric definitions.

use prometheus::{
    HistogramVec, IntCounter, IntCounterVec, Registry, register_histogram_vec_with_registry,
    register_int_counter_vec_with_registry, register_int_counter_with_registry,
};
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct Metrics {
    // Ingestion
    pub orders_admitted: IntCounterVec,

    // Stage deliveries
    pub deliveries: IntCounterVec,
    pub enrichment_retries: IntCounter,
    pub enrichment_exhausted: IntCounter,

    // Read path
    pub cache_hits: IntCounter,
    pub cache_misses: IntCounter,

    pub handler_duration: HistogramVec,

    // Health endpoints
    pub probes: IntCounterVec,
}

impl Metrics {
    /// Registers every collector in `registry`.
    ///
    /// # Errors
    /// Returns an error when a metric with the same name is already registered.
    pub fn new(registry: Arc<Registry>) -> Result<Self, prometheus::Error> {
        Ok(Self {
            orders_admitted: register_int_counter_vec_with_registry!(
                "order_admissions_total",
                "Order admissions by outcome (created, already_exists, invalid)",
                &["outcome"],
                registry
            )?,
            deliveries: register_int_counter_vec_with_registry!(
                "order_stage_deliveries_total",
                "Stage deliveries by stage and settlement (acked, rejected)",
                &["stage", "outcome"],
                registry
            )?,
            enrichment_retries: register_int_counter_with_registry!(
                "order_enrichment_retries_total",
                "Enrichment deliveries rejected into the retry delay queue",
                registry
            )?,
            enrichment_exhausted: register_int_counter_with_registry!(
                "order_enrichment_exhausted_total",
                "Orders failed after exhausting enrichment retries",
                registry
            )?,
            cache_hits: register_int_counter_with_registry!(
                "order_cache_hits_total",
                "Order reads served from the cache",
                registry
            )?,
            cache_misses: register_int_counter_with_registry!(
                "order_cache_misses_total",
                "Order reads that fell through to the store",
                registry
            )?,
            handler_duration: register_histogram_vec_with_registry!(
                "order_stage_handler_duration_seconds",
                "Stage handler latency",
                &["stage"],
                vec![0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0],
                registry
            )?,
            probes: register_int_counter_vec_with_registry!(
                "order_health_probes_total",
                "Health endpoint hits by probe (live, ready)",
                &["probe"],
                registry
            )?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registers_in_isolated_registries() {
        let first = Metrics::new(Arc::new(Registry::new())).expect("first registry");
        let second = Metrics::new(Arc::new(Registry::new())).expect("second registry");

        first.cache_hits.inc();

        assert_eq!(first.cache_hits.get(), 1);
        assert_eq!(second.cache_hits.get(), 0);
    }

    #[test]
    fn duplicate_registration_fails() {
        let registry = Arc::new(Registry::new());
        Metrics::new(Arc::clone(&registry)).expect("first registration");

        assert!(Metrics::new(registry).is_err());
    }
}
