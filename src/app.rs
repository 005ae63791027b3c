use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use sqlx::postgres::{PgPool, PgPoolOptions};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::{
    api,
    broker::{MessageBroker, RabbitMqBroker},
    cache::{OrderCache, RedisCache},
    config::Config,
    ingestion::IngestionGate,
    observability::Telemetry,
    pipeline::{
        EnrichmentHandler, FinalizationHandler, PipelineRunner, ProcessingHandler, RetryPolicy,
        SimulatedEnrichment, Stage, StageHandler,
    },
    reader::OrderReader,
    store::{OrderStore, PgOrderStore},
    util::shutdown::shutdown_signal,
};

#[derive(Clone)]
pub(crate) struct AppState {
    registry: Arc<ComponentRegistry>,
}

/// Shared handles for every process role: configuration, metrics and the three backends.
pub struct ComponentRegistry {
    config: Arc<Config>,
    telemetry: Telemetry,
    store: Arc<dyn OrderStore>,
    broker: Arc<dyn MessageBroker>,
    cache: Arc<dyn OrderCache>,
    gate: IngestionGate,
    reader: OrderReader,
}

impl AppState {
    pub(crate) fn new(registry: ComponentRegistry) -> Self {
        Self {
            registry: Arc::new(registry),
        }
    }

    pub(crate) fn telemetry(&self) -> &Telemetry {
        &self.registry.telemetry
    }

    pub(crate) fn config(&self) -> &Config {
        &self.registry.config
    }

    pub(crate) fn store(&self) -> &dyn OrderStore {
        self.registry.store.as_ref()
    }

    pub(crate) fn broker(&self) -> &dyn MessageBroker {
        self.registry.broker.as_ref()
    }

    pub(crate) fn cache(&self) -> &dyn OrderCache {
        self.registry.cache.as_ref()
    }

    pub(crate) fn gate(&self) -> &IngestionGate {
        &self.registry.gate
    }

    pub(crate) fn reader(&self) -> &OrderReader {
        &self.registry.reader
    }
}

impl ComponentRegistry {
    /// Connects to Postgres (lazily), RabbitMQ and Redis and declares the broker topology.
    ///
    /// # Errors
    /// Fails when the pool cannot be configured, or the broker or cache is unreachable.
    pub async fn connect(config: Config) -> Result<Self> {
        let telemetry = Telemetry::new()?;
        let pool = pool_options(&config)
            .connect_lazy(config.db_dsn())
            .context("failed to configure order database pool")?;
        let store: Arc<dyn OrderStore> = Arc::new(PgOrderStore::new(pool));

        let broker = RabbitMqBroker::connect(
            config.rabbitmq_url(),
            config.rabbitmq_prefetch(),
            config.enrichment_retry_delay(),
        )
        .await?;
        broker.declare_topology().await?;
        let broker: Arc<dyn MessageBroker> = Arc::new(broker);

        let cache: Arc<dyn OrderCache> = Arc::new(RedisCache::connect(config.redis_url()).await?);

        Ok(Self::from_parts(config, telemetry, store, broker, cache))
    }

    /// Assembles a registry from already-built backends.
    #[must_use]
    pub fn from_parts(
        config: Config,
        telemetry: Telemetry,
        store: Arc<dyn OrderStore>,
        broker: Arc<dyn MessageBroker>,
        cache: Arc<dyn OrderCache>,
    ) -> Self {
        let gate = IngestionGate::new(Arc::clone(&store), Arc::clone(&broker), telemetry.clone());
        let reader = OrderReader::new(
            Arc::clone(&store),
            Arc::clone(&cache),
            config.order_cache_ttl(),
            telemetry.clone(),
        );

        Self {
            config: Arc::new(config),
            telemetry,
            store,
            broker,
            cache,
            gate,
            reader,
        }
    }

    #[must_use]
    pub fn config(&self) -> Arc<Config> {
        Arc::clone(&self.config)
    }

    #[must_use]
    pub fn telemetry(&self) -> &Telemetry {
        &self.telemetry
    }

    #[must_use]
    pub fn ingestion_gate(&self) -> &IngestionGate {
        &self.gate
    }

    #[must_use]
    pub fn order_reader(&self) -> &OrderReader {
        &self.reader
    }

    /// Builds the handler for one pipeline stage from the configured backends.
    #[must_use]
    pub fn stage_handler(&self, stage: Stage) -> Arc<dyn StageHandler> {
        let store = Arc::clone(&self.store);
        let broker = Arc::clone(&self.broker);
        match stage {
            Stage::Processing => Arc::new(ProcessingHandler::new(store, broker)),
            Stage::Enrichment => {
                let provider = Arc::new(SimulatedEnrichment::new(
                    self.config.enrichment_failure_trigger(),
                    self.config.enrichment_work_duration(),
                ));
                let policy = RetryPolicy::new(
                    self.config.enrichment_max_retries(),
                    self.config.enrichment_retry_delay(),
                );
                Arc::new(EnrichmentHandler::new(
                    store,
                    broker,
                    provider,
                    policy,
                    self.telemetry.clone(),
                ))
            }
            Stage::Finalization => Arc::new(FinalizationHandler::new(store)),
        }
    }

    /// Consume loop for `stage`, ready to spawn.
    #[must_use]
    pub fn stage_runner(&self, stage: Stage) -> PipelineRunner {
        PipelineRunner::new(
            Arc::clone(&self.broker),
            self.stage_handler(stage),
            self.telemetry.clone(),
        )
    }
}

fn pool_options(config: &Config) -> PgPoolOptions {
    PgPoolOptions::new()
        .max_connections(config.db_max_connections())
        .min_connections(config.db_min_connections())
        .acquire_timeout(config.db_acquire_timeout())
        .idle_timeout(Some(config.db_idle_timeout()))
        .max_lifetime(Some(config.db_max_lifetime()))
        .test_before_acquire(true)
}

/// HTTP API: order creation and lookup, health, readiness and metrics.
pub fn build_router(registry: ComponentRegistry) -> Router {
    let state = AppState::new(registry);
    api::router(state)
}

/// Liveness and metrics for a stage worker.
pub fn build_probe_router(registry: ComponentRegistry) -> Router {
    let state = AppState::new(registry);
    api::probe_router(state)
}

/// Serves the HTTP API until SIGINT/SIGTERM, letting in-flight requests finish.
///
/// # Errors
/// Fails when the listener cannot bind or the server stops with an I/O error.
pub async fn run_api(registry: ComponentRegistry) -> Result<()> {
    let bind_addr = registry.config().http_bind();
    let router = build_router(registry);

    let listener = TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("failed to bind listener on {bind_addr}"))?;
    info!(%bind_addr, "order API listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("order API server failed")?;

    info!("order API stopped");
    Ok(())
}

/// Runs one stage consumer plus its probe server until a signal arrives or the consumer dies.
///
/// On a signal, intake stops and the in-flight delivery is settled before returning.
///
/// # Errors
/// Fails when the probe listener cannot bind or the consume loop ends with an error.
pub async fn run_worker(registry: ComponentRegistry, stage: Stage) -> Result<()> {
    let probe_addr = registry.config().probe_bind();
    let runner = registry.stage_runner(stage);
    let router = build_probe_router(registry);

    let listener = TcpListener::bind(probe_addr)
        .await
        .with_context(|| format!("failed to bind probe listener on {probe_addr}"))?;
    info!(%stage, %probe_addr, "stage worker probe listening");

    let shutdown = CancellationToken::new();
    let mut runner_task = runner.spawn(shutdown.child_token());

    let probe_shutdown = shutdown.clone();
    let probe_task = tokio::spawn(async move {
        axum::serve(listener, router)
            .with_graceful_shutdown(async move { probe_shutdown.cancelled().await })
            .await
    });

    let runner_result = tokio::select! {
        () = shutdown_signal() => {
            info!(%stage, "draining stage worker");
            shutdown.cancel();
            runner_task.await
        }
        result = &mut runner_task => {
            shutdown.cancel();
            result
        }
    };

    match probe_task.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(error = %e, "probe server exited with error"),
        Err(e) => warn!(error = %e, "probe server task panicked"),
    }

    let result = runner_result.context("stage runner task panicked")?;
    match &result {
        Ok(()) => info!(%stage, "stage worker stopped"),
        Err(e) => error!(%stage, error = %format!("{e:#}"), "stage worker failed"),
    }
    result
}

/// Applies the bundled SQL migrations.
///
/// # Errors
/// Fails when the database is unreachable or a migration cannot be applied.
pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool: PgPool = pool_options(config)
        .connect(config.db_dsn())
        .await
        .context("failed to connect to order database")?;

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .context("failed to apply migrations")?;

    info!("migrations applied");
    pool.close().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{InMemoryBroker, InMemoryCache, InMemoryOrderStore, test_config};

    fn registry() -> ComponentRegistry {
        ComponentRegistry::from_parts(
            test_config(&[]),
            Telemetry::new().expect("telemetry"),
            Arc::new(InMemoryOrderStore::new()),
            Arc::new(InMemoryBroker::new()),
            Arc::new(InMemoryCache::new()),
        )
    }

    #[test]
    fn stage_handlers_match_requested_stage() {
        let registry = registry();

        for stage in [Stage::Processing, Stage::Enrichment, Stage::Finalization] {
            assert_eq!(registry.stage_handler(stage).stage(), stage);
        }
    }

    #[tokio::test]
    async fn component_registry_connects_lazily_to_postgres() {
        // connect_lazy never touches the network.
        let config = test_config(&[]);
        let pool = pool_options(&config).connect_lazy(config.db_dsn());
        assert!(pool.is_ok());
    }

    #[test]
    fn app_state_exposes_registry_parts() {
        let state = AppState::new(registry());

        state.telemetry().record_ready_probe();
        let probes = &state.telemetry().metrics().probes;
        assert_eq!(probes.with_label_values(&["ready"]).get(), 1);
        assert_eq!(state.config().order_cache_ttl().as_secs(), 60);
    }
}
