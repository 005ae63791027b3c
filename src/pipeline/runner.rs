use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result, bail};
use futures::StreamExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::StageHandler;
use crate::broker::{Delivery, MessageBroker};
use crate::observability::Telemetry;

/// Consume loop binding one [`StageHandler`] to its inbound queue.
///
/// Deliveries are handled one at a time. Cancellation stops intake between deliveries; a
/// delivery already being handled always runs to completion and is settled first.
pub struct PipelineRunner {
    broker: Arc<dyn MessageBroker>,
    handler: Arc<dyn StageHandler>,
    telemetry: Telemetry,
}

impl PipelineRunner {
    #[must_use]
    pub fn new(
        broker: Arc<dyn MessageBroker>,
        handler: Arc<dyn StageHandler>,
        telemetry: Telemetry,
    ) -> Self {
        Self {
            broker,
            handler,
            telemetry,
        }
    }

    /// Runs the loop on its own task.
    #[must_use]
    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<Result<()>> {
        tokio::spawn(async move { self.run(shutdown).await })
    }

    /// Consumes until `shutdown` is cancelled.
    ///
    /// # Errors
    /// Fails when the subscription cannot be opened or the delivery stream breaks or ends.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        let stage = self.handler.stage();
        let route = stage.inbound_route();
        let mut deliveries = self
            .broker
            .consume(route)
            .await
            .with_context(|| format!("failed to subscribe {stage} stage to {route}"))?;

        info!(%stage, %route, "pipeline runner started");

        loop {
            let next = tokio::select! {
                biased;
                () = shutdown.cancelled() => {
                    info!(%stage, "shutdown requested; pipeline runner stopping");
                    return Ok(());
                }
                next = deliveries.next() => next,
            };

            match next {
                Some(Ok(delivery)) => self.process(delivery).await,
                Some(Err(e)) => {
                    return Err(anyhow::Error::new(e)
                        .context(format!("delivery stream for {route} failed")));
                }
                None => bail!("delivery stream for {route} closed"),
            }
        }
    }

    async fn process(&self, delivery: Delivery) {
        let stage = self.handler.stage();
        let metrics = self.telemetry.metrics();
        let redeliveries = delivery.redeliveries();
        let started = Instant::now();

        let result = self.handler.handle(&delivery).await;
        metrics
            .handler_duration
            .with_label_values(&[stage.as_str()])
            .observe(started.elapsed().as_secs_f64());

        let (settled, outcome) = match result {
            Ok(()) => (delivery.ack().await, "acked"),
            Err(error) => {
                warn!(%stage, redeliveries, error = %error, "stage handler failed; rejecting delivery");
                (delivery.reject().await, "rejected")
            }
        };

        metrics
            .deliveries
            .with_label_values(&[stage.as_str(), outcome])
            .inc();

        if let Err(e) = settled {
            error!(%stage, error = %e, outcome, "failed to settle delivery");
        }
    }
}
