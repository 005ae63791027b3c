use std::future::Future;
use std::time::Duration;

use axum::{Json, extract::State, http::StatusCode};
use serde::Serialize;
use tracing::error;

use crate::app::AppState;

#[derive(Debug, Serialize)]
#[serde(rename_all = "snake_case")]
pub(crate) struct HealthReport {
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<String>,
}

impl HealthReport {
    fn ready() -> Self {
        Self {
            status: "ready",
            detail: None,
        }
    }

    fn degraded(detail: impl Into<String>) -> Self {
        Self {
            status: "degraded",
            detail: Some(detail.into()),
        }
    }
}

async fn probe<F, E>(name: &str, timeout: Duration, check: F) -> Result<(), String>
where
    F: Future<Output = Result<(), E>>,
    E: std::fmt::Display,
{
    match tokio::time::timeout(timeout, check).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(error)) => {
            error!(dependency = name, %error, "readiness check failed");
            Err(format!("{name}: {error}"))
        }
        Err(_) => {
            error!(
                dependency = name,
                timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                "readiness check timed out"
            );
            Err(format!("{name}: timed out"))
        }
    }
}

/// Checks store, broker and cache connectivity, each under the readiness timeout.
pub(crate) async fn ready(
    State(state): State<AppState>,
) -> Result<Json<HealthReport>, (StatusCode, Json<HealthReport>)> {
    state.telemetry().record_ready_probe();
    let timeout = state.config().readiness_timeout();

    let checks = [
        probe("database", timeout, async {
            state.store().ping().await.map_err(|e| format!("{e:#}"))
        })
        .await,
        probe("broker", timeout, state.broker().ping()).await,
        probe("cache", timeout, state.cache().ping()).await,
    ];

    if let Some(Err(detail)) = checks.into_iter().find(Result::is_err) {
        return Err((
            StatusCode::SERVICE_UNAVAILABLE,
            Json(HealthReport::degraded(detail)),
        ));
    }

    Ok(Json(HealthReport::ready()))
}

pub(crate) async fn live(State(state): State<AppState>) -> Json<HealthReport> {
    state.telemetry().record_live_probe();
    Json(HealthReport {
        status: "alive",
        detail: None,
    })
}
