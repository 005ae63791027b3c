pub(crate) mod auth;
pub(crate) mod health;
pub(crate) mod metrics;
pub(crate) mod orders;

use axum::{
    Json, Router,
    http::StatusCode,
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Serialize;
use tower_http::trace::TraceLayer;

use crate::app::AppState;

#[derive(Debug, Serialize)]
pub(crate) struct ErrorResponse<T: Serialize> {
    error: T,
}

pub(crate) fn error_response<T: Serialize>(status: StatusCode, error: T) -> Response {
    (status, Json(ErrorResponse { error })).into_response()
}

pub(crate) fn router(state: AppState) -> Router {
    let create_order = post(orders::create_order).layer(middleware::from_fn_with_state(
        state.clone(),
        auth::require_bearer,
    ));

    Router::new()
        .route("/orders", create_order)
        .route("/orders/{id}", get(orders::get_order))
        .route("/healthz", get(health::live))
        .route("/readyz", get(health::ready))
        .route("/metrics", get(metrics::exporter))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Liveness and metrics only, for stage worker processes.
pub(crate) fn probe_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(health::live))
        .route("/metrics", get(metrics::exporter))
        .with_state(state)
}
