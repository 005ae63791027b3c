use axum::{
    Json,
    extract::{Path, State, rejection::JsonRejection},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde::Serialize;
use tracing::{error, warn};
use uuid::Uuid;

use super::error_response;
use crate::app::AppState;
use crate::ingestion::{Admission, AdmitError, OrderRequest};
use crate::reader::{ReadError, ViewSource};

pub(crate) const IDEMPOTENCY_HEADER: &str = "X-Idempotency-Key";

#[derive(Debug, Serialize)]
struct CreateOrderResponse {
    order_id: Uuid,
    message: &'static str,
}

pub(crate) async fn create_order(
    State(state): State<AppState>,
    headers: HeaderMap,
    payload: Result<Json<OrderRequest>, JsonRejection>,
) -> Response {
    let Json(request) = match payload {
        Ok(payload) => payload,
        Err(rejection) => {
            warn!(error = %rejection.body_text(), "rejected malformed order body");
            return error_response(StatusCode::BAD_REQUEST, "Invalid request body");
        }
    };

    let token = headers
        .get(IDEMPOTENCY_HEADER)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();

    match state.gate().admit(token, request).await {
        Ok(Admission::Created(order)) => (
            StatusCode::CREATED,
            Json(CreateOrderResponse {
                order_id: order.id,
                message: "Order created successfully",
            }),
        )
            .into_response(),
        Ok(Admission::AlreadyExists(order_id)) => (
            StatusCode::OK,
            Json(CreateOrderResponse {
                order_id,
                message: "Order already exists.",
            }),
        )
            .into_response(),
        Ok(Admission::Invalid(errors)) => error_response(StatusCode::BAD_REQUEST, errors),
        Err(AdmitError::MissingToken) => error_response(
            StatusCode::BAD_REQUEST,
            format!("Header {IDEMPOTENCY_HEADER} empty"),
        ),
        Err(e) => {
            error!(error = %e, "order admission failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to create order")
        }
    }
}

pub(crate) async fn get_order(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let Ok(order_id) = Uuid::parse_str(&id) else {
        return error_response(StatusCode::BAD_REQUEST, "Invalid order ID");
    };

    match state.reader().get_order(order_id).await {
        Ok(lookup) => {
            let cache = match lookup.source {
                ViewSource::Cache => "HIT",
                ViewSource::Store => "MISS",
            };
            (
                StatusCode::OK,
                [
                    (
                        header::CONTENT_TYPE,
                        HeaderValue::from_static("application/json"),
                    ),
                    (
                        header::HeaderName::from_static("x-cache"),
                        HeaderValue::from_static(cache),
                    ),
                ],
                lookup.body,
            )
                .into_response()
        }
        Err(ReadError::NotFound(_)) => error_response(StatusCode::NOT_FOUND, "Order not found"),
        Err(e) => {
            error!(%order_id, error = %e, "order lookup failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to get order")
        }
    }
}
