use axum::{
    extract::{Request, State},
    http::{StatusCode, header::AUTHORIZATION},
    middleware::Next,
    response::Response,
};
use subtle::ConstantTimeEq;
use tracing::{error, warn};

use super::error_response;
use crate::app::AppState;

/// Requires `Authorization: Bearer <token>` matching the configured API token.
pub(crate) async fn require_bearer(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let Some(expected) = state.config().api_auth_token() else {
        error!("ORDER_API_AUTH_TOKEN is not set; refusing authenticated request");
        return error_response(StatusCode::INTERNAL_SERVER_ERROR, "API auth token not set");
    };

    let Some(header) = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
    else {
        return error_response(StatusCode::UNAUTHORIZED, "Authorization header required");
    };

    let mut parts = header.split(' ');
    let (Some("Bearer"), Some(token), None) = (parts.next(), parts.next(), parts.next()) else {
        return error_response(
            StatusCode::UNAUTHORIZED,
            "Invalid Authorization header format",
        );
    };

    if !tokens_match(token, expected) {
        warn!("rejected request with invalid bearer token");
        return error_response(StatusCode::UNAUTHORIZED, "Invalid token");
    }

    next.run(request).await
}

/// Compares in time independent of where the first differing byte is. Length still leaks.
fn tokens_match(presented: &str, expected: &str) -> bool {
    presented.as_bytes().ct_eq(expected.as_bytes()).into()
}

#[cfg(test)]
mod tests {
    use super::tokens_match;

    #[test]
    fn only_the_exact_token_matches() {
        assert!(tokens_match("test-token", "test-token"));
        assert!(!tokens_match("test-tokem", "test-token"));
        assert!(!tokens_match("test-token-2", "test-token"));
        assert!(!tokens_match("test", "test-token"));
        assert!(!tokens_match("", "test-token"));
    }
}
