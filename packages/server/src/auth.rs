// ABOUTME: Bearer token authentication middleware for the /mcp endpoint
// ABOUTME: Rejects requests before any body parsing happens

use axum::{
    extract::{Request, State},
    http::{header, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use subtle::ConstantTimeEq;
use tracing::warn;

use crate::state::AppState;

const BEARER_PREFIX: &str = "Bearer ";

/// Require a valid bearer token on the request.
///
/// Runs ahead of JSON parsing so unauthenticated clients never reach the
/// JSON-RPC layer.
pub async fn require_bearer(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let header = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok());

    let Some(header) = header else {
        warn!("request without Authorization header");
        return unauthorized("Missing Authorization header");
    };

    let Some(token) = header.strip_prefix(BEARER_PREFIX) else {
        warn!("malformed Authorization header");
        return unauthorized("Invalid Authorization header format");
    };

    if !token_matches(token, &state.api_token) {
        warn!("invalid API token presented");
        return unauthorized("Invalid API token");
    }

    next.run(request).await
}

/// Constant-time token comparison; never reports which byte differed.
fn token_matches(presented: &str, expected: &str) -> bool {
    presented.as_bytes().ct_eq(expected.as_bytes()).into()
}

fn unauthorized(message: &str) -> Response {
    (StatusCode::UNAUTHORIZED, Json(json!({ "error": message }))).into_response()
}
