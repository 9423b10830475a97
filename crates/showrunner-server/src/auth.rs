//! Shared API-key authentication

use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};

use crate::error::ApiError;
use crate::state::AppState;

pub const API_KEY_HEADER: &str = "x-api-key";

/// Reject requests without a valid `X-API-Key` header
pub async fn require_api_key(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let provided = request
        .headers()
        .get(API_KEY_HEADER)
        .and_then(|value| value.to_str().ok());

    match provided {
        Some(key) if constant_time_compare(key, &state.settings.api_key) => {
            next.run(request).await
        }
        Some(_) => {
            tracing::warn!("Rejected request with invalid API key");
            ApiError::Unauthenticated("Invalid API key".to_string()).into_response()
        }
        None => ApiError::Unauthenticated("Missing X-API-Key header".to_string()).into_response(),
    }
}

/// Constant-time string comparison (prevents timing attacks)
fn constant_time_compare(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut result = 0u8;
    for (x, y) in a.bytes().zip(b.bytes()) {
        result |= x ^ y;
    }
    result == 0
}
