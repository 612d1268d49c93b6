// src/api/auth.rs
//
// The operator token guards sender-side actions. Receiver-side routes are
// authorized by the session id itself, which is the capability in the link.

use crate::api::{types::ErrorResponse, ApiState};
use axum::http::{HeaderMap, StatusCode};
use axum::Json;

/// Verify the operator bearer token if one is configured.
pub fn check_operator(
    state: &ApiState,
    headers: &HeaderMap,
) -> Result<(), (StatusCode, Json<ErrorResponse>)> {
    let Some(ref expected) = state.token else {
        return Ok(());
    };

    let presented = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .unwrap_or("");

    if constant_time_eq(presented.as_bytes(), expected.as_bytes()) {
        Ok(())
    } else {
        Err((
            StatusCode::UNAUTHORIZED,
            Json(ErrorResponse {
                error: "Invalid or missing operator token".into(),
                kind: "unauthorized".into(),
            }),
        ))
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |diff, (x, y)| diff | (x ^ y)) == 0
}
