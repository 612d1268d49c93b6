// src/api/handlers.rs

use crate::api::{auth, types::*, ApiState};
use crate::core::{AcceptRequest, CreatedSession, SessionId, SessionStatus};
use crate::infra::errors::BrokerError;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::Json;

type ApiError = (StatusCode, Json<ErrorResponse>);

/// Map a broker error onto an HTTP status and body.
pub fn error_response(err: BrokerError) -> ApiError {
    let status = match &err {
        BrokerError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        BrokerError::UnknownSession => StatusCode::NOT_FOUND,
        BrokerError::SessionExpired => StatusCode::GONE,
        BrokerError::InvalidTransition { .. } => StatusCode::CONFLICT,
        BrokerError::KeyInstallFailed(_) => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status == StatusCode::INTERNAL_SERVER_ERROR {
        tracing::error!("Request failed: {}", err);
    }
    (
        status,
        Json(ErrorResponse {
            error: err.to_string(),
            kind: err.kind().to_string(),
        }),
    )
}

/// POST /api/v1/sessions — Mint a key and open a session.
pub async fn create_session(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Json(body): Json<CreateSessionRequest>,
) -> Result<(StatusCode, Json<CreatedSession>), ApiError> {
    auth::check_operator(&state, &headers)?;

    let created = state
        .broker
        .create_session(body.source_paths, body.destination_path)
        .map_err(error_response)?;
    Ok((StatusCode::CREATED, Json(created)))
}

/// GET /api/v1/sessions/{id}
pub async fn get_session(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<Json<SessionStatus>, ApiError> {
    let status = state
        .broker
        .status(&SessionId::from(id))
        .map_err(error_response)?;
    Ok(Json(status))
}

/// POST /api/v1/sessions/{id}/accept — Receiver consents; returns once the key is installed.
pub async fn accept_session(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(body): Json<AcceptRequest>,
) -> Result<Json<SessionStatus>, ApiError> {
    let status = state
        .broker
        .accept(&SessionId::from(id), body)
        .await
        .map_err(error_response)?;
    Ok(Json(status))
}

/// POST /api/v1/sessions/{id}/abort
pub async fn abort_session(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<SessionStatus>, ApiError> {
    auth::check_operator(&state, &headers)?;

    let status = state
        .broker
        .abort(&SessionId::from(id))
        .map_err(error_response)?;
    Ok(Json(status))
}

/// GET /api/v1/health
pub async fn health(State(state): State<ApiState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".into(),
        version: env!("CARGO_PKG_VERSION").into(),
        sessions: state.broker.store().len(),
    })
}
