// src/api/types.rs

use serde::{Deserialize, Serialize};

/// Request body for creating a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateSessionRequest {
    pub source_paths: Vec<String>,
    pub destination_path: String,
}

/// Health check response.
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub sessions: usize,
}

/// Error response body.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    /// Stable machine-readable error kind.
    pub kind: String,
}
