// src/api/mod.rs — HTTP surface over the broker

pub mod auth;
pub mod handlers;
pub mod types;

use axum::http::HeaderValue;
use axum::routing::{get, post};
use axum::Router;
use std::sync::Arc;
use tower_http::cors::CorsLayer;

use crate::core::Broker;
use crate::infra::config::ServerConfig;

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub broker: Arc<Broker>,
    /// Operator token for create and abort. `None` disables the check.
    pub token: Option<String>,
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let allowed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|o| match o.parse::<HeaderValue>() {
            Ok(v) => Some(v),
            Err(_) => {
                tracing::warn!("Ignoring invalid CORS origin '{}'", o);
                None
            }
        })
        .collect();

    CorsLayer::new()
        .allow_origin(allowed)
        .allow_methods(tower_http::cors::Any)
        .allow_headers(tower_http::cors::Any)
}

/// Build the axum router with all API routes.
pub fn build_router(state: ApiState, allowed_origins: &[String]) -> Router {
    Router::new()
        .route("/api/v1/sessions", post(handlers::create_session))
        .route("/api/v1/sessions/{id}", get(handlers::get_session))
        .route("/api/v1/sessions/{id}/accept", post(handlers::accept_session))
        .route("/api/v1/sessions/{id}/abort", post(handlers::abort_session))
        .route("/api/v1/health", get(handlers::health))
        .layer(cors_layer(allowed_origins))
        .with_state(state)
}

/// Serve the API until Ctrl-C.
pub async fn start_server(config: &ServerConfig, state: ApiState) -> anyhow::Result<()> {
    let addr = config.addr();
    let router = build_router(state, &config.allowed_origins);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("API server listening on http://{addr}");
    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for shutdown signal: {}", e);
                std::future::pending::<()>().await;
            }
            tracing::info!("Shutting down");
        })
        .await?;
    Ok(())
}
