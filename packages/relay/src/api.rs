//! Operations API
//!
//! Endpoints:
//! - GET /health         - Relay status and per-queue health (JSON)
//! - GET /healthz        - Liveness check
//! - GET /metrics        - Prometheus metrics
//! - GET /messages/{src_chain}/{id} - State history of one message; the
//!   source chain is a name or numeric id

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use prometheus::{Encoder, TextEncoder};
use serde::Serialize;
use std::str::FromStr;
use tracing::{error, info};

use crate::core::{HealthReport, RelayHealth};
use crate::db::MessageStore;
use crate::types::{ChainId, MessageKey, StateRecord};

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn MessageStore>,
    pub health: Arc<RelayHealth>,
}

#[derive(Serialize)]
pub struct MessageHistory {
    pub src_chain: &'static str,
    pub id: String,
    pub history: Vec<StateRecord>,
}

async fn health_check(State(state): State<AppState>) -> Json<HealthReport> {
    Json(state.health.report())
}

/// Liveness check (always returns OK if server is running)
async fn liveness() -> &'static str {
    "OK"
}

async fn prometheus_metrics() -> Response {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();

    if encoder.encode(&metric_families, &mut buffer).is_err() {
        return (StatusCode::INTERNAL_SERVER_ERROR, "Failed to encode metrics").into_response();
    }

    ([(header::CONTENT_TYPE, encoder.format_type().to_string())], buffer).into_response()
}

async fn message_history(
    State(state): State<AppState>,
    Path((src_chain, id)): Path<(String, String)>,
) -> Response {
    let Ok(src_chain) = ChainId::from_str(&src_chain) else {
        return (StatusCode::NOT_FOUND, "Unknown source chain").into_response();
    };
    let key = MessageKey::new(src_chain, id);

    match state.store.history(&key).await {
        Ok(history) if history.is_empty() => {
            (StatusCode::NOT_FOUND, "Unknown message id").into_response()
        }
        Ok(history) => Json(MessageHistory {
            src_chain: src_chain.name(),
            id: key.id,
            history,
        })
        .into_response(),
        Err(e) => {
            error!(message = %key, error = %e, "Failed to load message history");
            (StatusCode::INTERNAL_SERVER_ERROR, "Failed to load message history").into_response()
        }
    }
}

pub fn api_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/healthz", get(liveness))
        .route("/metrics", get(prometheus_metrics))
        .route("/messages/{src_chain}/{id}", get(message_history))
        .with_state(state)
}

/// Serve the operations API until the process exits
pub async fn start_api_server(port: u16, state: AppState) -> eyre::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!("Operations API listening on {}", addr);
    info!("  /health         - Relay status (JSON)");
    info!("  /metrics        - Prometheus metrics");
    info!("  /messages/{{src_chain}}/{{id}} - Message state history");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, api_router(state)).await?;

    Ok(())
}
