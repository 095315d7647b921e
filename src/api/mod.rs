//! HTTP API for health checks, readiness and request status

use crate::config::ApiConfig;
use crate::error::{TxmError, TxmResult};
use crate::txm::{RequestStatus, Txm};

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub txm: Arc<Txm>,
}

pub fn router(txm: Arc<Txm>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/inflight", get(get_inflight))
        .route("/requests/:key", get(get_request))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(AppState { txm })
}

/// Run the HTTP API server
pub async fn run_server(config: ApiConfig, txm: Arc<Txm>) -> TxmResult<()> {
    let addr = format!("{}:{}", config.host, config.port);
    info!("Starting API server on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| TxmError::Config(format!("cannot bind API server to {}: {}", addr, e)))?;
    axum::serve(listener, router(txm))
        .await
        .map_err(|e| TxmError::Internal(format!("API server failed: {}", e)))
}

/// Liveness
async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let components = state.txm.health_report();
    let healthy = components.values().all(Option::is_none);
    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        Json(HealthResponse {
            status: if healthy { "ok" } else { "degraded" }.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            components,
        }),
    )
}

async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    let ready = state.txm.ready();
    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        Json(ReadinessResponse {
            ready,
            service: state.txm.name().to_string(),
        }),
    )
}

/// Queued and unconfirmed counts, total and per sender
async fn get_inflight(State(state): State<AppState>) -> impl IntoResponse {
    let (queued, unconfirmed) = state.txm.inflight_count();
    let senders = state
        .txm
        .senders()
        .into_iter()
        .filter_map(|sender| {
            state.txm.sender_inflight(&sender).map(|(queued, unconfirmed)| SenderInflight {
                sender: sender.to_string(),
                queued,
                unconfirmed,
            })
        })
        .collect();
    Json(InflightResponse {
        queued,
        unconfirmed,
        senders,
    })
}

async fn get_request(State(state): State<AppState>, Path(key): Path<String>) -> impl IntoResponse {
    match state.txm.request_state(&key) {
        Some(status) => (StatusCode::OK, Json(RequestResponse::Found(status))),
        None => (
            StatusCode::NOT_FOUND,
            Json(RequestResponse::Missing {
                error: format!("no request {}", key),
            }),
        ),
    }
}

// Response types

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
    components: BTreeMap<String, Option<String>>,
}

#[derive(Serialize)]
struct ReadinessResponse {
    ready: bool,
    service: String,
}

#[derive(Serialize)]
struct SenderInflight {
    sender: String,
    queued: usize,
    unconfirmed: usize,
}

#[derive(Serialize)]
struct InflightResponse {
    queued: usize,
    unconfirmed: usize,
    senders: Vec<SenderInflight>,
}

#[derive(Serialize)]
#[serde(untagged)]
enum RequestResponse {
    Found(RequestStatus),
    Missing { error: String },
}
