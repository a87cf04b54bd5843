//! HTTP API
//!
//! - GET  /health                                  - liveness
//! - GET  /metrics                                 - Prometheus metrics
//! - GET  /status                                  - per-chain sync and queue state
//! - POST /chains/{chain}/outbound                 - open a signing session
//! - POST /chains/{chain}/signatures/{home_tx_hash} - offer a custodian signature
//! - POST /chains/{chain}/mark-deleted             - schedule record deletion

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use eyre::eyre;
use futures::future::join_all;
use prometheus::{Encoder, TextEncoder};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::BridgeError;
use crate::metrics;
use crate::runtime::{BridgeRuntime, ChainRuntime};
use crate::types::{CustodianSignature, OutboundRequest};
use crate::writers::{OutboundSigningSession, SignatureCheck};

#[derive(Clone)]
pub struct AppState {
    pub runtime: Arc<BridgeRuntime>,
    pub started: Instant,
}

#[derive(Serialize)]
pub struct StatusResponse {
    pub status: String,
    pub uptime_seconds: u64,
    pub chains: Vec<ChainStatusInfo>,
}

#[derive(Serialize)]
pub struct ChainStatusInfo {
    pub name: String,
    pub chain_id: u16,
    pub family: String,
    pub custodian_address: String,
    pub is_custodian: bool,
    pub last_scanned_height: u64,
    pub queue_depth: usize,
    pub open_sessions: usize,
}

#[derive(Serialize)]
pub struct SessionInfo {
    pub home_tx_hash: String,
    pub kind: String,
    pub signatures: usize,
    pub required: usize,
    pub send_order: usize,
    pub waiting_end_time: i64,
    pub max_waiting_end_time: i64,
    pub broadcast_tx_hash: Option<String>,
}

impl From<&OutboundSigningSession> for SessionInfo {
    fn from(session: &OutboundSigningSession) -> Self {
        Self {
            home_tx_hash: session.home_tx_hash.clone(),
            kind: session.kind().to_string(),
            signatures: session.signatures.len(),
            required: session.custodians.m(),
            send_order: session.send_order,
            waiting_end_time: session.waiting_end_time,
            max_waiting_end_time: session.max_waiting_end_time,
            broadcast_tx_hash: session.broadcast_tx_hash.clone(),
        }
    }
}

#[derive(Serialize)]
pub struct SignatureResponse {
    pub result: String,
}

#[derive(Debug, Deserialize)]
pub struct MarkDeletedRequest {
    pub external_tx_hash: String,
    pub deletion_height: u64,
}

#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// Map an engine error onto an HTTP status
fn error_response(e: BridgeError) -> Response {
    let status = match &e {
        BridgeError::Validation(_) | BridgeError::Payload(_) => StatusCode::BAD_REQUEST,
        BridgeError::InsufficientFunds { .. } => StatusCode::CONFLICT,
        BridgeError::Transient(_) | BridgeError::Home(_) => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(ErrorResponse { error: e.to_string() })).into_response()
}

fn unknown_chain(chain: &str) -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(ErrorResponse {
            error: format!("unknown chain {}", chain),
        }),
    )
        .into_response()
}

fn find_chain<'a>(state: &'a AppState, chain: &str) -> Option<&'a ChainRuntime> {
    state.runtime.chain(chain)
}

async fn health() -> &'static str {
    "OK"
}

async fn prometheus_metrics() -> Response {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();

    if encoder.encode(&metric_families, &mut buffer).is_err() {
        return (StatusCode::INTERNAL_SERVER_ERROR, "Failed to encode metrics").into_response();
    }

    match Response::builder()
        .header(header::CONTENT_TYPE, encoder.format_type())
        .body(axum::body::Body::from(buffer))
    {
        Ok(resp) => resp,
        Err(_) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to build metrics response",
        )
            .into_response(),
    }
}

async fn chain_status(chain: &ChainRuntime) -> ChainStatusInfo {
    let ctx = &chain.ctx;
    let open_sessions = ctx
        .store
        .list_sessions(&ctx.name)
        .await
        .map(|s| s.len())
        .unwrap_or(0);
    ChainStatusInfo {
        name: ctx.name.clone(),
        chain_id: ctx.chain_id,
        family: ctx.family.name().to_string(),
        custodian_address: ctx.family.custodian_address().to_string(),
        is_custodian: ctx.status.is_custodian(),
        last_scanned_height: ctx.status.last_scanned(),
        queue_depth: ctx.queue.len().await,
        open_sessions,
    }
}

async fn status(State(state): State<AppState>) -> Json<StatusResponse> {
    let chains = join_all(state.runtime.chains().iter().map(chain_status)).await;
    Json(StatusResponse {
        status: "ok".to_string(),
        uptime_seconds: state.started.elapsed().as_secs(),
        chains,
    })
}

async fn submit_outbound(
    State(state): State<AppState>,
    Path(chain): Path<String>,
    Json(request): Json<OutboundRequest>,
) -> Response {
    let Some(runtime) = find_chain(&state, &chain) else {
        return unknown_chain(&chain);
    };
    match runtime.coordinator.submit(request).await {
        Ok(session) => Json(SessionInfo::from(&session)).into_response(),
        Err(e) => {
            warn!(chain = %chain, error = %e, "Outbound request refused");
            error_response(e)
        }
    }
}

async fn submit_signature(
    State(state): State<AppState>,
    Path((chain, home_tx_hash)): Path<(String, String)>,
    Json(signature): Json<CustodianSignature>,
) -> Response {
    let Some(runtime) = find_chain(&state, &chain) else {
        return unknown_chain(&chain);
    };
    match runtime.coordinator.add_signature(&home_tx_hash, signature).await {
        Ok(check) => {
            let result = match check {
                SignatureCheck::Added => "added",
                SignatureCheck::Duplicate => "duplicate",
                SignatureCheck::NotCustodian => "not_custodian",
                SignatureCheck::Invalid => "invalid",
                SignatureCheck::Closed => "closed",
            };
            Json(SignatureResponse {
                result: result.to_string(),
            })
            .into_response()
        }
        Err(e) => error_response(e),
    }
}

async fn mark_deleted(
    State(state): State<AppState>,
    Path(chain): Path<String>,
    Json(request): Json<MarkDeletedRequest>,
) -> Response {
    let Some(runtime) = find_chain(&state, &chain) else {
        return unknown_chain(&chain);
    };
    match runtime
        .mark_deleted(&request.external_tx_hash, request.deletion_height)
        .await
    {
        Ok(true) => StatusCode::NO_CONTENT.into_response(),
        Ok(false) => StatusCode::NOT_FOUND.into_response(),
        Err(e) => error_response(e),
    }
}

pub fn router(runtime: Arc<BridgeRuntime>) -> Router {
    let state = AppState {
        runtime,
        started: Instant::now(),
    };
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(prometheus_metrics))
        .route("/status", get(status))
        .route("/chains/{chain}/outbound", post(submit_outbound))
        .route(
            "/chains/{chain}/signatures/{home_tx_hash}",
            post(submit_signature),
        )
        .route("/chains/{chain}/mark-deleted", post(mark_deleted))
        .with_state(state)
}

/// Serve the API until the listener fails
pub async fn start_api_server(port: u16, runtime: Arc<BridgeRuntime>) -> eyre::Result<()> {
    let addr: SocketAddr = format!("0.0.0.0:{}", port)
        .parse()
        .map_err(|e| eyre!("Invalid API port {}: {}", port, e))?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "API server started");

    metrics::UP.set(1.0);
    axum::serve(listener, router(runtime)).await?;
    Ok(())
}
