//! HTTP surface for the coordinator
//!
//! `POST /rpc` and `POST /msg` are the ingress for hosts and peer services:
//! a JSON envelope is turned into an [`Event::Request`] and, for `/rpc`, the
//! handler's reply is relayed back as the HTTP response. The remaining
//! endpoints are the read-only admin/status surface.

use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use std::net::SocketAddr;
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::oneshot;
use tower_http::trace::TraceLayer;

use super::rpc::Request;
use super::server::{AdminQuery, Event};

#[derive(Clone)]
pub struct AppState {
    pub events: UnboundedSender<Event>,
}

/// Envelope for inbound RPC: the logical sender address plus the message.
///
/// The sender is carried in the body rather than taken from the socket
/// because hosts identify themselves by their registered internal address,
/// not by whatever ephemeral port the HTTP client picked.
#[derive(Debug, Deserialize)]
pub struct RpcEnvelope {
    pub from: SocketAddr,
    #[serde(flatten)]
    pub request: Request,
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/rpc", post(rpc))
        .route("/msg", post(msg))
        .route("/health", get(health))
        .route("/status", get(status))
        .route("/hosts", get(hosts))
        .route("/backup-chain", get(backup_chain))
        .route("/shutdown", post(shutdown))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Request/reply ingress. A handler that drops the reply sink (silent
/// rejection) surfaces as 204, which callers treat as "try again later".
async fn rpc(State(state): State<AppState>, Json(envelope): Json<RpcEnvelope>) -> impl IntoResponse {
    let (tx, rx) = oneshot::channel();
    let event = Event::Request {
        from: envelope.from,
        req: envelope.request,
        reply: Some(tx),
    };
    if state.events.send(event).is_err() {
        return (StatusCode::SERVICE_UNAVAILABLE, Json(json!({"error": "coordinator stopped"})))
            .into_response();
    }

    match rx.await {
        Ok(reply) => Json(reply).into_response(),
        Err(_) => StatusCode::NO_CONTENT.into_response(),
    }
}

/// Fire-and-forget ingress.
async fn msg(State(state): State<AppState>, Json(envelope): Json<RpcEnvelope>) -> impl IntoResponse {
    let event = Event::Request {
        from: envelope.from,
        req: envelope.request,
        reply: None,
    };
    if state.events.send(event).is_err() {
        return StatusCode::SERVICE_UNAVAILABLE;
    }
    StatusCode::ACCEPTED
}

async fn health() -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn status(State(state): State<AppState>) -> impl IntoResponse {
    match admin_query(&state, AdminQuery::Status).await {
        Some(status) => Json(status).into_response(),
        None => StatusCode::SERVICE_UNAVAILABLE.into_response(),
    }
}

async fn hosts(State(state): State<AppState>) -> impl IntoResponse {
    let (tx, rx) = oneshot::channel();
    if state.events.send(Event::Admin(AdminQuery::Hosts(tx))).is_err() {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }
    match rx.await {
        Ok(hosts) => {
            let total = hosts.len();
            Json(json!({ "hosts": hosts, "total": total })).into_response()
        }
        Err(_) => StatusCode::SERVICE_UNAVAILABLE.into_response(),
    }
}

async fn backup_chain(State(state): State<AppState>) -> impl IntoResponse {
    let (tx, rx) = oneshot::channel();
    if state
        .events
        .send(Event::Admin(AdminQuery::BackupChain(tx)))
        .is_err()
    {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }
    match rx.await {
        Ok(chain) => Json(json!({ "entries": chain.entries() })).into_response(),
        Err(_) => StatusCode::SERVICE_UNAVAILABLE.into_response(),
    }
}

/// Operator-initiated immediate stop of the whole fleet.
async fn shutdown(State(state): State<AppState>) -> impl IntoResponse {
    let (tx, rx) = oneshot::channel();
    let event = Event::Request {
        from: "127.0.0.1:0".parse().expect("static addr"),
        req: Request::Shutdown {
            shutdown_others: true,
        },
        reply: Some(tx),
    };
    if state.events.send(event).is_err() {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }
    match rx.await {
        Ok(_) => Json(json!({ "status": "shutting down" })).into_response(),
        Err(_) => StatusCode::SERVICE_UNAVAILABLE.into_response(),
    }
}

async fn admin_query(
    state: &AppState,
    make: impl FnOnce(oneshot::Sender<serde_json::Value>) -> AdminQuery,
) -> Option<serde_json::Value> {
    let (tx, rx) = oneshot::channel();
    state.events.send(Event::Admin(make(tx))).ok()?;
    rx.await.ok()
}
