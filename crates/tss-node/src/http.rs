//! HTTP control plane
//!
//! A thin axum surface over [`TssServer`]: liveness, identity, status
//! counters, and the two POST operations. Malformed bodies are a 400,
//! structural failures (missing pool state, broken serialization) a 500;
//! protocol failures are a 200 whose body carries `status: Fail` plus the
//! blame, so callers can act on the culprits.

use crate::server::TssServer;
use crate::{keygen, keysign, NodeError};
use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::info;

/// Build the control-plane router.
pub fn router(server: Arc<TssServer>) -> Router {
    Router::new()
        .route("/ping", get(ping))
        .route("/p2pid", get(p2p_id))
        .route("/status", get(status))
        .route("/keygen", post(do_keygen))
        .route("/keysign", post(do_keysign))
        .layer(TraceLayer::new_for_http())
        .with_state(server)
}

/// Serve the control plane until the shutdown future resolves.
pub async fn serve(
    server: Arc<TssServer>,
    addr: SocketAddr,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> crate::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "control plane listening");
    axum::serve(listener, router(server))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

async fn ping() -> StatusCode {
    StatusCode::OK
}

async fn p2p_id(State(server): State<Arc<TssServer>>) -> String {
    server.local_peer_id().to_string()
}

async fn status(State(server): State<Arc<TssServer>>) -> impl IntoResponse {
    Json(server.status())
}

fn error_response(err: NodeError) -> Response {
    let code = match err {
        NodeError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (code, err.to_string()).into_response()
}

async fn do_keygen(
    State(server): State<Arc<TssServer>>,
    payload: Result<Json<keygen::Request>, JsonRejection>,
) -> Response {
    let Json(req) = match payload {
        Ok(json) => json,
        Err(rejection) => {
            return (StatusCode::BAD_REQUEST, rejection.to_string()).into_response();
        }
    };
    match server.keygen(req).await {
        Ok(resp) => Json(resp).into_response(),
        Err(e) => error_response(e),
    }
}

async fn do_keysign(
    State(server): State<Arc<TssServer>>,
    payload: Result<Json<keysign::Request>, JsonRejection>,
) -> Response {
    let Json(req) = match payload {
        Ok(json) => json,
        Err(rejection) => {
            return (StatusCode::BAD_REQUEST, rejection.to_string()).into_response();
        }
    };
    match server.keysign(req).await {
        Ok(resp) => Json(resp).into_response(),
        Err(e) => error_response(e),
    }
}
