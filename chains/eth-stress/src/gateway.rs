//! Async Completion Gateway
//!
//! With `eth_sendTransactionAsync` the node answers later by POSTing
//! `{id, txHash, error}` to the advertised callback URL. Successful
//! completions are pushed into the tracker intake, the same channel the
//! synchronous workers use; failed ones are logged and dropped.

use anyhow::{Context, Result};
use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use core_logic::LoadCounters;
use ethers::types::TxHash;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::tracker::Submission;

pub const CALLBACK_PATH: &str = "/sendTransactionAsync";

/// Body of one async completion callback.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CallbackPayload {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub tx_hash: String,
    #[serde(default)]
    pub error: String,
}

#[derive(Clone)]
struct GatewayState {
    intake: mpsc::Sender<Submission>,
    counters: Arc<LoadCounters>,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

#[derive(Debug)]
struct GatewayError {
    status: StatusCode,
    message: String,
}

impl GatewayError {
    fn new<S: Into<String>>(status: StatusCode, message: S) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let payload = Json(ErrorResponse {
            error: self.message,
        });
        (self.status, payload).into_response()
    }
}

pub fn build_router(intake: mpsc::Sender<Submission>, counters: Arc<LoadCounters>) -> Router {
    Router::new()
        .route(CALLBACK_PATH, post(handle_callback))
        .with_state(GatewayState { intake, counters })
}

async fn handle_callback(
    State(state): State<GatewayState>,
    payload: Result<Json<CallbackPayload>, JsonRejection>,
) -> Result<StatusCode, GatewayError> {
    let Json(payload) = payload.map_err(|rejection| {
        warn!(error = %rejection.body_text(), "Failed to decode callback payload");
        GatewayError::new(StatusCode::BAD_REQUEST, rejection.body_text())
    })?;

    debug!(id = %payload.id, tx_hash = %payload.tx_hash, "Received callback");

    if !payload.error.is_empty() {
        error!(id = %payload.id, error = %payload.error, "Async transaction failed");
        state.counters.record_failed();
        return Err(GatewayError::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            payload.error,
        ));
    }

    let hash: TxHash = payload.tx_hash.parse().map_err(|_| {
        warn!(id = %payload.id, tx_hash = %payload.tx_hash, "Callback carries an invalid hash");
        GatewayError::new(StatusCode::BAD_REQUEST, "invalid txHash")
    })?;

    // The callback is the first time this hash is seen
    state
        .intake
        .send((hash, Instant::now()))
        .await
        .map_err(|_| GatewayError::new(StatusCode::SERVICE_UNAVAILABLE, "tracker stopped"))?;

    Ok(StatusCode::OK)
}

/// Callback receiver bound to its listening address.
pub struct AsyncGateway {
    listener: TcpListener,
    router: Router,
}

impl AsyncGateway {
    pub async fn bind(
        addr: &str,
        intake: mpsc::Sender<Submission>,
        counters: Arc<LoadCounters>,
    ) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind callback listener on {addr}"))?;
        Ok(Self {
            listener,
            router: build_router(intake, counters),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Serves callbacks until `shutdown` fires.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        info!(addr = ?self.local_addr().ok(), "Async callback server listening");
        axum::serve(self.listener, self.router)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await
            .context("Async callback server terminated unexpectedly")
    }
}
