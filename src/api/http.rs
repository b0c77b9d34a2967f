//! HTTP API Server
//!
//! REST API for writes, status queries, and replica-set administration.

use std::sync::Arc;
use axum::{
    extract::{Json, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::config::ApiConfig;
use crate::error::{Error, Result};
use crate::node::ReplicaNode;
use crate::replication::{LogPosition, Operation, WriteConcern};
use crate::topology::{MemberId, Term};

/// Shared application state
pub struct AppState {
    pub node: Arc<ReplicaNode>,
}

/// HTTP API server
pub struct HttpServer {
    config: ApiConfig,
    state: Arc<AppState>,
}

impl HttpServer {
    /// Create a new HTTP server
    pub fn new(config: ApiConfig, node: Arc<ReplicaNode>) -> Self {
        Self {
            config,
            state: Arc::new(AppState { node }),
        }
    }

    /// Create the router
    pub fn create_router(state: Arc<AppState>, cors_enabled: bool) -> Router {
        let router = Router::new()
            // Writes
            .route("/write", post(handle_write))
            // Status and info
            .route("/health", get(handle_health))
            .route("/status", get(handle_status))
            .route("/topology", get(handle_topology))
            // Admin operations
            .route("/admin/stepdown", post(handle_stepdown))
            .with_state(state)
            .layer(TraceLayer::new_for_http());

        if cors_enabled {
            router.layer(CorsLayer::permissive())
        } else {
            router
        }
    }

    /// Serve until `shutdown` turns true
    pub async fn start(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        if !self.config.enabled {
            tracing::info!("HTTP API disabled");
            return Ok(());
        }

        let app = Self::create_router(Arc::clone(&self.state), self.config.cors_enabled);

        let listener = tokio::net::TcpListener::bind(&self.config.bind_address).await?;
        tracing::info!("HTTP API listening on {}", self.config.bind_address);

        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                while shutdown.changed().await.is_ok() {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            })
            .await
            .map_err(|e| Error::Network(format!("HTTP server error: {}", e)))?;

        Ok(())
    }
}

// ============ Request/Response Types ============

/// Write request
#[derive(Debug, Deserialize, Serialize)]
pub struct WriteRequest {
    pub operation: Operation,
    /// `"majority"` or a member count; the configured default when absent
    #[serde(default)]
    pub write_concern: Option<WriteConcern>,
}

/// Write response
#[derive(Debug, Serialize, Deserialize)]
pub struct WriteResponse {
    pub success: bool,
    pub position: LogPosition,
    pub term: Term,
    pub acked: usize,
}

/// Health response
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub healthy: bool,
    pub member_id: MemberId,
    pub state: String,
    pub primary: Option<MemberId>,
}

/// Step-down response
#[derive(Debug, Serialize, Deserialize)]
pub struct StepDownResponse {
    pub success: bool,
    pub term: Term,
}

/// Error response
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

// ============ Handlers ============

async fn handle_write(
    State(state): State<Arc<AppState>>,
    Json(req): Json<WriteRequest>,
) -> Response {
    match state.node.write(req.operation, req.write_concern).await {
        Ok(ack) => Json(WriteResponse {
            success: true,
            position: ack.position,
            term: ack.term,
            acked: ack.acked,
        })
        .into_response(),
        Err(e) => error_response(e),
    }
}

async fn handle_health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let election = state.node.election().state().await;
    Json(HealthResponse {
        healthy: true,
        member_id: state.node.self_id(),
        state: election.name().to_string(),
        primary: state.node.topology().primary().await.map(|(id, _)| id),
    })
}

async fn handle_status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.node.status().await)
}

async fn handle_topology(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.node.topology().summary().await)
}

async fn handle_stepdown(State(state): State<Arc<AppState>>) -> Response {
    match state.node.step_down().await {
        Ok(term) => Json(StepDownResponse { success: true, term }).into_response(),
        Err(e) => error_response(e),
    }
}

fn error_response(error: Error) -> Response {
    let (status, code) = match &error {
        Error::QuorumUnavailable { .. } => (StatusCode::SERVICE_UNAVAILABLE, "QUORUM_UNAVAILABLE"),
        Error::NotPrimary { .. } => (StatusCode::CONFLICT, "NOT_PRIMARY"),
        Error::Config(_) => (StatusCode::BAD_REQUEST, "BAD_REQUEST"),
        Error::ShuttingDown => (StatusCode::SERVICE_UNAVAILABLE, "SHUTTING_DOWN"),
        _ => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL"),
    };

    if status.is_server_error() {
        tracing::warn!("Request failed: {}", error);
    }

    (
        status,
        Json(ErrorResponse {
            error: error.to_string(),
            code: code.to_string(),
        }),
    )
        .into_response()
}
