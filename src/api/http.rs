//! HTTP API Server
//!
//! Admin REST API: health, local status, cluster node listing (a live
//! refresh of the group) and node detach.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::config::ApiConfig;
use crate::coordinator::{Coordinator, LifecycleState};
use crate::error::{Error, ErrorKind, Result};
use crate::protocol::NodeInfoResponse;
use crate::state::NodeId;

/// Longest collection window a nodes request may ask for
const MAX_REFRESH_TIMEOUT: Duration = Duration::from_secs(60);

/// Shared application state
pub struct AppState {
    pub coordinator: Arc<Coordinator>,
    /// Used when a nodes request does not name its own timeout
    pub refresh_timeout: Duration,
}

/// HTTP API server
pub struct HttpServer {
    config: ApiConfig,
    state: Arc<AppState>,
}

impl HttpServer {
    /// Create a new HTTP server
    pub fn new(config: ApiConfig, coordinator: Arc<Coordinator>, refresh_timeout: Duration) -> Self {
        let state = Arc::new(AppState {
            coordinator,
            refresh_timeout,
        });

        Self { config, state }
    }

    /// Create the router
    pub fn router(&self) -> Router {
        let router = Router::new()
            .route("/health", get(handle_health))
            .route("/status", get(handle_status))
            .route("/cluster/nodes", get(handle_nodes))
            .route("/cluster/nodes/:node_id/detach", post(handle_detach))
            .layer(TraceLayer::new_for_http())
            .with_state(Arc::clone(&self.state));

        if self.config.cors_enabled {
            router.layer(CorsLayer::new().allow_origin(Any).allow_methods(Any))
        } else {
            router
        }
    }

    /// Start the HTTP server
    pub async fn start(&self) -> Result<()> {
        if !self.config.enabled {
            tracing::info!("HTTP API disabled");
            return Ok(());
        }

        let listener = tokio::net::TcpListener::bind(&self.config.bind_address).await?;
        tracing::info!("HTTP API listening on {}", self.config.bind_address);

        axum::serve(listener, self.router()).await?;
        Ok(())
    }
}

// ============ Request/Response Types ============

/// Health response
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub healthy: bool,
    pub lifecycle: LifecycleState,
    pub node_id: Option<NodeId>,
    pub is_master: bool,
}

/// Query for `GET /cluster/nodes`
#[derive(Debug, Default, Deserialize)]
pub struct NodesQuery {
    pub timeout_ms: Option<u64>,
}

/// Result of a cluster refresh
#[derive(Debug, Serialize, Deserialize)]
pub struct NodesResponse {
    pub timeout_ms: u64,
    pub master: Option<NodeId>,
    pub nodes: Vec<NodeInfoResponse>,
}

/// Detach acknowledgement; the target may not have left yet
#[derive(Debug, Serialize, Deserialize)]
pub struct DetachResponse {
    pub accepted: bool,
    pub node_id: NodeId,
}

/// Error response
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
    /// Repeating the request may succeed
    pub retryable: bool,
}

fn error_response(err: &Error) -> Response {
    let status = match err.kind() {
        ErrorKind::Detach => StatusCode::CONFLICT,
        ErrorKind::Refresh | ErrorKind::Transport => StatusCode::SERVICE_UNAVAILABLE,
        ErrorKind::Config => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };

    (
        status,
        Json(ErrorResponse {
            error: err.to_string(),
            code: err.kind().to_string(),
            retryable: err.is_retryable(),
        }),
    )
        .into_response()
}

// ============ Handlers ============

async fn handle_health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let coordinator = &state.coordinator;
    let healthy = coordinator.lifecycle() == LifecycleState::Active;
    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(HealthResponse {
            healthy,
            lifecycle: coordinator.lifecycle(),
            node_id: coordinator.local_id(),
            is_master: coordinator.is_master(),
        }),
    )
}

async fn handle_status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.coordinator.status())
}

async fn handle_nodes(
    State(state): State<Arc<AppState>>,
    Query(query): Query<NodesQuery>,
) -> Response {
    let requested = query
        .timeout_ms
        .map(Duration::from_millis)
        .unwrap_or(state.refresh_timeout);
    let timeout = requested.min(MAX_REFRESH_TIMEOUT);
    if timeout < requested {
        tracing::debug!("Capping refresh timeout {:?} to {:?}", requested, timeout);
    }

    match state.coordinator.refresh(timeout).await {
        Ok(nodes) => Json(NodesResponse {
            timeout_ms: timeout.as_millis() as u64,
            master: nodes.iter().find(|n| n.is_master).map(|n| n.node_id),
            nodes,
        })
        .into_response(),
        Err(e) => error_response(&e),
    }
}

async fn handle_detach(
    State(state): State<Arc<AppState>>,
    Path(node_id): Path<u64>,
) -> Response {
    let node_id = NodeId(node_id);
    match state.coordinator.detach(node_id) {
        Ok(()) => (
            StatusCode::ACCEPTED,
            Json(DetachResponse {
                accepted: true,
                node_id,
            }),
        )
            .into_response(),
        Err(e) => {
            tracing::warn!("Detach of node {} rejected: {}", node_id, e);
            error_response(&e)
        }
    }
}
