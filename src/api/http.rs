//! HTTP Administration API
//!
//! REST surface for operators and tooling. Every route translates to the
//! same operations the RPC layer exposes; the consensus rules (leader-only
//! membership changes, Busy during elections) are enforced by the shared
//! guarded operations, not here.

use std::sync::Arc;
use axum::{
    extract::{Json, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tower_http::trace::TraceLayer;

use crate::config::ApiConfig;
use crate::node::{guarded_add_nodes, guarded_remove_nodes};
use crate::replication::{CommandExecutionRecord, ReplicationController, ReplicationState};
use crate::state::{ElectionMachine, Membership, Role};
use crate::error::{Error, Result};

/// Shared application state
pub struct AppState {
    pub machine: Arc<ElectionMachine>,
    pub membership: Arc<Membership>,
    pub controller: Arc<ReplicationController>,
}

/// HTTP API server
pub struct HttpServer {
    config: ApiConfig,
    state: Arc<AppState>,
}

impl HttpServer {
    /// Create a new HTTP server
    pub fn new(
        config: ApiConfig,
        machine: Arc<ElectionMachine>,
        membership: Arc<Membership>,
        controller: Arc<ReplicationController>,
    ) -> Self {
        let state = Arc::new(AppState {
            machine,
            membership,
            controller,
        });

        Self { config, state }
    }

    /// Create the router
    fn create_router(state: Arc<AppState>) -> Router {
        Router::new()
            .route("/status", get(handle_status))
            .route("/nodes", get(handle_nodes))
            .route("/health", get(handle_health))
            .route("/commands", get(handle_commands))
            .route("/cluster/add", post(handle_add))
            .route("/cluster/remove", post(handle_remove))
            .route("/admin/idle", post(handle_idle))
            .route("/admin/activate", post(handle_activate))
            .route("/admin/backup", post(handle_backup))
            .layer(TraceLayer::new_for_http())
            .with_state(state)
    }

    /// Serve until the shutdown signal flips
    pub async fn start(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        if !self.config.enabled {
            tracing::info!("HTTP API disabled");
            return Ok(());
        }

        let app = Self::create_router(Arc::clone(&self.state));

        let listener = tokio::net::TcpListener::bind(&self.config.bind_address).await?;
        tracing::info!("HTTP API listening on {}", self.config.bind_address);

        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                while !*shutdown.borrow() {
                    if shutdown.changed().await.is_err() {
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

#[derive(Debug, Serialize)]
struct StatusBody {
    node: String,
    role: String,
    term: u64,
    leader: Option<String>,
    config_version: u64,
    degraded: bool,
    replication_inconsistent: bool,
    replication: ReplicationState,
    peers: Vec<PeerBody>,
}

#[derive(Debug, Serialize)]
struct PeerBody {
    address: String,
    role: String,
    voting: bool,
    suspected: bool,
    last_contact_ms: Option<u64>,
    joined_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Serialize)]
struct NodeBody {
    address: String,
    role: String,
}

#[derive(Debug, Deserialize)]
struct MembershipRequest {
    addresses: Vec<String>,
}

#[derive(Debug, Serialize)]
struct MembershipBody {
    version: u64,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    leader: Option<String>,
    message: String,
}

fn error_response(error: Error) -> axum::response::Response {
    let (status, body) = match &error {
        Error::NotLeader(leader) => (
            StatusCode::CONFLICT,
            ErrorBody {
                error: "not_leader".into(),
                leader: leader.clone(),
                message: error.to_string(),
            },
        ),
        Error::Busy(_) => (
            StatusCode::SERVICE_UNAVAILABLE,
            ErrorBody {
                error: "busy".into(),
                leader: None,
                message: error.to_string(),
            },
        ),
        Error::NodeNotFound(_) => (
            StatusCode::NOT_FOUND,
            ErrorBody {
                error: "node_not_found".into(),
                leader: None,
                message: error.to_string(),
            },
        ),
        Error::Config(_) | Error::State(_) => (
            StatusCode::BAD_REQUEST,
            ErrorBody {
                error: "bad_request".into(),
                leader: None,
                message: error.to_string(),
            },
        ),
        Error::Persist(_) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            ErrorBody {
                error: "halted".into(),
                leader: None,
                message: error.to_string(),
            },
        ),
        _ => (
            StatusCode::INTERNAL_SERVER_ERROR,
            ErrorBody {
                error: "internal".into(),
                leader: None,
                message: error.to_string(),
            },
        ),
    };
    (status, Json(body)).into_response()
}

// ============ Handlers ============

async fn handle_status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let status = state.machine.status().await;
    let body = StatusBody {
        node: status.address,
        role: status.role.to_string(),
        term: status.term,
        leader: status.leader,
        config_version: state.membership.version().await,
        degraded: status.degraded,
        replication_inconsistent: status.replication_inconsistent,
        replication: state.controller.replication_state().await,
        peers: state
            .membership
            .peer_statuses()
            .await
            .into_iter()
            .map(|p| PeerBody {
                address: p.address,
                role: p.role.to_string(),
                voting: p.voting,
                suspected: p.suspected,
                last_contact_ms: p.last_contact_ms,
                joined_at: p.joined_at,
            })
            .collect(),
    };
    Json(body)
}

async fn handle_nodes(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let mut nodes = vec![NodeBody {
        address: state.machine.address().to_string(),
        role: state.machine.role().await.to_string(),
    }];
    for peer in state.membership.peers().await {
        nodes.push(NodeBody {
            address: peer.address,
            role: peer.role.to_string(),
        });
    }
    Json(nodes)
}

async fn handle_health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.controller.executor().ping().await {
        Ok(()) => (StatusCode::OK, Json(serde_json::json!({ "status": "ok" }))),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({ "status": "degraded", "message": e.to_string() })),
        ),
    }
}

async fn handle_commands(State(state): State<Arc<AppState>>) -> Json<Vec<CommandExecutionRecord>> {
    Json(state.controller.records().await)
}

async fn handle_add(
    State(state): State<Arc<AppState>>,
    Json(request): Json<MembershipRequest>,
) -> axum::response::Response {
    match guarded_add_nodes(&state.machine, &state.membership, &request.addresses).await {
        Ok(version) => Json(MembershipBody { version }).into_response(),
        Err(e) => error_response(e),
    }
}

async fn handle_remove(
    State(state): State<Arc<AppState>>,
    Json(request): Json<MembershipRequest>,
) -> axum::response::Response {
    match guarded_remove_nodes(&state.machine, &state.membership, &request.addresses).await {
        Ok(version) => Json(MembershipBody { version }).into_response(),
        Err(e) => error_response(e),
    }
}

async fn handle_idle(State(state): State<Arc<AppState>>) -> axum::response::Response {
    match state.machine.set_idle().await {
        Ok(()) => Json(serde_json::json!({ "role": Role::Idle.to_string() })).into_response(),
        Err(e) => error_response(e),
    }
}

async fn handle_activate(State(state): State<Arc<AppState>>) -> axum::response::Response {
    match state.machine.activate().await {
        Ok(()) => Json(serde_json::json!({ "role": Role::Follower.to_string() })).into_response(),
        Err(e) => error_response(e),
    }
}

async fn handle_backup(State(state): State<Arc<AppState>>) -> axum::response::Response {
    match state.controller.backup().await {
        Ok(record) => Json(record).into_response(),
        Err(e) => error_response(e),
    }
}
