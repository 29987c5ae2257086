//! HTTP surface: WebSocket upgrade, REST document endpoints and health.

use axum::{
    extract::{Path, Query, State, WebSocketUpgrade},
    http::{Method, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::broadcast;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::config::ServerConfig;
use crate::room::RoomRegistry;
use crate::storage::{Document, NewDocument, StorageError};
use crate::sync::protocol::UserInfo;
use crate::sync::pump::serve_connection;
use crate::sync::SyncError;

// ============================================================================
// APPLICATION STATE
// ============================================================================

/// Shared application state
pub struct AppState {
    registry: Arc<RoomRegistry>,
    config: ServerConfig,
    started_at: Instant,
    /// Storage errors swallowed by the rooms since startup
    persistence_failures: Arc<AtomicU64>,
}

impl AppState {
    /// Must be called inside a tokio runtime: it starts the task counting
    /// persistence failures.
    pub fn new(registry: Arc<RoomRegistry>, config: ServerConfig) -> Self {
        let persistence_failures = Arc::new(AtomicU64::new(0));

        let mut failures = registry.subscribe_failures();
        let counter = persistence_failures.clone();
        tokio::spawn(async move {
            loop {
                match failures.recv().await {
                    Ok(_) => {
                        counter.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        counter.fetch_add(missed, Ordering::Relaxed);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        Self {
            registry,
            config,
            started_at: Instant::now(),
            persistence_failures,
        }
    }
}

// ============================================================================
// API TYPES
// ============================================================================

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: String,
    version: String,
    uptime_seconds: u64,
    active_rooms: usize,
    persistence_failures: u64,
}

#[derive(Debug, Serialize)]
struct RoomUsersResponse {
    room_id: String,
    users: Vec<UserInfo>,
}

#[derive(Debug, Deserialize)]
struct JoinParams {
    username: Option<String>,
}

/// Error body for every failed REST call
#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

struct ApiError(StatusCode, String);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.0, Json(ErrorResponse { error: self.1 })).into_response()
    }
}

impl From<StorageError> for ApiError {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::NotFound(_) => ApiError(StatusCode::NOT_FOUND, e.to_string()),
            StorageError::AlreadyExists(_) => ApiError(StatusCode::CONFLICT, e.to_string()),
            _ => {
                error!("Storage failure: {}", e);
                ApiError(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
            }
        }
    }
}

impl From<SyncError> for ApiError {
    fn from(e: SyncError) -> Self {
        if e.is_not_found() {
            ApiError(StatusCode::NOT_FOUND, e.to_string())
        } else {
            warn!("Room unavailable: {}", e);
            ApiError(StatusCode::SERVICE_UNAVAILABLE, e.to_string())
        }
    }
}

type ApiResult<T> = Result<T, ApiError>;

// ============================================================================
// HTTP HANDLERS
// ============================================================================

/// Health check endpoint
async fn health_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: state.started_at.elapsed().as_secs(),
        active_rooms: state.registry.room_count().await,
        persistence_failures: state.persistence_failures.load(Ordering::Relaxed),
    })
}

async fn create_document(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<NewDocument>,
) -> ApiResult<Json<Document>> {
    let doc = state.registry.store().create(payload).await?;
    info!(document = %doc.id, "Created document");
    Ok(Json(doc))
}

async fn list_documents(State(state): State<Arc<AppState>>) -> ApiResult<Json<Vec<Document>>> {
    Ok(Json(state.registry.store().list().await?))
}

async fn get_document(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Document>> {
    Ok(Json(state.registry.store().get(&id).await?))
}

async fn delete_document(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    state.registry.store().delete(&id).await?;
    info!(document = %id, "Deleted document");
    Ok(StatusCode::NO_CONTENT)
}

async fn room_users(
    State(state): State<Arc<AppState>>,
    Path(room_id): Path<String>,
) -> ApiResult<Json<RoomUsersResponse>> {
    let room = state.registry.get_or_create(&room_id).await?;
    let users = room.members().await?;
    Ok(Json(RoomUsersResponse { room_id, users }))
}

// ============================================================================
// WEBSOCKET HANDLER
// ============================================================================

/// WebSocket upgrade handler. The room is resolved before upgrading, so a
/// missing or unreachable document rejects the request outright.
async fn ws_handler(
    ws: WebSocketUpgrade,
    Path(room_id): Path<String>,
    Query(params): Query<JoinParams>,
    State(state): State<Arc<AppState>>,
) -> ApiResult<Response> {
    let username = params
        .username
        .filter(|name| !name.trim().is_empty())
        .unwrap_or_else(|| "Anonymous".to_string());
    info!(room = %room_id, username = %username, "WebSocket upgrade request");

    let room = state.registry.get_or_create(&room_id).await?;
    let pump = state.config.pump.clone();

    Ok(ws
        .max_message_size(pump.max_frame_bytes)
        .on_upgrade(move |socket| serve_connection(socket, room, username, pump)))
}

// ============================================================================
// ROUTER
// ============================================================================

pub fn build_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_check))
        .route("/api/documents", get(list_documents).post(create_document))
        .route(
            "/api/documents/:id",
            get(get_document).delete(delete_document),
        )
        .route("/api/rooms/:room_id/users", get(room_users))
        .route("/ws/:room_id", get(ws_handler))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
