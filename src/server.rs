//! `RelayServer`: axum HTTP + WebSocket surface.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;

use axum::extract::{DefaultBodyLimit, Multipart, Path, State};
use axum::response::Json;
use axum::routing::{get, post};
use axum::Router;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tower_http::cors::CorsLayer;
use tower_http::services::{ServeDir, ServeFile};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::config::RelayConfig;
use crate::error::RelayError;
use crate::relay::SignalingRelay;
use crate::signaling_server::websocket_handler;
use crate::upload::{AUDIO_ROUTE, MediaUploadBridge, UploadReceipt};

/// Shared state accessible from axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub relay: Arc<SignalingRelay>,
    pub uploads: Arc<MediaUploadBridge>,
    /// WebSocket connections currently open, logged in or not.
    pub open_sockets: Arc<AtomicUsize>,
    pub start_time: Instant,
}

pub struct RelayServer {
    config: RelayConfig,
    state: AppState,
}

impl RelayServer {
    pub fn new(config: RelayConfig, relay: Arc<SignalingRelay>) -> Self {
        let uploads = Arc::new(MediaUploadBridge::new(relay.session().clone(), &config));
        Self {
            state: AppState {
                relay,
                uploads,
                open_sockets: Arc::new(AtomicUsize::new(0)),
                start_time: Instant::now(),
            },
            config,
        }
    }

    /// Build the router with every route and layer.
    pub fn router(&self) -> Router {
        // Multipart framing overhead on top of the audio itself.
        let body_limit = self.config.max_upload_bytes + 64 * 1024;

        let router = Router::new()
            .route("/ws", get(websocket_handler))
            .route("/health", get(health_handler))
            .route("/api/auth/login", post(login_handler))
            .route("/api/groups", get(list_groups).post(create_group))
            .route("/api/groups/:name/history", get(group_history))
            .route("/api/users", get(list_users))
            .route("/api/messages/group/audio", post(upload_audio))
            .nest_service(AUDIO_ROUTE, ServeDir::new(&self.config.audio_dir));

        let router = match &self.config.web_root {
            Some(root) => {
                info!(web_root = %root.display(), "serving static client");
                router.fallback_service(
                    ServeDir::new(root).not_found_service(ServeFile::new(root.join("index.html"))),
                )
            }
            None => router,
        };

        router
            .with_state(self.state.clone())
            .layer(DefaultBodyLimit::max(body_limit))
            .layer(CorsLayer::permissive())
            .layer(TraceLayer::new_for_http())
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }
}

/// Health check response body.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// Always `"ok"` while the server is running.
    pub status: String,
    pub uptime_secs: u64,
    /// Open WebSocket connections.
    pub connections: usize,
    /// Identities currently bound to a connection.
    pub bound_identities: usize,
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".into(),
        uptime_secs: state.start_time.elapsed().as_secs(),
        connections: state.open_sockets.load(Ordering::Relaxed),
        bound_identities: state.relay.registry().len(),
    })
}

#[derive(Debug, Deserialize)]
struct LoginRequest {
    #[serde(default)]
    username: String,
}

/// POST /api/auth/login. Logs in without a push target.
async fn login_handler(
    State(state): State<AppState>,
    Json(req): Json<LoginRequest>,
) -> Result<Json<Value>, RelayError> {
    let username = non_empty(req.username, "username")?;
    state.relay.session().rest_login(&username).await?;
    Ok(Json(json!({ "status": "success", "user": username })))
}

/// GET /api/groups
async fn list_groups(State(state): State<AppState>) -> Result<Json<Value>, RelayError> {
    let groups = state.relay.session().get_groups().await?;
    Ok(Json(json!({ "status": "success", "data": { "groups": groups } })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateGroupRequest {
    #[serde(default)]
    group_name: String,
    #[serde(default)]
    creator_username: String,
}

/// POST /api/groups
async fn create_group(
    State(state): State<AppState>,
    Json(req): Json<CreateGroupRequest>,
) -> Result<Json<Value>, RelayError> {
    let name = non_empty(req.group_name, "groupName")?;
    let creator = non_empty(req.creator_username, "creatorUsername")?;
    if !state.relay.create_group(&name, &creator).await? {
        return Err(RelayError::AlreadyExists(format!("group `{name}`")));
    }
    info!(group = %name, %creator, "group created");
    Ok(Json(json!({ "status": "success", "data": { "groupName": name } })))
}

/// GET /api/users
async fn list_users(State(state): State<AppState>) -> Result<Json<Value>, RelayError> {
    let users = state.relay.session().get_connected_users().await?;
    Ok(Json(json!({ "status": "success", "data": { "users": users } })))
}

/// GET /api/groups/:name/history
async fn group_history(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<Value>, RelayError> {
    let messages = state.relay.session().get_history(&name).await?;
    Ok(Json(json!({ "status": "success", "data": { "messages": messages } })))
}

/// POST /api/messages/group/audio
async fn upload_audio(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<Json<UploadReceipt>, RelayError> {
    let staged = state.uploads.stage(multipart).await?;
    Ok(Json(state.uploads.deliver(staged).await?))
}

fn non_empty(value: String, field: &str) -> Result<String, RelayError> {
    if value.trim().is_empty() {
        return Err(RelayError::InvalidPayload(format!("`{field}` must not be empty")));
    }
    Ok(value)
}
