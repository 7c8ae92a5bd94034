use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, Request, State};
use axum::http::HeaderMap;
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tandem_core::models::GLOBAL_METADATA_KEY;
use tandem_core::protocol::{
    Authority, BulkSyncRequest, BulkSyncResponse, ChangesResponse, ChannelMessage, ConflictBody,
    ItemResult, PushItem, WriteAccepted, WriteOutcome,
};
use tokio::sync::broadcast;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::config::AppConfig;
use crate::error::AppError;

const NOTIFICATION_CAPACITY: usize = 256;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    authority: Arc<Authority>,
    notifications: broadcast::Sender<ChannelMessage>,
}

impl AppState {
    pub fn from_config(config: Arc<AppConfig>) -> Self {
        Self::with_authority(config, Arc::new(Authority::new()))
    }

    pub fn with_authority(config: Arc<AppConfig>, authority: Arc<Authority>) -> Self {
        let (notifications, _) = broadcast::channel(NOTIFICATION_CAPACITY);
        Self {
            config,
            authority,
            notifications,
        }
    }

    pub fn authority(&self) -> &Arc<Authority> {
        &self.authority
    }

    fn notify(&self, message: ChannelMessage) {
        // No connected listeners is fine
        let _ = self.notifications.send(message);
    }
}

pub fn app_router(state: AppState) -> Router {
    let protected_routes = Router::new()
        .route("/notifications", get(notifications))
        .route("/{entity}/bulk-sync", post(bulk_sync))
        .route("/{entity}/{id}", delete(delete_record))
        .route("/{entity}", post(upsert).get(list_changes))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_auth));

    Router::new()
        .route("/healthz", get(healthz))
        .nest("/v1", protected_routes)
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_headers(Any)
                .allow_methods(Any),
        )
        .with_state(state)
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    timestamp: i64,
}

async fn healthz() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        timestamp: Utc::now().timestamp(),
    })
}

pub fn extract_bearer_token(headers: &HeaderMap) -> Result<&str, AppError> {
    let header = headers
        .get("authorization")
        .ok_or_else(|| AppError::unauthorized("Missing Authorization header"))?
        .to_str()
        .map_err(|_| AppError::unauthorized("Authorization header is not valid UTF-8"))?;

    let (scheme, token) = header
        .split_once(' ')
        .ok_or_else(|| AppError::unauthorized("Authorization header must be `Bearer <token>`"))?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return Err(AppError::unauthorized(
            "Authorization scheme must be `Bearer`",
        ));
    }
    let token = token.trim();
    if token.is_empty() {
        return Err(AppError::unauthorized("Bearer token is empty"));
    }
    Ok(token)
}

async fn require_auth(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let token = extract_bearer_token(request.headers())?;
    if token != state.config.api_token {
        tracing::warn!(path = %request.uri().path(), "Rejected bearer token");
        return Err(AppError::unauthorized("Bearer token rejected"));
    }
    Ok(next.run(request).await)
}

/// Entity type of a `GET /{entity}s` collection path
fn entity_from_collection(collection: &str) -> Result<&str, AppError> {
    collection
        .strip_suffix('s')
        .filter(|entity| !entity.is_empty())
        .ok_or_else(|| AppError::not_found(format!("no collection named {collection}")))
}

async fn bulk_sync(
    State(state): State<AppState>,
    Path(entity): Path<String>,
    Json(request): Json<BulkSyncRequest>,
) -> Result<Json<BulkSyncResponse>, AppError> {
    let response = state.authority.bulk_sync(&entity, &request)?;
    tracing::info!(
        entity_type = %entity,
        items = request.items.len(),
        success = response.success_count,
        conflicts = response.conflict_count,
        errors = response.error_count,
        "Bulk sync"
    );

    let tombstones: HashMap<&str, bool> = request
        .items
        .iter()
        .map(|item| (item.local_id.as_str(), item.deleted_at.is_some()))
        .collect();
    for result in &response.results {
        if let ItemResult::Success {
            local_id,
            server_id,
            ..
        } = result
        {
            let deleted = tombstones.get(local_id.as_str()).copied().unwrap_or(false);
            state.notify(item_changed(&entity, server_id, deleted));
        }
    }
    Ok(Json(response))
}

fn item_changed(entity: &str, server_id: &str, deleted: bool) -> ChannelMessage {
    ChannelMessage::ItemChanged {
        entity_type: entity.to_string(),
        item_id: Some(server_id.to_string()),
        action: Some(if deleted { "delete" } else { "upsert" }.to_string()),
    }
}

fn write_response(
    state: &AppState,
    entity: &str,
    outcome: WriteOutcome,
    deleted: bool,
) -> Result<Json<WriteAccepted>, AppError> {
    match outcome {
        WriteOutcome::Accepted(accepted) => {
            state.notify(item_changed(entity, &accepted.server_id, deleted));
            Ok(Json(accepted))
        }
        WriteOutcome::Conflict {
            server_version,
            server_data,
        } => {
            tracing::info!(
                entity_type = %entity,
                server_id = %server_data.server_id,
                server_version,
                "Rejected stale write"
            );
            Err(AppError::Conflict(Box::new(ConflictBody {
                error: "version conflict".to_string(),
                server_version,
                server_data,
            })))
        }
    }
}

async fn upsert(
    State(state): State<AppState>,
    Path(entity): Path<String>,
    Json(item): Json<PushItem>,
) -> Result<Json<WriteAccepted>, AppError> {
    let deleted = item.deleted_at.is_some();
    let outcome = state.authority.upsert(&entity, &item)?;
    write_response(&state, &entity, outcome, deleted)
}

#[derive(Debug, Deserialize)]
struct DeleteQuery {
    version: i64,
}

async fn delete_record(
    State(state): State<AppState>,
    Path((entity, id)): Path<(String, String)>,
    Query(query): Query<DeleteQuery>,
) -> Result<Json<WriteAccepted>, AppError> {
    let outcome = state.authority.delete(&entity, &id, query.version)?;
    write_response(&state, &entity, outcome, true)
}

#[derive(Debug, Deserialize)]
struct ChangesQuery {
    since: Option<i64>,
    limit: Option<usize>,
}

async fn list_changes(
    State(state): State<AppState>,
    Path(collection): Path<String>,
    Query(query): Query<ChangesQuery>,
) -> Result<Json<ChangesResponse>, AppError> {
    let entity = entity_from_collection(&collection)?;
    let max = state.config.pull_page_limit;
    let limit = query.limit.map_or(max, |limit| limit.clamp(1, max));
    let page = state.authority.changes_since(entity, query.since, limit)?;
    tracing::debug!(
        entity_type = entity,
        since = ?query.since,
        items = page.items.len(),
        has_more = page.has_more,
        "Served changes"
    );
    Ok(Json(page))
}

async fn notifications(State(state): State<AppState>, upgrade: WebSocketUpgrade) -> Response {
    // Subscribe before the handshake completes so no write slips through
    let changes = state.notifications.subscribe();
    let ping_interval = state.config.ping_interval;
    upgrade.on_upgrade(move |socket| notification_session(socket, changes, ping_interval))
}

async fn send_frame(socket: &mut WebSocket, message: &ChannelMessage) -> bool {
    let Ok(text) = serde_json::to_string(message) else {
        return false;
    };
    socket.send(Message::Text(text.into())).await.is_ok()
}

async fn notification_session(
    mut socket: WebSocket,
    mut changes: broadcast::Receiver<ChannelMessage>,
    ping_interval: Duration,
) {
    let mut ping = tokio::time::interval(ping_interval);
    ping.tick().await;
    tracing::info!("Notification listener connected");

    loop {
        tokio::select! {
            change = changes.recv() => match change {
                Ok(message) => {
                    if !send_frame(&mut socket, &message).await {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    tracing::warn!(missed, "Notification listener lagged");
                    let catch_up = ChannelMessage::SyncRequired {
                        entity_type: GLOBAL_METADATA_KEY.to_string(),
                    };
                    if !send_frame(&mut socket, &catch_up).await {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            _ = ping.tick() => {
                if !send_frame(&mut socket, &ChannelMessage::Ping).await {
                    break;
                }
            }
            frame = socket.recv() => match frame {
                None | Some(Err(_)) | Some(Ok(Message::Close(_))) => break,
                Some(Ok(Message::Text(text))) => {
                    if let Ok(ChannelMessage::Ping) = serde_json::from_str(text.as_str()) {
                        if !send_frame(&mut socket, &ChannelMessage::Pong).await {
                            break;
                        }
                    }
                }
                Some(Ok(_)) => {}
            },
        }
    }
    tracing::info!("Notification listener disconnected");
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;

    use super::*;

    #[test]
    fn bearer_token_extractor_accepts_standard_header() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", HeaderValue::from_static("Bearer abc123"));
        assert_eq!(extract_bearer_token(&headers).unwrap(), "abc123");
    }

    #[test]
    fn bearer_token_extractor_rejects_wrong_scheme() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", HeaderValue::from_static("Basic abc"));
        assert!(extract_bearer_token(&headers).is_err());
        assert!(extract_bearer_token(&HeaderMap::new()).is_err());
    }

    #[test]
    fn collection_paths_name_entity_types() {
        assert_eq!(entity_from_collection("topics").unwrap(), "topic");
        assert_eq!(entity_from_collection("sessions").unwrap(), "session");
        assert!(entity_from_collection("s").is_err());
        assert!(entity_from_collection("topic").is_err());
    }
}
