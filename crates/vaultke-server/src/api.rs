//! HTTP API: key directory, sessions, rooms and the message archive.
//!
//! Every route except `/health` and `/ws` sits behind bearer
//! authentication; `/ws` carries its token as a query parameter because
//! browser WebSocket clients cannot set headers.

use std::net::IpAddr;
use std::sync::Arc;

use axum::{
    extract::{DefaultBodyLimit, Extension, Path, Query, State},
    http::Method,
    middleware,
    routing::{delete, get, patch, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use vaultke_shared::{Envelope, RoomType, SecurityLevel};
use vaultke_store::{
    Database, Device, DeviceRegistration, IssuedBundle, NewPreKey, Room, RoomMember, RoomSummary,
    StoredMessage,
};

use crate::auth::{self, AuthUser};
use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::hub::Hub;
use crate::rate_limit::{rate_limit_middleware, RateLimiter};
use crate::service::MessagingService;
use crate::ws;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ServerConfig>,
    pub db: Arc<Mutex<Database>>,
    pub service: Arc<MessagingService>,
    pub hub: Hub,
    pub http_limiter: RateLimiter<IpAddr>,
    pub submit_limiter: RateLimiter<String>,
}

impl AppState {
    pub fn new(config: ServerConfig, db: Database, hub: Hub) -> Self {
        let http_limiter = RateLimiter::new(config.http_rate, config.http_burst);
        let submit_limiter = RateLimiter::new(config.submit_rate, config.submit_burst);
        Self {
            config: Arc::new(config),
            db: Arc::new(Mutex::new(db)),
            service: Arc::new(MessagingService::new()),
            hub,
            http_limiter,
            submit_limiter,
        }
    }
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PATCH,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers(Any);

    let authed = Router::new()
        .route("/keys/register", post(register_device))
        .route("/keys/reregister", post(reregister_device))
        .route("/keys/signed-pre-key", post(rotate_signed_pre_key))
        .route("/keys/pre-keys", post(upload_pre_keys))
        .route("/keys/bundle/:user_id", get(issue_bundle))
        .route("/keys/safety-number/:user_id", get(safety_number))
        .route("/sessions/establish", post(establish_session))
        .route("/sessions/reset", post(reset_sessions))
        .route("/rooms", post(create_room))
        .route("/rooms", get(list_rooms))
        .route("/rooms/private", post(create_private_room))
        .route("/rooms/:room_id/members", get(room_members))
        .route("/rooms/:room_id/messages", get(room_messages))
        .route("/rooms/:room_id/read", post(mark_read))
        .route("/rooms/:room_id/mute", post(set_muted))
        .route("/rooms/:room_id/clear", post(clear_room))
        .route("/messages/decrypt", post(decrypt_message))
        .route("/messages/:message_id", patch(edit_message))
        .route("/messages/:message_id", delete(delete_message))
        .layer(middleware::from_fn_with_state(
            state.config.clone(),
            auth::require_bearer,
        ));

    Router::new()
        .route("/health", get(health_check))
        .route("/ws", get(ws::ws_handler))
        .merge(authed)
        .layer(DefaultBodyLimit::max(1024 * 1024))
        .layer(middleware::from_fn_with_state(
            state.http_limiter.clone(),
            rate_limit_middleware,
        ))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

#[derive(Debug, Serialize)]
struct AckResponse {
    ok: bool,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct UploadPreKeysResponse {
    uploaded: usize,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SafetyNumberResponse {
    safety_number: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct EstablishSessionResponse {
    session_id: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ResetSessionsResponse {
    deleted: usize,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ClearRoomResponse {
    cleared: usize,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct DecryptResponse {
    content: String,
    metadata: serde_json::Map<String, serde_json::Value>,
    message_id: String,
    timestamp: i64,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RotateSignedPreKeyRequest {
    device_id: String,
    signed_pre_key_id: u32,
    public_key: String,
    private_key: String,
    signature: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UploadPreKeysRequest {
    device_id: String,
    pre_keys: Vec<NewPreKey>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PeerRequest {
    user_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateRoomRequest {
    name: String,
    #[serde(rename = "type")]
    room_type: RoomType,
    #[serde(default)]
    chama_id: Option<String>,
    #[serde(default)]
    members: Vec<String>,
}

#[derive(Deserialize)]
struct PageParams {
    limit: Option<u32>,
    offset: Option<u32>,
}

#[derive(Deserialize)]
struct MuteRequest {
    muted: bool,
}

#[derive(Deserialize)]
struct EditMessageRequest {
    content: String,
}

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

// -- Key directory --

async fn register_device(
    State(state): State<AppState>,
    Extension(AuthUser(user)): Extension<AuthUser>,
    Json(reg): Json<DeviceRegistration>,
) -> Result<Json<Device>, ServerError> {
    if reg.user_id != user {
        return Err(ServerError::Forbidden);
    }
    let mut db = state.db.lock().await;
    Ok(Json(db.register_device(&reg)?))
}

async fn reregister_device(
    State(state): State<AppState>,
    Extension(AuthUser(user)): Extension<AuthUser>,
    Json(reg): Json<DeviceRegistration>,
) -> Result<Json<Device>, ServerError> {
    if reg.user_id != user {
        return Err(ServerError::Forbidden);
    }
    let mut db = state.db.lock().await;
    Ok(Json(db.reregister_device(&reg)?))
}

async fn rotate_signed_pre_key(
    State(state): State<AppState>,
    Extension(AuthUser(user)): Extension<AuthUser>,
    Json(req): Json<RotateSignedPreKeyRequest>,
) -> Result<Json<AckResponse>, ServerError> {
    let mut db = state.db.lock().await;
    db.rotate_signed_pre_key(
        &user,
        &req.device_id,
        req.signed_pre_key_id,
        &req.public_key,
        &req.private_key,
        &req.signature,
    )?;
    Ok(Json(AckResponse { ok: true }))
}

async fn upload_pre_keys(
    State(state): State<AppState>,
    Extension(AuthUser(user)): Extension<AuthUser>,
    Json(req): Json<UploadPreKeysRequest>,
) -> Result<Json<UploadPreKeysResponse>, ServerError> {
    let mut db = state.db.lock().await;
    let uploaded = db.upload_pre_keys(&user, &req.device_id, &req.pre_keys)?;
    Ok(Json(UploadPreKeysResponse { uploaded }))
}

/// Draw a bundle for session establishment. Consumes one of the target's
/// one-time pre-keys; when the pool is empty the bundle is still issued
/// with `exhausted: true` and no `preKey`.
async fn issue_bundle(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Result<Json<IssuedBundle>, ServerError> {
    let mut db = state.db.lock().await;
    Ok(Json(db.issue_bundle(&user_id)?))
}

async fn safety_number(
    State(state): State<AppState>,
    Extension(AuthUser(user)): Extension<AuthUser>,
    Path(other): Path<String>,
) -> Result<Json<SafetyNumberResponse>, ServerError> {
    let db = state.db.lock().await;
    let safety_number = db.compute_safety_number(&user, &other)?;
    Ok(Json(SafetyNumberResponse { safety_number }))
}

// -- Sessions --

async fn establish_session(
    State(state): State<AppState>,
    Extension(AuthUser(user)): Extension<AuthUser>,
    Json(req): Json<PeerRequest>,
) -> Result<Json<EstablishSessionResponse>, ServerError> {
    if req.user_id == user {
        return Err(ServerError::Conflict(
            "cannot establish a session with yourself".into(),
        ));
    }
    let mut db = state.db.lock().await;
    let session = state.service.establish_session(&mut db, &user, &req.user_id)?;
    Ok(Json(EstablishSessionResponse {
        session_id: session.session_id.clone(),
    }))
}

async fn reset_sessions(
    State(state): State<AppState>,
    Extension(AuthUser(user)): Extension<AuthUser>,
    Json(req): Json<PeerRequest>,
) -> Result<Json<ResetSessionsResponse>, ServerError> {
    let db = state.db.lock().await;
    let deleted = state.service.reset_sessions(&db, &user, &req.user_id)?;
    Ok(Json(ResetSessionsResponse { deleted }))
}

// -- Rooms --

async fn create_room(
    State(state): State<AppState>,
    Extension(AuthUser(user)): Extension<AuthUser>,
    Json(req): Json<CreateRoomRequest>,
) -> Result<Json<Room>, ServerError> {
    let mut db = state.db.lock().await;
    let room = db.create_group_room(
        &user,
        &req.name,
        req.room_type,
        req.chama_id.as_deref(),
        &req.members,
    )?;
    Ok(Json(room))
}

async fn create_private_room(
    State(state): State<AppState>,
    Extension(AuthUser(user)): Extension<AuthUser>,
    Json(req): Json<PeerRequest>,
) -> Result<Json<Room>, ServerError> {
    let mut db = state.db.lock().await;
    Ok(Json(db.create_private_room(&user, &req.user_id)?))
}

async fn list_rooms(
    State(state): State<AppState>,
    Extension(AuthUser(user)): Extension<AuthUser>,
) -> Result<Json<Vec<RoomSummary>>, ServerError> {
    let db = state.db.lock().await;
    Ok(Json(db.rooms_for_user(&user)?))
}

async fn room_members(
    State(state): State<AppState>,
    Extension(AuthUser(user)): Extension<AuthUser>,
    Path(room_id): Path<String>,
) -> Result<Json<Vec<RoomMember>>, ServerError> {
    let db = state.db.lock().await;
    require_member(&db, &room_id, &user)?;
    Ok(Json(db.room_members(&room_id)?))
}

async fn room_messages(
    State(state): State<AppState>,
    Extension(AuthUser(user)): Extension<AuthUser>,
    Path(room_id): Path<String>,
    Query(page): Query<PageParams>,
) -> Result<Json<Vec<serde_json::Value>>, ServerError> {
    let limit = page.limit.unwrap_or(50).min(200);
    let offset = page.offset.unwrap_or(0);

    let db = state.db.lock().await;
    require_member(&db, &room_id, &user)?;
    let messages = db.messages_for_room(&room_id, limit, offset)?;
    Ok(Json(messages.iter().map(message_json).collect()))
}

async fn mark_read(
    State(state): State<AppState>,
    Extension(AuthUser(user)): Extension<AuthUser>,
    Path(room_id): Path<String>,
) -> Result<Json<AckResponse>, ServerError> {
    let db = state.db.lock().await;
    require_member(&db, &room_id, &user)?;
    db.set_last_read(&room_id, &user)?;
    Ok(Json(AckResponse { ok: true }))
}

async fn set_muted(
    State(state): State<AppState>,
    Extension(AuthUser(user)): Extension<AuthUser>,
    Path(room_id): Path<String>,
    Json(req): Json<MuteRequest>,
) -> Result<Json<AckResponse>, ServerError> {
    let db = state.db.lock().await;
    require_member(&db, &room_id, &user)?;
    db.set_muted(&room_id, &user, req.muted)?;
    Ok(Json(AckResponse { ok: true }))
}

async fn clear_room(
    State(state): State<AppState>,
    Extension(AuthUser(user)): Extension<AuthUser>,
    Path(room_id): Path<String>,
) -> Result<Json<ClearRoomResponse>, ServerError> {
    let mut db = state.db.lock().await;
    require_member(&db, &room_id, &user)?;
    let cleared = db.clear_room(&room_id)?;
    Ok(Json(ClearRoomResponse { cleared }))
}

// -- Messages --

async fn edit_message(
    State(state): State<AppState>,
    Extension(AuthUser(user)): Extension<AuthUser>,
    Path(message_id): Path<String>,
    Json(req): Json<EditMessageRequest>,
) -> Result<Json<serde_json::Value>, ServerError> {
    let mut db = state.db.lock().await;
    let message = db.edit_message(&message_id, &user, &req.content)?;
    Ok(Json(message_json(&message)))
}

async fn delete_message(
    State(state): State<AppState>,
    Extension(AuthUser(user)): Extension<AuthUser>,
    Path(message_id): Path<String>,
) -> Result<Json<AckResponse>, ServerError> {
    let mut db = state.db.lock().await;
    db.delete_message(&message_id, &user)?;
    Ok(Json(AckResponse { ok: true }))
}

/// Server-side decryption for clients that cannot run the cipher locally.
/// Only a party to the envelope may call this: sender or recipient for
/// pairwise, an active room member for group.
async fn decrypt_message(
    State(state): State<AppState>,
    Extension(AuthUser(user)): Extension<AuthUser>,
    Json(envelope): Json<Envelope>,
) -> Result<Json<DecryptResponse>, ServerError> {
    let mut db = state.db.lock().await;
    match envelope.security_level {
        SecurityLevel::MilitaryGrade => {
            if user != envelope.sender_id && user != envelope.recipient_id {
                return Err(ServerError::Forbidden);
            }
        }
        SecurityLevel::GroupEncrypted => {
            require_member(&db, &envelope.session_id, &user)?;
        }
    }

    let message = state.service.decrypt(&mut db, &envelope)?;
    Ok(Json(DecryptResponse {
        content: message.content,
        metadata: message.metadata,
        message_id: message.message_id,
        timestamp: message.timestamp_unix,
    }))
}

/// Active-membership gate shared by the room and archive read paths.
pub(crate) fn require_member(db: &Database, room_id: &str, user_id: &str) -> Result<(), ServerError> {
    if db.is_active_member(room_id, user_id)? {
        Ok(())
    } else {
        Err(ServerError::Forbidden)
    }
}

/// Archive record as clients see it, with the decryption hint attached.
pub(crate) fn message_json(message: &StoredMessage) -> serde_json::Value {
    let needs = message.needs_decryption();
    let mut value = serde_json::to_value(message).unwrap_or_else(|_| serde_json::json!({}));
    if let Some(map) = value.as_object_mut() {
        map.insert("needsDecryption".to_string(), serde_json::Value::Bool(needs));
    }
    value
}

pub async fn serve(state: AppState, addr: std::net::SocketAddr) -> anyhow::Result<()> {
    let app = build_router(state);

    info!(addr = %addr, "Starting HTTP API server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .await?;

    Ok(())
}
