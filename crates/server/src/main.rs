use std::{net::SocketAddr, sync::Arc};

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use server_api::ApiContext;
use shared::{
    domain::{CallId, ConversationId, UserId},
    error::{ApiError, ErrorCode},
    protocol::{
        CallActionRequest, CallRecord, DeclineCallRequest, EndCallRequest, InitiateCallRequest,
        LoginRequest, LoginResponse, MediaTokenRequest, MediaTokenResponse, OnlineUsersResponse,
    },
};
use storage::Storage;
use tower_http::limit::RequestBodyLimitLayer;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

mod app_state;
mod config;
mod presence;
mod relay;
mod signaling;

use app_state::AppState;
use crate::config::load_settings;

const MAX_REQUEST_BYTES: usize = 64 * 1024;
const DEFAULT_HISTORY_LIMIT: u32 = 50;

type ApiResult<T> = Result<Json<T>, (StatusCode, Json<ApiError>)>;

#[derive(Debug, Deserialize)]
struct UserQuery {
    user_id: i64,
}

#[derive(Debug, Deserialize)]
struct HistoryQuery {
    user_id: i64,
    limit: Option<u32>,
    before: Option<i64>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let settings = load_settings()?;
    let storage = Storage::new(&settings.database_url)
        .await
        .map_err(|error| {
            error!(
                database_url = %settings.database_url,
                %error,
                "failed to open SQLite database; verify parent directory exists and permissions are correct"
            );
            error
        })?;
    let api = ApiContext::new(storage, settings.livekit(), settings.call_policy());
    let state = AppState::new(api, settings.ring_timeout());
    let app = build_router(Arc::new(state));

    let addr: SocketAddr = settings.bind_addr.parse()?;
    info!(
        %addr,
        ring_timeout_seconds = settings.call_ring_timeout_seconds,
        livekit_url = settings.livekit_url.as_deref().unwrap_or("unset"),
        "server listening"
    );
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/login", post(login))
        .route("/token", post(http_issue_token))
        .route("/calls/initiate", post(http_initiate_call))
        .route("/calls/:call_id", get(http_get_call))
        .route("/calls/:call_id/answer", post(http_answer_call))
        .route("/calls/:call_id/decline", post(http_decline_call))
        .route("/calls/:call_id/end", post(http_end_call))
        .route("/calls/:call_id/leave", post(http_leave_call))
        .route(
            "/conversations/:conversation_id/calls",
            get(http_list_conversation_calls),
        )
        .route("/presence/online", get(http_online_users))
        .route("/ws", get(signaling::ws_handler))
        .layer(RequestBodyLimitLayer::new(MAX_REQUEST_BYTES))
        .with_state(state)
}

fn status_for(code: ErrorCode) -> StatusCode {
    match code {
        ErrorCode::Forbidden => StatusCode::FORBIDDEN,
        ErrorCode::NotFound => StatusCode::NOT_FOUND,
        ErrorCode::Validation => StatusCode::BAD_REQUEST,
        ErrorCode::Conflict => StatusCode::CONFLICT,
        ErrorCode::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn reject(error: ApiError) -> (StatusCode, Json<ApiError>) {
    (status_for(error.code), Json(error))
}

async fn healthz(State(state): State<Arc<AppState>>) -> Result<&'static str, StatusCode> {
    state.api.storage.health_check().await.map_err(|error| {
        error!(%error, "health check failed");
        StatusCode::SERVICE_UNAVAILABLE
    })?;
    Ok("ok")
}

async fn login(
    State(state): State<Arc<AppState>>,
    Json(req): Json<LoginRequest>,
) -> ApiResult<LoginResponse> {
    let user_id = server_api::login(&state.api, &req.username)
        .await
        .map_err(reject)?;
    Ok(Json(LoginResponse { user_id: user_id.0 }))
}

async fn http_issue_token(
    State(state): State<Arc<AppState>>,
    Json(req): Json<MediaTokenRequest>,
) -> ApiResult<MediaTokenResponse> {
    let token = server_api::issue_media_token(&state.api, &req)
        .await
        .map_err(reject)?;
    Ok(Json(token))
}

async fn http_initiate_call(
    State(state): State<Arc<AppState>>,
    Json(req): Json<InitiateCallRequest>,
) -> ApiResult<CallRecord> {
    let record = server_api::initiate_call(&state.api, &req)
        .await
        .map_err(reject)?;
    Ok(Json(record))
}

async fn http_get_call(
    State(state): State<Arc<AppState>>,
    Path(call_id): Path<i64>,
    Query(q): Query<UserQuery>,
) -> ApiResult<CallRecord> {
    let record = server_api::get_call(&state.api, UserId(q.user_id), CallId(call_id))
        .await
        .map_err(reject)?;
    Ok(Json(record))
}

async fn http_answer_call(
    State(state): State<Arc<AppState>>,
    Path(call_id): Path<i64>,
    Json(req): Json<CallActionRequest>,
) -> ApiResult<CallRecord> {
    let record = server_api::answer_call(&state.api, req.user_id, CallId(call_id))
        .await
        .map_err(reject)?;
    Ok(Json(record))
}

async fn http_decline_call(
    State(state): State<Arc<AppState>>,
    Path(call_id): Path<i64>,
    Json(req): Json<DeclineCallRequest>,
) -> ApiResult<CallRecord> {
    let record = server_api::decline_call(&state.api, req.user_id, CallId(call_id), req.reason)
        .await
        .map_err(reject)?;
    Ok(Json(record))
}

async fn http_end_call(
    State(state): State<Arc<AppState>>,
    Path(call_id): Path<i64>,
    Json(req): Json<EndCallRequest>,
) -> ApiResult<CallRecord> {
    let record = server_api::end_call(&state.api, req.user_id, CallId(call_id), req.reason)
        .await
        .map_err(reject)?;
    Ok(Json(record))
}

async fn http_leave_call(
    State(state): State<Arc<AppState>>,
    Path(call_id): Path<i64>,
    Json(req): Json<EndCallRequest>,
) -> ApiResult<CallRecord> {
    let record = server_api::leave_call(&state.api, req.user_id, CallId(call_id), req.reason)
        .await
        .map_err(reject)?;
    Ok(Json(record))
}

async fn http_list_conversation_calls(
    State(state): State<Arc<AppState>>,
    Path(conversation_id): Path<i64>,
    Query(q): Query<HistoryQuery>,
) -> ApiResult<Vec<CallRecord>> {
    let limit = q.limit.unwrap_or(DEFAULT_HISTORY_LIMIT).clamp(1, 100);
    let calls = server_api::list_conversation_calls(
        &state.api,
        UserId(q.user_id),
        ConversationId(conversation_id),
        limit,
        q.before.map(CallId),
    )
    .await
    .map_err(reject)?;
    Ok(Json(calls))
}

async fn http_online_users(State(state): State<Arc<AppState>>) -> Json<OnlineUsersResponse> {
    Json(OnlineUsersResponse {
        user_ids: state.presence.online_users().await,
    })
}

#[cfg(test)]
#[path = "tests/main_tests.rs"]
mod tests;
