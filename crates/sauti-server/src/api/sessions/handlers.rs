use axum::extract::{Path, State};
use axum::Json;
use serde::{Deserialize, Serialize};

use sauti_core::{ConversationState, SessionConfig, SessionMetrics, SessionSnapshot, Turn};

use crate::clients::ServicesHealth;
use crate::error::ApiError;
use crate::state::AppState;

#[derive(Debug, Default, Deserialize)]
pub struct CreateSessionRequest {
    #[serde(default)]
    pub tenant_id: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(flatten)]
    pub config: SessionConfig,
}

#[derive(Debug, Serialize)]
pub struct CreateSessionResponse {
    pub session_id: String,
    pub transport_url: String,
    pub config: SessionConfig,
    pub state: ConversationState,
}

#[derive(Debug, Serialize)]
pub struct SessionDetailResponse {
    pub session_id: String,
    pub tenant_id: String,
    pub user_id: String,
    pub state: ConversationState,
    pub config: SessionConfig,
    pub metrics: SessionMetrics,
    pub history: Vec<Turn>,
    pub connected: bool,
}

#[derive(Debug, Serialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub tenant_id: String,
    pub user_id: String,
    pub state: ConversationState,
    pub total_turns: u64,
    pub last_activity_ms: u64,
}

impl From<SessionSnapshot> for SessionSummary {
    fn from(snapshot: SessionSnapshot) -> Self {
        Self {
            session_id: snapshot.session_id,
            tenant_id: snapshot.tenant_id,
            user_id: snapshot.user_id,
            state: snapshot.state,
            total_turns: snapshot.metrics.total_turns,
            last_activity_ms: snapshot.last_activity_ms,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct SessionListResponse {
    pub sessions: Vec<SessionSummary>,
}

#[derive(Debug, Serialize)]
pub struct DeleteSessionResponse {
    pub session_id: String,
    pub deleted: bool,
}

#[derive(Debug, Serialize)]
pub struct InterruptSessionResponse {
    pub session_id: String,
    pub interrupted: bool,
}

pub async fn create_session(
    State(state): State<AppState>,
    request: Option<Json<CreateSessionRequest>>,
) -> Result<Json<CreateSessionResponse>, ApiError> {
    let Json(request) = request.unwrap_or_default();
    if !(0.0..=1.0).contains(&request.config.vad_sensitivity) {
        return Err(ApiError::bad_request("vad_sensitivity must be within [0, 1]"));
    }
    let tenant_id = request.tenant_id.unwrap_or_default();
    let user_id = request.user_id.unwrap_or_default();

    let snapshot = state
        .manager
        .create(tenant_id, user_id, request.config)
        .await;

    let transport_url = format!(
        "ws://{}:{}/ws/{}",
        state.config.host, state.config.port, snapshot.session_id
    );
    Ok(Json(CreateSessionResponse {
        session_id: snapshot.session_id,
        transport_url,
        config: snapshot.config,
        state: snapshot.state,
    }))
}

pub async fn list_sessions(State(state): State<AppState>) -> Json<SessionListResponse> {
    let sessions = state
        .manager
        .list()
        .await
        .into_iter()
        .map(SessionSummary::from)
        .collect();
    Json(SessionListResponse { sessions })
}

pub async fn get_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<SessionDetailResponse>, ApiError> {
    let managed = state
        .manager
        .get(&session_id)
        .await
        .ok_or_else(|| ApiError::not_found("Session not found"))?;
    let snapshot = managed
        .handle
        .inspect()
        .await
        .ok_or_else(|| ApiError::not_found("Session not found"))?;

    Ok(Json(SessionDetailResponse {
        session_id: snapshot.session_id,
        tenant_id: snapshot.tenant_id,
        user_id: snapshot.user_id,
        state: snapshot.state,
        config: snapshot.config,
        metrics: snapshot.metrics,
        history: snapshot.history,
        connected: managed.is_connected(),
    }))
}

pub async fn delete_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<DeleteSessionResponse>, ApiError> {
    if !state.manager.delete(&session_id).await {
        return Err(ApiError::not_found("Session not found"));
    }
    Ok(Json(DeleteSessionResponse {
        session_id,
        deleted: true,
    }))
}

pub async fn interrupt_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<InterruptSessionResponse>, ApiError> {
    if !state.manager.interrupt(&session_id).await {
        return Err(ApiError::not_found("Session not found"));
    }
    Ok(Json(InterruptSessionResponse {
        session_id,
        interrupted: true,
    }))
}

pub async fn session_history(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<Vec<Turn>>, ApiError> {
    let snapshot = state
        .manager
        .inspect(&session_id)
        .await
        .ok_or_else(|| ApiError::not_found("Session not found"))?;
    Ok(Json(snapshot.history))
}

pub async fn services_health(State(state): State<AppState>) -> Json<ServicesHealth> {
    Json(state.clients.health().await)
}
