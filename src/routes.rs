use axum::{
    extract::{multipart::MultipartError, DefaultBodyLimit, Multipart, Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use job_coordinator::{CoordinatorError, TrainingStatus};
use state_store::{ChatMessage, DatasetRecord, EndpointRecord, Session, Stage};

use crate::app::{AppState, ChatReply};
use crate::LuantraError;

/// Error body returned by every handler: `{"error": "..."}`.
#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    Conflict(String),
    PayloadTooLarge(String),
    Internal,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(m) => (StatusCode::BAD_REQUEST, m),
            ApiError::NotFound(m) => (StatusCode::NOT_FOUND, m),
            ApiError::Conflict(m) => (StatusCode::CONFLICT, m),
            ApiError::PayloadTooLarge(m) => (StatusCode::PAYLOAD_TOO_LARGE, m),
            ApiError::Internal => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal server error".to_string(),
            ),
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

impl From<LuantraError> for ApiError {
    fn from(e: LuantraError) -> Self {
        match e {
            LuantraError::InvalidDataset(m) => ApiError::BadRequest(m),
            LuantraError::Coordinator(e) => e.into(),
            other => {
                tracing::error!("Request failed: {}", other);
                ApiError::Internal
            }
        }
    }
}

impl From<CoordinatorError> for ApiError {
    fn from(e: CoordinatorError) -> Self {
        match e {
            CoordinatorError::NotFound(what) => ApiError::NotFound(format!("{} not found", what)),
            CoordinatorError::TrainingInProgress(_) => ApiError::Conflict(e.to_string()),
            other => {
                tracing::error!("Coordinator request failed: {}", other);
                ApiError::Internal
            }
        }
    }
}

impl From<MultipartError> for ApiError {
    fn from(e: MultipartError) -> Self {
        if e.status() == StatusCode::PAYLOAD_TOO_LARGE {
            ApiError::PayloadTooLarge(e.body_text())
        } else {
            ApiError::BadRequest(e.body_text())
        }
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRequest {
    pub message: String,
    pub session_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeployRequest {
    pub session_id: String,
    pub model_id: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryResponse {
    pub session_id: String,
    pub stage: Stage,
    pub messages: Vec<ChatMessage>,
    pub current_dataset: Option<String>,
    pub current_model: Option<String>,
    pub current_endpoint: Option<String>,
    pub current_training_job: Option<String>,
    pub target_column: Option<String>,
    pub custom_ui_path: Option<String>,
}

impl From<Session> for HistoryResponse {
    fn from(s: Session) -> Self {
        Self {
            session_id: s.id,
            stage: s.stage,
            messages: s.conversation_history,
            current_dataset: s.current_dataset,
            current_model: s.current_model,
            current_endpoint: s.current_endpoint,
            current_training_job: s.current_training_job,
            target_column: s.target_column,
            custom_ui_path: s.custom_ui_path,
        }
    }
}

pub fn create_router(state: AppState) -> Router {
    // Leave headroom over the file itself for the multipart framing.
    let body_limit = state.config.max_upload_bytes() + 64 * 1024;

    Router::new()
        .route("/health", get(handle_health))
        .route("/upload", post(handle_upload))
        .route("/chat", post(handle_chat))
        .route("/training-progress/:session_id", get(handle_training_progress))
        .route("/chat-history/:session_id", get(handle_chat_history))
        .route("/deploy", post(handle_deploy))
        .route("/sessions/:session_id/clear", post(handle_clear))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn handle_health(State(state): State<AppState>) -> Json<serde_json::Value> {
    let snapshot = state.store.snapshot().await;
    Json(json!({
        "status": "healthy",
        "version": crate::VERSION,
        "sessions": snapshot.sessions.len(),
        "models": snapshot.models.len(),
        "activeJobs": state.coordinator.registry().len().await,
    }))
}

async fn handle_upload(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> ApiResult<DatasetRecord> {
    let mut session_id = None;
    let mut file = None;

    while let Some(field) = multipart.next_field().await? {
        let name = field.name().map(str::to_string);
        match name.as_deref() {
            Some("sessionId") => session_id = Some(field.text().await?),
            Some("file") => {
                let file_name = field
                    .file_name()
                    .map(str::to_string)
                    .ok_or_else(|| ApiError::BadRequest("file field has no file name".to_string()))?;
                let bytes = field.bytes().await?;
                file = Some((file_name, bytes));
            }
            _ => {}
        }
    }

    let (file_name, bytes) =
        file.ok_or_else(|| ApiError::BadRequest("missing multipart field \"file\"".to_string()))?;
    if bytes.len() > state.config.max_upload_bytes() {
        return Err(ApiError::PayloadTooLarge(format!(
            "uploads are limited to {} MB",
            state.config.server.max_upload_mb
        )));
    }
    if bytes.is_empty() {
        return Err(ApiError::BadRequest("uploaded file is empty".to_string()));
    }

    let session_id = session_id.filter(|s| !s.trim().is_empty());
    let record = state
        .ingest_dataset(session_id.as_deref(), &file_name, &bytes)
        .await?;
    Ok(Json(record))
}

async fn handle_chat(
    State(state): State<AppState>,
    Json(request): Json<ChatRequest>,
) -> ApiResult<ChatReply> {
    if request.message.trim().is_empty() {
        return Err(ApiError::BadRequest("message must not be empty".to_string()));
    }
    let session_id = request
        .session_id
        .filter(|s| !s.trim().is_empty())
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    Ok(Json(state.chat(&session_id, &request.message).await))
}

async fn handle_training_progress(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Json<TrainingStatus> {
    Json(state.coordinator.training_status(&session_id).await)
}

async fn handle_chat_history(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Json<HistoryResponse> {
    Json(state.store.get(&session_id).await.into())
}

async fn handle_deploy(
    State(state): State<AppState>,
    Json(request): Json<DeployRequest>,
) -> ApiResult<EndpointRecord> {
    let endpoint = state
        .coordinator
        .deploy_model(&request.session_id, request.model_id.as_deref())
        .await?;
    Ok(Json(endpoint))
}

async fn handle_clear(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> ApiResult<Session> {
    let _guard = state.store.lock_session(&session_id).await;
    let session = state
        .store
        .clear(&session_id)
        .await
        .map_err(LuantraError::from)?;
    Ok(Json(session))
}
