use axum::{
    Json, Router,
    extract::{DefaultBodyLimit, Multipart, Path, State},
    http::StatusCode,
    routing::{delete, get, post},
};
use std::sync::Arc;
use tower_http::{cors::{Any, CorsLayer}, trace::TraceLayer};
use uuid::Uuid;

use crate::{
    config::Config,
    error::AppError,
    generation::Generator,
    models::{CreatedSession, GenerateRequest, GenerationItem, PromptParams, PromptPreview, UploadReport},
    session::{SessionStore, SessionView},
    upload::{CloudinaryHost, ImageFile, ImageHost, UploadOrchestrator},
    workflow::{CozeWorkflowClient, WorkflowService},
};

#[derive(Clone)]
pub struct AppState {
    pub sessions: SessionStore,
    pub uploader: UploadOrchestrator,
    pub generator: Generator,
}

impl AppState {
    pub fn new(host: Arc<dyn ImageHost>, workflow: Arc<dyn WorkflowService>) -> Self {
        let sessions = SessionStore::default();
        Self {
            uploader: UploadOrchestrator::new(host),
            generator: Generator::new(workflow, sessions.clone()),
            sessions,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            Arc::new(CloudinaryHost::from_config(config)),
            Arc::new(CozeWorkflowClient::from_config(config)),
        )
    }
}

pub fn router(state: AppState, max_request_body: usize) -> Router {
    Router::new()
        .route("/api/sessions", post(create_session))
        .route("/api/sessions/:id", get(get_session).delete(close_session))
        .route("/api/sessions/:id/images", post(upload_images).layer(DefaultBodyLimit::max(max_request_body)))
        .route("/api/sessions/:id/images/:index", delete(remove_image))
        .route("/api/sessions/:id/prompt", post(preview_prompt))
        .route("/api/sessions/:id/generate", post(generate))
        .route("/api/sessions/:id/cancel", post(cancel_generation))
        .route("/api/sessions/:id/history", get(get_history))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any)
        )
        .with_state(state)
}

pub async fn create_session(State(state): State<AppState>) -> (StatusCode, Json<CreatedSession>) {
    let id = state.sessions.create();
    (StatusCode::CREATED, Json(CreatedSession { id }))
}

pub async fn get_session(Path(id): Path<Uuid>, State(state): State<AppState>) -> Result<Json<SessionView>, AppError> {
    Ok(Json(state.sessions.with(id, |s| s.view())?))
}

/// The page went away: stop its stream and forget it.
pub async fn close_session(Path(id): Path<Uuid>, State(state): State<AppState>) -> Result<StatusCode, AppError> {
    state.sessions.close(id)?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn upload_images(
    Path(id): Path<Uuid>,
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<UploadReport>, AppError> {
    let mut files = Vec::new();
    while let Some(field) = multipart.next_field().await.map_err(|e| AppError::Multipart(e.body_text()))? {
        if field.file_name().is_none() && field.name() != Some("file") {
            continue;
        }
        let filename = field.file_name().unwrap_or("untitled").to_string();
        let content_type = field.content_type().map(str::to_string);
        let bytes = field.bytes().await.map_err(|e| AppError::Multipart(e.body_text()))?;
        files.push(ImageFile::from_part(filename, content_type.as_deref(), bytes));
    }
    tracing::info!("📥 Session {} selected {} files", id, files.len());

    let report = state.uploader.upload_selection(&state.sessions, id, files).await?;
    Ok(Json(report))
}

pub async fn remove_image(
    Path((id, index)): Path<(Uuid, usize)>,
    State(state): State<AppState>,
) -> Result<Json<SessionView>, AppError> {
    let view = state.sessions.with_mut(id, |s| {
        let removed = s.remove_image(index)?;
        tracing::info!("🗑️ Removed image {} ({}) from session {}", index, removed.url, id);
        Ok::<_, AppError>(s.view())
    })??;
    Ok(Json(view))
}

pub async fn preview_prompt(
    Path(id): Path<Uuid>,
    State(state): State<AppState>,
    Json(params): Json<PromptParams>,
) -> Result<Json<PromptPreview>, AppError> {
    state.sessions.with(id, |_| ())?;
    Ok(Json(PromptPreview { prompt: params.preview() }))
}

/// Runs the attempt on its own task so a dropped client connection does not
/// abandon the session mid-transition; use the cancel route to stop it.
pub async fn generate(
    Path(id): Path<Uuid>,
    State(state): State<AppState>,
    Json(body): Json<GenerateRequest>,
) -> Result<Json<GenerationItem>, AppError> {
    let generator = state.generator.clone();
    let item = tokio::spawn(async move { generator.generate(id, body).await })
        .await
        .map_err(|e| AppError::Internal(e.to_string()))??;
    Ok(Json(item))
}

pub async fn cancel_generation(Path(id): Path<Uuid>, State(state): State<AppState>) -> Result<StatusCode, AppError> {
    if state.generator.cancel(id)? {
        tracing::info!("🛑 Cancel requested for session {}", id);
        Ok(StatusCode::ACCEPTED)
    } else {
        Ok(StatusCode::NO_CONTENT)
    }
}

pub async fn get_history(Path(id): Path<Uuid>, State(state): State<AppState>) -> Result<Json<Vec<GenerationItem>>, AppError> {
    Ok(Json(state.sessions.with(id, |s| s.slots().history().to_vec())?))
}
