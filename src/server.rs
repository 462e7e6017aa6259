use crate::database::Database;
use crate::error::AppError;
use crate::ingest::IngestStore;
use axum::{
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use serde::Deserialize;
use std::sync::Arc;

/// Shared state behind the ingestion routes.
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<Database>,
    pub store: Arc<IngestStore>,
}

/// The minimal wire surface: upload session init, idempotent segment PUT,
/// gap-checked finalize, and the pipeline status view.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/recordings", post(create_recording))
        .route("/recordings/:id/segments/:seq", put(upload_segment))
        .route("/recordings/:id/finalize", post(finalize_recording))
        .route("/recordings/:id/status", get(recording_status))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
struct CreateRecordingRequest {
    user_id: String,
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FinalizeRequest {
    expected_segments: u32,
}

async fn create_recording(
    State(state): State<AppState>,
    Json(req): Json<CreateRecordingRequest>,
) -> Result<Response, ApiError> {
    let recording = state
        .store
        .create_recording(&req.user_id, req.name.as_deref())?;
    Ok((StatusCode::CREATED, Json(recording)).into_response())
}

async fn upload_segment(
    State(state): State<AppState>,
    Path((id, seq)): Path<(String, u32)>,
    body: Bytes,
) -> Result<Response, ApiError> {
    if body.is_empty() {
        return Err(ApiError(AppError::Other("empty segment payload".into())));
    }
    state.store.put_segment(&id, seq, &body).await?;
    let contiguous = state.db.highest_contiguous(&id)?;
    Ok((
        StatusCode::OK,
        Json(serde_json::json!({
            "status": "received",
            "segment": seq,
            "highest_contiguous": contiguous,
        })),
    )
        .into_response())
}

async fn finalize_recording(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<FinalizeRequest>,
) -> Result<Response, ApiError> {
    let recording = state.store.finalize(&id, req.expected_segments).await?;
    Ok(Json(recording).into_response())
}

async fn recording_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let status = crate::status::pipeline_status(&state.db, &id)?;
    Ok(Json(status).into_response())
}

/// Maps the error taxonomy onto HTTP statuses. An upload gap is a conflict
/// the client can repair, not a server fault.
struct ApiError(AppError);

impl From<AppError> for ApiError {
    fn from(e: AppError) -> Self {
        ApiError(e)
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(e: anyhow::Error) -> Self {
        ApiError(AppError::from(e))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::IncompleteUpload { .. } => StatusCode::CONFLICT,
            AppError::InvalidAudio(_) | AppError::Other(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let body = match &self.0 {
            AppError::IncompleteUpload { expected, missing } => serde_json::json!({
                "error": self.0.to_string(),
                "expected_segments": expected,
                "missing_segments": missing,
            }),
            _ => serde_json::json!({ "error": self.0.to_string() }),
        };

        (status, Json(body)).into_response()
    }
}
