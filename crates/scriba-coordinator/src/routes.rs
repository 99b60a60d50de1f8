//! HTTP surface of the coordinator.
//!
//! Three groups of routes:
//! - submitter: `POST /jobs` (multipart audio), `GET /jobs`, `GET /jobs/{id}`
//! - worker queue: `GET /jobs/next`, heartbeat / complete / fail
//! - blob transport: `GET/PUT/DELETE /blobs/{key}` so workers reach the
//!   coordinator-local store over HTTP
//!
//! Handlers translate between wire DTOs and store operations; no queue
//! logic lives here.

use std::path::Path as FsPath;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{DefaultBodyLimit, Multipart, Path, Query, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use futures_util::TryStreamExt;
use serde::Deserialize;
use tokio_util::io::{ReaderStream, StreamReader};

use scriba_core::blob::{self, BlobStore};
use scriba_core::config::QueueConfig;
use scriba_core::job::{JobId, JobStage};
use scriba_core::{artifact, srt};
use scriba_core::protocol::{
    CompleteRequest, FailRequest, HeartbeatRequest, HeartbeatResponse, JobStatusResponse,
    NextJobResponse, SubmitResponse, unix_ms,
};
use scriba_core::{ScribaError, verbose, warn};

use crate::store::MetadataStore;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<MetadataStore>,
    pub blobs: Arc<BlobStore>,
    pub queue: QueueConfig,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/jobs", post(submit_job).get(list_jobs))
        .route("/jobs/next", get(next_job))
        .route("/jobs/:id", get(job_status))
        .route("/jobs/:id/srt", get(job_srt))
        .route("/jobs/:id/heartbeat", post(heartbeat))
        .route("/jobs/:id/complete", post(complete))
        .route("/jobs/:id/fail", post(fail))
        .route("/blobs/:key", get(get_blob).put(put_blob).delete(delete_blob))
        // Uploads are whole audio files; the 2 MB default is far too small.
        .layer(DefaultBodyLimit::disable())
        .with_state(state)
}

/// Error envelope for every handler.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("not found")]
    NotFound,
    #[error("conflict: lease is not held")]
    Conflict,
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    Internal(String),
}

impl From<ScribaError> for ApiError {
    fn from(err: ScribaError) -> Self {
        match err {
            ScribaError::NotFound(_) => ApiError::NotFound,
            ScribaError::Config(msg) => ApiError::BadRequest(msg),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::NotFound => StatusCode::NOT_FOUND,
            ApiError::Conflict => StatusCode::CONFLICT,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if let ApiError::Internal(msg) = &self {
            warn!("internal error: {msg}");
        }
        (status, Json(serde_json::json!({ "error": self.to_string() }))).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

/// `POST /jobs`: submitter surface: multipart body with a `file` field.
async fn submit_job(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> ApiResult<Json<SubmitResponse>> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::BadRequest(format!("malformed multipart body: {e}")))?
    {
        if field.name() != Some("file") {
            continue;
        }

        let file_name = field.file_name().unwrap_or("upload.bin").to_string();
        let ext = audio_extension(&file_name);
        let id = JobId::new();
        let audio_key = blob::audio_key(id, &ext);

        let mut reader = StreamReader::new(
            field.map_err(|e| std::io::Error::other(format!("upload stream: {e}"))),
        );
        let bytes = state.blobs.put_stream(&audio_key, &mut reader).await?;
        state.store.insert_pending(id, &file_name, &audio_key)?;
        verbose!("accepted job {id} ({file_name}, {bytes} bytes)");
        return Ok(Json(SubmitResponse { id }));
    }

    Err(ApiError::BadRequest("missing `file` field".to_string()))
}

/// Lowercased alphanumeric extension of the uploaded name, `bin` when
/// there is none usable.
fn audio_extension(file_name: &str) -> String {
    FsPath::new(file_name)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .filter(|e| {
            !e.is_empty() && e.len() <= 8 && e.chars().all(|c| c.is_ascii_alphanumeric())
        })
        .unwrap_or_else(|| "bin".to_string())
}

/// `GET /jobs`: stage overview for every job, oldest first.
async fn list_jobs(State(state): State<AppState>) -> Json<Vec<JobStatusResponse>> {
    Json(state.store.list().iter().map(JobStatusResponse::from).collect())
}

/// `GET /jobs/{id}`: submitter polling surface.
async fn job_status(
    State(state): State<AppState>,
    Path(id): Path<JobId>,
) -> ApiResult<Json<JobStatusResponse>> {
    let job = state.store.get(id).ok_or(ApiError::NotFound)?;
    Ok(Json(JobStatusResponse::from(&job)))
}

/// `GET /jobs/{id}/srt`: subtitle export rendered from the persisted
/// segments artifact. Only available once the job is `completed`.
async fn job_srt(
    State(state): State<AppState>,
    Path(id): Path<JobId>,
) -> ApiResult<Response> {
    let job = state.store.get(id).ok_or(ApiError::NotFound)?;
    if job.stage != JobStage::Completed {
        return Err(ApiError::NotFound);
    }
    let segments_key = job.segments_key.ok_or(ApiError::NotFound)?;
    let blob = state.blobs.read(&segments_key).await?;
    let segments = artifact::decode_segments(&blob)?;
    Ok((
        [(header::CONTENT_TYPE, "application/x-subrip; charset=utf-8")],
        srt::render(&segments),
    )
        .into_response())
}

#[derive(Debug, Deserialize)]
struct NextQuery {
    worker: String,
}

/// `GET /jobs/next?worker={id}`: atomic claim; 204 when the queue is
/// empty.
async fn next_job(
    State(state): State<AppState>,
    Query(query): Query<NextQuery>,
) -> ApiResult<Response> {
    if query.worker.trim().is_empty() {
        return Err(ApiError::BadRequest("worker must be non-empty".to_string()));
    }

    let claimed = state
        .store
        .claim_one(&query.worker, Utc::now(), state.queue.lease_duration())?;
    Ok(match claimed {
        Some(job) => {
            verbose!("leased job {} to {}", job.id, query.worker);
            let response = NextJobResponse {
                id: job.id,
                audio_key: job.audio_key.clone(),
                lease_expiry_unix_ms: job.lease_expires_at.map(unix_ms).unwrap_or_default(),
            };
            (StatusCode::OK, Json(response)).into_response()
        }
        None => StatusCode::NO_CONTENT.into_response(),
    })
}

/// `POST /jobs/{id}/heartbeat`: extend the lease or report it lost.
async fn heartbeat(
    State(state): State<AppState>,
    Path(id): Path<JobId>,
    Json(req): Json<HeartbeatRequest>,
) -> ApiResult<Json<HeartbeatResponse>> {
    if state.store.get(id).is_none() {
        return Err(ApiError::NotFound);
    }
    let extended =
        state
            .store
            .heartbeat(id, &req.worker, Utc::now(), state.queue.lease_duration())?;
    match extended {
        Some(expiry) => Ok(Json(HeartbeatResponse {
            lease_expiry_unix_ms: unix_ms(expiry),
        })),
        None => Err(ApiError::Conflict),
    }
}

/// `POST /jobs/{id}/complete`: validate artifacts, then commit.
async fn complete(
    State(state): State<AppState>,
    Path(id): Path<JobId>,
    Json(req): Json<CompleteRequest>,
) -> ApiResult<StatusCode> {
    if state.store.get(id).is_none() {
        return Err(ApiError::NotFound);
    }

    // The completion invariant: the text artifact must exist and be
    // non-empty before the stage may move.
    match state.blobs.size(&req.text_key).await {
        Ok(0) => {
            return Err(ApiError::BadRequest("text artifact is empty".to_string()));
        }
        Ok(_) => {}
        Err(ScribaError::NotFound(_)) => {
            return Err(ApiError::BadRequest("text artifact is missing".to_string()));
        }
        Err(e) => return Err(e.into()),
    }
    if let Some(key) = &req.segments_key
        && !state.blobs.exists(key).await
    {
        return Err(ApiError::BadRequest("segments artifact is missing".to_string()));
    }
    if req.segments_key.is_none() && req.summary.is_none() {
        return Err(ApiError::BadRequest(
            "a completed job needs a segments artifact or a summary".to_string(),
        ));
    }

    let committed = state.store.commit_complete(
        id,
        &req.worker,
        Utc::now(),
        req.text_key,
        req.segments_key,
        req.summary,
        req.processing_seconds,
    )?;
    if committed {
        Ok(StatusCode::OK)
    } else {
        Err(ApiError::Conflict)
    }
}

/// `POST /jobs/{id}/fail`: record a worker-side failure.
async fn fail(
    State(state): State<AppState>,
    Path(id): Path<JobId>,
    Json(req): Json<FailRequest>,
) -> ApiResult<StatusCode> {
    if state.store.get(id).is_none() {
        return Err(ApiError::NotFound);
    }
    let committed =
        state
            .store
            .commit_fail(id, &req.worker, Utc::now(), &req.reason, req.retryable)?;
    if committed {
        Ok(StatusCode::OK)
    } else {
        Err(ApiError::Conflict)
    }
}

/// `GET /blobs/{key}`: stream a blob to a worker or submitter.
async fn get_blob(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> ApiResult<Response> {
    let file = state.blobs.get_stream(&key).await?;
    let body = Body::from_stream(ReaderStream::new(file));
    Ok((
        [(header::CONTENT_TYPE, "application/octet-stream")],
        body,
    )
        .into_response())
}

/// `PUT /blobs/{key}`: stream a blob from a worker into the store.
async fn put_blob(
    State(state): State<AppState>,
    Path(key): Path<String>,
    body: Body,
) -> ApiResult<StatusCode> {
    let mut reader = StreamReader::new(
        body.into_data_stream()
            .map_err(|e| std::io::Error::other(format!("upload stream: {e}"))),
    );
    let bytes = state.blobs.put_stream(&key, &mut reader).await?;
    verbose!("stored blob {key} ({bytes} bytes)");
    Ok(StatusCode::OK)
}

/// `DELETE /blobs/{key}`: idempotent.
async fn delete_blob(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> ApiResult<StatusCode> {
    state.blobs.delete(&key).await?;
    Ok(StatusCode::OK)
}
