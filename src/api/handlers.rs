use std::os::unix::fs::PermissionsExt;

use axum::extract::{Multipart, Path as AxumPath, State};
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use chrono::Utc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::jobs::queue::RunScriptPayload;
use crate::jobs::{Job, JobError, JobStatus};
use crate::scripts;

use super::models::*;
use super::AppState;

// ── Health ──────────────────────────────────────────────────────────

/// GET /healthz
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        backend: "firecracker".to_string(),
        network_enabled: state.config.enable_network,
    })
}

// ── Scripts ─────────────────────────────────────────────────────────

/// POST /scripts — multipart upload with field `script`.
pub async fn upload_script(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<UploadResponse>, ApiError> {
    let mut script: Option<(String, Vec<u8>)> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|_| ApiError::bad_request("invalid file upload"))?
    {
        if field.name() == Some("script") {
            let ext = scripts::upload_extension(field.file_name());
            let bytes = field
                .bytes()
                .await
                .map_err(|_| ApiError::bad_request("invalid file upload"))?;
            script = Some((ext, bytes.to_vec()));
            break;
        }
    }

    let (ext, bytes) = script.ok_or_else(|| ApiError::bad_request("invalid file upload"))?;

    let script_id = Uuid::new_v4().to_string();
    let path = state.config.scripts_dir().join(format!("{}{}", script_id, ext));

    std::fs::create_dir_all(state.config.scripts_dir())
        .map_err(|_| ApiError::internal("failed to prepare storage"))?;
    std::fs::write(&path, &bytes).map_err(|_| ApiError::internal("failed to save script"))?;
    if let Err(e) = std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o644)) {
        warn!(path = %path.display(), error = %e, "failed to set script permissions");
    }

    info!(script_id = %script_id, size = bytes.len(), "script uploaded");
    Ok(Json(UploadResponse { script_id }))
}

// ── Runs ────────────────────────────────────────────────────────────

/// POST /scripts/{id}/run — insert the pending job, then enqueue.
pub async fn run_script(
    State(state): State<AppState>,
    AxumPath(script_id): AxumPath<String>,
) -> Result<Json<RunResponse>, ApiError> {
    if scripts::find_script(&state.config.scripts_dir(), &script_id).is_none() {
        return Err(ApiError::not_found("script not found"));
    }

    let job_id = Uuid::new_v4().to_string();
    let log_path = state
        .config
        .logs_dir()
        .join(format!("{}.log", job_id))
        .to_string_lossy()
        .into_owned();

    let job = Job {
        id: job_id.clone(),
        script_id: script_id.clone(),
        status: JobStatus::Pending,
        log_path,
        started_at: Utc::now().to_rfc3339(),
        finished_at: String::new(),
    };

    // The row must exist before the task is visible to any worker.
    state.repo.insert(&job).await.map_err(|e| {
        warn!(script_id = %script_id, error = %e, "job insert failed");
        ApiError::internal("failed to create job record")
    })?;

    state
        .queue
        .enqueue_run(&RunScriptPayload {
            script_id: script_id.clone(),
            job_id: job_id.clone(),
        })
        .await
        .map_err(|e| {
            warn!(job_id = %job_id, error = %e, "enqueue failed");
            ApiError::internal("failed to enqueue job")
        })?;

    info!(job_id = %job_id, script_id = %script_id, "job enqueued");
    Ok(Json(RunResponse { job_id }))
}

// ── Jobs ────────────────────────────────────────────────────────────

/// GET /jobs/{id}
pub async fn get_job(
    State(state): State<AppState>,
    AxumPath(job_id): AxumPath<String>,
) -> Result<Json<Job>, ApiError> {
    match state.repo.get(&job_id).await {
        Ok(job) => Ok(Json(job)),
        Err(JobError::NotFound(_)) => Err(ApiError::not_found("job not found")),
        Err(e) => {
            warn!(job_id = %job_id, error = %e, "job lookup failed");
            Err(ApiError::internal("failed to load job"))
        }
    }
}

/// GET /jobs/{id}/logs — raw log bytes as text/plain.
pub async fn get_job_logs(
    State(state): State<AppState>,
    AxumPath(job_id): AxumPath<String>,
) -> Result<impl IntoResponse, ApiError> {
    if !scripts::valid_id(&job_id) {
        return Err(ApiError::not_found("log not found"));
    }

    let log_path = state.config.logs_dir().join(format!("{}.log", job_id));
    let content =
        std::fs::read(&log_path).map_err(|_| ApiError::not_found("log not found"))?;

    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        content,
    ))
}
