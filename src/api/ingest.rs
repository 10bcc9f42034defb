use crate::config::MAX_UPLOAD_BYTES;
use crate::error::{Result, ServiceError};
use crate::models::IngestJobRow;
use crate::state::AppState;
use axum::extract::{Multipart, Path, Query, State};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::io::AsyncWriteExt;
use tracing::info;
use uuid::Uuid;

/// Shared job row rendering for every job-status endpoint.
pub fn job_status(job: &IngestJobRow) -> Value {
    json!({
        "job_id": job.id,
        "kind": job.kind,
        "status": job.status,
        "phase": job.phase,
        "progress": job.progress,
        "cancel_requested": job.cancel_requested,
        "device_key": job.device_key,
        "filename": job.filename,
        "bytes_total": job.bytes_total,
        "lines_total": job.lines_total,
        "lines_processed": job.lines_processed,
        "parse_ok": job.parse_ok,
        "parse_err": job.parse_err,
        "filtered_id": job.filtered_id,
        "raw_logs_inserted": job.raw_logs_inserted,
        "events_inserted": job.events_inserted,
        "time_min": job.time_min,
        "time_max": job.time_max,
        "device_detected": job.device_detected,
        "error_type": job.error_type,
        "error_message": job.error_message,
        "error_stage": job.error_stage,
        "result_counts": job.result_counts,
        "created_at": job.created_at,
        "started_at": job.started_at,
        "finished_at": job.finished_at,
    })
}

/// Multipart upload: stream the file to disk, then queue the import job.
pub async fn upload(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<Value>> {
    let upload_dir = state.jobs.upload_path(Uuid::nil());
    let upload_dir = upload_dir.parent().map(std::path::Path::to_path_buf);
    if let Some(dir) = &upload_dir {
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|err| ServiceError::Internal(err.into()))?;
    }

    let mut device_hint: Option<String> = None;
    let mut staged: Option<(std::path::PathBuf, String, u64)> = None;

    while let Some(mut field) = multipart
        .next_field()
        .await
        .map_err(|err| ServiceError::Validation(format!("invalid multipart body: {err}")))?
    {
        let name = field.name().unwrap_or("").to_string();
        match name.as_str() {
            "device" => {
                let value = field
                    .text()
                    .await
                    .map_err(|err| ServiceError::Validation(format!("invalid device field: {err}")))?;
                let value = value.trim().to_string();
                if !value.is_empty() {
                    device_hint = Some(value);
                }
            }
            "file" => {
                let filename = field
                    .file_name()
                    .map(str::to_string)
                    .unwrap_or_else(|| "upload.log".to_string());
                let tmp_path = state
                    .jobs
                    .upload_path(Uuid::new_v4())
                    .with_extension("partial");
                let mut file = tokio::fs::File::create(&tmp_path)
                    .await
                    .map_err(|err| ServiceError::Internal(err.into()))?;
                let mut written: u64 = 0;
                while let Some(chunk) = field
                    .chunk()
                    .await
                    .map_err(|err| ServiceError::Validation(format!("upload aborted: {err}")))?
                {
                    written += chunk.len() as u64;
                    if written > MAX_UPLOAD_BYTES {
                        drop(file);
                        let _ = tokio::fs::remove_file(&tmp_path).await;
                        return Err(ServiceError::Validation(
                            "upload exceeds the 1 GiB limit".into(),
                        ));
                    }
                    file.write_all(&chunk)
                        .await
                        .map_err(|err| ServiceError::Internal(err.into()))?;
                }
                file.flush()
                    .await
                    .map_err(|err| ServiceError::Internal(err.into()))?;
                staged = Some((tmp_path, filename, written));
            }
            _ => {}
        }
    }

    let Some((tmp_path, filename, size_bytes)) = staged else {
        return Err(ServiceError::Validation("missing 'file' field".into()));
    };

    let job = state
        .jobs
        .submit_import(&filename, size_bytes as i64, device_hint.as_deref())
        .await?;
    let final_path = state.jobs.upload_path(job.id);
    tokio::fs::rename(&tmp_path, &final_path)
        .await
        .map_err(|err| ServiceError::Internal(err.into()))?;

    info!(job_id = %job.id, %filename, size_bytes, "upload staged for import");
    Ok(Json(json!({
        "ok": true,
        "job_id": job.id,
        "filename": filename,
        "size_bytes": size_bytes,
    })))
}

#[derive(Debug, Deserialize)]
pub struct StatusParams {
    pub job_id: Uuid,
}

pub async fn upload_status(
    State(state): State<AppState>,
    Query(params): Query<StatusParams>,
) -> Result<Json<Value>> {
    let job = state.jobs.get(params.job_id).await?;
    Ok(Json(job_status(&job)))
}

#[derive(Debug, Deserialize)]
pub struct ListJobsParams {
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default = "default_job_limit")]
    pub limit: i64,
}

fn default_job_limit() -> i64 {
    50
}

pub async fn list_jobs(
    State(state): State<AppState>,
    Query(params): Query<ListJobsParams>,
) -> Result<Json<Value>> {
    let jobs = state
        .jobs
        .list(params.state.as_deref(), None, params.limit)
        .await?;
    let items: Vec<Value> = jobs.iter().map(job_status).collect();
    Ok(Json(json!({ "jobs": items })))
}

pub async fn cancel_job(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> Result<Json<Value>> {
    let job = state.jobs.cancel(job_id).await?;
    Ok(Json(json!({ "ok": true, "status": job.status })))
}

pub async fn delete_job(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> Result<Json<Value>> {
    state.jobs.delete(job_id).await?;
    Ok(Json(json!({ "ok": true })))
}

pub async fn stats(State(state): State<AppState>) -> Json<Value> {
    Json(json!(state.stats.snapshot()))
}

pub async fn reset_stats(State(state): State<AppState>) -> Json<Value> {
    state.stats.reset();
    Json(json!({ "ok": true }))
}
