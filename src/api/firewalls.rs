use crate::devices;
use crate::error::{Result, ServiceError};
use crate::jobs::JobKind;
use crate::models::FirewallOverrideRow;
use crate::state::AppState;
use axum::extract::{Path, State};
use axum::Json;
use chrono::Utc;
use diesel::prelude::*;
use diesel_async::RunQueryDsl;
use serde::Deserialize;
use serde_json::{json, Value};

pub async fn list(State(state): State<AppState>) -> Result<Json<Value>> {
    let mut conn = state.conn().await?;
    let firewalls = devices::list_firewalls(&mut *conn).await?;
    let overrides = devices::display_overrides(&mut *conn).await?;

    let items: Vec<Value> = firewalls
        .into_iter()
        .map(|fw| {
            let display_name = overrides
                .get(&fw.device_key)
                .cloned()
                .unwrap_or_else(|| fw.device_key.clone());
            json!({
                "device_key": fw.device_key,
                "display_name": display_name,
                "source_syslog": fw.source_syslog,
                "source_import": fw.source_import,
                "first_seen": fw.first_seen,
                "last_seen": fw.last_seen,
                "last_import_ts": fw.last_import_ts,
            })
        })
        .collect();
    Ok(Json(json!(items)))
}

pub async fn get_override(
    State(state): State<AppState>,
    Path(device_key): Path<String>,
) -> Result<Json<Value>> {
    let mut conn = state.conn().await?;
    use crate::schema::firewall_overrides::dsl as fo;
    let row: Option<FirewallOverrideRow> = fo::firewall_overrides
        .filter(fo::device_key.eq(&device_key))
        .select(FirewallOverrideRow::as_select())
        .first(&mut *conn)
        .await
        .optional()?;
    Ok(Json(json!({
        "device_key": device_key,
        "display_name": row.as_ref().map(|r| r.display_name.clone()),
        "comment": row.as_ref().and_then(|r| r.comment.clone()),
    })))
}

#[derive(Debug, Deserialize)]
pub struct OverrideBody {
    pub display_name: String,
    #[serde(default)]
    pub comment: Option<String>,
}

pub async fn put_override(
    State(state): State<AppState>,
    Path(device_key): Path<String>,
    Json(body): Json<OverrideBody>,
) -> Result<Json<Value>> {
    let display_name = body.display_name.trim();
    if display_name.is_empty() {
        return Err(ServiceError::Validation(
            "display_name must not be empty".into(),
        ));
    }
    let mut conn = state.conn().await?;
    use crate::schema::firewall_overrides::dsl as fo;
    let now = Utc::now();
    diesel::insert_into(fo::firewall_overrides)
        .values((
            fo::device_key.eq(&device_key),
            fo::display_name.eq(display_name),
            fo::comment.eq(&body.comment),
            fo::updated_at.eq(now),
        ))
        .on_conflict(fo::device_key)
        .do_update()
        .set((
            fo::display_name.eq(display_name),
            fo::comment.eq(&body.comment),
            fo::updated_at.eq(now),
        ))
        .execute(&mut *conn)
        .await?;
    Ok(Json(json!({ "ok": true })))
}

pub async fn purge(
    State(state): State<AppState>,
    Path(device_key): Path<String>,
) -> Result<Json<Value>> {
    let job = state.jobs.submit_purge(&device_key).await?;
    Ok(Json(json!({ "ok": true, "job_id": job.id })))
}

pub async fn import_jobs(
    State(state): State<AppState>,
    Path(device_key): Path<String>,
) -> Result<Json<Value>> {
    let jobs = state.jobs.list(None, Some(&device_key), 100).await?;
    let items: Vec<Value> = jobs
        .into_iter()
        .filter(|job| job.kind == JobKind::Import.as_str())
        .map(|job| super::ingest::job_status(&job))
        .collect();
    Ok(Json(json!(items)))
}
