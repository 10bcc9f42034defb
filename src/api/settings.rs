use crate::error::Result;
use crate::settings::{
    LocalNetworks, LogRetention, HA_BANNER_DISMISSED, LOCAL_NETWORKS, LOG_RETENTION,
};
use crate::state::AppState;
use axum::extract::{Path, State};
use axum::Json;
use diesel_async::RunQueryDsl;
use serde_json::{json, Value};
use uuid::Uuid;

pub async fn get_all(State(state): State<AppState>) -> Result<Json<Value>> {
    let all = state.settings.all().await?;
    Ok(Json(json!(all)))
}

pub async fn put_log_retention(
    State(state): State<AppState>,
    Json(payload): Json<LogRetention>,
) -> Result<Json<Value>> {
    payload.validate()?;
    state
        .settings
        .set(LOG_RETENTION, serde_json::to_value(&payload).unwrap_or_default())
        .await?;
    Ok(Json(json!({ "ok": true, "log_retention": payload })))
}

pub async fn get_local_networks(State(state): State<AppState>) -> Result<Json<Value>> {
    let networks = state.settings.local_networks().await?;
    Ok(Json(json!(networks)))
}

pub async fn put_local_networks(
    State(state): State<AppState>,
    Json(payload): Json<LocalNetworks>,
) -> Result<Json<Value>> {
    let normalized = payload.normalized()?;
    state
        .settings
        .set(
            LOCAL_NETWORKS,
            serde_json::to_value(&normalized).unwrap_or_default(),
        )
        .await?;
    Ok(Json(json!({ "ok": true, "local_networks": normalized })))
}

pub async fn put_ha_banner_dismissed(
    State(state): State<AppState>,
    Json(payload): Json<Vec<String>>,
) -> Result<Json<Value>> {
    state
        .settings
        .set(HA_BANNER_DISMISSED, json!(payload))
        .await?;
    Ok(Json(json!({ "ok": true })))
}

/// On-demand retention cleanup; skipped when one is already in flight.
pub async fn trigger_cleanup(State(state): State<AppState>) -> Result<Json<Value>> {
    match state.jobs.submit_cleanup().await? {
        Some(job) => Ok(Json(json!({ "ok": true, "job_id": job.id }))),
        None => Ok(Json(json!({ "skipped": true }))),
    }
}

pub async fn get_maintenance_job(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> Result<Json<Value>> {
    let job = state.jobs.get(job_id).await?;
    Ok(Json(super::ingest::job_status(&job)))
}

pub async fn db_stats(State(state): State<AppState>) -> Result<Json<Value>> {
    use diesel::sql_types::BigInt;

    #[derive(diesel::QueryableByName)]
    struct Counts {
        #[diesel(sql_type = BigInt)]
        raw_logs: i64,
        #[diesel(sql_type = BigInt)]
        events: i64,
        #[diesel(sql_type = BigInt)]
        flows: i64,
        #[diesel(sql_type = BigInt)]
        endpoints: i64,
        #[diesel(sql_type = BigInt)]
        firewalls: i64,
        #[diesel(sql_type = BigInt)]
        db_size_bytes: i64,
    }

    let mut conn = state.conn().await?;
    let counts: Vec<Counts> = diesel::sql_query(
        "SELECT \
            (SELECT count(*) FROM raw_logs) AS raw_logs, \
            (SELECT count(*) FROM events) AS events, \
            (SELECT count(*) FROM flows) AS flows, \
            (SELECT count(*) FROM endpoints) AS endpoints, \
            (SELECT count(*) FROM firewalls) AS firewalls, \
            pg_database_size(current_database()) AS db_size_bytes",
    )
    .load(&mut *conn)
    .await?;

    let counts = counts
        .as_slice()
        .first()
        .ok_or_else(|| crate::error::ServiceError::Internal(anyhow::anyhow!("empty stats row")))?;
    Ok(Json(json!({
        "raw_logs": counts.raw_logs,
        "events": counts.events,
        "flows": counts.flows,
        "endpoints": counts.endpoints,
        "firewalls": counts.firewalls,
        "db_size_bytes": counts.db_size_bytes,
    })))
}
