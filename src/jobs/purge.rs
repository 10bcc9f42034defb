//! Purge job: remove every row belonging to one firewall.

use super::{JobManager, STATUS_DONE};
use crate::config::PURGE_BATCH_ROWS;
use crate::devices;
use crate::error::{Result, ServiceError};
use crate::models::IngestJobRow;
use diesel::prelude::*;
use diesel_async::{AsyncPgConnection, RunQueryDsl};
use serde_json::json;
use tracing::info;

/// Chunk-deleted tables, in dependency order: events go before raw_logs so
/// the cascade never skews the counters.
const PURGE_TABLES: &[&str] = &[
    "events",
    "raw_logs",
    "flows",
    "endpoints",
    "endpoint_overrides",
    "router_mac_rules",
];

pub async fn run_purge(manager: &JobManager, job: &IngestJobRow) -> Result<()> {
    let device_key = job
        .device_key
        .clone()
        .ok_or_else(|| ServiceError::Validation("purge job without device_key".into()))?;

    let mut conn = manager
        .pool()
        .get()
        .await
        .map_err(|err| ServiceError::StorageUnavailable(format!("{err:?}")))?;

    // HA keys purge every member's rows plus the synthetic key itself.
    let mut members = devices::expand_device_key(&mut conn, &device_key).await?;
    if !members.contains(&device_key) {
        members.push(device_key.clone());
    }

    manager
        .update_row(job.id, |patch| {
            patch.phase = Some("storing".to_string());
        })
        .await?;

    let mut deleted_by_table = Vec::with_capacity(PURGE_TABLES.len());
    for (idx, table) in PURGE_TABLES.iter().enumerate() {
        let mut total: i64 = 0;
        loop {
            if manager.cancel_requested(job.id).await {
                return Err(ServiceError::Canceled);
            }
            let deleted = delete_chunk(&mut conn, table, &members).await?;
            total += deleted;
            if deleted == 0 {
                break;
            }
        }
        deleted_by_table.push((*table, total));
        let progress = (idx + 1) as f64 / (PURGE_TABLES.len() + 1) as f64;
        manager
            .update_row(job.id, |patch| {
                patch.progress = Some(progress);
            })
            .await?;
    }

    // Firewall rows are keyed by device_key; at most one row per member.
    if manager.cancel_requested(job.id).await {
        return Err(ServiceError::Canceled);
    }
    use crate::schema::{firewall_overrides::dsl as fo, firewalls::dsl as fw};
    let firewalls_deleted = diesel::delete(fw::firewalls.filter(fw::device_key.eq_any(&members)))
        .execute(&mut *conn)
        .await?;
    diesel::delete(fo::firewall_overrides.filter(fo::device_key.eq_any(&members)))
        .execute(&mut *conn)
        .await?;

    let mut counts = serde_json::Map::new();
    for (table, total) in &deleted_by_table {
        counts.insert(format!("{table}_deleted"), json!(total));
    }
    counts.insert("firewalls_deleted".to_string(), json!(firewalls_deleted));
    let counts = serde_json::Value::Object(counts);
    info!(%device_key, %counts, "purge complete");

    manager
        .update_row(job.id, |patch| {
            patch.status = Some(STATUS_DONE);
            patch.progress = Some(1.0);
            patch.result_counts = Some(counts);
            patch.mark_finished();
        })
        .await?;
    Ok(())
}

/// One bounded deletion for one table. The table name comes from the fixed
/// list above, never from input.
async fn delete_chunk(
    conn: &mut AsyncPgConnection,
    table: &str,
    members: &[String],
) -> Result<i64> {
    use diesel::sql_types::{Array, BigInt, Text};

    #[derive(QueryableByName)]
    struct Deleted {
        #[diesel(sql_type = BigInt)]
        count: i64,
    }

    let sql = format!(
        "WITH doomed AS (SELECT id FROM {table} WHERE device_key = ANY($1) LIMIT $2), \
         gone AS (DELETE FROM {table} WHERE id IN (SELECT id FROM doomed) RETURNING id) \
         SELECT count(*) AS count FROM gone"
    );
    let rows: Vec<Deleted> = diesel::sql_query(sql)
        .bind::<Array<Text>, _>(members)
        .bind::<BigInt, _>(PURGE_BATCH_ROWS)
        .load(conn)
        .await?;

    Ok(rows.as_slice().first().map(|d| d.count).unwrap_or(0))
}
