//! Retention cleanup: drop aged syslog rows for firewalls that only ever
//! received live syslog.

use super::{JobManager, STATUS_DONE};
use crate::config::CLEANUP_BATCH_ROWS;
use crate::error::{Result, ServiceError};
use crate::models::IngestJobRow;
use crate::settings::SettingsStore;
use chrono::{Duration, Utc};
use diesel::prelude::*;
use diesel_async::{AsyncPgConnection, RunQueryDsl, SimpleAsyncConnection};
use serde_json::json;
use tracing::{info, warn};

pub async fn run_cleanup(
    manager: &JobManager,
    settings: &SettingsStore,
    job: &IngestJobRow,
) -> Result<()> {
    let retention = settings.log_retention().await?;
    if !retention.enabled {
        manager
            .update_row(job.id, |patch| {
                patch.status = Some(STATUS_DONE);
                patch.progress = Some(1.0);
                patch.result_counts = Some(json!({ "skipped": true, "reason": "disabled" }));
                patch.mark_finished();
            })
            .await?;
        return Ok(());
    }

    let cutoff = Utc::now() - Duration::days(retention.keep_days as i64);
    let mut conn = manager
        .pool()
        .get()
        .await
        .map_err(|err| ServiceError::StorageUnavailable(format!("{err:?}")))?;

    // Only firewalls that never imported are eligible; imported data is
    // operator-owned and survives retention.
    let eligible: Vec<String> = {
        use crate::schema::firewalls::dsl as fw;
        fw::firewalls
            .filter(fw::source_syslog.eq(true))
            .filter(fw::source_import.eq(false))
            .select(fw::device_key)
            .load(&mut *conn)
            .await?
    };

    manager
        .update_row(job.id, |patch| {
            patch.phase = Some("storing".to_string());
        })
        .await?;

    let mut events_deleted: i64 = 0;
    let mut raw_logs_deleted: i64 = 0;
    let total_devices = eligible.len().max(1);

    for (idx, device) in eligible.iter().enumerate() {
        loop {
            if manager.cancel_requested(job.id).await {
                return Err(ServiceError::Canceled);
            }
            let (events, raw_logs) = delete_batch(&mut conn, device, cutoff).await?;
            events_deleted += events;
            raw_logs_deleted += raw_logs;
            if events == 0 && raw_logs == 0 {
                break;
            }
        }
        let progress = (idx + 1) as f64 / total_devices as f64 * 0.9;
        manager
            .update_row(job.id, |patch| {
                patch.progress = Some(progress);
            })
            .await?;
    }

    manager
        .update_row(job.id, |patch| {
            patch.phase = Some("vacuum".to_string());
        })
        .await?;
    if let Err(err) = conn.batch_execute("VACUUM (ANALYZE) raw_logs, events").await {
        warn!(error = %err, "vacuum after cleanup failed");
    }

    let counts = json!({
        "events_deleted": events_deleted,
        "raw_logs_deleted": raw_logs_deleted,
        "devices": eligible.len(),
        "keep_days": retention.keep_days,
    });
    info!(%counts, "retention cleanup complete");
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

/// One bounded transaction of deletions for one device. Events go first so
/// the raw_log cascade never skews the counters.
async fn delete_batch(
    conn: &mut AsyncPgConnection,
    device_key: &str,
    cutoff: chrono::DateTime<Utc>,
) -> Result<(i64, i64)> {
    use diesel::sql_types::{BigInt, Text, Timestamptz};

    #[derive(QueryableByName)]
    struct Deleted {
        #[diesel(sql_type = BigInt)]
        count: i64,
    }

    let events: Vec<Deleted> = diesel::sql_query(
        "WITH doomed AS (SELECT id FROM events WHERE device_key = $1 AND ts < $2 LIMIT $3), \
         gone AS (DELETE FROM events WHERE id IN (SELECT id FROM doomed) RETURNING id) \
         SELECT count(*) AS count FROM gone",
    )
    .bind::<Text, _>(device_key)
    .bind::<Timestamptz, _>(cutoff)
    .bind::<BigInt, _>(CLEANUP_BATCH_ROWS)
    .load(conn)
    .await?;

    let raw_logs: Vec<Deleted> = diesel::sql_query(
        "WITH doomed AS (SELECT id FROM raw_logs WHERE device_key = $1 AND received_at < $2 LIMIT $3), \
         gone AS (DELETE FROM raw_logs WHERE id IN (SELECT id FROM doomed) RETURNING id) \
         SELECT count(*) AS count FROM gone",
    )
    .bind::<Text, _>(device_key)
    .bind::<Timestamptz, _>(cutoff)
    .bind::<BigInt, _>(CLEANUP_BATCH_ROWS)
    .load(conn)
    .await?;

    Ok((
        events.as_slice().first().map(|d| d.count).unwrap_or(0),
        raw_logs.as_slice().first().map(|d| d.count).unwrap_or(0),
    ))
}
