//! Batched persistence: raw logs, events, flow upserts and endpoint
//! sightings land in one transaction per batch.

use super::reconstruct::{self, FlowOutcome};
use super::resolver::{self, SightingBatch};
use crate::devices;
use crate::error::{Result, ServiceError};
use crate::models::{NewEvent, NewRawLog};
use crate::parse::{ConnRecord, DeviceRecord};
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel_async::scoped_futures::ScopedFutureExt;
use diesel_async::{AsyncConnection, AsyncPgConnection, RunQueryDsl};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{error, warn};
use uuid::Uuid;

const STORE_BACKOFF: &[Duration] = &[
    Duration::from_millis(50),
    Duration::from_millis(200),
    Duration::from_millis(1000),
];

#[derive(Debug, Clone)]
pub enum RecordPayload {
    Conn(ConnRecord),
    Device(DeviceRecord),
    /// Parse error or filtered id; only the raw log row is written.
    None,
}

#[derive(Debug, Clone)]
pub struct PendingRecord {
    pub device_key: String,
    pub received_at: DateTime<Utc>,
    pub raw_line: String,
    pub parse_status: String,
    pub parse_error: Option<String>,
    pub job_id: Option<Uuid>,
    pub payload: RecordPayload,
    /// Live syslog marks the firewall source_syslog; imports do not.
    pub from_syslog: bool,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct BatchOutcome {
    pub raw_logs_inserted: u64,
    pub events_inserted: u64,
    pub flow_conflicts: u64,
}

/// Persist a batch of parsed records. The whole batch is retried with
/// backoff on storage failure; persistent failure surfaces as
/// `storage_unavailable` so producers can pause.
pub async fn persist_batch(
    conn: &mut AsyncPgConnection,
    records: &[PendingRecord],
) -> Result<BatchOutcome> {
    if records.is_empty() {
        return Ok(BatchOutcome::default());
    }

    let mut last_err: Option<ServiceError> = None;
    for (attempt, backoff) in [Duration::ZERO]
        .iter()
        .chain(STORE_BACKOFF.iter())
        .enumerate()
    {
        if !backoff.is_zero() {
            tokio::time::sleep(*backoff).await;
        }
        match persist_once(conn, records).await {
            Ok(outcome) => return Ok(outcome),
            Err(err) => {
                warn!(attempt, error = %err, "batch persist failed");
                last_err = Some(err);
            }
        }
    }

    let detail = last_err
        .map(|e| e.to_string())
        .unwrap_or_else(|| "unknown".to_string());
    error!(%detail, "batch persist exhausted retries");
    Err(ServiceError::StorageUnavailable(detail))
}

async fn persist_once(
    conn: &mut AsyncPgConnection,
    records: &[PendingRecord],
) -> Result<BatchOutcome> {
    conn.transaction::<BatchOutcome, ServiceError, _>(|conn| {
        async move {
            use crate::schema::raw_logs::dsl as rl;

            let mut outcome = BatchOutcome::default();

            let raw_rows: Vec<NewRawLog> = records
                .iter()
                .map(|r| NewRawLog {
                    device_key: r.device_key.clone(),
                    received_at: r.received_at,
                    raw_line: r.raw_line.clone(),
                    parse_status: r.parse_status.clone(),
                    parse_error: r.parse_error.clone(),
                    job_id: r.job_id,
                })
                .collect();
            let raw_ids: Vec<i64> = diesel::insert_into(rl::raw_logs)
                .values(&raw_rows)
                .returning(rl::id)
                .get_results(conn)
                .await?;
            outcome.raw_logs_inserted = raw_ids.len() as u64;

            let mut sightings = SightingBatch::new();
            let mut seen_windows: HashMap<&str, (DateTime<Utc>, bool)> = HashMap::new();

            for (record, raw_log_id) in records.iter().zip(raw_ids) {
                seen_windows
                    .entry(record.device_key.as_str())
                    .and_modify(|(last, syslog)| {
                        if record.received_at > *last {
                            *last = record.received_at;
                        }
                        *syslog |= record.from_syslog;
                    })
                    .or_insert((record.received_at, record.from_syslog));

                match &record.payload {
                    RecordPayload::Conn(conn_record) => {
                        insert_event(conn, record, raw_log_id, conn_record).await?;
                        outcome.events_inserted += 1;
                        match reconstruct::upsert_flow(
                            conn,
                            &record.device_key,
                            record.received_at,
                            conn_record,
                        )
                        .await
                        {
                            Ok(FlowOutcome::Opened)
                            | Ok(FlowOutcome::Reopened)
                            | Ok(FlowOutcome::Closed)
                            | Ok(FlowOutcome::SynthesisedClose)
                            | Ok(FlowOutcome::DuplicateOpen) => {}
                            Err(ServiceError::Conflict) => {
                                outcome.flow_conflicts += 1;
                            }
                            Err(other) => return Err(other),
                        }
                        sightings.record_conn(&record.device_key, conn_record, record.received_at);
                    }
                    RecordPayload::Device(device_record) => {
                        resolver::apply_device_record(
                            conn,
                            &record.device_key,
                            device_record,
                            record.received_at,
                        )
                        .await?;
                    }
                    RecordPayload::None => {}
                }
            }

            if !sightings.is_empty() {
                sightings.flush(conn).await?;
            }

            for (device_key, (last_ts, from_syslog)) in seen_windows {
                if from_syslog {
                    devices::upsert_firewall_syslog(conn, device_key, last_ts).await?;
                }
            }

            Ok(outcome)
        }
        .scope_boxed()
    })
    .await
}

async fn insert_event(
    conn: &mut AsyncPgConnection,
    record: &PendingRecord,
    raw_log_id: i64,
    conn_record: &ConnRecord,
) -> Result<()> {
    use crate::schema::events::dsl as ev;

    let event_kind = if conn_record.action.is_close_like() {
        "close"
    } else {
        "open"
    };
    let row = NewEvent {
        raw_log_id,
        device_key: record.device_key.clone(),
        ts: record.received_at,
        event_kind: event_kind.to_string(),
        proto: conn_record.proto.clone(),
        src_ip: conn_record.src_ip.clone(),
        src_port: conn_record.src_port,
        dst_ip: conn_record.dst_ip.clone(),
        dst_port: conn_record.dst_port,
        src_zone: conn_record.src_zone.clone(),
        src_if: conn_record.src_if.clone(),
        dst_zone: conn_record.dst_zone.clone(),
        dst_if: conn_record.dst_if.clone(),
        src_mac: conn_record.src_mac.clone(),
        dst_mac: conn_record.dst_mac.clone(),
        xlat_src_ip: conn_record.xlat_src_ip.clone(),
        xlat_src_port: conn_record.xlat_src_port,
        xlat_dst_ip: conn_record.xlat_dst_ip.clone(),
        xlat_dst_port: conn_record.xlat_dst_port,
        rule: conn_record.rule.clone(),
        app_name: conn_record.app_name.clone(),
        bytes_orig: conn_record.bytes_orig,
        bytes_term: conn_record.bytes_term,
    };
    diesel::insert_into(ev::events)
        .values(&row)
        .execute(conn)
        .await?;
    Ok(())
}
