//! Ingest consumers: lines in, persisted batches out.
//!
//! Each consumer owns the line assemblers for the sources hashed onto it, so
//! records from one source are processed in arrival order.

use super::stats::IngestStats;
use super::store::{self, PendingRecord, RecordPayload};
use crate::cli::YearMode;
use crate::config::{self, AppConfig};
use crate::db::PgPool;
use crate::devices;
use crate::ha;
use crate::parse::{self, LineAssembler, RecordKind};
use chrono::Utc;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{debug, error, info};
use uuid::Uuid;

pub struct IngestContext {
    pub pool: PgPool,
    pub config: Arc<AppConfig>,
    pub stats: Arc<IngestStats>,
}

/// Pin a source address to one consumer so per-source ordering holds.
pub fn shard_for_addr(addr: &SocketAddr, shards: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    addr.ip().hash(&mut hasher);
    addr.port().hash(&mut hasher);
    (hasher.finish() as usize) % shards.max(1)
}

/// Build the stored record for one assembled syslog record.
pub fn build_pending_record(
    record_text: String,
    year_mode: YearMode,
    member_map: &HashMap<String, String>,
    from_syslog: bool,
    job_id: Option<Uuid>,
    stats: &IngestStats,
) -> PendingRecord {
    let now = Utc::now();
    IngestStats::bump(&stats.records_processed);

    let oversize = record_text.len() > config::MAX_LINE_BYTES;
    let text = if oversize {
        IngestStats::bump(&stats.oversize_lines);
        truncate_utf8(&record_text, config::MAX_LINE_BYTES)
    } else {
        record_text
    };

    match parse::parse_line(&text, year_mode, now) {
        Ok(parsed) => {
            let device_key = ha::canonical_device_key(&parsed.device_hint, member_map);
            let (payload, filtered) = match parsed.kind {
                RecordKind::Conn(conn) => (RecordPayload::Conn(conn), false),
                RecordKind::Device(device) => (RecordPayload::Device(device), false),
                RecordKind::Other => (RecordPayload::None, true),
            };
            if filtered {
                IngestStats::bump(&stats.filtered_id);
            } else {
                IngestStats::bump(&stats.parse_ok);
            }
            PendingRecord {
                device_key,
                received_at: parsed.received_at,
                raw_line: text,
                parse_status: if oversize { "oversize" } else { "ok" }.to_string(),
                parse_error: None,
                job_id,
                payload,
                from_syslog,
            }
        }
        Err(err) => {
            IngestStats::bump(&stats.parse_err);
            PendingRecord {
                device_key: "unknown".to_string(),
                received_at: now,
                raw_line: text,
                parse_status: "error".to_string(),
                parse_error: Some(err.to_string()),
                job_id,
                payload: RecordPayload::None,
                from_syslog,
            }
        }
    }
}

fn truncate_utf8(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    s[..end].to_string()
}

/// One ingest consumer: drains its line queue, assembles records per
/// source, and persists batches.
pub async fn run_consumer(
    ctx: Arc<IngestContext>,
    shard: usize,
    mut rx: mpsc::Receiver<(SocketAddr, String)>,
) {
    let mut assemblers: HashMap<SocketAddr, LineAssembler> = HashMap::new();
    let mut member_map: HashMap<String, String> = HashMap::new();
    let mut member_map_at: Option<Instant> = None;

    info!(shard, "ingest consumer started");
    loop {
        let mut lines = Vec::with_capacity(config::INGEST_BATCH_LINES);
        match rx.recv().await {
            Some(line) => lines.push(line),
            None => break,
        }
        let deadline = tokio::time::Instant::now() + config::INGEST_BATCH_WAIT;
        while lines.len() < config::INGEST_BATCH_LINES {
            match tokio::time::timeout_at(deadline, rx.recv()).await {
                Ok(Some(line)) => lines.push(line),
                Ok(None) | Err(_) => break,
            }
        }

        if refresh_due(member_map_at) {
            match ctx.pool.get().await {
                Ok(mut conn) => match devices::enabled_member_map(&mut conn).await {
                    Ok(map) => {
                        member_map = map;
                        member_map_at = Some(Instant::now());
                    }
                    Err(err) => debug!(shard, error = %err, "cluster map refresh failed"),
                },
                Err(err) => debug!(shard, error = ?err, "cluster map refresh failed"),
            }
        }

        let mut records = Vec::new();
        for (addr, line) in lines {
            IngestStats::bump(&ctx.stats.lines_received);
            let assembler = assemblers.entry(addr).or_default();
            if let Some(completed) = assembler.feed(&line) {
                records.push(build_record(&ctx, completed, &member_map));
            }
        }
        // Idle sources hold at most one record; flush them so the tail of a
        // burst is not stuck behind the next datagram.
        if records.is_empty() {
            for assembler in assemblers.values_mut() {
                if let Some(completed) = assembler.flush() {
                    records.push(build_record(&ctx, completed, &member_map));
                }
            }
        }

        if records.is_empty() {
            continue;
        }

        let mut conn = match ctx.pool.get().await {
            Ok(conn) => conn,
            Err(err) => {
                IngestStats::bump(&ctx.stats.batch_errors);
                error!(shard, error = ?err, "no database connection for ingest batch");
                continue;
            }
        };
        match store::persist_batch(&mut conn, &records).await {
            Ok(outcome) => {
                IngestStats::add(&ctx.stats.raw_logs_saved, outcome.raw_logs_inserted);
                IngestStats::add(&ctx.stats.events_saved, outcome.events_inserted);
                IngestStats::add(&ctx.stats.parse_err, outcome.flow_conflicts);
                ctx.stats.touch();
            }
            Err(err) => {
                IngestStats::bump(&ctx.stats.batch_errors);
                ctx.stats.touch();
                error!(shard, error = %err, "ingest batch dropped");
            }
        }
    }
    info!(shard, "ingest consumer stopped");
}

fn build_record(
    ctx: &IngestContext,
    record_text: String,
    member_map: &HashMap<String, String>,
) -> PendingRecord {
    build_pending_record(
        record_text,
        ctx.config.year_mode,
        member_map,
        true,
        None,
        &ctx.stats,
    )
}

fn refresh_due(last: Option<Instant>) -> bool {
    match last {
        Some(at) => at.elapsed() >= config::SETTINGS_REFRESH,
        None => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shard_is_stable_per_source() {
        let addr: SocketAddr = "10.1.2.3:5514".parse().unwrap();
        let first = shard_for_addr(&addr, 4);
        for _ in 0..16 {
            assert_eq!(shard_for_addr(&addr, 4), first);
        }
        assert!(first < 4);
    }

    #[test]
    fn parse_error_still_produces_raw_record() {
        let stats = IngestStats::new();
        let record = build_pending_record(
            "not a syslog line at all".to_string(),
            YearMode::Auto,
            &HashMap::new(),
            true,
            None,
            &stats,
        );
        assert_eq!(record.parse_status, "error");
        assert!(record.parse_error.is_some());
        assert!(matches!(record.payload, RecordPayload::None));
        assert_eq!(stats.snapshot().parse_err, 1);
    }

    #[test]
    fn conn_record_is_classified_and_canonicalised() {
        let stats = IngestStats::new();
        let mut members = HashMap::new();
        members.insert("fw-a".to_string(), "fw".to_string());
        let line = "<134>Feb 10 17:37:13 FW-A EFW: CONN: id=00600001 conn=open \
                    connipproto=TCP connsrcip=10.0.0.5 connsrcport=1 conndestip=1.1.1.1 conndestport=80"
            .to_string();
        let record =
            build_pending_record(line, YearMode::Current, &members, true, None, &stats);
        assert_eq!(record.device_key, "ha:fw");
        assert!(matches!(record.payload, RecordPayload::Conn(_)));
        assert_eq!(record.parse_status, "ok");
    }

    #[test]
    fn oversize_record_is_truncated_and_flagged() {
        let stats = IngestStats::new();
        let mut line = "<134>Feb 10 17:37:13 fw1 EFW: CONN: id=00600001 conn=open \
                        connipproto=TCP connsrcip=10.0.0.5 connsrcport=1 conndestip=1.1.1.1 conndestport=80 pad="
            .to_string();
        line.push_str(&"x".repeat(config::MAX_LINE_BYTES));
        let record = build_pending_record(
            line,
            YearMode::Current,
            &HashMap::new(),
            true,
            None,
            &stats,
        );
        assert_eq!(record.parse_status, "oversize");
        assert!(record.raw_line.len() <= config::MAX_LINE_BYTES);
        assert_eq!(stats.snapshot().oversize_lines, 1);
    }
}
