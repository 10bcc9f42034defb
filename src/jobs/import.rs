//! File import job: stream an uploaded (optionally gzipped) log file
//! through the ingest pipeline, reporting progress on the job row.

use super::{JobManager, STATUS_DONE};
use crate::config;
use crate::devices;
use crate::error::{Result, ServiceError};
use crate::ingest::pipeline::{self, IngestContext};
use crate::ingest::stats::IngestStats;
use crate::ingest::store::{self, PendingRecord};
use crate::models::IngestJobRow;
use crate::parse::LineAssembler;
use chrono::{DateTime, Utc};
use flate2::read::MultiGzDecoder;
use std::collections::HashMap;
use std::io::{BufRead, BufReader, Read};
use std::path::Path;
use tokio::sync::mpsc;
use tracing::{info, warn};

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
const READER_CHANNEL: usize = 1024;

/// Per-import counters; kept off the process-wide syslog stats.
#[derive(Default)]
struct ImportCollector {
    device_counts: HashMap<String, u64>,
    time_min: Option<DateTime<Utc>>,
    time_max: Option<DateTime<Utc>>,
    raw_logs: i64,
    events: i64,
    parse_ok: i64,
    parse_err: i64,
    filtered: i64,
}

impl ImportCollector {
    fn observe(&mut self, record: &PendingRecord) {
        *self
            .device_counts
            .entry(record.device_key.clone())
            .or_insert(0) += 1;
        let ts = record.received_at;
        if self.time_min.map_or(true, |t| ts < t) {
            self.time_min = Some(ts);
        }
        if self.time_max.map_or(true, |t| ts > t) {
            self.time_max = Some(ts);
        }
    }

    fn primary_device(&self, user_provided: Option<&str>) -> String {
        if let Some(device) = user_provided.map(str::trim).filter(|d| !d.is_empty()) {
            return device.to_string();
        }
        self.device_counts
            .iter()
            .max_by(|a, b| a.1.cmp(b.1).then_with(|| b.0.cmp(a.0)))
            .map(|(device, _)| device.clone())
            .unwrap_or_else(|| "unknown".to_string())
    }
}

enum ReaderEvent {
    Line { text: String, offset: u64 },
    Error(String),
    Eof,
}

pub async fn run_import(
    manager: &JobManager,
    ingest: &IngestContext,
    job: &IngestJobRow,
) -> Result<()> {
    match import_inner(manager, ingest, job).await {
        Ok(()) => Ok(()),
        Err(ServiceError::Canceled) => Err(ServiceError::Canceled),
        Err(err) => {
            let stage = infer_error_stage(&err);
            let _ = manager
                .update_row(job.id, |patch| {
                    patch.error_stage = Some(stage.to_string());
                })
                .await;
            Err(err)
        }
    }
}

/// Best-effort pipeline stage for the job row, derived from the error text.
fn infer_error_stage(err: &ServiceError) -> &'static str {
    let text = err.to_string();
    if matches!(err, ServiceError::StorageUnavailable(_)) || text.contains("persist") {
        "persist"
    } else if text.contains("stalled") || text.contains("open failed") || text.contains("not found")
    {
        "upload"
    } else {
        "parse"
    }
}

async fn import_inner(
    manager: &JobManager,
    ingest: &IngestContext,
    job: &IngestJobRow,
) -> Result<()> {
    let job_id = job.id;
    let path = manager.upload_path(job_id);
    if !path.exists() {
        return Err(ServiceError::Validation(format!(
            "upload file not found: {}",
            path.display()
        )));
    }

    manager
        .update_row(job_id, |patch| {
            patch.phase = Some("parsing".to_string());
        })
        .await?;

    let bytes_total = job.bytes_total.max(0) as u64;
    let mut collector = ImportCollector::default();
    let local_stats = IngestStats::new();
    let mut assembler = LineAssembler::new();
    let mut batch: Vec<PendingRecord> = Vec::with_capacity(config::RAW_BATCH_ROWS);
    let mut lines_processed: i64 = 0;
    let mut bytes_done: u64 = 0;
    let mut conflict_errors: i64 = 0;

    let member_map = {
        let mut conn = acquire(ingest).await?;
        devices::enabled_member_map(&mut conn).await?
    };

    let mut rx = spawn_reader(&path);
    let result = loop {
        let event = match tokio::time::timeout(config::IMPORT_CHUNK_DEADLINE, rx.recv()).await {
            Ok(Some(event)) => event,
            Ok(None) => ReaderEvent::Eof,
            Err(_) => {
                break Err(stage_error("stalled reading upload", "parse"));
            }
        };

        match event {
            ReaderEvent::Line { text, offset } => {
                bytes_done = offset;
                lines_processed += 1;
                if let Some(completed) = assembler.feed(&text) {
                    push_record(
                        completed,
                        ingest,
                        &member_map,
                        job_id,
                        &local_stats,
                        &mut collector,
                        &mut batch,
                    );
                }
                if batch.len() >= config::RAW_BATCH_ROWS {
                    if manager.cancel_requested(job_id).await {
                        break Err(ServiceError::Canceled);
                    }
                    flush_batch(
                        manager,
                        ingest,
                        job_id,
                        &mut batch,
                        &mut collector,
                        &mut conflict_errors,
                        lines_processed,
                        progress_of(bytes_done, bytes_total),
                    )
                    .await?;
                }
            }
            ReaderEvent::Error(message) => {
                break Err(stage_error(&message, "parse"));
            }
            ReaderEvent::Eof => {
                if let Some(completed) = assembler.flush() {
                    push_record(
                        completed,
                        ingest,
                        &member_map,
                        job_id,
                        &local_stats,
                        &mut collector,
                        &mut batch,
                    );
                }
                break Ok(());
            }
        }
    };
    result?;

    manager
        .update_row(job_id, |patch| {
            patch.phase = Some("storing".to_string());
        })
        .await?;
    flush_batch(
        manager,
        ingest,
        job_id,
        &mut batch,
        &mut collector,
        &mut conflict_errors,
        lines_processed,
        1.0,
    )
    .await?;

    // Completion: resolve the detected device and mark the firewall as an
    // import source spanning the observed time range.
    let device_detected = collector.primary_device(job.device_key.as_deref());
    {
        let mut conn = acquire(ingest).await?;
        devices::upsert_firewall_import(
            &mut conn,
            &device_detected,
            collector.time_min,
            collector.time_max,
        )
        .await?;
    }

    let parse_err_total = collector.parse_err + conflict_errors;
    let collector_snapshot = (
        collector.raw_logs,
        collector.events,
        collector.parse_ok,
        collector.filtered,
        collector.time_min,
        collector.time_max,
    );
    manager
        .update_row(job_id, |patch| {
            patch.status = Some(STATUS_DONE);
            patch.progress = Some(1.0);
            patch.lines_total = Some(lines_processed);
            patch.lines_processed = Some(lines_processed);
            patch.parse_ok = Some(collector_snapshot.2);
            patch.parse_err = Some(parse_err_total);
            patch.filtered_id = Some(collector_snapshot.3);
            patch.raw_logs_inserted = Some(collector_snapshot.0);
            patch.events_inserted = Some(collector_snapshot.1);
            patch.time_min = collector_snapshot.4;
            patch.time_max = collector_snapshot.5;
            patch.device_detected = Some(device_detected.clone());
            patch.device_key = Some(device_detected.clone());
            patch.mark_finished();
        })
        .await?;

    if let Err(err) = tokio::fs::remove_file(&path).await {
        warn!(%job_id, error = %err, "failed to remove upload file");
    }
    info!(%job_id, lines = lines_processed, "import complete");
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn flush_batch(
    manager: &JobManager,
    ingest: &IngestContext,
    job_id: uuid::Uuid,
    batch: &mut Vec<PendingRecord>,
    collector: &mut ImportCollector,
    conflict_errors: &mut i64,
    lines_processed: i64,
    progress: f64,
) -> Result<()> {
    if !batch.is_empty() {
        let mut conn = acquire(ingest).await?;
        let outcome = store::persist_batch(&mut conn, batch)
            .await
            .map_err(|err| match err {
                ServiceError::StorageUnavailable(detail) => {
                    stage_error(&format!("storage unavailable: {detail}"), "persist")
                }
                other => other,
            })?;
        collector.raw_logs += outcome.raw_logs_inserted as i64;
        collector.events += outcome.events_inserted as i64;
        *conflict_errors += outcome.flow_conflicts as i64;
        batch.clear();
    }

    let (raw_logs, events, parse_ok, parse_err, filtered) = (
        collector.raw_logs,
        collector.events,
        collector.parse_ok,
        collector.parse_err + *conflict_errors,
        collector.filtered,
    );
    let (time_min, time_max) = (collector.time_min, collector.time_max);
    manager
        .update_row(job_id, |patch| {
            patch.progress = Some(progress.clamp(0.0, 1.0));
            patch.lines_processed = Some(lines_processed);
            patch.raw_logs_inserted = Some(raw_logs);
            patch.events_inserted = Some(events);
            patch.parse_ok = Some(parse_ok);
            patch.parse_err = Some(parse_err);
            patch.filtered_id = Some(filtered);
            patch.time_min = time_min;
            patch.time_max = time_max;
        })
        .await?;
    Ok(())
}

fn push_record(
    record_text: String,
    ingest: &IngestContext,
    member_map: &HashMap<String, String>,
    job_id: uuid::Uuid,
    local_stats: &IngestStats,
    collector: &mut ImportCollector,
    batch: &mut Vec<PendingRecord>,
) {
    let record = pipeline::build_pending_record(
        record_text,
        ingest.config.year_mode,
        member_map,
        false,
        Some(job_id),
        local_stats,
    );
    collector.observe(&record);
    match record.parse_status.as_str() {
        "error" => collector.parse_err += 1,
        _ => match &record.payload {
            store::RecordPayload::None => collector.filtered += 1,
            _ => collector.parse_ok += 1,
        },
    }
    batch.push(record);
}

/// Stream the file line-by-line off the async worker; gzip is detected by
/// magic bytes and decoded transparently.
fn spawn_reader(path: &Path) -> mpsc::Receiver<ReaderEvent> {
    let (tx, rx) = mpsc::channel(READER_CHANNEL);
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || {
        let send = |event: ReaderEvent| tx.blocking_send(event).is_ok();

        let file = match std::fs::File::open(&path) {
            Ok(file) => file,
            Err(err) => {
                send(ReaderEvent::Error(format!("open failed: {err}")));
                return;
            }
        };

        let mut head = BufReader::new(file);
        let gzip = matches!(head.fill_buf(), Ok(buf) if buf.starts_with(&GZIP_MAGIC));

        let reader: Box<dyn Read + Send> = if gzip {
            Box::new(MultiGzDecoder::new(head))
        } else {
            Box::new(head)
        };

        let mut lines = BufReader::new(reader);
        let mut offset: u64 = 0;
        let mut buf = String::new();
        loop {
            buf.clear();
            match lines.read_line(&mut buf) {
                Ok(0) => {
                    send(ReaderEvent::Eof);
                    return;
                }
                Ok(n) => {
                    offset += n as u64;
                    let text = buf.trim_end_matches(['\r', '\n']).to_string();
                    if !send(ReaderEvent::Line { text, offset }) {
                        return;
                    }
                }
                Err(err) => {
                    send(ReaderEvent::Error(format!("read failed: {err}")));
                    return;
                }
            }
        }
    });
    rx
}

fn progress_of(bytes_done: u64, bytes_total: u64) -> f64 {
    if bytes_total == 0 {
        0.0
    } else {
        (bytes_done as f64 / bytes_total as f64).clamp(0.0, 1.0)
    }
}

async fn acquire(
    ingest: &IngestContext,
) -> Result<bb8::PooledConnection<'_, crate::db::PgConnectionManager>> {
    ingest
        .pool
        .get()
        .await
        .map_err(|err| ServiceError::StorageUnavailable(format!("{err:?}")))
}

fn stage_error(message: &str, stage: &str) -> ServiceError {
    ServiceError::Internal(anyhow::anyhow!("{stage}: {message}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn primary_device_prefers_user_hint() {
        let mut collector = ImportCollector::default();
        collector.device_counts.insert("fw1".into(), 10);
        assert_eq!(collector.primary_device(Some(" fw2 ")), "fw2");
        assert_eq!(collector.primary_device(None), "fw1");
        assert_eq!(collector.primary_device(Some("  ")), "fw1");
    }

    #[test]
    fn primary_device_takes_majority() {
        let mut collector = ImportCollector::default();
        collector.device_counts.insert("fw1".into(), 3);
        collector.device_counts.insert("fw2".into(), 7);
        assert_eq!(collector.primary_device(None), "fw2");
    }

    #[test]
    fn progress_is_bounded() {
        assert_eq!(progress_of(0, 0), 0.0);
        assert_eq!(progress_of(50, 100), 0.5);
        assert_eq!(progress_of(200, 100), 1.0);
    }

    #[tokio::test]
    async fn reader_streams_plain_and_gzip_files() {
        use std::io::Write;

        let dir = tempfile::tempdir().unwrap();
        let plain = dir.path().join("plain.log");
        std::fs::write(&plain, "line one\nline two\n").unwrap();
        let mut rx = spawn_reader(&plain);
        let mut lines = Vec::new();
        while let Some(event) = rx.recv().await {
            match event {
                ReaderEvent::Line { text, .. } => lines.push(text),
                ReaderEvent::Eof => break,
                ReaderEvent::Error(err) => panic!("reader error: {err}"),
            }
        }
        assert_eq!(lines, vec!["line one", "line two"]);

        let gz = dir.path().join("logs.gz");
        let mut encoder =
            flate2::write::GzEncoder::new(std::fs::File::create(&gz).unwrap(), Default::default());
        encoder.write_all(b"compressed line\n").unwrap();
        encoder.finish().unwrap();
        let mut rx = spawn_reader(&gz);
        let mut lines = Vec::new();
        while let Some(event) = rx.recv().await {
            match event {
                ReaderEvent::Line { text, .. } => lines.push(text),
                ReaderEvent::Eof => break,
                ReaderEvent::Error(err) => panic!("reader error: {err}"),
            }
        }
        assert_eq!(lines, vec!["compressed line"]);
    }
}
