//! Process-wide ingest counters surfaced by `GET /api/stats`.

use serde::Serialize;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct IngestStats {
    pub udp_packets: AtomicU64,
    pub udp_bytes: AtomicU64,
    pub udp_drops: AtomicU64,
    pub lines_received: AtomicU64,
    pub oversize_lines: AtomicU64,
    pub records_processed: AtomicU64,
    pub parse_ok: AtomicU64,
    pub parse_err: AtomicU64,
    pub filtered_id: AtomicU64,
    pub raw_logs_saved: AtomicU64,
    pub events_saved: AtomicU64,
    pub batch_errors: AtomicU64,
    last_updated_ms: AtomicI64,
}

#[derive(Debug, Serialize)]
pub struct StatsSnapshot {
    pub udp_packets: u64,
    pub udp_bytes: u64,
    pub udp_drops: u64,
    pub lines: u64,
    pub oversize_lines: u64,
    pub records_total: u64,
    pub records_ok: u64,
    pub parse_err: u64,
    pub filtered_id: u64,
    pub db_raw_logs: u64,
    pub db_events: u64,
    pub batch_errors: u64,
    pub last_updated: Option<chrono::DateTime<chrono::Utc>>,
}

impl IngestStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn touch(&self) {
        self.last_updated_ms
            .store(chrono::Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    pub fn reset(&self) {
        for counter in [
            &self.udp_packets,
            &self.udp_bytes,
            &self.udp_drops,
            &self.lines_received,
            &self.oversize_lines,
            &self.records_processed,
            &self.parse_ok,
            &self.parse_err,
            &self.filtered_id,
            &self.raw_logs_saved,
            &self.events_saved,
            &self.batch_errors,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
        self.last_updated_ms.store(0, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let last_ms = self.last_updated_ms.load(Ordering::Relaxed);
        StatsSnapshot {
            udp_packets: self.udp_packets.load(Ordering::Relaxed),
            udp_bytes: self.udp_bytes.load(Ordering::Relaxed),
            udp_drops: self.udp_drops.load(Ordering::Relaxed),
            lines: self.lines_received.load(Ordering::Relaxed),
            oversize_lines: self.oversize_lines.load(Ordering::Relaxed),
            records_total: self.records_processed.load(Ordering::Relaxed),
            records_ok: self.parse_ok.load(Ordering::Relaxed),
            parse_err: self.parse_err.load(Ordering::Relaxed),
            filtered_id: self.filtered_id.load(Ordering::Relaxed),
            db_raw_logs: self.raw_logs_saved.load(Ordering::Relaxed),
            db_events: self.events_saved.load(Ordering::Relaxed),
            batch_errors: self.batch_errors.load(Ordering::Relaxed),
            last_updated: (last_ms > 0)
                .then(|| chrono::DateTime::from_timestamp_millis(last_ms))
                .flatten(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_counters() {
        let stats = IngestStats::new();
        IngestStats::bump(&stats.udp_packets);
        IngestStats::add(&stats.udp_bytes, 512);
        stats.touch();
        let snap = stats.snapshot();
        assert_eq!(snap.udp_packets, 1);
        assert_eq!(snap.udp_bytes, 512);
        assert!(snap.last_updated.is_some());
    }

    #[test]
    fn reset_zeroes_everything() {
        let stats = IngestStats::new();
        IngestStats::bump(&stats.parse_err);
        stats.touch();
        stats.reset();
        let snap = stats.snapshot();
        assert_eq!(snap.parse_err, 0);
        assert!(snap.last_updated.is_none());
    }
}
