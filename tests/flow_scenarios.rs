//! End-to-end reconstruction scenarios: syslog lines through the parser and
//! the flow-upsert planner, applied to an in-memory flow table.

use chrono::{DateTime, Duration, TimeZone, Utc};
use netwall_analyzer::cli::YearMode;
use netwall_analyzer::ingest::reconstruct::{new_flow_from_record, plan_flow_upsert, FlowUpsert};
use netwall_analyzer::models::{FlowRow, NewFlow};
use netwall_analyzer::parse::{parse_line, ConnRecord, RecordKind};

fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 2, 15, 0, 0, 0).unwrap()
}

/// Minimal stand-in for the flows table: applies planner decisions the way
/// the store does, without a database.
#[derive(Default)]
struct FlowTable {
    rows: Vec<FlowRow>,
    next_id: i64,
}

impl FlowTable {
    fn apply(&mut self, device_key: &str, ts: DateTime<Utc>, record: &ConnRecord) {
        let exact = self.rows.iter().find(|f| {
            f.device_key == device_key
                && f.proto == record.proto
                && f.src_ip == record.src_ip
                && f.src_port == record.src_port
                && f.dst_ip == record.dst_ip
                && f.dst_port == record.dst_port
                && f.open_ts == ts
        });
        let latest_open = self
            .rows
            .iter()
            .filter(|f| {
                f.device_key == device_key
                    && f.proto == record.proto
                    && f.src_ip == record.src_ip
                    && f.src_port == record.src_port
                    && f.dst_ip == record.dst_ip
                    && f.dst_port == record.dst_port
                    && f.close_ts.is_none()
                    && f.open_ts <= ts
            })
            .max_by_key(|f| f.open_ts);

        match plan_flow_upsert(exact, latest_open, record.action, ts, record) {
            FlowUpsert::SuppressDuplicate => {}
            FlowUpsert::InsertOpen { close_prior } => {
                if let Some((flow_id, close_ts)) = close_prior {
                    let prior = self.rows.iter_mut().find(|f| f.id == flow_id).unwrap();
                    prior.close_ts = Some(close_ts);
                    prior.last_seen = close_ts;
                }
                self.insert(new_flow_from_record(device_key, record, ts, None));
            }
            FlowUpsert::CloseExisting(update) => {
                let flow = self.rows.iter_mut().find(|f| f.id == update.flow_id).unwrap();
                flow.close_ts = Some(update.close_ts);
                flow.bytes_orig = update.bytes_orig;
                flow.bytes_term = update.bytes_term;
                flow.rule = update.rule;
                flow.app_name = update.app_name;
                flow.dst_mac = update.dst_mac;
                flow.last_seen = update.close_ts;
            }
            FlowUpsert::InsertClosed => {
                self.insert(new_flow_from_record(device_key, record, ts, Some(ts)));
            }
        }
    }

    fn insert(&mut self, new: NewFlow) {
        self.next_id += 1;
        self.rows.push(FlowRow {
            id: self.next_id,
            device_key: new.device_key,
            proto: new.proto,
            src_ip: new.src_ip,
            src_port: new.src_port,
            dst_ip: new.dst_ip,
            dst_port: new.dst_port,
            open_ts: new.open_ts,
            close_ts: new.close_ts,
            bytes_orig: new.bytes_orig,
            bytes_term: new.bytes_term,
            rule: new.rule,
            app_name: new.app_name,
            src_zone: new.src_zone,
            src_if: new.src_if,
            dst_zone: new.dst_zone,
            dst_if: new.dst_if,
            src_mac: new.src_mac,
            dst_mac: new.dst_mac,
            xlat_src_ip: new.xlat_src_ip,
            xlat_src_port: new.xlat_src_port,
            xlat_dst_ip: new.xlat_dst_ip,
            xlat_dst_port: new.xlat_dst_port,
            last_seen: new.last_seen,
        });
    }

    fn feed(&mut self, line: &str) {
        let parsed = parse_line(line, YearMode::Auto, now()).expect("line should parse");
        let RecordKind::Conn(record) = parsed.kind else {
            panic!("expected CONN record");
        };
        let device = parsed.device_hint.to_lowercase();
        self.apply(&device, parsed.received_at, &record);
    }
}

fn conn_line(ts: &str, conn: &str, extra: &str) -> String {
    format!(
        "<1>1 {ts} fw1 EFW - - - CONN: id=00600001 conn={conn} connipproto=TCP \
         connrecvif=lan connrecvzone=trusted connsrcip=10.0.0.5 connsrcport=54321 \
         conndestif=wan conndestzone=untrusted conndestip=8.8.8.8 conndestport=443 {extra}"
    )
}

#[test]
fn simple_flow_open_then_close() {
    let mut table = FlowTable::default();
    table.feed(&conn_line("2026-02-10T12:00:00Z", "open", ""));
    table.feed(&conn_line(
        "2026-02-10T12:00:05Z",
        "close",
        "origsent=1000 termsent=2000 app_name=https",
    ));

    assert_eq!(table.rows.len(), 1);
    let flow = &table.rows[0];
    assert_eq!(flow.bytes_orig, 1000);
    assert_eq!(flow.bytes_term, 2000);
    assert_eq!(
        flow.close_ts,
        Some(Utc.with_ymd_and_hms(2026, 2, 10, 12, 0, 5).unwrap())
    );
    assert_eq!(flow.app_name.as_deref(), Some("https"));
}

#[test]
fn reopen_without_close_synthesises_prior_close() {
    let mut table = FlowTable::default();
    table.feed(&conn_line("2026-02-10T12:00:00Z", "open", ""));
    table.feed(&conn_line("2026-02-10T12:00:10Z", "open", ""));

    assert_eq!(table.rows.len(), 2);
    let first = &table.rows[0];
    let second = &table.rows[1];
    assert_eq!(
        first.close_ts,
        Some(Utc.with_ymd_and_hms(2026, 2, 10, 12, 0, 10).unwrap() - Duration::milliseconds(1))
    );
    assert_eq!((first.bytes_orig, first.bytes_term), (0, 0));
    assert!(second.close_ts.is_none());
}

#[test]
fn replaying_the_same_line_is_idempotent() {
    let mut table = FlowTable::default();
    let open = conn_line("2026-02-10T12:00:00Z", "open", "");
    let close = conn_line(
        "2026-02-10T12:00:05Z",
        "close",
        "origsent=1000 termsent=2000",
    );
    table.feed(&open);
    table.feed(&open);
    table.feed(&open);
    table.feed(&close);
    table.feed(&close);

    assert_eq!(table.rows.len(), 1);
    let flow = &table.rows[0];
    assert_eq!(flow.bytes_orig, 1000);
    assert_eq!(flow.bytes_term, 2000);
}

#[test]
fn blocked_creates_a_zero_byte_closed_flow() {
    let mut table = FlowTable::default();
    table.feed(&conn_line(
        "2026-02-10T12:00:00Z",
        "blocked",
        "origsent=555 termsent=777",
    ));

    assert_eq!(table.rows.len(), 1);
    let flow = &table.rows[0];
    assert_eq!(flow.open_ts, flow.close_ts.unwrap());
    assert_eq!((flow.bytes_orig, flow.bytes_term), (0, 0));
}

#[test]
fn close_without_open_synthesises_flow_at_close_time() {
    let mut table = FlowTable::default();
    table.feed(&conn_line(
        "2026-02-10T12:00:05Z",
        "close",
        "origsent=10 termsent=20",
    ));

    assert_eq!(table.rows.len(), 1);
    let flow = &table.rows[0];
    assert_eq!(flow.open_ts, flow.close_ts.unwrap());
    assert_eq!(flow.bytes_orig, 10);
}

#[test]
fn every_flow_satisfies_close_after_open() {
    let mut table = FlowTable::default();
    // A messy interleaving: opens, re-opens, closes, blocked, replays.
    for line in [
        conn_line("2026-02-10T12:00:00Z", "open", ""),
        conn_line("2026-02-10T12:00:02Z", "close", "origsent=1 termsent=2"),
        conn_line("2026-02-10T12:00:03Z", "open", ""),
        conn_line("2026-02-10T12:00:07Z", "open", ""),
        conn_line("2026-02-10T12:00:07Z", "open", ""),
        conn_line("2026-02-10T12:00:09Z", "blocked", ""),
        conn_line("2026-02-10T12:00:11Z", "close", "origsent=5 termsent=6"),
    ] {
        table.feed(&line);
    }

    for flow in &table.rows {
        if let Some(close_ts) = flow.close_ts {
            assert!(
                close_ts >= flow.open_ts,
                "flow {} closed before it opened",
                flow.id
            );
        }
        assert!(flow.bytes_orig >= 0 && flow.bytes_term >= 0);
    }
}
