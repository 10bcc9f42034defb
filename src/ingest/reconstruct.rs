//! Flow reconstruction: fold CONN open/close events into long-lived flow rows.

use crate::error::{Result, ServiceError};
use crate::models::{FlowRow, NewFlow};
use crate::parse::{ConnAction, ConnRecord};
use chrono::{DateTime, Duration, Utc};
use diesel::prelude::*;
use diesel_async::{AsyncPgConnection, RunQueryDsl};
use tracing::warn;

const UPSERT_ATTEMPTS: usize = 3;

/// What a CONN record did to the flow table; feeds ingest counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowOutcome {
    Opened,
    Reopened,
    DuplicateOpen,
    Closed,
    SynthesisedClose,
}

/// Close applied to an existing still-open flow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseUpdate {
    pub flow_id: i64,
    pub close_ts: DateTime<Utc>,
    pub bytes_orig: i64,
    pub bytes_term: i64,
    pub rule: Option<String>,
    pub app_name: Option<String>,
    pub dst_mac: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlowUpsert {
    /// Open whose exact key already exists.
    SuppressDuplicate,
    /// Fresh open; `close_prior` ends a lingering still-open flow first.
    InsertOpen {
        close_prior: Option<(i64, DateTime<Utc>)>,
    },
    /// Close matched a still-open flow.
    CloseExisting(CloseUpdate),
    /// Close with no matching open; the flow is synthesised closed.
    InsertClosed,
}

/// Decide how a CONN record lands in the flow table.
///
/// `exact` is the flow with the identical key including `open_ts` (open path
/// only); `latest_open` is the newest still-open flow on the same
/// (device, proto, 5-tuple) with `open_ts <= ts`.
pub fn plan_flow_upsert(
    exact: Option<&FlowRow>,
    latest_open: Option<&FlowRow>,
    action: ConnAction,
    ts: DateTime<Utc>,
    record: &ConnRecord,
) -> FlowUpsert {
    if action.is_close_like() {
        return match latest_open {
            Some(open) => FlowUpsert::CloseExisting(CloseUpdate {
                flow_id: open.id,
                close_ts: ts,
                bytes_orig: open.bytes_orig.max(record.bytes_orig),
                bytes_term: open.bytes_term.max(record.bytes_term),
                rule: record.rule.clone().or_else(|| open.rule.clone()),
                app_name: record.app_name.clone().or_else(|| open.app_name.clone()),
                dst_mac: record.dst_mac.clone().or_else(|| open.dst_mac.clone()),
            }),
            None => FlowUpsert::InsertClosed,
        };
    }

    if exact.is_some() {
        return FlowUpsert::SuppressDuplicate;
    }

    // A still-open flow on the same tuple means the close was lost; end it
    // one millisecond before the new open with no additional bytes.
    let close_prior = latest_open
        .filter(|open| open.open_ts < ts)
        .map(|open| (open.id, ts - Duration::milliseconds(1)));

    FlowUpsert::InsertOpen { close_prior }
}

pub fn new_flow_from_record(
    device_key: &str,
    record: &ConnRecord,
    open_ts: DateTime<Utc>,
    close_ts: Option<DateTime<Utc>>,
) -> NewFlow {
    NewFlow {
        device_key: device_key.to_string(),
        proto: record.proto.clone(),
        src_ip: record.src_ip.clone(),
        src_port: record.src_port,
        dst_ip: record.dst_ip.clone(),
        dst_port: record.dst_port,
        open_ts,
        close_ts,
        bytes_orig: record.bytes_orig,
        bytes_term: record.bytes_term,
        rule: record.rule.clone(),
        app_name: record.app_name.clone(),
        src_zone: record.src_zone.clone(),
        src_if: record.src_if.clone(),
        dst_zone: record.dst_zone.clone(),
        dst_if: record.dst_if.clone(),
        src_mac: record.src_mac.clone(),
        dst_mac: record.dst_mac.clone(),
        xlat_src_ip: record.xlat_src_ip.clone(),
        xlat_src_port: record.xlat_src_port,
        xlat_dst_ip: record.xlat_dst_ip.clone(),
        xlat_dst_port: record.xlat_dst_port,
        last_seen: close_ts.unwrap_or(open_ts),
    }
}

/// Apply a CONN record to the flow table. Conflicts on the flow identity are
/// recovered by re-reading and re-planning; after three attempts the record
/// counts as a parse error upstream.
pub async fn upsert_flow(
    conn: &mut AsyncPgConnection,
    device_key: &str,
    ts: DateTime<Utc>,
    record: &ConnRecord,
) -> Result<FlowOutcome> {
    for attempt in 0..UPSERT_ATTEMPTS {
        match try_upsert(conn, device_key, ts, record).await {
            Ok(outcome) => return Ok(outcome),
            Err(ServiceError::Conflict) => {
                warn!(
                    device_key,
                    attempt = attempt + 1,
                    "flow upsert conflict, re-reading"
                );
            }
            Err(err) => return Err(err),
        }
    }
    Err(ServiceError::Conflict)
}

async fn try_upsert(
    conn: &mut AsyncPgConnection,
    device_key: &str,
    ts: DateTime<Utc>,
    record: &ConnRecord,
) -> Result<FlowOutcome> {
    use crate::schema::flows::dsl as fl;

    let exact: Option<FlowRow> = if record.action.is_close_like() {
        None
    } else {
        fl::flows
            .filter(fl::device_key.eq(device_key))
            .filter(fl::proto.eq(&record.proto))
            .filter(fl::src_ip.eq(&record.src_ip))
            .filter(fl::src_port.eq(record.src_port))
            .filter(fl::dst_ip.eq(&record.dst_ip))
            .filter(fl::dst_port.eq(record.dst_port))
            .filter(fl::open_ts.eq(ts))
            .select(FlowRow::as_select())
            .first(conn)
            .await
            .optional()?
    };

    let latest_open: Option<FlowRow> = fl::flows
        .filter(fl::device_key.eq(device_key))
        .filter(fl::proto.eq(&record.proto))
        .filter(fl::src_ip.eq(&record.src_ip))
        .filter(fl::src_port.eq(record.src_port))
        .filter(fl::dst_ip.eq(&record.dst_ip))
        .filter(fl::dst_port.eq(record.dst_port))
        .filter(fl::close_ts.is_null())
        .filter(fl::open_ts.le(ts))
        .order(fl::open_ts.desc())
        .select(FlowRow::as_select())
        .first(conn)
        .await
        .optional()?;

    let plan = plan_flow_upsert(exact.as_ref(), latest_open.as_ref(), record.action, ts, record);

    match plan {
        FlowUpsert::SuppressDuplicate => Ok(FlowOutcome::DuplicateOpen),
        FlowUpsert::InsertOpen { close_prior } => {
            let reopened = close_prior.is_some();
            if let Some((flow_id, close_ts)) = close_prior {
                diesel::update(fl::flows.filter(fl::id.eq(flow_id)))
                    .set((fl::close_ts.eq(close_ts), fl::last_seen.eq(close_ts)))
                    .execute(conn)
                    .await?;
            }
            // DO NOTHING keeps a concurrent-writer conflict from aborting
            // the enclosing transaction; zero rows means re-read and
            // re-apply.
            let inserted = diesel::insert_into(fl::flows)
                .values(new_flow_from_record(device_key, record, ts, None))
                .on_conflict_do_nothing()
                .execute(conn)
                .await?;
            if inserted == 0 {
                return Err(ServiceError::Conflict);
            }
            Ok(if reopened {
                FlowOutcome::Reopened
            } else {
                FlowOutcome::Opened
            })
        }
        FlowUpsert::CloseExisting(update) => {
            diesel::update(fl::flows.filter(fl::id.eq(update.flow_id)))
                .set((
                    fl::close_ts.eq(update.close_ts),
                    fl::bytes_orig.eq(update.bytes_orig),
                    fl::bytes_term.eq(update.bytes_term),
                    fl::rule.eq(update.rule),
                    fl::app_name.eq(update.app_name),
                    fl::dst_mac.eq(update.dst_mac),
                    fl::last_seen.eq(update.close_ts),
                ))
                .execute(conn)
                .await?;
            Ok(FlowOutcome::Closed)
        }
        FlowUpsert::InsertClosed => {
            let inserted = diesel::insert_into(fl::flows)
                .values(new_flow_from_record(device_key, record, ts, Some(ts)))
                .on_conflict_do_nothing()
                .execute(conn)
                .await?;
            if inserted == 0 {
                return Err(ServiceError::Conflict);
            }
            Ok(FlowOutcome::SynthesisedClose)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap() + Duration::seconds(s as i64)
    }

    fn record(action: ConnAction, bytes_orig: i64, bytes_term: i64) -> ConnRecord {
        ConnRecord {
            action,
            proto: "TCP".into(),
            src_ip: "10.0.0.5".into(),
            src_port: 54321,
            dst_ip: "8.8.8.8".into(),
            dst_port: 443,
            src_zone: Some("trusted".into()),
            src_if: Some("lan".into()),
            dst_zone: Some("untrusted".into()),
            dst_if: Some("wan".into()),
            src_mac: Some("AA-BB-CC-DD-EE-01".into()),
            dst_mac: None,
            xlat_src_ip: None,
            xlat_src_port: None,
            xlat_dst_ip: None,
            xlat_dst_port: None,
            rule: Some("AllowOut".into()),
            app_name: None,
            bytes_orig,
            bytes_term,
        }
    }

    fn open_flow(id: i64, open_ts: DateTime<Utc>) -> FlowRow {
        FlowRow {
            id,
            device_key: "fw1".into(),
            proto: "TCP".into(),
            src_ip: "10.0.0.5".into(),
            src_port: 54321,
            dst_ip: "8.8.8.8".into(),
            dst_port: 443,
            open_ts,
            close_ts: None,
            bytes_orig: 0,
            bytes_term: 0,
            rule: Some("AllowOut".into()),
            app_name: None,
            src_zone: Some("trusted".into()),
            src_if: Some("lan".into()),
            dst_zone: Some("untrusted".into()),
            dst_if: Some("wan".into()),
            src_mac: Some("AA-BB-CC-DD-EE-01".into()),
            dst_mac: None,
            xlat_src_ip: None,
            xlat_src_port: None,
            xlat_dst_ip: None,
            xlat_dst_port: None,
            last_seen: open_ts,
        }
    }

    #[test]
    fn fresh_open_inserts_without_synthetic_close() {
        let rec = record(ConnAction::Open, 0, 0);
        let plan = plan_flow_upsert(None, None, ConnAction::Open, ts(0), &rec);
        assert_eq!(plan, FlowUpsert::InsertOpen { close_prior: None });
    }

    #[test]
    fn replayed_open_is_suppressed() {
        let rec = record(ConnAction::Open, 0, 0);
        let existing = open_flow(7, ts(0));
        let plan = plan_flow_upsert(Some(&existing), Some(&existing), ConnAction::Open, ts(0), &rec);
        assert_eq!(plan, FlowUpsert::SuppressDuplicate);
    }

    #[test]
    fn reopen_closes_prior_one_millisecond_early() {
        let rec = record(ConnAction::Open, 0, 0);
        let prior = open_flow(7, ts(0));
        let plan = plan_flow_upsert(None, Some(&prior), ConnAction::Open, ts(10), &rec);
        let FlowUpsert::InsertOpen { close_prior } = plan else {
            panic!("expected insert");
        };
        let (flow_id, close_ts) = close_prior.expect("prior flow must be closed");
        assert_eq!(flow_id, 7);
        assert_eq!(close_ts, ts(10) - Duration::milliseconds(1));
    }

    #[test]
    fn out_of_order_open_does_not_close_newer_flow() {
        // latest_open query already excludes flows opened after ts, but a
        // concurrent row with the same instant must not be closed at ts-1ms.
        let rec = record(ConnAction::Open, 0, 0);
        let prior = open_flow(7, ts(10));
        let plan = plan_flow_upsert(None, Some(&prior), ConnAction::Open, ts(10), &rec);
        assert_eq!(plan, FlowUpsert::InsertOpen { close_prior: None });
    }

    #[test]
    fn close_updates_matching_open() {
        let rec = record(ConnAction::Close, 1000, 2000);
        let prior = open_flow(3, ts(0));
        let plan = plan_flow_upsert(None, Some(&prior), ConnAction::Close, ts(5), &rec);
        let FlowUpsert::CloseExisting(update) = plan else {
            panic!("expected close");
        };
        assert_eq!(update.flow_id, 3);
        assert_eq!(update.close_ts, ts(5));
        assert_eq!(update.bytes_orig, 1000);
        assert_eq!(update.bytes_term, 2000);
    }

    #[test]
    fn close_without_open_synthesises_flow() {
        let rec = record(ConnAction::Close, 10, 20);
        let plan = plan_flow_upsert(None, None, ConnAction::Close, ts(5), &rec);
        assert_eq!(plan, FlowUpsert::InsertClosed);
        let flow = new_flow_from_record("fw1", &rec, ts(5), Some(ts(5)));
        assert_eq!(flow.open_ts, flow.close_ts.unwrap());
        assert_eq!(flow.bytes_orig, 10);
    }

    #[test]
    fn blocked_record_is_a_zero_byte_close() {
        let rec = record(ConnAction::Blocked, 0, 0);
        let plan = plan_flow_upsert(None, None, ConnAction::Blocked, ts(1), &rec);
        assert_eq!(plan, FlowUpsert::InsertClosed);
    }

    #[test]
    fn byte_counters_never_decrease() {
        let rec = record(ConnAction::Close, 50, 60);
        let mut prior = open_flow(3, ts(0));
        prior.bytes_orig = 500;
        prior.bytes_term = 10;
        let plan = plan_flow_upsert(None, Some(&prior), ConnAction::Close, ts(5), &rec);
        let FlowUpsert::CloseExisting(update) = plan else {
            panic!("expected close");
        };
        assert_eq!(update.bytes_orig, 500);
        assert_eq!(update.bytes_term, 60);
    }
}
