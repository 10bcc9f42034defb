//! Raw-event drill-down behind the graph: the events (with raw lines) for
//! one (source, destination, service) selection.

use super::View;
use crate::devices;
use crate::error::{Result, ServiceError};
use crate::net;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel_async::{AsyncPgConnection, RunQueryDsl};
use serde::Serialize;

pub const MAX_PAGE_SIZE: i64 = 100;

#[derive(Debug, Clone)]
pub struct InspectQuery {
    pub device_key: String,
    pub time_from: DateTime<Utc>,
    pub time_to: DateTime<Utc>,
    pub view: View,
    pub proto: String,
    pub dst_port: i32,
    pub app_name: Option<String>,
    pub src_ip: String,
    pub dest_ip: String,
    pub limit: i64,
    pub offset: i64,
}

#[derive(Debug, Serialize)]
pub struct InspectRow {
    pub ts: DateTime<Utc>,
    pub device_key: String,
    pub event_kind: String,
    pub proto: String,
    pub src_ip: String,
    pub src_port: i32,
    pub dest_ip: String,
    pub dest_port: i32,
    pub src_zone: Option<String>,
    pub src_if: Option<String>,
    pub dest_zone: Option<String>,
    pub dest_if: Option<String>,
    pub rule: Option<String>,
    pub app_name: Option<String>,
    pub bytes_orig: i64,
    pub bytes_term: i64,
    pub raw_line: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct InspectResponse {
    pub rows: Vec<InspectRow>,
    pub total: i64,
}

pub async fn inspect_logs(
    conn: &mut AsyncPgConnection,
    query: &InspectQuery,
) -> Result<InspectResponse> {
    if !net::is_valid_ip(&query.src_ip) {
        return Err(ServiceError::Validation(
            "src_ip must be a valid IP address".into(),
        ));
    }
    if !net::is_valid_ip(&query.dest_ip) {
        return Err(ServiceError::Validation(
            "dest_ip must be a valid IP address".into(),
        ));
    }

    let members = devices::expand_device_key(conn, &query.device_key).await?;
    if query.time_from >= query.time_to {
        return Ok(InspectResponse {
            rows: Vec::new(),
            total: 0,
        });
    }

    use crate::schema::events::dsl as ev;
    use crate::schema::raw_logs;

    let proto = query.proto.trim().to_uppercase();
    let limit = query.limit.clamp(1, MAX_PAGE_SIZE);
    let offset = query.offset.max(0);
    let app_name = query
        .app_name
        .as_deref()
        .map(str::trim)
        .filter(|a| !a.is_empty())
        .map(str::to_string);

    // Count and page share the same filter set but different shapes, so the
    // filters are applied to both boxed queries.
    let mut count_q = ev::events.count().into_boxed();
    let mut rows_q = ev::events
        .inner_join(raw_logs::table)
        .select((
            crate::models::EventRow::as_select(),
            raw_logs::raw_line.nullable(),
        ))
        .into_boxed();

    macro_rules! apply {
        ($filter:expr) => {{
            let f = $filter;
            count_q = count_q.filter(f.clone());
            rows_q = rows_q.filter(f);
        }};
    }

    apply!(ev::device_key.eq_any(members.clone()));
    apply!(ev::ts.ge(query.time_from));
    apply!(ev::ts.lt(query.time_to));
    apply!(ev::proto.eq(proto.clone()));
    match query.view {
        View::Original => {
            apply!(ev::src_ip.eq(query.src_ip.clone()));
            apply!(ev::dst_ip.eq(query.dest_ip.clone()));
            apply!(ev::dst_port.eq(query.dst_port));
        }
        View::Translated => {
            apply!(ev::xlat_src_ip
                .eq(query.src_ip.clone())
                .or(ev::src_ip.eq(query.src_ip.clone())));
            apply!(ev::xlat_dst_ip
                .eq(query.dest_ip.clone())
                .or(ev::dst_ip.eq(query.dest_ip.clone())));
            apply!(ev::xlat_dst_port
                .eq(query.dst_port)
                .or(ev::dst_port.eq(query.dst_port)));
        }
    }
    if let Some(app) = app_name {
        apply!(ev::app_name.eq(app));
    }

    let total: i64 = count_q.get_result(conn).await?;
    let rows: Vec<(crate::models::EventRow, Option<String>)> = rows_q
        .order(ev::ts.desc())
        .offset(offset)
        .limit(limit)
        .load(conn)
        .await?;

    let rows = rows
        .into_iter()
        .map(|(event, raw_line)| InspectRow {
            ts: event.ts,
            device_key: event.device_key,
            event_kind: event.event_kind,
            proto: event.proto,
            src_ip: event.src_ip,
            src_port: event.src_port,
            dest_ip: event.dst_ip,
            dest_port: event.dst_port,
            src_zone: event.src_zone,
            src_if: event.src_if,
            dest_zone: event.dst_zone,
            dest_if: event.dst_if,
            rule: event.rule,
            app_name: event.app_name,
            bytes_orig: event.bytes_orig,
            bytes_term: event.bytes_term,
            raw_line,
        })
        .collect();

    Ok(InspectResponse { rows, total })
}
