//! Row types for the analyzer tables.

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::Serialize;
use uuid::Uuid;

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = crate::schema::raw_logs)]
pub struct NewRawLog {
    pub device_key: String,
    pub received_at: DateTime<Utc>,
    pub raw_line: String,
    pub parse_status: String,
    pub parse_error: Option<String>,
    pub job_id: Option<Uuid>,
}

#[derive(Debug, Clone, Queryable, Selectable, Serialize)]
#[diesel(table_name = crate::schema::events)]
pub struct EventRow {
    pub id: i64,
    pub raw_log_id: i64,
    pub device_key: String,
    pub ts: DateTime<Utc>,
    pub event_kind: String,
    pub proto: String,
    pub src_ip: String,
    pub src_port: i32,
    pub dst_ip: String,
    pub dst_port: i32,
    pub src_zone: Option<String>,
    pub src_if: Option<String>,
    pub dst_zone: Option<String>,
    pub dst_if: Option<String>,
    pub src_mac: Option<String>,
    pub dst_mac: Option<String>,
    pub xlat_src_ip: Option<String>,
    pub xlat_src_port: Option<i32>,
    pub xlat_dst_ip: Option<String>,
    pub xlat_dst_port: Option<i32>,
    pub rule: Option<String>,
    pub app_name: Option<String>,
    pub bytes_orig: i64,
    pub bytes_term: i64,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = crate::schema::events)]
pub struct NewEvent {
    pub raw_log_id: i64,
    pub device_key: String,
    pub ts: DateTime<Utc>,
    pub event_kind: String,
    pub proto: String,
    pub src_ip: String,
    pub src_port: i32,
    pub dst_ip: String,
    pub dst_port: i32,
    pub src_zone: Option<String>,
    pub src_if: Option<String>,
    pub dst_zone: Option<String>,
    pub dst_if: Option<String>,
    pub src_mac: Option<String>,
    pub dst_mac: Option<String>,
    pub xlat_src_ip: Option<String>,
    pub xlat_src_port: Option<i32>,
    pub xlat_dst_ip: Option<String>,
    pub xlat_dst_port: Option<i32>,
    pub rule: Option<String>,
    pub app_name: Option<String>,
    pub bytes_orig: i64,
    pub bytes_term: i64,
}

#[derive(Debug, Clone, Queryable, Selectable, Serialize)]
#[diesel(table_name = crate::schema::flows)]
pub struct FlowRow {
    pub id: i64,
    pub device_key: String,
    pub proto: String,
    pub src_ip: String,
    pub src_port: i32,
    pub dst_ip: String,
    pub dst_port: i32,
    pub open_ts: DateTime<Utc>,
    pub close_ts: Option<DateTime<Utc>>,
    pub bytes_orig: i64,
    pub bytes_term: i64,
    pub rule: Option<String>,
    pub app_name: Option<String>,
    pub src_zone: Option<String>,
    pub src_if: Option<String>,
    pub dst_zone: Option<String>,
    pub dst_if: Option<String>,
    pub src_mac: Option<String>,
    pub dst_mac: Option<String>,
    pub xlat_src_ip: Option<String>,
    pub xlat_src_port: Option<i32>,
    pub xlat_dst_ip: Option<String>,
    pub xlat_dst_port: Option<i32>,
    pub last_seen: DateTime<Utc>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = crate::schema::flows)]
pub struct NewFlow {
    pub device_key: String,
    pub proto: String,
    pub src_ip: String,
    pub src_port: i32,
    pub dst_ip: String,
    pub dst_port: i32,
    pub open_ts: DateTime<Utc>,
    pub close_ts: Option<DateTime<Utc>>,
    pub bytes_orig: i64,
    pub bytes_term: i64,
    pub rule: Option<String>,
    pub app_name: Option<String>,
    pub src_zone: Option<String>,
    pub src_if: Option<String>,
    pub dst_zone: Option<String>,
    pub dst_if: Option<String>,
    pub src_mac: Option<String>,
    pub dst_mac: Option<String>,
    pub xlat_src_ip: Option<String>,
    pub xlat_src_port: Option<i32>,
    pub xlat_dst_ip: Option<String>,
    pub xlat_dst_port: Option<i32>,
    pub last_seen: DateTime<Utc>,
}

#[derive(Debug, Clone, Queryable, Selectable, Serialize)]
#[diesel(table_name = crate::schema::endpoints)]
pub struct EndpointRow {
    pub id: i64,
    pub device_key: String,
    /// Empty string for IP-only observations.
    pub mac: String,
    pub ip: String,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub seen_count: i64,
    pub auto_vendor: Option<String>,
    pub auto_type: Option<String>,
    pub auto_os: Option<String>,
    pub auto_brand: Option<String>,
    pub auto_model: Option<String>,
    pub auto_hostname: Option<String>,
}

impl EndpointRow {
    pub fn mac_opt(&self) -> Option<&str> {
        if self.mac.is_empty() {
            None
        } else {
            Some(&self.mac)
        }
    }

    pub fn label(&self) -> String {
        self.auto_hostname
            .clone()
            .unwrap_or_else(|| self.ip.clone())
    }
}

#[derive(Debug, Clone, Queryable, Selectable, Serialize)]
#[diesel(table_name = crate::schema::endpoint_overrides)]
pub struct EndpointOverrideRow {
    pub id: i64,
    pub device_key: String,
    pub mac: String,
    pub vendor: Option<String>,
    pub type_name: Option<String>,
    pub os_name: Option<String>,
    pub brand: Option<String>,
    pub model: Option<String>,
    pub hostname: Option<String>,
    pub comment: Option<String>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Queryable, Selectable, Serialize)]
#[diesel(table_name = crate::schema::firewalls)]
pub struct FirewallRow {
    pub device_key: String,
    pub source_syslog: bool,
    pub source_import: bool,
    pub first_seen: Option<DateTime<Utc>>,
    pub last_seen: Option<DateTime<Utc>>,
    pub last_import_ts: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Queryable, Selectable, Serialize)]
#[diesel(table_name = crate::schema::firewall_overrides)]
pub struct FirewallOverrideRow {
    pub device_key: String,
    pub display_name: String,
    pub comment: Option<String>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Queryable, Selectable, Serialize)]
#[diesel(table_name = crate::schema::ha_clusters)]
pub struct HaClusterRow {
    pub base: String,
    pub label: String,
    pub members: serde_json::Value,
    pub is_enabled: bool,
}

impl HaClusterRow {
    pub fn member_list(&self) -> Vec<String> {
        self.members
            .as_array()
            .map(|items| {
                items
                    .iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Queryable, Selectable, Serialize)]
#[diesel(table_name = crate::schema::router_mac_rules)]
pub struct RouterMacRuleRow {
    pub id: i64,
    pub device_key: String,
    pub mac: String,
    pub direction: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Queryable, Selectable, Serialize)]
#[diesel(table_name = crate::schema::ingest_jobs)]
pub struct IngestJobRow {
    pub id: Uuid,
    pub kind: String,
    pub status: String,
    pub phase: Option<String>,
    pub progress: f64,
    pub cancel_requested: bool,
    pub device_key: Option<String>,
    pub filename: Option<String>,
    pub bytes_total: i64,
    pub lines_total: i64,
    pub lines_processed: i64,
    pub parse_ok: i64,
    pub parse_err: i64,
    pub filtered_id: i64,
    pub raw_logs_inserted: i64,
    pub events_inserted: i64,
    pub time_min: Option<DateTime<Utc>>,
    pub time_max: Option<DateTime<Utc>>,
    pub device_detected: Option<String>,
    pub error_type: Option<String>,
    pub error_message: Option<String>,
    pub error_stage: Option<String>,
    pub result_counts: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}
