//! Device-identity resolution: endpoint inventory upserts from DEVICE
//! records and CONN sightings.

use crate::error::Result;
use crate::parse::{ConnRecord, DeviceRecord};
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel_async::{AsyncPgConnection, RunQueryDsl};
use std::collections::HashMap;

/// Sightings aggregated within one ingest batch, so each (mac, ip) pair
/// costs a single upsert.
#[derive(Debug, Default)]
pub struct SightingBatch {
    by_key: HashMap<(String, String, String), Sighting>,
}

#[derive(Debug)]
struct Sighting {
    count: i64,
    first_ts: DateTime<Utc>,
    last_ts: DateTime<Utc>,
}

impl SightingBatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record both endpoints of a CONN event. MAC-less sides are tracked as
    /// IP-only observations.
    pub fn record_conn(&mut self, device_key: &str, record: &ConnRecord, ts: DateTime<Utc>) {
        self.push(device_key, record.src_mac.as_deref(), &record.src_ip, ts);
        self.push(device_key, record.dst_mac.as_deref(), &record.dst_ip, ts);
    }

    fn push(&mut self, device_key: &str, mac: Option<&str>, ip: &str, ts: DateTime<Utc>) {
        if ip.is_empty() {
            return;
        }
        let key = (
            device_key.to_string(),
            mac.unwrap_or("").to_string(),
            ip.to_string(),
        );
        self.by_key
            .entry(key)
            .and_modify(|s| {
                s.count += 1;
                if ts < s.first_ts {
                    s.first_ts = ts;
                }
                if ts > s.last_ts {
                    s.last_ts = ts;
                }
            })
            .or_insert(Sighting {
                count: 1,
                first_ts: ts,
                last_ts: ts,
            });
    }

    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }

    /// Flush all sightings. Sorted order keeps upserts deterministic across
    /// consumers working on the same device.
    pub async fn flush(self, conn: &mut AsyncPgConnection) -> Result<()> {
        use crate::schema::endpoints::dsl as e;
        let mut entries: Vec<_> = self.by_key.into_iter().collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));

        for ((device_key, mac, ip), sighting) in entries {
            diesel::insert_into(e::endpoints)
                .values((
                    e::device_key.eq(&device_key),
                    e::mac.eq(&mac),
                    e::ip.eq(&ip),
                    e::first_seen.eq(sighting.first_ts),
                    e::last_seen.eq(sighting.last_ts),
                    e::seen_count.eq(sighting.count),
                ))
                .on_conflict((e::device_key, e::mac, e::ip))
                .do_update()
                .set((
                    e::seen_count.eq(e::seen_count + sighting.count),
                    e::last_seen.eq(diesel::dsl::sql::<diesel::sql_types::Timestamptz>(
                        "GREATEST(endpoints.last_seen, excluded.last_seen)",
                    )),
                    e::first_seen.eq(diesel::dsl::sql::<diesel::sql_types::Timestamptz>(
                        "LEAST(endpoints.first_seen, excluded.first_seen)",
                    )),
                ))
                .execute(conn)
                .await?;
        }
        Ok(())
    }
}

/// Apply a DEVICE identification record: upsert the (device, mac, ip) row
/// and merge auto attributes last-writer-wins per non-empty field across
/// every endpoint sharing that MAC.
pub async fn apply_device_record(
    conn: &mut AsyncPgConnection,
    device_key: &str,
    record: &DeviceRecord,
    ts: DateTime<Utc>,
) -> Result<bool> {
    use crate::schema::endpoints::dsl as e;

    let Some(mac) = record.mac.as_deref().filter(|m| !m.is_empty()) else {
        return Ok(false);
    };

    if let Some(ip) = record.ip.as_deref().filter(|ip| !ip.is_empty()) {
        diesel::insert_into(e::endpoints)
            .values((
                e::device_key.eq(device_key),
                e::mac.eq(mac),
                e::ip.eq(ip),
                e::first_seen.eq(ts),
                e::last_seen.eq(ts),
                e::seen_count.eq(0_i64),
            ))
            .on_conflict((e::device_key, e::mac, e::ip))
            .do_update()
            .set(e::last_seen.eq(diesel::dsl::sql::<diesel::sql_types::Timestamptz>(
                "GREATEST(endpoints.last_seen, excluded.last_seen)",
            )))
            .execute(conn)
            .await?;
    }

    // Non-empty fields overwrite, empty fields leave existing values alone.
    apply_auto_field(conn, device_key, mac, "auto_vendor", record.vendor.as_deref()).await?;
    apply_auto_field(conn, device_key, mac, "auto_type", record.hwtype.as_deref()).await?;
    apply_auto_field(conn, device_key, mac, "auto_os", record.ostype.as_deref()).await?;
    apply_auto_field(conn, device_key, mac, "auto_brand", record.brand.as_deref()).await?;
    apply_auto_field(conn, device_key, mac, "auto_model", record.model.as_deref()).await?;
    apply_auto_field(conn, device_key, mac, "auto_hostname", record.hostname.as_deref()).await?;

    Ok(true)
}

async fn apply_auto_field(
    conn: &mut AsyncPgConnection,
    device_key: &str,
    mac: &str,
    column: &str,
    value: Option<&str>,
) -> Result<()> {
    let Some(value) = value.filter(|v| !v.trim().is_empty()) else {
        return Ok(());
    };
    // Column names come from the fixed list above, never from input.
    let sql = format!("UPDATE endpoints SET {column} = $1 WHERE device_key = $2 AND mac = $3");
    diesel::sql_query(sql)
        .bind::<diesel::sql_types::Text, _>(value.trim())
        .bind::<diesel::sql_types::Text, _>(device_key)
        .bind::<diesel::sql_types::Text, _>(mac)
        .execute(conn)
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parse::ConnAction;
    use chrono::TimeZone;

    fn ts(s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, s).unwrap()
    }

    fn conn_record() -> ConnRecord {
        ConnRecord {
            action: ConnAction::Open,
            proto: "TCP".into(),
            src_ip: "10.0.0.5".into(),
            src_port: 1,
            dst_ip: "8.8.8.8".into(),
            dst_port: 443,
            src_zone: None,
            src_if: None,
            dst_zone: None,
            dst_if: None,
            src_mac: Some("AA-BB-CC-DD-EE-01".into()),
            dst_mac: None,
            xlat_src_ip: None,
            xlat_src_port: None,
            xlat_dst_ip: None,
            xlat_dst_port: None,
            rule: None,
            app_name: None,
            bytes_orig: 0,
            bytes_term: 0,
        }
    }

    #[test]
    fn sightings_aggregate_per_endpoint() {
        let mut batch = SightingBatch::new();
        batch.record_conn("fw1", &conn_record(), ts(0));
        batch.record_conn("fw1", &conn_record(), ts(5));
        assert_eq!(batch.by_key.len(), 2);
        let src = batch
            .by_key
            .get(&("fw1".into(), "AA-BB-CC-DD-EE-01".into(), "10.0.0.5".into()))
            .unwrap();
        assert_eq!(src.count, 2);
        assert_eq!(src.first_ts, ts(0));
        assert_eq!(src.last_ts, ts(5));
        let dst = batch
            .by_key
            .get(&("fw1".into(), "".into(), "8.8.8.8".into()))
            .unwrap();
        assert_eq!(dst.count, 2);
    }

    #[test]
    fn empty_ip_is_skipped() {
        let mut batch = SightingBatch::new();
        let mut record = conn_record();
        record.dst_ip = String::new();
        batch.record_conn("fw1", &record, ts(0));
        assert_eq!(batch.by_key.len(), 1);
    }
}
