//! Firewall inventory and HA cluster resolution against the database.

use crate::error::Result;
use crate::ha;
use crate::models::{FirewallRow, HaClusterRow};
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel_async::{AsyncPgConnection, RunQueryDsl};
use serde::Serialize;
use std::collections::HashMap;

/// Mark a firewall as a live syslog source, folding the observed timestamp
/// into its first/last seen window.
pub async fn upsert_firewall_syslog(
    conn: &mut AsyncPgConnection,
    device_key: &str,
    ts: DateTime<Utc>,
) -> Result<()> {
    use crate::schema::firewalls::dsl as f;
    let now = Utc::now();
    diesel::insert_into(f::firewalls)
        .values((
            f::device_key.eq(device_key),
            f::source_syslog.eq(true),
            f::first_seen.eq(ts),
            f::last_seen.eq(ts),
            f::updated_at.eq(now),
        ))
        .on_conflict(f::device_key)
        .do_update()
        .set((
            f::source_syslog.eq(true),
            f::first_seen.eq(diesel::dsl::sql::<diesel::sql_types::Nullable<diesel::sql_types::Timestamptz>>(
                "LEAST(firewalls.first_seen, excluded.first_seen)",
            )),
            f::last_seen.eq(diesel::dsl::sql::<diesel::sql_types::Nullable<diesel::sql_types::Timestamptz>>(
                "GREATEST(firewalls.last_seen, excluded.last_seen)",
            )),
            f::updated_at.eq(now),
        ))
        .execute(conn)
        .await?;
    Ok(())
}

/// Mark a firewall as having imported data; widens the seen window with the
/// file's observed time range.
pub async fn upsert_firewall_import(
    conn: &mut AsyncPgConnection,
    device_key: &str,
    first_ts: Option<DateTime<Utc>>,
    last_ts: Option<DateTime<Utc>>,
) -> Result<()> {
    use crate::schema::firewalls::dsl as f;
    let now = Utc::now();
    diesel::insert_into(f::firewalls)
        .values((
            f::device_key.eq(device_key),
            f::source_import.eq(true),
            f::first_seen.eq(first_ts),
            f::last_seen.eq(last_ts),
            f::last_import_ts.eq(now),
            f::updated_at.eq(now),
        ))
        .on_conflict(f::device_key)
        .do_update()
        .set((
            f::source_import.eq(true),
            f::first_seen.eq(diesel::dsl::sql::<diesel::sql_types::Nullable<diesel::sql_types::Timestamptz>>(
                "LEAST(firewalls.first_seen, excluded.first_seen)",
            )),
            f::last_seen.eq(diesel::dsl::sql::<diesel::sql_types::Nullable<diesel::sql_types::Timestamptz>>(
                "GREATEST(firewalls.last_seen, excluded.last_seen)",
            )),
            f::last_import_ts.eq(now),
            f::updated_at.eq(now),
        ))
        .execute(conn)
        .await?;
    Ok(())
}

pub async fn list_firewalls(conn: &mut AsyncPgConnection) -> Result<Vec<FirewallRow>> {
    use crate::schema::firewalls::dsl as f;
    let rows = f::firewalls
        .select(FirewallRow::as_select())
        .order(f::device_key.asc())
        .load(conn)
        .await?;
    Ok(rows)
}

pub async fn enabled_clusters(conn: &mut AsyncPgConnection) -> Result<Vec<HaClusterRow>> {
    use crate::schema::ha_clusters::dsl as h;
    let rows = h::ha_clusters
        .filter(h::is_enabled.eq(true))
        .select(HaClusterRow::as_select())
        .load(conn)
        .await?;
    Ok(rows)
}

/// Member device key -> cluster base, for canonicalisation at ingest.
pub async fn enabled_member_map(conn: &mut AsyncPgConnection) -> Result<HashMap<String, String>> {
    let clusters = enabled_clusters(conn).await?;
    let mut map = HashMap::new();
    for cluster in clusters {
        for member in cluster.member_list() {
            map.insert(member, cluster.base.clone());
        }
    }
    Ok(map)
}

/// Expand a device key into the member device keys its rows are stored
/// under. `ha:<base>` unions the cluster members; plain keys map to
/// themselves.
pub async fn expand_device_key(
    conn: &mut AsyncPgConnection,
    device_key: &str,
) -> Result<Vec<String>> {
    let Some(base) = ha::ha_base_of(device_key) else {
        return Ok(vec![device_key.to_string()]);
    };
    use crate::schema::ha_clusters::dsl as h;
    let cluster: Option<HaClusterRow> = h::ha_clusters
        .filter(h::base.eq(base))
        .select(HaClusterRow::as_select())
        .first(conn)
        .await
        .optional()?;
    match cluster {
        Some(cluster) if !cluster.member_list().is_empty() => Ok(cluster.member_list()),
        _ => Ok(vec![device_key.to_string()]),
    }
}

#[derive(Debug, Serialize)]
pub struct DeviceGroup {
    pub id: String,
    pub kind: String,
    pub label: String,
    pub members: Vec<String>,
}

/// Firewalls plus enabled HA clusters, with cluster members folded out of
/// the singles list.
pub async fn device_groups(conn: &mut AsyncPgConnection) -> Result<Vec<DeviceGroup>> {
    let firewalls = list_firewalls(conn).await?;
    let clusters = enabled_clusters(conn).await?;
    let overrides = display_overrides(conn).await?;

    let mut member_of: HashMap<String, String> = HashMap::new();
    for cluster in &clusters {
        for member in cluster.member_list() {
            member_of.insert(member, cluster.base.clone());
        }
    }

    let mut groups = Vec::new();
    for cluster in &clusters {
        let key = ha::ha_key(&cluster.base);
        let label = overrides
            .get(&key)
            .cloned()
            .unwrap_or_else(|| cluster.label.clone());
        groups.push(DeviceGroup {
            id: key,
            kind: "ha".to_string(),
            label,
            members: cluster.member_list(),
        });
    }
    for fw in &firewalls {
        if member_of.contains_key(&fw.device_key) || fw.device_key.starts_with("ha:") {
            continue;
        }
        let label = overrides
            .get(&fw.device_key)
            .cloned()
            .unwrap_or_else(|| fw.device_key.clone());
        groups.push(DeviceGroup {
            id: fw.device_key.clone(),
            kind: "single".to_string(),
            label,
            members: vec![fw.device_key.clone()],
        });
    }
    groups.sort_by(|a, b| a.label.cmp(&b.label).then_with(|| a.id.cmp(&b.id)));
    Ok(groups)
}

/// HA pairs suggested from observed firewalls, excluding members already in
/// an enabled cluster.
pub async fn ha_candidates(conn: &mut AsyncPgConnection) -> Result<Vec<ha::HaCandidate>> {
    let firewalls = list_firewalls(conn).await?;
    let members = enabled_member_map(conn).await?;
    let observed: Vec<(String, Option<DateTime<Utc>>)> = firewalls
        .into_iter()
        .filter(|fw| !fw.device_key.starts_with("ha:") && !members.contains_key(&fw.device_key))
        .map(|fw| (fw.device_key, fw.last_seen))
        .collect();
    Ok(ha::ha_candidates(&observed))
}

pub async fn enable_cluster(
    conn: &mut AsyncPgConnection,
    base: &str,
    label: Option<&str>,
    members: &[String],
) -> Result<()> {
    use crate::schema::ha_clusters::dsl as h;
    let members_json = serde_json::to_value(members).unwrap_or_default();
    let label = label.unwrap_or(base);
    diesel::insert_into(h::ha_clusters)
        .values((
            h::base.eq(base),
            h::label.eq(label),
            h::members.eq(&members_json),
            h::is_enabled.eq(true),
        ))
        .on_conflict(h::base)
        .do_update()
        .set((
            h::label.eq(label),
            h::members.eq(&members_json),
            h::is_enabled.eq(true),
        ))
        .execute(conn)
        .await?;
    Ok(())
}

pub async fn rename_cluster(
    conn: &mut AsyncPgConnection,
    base: &str,
    label: &str,
) -> Result<bool> {
    use crate::schema::ha_clusters::dsl as h;
    let updated = diesel::update(h::ha_clusters.filter(h::base.eq(base)))
        .set(h::label.eq(label))
        .execute(conn)
        .await?;
    Ok(updated > 0)
}

/// Display-name overrides keyed by canonical device key.
pub async fn display_overrides(
    conn: &mut AsyncPgConnection,
) -> Result<HashMap<String, String>> {
    use crate::schema::firewall_overrides::dsl as o;
    let rows: Vec<(String, String)> = o::firewall_overrides
        .select((o::device_key, o::display_name))
        .load(conn)
        .await?;
    Ok(rows.into_iter().collect())
}

pub async fn display_label(conn: &mut AsyncPgConnection, device_key: &str) -> Result<String> {
    let overrides = display_overrides(conn).await?;
    Ok(overrides
        .get(device_key)
        .cloned()
        .unwrap_or_else(|| device_key.to_string()))
}
