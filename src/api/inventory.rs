use crate::classify::RuleDirection;
use crate::devices;
use crate::error::{Result, ServiceError};
use crate::models::{EndpointOverrideRow, EndpointRow, RouterMacRuleRow};
use crate::net;
use crate::state::AppState;
use axum::extract::{Path, Query, State};
use axum::Json;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel_async::RunQueryDsl;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;

/// MACs with many distinct IPs behind them are likely routers.
const ROUTER_SUGGESTION_MIN_IPS: usize = 5;
const SAMPLE_IPS: usize = 3;

#[derive(Debug, Deserialize)]
pub struct MacRollupParams {
    pub device: String,
    #[serde(default)]
    pub time_from: Option<DateTime<Utc>>,
    #[serde(default)]
    pub time_to: Option<DateTime<Utc>>,
}

/// MAC rollup used by the router-MAC suggestion dialog.
pub async fn list_macs(
    State(state): State<AppState>,
    Query(params): Query<MacRollupParams>,
) -> Result<Json<Value>> {
    let mut conn = state.conn().await?;
    let members = devices::expand_device_key(&mut conn, &params.device).await?;

    use crate::schema::endpoints::dsl as ep;
    let mut query = ep::endpoints
        .filter(ep::device_key.eq_any(members))
        .filter(ep::mac.ne(""))
        .into_boxed();
    if let Some(from) = params.time_from {
        query = query.filter(ep::last_seen.ge(from));
    }
    if let Some(to) = params.time_to {
        query = query.filter(ep::first_seen.lt(to));
    }
    let rows: Vec<EndpointRow> = query.select(EndpointRow::as_select()).load(&mut *conn).await?;

    struct Rollup {
        ips: std::collections::BTreeSet<String>,
        last_seen: DateTime<Utc>,
        seen_count: i64,
    }
    let mut by_mac: BTreeMap<String, Rollup> = BTreeMap::new();
    for row in rows {
        let entry = by_mac.entry(row.mac.clone()).or_insert(Rollup {
            ips: Default::default(),
            last_seen: row.last_seen,
            seen_count: 0,
        });
        entry.ips.insert(row.ip.clone());
        entry.seen_count += row.seen_count;
        if row.last_seen > entry.last_seen {
            entry.last_seen = row.last_seen;
        }
    }

    let mut items: Vec<Value> = by_mac
        .into_iter()
        .map(|(mac, rollup)| {
            let sample: Vec<&String> = rollup.ips.iter().take(SAMPLE_IPS).collect();
            json!({
                "mac": mac,
                "distinct_ip_count": rollup.ips.len(),
                "sample_ips": sample,
                "last_seen": rollup.last_seen,
                "seen_count": rollup.seen_count,
                "suggested_router": rollup.ips.len() >= ROUTER_SUGGESTION_MIN_IPS,
            })
        })
        .collect();
    items.sort_by(|a, b| {
        b["distinct_ip_count"]
            .as_u64()
            .cmp(&a["distinct_ip_count"].as_u64())
            .then_with(|| a["mac"].as_str().cmp(&b["mac"].as_str()))
    });
    Ok(Json(json!(items)))
}

#[derive(Debug, Deserialize)]
pub struct RouterMacListParams {
    pub device: String,
}

pub async fn list_router_macs(
    State(state): State<AppState>,
    Query(params): Query<RouterMacListParams>,
) -> Result<Json<Value>> {
    let mut conn = state.conn().await?;
    let members = devices::expand_device_key(&mut conn, &params.device).await?;

    use crate::schema::router_mac_rules::dsl as rm;
    let rows: Vec<RouterMacRuleRow> = rm::router_mac_rules
        .filter(rm::device_key.eq_any(members))
        .order((rm::mac.asc(), rm::direction.asc()))
        .select(RouterMacRuleRow::as_select())
        .load(&mut *conn)
        .await?;
    Ok(Json(json!(rows)))
}

#[derive(Debug, Deserialize)]
pub struct RouterMacBody {
    pub device: String,
    pub mac: String,
    #[serde(default = "default_direction")]
    pub direction: String,
}

fn default_direction() -> String {
    "src".to_string()
}

pub async fn upsert_router_mac(
    State(state): State<AppState>,
    Json(body): Json<RouterMacBody>,
) -> Result<Json<Value>> {
    let direction = RuleDirection::parse(&body.direction)
        .ok_or_else(|| ServiceError::Validation("direction must be src, dst or both".into()))?;
    let mac = net::normalize_mac(&body.mac)
        .ok_or_else(|| ServiceError::Validation("mac must not be empty".into()))?;

    let mut conn = state.conn().await?;
    use crate::schema::router_mac_rules::dsl as rm;
    let row: RouterMacRuleRow = diesel::insert_into(rm::router_mac_rules)
        .values((
            rm::device_key.eq(body.device.trim()),
            rm::mac.eq(&mac),
            rm::direction.eq(direction.as_str()),
        ))
        .on_conflict((rm::device_key, rm::mac, rm::direction))
        .do_update()
        .set(rm::direction.eq(direction.as_str()))
        .returning(RouterMacRuleRow::as_returning())
        .get_result(&mut *conn)
        .await?;
    Ok(Json(json!({ "ok": true, "rule": row })))
}

pub async fn delete_router_mac(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<Value>> {
    let mut conn = state.conn().await?;
    use crate::schema::router_mac_rules::dsl as rm;
    let deleted = diesel::delete(rm::router_mac_rules.filter(rm::id.eq(id)))
        .execute(&mut *conn)
        .await?;
    if deleted == 0 {
        return Err(ServiceError::NotFound);
    }
    Ok(Json(json!({ "ok": true })))
}

#[derive(Debug, Deserialize)]
pub struct DeviceDetailParams {
    pub device: String,
}

/// Per-MAC identity detail: auto fields, override fields, and the shadowed
/// effective view.
pub async fn get_device_detail(
    State(state): State<AppState>,
    Path(mac): Path<String>,
    Query(params): Query<DeviceDetailParams>,
) -> Result<Json<Value>> {
    let mac = net::normalize_mac(&mac)
        .ok_or_else(|| ServiceError::Validation("invalid mac".into()))?;
    let mut conn = state.conn().await?;
    let members = devices::expand_device_key(&mut conn, &params.device).await?;

    use crate::schema::endpoint_overrides::dsl as eo;
    use crate::schema::endpoints::dsl as ep;

    let endpoints: Vec<EndpointRow> = ep::endpoints
        .filter(ep::device_key.eq_any(&members))
        .filter(ep::mac.eq(&mac))
        .select(EndpointRow::as_select())
        .load(&mut *conn)
        .await?;
    if endpoints.is_empty() {
        return Err(ServiceError::NotFound);
    }

    let override_row: Option<EndpointOverrideRow> = eo::endpoint_overrides
        .filter(eo::device_key.eq_any(&members))
        .filter(eo::mac.eq(&mac))
        .select(EndpointOverrideRow::as_select())
        .first(&mut *conn)
        .await
        .optional()?;

    let index = crate::graph::build_endpoint_index(
        &endpoints,
        override_row.as_ref().map(std::slice::from_ref).unwrap_or(&[]),
    );
    let effective = index.values().next().cloned().unwrap_or_default();

    let ips: Vec<&str> = endpoints.iter().map(|e| e.ip.as_str()).collect();
    Ok(Json(json!({
        "mac": mac,
        "ips": ips,
        "auto": {
            "vendor": endpoints.iter().find_map(|e| e.auto_vendor.clone()),
            "type_name": endpoints.iter().find_map(|e| e.auto_type.clone()),
            "os_name": endpoints.iter().find_map(|e| e.auto_os.clone()),
            "brand": endpoints.iter().find_map(|e| e.auto_brand.clone()),
            "model": endpoints.iter().find_map(|e| e.auto_model.clone()),
            "hostname": endpoints.iter().find_map(|e| e.auto_hostname.clone()),
        },
        "override": override_row,
        "effective": {
            "label": effective.label,
            "vendor": effective.vendor,
            "type_name": effective.type_name,
            "os_name": effective.os_name,
            "brand": effective.brand,
            "model": effective.model,
            "hostname": effective.hostname,
            "comment": effective.comment,
        },
    })))
}

#[derive(Debug, Deserialize)]
pub struct DeviceOverrideBody {
    pub device: String,
    #[serde(default)]
    pub vendor: Option<String>,
    #[serde(default)]
    pub type_name: Option<String>,
    #[serde(default)]
    pub os_name: Option<String>,
    #[serde(default)]
    pub brand: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(default)]
    pub comment: Option<String>,
}

pub async fn put_device_override(
    State(state): State<AppState>,
    Path(mac): Path<String>,
    Json(body): Json<DeviceOverrideBody>,
) -> Result<Json<Value>> {
    let mac = net::normalize_mac(&mac)
        .ok_or_else(|| ServiceError::Validation("invalid mac".into()))?;
    let mut conn = state.conn().await?;

    use crate::schema::endpoint_overrides::dsl as eo;
    let now = Utc::now();
    let row: EndpointOverrideRow = diesel::insert_into(eo::endpoint_overrides)
        .values((
            eo::device_key.eq(body.device.trim()),
            eo::mac.eq(&mac),
            eo::vendor.eq(&body.vendor),
            eo::type_name.eq(&body.type_name),
            eo::os_name.eq(&body.os_name),
            eo::brand.eq(&body.brand),
            eo::model.eq(&body.model),
            eo::hostname.eq(&body.hostname),
            eo::comment.eq(&body.comment),
            eo::updated_at.eq(now),
        ))
        .on_conflict((eo::device_key, eo::mac))
        .do_update()
        .set((
            eo::vendor.eq(&body.vendor),
            eo::type_name.eq(&body.type_name),
            eo::os_name.eq(&body.os_name),
            eo::brand.eq(&body.brand),
            eo::model.eq(&body.model),
            eo::hostname.eq(&body.hostname),
            eo::comment.eq(&body.comment),
            eo::updated_at.eq(now),
        ))
        .returning(EndpointOverrideRow::as_returning())
        .get_result(&mut *conn)
        .await?;
    Ok(Json(json!({ "ok": true, "override": row })))
}
