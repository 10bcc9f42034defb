use crate::classify;
use crate::devices;
use crate::error::{Result, ServiceError};
use crate::graph::{build_endpoint_index, EndpointIndex};
use crate::models::{EndpointOverrideRow, EndpointRow};
use crate::net;
use crate::state::AppState;
use axum::extract::{Query, State};
use axum::Json;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel::PgTextExpressionMethods;
use diesel_async::RunQueryDsl;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::BTreeSet;

#[derive(Debug, Deserialize)]
pub struct SegmentParams {
    pub device: String,
    pub kind: String,
}

/// Enumerate the zones or interfaces a device has logged traffic on.
pub async fn list_segment_names(
    State(state): State<AppState>,
    Query(params): Query<SegmentParams>,
) -> Result<Json<Value>> {
    if !matches!(params.kind.as_str(), "zone" | "interface") {
        return Err(ServiceError::Validation(
            "kind must be 'zone' or 'interface'".into(),
        ));
    }
    let mut conn = state.conn().await?;
    let members = devices::expand_device_key(&mut conn, &params.device).await?;

    use crate::schema::flows::dsl as fl;
    let (src_col, dst_col): (Vec<Option<String>>, Vec<Option<String>>) =
        if params.kind == "zone" {
            (
                fl::flows
                    .filter(fl::device_key.eq_any(&members))
                    .select(fl::src_zone)
                    .distinct()
                    .load(&mut *conn)
                    .await?,
                fl::flows
                    .filter(fl::device_key.eq_any(&members))
                    .select(fl::dst_zone)
                    .distinct()
                    .load(&mut *conn)
                    .await?,
            )
        } else {
            (
                fl::flows
                    .filter(fl::device_key.eq_any(&members))
                    .select(fl::src_if)
                    .distinct()
                    .load(&mut *conn)
                    .await?,
                fl::flows
                    .filter(fl::device_key.eq_any(&members))
                    .select(fl::dst_if)
                    .distinct()
                    .load(&mut *conn)
                    .await?,
            )
        };

    let names: BTreeSet<String> = src_col
        .into_iter()
        .chain(dst_col)
        .flatten()
        .filter(|name| !name.trim().is_empty())
        .collect();
    Ok(Json(json!(names.into_iter().collect::<Vec<_>>())))
}

#[derive(Debug, Deserialize)]
pub struct ListParams {
    pub device: String,
    pub time_from: DateTime<Utc>,
    pub time_to: DateTime<Utc>,
    #[serde(default)]
    pub has_mac: Option<bool>,
}

/// Endpoints seen inside a time window, for the endpoint filter picker.
pub async fn list_endpoints(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> Result<Json<Value>> {
    let mut conn = state.conn().await?;
    let members = devices::expand_device_key(&mut conn, &params.device).await?;

    use crate::schema::endpoints::dsl as ep;
    let mut query = ep::endpoints
        .filter(ep::device_key.eq_any(members))
        .filter(ep::last_seen.ge(params.time_from))
        .filter(ep::first_seen.lt(params.time_to))
        .into_boxed();
    if params.has_mac.unwrap_or(false) {
        query = query.filter(ep::mac.ne(""));
    }
    let rows: Vec<EndpointRow> = query
        .order(ep::last_seen.desc())
        .select(EndpointRow::as_select())
        .load(&mut *conn)
        .await?;

    // One entry per merged identity; HA members collapse here.
    let mut seen = BTreeSet::new();
    let mut items = Vec::new();
    for row in rows {
        let id = classify::endpoint_id(row.mac_opt(), &row.ip);
        if !seen.insert(id.clone()) {
            continue;
        }
        items.push(json!({
            "id": id,
            "label": row.label(),
            "ip": row.ip,
            "device_name": row.auto_hostname,
        }));
    }
    Ok(Json(json!(items)))
}

#[derive(Debug, Deserialize)]
pub struct KnownParams {
    #[serde(default)]
    pub device: Option<String>,
    #[serde(default)]
    pub q: Option<String>,
    #[serde(default = "default_sort")]
    pub sort: String,
    #[serde(default = "default_order")]
    pub order: String,
    #[serde(default = "default_limit")]
    pub limit: i64,
    #[serde(default)]
    pub offset: i64,
    #[serde(default)]
    pub local_only: bool,
}

fn default_sort() -> String {
    "last_seen".to_string()
}

fn default_order() -> String {
    "desc".to_string()
}

fn default_limit() -> i64 {
    50
}

/// Paginated endpoint inventory with sort, substring filter and optional
/// local-network restriction.
pub async fn list_known(
    State(state): State<AppState>,
    Query(params): Query<KnownParams>,
) -> Result<Json<Value>> {
    let mut conn = state.conn().await?;

    use crate::schema::endpoint_overrides::dsl as eo;
    use crate::schema::endpoints::dsl as ep;

    let members = match params.device.as_deref() {
        Some(device) if !device.is_empty() => {
            Some(devices::expand_device_key(&mut conn, device).await?)
        }
        _ => None,
    };

    let mut query = ep::endpoints.into_boxed();
    if let Some(members) = &members {
        query = query.filter(ep::device_key.eq_any(members.clone()));
    }
    if let Some(q) = params.q.as_deref().map(str::trim).filter(|q| !q.is_empty()) {
        let pattern = format!("%{q}%");
        query = query.filter(
            ep::ip
                .ilike(pattern.clone())
                .or(ep::mac.ilike(pattern.clone()))
                .or(ep::auto_hostname.ilike(pattern)),
        );
    }

    let rows: Vec<EndpointRow> = query
        .select(EndpointRow::as_select())
        .load(&mut *conn)
        .await?;

    let overrides: Vec<EndpointOverrideRow> = match &members {
        Some(members) => {
            eo::endpoint_overrides
                .filter(eo::device_key.eq_any(members.clone()))
                .select(EndpointOverrideRow::as_select())
                .load(&mut *conn)
                .await?
        }
        None => {
            eo::endpoint_overrides
                .select(EndpointOverrideRow::as_select())
                .load(&mut *conn)
                .await?
        }
    };

    let index: EndpointIndex = build_endpoint_index(&rows, &overrides);

    let local_networks = state.settings.local_networks().await?;
    let cidrs = local_networks.parsed_cidrs();

    let mut items: Vec<Value> = index
        .iter()
        .filter(|(_, info)| {
            if !params.local_only {
                return true;
            }
            local_networks.enabled && net::ip_in_networks(&info.ip, &cidrs)
        })
        .map(|(id, info)| {
            json!({
                "id": id,
                "label": info.label,
                "ip": info.ip,
                "mac": info.mac,
                "seen_count": info.seen_count,
                "first_seen": info.first_seen,
                "last_seen": info.last_seen,
                "vendor": info.vendor,
                "type_name": info.type_name,
                "os_name": info.os_name,
                "brand": info.brand,
                "model": info.model,
                "hostname": info.hostname,
                "comment": info.comment,
            })
        })
        .collect();

    let descending = params.order != "asc";
    items.sort_by(|a, b| {
        let cmp = match params.sort.as_str() {
            "seen_count" => {
                let av = a["seen_count"].as_i64().unwrap_or(0);
                let bv = b["seen_count"].as_i64().unwrap_or(0);
                av.cmp(&bv)
            }
            "ip" => a["ip"].as_str().unwrap_or("").cmp(b["ip"].as_str().unwrap_or("")),
            "label" => a["label"]
                .as_str()
                .unwrap_or("")
                .cmp(b["label"].as_str().unwrap_or("")),
            "first_seen" => a["first_seen"]
                .as_str()
                .unwrap_or("")
                .cmp(b["first_seen"].as_str().unwrap_or("")),
            _ => a["last_seen"]
                .as_str()
                .unwrap_or("")
                .cmp(b["last_seen"].as_str().unwrap_or("")),
        };
        let cmp = cmp.then_with(|| {
            a["id"]
                .as_str()
                .unwrap_or("")
                .cmp(b["id"].as_str().unwrap_or(""))
        });
        if descending {
            cmp.reverse()
        } else {
            cmp
        }
    });

    let total = items.len();
    let offset = params.offset.max(0) as usize;
    let limit = params.limit.clamp(1, 500) as usize;
    let page: Vec<Value> = items.into_iter().skip(offset).take(limit).collect();

    Ok(Json(json!({ "items": page, "total": total })))
}
