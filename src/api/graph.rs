use crate::error::{Result, ServiceError};
use crate::graph::{self, inspect, DestView, DstKind, FilterKind, GraphQuery, View};
use crate::state::AppState;
use axum::extract::{Query, State};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct GraphParams {
    pub device: String,
    pub src_kind: String,
    pub src_value: String,
    pub dst_kind: String,
    #[serde(default)]
    pub dst_value: Option<String>,
    pub time_from: DateTime<Utc>,
    pub time_to: DateTime<Utc>,
    #[serde(default = "default_view")]
    pub view: String,
    #[serde(default = "default_dest_view")]
    pub dest_view: String,
}

fn default_view() -> String {
    "original".to_string()
}

fn default_dest_view() -> String {
    "endpoints".to_string()
}

impl GraphParams {
    fn into_query(self) -> Result<GraphQuery> {
        let src_kind = FilterKind::parse(&self.src_kind).ok_or_else(|| {
            ServiceError::Validation("src_kind must be zone, interface or endpoint".into())
        })?;
        let dst_kind = DstKind::parse(&self.dst_kind).ok_or_else(|| {
            ServiceError::Validation("dst_kind must be zone, interface, endpoint or any".into())
        })?;
        let view = View::parse(&self.view)
            .ok_or_else(|| ServiceError::Validation("view must be original or translated".into()))?;
        let dest_view = DestView::parse(&self.dest_view).ok_or_else(|| {
            ServiceError::Validation("dest_view must be endpoints or services".into())
        })?;

        let dst_value = self.dst_value.unwrap_or_default();
        if dst_kind != DstKind::Any && dst_value.trim().is_empty() {
            return Err(ServiceError::Validation(
                "dst_value is required unless dst_kind is any".into(),
            ));
        }
        if self.src_value.trim().is_empty() {
            return Err(ServiceError::Validation("src_value must not be empty".into()));
        }

        Ok(GraphQuery {
            device_key: self.device,
            src_kind,
            src_value: self.src_value,
            // dst_value is explicitly ignored for dst_kind=any.
            dst_value: if dst_kind == DstKind::Any {
                String::new()
            } else {
                dst_value
            },
            dst_kind,
            time_from: self.time_from,
            time_to: self.time_to,
            view,
            dest_view,
        })
    }
}

pub async fn get_graph(
    State(state): State<AppState>,
    Query(params): Query<GraphParams>,
) -> Result<Json<graph::payload::GraphResponse>> {
    let query = params.into_query()?;
    let mut conn = state.conn().await?;
    let response =
        graph::execute(&mut conn, state.config.classification_precedence, &query).await?;
    Ok(Json(response))
}

#[derive(Debug, Deserialize)]
pub struct InspectParams {
    pub device: String,
    pub time_from: DateTime<Utc>,
    pub time_to: DateTime<Utc>,
    #[serde(default = "default_view")]
    pub view: String,
    pub proto: String,
    pub dest_port: i32,
    #[serde(default)]
    pub app_name: Option<String>,
    pub src_ip: String,
    pub dest_ip: String,
    #[serde(default = "default_limit")]
    pub limit: i64,
    #[serde(default)]
    pub offset: i64,
}

fn default_limit() -> i64 {
    100
}

pub async fn get_inspect_logs(
    State(state): State<AppState>,
    Query(params): Query<InspectParams>,
) -> Result<Json<inspect::InspectResponse>> {
    let view = View::parse(&params.view)
        .ok_or_else(|| ServiceError::Validation("view must be original or translated".into()))?;
    if !(0..=65535).contains(&params.dest_port) {
        return Err(ServiceError::Validation(
            "dest_port must be between 0 and 65535".into(),
        ));
    }
    let query = inspect::InspectQuery {
        device_key: params.device,
        time_from: params.time_from,
        time_to: params.time_to,
        view,
        proto: params.proto,
        dst_port: params.dest_port,
        app_name: params.app_name,
        src_ip: params.src_ip,
        dest_ip: params.dest_ip,
        limit: params.limit,
        offset: params.offset,
    };
    let mut conn = state.conn().await?;
    let response = inspect::inspect_logs(&mut conn, &query).await?;
    Ok(Json(response))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(dst_kind: &str, dst_value: Option<&str>) -> GraphParams {
        GraphParams {
            device: "fw1".into(),
            src_kind: "zone".into(),
            src_value: "trusted".into(),
            dst_kind: dst_kind.into(),
            dst_value: dst_value.map(str::to_string),
            time_from: Utc::now(),
            time_to: Utc::now(),
            view: "original".into(),
            dest_view: "endpoints".into(),
        }
    }

    #[test]
    fn dst_any_drops_dst_value() {
        let query = params("any", Some("ignored")).into_query().unwrap();
        assert_eq!(query.dst_kind, DstKind::Any);
        assert!(query.dst_value.is_empty());
    }

    #[test]
    fn dst_value_required_for_concrete_kinds() {
        assert!(params("zone", None).into_query().is_err());
        assert!(params("zone", Some("dmz")).into_query().is_ok());
    }

    #[test]
    fn invalid_enums_are_rejected() {
        let mut p = params("any", None);
        p.view = "sideways".into();
        assert!(p.into_query().is_err());
    }
}
