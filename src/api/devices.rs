use crate::devices;
use crate::error::{Result, ServiceError};
use crate::ha;
use crate::state::AppState;
use axum::extract::State;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

pub async fn list_groups(State(state): State<AppState>) -> Result<Json<Value>> {
    let mut conn = state.conn().await?;
    let groups = devices::device_groups(&mut conn).await?;
    Ok(Json(json!(groups)))
}

pub async fn list_ha_candidates(State(state): State<AppState>) -> Result<Json<Value>> {
    let mut conn = state.conn().await?;
    let candidates = devices::ha_candidates(&mut conn).await?;
    Ok(Json(json!(candidates)))
}

#[derive(Debug, Deserialize)]
pub struct EnableGroupBody {
    pub base: String,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub members: Option<Vec<String>>,
}

pub async fn enable_group(
    State(state): State<AppState>,
    Json(body): Json<EnableGroupBody>,
) -> Result<Json<Value>> {
    let base = body.base.trim().to_lowercase();
    if base.is_empty() {
        return Err(ServiceError::Validation("base must not be empty".into()));
    }

    let mut conn = state.conn().await?;
    let members = match body.members {
        Some(members) if !members.is_empty() => members,
        _ => {
            let candidates = devices::ha_candidates(&mut conn).await?;
            let candidate = candidates
                .into_iter()
                .find(|c| c.base == base)
                .ok_or_else(|| {
                    ServiceError::Validation(format!("no HA candidate with base '{base}'"))
                })?;
            vec![candidate.master, candidate.slave]
        }
    };

    devices::enable_cluster(&mut conn, &base, body.label.as_deref(), &members).await?;
    Ok(Json(json!({ "ok": true, "device_key": ha::ha_key(&base) })))
}

#[derive(Debug, Deserialize)]
pub struct RenameGroupBody {
    pub base: String,
    pub label: String,
}

pub async fn rename_group(
    State(state): State<AppState>,
    Json(body): Json<RenameGroupBody>,
) -> Result<Json<Value>> {
    let label = body.label.trim();
    if label.is_empty() {
        return Err(ServiceError::Validation("label must not be empty".into()));
    }
    let mut conn = state.conn().await?;
    let renamed = devices::rename_cluster(&mut conn, body.base.trim(), label).await?;
    if !renamed {
        return Err(ServiceError::NotFound);
    }
    Ok(Json(json!({ "ok": true })))
}
