//! HTTP surface: route assembly for the `/api` prefix.

pub mod devices;
pub mod endpoints;
pub mod firewalls;
pub mod graph;
pub mod ingest;
pub mod inventory;
pub mod settings;

use crate::config::{GRAPH_DEADLINE, HTTP_DEADLINE, MAX_UPLOAD_BYTES};
use crate::state::AppState;
use axum::extract::DefaultBodyLimit;
use axum::routing::{delete, get, post, put};
use axum::Router;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

pub fn router(state: AppState) -> Router {
    let graph_routes = Router::new()
        .route("/graph", get(graph::get_graph))
        .route("/graph/inspect-logs", get(graph::get_inspect_logs))
        .layer(TimeoutLayer::new(GRAPH_DEADLINE));

    let api = Router::new()
        .route("/devices/groups", get(devices::list_groups))
        .route("/devices/groups/enable", post(devices::enable_group))
        .route("/devices/groups/rename", post(devices::rename_group))
        .route("/devices/ha-candidates", get(devices::list_ha_candidates))
        .route("/endpoints", get(endpoints::list_segment_names))
        .route("/endpoints/list", get(endpoints::list_endpoints))
        .route("/endpoints/known", get(endpoints::list_known))
        .route("/inventory/macs", get(inventory::list_macs))
        .route("/inventory/devices/{mac}", get(inventory::get_device_detail))
        .route("/inventory/devices/{mac}", put(inventory::put_device_override))
        .route("/router-macs", get(inventory::list_router_macs))
        .route("/router-macs", post(inventory::upsert_router_mac))
        .route("/router-macs/{id}", delete(inventory::delete_router_mac))
        .route("/firewalls", get(firewalls::list))
        .route("/firewalls/{device_key}", get(firewalls::get_override))
        .route("/firewalls/{device_key}", put(firewalls::put_override))
        .route("/firewalls/{device_key}/purge", post(firewalls::purge))
        .route(
            "/firewalls/{device_key}/import-jobs",
            get(firewalls::import_jobs),
        )
        .route("/ingest/upload", post(ingest::upload))
        .route("/ingest/upload/status", get(ingest::upload_status))
        .route("/ingest/jobs", get(ingest::list_jobs))
        .route("/ingest/jobs/{job_id}/cancel", post(ingest::cancel_job))
        .route("/ingest/jobs/{job_id}", delete(ingest::delete_job))
        .route("/stats", get(ingest::stats))
        .route("/stats/reset", post(ingest::reset_stats))
        .route("/stats/db", get(settings::db_stats))
        .route("/settings", get(settings::get_all))
        .route("/settings/log-retention", put(settings::put_log_retention))
        .route("/settings/local-networks", get(settings::get_local_networks))
        .route("/settings/local-networks", put(settings::put_local_networks))
        .route(
            "/settings/ha-banner-dismissed",
            put(settings::put_ha_banner_dismissed),
        )
        .route("/maintenance/cleanup", post(settings::trigger_cleanup))
        .route("/maintenance/jobs/{job_id}", get(settings::get_maintenance_job))
        .layer(TimeoutLayer::new(HTTP_DEADLINE))
        .merge(graph_routes);

    Router::new()
        .nest("/api", api)
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES as usize))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
