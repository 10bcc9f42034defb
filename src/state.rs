use crate::config::AppConfig;
use crate::db::PgPool;
use crate::error::{Result, ServiceError};
use crate::ingest::stats::IngestStats;
use crate::jobs::JobManager;
use crate::settings::SettingsStore;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub pool: PgPool,
    pub jobs: Arc<JobManager>,
    pub settings: Arc<SettingsStore>,
    pub stats: Arc<IngestStats>,
}

impl AppState {
    pub async fn conn(
        &self,
    ) -> Result<bb8::PooledConnection<'_, crate::db::PgConnectionManager>> {
        self.pool
            .get()
            .await
            .map_err(|err| ServiceError::StorageUnavailable(format!("{err:?}")))
    }
}
