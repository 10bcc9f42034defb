//! Background job manager: one worker serialises file imports, purges and
//! retention cleanups. The database is authoritative; the in-memory
//! registry is a cache for fast polling.

pub mod cleanup;
pub mod import;
pub mod purge;

use crate::db::PgPool;
use crate::error::{Result, ServiceError};
use crate::ingest::pipeline::IngestContext;
use crate::models::IngestJobRow;
use crate::settings::SettingsStore;
use chrono::Utc;
use diesel::prelude::*;
use diesel_async::{AsyncPgConnection, RunQueryDsl};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{Mutex, Notify};
use tracing::{error, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobKind {
    Import,
    Purge,
    Cleanup,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Import => "import",
            Self::Purge => "purge",
            Self::Cleanup => "cleanup",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "import" => Some(Self::Import),
            "purge" => Some(Self::Purge),
            "cleanup" => Some(Self::Cleanup),
            _ => None,
        }
    }
}

pub const STATUS_QUEUED: &str = "queued";
pub const STATUS_RUNNING: &str = "running";
pub const STATUS_DONE: &str = "done";
pub const STATUS_ERROR: &str = "error";
pub const STATUS_CANCELED: &str = "canceled";

pub fn is_terminal(status: &str) -> bool {
    matches!(status, STATUS_DONE | STATUS_ERROR | STATUS_CANCELED)
}

pub struct JobManager {
    pool: PgPool,
    registry: Mutex<HashMap<Uuid, IngestJobRow>>,
    wakeup: Notify,
    upload_dir: PathBuf,
}

impl JobManager {
    pub fn new(pool: PgPool, upload_dir: PathBuf) -> Arc<Self> {
        Arc::new(Self {
            pool,
            registry: Mutex::new(HashMap::new()),
            wakeup: Notify::new(),
            upload_dir,
        })
    }

    pub fn upload_path(&self, job_id: Uuid) -> PathBuf {
        self.upload_dir.join(format!("{job_id}.upload"))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn conn(&self) -> Result<bb8::PooledConnection<'_, crate::db::PgConnectionManager>> {
        self.pool
            .get()
            .await
            .map_err(|err| ServiceError::StorageUnavailable(format!("{err:?}")))
    }

    /// Startup recovery: jobs left `running` by a crashed process become
    /// terminal errors; queued jobs stay and are picked up again.
    pub async fn recover_crashed(&self) -> Result<usize> {
        use crate::schema::ingest_jobs::dsl as j;
        let mut conn = self.conn().await?;
        let now = Utc::now();
        let updated = diesel::update(j::ingest_jobs.filter(j::status.eq(STATUS_RUNNING)))
            .set((
                j::status.eq(STATUS_ERROR),
                j::error_type.eq("recovered_after_crash"),
                j::error_message.eq("process restarted while job was running"),
                j::finished_at.eq(now),
                j::updated_at.eq(now),
            ))
            .execute(&mut *conn)
            .await?;
        if updated > 0 {
            warn!(count = updated, "marked crashed jobs as error");
        }
        Ok(updated)
    }

    /// Create a queued import job for an uploaded file.
    pub async fn submit_import(
        &self,
        filename: &str,
        bytes_total: i64,
        device_hint: Option<&str>,
    ) -> Result<IngestJobRow> {
        use crate::schema::ingest_jobs::dsl as j;
        let id = Uuid::new_v4();
        let mut conn = self.conn().await?;
        let row: IngestJobRow = diesel::insert_into(j::ingest_jobs)
            .values((
                j::id.eq(id),
                j::kind.eq(JobKind::Import.as_str()),
                j::status.eq(STATUS_QUEUED),
                j::phase.eq("uploading"),
                j::filename.eq(filename),
                j::bytes_total.eq(bytes_total),
                j::device_key.eq(device_hint),
            ))
            .returning(IngestJobRow::as_returning())
            .get_result(&mut *conn)
            .await?;
        self.cache_row(row.clone()).await;
        self.wakeup.notify_one();
        Ok(row)
    }

    /// Queue a purge. Refused while any non-terminal job exists for the
    /// device or an import/cleanup is in flight globally.
    pub async fn submit_purge(&self, device_key: &str) -> Result<IngestJobRow> {
        use crate::schema::ingest_jobs::dsl as j;
        let mut conn = self.conn().await?;

        let holder: Option<IngestJobRow> = j::ingest_jobs
            .filter(j::status.eq_any([STATUS_QUEUED, STATUS_RUNNING]))
            .filter(
                j::device_key
                    .eq(device_key)
                    .or(j::kind.eq_any(["import", "cleanup"])),
            )
            .order(j::created_at.asc())
            .select(IngestJobRow::as_select())
            .first(&mut *conn)
            .await
            .optional()?;
        if let Some(holder) = holder {
            return Err(ServiceError::Busy { holder: holder.id });
        }

        let id = Uuid::new_v4();
        let row: IngestJobRow = diesel::insert_into(j::ingest_jobs)
            .values((
                j::id.eq(id),
                j::kind.eq(JobKind::Purge.as_str()),
                j::status.eq(STATUS_QUEUED),
                j::device_key.eq(device_key),
            ))
            .returning(IngestJobRow::as_returning())
            .get_result(&mut *conn)
            .await?;
        self.cache_row(row.clone()).await;
        self.wakeup.notify_one();
        Ok(row)
    }

    /// Queue a retention cleanup unless one is already queued or running.
    pub async fn submit_cleanup(&self) -> Result<Option<IngestJobRow>> {
        use crate::schema::ingest_jobs::dsl as j;
        let mut conn = self.conn().await?;

        let existing: Option<Uuid> = j::ingest_jobs
            .filter(j::kind.eq(JobKind::Cleanup.as_str()))
            .filter(j::status.eq_any([STATUS_QUEUED, STATUS_RUNNING]))
            .select(j::id)
            .first(&mut *conn)
            .await
            .optional()?;
        if existing.is_some() {
            return Ok(None);
        }

        let id = Uuid::new_v4();
        let row: IngestJobRow = diesel::insert_into(j::ingest_jobs)
            .values((
                j::id.eq(id),
                j::kind.eq(JobKind::Cleanup.as_str()),
                j::status.eq(STATUS_QUEUED),
            ))
            .returning(IngestJobRow::as_returning())
            .get_result(&mut *conn)
            .await?;
        self.cache_row(row.clone()).await;
        self.wakeup.notify_one();
        Ok(Some(row))
    }

    pub async fn get(&self, id: Uuid) -> Result<IngestJobRow> {
        if let Some(row) = self.registry.lock().await.get(&id).cloned() {
            return Ok(row);
        }
        use crate::schema::ingest_jobs::dsl as j;
        let mut conn = self.conn().await?;
        let row: Option<IngestJobRow> = j::ingest_jobs
            .filter(j::id.eq(id))
            .select(IngestJobRow::as_select())
            .first(&mut *conn)
            .await
            .optional()?;
        row.ok_or(ServiceError::NotFound)
    }

    pub async fn list(
        &self,
        state: Option<&str>,
        device_key: Option<&str>,
        limit: i64,
    ) -> Result<Vec<IngestJobRow>> {
        use crate::schema::ingest_jobs::dsl as j;
        let mut conn = self.conn().await?;
        let mut query = j::ingest_jobs.into_boxed();
        if let Some(state) = state {
            query = query.filter(j::status.eq(state.to_string()));
        }
        if let Some(device_key) = device_key {
            query = query.filter(j::device_key.eq(device_key.to_string()));
        }
        let rows = query
            .order(j::created_at.desc())
            .limit(limit.clamp(1, 500))
            .select(IngestJobRow::as_select())
            .load(&mut *conn)
            .await?;
        Ok(rows)
    }

    /// Request cooperative cancellation. Queued jobs cancel immediately;
    /// running jobs observe the flag at their next checkpoint.
    pub async fn cancel(&self, id: Uuid) -> Result<IngestJobRow> {
        use crate::schema::ingest_jobs::dsl as j;
        let mut registry = self.registry.lock().await;
        let mut conn = self.conn().await?;
        let now = Utc::now();

        let row: Option<IngestJobRow> = j::ingest_jobs
            .filter(j::id.eq(id))
            .select(IngestJobRow::as_select())
            .first(&mut *conn)
            .await
            .optional()?;
        let row = row.ok_or(ServiceError::NotFound)?;
        if is_terminal(&row.status) {
            return Ok(row);
        }

        let updated: IngestJobRow = if row.status == STATUS_QUEUED {
            diesel::update(j::ingest_jobs.filter(j::id.eq(id)))
                .set((
                    j::status.eq(STATUS_CANCELED),
                    j::cancel_requested.eq(true),
                    j::finished_at.eq(now),
                    j::updated_at.eq(now),
                ))
                .returning(IngestJobRow::as_returning())
                .get_result(&mut *conn)
                .await?
        } else {
            diesel::update(j::ingest_jobs.filter(j::id.eq(id)))
                .set((j::cancel_requested.eq(true), j::updated_at.eq(now)))
                .returning(IngestJobRow::as_returning())
                .get_result(&mut *conn)
                .await?
        };
        registry.insert(id, updated.clone());
        Ok(updated)
    }

    /// Remove a terminal job row from history.
    pub async fn delete(&self, id: Uuid) -> Result<()> {
        use crate::schema::ingest_jobs::dsl as j;
        let mut registry = self.registry.lock().await;
        let mut conn = self.conn().await?;
        let row: Option<IngestJobRow> = j::ingest_jobs
            .filter(j::id.eq(id))
            .select(IngestJobRow::as_select())
            .first(&mut *conn)
            .await
            .optional()?;
        let row = row.ok_or(ServiceError::NotFound)?;
        if !is_terminal(&row.status) {
            return Err(ServiceError::Validation(
                "only finished jobs can be deleted".into(),
            ));
        }
        diesel::delete(j::ingest_jobs.filter(j::id.eq(id)))
            .execute(&mut *conn)
            .await?;
        registry.remove(&id);
        Ok(())
    }

    pub async fn cancel_requested(&self, id: Uuid) -> bool {
        if let Some(row) = self.registry.lock().await.get(&id) {
            if row.cancel_requested {
                return true;
            }
        }
        use crate::schema::ingest_jobs::dsl as j;
        let Ok(mut conn) = self.conn().await else {
            return false;
        };
        j::ingest_jobs
            .filter(j::id.eq(id))
            .select(j::cancel_requested)
            .first::<bool>(&mut *conn)
            .await
            .unwrap_or(false)
    }

    async fn cache_row(&self, row: IngestJobRow) {
        self.registry.lock().await.insert(row.id, row);
    }

    /// Pair a DB update with the registry cache inside one critical section.
    pub async fn update_row<F>(&self, id: Uuid, apply: F) -> Result<IngestJobRow>
    where
        F: FnOnce(&mut JobPatch),
    {
        let mut patch = JobPatch::default();
        apply(&mut patch);

        let mut registry = self.registry.lock().await;
        let mut conn = self.conn().await?;
        let row = patch.execute(&mut conn, id).await?;
        registry.insert(id, row.clone());
        Ok(row)
    }

    /// Claim the oldest queued job, marking it running.
    async fn claim_next(&self) -> Result<Option<IngestJobRow>> {
        #[derive(QueryableByName)]
        struct Claimed {
            #[diesel(sql_type = diesel::sql_types::Uuid)]
            id: Uuid,
        }

        let mut registry = self.registry.lock().await;
        let mut conn = self.conn().await?;
        let claimed: Vec<Claimed> = diesel::sql_query(
            "UPDATE ingest_jobs SET status = 'running', started_at = now(), updated_at = now() \
             WHERE id = (SELECT id FROM ingest_jobs WHERE status = 'queued' \
                         ORDER BY created_at ASC LIMIT 1 FOR UPDATE SKIP LOCKED) \
             RETURNING id",
        )
        .load(&mut *conn)
        .await?;

        let Some(claimed) = claimed.as_slice().first() else {
            return Ok(None);
        };
        use crate::schema::ingest_jobs::dsl as j;
        let row: IngestJobRow = j::ingest_jobs
            .filter(j::id.eq(claimed.id))
            .select(IngestJobRow::as_select())
            .first(&mut *conn)
            .await?;
        registry.insert(row.id, row.clone());
        Ok(Some(row))
    }

    /// The single heavy-job worker loop.
    pub async fn run_worker(
        self: Arc<Self>,
        ingest: Arc<IngestContext>,
        settings: Arc<SettingsStore>,
    ) {
        info!("job worker started");
        loop {
            let job = match self.claim_next().await {
                Ok(job) => job,
                Err(err) => {
                    error!(error = %err, "job claim failed");
                    tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                    continue;
                }
            };

            let Some(job) = job else {
                let _ = tokio::time::timeout(
                    std::time::Duration::from_secs(1),
                    self.wakeup.notified(),
                )
                .await;
                continue;
            };

            let job_id = job.id;
            info!(%job_id, kind = %job.kind, "job started");
            let result = match JobKind::parse(&job.kind) {
                Some(JobKind::Import) => {
                    import::run_import(&self, &ingest, &job).await
                }
                Some(JobKind::Purge) => purge::run_purge(&self, &job).await,
                Some(JobKind::Cleanup) => {
                    cleanup::run_cleanup(&self, &settings, &job).await
                }
                None => Err(ServiceError::Validation(format!(
                    "unknown job kind '{}'",
                    job.kind
                ))),
            };

            match result {
                Ok(()) => info!(%job_id, "job finished"),
                Err(ServiceError::Canceled) => {
                    let _ = self
                        .update_row(job_id, |patch| {
                            patch.status = Some(STATUS_CANCELED);
                            patch.mark_finished();
                        })
                        .await;
                    info!(%job_id, "job canceled");
                }
                Err(err) => {
                    error!(%job_id, error = %err, "job failed");
                    let _ = self
                        .update_row(job_id, |patch| {
                            patch.status = Some(STATUS_ERROR);
                            patch.error_type = Some(error_type_of(&err).to_string());
                            patch.error_message = Some(truncate(&err.to_string(), 1000));
                            patch.mark_finished();
                        })
                        .await;
                }
            }
        }
    }
}

fn error_type_of(err: &ServiceError) -> &'static str {
    match err {
        ServiceError::Validation(_) => "validation_error",
        ServiceError::NotFound => "not_found",
        ServiceError::Busy { .. } => "busy",
        ServiceError::Canceled => "canceled",
        ServiceError::Conflict => "conflict",
        ServiceError::StorageUnavailable(_) => "storage_unavailable",
        ServiceError::Internal(_) => "internal",
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_string()
    } else {
        s[..max].to_string()
    }
}

/// Column updates for one job row. `None` fields are left untouched.
#[derive(Default, AsChangeset)]
#[diesel(table_name = crate::schema::ingest_jobs)]
pub struct JobPatch {
    pub status: Option<&'static str>,
    pub phase: Option<String>,
    pub progress: Option<f64>,
    pub lines_total: Option<i64>,
    pub lines_processed: Option<i64>,
    pub parse_ok: Option<i64>,
    pub parse_err: Option<i64>,
    pub filtered_id: Option<i64>,
    pub raw_logs_inserted: Option<i64>,
    pub events_inserted: Option<i64>,
    pub time_min: Option<chrono::DateTime<Utc>>,
    pub time_max: Option<chrono::DateTime<Utc>>,
    pub device_key: Option<String>,
    pub device_detected: Option<String>,
    pub error_type: Option<String>,
    pub error_message: Option<String>,
    pub error_stage: Option<String>,
    pub result_counts: Option<serde_json::Value>,
    pub updated_at: Option<chrono::DateTime<Utc>>,
    pub finished_at: Option<chrono::DateTime<Utc>>,
}

impl JobPatch {
    pub fn mark_finished(&mut self) {
        self.finished_at = Some(Utc::now());
    }

    async fn execute(mut self, conn: &mut AsyncPgConnection, id: Uuid) -> Result<IngestJobRow> {
        use crate::schema::ingest_jobs::dsl as j;
        self.updated_at = Some(Utc::now());

        let row: IngestJobRow = diesel::update(j::ingest_jobs.filter(j::id.eq(id)))
            .set(&self)
            .returning(IngestJobRow::as_returning())
            .get_result(conn)
            .await?;
        Ok(row)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states_are_exactly_done_error_canceled() {
        assert!(is_terminal(STATUS_DONE));
        assert!(is_terminal(STATUS_ERROR));
        assert!(is_terminal(STATUS_CANCELED));
        assert!(!is_terminal(STATUS_QUEUED));
        assert!(!is_terminal(STATUS_RUNNING));
    }

    #[test]
    fn job_kind_round_trips() {
        for kind in [JobKind::Import, JobKind::Purge, JobKind::Cleanup] {
            assert_eq!(JobKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(JobKind::parse("bogus"), None);
    }
}
