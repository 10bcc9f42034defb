#![recursion_limit = "256"]

pub mod api;
pub mod classify;
pub mod cli;
pub mod config;
pub mod db;
pub mod devices;
pub mod error;
pub mod graph;
pub mod ha;
pub mod ingest;
pub mod jobs;
pub mod migrations;
pub mod models;
pub mod net;
pub mod parse;
pub mod schema;
pub mod server;
pub mod settings;
pub mod state;
pub mod telemetry;

use crate::config::AppConfig;
use crate::ingest::pipeline::IngestContext;
use crate::ingest::stats::IngestStats;
use crate::ingest::udp::UdpReceiver;
use crate::jobs::JobManager;
use crate::server::Server;
use crate::settings::SettingsStore;
use crate::state::AppState;
use std::sync::Arc;
use std::time::Duration;
use tracing::error;

const RETENTION_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

/// Bootstraps the whole service: database, ingest pipeline, job worker,
/// retention scheduler and HTTP API.
pub async fn run() -> anyhow::Result<()> {
    let cli = cli::Cli::parse_args();
    let config = AppConfig::from_cli(cli)?;
    telemetry::init_tracing(&config.log_level);

    let pool = db::connect_pool(&config).await?;
    migrations::run_migrations(&pool).await?;

    let config = Arc::new(config);
    let stats = Arc::new(IngestStats::new());
    let settings = Arc::new(SettingsStore::new(pool.clone()));
    let upload_dir = std::env::temp_dir().join("netwall-uploads");
    tokio::fs::create_dir_all(&upload_dir).await?;
    let jobs = JobManager::new(pool.clone(), upload_dir);

    jobs.recover_crashed().await?;

    let ingest_ctx = Arc::new(IngestContext {
        pool: pool.clone(),
        config: Arc::clone(&config),
        stats: Arc::clone(&stats),
    });

    let (receiver, _consumers) = UdpReceiver::bind(Arc::clone(&ingest_ctx)).await?;
    tokio::spawn(async move {
        if let Err(err) = receiver.run().await {
            error!(error = %err, "syslog receiver stopped");
        }
    });

    tokio::spawn(Arc::clone(&jobs).run_worker(
        Arc::clone(&ingest_ctx),
        Arc::clone(&settings),
    ));

    {
        let jobs = Arc::clone(&jobs);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(RETENTION_INTERVAL);
            ticker.tick().await; // immediate first tick
            loop {
                ticker.tick().await;
                match jobs.submit_cleanup().await {
                    Ok(Some(job)) => tracing::info!(job_id = %job.id, "scheduled retention cleanup"),
                    Ok(None) => tracing::debug!("retention cleanup already in flight"),
                    Err(err) => error!(error = %err, "failed to schedule retention cleanup"),
                }
            }
        });
    }

    let state = AppState {
        config,
        pool,
        jobs,
        settings,
        stats,
    };
    Server::new(state).run().await
}
