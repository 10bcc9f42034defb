use crate::cli::{ClassificationPrecedence, Cli, YearMode};
use anyhow::{Context, Result};
use std::{
    net::{SocketAddr, ToSocketAddrs},
    time::Duration,
};

pub const INGEST_CONSUMERS: usize = 4;
pub const UDP_QUEUE_CAPACITY: usize = 8192;
pub const INGEST_BATCH_LINES: usize = 256;
pub const INGEST_BATCH_WAIT: Duration = Duration::from_millis(50);
pub const RAW_BATCH_ROWS: usize = 500;
pub const MAX_LINE_BYTES: usize = 16 * 1024;
pub const MAX_UPLOAD_BYTES: u64 = 1024 * 1024 * 1024;
pub const IMPORT_CHUNK_DEADLINE: Duration = Duration::from_secs(5);
pub const HTTP_DEADLINE: Duration = Duration::from_secs(30);
pub const GRAPH_DEADLINE: Duration = Duration::from_secs(60);
pub const CLEANUP_BATCH_ROWS: i64 = 50_000;
pub const PURGE_BATCH_ROWS: i64 = 50_000;
pub const SETTINGS_REFRESH: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub web_addr: SocketAddr,
    pub syslog_addr: SocketAddr,
    pub database_url: String,
    pub serve_frontend: bool,
    pub frontend_dir: String,
    pub log_level: String,
    pub year_mode: YearMode,
    pub classification_precedence: ClassificationPrecedence,
    pub max_pool_size: u32,
}

impl AppConfig {
    pub fn from_cli(cli: Cli) -> Result<Self> {
        let web_addr = resolve_addr(&cli.web_host, cli.web_port, "web")?;
        let syslog_addr = resolve_addr(&cli.syslog_host, cli.syslog_port, "syslog")?;

        // 2 for ingest housekeeping, one per consumer, 4 for HTTP handlers.
        let max_pool_size = (2 + INGEST_CONSUMERS + 4) as u32;

        Ok(Self {
            web_addr,
            syslog_addr,
            database_url: cli.database_url,
            serve_frontend: cli.serve_frontend,
            frontend_dir: cli.frontend_dir,
            log_level: cli.log_level,
            year_mode: cli.year_mode,
            classification_precedence: cli.classification_precedence,
            max_pool_size,
        })
    }
}

fn resolve_addr(host: &str, port: u16, what: &str) -> Result<SocketAddr> {
    format!("{host}:{port}")
        .to_socket_addrs()
        .with_context(|| format!("invalid {what} listen host/port combination"))?
        .next()
        .with_context(|| format!("{what} listen address resolved to no targets"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::Cli;
    use clap::Parser;

    #[test]
    fn default_pool_size_covers_consumers_and_http() {
        let cli = Cli::parse_from(["netwall-analyzer"]);
        let config = AppConfig::from_cli(cli).unwrap();
        assert_eq!(config.max_pool_size, 10);
    }

    #[test]
    fn cli_flag_beats_environment_default() {
        let cli = Cli::parse_from(["netwall-analyzer", "--web-port", "9000"]);
        let config = AppConfig::from_cli(cli).unwrap();
        assert_eq!(config.web_addr.port(), 9000);
    }
}
