use clap::{Parser, ValueEnum};

#[derive(Parser, Debug)]
#[command(name = "netwall-analyzer")]
#[command(about = "NetWall firewall flow analyzer")]
#[command(version)]
pub struct Cli {
    /// Address the HTTP API binds to
    #[arg(long = "web-host", env = "NETWALL_WEB_HOST", default_value = "0.0.0.0")]
    pub web_host: String,

    /// Port the HTTP API binds to
    #[arg(long = "web-port", env = "NETWALL_WEB_PORT", default_value_t = 8080)]
    pub web_port: u16,

    /// Address the syslog UDP receiver binds to
    #[arg(long = "syslog-host", env = "NETWALL_SYSLOG_HOST", default_value = "0.0.0.0")]
    pub syslog_host: String,

    /// Port the syslog UDP receiver binds to
    #[arg(long = "syslog-port", env = "NETWALL_SYSLOG_PORT", default_value_t = 5514)]
    pub syslog_port: u16,

    /// PostgreSQL connection URL
    #[arg(
        long = "database-url",
        env = "NETWALL_DATABASE_URL",
        default_value = "postgres://localhost/netwall"
    )]
    pub database_url: String,

    /// Serve built frontend assets from this process
    #[arg(long = "serve-frontend", env = "NETWALL_SERVE_FRONTEND")]
    pub serve_frontend: bool,

    /// Path to built frontend assets
    #[arg(
        long = "frontend-dir",
        env = "NETWALL_FRONTEND_DIR",
        default_value = "./frontend/dist"
    )]
    pub frontend_dir: String,

    /// Log level when RUST_LOG is not set
    #[arg(long = "log-level", env = "NETWALL_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// How to infer the year for BSD syslog timestamps
    #[arg(
        long = "year-mode",
        env = "NETWALL_YEAR_MODE",
        value_enum,
        default_value = "auto"
    )]
    pub year_mode: YearMode,

    /// Which field wins when an event carries both zone and interface
    #[arg(
        long = "classification-precedence",
        env = "NETWALL_CLASSIFICATION_PRECEDENCE",
        value_enum,
        default_value = "zone_first"
    )]
    pub classification_precedence: ClassificationPrecedence,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
#[value(rename_all = "snake_case")]
pub enum YearMode {
    Current,
    Previous,
    Auto,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
#[value(rename_all = "snake_case")]
pub enum ClassificationPrecedence {
    ZoneFirst,
    InterfaceFirst,
}

impl Cli {
    pub fn parse_args() -> Self {
        Self::parse()
    }
}
