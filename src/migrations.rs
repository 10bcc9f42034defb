//! Forward-only SQL migrations, applied at startup under an advisory lock.

use crate::db::PgPool;
use anyhow::{Context, Result};
use diesel_async::SimpleAsyncConnection;
use tracing::info;

// Lock key shared by every analyzer process pointed at the same database.
const MIGRATION_LOCK_KEY: i64 = 0x4e57_414c;

const MIGRATIONS: &[(&str, &str)] = &[
    (
        "0001_raw_logs",
        r#"
        CREATE TABLE IF NOT EXISTS raw_logs (
            id BIGSERIAL PRIMARY KEY,
            device_key TEXT NOT NULL,
            received_at TIMESTAMPTZ NOT NULL,
            raw_line TEXT NOT NULL,
            parse_status TEXT NOT NULL DEFAULT 'ok',
            parse_error TEXT,
            job_id UUID
        );
        CREATE INDEX IF NOT EXISTS idx_raw_logs_device_ts ON raw_logs (device_key, received_at);
        CREATE INDEX IF NOT EXISTS idx_raw_logs_job ON raw_logs (job_id);
        "#,
    ),
    (
        "0002_events",
        r#"
        CREATE TABLE IF NOT EXISTS events (
            id BIGSERIAL PRIMARY KEY,
            raw_log_id BIGINT NOT NULL REFERENCES raw_logs (id) ON DELETE CASCADE,
            device_key TEXT NOT NULL,
            ts TIMESTAMPTZ NOT NULL,
            event_kind TEXT NOT NULL,
            proto TEXT NOT NULL,
            src_ip TEXT NOT NULL,
            src_port INTEGER NOT NULL,
            dst_ip TEXT NOT NULL,
            dst_port INTEGER NOT NULL,
            src_zone TEXT,
            src_if TEXT,
            dst_zone TEXT,
            dst_if TEXT,
            src_mac TEXT,
            dst_mac TEXT,
            xlat_src_ip TEXT,
            xlat_src_port INTEGER,
            xlat_dst_ip TEXT,
            xlat_dst_port INTEGER,
            rule TEXT,
            app_name TEXT,
            bytes_orig BIGINT NOT NULL DEFAULT 0,
            bytes_term BIGINT NOT NULL DEFAULT 0
        );
        CREATE INDEX IF NOT EXISTS idx_events_device_ts ON events (device_key, ts);
        CREATE INDEX IF NOT EXISTS idx_events_tuple ON events (device_key, proto, src_ip, src_port, dst_ip, dst_port);
        "#,
    ),
    (
        "0003_flows",
        r#"
        CREATE TABLE IF NOT EXISTS flows (
            id BIGSERIAL PRIMARY KEY,
            device_key TEXT NOT NULL,
            proto TEXT NOT NULL,
            src_ip TEXT NOT NULL,
            src_port INTEGER NOT NULL,
            dst_ip TEXT NOT NULL,
            dst_port INTEGER NOT NULL,
            open_ts TIMESTAMPTZ NOT NULL,
            close_ts TIMESTAMPTZ,
            bytes_orig BIGINT NOT NULL DEFAULT 0,
            bytes_term BIGINT NOT NULL DEFAULT 0,
            rule TEXT,
            app_name TEXT,
            src_zone TEXT,
            src_if TEXT,
            dst_zone TEXT,
            dst_if TEXT,
            src_mac TEXT,
            dst_mac TEXT,
            xlat_src_ip TEXT,
            xlat_src_port INTEGER,
            xlat_dst_ip TEXT,
            xlat_dst_port INTEGER,
            last_seen TIMESTAMPTZ NOT NULL,
            CONSTRAINT ux_flows_identity UNIQUE (device_key, proto, src_ip, src_port, dst_ip, dst_port, open_ts)
        );
        CREATE INDEX IF NOT EXISTS idx_flows_device_window ON flows (device_key, open_ts, close_ts);
        CREATE INDEX IF NOT EXISTS idx_flows_open ON flows (device_key, proto, src_ip, src_port, dst_ip, dst_port)
            WHERE close_ts IS NULL;
        "#,
    ),
    (
        "0004_endpoints",
        r#"
        CREATE TABLE IF NOT EXISTS endpoints (
            id BIGSERIAL PRIMARY KEY,
            device_key TEXT NOT NULL,
            mac TEXT NOT NULL DEFAULT '',
            ip TEXT NOT NULL,
            first_seen TIMESTAMPTZ NOT NULL,
            last_seen TIMESTAMPTZ NOT NULL,
            seen_count BIGINT NOT NULL DEFAULT 0,
            auto_vendor TEXT,
            auto_type TEXT,
            auto_os TEXT,
            auto_brand TEXT,
            auto_model TEXT,
            auto_hostname TEXT,
            CONSTRAINT ux_endpoints_identity UNIQUE (device_key, mac, ip)
        );
        CREATE INDEX IF NOT EXISTS idx_endpoints_device_mac ON endpoints (device_key, mac);
        "#,
    ),
    (
        "0005_firewalls",
        r#"
        CREATE TABLE IF NOT EXISTS firewalls (
            device_key TEXT PRIMARY KEY,
            source_syslog BOOLEAN NOT NULL DEFAULT FALSE,
            source_import BOOLEAN NOT NULL DEFAULT FALSE,
            first_seen TIMESTAMPTZ,
            last_seen TIMESTAMPTZ,
            last_import_ts TIMESTAMPTZ,
            updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
        );
        CREATE TABLE IF NOT EXISTS firewall_overrides (
            device_key TEXT PRIMARY KEY,
            display_name TEXT NOT NULL,
            comment TEXT,
            updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
        );
        CREATE TABLE IF NOT EXISTS ha_clusters (
            base TEXT PRIMARY KEY,
            label TEXT NOT NULL,
            members JSONB NOT NULL DEFAULT '[]'::jsonb,
            is_enabled BOOLEAN NOT NULL DEFAULT FALSE
        );
        "#,
    ),
    (
        "0006_router_mac_rules",
        r#"
        CREATE TABLE IF NOT EXISTS router_mac_rules (
            id BIGSERIAL PRIMARY KEY,
            device_key TEXT NOT NULL,
            mac TEXT NOT NULL,
            direction TEXT NOT NULL DEFAULT 'src',
            created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
            CONSTRAINT ux_router_mac UNIQUE (device_key, mac, direction)
        );
        "#,
    ),
    (
        "0007_ingest_jobs",
        r#"
        CREATE TABLE IF NOT EXISTS ingest_jobs (
            id UUID PRIMARY KEY,
            kind TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'queued',
            phase TEXT,
            progress DOUBLE PRECISION NOT NULL DEFAULT 0,
            cancel_requested BOOLEAN NOT NULL DEFAULT FALSE,
            device_key TEXT,
            filename TEXT,
            bytes_total BIGINT NOT NULL DEFAULT 0,
            lines_total BIGINT NOT NULL DEFAULT 0,
            lines_processed BIGINT NOT NULL DEFAULT 0,
            parse_ok BIGINT NOT NULL DEFAULT 0,
            parse_err BIGINT NOT NULL DEFAULT 0,
            filtered_id BIGINT NOT NULL DEFAULT 0,
            raw_logs_inserted BIGINT NOT NULL DEFAULT 0,
            events_inserted BIGINT NOT NULL DEFAULT 0,
            time_min TIMESTAMPTZ,
            time_max TIMESTAMPTZ,
            device_detected TEXT,
            error_type TEXT,
            error_message TEXT,
            error_stage TEXT,
            result_counts JSONB,
            created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
            updated_at TIMESTAMPTZ NOT NULL DEFAULT now(),
            started_at TIMESTAMPTZ,
            finished_at TIMESTAMPTZ
        );
        CREATE INDEX IF NOT EXISTS idx_ingest_jobs_status ON ingest_jobs (status);
        CREATE INDEX IF NOT EXISTS idx_ingest_jobs_device ON ingest_jobs (device_key);
        "#,
    ),
    (
        "0008_settings",
        r#"
        CREATE TABLE IF NOT EXISTS settings (
            name TEXT PRIMARY KEY,
            value JSONB NOT NULL,
            updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
        );
        "#,
    ),
    (
        "0009_endpoint_overrides",
        r#"
        CREATE TABLE IF NOT EXISTS endpoint_overrides (
            id BIGSERIAL PRIMARY KEY,
            device_key TEXT NOT NULL,
            mac TEXT NOT NULL,
            vendor TEXT,
            type_name TEXT,
            os_name TEXT,
            brand TEXT,
            model TEXT,
            hostname TEXT,
            comment TEXT,
            updated_at TIMESTAMPTZ NOT NULL DEFAULT now(),
            CONSTRAINT ux_endpoint_override UNIQUE (device_key, mac)
        );
        "#,
    ),
];

pub async fn run_migrations(pool: &PgPool) -> Result<()> {
    let mut conn = pool
        .get()
        .await
        .map_err(|err| anyhow::anyhow!("failed to get migration connection: {err:?}"))?;

    conn.batch_execute(&format!("SELECT pg_advisory_lock({MIGRATION_LOCK_KEY})"))
        .await
        .context("failed to take migration advisory lock")?;

    let result = apply_all(&mut conn).await;

    // Release even when a migration failed so other processes are not wedged.
    conn.batch_execute(&format!("SELECT pg_advisory_unlock({MIGRATION_LOCK_KEY})"))
        .await
        .context("failed to release migration advisory lock")?;

    result
}

async fn apply_all(conn: &mut diesel_async::AsyncPgConnection) -> Result<()> {
    conn.batch_execute(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            name TEXT PRIMARY KEY,
            applied_at TIMESTAMPTZ NOT NULL DEFAULT now()
        )",
    )
    .await
    .context("failed to create schema_migrations")?;

    for (name, sql) in MIGRATIONS {
        let applied = already_applied(conn, name).await?;
        if applied {
            continue;
        }
        info!(migration = name, "applying migration");
        let stmt = format!(
            "BEGIN;\n{sql}\nINSERT INTO schema_migrations (name) VALUES ('{name}');\nCOMMIT;"
        );
        conn.batch_execute(&stmt)
            .await
            .with_context(|| format!("migration {name} failed"))?;
    }

    Ok(())
}

async fn already_applied(conn: &mut diesel_async::AsyncPgConnection, name: &str) -> Result<bool> {
    use crate::schema::schema_migrations::dsl as sm;
    use diesel::prelude::*;
    use diesel_async::RunQueryDsl;

    let count: i64 = sm::schema_migrations
        .filter(sm::name.eq(name))
        .count()
        .get_result(conn)
        .await
        .context("failed to query schema_migrations")?;
    Ok(count > 0)
}

#[cfg(test)]
mod tests {
    use super::MIGRATIONS;

    #[test]
    fn migrations_are_ordered_by_numeric_prefix() {
        let mut previous = String::new();
        for (name, _) in MIGRATIONS {
            assert!(
                *name > previous.as_str(),
                "migration {name} is out of order after {previous}"
            );
            assert!(
                name[..4].chars().all(|c| c.is_ascii_digit()),
                "migration {name} lacks a numeric prefix"
            );
            previous = name.to_string();
        }
    }

    #[test]
    fn migration_names_are_sql_safe() {
        for (name, _) in MIGRATIONS {
            assert!(name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_'));
        }
    }
}
