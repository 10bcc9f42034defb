//! Key-value settings with JSON values and a read-through cache.

use crate::config::SETTINGS_REFRESH;
use crate::db::PgPool;
use crate::error::{Result, ServiceError};
use crate::net::Ipv4Cidr;
use chrono::Utc;
use diesel::prelude::*;
use diesel_async::RunQueryDsl;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;

pub const LOG_RETENTION: &str = "log_retention";
pub const LOCAL_NETWORKS: &str = "local_networks";
pub const HA_BANNER_DISMISSED: &str = "ha_banner_dismissed";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LogRetention {
    pub enabled: bool,
    pub keep_days: u32,
}

impl Default for LogRetention {
    fn default() -> Self {
        Self {
            enabled: true,
            keep_days: 3,
        }
    }
}

impl LogRetention {
    pub fn validate(&self) -> Result<()> {
        if !(1..=365).contains(&self.keep_days) {
            return Err(ServiceError::Validation(
                "keep_days must be between 1 and 365".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LocalNetworks {
    pub enabled: bool,
    pub cidrs: Vec<String>,
}

impl Default for LocalNetworks {
    fn default() -> Self {
        Self {
            enabled: true,
            cidrs: vec![
                "10.0.0.0/8".to_string(),
                "172.16.0.0/12".to_string(),
                "192.168.0.0/16".to_string(),
            ],
        }
    }
}

impl LocalNetworks {
    /// Validate each CIDR as IPv4 and rewrite it to network form.
    pub fn normalized(mut self) -> Result<Self> {
        let mut out = Vec::with_capacity(self.cidrs.len());
        for raw in &self.cidrs {
            let cidr = Ipv4Cidr::parse(raw).ok_or_else(|| {
                ServiceError::Validation(format!("invalid IPv4 CIDR '{raw}'"))
            })?;
            out.push(cidr.to_string());
        }
        self.cidrs = out;
        Ok(self)
    }

    pub fn parsed_cidrs(&self) -> Vec<Ipv4Cidr> {
        self.cidrs
            .iter()
            .filter_map(|c| Ipv4Cidr::parse(c))
            .collect()
    }
}

fn defaults() -> HashMap<String, Value> {
    let mut map = HashMap::new();
    map.insert(
        LOG_RETENTION.to_string(),
        serde_json::to_value(LogRetention::default()).expect("static default"),
    );
    map.insert(
        LOCAL_NETWORKS.to_string(),
        serde_json::to_value(LocalNetworks::default()).expect("static default"),
    );
    map.insert(HA_BANNER_DISMISSED.to_string(), Value::Array(Vec::new()));
    map
}

struct CacheEntry {
    value: Value,
    fetched_at: Instant,
}

pub struct SettingsStore {
    pool: PgPool,
    cache: Mutex<HashMap<String, CacheEntry>>,
}

impl SettingsStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub async fn get(&self, name: &str) -> Result<Value> {
        if let Some(cached) = self.cached(name) {
            return Ok(cached);
        }

        use crate::schema::settings::dsl as s;
        let mut conn = self.acquire().await?;
        let stored: Option<Value> = s::settings
            .filter(s::name.eq(name))
            .select(s::value)
            .first(&mut *conn)
            .await
            .optional()?;

        let value = stored
            .or_else(|| defaults().remove(name))
            .unwrap_or(Value::Null);
        self.store_cached(name, &value);
        Ok(value)
    }

    pub async fn set(&self, name: &str, value: Value) -> Result<()> {
        use crate::schema::settings::dsl as s;
        let mut conn = self.acquire().await?;
        diesel::insert_into(s::settings)
            .values((
                s::name.eq(name),
                s::value.eq(&value),
                s::updated_at.eq(Utc::now()),
            ))
            .on_conflict(s::name)
            .do_update()
            .set((s::value.eq(&value), s::updated_at.eq(Utc::now())))
            .execute(&mut *conn)
            .await?;
        self.store_cached(name, &value);
        Ok(())
    }

    pub async fn all(&self) -> Result<HashMap<String, Value>> {
        use crate::schema::settings::dsl as s;
        let mut conn = self.acquire().await?;
        let rows: Vec<(String, Value)> = s::settings
            .select((s::name, s::value))
            .load(&mut *conn)
            .await?;

        let mut merged = defaults();
        for (name, value) in rows {
            merged.insert(name, value);
        }
        Ok(merged)
    }

    pub async fn log_retention(&self) -> Result<LogRetention> {
        let value = self.get(LOG_RETENTION).await?;
        Ok(serde_json::from_value(value).unwrap_or_default())
    }

    pub async fn local_networks(&self) -> Result<LocalNetworks> {
        let value = self.get(LOCAL_NETWORKS).await?;
        Ok(serde_json::from_value(value).unwrap_or_default())
    }

    fn cached(&self, name: &str) -> Option<Value> {
        let cache = self.cache.lock().expect("settings cache poisoned");
        cache.get(name).and_then(|entry| {
            (entry.fetched_at.elapsed() < SETTINGS_REFRESH).then(|| entry.value.clone())
        })
    }

    fn store_cached(&self, name: &str, value: &Value) {
        let mut cache = self.cache.lock().expect("settings cache poisoned");
        cache.insert(
            name.to_string(),
            CacheEntry {
                value: value.clone(),
                fetched_at: Instant::now(),
            },
        );
    }

    async fn acquire(&self) -> Result<bb8::PooledConnection<'_, crate::db::PgConnectionManager>> {
        self.pool
            .get()
            .await
            .map_err(|err| ServiceError::StorageUnavailable(format!("{err:?}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retention_defaults_keep_three_days() {
        let retention = LogRetention::default();
        assert!(retention.enabled);
        assert_eq!(retention.keep_days, 3);
        assert!(retention.validate().is_ok());
    }

    #[test]
    fn retention_bounds_are_enforced() {
        let zero = LogRetention {
            enabled: true,
            keep_days: 0,
        };
        assert!(zero.validate().is_err());
        let too_long = LogRetention {
            enabled: true,
            keep_days: 366,
        };
        assert!(too_long.validate().is_err());
    }

    #[test]
    fn local_networks_normalize_to_network_form() {
        let nets = LocalNetworks {
            enabled: true,
            cidrs: vec!["192.168.5.77/24".to_string()],
        };
        let normalized = nets.normalized().unwrap();
        assert_eq!(normalized.cidrs, vec!["192.168.5.0/24".to_string()]);
    }

    #[test]
    fn ipv6_cidrs_are_rejected() {
        let nets = LocalNetworks {
            enabled: true,
            cidrs: vec!["fd00::/8".to_string()],
        };
        assert!(nets.normalized().is_err());
    }

    #[test]
    fn defaults_cover_known_names() {
        let map = defaults();
        assert!(map.contains_key(LOG_RETENTION));
        assert!(map.contains_key(LOCAL_NETWORKS));
        assert!(map.contains_key(HA_BANNER_DISMISSED));
    }
}
