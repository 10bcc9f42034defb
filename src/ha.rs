//! Firewall identity: canonical device keys and HA master/slave pairing.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::HashMap;

/// Window within which two members' last_seen instants must overlap for the
/// pair to be proposed as an HA cluster.
const PAIR_WINDOW_HOURS: i64 = 24;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HaRole {
    Primary,
    Secondary,
}

/// Suffixes recognised on NetWall HA member hostnames, matched after
/// lowercasing. Order matters: longer suffixes are tried first so
/// `-primary` is not mistaken for `-a` plus junk.
const SUFFIXES: &[(&str, HaRole)] = &[
    ("-primary", HaRole::Primary),
    ("-secondary", HaRole::Secondary),
    ("_master", HaRole::Primary),
    ("_slave", HaRole::Secondary),
    ("-a", HaRole::Primary),
    ("-b", HaRole::Secondary),
];

/// Split a hostname into its HA base and role, if it carries a recognised
/// member suffix. The hostname is lowercased first; the returned base is
/// lowercase too.
pub fn split_ha_suffix(hostname: &str) -> Option<(String, HaRole)> {
    let lower = hostname.trim().to_lowercase();
    for (suffix, role) in SUFFIXES {
        if let Some(base) = lower.strip_suffix(suffix) {
            if !base.is_empty() {
                return Some((base.to_string(), *role));
            }
        }
    }
    None
}

/// Normalise a raw syslog hostname into a device key: trimmed and lowercased.
pub fn device_key_from_hostname(hostname: &str) -> String {
    let key = hostname.trim().to_lowercase();
    if key.is_empty() {
        "unknown".to_string()
    } else {
        key
    }
}

pub fn ha_key(base: &str) -> String {
    format!("ha:{base}")
}

pub fn ha_base_of(device_key: &str) -> Option<&str> {
    device_key.strip_prefix("ha:")
}

/// Resolve the canonical key for an observed hostname given the enabled
/// clusters (member device key -> cluster base).
pub fn canonical_device_key(hostname: &str, enabled_members: &HashMap<String, String>) -> String {
    let key = device_key_from_hostname(hostname);
    match enabled_members.get(&key) {
        Some(base) => ha_key(base),
        None => key,
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HaCandidate {
    pub base: String,
    pub master: String,
    pub slave: String,
    pub suggested_label: String,
}

/// Propose HA pairs from observed plain device keys. Two keys that differ
/// only by a recognised suffix and whose last_seen windows overlap within
/// 24 h form a candidate. Keys already covered by an enabled cluster are
/// skipped by the caller.
pub fn ha_candidates(devices: &[(String, Option<DateTime<Utc>>)]) -> Vec<HaCandidate> {
    let mut by_base: HashMap<String, Vec<(HaRole, &str, Option<DateTime<Utc>>)>> = HashMap::new();
    for (key, last_seen) in devices {
        if let Some((base, role)) = split_ha_suffix(key) {
            by_base.entry(base).or_default().push((role, key, *last_seen));
        }
    }

    let mut out = Vec::new();
    for (base, members) in by_base {
        let master = members.iter().find(|(role, _, _)| *role == HaRole::Primary);
        let slave = members
            .iter()
            .find(|(role, _, _)| *role == HaRole::Secondary);
        let (Some(master), Some(slave)) = (master, slave) else {
            continue;
        };
        if !windows_overlap(master.2, slave.2) {
            continue;
        }
        out.push(HaCandidate {
            suggested_label: base.clone(),
            base,
            master: master.1.to_string(),
            slave: slave.1.to_string(),
        });
    }
    out.sort_by(|a, b| a.base.cmp(&b.base));
    out
}

fn windows_overlap(a: Option<DateTime<Utc>>, b: Option<DateTime<Utc>>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => (a - b).abs() <= Duration::hours(PAIR_WINDOW_HOURS),
        // A member with no sightings yet cannot be paired.
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 10, h, 0, 0).unwrap()
    }

    #[test]
    fn recognises_all_suffix_families() {
        assert_eq!(
            split_ha_suffix("gw-edge-a"),
            Some(("gw-edge".into(), HaRole::Primary))
        );
        assert_eq!(
            split_ha_suffix("gw-edge-b"),
            Some(("gw-edge".into(), HaRole::Secondary))
        );
        assert_eq!(
            split_ha_suffix("FW-Core-Primary"),
            Some(("fw-core".into(), HaRole::Primary))
        );
        assert_eq!(
            split_ha_suffix("gw-mand_Master"),
            Some(("gw-mand".into(), HaRole::Primary))
        );
        assert_eq!(split_ha_suffix("standalone"), None);
    }

    #[test]
    fn suffix_only_hostname_is_not_a_member() {
        assert_eq!(split_ha_suffix("-a"), None);
    }

    #[test]
    fn candidates_require_both_roles_and_overlap() {
        let now = ts(12);
        let devices = vec![
            ("fw-a".to_string(), Some(now)),
            ("fw-b".to_string(), Some(ts(13))),
            ("lone-a".to_string(), Some(now)),
        ];
        let candidates = ha_candidates(&devices);
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].base, "fw");
        assert_eq!(candidates[0].master, "fw-a");
        assert_eq!(candidates[0].slave, "fw-b");
    }

    #[test]
    fn stale_member_is_not_paired() {
        let devices = vec![
            ("fw-a".to_string(), Some(ts(0))),
            (
                "fw-b".to_string(),
                Some(Utc.with_ymd_and_hms(2026, 3, 12, 0, 0, 0).unwrap()),
            ),
        ];
        assert!(ha_candidates(&devices).is_empty());
    }

    #[test]
    fn canonical_key_uses_enabled_cluster() {
        let mut members = HashMap::new();
        members.insert("fw-a".to_string(), "fw".to_string());
        assert_eq!(canonical_device_key("FW-A", &members), "ha:fw");
        assert_eq!(canonical_device_key("other", &members), "other");
    }
}
