//! Router-MAC rules and endpoint classification for the graph query path.

use crate::cli::ClassificationPrecedence;
use crate::models::RouterMacRuleRow;
use std::collections::HashSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleDirection {
    Src,
    Dst,
    Both,
}

impl RuleDirection {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "src" => Some(Self::Src),
            "dst" | "dest" => Some(Self::Dst),
            "both" => Some(Self::Both),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Src => "src",
            Self::Dst => "dst",
            Self::Both => "both",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowSide {
    Source,
    Dest,
}

/// Router-MAC rules for one device, split by the side they apply to.
#[derive(Debug, Default, Clone)]
pub struct RouterMacRules {
    src: HashSet<String>,
    dst: HashSet<String>,
}

impl RouterMacRules {
    pub fn from_rows(rows: &[RouterMacRuleRow]) -> Self {
        let mut rules = Self::default();
        for row in rows {
            match RuleDirection::parse(&row.direction) {
                Some(RuleDirection::Src) => {
                    rules.src.insert(row.mac.clone());
                }
                Some(RuleDirection::Dst) => {
                    rules.dst.insert(row.mac.clone());
                }
                Some(RuleDirection::Both) => {
                    rules.src.insert(row.mac.clone());
                    rules.dst.insert(row.mac.clone());
                }
                None => {}
            }
        }
        rules
    }

    pub fn is_router(&self, side: FlowSide, mac: Option<&str>) -> bool {
        let Some(mac) = mac else {
            return false;
        };
        match side {
            FlowSide::Source => self.src.contains(mac),
            FlowSide::Dest => self.dst.contains(mac),
        }
    }

    pub fn len(&self) -> usize {
        self.src.len() + self.dst.len()
    }

    pub fn is_empty(&self) -> bool {
        self.src.is_empty() && self.dst.is_empty()
    }
}

/// How one side of a flow renders in the topology.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndpointClass {
    /// Behind a declared router MAC or MAC-less; collapsed into a router bucket.
    Router,
    /// An individual endpoint identified by (mac, ip) or (∅, ip).
    Endpoint { mac: Option<String>, ip: String },
}

/// Resolve the class of one flow side. A router-MAC rule wins over endpoint
/// identity; the stored flow is untouched either way.
pub fn classify_side(
    rules: &RouterMacRules,
    side: FlowSide,
    mac: Option<&str>,
    ip: &str,
) -> EndpointClass {
    if rules.is_router(side, mac) {
        return EndpointClass::Router;
    }
    EndpointClass::Endpoint {
        mac: mac.map(str::to_string).filter(|m| !m.is_empty()),
        ip: ip.to_string(),
    }
}

/// Stable identity for an endpoint. MAC-bearing endpoints merge across HA
/// members by MAC; MAC-less ones key on IP.
pub fn endpoint_id(mac: Option<&str>, ip: &str) -> String {
    match mac.filter(|m| !m.trim().is_empty()) {
        Some(mac) => format!("mac:{}", sanitize(mac)),
        None => format!("ip:{}", sanitize(ip)),
    }
}

fn sanitize(value: &str) -> String {
    let safe: String = value
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if safe.is_empty() {
        "unknown".to_string()
    } else {
        safe
    }
}

/// Pick the consulted field when an event carries both zone and interface.
/// Only affects the left/right matching in the graph; stored rows keep both
/// fields.
pub fn leading_field<'a>(
    precedence: ClassificationPrecedence,
    zone: Option<&'a str>,
    iface: Option<&'a str>,
) -> Option<&'a str> {
    match precedence {
        ClassificationPrecedence::ZoneFirst => zone.or(iface),
        ClassificationPrecedence::InterfaceFirst => iface.or(zone),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn rule(mac: &str, direction: &str) -> RouterMacRuleRow {
        RouterMacRuleRow {
            id: 0,
            device_key: "fw1".into(),
            mac: mac.into(),
            direction: direction.into(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn direction_both_applies_to_either_side() {
        let rules = RouterMacRules::from_rows(&[rule("AA-BB-CC-DD-EE-01", "both")]);
        assert!(rules.is_router(FlowSide::Source, Some("AA-BB-CC-DD-EE-01")));
        assert!(rules.is_router(FlowSide::Dest, Some("AA-BB-CC-DD-EE-01")));
    }

    #[test]
    fn src_rule_does_not_hide_destinations() {
        let rules = RouterMacRules::from_rows(&[rule("AA-BB-CC-DD-EE-01", "src")]);
        assert!(rules.is_router(FlowSide::Source, Some("AA-BB-CC-DD-EE-01")));
        assert!(!rules.is_router(FlowSide::Dest, Some("AA-BB-CC-DD-EE-01")));
        assert!(!rules.is_router(FlowSide::Source, None));
    }

    #[test]
    fn classification_prefers_router_rule() {
        let rules = RouterMacRules::from_rows(&[rule("AA-BB-CC-DD-EE-01", "src")]);
        let class = classify_side(&rules, FlowSide::Source, Some("AA-BB-CC-DD-EE-01"), "10.0.0.5");
        assert_eq!(class, EndpointClass::Router);
        let class = classify_side(&rules, FlowSide::Source, Some("AA-BB-CC-DD-EE-02"), "10.0.0.6");
        assert!(matches!(class, EndpointClass::Endpoint { .. }));
    }

    #[test]
    fn endpoint_ids_are_stable_and_sanitized() {
        assert_eq!(
            endpoint_id(Some("AA-BB-CC-DD-EE-01"), "10.0.0.5"),
            "mac:AA-BB-CC-DD-EE-01"
        );
        assert_eq!(endpoint_id(None, "10.0.0.5"), "ip:10.0.0.5");
        assert_eq!(endpoint_id(Some("  "), "fe80::1"), "ip:fe80__1");
    }

    #[test]
    fn precedence_selects_leading_field() {
        assert_eq!(
            leading_field(ClassificationPrecedence::ZoneFirst, Some("lan"), Some("if1")),
            Some("lan")
        );
        assert_eq!(
            leading_field(ClassificationPrecedence::InterfaceFirst, Some("lan"), Some("if1")),
            Some("if1")
        );
        assert_eq!(
            leading_field(ClassificationPrecedence::InterfaceFirst, Some("lan"), None),
            Some("lan")
        );
    }
}
