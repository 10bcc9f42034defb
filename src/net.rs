//! MAC and IPv4 network helpers shared by ingest and the API layer.

use std::net::{IpAddr, Ipv4Addr};
use std::str::FromStr;

/// Normalize a MAC address to uppercase hyphen-separated `AA-BB-CC-DD-EE-FF`.
///
/// Accepts colon-, hyphen- and dot-separated forms as well as bare hex.
/// Input that is not a 6-byte MAC falls back to the trimmed, uppercased
/// original so operator-entered values are still comparable.
pub fn normalize_mac(mac: &str) -> Option<String> {
    let cleaned: String = mac
        .trim()
        .to_ascii_uppercase()
        .chars()
        .filter(|c| !matches!(c, ':' | '-' | '.'))
        .collect();
    if cleaned.is_empty() {
        return None;
    }
    if cleaned.len() != 12 || !cleaned.chars().all(|c| c.is_ascii_hexdigit()) {
        let fallback = mac.trim().to_ascii_uppercase().replace(':', "-");
        return if fallback.is_empty() {
            None
        } else {
            Some(fallback)
        };
    }
    let mut out = String::with_capacity(17);
    for (i, chunk) in cleaned.as_bytes().chunks(2).enumerate() {
        if i > 0 {
            out.push('-');
        }
        out.push(chunk[0] as char);
        out.push(chunk[1] as char);
    }
    Some(out)
}

pub fn is_valid_ip(s: &str) -> bool {
    IpAddr::from_str(s.trim()).is_ok()
}

/// An IPv4 network in canonical (network-address) form.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv4Cidr {
    pub network: Ipv4Addr,
    pub prefix: u8,
}

impl Ipv4Cidr {
    pub fn parse(s: &str) -> Option<Self> {
        let (addr_part, prefix_part) = s.trim().split_once('/')?;
        let addr = Ipv4Addr::from_str(addr_part.trim()).ok()?;
        let prefix: u8 = prefix_part.trim().parse().ok()?;
        if prefix > 32 {
            return None;
        }
        let mask = prefix_mask(prefix);
        let network = Ipv4Addr::from(u32::from(addr) & mask);
        Some(Self { network, prefix })
    }

    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        let mask = prefix_mask(self.prefix);
        (u32::from(ip) & mask) == u32::from(self.network)
    }
}

impl std::fmt::Display for Ipv4Cidr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.network, self.prefix)
    }
}

fn prefix_mask(prefix: u8) -> u32 {
    if prefix == 0 {
        0
    } else {
        u32::MAX << (32 - prefix)
    }
}

/// True when `ip` parses as IPv4 and falls inside any of the given networks.
pub fn ip_in_networks(ip: &str, networks: &[Ipv4Cidr]) -> bool {
    match Ipv4Addr::from_str(ip.trim()) {
        Ok(addr) => networks.iter().any(|net| net.contains(addr)),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_colon_separated_mac() {
        assert_eq!(
            normalize_mac("aa:bb:cc:dd:ee:01").as_deref(),
            Some("AA-BB-CC-DD-EE-01")
        );
    }

    #[test]
    fn normalizes_dotted_and_bare_macs() {
        assert_eq!(
            normalize_mac("aabb.ccdd.ee01").as_deref(),
            Some("AA-BB-CC-DD-EE-01")
        );
        assert_eq!(
            normalize_mac("aabbccddee01").as_deref(),
            Some("AA-BB-CC-DD-EE-01")
        );
    }

    #[test]
    fn invalid_mac_falls_back_to_uppercased_input() {
        assert_eq!(normalize_mac("not-a-mac").as_deref(), Some("NOT-A-MAC"));
        assert_eq!(normalize_mac("  "), None);
    }

    #[test]
    fn cidr_is_normalized_to_network_form() {
        let cidr = Ipv4Cidr::parse("192.168.1.77/24").unwrap();
        assert_eq!(cidr.to_string(), "192.168.1.0/24");
        assert!(cidr.contains("192.168.1.200".parse().unwrap()));
        assert!(!cidr.contains("192.168.2.1".parse().unwrap()));
    }

    #[test]
    fn cidr_rejects_bad_prefix() {
        assert!(Ipv4Cidr::parse("10.0.0.0/33").is_none());
        assert!(Ipv4Cidr::parse("10.0.0.0").is_none());
    }

    #[test]
    fn ip_in_networks_checks_all_cidrs() {
        let nets = vec![
            Ipv4Cidr::parse("10.0.0.0/8").unwrap(),
            Ipv4Cidr::parse("192.168.0.0/16").unwrap(),
        ];
        assert!(ip_in_networks("10.1.2.3", &nets));
        assert!(ip_in_networks("192.168.44.5", &nets));
        assert!(!ip_in_networks("8.8.8.8", &nets));
        assert!(!ip_in_networks("fe80::1", &nets));
    }
}
