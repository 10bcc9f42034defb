use super::kv::{coerce_int, get_any, KvMap};
use super::syslog::{ParseError, ParseErrorKind};
use crate::net::normalize_mac;
use chrono::{DateTime, Utc};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnAction {
    Open,
    Close,
    Blocked,
    Reject,
}

impl ConnAction {
    fn from_kv(kv: &KvMap) -> Option<Self> {
        let token = kv
            .get("conn")
            .map(|v| v.trim().to_lowercase())
            .or_else(|| {
                kv.get("event").map(|v| {
                    let v = v.trim().to_lowercase();
                    // InControl exports spell the action as conn_open / conn_close(_natsat).
                    if v.starts_with("conn_open") {
                        "open".to_string()
                    } else if v.starts_with("conn_close") {
                        "close".to_string()
                    } else {
                        v
                    }
                })
            })?;
        match token.as_str() {
            "open" => Some(Self::Open),
            "close" => Some(Self::Close),
            "blocked" => Some(Self::Blocked),
            "reject" => Some(Self::Reject),
            _ => None,
        }
    }

    /// Blocked and rejected connections never carry traffic; they are folded
    /// into the flow table as zero-byte closes.
    pub fn is_close_like(&self) -> bool {
        matches!(self, Self::Close | Self::Blocked | Self::Reject)
    }
}

#[derive(Debug, Clone)]
pub struct ConnRecord {
    pub action: ConnAction,
    pub proto: String,
    pub src_ip: String,
    pub src_port: i32,
    pub dst_ip: String,
    pub dst_port: i32,
    pub src_zone: Option<String>,
    pub src_if: Option<String>,
    pub dst_zone: Option<String>,
    pub dst_if: Option<String>,
    pub src_mac: Option<String>,
    pub dst_mac: Option<String>,
    pub xlat_src_ip: Option<String>,
    pub xlat_src_port: Option<i32>,
    pub xlat_dst_ip: Option<String>,
    pub xlat_dst_port: Option<i32>,
    pub rule: Option<String>,
    pub app_name: Option<String>,
    pub bytes_orig: i64,
    pub bytes_term: i64,
}

#[derive(Debug, Clone, Default)]
pub struct DeviceRecord {
    pub mac: Option<String>,
    pub ip: Option<String>,
    pub vendor: Option<String>,
    pub hwtype: Option<String>,
    pub ostype: Option<String>,
    pub hostname: Option<String>,
    pub brand: Option<String>,
    pub model: Option<String>,
}

#[derive(Debug, Clone)]
pub enum RecordKind {
    Conn(ConnRecord),
    Device(DeviceRecord),
    /// Recognised syslog line whose record id is not CONN/DEVICE; stored as
    /// a raw log only.
    Other,
}

#[derive(Debug, Clone)]
pub struct ParsedRecord {
    pub device_hint: String,
    pub received_at: DateTime<Utc>,
    pub kind: RecordKind,
}

const CONN_ID_PREFIXES: &[&str] = &["0060", "60"];
const DEVICE_ID_PREFIXES: &[&str] = &["0890", "89"];

pub(super) fn classify(kv: &KvMap) -> Result<RecordKind, ParseError> {
    let id = kv.get("id").map(String::as_str).unwrap_or("");
    if CONN_ID_PREFIXES.iter().any(|p| id.starts_with(p)) {
        conn_record(kv).map(RecordKind::Conn)
    } else if DEVICE_ID_PREFIXES.iter().any(|p| id.starts_with(p)) {
        Ok(RecordKind::Device(device_record(kv)))
    } else if !id.is_empty() && !id.chars().all(|c| c.is_ascii_digit()) {
        Err(ParseError::new(
            ParseErrorKind::UnsupportedId,
            format!("unrecognised record id '{id}'"),
        ))
    } else {
        Ok(RecordKind::Other)
    }
}

fn conn_record(kv: &KvMap) -> Result<ConnRecord, ParseError> {
    let action = ConnAction::from_kv(kv).ok_or_else(|| {
        ParseError::new(ParseErrorKind::Malformed, "CONN record without conn action")
    })?;

    let proto = get_any(kv, &["connipproto", "proto"])
        .map(|p| p.trim().to_uppercase())
        .unwrap_or_else(|| "IP".to_string());
    let src_ip = required(kv, "connsrcip")?;
    let dst_ip = required(kv, "conndestip")?;
    let src_port = int_field(kv, "connsrcport").unwrap_or(0) as i32;
    let dst_port = int_field(kv, "conndestport").unwrap_or(0) as i32;

    Ok(ConnRecord {
        action,
        proto,
        src_ip,
        dst_ip,
        src_port,
        dst_port,
        src_zone: opt(kv, "connrecvzone"),
        src_if: opt(kv, "connrecvif"),
        dst_zone: opt(kv, "conndestzone"),
        dst_if: opt(kv, "conndestif"),
        src_mac: opt(kv, "connsrcmac").and_then(|m| normalize_mac(&m)),
        dst_mac: opt(kv, "conndestmac").and_then(|m| normalize_mac(&m)),
        xlat_src_ip: opt(kv, "connnewsrcip"),
        xlat_src_port: int_field(kv, "connnewsrcport").map(|v| v as i32),
        xlat_dst_ip: opt(kv, "connnewdestip"),
        xlat_dst_port: int_field(kv, "connnewdestport").map(|v| v as i32),
        rule: opt(kv, "rule"),
        app_name: opt(kv, "app_name"),
        bytes_orig: if action.is_traffic_free() {
            0
        } else {
            int_field(kv, "origsent").unwrap_or(0)
        },
        bytes_term: if action.is_traffic_free() {
            0
        } else {
            int_field(kv, "termsent").unwrap_or(0)
        },
    })
}

impl ConnAction {
    fn is_traffic_free(&self) -> bool {
        matches!(self, Self::Blocked | Self::Reject)
    }
}

fn device_record(kv: &KvMap) -> DeviceRecord {
    DeviceRecord {
        mac: get_any(kv, &["srcmac", "mac"]).and_then(normalize_mac),
        ip: get_any(kv, &["device_ip4", "deviceip4", "ip"]).map(str::to_string),
        vendor: get_any(kv, &["device_vendor", "devicevendor", "vendor"]).map(str::to_string),
        hwtype: get_any(kv, &["device_type_name", "devicetypename", "device_type", "devicetype", "hwtype"])
            .map(str::to_string),
        ostype: get_any(kv, &["device_os_name", "deviceosname", "ostype"]).map(str::to_string),
        hostname: get_any(kv, &["hostname"]).map(str::to_string),
        brand: get_any(kv, &["device_brand", "devicebrand", "brand"]).map(str::to_string),
        model: get_any(kv, &["device_model", "devicemodel", "model"]).map(str::to_string),
    }
}

fn required(kv: &KvMap, key: &str) -> Result<String, ParseError> {
    match kv.get(key) {
        Some(v) if !v.trim().is_empty() => Ok(v.trim().to_string()),
        _ => Err(ParseError::new(
            ParseErrorKind::Malformed,
            format!("CONN record missing {key}"),
        )),
    }
}

fn opt(kv: &KvMap, key: &str) -> Option<String> {
    kv.get(key)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn int_field(kv: &KvMap, key: &str) -> Option<i64> {
    kv.get(key).and_then(|v| coerce_int(v))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parse::kv::parse_kv;

    #[test]
    fn conn_open_record_is_extracted() {
        let kv = parse_kv(
            "id=00600001 conn=open connipproto=TCP connrecvif=lan connrecvzone=trusted \
             connsrcip=10.0.0.5 connsrcport=54321 connsrcmac=aa:bb:cc:dd:ee:01 \
             conndestif=wan conndestzone=untrusted conndestip=8.8.8.8 conndestport=443 rule=AllowOut",
        );
        let RecordKind::Conn(conn) = classify(&kv).unwrap() else {
            panic!("expected CONN record");
        };
        assert_eq!(conn.action, ConnAction::Open);
        assert_eq!(conn.proto, "TCP");
        assert_eq!(conn.src_port, 54321);
        assert_eq!(conn.src_mac.as_deref(), Some("AA-BB-CC-DD-EE-01"));
        assert_eq!(conn.rule.as_deref(), Some("AllowOut"));
    }

    #[test]
    fn blocked_record_carries_zero_bytes() {
        let kv = parse_kv(
            "id=600011 conn=blocked connipproto=UDP connsrcip=10.0.0.1 connsrcport=5 \
             conndestip=1.1.1.1 conndestport=53 origsent=999 termsent=999",
        );
        let RecordKind::Conn(conn) = classify(&kv).unwrap() else {
            panic!("expected CONN record");
        };
        assert_eq!(conn.action, ConnAction::Blocked);
        assert!(conn.action.is_close_like());
        assert_eq!((conn.bytes_orig, conn.bytes_term), (0, 0));
    }

    #[test]
    fn incontrol_event_key_supplies_action() {
        let kv = parse_kv(
            "id=600004 event=conn_open_natsat connipproto=TCP connsrcip=10.0.0.2 \
             connsrcport=1 conndestip=9.9.9.9 conndestport=80",
        );
        let RecordKind::Conn(conn) = classify(&kv).unwrap() else {
            panic!("expected CONN record");
        };
        assert_eq!(conn.action, ConnAction::Open);
    }

    #[test]
    fn conn_without_tuple_is_malformed() {
        let kv = parse_kv("id=600001 conn=open connipproto=TCP");
        let err = classify(&kv).unwrap_err();
        assert_eq!(err.kind, ParseErrorKind::Malformed);
    }

    #[test]
    fn device_record_accepts_squashed_keys() {
        let kv = parse_kv(
            "id=08900001 srcmac=aa-bb-cc-dd-ee-02 deviceip4=10.0.0.7 devicevendor=Lenovo \
             devicetypename=Laptop deviceosname=Windows hostname=desk-07",
        );
        let RecordKind::Device(dev) = classify(&kv).unwrap() else {
            panic!("expected DEVICE record");
        };
        assert_eq!(dev.mac.as_deref(), Some("AA-BB-CC-DD-EE-02"));
        assert_eq!(dev.ip.as_deref(), Some("10.0.0.7"));
        assert_eq!(dev.vendor.as_deref(), Some("Lenovo"));
        assert_eq!(dev.hostname.as_deref(), Some("desk-07"));
    }

    #[test]
    fn other_numeric_id_is_other() {
        let kv = parse_kv("id=01800001 event=usage");
        assert!(matches!(classify(&kv).unwrap(), RecordKind::Other));
    }

    #[test]
    fn non_numeric_id_is_unsupported() {
        let kv = parse_kv("id=bogus event=usage");
        let err = classify(&kv).unwrap_err();
        assert_eq!(err.kind, ParseErrorKind::UnsupportedId);
    }
}
