use super::kv::parse_kv;
use super::record::{classify, ParsedRecord};
use crate::cli::YearMode;
use chrono::{DateTime, Duration, Datelike, NaiveDate, NaiveTime, TimeZone, Utc};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseErrorKind {
    Malformed,
    UnsupportedId,
    BadTimestamp,
}

#[derive(Debug, Clone)]
pub struct ParseError {
    pub kind: ParseErrorKind,
    pub message: String,
}

impl ParseError {
    pub fn new(kind: ParseErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn kind_str(&self) -> &'static str {
        match self.kind {
            ParseErrorKind::Malformed => "malformed",
            ParseErrorKind::UnsupportedId => "unsupported_id",
            ParseErrorKind::BadTimestamp => "bad_timestamp",
        }
    }
}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind_str(), self.message)
    }
}

const MONTHS: &[&str] = &[
    "Jan", "Feb", "Mar", "Apr", "May", "Jun", "Jul", "Aug", "Sep", "Oct", "Nov", "Dec",
];

/// Parse one complete syslog record into a typed record.
///
/// `now` anchors year inference for BSD timestamps that lack a year.
pub fn parse_line(
    line: &str,
    year_mode: YearMode,
    now: DateTime<Utc>,
) -> Result<ParsedRecord, ParseError> {
    let rest = strip_priority(line.trim());

    let (received_at, device_hint, body) = if let Some(parsed) = parse_rfc5424_header(rest)? {
        parsed
    } else if let Some(parsed) = parse_bracket_header(rest)? {
        parsed
    } else if let Some(parsed) = parse_bsd_header(rest, year_mode, now)? {
        parsed
    } else {
        return Err(ParseError::new(
            ParseErrorKind::Malformed,
            "unrecognised syslog header",
        ));
    };

    let kv = parse_kv(body);
    let kind = classify(&kv)?;

    Ok(ParsedRecord {
        device_hint,
        received_at,
        kind,
    })
}

/// Cheap prefix check used by the line assembler to spot record starts.
pub fn is_record_start(line: &str) -> bool {
    let rest = strip_priority(line.trim_start());
    if rest.starts_with("1 ") || rest.starts_with('[') {
        return true;
    }
    bsd_month(rest).is_some()
}

fn strip_priority(line: &str) -> &str {
    let Some(stripped) = line.strip_prefix('<') else {
        return line;
    };
    match stripped.find('>') {
        Some(pos) if stripped[..pos].chars().all(|c| c.is_ascii_digit()) && pos > 0 => {
            stripped[pos + 1..].trim_start()
        }
        _ => line,
    }
}

type Header<'a> = (DateTime<Utc>, String, &'a str);

/// `1 TIMESTAMP HOSTNAME rest` (RFC 5424, version 1).
fn parse_rfc5424_header(rest: &str) -> Result<Option<Header<'_>>, ParseError> {
    let Some(after_version) = rest.strip_prefix("1 ") else {
        return Ok(None);
    };
    let mut parts = after_version.splitn(3, ' ');
    let ts_str = parts.next().unwrap_or("");
    let host = parts.next().unwrap_or("").trim();
    let body = parts.next().unwrap_or("");

    let ts = DateTime::parse_from_rfc3339(ts_str)
        .map_err(|_| {
            ParseError::new(
                ParseErrorKind::BadTimestamp,
                format!("invalid RFC 5424 timestamp '{ts_str}'"),
            )
        })?
        .with_timezone(&Utc);

    let host = if host.is_empty() || host == "-" {
        "unknown".to_string()
    } else {
        host.to_string()
    };
    Ok(Some((ts, host, body)))
}

/// `[YYYY-MM-DD HH:MM:SS] EFW: TYPE: rest` (device relay format, no hostname).
fn parse_bracket_header(rest: &str) -> Result<Option<Header<'_>>, ParseError> {
    if !rest.starts_with('[') {
        return Ok(None);
    }
    let Some(close) = rest.find(']') else {
        return Ok(None);
    };
    let inner = &rest[1..close];
    let ts = chrono::NaiveDateTime::parse_from_str(inner, "%Y-%m-%d %H:%M:%S").map_err(|_| {
        ParseError::new(
            ParseErrorKind::BadTimestamp,
            format!("invalid bracket timestamp '{inner}'"),
        )
    })?;
    let body = &rest[close + 1..];
    Ok(Some((
        Utc.from_utc_datetime(&ts),
        "unknown".to_string(),
        body,
    )))
}

fn bsd_month(rest: &str) -> Option<u32> {
    if rest.len() < 4 || rest.as_bytes().get(3) != Some(&b' ') {
        return None;
    }
    MONTHS
        .iter()
        .position(|m| rest.starts_with(m))
        .map(|i| (i + 1) as u32)
}

/// `MMM DD HH:MM:SS HOSTNAME [optional bracket] TAG: rest` (BSD).
fn parse_bsd_header<'a>(
    rest: &'a str,
    year_mode: YearMode,
    now: DateTime<Utc>,
) -> Result<Option<Header<'a>>, ParseError> {
    let Some(month) = bsd_month(rest) else {
        return Ok(None);
    };

    // BSD pads single-digit days with a second space, so split on runs of
    // whitespace while tracking where the body starts.
    let (tokens, tail) = take_tokens(rest, 4);
    let [_month_token, day_token, time_token, host_token] = tokens;
    let mut body = tail;

    let day: u32 = day_token.parse().map_err(|_| {
        ParseError::new(
            ParseErrorKind::BadTimestamp,
            format!("invalid BSD day '{day_token}'"),
        )
    })?;
    let time = NaiveTime::parse_from_str(time_token, "%H:%M:%S").map_err(|_| {
        ParseError::new(
            ParseErrorKind::BadTimestamp,
            format!("invalid BSD time '{time_token}'"),
        )
    })?;

    // Some relays insert a bracketed timestamp chunk between host and tag.
    let trimmed = body.trim_start();
    if trimmed.starts_with('[') {
        if let Some(close) = trimmed.find(']') {
            body = trimmed[close + 1..].trim_start();
        }
    }

    let ts = resolve_bsd_timestamp(month, day, time, year_mode, now)?;
    let host = if host_token.is_empty() {
        "unknown".to_string()
    } else {
        host_token.to_string()
    };
    Ok(Some((ts, host, body)))
}

/// Pull up to four whitespace-separated tokens off the front of `input`,
/// returning them with the untouched remainder.
fn take_tokens(input: &str, n: usize) -> ([&str; 4], &str) {
    debug_assert!(n <= 4);
    let mut tokens = [""; 4];
    let mut rest = input;
    for slot in tokens.iter_mut().take(n) {
        rest = rest.trim_start();
        let end = rest
            .find(char::is_whitespace)
            .unwrap_or(rest.len());
        *slot = &rest[..end];
        rest = &rest[end..];
    }
    (tokens, rest.trim_start())
}

/// Choose a year for a year-less BSD timestamp so the instant lands at or
/// before `now` and no more than six months in the past; prefer the current
/// year when both fit.
fn resolve_bsd_timestamp(
    month: u32,
    day: u32,
    time: NaiveTime,
    year_mode: YearMode,
    now: DateTime<Utc>,
) -> Result<DateTime<Utc>, ParseError> {
    let build = |year: i32| -> Option<DateTime<Utc>> {
        NaiveDate::from_ymd_opt(year, month, day)
            .map(|date| Utc.from_utc_datetime(&date.and_time(time)))
    };

    let current = build(now.year());
    let previous = build(now.year() - 1);

    let chosen = match year_mode {
        YearMode::Current => current.or(previous),
        YearMode::Previous => previous.or(current),
        YearMode::Auto => {
            let floor = now - Duration::days(183);
            let fits = |ts: &DateTime<Utc>| *ts <= now && *ts > floor;
            match (current, previous) {
                (Some(c), _) if fits(&c) => Some(c),
                (_, Some(p)) if fits(&p) => Some(p),
                // Neither year satisfies the window; keep the current-year
                // reading rather than rejecting the record.
                (c, p) => c.or(p),
            }
        }
    };

    chosen.ok_or_else(|| {
        ParseError::new(
            ParseErrorKind::BadTimestamp,
            format!("invalid calendar date month={month} day={day}"),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parse::record::RecordKind;

    fn at(y: i32, mo: u32, d: u32, h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, 0, 0).unwrap()
    }

    #[test]
    fn parses_rfc5424_conn_line() {
        let line = "<1>1 2026-02-09T07:32:47Z fw-edge CONN : id=600004 event=conn_open \
                    [message=x [connipproto=TCP connsrcip=10.0.0.5 connsrcport=54321 \
                    conndestip=8.8.8.8 conndestport=443]]";
        let rec = parse_line(line, YearMode::Auto, at(2026, 2, 10, 0)).unwrap();
        assert_eq!(rec.device_hint, "fw-edge");
        assert_eq!(rec.received_at, at(2026, 2, 9, 7) + Duration::minutes(32) + Duration::seconds(47));
        assert!(matches!(rec.kind, RecordKind::Conn(_)));
    }

    #[test]
    fn parses_bsd_line_with_year_inference() {
        let line = "<134>Feb 10 17:37:13 fw1 EFW: CONN: id=00600001 conn=open \
                    connipproto=TCP connsrcip=10.0.0.5 connsrcport=1 conndestip=1.1.1.1 conndestport=80";
        let rec = parse_line(line, YearMode::Auto, at(2026, 3, 1, 0)).unwrap();
        assert_eq!(rec.received_at.year(), 2026);
        assert_eq!(rec.device_hint, "fw1");
    }

    #[test]
    fn bsd_single_digit_day_is_space_padded() {
        let line = "<134>Feb  1 03:04:05 fw1 EFW: CONN: id=00600001 conn=open \
                    connipproto=TCP connsrcip=10.0.0.5 connsrcport=1 conndestip=1.1.1.1 conndestport=80";
        let rec = parse_line(line, YearMode::Auto, at(2026, 2, 2, 0)).unwrap();
        assert_eq!(rec.received_at, at(2026, 2, 1, 3) + Duration::minutes(4) + Duration::seconds(5));
        assert_eq!(rec.device_hint, "fw1");
    }

    #[test]
    fn december_line_seen_in_january_lands_in_previous_year() {
        let line = "<134>Dec 30 01:00:00 fw1 EFW: CONN: id=00600001 conn=open \
                    connipproto=TCP connsrcip=10.0.0.5 connsrcport=1 conndestip=1.1.1.1 conndestport=80";
        let rec = parse_line(line, YearMode::Auto, at(2026, 1, 5, 0)).unwrap();
        assert_eq!(rec.received_at.year(), 2025);
    }

    #[test]
    fn forced_year_modes_override_the_window() {
        let line = "<134>Dec 30 01:00:00 fw1 EFW: CONN: id=00600001 conn=open \
                    connipproto=TCP connsrcip=10.0.0.5 connsrcport=1 conndestip=1.1.1.1 conndestport=80";
        let now = at(2026, 1, 5, 0);
        let current = parse_line(line, YearMode::Current, now).unwrap();
        assert_eq!(current.received_at.year(), 2026);
        let previous = parse_line(line, YearMode::Previous, now).unwrap();
        assert_eq!(previous.received_at.year(), 2025);
    }

    #[test]
    fn parses_bracket_relay_format() {
        let line = "<6>[2026-02-10 18:57:45] EFW: CONN: id=00600002 conn=close \
                    connipproto=TCP connsrcip=10.0.0.5 connsrcport=1 conndestip=1.1.1.1 conndestport=80 \
                    origsent=1000 termsent=2000";
        let rec = parse_line(line, YearMode::Auto, at(2026, 2, 11, 0)).unwrap();
        assert_eq!(rec.device_hint, "unknown");
        assert_eq!(rec.received_at, at(2026, 2, 10, 18) + Duration::minutes(57) + Duration::seconds(45));
    }

    #[test]
    fn bad_timestamp_is_reported_as_such() {
        let line = "<1>1 not-a-timestamp host APP : id=600001";
        let err = parse_line(line, YearMode::Auto, at(2026, 1, 1, 0)).unwrap_err();
        assert_eq!(err.kind, ParseErrorKind::BadTimestamp);
    }

    #[test]
    fn garbage_is_malformed() {
        let err = parse_line("completely unstructured", YearMode::Auto, at(2026, 1, 1, 0))
            .unwrap_err();
        assert_eq!(err.kind, ParseErrorKind::Malformed);
    }

    #[test]
    fn other_id_is_tagged_other() {
        let line = "<134>Feb 10 17:37:13 fw1 EFW: USAGE: id=01800001 usage=42";
        let rec = parse_line(line, YearMode::Auto, at(2026, 3, 1, 0)).unwrap();
        assert!(matches!(rec.kind, RecordKind::Other));
    }

    #[test]
    fn record_start_detection_covers_all_grammars() {
        assert!(is_record_start("<1>1 2026-02-09T07:32:47Z host APP : id=1"));
        assert!(is_record_start("<6>[2026-02-10 18:57:45] EFW: CONN:"));
        assert!(is_record_start("Feb 10 17:37:13 fw1 EFW: CONN:"));
        assert!(!is_record_start("  continuation data"));
    }
}
