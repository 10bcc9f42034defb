//! Syslog line parsing: header grammars, key=value fields and typed records.

mod kv;
mod record;
mod syslog;

pub use kv::{parse_kv, KvMap};
pub use record::{ConnAction, ConnRecord, DeviceRecord, ParsedRecord, RecordKind};
pub use syslog::{parse_line, ParseError, ParseErrorKind};

/// Accumulates wrapped syslog lines into complete records.
///
/// A line that does not match any recognised record prefix is a continuation
/// of the previous record and is appended with a single space. Continuations
/// arriving before any record start are dropped.
#[derive(Debug, Default)]
pub struct LineAssembler {
    current: Option<String>,
}

impl LineAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one line; returns any record completed by this line.
    pub fn feed(&mut self, line: &str) -> Option<String> {
        let trimmed = line.trim_end_matches(['\r', '\n']);
        if trimmed.trim().is_empty() {
            return None;
        }
        if syslog::is_record_start(trimmed) {
            let finished = self.current.take();
            self.current = Some(trimmed.trim().to_string());
            finished
        } else {
            if let Some(current) = self.current.as_mut() {
                current.push(' ');
                current.push_str(trimmed.trim());
            } else {
                tracing::debug!(line = trimmed, "dropping continuation without record start");
            }
            None
        }
    }

    /// Flush the record under assembly, if any.
    pub fn flush(&mut self) -> Option<String> {
        self.current.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LINE_A: &str = "<134>Feb 10 17:37:13 fw1 EFW: CONN: id=00600001 conn=open";
    const LINE_B: &str = "<134>Feb 10 17:37:14 fw1 EFW: CONN: id=00600002 conn=close";

    #[test]
    fn completed_record_is_emitted_when_next_starts() {
        let mut assembler = LineAssembler::new();
        assert!(assembler.feed(LINE_A).is_none());
        let done = assembler.feed(LINE_B).expect("first record completes");
        assert!(done.contains("id=00600001"));
        assert_eq!(assembler.flush().as_deref(), Some(LINE_B.trim()));
    }

    #[test]
    fn continuation_lines_are_joined() {
        let mut assembler = LineAssembler::new();
        assembler.feed(LINE_A);
        assembler.feed("  origsent=100 termsent=200");
        let record = assembler.flush().unwrap();
        assert!(record.ends_with("conn=open origsent=100 termsent=200"));
    }

    #[test]
    fn orphan_continuation_is_dropped() {
        let mut assembler = LineAssembler::new();
        assert!(assembler.feed("dangling tail with no header").is_none());
        assert!(assembler.flush().is_none());
    }
}
