use std::collections::HashMap;

pub type KvMap = HashMap<String, String>;

/// Scan `key=value` pairs out of a record body. Values may be quoted
/// (`key="value with spaces"`) or bare tokens; keys are `[A-Za-z0-9_]+`.
/// Structured-data brackets are transparent: pairs inside `[...]` blocks are
/// collected the same as bare pairs, last write wins.
pub fn parse_kv(input: &str) -> KvMap {
    let mut out = KvMap::new();
    let bytes = input.as_bytes();
    let mut i = 0;

    while i < bytes.len() {
        // Find a key candidate: word characters followed by '='.
        if !is_word_byte(bytes[i]) {
            i += 1;
            continue;
        }
        let key_start = i;
        while i < bytes.len() && is_word_byte(bytes[i]) {
            i += 1;
        }
        if i >= bytes.len() || bytes[i] != b'=' {
            continue;
        }
        let key = &input[key_start..i];
        i += 1; // consume '='

        let value = if i < bytes.len() && bytes[i] == b'"' {
            i += 1;
            let val_start = i;
            while i < bytes.len() && bytes[i] != b'"' {
                i += 1;
            }
            let val = &input[val_start..i];
            if i < bytes.len() {
                i += 1; // closing quote
            }
            val
        } else {
            let val_start = i;
            while i < bytes.len() && !bytes[i].is_ascii_whitespace() && bytes[i] != b']' {
                i += 1;
            }
            &input[val_start..i]
        };

        out.insert(key.to_string(), value.to_string());
    }

    out
}

fn is_word_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_'
}

/// Parse leading digits of a value as an integer, ignoring trailing junk.
pub fn coerce_int(value: &str) -> Option<i64> {
    let digits: String = value.chars().take_while(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        None
    } else {
        digits.parse().ok()
    }
}

/// First non-empty value among the given keys. NetWall firmware versions
/// disagree on underscores (`device_ip4` vs `deviceip4`), so callers list
/// both spellings.
pub fn get_any<'a>(kv: &'a KvMap, keys: &[&str]) -> Option<&'a str> {
    keys.iter()
        .filter_map(|key| kv.get(*key))
        .map(String::as_str)
        .find(|v| !v.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bare_and_quoted_values() {
        let kv = parse_kv(r#"conn=open rule="Allow HTTP out" connsrcip=10.0.0.5"#);
        assert_eq!(kv.get("conn").map(String::as_str), Some("open"));
        assert_eq!(kv.get("rule").map(String::as_str), Some("Allow HTTP out"));
        assert_eq!(kv.get("connsrcip").map(String::as_str), Some("10.0.0.5"));
    }

    #[test]
    fn pairs_inside_brackets_are_collected() {
        let kv = parse_kv(r#"id=600004 event=conn_open [message=x [connsrcip=1.2.3.4 connsrcport=1024]]"#);
        assert_eq!(kv.get("connsrcip").map(String::as_str), Some("1.2.3.4"));
        assert_eq!(kv.get("connsrcport").map(String::as_str), Some("1024"));
        assert_eq!(kv.get("id").map(String::as_str), Some("600004"));
    }

    #[test]
    fn last_write_wins_on_duplicate_keys() {
        let kv = parse_kv("a=1 a=2");
        assert_eq!(kv.get("a").map(String::as_str), Some("2"));
    }

    #[test]
    fn coerce_int_ignores_trailing_junk() {
        assert_eq!(coerce_int("1024"), Some(1024));
        assert_eq!(coerce_int("1024ms"), Some(1024));
        assert_eq!(coerce_int("abc"), None);
        assert_eq!(coerce_int(""), None);
    }

    #[test]
    fn get_any_tries_alternate_spellings() {
        let kv = parse_kv("deviceip4=10.0.0.9");
        assert_eq!(get_any(&kv, &["device_ip4", "deviceip4"]), Some("10.0.0.9"));
        assert_eq!(get_any(&kv, &["missing"]), None);
    }
}
