use serde::Deserialize;

#[derive(Deserialize)]
struct JournaldRecord {
    #[serde(rename = "__REALTIME_TIMESTAMP")]
    realtime_timestamp: String,
    #[serde(rename = "MESSAGE")]
    message: String,
    #[serde(rename = "SYSLOG_IDENTIFIER", default)]
    syslog_identifier: Option<String>,
}

/// Parses one `journalctl --output=json` line into `(event_time, message)`.
/// Skips non-sshd records by returning `None`, the same as a malformed line
/// for the caller's purposes.
pub fn parse_journald_line(line: &str) -> Option<(i64, String)> {
    let record: JournaldRecord = serde_json::from_str(line).ok()?;

    if let Some(ident) = &record.syslog_identifier {
        if ident != "sshd" {
            return None;
        }
    }

    let micros: i64 = record.realtime_timestamp.parse().ok()?;
    Some((micros / 1_000_000, record.message))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_sshd_record() {
        let line = r#"{"__REALTIME_TIMESTAMP":"1700000000000000","MESSAGE":"Accepted publickey for alice from 10.0.0.1 port 1 ssh2: ED25519 SHA256:abc","SYSLOG_IDENTIFIER":"sshd"}"#;
        let (time, message) = parse_journald_line(line).expect("should parse");
        assert_eq!(time, 1_700_000_000);
        assert!(message.starts_with("Accepted publickey"));
    }

    #[test]
    fn skips_non_sshd_identifier() {
        let line = r#"{"__REALTIME_TIMESTAMP":"1700000000000000","MESSAGE":"irrelevant","SYSLOG_IDENTIFIER":"cron"}"#;
        assert!(parse_journald_line(line).is_none());
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse_journald_line("not json").is_none());
    }
}
