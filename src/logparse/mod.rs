use time::OffsetDateTime;

use crate::models::{AuthMethod, EventType};

mod journald;
mod syslog;

pub use journald::parse_journald_line;
pub use syslog::{parse_syslog_line, Dialect};

#[derive(Debug, Clone)]
pub enum ParseError {
    /// The whole input couldn't be processed at all (e.g. non-utf8 journald blob).
    Unrecoverable(String),
}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unrecoverable(msg) => write!(f, "unrecoverable parse error: {msg}"),
        }
    }
}

impl std::error::Error for ParseError {}

/// A normalised sshd event, prior to correlation with the key inventory.
#[derive(Debug, Clone, PartialEq)]
pub struct LogEvent {
    pub event_time: i64,
    pub event_type: EventType,
    pub auth_method: AuthMethod,
    pub username: String,
    pub source_ip: String,
    pub fingerprint: Option<String>,
    pub raw_log_line: String,
}

/// Result of normalising one log's worth of lines.
#[derive(Debug, Default)]
pub struct ParseOutcome {
    pub events: Vec<LogEvent>,
    pub malformed_lines: usize,
}

/// Parses syslog text for one of the three dialects, applying year
/// rollover and watermark filtering. `reference_time` seeds the year;
/// `watermark` (if given) discards events at or before it.
pub fn parse_syslog(
    text: &str,
    dialect: Dialect,
    reference_time: OffsetDateTime,
    watermark: Option<i64>,
) -> ParseOutcome {
    let mut outcome = ParseOutcome::default();
    let mut year = reference_time.year();
    let mut prev_ordinal: Option<(u8, u8)> = None;

    for line in text.lines() {
        let Some(parsed) = parse_syslog_line(line, dialect) else {
            outcome.malformed_lines += 1;
            continue;
        };

        let (month, day) = (parsed.month, parsed.day);
        if let Some((prev_month, prev_day)) = prev_ordinal {
            let prev_day_of_year = day_of_year(year, prev_month, prev_day);
            let cur_day_of_year = day_of_year(year, month, day);
            if prev_day_of_year as i32 - cur_day_of_year as i32 > 300 {
                year += 1;
            }
        }
        prev_ordinal = Some((month, day));

        let Some(event_time) = parsed.to_unix_time(year) else {
            outcome.malformed_lines += 1;
            continue;
        };

        let Some(event) = body_to_event(&parsed.message, event_time, line) else {
            continue;
        };

        if watermark.is_some_and(|wm| event.event_time <= wm) {
            continue;
        }

        outcome.events.push(event);
    }

    outcome
}

/// Parses `journalctl --output=json` lines. Bypasses year-rollover
/// entirely: `__REALTIME_TIMESTAMP` is an absolute epoch in microseconds.
pub fn parse_journald(text: &str, watermark: Option<i64>) -> ParseOutcome {
    let mut outcome = ParseOutcome::default();

    for line in text.lines() {
        if line.trim().is_empty() {
            continue;
        }
        let Some((event_time, message)) = parse_journald_line(line) else {
            outcome.malformed_lines += 1;
            continue;
        };

        let Some(event) = body_to_event(&message, event_time, line) else {
            continue;
        };

        if watermark.is_some_and(|wm| event.event_time <= wm) {
            continue;
        }

        outcome.events.push(event);
    }

    outcome
}

fn day_of_year(year: i32, month: u8, day: u8) -> u16 {
    use time::{Date, Month};
    let month = Month::try_from(month).unwrap_or(Month::January);
    Date::from_calendar_date(year, month, day.max(1))
        .map(|d| d.ordinal())
        .unwrap_or(0)
}

/// Extracts an sshd event kind from a message body. Returns `None` for
/// message shapes we don't track (e.g. `sudo:` lines, which go to a
/// separate sink not modelled by this core).
fn body_to_event(message: &str, event_time: i64, raw_log_line: &str) -> Option<LogEvent> {
    let message = message.trim();

    if let Some(rest) = message.strip_prefix("Accepted publickey for ") {
        let (username, rest) = rest.split_once(" from ")?;
        let (ip, rest) = rest.split_once(" port ")?;
        let fingerprint = rest.split(':').next_back().map(|s| s.trim().to_owned());
        return Some(LogEvent {
            event_time,
            event_type: EventType::Accepted,
            auth_method: AuthMethod::Publickey,
            username: username.to_owned(),
            source_ip: ip.to_owned(),
            fingerprint,
            raw_log_line: raw_log_line.to_owned(),
        });
    }

    if let Some(rest) = message.strip_prefix("Accepted password for ") {
        let (username, rest) = rest.split_once(" from ")?;
        let ip = rest.split_whitespace().next()?;
        return Some(LogEvent {
            event_time,
            event_type: EventType::Accepted,
            auth_method: AuthMethod::Password,
            username: username.to_owned(),
            source_ip: ip.to_owned(),
            fingerprint: None,
            raw_log_line: raw_log_line.to_owned(),
        });
    }

    if let Some(rest) = message.strip_prefix("Failed publickey for ") {
        let (username, rest) = rest.split_once(" from ")?;
        let ip = rest.split_whitespace().next()?;
        return Some(LogEvent {
            event_time,
            event_type: EventType::Failed,
            auth_method: AuthMethod::Publickey,
            username: username.to_owned(),
            source_ip: ip.to_owned(),
            fingerprint: None,
            raw_log_line: raw_log_line.to_owned(),
        });
    }

    if let Some(rest) = message.strip_prefix("Failed password for ") {
        let rest = rest.strip_prefix("invalid user ").unwrap_or(rest);
        let (username, rest) = rest.split_once(" from ")?;
        let ip = rest.split_whitespace().next()?;
        return Some(LogEvent {
            event_time,
            event_type: EventType::Failed,
            auth_method: AuthMethod::Password,
            username: username.to_owned(),
            source_ip: ip.to_owned(),
            fingerprint: None,
            raw_log_line: raw_log_line.to_owned(),
        });
    }

    if let Some(rest) = message.strip_prefix("Disconnected from user ") {
        let (username, rest) = rest.split_once(' ')?;
        let ip = rest.split_whitespace().next()?;
        return Some(LogEvent {
            event_time,
            event_type: EventType::Disconnect,
            auth_method: AuthMethod::Other,
            username: username.to_owned(),
            source_ip: ip.to_owned(),
            fingerprint: None,
            raw_log_line: raw_log_line.to_owned(),
        });
    }

    if let Some(rest) = message.strip_prefix("Received disconnect from ") {
        let ip = rest.split_whitespace().next()?;
        return Some(LogEvent {
            event_time,
            event_type: EventType::Disconnect,
            auth_method: AuthMethod::Other,
            username: String::new(),
            source_ip: ip.to_owned(),
            fingerprint: None,
            raw_log_line: raw_log_line.to_owned(),
        });
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn parses_accepted_publickey() {
        let line = "Feb  5 13:04:01 host sshd[1234]: Accepted publickey for alice from 10.0.0.5 port 51000 ssh2: ED25519 SHA256:abc123";
        let outcome = parse_syslog(line, Dialect::Debian, datetime!(2024-02-05 0:00 UTC), None);
        assert_eq!(outcome.malformed_lines, 0);
        assert_eq!(outcome.events.len(), 1);
        let event = &outcome.events[0];
        assert_eq!(event.username, "alice");
        assert_eq!(event.source_ip, "10.0.0.5");
        assert_eq!(event.event_type, EventType::Accepted);
        assert_eq!(event.auth_method, AuthMethod::Publickey);
        assert_eq!(event.fingerprint.as_deref(), Some("SHA256:abc123"));
    }

    #[test]
    fn year_rolls_over_backwards_past_300_days() {
        let text = "Dec 30 23:00:00 host sshd[1]: Accepted password for bob from 1.2.3.4 port 1 ssh2\n\
                    Jan  2 00:00:00 host sshd[1]: Accepted password for bob from 1.2.3.4 port 1 ssh2";
        let outcome = parse_syslog(text, Dialect::Debian, datetime!(2024-12-30 0:00 UTC), None);
        assert_eq!(outcome.events.len(), 2);
        assert!(outcome.events[1].event_time > outcome.events[0].event_time);
    }

    #[test]
    fn watermark_drops_old_events() {
        let line = "Feb  5 13:04:01 host sshd[1234]: Accepted password for alice from 10.0.0.5 port 1 ssh2";
        let outcome = parse_syslog(line, Dialect::Debian, datetime!(2024-02-05 0:00 UTC), Some(i64::MAX));
        assert!(outcome.events.is_empty());
    }

    #[test]
    fn malformed_lines_are_counted_not_fatal() {
        let text = "this is not a syslog line\nneither is this";
        let outcome = parse_syslog(text, Dialect::Debian, datetime!(2024-01-01 0:00 UTC), None);
        assert_eq!(outcome.malformed_lines, 2);
        assert!(outcome.events.is_empty());
    }
}
