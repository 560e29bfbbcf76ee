use regex::Regex;
use std::sync::OnceLock;
use time::{Date, Month, PrimitiveDateTime, Time};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    /// `/var/log/auth.log`: `Feb  5 13:04:01 host sshd[1234]: <msg>`
    Debian,
    /// `/var/log/secure`: same shape as Debian.
    Rhel,
    /// `/var/adm/syslog`, a slightly different process field, no PID brackets required.
    Aix,
}

pub struct ParsedLine {
    pub month: u8,
    pub day: u8,
    pub hour: u8,
    pub minute: u8,
    pub second: u8,
    pub message: String,
}

impl ParsedLine {
    pub fn to_unix_time(&self, year: i32) -> Option<i64> {
        let month = Month::try_from(self.month).ok()?;
        let date = Date::from_calendar_date(year, month, self.day).ok()?;
        let time = Time::from_hms(self.hour, self.minute, self.second).ok()?;
        Some(PrimitiveDateTime::new(date, time).assume_utc().unix_timestamp())
    }
}

fn month_from_name(name: &str) -> Option<u8> {
    Some(match name {
        "Jan" => 1,
        "Feb" => 2,
        "Mar" => 3,
        "Apr" => 4,
        "May" => 5,
        "Jun" => 6,
        "Jul" => 7,
        "Aug" => 8,
        "Sep" => 9,
        "Oct" => 10,
        "Nov" => 11,
        "Dec" => 12,
        _ => return None,
    })
}

fn debian_rhel_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"^(?P<mon>[A-Z][a-z]{2})\s+(?P<day>\d{1,2})\s+(?P<hour>\d{2}):(?P<min>\d{2}):(?P<sec>\d{2})\s+\S+\s+sshd(?:\[\d+\])?:\s*(?P<msg>.*)$",
        )
        .expect("valid regex")
    })
}

fn aix_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"^(?P<mon>[A-Z][a-z]{2})\s+(?P<day>\d{1,2})\s+(?P<hour>\d{2}):(?P<min>\d{2}):(?P<sec>\d{2})\s+\S+\s+sshd:\s*(?P<msg>.*)$",
        )
        .expect("valid regex")
    })
}

pub fn parse_syslog_line(line: &str, dialect: Dialect) -> Option<ParsedLine> {
    let re = match dialect {
        Dialect::Debian | Dialect::Rhel => debian_rhel_regex(),
        Dialect::Aix => aix_regex(),
    };

    let caps = re.captures(line)?;
    let month = month_from_name(&caps["mon"])?;
    let day: u8 = caps["day"].trim().parse().ok()?;
    let hour: u8 = caps["hour"].parse().ok()?;
    let minute: u8 = caps["min"].parse().ok()?;
    let second: u8 = caps["sec"].parse().ok()?;

    Some(ParsedLine {
        month,
        day,
        hour,
        minute,
        second,
        message: caps["msg"].to_owned(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_debian_line() {
        let line = "Feb  5 13:04:01 host sshd[1234]: Accepted publickey for alice from 10.0.0.1 port 1 ssh2";
        let parsed = parse_syslog_line(line, Dialect::Debian).expect("should parse");
        assert_eq!(parsed.month, 2);
        assert_eq!(parsed.day, 5);
        assert_eq!(parsed.hour, 13);
    }

    #[test]
    fn parses_aix_line_without_pid() {
        let line = "Mar 10 00:00:00 host sshd: Accepted password for bob from 10.0.0.2 port 1 ssh2";
        let parsed = parse_syslog_line(line, Dialect::Aix).expect("should parse");
        assert_eq!(parsed.month, 3);
        assert_eq!(parsed.message, "Accepted password for bob from 10.0.0.2 port 1 ssh2");
    }

    #[test]
    fn rejects_non_sshd_lines() {
        assert!(parse_syslog_line("Feb  5 13:04:01 host kernel: something", Dialect::Debian).is_none());
    }
}
