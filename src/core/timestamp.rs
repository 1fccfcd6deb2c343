use std::fmt;

use time::macros::format_description;
use time::{OffsetDateTime, PrimitiveDateTime, UtcOffset};

use crate::platform;

/// Timestamp flavour a consumer wants in its records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TimeFormat {
    #[default]
    Utc,
    Local,
    Epoch,
}

impl TimeFormat {
    pub const fn as_str(self) -> &'static str {
        match self {
            TimeFormat::Utc => "utc",
            TimeFormat::Local => "local",
            TimeFormat::Epoch => "epoch",
        }
    }

    /// Anything other than `local` or `epoch` means UTC.
    pub fn from_config(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "local" => TimeFormat::Local,
            "epoch" => TimeFormat::Epoch,
            _ => TimeFormat::Utc,
        }
    }

    pub fn render(self, ts: OffsetDateTime) -> String {
        match self {
            TimeFormat::Utc => format_utc(ts),
            TimeFormat::Local => format_local(ts),
            TimeFormat::Epoch => format_epoch(ts),
        }
    }
}

impl serde::Serialize for TimeFormat {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl fmt::Display for TimeFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `2010-07-25T05:18:14Z`
pub fn format_utc(ts: OffsetDateTime) -> String {
    ts.to_offset(UtcOffset::UTC)
        .format(format_description!(
            "[year]-[month]-[day]T[hour]:[minute]:[second]Z"
        ))
        .unwrap_or_else(|_| ts.unix_timestamp().to_string())
}

/// `2010-07-25 00:18:14 CDT`; falls back to a `UTC` suffix when the zone cannot be resolved.
pub fn format_local(ts: OffsetDateTime) -> String {
    if let Some(s) = platform::local_time_string(ts.unix_timestamp()) {
        return s;
    }
    ts.to_offset(UtcOffset::UTC)
        .format(format_description!(
            "[year]-[month]-[day] [hour]:[minute]:[second] UTC"
        ))
        .unwrap_or_else(|_| ts.unix_timestamp().to_string())
}

pub fn format_epoch(ts: OffsetDateTime) -> String {
    ts.unix_timestamp().to_string()
}

pub fn parse_utc(s: &str) -> Result<OffsetDateTime, time::error::Parse> {
    PrimitiveDateTime::parse(
        s.trim(),
        format_description!("[year]-[month]-[day]T[hour]:[minute]:[second]Z"),
    )
    .map(PrimitiveDateTime::assume_utc)
}

/// Accepts the UTC ISO8601 form or a bare epoch integer.
pub fn parse_record_timestamp(s: &str) -> Option<OffsetDateTime> {
    let s = s.trim();
    if let Ok(ts) = parse_utc(s) {
        return Some(ts);
    }
    let secs = s.parse::<i64>().ok()?;
    OffsetDateTime::from_unix_timestamp(secs).ok()
}
