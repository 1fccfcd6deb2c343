use std::fmt::Write as _;

use time::OffsetDateTime;

use crate::core::{Status, TimeFormat};

/// Literal line that terminates every serialized record.
pub const END_MARKER: &str = "EOT";

/// Who produced a result and what it is about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordIdentity {
    pub metric_name: String,
    pub metric_type: String,
    pub service_type: String,
    pub service_uri: String,
    pub gathered_at: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanonicalResult {
    pub identity: RecordIdentity,
    pub status: Status,
    pub summary: String,
    pub detail: String,
    pub timestamp: OffsetDateTime,
}

impl CanonicalResult {
    pub fn new(
        identity: RecordIdentity,
        status: Status,
        summary: impl Into<String>,
        detail: impl Into<String>,
        timestamp: OffsetDateTime,
    ) -> Self {
        let mut summary = summary.into();
        let detail = detail.into();
        if summary.trim().is_empty() && detail.trim().is_empty() {
            summary = status.to_string();
        }
        Self {
            identity,
            status,
            summary,
            detail,
            timestamp,
        }
    }

    /// A result in the brief style: the summary is the status keyword itself.
    pub fn brief(
        identity: RecordIdentity,
        status: Status,
        detail: impl Into<String>,
        timestamp: OffsetDateTime,
    ) -> Self {
        Self::new(identity, status, status.as_str(), detail, timestamp)
    }

    pub fn metric_name(&self) -> &str {
        &self.identity.metric_name
    }

    /// Truncates the detail to at most `limit` bytes; 0 means unlimited.
    pub fn trim_detail(&mut self, limit: usize) {
        if limit == 0 || self.detail.len() <= limit {
            return;
        }
        let cut = truncate_bytes(&self.detail, limit).len();
        self.detail.truncate(cut);
    }

    /// Serializes the record in the WLCG key/value form, ending with the `EOT` line.
    pub fn render(&self, format: TimeFormat) -> String {
        let id = &self.identity;
        let mut out = String::new();
        let _ = writeln!(out, "metricName: {}", id.metric_name);
        let _ = writeln!(out, "metricType: {}", id.metric_type);
        let _ = writeln!(out, "timestamp: {}", format.render(self.timestamp));
        let _ = writeln!(out, "metricStatus: {}", self.status);
        let _ = writeln!(out, "serviceType: {}", id.service_type);
        let _ = writeln!(out, "serviceURI: {}", id.service_uri);
        let _ = writeln!(out, "gatheredAt: {}", id.gathered_at);
        let _ = writeln!(out, "summaryData: {}", self.summary);
        let _ = writeln!(out, "detailsData: {}", self.detail);
        out.push_str(END_MARKER);
        out.push('\n');
        out
    }
}

/// Longest prefix of `s` that fits in `max_bytes` without splitting a character.
pub fn truncate_bytes(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    let mut idx = max_bytes;
    while idx > 0 && !s.is_char_boundary(idx) {
        idx -= 1;
    }
    &s[..idx]
}
