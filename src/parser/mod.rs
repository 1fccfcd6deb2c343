//! Turns raw probe output into canonical results.
//!
//! Both formats are read line by line through a small state machine
//! (`Header` → `InDetail` → `Done`) so that each malformed transition gets its own error.

use thiserror::Error;
use time::OffsetDateTime;
use tracing::{debug, warn};

use crate::core::timestamp::parse_record_timestamp;
use crate::core::{CanonicalResult, END_MARKER, RecordIdentity, Status};
use crate::probe::OutputFormat;

pub const BRIEF_SENTINEL: &str = "RSV BRIEF RESULTS:";

/// Every way probe output can fail to match its declared format.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("output does not start with 'RSV BRIEF RESULTS:'")]
    MissingSentinel,
    #[error("brief output has no status line")]
    MissingStatus,
    #[error("invalid status '{0}' (expected OK|WARNING|CRITICAL|UNKNOWN)")]
    InvalidStatus(String),
    #[error("brief output has no detail")]
    EmptyDetail,
    #[error("record is missing required key '{0}'")]
    MissingKey(&'static str),
    #[error("record timestamp is not UTC ISO8601 or epoch: '{0}'")]
    InvalidTimestamp(String),
    #[error("expected 'key: value' in record header, got '{0}'")]
    MalformedLine(String),
    #[error("record ends before detailsData and has no EOT line")]
    MissingTerminator,
    #[error("unexpected content after EOT: '{0}'")]
    TrailingContent(String),
    #[error("output contains no records")]
    NoRecords,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Header,
    InDetail,
    Done,
}

/// Values a brief result cannot carry itself.
#[derive(Debug, Clone)]
pub struct ParseContext {
    pub identity: RecordIdentity,
    pub completed_at: OffsetDateTime,
}

pub fn parse(
    stdout: &str,
    format: OutputFormat,
    ctx: &ParseContext,
) -> Result<Vec<CanonicalResult>, ParseError> {
    match format {
        OutputFormat::Brief => parse_brief(stdout, ctx).map(|r| vec![r]),
        OutputFormat::SingleRecord => {
            parse_record(stdout, &ctx.identity.gathered_at).map(|r| vec![r])
        }
        OutputFormat::MultiRecord => parse_records(stdout, &ctx.identity.gathered_at),
    }
}

/// ```text
/// RSV BRIEF RESULTS:
/// <STATUS>
/// <detail...>
/// ```
pub fn parse_brief(stdout: &str, ctx: &ParseContext) -> Result<CanonicalResult, ParseError> {
    let mut lines = stdout.split('\n');

    match lines.next() {
        Some(first) if first.trim_end() == BRIEF_SENTINEL => {}
        _ => return Err(ParseError::MissingSentinel),
    }

    let status = match lines.next().map(str::trim) {
        None | Some("") => return Err(ParseError::MissingStatus),
        Some(s) => s
            .parse::<Status>()
            .map_err(|_| ParseError::InvalidStatus(s.to_string()))?,
    };

    let detail = lines.collect::<Vec<_>>().join("\n");
    let detail = detail.trim_end_matches(['\n', '\r']);
    if detail.trim().is_empty() {
        return Err(ParseError::EmptyDetail);
    }

    Ok(CanonicalResult::brief(
        ctx.identity.clone(),
        status,
        detail,
        ctx.completed_at,
    ))
}

#[derive(Default)]
struct RecordFields {
    name: Option<String>,
    metric_type: Option<String>,
    timestamp: Option<String>,
    status: Option<String>,
    service_type: Option<String>,
    service_uri: Option<String>,
    gathered_at: Option<String>,
    summary: Option<String>,
    detail: Option<Vec<String>>,
}

/// Parses one `key: value` record terminated by `EOT`. A record whose detail section was
/// opened but never terminated is accepted as if `EOT` followed.
pub fn parse_record(text: &str, gathered_at: &str) -> Result<CanonicalResult, ParseError> {
    let mut state = State::Header;
    let mut f = RecordFields::default();

    for line in text.lines() {
        match state {
            State::Header => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                if trimmed == END_MARKER {
                    state = State::Done;
                    continue;
                }
                let Some((key, value)) = line.split_once(':') else {
                    return Err(ParseError::MalformedLine(line.to_string()));
                };
                let value = value.trim().to_string();
                match key.trim() {
                    "metricName" => f.name = Some(value),
                    "metricType" => f.metric_type = Some(value),
                    "timestamp" => f.timestamp = Some(value),
                    "metricStatus" => f.status = Some(value),
                    "serviceType" => f.service_type = Some(value),
                    "serviceURI" => f.service_uri = Some(value),
                    "gatheredAt" => f.gathered_at = Some(value),
                    "summaryData" => f.summary = Some(value),
                    "detailsData" => {
                        f.detail = Some(vec![value]);
                        state = State::InDetail;
                    }
                    other => debug!(key = other, "ignoring unknown record key"),
                }
            }
            State::InDetail => {
                if line.trim_end() == END_MARKER {
                    state = State::Done;
                } else if let Some(detail) = f.detail.as_mut() {
                    detail.push(line.to_string());
                }
            }
            State::Done => {
                if !line.trim().is_empty() {
                    return Err(ParseError::TrailingContent(line.to_string()));
                }
            }
        }
    }

    match state {
        State::Done => {}
        State::InDetail => warn!("record is missing its EOT line, appending one"),
        State::Header => return Err(ParseError::MissingTerminator),
    }

    let name = f.name.ok_or(ParseError::MissingKey("metricName"))?;
    let metric_type = f.metric_type.ok_or(ParseError::MissingKey("metricType"))?;
    let raw_ts = f.timestamp.ok_or(ParseError::MissingKey("timestamp"))?;
    let raw_status = f.status.ok_or(ParseError::MissingKey("metricStatus"))?;
    let service_type = f.service_type.ok_or(ParseError::MissingKey("serviceType"))?;
    let service_uri = f.service_uri.ok_or(ParseError::MissingKey("serviceURI"))?;
    let summary = f.summary.ok_or(ParseError::MissingKey("summaryData"))?;
    let detail = f.detail.ok_or(ParseError::MissingKey("detailsData"))?;

    let status = raw_status
        .parse::<Status>()
        .map_err(|_| ParseError::InvalidStatus(raw_status.clone()))?;
    let timestamp =
        parse_record_timestamp(&raw_ts).ok_or_else(|| ParseError::InvalidTimestamp(raw_ts.clone()))?;

    let detail = detail.join("\n");
    let identity = RecordIdentity {
        metric_name: name,
        metric_type,
        service_type,
        service_uri,
        gathered_at: f
            .gathered_at
            .filter(|g| !g.is_empty())
            .unwrap_or_else(|| gathered_at.to_string()),
    };
    Ok(CanonicalResult::new(
        identity,
        status,
        summary,
        detail.trim_end_matches(['\n', '\r']),
        timestamp,
    ))
}

/// Splits on `EOT` lines and parses each non-blank block. Broken blocks are skipped with a
/// warning; output without a single valid block is an error.
pub fn parse_records(stdout: &str, gathered_at: &str) -> Result<Vec<CanonicalResult>, ParseError> {
    let mut blocks: Vec<String> = Vec::new();
    let mut current = String::new();
    for line in stdout.lines() {
        current.push_str(line);
        current.push('\n');
        if line.trim() == END_MARKER {
            blocks.push(std::mem::take(&mut current));
        }
    }
    if !current.trim().is_empty() {
        blocks.push(current);
    }

    let mut records = Vec::new();
    let mut first_error = None;
    let total = blocks.iter().filter(|b| !b.trim().is_empty()).count();
    for (idx, block) in blocks.iter().filter(|b| !b.trim().is_empty()).enumerate() {
        match parse_record(block, gathered_at) {
            Ok(r) => records.push(r),
            Err(e) => {
                warn!(record = idx + 1, total, error = %e, "skipping malformed record");
                first_error.get_or_insert(e);
            }
        }
    }

    if records.is_empty() {
        return Err(first_error.unwrap_or(ParseError::NoRecords));
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::TimeFormat;
    use crate::core::timestamp::parse_utc;

    fn ctx() -> ParseContext {
        ParseContext {
            identity: RecordIdentity {
                metric_name: "org.osg.general.ping-host".to_string(),
                metric_type: "status".to_string(),
                service_type: "OSG-CE".to_string(),
                service_uri: "ce.example.org".to_string(),
                gathered_at: "rsv.example.org".to_string(),
            },
            completed_at: parse_utc("2010-07-25T05:18:14Z").expect("ts"),
        }
    }

    const RECORD: &str = "metricName: org.osg.srm.ping\n\
metricType: status\n\
timestamp: 2010-07-25T05:18:14Z\n\
metricStatus: WARNING\n\
serviceType: OSG-SRM\n\
serviceURI: srm.example.org:8443\n\
gatheredAt: rsv.example.org\n\
summaryData: SRM slow\n\
detailsData: first line\n\
second line\n\
EOT\n";

    #[test]
    fn brief_ok() {
        let r = parse_brief("RSV BRIEF RESULTS:\nOK\nHost reachable\n", &ctx()).expect("parse");
        assert_eq!(r.status, Status::Ok);
        assert_eq!(r.detail, "Host reachable");
        assert_eq!(r.summary, "OK");
    }

    #[test]
    fn brief_multiline_detail_and_status_whitespace() {
        let r = parse_brief("RSV BRIEF RESULTS:\n  critical \nline one\nline two\n\n", &ctx())
            .expect("parse");
        assert_eq!(r.status, Status::Critical);
        assert_eq!(r.detail, "line one\nline two");
    }

    #[test]
    fn brief_errors() {
        assert_eq!(
            parse_brief("OK\nHost reachable\n", &ctx()).unwrap_err(),
            ParseError::MissingSentinel
        );
        assert_eq!(
            parse_brief("RSV BRIEF RESULTS:", &ctx()).unwrap_err(),
            ParseError::MissingStatus
        );
        assert_eq!(
            parse_brief("RSV BRIEF RESULTS:\nFINE\nx\n", &ctx()).unwrap_err(),
            ParseError::InvalidStatus("FINE".to_string())
        );
        assert_eq!(
            parse_brief("RSV BRIEF RESULTS:\nOK\n", &ctx()).unwrap_err(),
            ParseError::EmptyDetail
        );
    }

    #[test]
    fn record_parses_all_fields() {
        let r = parse_record(RECORD, "fallback").expect("parse");
        assert_eq!(r.identity.metric_name, "org.osg.srm.ping");
        assert_eq!(r.identity.service_uri, "srm.example.org:8443");
        assert_eq!(r.identity.gathered_at, "rsv.example.org");
        assert_eq!(r.status, Status::Warning);
        assert_eq!(r.summary, "SRM slow");
        assert_eq!(r.detail, "first line\nsecond line");
    }

    #[test]
    fn record_without_eot_is_patched() {
        let truncated = RECORD.trim_end_matches("EOT\n");
        let r = parse_record(truncated, "fallback").expect("patched");
        assert_eq!(r.detail, "first line\nsecond line");
        let again = parse_record(&r.render(TimeFormat::Utc), "fallback").expect("round trip");
        assert_eq!(again, r);
    }

    #[test]
    fn record_without_detail_or_eot_is_rejected() {
        let s = "metricName: x\nmetricType: status\n";
        assert_eq!(parse_record(s, "h").unwrap_err(), ParseError::MissingTerminator);
    }

    #[test]
    fn record_missing_key_and_bad_timestamp() {
        let s = RECORD.replace("serviceType: OSG-SRM\n", "");
        assert_eq!(
            parse_record(&s, "h").unwrap_err(),
            ParseError::MissingKey("serviceType")
        );
        let s = RECORD.replace("2010-07-25T05:18:14Z", "yesterday");
        assert_eq!(
            parse_record(&s, "h").unwrap_err(),
            ParseError::InvalidTimestamp("yesterday".to_string())
        );
    }

    #[test]
    fn record_round_trip_in_every_time_format() {
        let original = CanonicalResult::new(
            ctx().identity,
            Status::Critical,
            "CRITICAL",
            "Failed to ping host",
            parse_utc("2010-07-25T05:18:14Z").expect("ts"),
        );
        for fmt in [TimeFormat::Utc, TimeFormat::Epoch] {
            let back = parse_record(&original.render(fmt), "unused").expect("parse");
            assert_eq!(back.status, original.status);
            assert_eq!(back.summary, original.summary);
            assert_eq!(back.identity.service_uri, original.identity.service_uri);
            assert_eq!(back.timestamp, original.timestamp);
        }
    }

    #[test]
    fn multi_record_tolerates_blank_and_broken_blocks() {
        let second = RECORD.replace("WARNING", "OK");
        let stdout = format!("\n\n{RECORD}\n   \n{second}garbage without colon\nEOT\n");
        let records = parse_records(&stdout, "h").expect("records");
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].status, Status::Warning);
        assert_eq!(records[1].status, Status::Ok);
    }

    #[test]
    fn multi_record_with_no_blocks_is_malformed() {
        assert_eq!(parse_records("  \n\n", "h").unwrap_err(), ParseError::NoRecords);
        assert_eq!(
            parse_records("nonsense\n", "h").unwrap_err(),
            ParseError::MalformedLine("nonsense".to_string())
        );
    }

    #[test]
    fn dispatch_by_format() {
        let out = parse(RECORD, OutputFormat::SingleRecord, &ctx()).expect("single");
        assert_eq!(out.len(), 1);
        let out = parse(&format!("{RECORD}{RECORD}"), OutputFormat::MultiRecord, &ctx())
            .expect("multi");
        assert_eq!(out.len(), 2);
    }
}
