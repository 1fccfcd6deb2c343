use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tracing_subscriber::EnvFilter;

use crate::dispatch::JobOutcome;
use crate::probe::ProbeConfig;

const MAX_CMD_OUTPUT_BYTES: usize = 64 * 1024;

pub const LOG_ENV: &str = "RSVRUN_LOG";

/// Installs the stderr subscriber. `RSVRUN_LOG` wins over the flags.
pub fn init_tracing(verbose: bool, quiet: bool) {
    let level = if verbose {
        "debug"
    } else if quiet {
        "error"
    } else {
        "info"
    };
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

#[derive(Debug, Serialize)]
struct JobAttemptLog {
    schema_version: &'static str,
    tool_version: String,
    started_at: String,
    finished_at: String,
    check: String,
    target: String,
    mode: &'static str,
    status: String,
    timeout_secs: u64,
    elapsed_ms: u64,
    command: String,
    stdout: String,
    stderr: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    job_log: Option<String>,
}

pub fn attempts_dir(log_dir: &Path) -> PathBuf {
    log_dir.join("metrics")
}

/// Writes one JSON document describing a dispatched job into `<log_dir>/metrics/`.
pub fn write_job_attempt_log(
    log_dir: &Path,
    probe: &ProbeConfig,
    outcome: &JobOutcome,
    started_at: OffsetDateTime,
    finished_at: OffsetDateTime,
) -> Result<PathBuf> {
    let dir = attempts_dir(log_dir);
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create log directory: {}", dir.display()))?;

    let pid = std::process::id();
    let ts = finished_at.unix_timestamp_nanos();
    let path = dir.join(format!("attempt-{}-{pid}-{ts}.json", probe.check));

    let log = JobAttemptLog {
        schema_version: "1.0",
        tool_version: env!("CARGO_PKG_VERSION").to_string(),
        started_at: started_at
            .format(&Rfc3339)
            .unwrap_or_else(|_| "unknown".to_string()),
        finished_at: finished_at
            .format(&Rfc3339)
            .unwrap_or_else(|_| "unknown".to_string()),
        check: probe.check.clone(),
        target: probe.target.clone(),
        mode: probe.mode.label(),
        status: outcome.status.label(),
        timeout_secs: outcome.timeout.as_secs(),
        elapsed_ms: outcome.duration.as_millis() as u64,
        command: outcome.command.clone(),
        stdout: truncate_string(&outcome.stdout, MAX_CMD_OUTPUT_BYTES),
        stderr: truncate_string(&outcome.stderr, MAX_CMD_OUTPUT_BYTES),
        job_log: outcome
            .log
            .as_deref()
            .map(|l| truncate_string(l, MAX_CMD_OUTPUT_BYTES)),
    };

    let buf = serde_json::to_vec_pretty(&log).context("failed to serialize attempt log")?;
    std::fs::write(&path, buf)
        .with_context(|| format!("failed to write attempt log: {}", path.display()))?;
    Ok(path)
}

fn truncate_string(s: &str, max_bytes: usize) -> String {
    if s.len() <= max_bytes {
        return s.to_string();
    }
    let head = crate::core::truncate_bytes(s, max_bytes);
    format!("{head}\n...(truncated, total={} bytes)", s.len())
}
