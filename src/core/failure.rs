use std::fmt::Write as _;

use time::OffsetDateTime;

use crate::core::{CanonicalResult, RecordIdentity, Status};

/// Every condition that prevents a usable result from a probe. Each one is turned into a
/// brief-style record so that an invocation always publishes something an operator can act on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReport {
    NoProxyConfigured,
    MissingUserProxy {
        path: String,
    },
    ExpiringUserProxy {
        path: String,
        minutes: u64,
        tool_output: String,
    },
    ServiceProxyRenewalFailed {
        cert: String,
        key: String,
        proxy: String,
        stdout: String,
        stderr: String,
    },
    PingTimedOut {
        command: String,
        error: String,
    },
    PingFailed {
        stdout: String,
        stderr: String,
    },
    LocalJobFailed {
        command: String,
        stdout: String,
        stderr: String,
    },
    GridJobFailed {
        command: String,
        stdout: String,
        stderr: String,
    },
    BatchJobFailed {
        stdout: String,
        stderr: String,
        log: String,
    },
    BatchJobAborted {
        log: String,
    },
    SubmissionFailed {
        log: Option<String>,
    },
    ResourceDown {
        log: String,
    },
    JobHeld {
        log: String,
    },
    BackendUnavailable,
    JobTimedOut {
        command: String,
        error: String,
        info: Option<String>,
    },
    MalformedOutput {
        error: String,
        stdout: String,
        stderr: String,
    },
    ConfigInvalid {
        error: String,
    },
}

impl FailureReport {
    pub fn status(&self) -> Status {
        match self {
            FailureReport::MalformedOutput { .. } => Status::Unknown,
            _ => Status::Critical,
        }
    }

    pub fn is_credential(&self) -> bool {
        matches!(
            self,
            FailureReport::NoProxyConfigured
                | FailureReport::MissingUserProxy { .. }
                | FailureReport::ExpiringUserProxy { .. }
                | FailureReport::ServiceProxyRenewalFailed { .. }
        )
    }

    /// Short label used in logs and console summaries.
    pub fn label(&self) -> &'static str {
        match self {
            FailureReport::NoProxyConfigured => "no proxy configured",
            FailureReport::MissingUserProxy { .. } => "user proxy missing",
            FailureReport::ExpiringUserProxy { .. } => "user proxy expiring",
            FailureReport::ServiceProxyRenewalFailed { .. } => "service proxy renewal failed",
            FailureReport::PingTimedOut { .. } => "ping timed out",
            FailureReport::PingFailed { .. } => "ping failed",
            FailureReport::LocalJobFailed { .. } => "local job failed",
            FailureReport::GridJobFailed { .. } => "grid job failed",
            FailureReport::BatchJobFailed { .. } => "batch job failed",
            FailureReport::BatchJobAborted { .. } => "batch job aborted",
            FailureReport::SubmissionFailed { .. } => "submission failed",
            FailureReport::ResourceDown { .. } => "remote resource down",
            FailureReport::JobHeld { .. } => "job held",
            FailureReport::BackendUnavailable => "batch backend unavailable",
            FailureReport::JobTimedOut { .. } => "job timed out",
            FailureReport::MalformedOutput { .. } => "malformed output",
            FailureReport::ConfigInvalid { .. } => "configuration invalid",
        }
    }

    pub fn detail(&self) -> String {
        let mut d = String::new();
        match self {
            FailureReport::NoProxyConfigured => {
                d.push_str("No proxy is set up in rsv.toml.\n\n");
                d.push_str(
                    "To use a service certificate (recommended), set the following keys:\n",
                );
                d.push_str("service-cert, service-key, service-proxy\n\n");
                d.push_str("To use a user certificate, set the following key:\n");
                d.push_str("proxy-file");
            }
            FailureReport::MissingUserProxy { path } => {
                let _ = write!(
                    d,
                    "proxy-file is set in rsv.toml, but the file '{path}' does not exist."
                );
            }
            FailureReport::ExpiringUserProxy {
                path,
                minutes,
                tool_output,
            } => {
                let _ = writeln!(
                    d,
                    "Proxy file '{path}' is expired (or is expiring within {minutes} minutes)\n"
                );
                let _ = write!(d, "openssl output:\n{tool_output}");
            }
            FailureReport::ServiceProxyRenewalFailed {
                cert,
                key,
                proxy,
                stdout,
                stderr,
            } => {
                let _ = writeln!(d, "Proxy file '{proxy}' could not be renewed.");
                let _ = writeln!(d, "Service cert - {cert}");
                let _ = writeln!(d, "Service key  - {key}");
                let _ = writeln!(d, "voms-proxy-init stdout:\n{stdout}");
                let _ = writeln!(d, "voms-proxy-init stderr:\n{stderr}");
            }
            FailureReport::PingTimedOut { command, error } => {
                d.push_str("ping command timed out trying to reach host\n");
                let _ = writeln!(d, "Error - {error}\n");
                d.push_str("Troubleshooting:\n");
                let _ = writeln!(d, "  Manually run the ping command: '{command}'");
            }
            FailureReport::PingFailed { stdout, stderr } => {
                d.push_str("Failed to ping host\n\n");
                d.push_str("Troubleshooting:\n");
                d.push_str("  Is the network available?\n");
                d.push_str("  Is the remote host available?\n\n");
                let _ = writeln!(d, "Ping stdout:\n{stdout}");
                let _ = writeln!(d, "Ping stderr:\n{stderr}");
            }
            FailureReport::LocalJobFailed {
                command,
                stdout,
                stderr,
            } => {
                d.push_str("Failed to run local job\n\n");
                push_job_output(&mut d, command, stdout, stderr);
            }
            FailureReport::GridJobFailed {
                command,
                stdout,
                stderr,
            } => {
                d.push_str("Failed to run job via globus-job-run\n\n");
                push_job_output(&mut d, command, stdout, stderr);
            }
            FailureReport::BatchJobFailed {
                stdout,
                stderr,
                log,
            } => {
                d.push_str("Failed to run job via the batch gateway\n\n");
                let _ = writeln!(d, "Stdout:\n{stdout}");
                let _ = writeln!(d, "Stderr:\n{stderr}");
                let _ = writeln!(d, "Log:\n{log}");
            }
            FailureReport::BatchJobAborted { log } => {
                d.push_str("Batch gateway job aborted\n\n");
                let _ = writeln!(d, "Log:\n{log}");
            }
            FailureReport::SubmissionFailed { log } => {
                d.push_str("Batch gateway submission failed to remote host\n\n");
                if let Some(log) = log {
                    let _ = write!(d, "Job log file:\n{log}");
                }
            }
            FailureReport::ResourceDown { log } => {
                d.push_str("Submission failed because the remote side is down.\n");
                d.push_str(
                    "Make sure that the resource you are trying to monitor is online.\n\n",
                );
                let _ = writeln!(d, "Log:\n{log}");
            }
            FailureReport::JobHeld { log } => {
                d.push_str("Job was held by the batch system and has been removed.\n\n");
                let _ = writeln!(d, "Log:\n{log}");
            }
            FailureReport::BackendUnavailable => {
                d.push_str("The batch system is not running, so the job was not submitted.\n\n");
                d.push_str("Troubleshooting:\n");
                d.push_str("  Check that the condor service is started on this host.\n");
            }
            FailureReport::JobTimedOut {
                command,
                error,
                info,
            } => {
                let _ = writeln!(d, "Timeout hit - {error}\n");
                let _ = writeln!(d, "Job run:\n{command}\n");
                if let Some(info) = info {
                    let _ = write!(d, "More info:\n{info}");
                }
            }
            FailureReport::MalformedOutput {
                error,
                stdout,
                stderr,
            } => {
                let _ = writeln!(d, "Probe output could not be parsed: {error}\n");
                let _ = writeln!(d, "Stdout:\n{stdout}");
                let _ = writeln!(d, "Stderr:\n{stderr}");
            }
            FailureReport::ConfigInvalid { error } => {
                let _ = write!(d, "Invalid probe configuration: {error}");
            }
        }
        d
    }

    pub fn to_result(&self, identity: RecordIdentity, timestamp: OffsetDateTime) -> CanonicalResult {
        CanonicalResult::brief(identity, self.status(), self.detail(), timestamp)
    }
}

fn push_job_output(d: &mut String, command: &str, stdout: &str, stderr: &str) {
    let _ = writeln!(d, "Job run:\n{command}\n");
    let _ = writeln!(d, "Stdout:\n{stdout}");
    let _ = writeln!(d, "Stderr:\n{stderr}");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity() -> RecordIdentity {
        RecordIdentity {
            metric_name: "org.osg.certificates.cacert-expiry".to_string(),
            metric_type: "status".to_string(),
            service_type: "OSG-CE".to_string(),
            service_uri: "ce.example.org".to_string(),
            gathered_at: "rsv.example.org".to_string(),
        }
    }

    #[test]
    fn credential_failures_are_critical() {
        let report = FailureReport::MissingUserProxy {
            path: "/tmp/x509up_u1000".to_string(),
        };
        assert!(report.is_credential());
        let result = report.to_result(identity(), OffsetDateTime::UNIX_EPOCH);
        assert_eq!(result.status, Status::Critical);
        assert_eq!(result.summary, "CRITICAL");
        assert!(result.detail.contains("/tmp/x509up_u1000"));
    }

    #[test]
    fn malformed_output_is_unknown() {
        let report = FailureReport::MalformedOutput {
            error: "missing sentinel".to_string(),
            stdout: "garbage".to_string(),
            stderr: String::new(),
        };
        assert!(!report.is_credential());
        assert_eq!(report.status(), Status::Unknown);
        assert!(report.detail().contains("Stdout:\ngarbage\n"));
    }

    #[test]
    fn timeout_detail_includes_optional_info() {
        let with = FailureReport::JobTimedOut {
            command: "condor_submit sub".to_string(),
            error: "job exceeded 5 seconds".to_string(),
            info: Some("log tail".to_string()),
        };
        assert!(with.detail().ends_with("More info:\nlog tail"));
        let without = FailureReport::JobTimedOut {
            command: "probe".to_string(),
            error: "x".to_string(),
            info: None,
        };
        assert!(!without.detail().contains("More info"));
    }

    #[test]
    fn every_detail_is_non_empty() {
        let reports = [
            FailureReport::NoProxyConfigured,
            FailureReport::BackendUnavailable,
            FailureReport::SubmissionFailed { log: None },
        ];
        for r in reports {
            assert!(!r.detail().trim().is_empty(), "{}", r.label());
        }
    }
}
