use std::io::Write;
use std::time::Duration;

use anyhow::Result;
use time::OffsetDateTime;
use tracing::{error, info, warn};

use crate::config::EffectiveConfig;
use crate::core::{CanonicalResult, FailureReport, Findings, RecordIdentity, Status};
use crate::credential::{self, CertTool, CredentialSource, OpensslTool};
use crate::dispatch::{self, CondorBackend, DispatchContext, JobBackend};
use crate::parser::{self, ParseContext};
use crate::platform;
use crate::probe::{ProbeConfig, ProbeOverrides};
use crate::publish::{self, PublishOutcome};

const PING_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Default)]
pub struct EngineOptions {
    /// Skip the reachability pre-check for every check in this invocation.
    pub no_ping: bool,
    pub show_progress: bool,
}

/// Runs checks one after another through resolve → credential → ping → dispatch → parse →
/// publish.
pub struct Engine {
    cfg: EffectiveConfig,
    opts: EngineOptions,
    backend: Box<dyn JobBackend>,
    cert_tool: Box<dyn CertTool>,
    gathered_at: String,
}

/// What happened to one check invocation.
#[derive(Debug, Clone)]
pub struct CheckReport {
    pub check: String,
    pub target: String,
    pub status: Status,
    pub failure: Option<FailureReport>,
    pub records: usize,
    pub published: PublishOutcome,
}

impl CheckReport {
    pub fn is_credential_failure(&self) -> bool {
        self.failure.as_ref().is_some_and(FailureReport::is_credential)
    }

    pub fn describe(&self) -> String {
        match &self.failure {
            Some(f) => format!("{} on {}: {}", self.check, self.target, f.label()),
            None => format!("{} on {}: {}", self.check, self.target, self.status),
        }
    }
}

impl Engine {
    pub fn new(cfg: EffectiveConfig, opts: EngineOptions) -> Self {
        Self::with_collaborators(
            cfg,
            opts,
            Box::new(CondorBackend::new()),
            Box::new(OpensslTool),
        )
    }

    pub fn with_collaborators(
        cfg: EffectiveConfig,
        opts: EngineOptions,
        backend: Box<dyn JobBackend>,
        cert_tool: Box<dyn CertTool>,
    ) -> Self {
        let gathered_at = cfg
            .rsv
            .gathered_at
            .clone()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(platform::local_fqdn);
        Self {
            cfg,
            opts,
            backend,
            cert_tool,
            gathered_at,
        }
    }

    /// Runs one check against one target and publishes exactly one outcome for it (or one
    /// per record for multi-record probes).
    pub fn run_check(
        &self,
        check: &str,
        target: &str,
        overrides: &ProbeOverrides,
        console: &mut dyn Write,
    ) -> CheckReport {
        info!(check, target, "running check");
        let mut identity = RecordIdentity {
            metric_name: check.to_string(),
            metric_type: "status".to_string(),
            service_type: String::new(),
            service_uri: target.to_string(),
            gathered_at: self.gathered_at.clone(),
        };

        let probe = match ProbeConfig::resolve(check, target, &self.cfg, overrides) {
            Ok(p) => p,
            Err(e) => {
                error!(check, target, error = %e, "invalid probe configuration");
                let failure = FailureReport::ConfigInvalid {
                    error: e.to_string(),
                };
                return self.publish_failure(identity, failure, console);
            }
        };
        identity.metric_type = probe.metric_type.clone();
        identity.service_type = probe.service_type.clone();

        let source = CredentialSource::from_config(&self.cfg.rsv);
        let proxy = match credential::validate(&source, probe.need_proxy, self.cert_tool.as_ref()) {
            Ok(Some(active)) => {
                active.export();
                Some(active.path)
            }
            Ok(None) => None,
            Err(e) => {
                error!(check, target, error = %e, "credential check failed");
                return self.publish_failure(identity, e.to_failure(), console);
            }
        };

        if !(self.opts.no_ping || probe.no_ping) {
            if let Some(failure) = ping(probe.host()) {
                error!(check, target, reason = failure.label(), "target is not reachable");
                return self.publish_failure(identity, failure, console);
            }
        }

        let started_at = OffsetDateTime::now_utc();
        let spinner = self.spinner(check, target);
        let ctx = DispatchContext {
            backend: self.backend.as_ref(),
            proxy: proxy.as_deref(),
            work_dir: &self.cfg.rsv.work_dir,
        };
        let outcome = dispatch::dispatch(&probe, &ctx);
        if let Some(pb) = spinner {
            pb.finish_and_clear();
        }
        let finished_at = OffsetDateTime::now_utc();

        match crate::logs::write_job_attempt_log(
            &self.cfg.rsv.log_dir,
            &probe,
            &outcome,
            started_at,
            finished_at,
        ) {
            Ok(path) => info!(path = %path.display(), "wrote job attempt log"),
            Err(e) => warn!(error = %format!("{e:#}"), "could not write job attempt log"),
        }

        if let Some(failure) = outcome.failure_report(&probe.mode) {
            error!(check, target, reason = failure.label(), "job did not succeed");
            return self.publish_failure(identity, failure, console);
        }

        let ctx = ParseContext {
            identity: identity.clone(),
            completed_at: finished_at,
        };
        let results = match parser::parse(&outcome.stdout, probe.output_format, &ctx) {
            Ok(results) => results,
            Err(e) => {
                error!(check, target, error = %e, "probe output could not be parsed");
                let failure = FailureReport::MalformedOutput {
                    error: e.to_string(),
                    stdout: outcome.stdout.clone(),
                    stderr: outcome.stderr.clone(),
                };
                return self.publish_failure(identity, failure, console);
            }
        };

        let mut findings = Findings::new();
        let mut published = PublishOutcome::default();
        let records = results.len();
        for mut result in results {
            findings.add(result.status, &result.summary);
            result.trim_detail(self.cfg.rsv.details_data_trim_length);
            published.merge(self.publish(&result, console));
        }

        let status = findings.status().unwrap_or(Status::Ok);
        info!(check, target, %status, summary = findings.summary(), records, "check finished");
        CheckReport {
            check: check.to_string(),
            target: target.to_string(),
            status,
            failure: None,
            records,
            published,
        }
    }

    /// Runs every check enabled in the host files, strictly one at a time.
    pub fn run_all_enabled(
        &self,
        overrides: &ProbeOverrides,
        console: &mut dyn Write,
    ) -> Result<Vec<CheckReport>> {
        let enabled = self.cfg.enabled_checks()?;
        if enabled.is_empty() {
            info!(hosts_dir = %self.cfg.hosts_dir().display(), "no enabled checks");
        }
        Ok(enabled
            .iter()
            .map(|e| self.run_check(&e.check, &e.target, overrides, console))
            .collect())
    }

    fn publish_failure(
        &self,
        identity: RecordIdentity,
        failure: FailureReport,
        console: &mut dyn Write,
    ) -> CheckReport {
        let check = identity.metric_name.clone();
        let target = identity.service_uri.clone();
        let mut result = failure.to_result(identity, OffsetDateTime::now_utc());
        result.trim_detail(self.cfg.rsv.details_data_trim_length);
        let published = self.publish(&result, console);
        CheckReport {
            check,
            target,
            status: failure.status(),
            failure: Some(failure),
            records: 1,
            published,
        }
    }

    fn publish(&self, result: &CanonicalResult, console: &mut dyn Write) -> PublishOutcome {
        publish::publish(result, &self.cfg.consumers, &self.cfg.rsv.spool_dir, console)
    }

    fn spinner(&self, check: &str, target: &str) -> Option<indicatif::ProgressBar> {
        use std::io::IsTerminal;
        if !(self.opts.show_progress && std::io::stderr().is_terminal()) {
            return None;
        }
        let pb = indicatif::ProgressBar::new_spinner();
        pb.set_draw_target(indicatif::ProgressDrawTarget::stderr());
        pb.set_message(format!("running {check} on {target}"));
        pb.enable_steady_tick(Duration::from_millis(120));
        Some(pb)
    }
}

/// `None` when the host answered a single ping.
fn ping(host: &str) -> Option<FailureReport> {
    let args = ["-W", "3", "-c", "1", host];
    let command = platform::format_cmdline("ping", &args);
    match platform::run_command("ping", &args, PING_TIMEOUT) {
        Ok(out) if out.success() => None,
        Ok(out) => Some(FailureReport::PingFailed {
            stdout: out.stdout,
            stderr: out.stderr,
        }),
        Err(e) if e.is_timeout() => Some(FailureReport::PingTimedOut {
            command,
            error: e.to_string(),
        }),
        Err(e) => Some(FailureReport::PingFailed {
            stdout: String::new(),
            stderr: format!("{command}: {e}"),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConsumerConfig;
    use crate::core::TimeFormat;
    use crate::dispatch::{JobId, Keyword, SubmitDescriptor, SubmitError, TerminalEvent, WatchError};
    use std::path::{Path, PathBuf};
    use std::sync::atomic::{AtomicU64, Ordering};

    struct NoBackend;

    impl JobBackend for NoBackend {
        fn is_running(&self) -> bool {
            false
        }
        fn submit(&self, _: &SubmitDescriptor) -> Result<JobId, SubmitError> {
            Err(SubmitError::Rejected {
                output: "unused".to_string(),
            })
        }
        fn watch_log(
            &self,
            _: &Path,
            _: &[Keyword],
            timeout: Duration,
        ) -> Result<(TerminalEvent, String), WatchError> {
            Err(WatchError::TimedOut { timeout })
        }
        fn remove(&self, _: &JobId) -> Result<(), SubmitError> {
            Ok(())
        }
    }

    struct NoTool;

    impl CertTool for NoTool {
        fn check_valid_for(
            &self,
            _: &Path,
            _: u64,
        ) -> Result<platform::CommandOutput, platform::RunError> {
            Err(platform::RunError::TimedOut {
                cmd: "openssl".to_string(),
                timeout: Duration::from_secs(1),
            })
        }
        fn issue(
            &self,
            _: &Path,
            _: &Path,
            _: &Path,
            _: &str,
        ) -> Result<platform::CommandOutput, platform::RunError> {
            Err(platform::RunError::TimedOut {
                cmd: "voms-proxy-init".to_string(),
                timeout: Duration::from_secs(1),
            })
        }
    }

    fn temp_root(name: &str) -> PathBuf {
        static SEQ: AtomicU64 = AtomicU64::new(0);
        let seq = SEQ.fetch_add(1, Ordering::Relaxed);
        let dir = std::env::temp_dir().join(format!(
            "rsvrun-engine-{name}-{}-{seq}",
            std::process::id()
        ));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(dir.join("metrics")).expect("mkdir");
        dir
    }

    fn engine(root: &Path) -> Engine {
        let mut cfg = EffectiveConfig::with_config_dir(root.to_path_buf());
        cfg.rsv.spool_dir = root.join("spool");
        cfg.rsv.work_dir = root.join("work");
        cfg.rsv.log_dir = root.join("log");
        cfg.rsv.gathered_at = Some("rsv.example.org".to_string());
        cfg.consumers = vec![ConsumerConfig {
            name: "html-consumer".to_string(),
            timestamp: TimeFormat::Utc,
        }];
        Engine::with_collaborators(
            cfg,
            EngineOptions {
                no_ping: true,
                show_progress: false,
            },
            Box::new(NoBackend),
            Box::new(NoTool),
        )
    }

    fn spooled(root: &Path) -> Vec<String> {
        let dir = root.join("spool").join("html-consumer");
        let mut out: Vec<String> = std::fs::read_dir(dir)
            .map(|rd| {
                rd.filter_map(|e| e.ok())
                    .filter_map(|e| std::fs::read_to_string(e.path()).ok())
                    .collect()
            })
            .unwrap_or_default();
        out.sort();
        out
    }

    #[test]
    fn missing_probe_file_publishes_config_failure() {
        let root = temp_root("noprobe");
        let engine = engine(&root);
        let mut console = Vec::new();
        let report = engine.run_check(
            "org.osg.missing",
            "ce.example.org",
            &ProbeOverrides::default(),
            &mut console,
        );
        assert!(matches!(report.failure, Some(FailureReport::ConfigInvalid { .. })));
        assert_eq!(report.status, Status::Critical);
        assert!(!report.is_credential_failure());

        let records = spooled(&root);
        assert_eq!(records.len(), 1);
        assert!(records[0].contains("metricStatus: CRITICAL\n"));
        assert!(records[0].contains("gatheredAt: rsv.example.org\n"));
        let _ = std::fs::remove_dir_all(&root);
    }

    #[test]
    fn missing_credentials_publish_credential_failure() {
        let root = temp_root("nocred");
        std::fs::write(
            root.join("metrics").join("org.osg.general.ping-host.toml"),
            "service-type = \"OSG-CE\"\nexecute = \"local\"\noutput-format = \"brief\"\n",
        )
        .expect("write");
        let engine = engine(&root);
        let mut console = Vec::new();
        let report = engine.run_check(
            "org.osg.general.ping-host",
            "ce.example.org",
            &ProbeOverrides::default(),
            &mut console,
        );
        assert_eq!(report.failure, Some(FailureReport::NoProxyConfigured));
        assert!(report.is_credential_failure());
        assert_eq!(report.published.written.len(), 1);
        let echoed = String::from_utf8(console).expect("utf8");
        assert!(echoed.contains("serviceType: OSG-CE\n"), "{echoed}");
        let _ = std::fs::remove_dir_all(&root);
    }

    #[cfg(unix)]
    #[test]
    fn local_brief_probe_is_parsed_trimmed_and_published() {
        use std::os::unix::fs::PermissionsExt;

        let root = temp_root("local");
        let script = root.join("probe.sh");
        std::fs::write(
            &script,
            "#!/bin/sh\nprintf 'RSV BRIEF RESULTS:\\nWARNING\\n0123456789abcdef\\n'\n",
        )
        .expect("write");
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).expect("chmod");
        std::fs::write(
            root.join("metrics").join("org.osg.local.probe.toml"),
            format!(
                "service-type = \"OSG-CE\"\nexecute = \"local\"\noutput-format = \"brief\"\nneed-proxy = false\nexecutable = \"{}\"\n",
                script.display()
            ),
        )
        .expect("write");

        let mut engine = engine(&root);
        engine.cfg.rsv.details_data_trim_length = 4;
        let mut console = Vec::new();
        let report = engine.run_check(
            "org.osg.local.probe",
            "ce.example.org",
            &ProbeOverrides::default(),
            &mut console,
        );
        assert_eq!(report.failure, None);
        assert_eq!(report.status, Status::Warning);
        assert_eq!(report.records, 1);

        let records = spooled(&root);
        assert_eq!(records.len(), 1);
        assert!(records[0].contains("metricStatus: WARNING\n"));
        assert!(records[0].contains("detailsData: 0123\nEOT\n"), "{}", records[0]);
        assert!(root.join("log").join("metrics").is_dir());
        let _ = std::fs::remove_dir_all(&root);
    }

    #[test]
    fn run_all_enabled_with_no_hosts_runs_nothing() {
        let root = temp_root("nohosts");
        let engine = engine(&root);
        let mut console = Vec::new();
        let reports = engine
            .run_all_enabled(&ProbeOverrides::default(), &mut console)
            .expect("run");
        assert!(reports.is_empty());
        assert!(console.is_empty());
        let _ = std::fs::remove_dir_all(&root);
    }
}
