//! Job dispatcher: runs a resolved probe locally, through `globus-job-run`, or through a
//! batch backend, and reports what happened as a [`JobOutcome`].

pub mod bundle;
pub mod condor;

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::core::FailureReport;
use crate::platform::{self, CommandRunOptions, RunError};
use crate::probe::{BatchUniverse, EnvAction, EnvDelta, ExecutionMode, ProbeConfig};

pub use condor::{CondorBackend, JobWorkspace, SubmitDescriptor};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalEvent {
    ReturnValue,
    Error,
    Abort,
    SubmissionFailed,
    ResourceDown,
    Held,
}

#[derive(Debug, Clone, Copy)]
pub struct Keyword {
    pub pattern: &'static str,
    pub event: TerminalEvent,
}

/// Checked in this order against the whole log on every change.
pub const TERMINAL_KEYWORDS: &[Keyword] = &[
    Keyword { pattern: "return value", event: TerminalEvent::ReturnValue },
    Keyword { pattern: "error", event: TerminalEvent::Error },
    Keyword { pattern: "abort", event: TerminalEvent::Abort },
    Keyword { pattern: "submission failed", event: TerminalEvent::SubmissionFailed },
    Keyword { pattern: "Detected Down Globus Resource", event: TerminalEvent::ResourceDown },
    Keyword { pattern: "resource down", event: TerminalEvent::ResourceDown },
    Keyword { pattern: "held", event: TerminalEvent::Held },
];

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct JobId(pub String);

impl JobId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Error)]
pub enum SubmitError {
    #[error(transparent)]
    Run(#[from] RunError),
    #[error("batch system rejected the request:\n{output}")]
    Rejected { output: String },
    #[error("invalid submit arguments: {0}")]
    InvalidArguments(String),
    #[error("failed to write {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Error)]
pub enum WatchError {
    #[error("timeout while watching log ({}s)", .timeout.as_secs())]
    TimedOut { timeout: Duration },
    #[error("failed to read job log {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Batch queue collaborator used by the batch-gateway path.
pub trait JobBackend {
    fn is_running(&self) -> bool;
    fn submit(&self, descriptor: &SubmitDescriptor) -> Result<JobId, SubmitError>;
    fn watch_log(
        &self,
        log: &Path,
        keywords: &[Keyword],
        timeout: Duration,
    ) -> Result<(TerminalEvent, String), WatchError>;
    fn remove(&self, job: &JobId) -> Result<(), SubmitError>;
}

pub trait Clock {
    fn now(&self) -> Instant;
    fn sleep(&self, d: Duration);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, d: Duration) {
        std::thread::sleep(d);
    }
}

/// Polls `log` until one of `keywords` shows up or `timeout` passes. A log that does not
/// exist yet is treated as empty.
pub fn watch_log(
    log: &Path,
    keywords: &[Keyword],
    timeout: Duration,
    poll_interval: Duration,
    clock: &dyn Clock,
) -> Result<(TerminalEvent, String), WatchError> {
    debug!(log = %log.display(), timeout_secs = timeout.as_secs(), "watching job log");
    let started = clock.now();
    let mut last_modified = None;

    loop {
        let elapsed = clock.now().duration_since(started);
        if elapsed >= timeout {
            return Err(WatchError::TimedOut { timeout });
        }

        match std::fs::metadata(log) {
            Ok(meta) => {
                let modified = meta.modified().ok();
                if modified.is_none() || modified != last_modified {
                    last_modified = modified;
                    let contents = read_lossy(log).map_err(|source| WatchError::Io {
                        path: log.to_path_buf(),
                        source,
                    })?;
                    if let Some(k) = keywords.iter().find(|k| contents.contains(k.pattern)) {
                        debug!(keyword = k.pattern, "terminal keyword found in job log");
                        return Ok((k.event, contents));
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(source) => {
                return Err(WatchError::Io {
                    path: log.to_path_buf(),
                    source,
                });
            }
        }

        clock.sleep(poll_interval.min(timeout - elapsed));
    }
}

/// Job files are written by the remote side; invalid UTF-8 must not discard the rest.
fn read_lossy(path: &Path) -> std::io::Result<String> {
    std::fs::read(path).map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
}

/// Applies `deltas` in order to `snapshot`. APPEND and PREPEND join with `:`.
pub fn resolve_environment<I>(snapshot: I, deltas: &[EnvDelta]) -> Vec<(OsString, OsString)>
where
    I: IntoIterator<Item = (OsString, OsString)>,
{
    let mut env: BTreeMap<OsString, OsString> = snapshot.into_iter().collect();
    for delta in deltas {
        let key = OsString::from(&delta.var);
        let value = OsString::from(&delta.value);
        match delta.action {
            EnvAction::Set => {
                env.insert(key, value);
            }
            EnvAction::Unset => {
                env.remove(&key);
            }
            EnvAction::Append => {
                let joined = match env.get(&key) {
                    Some(cur) => join_path(cur, &value),
                    None => value,
                };
                env.insert(key, joined);
            }
            EnvAction::Prepend => {
                let joined = match env.get(&key) {
                    Some(cur) => join_path(&value, cur),
                    None => value,
                };
                env.insert(key, joined);
            }
        }
    }
    env.into_iter().collect()
}

fn join_path(first: &OsString, second: &OsString) -> OsString {
    let mut out = first.clone();
    out.push(":");
    out.push(second);
    out
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    ExitCode(i32),
    Spawn(String),
    JobError,
    SubmissionFailed,
    ResourceDown,
    Held,
    BackendUnavailable,
    InvalidArguments(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobStatus {
    Success,
    Failed(FailureReason),
    TimedOut,
    Aborted,
}

impl JobStatus {
    pub fn label(&self) -> String {
        match self {
            JobStatus::Success => "success".to_string(),
            JobStatus::Failed(FailureReason::ExitCode(code)) => format!("failed (exit {code})"),
            JobStatus::Failed(reason) => format!("failed ({reason:?})"),
            JobStatus::TimedOut => "timeout".to_string(),
            JobStatus::Aborted => "aborted".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct JobOutcome {
    pub status: JobStatus,
    pub command: String,
    pub stdout: String,
    pub stderr: String,
    pub log: Option<String>,
    pub timeout: Duration,
    pub duration: Duration,
}

impl JobOutcome {
    fn new(status: JobStatus, command: String, timeout: Duration) -> Self {
        Self {
            status,
            command,
            stdout: String::new(),
            stderr: String::new(),
            log: None,
            timeout,
            duration: Duration::ZERO,
        }
    }

    /// Operator-facing description of a non-successful outcome.
    pub fn failure_report(&self, mode: &ExecutionMode) -> Option<FailureReport> {
        let log = || self.log.clone().unwrap_or_default();
        let report = match &self.status {
            JobStatus::Success => return None,
            JobStatus::TimedOut => FailureReport::JobTimedOut {
                command: self.command.clone(),
                error: format!("job did not finish within {} seconds", self.timeout.as_secs()),
                info: self.log.clone().filter(|l| !l.trim().is_empty()),
            },
            JobStatus::Aborted => FailureReport::BatchJobAborted { log: log() },
            JobStatus::Failed(FailureReason::SubmissionFailed) => FailureReport::SubmissionFailed {
                log: self
                    .log
                    .clone()
                    .or_else(|| Some(self.stderr.clone()))
                    .filter(|l| !l.trim().is_empty()),
            },
            JobStatus::Failed(FailureReason::ResourceDown) => {
                FailureReport::ResourceDown { log: log() }
            }
            JobStatus::Failed(FailureReason::Held) => FailureReport::JobHeld { log: log() },
            JobStatus::Failed(FailureReason::BackendUnavailable) => {
                FailureReport::BackendUnavailable
            }
            JobStatus::Failed(FailureReason::InvalidArguments(error)) => {
                FailureReport::ConfigInvalid {
                    error: error.clone(),
                }
            }
            JobStatus::Failed(_) => match mode {
                ExecutionMode::Local => FailureReport::LocalJobFailed {
                    command: self.command.clone(),
                    stdout: self.stdout.clone(),
                    stderr: self.stderr.clone(),
                },
                ExecutionMode::RemoteGrid { .. } => FailureReport::GridJobFailed {
                    command: self.command.clone(),
                    stdout: self.stdout.clone(),
                    stderr: self.stderr.clone(),
                },
                ExecutionMode::RemoteBatchGateway(_) => FailureReport::BatchJobFailed {
                    stdout: self.stdout.clone(),
                    stderr: self.stderr.clone(),
                    log: log(),
                },
            },
        };
        Some(report)
    }
}

/// What the dispatcher needs beyond the probe itself.
pub struct DispatchContext<'a> {
    pub backend: &'a dyn JobBackend,
    pub proxy: Option<&'a Path>,
    pub work_dir: &'a Path,
}

pub fn dispatch(probe: &ProbeConfig, ctx: &DispatchContext<'_>) -> JobOutcome {
    let started = Instant::now();
    let env = resolve_environment(std::env::vars_os(), &probe.env);
    for delta in &probe.env {
        debug!(var = %delta.var, action = delta.action.as_str(), value = %delta.value, "environment delta");
    }

    let mut outcome = match &probe.mode {
        ExecutionMode::Local => {
            let mut args = probe.invocation_args(ctx.proxy);
            if probe.probe_spec_v3 {
                if let Some(rsl) = &probe.extra_globus_rsl {
                    args.push("--extra-globus-rsl".to_string());
                    args.push(rsl.clone());
                }
            }
            info!(check = %probe.check, target = %probe.target, "executing job locally");
            run_process(probe, &probe.executable.display().to_string(), &args, env)
        }
        ExecutionMode::RemoteGrid { jobmanager } => run_grid(probe, jobmanager, ctx, env),
        ExecutionMode::RemoteBatchGateway(universe) => {
            info!(check = %probe.check, target = %probe.target, "submitting job to the batch gateway");
            run_batch(probe, universe, ctx, env)
        }
    };

    outcome.duration = started.elapsed();
    info!(
        check = %probe.check,
        status = %outcome.status.label(),
        elapsed_ms = outcome.duration.as_millis() as u64,
        "dispatch finished"
    );
    outcome
}

fn run_process(
    probe: &ProbeConfig,
    cmd: &str,
    args: &[String],
    env: Vec<(OsString, OsString)>,
) -> JobOutcome {
    let timeout = probe.effective_timeout();
    let command = platform::format_cmdline(cmd, args);
    let options = CommandRunOptions {
        env: Some(env),
        current_dir: None,
    };
    match platform::run_command_with_options(cmd, args, timeout, &options) {
        Ok(out) => {
            let status = if out.success() {
                JobStatus::Success
            } else {
                JobStatus::Failed(FailureReason::ExitCode(out.exit_code))
            };
            JobOutcome {
                stdout: out.stdout,
                stderr: out.stderr,
                ..JobOutcome::new(status, command, timeout)
            }
        }
        Err(RunError::TimedOut { .. }) => JobOutcome::new(JobStatus::TimedOut, command, timeout),
        Err(e) => {
            let msg = error_chain(&e);
            JobOutcome {
                stderr: msg.clone(),
                ..JobOutcome::new(JobStatus::Failed(FailureReason::Spawn(msg)), command, timeout)
            }
        }
    }
}

fn run_grid(
    probe: &ProbeConfig,
    jobmanager: &str,
    ctx: &DispatchContext<'_>,
    env: Vec<(OsString, OsString)>,
) -> JobOutcome {
    let command = format!("globus-job-run ({})", probe.check);
    let invalid = |msg: String| {
        JobOutcome::new(
            JobStatus::Failed(FailureReason::InvalidArguments(msg)),
            command.clone(),
            probe.effective_timeout(),
        )
    };

    // The workspace holds the bundle and must outlive the job.
    let (staged, workspace) = if probe.transfer_files.is_empty() {
        (probe.executable.clone(), None)
    } else {
        let ws = match JobWorkspace::create(ctx.work_dir, &probe.check) {
            Ok(ws) => ws,
            Err(e) => {
                return invalid(format!(
                    "failed to create job workspace under {}: {e}",
                    ctx.work_dir.display()
                ));
            }
        };
        let files: Vec<PathBuf> = probe
            .transfer_files
            .iter()
            .map(|f| bundle::resolve_transfer_file(&probe.executable, f))
            .collect();
        let path = ws.bundle();
        if let Err(e) = bundle::write(&path, &probe.executable, &files) {
            return invalid(error_chain(&e));
        }
        (path, Some(ws))
    };

    let mut args = vec![format!("{}/jobmanager-{jobmanager}", probe.target)];
    if let Some(rsl) = &probe.extra_globus_rsl {
        args.push("-x".to_string());
        args.push(rsl.clone());
    }
    args.push("-s".to_string());
    args.push(staged.display().to_string());
    args.push("--".to_string());
    args.extend(probe.invocation_args(ctx.proxy));
    info!(
        check = %probe.check,
        target = %probe.target,
        bundled = workspace.is_some(),
        "executing job remotely using globus-job-run"
    );
    run_process(probe, "globus-job-run", &args, env)
}

fn run_batch(
    probe: &ProbeConfig,
    universe: &BatchUniverse,
    ctx: &DispatchContext<'_>,
    env: Vec<(OsString, OsString)>,
) -> JobOutcome {
    let timeout = probe.effective_timeout();
    let command = format!("condor_submit ({})", probe.check);
    let outcome = |status| JobOutcome::new(status, command.clone(), timeout);

    if !ctx.backend.is_running() {
        warn!(check = %probe.check, "batch backend is not running, job not submitted");
        return outcome(JobStatus::Failed(FailureReason::BackendUnavailable));
    }

    let workspace = match JobWorkspace::create(ctx.work_dir, &probe.check) {
        Ok(ws) => ws,
        Err(e) => {
            let msg = format!("failed to create job workspace under {}: {e}", ctx.work_dir.display());
            return JobOutcome {
                stderr: msg.clone(),
                ..outcome(JobStatus::Failed(FailureReason::Spawn(msg)))
            };
        }
    };

    let descriptor = SubmitDescriptor {
        check: probe.check.clone(),
        universe: universe.clone(),
        proxy: ctx.proxy.map(Path::to_path_buf),
        executable: probe.executable.clone(),
        arguments: probe.invocation_args(ctx.proxy),
        globus_rsl: probe.extra_globus_rsl.clone(),
        class_ads: probe.class_ads.clone(),
        transfer_files: probe.transfer_files.clone(),
        workdir: workspace.dir().to_path_buf(),
        submit_file: workspace.submit_file(),
        log: workspace.log(),
        output: workspace.output(),
        error: workspace.error(),
        env,
    };

    let job = match ctx.backend.submit(&descriptor) {
        Ok(job) => job,
        Err(SubmitError::InvalidArguments(msg)) => {
            return outcome(JobStatus::Failed(FailureReason::InvalidArguments(msg)));
        }
        Err(e) => {
            // Nothing was queued, so there is nothing to remove.
            warn!(check = %probe.check, error = %e, "batch submission failed");
            return JobOutcome {
                stderr: error_chain(&e),
                ..outcome(JobStatus::Failed(FailureReason::SubmissionFailed))
            };
        }
    };
    info!(check = %probe.check, job = %job, "batch job submitted");

    let read = |p: PathBuf| read_lossy(&p).unwrap_or_default();
    let remove = |job: &JobId| {
        if let Err(e) = ctx.backend.remove(job) {
            warn!(job = %job, error = %e, "failed to remove batch job");
        }
    };

    match ctx.backend.watch_log(&workspace.log(), TERMINAL_KEYWORDS, timeout) {
        Ok((event, log)) => {
            let status = match event {
                TerminalEvent::ReturnValue => JobStatus::Success,
                TerminalEvent::Abort => JobStatus::Aborted,
                TerminalEvent::Error => JobStatus::Failed(FailureReason::JobError),
                TerminalEvent::SubmissionFailed => {
                    remove(&job);
                    JobStatus::Failed(FailureReason::SubmissionFailed)
                }
                TerminalEvent::ResourceDown => {
                    remove(&job);
                    JobStatus::Failed(FailureReason::ResourceDown)
                }
                TerminalEvent::Held => {
                    remove(&job);
                    JobStatus::Failed(FailureReason::Held)
                }
            };
            JobOutcome {
                stdout: read(workspace.output()),
                stderr: read(workspace.error()),
                log: Some(log),
                ..outcome(status)
            }
        }
        Err(WatchError::TimedOut { .. }) => {
            warn!(check = %probe.check, job = %job, "batch job timed out, removing it");
            remove(&job);
            JobOutcome {
                log: Some(read(workspace.log())),
                ..outcome(JobStatus::TimedOut)
            }
        }
        Err(e) => {
            remove(&job);
            JobOutcome {
                stderr: error_chain(&e),
                ..outcome(JobStatus::Failed(FailureReason::JobError))
            }
        }
    }
}

fn error_chain(err: &dyn std::error::Error) -> String {
    let mut msg = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        msg.push_str(": ");
        msg.push_str(&cause.to_string());
        source = cause.source();
    }
    msg
}
