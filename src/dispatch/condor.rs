//! HTCondor job backend: `condor_submit`, `condor_rm`, `condor_q` and the submit file.

use std::ffi::OsString;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tracing::{debug, info, warn};

use crate::dispatch::{
    JobBackend, JobId, Keyword, SubmitError, SystemClock, TerminalEvent, WatchError, watch_log,
};
use crate::platform::{self, CommandRunOptions};
use crate::probe::BatchUniverse;

const CONDOR_TIMEOUT: Duration = Duration::from_secs(60);
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Everything needed to write one submit file.
#[derive(Debug, Clone)]
pub struct SubmitDescriptor {
    pub check: String,
    pub universe: BatchUniverse,
    pub proxy: Option<PathBuf>,
    pub executable: PathBuf,
    pub arguments: Vec<String>,
    pub globus_rsl: Option<String>,
    pub class_ads: Vec<(String, String)>,
    pub transfer_files: Vec<String>,
    pub workdir: PathBuf,
    pub submit_file: PathBuf,
    pub log: PathBuf,
    pub output: PathBuf,
    pub error: PathBuf,
    /// Environment for the submit command itself.
    pub env: Vec<(OsString, OsString)>,
}

impl SubmitDescriptor {
    pub fn render(&self) -> Result<String, SubmitError> {
        let arguments = quote_arguments(&self.arguments)?;
        let mut s = String::new();
        match &self.universe {
            BatchUniverse::Grid(resource) => {
                s.push_str("Universe = grid\n");
                let _ = writeln!(s, "grid_resource = {}", resource.render());
                if matches!(resource, crate::probe::GridResource::HtcondorCe { .. }) {
                    s.push_str("remote_universe = local\n");
                }
                s.push('\n');
            }
            BatchUniverse::Vanilla => s.push_str("Universe = vanilla\n"),
        }
        if let Some(proxy) = &self.proxy {
            let _ = writeln!(s, "x509userproxy = {}", proxy.display());
        }
        let _ = writeln!(s, "Executable = {}", self.executable.display());
        let _ = writeln!(s, "Arguments = \"{arguments}\"");
        if let Some(rsl) = &self.globus_rsl {
            let _ = writeln!(s, "globus_rsl = {rsl}");
        }
        if matches!(self.universe, BatchUniverse::Vanilla) {
            for (k, v) in &self.class_ads {
                let _ = writeln!(s, "+{k} = {v}");
            }
        }
        if !self.transfer_files.is_empty() {
            let _ = writeln!(s, "transfer_input_files = {}", self.transfer_files.join(", "));
        }
        let _ = writeln!(s, "Log = {}", self.log.display());
        let _ = writeln!(s, "Output = {}", self.output.display());
        let _ = writeln!(s, "Error = {}\n", self.error.display());
        s.push_str("Notification = never\n");
        s.push_str("WhenToTransferOutput = ON_EXIT_OR_EVICT\n\n");
        s.push_str("Queue\n");
        Ok(s)
    }
}

/// Quotes arguments for the new-style `Arguments = "..."` syntax.
pub fn quote_arguments(args: &[String]) -> Result<String, SubmitError> {
    let mut out = Vec::with_capacity(args.len());
    for arg in args {
        if arg.contains('\n') {
            return Err(SubmitError::InvalidArguments(
                "newlines are not allowed in submit file arguments".to_string(),
            ));
        }
        let mut a = arg.replace('"', "\"\"");
        if a.is_empty() || a.contains([' ', '\t', '\'']) {
            a = format!("'{}'", a.replace('\'', "''"));
        }
        out.push(a);
    }
    Ok(out.join(" "))
}

/// Scratch directory for one dispatch; removed on drop.
#[derive(Debug)]
pub struct JobWorkspace {
    dir: PathBuf,
    check: String,
}

impl JobWorkspace {
    pub fn create(work_dir: &Path, check: &str) -> std::io::Result<Self> {
        std::fs::create_dir_all(work_dir)?;
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or_default();
        let dir = work_dir.join(format!("job-{check}-{}-{nanos}", std::process::id()));
        std::fs::create_dir(&dir)?;
        debug!(dir = %dir.display(), "created job workspace");
        Ok(Self {
            dir,
            check: check.to_string(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn log(&self) -> PathBuf {
        self.dir.join(format!("{}.log", self.check))
    }

    pub fn output(&self) -> PathBuf {
        self.dir.join(format!("{}.out", self.check))
    }

    pub fn error(&self) -> PathBuf {
        self.dir.join(format!("{}.err", self.check))
    }

    pub fn submit_file(&self) -> PathBuf {
        self.dir.join(format!("{}.sub", self.check))
    }

    pub fn bundle(&self) -> PathBuf {
        self.dir.join(format!("{}.bundle.sh", self.check))
    }
}

impl Drop for JobWorkspace {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_dir_all(&self.dir) {
            warn!(dir = %self.dir.display(), error = %e, "could not remove job workspace");
        }
    }
}

#[derive(Debug, Clone)]
pub struct CondorBackend {
    poll_interval: Duration,
}

impl CondorBackend {
    pub fn new() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

impl Default for CondorBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl JobBackend for CondorBackend {
    fn is_running(&self) -> bool {
        match platform::run_command("condor_q", &[], CONDOR_TIMEOUT) {
            Ok(out) if out.success() => true,
            Ok(out) => {
                info!(exit_code = out.exit_code, stderr = %out.stderr.trim(), "condor does not seem to be running");
                false
            }
            Err(e) => {
                info!(error = %e, "condor does not seem to be running");
                false
            }
        }
    }

    fn submit(&self, descriptor: &SubmitDescriptor) -> Result<JobId, SubmitError> {
        let contents = descriptor.render()?;
        let sub_file = &descriptor.submit_file;
        std::fs::write(sub_file, &contents).map_err(|source| SubmitError::Io {
            path: sub_file.clone(),
            source,
        })?;
        debug!(submit_file = %sub_file.display(), "submit file:\n{contents}");

        let options = CommandRunOptions {
            env: Some(descriptor.env.clone()),
            current_dir: Some(descriptor.workdir.clone()),
        };
        let out = platform::run_command_with_options(
            "condor_submit",
            &[sub_file.as_os_str()],
            CONDOR_TIMEOUT,
            &options,
        )?;
        if !out.success() {
            return Err(SubmitError::Rejected {
                output: format!("{}{}", out.stdout, out.stderr),
            });
        }
        parse_cluster_id(&out.stdout).ok_or_else(|| SubmitError::Rejected {
            output: out.stdout.clone(),
        })
    }

    fn watch_log(
        &self,
        log: &Path,
        keywords: &[Keyword],
        timeout: Duration,
    ) -> Result<(TerminalEvent, String), WatchError> {
        watch_log(log, keywords, timeout, self.poll_interval, &SystemClock)
    }

    fn remove(&self, job: &JobId) -> Result<(), SubmitError> {
        let out = platform::run_command("condor_rm", &[job.as_str()], CONDOR_TIMEOUT)?;
        if out.success() {
            info!(job = %job, "removed batch job");
            Ok(())
        } else {
            Err(SubmitError::Rejected {
                output: format!("{}{}", out.stdout, out.stderr),
            })
        }
    }
}

/// Extracts `N` from `... submitted to cluster N.`
pub fn parse_cluster_id(stdout: &str) -> Option<JobId> {
    let idx = stdout.find("submitted to cluster")?;
    let rest = &stdout[idx + "submitted to cluster".len()..];
    let digits: String = rest
        .trim_start()
        .chars()
        .take_while(char::is_ascii_digit)
        .collect();
    if digits.is_empty() {
        None
    } else {
        Some(JobId(digits))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::GridResource;

    fn descriptor(universe: BatchUniverse) -> SubmitDescriptor {
        let dir = PathBuf::from("/var/tmp/rsv/batch-x");
        SubmitDescriptor {
            check: "org.osg.general.osg-version".to_string(),
            universe,
            proxy: Some(PathBuf::from("/tmp/rsvproxy")),
            executable: PathBuf::from("/usr/libexec/rsv/metrics/org.osg.general.osg-version"),
            arguments: vec![
                "-m".to_string(),
                "org.osg.general.osg-version".to_string(),
                "-u".to_string(),
                "ce.example.org".to_string(),
            ],
            globus_rsl: Some("(jobtype=single)".to_string()),
            class_ads: vec![("RSVProbe".to_string(), "True".to_string())],
            transfer_files: vec!["lib.sh".to_string(), "data.txt".to_string()],
            submit_file: dir.join("x.sub"),
            log: dir.join("x.log"),
            output: dir.join("x.out"),
            error: dir.join("x.err"),
            workdir: dir,
            env: Vec::new(),
        }
    }

    #[test]
    fn grid_submit_file_layout() {
        let d = descriptor(BatchUniverse::Grid(GridResource::Gram {
            host: "ce.example.org".to_string(),
            jobmanager: "fork".to_string(),
        }));
        let s = d.render().expect("render");
        assert!(s.starts_with("Universe = grid\ngrid_resource = gt2 ce.example.org/jobmanager-fork\n\n"));
        assert!(s.contains("x509userproxy = /tmp/rsvproxy\n"));
        assert!(s.contains("Arguments = \"-m org.osg.general.osg-version -u ce.example.org\"\n"));
        assert!(s.contains("globus_rsl = (jobtype=single)\n"));
        assert!(s.contains("transfer_input_files = lib.sh, data.txt\n"));
        assert!(!s.contains("+RSVProbe"));
        assert!(s.ends_with("Notification = never\nWhenToTransferOutput = ON_EXIT_OR_EVICT\n\nQueue\n"));
    }

    #[test]
    fn vanilla_submit_file_has_class_ads() {
        let s = descriptor(BatchUniverse::Vanilla).render().expect("render");
        assert!(s.starts_with("Universe = vanilla\n"));
        assert!(s.contains("+RSVProbe = True\n"));
    }

    #[test]
    fn htcondor_ce_sets_remote_universe() {
        let s = descriptor(BatchUniverse::Grid(GridResource::HtcondorCe {
            schedd: "ce".to_string(),
            collector: "ce:9619".to_string(),
        }))
        .render()
        .expect("render");
        assert!(s.contains("grid_resource = condor ce ce:9619\nremote_universe = local\n"));
    }

    #[test]
    fn quoting_rules() {
        let args: Vec<String> = ["plain", "two words", "it's", "", "say \"hi\""]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(
            quote_arguments(&args).expect("quote"),
            "plain 'two words' 'it''s' '' 'say \"\"hi\"\"'"
        );
        assert!(quote_arguments(&["a\nb".to_string()]).is_err());
    }

    #[test]
    fn cluster_id_from_submit_output() {
        let out = "Submitting job(s).\n1 job(s) submitted to cluster 4242.\n";
        assert_eq!(parse_cluster_id(out), Some(JobId("4242".to_string())));
        assert_eq!(parse_cluster_id("ERROR: nope"), None);
    }

    #[test]
    fn workspace_is_removed_on_drop() {
        let root = std::env::temp_dir().join(format!("rsvrun-ws-{}", std::process::id()));
        let ws = JobWorkspace::create(&root, "org.osg.test").expect("workspace");
        let dir = ws.dir().to_path_buf();
        std::fs::write(ws.log(), "log").expect("write");
        assert!(dir.is_dir());
        assert!(ws.submit_file().starts_with(&dir));
        assert!(ws.bundle().starts_with(&dir));
        drop(ws);
        assert!(!dir.exists());
        let _ = std::fs::remove_dir_all(&root);
    }
}
