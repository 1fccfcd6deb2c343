use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

fn rsvrun_cmd(root: &Path) -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_rsvrun"));
    cmd.env_remove("RSVRUN_CONFIG_DIR");
    cmd.env_remove("RSVRUN_LOG");
    cmd.env_remove("RSVRUN_JOB_TIMEOUT");
    cmd.env_remove("RSVRUN_DETAILS_DATA_TRIM_LENGTH");
    cmd.env_remove("RSVRUN_CONSUMERS");
    cmd.env_remove("RSVRUN_SPOOL_DIR");
    cmd.env_remove("RSVRUN_WORK_DIR");
    cmd.env_remove("RSVRUN_LOG_DIR");
    cmd.env_remove("RSVRUN_USE_CONDOR_G");
    let path = format!(
        "{}:{}",
        root.join("bin").display(),
        std::env::var("PATH").unwrap_or_default()
    );
    cmd.env("PATH", path);
    cmd.arg("--config-dir").arg(root.join("etc"));
    cmd
}

fn make_temp_root() -> PathBuf {
    static ROOT_SEQ: AtomicU64 = AtomicU64::new(0);

    let temp = std::env::temp_dir();
    let seq = ROOT_SEQ.fetch_add(1, Ordering::Relaxed);
    let uniq = format!("rsvrun-timeout-test-{}-{seq}", std::process::id());
    let root = temp.join(uniq);
    let _ = std::fs::remove_dir_all(&root);
    std::fs::create_dir_all(root.join("bin")).expect("create root");
    root
}

fn write_file(path: &Path, bytes: &[u8]) {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).expect("mkdirs");
    }
    std::fs::write(path, bytes).expect("write");
}

#[cfg(unix)]
fn write_exec(path: &Path, script: &str) {
    use std::os::unix::fs::PermissionsExt;

    write_file(path, script.as_bytes());
    let mut perms = std::fs::metadata(path).expect("metadata").permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(path, perms).expect("chmod");
}

fn write_rsv_toml(root: &Path) {
    let toml = format!(
        "[rsv]\nspool-dir = \"{}\"\nwork-dir = \"{}\"\nlog-dir = \"{}\"\nmetrics-dir = \"{}\"\ngathered-at = \"rsv.example.org\"\nconsumers = [\"html-consumer\"]\n",
        root.join("spool").display(),
        root.join("work").display(),
        root.join("log").display(),
        root.join("libexec").display(),
    );
    write_file(&root.join("etc/rsv.toml"), toml.as_bytes());
}

fn record(root: &Path) -> String {
    let dir = root.join("spool/html-consumer");
    let entries: Vec<PathBuf> = std::fs::read_dir(&dir)
        .expect("consumer dir")
        .filter_map(|e| e.ok().map(|e| e.path()))
        .collect();
    assert_eq!(entries.len(), 1, "entries={entries:?}");
    std::fs::read_to_string(&entries[0]).expect("read record")
}

fn dump(out: &Output) -> String {
    format!(
        "status={:?}\nstdout={}\nstderr={}",
        out.status.code(),
        String::from_utf8_lossy(&out.stdout),
        String::from_utf8_lossy(&out.stderr)
    )
}

fn work_dir_is_empty(root: &Path) -> bool {
    std::fs::read_dir(root.join("work"))
        .map(|mut rd| rd.next().is_none())
        .unwrap_or(true)
}

#[cfg(unix)]
#[test]
fn local_probe_is_killed_at_its_timeout() {
    let root = make_temp_root();
    write_rsv_toml(&root);
    let pid_file = root.join("probe.pid");
    write_exec(
        &root.join("libexec/org.osg.test.hang"),
        &format!(
            "#!/bin/sh\necho $$ > '{}'\nsleep 30\nprintf 'RSV BRIEF RESULTS:\\nOK\\nlate\\n'\n",
            pid_file.display()
        ),
    );
    write_file(
        &root.join("etc/metrics/org.osg.test.hang.toml"),
        b"service-type = \"OSG-CE\"\nexecute = \"local\"\noutput-format = \"brief\"\nneed-proxy = false\nno-ping = true\njob-timeout = 1\n",
    );

    let start = Instant::now();
    let out = rsvrun_cmd(&root)
        .args(["run", "-m", "org.osg.test.hang", "-u", "ce.example.org"])
        .output()
        .expect("run rsvrun");
    let elapsed = start.elapsed();
    assert!(
        elapsed < Duration::from_secs(15),
        "run took too long: elapsed={elapsed:?}\n{}",
        dump(&out)
    );
    assert_eq!(out.status.code(), Some(10), "{}", dump(&out));

    let text = record(&root);
    assert!(text.contains("metricStatus: CRITICAL\n"), "{text}");
    assert!(text.contains("job did not finish within 1 seconds"), "{text}");

    let pid = std::fs::read_to_string(&pid_file).expect("pid file");
    let alive = Command::new("kill")
        .args(["-0", pid.trim()])
        .output()
        .expect("kill -0")
        .status
        .success();
    assert!(!alive, "probe process {} is still running", pid.trim());

    let _ = std::fs::remove_dir_all(&root);
}

#[cfg(unix)]
fn write_condor_tools(root: &Path, submit_body: &str) -> PathBuf {
    let rm_calls = root.join("condor_rm.calls");
    write_exec(&root.join("bin/condor_q"), "#!/bin/sh\nexit 0\n");
    write_exec(
        &root.join("bin/condor_rm"),
        &format!("#!/bin/sh\necho \"$*\" >> '{}'\nexit 0\n", rm_calls.display()),
    );
    write_exec(&root.join("bin/condor_submit"), submit_body);
    rm_calls
}

#[cfg(unix)]
fn write_batch_probe(root: &Path) {
    write_file(
        &root.join("etc/metrics/org.osg.test.batch.toml"),
        b"service-type = \"OSG-CE\"\nexecute = \"vanilla\"\noutput-format = \"brief\"\nneed-proxy = false\nno-ping = true\njob-timeout = 1\n",
    );
}

#[cfg(unix)]
#[test]
fn batch_job_is_removed_exactly_once_on_timeout() {
    let root = make_temp_root();
    write_rsv_toml(&root);
    write_batch_probe(&root);
    let rm_calls = write_condor_tools(
        &root,
        "#!/bin/sh\necho 'Submitting job(s).'\necho '1 job(s) submitted to cluster 42.'\nexit 0\n",
    );

    let out = rsvrun_cmd(&root)
        .args(["run", "-m", "org.osg.test.batch", "-u", "ce.example.org"])
        .output()
        .expect("run rsvrun");
    assert_eq!(out.status.code(), Some(10), "{}", dump(&out));

    let calls = std::fs::read_to_string(&rm_calls).expect("condor_rm calls");
    assert_eq!(calls, "42\n");
    assert!(record(&root).contains("Timeout hit - job did not finish within 1 seconds"));
    assert!(work_dir_is_empty(&root));

    let _ = std::fs::remove_dir_all(&root);
}

#[cfg(unix)]
#[test]
fn batch_job_output_is_parsed_when_it_terminates() {
    let root = make_temp_root();
    write_rsv_toml(&root);
    write_file(
        &root.join("etc/metrics/org.osg.test.batch.toml"),
        b"service-type = \"OSG-CE\"\nexecute = \"vanilla\"\noutput-format = \"brief\"\nneed-proxy = false\nno-ping = true\njob-timeout = 30\n",
    );
    let rm_calls = write_condor_tools(
        &root,
        r#"#!/bin/sh
sub="$1"
log=$(sed -n 's/^Log = //p' "$sub")
out=$(sed -n 's/^Output = //p' "$sub")
printf 'RSV BRIEF RESULTS:\nOK\nran on the batch gateway\n' > "$out"
printf '005 Job terminated.\n\t(1) Normal termination (return value 0)\n' > "$log"
echo '1 job(s) submitted to cluster 7.'
"#,
    );

    let out = rsvrun_cmd(&root)
        .args(["run", "-m", "org.osg.test.batch", "-u", "ce.example.org"])
        .output()
        .expect("run rsvrun");
    assert!(out.status.success(), "{}", dump(&out));

    let text = record(&root);
    assert!(text.contains("metricStatus: OK\n"), "{text}");
    assert!(text.contains("detailsData: ran on the batch gateway\n"));
    assert!(!rm_calls.exists());
    assert!(work_dir_is_empty(&root));

    let _ = std::fs::remove_dir_all(&root);
}

#[cfg(unix)]
#[test]
fn rejected_submission_is_not_removed() {
    let root = make_temp_root();
    write_rsv_toml(&root);
    write_batch_probe(&root);
    let rm_calls = write_condor_tools(
        &root,
        "#!/bin/sh\necho 'ERROR: Failed to connect to local queue manager' >&2\nexit 1\n",
    );

    let out = rsvrun_cmd(&root)
        .args(["run", "-m", "org.osg.test.batch", "-u", "ce.example.org"])
        .output()
        .expect("run rsvrun");
    assert_eq!(out.status.code(), Some(10), "{}", dump(&out));
    assert!(!rm_calls.exists());
    let text = record(&root);
    assert!(text.contains("submission failed"), "{text}");
    assert!(text.contains("Failed to connect to local queue manager"));

    let _ = std::fs::remove_dir_all(&root);
}

#[cfg(unix)]
#[test]
fn stopped_batch_system_is_reported_without_submitting() {
    let root = make_temp_root();
    write_rsv_toml(&root);
    write_batch_probe(&root);
    let submitted = root.join("submitted");
    write_condor_tools(
        &root,
        &format!("#!/bin/sh\ntouch '{}'\nexit 0\n", submitted.display()),
    );
    write_exec(&root.join("bin/condor_q"), "#!/bin/sh\necho 'Failed to fetch ads' >&2\nexit 1\n");

    let out = rsvrun_cmd(&root)
        .args(["run", "-m", "org.osg.test.batch", "-u", "ce.example.org"])
        .output()
        .expect("run rsvrun");
    assert_eq!(out.status.code(), Some(10), "{}", dump(&out));
    assert!(!submitted.exists());
    assert!(record(&root).contains("The batch system is not running"));

    let _ = std::fs::remove_dir_all(&root);
}
