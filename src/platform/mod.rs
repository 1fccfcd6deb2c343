use std::ffi::{OsStr, OsString};
use std::io::Read;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::{Arc, Mutex, mpsc};
use std::thread;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::debug;
use wait_timeout::ChildExt;

#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub elapsed: Duration,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

#[derive(Debug, Clone, Default)]
pub struct CommandRunOptions {
    /// Full environment for the child. `None` inherits the current process environment.
    pub env: Option<Vec<(OsString, OsString)>>,
    pub current_dir: Option<PathBuf>,
}

#[derive(Debug, Error)]
pub enum RunError {
    #[error("failed to start process: {cmd}")]
    Spawn {
        cmd: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to wait for process: {cmd}")]
    Wait {
        cmd: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Command timed out (timeout={}s): {cmd}", .timeout.as_secs())]
    TimedOut { cmd: String, timeout: Duration },
}

impl RunError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, RunError::TimedOut { .. })
    }
}

pub fn run_command(cmd: &str, args: &[&str], timeout: Duration) -> Result<CommandOutput, RunError> {
    run_command_with_options(cmd, args, timeout, &CommandRunOptions::default())
}

pub fn run_command_with_options<S: AsRef<OsStr>>(
    cmd: &str,
    args: &[S],
    timeout: Duration,
    options: &CommandRunOptions,
) -> Result<CommandOutput, RunError> {
    let cmdline = format_cmdline(cmd, args);

    let mut command = Command::new(cmd);
    command
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    if let Some(env) = &options.env {
        command.env_clear();
        command.envs(env.iter().map(|(k, v)| (k, v)));
    }
    if let Some(dir) = &options.current_dir {
        command.current_dir(dir);
    }

    // Own process group, so a timeout can take down everything the command forked.
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        command.process_group(0);
    }

    debug!(command = %cmdline, timeout_secs = timeout.as_secs(), "spawning process");
    let started = Instant::now();
    let mut child = command.spawn().map_err(|source| RunError::Spawn {
        cmd: cmdline.clone(),
        source,
    })?;

    let stdout_reader = child.stdout.take().map(drain);
    let stderr_reader = child.stderr.take().map(drain);

    let status = match child.wait_timeout(timeout) {
        Ok(Some(status)) => status,
        Ok(None) => {
            kill_process_group(&mut child);
            abandon_after_grace(stdout_reader, stderr_reader);
            return Err(RunError::TimedOut {
                cmd: cmdline,
                timeout,
            });
        }
        Err(source) => {
            kill_process_group(&mut child);
            abandon_after_grace(stdout_reader, stderr_reader);
            return Err(RunError::Wait {
                cmd: cmdline,
                source,
            });
        }
    };

    // A descendant that outlives the command may still hold the pipes open.
    let deadline = Instant::now() + DRAIN_GRACE;
    let stdout = collect(stdout_reader, deadline);
    let stderr = collect(stderr_reader, deadline);
    let exit_code = status.code().unwrap_or(-1);
    debug!(command = %cmdline, exit_code, "process exited");

    Ok(CommandOutput {
        exit_code,
        stdout,
        stderr,
        elapsed: started.elapsed(),
    })
}

/// How long pipe readers may keep going once the command itself is gone.
const DRAIN_GRACE: Duration = Duration::from_secs(2);

/// Pipe reader running on its own thread. Bytes land in `buf` as they arrive.
struct Drain {
    buf: Arc<Mutex<Vec<u8>>>,
    done: mpsc::Receiver<()>,
}

fn drain<R: Read + Send + 'static>(mut reader: R) -> Drain {
    let buf = Arc::new(Mutex::new(Vec::new()));
    let (tx, done) = mpsc::channel();
    let shared = Arc::clone(&buf);
    thread::spawn(move || {
        let mut chunk = [0u8; 8192];
        loop {
            match reader.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => match shared.lock() {
                    Ok(mut b) => b.extend_from_slice(&chunk[..n]),
                    Err(poisoned) => poisoned.into_inner().extend_from_slice(&chunk[..n]),
                },
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(_) => break,
            }
        }
        let _ = tx.send(());
    });
    Drain { buf, done }
}

/// Waits for end of stream until `deadline`, then takes whatever was read so far. A reader
/// that is still blocked is left behind.
fn collect(reader: Option<Drain>, deadline: Instant) -> String {
    let Some(reader) = reader else {
        return String::new();
    };
    let wait = deadline.saturating_duration_since(Instant::now());
    if reader.done.recv_timeout(wait).is_err() {
        debug!("pipe still open after the command finished, leaving its reader behind");
    }
    let bytes = match reader.buf.lock() {
        Ok(b) => b.clone(),
        Err(poisoned) => poisoned.into_inner().clone(),
    };
    String::from_utf8_lossy(&bytes).into_owned()
}

fn abandon_after_grace(stdout: Option<Drain>, stderr: Option<Drain>) {
    let deadline = Instant::now() + DRAIN_GRACE;
    let _ = collect(stdout, deadline);
    let _ = collect(stderr, deadline);
}

/// Kills the whole group while the leader is still unreaped, so the group id cannot have
/// been recycled.
fn kill_process_group(child: &mut Child) {
    #[cfg(unix)]
    unsafe {
        libc::kill(-(child.id() as libc::pid_t), libc::SIGKILL);
    }
    let _ = child.kill();
    let _ = child.wait();
}

pub fn format_cmdline<S: AsRef<OsStr>>(cmd: &str, args: &[S]) -> String {
    let mut out = String::new();
    out.push_str(cmd);
    for arg in args {
        let arg = arg.as_ref().to_string_lossy();
        out.push(' ');
        if arg.is_empty() || arg.contains(char::is_whitespace) || arg.contains('\'') {
            out.push('\'');
            out.push_str(&arg.replace('\'', "'\\''"));
            out.push('\'');
        } else {
            out.push_str(&arg);
        }
    }
    out
}

/// Fully qualified name of this host, falling back to the bare hostname.
pub fn local_fqdn() -> String {
    let Some(host) = hostname() else {
        return "localhost".to_string();
    };
    canonical_name(&host).unwrap_or(host)
}

#[cfg(unix)]
fn hostname() -> Option<String> {
    let mut buf = vec![0u8; 256];
    let rc = unsafe { libc::gethostname(buf.as_mut_ptr() as *mut libc::c_char, buf.len()) };
    if rc != 0 {
        return None;
    }
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    let name = String::from_utf8_lossy(&buf[..end]).trim().to_string();
    if name.is_empty() { None } else { Some(name) }
}

#[cfg(not(unix))]
fn hostname() -> Option<String> {
    std::env::var("COMPUTERNAME").ok()
}

#[cfg(unix)]
fn canonical_name(host: &str) -> Option<String> {
    use std::ffi::{CStr, CString};

    let c_host = CString::new(host).ok()?;
    unsafe {
        let mut hints: libc::addrinfo = std::mem::zeroed();
        hints.ai_family = libc::AF_UNSPEC;
        hints.ai_flags = libc::AI_CANONNAME;
        let mut res: *mut libc::addrinfo = std::ptr::null_mut();

        let rc = libc::getaddrinfo(c_host.as_ptr(), std::ptr::null(), &hints, &mut res);
        if rc != 0 || res.is_null() {
            return None;
        }
        let canon = (*res).ai_canonname;
        let name = if canon.is_null() {
            None
        } else {
            Some(CStr::from_ptr(canon).to_string_lossy().into_owned())
        };
        libc::freeaddrinfo(res);
        name.filter(|n| !n.trim().is_empty())
    }
}

#[cfg(not(unix))]
fn canonical_name(_host: &str) -> Option<String> {
    None
}

/// Renders a Unix timestamp as `YYYY-MM-DD HH:MM:SS TZ` using the host's zone rules.
#[cfg(unix)]
pub fn local_time_string(epoch: i64) -> Option<String> {
    let t = epoch as libc::time_t;
    let mut buf = [0u8; 64];
    let fmt = c"%Y-%m-%d %H:%M:%S %Z";

    let n = unsafe {
        let mut tm: libc::tm = std::mem::zeroed();
        if libc::localtime_r(&t, &mut tm).is_null() {
            return None;
        }
        libc::strftime(
            buf.as_mut_ptr() as *mut libc::c_char,
            buf.len(),
            fmt.as_ptr(),
            &tm,
        )
    };
    if n == 0 {
        return None;
    }
    Some(String::from_utf8_lossy(&buf[..n]).into_owned())
}

#[cfg(not(unix))]
pub fn local_time_string(_epoch: i64) -> Option<String> {
    None
}
