//! Credential guard: makes sure a usable proxy exists before a check that needs one.

use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;
use tracing::{info, warn};

use crate::config::RsvConfig;
use crate::core::FailureReport;
use crate::platform::{self, CommandOutput, RunError};

/// A user proxy must outlive this or the check is refused.
pub const USER_PROXY_MIN_VALIDITY: Duration = Duration::from_secs(10 * 60);
/// A service proxy closer than this to expiry is renewed.
pub const SERVICE_PROXY_RENEW_WINDOW: Duration = Duration::from_secs(6 * 60 * 60);
pub const SERVICE_PROXY_VALIDITY: &str = "12:00";

const DEFAULT_SERVICE_KEY: &str = "/etc/grid-security/rsv/rsvkey.pem";
const DEFAULT_SERVICE_PROXY: &str = "/tmp/rsvproxy";
const TOOL_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CredentialSource {
    NoCredentialConfigured,
    UserProxy {
        path: PathBuf,
    },
    ServiceProxy {
        cert: PathBuf,
        key: PathBuf,
        proxy: PathBuf,
    },
}

impl CredentialSource {
    /// A configured service certificate wins over a user proxy.
    pub fn from_config(cfg: &RsvConfig) -> Self {
        if let Some(cert) = &cfg.service_cert {
            return CredentialSource::ServiceProxy {
                cert: cert.clone(),
                key: cfg
                    .service_key
                    .clone()
                    .unwrap_or_else(|| PathBuf::from(DEFAULT_SERVICE_KEY)),
                proxy: cfg
                    .service_proxy
                    .clone()
                    .unwrap_or_else(|| PathBuf::from(DEFAULT_SERVICE_PROXY)),
            };
        }
        match &cfg.proxy_file {
            Some(path) => CredentialSource::UserProxy { path: path.clone() },
            None => CredentialSource::NoCredentialConfigured,
        }
    }
}

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("no proxy is configured")]
    NotConfigured,
    #[error("user proxy does not exist: {}", .path.display())]
    Missing { path: PathBuf },
    #[error("user proxy is expired or expiring within {minutes} minutes: {}", .path.display())]
    Expiring {
        path: PathBuf,
        minutes: u64,
        tool_output: String,
    },
    #[error("service proxy could not be renewed: {}", .proxy.display())]
    RenewalFailed {
        cert: PathBuf,
        key: PathBuf,
        proxy: PathBuf,
        stdout: String,
        stderr: String,
    },
}

impl CredentialError {
    pub fn to_failure(&self) -> FailureReport {
        match self {
            CredentialError::NotConfigured => FailureReport::NoProxyConfigured,
            CredentialError::Missing { path } => FailureReport::MissingUserProxy {
                path: path.display().to_string(),
            },
            CredentialError::Expiring {
                path,
                minutes,
                tool_output,
            } => FailureReport::ExpiringUserProxy {
                path: path.display().to_string(),
                minutes: *minutes,
                tool_output: tool_output.clone(),
            },
            CredentialError::RenewalFailed {
                cert,
                key,
                proxy,
                stdout,
                stderr,
            } => FailureReport::ServiceProxyRenewalFailed {
                cert: cert.display().to_string(),
                key: key.display().to_string(),
                proxy: proxy.display().to_string(),
                stdout: stdout.clone(),
                stderr: stderr.clone(),
            },
        }
    }
}

/// External certificate tooling.
pub trait CertTool {
    /// Exit 0 means the proxy stays valid for at least `seconds`.
    fn check_valid_for(&self, proxy: &Path, seconds: u64) -> Result<CommandOutput, RunError>;

    fn issue(
        &self,
        cert: &Path,
        key: &Path,
        out: &Path,
        valid: &str,
    ) -> Result<CommandOutput, RunError>;
}

/// `openssl x509 -checkend` for inspection, `voms-proxy-init` for issuance.
#[derive(Debug, Clone, Copy, Default)]
pub struct OpensslTool;

impl CertTool for OpensslTool {
    fn check_valid_for(&self, proxy: &Path, seconds: u64) -> Result<CommandOutput, RunError> {
        let proxy = proxy.display().to_string();
        let seconds = seconds.to_string();
        platform::run_command(
            "openssl",
            &["x509", "-in", &proxy, "-noout", "-enddate", "-checkend", &seconds],
            TOOL_TIMEOUT,
        )
    }

    fn issue(
        &self,
        cert: &Path,
        key: &Path,
        out: &Path,
        valid: &str,
    ) -> Result<CommandOutput, RunError> {
        let cert = cert.display().to_string();
        let key = key.display().to_string();
        let out = out.display().to_string();
        platform::run_command(
            "voms-proxy-init",
            &["-cert", &cert, "-key", &key, "-out", &out, "-valid", valid],
            TOOL_TIMEOUT,
        )
    }
}

/// Proxy file that passed validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveProxy {
    pub path: PathBuf,
}

impl ActiveProxy {
    /// Publishes the proxy location to every process started afterwards.
    pub fn export(&self) {
        // SAFETY: called from the main thread between checks, while no other thread of
        // this process is running or reading the environment.
        unsafe {
            std::env::set_var("X509_USER_PROXY", &self.path);
            std::env::set_var("X509_PROXY_FILE", &self.path);
        }
    }
}

pub fn validate(
    source: &CredentialSource,
    need_proxy: bool,
    tool: &dyn CertTool,
) -> Result<Option<ActiveProxy>, CredentialError> {
    if !need_proxy {
        info!("check does not require a proxy");
        return Ok(None);
    }

    match source {
        CredentialSource::NoCredentialConfigured => Err(CredentialError::NotConfigured),
        CredentialSource::UserProxy { path } => validate_user_proxy(path, tool).map(Some),
        CredentialSource::ServiceProxy { cert, key, proxy } => {
            renew_service_proxy(cert, key, proxy, tool).map(Some)
        }
    }
}

fn validate_user_proxy(path: &Path, tool: &dyn CertTool) -> Result<ActiveProxy, CredentialError> {
    if !path.exists() {
        return Err(CredentialError::Missing {
            path: path.to_path_buf(),
        });
    }

    let minutes = USER_PROXY_MIN_VALIDITY.as_secs() / 60;
    let tool_output = match tool.check_valid_for(path, USER_PROXY_MIN_VALIDITY.as_secs()) {
        Ok(out) if out.success() => {
            info!(proxy = %path.display(), "user proxy is valid");
            return Ok(ActiveProxy {
                path: path.to_path_buf(),
            });
        }
        Ok(out) => format!("{}{}", out.stdout, out.stderr),
        Err(e) => e.to_string(),
    };
    Err(CredentialError::Expiring {
        path: path.to_path_buf(),
        minutes,
        tool_output,
    })
}

fn renew_service_proxy(
    cert: &Path,
    key: &Path,
    proxy: &Path,
    tool: &dyn CertTool,
) -> Result<ActiveProxy, CredentialError> {
    let active = ActiveProxy {
        path: proxy.to_path_buf(),
    };

    if proxy.exists() {
        match tool.check_valid_for(proxy, SERVICE_PROXY_RENEW_WINDOW.as_secs()) {
            Ok(out) if out.success() => {
                info!(proxy = %proxy.display(), "service proxy is valid for at least 6 hours");
                return Ok(active);
            }
            Ok(_) => info!(proxy = %proxy.display(), "service proxy expires within 6 hours, renewing"),
            Err(e) => warn!(proxy = %proxy.display(), error = %e, "could not inspect service proxy, renewing"),
        }
    }

    match tool.issue(cert, key, proxy, SERVICE_PROXY_VALIDITY) {
        Ok(out) if out.success() => {
            info!(proxy = %proxy.display(), "service proxy renewed");
            Ok(active)
        }
        Ok(out) => Err(CredentialError::RenewalFailed {
            cert: cert.to_path_buf(),
            key: key.to_path_buf(),
            proxy: proxy.to_path_buf(),
            stdout: out.stdout,
            stderr: out.stderr,
        }),
        Err(e) => Err(CredentialError::RenewalFailed {
            cert: cert.to_path_buf(),
            key: key.to_path_buf(),
            proxy: proxy.to_path_buf(),
            stdout: String::new(),
            stderr: e.to_string(),
        }),
    }
}
