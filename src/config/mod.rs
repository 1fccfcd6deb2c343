use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::core::TimeFormat;

pub const DEFAULT_CONFIG_DIR: &str = "/etc/rsv";
pub const CONFIG_FILE_NAME: &str = "rsv.toml";

#[derive(Debug, Clone, Serialize)]
pub struct EffectiveConfig {
    pub config_dir: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config_path: Option<String>,
    pub rsv: RsvConfig,
    pub consumers: Vec<ConsumerConfig>,
    #[serde(skip_serializing_if = "toml::Table::is_empty")]
    pub metric_defaults: toml::Table,
}

#[derive(Debug, Clone, Serialize)]
pub struct RsvConfig {
    pub job_timeout: u64,
    pub details_data_trim_length: usize,
    pub service_cert: Option<PathBuf>,
    pub service_key: Option<PathBuf>,
    pub service_proxy: Option<PathBuf>,
    pub proxy_file: Option<PathBuf>,
    pub use_condor_g: bool,
    pub ce_type: Option<String>,
    pub extra_globus_rsl: Option<String>,
    pub spool_dir: PathBuf,
    pub work_dir: PathBuf,
    pub log_dir: PathBuf,
    pub metrics_dir: PathBuf,
    pub gathered_at: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConsumerConfig {
    pub name: String,
    pub timestamp: TimeFormat,
}

/// One `check = true` entry from a host file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnabledCheck {
    pub target: String,
    pub check: String,
}

impl Default for RsvConfig {
    fn default() -> Self {
        Self {
            job_timeout: 1200,
            details_data_trim_length: 10000,
            service_cert: None,
            service_key: None,
            service_proxy: None,
            proxy_file: None,
            use_condor_g: true,
            ce_type: None,
            extra_globus_rsl: None,
            spool_dir: PathBuf::from("/var/spool/rsv"),
            work_dir: PathBuf::from("/var/tmp/rsv"),
            log_dir: PathBuf::from("/var/log/rsv"),
            metrics_dir: PathBuf::from("/usr/libexec/rsv/metrics"),
            gathered_at: None,
        }
    }
}

impl EffectiveConfig {
    pub fn with_config_dir(config_dir: PathBuf) -> Self {
        Self {
            rsv: RsvConfig::default(),
            consumers: Vec::new(),
            metric_defaults: toml::Table::new(),
            config_dir,
            config_path: None,
        }
    }

    /// Directory holding the per-check and per-target probe layers.
    pub fn probe_config_dir(&self) -> PathBuf {
        self.config_dir.join("metrics")
    }

    pub fn hosts_dir(&self) -> PathBuf {
        self.config_dir.join("hosts")
    }

    /// Reads `hosts/<target>.toml` files in name order and returns every check set to `true`,
    /// sorted by check name within a host.
    pub fn enabled_checks(&self) -> Result<Vec<EnabledCheck>> {
        let dir = self.hosts_dir();
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut files: Vec<PathBuf> = std::fs::read_dir(&dir)
            .with_context(|| format!("failed to read hosts directory: {}", dir.display()))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.extension().is_some_and(|ext| ext == "toml"))
            .collect();
        files.sort();

        let mut out = Vec::new();
        for path in files {
            let Some(target) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let s = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read host file: {}", path.display()))?;
            let raw: RawHostConfig = toml::from_str(&s)
                .with_context(|| format!("failed to parse host file (TOML): {}", path.display()))?;
            for (check, enabled) in raw.metrics.unwrap_or_default() {
                if enabled {
                    out.push(EnabledCheck {
                        target: target.to_string(),
                        check,
                    });
                }
            }
        }
        Ok(out)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct RawConfig {
    rsv: Option<RawRsvConfig>,
    consumer: Option<BTreeMap<String, RawConsumerConfig>>,
    metric_defaults: Option<toml::Table>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct RawRsvConfig {
    job_timeout: Option<u64>,
    details_data_trim_length: Option<usize>,
    consumers: Option<Vec<String>>,
    service_cert: Option<PathBuf>,
    service_key: Option<PathBuf>,
    service_proxy: Option<PathBuf>,
    proxy_file: Option<PathBuf>,
    use_condor_g: Option<bool>,
    ce_type: Option<String>,
    extra_globus_rsl: Option<String>,
    spool_dir: Option<PathBuf>,
    work_dir: Option<PathBuf>,
    log_dir: Option<PathBuf>,
    metrics_dir: Option<PathBuf>,
    gathered_at: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawConsumerConfig {
    timestamp: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawHostConfig {
    metrics: Option<BTreeMap<String, bool>>,
}

/// `--config-dir`, else `RSVRUN_CONFIG_DIR`, else `/etc/rsv`.
pub fn resolve_config_dir(cli_value: Option<&Path>) -> PathBuf {
    if let Some(dir) = cli_value {
        return dir.to_path_buf();
    }
    match std::env::var("RSVRUN_CONFIG_DIR") {
        Ok(v) if !v.trim().is_empty() => PathBuf::from(v.trim()),
        _ => PathBuf::from(DEFAULT_CONFIG_DIR),
    }
}

pub fn load(config_dir: &Path) -> Result<EffectiveConfig> {
    let mut cfg = EffectiveConfig::with_config_dir(config_dir.to_path_buf());

    let path = config_dir.join(CONFIG_FILE_NAME);
    if path.exists() {
        let s = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let raw: RawConfig = toml::from_str(&s)
            .with_context(|| format!("failed to parse config file (TOML): {}", path.display()))?;
        apply_raw_config(&mut cfg, raw);
        cfg.config_path = Some(path.display().to_string());
    }

    apply_env_overrides(&mut cfg)?;

    Ok(cfg)
}

fn apply_raw_config(cfg: &mut EffectiveConfig, raw: RawConfig) {
    let mut consumer_names = Vec::new();

    if let Some(rsv) = raw.rsv {
        let r = &mut cfg.rsv;
        if let Some(v) = rsv.job_timeout {
            r.job_timeout = v;
        }
        if let Some(v) = rsv.details_data_trim_length {
            r.details_data_trim_length = v;
        }
        if let Some(v) = rsv.consumers {
            consumer_names = v;
        }
        r.service_cert = rsv.service_cert.or(r.service_cert.take());
        r.service_key = rsv.service_key.or(r.service_key.take());
        r.service_proxy = rsv.service_proxy.or(r.service_proxy.take());
        r.proxy_file = rsv.proxy_file.or(r.proxy_file.take());
        if let Some(v) = rsv.use_condor_g {
            r.use_condor_g = v;
        }
        r.ce_type = rsv.ce_type.or(r.ce_type.take());
        r.extra_globus_rsl = rsv.extra_globus_rsl.or(r.extra_globus_rsl.take());
        if let Some(v) = rsv.spool_dir {
            r.spool_dir = v;
        }
        if let Some(v) = rsv.work_dir {
            r.work_dir = v;
        }
        if let Some(v) = rsv.log_dir {
            r.log_dir = v;
        }
        if let Some(v) = rsv.metrics_dir {
            r.metrics_dir = v;
        }
        r.gathered_at = rsv.gathered_at.or(r.gathered_at.take());
    }

    let tables = raw.consumer.unwrap_or_default();
    cfg.consumers = consumers_from_names(consumer_names.iter().map(String::as_str), &tables);

    if let Some(defaults) = raw.metric_defaults {
        cfg.metric_defaults = defaults;
    }
}

fn consumers_from_names<'a>(
    names: impl Iterator<Item = &'a str>,
    tables: &BTreeMap<String, RawConsumerConfig>,
) -> Vec<ConsumerConfig> {
    let mut out: Vec<ConsumerConfig> = Vec::new();
    for name in names.map(str::trim).filter(|s| !s.is_empty()) {
        if out.iter().any(|c| c.name == name) {
            continue;
        }
        let timestamp = tables
            .get(name)
            .and_then(|t| t.timestamp.as_deref())
            .map(TimeFormat::from_config)
            .unwrap_or_default();
        out.push(ConsumerConfig {
            name: name.to_string(),
            timestamp,
        });
    }
    out
}

fn apply_env_overrides(cfg: &mut EffectiveConfig) -> Result<()> {
    if let Ok(v) = std::env::var("RSVRUN_JOB_TIMEOUT") {
        cfg.rsv.job_timeout = v.trim().parse::<u64>().context("RSVRUN_JOB_TIMEOUT")?;
    }
    if let Ok(v) = std::env::var("RSVRUN_DETAILS_DATA_TRIM_LENGTH") {
        cfg.rsv.details_data_trim_length = v
            .trim()
            .parse::<usize>()
            .context("RSVRUN_DETAILS_DATA_TRIM_LENGTH")?;
    }
    if let Ok(v) = std::env::var("RSVRUN_CONSUMERS") {
        // Keep the per-consumer timestamp settings from the file for names listed again.
        let previous = std::mem::take(&mut cfg.consumers);
        for name in v.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            if cfg.consumers.iter().any(|c| c.name == name) {
                continue;
            }
            let timestamp = previous
                .iter()
                .find(|c| c.name == name)
                .map(|c| c.timestamp)
                .unwrap_or_default();
            cfg.consumers.push(ConsumerConfig {
                name: name.to_string(),
                timestamp,
            });
        }
    }
    if let Ok(v) = std::env::var("RSVRUN_SPOOL_DIR") {
        if !v.trim().is_empty() {
            cfg.rsv.spool_dir = PathBuf::from(v.trim());
        }
    }
    if let Ok(v) = std::env::var("RSVRUN_WORK_DIR") {
        if !v.trim().is_empty() {
            cfg.rsv.work_dir = PathBuf::from(v.trim());
        }
    }
    if let Ok(v) = std::env::var("RSVRUN_LOG_DIR") {
        if !v.trim().is_empty() {
            cfg.rsv.log_dir = PathBuf::from(v.trim());
        }
    }
    if let Ok(v) = std::env::var("RSVRUN_USE_CONDOR_G") {
        cfg.rsv.use_condor_g = parse_bool(&v).context("RSVRUN_USE_CONDOR_G")?;
    }

    Ok(())
}

pub fn parse_bool(s: &str) -> Result<bool> {
    let s = s.trim().to_ascii_lowercase();
    match s.as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(anyhow::anyhow!(
            "invalid boolean: {s} (expected true|false|1|0|yes|no|on|off)"
        )),
    }
}
