//! Probe descriptor: resolves a check's layered configuration into an immutable [`ProbeConfig`].

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;
use toml::Value;
use tracing::{debug, warn};

use crate::config::{self, EffectiveConfig};

/// Sub-tables merged key by key across layers instead of being replaced wholesale.
const MERGED_TABLES: [&str; 3] = ["args", "env", "class-ads"];

#[derive(Debug, Error)]
pub enum ProbeConfigError {
    #[error("failed to read probe config {path}")]
    Unreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse probe config (TOML) {path}")]
    InvalidToml {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("required probe config file does not exist: {0}")]
    MissingFile(PathBuf),
    #[error("metric {check} is missing required key '{key}'")]
    MissingKey { check: String, key: &'static str },
    #[error("output-format '{0}' is not supported (expected brief|wlcg|wlcg-multiple)")]
    InvalidOutputFormat(String),
    #[error("execute '{0}' is not supported (expected local|grid|vanilla|remote-grid|remote-batch-gateway)")]
    InvalidExecutionMode(String),
    #[error("cron-interval is invalid: '{0}'")]
    InvalidCron(String),
    #[error("invalid knob '{0}' (expected key=value)")]
    InvalidKnob(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvAction {
    Set,
    Unset,
    Append,
    Prepend,
}

impl EnvAction {
    pub const fn as_str(self) -> &'static str {
        match self {
            EnvAction::Set => "SET",
            EnvAction::Unset => "UNSET",
            EnvAction::Append => "APPEND",
            EnvAction::Prepend => "PREPEND",
        }
    }
}

impl FromStr for EnvAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "SET" => Ok(EnvAction::Set),
            "UNSET" => Ok(EnvAction::Unset),
            "APPEND" => Ok(EnvAction::Append),
            "PREPEND" => Ok(EnvAction::Prepend),
            other => Err(format!(
                "action '{other}' must be one of (SET UNSET APPEND PREPEND)"
            )),
        }
    }
}

/// One `VAR = "ACTION | VALUE"` entry from the `[env]` table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvDelta {
    pub var: String,
    pub action: EnvAction,
    pub value: String,
}

impl EnvDelta {
    pub fn parse(var: &str, setting: &str) -> Result<Self, String> {
        let (action, value) = match setting.split_once('|') {
            Some((a, v)) => (a.trim(), v.trim()),
            None => (setting.trim(), ""),
        };
        let action: EnvAction = action.parse()?;
        if value.is_empty() && action != EnvAction::Unset {
            return Err(
                "format must be VAR = \"ACTION | VALUE\" (VALUE may be blank if ACTION is UNSET)"
                    .to_string(),
            );
        }
        Ok(Self {
            var: var.to_string(),
            action,
            value: value.to_string(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Brief,
    SingleRecord,
    MultiRecord,
}

impl OutputFormat {
    pub const fn as_str(self) -> &'static str {
        match self {
            OutputFormat::Brief => "brief",
            OutputFormat::SingleRecord => "wlcg",
            OutputFormat::MultiRecord => "wlcg-multiple",
        }
    }
}

impl FromStr for OutputFormat {
    type Err = ProbeConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "brief" => Ok(OutputFormat::Brief),
            "wlcg" | "single-record" => Ok(OutputFormat::SingleRecord),
            "wlcg-multiple" | "multi-record" => Ok(OutputFormat::MultiRecord),
            _ => Err(ProbeConfigError::InvalidOutputFormat(s.to_string())),
        }
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a batch-gateway job is sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GridResource {
    Gram { host: String, jobmanager: String },
    HtcondorCe { schedd: String, collector: String },
    Cream { host: String, jobmanager: String },
}

impl GridResource {
    /// Value of the `grid_resource` submit command.
    pub fn render(&self) -> String {
        match self {
            GridResource::Gram { host, jobmanager } => format!("gt2 {host}/jobmanager-{jobmanager}"),
            GridResource::HtcondorCe { schedd, collector } => format!("condor {schedd} {collector}"),
            GridResource::Cream { host, jobmanager } => format!("cream {host}:8443/{jobmanager}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchUniverse {
    Grid(GridResource),
    Vanilla,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionMode {
    Local,
    RemoteGrid { jobmanager: String },
    RemoteBatchGateway(BatchUniverse),
}

impl ExecutionMode {
    pub fn label(&self) -> &'static str {
        match self {
            ExecutionMode::Local => "local",
            ExecutionMode::RemoteGrid { .. } => "remote-grid",
            ExecutionMode::RemoteBatchGateway(_) => "remote-batch-gateway",
        }
    }
}

/// Five-field cron interval. Only validated here; the external scheduler interprets it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronInterval {
    pub minute: String,
    pub hour: String,
    pub day_of_month: String,
    pub month: String,
    pub day_of_week: String,
}

impl FromStr for CronInterval {
    type Err = ProbeConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let fields: Vec<&str> = s.split_whitespace().collect();
        let valid_field = |f: &str| {
            f.chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '*' | '/' | ',' | '-'))
        };
        if fields.len() != 5 || !fields.iter().all(|f| valid_field(f)) {
            return Err(ProbeConfigError::InvalidCron(s.to_string()));
        }
        Ok(Self {
            minute: fields[0].to_string(),
            hour: fields[1].to_string(),
            day_of_month: fields[2].to_string(),
            month: fields[3].to_string(),
            day_of_week: fields[4].to_string(),
        })
    }
}

impl fmt::Display for CronInterval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {} {} {}",
            self.minute, self.hour, self.day_of_month, self.month, self.day_of_week
        )
    }
}

/// Command-line layers applied on top of the files.
#[derive(Debug, Clone, Default)]
pub struct ProbeOverrides {
    pub extra_config_file: Option<PathBuf>,
    pub knobs: Vec<(String, String)>,
}

impl ProbeOverrides {
    /// Parses `key=value`; `args.<name>=value` targets the argument table.
    pub fn parse_knob(s: &str) -> Result<(String, String), ProbeConfigError> {
        match s.split_once('=') {
            Some((k, v)) if !k.trim().is_empty() => {
                Ok((k.trim().to_string(), v.trim().to_string()))
            }
            _ => Err(ProbeConfigError::InvalidKnob(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProbeConfig {
    pub check: String,
    pub target: String,
    pub mode: ExecutionMode,
    pub executable: PathBuf,
    pub args: Vec<(String, String)>,
    pub env: Vec<EnvDelta>,
    pub custom_timeout: Option<u64>,
    pub default_timeout: u64,
    pub output_format: OutputFormat,
    pub cron: Option<CronInterval>,
    pub service_type: String,
    pub metric_type: String,
    pub need_proxy: bool,
    pub no_ping: bool,
    pub probe_spec_v3: bool,
    pub class_ads: Vec<(String, String)>,
    pub transfer_files: Vec<String>,
    pub extra_globus_rsl: Option<String>,
    /// Fully merged settings, kept for the configuration dump.
    pub settings: toml::Table,
}

impl ProbeConfig {
    pub fn resolve(
        check: &str,
        target: &str,
        cfg: &EffectiveConfig,
        overrides: &ProbeOverrides,
    ) -> Result<Self, ProbeConfigError> {
        let settings = merged_settings(check, target, cfg, overrides)?;
        Self::from_settings(check, target, cfg, settings)
    }

    fn from_settings(
        check: &str,
        target: &str,
        cfg: &EffectiveConfig,
        settings: toml::Table,
    ) -> Result<Self, ProbeConfigError> {
        let missing = |key: &'static str| ProbeConfigError::MissingKey {
            check: check.to_string(),
            key,
        };

        let service_type = get_string(&settings, "service-type").ok_or_else(|| missing("service-type"))?;
        let execute = get_string(&settings, "execute").ok_or_else(|| missing("execute"))?;
        let output_format: OutputFormat = get_string(&settings, "output-format")
            .ok_or_else(|| missing("output-format"))?
            .parse()?;
        let mode = execution_mode(&execute, check, target, &settings, cfg)?;

        let cron = get_string(&settings, "cron-interval")
            .or_else(|| get_string(&settings, "default-cron-interval"))
            .map(|s| s.parse::<CronInterval>())
            .transpose()?;

        let executable = get_string(&settings, "executable")
            .map(PathBuf::from)
            .unwrap_or_else(|| cfg.rsv.metrics_dir.join(check));

        let env = sub_table(&settings, "env")
            .map(|t| {
                t.iter()
                    .filter_map(|(var, v)| {
                        let setting = value_to_string(v).unwrap_or_default();
                        match EnvDelta::parse(var, &setting) {
                            Ok(delta) => Some(delta),
                            Err(e) => {
                                warn!(check, var = %var, setting = %setting, "invalid environment entry skipped: {e}");
                                None
                            }
                        }
                    })
                    .collect()
            })
            .unwrap_or_default();

        let transfer_files = match settings.get("transfer-files") {
            Some(Value::Array(items)) => items.iter().filter_map(value_to_string).collect(),
            Some(v) => value_to_string(v)
                .map(|s| s.split_whitespace().map(str::to_string).collect())
                .unwrap_or_default(),
            None => Vec::new(),
        };

        Ok(Self {
            check: check.to_string(),
            target: target.to_string(),
            mode,
            executable,
            args: string_pairs(sub_table(&settings, "args")),
            env,
            custom_timeout: custom_timeout(check, &settings),
            default_timeout: cfg.rsv.job_timeout,
            output_format,
            cron,
            metric_type: get_string(&settings, "metric-type").unwrap_or_else(|| "status".to_string()),
            service_type,
            need_proxy: get_bool(&settings, "need-proxy").unwrap_or(true),
            no_ping: get_bool(&settings, "no-ping").unwrap_or(false),
            probe_spec_v3: get_string(&settings, "probe-spec")
                .is_some_and(|v| v.eq_ignore_ascii_case("v3")),
            class_ads: string_pairs(sub_table(&settings, "class-ads")),
            transfer_files,
            extra_globus_rsl: cfg.rsv.extra_globus_rsl.clone(),
            settings,
        })
    }

    /// Per-check timeout when set, else the global default.
    pub fn effective_timeout(&self) -> Duration {
        Duration::from_secs(self.custom_timeout.unwrap_or(self.default_timeout))
    }

    /// Target without any `:port` suffix.
    pub fn host(&self) -> &str {
        host_of(&self.target)
    }

    /// `--key value` pairs in declaration order, plus the v3 extras.
    pub fn probe_args(&self, proxy: Option<&Path>) -> Vec<String> {
        let mut out = Vec::with_capacity(self.args.len() * 2 + 3);
        for (k, v) in &self.args {
            out.push(format!("--{k}"));
            out.push(v.clone());
        }
        if self.probe_spec_v3 {
            if let Some(p) = proxy {
                out.push("-x".to_string());
                out.push(p.display().to_string());
            }
            out.push("--verbose".to_string());
        }
        out
    }

    /// Full argument vector handed to the probe executable.
    pub fn invocation_args(&self, proxy: Option<&Path>) -> Vec<String> {
        let mut out = vec![
            "-m".to_string(),
            self.check.clone(),
            "-u".to_string(),
            self.target.clone(),
        ];
        out.extend(self.probe_args(proxy));
        out
    }
}

pub fn host_of(target: &str) -> &str {
    if let Some(rest) = target.strip_prefix('[') {
        return rest.split(']').next().unwrap_or(rest);
    }
    match target.rsplit_once(':') {
        Some((host, port)) if !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()) => host,
        _ => target,
    }
}

fn builtin_defaults() -> toml::Table {
    let mut t = toml::Table::new();
    t.insert("jobmanager".to_string(), Value::String("fork".to_string()));
    t.insert("metric-type".to_string(), Value::String("status".to_string()));
    t
}

/// Builtin ← [metric-defaults] ← per-check ← per-target allmetrics ← per-target check ←
/// extra file ← knobs.
pub fn merged_settings(
    check: &str,
    target: &str,
    cfg: &EffectiveConfig,
    overrides: &ProbeOverrides,
) -> Result<toml::Table, ProbeConfigError> {
    let mut settings = builtin_defaults();
    merge_layer(&mut settings, cfg.metric_defaults.clone());

    let dir = cfg.probe_config_dir();
    let target_dir = dir.join(target);
    let layers = [
        dir.join(format!("{check}.toml")),
        target_dir.join("allmetrics.toml"),
        target_dir.join(format!("{check}.toml")),
    ];
    for path in &layers {
        if let Some(layer) = read_layer(path, false)? {
            merge_layer(&mut settings, layer);
        }
    }

    if let Some(extra) = overrides.extra_config_file.as_deref() {
        if let Some(layer) = read_layer(extra, true)? {
            merge_layer(&mut settings, layer);
        }
    }

    for (key, value) in &overrides.knobs {
        let value = Value::String(value.clone());
        match key.split_once('.') {
            Some((table, name)) if MERGED_TABLES.contains(&table) => {
                let mut layer = toml::Table::new();
                let mut inner = toml::Table::new();
                inner.insert(name.to_string(), value);
                layer.insert(table.to_string(), Value::Table(inner));
                merge_layer(&mut settings, layer);
            }
            _ => {
                settings.insert(key.clone(), value);
            }
        }
    }

    Ok(settings)
}

fn read_layer(path: &Path, required: bool) -> Result<Option<toml::Table>, ProbeConfigError> {
    if !path.exists() {
        if required {
            return Err(ProbeConfigError::MissingFile(path.to_path_buf()));
        }
        return Ok(None);
    }
    let s = std::fs::read_to_string(path).map_err(|source| ProbeConfigError::Unreadable {
        path: path.to_path_buf(),
        source,
    })?;
    let table: toml::Table = toml::from_str(&s).map_err(|source| ProbeConfigError::InvalidToml {
        path: path.to_path_buf(),
        source,
    })?;
    debug!(path = %path.display(), keys = table.len(), "loaded probe config layer");
    Ok(Some(table))
}

fn merge_layer(base: &mut toml::Table, layer: toml::Table) {
    for (key, value) in layer {
        match value {
            Value::Table(inner) if MERGED_TABLES.contains(&key.as_str()) => {
                let entry = base
                    .entry(key)
                    .or_insert_with(|| Value::Table(toml::Table::new()));
                match entry {
                    Value::Table(existing) => {
                        for (k, v) in inner {
                            existing.insert(k, v);
                        }
                    }
                    other => *other = Value::Table(inner),
                }
            }
            value => {
                base.insert(key, value);
            }
        }
    }
}

fn execution_mode(
    execute: &str,
    check: &str,
    target: &str,
    settings: &toml::Table,
    cfg: &EffectiveConfig,
) -> Result<ExecutionMode, ProbeConfigError> {
    let jobmanager = get_string(settings, "jobmanager").unwrap_or_else(|| "fork".to_string());
    match execute.trim().to_ascii_lowercase().as_str() {
        "local" => Ok(ExecutionMode::Local),
        "grid" if cfg.rsv.use_condor_g => Ok(ExecutionMode::RemoteBatchGateway(
            BatchUniverse::Grid(grid_resource(check, target, &jobmanager, settings, cfg)),
        )),
        "grid" | "remote-grid" => Ok(ExecutionMode::RemoteGrid { jobmanager }),
        "remote-batch-gateway" => Ok(ExecutionMode::RemoteBatchGateway(BatchUniverse::Grid(
            grid_resource(check, target, &jobmanager, settings, cfg),
        ))),
        "vanilla" => Ok(ExecutionMode::RemoteBatchGateway(BatchUniverse::Vanilla)),
        _ => Err(ProbeConfigError::InvalidExecutionMode(execute.to_string())),
    }
}

fn grid_resource(
    check: &str,
    target: &str,
    jobmanager: &str,
    settings: &toml::Table,
    cfg: &EffectiveConfig,
) -> GridResource {
    let ce_type = get_string(settings, "ce-type")
        .or_else(|| get_string(settings, "gatekeeper-type"))
        .or_else(|| cfg.rsv.ce_type.clone())
        .unwrap_or_default()
        .to_ascii_lowercase();
    let host = host_of(target);
    match ce_type.as_str() {
        "htcondor-ce" | "condor-ce" => GridResource::HtcondorCe {
            schedd: get_string(settings, "htcondor-ce-schedd")
                .or_else(|| get_string(settings, "condor-ce-schedd"))
                .unwrap_or_else(|| host.to_string()),
            collector: get_string(settings, "htcondor-ce-collector")
                .or_else(|| get_string(settings, "condor-ce-collector"))
                .unwrap_or_else(|| format!("{host}:9619")),
        },
        "cream" => GridResource::Cream {
            host: host.to_string(),
            jobmanager: jobmanager.to_string(),
        },
        other => {
            if !other.is_empty() && other != "gram" {
                warn!(check, ce_type = other, "unknown ce-type, falling back to gram");
            }
            GridResource::Gram {
                host: target.to_string(),
                jobmanager: jobmanager.to_string(),
            }
        }
    }
}

fn custom_timeout(check: &str, settings: &toml::Table) -> Option<u64> {
    if let Some(v) = settings.get("timeout") {
        match value_to_u64(v) {
            Some(t) => {
                warn!(check, "deprecated 'timeout' key used, please use 'job-timeout' instead");
                return Some(t);
            }
            None => warn!(check, "a non-integer value is set for timeout"),
        }
    }
    match settings.get("job-timeout") {
        Some(v) => {
            let t = value_to_u64(v);
            if t.is_none() {
                warn!(check, "a non-integer value is set for job-timeout");
            }
            t
        }
        None => None,
    }
}

fn sub_table<'a>(settings: &'a toml::Table, key: &str) -> Option<&'a toml::Table> {
    settings.get(key).and_then(Value::as_table)
}

fn string_pairs(table: Option<&toml::Table>) -> Vec<(String, String)> {
    table
        .map(|t| {
            t.iter()
                .filter_map(|(k, v)| value_to_string(v).map(|s| (k.clone(), s)))
                .collect()
        })
        .unwrap_or_default()
}

fn get_string(settings: &toml::Table, key: &str) -> Option<String> {
    settings
        .get(key)
        .and_then(value_to_string)
        .filter(|s| !s.trim().is_empty())
}

fn get_bool(settings: &toml::Table, key: &str) -> Option<bool> {
    match settings.get(key)? {
        Value::Boolean(b) => Some(*b),
        v => {
            let s = value_to_string(v)?;
            match config::parse_bool(&s) {
                Ok(b) => Some(b),
                Err(_) => {
                    debug!(key, value = %s, "ignoring invalid boolean");
                    None
                }
            }
        }
    }
}

fn value_to_string(v: &Value) -> Option<String> {
    match v {
        Value::String(s) => Some(s.clone()),
        Value::Integer(i) => Some(i.to_string()),
        Value::Float(f) => Some(f.to_string()),
        Value::Boolean(b) => Some(b.to_string()),
        Value::Datetime(d) => Some(d.to_string()),
        Value::Array(_) | Value::Table(_) => None,
    }
}

fn value_to_u64(v: &Value) -> Option<u64> {
    match v {
        Value::Integer(i) => u64::try_from(*i).ok(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}
