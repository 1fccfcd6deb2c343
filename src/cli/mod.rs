use std::io::Write;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, CommandFactory, Parser, Subcommand};

use crate::engine::{CheckReport, Engine, EngineOptions};
use crate::probe::{ProbeConfig, ProbeOverrides};

#[derive(Debug, Parser)]
#[command(
    name = "rsvrun",
    version,
    about = "Run grid service checks and publish their results to the configured consumers"
)]
pub struct Cli {
    /// Directory holding rsv.toml, metrics/ and hosts/
    #[arg(long, global = true)]
    pub config_dir: Option<PathBuf>,
    #[arg(long, global = true)]
    pub verbose: bool,
    #[arg(long, global = true)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run one check against one target, or every enabled check
    Run(RunArgs),
    /// Print the resolved configuration of a check
    ShowConfig(ShowConfigArgs),
    Completion(CompletionArgs),
}

#[derive(Debug, Args)]
pub struct RunArgs {
    #[arg(long, short = 'm', required_unless_present = "all_enabled")]
    pub metric: Option<String>,
    #[arg(long, short = 'u', required_unless_present = "all_enabled")]
    pub uri: Option<String>,
    #[arg(long, conflicts_with_all = ["metric", "uri"])]
    pub all_enabled: bool,
    #[arg(long)]
    pub no_ping: bool,
    #[command(flatten)]
    pub overrides: OverrideArgs,
}

#[derive(Debug, Args)]
pub struct ShowConfigArgs {
    #[arg(long, short = 'm')]
    pub metric: Option<String>,
    #[arg(long, short = 'u', requires = "metric")]
    pub uri: Option<String>,
    #[command(flatten)]
    pub overrides: OverrideArgs,
}

#[derive(Debug, Args)]
pub struct OverrideArgs {
    /// Extra probe configuration layer applied after the regular ones
    #[arg(long)]
    pub extra_config_file: Option<PathBuf>,
    /// Probe setting override, `key=value` (`args.<name>=value` sets a probe argument)
    #[arg(long = "set", value_name = "KEY=VALUE")]
    pub set: Vec<String>,
}

#[derive(Debug, Args)]
pub struct CompletionArgs {
    pub shell: String,
}

pub fn run() -> Result<()> {
    let cli = Cli::parse();
    crate::logs::init_tracing(cli.verbose, cli.quiet);

    let config_dir = crate::config::resolve_config_dir(cli.config_dir.as_deref());

    match cli.command {
        Commands::Run(args) => {
            let cfg = crate::config::load(&config_dir).map_err(crate::exit::invalid_args_err)?;
            let overrides = probe_overrides(&args.overrides)?;
            let engine = Engine::new(
                cfg,
                EngineOptions {
                    no_ping: args.no_ping,
                    show_progress: !cli.quiet,
                },
            );

            let stdout = std::io::stdout();
            let mut out = stdout.lock();
            let reports = if args.all_enabled {
                engine
                    .run_all_enabled(&overrides, &mut out)
                    .map_err(crate::exit::invalid_args_err)?
            } else {
                let (Some(metric), Some(uri)) = (args.metric.as_deref(), args.uri.as_deref())
                else {
                    return Err(crate::exit::invalid_args(
                        "--metric and --uri are required unless --all-enabled is given",
                    ));
                };
                vec![engine.run_check(metric, uri, &overrides, &mut out)]
            };
            let _ = out.flush();

            if !cli.quiet {
                crate::ui::print_run_summary(&reports);
            }
            return run_result(&reports);
        }
        Commands::ShowConfig(args) => {
            let cfg = crate::config::load(&config_dir).map_err(crate::exit::invalid_args_err)?;
            match (args.metric.as_deref(), args.uri.as_deref()) {
                (Some(metric), Some(uri)) => {
                    let overrides = probe_overrides(&args.overrides)?;
                    let probe = ProbeConfig::resolve(metric, uri, &cfg, &overrides)
                        .map_err(|e| crate::exit::invalid_args_err(e.into()))?;
                    crate::ui::print_probe_config(&probe);
                }
                (Some(_), None) => {
                    return Err(crate::exit::invalid_args(
                        "--uri is required to resolve a check configuration",
                    ));
                }
                _ => {
                    let text = toml::to_string_pretty(&cfg)
                        .context("failed to render configuration")?;
                    println!("{text}");
                }
            }
        }
        Commands::Completion(args) => {
            let shell = parse_shell(&args.shell)?;
            let mut cmd = Cli::command();
            let mut out = std::io::stdout().lock();
            clap_complete::generate(shell, &mut cmd, "rsvrun", &mut out);
        }
    }

    Ok(())
}

fn probe_overrides(args: &OverrideArgs) -> Result<ProbeOverrides> {
    let knobs = args
        .set
        .iter()
        .map(|s| ProbeOverrides::parse_knob(s))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| crate::exit::invalid_args(e.to_string()))?;
    if let Some(path) = &args.extra_config_file {
        if !path.is_file() {
            return Err(crate::exit::invalid_args(format!(
                "extra config file does not exist: {}",
                path.display()
            )));
        }
    }
    Ok(ProbeOverrides {
        extra_config_file: args.extra_config_file.clone(),
        knobs,
    })
}

/// Credential failures outrank every other failure.
fn run_result(reports: &[CheckReport]) -> Result<()> {
    if let Some(r) = reports.iter().find(|r| r.is_credential_failure()) {
        return Err(crate::exit::credential_failed(r.describe()));
    }
    let failed: Vec<&CheckReport> = reports.iter().filter(|r| r.failure.is_some()).collect();
    match failed.as_slice() {
        [] => Ok(()),
        [one] => Err(crate::exit::check_failed(one.describe())),
        many => Err(crate::exit::check_failed(format!(
            "{} checks failed; first: {}",
            many.len(),
            many[0].describe()
        ))),
    }
}

fn parse_shell(s: &str) -> Result<clap_complete::Shell> {
    let s = s.trim().to_ascii_lowercase();
    match s.as_str() {
        "bash" => Ok(clap_complete::Shell::Bash),
        "zsh" => Ok(clap_complete::Shell::Zsh),
        "fish" => Ok(clap_complete::Shell::Fish),
        other => Err(crate::exit::invalid_args(format!(
            "unsupported shell: {other} (expected bash|zsh|fish)"
        ))),
    }
}
