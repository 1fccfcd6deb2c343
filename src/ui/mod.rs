use anyhow::Error;
use std::io::{self, Write};
use unicode_width::UnicodeWidthStr;

use crate::engine::CheckReport;
use crate::probe::ProbeConfig;

pub fn eprintln_error(err: &Error) {
    let mut stderr = io::stderr().lock();
    let _ = writeln!(stderr, "error:");
    let _ = writeln!(stderr, "  {err}");

    let mut causes = err.chain().skip(1).peekable();
    if causes.peek().is_some() {
        let _ = writeln!(stderr, "caused by:");
        for cause in causes {
            let _ = writeln!(stderr, "  - {cause}");
        }
    }

    let _ = writeln!(stderr, "next:");
    let _ = writeln!(
        stderr,
        "  - rerun with `--verbose` (or RSVRUN_LOG=debug) for details"
    );
    let _ = writeln!(
        stderr,
        "  - see `rsvrun --help` for the available commands and options"
    );
}

/// One line per check on stderr, so stdout only carries records.
pub fn print_run_summary(reports: &[CheckReport]) {
    let mut stderr = io::stderr().lock();
    write_run_summary(&mut stderr, reports);
}

fn write_run_summary(out: &mut dyn Write, reports: &[CheckReport]) {
    if reports.is_empty() {
        let _ = writeln!(out, "no checks were run");
        return;
    }

    let status_w = reports
        .iter()
        .map(|r| r.status.as_str().width())
        .max()
        .unwrap_or(0);
    let check_w = reports.iter().map(|r| r.check.width()).max().unwrap_or(0);

    for r in reports {
        let status = pad_end(r.status.as_str(), status_w);
        let check = pad_end(&r.check, check_w);
        let note = match &r.failure {
            Some(f) => format!("  ({})", f.label()),
            None if r.records > 1 => format!("  ({} records)", r.records),
            None => String::new(),
        };
        let _ = writeln!(out, "{status}  {check}  {}{note}", r.target);
        for w in &r.published.warnings {
            let _ = writeln!(out, "  warning: {}: {}", w.consumer, w.message);
        }
    }
}

pub fn print_probe_config(probe: &ProbeConfig) {
    let mut stdout = io::stdout().lock();
    write_probe_config(&mut stdout, probe);
}

fn write_probe_config(out: &mut dyn Write, probe: &ProbeConfig) {
    let timeout = match probe.custom_timeout {
        Some(secs) => format!("{secs}s (job-timeout)"),
        None => format!("{}s (default)", probe.default_timeout),
    };
    let rows: Vec<(&str, String)> = vec![
        ("check", probe.check.clone()),
        ("target", probe.target.clone()),
        ("execution mode", probe.mode.label().to_string()),
        ("executable", probe.executable.display().to_string()),
        ("output format", probe.output_format.as_str().to_string()),
        ("service type", probe.service_type.clone()),
        ("metric type", probe.metric_type.clone()),
        ("timeout", timeout),
        (
            "cron interval",
            probe
                .cron
                .as_ref()
                .map_or_else(|| "-".to_string(), ToString::to_string),
        ),
        ("need proxy", yes_no(probe.need_proxy).to_string()),
        ("ping", yes_no(!probe.no_ping).to_string()),
    ];
    let key_w = rows.iter().map(|(k, _)| k.width()).max().unwrap_or(0);
    for (k, v) in &rows {
        let _ = writeln!(out, "{}  {v}", pad_end(k, key_w));
    }

    let _ = writeln!(out, "arguments:");
    let args = probe.probe_args(None);
    if args.is_empty() {
        let _ = writeln!(out, "  (none)");
    }
    for pair in args.chunks(2) {
        let _ = writeln!(out, "  {}", pair.join(" "));
    }

    let _ = writeln!(out, "environment:");
    if probe.env.is_empty() {
        let _ = writeln!(out, "  (none)");
    }
    let var_w = probe.env.iter().map(|d| d.var.width()).max().unwrap_or(0);
    for d in &probe.env {
        let _ = writeln!(
            out,
            "  {}  {} | {}",
            pad_end(&d.var, var_w),
            d.action.as_str(),
            d.value
        );
    }

    let _ = writeln!(out, "settings:");
    match toml::to_string_pretty(&probe.settings) {
        Ok(text) => {
            for line in text.lines() {
                let _ = writeln!(out, "  {line}");
            }
        }
        Err(e) => {
            let _ = writeln!(out, "  (cannot render settings: {e})");
        }
    }
}

fn yes_no(b: bool) -> &'static str {
    if b { "yes" } else { "no" }
}

fn pad_end(s: &str, width: usize) -> String {
    let w = s.width();
    if w >= width {
        return s.to_string();
    }
    format!("{s}{}", " ".repeat(width - w))
}
