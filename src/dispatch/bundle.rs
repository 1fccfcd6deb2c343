//! Single-file wrapper for `globus-job-run -s`, which can stage only one file.
//!
//! The wrapper is a POSIX shell script carrying the executable and every transfer file as
//! base64 here-documents. On the remote side it unpacks them into a scratch directory, runs
//! the executable from there with the original arguments and removes the directory again.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use base64::{Engine as _, engine::general_purpose};
use thiserror::Error;
use tracing::debug;

const LINE_WIDTH: usize = 76;
const END_MARKER: &str = "RSV_BUNDLE_END";

#[derive(Debug, Error)]
pub enum BundleError {
    #[error("cannot read file to bundle: {path}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("file to bundle has no file name: {0}")]
    NoFileName(PathBuf),
    #[error("two bundled files are both named {0}")]
    DuplicateName(String),
    #[error("failed to write bundle {path}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Relative transfer files are looked up next to the executable.
pub fn resolve_transfer_file(executable: &Path, file: &str) -> PathBuf {
    let path = PathBuf::from(file);
    if path.is_absolute() {
        return path;
    }
    match executable.parent() {
        Some(dir) => dir.join(path),
        None => path,
    }
}

pub fn render(executable: &Path, transfer_files: &[PathBuf]) -> Result<String, BundleError> {
    let exe_name = file_name(executable)?;
    let mut names = vec![exe_name.clone()];

    let mut s = String::new();
    s.push_str("#!/bin/sh\n");
    s.push_str(&missing_tool_guard());
    s.push_str(
        "dir=$(mktemp -d \"${TMPDIR:-/tmp}/rsv-bundle-XXXXXXXX\") || {\n    \
         printf 'RSV BRIEF RESULTS:\\nUNKNOWN\\nFailed to create a scratch directory on the remote system.\\n'\n    \
         exit 0\n}\n",
    );
    s.push_str("cd \"$dir\" || exit 1\n");

    append_file(&mut s, executable, &exe_name)?;
    for file in transfer_files {
        let name = file_name(file)?;
        if names.contains(&name) {
            return Err(BundleError::DuplicateName(name));
        }
        append_file(&mut s, file, &name)?;
        names.push(name);
    }

    let exe = sh_quote(&exe_name);
    let _ = writeln!(s, "chmod 755 {exe}");
    let _ = writeln!(s, "./{exe} \"$@\"");
    s.push_str("rc=$?\n");
    s.push_str("cd / && rm -rf \"$dir\"\n");
    s.push_str("exit $rc\n");
    Ok(s)
}

pub fn write(
    bundle: &Path,
    executable: &Path,
    transfer_files: &[PathBuf],
) -> Result<(), BundleError> {
    let contents = render(executable, transfer_files)?;
    std::fs::write(bundle, contents).map_err(|source| BundleError::Write {
        path: bundle.to_path_buf(),
        source,
    })?;
    debug!(bundle = %bundle.display(), files = transfer_files.len() + 1, "wrote job bundle");
    Ok(())
}

fn missing_tool_guard() -> String {
    "if ! command -v base64 >/dev/null 2>&1; then\n    \
     printf 'RSV BRIEF RESULTS:\\nUNKNOWN\\nCannot unpack the job bundle on the remote system because base64 is missing.\\n'\n    \
     exit 0\nfi\n"
        .to_string()
}

fn append_file(s: &mut String, path: &Path, name: &str) -> Result<(), BundleError> {
    let bytes = std::fs::read(path).map_err(|source| BundleError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let encoded = general_purpose::STANDARD.encode(bytes);
    let _ = writeln!(s, "base64 -d > {} <<'{END_MARKER}'", sh_quote(name));
    for line in encoded.as_bytes().chunks(LINE_WIDTH) {
        s.push_str(&String::from_utf8_lossy(line));
        s.push('\n');
    }
    let _ = writeln!(s, "{END_MARKER}");
    Ok(())
}

fn file_name(path: &Path) -> Result<String, BundleError> {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| BundleError::NoFileName(path.to_path_buf()))
}

fn sh_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\\''"))
}
