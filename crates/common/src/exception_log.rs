//! Append-only log of errors that reached the top level

use std::backtrace::{Backtrace, BacktraceStatus};
use std::fmt::Write as _;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;

use chrono::Local;

use crate::Result;

/// Error message followed by its `source()` chain, one cause per line
pub fn error_chain(err: &(dyn std::error::Error + 'static)) -> String {
    let mut out = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        let _ = write!(out, "\nCaused by: {cause}");
        source = cause.source();
    }
    out
}

/// Cause chain plus the backtrace, when one was captured
/// (`RUST_BACKTRACE` or `RUST_LIB_BACKTRACE` enable capturing)
pub fn error_report(err: &(dyn std::error::Error + 'static), backtrace: &Backtrace) -> String {
    let mut out = error_chain(err);
    if backtrace.status() == BacktraceStatus::Captured {
        let _ = write!(out, "\n\nBacktrace:\n{backtrace}");
    }
    out
}

/// Append a timestamped report to the exception log
pub fn append(path: &Path, report: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(file, "{}", Local::now().format("%Y-%m-%d %H:%M:%S%.6f"))?;
    writeln!(file, "{report}")?;
    writeln!(file)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;

    #[test]
    fn test_append_keeps_previous_entries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log/exceptions");
        append(&path, "first").unwrap();
        append(&path, "second").unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("first\n"));
        assert!(content.contains("second\n"));
        assert!(content.find("first") < content.find("second"));
    }

    #[test]
    fn test_error_chain_includes_causes() {
        let err = Error::TomlParse {
            path: "x.toml".into(),
            source: "a = = 1".parse::<toml::Table>().unwrap_err(),
        };
        let chain = error_chain(&err);
        assert!(chain.starts_with("Failed to parse x.toml"));
        assert!(chain.contains("Caused by:"));
    }

    #[test]
    fn test_error_report_carries_captured_backtrace() {
        let err = Error::config("broken");
        let report = error_report(&err, &Backtrace::force_capture());
        assert!(report.starts_with("Configuration error: broken"));
        assert!(report.contains("\n\nBacktrace:\n"));

        let report = error_report(&err, &Backtrace::disabled());
        assert_eq!(report, error_chain(&err));
    }
}
