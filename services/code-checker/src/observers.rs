//! Session observers used by the runner
//!
//! - `LogObserver` turns the status stream and each result into log lines.
//! - `ResultLog` appends every finalized result to a JSON-lines file.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use check_core::{CheckResult, Outcome};
use orchestrator::{Observer, SessionStatus};
use parking_lot::Mutex;
use tracing::{info, warn};

use crate::error::{Error, Result};

pub struct LogObserver;

impl Observer for LogObserver {
    fn on_start(&self, total: usize) {
        info!(total, "session starting");
    }

    fn on_result(&self, result: &CheckResult) {
        match result.outcome {
            Outcome::Valid => info!(code = %result.code, detail = %result.detail, "valid code"),
            Outcome::Error => warn!(code = %result.code, detail = %result.detail, "check failed"),
            outcome => info!(code = %result.code, outcome = %outcome, detail = %result.detail, "code checked"),
        }
    }

    fn on_status(&self, status: SessionStatus, message: &str) {
        info!(status = %status, "{message}");
    }
}

pub struct ResultLog {
    path: PathBuf,
    writer: Mutex<BufWriter<File>>,
}

impl ResultLog {
    /// Open `path` for appending, creating it if needed.
    pub fn create(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|source| Error::ResultsFile {
                path: path.to_path_buf(),
                source,
            })?;
        Ok(Self {
            path: path.to_path_buf(),
            writer: Mutex::new(BufWriter::new(file)),
        })
    }

    fn append(&self, result: &CheckResult) -> std::io::Result<()> {
        let line = serde_json::to_string(result)?;
        let mut writer = self.writer.lock();
        writeln!(writer, "{line}")?;
        writer.flush()
    }
}

impl Observer for ResultLog {
    fn on_result(&self, result: &CheckResult) {
        if let Err(e) = self.append(result) {
            warn!(path = %self.path.display(), code = %result.code, error = %e, "failed to write result");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn result_log_appends_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("results.jsonl");

        let log = ResultLog::create(&path).unwrap();
        log.on_result(&CheckResult::new("AAAAA-BBBBB-CCCCC-DDDDD", Outcome::Valid, "active"));
        log.on_result(&CheckResult::new("EEEEE-FFFFF-GGGGG-HHHHH", Outcome::Used, "redeemed"));
        drop(log);

        // Reopening appends rather than truncating.
        let log = ResultLog::create(&path).unwrap();
        log.on_result(&CheckResult::new("IIIII-JJJJJ-KKKKK-LLLLL", Outcome::Invalid, "not found"));

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<serde_json::Value> = contents
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0]["outcome"], "valid");
        assert_eq!(lines[1]["code"], "EEEEE-FFFFF-GGGGG-HHHHH");
        assert_eq!(lines[2]["outcome"], "invalid");
    }

    #[test]
    fn unwritable_path_is_error() {
        let err = ResultLog::create(Path::new("/nonexistent/dir/results.jsonl")).err().unwrap();
        assert!(matches!(err, Error::ResultsFile { .. }));
    }
}
