//! CSV export sink for streamed results.
//!
//! Export files land in the configured directory (the user's Downloads
//! folder by default) under a timestamped `query-results-*.csv` name.
//! The first exported row also writes a column-name header line.

use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::AgentError;

pub(crate) struct ExportSink {
    writer: csv::Writer<File>,
    path: PathBuf,
    wrote_header: bool,
}

impl ExportSink {
    pub fn create(dir: &Path) -> Result<Self, AgentError> {
        fs::create_dir_all(dir)
            .map_err(|err| AgentError::Transport(format!("export directory: {err}")))?;
        let path = dir.join(format!("query-results-{}.csv", file_stamp()));
        let file = File::create(&path)
            .map_err(|err| AgentError::Transport(format!("export file: {err}")))?;
        Ok(Self {
            writer: csv::Writer::from_writer(file),
            path,
            wrote_header: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write one flattened row; only the values (odd positions) land in
    /// the CSV, with the column names written once as a header line.
    pub fn write_row(&mut self, flat: &[String]) -> Result<(), AgentError> {
        if !self.wrote_header {
            let names = flat.iter().step_by(2);
            self.writer
                .write_record(names)
                .map_err(|err| AgentError::Transport(format!("export write: {err}")))?;
            self.wrote_header = true;
        }
        let values = flat.iter().skip(1).step_by(2);
        self.writer
            .write_record(values)
            .map_err(|err| AgentError::Transport(format!("export write: {err}")))
    }

    pub fn flush(&mut self) -> Result<(), AgentError> {
        self.writer
            .flush()
            .map_err(|err| AgentError::Transport(format!("export flush: {err}")))
    }
}

/// Timestamp plus a process-wide counter keeping concurrent exports apart.
fn file_stamp() -> String {
    static SEQ: AtomicU64 = AtomicU64::new(0);
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    format!("{}-{}", now.as_secs(), SEQ.fetch_add(1, Ordering::SeqCst))
}

pub(crate) fn default_export_dir() -> PathBuf {
    dirs::download_dir()
        .or_else(|| dirs::home_dir().map(|home| home.join("Downloads")))
        .unwrap_or_else(std::env::temp_dir)
}
