//! Append-only audit trail of completed rounds.
//!
//! One CSV row per completed round, header row first, durable before the
//! append returns. The file is the interface: any external process may read
//! it, and a restarted coordinator resumes numbering from the last row.

use std::fs::OpenOptions;
use std::path::PathBuf;

use parking_lot::Mutex;
use serde::Deserialize;
use tracing::debug;

use crate::error::FedError;

const HEADER: [&str; 2] = ["Round", "Accuracy"];

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RoundRecord {
    #[serde(rename = "Round")]
    pub round: u64,
    #[serde(rename = "Accuracy")]
    pub accuracy: f64,
}

/// Single-writer audit log. The mutex serializes appends even when the
/// coordinator itself is concurrent.
pub struct AuditLog {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl AuditLog {
    /// Opening never creates the file; the first append does.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    /// Append one completed round. The record is flushed and fsynced before
    /// this returns; no row is ever rewritten.
    pub fn append(&self, round: u64, accuracy: f64) -> Result<(), FedError> {
        let _guard = self.write_lock.lock();
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        let needs_header = file.metadata()?.len() == 0;
        {
            let mut writer = csv::Writer::from_writer(&file);
            if needs_header {
                writer.write_record(HEADER)?;
            }
            writer.write_record([round.to_string(), accuracy.to_string()])?;
            writer.flush()?;
        }
        file.sync_all()?;
        debug!(round, accuracy, path = %self.path.display(), "audit record appended");
        Ok(())
    }

    /// Full ordered history. Missing file reads as an empty history.
    pub fn read(&self) -> Result<Vec<RoundRecord>, FedError> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .from_path(&self.path)?;
        let mut records = Vec::new();
        for row in reader.deserialize::<RoundRecord>() {
            records.push(row?);
        }
        Ok(records)
    }

    /// Round number of the last record, used to resume after a restart.
    pub fn last_round(&self) -> Result<Option<u64>, FedError> {
        Ok(self.read()?.last().map(|r| r.round))
    }
}
