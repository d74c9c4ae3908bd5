//! JSON-lines transfer log
//!
//! One line per finished transfer, successful or not. The master appends to
//! it from every session task, so each entry is written with a single
//! buffered write under a mutex.

use anyhow::{Context, Result};
use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, ErrorKind, Write};
use std::path::{Path, PathBuf};

use crate::transfer::Direction;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    Completed,
    Aborted,
    Failed,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct TransferLogEntry {
    pub timestamp: String,
    /// Client session that ran the transfer
    #[serde(default)]
    pub session: Option<String>,
    pub direction: Direction,
    pub path: String,
    pub slave: Option<String>,
    pub status: TransferStatus,
    pub bytes_transferred: u64,
    pub checksum: u64,
    pub xfer_time_ms: u64,
    pub error: Option<String>,
}

impl TransferLogEntry {
    pub fn new(direction: Direction, path: &str, status: TransferStatus) -> Self {
        Self {
            timestamp: Utc::now().to_rfc3339(),
            session: None,
            direction,
            path: path.to_string(),
            slave: None,
            status,
            bytes_transferred: 0,
            checksum: 0,
            xfer_time_ms: 0,
            error: None,
        }
    }
}

pub struct TransferLog {
    log_file_path: PathBuf,
    write_lock: Mutex<()>,
}

impl TransferLog {
    pub fn new(path: &Path) -> Self {
        TransferLog {
            log_file_path: path.to_path_buf(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.log_file_path
    }

    pub fn add_entry(&self, entry: &TransferLogEntry) -> Result<()> {
        let mut line = serde_json::to_vec(entry)?;
        line.push(b'\n');
        let _guard = self.write_lock.lock();
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_file_path)
            .and_then(|mut f| f.write_all(&line))
            .with_context(|| format!("append to {}", self.log_file_path.display()))
    }

    /// Every entry so far; a log that was never written is empty
    pub fn read_log(&self) -> Result<Vec<TransferLogEntry>> {
        let file = match File::open(&self.log_file_path) {
            Ok(f) => f,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(e).with_context(|| format!("open {}", self.log_file_path.display()))
            }
        };
        let mut entries = Vec::new();
        for (n, line) in BufReader::new(file).lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            entries.push(
                serde_json::from_str(&line)
                    .with_context(|| format!("{} line {}", self.log_file_path.display(), n + 1))?,
            );
        }
        Ok(entries)
    }
}
