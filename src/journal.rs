//! Append-only line journal.
//!
//! Backs the worker's per-node operation log and the coordinator's transfer
//! journal. Entries are pipe-delimited lines stamped with an RFC 3339 time;
//! callers format the fields, the journal owns ordering and flushing.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::Utc;

pub struct Journal {
    path: PathBuf,
    file: Mutex<File>,
}

impl Journal {
    /// Opens (creating if needed) the journal at `path` in append mode.
    pub fn open(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Journal {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends one timestamped entry and flushes it before returning.
    pub fn append(&self, entry: &str) -> io::Result<()> {
        let mut file = self.file.lock().expect("journal lock poisoned");
        writeln!(file, "{}|{entry}", Utc::now().to_rfc3339())?;
        file.flush()
    }
}
