//! Per-partition record of replication passes.
//!
//! Every session on a partition appends one JSON object per line to
//! [`JOURNAL_FILE`] at the partition root. Several sessions may finish at
//! once, so each record goes out as a single append write. A crash can leave
//! a torn last line; readers skip unparsable lines instead of failing.

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use tracing::warn;

pub const JOURNAL_FILE: &str = ".failover-journal.jsonl";

/// One finished (or aborted) pass.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct PassRecord {
    pub failover_id: i32,
    pub source: String,
    pub date: NaiveDate,
    pub started: DateTime<Utc>,
    pub finished: DateTime<Utc>,
    pub scanned: u64,
    pub updated: u64,
    pub bytes: u64,
    pub success: bool,
    pub error: Option<String>,
}

/// Append-only JSON lines journal kept at the partition root.
pub struct PassJournal {
    path: PathBuf,
}

impl PassJournal {
    pub fn new(partition: &Path) -> Self {
        PassJournal {
            path: partition.join(JOURNAL_FILE),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, record: &PassRecord) -> Result<()> {
        let mut line = serde_json::to_vec(record).context("encode pass record")?;
        line.push(b'\n');
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("open journal {}", self.path.display()))?;
        file.write_all(&line)
            .with_context(|| format!("append to journal {}", self.path.display()))
    }

    /// All readable records in append order.
    pub fn read_all(&self) -> Result<Vec<PassRecord>> {
        let file = match File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(e).with_context(|| format!("open journal {} for reading", self.path.display()))
            }
        };
        let mut records = Vec::new();
        for (idx, line) in BufReader::new(file).lines().enumerate() {
            let line = line.with_context(|| format!("read journal {}", self.path.display()))?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<PassRecord>(&line) {
                Ok(record) => records.push(record),
                Err(e) => warn!(journal = %self.path.display(), line = idx + 1, error = %e, "skipping bad journal line"),
            }
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn record(success: bool) -> PassRecord {
        let now = Utc::now();
        PassRecord {
            failover_id: 9,
            source: "web1".into(),
            date: NaiveDate::from_ymd_opt(2024, 5, 1).unwrap(),
            started: now,
            finished: now,
            scanned: 120,
            updated: 4,
            bytes: 8192,
            success,
            error: (!success).then(|| "connection reset".to_string()),
        }
    }

    #[test]
    fn test_append_and_read_back() {
        let tmp = TempDir::new().unwrap();
        let journal = PassJournal::new(tmp.path());
        assert!(journal.read_all().unwrap().is_empty());

        journal.append(&record(true)).unwrap();
        journal.append(&record(false)).unwrap();
        let records = journal.read_all().unwrap();
        assert_eq!(records.len(), 2);
        assert!(records[0].success);
        assert_eq!(records[1].error.as_deref(), Some("connection reset"));
        assert_eq!(journal.path(), tmp.path().join(JOURNAL_FILE));
    }

    #[test]
    fn test_torn_line_skipped() {
        let tmp = TempDir::new().unwrap();
        let journal = PassJournal::new(tmp.path());
        journal.append(&record(true)).unwrap();
        // Interrupted write leaves half a record without a newline
        let mut file = OpenOptions::new().append(true).open(journal.path()).unwrap();
        file.write_all(br#"{"failover_id":9,"source":"we"#).unwrap();
        file.write_all(b"\n").unwrap();
        journal.append(&record(false)).unwrap();

        let records = journal.read_all().unwrap();
        assert_eq!(records.len(), 2);
        assert!(records[0].success);
        assert!(!records[1].success);

        let text = std::fs::read_to_string(journal.path()).unwrap();
        assert_eq!(text.lines().count(), 3);
        assert!(text.ends_with('\n'));
    }
}
