//! Records for tasks that failed every attempt.
//!
//! Quarantined tasks are kept for read-only inspection and are never retried
//! automatically. Reports are NDJSON: one [`QuarantineRecord`] per line.

use crate::{ExceededRetriesError, Result, Task};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::{BufRead, Write};

/// Why a task ended up in quarantine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuarantineReason {
    RetriesExhausted,
}

impl QuarantineReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            QuarantineReason::RetriesExhausted => "retries_exhausted",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuarantineRecord {
    /// The original task, unchanged
    pub task: Task,
    pub reason: QuarantineReason,
    /// Number of attempts made before giving up
    pub attempts: u32,
    /// Error message from the final attempt
    pub last_error: String,
    /// Worker that quarantined the task
    pub worker_id: usize,
    pub quarantined_at: DateTime<Utc>,
}

impl QuarantineRecord {
    pub fn from_exhausted(err: ExceededRetriesError, worker_id: usize) -> Self {
        QuarantineRecord {
            task: err.task,
            reason: QuarantineReason::RetriesExhausted,
            attempts: err.attempts,
            last_error: err.last_error,
            worker_id,
            quarantined_at: Utc::now(),
        }
    }
}

/// Append records to `writer`, one JSON document per line
pub fn write_ndjson<W: Write>(records: &[QuarantineRecord], mut writer: W) -> Result<()> {
    for record in records {
        serde_json::to_writer(&mut writer, record)?;
        writer.write_all(b"\n")?;
    }
    writer.flush()?;
    Ok(())
}

/// Read every record from an NDJSON report, skipping blank lines
pub fn read_ndjson<R: BufRead>(reader: R) -> Result<Vec<QuarantineRecord>> {
    let mut records = Vec::new();
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        records.push(serde_json::from_str(&line)?);
    }
    Ok(records)
}
