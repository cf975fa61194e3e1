//! Append-only security audit log.
//!
//! Validation rejections and sandbox violations are recorded here with a
//! timestamp, the offending mod and script, a violation kind and a severity.
//! Each record is also emitted at `warn` under the `kiln::audit` target and,
//! when configured, appended to a JSON-lines file.

use crate::diagnostic::Severity;
use crate::error::{ErrorKind, RuntimeResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;
use tracing::{error, warn};

/// Records kept in memory before the oldest are dropped. The file sink keeps
/// everything.
pub const DEFAULT_AUDIT_CAPACITY: usize = 10_000;

/// One audited violation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub timestamp: DateTime<Utc>,
    pub mod_id: String,
    pub script_id: String,
    pub kind: ErrorKind,
    pub severity: Severity,
    pub detail: String,
}

impl AuditRecord {
    pub fn new(
        mod_id: impl Into<String>,
        script_id: impl Into<String>,
        kind: ErrorKind,
        severity: Severity,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            mod_id: mod_id.into(),
            script_id: script_id.into(),
            kind,
            severity,
            detail: detail.into(),
        }
    }
}

#[derive(Debug)]
pub struct AuditLog {
    records: Mutex<VecDeque<AuditRecord>>,
    sink: Option<Mutex<File>>,
    capacity: usize,
}

impl Default for AuditLog {
    fn default() -> Self {
        Self::new()
    }
}

impl AuditLog {
    /// An in-memory log.
    pub fn new() -> Self {
        Self {
            records: Mutex::new(VecDeque::new()),
            sink: None,
            capacity: DEFAULT_AUDIT_CAPACITY,
        }
    }

    /// A log that also appends JSON lines to `path`.
    pub fn with_file(path: impl AsRef<Path>) -> RuntimeResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            sink: Some(Mutex::new(file)),
            ..Self::new()
        })
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.max(1);
        self
    }

    pub fn record(&self, record: AuditRecord) {
        warn!(
            target: "kiln::audit",
            mod_id = %record.mod_id,
            script = %record.script_id,
            kind = %record.kind,
            severity = %record.severity,
            "{}",
            record.detail
        );

        if let Some(sink) = &self.sink {
            let mut file = sink.lock().unwrap_or_else(|e| e.into_inner());
            let written = serde_json::to_string(&record)
                .map_err(std::io::Error::from)
                .and_then(|line| writeln!(file, "{}", line));
            if let Err(e) = written {
                error!("Failed to append audit record: {}", e);
            }
        }

        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        if records.len() == self.capacity {
            records.pop_front();
        }
        records.push_back(record);
    }

    /// Snapshot of the retained records, oldest first.
    pub fn records(&self) -> Vec<AuditRecord> {
        self.records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .cloned()
            .collect()
    }

    pub fn records_for(&self, mod_id: &str) -> Vec<AuditRecord> {
        self.records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|r| r.mod_id == mod_id)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.records.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
