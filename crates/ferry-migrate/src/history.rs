//! Per-entity append-only migration history.
//!
//! Each entity owns `<work_dir>/<slug>/history.json`. Entries are only ever
//! appended; an unreadable file is set aside (never overwritten) and treated
//! as "no prior history".

use crate::error::{MigrationError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Current on-disk schema version.
pub const SCHEMA_VERSION: u32 = 1;

const HISTORY_FILE: &str = "history.json";

/// Outcome of one recorded attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AttemptStatus {
    Success,
    Failed,
    Partial,
}

impl fmt::Display for AttemptStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => write!(f, "SUCCESS"),
            Self::Failed => write!(f, "FAILED"),
            Self::Partial => write!(f, "PARTIAL"),
        }
    }
}

/// Whether an attempt was the first migration or a re-run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AttemptKind {
    Initial,
    Sync,
}

impl fmt::Display for AttemptKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Initial => write!(f, "INITIAL"),
            Self::Sync => write!(f, "SYNC"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub timestamp: DateTime<Utc>,
    pub status: AttemptStatus,
    #[serde(rename = "type")]
    pub kind: AttemptKind,
}

/// Persisted history of one entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationRecord {
    pub entity_id: String,
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
    #[serde(default)]
    pub history: Vec<HistoryEntry>,
}

fn default_schema_version() -> u32 {
    SCHEMA_VERSION
}

impl MigrationRecord {
    fn new(entity_id: &str) -> Self {
        Self {
            entity_id: entity_id.to_string(),
            schema_version: SCHEMA_VERSION,
            history: Vec::new(),
        }
    }

    pub fn last(&self) -> Option<&HistoryEntry> {
        self.history.last()
    }
}

enum Loaded {
    Record(MigrationRecord),
    Missing,
    Corrupt(String),
}

/// Filesystem-backed history store rooted at the working directory.
#[derive(Debug, Clone)]
pub struct MigrationStateStore {
    root: PathBuf,
}

impl MigrationStateStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Isolated working directory of an entity.
    pub fn entity_dir(&self, entity_id: &str) -> PathBuf {
        self.root.join(entity_slug(entity_id))
    }

    pub fn history_path(&self, entity_id: &str) -> PathBuf {
        self.entity_dir(entity_id).join(HISTORY_FILE)
    }

    /// Append one entry and persist the record atomically.
    pub fn record_attempt(
        &self,
        entity_id: &str,
        status: AttemptStatus,
        kind: AttemptKind,
    ) -> Result<MigrationRecord> {
        let dir = self.entity_dir(entity_id);
        std::fs::create_dir_all(&dir).map_err(|e| persistence(&dir, e))?;
        let path = dir.join(HISTORY_FILE);

        let mut record = match self.read(&path) {
            Loaded::Record(record) => record,
            Loaded::Missing => MigrationRecord::new(entity_id),
            Loaded::Corrupt(reason) => {
                let preserved = path.with_file_name(format!(
                    "{HISTORY_FILE}.corrupt-{}",
                    Utc::now().timestamp()
                ));
                std::fs::rename(&path, &preserved).map_err(|e| persistence(&path, e))?;
                warn!(
                    entity = %entity_id,
                    preserved = %preserved.display(),
                    reason = %reason,
                    "Unreadable history set aside, starting a new record"
                );
                MigrationRecord::new(entity_id)
            }
        };

        let mut timestamp = Utc::now();
        if let Some(last) = record.last() {
            timestamp = timestamp.max(last.timestamp);
        }
        record.history.push(HistoryEntry {
            timestamp,
            status,
            kind,
        });
        record.schema_version = SCHEMA_VERSION;

        write_atomic(&path, &record)?;
        debug!(
            entity = %entity_id,
            status = %status,
            kind = %kind,
            length = record.history.len(),
            "Recorded migration attempt"
        );
        Ok(record)
    }

    /// Ordered history; empty when missing or unreadable.
    pub fn load_history(&self, entity_id: &str) -> Vec<HistoryEntry> {
        self.load_record(entity_id)
            .map(|r| r.history)
            .unwrap_or_default()
    }

    /// The persisted record, if one exists and can be read.
    pub fn load_record(&self, entity_id: &str) -> Option<MigrationRecord> {
        let path = self.history_path(entity_id);
        match self.read(&path) {
            Loaded::Record(record) => Some(record),
            Loaded::Missing => None,
            Loaded::Corrupt(reason) => {
                warn!(
                    entity = %entity_id,
                    path = %path.display(),
                    reason = %reason,
                    "History unreadable, treating as no prior history"
                );
                None
            }
        }
    }

    pub fn migration_count(&self, entity_id: &str) -> usize {
        self.load_history(entity_id).len()
    }

    pub fn has_record(&self, entity_id: &str) -> bool {
        self.migration_count(entity_id) > 0
    }

    /// `Initial` when there is no prior history, `Sync` otherwise.
    pub fn next_attempt_kind(&self, entity_id: &str) -> AttemptKind {
        if self.has_record(entity_id) {
            AttemptKind::Sync
        } else {
            AttemptKind::Initial
        }
    }

    fn read(&self, path: &Path) -> Loaded {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Loaded::Missing,
            Err(e) => return Loaded::Corrupt(e.to_string()),
        };
        match serde_json::from_str::<MigrationRecord>(&content) {
            Ok(record) => Loaded::Record(record),
            Err(e) => Loaded::Corrupt(e.to_string()),
        }
    }
}

/// Directory-safe name for an entity id (`acme/app` -> `acme__app`).
/// Never empty and never `.` or `..`, so it stays inside the work dir.
pub fn entity_slug(entity_id: &str) -> String {
    if entity_id.chars().all(|c| c == '.') {
        return "_".repeat(entity_id.len().max(1));
    }
    entity_id
        .replace('/', "__")
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Serialize `value` to `path` via a temp file in the same directory.
pub(crate) fn write_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut file = tempfile::NamedTempFile::new_in(dir).map_err(|e| persistence(dir, e))?;
    serde_json::to_writer_pretty(&mut file, value)?;
    file.write_all(b"\n").map_err(|e| persistence(path, e))?;
    file.as_file()
        .sync_all()
        .map_err(|e| persistence(path, e))?;
    file.persist(path).map_err(|e| persistence(path, e.error))?;
    Ok(())
}

fn persistence(path: &Path, err: std::io::Error) -> MigrationError {
    MigrationError::Persistence {
        path: path.to_path_buf(),
        message: err.to_string(),
    }
}
