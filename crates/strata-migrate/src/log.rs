//! Durable record of applied migrations.

use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::LogError;
use crate::operation::MigrationOperation;
use crate::persist::StagedFile;

/// Time-ordered migration identifier (unix seconds at creation).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MigrationId(pub u64);

impl MigrationId {
    /// Id for the current time.
    pub fn now() -> Self {
        Self(u64::try_from(Utc::now().timestamp()).unwrap_or(0))
    }
}

impl fmt::Display for MigrationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A named batch of operations, applied or pending.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Migration {
    pub id: MigrationId,
    pub name: String,
    pub operations: Vec<MigrationOperation>,
}

impl Migration {
    /// Create a migration. The name is normalized to `[a-z0-9_]`.
    pub fn new(id: MigrationId, name: &str, operations: Vec<MigrationOperation>) -> Self {
        Self {
            id,
            name: normalize_name(name),
            operations,
        }
    }

    /// Whether every operation has a safe inverse.
    pub fn is_reversible(&self) -> bool {
        self.operations.iter().all(MigrationOperation::is_reversible)
    }
}

/// Lowercase, with every run of other characters collapsed to `_`.
fn normalize_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for c in name.trim().chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c.to_ascii_lowercase());
        } else if !out.ends_with('_') {
            out.push('_');
        }
    }
    let out = out.trim_matches('_');
    if out.is_empty() {
        "migration".to_string()
    } else {
        out.to_string()
    }
}

/// A migration that has been applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationRecord {
    pub id: MigrationId,
    pub name: String,
    pub operations: Vec<MigrationOperation>,
    pub applied_at: DateTime<Utc>,
    /// Fixed at creation: false when any operation has no safe inverse.
    pub reversible: bool,
}

impl MigrationRecord {
    /// Record `migration` as applied now.
    pub fn applied(migration: Migration) -> Self {
        let reversible = migration.is_reversible();
        Self {
            id: migration.id,
            name: migration.name,
            operations: migration.operations,
            applied_at: Utc::now(),
            reversible,
        }
    }

    /// Inverse operations in application order, if every one exists.
    pub fn inverse(&self) -> Option<Vec<MigrationOperation>> {
        self.operations
            .iter()
            .rev()
            .map(MigrationOperation::inverse)
            .collect()
    }
}

#[derive(Default, Serialize, Deserialize)]
struct LogFile {
    records: Vec<MigrationRecord>,
}

/// Applied migrations, oldest first.
///
/// Only [`AppliedMigrationLog::append`] and
/// [`AppliedMigrationLog::pop_last`] change it, and each change is written
/// through before it becomes visible.
#[derive(Debug, Default)]
pub struct AppliedMigrationLog {
    path: Option<PathBuf>,
    records: Vec<MigrationRecord>,
}

impl AppliedMigrationLog {
    /// A log that is never persisted.
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Read the log at `path`; a missing file is an empty log.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, LogError> {
        let path = path.into();
        let records = match std::fs::read(&path) {
            Ok(bytes) => {
                let file: LogFile = serde_json::from_slice(&bytes).map_err(|e| LogError::Corrupt {
                    path: path.clone(),
                    message: e.to_string(),
                })?;
                file.records
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(source) => return Err(LogError::Io { path, source }),
        };

        tracing::debug!(target: "migrate", path = %path.display(), applied = records.len(), "opened migration log");
        Ok(Self {
            path: Some(path),
            records,
        })
    }

    /// Backing file, if persistent.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Applied records, oldest first.
    pub fn records(&self) -> &[MigrationRecord] {
        &self.records
    }

    /// Most recent record.
    pub fn last(&self) -> Option<&MigrationRecord> {
        self.records.last()
    }

    /// Whether a migration id has been applied.
    pub fn contains(&self, id: MigrationId) -> bool {
        self.records.iter().any(|r| r.id == id)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// A fresh id: the current time, or one past the newest record if that
    /// is later.
    pub fn next_id(&self) -> MigrationId {
        let now = MigrationId::now();
        let after_last = self.records.iter().map(|r| r.id.0 + 1).max().unwrap_or(0);
        MigrationId(now.0.max(after_last))
    }

    /// Append a record and write the log through.
    pub fn append(&mut self, record: MigrationRecord) -> Result<(), LogError> {
        let staged = self.stage_append(record)?;
        self.commit(staged)
    }

    /// Remove the most recent record and write the log through.
    pub fn pop_last(&mut self) -> Result<Option<MigrationRecord>, LogError> {
        let Some((record, staged)) = self.stage_pop()? else {
            return Ok(None);
        };
        self.commit(staged)?;
        Ok(Some(record))
    }

    /// Write the log with `record` appended to a temp file, leaving the
    /// visible log unchanged until [`AppliedMigrationLog::commit`].
    pub(crate) fn stage_append(&self, record: MigrationRecord) -> Result<StagedLog, LogError> {
        if self.contains(record.id) {
            return Err(LogError::Duplicate { id: record.id });
        }
        let mut records = self.records.clone();
        records.push(record);
        self.stage(records)
    }

    /// Stage the log without its most recent record.
    pub(crate) fn stage_pop(&self) -> Result<Option<(MigrationRecord, StagedLog)>, LogError> {
        let Some((last, rest)) = self.records.split_last() else {
            return Ok(None);
        };
        Ok(Some((last.clone(), self.stage(rest.to_vec())?)))
    }

    /// Move a staged log into place and make it visible.
    pub(crate) fn commit(&mut self, staged: StagedLog) -> Result<(), LogError> {
        if let (Some(file), Some(path)) = (staged.file, &self.path) {
            file.commit().map_err(|source| LogError::Io {
                path: path.clone(),
                source,
            })?;
        }
        self.records = staged.records;
        Ok(())
    }

    fn stage(&self, records: Vec<MigrationRecord>) -> Result<StagedLog, LogError> {
        let Some(path) = &self.path else {
            return Ok(StagedLog { records, file: None });
        };
        let file = LogFile { records };
        let json = serde_json::to_vec_pretty(&file).map_err(|e| LogError::Corrupt {
            path: path.clone(),
            message: e.to_string(),
        })?;
        let staged = StagedFile::write(path, &json).map_err(|source| LogError::Io {
            path: path.clone(),
            source,
        })?;
        Ok(StagedLog {
            records: file.records,
            file: Some(staged),
        })
    }
}

/// A log change written out but not yet in place.
pub(crate) struct StagedLog {
    records: Vec<MigrationRecord>,
    file: Option<StagedFile>,
}
