//! Error types for planning, applying and persisting migrations.

use std::path::PathBuf;

use strata_core::{CollectionKind, FieldKind, SchemaError};
use thiserror::Error;

use crate::log::MigrationId;

/// The difference between two snapshots cannot be expressed as operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlanError {
    #[error("Collection '{collection}' changes kind from {from} to {to}")]
    CollectionKindChanged {
        collection: String,
        from: CollectionKind,
        to: CollectionKind,
    },

    #[error("Field '{collection}.{field}' changes kind from {from} to {to}")]
    FieldKindChanged {
        collection: String,
        field: String,
        from: FieldKind,
        to: FieldKind,
    },
}

/// The storage engine rejected a batch. Nothing from the batch took effect.
#[derive(Debug, Error)]
pub enum StoreError {
    /// One operation could not be applied.
    #[error("Operation #{index} failed: {message}")]
    OperationFailed { index: usize, message: String },

    /// The batch would leave the schema inconsistent.
    #[error("Resulting schema is invalid: {0}")]
    InvalidSchema(#[from] SchemaError),

    #[error("Schema store I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Schema store at {path} is corrupt: {message}")]
    Corrupt { path: PathBuf, message: String },
}

/// The applied-migration log could not be read or written.
#[derive(Debug, Error)]
pub enum LogError {
    #[error("Migration log I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Migration log at {path} is corrupt: {message}")]
    Corrupt { path: PathBuf, message: String },

    #[error("Migration {id} is already recorded")]
    Duplicate { id: MigrationId },
}

/// A batch was not applied.
#[derive(Debug, Error)]
pub enum ApplyError {
    /// The migration id is already in the log; nothing was executed.
    #[error("Migration {id} has already been applied")]
    AlreadyApplied { id: MigrationId },

    #[error("Migration has no operations")]
    EmptyBatch,

    /// The first failing operation; the schema is unchanged.
    #[error("Operation #{index} ({operation}) failed: {message}")]
    OperationFailed {
        index: usize,
        operation: String,
        message: String,
    },

    #[error(transparent)]
    Store(#[from] StoreError),

    /// The log could not be written ahead of the batch; nothing was executed.
    #[error("Migration log unavailable, nothing applied: {0}")]
    Log(#[from] LogError),

    /// The batch ran but its record could not be put in place, so the
    /// batch was undone.
    #[error("Migration {id} was reverted because it could not be recorded: {source}")]
    Reverted {
        id: MigrationId,
        #[source]
        source: LogError,
    },

    /// The batch ran, could not be recorded, and could not be undone.
    #[error("Migration {id} was applied but neither recorded nor reverted ({message}): {source}")]
    Diverged {
        id: MigrationId,
        message: String,
        #[source]
        source: LogError,
    },
}

/// The most recent migration could not be rolled back.
#[derive(Debug, Error)]
pub enum RollbackError {
    #[error("No applied migration to roll back")]
    NothingToRollback,

    /// The record contains an operation with no safe inverse.
    #[error("Migration {id} cannot be rolled back: {operation} has no safe inverse")]
    NotReversible { id: MigrationId, operation: String },

    /// The inverse batch failed; the schema is unchanged.
    #[error("Rolling back migration {id} failed: {message}")]
    Failed { id: MigrationId, message: String },

    /// The log could not be written ahead of the inverse batch; nothing
    /// was executed.
    #[error("Migration log unavailable, nothing rolled back: {0}")]
    Log(#[from] LogError),

    /// The inverse batch ran but the record could not be removed, so the
    /// migration was re-applied.
    #[error("Rollback of migration {id} was undone because the log could not be updated: {source}")]
    Reverted {
        id: MigrationId,
        #[source]
        source: LogError,
    },

    /// The inverse batch ran, the log was not updated, and the migration
    /// could not be re-applied.
    #[error("Migration {id} was rolled back but is still recorded ({message}): {source}")]
    Diverged {
        id: MigrationId,
        message: String,
        #[source]
        source: LogError,
    },
}

/// A migration artifact could not be rendered, written or read.
#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("Failed to render migration: {0}")]
    Render(String),

    #[error("Migration artifact I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse migration artifact {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("Migration artifact has no operations: {path}")]
    Empty { path: PathBuf },

    /// File name is not `<id>_<name>.toml`.
    #[error("Migration artifact name is not <id>_<name>.toml: {path}")]
    InvalidName { path: PathBuf },

    #[error("Migration id {id} is used by both {first} and {second}")]
    DuplicateId {
        id: MigrationId,
        first: PathBuf,
        second: PathBuf,
    },
}
