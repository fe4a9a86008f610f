//! Error types for schema handling and configuration.

use std::path::PathBuf;

use thiserror::Error;

/// Result type for schema operations.
pub type SchemaResult<T> = Result<T, SchemaError>;

/// Errors raised while building or loading a schema snapshot.
#[derive(Debug, Error)]
pub enum SchemaError {
    /// Collection or field declared without a name.
    #[error("Empty name in {context}")]
    EmptyName { context: String },

    /// Two collections share a name.
    #[error("Duplicate collection: {name}")]
    DuplicateCollection { name: String },

    /// Two fields of one collection share a name.
    #[error("Duplicate field '{field}' in collection '{collection}'")]
    DuplicateField { collection: String, field: String },

    /// Two indexes of one collection share a name.
    #[error("Duplicate index '{index}' in collection '{collection}'")]
    DuplicateIndex { collection: String, index: String },

    /// An index has no columns.
    #[error("Index '{index}' in collection '{collection}' has no columns")]
    EmptyIndex { collection: String, index: String },

    /// An index refers to a field the collection does not declare.
    #[error("Index '{index}' in collection '{collection}' refers to unknown field '{column}'")]
    UnknownIndexColumn {
        collection: String,
        index: String,
        column: String,
    },

    /// Schema definition path not found.
    #[error("Schema path not found: {path}")]
    NotFound { path: PathBuf },

    /// Generic I/O error.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A definition file could not be parsed.
    #[error("Invalid schema definition {path}: {message}")]
    Parse { path: PathBuf, message: String },
}

impl SchemaError {
    /// Create an I/O error with path context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        let path = path.into();
        match source.kind() {
            std::io::ErrorKind::NotFound => Self::NotFound { path },
            _ => Self::Io { path, source },
        }
    }
}

/// Errors raised while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Config file could not be read.
    #[error("Cannot read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Config file is not valid TOML for [`crate::AppConfig`].
    #[error("Invalid config {path}: {message}")]
    Parse { path: PathBuf, message: String },

    /// Config values failed validation.
    #[error("Invalid configuration: {message}")]
    Invalid { message: String },
}
