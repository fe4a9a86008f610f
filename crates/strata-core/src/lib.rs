//! Core types for strata.
//!
//! This crate provides the schema model shared by the migration engine and
//! the binary, the application configuration, and the process-wide TLS
//! verification flag.

mod config;
mod error;
mod schema;
mod tls;

pub use config::{AppConfig, AppConfigBuilder, HooksSettings, MigrationSettings};
pub use error::{ConfigError, SchemaError, SchemaResult};
pub use schema::{CollectionDef, CollectionKind, FieldDef, FieldKind, IndexDef, SchemaSnapshot};
pub use tls::{DISABLE_SSL_VERIFY_ENV, init_tls_from_env, tls_verification_disabled};
