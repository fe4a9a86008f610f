//! Automigration engine for strata.
//!
//! Desired schema state is compared against the live store by the
//! [`MigrationPlanner`], producing an ordered list of
//! [`MigrationOperation`]s. The [`MigrationRunner`] applies a list as one
//! all-or-nothing batch and records it in the [`AppliedMigrationLog`]; the
//! [`MigrationFileGenerator`] renders the same list as a reviewable artifact.
//!
//! ```text
//! SchemaSnapshot(current) ─┐
//!                          ├─> MigrationPlanner ─> [MigrationOperation] ─┬─> MigrationRunner ─> SchemaStore
//! SchemaSnapshot(desired) ─┘                                            └─> MigrationFileGenerator
//! ```

mod error;
mod files;
mod generator;
mod log;
mod operation;
mod persist;
mod planner;
mod runner;
mod store;

pub use error::{ApplyError, ArtifactError, LogError, PlanError, RollbackError, StoreError};
pub use files::{load_dir, load_file};
pub use generator::MigrationFileGenerator;
pub use log::{AppliedMigrationLog, Migration, MigrationId, MigrationRecord};
pub use operation::MigrationOperation;
pub use planner::MigrationPlanner;
pub use runner::MigrationRunner;
pub use store::{MemoryStore, SchemaStore, apply_operations};
