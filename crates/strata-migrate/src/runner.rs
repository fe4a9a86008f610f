//! Transactional apply and rollback.

use std::sync::Arc;

use parking_lot::Mutex;
use strata_core::SchemaSnapshot;

use crate::error::{ApplyError, RollbackError, StoreError};
use crate::log::{AppliedMigrationLog, Migration, MigrationId, MigrationRecord};
use crate::operation::MigrationOperation;
use crate::planner::MigrationPlanner;
use crate::store::SchemaStore;

/// Name given to migrations applied without one.
const AUTOMIGRATE_NAME: &str = "automigrate";

/// Applies migrations to a [`SchemaStore`] and keeps the log in step.
///
/// The log mutex doubles as the schema-mutation lock: applies and rollbacks
/// never overlap. A batch in flight always runs to commit or abort.
pub struct MigrationRunner {
    store: Arc<dyn SchemaStore>,
    log: Mutex<AppliedMigrationLog>,
}

impl MigrationRunner {
    pub fn new(store: Arc<dyn SchemaStore>, log: AppliedMigrationLog) -> Self {
        Self {
            store,
            log: Mutex::new(log),
        }
    }

    /// The store migrations are applied to.
    pub fn store(&self) -> &Arc<dyn SchemaStore> {
        &self.store
    }

    /// Applied records, oldest first.
    pub fn applied(&self) -> Vec<MigrationRecord> {
        self.log.lock().records().to_vec()
    }

    /// Whether a migration id has been applied.
    pub fn is_applied(&self, id: MigrationId) -> bool {
        self.log.lock().contains(id)
    }

    /// Id the next generated migration should take.
    pub fn next_id(&self) -> MigrationId {
        self.log.lock().next_id()
    }

    /// Migrations not yet applied, in id order.
    pub fn pending<'a>(&self, migrations: &'a [Migration]) -> Vec<&'a Migration> {
        let log = self.log.lock();
        let mut pending: Vec<&Migration> = migrations.iter().filter(|m| !log.contains(m.id)).collect();
        pending.sort_by_key(|m| m.id);
        pending
    }

    /// Apply operations as a new migration with a fresh id.
    pub fn apply(&self, operations: Vec<MigrationOperation>) -> Result<MigrationRecord, ApplyError> {
        let mut log = self.log.lock();
        let migration = Migration::new(log.next_id(), AUTOMIGRATE_NAME, operations);
        self.apply_locked(&mut log, migration)
    }

    /// Apply a migration unless its id is already in the log.
    ///
    /// Either every operation takes effect and one record is appended, or
    /// the schema is left as it was.
    pub fn apply_migration(&self, migration: Migration) -> Result<MigrationRecord, ApplyError> {
        let mut log = self.log.lock();
        self.apply_locked(&mut log, migration)
    }

    /// Apply every pending migration in id order, stopping at the first
    /// failure.
    pub fn apply_pending(&self, migrations: &[Migration]) -> Result<Vec<MigrationRecord>, ApplyError> {
        let mut applied = Vec::new();
        for migration in self.pending(migrations) {
            applied.push(self.apply_migration(migration.clone())?);
        }
        Ok(applied)
    }

    fn apply_locked(
        &self,
        log: &mut AppliedMigrationLog,
        migration: Migration,
    ) -> Result<MigrationRecord, ApplyError> {
        if log.contains(migration.id) {
            return Err(ApplyError::AlreadyApplied { id: migration.id });
        }
        if migration.operations.is_empty() {
            return Err(ApplyError::EmptyBatch);
        }

        // The log is written before the store is touched; only moving it
        // into place can still fail after the batch commits.
        let record = MigrationRecord::applied(migration);
        let staged = log.stage_append(record.clone())?;
        let before = self.store.current_schema()?;

        self.store
            .execute(&record.operations)
            .map_err(|err| match err {
                StoreError::OperationFailed { index, message } => ApplyError::OperationFailed {
                    operation: record
                        .operations
                        .get(index)
                        .map(ToString::to_string)
                        .unwrap_or_default(),
                    index,
                    message,
                },
                other => ApplyError::Store(other),
            })
            .inspect_err(|err| tracing::error!(target: "migrate", id = %record.id, "{}", err))?;

        if let Err(source) = log.commit(staged) {
            let id = record.id;
            let err = match self.restore(&before) {
                Ok(()) => ApplyError::Reverted { id, source },
                Err(message) => ApplyError::Diverged { id, message, source },
            };
            tracing::error!(target: "migrate", %id, "{}", err);
            return Err(err);
        }

        tracing::info!(
            target: "migrate",
            id = %record.id,
            name = %record.name,
            operations = record.operations.len(),
            reversible = record.reversible,
            "migration applied"
        );
        Ok(record)
    }

    /// Undo the most recent migration and remove it from the log.
    pub fn rollback_last(&self) -> Result<MigrationRecord, RollbackError> {
        let mut log = self.log.lock();
        let record = log.last().ok_or(RollbackError::NothingToRollback)?;

        let inverse = match record.inverse() {
            Some(ops) if record.reversible => ops,
            _ => {
                let operation = record
                    .operations
                    .iter()
                    .find(|op| !op.is_reversible())
                    .map(ToString::to_string)
                    .unwrap_or_default();
                return Err(RollbackError::NotReversible {
                    id: record.id,
                    operation,
                });
            }
        };

        let (record, staged) = log.stage_pop()?.ok_or(RollbackError::NothingToRollback)?;
        let failed = |err: StoreError| RollbackError::Failed {
            id: record.id,
            message: err.to_string(),
        };
        let before = self.store.current_schema().map_err(failed)?;
        self.store.execute(&inverse).map_err(failed)?;

        if let Err(source) = log.commit(staged) {
            let id = record.id;
            let err = match self.restore(&before) {
                Ok(()) => RollbackError::Reverted { id, source },
                Err(message) => RollbackError::Diverged { id, message, source },
            };
            tracing::error!(target: "migrate", %id, "{}", err);
            return Err(err);
        }

        tracing::info!(target: "migrate", id = %record.id, name = %record.name, "migration rolled back");
        Ok(record)
    }

    /// Bring the store back to `snapshot` after a batch that could not be
    /// recorded.
    fn restore(&self, snapshot: &SchemaSnapshot) -> Result<(), String> {
        let current = self.store.current_schema().map_err(|e| e.to_string())?;
        let operations = MigrationPlanner::diff(&current, snapshot).map_err(|e| e.to_string())?;
        if operations.is_empty() {
            return Ok(());
        }
        self.store.execute(&operations).map_err(|e| e.to_string())?;
        tracing::warn!(target: "migrate", operations = operations.len(), "restored schema after log failure");
        Ok(())
    }
}
