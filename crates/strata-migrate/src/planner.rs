//! Snapshot diffing.

use std::collections::{BTreeMap, HashSet};

use strata_core::{CollectionDef, FieldDef, IndexDef, SchemaSnapshot};

use crate::error::PlanError;
use crate::operation::MigrationOperation;

/// Computes the operations that turn one snapshot into another.
pub struct MigrationPlanner;

impl MigrationPlanner {
    /// Operations turning `current` into `desired`; empty when they match.
    ///
    /// Output order:
    ///
    /// 1. `CreateCollection` for every new collection, by name.
    /// 2. Per collection, by name: `DropIndex`, `DropField`, `AlterField`
    ///    (each by name), `AddField` (in declaration order), `AddIndex` (by
    ///    name).
    /// 3. `DropCollection` for every removed collection, by name.
    ///
    /// A new collection is created empty and filled by step 2. A changed or
    /// renamed-in-place index is dropped and re-added.
    pub fn diff(
        current: &SchemaSnapshot,
        desired: &SchemaSnapshot,
    ) -> Result<Vec<MigrationOperation>, PlanError> {
        let mut creates = Vec::new();
        let mut changes = Vec::new();
        let mut drops = Vec::new();

        for wanted in desired.collections() {
            match current.collection(&wanted.name) {
                Some(existing) => {
                    if existing.kind != wanted.kind {
                        return Err(PlanError::CollectionKindChanged {
                            collection: wanted.name.clone(),
                            from: existing.kind,
                            to: wanted.kind,
                        });
                    }
                    diff_collection(existing, wanted, &mut changes)?;
                }
                None => {
                    creates.push(MigrationOperation::CreateCollection {
                        name: wanted.name.clone(),
                        kind: wanted.kind,
                    });
                    let empty = CollectionDef::new(wanted.name.clone(), wanted.kind);
                    diff_collection(&empty, wanted, &mut changes)?;
                }
            }
        }

        for existing in current.collections() {
            if !desired.contains(&existing.name) {
                drops.push(MigrationOperation::DropCollection {
                    name: existing.name.clone(),
                });
            }
        }

        let mut operations = creates;
        operations.append(&mut changes);
        operations.append(&mut drops);

        if !operations.is_empty() {
            tracing::debug!(target: "migrate", operations = operations.len(), "planned schema changes");
        }
        Ok(operations)
    }
}

fn diff_collection(
    current: &CollectionDef,
    desired: &CollectionDef,
    out: &mut Vec<MigrationOperation>,
) -> Result<(), PlanError> {
    let collection = &desired.name;

    let current_indexes: BTreeMap<&str, &IndexDef> =
        current.indexes.iter().map(|i| (i.name.as_str(), i)).collect();
    let desired_indexes: BTreeMap<&str, &IndexDef> =
        desired.indexes.iter().map(|i| (i.name.as_str(), i)).collect();

    for (name, index) in &current_indexes {
        if desired_indexes.get(name) != Some(index) {
            out.push(MigrationOperation::DropIndex {
                collection: collection.clone(),
                index: (*index).clone(),
            });
        }
    }

    let current_fields: BTreeMap<&str, &FieldDef> =
        current.fields.iter().map(|f| (f.name.as_str(), f)).collect();
    let desired_names: HashSet<&str> = desired.fields.iter().map(|f| f.name.as_str()).collect();

    for name in current_fields.keys() {
        if !desired_names.contains(name) {
            out.push(MigrationOperation::DropField {
                collection: collection.clone(),
                name: (*name).to_string(),
            });
        }
    }

    let mut altered: Vec<&FieldDef> = desired
        .fields
        .iter()
        .filter(|f| current_fields.get(f.name.as_str()).is_some_and(|c| *c != *f))
        .collect();
    altered.sort_by(|a, b| a.name.cmp(&b.name));
    for field in altered {
        let from = current_fields[field.name.as_str()];
        if from.kind != field.kind {
            return Err(PlanError::FieldKindChanged {
                collection: collection.clone(),
                field: field.name.clone(),
                from: from.kind,
                to: field.kind,
            });
        }
        out.push(MigrationOperation::AlterField {
            collection: collection.clone(),
            from: from.clone(),
            to: field.clone(),
        });
    }

    for field in &desired.fields {
        if !current_fields.contains_key(field.name.as_str()) {
            out.push(MigrationOperation::AddField {
                collection: collection.clone(),
                field: field.clone(),
            });
        }
    }

    for (name, index) in &desired_indexes {
        if current_indexes.get(name) != Some(index) {
            out.push(MigrationOperation::AddIndex {
                collection: collection.clone(),
                index: (*index).clone(),
            });
        }
    }

    Ok(())
}
