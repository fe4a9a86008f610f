//! Storage engine seam for schema state.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use strata_core::{CollectionDef, SchemaSnapshot};

use crate::error::StoreError;
use crate::operation::MigrationOperation;
use crate::persist::write_atomic;

/// Schema access offered by the storage engine.
#[cfg_attr(test, mockall::automock)]
pub trait SchemaStore: Send + Sync {
    /// The live schema.
    fn current_schema(&self) -> Result<SchemaSnapshot, StoreError>;

    /// Apply a batch in one transaction: every operation takes effect or
    /// none does.
    fn execute(&self, operations: &[MigrationOperation]) -> Result<(), StoreError>;
}

/// Apply operations to a snapshot, producing a new one.
///
/// The input is not modified. Fails on the first operation that does not
/// fit the schema it is applied to.
pub fn apply_operations(
    snapshot: &SchemaSnapshot,
    operations: &[MigrationOperation],
) -> Result<SchemaSnapshot, StoreError> {
    let mut collections: BTreeMap<String, CollectionDef> = snapshot
        .to_collections()
        .into_iter()
        .map(|c| (c.name.clone(), c))
        .collect();

    for (index, op) in operations.iter().enumerate() {
        apply_one(&mut collections, op).map_err(|message| StoreError::OperationFailed { index, message })?;
    }

    Ok(SchemaSnapshot::new(collections.into_values())?)
}

fn apply_one(collections: &mut BTreeMap<String, CollectionDef>, op: &MigrationOperation) -> Result<(), String> {
    fn target<'a>(
        collections: &'a mut BTreeMap<String, CollectionDef>,
        name: &str,
    ) -> Result<&'a mut CollectionDef, String> {
        collections
            .get_mut(name)
            .ok_or_else(|| format!("collection '{name}' does not exist"))
    }

    match op {
        MigrationOperation::CreateCollection { name, kind } => {
            if collections.contains_key(name) {
                return Err(format!("collection '{name}' already exists"));
            }
            collections.insert(name.clone(), CollectionDef::new(name.clone(), *kind));
        }
        MigrationOperation::DropCollection { name } => {
            if collections.remove(name).is_none() {
                return Err(format!("collection '{name}' does not exist"));
            }
        }
        MigrationOperation::AddField { collection, field } => {
            let def = target(collections, collection)?;
            if def.field(&field.name).is_some() {
                return Err(format!("field '{collection}.{}' already exists", field.name));
            }
            def.fields.push(field.clone());
        }
        MigrationOperation::DropField { collection, name } => {
            let def = target(collections, collection)?;
            if let Some(index) = def.indexes.iter().find(|i| i.columns.contains(name)) {
                return Err(format!(
                    "field '{collection}.{name}' is used by index '{}'",
                    index.name
                ));
            }
            let before = def.fields.len();
            def.fields.retain(|f| f.name != *name);
            if def.fields.len() == before {
                return Err(format!("field '{collection}.{name}' does not exist"));
            }
        }
        MigrationOperation::AlterField {
            collection,
            from,
            to,
        } => {
            if to.name != from.name {
                return Err(format!(
                    "field '{collection}.{}' cannot be renamed to '{}'",
                    from.name, to.name
                ));
            }
            let def = target(collections, collection)?;
            let slot = def
                .fields
                .iter_mut()
                .find(|f| f.name == from.name)
                .ok_or_else(|| format!("field '{collection}.{}' does not exist", from.name))?;
            if *slot != *from {
                return Err(format!(
                    "field '{collection}.{}' does not match its expected definition",
                    from.name
                ));
            }
            *slot = to.clone();
        }
        MigrationOperation::AddIndex { collection, index } => {
            let def = target(collections, collection)?;
            if def.index(&index.name).is_some() {
                return Err(format!("index '{}' already exists on '{collection}'", index.name));
            }
            if let Some(column) = index.columns.iter().find(|c| def.field(c).is_none()) {
                return Err(format!(
                    "index '{}' covers unknown field '{collection}.{column}'",
                    index.name
                ));
            }
            def.indexes.push(index.clone());
        }
        MigrationOperation::DropIndex { collection, index } => {
            let def = target(collections, collection)?;
            let before = def.indexes.len();
            def.indexes.retain(|i| i.name != index.name);
            if def.indexes.len() == before {
                return Err(format!("index '{}' does not exist on '{collection}'", index.name));
            }
        }
    }
    Ok(())
}

/// In-process schema store, optionally persisted as JSON.
///
/// Batches are applied to a working copy which replaces the live schema
/// only after every operation succeeded and the file (if any) was written.
pub struct MemoryStore {
    schema: RwLock<SchemaSnapshot>,
    path: Option<PathBuf>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// An empty, non-persistent store.
    pub fn new() -> Self {
        Self::with_schema(SchemaSnapshot::empty())
    }

    /// A non-persistent store starting from `schema`.
    pub fn with_schema(schema: SchemaSnapshot) -> Self {
        Self {
            schema: RwLock::new(schema),
            path: None,
        }
    }

    /// A store persisted at `path`; starts empty if the file does not exist.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let schema = match std::fs::read(&path) {
            Ok(bytes) => {
                let collections: Vec<CollectionDef> =
                    serde_json::from_slice(&bytes).map_err(|e| StoreError::Corrupt {
                        path: path.clone(),
                        message: e.to_string(),
                    })?;
                SchemaSnapshot::new(collections)?
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => SchemaSnapshot::empty(),
            Err(source) => return Err(StoreError::Io { path, source }),
        };

        Ok(Self {
            schema: RwLock::new(schema),
            path: Some(path),
        })
    }

    /// File backing this store, if persistent.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn persist(&self, schema: &SchemaSnapshot) -> Result<(), StoreError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let json = serde_json::to_vec_pretty(&schema.to_collections()).map_err(|e| StoreError::Corrupt {
            path: path.clone(),
            message: e.to_string(),
        })?;
        write_atomic(path, &json).map_err(|source| StoreError::Io {
            path: path.clone(),
            source,
        })
    }
}

impl SchemaStore for MemoryStore {
    fn current_schema(&self) -> Result<SchemaSnapshot, StoreError> {
        Ok(self.schema.read().clone())
    }

    fn execute(&self, operations: &[MigrationOperation]) -> Result<(), StoreError> {
        let mut schema = self.schema.write();
        let next = apply_operations(&schema, operations)?;
        self.persist(&next)?;
        *schema = next;
        Ok(())
    }
}
