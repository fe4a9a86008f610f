//! Schema model: collections, fields and indexes.
//!
//! A [`SchemaSnapshot`] is an immutable description of schema state. Desired
//! state comes from declarative TOML definitions (one collection per file);
//! live state is produced by the storage engine. Snapshots are validated on
//! construction and never mutated afterwards.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::error::{SchemaError, SchemaResult};

/// Kind of collection.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum CollectionKind {
    /// Plain record collection.
    #[default]
    Base,
    /// Collection holding authenticatable records.
    Auth,
    /// Read-only collection backed by a query.
    View,
}

/// Storage type of a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum FieldKind {
    Text,
    Number,
    Bool,
    Email,
    Url,
    Editor,
    Date,
    Autodate,
    Select,
    Json,
    File,
    Relation,
}

fn is_false(value: &bool) -> bool {
    !*value
}

/// Definition of a single field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDef {
    /// Field name, unique within its collection.
    pub name: String,

    /// Storage type.
    pub kind: FieldKind,

    /// Whether a value is mandatory.
    #[serde(default, skip_serializing_if = "is_false")]
    pub required: bool,

    /// Whether values must be unique across records.
    #[serde(default, skip_serializing_if = "is_false")]
    pub unique: bool,

    /// Minimum length or value.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<i64>,

    /// Maximum length or value.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<i64>,

    /// Validation regex for text fields.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,

    /// Allowed values for select fields.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub values: Vec<String>,

    /// Target collection for relation fields.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collection: Option<String>,
}

impl FieldDef {
    /// Create a field with default attributes.
    pub fn new(name: impl Into<String>, kind: FieldKind) -> Self {
        Self {
            name: name.into(),
            kind,
            required: false,
            unique: false,
            min: None,
            max: None,
            pattern: None,
            values: Vec::new(),
            collection: None,
        }
    }

    /// Mark the field as required.
    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    /// Mark the field as unique.
    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    /// Set length/value bounds.
    pub fn with_bounds(mut self, min: Option<i64>, max: Option<i64>) -> Self {
        self.min = min;
        self.max = max;
        self
    }

    /// Set the validation pattern.
    pub fn with_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.pattern = Some(pattern.into());
        self
    }

    /// Set the allowed select values.
    pub fn with_values<I, S>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.values = values.into_iter().map(Into::into).collect();
        self
    }

    /// Set the relation target.
    pub fn relation_to(mut self, collection: impl Into<String>) -> Self {
        self.collection = Some(collection.into());
        self
    }
}

/// Definition of an index.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IndexDef {
    /// Index name, unique within its collection.
    pub name: String,

    /// Indexed field names, in key order.
    pub columns: Vec<String>,

    /// Whether the index enforces uniqueness.
    #[serde(default, skip_serializing_if = "is_false")]
    pub unique: bool,
}

impl IndexDef {
    /// Create a non-unique index.
    pub fn new<I, S>(name: impl Into<String>, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            columns: columns.into_iter().map(Into::into).collect(),
            unique: false,
        }
    }

    /// Mark the index as unique.
    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }
}

/// Definition of a collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionDef {
    /// Collection name, unique within a snapshot.
    pub name: String,

    /// Collection kind.
    #[serde(default)]
    pub kind: CollectionKind,

    /// Fields in declaration order.
    #[serde(default)]
    pub fields: Vec<FieldDef>,

    /// Indexes. Treated as a set keyed by name; kept sorted by name once
    /// the collection is part of a snapshot.
    #[serde(default)]
    pub indexes: Vec<IndexDef>,
}

impl CollectionDef {
    /// Create an empty collection.
    pub fn new(name: impl Into<String>, kind: CollectionKind) -> Self {
        Self {
            name: name.into(),
            kind,
            fields: Vec::new(),
            indexes: Vec::new(),
        }
    }

    /// Append a field.
    pub fn with_field(mut self, field: FieldDef) -> Self {
        self.fields.push(field);
        self
    }

    /// Add an index.
    pub fn with_index(mut self, index: IndexDef) -> Self {
        self.indexes.push(index);
        self
    }

    /// Look up a field by name.
    pub fn field(&self, name: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Look up an index by name.
    pub fn index(&self, name: &str) -> Option<&IndexDef> {
        self.indexes.iter().find(|i| i.name == name)
    }

    /// Parse a single collection definition from TOML.
    pub fn from_toml_str(source: &str, path: &Path) -> SchemaResult<Self> {
        toml::from_str(source).map_err(|e| SchemaError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }

    /// Check the collection's internal consistency.
    pub fn validate(&self) -> SchemaResult<()> {
        if self.name.trim().is_empty() {
            return Err(SchemaError::EmptyName {
                context: "collection".into(),
            });
        }

        let mut field_names = HashSet::new();
        for field in &self.fields {
            if field.name.trim().is_empty() {
                return Err(SchemaError::EmptyName {
                    context: format!("field of collection '{}'", self.name),
                });
            }
            if !field_names.insert(field.name.as_str()) {
                return Err(SchemaError::DuplicateField {
                    collection: self.name.clone(),
                    field: field.name.clone(),
                });
            }
        }

        let mut index_names = HashSet::new();
        for index in &self.indexes {
            if index.name.trim().is_empty() {
                return Err(SchemaError::EmptyName {
                    context: format!("index of collection '{}'", self.name),
                });
            }
            if !index_names.insert(index.name.as_str()) {
                return Err(SchemaError::DuplicateIndex {
                    collection: self.name.clone(),
                    index: index.name.clone(),
                });
            }
            if index.columns.is_empty() {
                return Err(SchemaError::EmptyIndex {
                    collection: self.name.clone(),
                    index: index.name.clone(),
                });
            }
            if let Some(column) = index.columns.iter().find(|c| !field_names.contains(c.as_str())) {
                return Err(SchemaError::UnknownIndexColumn {
                    collection: self.name.clone(),
                    index: index.name.clone(),
                    column: column.clone(),
                });
            }
        }

        Ok(())
    }
}

/// Immutable, comparable description of schema state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchemaSnapshot {
    collections: BTreeMap<String, CollectionDef>,
}

impl SchemaSnapshot {
    /// An empty schema.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Build a validated snapshot from collection definitions.
    pub fn new(collections: impl IntoIterator<Item = CollectionDef>) -> SchemaResult<Self> {
        let mut map = BTreeMap::new();
        for mut collection in collections {
            collection.validate()?;
            collection.indexes.sort_by(|a, b| a.name.cmp(&b.name));
            if map.contains_key(&collection.name) {
                return Err(SchemaError::DuplicateCollection {
                    name: collection.name,
                });
            }
            map.insert(collection.name.clone(), collection);
        }
        Ok(Self { collections: map })
    }

    /// Load desired state from a directory of `*.toml` definitions.
    ///
    /// Files are read in lexical order; each holds one collection.
    pub fn load_dir(dir: &Path) -> SchemaResult<Self> {
        let entries = std::fs::read_dir(dir).map_err(|e| SchemaError::io(dir, e))?;

        let mut paths: Vec<_> = entries
            .flatten()
            .map(|entry| entry.path())
            .filter(|path| path.is_file() && path.extension().is_some_and(|ext| ext == "toml"))
            .collect();
        paths.sort();

        let mut collections = Vec::with_capacity(paths.len());
        for path in paths {
            let source = std::fs::read_to_string(&path).map_err(|e| SchemaError::io(&path, e))?;
            collections.push(CollectionDef::from_toml_str(&source, &path)?);
        }

        tracing::debug!(target: "migrate", dir = %dir.display(), count = collections.len(), "loaded schema definitions");
        Self::new(collections)
    }

    /// Look up a collection by name.
    pub fn collection(&self, name: &str) -> Option<&CollectionDef> {
        self.collections.get(name)
    }

    /// Whether a collection exists.
    pub fn contains(&self, name: &str) -> bool {
        self.collections.contains_key(name)
    }

    /// Iterate collections in name order.
    pub fn collections(&self) -> impl Iterator<Item = &CollectionDef> {
        self.collections.values()
    }

    /// Collection names in lexical order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.collections.keys().map(String::as_str)
    }

    /// Number of collections.
    pub fn len(&self) -> usize {
        self.collections.len()
    }

    /// Whether the schema has no collections.
    pub fn is_empty(&self) -> bool {
        self.collections.is_empty()
    }

    /// Clone out the collection definitions, in name order.
    ///
    /// Used to derive a new snapshot; this one is left untouched.
    pub fn to_collections(&self) -> Vec<CollectionDef> {
        self.collections.values().cloned().collect()
    }
}
