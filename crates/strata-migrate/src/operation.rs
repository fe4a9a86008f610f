//! The closed set of schema operations.

use std::fmt;

use itertools::Itertools;
use serde::{Deserialize, Serialize};
use strata_core::{CollectionKind, FieldDef, IndexDef};

/// One schema change, carrying enough to apply it and, where safe, to
/// invert it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum MigrationOperation {
    /// Create an empty collection.
    CreateCollection {
        name: String,
        #[serde(default)]
        kind: CollectionKind,
    },

    /// Drop a collection and its records.
    DropCollection { name: String },

    /// Append a field to a collection.
    AddField { collection: String, field: FieldDef },

    /// Remove a field and its data.
    DropField { collection: String, name: String },

    /// Change a field's attributes. `from` is the expected current state.
    AlterField {
        collection: String,
        from: FieldDef,
        to: FieldDef,
    },

    /// Create an index.
    AddIndex { collection: String, index: IndexDef },

    /// Drop an index. Carries the full definition so it can be recreated.
    DropIndex { collection: String, index: IndexDef },
}

impl MigrationOperation {
    /// Collection the operation targets.
    pub fn collection(&self) -> &str {
        match self {
            Self::CreateCollection { name, .. } | Self::DropCollection { name } => name,
            Self::AddField { collection, .. }
            | Self::DropField { collection, .. }
            | Self::AlterField { collection, .. }
            | Self::AddIndex { collection, .. }
            | Self::DropIndex { collection, .. } => collection,
        }
    }

    /// The operation that undoes this one, if undoing it loses no data.
    ///
    /// Dropping a collection or a field discards records, so neither has
    /// an inverse.
    pub fn inverse(&self) -> Option<Self> {
        match self {
            Self::CreateCollection { name, .. } => Some(Self::DropCollection { name: name.clone() }),
            Self::DropCollection { .. } | Self::DropField { .. } => None,
            Self::AddField { collection, field } => Some(Self::DropField {
                collection: collection.clone(),
                name: field.name.clone(),
            }),
            Self::AlterField {
                collection,
                from,
                to,
            } => Some(Self::AlterField {
                collection: collection.clone(),
                from: to.clone(),
                to: from.clone(),
            }),
            Self::AddIndex { collection, index } => Some(Self::DropIndex {
                collection: collection.clone(),
                index: index.clone(),
            }),
            Self::DropIndex { collection, index } => Some(Self::AddIndex {
                collection: collection.clone(),
                index: index.clone(),
            }),
        }
    }

    /// Whether [`MigrationOperation::inverse`] exists.
    pub fn is_reversible(&self) -> bool {
        !matches!(self, Self::DropCollection { .. } | Self::DropField { .. })
    }
}

impl fmt::Display for MigrationOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CreateCollection { name, kind } => write!(f, "create {kind} collection {name}"),
            Self::DropCollection { name } => write!(f, "drop collection {name}"),
            Self::AddField { collection, field } => {
                write!(f, "add field {collection}.{} ({})", field.name, field.kind)
            }
            Self::DropField { collection, name } => write!(f, "drop field {collection}.{name}"),
            Self::AlterField { collection, to, .. } => {
                write!(f, "alter field {collection}.{}", to.name)
            }
            Self::AddIndex { collection, index } => write!(
                f,
                "add index {} on {collection}({})",
                index.name,
                index.columns.iter().join(", ")
            ),
            Self::DropIndex { collection, index } => {
                write!(f, "drop index {} on {collection}", index.name)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_core::FieldKind;

    #[test]
    fn test_inverse_of_reversible_ops() {
        let field = FieldDef::new("email", FieldKind::Email);
        let add = MigrationOperation::AddField {
            collection: "users".into(),
            field,
        };
        assert_eq!(
            add.inverse(),
            Some(MigrationOperation::DropField {
                collection: "users".into(),
                name: "email".into(),
            })
        );

        let alter = MigrationOperation::AlterField {
            collection: "users".into(),
            from: FieldDef::new("email", FieldKind::Email),
            to: FieldDef::new("email", FieldKind::Email).required(),
        };
        assert_eq!(alter.inverse().and_then(|op| op.inverse()), Some(alter));
    }

    #[test]
    fn test_drops_have_no_inverse() {
        let drop_field = MigrationOperation::DropField {
            collection: "users".into(),
            name: "legacy_flag".into(),
        };
        assert!(!drop_field.is_reversible());
        assert_eq!(drop_field.inverse(), None);

        let drop_collection = MigrationOperation::DropCollection { name: "users".into() };
        assert!(drop_collection.inverse().is_none());
    }

    #[test]
    fn test_display() {
        let op = MigrationOperation::AddIndex {
            collection: "posts".into(),
            index: IndexDef::new("idx_posts_author_status", ["author", "status"]),
        };
        assert_eq!(
            op.to_string(),
            "add index idx_posts_author_status on posts(author, status)"
        );
    }

    #[test]
    fn test_serialized_tag() {
        let op = MigrationOperation::DropField {
            collection: "users".into(),
            name: "legacy_flag".into(),
        };
        let json = serde_json::to_value(&op).unwrap();
        assert_eq!(json["op"], "drop_field");
        assert_eq!(json["name"], "legacy_flag");
    }
}
