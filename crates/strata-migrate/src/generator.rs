//! Rendering migrations as reviewable artifacts.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use crate::error::ArtifactError;
use crate::files::{ARTIFACT_EXTENSION, ArtifactBody};
use crate::log::{Migration, MigrationId};
use crate::operation::MigrationOperation;
use crate::persist::write_atomic;

/// Writes migration artifacts into a directory.
#[derive(Debug, Clone)]
pub struct MigrationFileGenerator {
    dir: PathBuf,
}

impl MigrationFileGenerator {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Target directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Render operations as artifact text.
    ///
    /// Output depends only on the operations, so identical input always
    /// renders byte-identical text.
    pub fn render(operations: &[MigrationOperation]) -> Result<String, ArtifactError> {
        let body = ArtifactBody {
            operations: operations.to_vec(),
        };
        let toml = toml::to_string(&body).map_err(|e| ArtifactError::Render(e.to_string()))?;
        let reversible = operations.iter().all(MigrationOperation::is_reversible);

        let mut out = String::new();
        out.push_str("# Generated by strata automigrate. Review before committing.\n");
        out.push_str(&format!("# Operations: {}\n", operations.len()));
        out.push_str(&format!("# Reversible: {reversible}\n"));
        for op in operations {
            out.push_str(&format!("#   - {op}\n"));
        }
        out.push('\n');
        out.push_str(&toml);
        Ok(out)
    }

    /// `<id>_<name>.toml`
    pub fn file_name(id: MigrationId, name: &str) -> String {
        format!("{id}_{name}.{ARTIFACT_EXTENSION}")
    }

    /// A descriptive name for a batch: `created_<c>`, `deleted_<c>` or
    /// `updated_<c>` when one collection is involved, else `automigrate`.
    pub fn suggest_name(operations: &[MigrationOperation]) -> String {
        let mut collections = operations
            .iter()
            .map(MigrationOperation::collection)
            .collect::<BTreeSet<_>>()
            .into_iter();
        let (Some(collection), None) = (collections.next(), collections.next()) else {
            return "automigrate".to_string();
        };

        let verb = if operations
            .iter()
            .any(|op| matches!(op, MigrationOperation::CreateCollection { .. }))
        {
            "created"
        } else if operations
            .iter()
            .any(|op| matches!(op, MigrationOperation::DropCollection { .. }))
        {
            "deleted"
        } else {
            "updated"
        };
        format!("{verb}_{collection}")
    }

    /// Write a migration's artifact, replacing any file of the same name.
    pub fn write(&self, migration: &Migration) -> Result<PathBuf, ArtifactError> {
        let text = Self::render(&migration.operations)?;
        let path = self.dir.join(Self::file_name(migration.id, &migration.name));
        write_atomic(&path, text.as_bytes()).map_err(|source| ArtifactError::Io {
            path: path.clone(),
            source,
        })?;

        tracing::info!(target: "migrate", path = %path.display(), operations = migration.operations.len(), "wrote migration artifact");
        Ok(path)
    }
}
