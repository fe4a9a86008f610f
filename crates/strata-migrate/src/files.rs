//! Migration artifacts on disk.
//!
//! Each artifact is `<id>_<name>.toml` holding an `operations` array.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ArtifactError;
use crate::log::{Migration, MigrationId};
use crate::operation::MigrationOperation;

pub(crate) const ARTIFACT_EXTENSION: &str = "toml";

#[derive(Serialize, Deserialize)]
pub(crate) struct ArtifactBody {
    #[serde(default)]
    pub operations: Vec<MigrationOperation>,
}

/// Split `<id>_<name>.toml` into its parts.
pub(crate) fn parse_file_name(path: &Path) -> Option<(MigrationId, String)> {
    if path.extension()? != ARTIFACT_EXTENSION {
        return None;
    }
    let stem = path.file_stem()?.to_str()?;
    let (id, name) = stem.split_once('_')?;
    let id = id.parse().ok()?;
    (!name.is_empty()).then(|| (MigrationId(id), name.to_string()))
}

/// Read one artifact.
pub fn load_file(path: &Path) -> Result<Migration, ArtifactError> {
    let (id, name) = parse_file_name(path).ok_or_else(|| ArtifactError::InvalidName {
        path: path.to_path_buf(),
    })?;
    let source = std::fs::read_to_string(path).map_err(|source| ArtifactError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let body: ArtifactBody = toml::from_str(&source).map_err(|e| ArtifactError::Parse {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;

    if body.operations.is_empty() {
        return Err(ArtifactError::Empty {
            path: path.to_path_buf(),
        });
    }
    Ok(Migration::new(id, &name, body.operations))
}

/// Read every artifact in `dir`, sorted by id.
///
/// A missing directory holds no migrations. Files with other extensions
/// are ignored; a `.toml` file with a malformed name is an error.
pub fn load_dir(dir: &Path) -> Result<Vec<Migration>, ArtifactError> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(source) => {
            return Err(ArtifactError::Io {
                path: dir.to_path_buf(),
                source,
            });
        }
    };

    let mut by_id: BTreeMap<MigrationId, (PathBuf, Migration)> = BTreeMap::new();
    for path in entries.flatten().map(|e| e.path()) {
        if !path.is_file() || path.extension().is_none_or(|ext| ext != ARTIFACT_EXTENSION) {
            continue;
        }
        let migration = load_file(&path)?;
        if let Some((first, _)) = by_id.get(&migration.id) {
            let (first, second) = if *first < path {
                (first.clone(), path)
            } else {
                (path, first.clone())
            };
            return Err(ArtifactError::DuplicateId {
                id: migration.id,
                first,
                second,
            });
        }
        by_id.insert(migration.id, (path, migration));
    }

    tracing::debug!(target: "migrate", dir = %dir.display(), count = by_id.len(), "loaded migration artifacts");
    Ok(by_id.into_values().map(|(_, m)| m).collect())
}
