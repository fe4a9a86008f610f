//! Atomic file replacement.

use std::io::Write;
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;

/// A replacement for a file, written and synced next to it but not yet
/// moved into place.
pub(crate) struct StagedFile {
    tmp: NamedTempFile,
    path: PathBuf,
}

impl StagedFile {
    /// Write `contents` to a temp file in the directory of `path`.
    pub(crate) fn write(path: &Path, contents: &[u8]) -> std::io::Result<Self> {
        let dir = match path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        };
        std::fs::create_dir_all(dir)?;

        let mut tmp = NamedTempFile::new_in(dir)?;
        tmp.write_all(contents)?;
        tmp.as_file().sync_all()?;
        Ok(Self {
            tmp,
            path: path.to_path_buf(),
        })
    }

    /// Move the staged file over its target. The temp file is removed on
    /// failure.
    pub(crate) fn commit(self) -> std::io::Result<()> {
        self.tmp.persist(&self.path).map_err(|e| e.error)?;
        Ok(())
    }
}

/// Replace `path` with `contents` so readers see either the old or the new
/// file, never a partial one.
pub(crate) fn write_atomic(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    StagedFile::write(path, contents)?.commit()
}
