//! Hook script discovery, compilation and reload.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use globset::{Glob, GlobSet, GlobSetBuilder};

use crate::registry::{BindingDiff, HookBinding, HookRegistry};
use crate::sandbox::{CompiledUnit, ScriptSandbox};
use crate::types::{CompileError, LoadError};
use crate::watcher::ChangeSet;

/// A successfully compiled script file.
#[derive(Clone)]
pub struct ScriptUnit {
    /// Script file.
    pub path: PathBuf,
    /// Compiled form, owning its interpreter state.
    pub unit: Arc<dyn CompiledUnit>,
    /// Modification time when compiled.
    pub modified: Option<SystemTime>,
}

impl fmt::Debug for ScriptUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScriptUnit")
            .field("path", &self.path)
            .field("events", &self.unit.events())
            .field("modified", &self.modified)
            .finish()
    }
}

/// Outcome of loading a whole directory.
///
/// Partial success is normal: files listed in `errors` are skipped (or keep
/// their previously loaded version) and everything else is registered.
#[derive(Debug, Default)]
pub struct LoadReport {
    /// Scripts compiled in this pass, in lexical order.
    pub loaded: Vec<PathBuf>,
    /// One entry per script that failed to compile.
    pub errors: Vec<CompileError>,
    /// Bindings active after the load.
    pub bindings: usize,
}

impl LoadReport {
    /// Whether every script compiled.
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Outcome of applying one change set.
#[derive(Debug, Default)]
pub struct ReloadSummary {
    /// Per-script binding changes, removals first.
    pub diffs: Vec<BindingDiff>,
    /// Scripts that failed to recompile.
    pub errors: Vec<CompileError>,
    /// Set when a requested rescan could not read the directory.
    pub load_error: Option<LoadError>,
    /// Whether the whole directory was reloaded.
    pub rescanned: bool,
}

/// Compiles scripts from a directory into a [`HookRegistry`].
pub struct HookLoader {
    sandbox: Arc<dyn ScriptSandbox>,
    registry: Arc<HookRegistry>,
    patterns: GlobSet,
    root: Option<PathBuf>,
    units: BTreeMap<PathBuf, ScriptUnit>,
}

impl HookLoader {
    /// Create a loader matching script file names against `patterns`.
    pub fn new<S: AsRef<str>>(
        sandbox: Arc<dyn ScriptSandbox>,
        registry: Arc<HookRegistry>,
        patterns: &[S],
    ) -> Result<Self, LoadError> {
        let mut builder = GlobSetBuilder::new();
        for pattern in patterns {
            let pattern = pattern.as_ref();
            let glob = Glob::new(pattern).map_err(|e| LoadError::Pattern {
                pattern: pattern.to_string(),
                message: e.to_string(),
            })?;
            builder.add(glob);
        }
        let patterns = builder.build().map_err(|e| LoadError::Pattern {
            pattern: String::new(),
            message: e.to_string(),
        })?;

        Ok(Self {
            sandbox,
            registry,
            patterns,
            root: None,
            units: BTreeMap::new(),
        })
    }

    /// Registry this loader publishes into.
    pub fn registry(&self) -> &Arc<HookRegistry> {
        &self.registry
    }

    /// Directory of the last successful [`HookLoader::load_all`].
    pub fn root(&self) -> Option<&Path> {
        self.root.as_deref()
    }

    /// Currently loaded scripts.
    pub fn units(&self) -> impl Iterator<Item = &ScriptUnit> {
        self.units.values()
    }

    /// Whether a file name matches the script patterns.
    pub fn is_script(&self, path: &Path) -> bool {
        path.file_name()
            .is_some_and(|name| self.patterns.is_match(Path::new(name)))
    }

    /// Compile every script in `dir` and replace the whole registry.
    ///
    /// Scripts are compiled in lexical path order and bindings are
    /// registered in that order, then declaration order. A script that fails
    /// to compile is reported; if it was loaded before, its previous version
    /// stays active. An unreadable directory leaves the registry untouched.
    pub fn load_all(&mut self, dir: &Path) -> Result<LoadReport, LoadError> {
        let root = canonical_dir(dir)?;
        let files = self.list_scripts(&root)?;

        let mut report = LoadReport::default();
        let mut units = BTreeMap::new();
        for path in files {
            match self.compile_file(&path) {
                Ok(unit) => {
                    report.loaded.push(path.clone());
                    units.insert(path, unit);
                }
                Err(err) => {
                    tracing::warn!(target: "hooks", "{}", err);
                    if let Some(previous) = self.units.remove(&path) {
                        units.insert(path, previous);
                    }
                    report.errors.push(err);
                }
            }
        }

        let bindings: Vec<HookBinding> = units
            .values()
            .flat_map(|u| HookBinding::from_unit(&u.unit))
            .collect();
        report.bindings = bindings.len();
        self.registry.replace_all(bindings);
        self.units = units;
        self.root = Some(root.clone());

        tracing::info!(
            target: "hooks",
            dir = %root.display(),
            scripts = self.units.len(),
            bindings = report.bindings,
            errors = report.errors.len(),
            "hooks loaded"
        );
        Ok(report)
    }

    /// Compile every script in `dir` without touching the registry.
    pub fn check(&self, dir: &Path) -> Result<LoadReport, LoadError> {
        let root = canonical_dir(dir)?;
        let mut report = LoadReport::default();
        for path in self.list_scripts(&root)? {
            match self.compile_file(&path) {
                Ok(unit) => {
                    report.bindings += unit.unit.events().len();
                    report.loaded.push(path);
                }
                Err(err) => report.errors.push(err),
            }
        }
        Ok(report)
    }

    /// Recompile one script and swap its bindings in.
    ///
    /// The new bindings go after every other script's bindings for the same
    /// events. On a compile error the previous bindings remain. A path that
    /// no longer exists is unloaded.
    pub fn reload_one(&mut self, path: &Path) -> Result<BindingDiff, CompileError> {
        let path = normalize(path);
        if !path.is_file() {
            return Ok(self.unload(&path));
        }

        let unit = self.compile_file(&path).inspect_err(|err| {
            tracing::warn!(target: "hooks", "{}", err);
        })?;
        let diff = self
            .registry
            .replace_owner(&path, HookBinding::from_unit(&unit.unit));
        self.units.insert(path.clone(), unit);

        tracing::info!(
            target: "hooks",
            script = %path.display(),
            added = diff.added.len(),
            removed = diff.removed.len(),
            "hook reloaded"
        );
        Ok(diff)
    }

    /// Remove every binding of a script.
    pub fn unload(&mut self, path: &Path) -> BindingDiff {
        let path = normalize(path);
        self.units.remove(&path);
        let removed = self.registry.replace_owner(&path, Vec::new()).removed;
        if !removed.is_empty() {
            tracing::info!(target: "hooks", script = %path.display(), removed = removed.len(), "hook unloaded");
        }
        BindingDiff {
            owner: path,
            added: Vec::new(),
            removed,
        }
    }

    /// Apply a batch of filesystem changes.
    ///
    /// Deleted scripts are unloaded before any changed script is
    /// recompiled. A rescan reloads the whole directory instead.
    pub fn apply_changes(&mut self, changes: &ChangeSet) -> ReloadSummary {
        let mut summary = ReloadSummary::default();

        if changes.rescan {
            summary.rescanned = true;
            let Some(root) = self.root.clone() else {
                return summary;
            };
            match self.load_all(&root) {
                Ok(report) => summary.errors = report.errors,
                Err(err) => {
                    tracing::warn!(target: "hooks", "{}", err);
                    summary.load_error = Some(err);
                }
            }
            return summary;
        }

        let (present, missing): (Vec<PathBuf>, Vec<PathBuf>) = changes
            .paths
            .iter()
            .map(|p| normalize(p))
            .filter(|p| self.is_script(p) && self.in_root(p))
            .partition(|p| p.is_file());

        for path in missing {
            if self.units.contains_key(&path) {
                summary.diffs.push(self.unload(&path));
            }
        }

        for path in present {
            match self.reload_one(&path) {
                Ok(diff) => summary.diffs.push(diff),
                Err(err) => summary.errors.push(err),
            }
        }

        summary
    }

    fn in_root(&self, path: &Path) -> bool {
        match &self.root {
            Some(root) => path.parent() == Some(root.as_path()),
            None => true,
        }
    }

    fn list_scripts(&self, root: &Path) -> Result<Vec<PathBuf>, LoadError> {
        let entries = std::fs::read_dir(root).map_err(|source| LoadError::Unreadable {
            path: root.to_path_buf(),
            source,
        })?;

        let mut files: Vec<PathBuf> = entries
            .flatten()
            .map(|entry| entry.path())
            .filter(|path| path.is_file() && self.is_script(path))
            .collect();
        files.sort();
        Ok(files)
    }

    fn compile_file(&self, path: &Path) -> Result<ScriptUnit, CompileError> {
        let source = std::fs::read_to_string(path)
            .map_err(|e| CompileError::new(path, format!("cannot read script: {e}")))?;
        let modified = std::fs::metadata(path).and_then(|m| m.modified()).ok();
        let unit = self.sandbox.compile(path, &source)?;

        Ok(ScriptUnit {
            path: path.to_path_buf(),
            unit,
            modified,
        })
    }
}

fn canonical_dir(dir: &Path) -> Result<PathBuf, LoadError> {
    let root = dir.canonicalize().map_err(|source| LoadError::Unreadable {
        path: dir.to_path_buf(),
        source,
    })?;
    if !root.is_dir() {
        return Err(LoadError::NotADirectory { path: root });
    }
    Ok(root)
}

/// Canonical form of a script path, also for files that no longer exist.
fn normalize(path: &Path) -> PathBuf {
    if let Ok(path) = path.canonicalize() {
        return path;
    }
    match (path.parent(), path.file_name()) {
        (Some(parent), Some(name)) => parent
            .canonicalize()
            .map(|parent| parent.join(name))
            .unwrap_or_else(|_| path.to_path_buf()),
        _ => path.to_path_buf(),
    }
}
