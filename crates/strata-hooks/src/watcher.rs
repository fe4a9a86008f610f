//! Directory watching with debounced change sets.
//!
//! ```text
//! notify --raw events--> debounce task --ChangeSet--> reload loop --> HookLoader
//! ```
//!
//! The debounce task owns the platform watcher and the debounce timer;
//! stopping the [`DirectoryWatcher`] releases both.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use notify::event::ModifyKind;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::Mutex;
use strata_core::HooksSettings;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::loader::HookLoader;
use crate::types::WatchError;

/// Change sets buffered between the watcher and the reload loop.
const CHANGE_CHANNEL_SIZE: usize = 16;

/// Debounce and recovery timing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchConfig {
    /// Quiet period after the last event before a change set is emitted.
    pub debounce: Duration,
    /// How often a lost watch is retried; `None` never retries.
    pub rearm_interval: Option<Duration>,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(50),
            rearm_interval: Some(Duration::from_secs(2)),
        }
    }
}

impl WatchConfig {
    /// Build from application settings. A zero re-arm interval disables it.
    pub fn from_settings(settings: &HooksSettings) -> Self {
        Self {
            debounce: Duration::from_millis(settings.debounce_ms),
            rearm_interval: (settings.rearm_interval_ms > 0)
                .then(|| Duration::from_millis(settings.rearm_interval_ms)),
        }
    }
}

/// A coalesced batch of filesystem changes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeSet {
    /// Paths created, modified, removed or renamed (both names).
    pub paths: BTreeSet<PathBuf>,
    /// The whole directory must be reloaded.
    pub rescan: bool,
}

impl ChangeSet {
    /// A request to reload everything.
    pub fn rescan() -> Self {
        Self {
            paths: BTreeSet::new(),
            rescan: true,
        }
    }

    /// Whether the set carries nothing.
    pub fn is_empty(&self) -> bool {
        self.paths.is_empty() && !self.rescan
    }
}

/// Health of a watch session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchState {
    /// Events are being observed.
    Active,
    /// The path was lost; loaded hooks stay active and no reloads happen.
    Degraded,
}

/// A running watch over one directory.
pub struct DirectoryWatcher {
    root: PathBuf,
    state: Arc<Mutex<WatchState>>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl DirectoryWatcher {
    /// Start watching `path`. Must be called within a tokio runtime.
    ///
    /// Returns the watcher handle and the receiving end of the change-set
    /// channel. The channel closes when the watcher stops.
    pub fn watch(
        path: &Path,
        config: WatchConfig,
    ) -> Result<(Self, mpsc::Receiver<ChangeSet>), WatchError> {
        let root = path
            .canonicalize()
            .ok()
            .filter(|p| p.is_dir())
            .ok_or_else(|| WatchError::NotADirectory {
                path: path.to_path_buf(),
            })?;

        let (raw_tx, raw_rx) = mpsc::unbounded_channel();
        let watcher = arm(&root, raw_tx.clone())?;
        let (tx, rx) = mpsc::channel(CHANGE_CHANNEL_SIZE);

        let state = Arc::new(Mutex::new(WatchState::Active));
        let cancel = CancellationToken::new();
        let session = Session {
            root: root.clone(),
            config,
            state: Arc::clone(&state),
            raw_tx,
            tx,
        };
        let task = tokio::spawn(session.run(watcher, raw_rx, cancel.clone()));

        tracing::info!(target: "hooks_watch", dir = %root.display(), "watching hook directory");
        Ok((
            Self {
                root,
                state,
                cancel,
                task: Some(task),
            },
            rx,
        ))
    }

    /// Watched directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Current health.
    pub fn state(&self) -> WatchState {
        *self.state.lock()
    }

    /// Stop watching and wait for the session to end.
    pub async fn stop(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for DirectoryWatcher {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

type RawEvent = notify::Result<Event>;

fn arm(root: &Path, raw_tx: mpsc::UnboundedSender<RawEvent>) -> Result<RecommendedWatcher, WatchError> {
    let unavailable = |e: notify::Error| WatchError::Unavailable {
        path: root.to_path_buf(),
        message: e.to_string(),
    };

    let mut watcher = notify::recommended_watcher(move |event: RawEvent| {
        let _ = raw_tx.send(event);
    })
    .map_err(unavailable)?;
    watcher
        .watch(root, RecursiveMode::NonRecursive)
        .map_err(unavailable)?;
    Ok(watcher)
}

struct Session {
    root: PathBuf,
    config: WatchConfig,
    state: Arc<Mutex<WatchState>>,
    raw_tx: mpsc::UnboundedSender<RawEvent>,
    tx: mpsc::Sender<ChangeSet>,
}

impl Session {
    async fn run(
        self,
        watcher: RecommendedWatcher,
        mut raw_rx: mpsc::UnboundedReceiver<RawEvent>,
        cancel: CancellationToken,
    ) {
        let mut watcher = Some(watcher);
        let mut pending = ChangeSet::default();
        let mut deadline = Instant::now();
        let mut rearm = self.config.rearm_interval.map(|period| {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval
        });

        loop {
            let degraded = watcher.is_none();
            tokio::select! {
                _ = cancel.cancelled() => break,

                Some(event) = raw_rx.recv() => match event {
                    Ok(event) if root_lost(&event, &self.root) => {
                        tracing::warn!(target: "hooks_watch", dir = %self.root.display(), "hook directory removed or renamed");
                        self.degrade(&mut watcher, &mut pending);
                    }
                    Ok(event) if is_change(&event.kind) => {
                        pending.paths.extend(event.paths);
                        deadline = Instant::now() + self.config.debounce;
                    }
                    Ok(_) => {}
                    Err(err) => {
                        tracing::warn!(target: "hooks_watch", dir = %self.root.display(), "watch error: {}", err);
                        self.degrade(&mut watcher, &mut pending);
                    }
                },

                _ = tokio::time::sleep_until(deadline), if !pending.is_empty() => {
                    if !self.root.is_dir() {
                        tracing::warn!(target: "hooks_watch", dir = %self.root.display(), "hook directory lost");
                        self.degrade(&mut watcher, &mut pending);
                        continue;
                    }
                    let batch = std::mem::take(&mut pending);
                    tracing::debug!(target: "hooks_watch", changed = batch.paths.len(), "change set ready");
                    if self.tx.send(batch).await.is_err() {
                        break;
                    }
                }

                _ = tick(rearm.as_mut()), if degraded => {
                    if !self.root.is_dir() {
                        continue;
                    }
                    match arm(&self.root, self.raw_tx.clone()) {
                        Ok(rearmed) => {
                            watcher = Some(rearmed);
                            *self.state.lock() = WatchState::Active;
                            tracing::info!(target: "hooks_watch", dir = %self.root.display(), "watch re-armed");
                            if self.tx.send(ChangeSet::rescan()).await.is_err() {
                                break;
                            }
                        }
                        Err(err) => tracing::debug!(target: "hooks_watch", "re-arm failed: {}", err),
                    }
                }
            }
        }

        tracing::debug!(target: "hooks_watch", dir = %self.root.display(), "watch stopped");
    }

    /// Drop the platform watcher and any unflushed changes.
    fn degrade(&self, watcher: &mut Option<RecommendedWatcher>, pending: &mut ChangeSet) {
        *watcher = None;
        *pending = ChangeSet::default();
        *self.state.lock() = WatchState::Degraded;
        if self.config.rearm_interval.is_none() {
            tracing::warn!(target: "hooks_watch", dir = %self.root.display(), "watch inactive; loaded hooks stay active");
        }
    }
}

async fn tick(interval: Option<&mut tokio::time::Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

fn is_change(kind: &EventKind) -> bool {
    matches!(
        kind,
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_) | EventKind::Any
    )
}

/// Whether an event reports the watched directory itself going away. The
/// platform watch does not follow a directory recreated at the same path.
fn root_lost(event: &Event, root: &Path) -> bool {
    matches!(
        event.kind,
        EventKind::Remove(_) | EventKind::Modify(ModifyKind::Name(_))
    ) && event.paths.iter().any(|p| p == root)
}

/// Feed change sets into a loader until the channel closes.
///
/// Reloads run on the blocking pool; the loader is handed back when the
/// watcher stops.
pub fn spawn_reload_loop(
    mut loader: HookLoader,
    mut changes: mpsc::Receiver<ChangeSet>,
) -> JoinHandle<HookLoader> {
    tokio::task::spawn_blocking(move || {
        while let Some(batch) = changes.blocking_recv() {
            let summary = loader.apply_changes(&batch);
            for err in &summary.errors {
                tracing::warn!(target: "hooks", "{}", err);
            }
            tracing::debug!(
                target: "hooks",
                rescanned = summary.rescanned,
                diffs = summary.diffs.len(),
                errors = summary.errors.len(),
                "change set applied"
            );
        }
        loader
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn next(rx: &mut mpsc::Receiver<ChangeSet>) -> ChangeSet {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("no change set within timeout")
            .expect("channel closed")
    }

    #[test]
    fn test_root_lost() {
        use notify::event::{CreateKind, RemoveKind, RenameMode};

        let root = Path::new("/srv/hooks");
        let event = |kind, path: &str| Event::new(kind).add_path(PathBuf::from(path));

        assert!(root_lost(&event(EventKind::Remove(RemoveKind::Folder), "/srv/hooks"), root));
        assert!(root_lost(
            &event(EventKind::Modify(ModifyKind::Name(RenameMode::From)), "/srv/hooks"),
            root
        ));
        assert!(!root_lost(&event(EventKind::Remove(RemoveKind::File), "/srv/hooks/a.rhai"), root));
        assert!(!root_lost(&event(EventKind::Create(CreateKind::Folder), "/srv/hooks"), root));
    }

    #[test]
    fn test_config_from_settings() {
        let settings = HooksSettings {
            rearm_interval_ms: 0,
            ..Default::default()
        };
        let config = WatchConfig::from_settings(&settings);
        assert_eq!(config.debounce, Duration::from_millis(50));
        assert_eq!(config.rearm_interval, None);
    }

    #[tokio::test]
    async fn test_missing_path_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let result = DirectoryWatcher::watch(&dir.path().join("missing"), WatchConfig::default());
        assert!(matches!(result, Err(WatchError::NotADirectory { .. })));
    }

    #[tokio::test]
    async fn test_changes_are_batched() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().canonicalize().unwrap();
        let (watcher, mut rx) = DirectoryWatcher::watch(&root, WatchConfig::default()).unwrap();

        for name in ["a.rhai", "b.rhai", "c.rhai"] {
            std::fs::write(root.join(name), "on(\"x\", |ctx| 1);").unwrap();
        }

        let mut seen = BTreeSet::new();
        while seen.len() < 3 {
            let batch = next(&mut rx).await;
            assert!(!batch.rescan);
            seen.extend(batch.paths);
        }
        assert!(seen.contains(&root.join("b.rhai")));

        watcher.stop().await;
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_lost_directory_degrades_and_rearms() {
        let parent = tempfile::tempdir().unwrap();
        let root = parent.path().canonicalize().unwrap().join("hooks");
        std::fs::create_dir(&root).unwrap();

        let config = WatchConfig {
            debounce: Duration::from_millis(20),
            rearm_interval: Some(Duration::from_millis(100)),
        };
        let (watcher, mut rx) = DirectoryWatcher::watch(&root, config).unwrap();
        assert_eq!(watcher.state(), WatchState::Active);

        std::fs::remove_dir_all(&root).unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while watcher.state() != WatchState::Degraded {
            assert!(Instant::now() < deadline, "watcher never degraded");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        std::fs::create_dir(&root).unwrap();
        let batch = next(&mut rx).await;
        assert!(batch.rescan);
        assert_eq!(watcher.state(), WatchState::Active);
    }

    #[tokio::test]
    async fn test_directory_recreated_within_debounce_is_rewatched() {
        let parent = tempfile::tempdir().unwrap();
        let root = parent.path().canonicalize().unwrap().join("hooks");
        std::fs::create_dir(&root).unwrap();

        let config = WatchConfig {
            debounce: Duration::from_millis(200),
            rearm_interval: Some(Duration::from_millis(100)),
        };
        let (watcher, mut rx) = DirectoryWatcher::watch(&root, config).unwrap();

        std::fs::remove_dir_all(&root).unwrap();
        std::fs::create_dir(&root).unwrap();
        while !next(&mut rx).await.rescan {}

        let script = root.join("new.rhai");
        std::fs::write(&script, "on(\"x\", |ctx| 1);").unwrap();
        loop {
            let batch = next(&mut rx).await;
            if batch.paths.contains(&script) {
                break;
            }
        }
        assert_eq!(watcher.state(), WatchState::Active);
    }
}
