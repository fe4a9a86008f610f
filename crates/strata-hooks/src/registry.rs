//! Active hook bindings.
//!
//! The binding table is immutable once published. Writers clone it, apply
//! their change and swap the new table in under one lock; dispatchers load
//! the current table once and run against it, so each dispatch observes a
//! single consistent binding set.

use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arc_swap::ArcSwap;
use indexmap::IndexMap;
use parking_lot::Mutex;

use crate::hooks::{HookContext, HookResult};
use crate::sandbox::CompiledUnit;
use crate::types::{HookError, RuntimeError};

/// One handler bound to one event.
pub struct HookBinding {
    event: String,
    owner: PathBuf,
    unit: Arc<dyn CompiledUnit>,
    handler: usize,
    order: u64,
    /// Serializes invocations of this handler.
    gate: Mutex<()>,
}

impl HookBinding {
    /// Bind handler `handler` of `unit` to `event`.
    ///
    /// The registration order is assigned when the binding is inserted.
    pub fn new(event: impl Into<String>, unit: Arc<dyn CompiledUnit>, handler: usize) -> Self {
        Self {
            event: event.into(),
            owner: unit.path().to_path_buf(),
            unit,
            handler,
            order: 0,
            gate: Mutex::new(()),
        }
    }

    /// All bindings a compiled unit declared, in declaration order.
    pub fn from_unit(unit: &Arc<dyn CompiledUnit>) -> Vec<Self> {
        unit.events()
            .iter()
            .enumerate()
            .map(|(index, event)| Self::new(event.clone(), Arc::clone(unit), index))
            .collect()
    }

    /// Event this binding handles.
    pub fn event(&self) -> &str {
        &self.event
    }

    /// Script that declared this binding.
    pub fn owner(&self) -> &Path {
        &self.owner
    }

    /// Registration order within the registry.
    pub fn order(&self) -> u64 {
        self.order
    }

    /// Run the handler. Concurrent callers of the same binding queue here.
    pub fn invoke(&self, ctx: &HookContext) -> Result<HookResult, RuntimeError> {
        let _guard = self.gate.lock();
        self.unit.invoke(self.handler, ctx)
    }
}

impl fmt::Debug for HookBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HookBinding")
            .field("event", &self.event)
            .field("owner", &self.owner)
            .field("handler", &self.handler)
            .field("order", &self.order)
            .finish()
    }
}

/// Immutable snapshot of all bindings, grouped by event.
#[derive(Debug, Clone, Default)]
pub struct BindingTable {
    events: IndexMap<String, Vec<Arc<HookBinding>>>,
    next_order: u64,
}

impl BindingTable {
    fn insert(&mut self, mut binding: HookBinding) -> u64 {
        let order = self.next_order;
        self.next_order += 1;
        binding.order = order;
        self.events
            .entry(binding.event.clone())
            .or_default()
            .push(Arc::new(binding));
        order
    }

    /// Remove every binding owned by `owner`, returning their event names.
    fn remove_owner(&mut self, owner: &Path) -> Vec<String> {
        let mut removed = Vec::new();
        for (event, bindings) in self.events.iter_mut() {
            bindings.retain(|b| {
                let keep = b.owner != owner;
                if !keep {
                    removed.push(event.clone());
                }
                keep
            });
        }
        self.events.retain(|_, bindings| !bindings.is_empty());
        removed
    }

    /// Bindings for an event, in registration order.
    pub fn bindings(&self, event: &str) -> &[Arc<HookBinding>] {
        self.events.get(event).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Events with at least one binding.
    pub fn events(&self) -> impl Iterator<Item = &str> {
        self.events.keys().map(String::as_str)
    }

    /// Scripts owning at least one binding.
    pub fn owners(&self) -> BTreeSet<&Path> {
        self.events
            .values()
            .flatten()
            .map(|b| b.owner.as_path())
            .collect()
    }

    /// Total number of bindings.
    pub fn len(&self) -> usize {
        self.events.values().map(Vec::len).sum()
    }

    /// Whether no bindings exist.
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

/// Bindings added and removed by one reload of one script.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BindingDiff {
    /// Script that was reloaded.
    pub owner: PathBuf,
    /// Events of the new bindings, in declaration order.
    pub added: Vec<String>,
    /// Events of the bindings that were replaced or dropped.
    pub removed: Vec<String>,
}

impl BindingDiff {
    /// Whether nothing changed.
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// Result of one handler within a dispatch.
#[derive(Debug, Clone)]
pub struct HandlerOutcome {
    /// Script that owns the handler.
    pub owner: PathBuf,
    /// Registration order of the binding.
    pub order: u64,
    /// What the handler returned.
    pub result: Result<HookResult, RuntimeError>,
}

/// Results of dispatching one event.
#[derive(Debug, Clone, Default)]
pub struct DispatchReport {
    /// Event that was dispatched.
    pub event: String,
    /// One entry per handler that ran, in order.
    pub outcomes: Vec<HandlerOutcome>,
    /// Whether a handler stopped the chain.
    pub stopped: bool,
}

impl DispatchReport {
    /// Number of handlers that ran.
    pub fn ran(&self) -> usize {
        self.outcomes.len()
    }

    /// Handlers that failed.
    pub fn failures(&self) -> impl Iterator<Item = &RuntimeError> {
        self.outcomes.iter().filter_map(|o| o.result.as_ref().err())
    }

    /// Whether any successful handler asked to skip default behavior.
    pub fn prevent_default(&self) -> bool {
        self.outcomes
            .iter()
            .any(|o| o.result.as_ref().is_ok_and(|r| r.prevent_default))
    }
}

/// Holder of the active binding table.
pub struct HookRegistry {
    table: ArcSwap<BindingTable>,
    /// Serializes writers; readers never take it.
    write: Mutex<()>,
}

impl Default for HookRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl HookRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            table: ArcSwap::from_pointee(BindingTable::default()),
            write: Mutex::new(()),
        }
    }

    /// Current binding table.
    pub fn snapshot(&self) -> Arc<BindingTable> {
        self.table.load_full()
    }

    /// Copy, modify and publish the table.
    fn update<R>(&self, f: impl FnOnce(&mut BindingTable) -> R) -> R {
        let _writer = self.write.lock();
        let mut next = BindingTable::clone(&self.table.load());
        let result = f(&mut next);
        self.table.store(Arc::new(next));
        result
    }

    /// Append a binding after all existing bindings of its event.
    pub fn register(&self, binding: HookBinding) -> u64 {
        self.update(|table| table.insert(binding))
    }

    /// Remove every binding owned by a script. Returns how many were removed.
    pub fn unregister_all(&self, owner: &Path) -> usize {
        let removed = self.update(|table| table.remove_owner(owner));
        if !removed.is_empty() {
            tracing::debug!(target: "hooks", script = %owner.display(), count = removed.len(), "unregistered bindings");
        }
        removed.len()
    }

    /// Replace one script's bindings in a single swap.
    ///
    /// The new bindings go to the end of their events; other scripts keep
    /// their relative order.
    pub fn replace_owner(&self, owner: &Path, bindings: Vec<HookBinding>) -> BindingDiff {
        let added: Vec<String> = bindings.iter().map(|b| b.event.clone()).collect();
        let removed = self.update(|table| {
            let removed = table.remove_owner(owner);
            for binding in bindings {
                table.insert(binding);
            }
            removed
        });
        BindingDiff {
            owner: owner.to_path_buf(),
            added,
            removed,
        }
    }

    /// Replace the whole table in a single swap.
    pub fn replace_all(&self, bindings: Vec<HookBinding>) {
        self.update(|table| {
            let mut next = BindingTable {
                events: IndexMap::new(),
                next_order: table.next_order,
            };
            for binding in bindings {
                next.insert(binding);
            }
            *table = next;
        });
    }

    /// Invoke every handler bound to `event`, in registration order.
    ///
    /// A failing handler is recorded and the chain continues; a handler
    /// returning `stop_propagation` ends the chain after itself.
    pub fn dispatch(&self, event: &str, ctx: &HookContext) -> DispatchReport {
        let table = self.table.load_full();
        let mut report = DispatchReport {
            event: event.to_string(),
            ..Default::default()
        };

        for binding in table.bindings(event) {
            let result = binding.invoke(ctx);
            if let Err(err) = &result {
                tracing::warn!(target: "hooks", event, script = %binding.owner.display(), "{}", err);
            }

            let stop = result.as_ref().is_ok_and(|r| r.stop_propagation);
            report.outcomes.push(HandlerOutcome {
                owner: binding.owner.clone(),
                order: binding.order,
                result,
            });

            if stop {
                report.stopped = true;
                break;
            }
        }

        report
    }

    /// Run [`HookRegistry::dispatch`] on the blocking worker pool.
    pub async fn dispatch_blocking(
        self: &Arc<Self>,
        event: String,
        ctx: HookContext,
    ) -> Result<DispatchReport, HookError> {
        let registry = Arc::clone(self);
        let name = event.clone();
        tokio::task::spawn_blocking(move || registry.dispatch(&event, &ctx))
            .await
            .map_err(|e| HookError::Dispatch {
                event: name,
                message: e.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Unit whose handlers return their own label.
    struct FakeUnit {
        path: PathBuf,
        events: Vec<String>,
        fail: bool,
    }

    impl CompiledUnit for FakeUnit {
        fn path(&self) -> &Path {
            &self.path
        }

        fn events(&self) -> &[String] {
            &self.events
        }

        fn invoke(&self, handler: usize, ctx: &HookContext) -> Result<HookResult, RuntimeError> {
            if self.fail {
                return Err(RuntimeError {
                    path: self.path.clone(),
                    event: ctx.event.clone(),
                    message: "boom".into(),
                    line: None,
                });
            }
            Ok(HookResult::with_value(format!("{}#{handler}", self.path.display())))
        }
    }

    fn unit(path: &str, events: &[&str], fail: bool) -> Arc<dyn CompiledUnit> {
        Arc::new(FakeUnit {
            path: PathBuf::from(path),
            events: events.iter().map(|e| e.to_string()).collect(),
            fail,
        })
    }

    fn owners(report: &DispatchReport) -> Vec<String> {
        report
            .outcomes
            .iter()
            .map(|o| o.owner.display().to_string())
            .collect()
    }

    #[test]
    fn test_dispatch_in_registration_order() {
        let registry = HookRegistry::new();
        for binding in HookBinding::from_unit(&unit("a.rhai", &["x"], false)) {
            registry.register(binding);
        }
        for binding in HookBinding::from_unit(&unit("b.rhai", &["x", "y"], false)) {
            registry.register(binding);
        }

        let report = registry.dispatch("x", &HookContext::new("x"));
        assert_eq!(owners(&report), ["a.rhai", "b.rhai"]);
        assert_eq!(registry.dispatch("y", &HookContext::new("y")).ran(), 1);
        assert_eq!(registry.dispatch("z", &HookContext::new("z")).ran(), 0);
    }

    #[test]
    fn test_replace_owner_moves_to_end() {
        let registry = HookRegistry::new();
        let a = unit("a.rhai", &["x"], false);
        registry.replace_all(
            HookBinding::from_unit(&a)
                .into_iter()
                .chain(HookBinding::from_unit(&unit("b.rhai", &["x"], false)))
                .collect(),
        );

        let diff = registry.replace_owner(Path::new("a.rhai"), HookBinding::from_unit(&a));
        assert_eq!(diff.added, ["x"]);
        assert_eq!(diff.removed, ["x"]);

        let report = registry.dispatch("x", &HookContext::new("x"));
        assert_eq!(owners(&report), ["b.rhai", "a.rhai"]);
    }

    #[test]
    fn test_failure_does_not_stop_chain() {
        let registry = HookRegistry::new();
        registry.replace_all(
            HookBinding::from_unit(&unit("a.rhai", &["x"], true))
                .into_iter()
                .chain(HookBinding::from_unit(&unit("b.rhai", &["x"], false)))
                .collect(),
        );

        let report = registry.dispatch("x", &HookContext::new("x"));
        assert_eq!(report.ran(), 2);
        assert_eq!(report.failures().count(), 1);
        assert!(report.outcomes[1].result.is_ok());
    }

    #[test]
    fn test_unregister_all_drops_empty_events() {
        let registry = HookRegistry::new();
        registry.replace_all(HookBinding::from_unit(&unit("a.rhai", &["x", "y"], false)));

        assert_eq!(registry.unregister_all(Path::new("a.rhai")), 2);
        assert!(registry.snapshot().is_empty());
        assert_eq!(registry.unregister_all(Path::new("a.rhai")), 0);
    }

    #[test]
    fn test_snapshot_unaffected_by_later_swap() {
        let registry = HookRegistry::new();
        registry.replace_all(HookBinding::from_unit(&unit("a.rhai", &["x"], false)));

        let before = registry.snapshot();
        registry.unregister_all(Path::new("a.rhai"));

        assert_eq!(before.bindings("x").len(), 1);
        assert!(registry.snapshot().bindings("x").is_empty());
    }

    /// Unit that tracks how many invocations of each handler overlap.
    struct SlowUnit {
        events: Vec<String>,
        in_flight: [AtomicUsize; 2],
        peak: [AtomicUsize; 2],
        calls: AtomicUsize,
    }

    impl CompiledUnit for SlowUnit {
        fn path(&self) -> &Path {
            Path::new("slow.rhai")
        }

        fn events(&self) -> &[String] {
            &self.events
        }

        fn invoke(&self, handler: usize, _: &HookContext) -> Result<HookResult, RuntimeError> {
            let now = self.in_flight[handler].fetch_add(1, Ordering::SeqCst) + 1;
            self.peak[handler].fetch_max(now, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(20));
            self.in_flight[handler].fetch_sub(1, Ordering::SeqCst);
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(HookResult::default())
        }
    }

    #[test]
    fn test_same_handler_never_runs_concurrently() {
        let slow = Arc::new(SlowUnit {
            events: vec!["x".into(), "y".into()],
            in_flight: Default::default(),
            peak: Default::default(),
            calls: AtomicUsize::new(0),
        });
        let unit: Arc<dyn CompiledUnit> = slow.clone();
        let registry = HookRegistry::new();
        registry.replace_all(HookBinding::from_unit(&unit));

        std::thread::scope(|scope| {
            for i in 0..8 {
                let registry = &registry;
                let event = if i % 2 == 0 { "x" } else { "y" };
                scope.spawn(move || {
                    let report = registry.dispatch(event, &HookContext::new(event));
                    assert_eq!(report.ran(), 1);
                });
            }
        });

        assert_eq!(slow.calls.load(Ordering::SeqCst), 8);
        assert_eq!(slow.peak[0].load(Ordering::SeqCst), 1);
        assert_eq!(slow.peak[1].load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_dispatch_blocking() {
        let registry = Arc::new(HookRegistry::new());
        registry.replace_all(HookBinding::from_unit(&unit("a.rhai", &["x"], false)));

        let report = registry
            .dispatch_blocking("x".to_string(), HookContext::new("x"))
            .await
            .unwrap();
        assert_eq!(report.ran(), 1);
    }
}
