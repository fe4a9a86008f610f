use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use strata_hooks::{
    Capabilities, ChangeSet, DirectoryWatcher, DispatchReport, HookContext, HookLoader,
    HookRegistry, RecordAccess, RhaiSandbox, SandboxConfig, Value, WatchConfig, route_event,
    spawn_reload_loop,
};
use tempfile::TempDir;

fn loader_with(capabilities: Capabilities) -> HookLoader {
    let sandbox = Arc::new(RhaiSandbox::new(capabilities));
    HookLoader::new(sandbox, Arc::new(HookRegistry::new()), &["*.rhai"]).unwrap()
}

fn loader() -> HookLoader {
    loader_with(Capabilities::default())
}

fn write(dir: &Path, name: &str, source: &str) {
    fs::write(dir.join(name), source).unwrap();
}

/// String values returned by the handlers that succeeded, in order.
fn values(report: &DispatchReport) -> Vec<String> {
    report
        .outcomes
        .iter()
        .filter_map(|o| o.result.as_ref().ok())
        .filter_map(|r| r.value.as_ref().and_then(Value::as_str).map(String::from))
        .collect()
}

fn dispatch(loader: &HookLoader, event: &str) -> DispatchReport {
    loader.registry().dispatch(event, &HookContext::new(event))
}

#[test]
fn test_load_all_lexical_then_declaration_order() {
    let dir = TempDir::new().unwrap();
    write(dir.path(), "c.rhai", r#"on("x", |ctx| "c1"); on("x", |ctx| "c2");"#);
    write(dir.path(), "a.rhai", r#"on("x", |ctx| "a1"); on("y", |ctx| "a2");"#);
    write(dir.path(), "b.rhai", r#"on("x", |ctx| "b1");"#);

    let mut loader = loader();
    let report = loader.load_all(dir.path()).unwrap();

    assert!(report.is_clean());
    assert_eq!(report.loaded.len(), 3);
    assert_eq!(report.bindings, 5);
    assert_eq!(values(&dispatch(&loader, "x")), ["a1", "b1", "c1", "c2"]);
    assert_eq!(values(&dispatch(&loader, "y")), ["a2"]);
}

#[test]
fn test_one_invalid_script_among_valid() {
    let dir = TempDir::new().unwrap();
    write(dir.path(), "a.rhai", r#"on("x", |ctx| "a");"#);
    write(dir.path(), "b.rhai", "on(\"x\", |ctx| {");
    write(dir.path(), "c.rhai", r#"on("x", |ctx| "c");"#);

    let mut loader = loader();
    let report = loader.load_all(dir.path()).unwrap();

    assert_eq!(report.errors.len(), 1);
    assert!(report.errors[0].path.ends_with("b.rhai"));
    assert!(report.errors[0].line.is_some());
    assert_eq!(values(&dispatch(&loader, "x")), ["a", "c"]);
}

#[test]
fn test_reload_moves_bindings_to_end() {
    let dir = TempDir::new().unwrap();
    write(dir.path(), "a.rhai", r#"on("x", |ctx| "H1");"#);
    write(dir.path(), "b.rhai", r#"on("x", |ctx| "H2");"#);

    let mut loader = loader();
    loader.load_all(dir.path()).unwrap();
    assert_eq!(values(&dispatch(&loader, "x")), ["H1", "H2"]);

    write(dir.path(), "a.rhai", r#"on("x", |ctx| "H1'");"#);
    let diff = loader.reload_one(&dir.path().join("a.rhai")).unwrap();

    assert_eq!(diff.added, ["x"]);
    assert_eq!(diff.removed, ["x"]);
    assert_eq!(values(&dispatch(&loader, "x")), ["H2", "H1'"]);
}

#[test]
fn test_handler_failure_is_isolated() {
    let dir = TempDir::new().unwrap();
    write(dir.path(), "a.rhai", r#"on("x", |ctx| { throw "boom"; });"#);
    write(dir.path(), "b.rhai", r#"on("x", |ctx| "ok");"#);

    let mut loader = loader();
    loader.load_all(dir.path()).unwrap();
    let report = dispatch(&loader, "x");

    assert_eq!(report.ran(), 2);
    let failures: Vec<_> = report.failures().collect();
    assert_eq!(failures.len(), 1);
    assert!(failures[0].path.ends_with("a.rhai"));
    assert!(failures[0].message.contains("boom"));
    assert_eq!(values(&report), ["ok"]);
}

#[test]
fn test_stop_short_circuits() {
    let dir = TempDir::new().unwrap();
    write(dir.path(), "a.rhai", r#"on("x", |ctx| "first");"#);
    write(dir.path(), "b.rhai", r#"on("x", |ctx| stop("second"));"#);
    write(dir.path(), "c.rhai", r#"on("x", |ctx| "third");"#);

    let mut loader = loader();
    loader.load_all(dir.path()).unwrap();
    let report = dispatch(&loader, "x");

    assert!(report.stopped);
    assert_eq!(report.ran(), 2);
    assert_eq!(values(&report), ["first", "second"]);
}

#[test]
fn test_prevent_default_from_control_map() {
    let dir = TempDir::new().unwrap();
    write(
        dir.path(),
        "guard.rhai",
        r#"on("records.delete", |ctx| #{ prevent_default: true, value: "kept" });"#,
    );

    let mut loader = loader();
    loader.load_all(dir.path()).unwrap();
    let report = dispatch(&loader, "records.delete");

    assert!(report.prevent_default());
    assert!(!report.stopped);
    assert_eq!(values(&report), ["kept"]);
}

#[test]
fn test_route_binding() {
    let dir = TempDir::new().unwrap();
    write(dir.path(), "routes.rhai", r#"route("get", "/api/stats", |ctx| #{ total: 3 });"#);

    let mut loader = loader();
    loader.load_all(dir.path()).unwrap();
    let report = dispatch(&loader, &route_event("GET", "/api/stats"));

    assert_eq!(report.ran(), 1);
    let value = report.outcomes[0].result.as_ref().unwrap().value.clone().unwrap();
    assert_eq!(value.get("total").and_then(Value::as_i64), Some(3));
}

#[test]
fn test_deleted_script_is_unregistered() {
    let dir = TempDir::new().unwrap();
    write(dir.path(), "a.rhai", r#"on("x", |ctx| "a");"#);
    write(dir.path(), "b.rhai", r#"on("x", |ctx| "b");"#);

    let mut loader = loader();
    loader.load_all(dir.path()).unwrap();

    let removed = dir.path().join("a.rhai");
    fs::remove_file(&removed).unwrap();
    let mut changes = ChangeSet::default();
    changes.paths.insert(removed);
    let summary = loader.apply_changes(&changes);

    assert_eq!(summary.diffs.len(), 1);
    assert_eq!(summary.diffs[0].removed, ["x"]);
    assert_eq!(values(&dispatch(&loader, "x")), ["b"]);
}

#[test]
fn test_rename_is_remove_then_load() {
    let dir = TempDir::new().unwrap();
    write(dir.path(), "a.rhai", r#"on("x", |ctx| "a");"#);
    write(dir.path(), "b.rhai", r#"on("x", |ctx| "b");"#);

    let mut loader = loader();
    loader.load_all(dir.path()).unwrap();

    let from = dir.path().join("a.rhai");
    let to = dir.path().join("z.rhai");
    fs::rename(&from, &to).unwrap();
    let mut changes = ChangeSet::default();
    changes.paths.extend([from, to]);
    let summary = loader.apply_changes(&changes);

    assert!(summary.errors.is_empty());
    assert_eq!(summary.diffs.len(), 2);
    assert!(summary.diffs[0].added.is_empty());
    assert_eq!(values(&dispatch(&loader, "x")), ["b", "a"]);
}

struct FakeRecords;

impl RecordAccess for FakeRecords {
    fn find_by_id(&self, collection: &str, id: &str) -> Result<Option<Value>, String> {
        if collection != "users" {
            return Err(format!("unknown collection {collection}"));
        }
        let mut record = BTreeMap::new();
        record.insert("id".to_string(), Value::from(id));
        record.insert("email".to_string(), Value::from(format!("{id}@example.com")));
        Ok(Some(Value::Object(record)))
    }

    fn find_by_filter(&self, _: &str, _: &str, limit: usize) -> Result<Vec<Value>, String> {
        Ok(vec![Value::Null; limit])
    }

    fn save(&self, _: &str, record: Value) -> Result<Value, String> {
        Ok(record)
    }
}

#[test]
fn test_records_capability() {
    let dir = TempDir::new().unwrap();
    write(
        dir.path(),
        "lookup.rhai",
        r#"
        on("records.view", |ctx| {
            let user = find_record("users", ctx.data.id);
            user.email
        });
        on("records.bad", |ctx| find_record("posts", "1"));
        "#,
    );

    let caps = Capabilities::new(SandboxConfig::default()).with_records(Arc::new(FakeRecords));
    let mut loader = loader_with(caps);
    loader.load_all(dir.path()).unwrap();

    let ctx = HookContext::new("records.view").with("id", "u1");
    let report = loader.registry().dispatch("records.view", &ctx);
    assert_eq!(values(&report), ["u1@example.com"]);

    let report = dispatch(&loader, "records.bad");
    let err = report.failures().next().unwrap();
    assert!(err.message.contains("unknown collection posts"));
}

#[test]
fn test_records_absent_without_capability() {
    let dir = TempDir::new().unwrap();
    write(dir.path(), "a.rhai", r#"on("x", |ctx| find_record("users", "1"));"#);

    let mut loader = loader();
    loader.load_all(dir.path()).unwrap();

    let report = dispatch(&loader, "x");
    assert_eq!(report.failures().count(), 1);
}

#[test]
fn test_dispatch_sees_whole_binding_set_during_reload() {
    let dir = TempDir::new().unwrap();
    write(dir.path(), "a.rhai", r#"on("x", |ctx| "old-a"); on("x", |ctx| "old-b");"#);

    let mut loader = loader();
    loader.load_all(dir.path()).unwrap();
    let registry = Arc::clone(loader.registry());

    let readers: Vec<_> = (0..4)
        .map(|_| {
            let registry = Arc::clone(&registry);
            std::thread::spawn(move || {
                for _ in 0..200 {
                    let report = registry.dispatch("x", &HookContext::new("x"));
                    let got = values(&report);
                    assert!(
                        got == ["old-a", "old-b"] || got == ["new-a", "new-b"],
                        "mixed binding set: {got:?}"
                    );
                }
            })
        })
        .collect();

    for round in 0..20 {
        let (first, second) = if round % 2 == 0 {
            ("new-a", "new-b")
        } else {
            ("old-a", "old-b")
        };
        write(
            dir.path(),
            "a.rhai",
            &format!(r#"on("x", |ctx| "{first}"); on("x", |ctx| "{second}");"#),
        );
        loader.reload_one(&dir.path().join("a.rhai")).unwrap();
    }

    for reader in readers {
        reader.join().unwrap();
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_watch_reloads_new_script() {
    let dir = TempDir::new().unwrap();
    let root = dir.path().canonicalize().unwrap();
    write(&root, "a.rhai", r#"on("x", |ctx| "a");"#);

    let mut loader = loader();
    loader.load_all(&root).unwrap();
    let registry = Arc::clone(loader.registry());

    let (watcher, changes) = DirectoryWatcher::watch(&root, WatchConfig::default()).unwrap();
    let reload = spawn_reload_loop(loader, changes);

    write(&root, "b.rhai", r#"on("x", |ctx| "b");"#);

    let mut got = Vec::new();
    for _ in 0..100 {
        got = values(&registry.dispatch("x", &HookContext::new("x")));
        if got.len() == 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(got, ["a", "b"]);

    watcher.stop().await;
    let loader = reload.await.unwrap();
    assert_eq!(loader.units().count(), 2);
}
