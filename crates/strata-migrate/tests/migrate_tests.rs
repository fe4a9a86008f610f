use std::sync::Arc;

use strata_core::{CollectionDef, CollectionKind, FieldDef, FieldKind, IndexDef, SchemaSnapshot};
use strata_migrate::{
    AppliedMigrationLog, ApplyError, MemoryStore, Migration, MigrationFileGenerator, MigrationId,
    MigrationOperation, MigrationPlanner, MigrationRunner, RollbackError, SchemaStore,
    apply_operations, load_dir,
};
use tempfile::TempDir;

fn users() -> CollectionDef {
    CollectionDef::new("users", CollectionKind::Auth)
        .with_field(FieldDef::new("id", FieldKind::Text).required())
        .with_field(FieldDef::new("email", FieldKind::Email).unique())
}

fn posts() -> CollectionDef {
    CollectionDef::new("posts", CollectionKind::Base)
        .with_field(FieldDef::new("title", FieldKind::Text).required())
        .with_field(FieldDef::new("author", FieldKind::Relation).relation_to("users"))
        .with_field(FieldDef::new("status", FieldKind::Select).with_values(["draft", "published"]))
        .with_index(IndexDef::new("idx_posts_author", ["author"]))
}

fn snapshot(collections: Vec<CollectionDef>) -> SchemaSnapshot {
    SchemaSnapshot::new(collections).unwrap()
}

fn runner_with(schema: SchemaSnapshot) -> (Arc<MemoryStore>, MigrationRunner) {
    let store = Arc::new(MemoryStore::with_schema(schema));
    let runner = MigrationRunner::new(store.clone(), AppliedMigrationLog::in_memory());
    (store, runner)
}

/// A pair of snapshots exercising every operation kind.
fn evolving_pair() -> (SchemaSnapshot, SchemaSnapshot) {
    let current = snapshot(vec![
        users().with_field(FieldDef::new("legacy_flag", FieldKind::Bool)),
        posts(),
        CollectionDef::new("sessions", CollectionKind::Base)
            .with_field(FieldDef::new("token", FieldKind::Text)),
    ]);
    let desired = snapshot(vec![
        users().with_index(IndexDef::new("idx_users_email", ["email"]).unique()),
        CollectionDef::new("posts", CollectionKind::Base)
            .with_field(FieldDef::new("title", FieldKind::Text).required().with_bounds(Some(1), Some(200)))
            .with_field(FieldDef::new("author", FieldKind::Relation).relation_to("users"))
            .with_field(FieldDef::new("body", FieldKind::Editor))
            .with_index(IndexDef::new("idx_posts_title", ["title"])),
        CollectionDef::new("tags", CollectionKind::Base)
            .with_field(FieldDef::new("label", FieldKind::Text).unique())
            .with_index(IndexDef::new("idx_tags_label", ["label"]).unique()),
    ]);
    (current, desired)
}

#[test]
fn test_diff_of_identical_snapshots_is_empty() {
    let (current, desired) = evolving_pair();
    for s in [SchemaSnapshot::empty(), current, desired] {
        assert!(MigrationPlanner::diff(&s, &s).unwrap().is_empty());
    }
}

#[test]
fn test_create_users_scenario() {
    let desired = snapshot(vec![
        CollectionDef::new("users", CollectionKind::Base)
            .with_field(FieldDef::new("id", FieldKind::Text))
            .with_field(FieldDef::new("email", FieldKind::Email)),
    ]);

    let ops = MigrationPlanner::diff(&SchemaSnapshot::empty(), &desired).unwrap();
    assert_eq!(
        ops,
        [
            MigrationOperation::CreateCollection {
                name: "users".into(),
                kind: CollectionKind::Base,
            },
            MigrationOperation::AddField {
                collection: "users".into(),
                field: FieldDef::new("id", FieldKind::Text),
            },
            MigrationOperation::AddField {
                collection: "users".into(),
                field: FieldDef::new("email", FieldKind::Email),
            },
        ]
    );

    let (store, runner) = runner_with(SchemaSnapshot::empty());
    let record = runner.apply(ops).unwrap();
    assert!(record.reversible);
    assert_eq!(store.current_schema().unwrap(), desired);

    let rolled_back = runner.rollback_last().unwrap();
    assert_eq!(rolled_back.id, record.id);
    assert!(store.current_schema().unwrap().is_empty());
    assert!(runner.applied().is_empty());
}

#[test]
fn test_drop_field_is_not_rollback_capable() {
    let current = snapshot(vec![users().with_field(FieldDef::new("legacy_flag", FieldKind::Bool))]);
    let desired = snapshot(vec![users()]);

    let ops = MigrationPlanner::diff(&current, &desired).unwrap();
    assert!(ops.contains(&MigrationOperation::DropField {
        collection: "users".into(),
        name: "legacy_flag".into(),
    }));

    let (store, runner) = runner_with(current);
    let record = runner.apply(ops).unwrap();
    assert!(!record.reversible);

    let err = runner.rollback_last().unwrap_err();
    assert!(matches!(err, RollbackError::NotReversible { id, .. } if id == record.id));
    assert_eq!(store.current_schema().unwrap(), desired);
    assert_eq!(runner.applied().len(), 1);
}

#[test]
fn test_round_trip_reaches_desired() {
    let (current, desired) = evolving_pair();

    let ops = MigrationPlanner::diff(&current, &desired).unwrap();
    let result = apply_operations(&current, &ops).unwrap();

    assert!(MigrationPlanner::diff(&result, &desired).unwrap().is_empty());
    assert!(MigrationPlanner::diff(&current, &desired).unwrap() == ops);
}

#[test]
fn test_ordering_invariant() {
    let (current, desired) = evolving_pair();
    let ops = MigrationPlanner::diff(&current, &desired).unwrap();

    let position = |pred: &dyn Fn(&MigrationOperation) -> bool| ops.iter().position(pred);
    for (i, op) in ops.iter().enumerate() {
        let collection = op.collection();
        let created = position(&|o| {
            matches!(o, MigrationOperation::CreateCollection { name, .. } if name == collection)
        });
        let dropped = position(&|o| matches!(o, MigrationOperation::DropCollection { name } if name == collection));

        match op {
            MigrationOperation::CreateCollection { .. } | MigrationOperation::DropCollection { .. } => {}
            _ => {
                if let Some(created) = created {
                    assert!(created < i, "{op} precedes its collection's creation");
                }
                if let Some(dropped) = dropped {
                    assert!(i < dropped, "{op} follows its collection's drop");
                }
            }
        }
    }

    let last_create = ops
        .iter()
        .rposition(|o| matches!(o, MigrationOperation::CreateCollection { .. }))
        .unwrap();
    let first_drop = ops
        .iter()
        .position(|o| matches!(o, MigrationOperation::DropCollection { .. }))
        .unwrap();
    assert!(ops[..=last_create]
        .iter()
        .all(|o| matches!(o, MigrationOperation::CreateCollection { .. })));
    assert!(ops[first_drop..]
        .iter()
        .all(|o| matches!(o, MigrationOperation::DropCollection { .. })));
}

#[test]
fn test_plan_is_lexically_ordered() {
    let (current, desired) = evolving_pair();
    let ops = MigrationPlanner::diff(&current, &desired).unwrap();
    let rendered: Vec<String> = ops.iter().map(ToString::to_string).collect();

    assert_eq!(
        rendered,
        [
            "create base collection tags",
            "drop index idx_posts_author on posts",
            "drop field posts.status",
            "alter field posts.title",
            "add field posts.body (editor)",
            "add index idx_posts_title on posts(title)",
            "add field tags.label (text)",
            "add index idx_tags_label on tags(label)",
            "drop field users.legacy_flag",
            "add index idx_users_email on users(email)",
            "drop collection sessions",
        ]
    );
}

#[test]
fn test_failed_batch_leaves_schema_unchanged() {
    let current = snapshot(vec![users()]);
    let (store, runner) = runner_with(current.clone());

    let err = runner
        .apply(vec![
            MigrationOperation::AddField {
                collection: "users".into(),
                field: FieldDef::new("name", FieldKind::Text),
            },
            MigrationOperation::AddField {
                collection: "missing".into(),
                field: FieldDef::new("name", FieldKind::Text),
            },
        ])
        .unwrap_err();

    match err {
        ApplyError::OperationFailed { index, operation, .. } => {
            assert_eq!(index, 1);
            assert_eq!(operation, "add field missing.name (text)");
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(store.current_schema().unwrap(), current);
    assert!(runner.applied().is_empty());
}

#[test]
fn test_reapplying_recorded_migration_is_rejected() {
    let (store, runner) = runner_with(SchemaSnapshot::empty());
    let migration = Migration::new(
        MigrationId(7),
        "created_users",
        MigrationPlanner::diff(&SchemaSnapshot::empty(), &snapshot(vec![users()])).unwrap(),
    );

    runner.apply_migration(migration.clone()).unwrap();
    let before = store.current_schema().unwrap();

    let err = runner.apply_migration(migration).unwrap_err();
    assert!(matches!(err, ApplyError::AlreadyApplied { .. }));
    assert_eq!(store.current_schema().unwrap(), before);
    assert_eq!(runner.applied().len(), 1);
}

#[test]
fn test_log_and_store_survive_restart() {
    let dir = TempDir::new().unwrap();
    let schema_path = dir.path().join("schema.json");
    let log_path = dir.path().join("migrations.json");
    let desired = snapshot(vec![users(), posts()]);

    {
        let store = Arc::new(MemoryStore::open(&schema_path).unwrap());
        let runner = MigrationRunner::new(store, AppliedMigrationLog::open(&log_path).unwrap());
        let ops = MigrationPlanner::diff(&SchemaSnapshot::empty(), &desired).unwrap();
        runner.apply(ops).unwrap();
    }

    let store = Arc::new(MemoryStore::open(&schema_path).unwrap());
    let runner = MigrationRunner::new(store.clone(), AppliedMigrationLog::open(&log_path).unwrap());
    assert_eq!(runner.applied().len(), 1);
    assert_eq!(store.current_schema().unwrap(), desired);

    runner.rollback_last().unwrap();
    let reopened = AppliedMigrationLog::open(&log_path).unwrap();
    assert!(reopened.is_empty());
    assert!(MemoryStore::open(&schema_path).unwrap().current_schema().unwrap().is_empty());
}

#[test]
fn test_artifact_renders_identically_and_reloads() {
    let (current, desired) = evolving_pair();
    let ops = MigrationPlanner::diff(&current, &desired).unwrap();

    let first = MigrationFileGenerator::render(&ops).unwrap();
    let again = MigrationPlanner::diff(&current, &desired).unwrap();
    assert_eq!(first, MigrationFileGenerator::render(&again).unwrap());
    assert!(first.contains("# Reversible: false"));

    let dir = TempDir::new().unwrap();
    let generator = MigrationFileGenerator::new(dir.path().join("migrations"));
    let migration = Migration::new(MigrationId(1_700_000_000), "automigrate", ops);
    let path = generator.write(&migration).unwrap();
    assert!(path.ends_with("1700000000_automigrate.toml"));
    assert_eq!(std::fs::read_to_string(&path).unwrap(), first);

    let loaded = load_dir(generator.dir()).unwrap();
    assert_eq!(loaded, [migration]);
}

#[test]
fn test_apply_pending_artifacts() {
    let dir = TempDir::new().unwrap();
    let generator = MigrationFileGenerator::new(dir.path());

    let step_one = MigrationPlanner::diff(&SchemaSnapshot::empty(), &snapshot(vec![users()])).unwrap();
    let step_two =
        MigrationPlanner::diff(&snapshot(vec![users()]), &snapshot(vec![users(), posts()])).unwrap();
    generator
        .write(&Migration::new(MigrationId(20), "created_posts", step_two))
        .unwrap();
    generator
        .write(&Migration::new(MigrationId(10), "created_users", step_one))
        .unwrap();

    let migrations = load_dir(dir.path()).unwrap();
    let (store, runner) = runner_with(SchemaSnapshot::empty());

    let applied = runner.apply_pending(&migrations).unwrap();
    assert_eq!(applied.iter().map(|r| r.id.0).collect::<Vec<_>>(), [10, 20]);
    assert_eq!(store.current_schema().unwrap(), snapshot(vec![users(), posts()]));
    assert!(runner.apply_pending(&migrations).unwrap().is_empty());
}
