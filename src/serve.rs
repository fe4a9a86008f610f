//! The `serve` command.
//!
//! Startup order: schema store and migration log, hook runtime (optionally
//! watched), migrations (optionally automigrated), then the listener. The
//! listener speaks line-delimited JSON: each request line is
//! `{"event": "...", "data": {...}}` and each response line is the dispatch
//! report for that event.

use std::sync::Arc;

use color_eyre::eyre::{Context, Result};
use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

use strata_core::{AppConfig, HooksSettings, SchemaSnapshot};
use strata_hooks::{
    Capabilities, DirectoryWatcher, DispatchReport, HookContext, HookLoader, HookRegistry,
    RhaiSandbox, SandboxConfig, Value, WatchConfig, spawn_reload_loop,
};
use strata_migrate::{Migration, MigrationFileGenerator, MigrationPlanner, MigrationRunner};

/// Build a loader over a fresh registry from hook settings.
pub fn build_loader(settings: &HooksSettings) -> Result<HookLoader> {
    let capabilities = Capabilities::new(SandboxConfig::from_settings(settings));
    let sandbox = Arc::new(RhaiSandbox::new(capabilities));
    HookLoader::new(sandbox, Arc::new(HookRegistry::new()), &settings.patterns)
        .wrap_err("Invalid hook script pattern")
}

/// Run the server until ctrl-c.
pub async fn run(config: AppConfig) -> Result<()> {
    let runner = crate::open_runner(&config)?;

    let mut loader = build_loader(&config.hooks)?;
    let registry = Arc::clone(loader.registry());
    match loader.load_all(&config.hooks.dir) {
        Ok(report) => {
            for err in &report.errors {
                tracing::error!(target: "strata", "{}", err);
            }
        }
        Err(err) => tracing::warn!(target: "strata", "{}", err),
    }

    let watch = if config.hooks.watch {
        match DirectoryWatcher::watch(&config.hooks.dir, WatchConfig::from_settings(&config.hooks)) {
            Ok((watcher, changes)) => Some((watcher, spawn_reload_loop(loader, changes))),
            Err(err) => {
                tracing::warn!(target: "strata", "hook reload disabled: {}", err);
                None
            }
        }
    } else {
        None
    };

    apply_artifacts(&config, &runner)?;
    if config.migrations.automigrate {
        automigrate(&config, &runner)?;
    }

    let listener = match TcpListener::bind(&config.listen).await {
        Ok(listener) => listener,
        Err(err) => {
            tracing::error!(target: "strata", listen = %config.listen, "failed to bind listener: {}", err);
            std::process::exit(1);
        }
    };
    tracing::info!(target: "strata", listen = %config.listen, "listening");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let registry = Arc::clone(&registry);
                    tokio::spawn(async move {
                        if let Err(err) = handle_connection(stream, registry).await {
                            tracing::debug!(target: "strata", %peer, "connection closed: {}", err);
                        }
                    });
                }
                Err(err) => tracing::warn!(target: "strata", "accept failed: {}", err),
            }
        }
    }

    if let Some((watcher, reload)) = watch {
        watcher.stop().await;
        reload.await.wrap_err("Hook reload loop failed")?;
    }
    tracing::info!(target: "strata", "shut down");
    Ok(())
}

/// Apply migration artifacts that are not in the log yet.
fn apply_artifacts(config: &AppConfig, runner: &MigrationRunner) -> Result<()> {
    let migrations = strata_migrate::load_dir(&config.migrations.dir)
        .wrap_err("Failed to read migration artifacts")?;
    let applied = runner
        .apply_pending(&migrations)
        .wrap_err("Failed to apply pending migrations")?;
    if !applied.is_empty() {
        tracing::info!(target: "strata", count = applied.len(), "applied pending migrations");
    }
    Ok(())
}

/// Diff the store against the schema directory, write the difference as an
/// artifact and apply it.
fn automigrate(config: &AppConfig, runner: &MigrationRunner) -> Result<()> {
    let desired = SchemaSnapshot::load_dir(&config.migrations.schema_dir)
        .wrap_err("Failed to load schema definitions")?;
    let current = runner.store().current_schema()?;
    let operations = MigrationPlanner::diff(&current, &desired)?;
    if operations.is_empty() {
        tracing::info!(target: "strata", "schema is up to date");
        return Ok(());
    }

    let name = MigrationFileGenerator::suggest_name(&operations);
    let migration = Migration::new(runner.next_id(), &name, operations);
    MigrationFileGenerator::new(&config.migrations.dir).write(&migration)?;
    runner
        .apply_migration(migration)
        .wrap_err("Automigration failed")?;
    Ok(())
}

async fn handle_connection(stream: TcpStream, registry: Arc<HookRegistry>) -> std::io::Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let response = match serde_json::from_str::<HookContext>(&line) {
            Ok(ctx) => match registry.dispatch_blocking(ctx.event.clone(), ctx).await {
                Ok(report) => report_json(&report),
                Err(err) => json!({ "error": err.to_string() }),
            },
            Err(err) => json!({ "error": format!("invalid request: {err}") }),
        };

        let mut out = response.to_string();
        out.push('\n');
        writer.write_all(out.as_bytes()).await?;
    }
    Ok(())
}

fn report_json(report: &DispatchReport) -> serde_json::Value {
    let outcomes: Vec<serde_json::Value> = report
        .outcomes
        .iter()
        .map(|outcome| {
            let owner = outcome.owner.display().to_string();
            match &outcome.result {
                Ok(result) => json!({
                    "owner": owner,
                    "order": outcome.order,
                    "ok": true,
                    "value": result.value.as_ref().map(Value::to_json),
                    "prevent_default": result.prevent_default,
                }),
                Err(err) => json!({
                    "owner": owner,
                    "order": outcome.order,
                    "ok": false,
                    "error": err.message,
                    "line": err.line,
                }),
            }
        })
        .collect();

    json!({
        "event": report.event,
        "ran": report.ran(),
        "stopped": report.stopped,
        "prevent_default": report.prevent_default(),
        "outcomes": outcomes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn loader_with(dir: &Path, script: &str) -> HookLoader {
        std::fs::write(dir.join("a.rhai"), script).unwrap();
        let mut loader = build_loader(&HooksSettings::default()).unwrap();
        loader.load_all(dir).unwrap();
        loader
    }

    #[tokio::test]
    async fn test_line_protocol_dispatches_events() {
        let dir = tempfile::tempdir().unwrap();
        let loader = loader_with(dir.path(), r#"on("ping", |ctx| ctx.data.n + 1);"#);
        let registry = Arc::clone(loader.registry());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            handle_connection(stream, registry).await.unwrap();
        });

        let stream = TcpStream::connect(addr).await.unwrap();
        let (reader, mut writer) = stream.into_split();
        let mut lines = BufReader::new(reader).lines();

        writer
            .write_all(b"{\"event\": \"ping\", \"data\": {\"n\": 1}}\nnot json\n")
            .await
            .unwrap();

        let first: serde_json::Value =
            serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
        assert_eq!(first["ran"], 1);
        assert_eq!(first["outcomes"][0]["ok"], true);
        assert_eq!(first["outcomes"][0]["value"], 2);

        let second: serde_json::Value =
            serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
        assert!(second["error"].as_str().unwrap().starts_with("invalid request"));
    }

    #[test]
    fn test_report_for_failed_handler() {
        let dir = tempfile::tempdir().unwrap();
        let loader = loader_with(dir.path(), r#"on("boom", |ctx| { throw "bad"; });"#);

        let report = loader.registry().dispatch("boom", &HookContext::new("boom"));
        let json = report_json(&report);
        assert_eq!(json["ran"], 1);
        assert_eq!(json["outcomes"][0]["ok"], false);
        assert!(json["outcomes"][0]["error"].as_str().unwrap().contains("bad"));
    }
}
