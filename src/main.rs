//! strata - sandboxed hook scripts and schema automigration.
//!
//! Usage:
//!   strata serve               Run hooks, migrations and the event listener
//!   strata migrate up          Apply pending migration artifacts
//!   strata migrate down        Roll back the last applied migration
//!   strata migrate status      Show applied and pending migrations
//!   strata migrate diff        Show what the schema directory would change
//!   strata migrate generate    Write the difference as a migration artifact
//!   strata hooks check         Compile hook scripts without running them
//!   strata --help              Show help

mod serve;

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use color_eyre::eyre::{Context, Result, bail};
use tracing_subscriber::EnvFilter;

use strata_core::{AppConfig, SchemaSnapshot, init_tls_from_env};
use strata_migrate::{
    AppliedMigrationLog, MemoryStore, Migration, MigrationFileGenerator, MigrationId,
    MigrationPlanner, MigrationRunner, apply_operations,
};

#[derive(Parser)]
#[command(
    name = "strata",
    version,
    about = "Sandboxed hook scripts and schema automigration",
    long_about = "strata loads hook scripts from a directory, reloads them as they change, \
                  and keeps the live schema in step with declarative collection definitions.\n\n\
                  Run `strata serve` to start, or use the migrate and hooks subcommands \
                  for one-off operations."
)]
struct Cli {
    /// Config file (defaults to ./strata.toml, then the user config dir)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Load hooks, run migrations and listen for events
    Serve {
        /// Address to listen on
        #[arg(short, long)]
        listen: Option<String>,

        /// Reload hook scripts when they change
        #[arg(short, long)]
        watch: bool,

        /// Generate and apply a migration from the schema directory on start
        #[arg(short, long)]
        automigrate: bool,
    },

    /// Manage schema migrations
    Migrate {
        #[command(subcommand)]
        action: MigrateAction,
    },

    /// Work with hook scripts
    Hooks {
        #[command(subcommand)]
        action: HooksAction,
    },
}

#[derive(Subcommand)]
enum MigrateAction {
    /// Apply every migration artifact not yet applied
    Up,

    /// Roll back the most recent migration
    Down,

    /// Show applied and pending migrations
    Status {
        /// Output format
        #[arg(short, long, default_value = "text")]
        format: OutputFormat,
    },

    /// Show the operations needed to reach the schema directory
    Diff {
        /// Output format
        #[arg(short, long, default_value = "text")]
        format: OutputFormat,
    },

    /// Write the pending difference as a migration artifact
    Generate {
        /// Artifact name (derived from the operations if omitted)
        #[arg(short, long)]
        name: Option<String>,
    },
}

#[derive(Subcommand)]
enum HooksAction {
    /// Compile every script and report errors
    Check {
        /// Script directory (defaults to the configured one)
        dir: Option<PathBuf>,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum, Default)]
enum OutputFormat {
    #[default]
    Text,
    Json,
}

fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = Cli::parse();
    init_logging(cli.log_json);
    init_tls_from_env();

    let mut config = AppConfig::discover(cli.config.as_deref()).wrap_err("Failed to load config")?;

    match cli.command {
        Command::Serve {
            listen,
            watch,
            automigrate,
        } => {
            if let Some(listen) = listen {
                config.listen = listen;
            }
            config.hooks.watch |= watch;
            config.migrations.automigrate |= automigrate;
            config.validate()?;
            run_serve(config)?;
        }
        Command::Migrate { action } => match action {
            MigrateAction::Up => run_migrate_up(&config)?,
            MigrateAction::Down => run_migrate_down(&config)?,
            MigrateAction::Status { format } => run_migrate_status(&config, format)?,
            MigrateAction::Diff { format } => run_migrate_diff(&config, format)?,
            MigrateAction::Generate { name } => run_migrate_generate(&config, name.as_deref())?,
        },
        Command::Hooks {
            action: HooksAction::Check { dir },
        } => {
            let dir = dir.unwrap_or_else(|| config.hooks.dir.clone());
            run_hooks_check(&config, &dir)?;
        }
    }

    Ok(())
}

/// Install the global subscriber. `RUST_LOG` overrides the `info` default.
fn init_logging(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Open the schema store and applied-migration log under the data dir.
pub(crate) fn open_runner(config: &AppConfig) -> Result<MigrationRunner> {
    let store = MemoryStore::open(config.schema_store_path()).wrap_err("Failed to open schema store")?;
    let log = AppliedMigrationLog::open(config.migration_log_path())
        .wrap_err("Failed to open migration log")?;
    Ok(MigrationRunner::new(Arc::new(store), log))
}

/// Run the server on a multi-threaded runtime.
///
/// Unrecoverable startup errors are logged and exit with status 1.
fn run_serve(config: AppConfig) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .wrap_err("Failed to start async runtime")?;

    if let Err(err) = runtime.block_on(serve::run(config)) {
        tracing::error!(target: "strata", "fatal: {:#}", err);
        std::process::exit(1);
    }
    Ok(())
}

/// Artifacts on disk that the log has not seen, in id order.
fn pending_artifacts(config: &AppConfig, runner: &MigrationRunner) -> Result<Vec<Migration>> {
    let migrations =
        strata_migrate::load_dir(&config.migrations.dir).wrap_err("Failed to read migration artifacts")?;
    Ok(runner.pending(&migrations).into_iter().cloned().collect())
}

/// The live schema with pending artifacts applied on top.
fn projected_schema(runner: &MigrationRunner, pending: &[Migration]) -> Result<SchemaSnapshot> {
    let mut schema = runner.store().current_schema()?;
    for migration in pending {
        schema = apply_operations(&schema, &migration.operations)
            .wrap_err_with(|| format!("Pending migration {}_{} does not apply", migration.id, migration.name))?;
    }
    Ok(schema)
}

fn run_migrate_up(config: &AppConfig) -> Result<()> {
    let runner = open_runner(config)?;
    let migrations =
        strata_migrate::load_dir(&config.migrations.dir).wrap_err("Failed to read migration artifacts")?;
    let applied = runner.apply_pending(&migrations)?;

    if applied.is_empty() {
        println!("No pending migrations.");
    }
    for record in &applied {
        println!(
            "Applied {}_{} ({} operations)",
            record.id,
            record.name,
            record.operations.len()
        );
    }
    Ok(())
}

fn run_migrate_down(config: &AppConfig) -> Result<()> {
    let runner = open_runner(config)?;
    let record = runner.rollback_last()?;
    println!("Rolled back {}_{}", record.id, record.name);
    Ok(())
}

fn run_migrate_status(config: &AppConfig, format: OutputFormat) -> Result<()> {
    let runner = open_runner(config)?;
    let applied = runner.applied();
    let pending = pending_artifacts(config, &runner)?;

    match format {
        OutputFormat::Text => {
            println!("Applied ({}):", applied.len());
            for record in &applied {
                let marker = if record.reversible { "" } else { "  [irreversible]" };
                println!(
                    "  {}_{}  {}{}",
                    record.id,
                    record.name,
                    record.applied_at.format("%Y-%m-%d %H:%M:%S"),
                    marker
                );
            }
            println!("Pending ({}):", pending.len());
            for migration in &pending {
                println!("  {}_{}", migration.id, migration.name);
            }
        }
        OutputFormat::Json => {
            let report = serde_json::json!({ "applied": applied, "pending": pending });
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
    }
    Ok(())
}

fn run_migrate_diff(config: &AppConfig, format: OutputFormat) -> Result<()> {
    let runner = open_runner(config)?;
    let pending = pending_artifacts(config, &runner)?;
    let current = projected_schema(&runner, &pending)?;
    let desired = SchemaSnapshot::load_dir(&config.migrations.schema_dir)
        .wrap_err("Failed to load schema definitions")?;
    let operations = MigrationPlanner::diff(&current, &desired)?;

    match format {
        OutputFormat::Text => {
            if operations.is_empty() {
                println!("No changes.");
            } else {
                print!("{}", MigrationFileGenerator::render(&operations)?);
            }
        }
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&operations)?);
        }
    }
    Ok(())
}

fn run_migrate_generate(config: &AppConfig, name: Option<&str>) -> Result<()> {
    let runner = open_runner(config)?;
    let pending = pending_artifacts(config, &runner)?;
    let current = projected_schema(&runner, &pending)?;
    let desired = SchemaSnapshot::load_dir(&config.migrations.schema_dir)
        .wrap_err("Failed to load schema definitions")?;
    let operations = MigrationPlanner::diff(&current, &desired)?;

    if operations.is_empty() {
        println!("No changes.");
        return Ok(());
    }

    // Stay ahead of artifacts that are written but not applied yet.
    let id = match pending.last() {
        Some(last) => runner.next_id().max(MigrationId(last.id.0 + 1)),
        None => runner.next_id(),
    };
    let name = name.map_or_else(|| MigrationFileGenerator::suggest_name(&operations), str::to_string);
    let migration = Migration::new(id, &name, operations);

    let path = MigrationFileGenerator::new(&config.migrations.dir).write(&migration)?;
    println!("Wrote {}", path.display());
    Ok(())
}

fn run_hooks_check(config: &AppConfig, dir: &std::path::Path) -> Result<()> {
    let loader = serve::build_loader(&config.hooks)?;
    let report = loader.check(dir)?;

    for path in &report.loaded {
        println!("ok     {}", path.display());
    }
    for err in &report.errors {
        println!("error  {err}");
    }

    if !report.is_clean() {
        bail!(
            "{} of {} scripts failed to compile",
            report.errors.len(),
            report.loaded.len() + report.errors.len()
        );
    }
    println!("{} scripts compiled, {} bindings", report.loaded.len(), report.bindings);
    Ok(())
}
