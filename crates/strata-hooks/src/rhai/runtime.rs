//! Rhai sandbox and compiled units.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use rhai::module_resolvers::DummyModuleResolver;
use rhai::{AST, Dynamic, Engine, EvalAltResult, FnPtr, Map, Position, Scope};

use crate::hooks::{HookContext, HookResult, route_event};
use crate::host::HttpRequest;
use crate::sandbox::{Capabilities, CompiledUnit, Permission, ScriptSandbox};
use crate::types::{CompileError, RuntimeError};

use super::convert::{dynamic_to_hook_result, dynamic_to_value, value_map_to_rhai, value_to_dynamic};

/// Handlers captured while a script's top level runs.
#[derive(Default)]
struct Registrations {
    /// Set once loading finishes; later `on`/`route` calls fail.
    sealed: bool,
    handlers: Vec<(String, FnPtr)>,
}

type SharedRegistrations = Arc<Mutex<Registrations>>;

fn register_handler(
    registrations: &SharedRegistrations,
    event: String,
    handler: FnPtr,
) -> Result<(), Box<EvalAltResult>> {
    let mut regs = registrations.lock();
    if regs.sealed {
        return Err("hooks can only be registered while the script loads".into());
    }
    if event.trim().is_empty() {
        return Err("hook event name cannot be empty".into());
    }
    regs.handlers.push((event, handler));
    Ok(())
}

fn control_map(value: Option<Dynamic>) -> Map {
    let mut map = Map::new();
    map.insert("stop_propagation".into(), Dynamic::from(true));
    if let Some(value) = value {
        map.insert("value".into(), value);
    }
    map
}

fn position_parts(pos: Position) -> (Option<usize>, Option<usize>) {
    (pos.line(), pos.position())
}

/// Rhai-backed [`ScriptSandbox`].
///
/// Scripts bind handlers with explicit calls evaluated once at load:
///
/// ```text
/// on("records.create", |ctx| {
///     log_info(`creating in ${ctx.data.collection}`);
/// });
///
/// route("GET", "/api/stats", |ctx| #{ total: 3 });
/// ```
pub struct RhaiSandbox {
    capabilities: Capabilities,
}

impl RhaiSandbox {
    /// Create a sandbox granting `capabilities` to every compiled unit.
    pub fn new(capabilities: Capabilities) -> Self {
        Self { capabilities }
    }

    /// Capabilities granted to compiled units.
    pub fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    /// Build an engine holding exactly the granted host functions.
    fn build_engine(&self, path: &Path, registrations: SharedRegistrations) -> Engine {
        let config = self.capabilities.config();
        let mut engine = Engine::new();

        // Configure safety limits
        engine.set_max_expr_depths(config.max_expr_depth, config.max_expr_depth);
        engine.set_max_call_levels(config.max_call_levels);
        engine.set_max_operations(config.max_operations);
        engine.set_max_string_size(config.max_string_size);
        engine.set_max_array_size(config.max_array_size);
        engine.set_max_map_size(config.max_map_size);

        // No file-backed imports, no dynamic evaluation
        engine.set_module_resolver(DummyModuleResolver::new());
        engine.disable_symbol("eval");

        let script = path.display().to_string();

        if config.has_permission(Permission::Log) {
            let source = script.clone();
            engine.on_print(move |msg| {
                tracing::info!(target: "hooks_script", script = %source, "{}", msg);
            });
            let source = script.clone();
            engine.on_debug(move |msg, _, pos| {
                tracing::debug!(target: "hooks_script", script = %source, line = ?pos.line(), "{}", msg);
            });

            let source = script.clone();
            engine.register_fn("log_info", move |msg: &str| {
                tracing::info!(target: "hooks_script", script = %source, "{}", msg);
            });
            let source = script.clone();
            engine.register_fn("log_warn", move |msg: &str| {
                tracing::warn!(target: "hooks_script", script = %source, "{}", msg);
            });
            let source = script.clone();
            engine.register_fn("log_error", move |msg: &str| {
                tracing::error!(target: "hooks_script", script = %source, "{}", msg);
            });
        } else {
            engine.on_print(|_| {});
            engine.on_debug(|_, _, _| {});
        }

        // Registration calls
        let regs = registrations.clone();
        engine.register_fn(
            "on",
            move |event: &str, handler: FnPtr| -> Result<(), Box<EvalAltResult>> {
                register_handler(&regs, event.to_string(), handler)
            },
        );
        let regs = registrations;
        engine.register_fn(
            "route",
            move |method: &str, route: &str, handler: FnPtr| -> Result<(), Box<EvalAltResult>> {
                register_handler(&regs, route_event(method, route), handler)
            },
        );

        // Short-circuit signal
        engine.register_fn("stop", || -> Map { control_map(None) });
        engine.register_fn("stop", |value: Dynamic| -> Map { control_map(Some(value)) });

        if config.has_permission(Permission::Environment) {
            let sandbox = config.clone();
            engine.register_fn(
                "env",
                move |name: &str| -> Result<Dynamic, Box<EvalAltResult>> {
                    if !sandbox.can_read_env(name) {
                        return Err(format!("environment variable '{name}' is not accessible").into());
                    }
                    Ok(std::env::var(name).map(Dynamic::from).unwrap_or(Dynamic::UNIT))
                },
            );
        }

        if let Some(records) = self.capabilities.records().cloned() {
            let access = records.clone();
            engine.register_fn(
                "find_record",
                move |collection: &str, id: &str| -> Result<Dynamic, Box<EvalAltResult>> {
                    match access.find_by_id(collection, id)? {
                        Some(record) => Ok(value_to_dynamic(&record)),
                        None => Ok(Dynamic::UNIT),
                    }
                },
            );
            let access = records.clone();
            engine.register_fn(
                "find_records",
                move |collection: &str, filter: &str, limit: i64| -> Result<rhai::Array, Box<EvalAltResult>> {
                    let limit = usize::try_from(limit).unwrap_or(0);
                    let found = access.find_by_filter(collection, filter, limit)?;
                    Ok(found.iter().map(value_to_dynamic).collect())
                },
            );
            let access = records;
            engine.register_fn(
                "save_record",
                move |collection: &str, record: Map| -> Result<Dynamic, Box<EvalAltResult>> {
                    let record = dynamic_to_value(&Dynamic::from(record));
                    let saved = access.save(collection, record)?;
                    Ok(value_to_dynamic(&saved))
                },
            );
        }

        if let Some(http) = self.capabilities.http().cloned() {
            engine.register_fn(
                "http_send",
                move |request: Map| -> Result<Map, Box<EvalAltResult>> {
                    let request = http_request_from_map(&request)?;
                    let response = http.send(request)?;

                    let mut headers = BTreeMap::new();
                    for (k, v) in response.headers {
                        headers.insert(k, crate::Value::String(v));
                    }
                    let mut map = Map::new();
                    map.insert("status".into(), Dynamic::from(i64::from(response.status)));
                    map.insert("headers".into(), Dynamic::from(value_map_to_rhai(&headers)));
                    map.insert("body".into(), Dynamic::from(response.body));
                    Ok(map)
                },
            );
        }

        engine
    }
}

fn http_request_from_map(map: &Map) -> Result<HttpRequest, Box<EvalAltResult>> {
    let text = |key: &str| -> Option<String> {
        map.get(key).and_then(|v| v.clone().into_string().ok())
    };

    let url = text("url").ok_or("http_send requires a 'url'")?;
    let method = text("method").unwrap_or_else(|| "GET".to_string()).to_ascii_uppercase();

    let mut headers = BTreeMap::new();
    if let Some(raw) = map.get("headers").filter(|v| v.is_map()) {
        for (k, v) in raw.clone().cast::<Map>() {
            headers.insert(k.to_string(), v.to_string());
        }
    }

    Ok(HttpRequest {
        method,
        url,
        headers,
        body: text("body"),
    })
}

impl Default for RhaiSandbox {
    fn default() -> Self {
        Self::new(Capabilities::default())
    }
}

impl ScriptSandbox for RhaiSandbox {
    fn name(&self) -> &'static str {
        "rhai"
    }

    fn compile(&self, path: &Path, source: &str) -> Result<Arc<dyn CompiledUnit>, CompileError> {
        let registrations = SharedRegistrations::default();
        let engine = self.build_engine(path, registrations.clone());

        let mut ast = engine.compile(source).map_err(|e| {
            let (line, column) = position_parts(e.1);
            CompileError::new(path, e.0.to_string()).at(line, column)
        })?;
        ast.set_source(path.display().to_string());

        // Top-level statements run once; this is where `on`/`route` bind.
        let mut scope = Scope::new();
        engine.run_ast_with_scope(&mut scope, &ast).map_err(|e| {
            let mut err = *e;
            let (line, column) = position_parts(err.take_position());
            CompileError::new(path, err.to_string()).at(line, column)
        })?;

        let handlers = {
            let mut regs = registrations.lock();
            regs.sealed = true;
            std::mem::take(&mut regs.handlers)
        };

        tracing::debug!(target: "hooks", script = %path.display(), handlers = handlers.len(), "compiled script");

        let (events, handlers): (Vec<_>, Vec<_>) = handlers.into_iter().unzip();
        Ok(Arc::new(RhaiUnit {
            path: path.to_path_buf(),
            engine,
            ast,
            events,
            handlers,
        }))
    }
}

/// A compiled Rhai script.
struct RhaiUnit {
    path: PathBuf,
    engine: Engine,
    ast: AST,
    events: Vec<String>,
    handlers: Vec<FnPtr>,
}

impl CompiledUnit for RhaiUnit {
    fn path(&self) -> &Path {
        &self.path
    }

    fn events(&self) -> &[String] {
        &self.events
    }

    fn invoke(&self, handler: usize, ctx: &HookContext) -> Result<HookResult, RuntimeError> {
        let fn_ptr = self.handlers.get(handler).ok_or_else(|| RuntimeError {
            path: self.path.clone(),
            event: ctx.event.clone(),
            message: format!("no handler #{handler}"),
            line: None,
        })?;

        let arg = value_to_dynamic(&ctx.to_value());
        let result = fn_ptr
            .call::<Dynamic>(&self.engine, &self.ast, (arg,))
            .map_err(|e| {
                let mut err = *e;
                let line = err.take_position().line();
                RuntimeError {
                    path: self.path.clone(),
                    event: ctx.event.clone(),
                    message: err.to_string(),
                    line,
                }
            })?;

        Ok(dynamic_to_hook_result(result))
    }
}
