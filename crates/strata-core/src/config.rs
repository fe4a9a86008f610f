//! Application configuration.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use derive_builder::Builder;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// File name looked up when no explicit config path is given.
pub const CONFIG_FILE_NAME: &str = "strata.toml";

/// Top-level configuration.
#[derive(Debug, Clone, Builder, Serialize, Deserialize)]
#[builder(setter(into), build_fn(validate = "Self::validate"))]
pub struct AppConfig {
    /// Directory for persisted state (schema store, applied migration log).
    #[builder(default = "default_data_dir()")]
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Address the listener binds to.
    #[builder(default = "default_listen()")]
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Extension runtime settings.
    #[builder(default)]
    #[serde(default)]
    pub hooks: HooksSettings,

    /// Migration settings.
    #[builder(default)]
    #[serde(default)]
    pub migrations: MigrationSettings,
}

/// Settings for the hook loader, sandbox and watcher.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HooksSettings {
    /// Directory holding hook scripts.
    pub dir: PathBuf,

    /// File name globs selecting script files.
    pub patterns: Vec<String>,

    /// Reload scripts when the directory changes.
    pub watch: bool,

    /// Quiet period before a batch of file events is delivered.
    pub debounce_ms: u64,

    /// How often a lost watch is re-armed (0 disables re-arming).
    pub rearm_interval_ms: u64,

    /// Operation budget for a single script evaluation.
    pub max_operations: u64,

    /// Maximum script call depth.
    pub max_call_levels: usize,

    /// Environment variables scripts may read.
    pub allowed_env: Vec<String>,
}

impl Default for HooksSettings {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("strata_hooks"),
            patterns: vec!["*.rhai".to_string()],
            watch: false,
            debounce_ms: 50,
            rearm_interval_ms: 2000,
            max_operations: 1_000_000,
            max_call_levels: 64,
            allowed_env: vec![crate::tls::DISABLE_SSL_VERIFY_ENV.to_string()],
        }
    }
}

/// Settings for the migration engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MigrationSettings {
    /// Directory holding migration artifacts.
    pub dir: PathBuf,

    /// Directory holding declarative collection definitions.
    pub schema_dir: PathBuf,

    /// Diff, write and apply a migration when the server starts.
    pub automigrate: bool,
}

impl Default for MigrationSettings {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("strata_migrations"),
            schema_dir: PathBuf::from("strata_schema"),
            automigrate: false,
        }
    }
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("strata_data")
}

fn default_listen() -> String {
    "127.0.0.1:8090".to_string()
}

fn check_listen(listen: &str) -> Result<(), String> {
    listen
        .parse::<SocketAddr>()
        .map(|_| ())
        .map_err(|e| format!("Invalid listen address '{listen}': {e}"))
}

fn check_hooks(hooks: &HooksSettings) -> Result<(), String> {
    if hooks.patterns.is_empty() {
        return Err("At least one hook script pattern is required".to_string());
    }
    if hooks.debounce_ms == 0 {
        return Err("Hook debounce window must be greater than zero".to_string());
    }
    Ok(())
}

impl AppConfigBuilder {
    fn validate(&self) -> Result<(), String> {
        if let Some(listen) = &self.listen {
            check_listen(listen)?;
        }
        if let Some(hooks) = &self.hooks {
            check_hooks(hooks)?;
        }
        Ok(())
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            listen: default_listen(),
            hooks: HooksSettings::default(),
            migrations: MigrationSettings::default(),
        }
    }
}

impl AppConfig {
    /// Create a new config builder.
    pub fn builder() -> AppConfigBuilder {
        AppConfigBuilder::default()
    }

    /// Load and validate a config file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let source = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = toml::from_str(&source).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Resolve the config to use.
    ///
    /// An explicit path must exist. Otherwise `strata.toml` in the working
    /// directory, then in the user config directory, then defaults.
    pub fn discover(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(path) = explicit {
            return Self::load(path);
        }

        let local = PathBuf::from(CONFIG_FILE_NAME);
        if local.is_file() {
            return Self::load(&local);
        }

        if let Some(user) = dirs::config_dir().map(|d| d.join("strata").join(CONFIG_FILE_NAME)) {
            if user.is_file() {
                return Self::load(&user);
            }
        }

        Ok(Self::default())
    }

    /// Validate values that serde cannot check.
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_listen(&self.listen)
            .and_then(|_| check_hooks(&self.hooks))
            .map_err(|message| ConfigError::Invalid { message })
    }

    /// Path of the persisted schema store.
    pub fn schema_store_path(&self) -> PathBuf {
        self.data_dir.join("schema.json")
    }

    /// Path of the applied migration log.
    pub fn migration_log_path(&self) -> PathBuf {
        self.data_dir.join("migrations.json")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_defaults() {
        let config = AppConfig::builder().build().unwrap();
        assert_eq!(config.listen, "127.0.0.1:8090");
        assert_eq!(config.hooks.patterns, vec!["*.rhai".to_string()]);
        assert!(!config.migrations.automigrate);
    }

    #[test]
    fn test_builder_rejects_bad_listen() {
        let result = AppConfig::builder().listen("not an address").build();
        assert!(result.is_err());
    }

    #[test]
    fn test_builder_rejects_zero_debounce() {
        let hooks = HooksSettings {
            debounce_ms: 0,
            ..HooksSettings::default()
        };
        assert!(AppConfig::builder().hooks(hooks).build().is_err());
    }
}
