use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sqlx::postgres::PgSslMode;
use tracing::{debug, info, warn};

use crate::credential::InstanceResolver;
use crate::pool::{PoolSettings, PoolSizing, DEFAULT_MAX_SIZE, DEFAULT_MIN_SIZE};
use crate::workspace::WorkspaceError;
use crate::{Error, Result};

/// Load environment variables from .env files
///
/// Priority order (highest to lowest):
/// 1. Environment variables already set
/// 2. Current directory .env
/// 3. ~/.lakectl/.env
pub fn load_dotenv() {
    let mut loaded_from = Vec::new();

    if let Ok(path) = dotenvy::dotenv() {
        loaded_from.push(format!("current directory ({})", path.display()));
    }

    if let Some(env_file) = config_dir().map(|dir| dir.join(".env")) {
        if env_file.exists() {
            // dotenvy doesn't overwrite existing vars
            match dotenvy::from_path(&env_file) {
                Ok(_) => loaded_from.push(format!("~/.lakectl/.env ({})", env_file.display())),
                Err(e) => debug!("Failed to load {}: {}", env_file.display(), e),
            }
        }
    }

    if loaded_from.is_empty() {
        debug!("No .env files found (current dir or ~/.lakectl)");
    } else {
        info!("Loaded environment from: {}", loaded_from.join(", "));
    }
}

/// Get the lakectl config directory path (~/.lakectl)
pub fn config_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".lakectl"))
}

/// Path of the user-level config file (~/.lakectl/config.toml)
pub fn global_config_path() -> Option<PathBuf> {
    config_dir().map(|dir| dir.join("config.toml"))
}

/// Path of the project-level config file (./lakectl.toml)
pub fn local_config_path() -> PathBuf {
    PathBuf::from("lakectl.toml")
}

// ============================================================================
// TOML Configuration
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct LakectlConfig {
    #[serde(default)]
    pub workspace: WorkspaceConfig,

    #[serde(default)]
    pub pool: PoolConfig,

    #[serde(default)]
    pub defaults: DefaultsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct WorkspaceConfig {
    /// Workspace URL; `DATABRICKS_HOST` takes precedence
    #[serde(default)]
    pub host: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    #[serde(default = "default_min_size")]
    pub min_size: usize,

    #[serde(default = "default_max_size")]
    pub max_size: usize,

    #[serde(default = "default_timeout_secs")]
    pub wait_timeout_secs: u64,

    #[serde(default = "default_timeout_secs")]
    pub create_timeout_secs: u64,

    #[serde(default = "default_true")]
    pub retry_on_auth_failure: bool,

    #[serde(default = "default_ssl_mode")]
    pub ssl_mode: String,

    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_size: default_min_size(),
            max_size: default_max_size(),
            wait_timeout_secs: default_timeout_secs(),
            create_timeout_secs: default_timeout_secs(),
            retry_on_auth_failure: true,
            ssl_mode: default_ssl_mode(),
            port: default_port(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefaultsConfig {
    #[serde(default)]
    pub instance: Option<String>,

    #[serde(default = "default_database")]
    pub database: String,

    /// Postgres role; falls back to the workspace user name
    #[serde(default)]
    pub user: Option<String>,

    #[serde(default = "default_schema")]
    pub schema: String,

    #[serde(default = "default_table")]
    pub table: String,

    #[serde(default = "default_limit")]
    pub limit: i64,
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            instance: None,
            database: default_database(),
            user: None,
            schema: default_schema(),
            table: default_table(),
            limit: default_limit(),
        }
    }
}

// Default value functions for serde
fn default_min_size() -> usize {
    DEFAULT_MIN_SIZE
}

fn default_max_size() -> usize {
    DEFAULT_MAX_SIZE
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_true() -> bool {
    true
}

fn default_ssl_mode() -> String {
    "require".to_string()
}

fn default_port() -> u16 {
    crate::connector::DEFAULT_PORT
}

fn default_database() -> String {
    "databricks_postgres".to_string()
}

fn default_schema() -> String {
    crate::app_state::DEFAULT_SCHEMA.to_string()
}

fn default_table() -> String {
    crate::app_state::DEFAULT_TABLE.to_string()
}

fn default_limit() -> i64 {
    10
}

impl LakectlConfig {
    /// Load config from TOML files and the environment
    ///
    /// Priority order (highest to lowest):
    /// 1. LAKEBASE_* / DATABRICKS_HOST environment variables
    /// 2. ./lakectl.toml (project-specific)
    /// 3. ~/.lakectl/config.toml (user defaults)
    /// 4. Built-in defaults
    pub fn load() -> Self {
        let mut config = LakectlConfig::default();

        if let Some(global) = global_config_path().and_then(|path| Self::read_file(&path)) {
            config = global;
        }

        if let Some(local) = Self::read_file(&local_config_path()) {
            config = local;
        }

        config.apply_env();
        config
    }

    /// Parse a config file, logging and skipping it if unreadable or invalid.
    pub fn read_file(path: &Path) -> Option<Self> {
        if !path.exists() {
            return None;
        }

        match std::fs::read_to_string(path) {
            Ok(contents) => match toml::from_str::<LakectlConfig>(&contents) {
                Ok(config) => {
                    debug!("Loaded config from {}", path.display());
                    Some(config)
                }
                Err(e) => {
                    warn!("Failed to parse {}: {}", path.display(), e);
                    None
                }
            },
            Err(e) => {
                debug!("Failed to read {}: {}", path.display(), e);
                None
            }
        }
    }

    /// Override file values with environment variables.
    pub fn apply_env(&mut self) {
        if let Ok(host) = std::env::var("DATABRICKS_HOST") {
            self.workspace.host = Some(host);
        }
        if let Ok(instance) = std::env::var("LAKEBASE_INSTANCE") {
            self.defaults.instance = Some(instance);
        }
        if let Ok(database) = std::env::var("LAKEBASE_DATABASE") {
            self.defaults.database = database;
        }
        if let Ok(user) = std::env::var("LAKEBASE_USER") {
            self.defaults.user = Some(user);
        }
    }

    pub fn ssl_mode(&self) -> Result<PgSslMode> {
        PgSslMode::from_str(&self.pool.ssl_mode)
            .map_err(|e| Error::Config(format!("invalid ssl_mode {:?}: {}", self.pool.ssl_mode, e)))
    }

    pub fn sizing(&self) -> PoolSizing {
        PoolSizing {
            min_size: self.pool.min_size,
            max_size: self.pool.max_size,
            wait_timeout: timeout(self.pool.wait_timeout_secs),
            create_timeout: timeout(self.pool.create_timeout_secs),
        }
    }

    /// Pool settings for a resolved instance, using this config's pool section.
    pub fn pool_settings(
        &self,
        instance_name: &str,
        host: &str,
        user: &str,
        database: &str,
    ) -> Result<PoolSettings> {
        let mut settings = PoolSettings::new(instance_name, host, user, database);
        settings.port = self.pool.port;
        settings.ssl_mode = self.ssl_mode()?;
        settings.sizing = self.sizing();
        settings.retry_on_auth_failure = self.pool.retry_on_auth_failure;
        settings.validate()?;
        Ok(settings)
    }

    /// Look up `instance_name` and build pool settings for its read-write endpoint.
    pub async fn resolve_pool_settings(
        &self,
        resolver: &dyn InstanceResolver,
        instance_name: &str,
        user: &str,
        database: &str,
    ) -> Result<PoolSettings> {
        let instance = resolver
            .resolve_instance(instance_name)
            .await
            .map_err(Error::InstanceLookupFailed)?;
        let host = instance.read_write_host().ok_or_else(|| {
            Error::InstanceLookupFailed(WorkspaceError::NoEndpoint(instance_name.to_string()))
        })?;
        debug!(instance = %instance_name, host, "resolved instance endpoint");
        self.pool_settings(instance_name, host, user, database)
    }
}

/// Zero disables the timeout.
fn timeout(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}
