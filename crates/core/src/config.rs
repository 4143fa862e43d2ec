//! TOML-based configuration system for mirrorsync.
//!
//! Store credentials are never written into the file. Each store section
//! names an environment variable in `token_env`, and the value is resolved
//! at runtime via [`AppConfig::resolve_env_vars`].

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::errors::ConfigError;
use crate::models::RunDirection;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Top-level application configuration loaded from a TOML file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Daemon / polling settings.
    #[serde(default)]
    pub daemon: DaemonConfig,

    /// Document-oriented system of record.
    pub primary: StoreConfig,

    /// Relational mirror.
    pub mirror: StoreConfig,

    /// Location of the entity mapping file.
    pub schema: SchemaConfig,

    /// Sync behaviour settings.
    #[serde(default)]
    pub sync: SyncConfig,
}

// ---------------------------------------------------------------------------
// Daemon
// ---------------------------------------------------------------------------

/// Daemon / polling configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Seconds between sync runs (default 60).
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// Minimum tracing level: trace, debug, info, warn, error.
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Directory for persistent data (the state database).
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Optional log file. Rotated daily.
    #[serde(default)]
    pub log_file: Option<PathBuf>,
}

fn default_poll_interval() -> u64 {
    60
}
fn default_log_level() -> String {
    "info".into()
}
fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/mirrorsync")
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval(),
            log_level: default_log_level(),
            data_dir: default_data_dir(),
            log_file: None,
        }
    }
}

impl DaemonConfig {
    /// Path of the SQLite state database inside `data_dir`.
    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join("mirrorsync.db")
    }
}

// ---------------------------------------------------------------------------
// Stores
// ---------------------------------------------------------------------------

/// Connection settings for one store's HTTP API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Base URL of the store API (e.g. `https://docs.example.com/api`).
    pub base_url: String,

    /// Environment variable holding the bearer token.
    #[serde(default)]
    pub token_env: Option<String>,

    /// Per-request HTTP timeout in seconds (default 30).
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Client-side request rate cap. Unlimited when absent.
    #[serde(default)]
    pub requests_per_second: Option<u32>,

    /// Resolved token (populated by `resolve_env_vars`).
    #[serde(skip)]
    pub token: Option<String>,
}

fn default_timeout_secs() -> u64 {
    30
}

// ---------------------------------------------------------------------------
// Schema
// ---------------------------------------------------------------------------

/// Where the entity mapping file lives.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaConfig {
    /// Path to the TOML mapping file. Relative paths are resolved against
    /// the directory containing the config file.
    pub mapping_file: PathBuf,
}

// ---------------------------------------------------------------------------
// Sync behaviour
// ---------------------------------------------------------------------------

/// Sync behaviour configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Direction used when none is given on the command line.
    #[serde(default)]
    pub default_direction: RunDirection,

    /// Maximum number of (entity, direction) pairs running at once.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Records requested per change-feed page.
    #[serde(default = "default_page_size")]
    pub page_size: usize,

    /// Fetched batches allowed to wait for the applier before fetching
    /// pauses.
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight_batches: usize,

    /// Deadline for each individual store call.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Backoff settings for throttled and transient failures.
    #[serde(default)]
    pub retry: RetrySettings,
}

fn default_concurrency() -> usize {
    4
}
fn default_page_size() -> usize {
    100
}
fn default_max_in_flight() -> usize {
    4
}
fn default_request_timeout() -> u64 {
    30
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            default_direction: RunDirection::default(),
            concurrency: default_concurrency(),
            page_size: default_page_size(),
            max_in_flight_batches: default_max_in_flight(),
            request_timeout_secs: default_request_timeout(),
            retry: RetrySettings::default(),
        }
    }
}

impl SyncConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// `[sync.retry]` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySettings {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    #[serde(default = "default_true")]
    pub jitter: bool,
}

fn default_max_attempts() -> u32 {
    5
}
fn default_initial_delay_ms() -> u64 {
    200
}
fn default_max_delay_ms() -> u64 {
    30_000
}
fn default_multiplier() -> f64 {
    2.0
}
fn default_true() -> bool {
    true
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            multiplier: default_multiplier(),
            jitter: true,
        }
    }
}

// ---------------------------------------------------------------------------
// Loading & resolving
// ---------------------------------------------------------------------------

impl AppConfig {
    /// Load an [`AppConfig`] from a TOML file at the given path.
    ///
    /// This does **not** resolve environment variables -- call
    /// [`resolve_env_vars`](Self::resolve_env_vars) afterwards. A relative
    /// `schema.mapping_file` is rebased onto the config file's directory.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        info!(path = %path.display(), "loading configuration");

        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.display().to_string()));
        }

        let contents = std::fs::read_to_string(path)?;
        let mut config: AppConfig =
            toml::from_str(&contents).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        if config.schema.mapping_file.is_relative() {
            if let Some(parent) = path.parent() {
                config.schema.mapping_file = parent.join(&config.schema.mapping_file);
            }
        }

        debug!("configuration parsed successfully");
        Ok(config)
    }

    /// Resolve the store tokens from their environment variables.
    ///
    /// Missing variables log a warning but do not fail; some deployments
    /// front the stores with a proxy that needs no token.
    pub fn resolve_env_vars(&mut self) -> Result<(), ConfigError> {
        info!("resolving environment variable references in config");

        if let Some(ref env_name) = self.primary.token_env {
            self.primary.token = resolve_optional_env(env_name, "primary.token_env");
        }
        if let Some(ref env_name) = self.mirror.token_env {
            self.mirror.token = resolve_optional_env(env_name, "mirror.token_env");
        }

        debug!("environment variable resolution complete");
        Ok(())
    }

    /// Validate that all required fields are present and sane.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (field, store) in [("primary.base_url", &self.primary), ("mirror.base_url", &self.mirror)] {
            if store.base_url.is_empty() {
                return Err(ConfigError::InvalidValue {
                    field: field.into(),
                    detail: "store URL must not be empty".into(),
                });
            }
            if !store.base_url.starts_with("http://") && !store.base_url.starts_with("https://") {
                return Err(ConfigError::InvalidValue {
                    field: field.into(),
                    detail: "store URL must start with http:// or https://".into(),
                });
            }
            if store.requests_per_second == Some(0) {
                return Err(ConfigError::InvalidValue {
                    field: field.replace("base_url", "requests_per_second"),
                    detail: "rate limit must be > 0 (omit it to disable)".into(),
                });
            }
        }
        if self.schema.mapping_file.as_os_str().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "schema.mapping_file".into(),
                detail: "mapping file path must not be empty".into(),
            });
        }
        if self.daemon.poll_interval_secs == 0 {
            return Err(ConfigError::InvalidValue {
                field: "daemon.poll_interval_secs".into(),
                detail: "poll interval must be > 0".into(),
            });
        }
        if self.sync.concurrency == 0 {
            return Err(ConfigError::InvalidValue {
                field: "sync.concurrency".into(),
                detail: "concurrency must be > 0".into(),
            });
        }
        if self.sync.page_size == 0 {
            return Err(ConfigError::InvalidValue {
                field: "sync.page_size".into(),
                detail: "page size must be > 0".into(),
            });
        }
        if self.sync.max_in_flight_batches == 0 {
            return Err(ConfigError::InvalidValue {
                field: "sync.max_in_flight_batches".into(),
                detail: "in-flight batch limit must be > 0".into(),
            });
        }
        if self.sync.retry.max_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                field: "sync.retry.max_attempts".into(),
                detail: "at least one attempt is required".into(),
            });
        }
        if self.sync.retry.multiplier < 1.0 {
            return Err(ConfigError::InvalidValue {
                field: "sync.retry.multiplier".into(),
                detail: "backoff multiplier must be >= 1.0".into(),
            });
        }

        Ok(())
    }

    /// Convenience: load, resolve, and validate in one call.
    pub fn load_and_resolve<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.resolve_env_vars()?;
        config.validate()?;
        Ok(config)
    }
}

/// Try to read an environment variable by name. Returns `Some(value)` on
/// success; logs a warning and returns `None` if the variable is unset.
fn resolve_optional_env(env_name: &str, field: &str) -> Option<String> {
    match std::env::var(env_name) {
        Ok(val) if !val.is_empty() => {
            debug!(field, env_name, "resolved env var");
            Some(val)
        }
        Ok(_) => {
            warn!(field, env_name, "env var is set but empty");
            None
        }
        Err(_) => {
            warn!(field, env_name, "env var not set");
            None
        }
    }
}
