//! Configuration management for the store.

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Which backend the store should run on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackendKind {
    /// Probe the environment; use the structured store when it is usable
    #[default]
    Auto,
    /// Always use the structured store
    Structured,
    /// Always use the flat fallback store
    Flat,
}

impl FromStr for BackendKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(BackendKind::Auto),
            "structured" => Ok(BackendKind::Structured),
            "flat" => Ok(BackendKind::Flat),
            other => Err(ConfigError::InvalidBackend(other.to_string())),
        }
    }
}

/// Store configuration, usually loaded from environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    /// Directory holding the structured database. `None` keeps it in memory.
    pub database_dir: Option<PathBuf>,
    /// Database name, also the file stem of the database file
    pub database_name: String,
    pub backend: BackendKind,
    /// Directory for flat fallback blobs. `None` keeps them in memory.
    pub flat_dir: Option<PathBuf>,
    /// Prefix for every key in the flat key space
    pub namespace: String,
    /// How long to wait on a locked database before giving up
    pub busy_timeout: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            database_dir: Some(PathBuf::from("data")),
            database_name: "farmlog".to_string(),
            backend: BackendKind::Auto,
            flat_dir: None,
            namespace: "farmlog".to_string(),
            busy_timeout: Duration::from_millis(5000),
        }
    }
}

impl StoreConfig {
    /// Load configuration from environment variables (and `.env`, if present).
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_vars(|name| env::var(name).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_vars<F>(var: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let database_dir = match var("FARMLOG_DATABASE_DIR") {
            Some(dir) if dir == ":memory:" => None,
            Some(dir) => Some(PathBuf::from(dir)),
            None => defaults.database_dir,
        };

        let database_name = var("FARMLOG_DATABASE_NAME").unwrap_or(defaults.database_name);
        if database_name.is_empty() {
            return Err(ConfigError::EmptyDatabaseName);
        }

        let backend = match var("FARMLOG_BACKEND") {
            Some(kind) => kind.parse()?,
            None => defaults.backend,
        };

        let flat_dir = var("FARMLOG_FLAT_DIR").map(PathBuf::from);

        let namespace = var("FARMLOG_NAMESPACE").unwrap_or(defaults.namespace);

        let busy_timeout = match var("FARMLOG_BUSY_TIMEOUT_MS") {
            Some(ms) => Duration::from_millis(
                ms.parse()
                    .map_err(|_| ConfigError::InvalidBusyTimeout(ms.clone()))?,
            ),
            None => defaults.busy_timeout,
        };

        Ok(Self {
            database_dir,
            database_name,
            backend,
            flat_dir,
            namespace,
            busy_timeout,
        })
    }

    /// A structured store kept entirely in memory.
    pub fn in_memory() -> Self {
        Self {
            database_dir: None,
            backend: BackendKind::Structured,
            ..Self::default()
        }
    }

    pub fn with_database_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.database_dir = Some(dir.into());
        self
    }

    pub fn with_backend(mut self, backend: BackendKind) -> Self {
        self.backend = backend;
        self
    }

    pub fn with_flat_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.flat_dir = Some(dir.into());
        self
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid FARMLOG_BACKEND value: {0} (expected auto, structured or flat)")]
    InvalidBackend(String),

    #[error("Invalid FARMLOG_BUSY_TIMEOUT_MS value: {0}")]
    InvalidBusyTimeout(String),

    #[error("FARMLOG_DATABASE_NAME must not be empty")]
    EmptyDatabaseName,
}
