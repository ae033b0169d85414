//! Configuration management for persisters and the `stowage` binary.

use std::env;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use stowage_engine::DatabasePersisterConfig;

use crate::error::PersistError;

/// Default poll period for auto-load when the driver has no change feed.
pub const DEFAULT_AUTOLOAD_INTERVAL: Duration = Duration::from_secs(1);

/// Default capacity of a persister's operation queue.
pub const DEFAULT_QUEUE_CAPACITY: usize = 64;

/// Callback for errors raised by background auto-load and auto-save.
pub type ErrorHook = Arc<dyn Fn(&PersistError) + Send + Sync>;

/// Runtime options of a persister.
#[derive(Clone)]
pub struct PersisterOptions {
    /// Poll period for auto-load without native change notifications.
    pub autoload_interval: Duration,
    /// Quiet period before auto-save writes. Zero saves on the next tick.
    pub autosave_debounce: Duration,
    /// Queued load/save operations before callers wait.
    pub queue_capacity: usize,
    /// Called for every error auto-load or auto-save hits.
    pub on_error: Option<ErrorHook>,
}

impl Default for PersisterOptions {
    fn default() -> Self {
        Self {
            autoload_interval: DEFAULT_AUTOLOAD_INTERVAL,
            autosave_debounce: Duration::ZERO,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            on_error: None,
        }
    }
}

impl PersisterOptions {
    pub fn with_autoload_interval(mut self, interval: Duration) -> Self {
        self.autoload_interval = interval;
        self
    }

    pub fn with_autosave_debounce(mut self, debounce: Duration) -> Self {
        self.autosave_debounce = debounce;
        self
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity.max(1);
        self
    }

    pub fn on_error(mut self, hook: impl Fn(&PersistError) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(hook));
        self
    }
}

impl fmt::Debug for PersisterOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PersisterOptions")
            .field("autoload_interval", &self.autoload_interval)
            .field("autosave_debounce", &self.autosave_debounce)
            .field("queue_capacity", &self.queue_capacity)
            .field("on_error", &self.on_error.is_some())
            .finish()
    }
}

/// Binary configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// `postgres://...` or `sqlite:...`
    pub database_url: String,
    /// Persister configuration: a store table name or a JSON document.
    pub persister: DatabasePersisterConfig,
    /// Auto-load poll period.
    pub poll_interval: Duration,
    /// PostgreSQL channel to listen on for change notifications.
    pub notify_channel: Option<String>,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = env::var("DATABASE_URL").map_err(|_| ConfigError::MissingDatabaseUrl)?;

        let persister = match env::var("STOWAGE_CONFIG") {
            Ok(raw) => parse_persister_config(&raw)?,
            Err(_) => DatabasePersisterConfig::json(),
        };

        let poll_interval = match env::var("STOWAGE_POLL_MS") {
            Ok(raw) => Duration::from_millis(raw.parse().map_err(|_| ConfigError::InvalidPollInterval)?),
            Err(_) => DEFAULT_AUTOLOAD_INTERVAL,
        };

        let notify_channel = env::var("STOWAGE_NOTIFY_CHANNEL").ok().filter(|c| !c.is_empty());

        Ok(Self {
            database_url,
            persister,
            poll_interval,
            notify_channel,
        })
    }

    pub fn persister_options(&self) -> PersisterOptions {
        PersisterOptions::default().with_autoload_interval(self.poll_interval)
    }
}

/// A value starting with `{` is a JSON configuration document; anything
/// else names the store table for JSON mode.
fn parse_persister_config(raw: &str) -> Result<DatabasePersisterConfig, ConfigError> {
    let raw = raw.trim();
    if raw.starts_with('{') {
        DatabasePersisterConfig::from_json_str(raw).map_err(|e| ConfigError::InvalidPersisterConfig(e.to_string()))
    } else {
        Ok(DatabasePersisterConfig::from(raw))
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("DATABASE_URL environment variable is required")]
    MissingDatabaseUrl,

    #[error("Invalid STOWAGE_CONFIG: {0}")]
    InvalidPersisterConfig(String),

    #[error("Invalid STOWAGE_POLL_MS value")]
    InvalidPollInterval,
}
