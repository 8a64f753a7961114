//! Tunables for the watch runtime.
//!
//! Settings come from (in increasing priority) built-in defaults, a TOML file, and `TREEWATCH_*`
//! environment variables. Unknown keys are rejected so typos do not silently fall back to
//! defaults.
//!
//! ```toml
//! close_grace_ms = 100
//! handler_threads = 4
//! registration_threads = 2
//! raw_queue_capacity = 4096
//! default_overflow = "diff"
//! prefer_native_recursion = true
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::executor::default_thread_count;
use crate::scope::Approximation;

pub const ENV_RAW_QUEUE_CAPACITY: &str = "TREEWATCH_RAW_QUEUE_CAPACITY";
pub const ENV_CLOSE_GRACE_MS: &str = "TREEWATCH_CLOSE_GRACE_MS";
pub const ENV_HANDLER_THREADS: &str = "TREEWATCH_HANDLER_THREADS";
pub const ENV_REGISTRATION_THREADS: &str = "TREEWATCH_REGISTRATION_THREADS";

const DEFAULT_RAW_QUEUE_CAPACITY: usize = 4096;
// Avoid pathological configs that attempt to allocate enormous bounded channels.
const MAX_QUEUE_CAPACITY: usize = 1_000_000;
const MAX_THREADS: usize = 256;
const MAX_CLOSE_GRACE_MS: u64 = 60_000;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse toml config: {0}")]
    Toml(String),
    #[error("invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

impl From<toml::de::Error> for ConfigError {
    fn from(err: toml::de::Error) -> Self {
        // The default `Display` embeds a source snippet; keep just the message.
        ConfigError::Toml(err.message().to_owned())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WatchSettings {
    /// Delay between the last unsubscribe of a native registration and closing it.
    pub close_grace_ms: u64,
    /// Worker threads of the default handler pool.
    pub handler_threads: usize,
    /// Worker threads used to register native watches.
    pub registration_threads: usize,
    /// Capacity of the queue between the OS callback and the drain thread. When it overflows,
    /// every registration receives an overflow event.
    pub raw_queue_capacity: usize,
    /// Overflow approximation used when a watch does not choose one.
    pub default_overflow: Approximation,
    /// Use the backend's native recursive watching when it has one.
    pub prefer_native_recursion: bool,
}

impl Default for WatchSettings {
    fn default() -> Self {
        Self {
            close_grace_ms: crate::bundle::DEFAULT_CLOSE_GRACE.as_millis() as u64,
            handler_threads: default_thread_count(),
            registration_threads: default_thread_count(),
            raw_queue_capacity: DEFAULT_RAW_QUEUE_CAPACITY,
            default_overflow: Approximation::default(),
            prefer_native_recursion: true,
        }
    }
}

impl WatchSettings {
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::load_from_str(&text)
    }

    pub fn load_from_str(text: &str) -> Result<Self, ConfigError> {
        let settings: WatchSettings = toml::from_str(text)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Applies `TREEWATCH_*` environment overrides on top of `self`.
    pub fn with_env_overrides(mut self) -> Result<Self, ConfigError> {
        if let Some(capacity) = usize_from_env(ENV_RAW_QUEUE_CAPACITY, MAX_QUEUE_CAPACITY)? {
            self.raw_queue_capacity = capacity;
        }
        if let Some(threads) = usize_from_env(ENV_HANDLER_THREADS, MAX_THREADS)? {
            self.handler_threads = threads;
        }
        if let Some(threads) = usize_from_env(ENV_REGISTRATION_THREADS, MAX_THREADS)? {
            self.registration_threads = threads;
        }
        if let Some(grace) = usize_from_env(ENV_CLOSE_GRACE_MS, MAX_CLOSE_GRACE_MS as usize)? {
            self.close_grace_ms = grace as u64;
        }
        Ok(self)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |key: &str, message: String| ConfigError::InvalidValue {
            key: key.to_owned(),
            message,
        };
        if self.raw_queue_capacity == 0 || self.raw_queue_capacity > MAX_QUEUE_CAPACITY {
            return Err(invalid(
                "raw_queue_capacity",
                format!("must be between 1 and {MAX_QUEUE_CAPACITY}"),
            ));
        }
        if self.handler_threads == 0 || self.handler_threads > MAX_THREADS {
            return Err(invalid(
                "handler_threads",
                format!("must be between 1 and {MAX_THREADS}"),
            ));
        }
        if self.registration_threads == 0 || self.registration_threads > MAX_THREADS {
            return Err(invalid(
                "registration_threads",
                format!("must be between 1 and {MAX_THREADS}"),
            ));
        }
        if self.close_grace_ms > MAX_CLOSE_GRACE_MS {
            return Err(invalid(
                "close_grace_ms",
                format!("must be at most {MAX_CLOSE_GRACE_MS}"),
            ));
        }
        Ok(())
    }

    pub fn close_grace(&self) -> Duration {
        Duration::from_millis(self.close_grace_ms)
    }
}

/// Reads a positive integer from `var`. Unset, empty and `0` mean "use the default"; larger
/// values are clamped to `max`.
fn usize_from_env(var: &str, max: usize) -> Result<Option<usize>, ConfigError> {
    let raw = match std::env::var(var) {
        Ok(value) => value,
        Err(std::env::VarError::NotPresent) => return Ok(None),
        Err(err) => {
            return Err(ConfigError::InvalidValue {
                key: var.to_owned(),
                message: err.to_string(),
            })
        }
    };

    let raw = raw.trim();
    if raw.is_empty() || raw == "0" {
        return Ok(None);
    }

    let parsed = raw.parse::<usize>().map_err(|err| ConfigError::InvalidValue {
        key: var.to_owned(),
        message: format!("{raw:?}: {err}"),
    })?;
    Ok(Some(parsed.clamp(1, max)))
}
