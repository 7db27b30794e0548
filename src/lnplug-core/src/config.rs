use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default bound on concurrently executing method handlers.
pub const DEFAULT_MAX_PARALLEL_REQS: usize = 512;

/// Default capacity of the buffer holding notifications received before `init`.
pub const DEFAULT_PENDING_NOTIFICATIONS: usize = 1024;

/// Engine settings chosen by the plugin author.
///
/// The struct is deserializable so an application can embed it in its own
/// configuration; the engine itself never reads configuration files.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EngineConfig {
    #[serde(default = "default_max_parallel_reqs", rename = "max-parallel-reqs")]
    pub max_parallel_reqs: usize,
    #[serde(default = "default_pending_notifications")]
    pub pending_notifications: usize,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_parallel_reqs: default_max_parallel_reqs(),
            pending_notifications: default_pending_notifications(),
            logging: LoggingConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: LogLevel,
    /// Write human-readable diagnostics to stderr.
    #[serde(default = "default_enabled")]
    pub stderr: bool,
    /// Forward tracing events to the host as `log` notifications.
    #[serde(default = "default_enabled")]
    pub forward_to_host: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            stderr: default_enabled(),
            forward_to_host: default_enabled(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_filter_directive(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }

    /// Level name understood by the host's `log` notification.
    pub fn as_host_level(&self) -> &'static str {
        match self {
            LogLevel::Trace | LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "unusual",
            LogLevel::Error => "broken",
        }
    }
}

impl From<tracing::Level> for LogLevel {
    fn from(level: tracing::Level) -> Self {
        match level {
            tracing::Level::TRACE => LogLevel::Trace,
            tracing::Level::DEBUG => LogLevel::Debug,
            tracing::Level::INFO => LogLevel::Info,
            tracing::Level::WARN => LogLevel::Warn,
            _ => LogLevel::Error,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to parse engine config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("engine config validation failed: {0}")]
    Validation(#[from] ValidationError),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("max-parallel-reqs must be at least 1")]
    ZeroParallelism,
    #[error("pending notification capacity must be at least 1")]
    ZeroPendingCapacity,
}

impl EngineConfig {
    /// Build a config from an already-parsed JSON value, applying defaults
    /// for missing fields and validating the result.
    pub fn from_value(value: serde_json::Value) -> Result<Self, ConfigError> {
        let config: EngineConfig = serde_json::from_value(value)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.max_parallel_reqs == 0 {
            return Err(ValidationError::ZeroParallelism);
        }
        if self.pending_notifications == 0 {
            return Err(ValidationError::ZeroPendingCapacity);
        }
        Ok(())
    }
}

fn default_max_parallel_reqs() -> usize {
    DEFAULT_MAX_PARALLEL_REQS
}

fn default_pending_notifications() -> usize {
    DEFAULT_PENDING_NOTIFICATIONS
}

fn default_log_level() -> LogLevel {
    LogLevel::Info
}

fn default_enabled() -> bool {
    true
}
