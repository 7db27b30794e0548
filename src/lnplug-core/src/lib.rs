//! Shared configuration and logging for lnplug plugins.
//!
//! The protocol engine lives in the `lnplug` crate; this crate holds the
//! ambient pieces a plugin binary sets up before handing stdin/stdout to it.

pub mod config;
pub mod logging;

pub use config::{
    ConfigError, EngineConfig, LogLevel, LoggingConfig, ValidationError,
    DEFAULT_MAX_PARALLEL_REQS, DEFAULT_PENDING_NOTIFICATIONS,
};
pub use logging::{init_logging, HostLogLayer, LogEvent, LogSink, LoggingError, LoggingGuard};
