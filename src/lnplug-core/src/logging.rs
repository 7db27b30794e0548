use crate::config::{LogLevel, LoggingConfig};
use serde::Serialize;
use std::fmt::Write as _;
use thiserror::Error;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::{Context, Layer, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// One host log line. Serializes to the `params` of a `log` notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEvent {
    pub level: LogLevel,
    pub message: String,
}

#[derive(Serialize)]
struct WireLogEvent<'a> {
    level: &'static str,
    message: &'a str,
}

impl LogEvent {
    pub fn new(level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            level,
            message: message.into(),
        }
    }

    /// Split a message into one event per physical line, all sharing `level`.
    pub fn split(level: LogLevel, message: &str) -> Vec<LogEvent> {
        let lines: Vec<LogEvent> = message
            .lines()
            .map(|line| LogEvent::new(level, line))
            .collect();
        if lines.is_empty() {
            vec![LogEvent::new(level, "")]
        } else {
            lines
        }
    }

    pub fn to_params(&self) -> serde_json::Value {
        serde_json::to_value(WireLogEvent {
            level: self.level.as_host_level(),
            message: &self.message,
        })
        .unwrap_or(serde_json::Value::Null)
    }
}

/// Sending half of the host log channel. Cheap to clone.
#[derive(Debug, Clone)]
pub struct LogSink {
    tx: UnboundedSender<LogEvent>,
}

impl LogSink {
    pub fn channel() -> (LogSink, UnboundedReceiver<LogEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (LogSink { tx }, rx)
    }

    /// Queue a (possibly multi-line) message. Returns false once the
    /// receiving side is gone.
    pub fn send(&self, level: LogLevel, message: &str) -> bool {
        LogEvent::split(level, message)
            .into_iter()
            .all(|event| self.tx.send(event).is_ok())
    }
}

/// A `tracing` layer that forwards every event to the host.
pub struct HostLogLayer {
    sink: LogSink,
}

impl HostLogLayer {
    pub fn new(sink: LogSink) -> Self {
        Self { sink }
    }
}

impl<S: Subscriber> Layer<S> for HostLogLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);
        let level = LogLevel::from(*event.metadata().level());
        self.sink.send(level, &visitor.finish());
    }
}

#[derive(Default)]
struct MessageVisitor {
    message: String,
    fields: String,
}

impl MessageVisitor {
    fn finish(self) -> String {
        if self.fields.is_empty() {
            self.message
        } else if self.message.is_empty() {
            self.fields
        } else {
            format!("{} {}", self.message, self.fields)
        }
    }
}

impl Visit for MessageVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message.push_str(value);
        } else {
            self.record_debug(field, &value);
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            let _ = write!(self.message, "{value:?}");
        } else {
            if !self.fields.is_empty() {
                self.fields.push(' ');
            }
            let _ = write!(self.fields, "{}={value:?}", field.name());
        }
    }
}

pub struct LoggingGuard {
    _stderr_guard: Option<WorkerGuard>,
}

/// Install the process-wide subscriber.
///
/// Diagnostics go to stderr only: stdout carries the protocol stream.
pub fn init_logging(
    config: &LoggingConfig,
    host: Option<LogSink>,
) -> Result<LoggingGuard, LoggingError> {
    let env_filter = EnvFilter::try_new(config.level.as_filter_directive()).map_err(|source| {
        LoggingError::ParseLevel {
            level: config.level.as_filter_directive().to_string(),
            source,
        }
    })?;

    let (stderr_layer, stderr_guard) = if config.stderr {
        let (writer, guard) = tracing_appender::non_blocking(std::io::stderr());
        let layer = fmt::layer()
            .with_target(false)
            .with_ansi(false)
            .with_writer(writer);
        (Some(layer), Some(guard))
    } else {
        (None, None)
    };

    let host_layer = host
        .filter(|_| config.forward_to_host)
        .map(HostLogLayer::new);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(stderr_layer)
        .with(host_layer)
        .try_init()
        .map_err(|err| LoggingError::SubscriberInstall(Box::new(err)))?;

    Ok(LoggingGuard {
        _stderr_guard: stderr_guard,
    })
}

#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("failed to parse log level {level}: {source}")]
    ParseLevel {
        level: String,
        source: tracing_subscriber::filter::ParseError,
    },
    #[error("failed to install tracing subscriber: {0}")]
    SubscriberInstall(Box<dyn std::error::Error + Send + Sync>),
}
