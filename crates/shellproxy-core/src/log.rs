//! Log-sink capability.
//!
//! Components never reach for a process-wide logger. Each one is handed an
//! `Arc<dyn LogSink>` when it is built and tags every record with its own
//! origin (e.g. `ProcessProxy[4242]`). The default sink forwards to `tracing`.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Severity of a single log record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Debug,
    Info,
    Warn,
    Error,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Severity::Debug => "debug",
            Severity::Info => "info",
            Severity::Warn => "warn",
            Severity::Error => "error",
        };
        f.write_str(s)
    }
}

/// Destination for log records: `log(severity, origin, message)`.
pub trait LogSink: Send + Sync {
    fn log(&self, severity: Severity, origin: &str, message: &str);
}

/// Forwards every record to the `tracing` macros with an `origin` field.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl LogSink for TracingSink {
    fn log(&self, severity: Severity, origin: &str, message: &str) {
        match severity {
            Severity::Debug => debug!(origin, "{message}"),
            Severity::Info => info!(origin, "{message}"),
            Severity::Warn => warn!(origin, "{message}"),
            Severity::Error => error!(origin, "{message}"),
        }
    }
}

/// A sink bound to one origin, so call sites only pass the message.
#[derive(Clone)]
pub struct Logger {
    sink: Arc<dyn LogSink>,
    origin: String,
}

impl Logger {
    pub fn new(sink: Arc<dyn LogSink>, origin: impl Into<String>) -> Self {
        Self {
            sink,
            origin: origin.into(),
        }
    }

    /// Same sink, different origin.
    pub fn with_origin(&self, origin: impl Into<String>) -> Self {
        Self {
            sink: Arc::clone(&self.sink),
            origin: origin.into(),
        }
    }

    pub fn origin(&self) -> &str {
        &self.origin
    }

    pub fn log(&self, severity: Severity, message: &str) {
        self.sink.log(severity, &self.origin, message);
    }

    pub fn debug(&self, message: &str) {
        self.log(Severity::Debug, message);
    }

    pub fn info(&self, message: &str) {
        self.log(Severity::Info, message);
    }

    pub fn warn(&self, message: &str) {
        self.log(Severity::Warn, message);
    }

    pub fn error(&self, message: &str) {
        self.log(Severity::Error, message);
    }
}

impl fmt::Debug for Logger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Logger")
            .field("origin", &self.origin)
            .finish_non_exhaustive()
    }
}

/// Sink that keeps every record in memory. Handy for tests and for embedding
/// callers that want to surface recent log lines themselves.
#[derive(Debug, Default)]
pub struct MemorySink {
    records: std::sync::Mutex<Vec<LogRecord>>,
}

/// One captured log line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRecord {
    pub severity: Severity,
    pub origin: String,
    pub message: String,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything logged so far, oldest first.
    pub fn records(&self) -> Vec<LogRecord> {
        self.records.lock().expect("log records poisoned").clone()
    }
}

impl LogSink for MemorySink {
    fn log(&self, severity: Severity, origin: &str, message: &str) {
        self.records
            .lock()
            .expect("log records poisoned")
            .push(LogRecord {
                severity,
                origin: origin.to_string(),
                message: message.to_string(),
            });
    }
}
