//! Shared data types for shellproxy.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use shellproxy_core::config::{AutoInvalidationConfig, InvalidationPatterns};
use shellproxy_core::PatternSpec;
use std::fmt;

// ---------------------------------------------------------------------------
// StreamKind
// ---------------------------------------------------------------------------

/// Which output stream a chunk of data came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamKind {
    Stdout,
    Stderr,
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamKind::Stdout => f.write_str("stdout"),
            StreamKind::Stderr => f.write_str("stderr"),
        }
    }
}

// ---------------------------------------------------------------------------
// CommandResult
// ---------------------------------------------------------------------------

/// Output captured for one command, whitespace-trimmed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandResult {
    pub command: String,
    pub stdout: String,
    pub stderr: String,
}

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

/// Lifecycle of a spawned process. Validity is tracked separately and only
/// ever goes from `true` to `false`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Lifecycle {
    Ready,
    ShuttingDown,
    Terminated,
}

// ---------------------------------------------------------------------------
// Status snapshots
// ---------------------------------------------------------------------------

/// Snapshot of a queued or finished command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandStatus {
    pub command: String,
    pub started_at: DateTime<Utc>,
    pub received_data: bool,
    pub finished: bool,
    pub finished_at: Option<DateTime<Utc>>,
    /// Only available once the command has finished.
    pub stdout: Option<String>,
    pub stderr: Option<String>,
}

/// Point-in-time snapshot of one `ProcessProxy`. Observability only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyStatus {
    pub status_time: DateTime<Utc>,
    pub pid: u32,
    pub process: String,
    pub arguments: Vec<String>,
    pub is_valid: bool,
    pub lifecycle: Lifecycle,
    pub created_at: DateTime<Utc>,
    pub blacklist: Vec<PatternSpec>,
    pub whitelist: Vec<PatternSpec>,
    pub invalidate_on: InvalidationPatterns,
    pub auto_invalidation: Option<AutoInvalidationConfig>,
    /// Commands written but not yet finished, oldest first.
    pub active_commands: Vec<CommandStatus>,
    /// Most recently finished commands, oldest first.
    pub command_history: Vec<CommandStatus>,
}

/// Counters reported by the pooling engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStats {
    /// Live resources, including ones being created or destroyed.
    pub size: usize,
    pub idle: usize,
    pub borrowed: usize,
    /// Callers currently blocked in `acquire`.
    pub waiting: usize,
    pub min: usize,
    pub max: usize,
    pub draining: bool,
}
