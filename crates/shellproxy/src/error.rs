//! Error types for the shellproxy crate.

use thiserror::Error;

/// All errors that can originate from proxy and pool operations.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// The child process could not be spawned.
    #[error("Process spawn error: {0}")]
    Spawn(String),

    /// Init commands failed; the process was discarded.
    #[error("Process {pid} failed to initialize: {reason}")]
    Init { pid: u32, reason: String },

    /// A command in the batch matched a blacklist pattern. Nothing was written.
    #[error("Command is blacklisted: it matches blacklist pattern {pattern}, command: {command}")]
    Blacklisted { command: String, pattern: String },

    /// A command in the batch matched no whitelist pattern. Nothing was written.
    #[error("Command is not whitelisted: it matches no whitelist pattern, command: {command}")]
    NotWhitelisted { command: String },

    /// The process's stdin has already been closed (the proxy is shutting down).
    #[error("Process {pid} no longer accepts input")]
    StdinClosed { pid: u32 },

    /// The process exited or its output stream failed before the command finished.
    #[error("Process {pid} exited before command completed: {command}")]
    ProcessExited { pid: u32, command: String },

    /// The pool is shutting down and accepts no new acquisitions.
    #[error("Pool is draining")]
    PoolDraining,

    /// Underlying I/O failure (write, flush, wait).
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Configuration could not be loaded.
    #[error(transparent)]
    Config(#[from] shellproxy_core::CoreError),
}

impl ProxyError {
    /// Short error code string, stable across releases.
    pub fn code(&self) -> &'static str {
        match self {
            ProxyError::Spawn(_) => "SPAWN_FAILED",
            ProxyError::Init { .. } => "INIT_FAILED",
            ProxyError::Blacklisted { .. } => "BLACKLISTED",
            ProxyError::NotWhitelisted { .. } => "NOT_WHITELISTED",
            ProxyError::StdinClosed { .. } => "STDIN_CLOSED",
            ProxyError::ProcessExited { .. } => "PROCESS_EXITED",
            ProxyError::PoolDraining => "POOL_DRAINING",
            ProxyError::IoError(_) => "IO_ERROR",
            ProxyError::Config(e) => e.code(),
        }
    }

    /// `true` for the policy rejections that happen before anything is written.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            ProxyError::Blacklisted { .. } | ProxyError::NotWhitelisted { .. }
        )
    }
}

/// Convenience alias used throughout this crate.
pub type Result<T> = std::result::Result<T, ProxyError>;
