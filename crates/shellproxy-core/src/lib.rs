//! shellproxy-core — configuration, pattern and logging capabilities shared by
//! the shellproxy crates.

pub mod config;
pub mod error;
pub mod log;
pub mod pattern;

pub use config::ShellProxyConfig;
pub use error::{CoreError, Result};
pub use log::{LogSink, Logger, MemorySink, Severity, TracingSink};
pub use pattern::{CompiledPattern, PatternSpec};
