//! shellproxy — pooled, stateful command proxies over long-lived processes.
//!
//! A `ProcessProxy` keeps one process (a shell by default) alive and runs
//! command batches through its stdin, telling commands apart in the output by
//! a sentinel the process echoes after each one. A `CommandProxyPool` keeps a
//! bounded set of those processes and lends one out per batch.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use shellproxy::CommandProxyPool;
//! use shellproxy_core::ShellProxyConfig;
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = ShellProxyConfig::load(None).unwrap();
//!     let pool = CommandProxyPool::new(config).await;
//!
//!     // Both commands run in the same shell, so the variable survives.
//!     let results = pool
//!         .execute_commands(&["export GREETING=hello", "echo $GREETING"])
//!         .await
//!         .unwrap();
//!     println!("{}", results[1].stdout);
//!
//!     pool.shutdown().await;
//! }
//! ```

pub mod command;
pub mod demux;
pub mod error;
pub mod manager;
pub mod policy;
pub mod pool;
pub mod probe;
pub mod proxy;
pub mod types;

pub use error::{ProxyError, Result};
pub use manager::{CommandProxyPool, CommandProxyPoolBuilder, ProxyLease, ValidateFn};
pub use proxy::{ProcessProxy, ProxySettings};
pub use types::{CommandResult, CommandStatus, Lifecycle, PoolStats, ProxyStatus, StreamKind};
