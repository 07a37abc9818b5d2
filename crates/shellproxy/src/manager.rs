//! `CommandProxyPool` — a pool of long-lived processes that callers run
//! command batches against.
//!
//! Each batch borrows one process exclusively, runs to completion and returns
//! the process before the caller sees the result. Processes that became
//! invalid are destroyed on return and replaced up to `min`.

use crate::{
    error::Result,
    pool::{Lease, ManageResource, Pool, PoolOptions},
    proxy::{ProcessProxy, ProxySettings},
    types::{CommandResult, PoolStats, ProxyStatus},
};
use async_trait::async_trait;
use dashmap::DashMap;
use shellproxy_core::{LogSink, Logger, ShellProxyConfig, TracingSink};
use std::{sync::Arc, time::Duration};

/// Custom health check run whenever a process is handed out or returned.
pub type ValidateFn = Arc<dyn Fn(&ProcessProxy) -> bool + Send + Sync>;

/// A process borrowed from a [`CommandProxyPool`]. Dropping it returns it.
pub type ProxyLease = Lease<ProxyFactory>;

// ---------------------------------------------------------------------------
// Factory (pool hooks)
// ---------------------------------------------------------------------------

/// Creates, validates and destroys `ProcessProxy` resources for the pool and
/// keeps the pid registry in sync.
pub struct ProxyFactory {
    settings: Arc<ProxySettings>,
    init_commands: Vec<String>,
    pre_destroy_commands: Vec<String>,
    validate: Option<ValidateFn>,
    registry: Arc<DashMap<u32, Arc<ProcessProxy>>>,
    sink: Arc<dyn LogSink>,
    logger: Logger,
}

#[async_trait]
impl ManageResource for ProxyFactory {
    type Resource = Arc<ProcessProxy>;

    /// Spawn, run init commands, and only then register the process.
    async fn create(&self) -> Result<Arc<ProcessProxy>> {
        let proxy = Arc::new(ProcessProxy::spawn(
            Arc::clone(&self.settings),
            Arc::clone(&self.sink),
        )?);

        if let Err(e) = proxy.initialize(&self.init_commands).await {
            self.logger.error(&format!("discarding process {}: {e}", proxy.pid()));
            let _ = proxy.shutdown(&[]).await;
            return Err(e);
        }

        self.registry.insert(proxy.pid(), Arc::clone(&proxy));
        self.logger.info(&format!("process {} ready", proxy.pid()));
        Ok(proxy)
    }

    fn validate(&self, proxy: &Arc<ProcessProxy>) -> bool {
        match &self.validate {
            Some(validate) => validate(proxy),
            None => proxy.is_valid(),
        }
    }

    /// Unregister first, then run pre-destroy commands and terminate.
    async fn destroy(&self, proxy: Arc<ProcessProxy>) {
        let pid = proxy.pid();
        self.registry.remove(&pid);
        if let Err(e) = proxy.shutdown(&self.pre_destroy_commands).await {
            self.logger
                .warn(&format!("pre-destroy for process {pid} failed: {e}"));
        }
        self.logger.info(&format!("process {pid} destroyed"));
    }
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Builds a [`CommandProxyPool`] from config plus the runtime capabilities
/// that cannot live in a config file.
pub struct CommandProxyPoolBuilder {
    config: ShellProxyConfig,
    validate: Option<ValidateFn>,
    sink: Option<Arc<dyn LogSink>>,
}

impl CommandProxyPoolBuilder {
    /// Replace the default validity check (`ProcessProxy::is_valid`).
    pub fn validate_with<F>(mut self, validate: F) -> Self
    where
        F: Fn(&ProcessProxy) -> bool + Send + Sync + 'static,
    {
        self.validate = Some(Arc::new(validate));
        self
    }

    /// Route every log record through `sink` (default: [`TracingSink`]).
    pub fn log_sink(mut self, sink: Arc<dyn LogSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Compile patterns, spawn `min` processes and start the reaper.
    pub async fn build(self) -> CommandProxyPool {
        let config = self.config;
        let sink: Arc<dyn LogSink> = self.sink.unwrap_or_else(|| Arc::new(TracingSink));
        let logger = Logger::new(Arc::clone(&sink), format!("CommandProxyPool[{}]", config.name));

        let settings = Arc::new(ProxySettings::compile(&config, &logger));
        let registry = Arc::new(DashMap::new());

        let factory = ProxyFactory {
            settings,
            init_commands: config.init_commands.clone(),
            pre_destroy_commands: config.pre_destroy_commands.clone(),
            validate: self.validate,
            registry: Arc::clone(&registry),
            sink,
            logger: logger.clone(),
        };

        let options = PoolOptions {
            min: config.pool.min,
            max: config.pool.max,
            idle_timeout: Duration::from_millis(config.pool.idle_timeout_ms),
            reap_interval: Duration::from_millis(config.pool.reap_interval_ms),
        };
        let pool = Pool::new(factory, options, logger.with_origin("Pool")).await;

        logger.info(&format!(
            "started with min={} max={}",
            options.min, options.max
        ));
        CommandProxyPool {
            name: config.name,
            pool,
            registry,
            logger,
        }
    }
}

// ---------------------------------------------------------------------------
// CommandProxyPool
// ---------------------------------------------------------------------------

/// Pool of `ProcessProxy` instances.
pub struct CommandProxyPool {
    name: String,
    pool: Pool<ProxyFactory>,
    registry: Arc<DashMap<u32, Arc<ProcessProxy>>>,
    logger: Logger,
}

impl std::fmt::Debug for CommandProxyPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandProxyPool")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl CommandProxyPool {
    pub fn builder(config: ShellProxyConfig) -> CommandProxyPoolBuilder {
        CommandProxyPoolBuilder {
            config,
            validate: None,
            sink: None,
        }
    }

    /// Build with the default validity check and the tracing sink.
    pub async fn new(config: ShellProxyConfig) -> Self {
        Self::builder(config).build().await
    }

    /// Load config from `path` (default `~/.shellproxy/shellproxy.toml`) plus
    /// `SHELLPROXY_*` overrides, then build with the defaults.
    pub async fn load(path: Option<&str>) -> Result<Self> {
        let config = ShellProxyConfig::load(path)?;
        Ok(Self::new(config).await)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    // -----------------------------------------------------------------------
    // Borrowing
    // -----------------------------------------------------------------------

    /// Borrow a process for exclusive use. Waits if every process is busy
    /// and the pool is at `max`.
    pub async fn acquire(&self) -> Result<ProxyLease> {
        self.pool.acquire().await
    }

    /// Return a process. Invalid processes are destroyed and replaced.
    pub fn release(&self, lease: ProxyLease) {
        self.pool.release(lease);
    }

    // -----------------------------------------------------------------------
    // Execution
    // -----------------------------------------------------------------------

    /// Run one batch on a borrowed process. The process is returned to the
    /// pool before the result (or error) is handed back.
    pub async fn execute_commands<S: AsRef<str>>(&self, commands: &[S]) -> Result<Vec<CommandResult>> {
        let lease = self.pool.acquire().await?;
        let result = lease.execute_commands(commands).await;
        let pid = lease.pid();
        self.pool.release(lease);

        if let Err(e) = &result {
            self.logger
                .debug(&format!("batch on process {pid} failed: {} ({e})", e.code()));
        }
        result
    }

    pub async fn execute_command(&self, command: &str) -> Result<CommandResult> {
        let lease = self.pool.acquire().await?;
        let result = lease.execute_command(command).await;
        self.pool.release(lease);
        result
    }

    // -----------------------------------------------------------------------
    // Lifecycle & status
    // -----------------------------------------------------------------------

    /// Refuse new work, wait for every borrowed process to come back, then
    /// destroy all processes.
    pub async fn shutdown(&self) {
        self.logger.info("shutting down");
        self.pool.shutdown().await;
        self.logger.info("shut down");
    }

    /// Status of every registered process, oldest first.
    pub fn get_status(&self) -> Vec<ProxyStatus> {
        let mut statuses: Vec<ProxyStatus> = self
            .registry
            .iter()
            .map(|entry| entry.value().status())
            .collect();
        statuses.sort_by_key(|s| (s.created_at, s.pid));
        statuses
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    /// The registered process with this pid, if any.
    pub fn process(&self, pid: u32) -> Option<Arc<ProcessProxy>> {
        self.registry.get(&pid).map(|entry| Arc::clone(entry.value()))
    }
}
