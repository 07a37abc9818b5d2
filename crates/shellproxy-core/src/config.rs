use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::pattern::PatternSpec;

pub const DEFAULT_NAME: &str = "shellproxy";
pub const DEFAULT_PROCESS_COMMAND: &str = "/bin/sh";
pub const DEFAULT_MIN: usize = 1;
pub const DEFAULT_MAX: usize = 1;
pub const DEFAULT_IDLE_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_REAP_INTERVAL_MS: u64 = 1_000;
pub const DEFAULT_CHECK_INTERVAL_MS: u64 = 30_000;
pub const ENV_PREFIX: &str = "SHELLPROXY_";

/// Top-level config (shellproxy.toml + SHELLPROXY_* env overrides).
///
/// The validate predicate and the log sink are runtime capabilities and are
/// handed to the pool builder instead.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShellProxyConfig {
    #[serde(default = "default_name")]
    pub name: String,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub process: ProcessConfig,
    /// Finished commands kept per process for status reporting (0 = none).
    #[serde(default)]
    pub retain_max_cmd_history: usize,
    /// Commands run once after spawn, bypassing the command policy.
    #[serde(default)]
    pub init_commands: Vec<String>,
    /// Commands run best-effort right before a process is torn down.
    #[serde(default)]
    pub pre_destroy_commands: Vec<String>,
    #[serde(default)]
    pub blacklist: Vec<PatternSpec>,
    #[serde(default)]
    pub whitelist: Vec<PatternSpec>,
    #[serde(default)]
    pub invalidate_on: InvalidationPatterns,
    #[serde(default)]
    pub auto_invalidation: Option<AutoInvalidationConfig>,
    /// Treat the sentinel on stderr as a completion marker too.
    ///
    /// The echo only ever writes the sentinel to stdout; turn this off when
    /// the monitored program may print the sentinel text on stderr.
    #[serde(default = "bool_true")]
    pub scan_stderr_for_sentinel: bool,
}

impl Default for ShellProxyConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            pool: PoolConfig::default(),
            process: ProcessConfig::default(),
            retain_max_cmd_history: 0,
            init_commands: Vec::new(),
            pre_destroy_commands: Vec::new(),
            blacklist: Vec::new(),
            whitelist: Vec::new(),
            invalidate_on: InvalidationPatterns::default(),
            auto_invalidation: None,
            scan_stderr_for_sentinel: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    #[serde(default = "default_min")]
    pub min: usize,
    #[serde(default = "default_max")]
    pub max: usize,
    /// How long a resource above `min` may sit idle before it is destroyed.
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,
    /// Cadence of the idle reaper.
    #[serde(default = "default_reap_interval_ms")]
    pub reap_interval_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min: DEFAULT_MIN,
            max: DEFAULT_MAX,
            idle_timeout_ms: DEFAULT_IDLE_TIMEOUT_MS,
            reap_interval_ms: DEFAULT_REAP_INTERVAL_MS,
        }
    }
}

/// How each pooled process is spawned.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessConfig {
    #[serde(default = "default_process_command")]
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    pub cwd: Option<String>,
    /// Replaces the child's whole environment when set.
    pub env: Option<HashMap<String, String>>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            command: default_process_command(),
            args: Vec::new(),
            cwd: None,
            env: None,
            uid: None,
            gid: None,
        }
    }
}

/// Output patterns that invalidate a process once a command finishes.
/// `any` patterns are checked against both streams.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InvalidationPatterns {
    #[serde(default)]
    pub any: Vec<PatternSpec>,
    #[serde(default)]
    pub stdout: Vec<PatternSpec>,
    #[serde(default)]
    pub stderr: Vec<PatternSpec>,
}

impl InvalidationPatterns {
    pub fn is_empty(&self) -> bool {
        self.any.is_empty() && self.stdout.is_empty() && self.stderr.is_empty()
    }
}

/// Periodic health probe run inside every pooled process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutoInvalidationConfig {
    #[serde(default = "default_check_interval_ms")]
    pub check_interval_ms: u64,
    /// Run in order as one batch on every tick.
    #[serde(default)]
    pub commands: Vec<ProbeConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeConfig {
    pub command: String,
    /// Optional: preparatory probes may have no rules at all.
    #[serde(default)]
    pub regexes: Option<ProbeRegexes>,
}

/// Probe rules keyed by the stream they inspect.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProbeRegexes {
    #[serde(default)]
    pub any: Vec<ProbeRule>,
    #[serde(default)]
    pub stdout: Vec<ProbeRule>,
    #[serde(default)]
    pub stderr: Vec<ProbeRule>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeRule {
    #[serde(flatten)]
    pub pattern: PatternSpec,
    pub invalid_on: InvalidOn,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum InvalidOn {
    Match,
    NoMatch,
}

fn bool_true() -> bool {
    true
}
fn default_name() -> String {
    DEFAULT_NAME.to_string()
}
fn default_process_command() -> String {
    DEFAULT_PROCESS_COMMAND.to_string()
}
fn default_min() -> usize {
    DEFAULT_MIN
}
fn default_max() -> usize {
    DEFAULT_MAX
}
fn default_idle_timeout_ms() -> u64 {
    DEFAULT_IDLE_TIMEOUT_MS
}
fn default_reap_interval_ms() -> u64 {
    DEFAULT_REAP_INTERVAL_MS
}
fn default_check_interval_ms() -> u64 {
    DEFAULT_CHECK_INTERVAL_MS
}

impl ShellProxyConfig {
    /// Load config from a TOML file with SHELLPROXY_* env var overrides.
    ///
    /// Nested keys use a double underscore, e.g. `SHELLPROXY_POOL__MAX=4`.
    /// A missing file is not an error; defaults fill the gaps.
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .map_err(|e| crate::error::CoreError::Config(e.to_string()))
    }

    /// Parse an in-memory TOML document (no env overrides).
    pub fn from_toml_str(toml: &str) -> crate::error::Result<Self> {
        Figment::from(Toml::string(toml))
            .extract()
            .map_err(|e| crate::error::CoreError::Config(e.to_string()))
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.shellproxy/shellproxy.toml", home)
}
