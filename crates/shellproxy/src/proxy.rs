//! `ProcessProxy`: one long-lived child process driven over stdin/stdout/stderr.
//!
//! Commands are written as `<command>\n` plus the sentinel echo line and
//! completed by the [`Demultiplexer`] as output arrives. Two reader tasks feed
//! it; both hold only a `Weak` reference, so dropping the last `ProcessProxy`
//! drops the child (which is spawned with `kill_on_drop`).
//!
//! Locking:
//! - `stdin` (async mutex) is held for a whole batch, so the enqueue+write
//!   pairs of two batches never interleave.
//! - `state` (sync mutex) guards the queue, history and validity. Readers hold
//!   it while demultiplexing and running the finished-command hook, so anyone
//!   who has received a result observes the validity that result produced.

use crate::command::Command;
use crate::demux::{Demultiplexer, SENTINEL_ECHO};
use crate::error::{ProxyError, Result};
use crate::policy::{CommandPolicy, OutputInvalidation};
use crate::probe::ProbeSchedule;
use crate::types::{CommandResult, CommandStatus, Lifecycle, ProxyStatus, StreamKind};
use chrono::{DateTime, Utc};
use futures_util::future::try_join_all;
use shellproxy_core::config::{ProcessConfig, ShellProxyConfig};
use shellproxy_core::{LogSink, Logger};
use std::collections::VecDeque;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin};
use tokio::sync::{oneshot, watch, Mutex as AsyncMutex};
use tokio::time::MissedTickBehavior;

/// Read buffer per stream.
const READ_BUF_SIZE: usize = 8192;

/// How long a process gets between SIGTERM and SIGKILL.
const KILL_GRACE: Duration = Duration::from_secs(2);

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

/// Everything a proxy needs that is shared by every process in a pool:
/// spawn options plus the compiled pattern sets.
#[derive(Debug, Clone)]
pub struct ProxySettings {
    pub process: ProcessConfig,
    pub retain_history: usize,
    pub scan_stderr_for_sentinel: bool,
    pub policy: CommandPolicy,
    pub invalidation: OutputInvalidation,
    pub probes: Option<ProbeSchedule>,
}

impl ProxySettings {
    /// Compile every pattern in `config`. Bad patterns are logged and dropped.
    pub fn compile(config: &ShellProxyConfig, logger: &Logger) -> Self {
        Self {
            process: config.process.clone(),
            retain_history: config.retain_max_cmd_history,
            scan_stderr_for_sentinel: config.scan_stderr_for_sentinel,
            policy: CommandPolicy::compile(&config.blacklist, &config.whitelist, logger),
            invalidation: OutputInvalidation::compile(&config.invalidate_on, logger),
            probes: config
                .auto_invalidation
                .as_ref()
                .map(|auto| ProbeSchedule::compile(auto, logger)),
        }
    }
}

// ---------------------------------------------------------------------------
// ProcessProxy
// ---------------------------------------------------------------------------

pub struct ProcessProxy {
    inner: Arc<Inner>,
}

struct Inner {
    pid: u32,
    created_at: DateTime<Utc>,
    settings: Arc<ProxySettings>,
    logger: Logger,
    state: Mutex<State>,
    stdin: AsyncMutex<Option<ChildStdin>>,
    child: AsyncMutex<Option<Child>>,
    probe_stop: watch::Sender<bool>,
    probe_started: AtomicBool,
}

struct State {
    demux: Demultiplexer,
    history: VecDeque<Command>,
    valid: bool,
    lifecycle: Lifecycle,
    /// Set once stdout reached EOF; nothing can complete after that.
    closed: bool,
}

impl ProcessProxy {
    /// Spawn the configured process and start its stream readers.
    ///
    /// Must be called from within a tokio runtime. The auto-invalidation
    /// probe does not start until [`ProcessProxy::initialize`].
    pub fn spawn(settings: Arc<ProxySettings>, sink: Arc<dyn LogSink>) -> Result<Self> {
        let process = &settings.process;
        let mut cmd = tokio::process::Command::new(&process.command);
        cmd.args(&process.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &process.cwd {
            cmd.current_dir(cwd);
        }
        if let Some(env) = &process.env {
            cmd.env_clear().envs(env);
        }
        #[cfg(unix)]
        {
            if let Some(uid) = process.uid {
                cmd.uid(uid);
            }
            if let Some(gid) = process.gid {
                cmd.gid(gid);
            }
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| ProxyError::Spawn(format!("{}: {e}", process.command)))?;
        let pid = child
            .id()
            .ok_or_else(|| ProxyError::Spawn(format!("{}: exited immediately", process.command)))?;
        let (stdin, stdout, stderr) = match (child.stdin.take(), child.stdout.take(), child.stderr.take()) {
            (Some(stdin), Some(stdout), Some(stderr)) => (stdin, stdout, stderr),
            _ => return Err(ProxyError::Spawn(format!("{}: stdio not piped", process.command))),
        };

        let logger = Logger::new(sink, format!("ProcessProxy[{pid}]"));
        let (probe_stop, _) = watch::channel(false);

        let inner = Arc::new(Inner {
            pid,
            created_at: Utc::now(),
            state: Mutex::new(State {
                demux: Demultiplexer::new(settings.scan_stderr_for_sentinel),
                history: VecDeque::new(),
                valid: true,
                lifecycle: Lifecycle::Ready,
                closed: false,
            }),
            settings,
            logger,
            stdin: AsyncMutex::new(Some(stdin)),
            child: AsyncMutex::new(Some(child)),
            probe_stop,
            probe_started: AtomicBool::new(false),
        });

        spawn_reader(Arc::downgrade(&inner), StreamKind::Stdout, stdout);
        spawn_reader(Arc::downgrade(&inner), StreamKind::Stderr, stderr);

        inner.logger.info(&format!(
            "spawned {} {}",
            inner.settings.process.command,
            inner.settings.process.args.join(" ")
        ));
        Ok(Self { inner })
    }

    /// Run trusted init commands (no policy check), then start the
    /// auto-invalidation probe if one is configured.
    pub async fn initialize(&self, init_commands: &[String]) -> Result<Vec<CommandResult>> {
        let results = if init_commands.is_empty() {
            Vec::new()
        } else {
            self.inner
                .dispatch(init_commands)
                .await
                .map_err(|e| ProxyError::Init {
                    pid: self.inner.pid,
                    reason: e.to_string(),
                })?
        };
        self.start_probe();
        Ok(results)
    }

    /// Check the batch against the command policy, then run it.
    ///
    /// Results are in submission order. A policy rejection writes nothing.
    pub async fn execute_commands<S: AsRef<str>>(&self, commands: &[S]) -> Result<Vec<CommandResult>> {
        self.inner
            .settings
            .policy
            .check_batch(commands, &self.inner.logger)?;
        self.inner.dispatch(commands).await
    }

    pub async fn execute_command(&self, command: &str) -> Result<CommandResult> {
        let mut results = self.execute_commands(&[command]).await?;
        results.pop().ok_or_else(|| ProxyError::ProcessExited {
            pid: self.inner.pid,
            command: command.to_string(),
        })
    }

    /// Stop the probe, run pre-destroy commands best-effort, then terminate
    /// the process. The process is always terminated; the returned value is
    /// the outcome of the pre-destroy batch.
    pub async fn shutdown(&self, pre_destroy_commands: &[String]) -> Result<Vec<CommandResult>> {
        {
            let mut state = self.inner.lock_state();
            if state.lifecycle != Lifecycle::Ready {
                return Ok(Vec::new());
            }
            state.lifecycle = Lifecycle::ShuttingDown;
        }
        let _ = self.inner.probe_stop.send(true);

        let outcome = if pre_destroy_commands.is_empty() {
            Ok(Vec::new())
        } else {
            self.inner.dispatch(pre_destroy_commands).await
        };
        if let Err(e) = &outcome {
            self.inner.logger.warn(&format!("pre-destroy commands failed: {e}"));
        }

        self.inner.stdin.lock().await.take();
        self.inner.terminate().await;

        {
            let mut state = self.inner.lock_state();
            state.valid = false;
            state.lifecycle = Lifecycle::Terminated;
        }
        self.inner.logger.info("terminated");
        outcome
    }

    pub fn pid(&self) -> u32 {
        self.inner.pid
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.inner.created_at
    }

    /// `false` once any invalidation trigger fired; never flips back.
    pub fn is_valid(&self) -> bool {
        self.inner.lock_state().valid
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.inner.lock_state().lifecycle
    }

    /// Mark the process invalid. It will be destroyed on its next release.
    pub fn invalidate(&self, reason: &str) {
        self.inner.invalidate(reason);
    }

    pub fn active_commands(&self) -> Vec<CommandStatus> {
        self.inner.lock_state().demux.pending().map(Command::status).collect()
    }

    pub fn command_history(&self) -> Vec<CommandStatus> {
        self.inner.lock_state().history.iter().map(Command::status).collect()
    }

    pub fn status(&self) -> ProxyStatus {
        let settings = &self.inner.settings;
        let state = self.inner.lock_state();
        ProxyStatus {
            status_time: Utc::now(),
            pid: self.inner.pid,
            process: settings.process.command.clone(),
            arguments: settings.process.args.clone(),
            is_valid: state.valid,
            lifecycle: state.lifecycle,
            created_at: self.inner.created_at,
            blacklist: settings.policy.blacklist_specs().to_vec(),
            whitelist: settings.policy.whitelist_specs().to_vec(),
            invalidate_on: settings.invalidation.config().clone(),
            auto_invalidation: settings.probes.as_ref().map(|p| p.config().clone()),
            active_commands: state.demux.pending().map(Command::status).collect(),
            command_history: state.history.iter().map(Command::status).collect(),
        }
    }

    fn start_probe(&self) {
        let Some(schedule) = self.inner.settings.probes.as_ref() else {
            return;
        };
        if schedule.is_empty() || self.inner.probe_started.swap(true, Ordering::AcqRel) {
            return;
        }

        let period = schedule.interval();
        let weak = Arc::downgrade(&self.inner);
        let mut stop = self.inner.probe_stop.subscribe();
        self.inner.logger.debug(&format!(
            "auto-invalidation probe every {}ms",
            period.as_millis()
        ));

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = stop.changed() => break,
                }
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                // Never cut short: its commands must settle before pre-destroy.
                inner.run_probe_tick().await;
            }
        });
    }
}

impl std::fmt::Debug for ProcessProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessProxy")
            .field("pid", &self.inner.pid)
            .field("created_at", &self.inner.created_at)
            .finish_non_exhaustive()
    }
}

impl Inner {
    fn lock_state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().expect("proxy state lock poisoned")
    }

    fn invalidate(&self, reason: &str) {
        let mut state = self.lock_state();
        if state.valid {
            state.valid = false;
            self.logger.warn(&format!("invalidated: {reason}"));
        }
    }

    /// Enqueue and write every command while holding stdin, then wait for
    /// all of them. No policy check.
    ///
    /// A batch that does not run to completion (the future is dropped while
    /// writing or waiting) leaves commands without a reader in the queue, or
    /// a half-written line on stdin, so it invalidates the process.
    async fn dispatch<S: AsRef<str>>(&self, commands: &[S]) -> Result<Vec<CommandResult>> {
        let mut unsettled = Unsettled::new(self);
        let mut pending = Vec::with_capacity(commands.len());
        {
            let mut stdin = self.stdin.lock().await;
            let writer = stdin.as_mut().ok_or(ProxyError::StdinClosed { pid: self.pid })?;

            for command in commands {
                let command = command.as_ref();
                let (tx, rx) = oneshot::channel();
                {
                    let mut state = self.lock_state();
                    if state.closed {
                        return Err(ProxyError::ProcessExited {
                            pid: self.pid,
                            command: command.to_string(),
                        });
                    }
                    state.demux.push(Command::new(command, move |result| {
                        let _ = tx.send(result);
                    }));
                }
                pending.push((command.to_string(), rx));

                let line = format!("{command}\n{SENTINEL_ECHO}\n");
                if let Err(e) = writer.write_all(line.as_bytes()).await {
                    self.invalidate(&format!("write failed: {e}"));
                    return Err(e.into());
                }
            }
            if let Err(e) = writer.flush().await {
                self.invalidate(&format!("flush failed: {e}"));
                return Err(e.into());
            }
        }

        let pid = self.pid;
        let results = try_join_all(pending.into_iter().map(|(command, rx)| async move {
            rx.await
                .map_err(|_| ProxyError::ProcessExited { pid, command })
        }))
        .await;
        unsettled.disarm();
        results
    }

    fn on_data(&self, kind: StreamKind, data: &[u8]) {
        let mut state = self.lock_state();
        let State {
            demux,
            history,
            valid,
            ..
        } = &mut *state;

        let report = demux.on_data(kind, data, &mut |cmd| {
            self.on_command_finished(cmd, history, valid);
        });

        if report.orphan_sentinels > 0 {
            self.logger.warn(&format!(
                "{} sentinel(s) on {kind} with no pending command",
                report.orphan_sentinels
            ));
        }
        if report.unclaimed_bytes > 0 {
            self.logger.debug(&format!(
                "{} byte(s) on {kind} with no pending command",
                report.unclaimed_bytes
            ));
        }
    }

    fn on_command_finished(&self, cmd: Command, history: &mut VecDeque<Command>, valid: &mut bool) {
        if *valid {
            let trigger = self
                .settings
                .invalidation
                .evaluate(cmd.stdout().unwrap_or(""), cmd.stderr().unwrap_or(""));
            if let Some(trigger) = trigger {
                *valid = false;
                self.logger.warn(&format!(
                    "invalidated: {} matched {}, command: {}",
                    trigger.stream,
                    trigger.pattern,
                    cmd.command()
                ));
            }
        }

        let bound = self.settings.retain_history;
        if bound > 0 {
            history.push_back(cmd);
            while history.len() > bound {
                history.pop_front();
            }
        }
    }

    fn on_stdout_closed(&self) {
        let orphaned = {
            let mut state = self.lock_state();
            state.closed = true;
            let expected = state.lifecycle != Lifecycle::Ready;
            if state.valid && !expected {
                state.valid = false;
                self.logger.error("process exited unexpectedly");
            }
            state.demux.drain()
        };
        if !orphaned.is_empty() {
            self.logger.error(&format!(
                "{} pending command(s) lost, first: {}",
                orphaned.len(),
                orphaned[0].command()
            ));
        }
        // Dropping the commands drops their result senders.
        drop(orphaned);
    }

    async fn run_probe_tick(&self) {
        let Some(schedule) = self.settings.probes.as_ref() else {
            return;
        };
        if !self.lock_state().valid {
            return;
        }
        match self.dispatch(&schedule.commands()).await {
            Ok(results) => {
                if let Some(failure) = schedule.evaluate(&results) {
                    self.invalidate(&format!(
                        "probe `{}` {:?} on {} for {}",
                        failure.command, failure.invalid_on, failure.stream, failure.pattern
                    ));
                }
            }
            Err(e) => self.logger.error(&format!("auto-invalidation probe failed: {e}")),
        }
    }

    /// SIGTERM, wait up to [`KILL_GRACE`], then SIGKILL.
    async fn terminate(&self) {
        let mut guard = self.child.lock().await;
        let Some(mut child) = guard.take() else {
            return;
        };

        match child.try_wait() {
            Ok(Some(status)) => {
                self.logger.debug(&format!("already exited: {status}"));
                return;
            }
            Ok(None) => {}
            Err(e) => self.logger.warn(&format!("try_wait failed: {e}")),
        }

        // Safety: the child has not been reaped yet, so the pid is still ours.
        #[cfg(unix)]
        unsafe {
            libc::kill(self.pid as libc::pid_t, libc::SIGTERM);
        }

        match tokio::time::timeout(KILL_GRACE, child.wait()).await {
            Ok(Ok(status)) => self.logger.debug(&format!("exited: {status}")),
            Ok(Err(e)) => self.logger.warn(&format!("wait failed: {e}")),
            Err(_) => {
                self.logger.warn(&format!(
                    "still running {}ms after SIGTERM, killing",
                    KILL_GRACE.as_millis()
                ));
                if let Err(e) = child.kill().await {
                    self.logger.error(&format!("kill failed: {e}"));
                }
            }
        }
    }
}

/// Invalidates the process unless the batch it guards settled.
struct Unsettled<'a> {
    inner: &'a Inner,
    armed: bool,
}

impl<'a> Unsettled<'a> {
    fn new(inner: &'a Inner) -> Self {
        Self { inner, armed: true }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for Unsettled<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.inner.invalidate("batch abandoned before it settled");
        }
    }
}

fn spawn_reader<R>(inner: Weak<Inner>, kind: StreamKind, mut reader: R)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = vec![0u8; READ_BUF_SIZE];
        loop {
            let n = match reader.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    if let Some(inner) = inner.upgrade() {
                        inner.logger.error(&format!("{kind} read failed: {e}"));
                    }
                    break;
                }
            };
            let Some(proxy) = inner.upgrade() else {
                return;
            };
            proxy.on_data(kind, &buf[..n]);
        }
        if kind == StreamKind::Stdout {
            if let Some(inner) = inner.upgrade() {
                inner.on_stdout_closed();
            }
        }
    });
}
