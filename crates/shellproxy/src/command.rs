//! One submitted command and the output it accumulates until its sentinel
//! is seen.

use crate::types::{CommandResult, CommandStatus, StreamKind};
use chrono::{DateTime, Utc};
use std::fmt;

type OnFinish = Box<dyn FnOnce(CommandResult) + Send>;

/// A command written to a process, collecting stdout/stderr bytes.
///
/// Buffers are raw bytes until [`Command::finish`], which decodes them,
/// trims surrounding whitespace, freezes the result and fires the completion
/// callback. The callback is taken on first use, so it can never run twice.
pub struct Command {
    command: String,
    stdout_buf: Option<Vec<u8>>,
    stderr_buf: Option<Vec<u8>>,
    stdout: Option<String>,
    stderr: Option<String>,
    received_data: bool,
    completed: bool,
    started_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
    on_finish: Option<OnFinish>,
}

impl Command {
    pub fn new(command: impl Into<String>, on_finish: impl FnOnce(CommandResult) + Send + 'static) -> Self {
        Self {
            command: command.into(),
            stdout_buf: Some(Vec::new()),
            stderr_buf: Some(Vec::new()),
            stdout: None,
            stderr: None,
            received_data: false,
            completed: false,
            started_at: Utc::now(),
            finished_at: None,
            on_finish: Some(Box::new(on_finish)),
        }
    }

    /// Append `data` to the buffer for `kind`. Ignored once finished.
    pub fn handle_data(&mut self, kind: StreamKind, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        let buf = match kind {
            StreamKind::Stdout => self.stdout_buf.as_mut(),
            StreamKind::Stderr => self.stderr_buf.as_mut(),
        };
        if let Some(buf) = buf {
            buf.extend_from_slice(data);
            self.received_data = true;
        }
    }

    /// Freeze the output and invoke the completion callback.
    pub fn finish(&mut self) {
        if self.completed {
            return;
        }
        let stdout = decode(self.stdout_buf.take());
        let stderr = decode(self.stderr_buf.take());

        self.stdout = Some(stdout.clone());
        self.stderr = Some(stderr.clone());
        self.completed = true;
        self.finished_at = Some(Utc::now());

        if let Some(on_finish) = self.on_finish.take() {
            on_finish(CommandResult {
                command: self.command.clone(),
                stdout,
                stderr,
            });
        }
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn stdout(&self) -> Option<&str> {
        self.stdout.as_deref()
    }

    pub fn stderr(&self) -> Option<&str> {
        self.stderr.as_deref()
    }

    pub fn received_data(&self) -> bool {
        self.received_data
    }

    pub fn is_completed(&self) -> bool {
        self.completed
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        self.finished_at
    }

    pub fn status(&self) -> CommandStatus {
        CommandStatus {
            command: self.command.clone(),
            started_at: self.started_at,
            received_data: self.received_data,
            finished: self.completed,
            finished_at: self.finished_at,
            stdout: self.stdout.clone(),
            stderr: self.stderr.clone(),
        }
    }
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Command")
            .field("command", &self.command)
            .field("received_data", &self.received_data)
            .field("completed", &self.completed)
            .finish_non_exhaustive()
    }
}

fn decode(buf: Option<Vec<u8>>) -> String {
    let buf = buf.unwrap_or_default();
    String::from_utf8_lossy(&buf).trim().to_string()
}
