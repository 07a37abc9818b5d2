//! Command policy and output invalidation.
//!
//! Both are pattern sets compiled once from configuration and shared by every
//! process in a pool.
//!
//! Command policy decision order, applied to a whole batch before anything is
//! written:
//!   1. Every command is tested against the blacklist; the first match fails
//!      the batch.
//!   2. If a whitelist is configured, every command must match at least one
//!      whitelist pattern; the first one that does not fails the batch.
//!
//! Output invalidation runs after each command finishes: stderr is checked
//! first, then stdout, and the first match marks the process invalid.

use crate::error::{ProxyError, Result};
use crate::types::StreamKind;
use shellproxy_core::config::InvalidationPatterns;
use shellproxy_core::pattern::compile_all;
use shellproxy_core::{CompiledPattern, Logger, PatternSpec};

// ---------------------------------------------------------------------------
// Command policy
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct CommandPolicy {
    blacklist: Vec<CompiledPattern>,
    whitelist: Vec<CompiledPattern>,
    blacklist_specs: Vec<PatternSpec>,
    whitelist_specs: Vec<PatternSpec>,
}

impl CommandPolicy {
    /// Compile both lists. Patterns that fail to compile are logged and dropped.
    pub fn compile(blacklist: &[PatternSpec], whitelist: &[PatternSpec], logger: &Logger) -> Self {
        Self {
            blacklist: compile_all(blacklist, logger),
            whitelist: compile_all(whitelist, logger),
            blacklist_specs: blacklist.to_vec(),
            whitelist_specs: whitelist.to_vec(),
        }
    }

    /// Check a batch. `Ok(())` means every command may be written.
    pub fn check_batch<S: AsRef<str>>(&self, commands: &[S], logger: &Logger) -> Result<()> {
        for command in commands {
            let command = command.as_ref();
            if let Some(pattern) = self.blacklisted_by(command) {
                logger.error(&format!(
                    "command matches blacklist pattern {pattern}, command: {command}"
                ));
                return Err(ProxyError::Blacklisted {
                    command: command.to_string(),
                    pattern: pattern.to_string(),
                });
            }
        }

        for command in commands {
            let command = command.as_ref();
            if !self.is_whitelisted(command) {
                logger.error(&format!(
                    "command does not match any whitelist pattern, command: {command}"
                ));
                return Err(ProxyError::NotWhitelisted {
                    command: command.to_string(),
                });
            }
        }

        Ok(())
    }

    /// First blacklist pattern matching `command`, if any.
    pub fn blacklisted_by(&self, command: &str) -> Option<&CompiledPattern> {
        self.blacklist.iter().find(|p| p.is_match(command))
    }

    /// An empty whitelist admits everything.
    pub fn is_whitelisted(&self, command: &str) -> bool {
        self.whitelist.is_empty() || self.whitelist.iter().any(|p| p.is_match(command))
    }

    pub fn blacklist_specs(&self) -> &[PatternSpec] {
        &self.blacklist_specs
    }

    pub fn whitelist_specs(&self) -> &[PatternSpec] {
        &self.whitelist_specs
    }
}

// ---------------------------------------------------------------------------
// Output invalidation
// ---------------------------------------------------------------------------

/// Why a finished command invalidated its process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidationTrigger {
    pub stream: StreamKind,
    pub pattern: String,
}

/// Per-stream invalidation patterns; `any` patterns are folded into both.
#[derive(Debug, Clone, Default)]
pub struct OutputInvalidation {
    stdout: Vec<CompiledPattern>,
    stderr: Vec<CompiledPattern>,
    config: InvalidationPatterns,
}

impl OutputInvalidation {
    pub fn compile(config: &InvalidationPatterns, logger: &Logger) -> Self {
        let any = compile_all(&config.any, logger);

        let mut stdout = any.clone();
        stdout.extend(compile_all(&config.stdout, logger));

        let mut stderr = any;
        stderr.extend(compile_all(&config.stderr, logger));

        Self {
            stdout,
            stderr,
            config: config.clone(),
        }
    }

    pub fn is_configured(&self) -> bool {
        !self.stdout.is_empty() || !self.stderr.is_empty()
    }

    /// Evaluate one finished command's output. Empty output never matches.
    pub fn evaluate(&self, stdout: &str, stderr: &str) -> Option<InvalidationTrigger> {
        if !self.is_configured() {
            return None;
        }
        first_match(&self.stderr, stderr)
            .map(|p| InvalidationTrigger {
                stream: StreamKind::Stderr,
                pattern: p.to_string(),
            })
            .or_else(|| {
                first_match(&self.stdout, stdout).map(|p| InvalidationTrigger {
                    stream: StreamKind::Stdout,
                    pattern: p.to_string(),
                })
            })
    }

    pub fn config(&self) -> &InvalidationPatterns {
        &self.config
    }
}

fn first_match<'a>(patterns: &'a [CompiledPattern], text: &str) -> Option<&'a CompiledPattern> {
    if text.is_empty() {
        return None;
    }
    patterns.iter().find(|p| p.is_match(text))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use shellproxy_core::{MemorySink, TracingSink};
    use std::sync::Arc;

    fn logger() -> Logger {
        Logger::new(Arc::new(TracingSink), "test")
    }

    fn specs(patterns: &[&str]) -> Vec<PatternSpec> {
        patterns.iter().map(|p| PatternSpec::new(*p)).collect()
    }

    // --- Command policy ---

    #[test]
    fn empty_policy_allows_everything() {
        let policy = CommandPolicy::compile(&[], &[], &logger());
        assert!(policy.check_batch(&["rm -rf /tmp/x", "echo hi"], &logger()).is_ok());
    }

    #[test]
    fn blacklist_rejects_and_names_command_and_pattern() {
        let policy = CommandPolicy::compile(&specs(&[".*blacklisted.*"]), &[], &logger());
        let err = policy
            .check_batch(&["echo ok", "echo 'some blacklisted command'"], &logger())
            .unwrap_err();

        match &err {
            ProxyError::Blacklisted { command, pattern } => {
                assert_eq!(command, "echo 'some blacklisted command'");
                assert_eq!(pattern, "/.*blacklisted.*/");
            }
            other => panic!("expected blacklist rejection, got {other:?}"),
        }
        assert!(err.to_string().contains("blacklisted"));
        assert!(err.is_rejection());
    }

    #[test]
    fn whitelist_requires_every_command_to_match() {
        let policy = CommandPolicy::compile(&[], &specs(&[".*whitelisted.*"]), &logger());
        assert!(policy.check_batch(&["echo whitelisted"], &logger()).is_ok());

        let err = policy
            .check_batch(&["echo whitelisted", "ls /"], &logger())
            .unwrap_err();
        assert_eq!(err.code(), "NOT_WHITELISTED");
        assert!(err.to_string().contains("whitelisted"));
        assert!(err.to_string().contains("ls /"));
    }

    #[test]
    fn blacklist_wins_over_whitelist_across_the_batch() {
        // The first command fails the whitelist, the second hits the blacklist.
        // Blacklist is scanned over the whole batch first.
        let policy = CommandPolicy::compile(
            &specs(&["danger"]),
            &specs(&["^echo"]),
            &logger(),
        );
        let err = policy.check_batch(&["ls", "echo danger"], &logger()).unwrap_err();
        assert_eq!(err.code(), "BLACKLISTED");
    }

    #[test]
    fn bad_policy_pattern_is_skipped() {
        let sink = Arc::new(MemorySink::new());
        let logger = Logger::new(sink.clone(), "test");
        let policy = CommandPolicy::compile(&specs(&["[", "sudo"]), &[], &logger);

        assert!(policy.blacklisted_by("sudo reboot").is_some());
        assert_eq!(policy.blacklist_specs().len(), 2);
        assert_eq!(sink.records().len(), 1);
    }

    // --- Output invalidation ---

    #[test]
    fn unconfigured_invalidation_never_fires() {
        let inv = OutputInvalidation::compile(&InvalidationPatterns::default(), &logger());
        assert!(!inv.is_configured());
        assert!(inv.evaluate("anything", "anything").is_none());
    }

    #[test]
    fn stderr_pattern_fires_on_stderr_only() {
        let config = InvalidationPatterns {
            stderr: specs(&[".*nomatch.*"]),
            ..Default::default()
        };
        let inv = OutputInvalidation::compile(&config, &logger());

        assert!(inv.evaluate("nomatch on stdout", "").is_none());
        let trigger = inv.evaluate("", "this nomatch here").unwrap();
        assert_eq!(trigger.stream, StreamKind::Stderr);
    }

    #[test]
    fn stderr_is_checked_before_stdout() {
        let config = InvalidationPatterns {
            any: specs(&["boom"]),
            ..Default::default()
        };
        let inv = OutputInvalidation::compile(&config, &logger());
        let trigger = inv.evaluate("boom", "boom").unwrap();
        assert_eq!(trigger.stream, StreamKind::Stderr);

        let trigger = inv.evaluate("boom", "").unwrap();
        assert_eq!(trigger.stream, StreamKind::Stdout);
    }

    #[test]
    fn empty_output_is_not_evaluated() {
        // `^$` would match an empty string, but empty output is skipped.
        let config = InvalidationPatterns {
            any: specs(&["^$"]),
            ..Default::default()
        };
        let inv = OutputInvalidation::compile(&config, &logger());
        assert!(inv.evaluate("", "").is_none());
    }
}
