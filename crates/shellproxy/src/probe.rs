//! Auto-invalidation probes.
//!
//! A probe is an ordered list of commands run as one batch on a fixed
//! interval. Each command may carry rules; a rule fires when its pattern
//! matches (`invalidOn = match`) or fails to match (`invalidOn = noMatch`)
//! the stream it is scoped to. The first firing rule invalidates the process.

use crate::types::{CommandResult, StreamKind};
use shellproxy_core::config::{AutoInvalidationConfig, InvalidOn, ProbeRule};
use shellproxy_core::{CompiledPattern, Logger};
use std::time::Duration;

/// Which output a rule looks at. `Any` checks stdout, then stderr.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleScope {
    Any,
    Only(StreamKind),
}

#[derive(Debug, Clone)]
struct CompiledRule {
    pattern: CompiledPattern,
    invalid_on: InvalidOn,
    scope: RuleScope,
}

impl CompiledRule {
    fn fires_on(&self, text: &str) -> bool {
        let matched = self.pattern.is_match(text);
        match self.invalid_on {
            InvalidOn::Match => matched,
            InvalidOn::NoMatch => !matched,
        }
    }

    /// The stream that made this rule fire, if any.
    fn evaluate(&self, result: &CommandResult) -> Option<StreamKind> {
        let check = |kind: StreamKind| {
            let text = match kind {
                StreamKind::Stdout => &result.stdout,
                StreamKind::Stderr => &result.stderr,
            };
            self.fires_on(text).then_some(kind)
        };
        match self.scope {
            RuleScope::Any => check(StreamKind::Stdout).or_else(|| check(StreamKind::Stderr)),
            RuleScope::Only(kind) => check(kind),
        }
    }
}

#[derive(Debug, Clone)]
struct CompiledProbe {
    command: String,
    rules: Vec<CompiledRule>,
}

/// Why a probe tick invalidated the process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeFailure {
    pub command: String,
    pub stream: StreamKind,
    pub pattern: String,
    pub invalid_on: InvalidOn,
}

/// Compiled probe schedule, shared by every process in a pool.
#[derive(Debug, Clone)]
pub struct ProbeSchedule {
    interval: Duration,
    probes: Vec<CompiledProbe>,
    config: AutoInvalidationConfig,
}

impl ProbeSchedule {
    /// Compile every rule. Rules whose pattern fails to compile are logged
    /// and dropped; the probe command itself still runs.
    pub fn compile(config: &AutoInvalidationConfig, logger: &Logger) -> Self {
        let probes = config
            .commands
            .iter()
            .map(|probe| {
                let mut rules = Vec::new();
                if let Some(regexes) = &probe.regexes {
                    compile_rules(&regexes.any, RuleScope::Any, logger, &mut rules);
                    compile_rules(
                        &regexes.stdout,
                        RuleScope::Only(StreamKind::Stdout),
                        logger,
                        &mut rules,
                    );
                    compile_rules(
                        &regexes.stderr,
                        RuleScope::Only(StreamKind::Stderr),
                        logger,
                        &mut rules,
                    );
                }
                CompiledProbe {
                    command: probe.command.clone(),
                    rules,
                }
            })
            .collect();

        Self {
            interval: Duration::from_millis(config.check_interval_ms.max(1)),
            probes,
            config: config.clone(),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn is_empty(&self) -> bool {
        self.probes.is_empty()
    }

    /// Commands for one tick, in configured order.
    pub fn commands(&self) -> Vec<String> {
        self.probes.iter().map(|p| p.command.clone()).collect()
    }

    /// Evaluate one tick's results (same order as [`ProbeSchedule::commands`]).
    /// Stops at the first firing rule.
    pub fn evaluate(&self, results: &[CommandResult]) -> Option<ProbeFailure> {
        self.probes
            .iter()
            .zip(results)
            .find_map(|(probe, result)| {
                probe.rules.iter().find_map(|rule| {
                    rule.evaluate(result).map(|stream| ProbeFailure {
                        command: probe.command.clone(),
                        stream,
                        pattern: rule.pattern.to_string(),
                        invalid_on: rule.invalid_on,
                    })
                })
            })
    }

    pub fn config(&self) -> &AutoInvalidationConfig {
        &self.config
    }
}

fn compile_rules(rules: &[ProbeRule], scope: RuleScope, logger: &Logger, out: &mut Vec<CompiledRule>) {
    for rule in rules {
        match CompiledPattern::compile(&rule.pattern) {
            Ok(pattern) => out.push(CompiledRule {
                pattern,
                invalid_on: rule.invalid_on,
                scope,
            }),
            Err(e) => logger.error(&format!("dropping probe rule: {e}")),
        }
    }
}
