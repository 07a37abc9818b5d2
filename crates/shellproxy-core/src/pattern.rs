//! Pattern capability: `compile(pattern, flags) -> matcher`, `matcher.is_match(text)`.
//!
//! Patterns arrive as strings in configuration and are compiled exactly once.
//! A pattern that fails to compile is logged and dropped; the rest of the set
//! is still usable.

use crate::error::{CoreError, Result};
use crate::log::Logger;
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A pattern as written in configuration.
///
/// `flags` uses the familiar single-letter syntax:
/// `i` case-insensitive, `m` multi-line, `s` dot matches newline.
/// `g`, `u` and `y` are accepted and have no effect on a boolean match.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatternSpec {
    pub regex: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flags: Option<String>,
}

impl PatternSpec {
    pub fn new(regex: impl Into<String>) -> Self {
        Self {
            regex: regex.into(),
            flags: None,
        }
    }

    pub fn with_flags(mut self, flags: impl Into<String>) -> Self {
        self.flags = Some(flags.into());
        self
    }
}

impl From<&str> for PatternSpec {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for PatternSpec {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

impl fmt::Display for PatternSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "/{}/{}", self.regex, self.flags.as_deref().unwrap_or(""))
    }
}

/// An opaque compiled matcher. Remembers the `PatternSpec` it was built from so log
/// lines and errors can name the pattern.
#[derive(Debug, Clone)]
pub struct CompiledPattern {
    spec: PatternSpec,
    regex: Regex,
}

impl CompiledPattern {
    pub fn compile(spec: &PatternSpec) -> Result<Self> {
        let mut builder = RegexBuilder::new(&spec.regex);

        for flag in spec.flags.as_deref().unwrap_or("").chars() {
            match flag {
                'i' => {
                    builder.case_insensitive(true);
                }
                'm' => {
                    builder.multi_line(true);
                }
                's' => {
                    builder.dot_matches_new_line(true);
                }
                'g' | 'u' | 'y' => {}
                other => {
                    return Err(CoreError::Pattern {
                        pattern: spec.to_string(),
                        reason: format!("unsupported flag '{other}'"),
                    })
                }
            }
        }

        let regex = builder.build().map_err(|e| CoreError::Pattern {
            pattern: spec.to_string(),
            reason: e.to_string(),
        })?;

        Ok(Self {
            spec: spec.clone(),
            regex,
        })
    }

    pub fn is_match(&self, text: &str) -> bool {
        self.regex.is_match(text)
    }

    pub fn spec(&self) -> &PatternSpec {
        &self.spec
    }
}

impl fmt::Display for CompiledPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.spec, f)
    }
}

/// Compile every spec, logging and skipping the ones that fail.
pub fn compile_all(specs: &[PatternSpec], logger: &Logger) -> Vec<CompiledPattern> {
    specs
        .iter()
        .filter_map(|spec| match CompiledPattern::compile(spec) {
            Ok(compiled) => Some(compiled),
            Err(e) => {
                logger.error(&format!("dropping pattern: {e}"));
                None
            }
        })
        .collect()
}
