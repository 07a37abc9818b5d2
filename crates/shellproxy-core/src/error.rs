use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid pattern `{pattern}`: {reason}")]
    Pattern { pattern: String, reason: String },
}

impl CoreError {
    /// Short error code string, stable across releases.
    pub fn code(&self) -> &'static str {
        match self {
            CoreError::Config(_) => "CONFIG_ERROR",
            CoreError::Pattern { .. } => "PATTERN_ERROR",
        }
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;
