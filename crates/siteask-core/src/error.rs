//! Error types for siteask

use thiserror::Error;

/// Result type alias using SiteAskError
pub type Result<T> = std::result::Result<T, SiteAskError>;

/// Error type alias for convenience
pub type Error = SiteAskError;

/// Exit codes for CLI
pub mod exit_codes {
    pub const SUCCESS: i32 = 0;
    pub const GENERAL_ERROR: i32 = 1;
    pub const NOT_FOUND: i32 = 2;
    pub const INVALID_INPUT: i32 = 3;
}

/// Main error type for siteask
#[derive(Debug, Error)]
pub enum SiteAskError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Walk directory error: {0}")]
    WalkDir(#[from] walkdir::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Site not found: {0}")]
    SiteNotFound(String),

    #[error("LLM error: {0}")]
    Llm(String),

    #[error("Invalid LLM response: {0}")]
    InvalidResponse(String),

    #[error("Prompt not found: {name} (item type {item_type})")]
    PromptNotFound { name: String, item_type: String },

    #[error("Timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Retrieval error: {0}")]
    Retrieval(String),

    #[error("Turn cancelled")]
    Cancelled,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Event stream error: {0}")]
    Stream(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Regex error: {0}")]
    Regex(#[from] regex::Error),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("External service error: {0}")]
    ExternalError(String),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl SiteAskError {
    /// Get the exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::SiteNotFound(_) => exit_codes::NOT_FOUND,
            Self::InvalidInput(_) | Self::Config(_) | Self::Parse(_) => exit_codes::INVALID_INPUT,
            _ => exit_codes::GENERAL_ERROR,
        }
    }

    /// Whether a retry of the same call could plausibly succeed
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Timeout(_) | Self::Http(_) | Self::ExternalError(_) | Self::Stream(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        assert_eq!(
            SiteAskError::SiteNotFound("x".into()).exit_code(),
            exit_codes::NOT_FOUND
        );
        assert_eq!(
            SiteAskError::Config("bad".into()).exit_code(),
            exit_codes::INVALID_INPUT
        );
        assert_eq!(
            SiteAskError::Llm("down".into()).exit_code(),
            exit_codes::GENERAL_ERROR
        );
    }

    #[test]
    fn test_transient_classification() {
        assert!(SiteAskError::Timeout(std::time::Duration::from_secs(1)).is_transient());
        assert!(!SiteAskError::InvalidResponse("x".into()).is_transient());
    }
}
