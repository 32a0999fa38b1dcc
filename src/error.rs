//! Custom error types for openalex-harvest.
//!
//! All library functions return `Result<T, HarvestError>` instead of using `unwrap()`.
//! Configuration problems surface before any network call; API problems carry the
//! cursor that was being fetched so a failed run can be diagnosed.

use thiserror::Error;

/// Main error type for harvest operations.
#[derive(Debug, Error)]
pub enum HarvestError {
    /// Search file or CLI configuration error
    #[error("Config error: {0}")]
    Config(String),

    /// Validation error (sampling percent, batch size, ...)
    #[error("Validation error: {0}")]
    Validation(String),

    /// Request failed in transport (connect, timeout, body read)
    #[error("Request failed at cursor {cursor:?}: {source}")]
    Request {
        /// Cursor (or sample seed) being fetched
        cursor: String,
        /// Underlying client error
        #[source]
        source: reqwest::Error,
    },

    /// OpenAlex returned a non-success status
    #[error("API error at cursor {cursor:?}: {code} - {message}")]
    Api {
        /// HTTP status code
        code: u16,
        /// Error message
        message: String,
        /// Cursor (or sample seed) being fetched when the error occurred
        cursor: String,
    },

    /// Rate limited after exhausting retries
    #[error("Rate limited at cursor {cursor:?} after {attempts} attempts")]
    RateLimited {
        /// Cursor being fetched
        cursor: String,
        /// Number of attempts made
        attempts: u32,
    },

    /// Response body could not be decoded
    #[error("Parse error: {0}")]
    Parse(String),

    /// File I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// CSV writer error
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

impl HarvestError {
    /// Whether the error came from configuration and was raised before any request.
    pub fn is_config(&self) -> bool {
        matches!(self, Self::Config(_) | Self::Validation(_))
    }
}

/// Result type alias using `HarvestError`
pub type Result<T> = std::result::Result<T, HarvestError>;

/// Extension trait for adding context to Option types
pub trait OptionExt<T> {
    /// Convert Option to Result with a config error message
    fn ok_or_config(self, msg: &str) -> Result<T>;
}

impl<T> OptionExt<T> for Option<T> {
    fn ok_or_config(self, msg: &str) -> Result<T> {
        self.ok_or_else(|| HarvestError::Config(msg.to_string()))
    }
}
