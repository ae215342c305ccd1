//! Error types for pidwatt
//!
//! Reader and configuration failures use [`PidwattError`]. Identity
//! resolution has its own closed taxonomy in
//! [`ResolveError`](crate::resolver::ResolveError), which is wrapped here
//! when a resolver failure has to travel through a crate-level `Result`.

use crate::resolver::ResolveError;
use thiserror::Error;

/// Main error type for pidwatt operations
#[derive(Error, Debug)]
pub enum PidwattError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Failed to parse {what}: {detail}")]
    Parse { what: String, detail: String },

    #[error("Process {pid} is unavailable: {source}")]
    ProcessUnavailable {
        pid: u32,
        #[source]
        source: std::io::Error,
    },

    #[error("Target resolution failed: {0}")]
    Resolve(#[from] ResolveError),
}

/// Result type alias for pidwatt operations
pub type Result<T> = std::result::Result<T, PidwattError>;

impl PidwattError {
    /// Shorthand for a parse failure of a named kernel record.
    pub fn parse(what: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::Parse {
            what: what.into(),
            detail: detail.into(),
        }
    }
}
