use crate::types::ChannelId;
use thiserror::Error;

/// Impact tracker error types
#[derive(Error, Debug)]
pub enum TrackerError {
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Acquisition failed on channel {channel}: {reason}")]
    Acquisition { channel: ChannelId, reason: String },

    #[error("Solver failed: {0}")]
    Solver(String),

    #[error("Invalid monitor state: {0}")]
    InvalidState(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(String),
}

impl From<serde_json::Error> for TrackerError {
    fn from(err: serde_json::Error) -> Self {
        TrackerError::Parse(err.to_string())
    }
}

/// Result type for library operations
pub type TrackerResult<T> = Result<T, TrackerError>;
