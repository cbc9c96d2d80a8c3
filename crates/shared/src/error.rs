//! Error types for shared parsing and time handling

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SharedError {
    #[error("Invalid subscription tier: {0}")]
    InvalidTier(String),

    #[error("Invalid subscription status: {0}")]
    InvalidStatus(String),

    #[error("Unrecognized timestamp: {0}")]
    InvalidTimestamp(String),
}

pub type SharedResult<T> = Result<T, SharedError>;
