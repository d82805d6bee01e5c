//! Error types for the core domain.

use thiserror::Error;

/// Core domain error type.
#[derive(Debug, Error)]
pub enum Error {
    #[error("unknown event type: {0}")]
    UnknownEventType(String),

    #[error("invalid sync status: {0}")]
    InvalidSyncStatus(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}

/// Result type alias for core operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        assert_eq!(
            Error::UnknownEventType("Bogus".to_string()).to_string(),
            "unknown event type: Bogus"
        );
        assert_eq!(
            Error::InvalidSyncStatus("7".to_string()).to_string(),
            "invalid sync status: 7"
        );
    }
}
