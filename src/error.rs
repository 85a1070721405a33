//! Error types for the join service

use std::io;

use thiserror::Error;

/// Result type alias for the join service
pub type Result<T> = std::result::Result<T, Error>;

/// Service-level errors (startup, configuration, serving).
///
/// Per-request failures are [`JoinError`](crate::join::JoinError).
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_errors_convert() {
        let err: Error = io::Error::new(io::ErrorKind::AddrInUse, "busy").into();
        assert!(matches!(err, Error::Io(_)));
        assert_eq!(err.to_string(), "IO error: busy");
    }
}
