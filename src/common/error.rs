//! Error types for zkswitch

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    // === I/O Errors ===
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // === Coordination Errors ===
    #[error("Node absent: {0}")]
    NodeAbsent(String),

    #[error("Node exists: {0}")]
    NodeExists(String),

    #[error("Version conflict on {0}")]
    VersionConflict(String),

    #[error("Coordination service unavailable: {0}")]
    Unavailable(String),

    // === Election Errors ===
    #[error("Malformed min fail threshold: {0:?}")]
    MalformedThreshold(String),

    // === Config Errors ===
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // === Generic ===
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Is this a retryable error?
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Unavailable(_) | Error::VersionConflict(_)
        )
    }

    /// Node absence is the normal "not set yet" answer, not a failure.
    pub fn is_absent(&self) -> bool {
        matches!(self, Error::NodeAbsent(_))
    }
}

impl From<config::ConfigError> for Error {
    fn from(e: config::ConfigError) -> Self {
        Error::InvalidConfig(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable() {
        assert!(Error::Unavailable("connection loss".into()).is_retryable());
        assert!(Error::VersionConflict("/root/master".into()).is_retryable());
        assert!(!Error::NodeExists("/root/judge".into()).is_retryable());
        assert!(!Error::MalformedThreshold("abc".into()).is_retryable());
    }

    #[test]
    fn test_absent() {
        assert!(Error::NodeAbsent("/root/master".into()).is_absent());
        assert!(!Error::Unavailable("x".into()).is_absent());
    }
}
