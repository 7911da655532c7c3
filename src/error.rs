//! ExamFleet Error Types

use thiserror::Error;

/// Result type alias for ExamFleet operations
pub type Result<T> = std::result::Result<T, Error>;

/// ExamFleet error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    // Peer errors (never fatal, the affected round is skipped)
    #[error("Peer {address} unreachable: {reason}")]
    Unreachable { address: String, reason: String },

    #[error("Timed out talking to {0}")]
    Timeout(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Message serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    // Election signals
    #[error("Election already in progress")]
    ElectionAlreadyInProgress,

    #[error("Node not found: {0}")]
    NodeNotFound(String),

    // Session / routing errors
    #[error("Server is at maximum capacity")]
    CapacityExceeded,

    #[error("Invalid session ID: {0}")]
    InvalidSession(String),

    #[error("No healthy backend servers available")]
    NoHealthyBackend,

    #[error("Invalid exam configuration: {0}")]
    InvalidExamConfig(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Shutdown in progress")]
    ShuttingDown,
}

impl Error {
    /// Wrap a connect/transport failure for `address`
    pub fn unreachable(address: impl Into<String>, reason: impl ToString) -> Self {
        Error::Unreachable {
            address: address.into(),
            reason: reason.to_string(),
        }
    }

    /// Check if this error means the peer could not be reached in time
    /// or is on its way out
    pub fn is_unreachable(&self) -> bool {
        matches!(
            self,
            Error::Unreachable { .. } | Error::Timeout(_) | Error::ShuttingDown
        )
    }

    /// Check if this error is the caller's fault
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Error::InvalidSession(_)
                | Error::InvalidExamConfig(_)
                | Error::BadRequest(_)
                | Error::NodeNotFound(_)
        )
    }

    /// HTTP status this error maps to when surfaced through an API
    pub fn status_code(&self) -> u16 {
        match self {
            Error::NoHealthyBackend
            | Error::CapacityExceeded
            | Error::ShuttingDown
            | Error::Unreachable { .. } => 503,
            Error::Timeout(_) => 504,
            Error::InvalidSession(_) | Error::NodeNotFound(_) => 404,
            Error::InvalidExamConfig(_) | Error::BadRequest(_) => 400,
            Error::ElectionAlreadyInProgress => 409,
            _ => 500,
        }
    }

    /// Short machine-readable code used in API error bodies
    pub fn code(&self) -> &'static str {
        match self {
            Error::Config(_) | Error::ConfigParse(_) => "CONFIG",
            Error::Unreachable { .. } => "UNREACHABLE",
            Error::Timeout(_) => "TIMEOUT",
            Error::Protocol(_) | Error::Serialization(_) => "PROTOCOL",
            Error::ElectionAlreadyInProgress => "ELECTION_IN_PROGRESS",
            Error::NodeNotFound(_) => "NODE_NOT_FOUND",
            Error::CapacityExceeded => "CAPACITY_EXCEEDED",
            Error::InvalidSession(_) => "INVALID_SESSION",
            Error::NoHealthyBackend => "NO_HEALTHY_BACKEND",
            Error::InvalidExamConfig(_) => "INVALID_EXAM_CONFIG",
            Error::BadRequest(_) => "BAD_REQUEST",
            Error::Io(_) => "IO",
            Error::ShuttingDown => "SHUTTING_DOWN",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unreachable_classification() {
        assert!(Error::unreachable("10.0.0.2:7700", "connection refused").is_unreachable());
        assert!(Error::Timeout("10.0.0.2:7700".into()).is_unreachable());
        assert!(Error::ShuttingDown.is_unreachable());
        assert!(!Error::NoHealthyBackend.is_unreachable());
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(Error::NoHealthyBackend.status_code(), 503);
        assert_eq!(Error::CapacityExceeded.status_code(), 503);
        assert_eq!(Error::InvalidSession("x".into()).status_code(), 404);
        assert_eq!(Error::unreachable("a", "refused").status_code(), 503);
        assert_eq!(Error::Timeout("a".into()).status_code(), 504);
        assert!(Error::BadRequest("no username".into()).is_client_error());
    }
}
