//! Network error types

use std::io;

use crate::protocol::ErrorKind;

/// Network result type
pub type Result<T> = std::result::Result<T, Error>;

/// Network errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Not connected")]
    NotConnected,

    #[error("Request timed out")]
    Timeout,

    /// The engine refused the request
    #[error("Rejected ({kind:?}): {message}")]
    Rejected { kind: ErrorKind, message: String },
}

impl Error {
    /// Transient transport failures, worth one retry by another path
    pub fn is_network_failure(&self) -> bool {
        matches!(
            self,
            Error::Io(_) | Error::ConnectionClosed | Error::NotConnected | Error::Timeout
        )
    }

    /// Rejection kind, when the engine answered
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            Error::Rejected { kind, .. } => Some(*kind),
            _ => None,
        }
    }
}

impl From<arena_core::Error> for Error {
    fn from(err: arena_core::Error) -> Self {
        Error::Rejected {
            kind: ErrorKind::from(&err),
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_network_failure_classification() {
        assert!(Error::Timeout.is_network_failure());
        assert!(Error::ConnectionClosed.is_network_failure());
        assert!(!Error::Protocol("bad".into()).is_network_failure());

        let rejected = Error::from(arena_core::Error::TurnViolation("guest".into()));
        assert!(!rejected.is_network_failure());
        assert_eq!(rejected.kind(), Some(ErrorKind::TurnViolation));
    }
}
