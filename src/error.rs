//! Error types for the parley library.

use std::io;
use std::string::FromUtf8Error;

use crate::constants::ErrorCode;

/// Result type alias for parley operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error types that can occur while serving clients.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("UTF-8 decoding error: {0}")]
    Utf8(#[from] FromUtf8Error),

    #[error("Storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("Unknown command: {0}")]
    UnknownCommand(String),

    #[error("Malformed {command}: {reason}")]
    Malformed { command: String, reason: String },

    #[error("Line exceeds {0} bytes")]
    LineTooLong(usize),

    #[error("You are not logged in")]
    Unauthenticated,

    #[error("Already logged in as {0}")]
    AlreadyAuthenticated(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("{0} already exists")]
    Duplicate(String),

    #[error("Unavailable: {0}")]
    Unavailable(String),

    #[error("Transfer failed: {0}")]
    Transfer(String),

    #[error("Invalid transfer role: {0}")]
    InvalidTransferRole(String),

    #[error("Buffer underflow: needed {needed} bytes, had {available}")]
    BufferUnderflow { needed: usize, available: usize },
}

impl Error {
    pub fn malformed(command: &str, reason: impl Into<String>) -> Self {
        Error::Malformed {
            command: command.to_string(),
            reason: reason.into(),
        }
    }

    /// Wire error code reported to the client for this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::Malformed { .. }
            | Error::Utf8(_)
            | Error::LineTooLong(_)
            | Error::BufferUnderflow { .. }
            | Error::InvalidTransferRole(_) => ErrorCode::Malformed,
            Error::UnknownCommand(_) => ErrorCode::UnknownCommand,
            Error::Unauthenticated => ErrorCode::Unauthenticated,
            Error::AlreadyAuthenticated(_) | Error::Duplicate(_) => ErrorCode::Duplicate,
            Error::NotFound(_) => ErrorCode::NotFound,
            Error::PermissionDenied(_) => ErrorCode::PermissionDenied,
            Error::Unavailable(_) => ErrorCode::Unavailable,
            Error::Transfer(_) => ErrorCode::TransferFailed,
            Error::Io(_) | Error::Storage(_) => ErrorCode::Internal,
        }
    }

    /// Text sent to the client. Internal failures are logged, never echoed.
    pub fn client_message(&self) -> String {
        match self {
            Error::Io(_) | Error::Storage(_) => "internal server error".to_string(),
            other => other.to_string(),
        }
    }

    /// Transport failures end the session; everything else is answered on the wire.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Io(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_transport_errors_are_fatal() {
        let io = Error::Io(io::Error::new(io::ErrorKind::BrokenPipe, "gone"));
        assert!(io.is_fatal());
        assert!(!Error::Unauthenticated.is_fatal());
        assert!(!Error::malformed("/login", "missing password").is_fatal());
        assert!(!Error::NotFound("group team".into()).is_fatal());
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(Error::malformed("/x", "y").code(), ErrorCode::Malformed);
        assert_eq!(Error::Unauthenticated.code(), ErrorCode::Unauthenticated);
        assert_eq!(
            Error::PermissionDenied("not creator".into()).code(),
            ErrorCode::PermissionDenied
        );
        assert_eq!(Error::Unavailable("gone".into()).code(), ErrorCode::Unavailable);
    }

    #[test]
    fn test_storage_details_stay_on_the_server() {
        let storage = Error::Storage(rusqlite::Error::InvalidColumnName("secret_col".into()));
        assert_eq!(storage.code(), ErrorCode::Internal);
        assert_eq!(storage.client_message(), "internal server error");
        assert!(!storage.client_message().contains("secret_col"));

        let missing = Error::NotFound("user zed".into());
        assert_eq!(missing.client_message(), "user zed not found");
    }
}
