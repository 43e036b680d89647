//! Protocol constants and enumerations.

use crate::{Error, Result};

/// Default port for the line-oriented control protocol.
pub const DEFAULT_CHAT_PORT: u16 = 9999;

/// Default port for the binary file transfer channel.
pub const DEFAULT_FILE_PORT: u16 = 9998;

/// Separator between the fields of a command or response.
pub const PARAM_DELIMITER: char = '|';

/// Separator inside list-valued fields (online users, group members).
pub const LIST_DELIMITER: char = ',';

/// Separator between the parts of a group entry in `/grouplist`.
pub const GROUP_ENTRY_DELIMITER: char = ':';

/// Size of one chunk on the binary transfer channel.
pub const TRANSFER_CHUNK_SIZE: usize = 8192;

/// Progress word written on the SEND leg when the server fails to store a chunk.
pub const PROGRESS_FAILED: i32 = -1;

/// Kind of a persisted chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Private,
    Group,
    Global,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Private => "private",
            MessageKind::Group => "group",
            MessageKind::Global => "global",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "private" => Some(MessageKind::Private),
            "group" => Some(MessageKind::Group),
            "global" => Some(MessageKind::Global),
            _ => None,
        }
    }
}

/// Role announced by a client when it opens a transfer-channel socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferRole {
    /// Upload the announced file to the server.
    Send,
    /// Download a stored file from the server.
    Receive,
}

impl TransferRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransferRole::Send => "SEND",
            TransferRole::Receive => "RECEIVE",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            // Older clients announce group uploads separately; the server treats them alike.
            "SEND" | "SEND_GROUP" => Ok(TransferRole::Send),
            "RECEIVE" => Ok(TransferRole::Receive),
            _ => Err(Error::InvalidTransferRole(s.to_string())),
        }
    }
}

/// Why a login attempt was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LoginFailure {
    UnknownAccount,
    InvalidCredentials,
    AlreadyOnline,
    Malformed,
}

impl LoginFailure {
    pub fn as_str(&self) -> &'static str {
        match self {
            LoginFailure::UnknownAccount => "UNKNOWN_ACCOUNT",
            LoginFailure::InvalidCredentials => "INVALID_CREDENTIALS",
            LoginFailure::AlreadyOnline => "ALREADY_ONLINE",
            LoginFailure::Malformed => "MALFORMED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "UNKNOWN_ACCOUNT" => Some(LoginFailure::UnknownAccount),
            "INVALID_CREDENTIALS" => Some(LoginFailure::InvalidCredentials),
            "ALREADY_ONLINE" => Some(LoginFailure::AlreadyOnline),
            "MALFORMED" => Some(LoginFailure::Malformed),
            _ => None,
        }
    }

    /// Human readable text sent alongside the code.
    pub fn description(&self) -> &'static str {
        match self {
            LoginFailure::UnknownAccount => "Account does not exist",
            LoginFailure::InvalidCredentials => "Wrong username or password",
            LoginFailure::AlreadyOnline => "Account is already connected elsewhere",
            LoginFailure::Malformed => "Expected username|password",
        }
    }
}

/// Error codes carried by `/error` responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    Malformed,
    UnknownCommand,
    Unauthenticated,
    NotFound,
    PermissionDenied,
    Duplicate,
    Unavailable,
    TransferFailed,
    Internal,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::Malformed => "MALFORMED",
            ErrorCode::UnknownCommand => "UNKNOWN_COMMAND",
            ErrorCode::Unauthenticated => "UNAUTHENTICATED",
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::PermissionDenied => "PERMISSION_DENIED",
            ErrorCode::Duplicate => "DUPLICATE",
            ErrorCode::Unavailable => "UNAVAILABLE",
            ErrorCode::TransferFailed => "TRANSFER_FAILED",
            ErrorCode::Internal => "INTERNAL",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "MALFORMED" => Some(ErrorCode::Malformed),
            "UNKNOWN_COMMAND" => Some(ErrorCode::UnknownCommand),
            "UNAUTHENTICATED" => Some(ErrorCode::Unauthenticated),
            "NOT_FOUND" => Some(ErrorCode::NotFound),
            "PERMISSION_DENIED" => Some(ErrorCode::PermissionDenied),
            "DUPLICATE" => Some(ErrorCode::Duplicate),
            "UNAVAILABLE" => Some(ErrorCode::Unavailable),
            "TRANSFER_FAILED" => Some(ErrorCode::TransferFailed),
            "INTERNAL" => Some(ErrorCode::Internal),
            _ => None,
        }
    }
}

/// Which copy of a private message a session is receiving.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Echo to the author.
    Sent,
    /// Delivery to the recipient.
    Received,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Sent => "SENT",
            Direction::Received => "RECEIVED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "SENT" => Some(Direction::Sent),
            "RECEIVED" => Some(Direction::Received),
            _ => None,
        }
    }
}

/// How a member came to leave a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LeaveReason {
    Left,
    Removed,
}

impl LeaveReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            LeaveReason::Left => "LEFT",
            LeaveReason::Removed => "REMOVED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "LEFT" => Some(LeaveReason::Left),
            "REMOVED" => Some(LeaveReason::Removed),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transfer_role_parse() {
        assert_eq!(TransferRole::parse("SEND").unwrap(), TransferRole::Send);
        assert_eq!(TransferRole::parse("SEND_GROUP").unwrap(), TransferRole::Send);
        assert_eq!(TransferRole::parse("RECEIVE").unwrap(), TransferRole::Receive);
        assert!(TransferRole::parse("send").is_err());
    }

    #[test]
    fn test_message_kind_parse() {
        for kind in [MessageKind::Private, MessageKind::Group, MessageKind::Global] {
            assert_eq!(MessageKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(MessageKind::parse("channel"), None);
    }

    #[test]
    fn test_login_failures_are_distinct() {
        let codes = [
            LoginFailure::UnknownAccount.as_str(),
            LoginFailure::InvalidCredentials.as_str(),
            LoginFailure::AlreadyOnline.as_str(),
        ];
        assert_ne!(codes[0], codes[1]);
        assert_ne!(codes[1], codes[2]);
        assert_ne!(codes[0], codes[2]);
    }
}
