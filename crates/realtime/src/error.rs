use tandem_common::protocol::ws::{Envelope, MessageType};
use thiserror::Error;

use crate::auth::AuthError;
use crate::connection::ConnectionId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    AuthError,
    AlreadyAuthenticated,
    Unauthorized,
    ParseError,
    MessageHandlingError,
    UnsupportedMessage,
    WorkspaceNotJoined,
    InternalError,
}

impl ErrorCode {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::AuthError => "AUTH_ERROR",
            Self::AlreadyAuthenticated => "ALREADY_AUTHENTICATED",
            Self::Unauthorized => "UNAUTHORIZED",
            Self::ParseError => "PARSE_ERROR",
            Self::MessageHandlingError => "MESSAGE_HANDLING_ERROR",
            Self::UnsupportedMessage => "UNSUPPORTED_MESSAGE",
            Self::WorkspaceNotJoined => "WORKSPACE_NOT_JOINED",
            Self::InternalError => "INTERNAL_ERROR",
        }
    }

    pub const fn default_message(self) -> &'static str {
        match self {
            Self::AuthError => "authentication failed",
            Self::AlreadyAuthenticated => "connection is already authenticated",
            Self::Unauthorized => "authenticate before sending this message",
            Self::ParseError => "invalid message payload",
            Self::MessageHandlingError => "failed to handle message",
            Self::UnsupportedMessage => "message type is not supported by this server",
            Self::WorkspaceNotJoined => "connection has not joined this workspace",
            Self::InternalError => "internal server error",
        }
    }
}

/// Failure classes of the realtime layer. Only `Auth` is fatal to a
/// connection; every other variant is scoped to the offending message.
#[derive(Debug, Error)]
pub enum RealtimeError {
    #[error("authentication failed: {0}")]
    Auth(#[from] AuthError),
    #[error("connection is already authenticated")]
    AlreadyAuthenticated,
    #[error("connection is not authenticated")]
    Unauthorized,
    #[error("invalid message: {0}")]
    Parse(String),
    #[error("handler for {message_type} failed: {reason}")]
    MessageHandling { message_type: MessageType, reason: String },
    #[error("message type {0} is not supported")]
    Unsupported(MessageType),
    #[error("message type {0} is handled internally and cannot be registered")]
    ReservedMessageType(MessageType),
    #[error("connection has not joined workspace {0}")]
    NotJoined(String),
    #[error("connection {0} not found")]
    ConnectionNotFound(ConnectionId),
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("connection {0} missed its heartbeat deadline")]
    StaleConnection(ConnectionId),
}

impl RealtimeError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Auth(_) => ErrorCode::AuthError,
            Self::AlreadyAuthenticated => ErrorCode::AlreadyAuthenticated,
            Self::Unauthorized => ErrorCode::Unauthorized,
            Self::Parse(_) => ErrorCode::ParseError,
            Self::MessageHandling { .. } => ErrorCode::MessageHandlingError,
            Self::Unsupported(_) | Self::ReservedMessageType(_) => ErrorCode::UnsupportedMessage,
            Self::NotJoined(_) => ErrorCode::WorkspaceNotJoined,
            Self::ConnectionNotFound(_) | Self::Transport(_) | Self::StaleConnection(_) => {
                ErrorCode::InternalError
            }
        }
    }

    /// Whether the connection must be closed after reporting this error.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Auth(_))
    }

    /// Renders the error as the envelope sent to the peer.
    pub fn to_envelope(&self, request_id: Option<String>) -> Envelope {
        let envelope = match self {
            Self::Unauthorized => Envelope::new(
                MessageType::Unauthorized,
                serde_json::json!({
                    "code": ErrorCode::Unauthorized.as_str(),
                    "message": ErrorCode::Unauthorized.default_message(),
                }),
            ),
            Self::ConnectionNotFound(_) | Self::Transport(_) | Self::StaleConnection(_) => {
                Envelope::error(
                    ErrorCode::InternalError.as_str(),
                    ErrorCode::InternalError.default_message(),
                )
            }
            other => Envelope::error(other.code().as_str(), other.to_string()),
        };
        envelope.with_request_id(request_id)
    }
}
