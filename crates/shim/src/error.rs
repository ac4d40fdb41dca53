use std::time::Duration;

use chaincode_protocol::{CodecError, MessageType, Response};
use thiserror::Error;

pub type ShimResult<T> = Result<T, ShimError>;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum HandshakeError {
    #[error("no ready confirmation within {0:?}")]
    Timeout(Duration),
    #[error("stream closed during registration")]
    StreamClosed,
    #[error("peer rejected registration: {0}")]
    Rejected(String),
    #[error("unexpected {received} while {phase}")]
    UnexpectedMessage {
        received: MessageType,
        phase: &'static str,
    },
    #[error("session already started")]
    AlreadyStarted,
}

#[derive(Debug, Error)]
pub enum ShimError {
    #[error("handshake failed: {0}")]
    Handshake(#[from] HandshakeError),

    #[error("transport failure: {0}")]
    Transport(String),

    #[error("{kind} request timed out after {timeout:?}")]
    RequestTimeout {
        kind: MessageType,
        timeout: Duration,
    },

    #[error("transaction cancelled")]
    Cancelled,

    #[error("{0}")]
    Application(String),

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("payload codec error: {0}")]
    Codec(#[from] CodecError),
}

impl ShimError {
    pub fn transport<M: Into<String>>(message: M) -> Self {
        ShimError::Transport(message.into())
    }

    pub fn violation<M: Into<String>>(message: M) -> Self {
        ShimError::ProtocolViolation(message.into())
    }

    /// Handshake and transport failures end the session; everything else is
    /// confined to the transaction that raised it.
    pub fn is_session_fatal(&self) -> bool {
        matches!(self, ShimError::Handshake(_) | ShimError::Transport(_))
    }

    /// Status code reported in the failure payload sent to the peer.
    pub fn status(&self) -> i32 {
        match self {
            ShimError::InvalidArgument(_) => Response::ERROR_THRESHOLD,
            _ => Response::ERROR,
        }
    }

    /// Structured failure payload for a transaction that ended with this error.
    pub fn to_response(&self) -> Response {
        Response::error_with_status(self.status(), self.to_string())
    }
}

impl From<serde_json::Error> for ShimError {
    fn from(err: serde_json::Error) -> Self {
        ShimError::Codec(CodecError::Json(err))
    }
}
