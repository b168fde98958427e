use std::time::Duration;

use shared::{domain::ChatId, error::ApiError, frame::FrameError};
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("not authenticated")]
    NotAuthenticated,
    #[error("credential rejected by server")]
    Rejected,
    #[error("credential refresh failed: {0}")]
    RefreshFailed(String),
    #[error("invalid access token: {0}")]
    InvalidToken(String),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConnectionError {
    #[error("not connected")]
    NotConnected,
    #[error("handshake timed out after {0:?}")]
    HandshakeTimeout(Duration),
    #[error("handshake rejected: {0}")]
    HandshakeRejected(String),
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("pending outbound queue is full ({0} frames)")]
    QueueFull(usize),
    #[error("connection manager has shut down")]
    Closed,
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed payload: {0}")]
    MalformedPayload(#[from] serde_json::Error),
    #[error("malformed frame: {0}")]
    MalformedFrame(#[from] FrameError),
    #[error("event {id} is missing required field `{field}`")]
    MissingField { id: String, field: &'static str },
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("message text must not be empty")]
    EmptyMessage,
    #[error("recipient must not be empty")]
    EmptyRecipient,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("no conversation cached for chat {chat_id}")]
pub struct StaleStateError {
    pub chat_id: ChatId,
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    StaleState(#[from] StaleStateError),
    #[error("request failed with status {status}: {error}")]
    Api { status: u16, error: ApiError },
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
}

impl SyncError {
    pub fn is_auth(&self) -> bool {
        matches!(self, Self::Auth(_))
    }
}

pub type SyncResult<T> = std::result::Result<T, SyncError>;
