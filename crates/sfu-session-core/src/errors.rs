use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum SessionError {
    #[error("connection failed: {0}")]
    Connection(String),
    #[error("connection timed out after {0:?}")]
    Timeout(Duration),
    #[error("not connected")]
    NotConnected,
    #[error("emit failed: {0}")]
    Emit(String),
    #[error("ack timeout for {0}")]
    AckTimeout(String),
    #[error("{0}")]
    JoinRejected(String),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("invalid URL: {0}")]
    InvalidUrl(String),
    #[error("HTTP error: {0}")]
    Http(String),
    #[error("{0}")]
    Recording(String),
    #[error("{0}")]
    Breakout(String),
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for SessionError {
    fn from(e: serde_json::Error) -> Self {
        SessionError::Serialization(e.to_string())
    }
}

impl SessionError {
    /// Message suitable for a user-facing alert.
    pub fn user_message(&self) -> String {
        match self {
            SessionError::JoinRejected(msg)
            | SessionError::Recording(msg)
            | SessionError::Breakout(msg)
            | SessionError::Config(msg) => msg.clone(),
            other => other.to_string(),
        }
    }
}
