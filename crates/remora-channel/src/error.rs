//! Error types for the invocation channel.

use remora_protocol::ErrorCode;
use thiserror::Error;

/// Errors that can occur while talking to the target process.
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Target unreachable: {0}")]
    Unreachable(String),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Remote error ({code:?}): {message}")]
    Remote { code: ErrorCode, message: String },
}

impl ChannelError {
    pub fn remote(code: ErrorCode, message: impl Into<String>) -> Self {
        ChannelError::Remote {
            code,
            message: message.into(),
        }
    }

    /// The agent's error code, when the failure was reported by the target.
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            ChannelError::Remote { code, .. } => Some(*code),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, ChannelError>;
