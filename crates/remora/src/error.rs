//! Error types for sessions, proxies and event subscriptions.

use std::time::Duration;

use remora_channel::ChannelError;
use remora_protocol::ErrorCode;
use thiserror::Error;

/// Remote failures that mean "nothing there" rather than "something broke".
///
/// [`try_safe`](crate::try_safe) turns exactly these into `Ok(None)`.
pub const EXPECTED_ABSENCE: &[ErrorCode] = &[ErrorCode::MemberNotFound, ErrorCode::ValueMissing];

#[derive(Debug, Error)]
pub enum Error {
    /// The target is unreachable or the channel failed.
    #[error("Connection error: {0}")]
    Connection(String),

    /// The target rejected the credentials.
    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Timed out after {budget:?} during {operation}")]
    Timeout {
        operation: &'static str,
        budget: Duration,
    },

    /// The session, or the session a proxy or subscription belongs to, is disposed.
    #[error("Session has been disposed")]
    Disposed,

    /// The target reported a failure for one member access or invocation.
    /// `code` is `None` when the reply itself could not be understood.
    #[error("Remote call to {member} failed: {message}")]
    RemoteCall {
        member: String,
        code: Option<ErrorCode>,
        message: String,
    },

    /// Local validation failed before anything was sent.
    #[error("Invalid argument: {0}")]
    Argument(String),
}

impl Error {
    pub(crate) fn timeout(operation: &'static str, budget: Duration) -> Self {
        Error::Timeout { operation, budget }
    }

    /// Classify a channel failure that happened while accessing `member`.
    pub(crate) fn from_channel(err: ChannelError, member: &str) -> Self {
        match err {
            ChannelError::Remote {
                code: ErrorCode::AuthenticationFailed,
                message,
            } => Error::Authentication(message),
            ChannelError::Remote { code, message } => Error::RemoteCall {
                member: member.to_string(),
                code: Some(code),
                message,
            },
            ChannelError::Unreachable(message) => Error::Connection(message),
            ChannelError::ConnectionClosed => {
                Error::Connection("connection to target closed".into())
            }
            ChannelError::Io(e) => Error::Connection(e.to_string()),
            ChannelError::Protocol(message) => Error::RemoteCall {
                member: member.to_string(),
                code: None,
                message,
            },
            ChannelError::Json(e) => Error::RemoteCall {
                member: member.to_string(),
                code: None,
                message: e.to_string(),
            },
        }
    }

    /// Whether this is one of the [`EXPECTED_ABSENCE`] failures.
    pub fn is_expected_absence(&self) -> bool {
        matches!(
            self,
            Error::RemoteCall { code: Some(code), .. } if EXPECTED_ABSENCE.contains(code)
        )
    }

    /// The remote error code, if the target reported one.
    pub fn remote_code(&self) -> Option<ErrorCode> {
        match self {
            Error::RemoteCall { code, .. } => *code,
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
