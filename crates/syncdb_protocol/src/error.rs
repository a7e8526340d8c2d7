//! Error types for the sync protocol.

use crate::message::SessionToken;
use crate::session::SessionState;
use syncdb_codec::CodecError;
use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors raised while framing messages or driving a session.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProtocolError {
    /// The frame ended before a declared field was complete.
    #[error("truncated payload: needed {needed} bytes, {available} available")]
    TruncatedPayload {
        /// Bytes the read required.
        needed: usize,
        /// Bytes left in the frame.
        available: usize,
    },

    /// An entry is structurally invalid.
    #[error("malformed entry: {reason}")]
    MalformedEntry {
        /// What was wrong with it.
        reason: String,
    },

    /// The request carries a protocol version this build does not speak.
    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u8),

    /// The response status byte is not a known status.
    #[error("unknown response status 0x{0:02x}")]
    UnknownStatus(u8),

    /// A response does not belong to the session in flight.
    #[error("stale session: expected {expected:?}, received {received}")]
    StaleSession {
        /// Token of the session in flight, if any.
        expected: Option<SessionToken>,
        /// Token carried by the response.
        received: SessionToken,
    },

    /// A session was asked to move between states that are not adjacent.
    #[error("invalid session transition from {from:?} to {to:?}")]
    InvalidTransition {
        /// Current state.
        from: SessionState,
        /// Requested state.
        to: SessionState,
    },

    /// Any other codec failure inside a frame.
    #[error("codec error: {0}")]
    Codec(CodecError),
}

impl ProtocolError {
    /// Creates a malformed entry error.
    pub fn malformed(reason: impl Into<String>) -> Self {
        Self::MalformedEntry {
            reason: reason.into(),
        }
    }

    /// Returns true if the error came from decoding a frame.
    pub fn is_decode_error(&self) -> bool {
        matches!(
            self,
            Self::TruncatedPayload { .. }
                | Self::MalformedEntry { .. }
                | Self::UnsupportedVersion(_)
                | Self::UnknownStatus(_)
                | Self::Codec(_)
        )
    }
}

impl From<CodecError> for ProtocolError {
    fn from(err: CodecError) -> Self {
        match err {
            CodecError::TruncatedPayload { needed, available } => {
                Self::TruncatedPayload { needed, available }
            }
            other => Self::Codec(other),
        }
    }
}
