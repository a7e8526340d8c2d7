//! Error types for the SyncDB core.

use crate::dbutil::ValidationError;
use syncdb_codec::CodecError;
use syncdb_protocol::ProtocolError;
use syncdb_storage::StorageError;
use thiserror::Error;

/// Result type for SyncDB operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur in SyncDB operations.
#[derive(Error, Debug)]
pub enum SyncError {
    /// A local write was rejected before any mutation.
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),

    /// Storage collaborator error.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// A persisted record could not be decoded.
    #[error("corrupt record for key {key:?}: {source}")]
    CorruptRecord {
        /// Key of the damaged record.
        key: String,
        /// Underlying decode failure.
        source: CodecError,
    },

    /// Framing or session sequencing error.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Network or transport error.
    #[error("transport error: {message}")]
    Transport {
        /// Error message.
        message: String,
        /// Whether the operation can be retried.
        retryable: bool,
    },

    /// The transport did not answer in time.
    #[error("operation timed out")]
    Timeout,

    /// A session is already in flight.
    #[error("a sync session is already in flight")]
    SyncInProgress,
}

impl SyncError {
    /// Creates a retryable transport error.
    pub fn transport_retryable(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable transport error.
    pub fn transport_fatal(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: false,
        }
    }

    /// Returns true if this error can be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Transport { retryable, .. } => *retryable,
            SyncError::Timeout | SyncError::SyncInProgress => true,
            SyncError::Protocol(ProtocolError::StaleSession { .. }) => true,
            _ => false,
        }
    }
}
