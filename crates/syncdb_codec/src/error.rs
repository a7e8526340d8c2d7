//! Error types for the codec crate.

use thiserror::Error;

/// Result type for codec operations.
pub type CodecResult<T> = Result<T, CodecError>;

/// Errors that can occur while reading payloads or decoding values.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// The buffer was exhausted in the middle of a read.
    #[error("truncated payload: needed {needed} bytes, {available} available")]
    TruncatedPayload {
        /// Bytes the read required.
        needed: usize,
        /// Bytes left in the buffer.
        available: usize,
    },

    /// A varint did not terminate within 10 bytes or overflowed `u64`.
    #[error("varint overflow")]
    VarIntOverflow,

    /// Invalid UTF-8 string.
    #[error("invalid UTF-8 string")]
    InvalidUtf8,

    /// Unknown value tag.
    #[error("unknown value tag 0x{0:02x}")]
    UnknownTag(u8),

    /// Input is well-formed but not in canonical form.
    #[error("non-canonical encoding: {message}")]
    NonCanonical {
        /// Description of the violation.
        message: String,
    },

    /// Declared length exceeds the hard decode limits.
    #[error("size limit exceeded: claimed {claimed}, max allowed {max_allowed}")]
    SizeLimitExceeded {
        /// The length claimed by the input.
        claimed: u64,
        /// The maximum length accepted.
        max_allowed: u64,
    },

    /// Values nested deeper than the decoder accepts.
    #[error("nesting depth exceeds {max}")]
    NestingTooDeep {
        /// Maximum nesting depth.
        max: usize,
    },

    /// Bytes left over after a complete value.
    #[error("{count} trailing bytes after value")]
    TrailingBytes {
        /// Number of unread bytes.
        count: usize,
    },

    /// A value had a different type than the caller expected.
    #[error("type mismatch: expected {expected}, found {found}")]
    TypeMismatch {
        /// Expected kind.
        expected: &'static str,
        /// Kind actually found.
        found: &'static str,
    },
}

impl CodecError {
    /// Create a non-canonical error.
    pub fn non_canonical(message: impl Into<String>) -> Self {
        Self::NonCanonical {
            message: message.into(),
        }
    }

    /// Returns true if the error means the buffer ended early.
    pub fn is_truncation(&self) -> bool {
        matches!(self, Self::TruncatedPayload { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncation_display() {
        let err = CodecError::TruncatedPayload {
            needed: 4,
            available: 1,
        };
        assert!(err.is_truncation());
        assert_eq!(
            err.to_string(),
            "truncated payload: needed 4 bytes, 1 available"
        );
        assert!(!CodecError::InvalidUtf8.is_truncation());
    }
}
