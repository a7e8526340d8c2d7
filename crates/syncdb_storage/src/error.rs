//! Error types for storage operations.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The storage file is corrupted.
    #[error("storage corrupted: {0}")]
    Corrupted(String),

    /// Another process holds the storage file.
    #[error("storage file is locked by another process: {}", .0.display())]
    Locked(PathBuf),

    /// A key or value is too large to be stored in one record.
    #[error("record too large: {len} bytes (max {max})")]
    RecordTooLarge {
        /// Size of the rejected key or value.
        len: usize,
        /// Largest size a record field can hold.
        max: usize,
    },
}
