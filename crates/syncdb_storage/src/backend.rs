//! Storage backend trait definition.

use crate::error::StorageResult;
use std::sync::Arc;

/// A flat key/value storage backend for SyncDB.
///
/// Backends are **opaque byte stores** keyed by strings. They do not
/// interpret the values they hold; SyncDB owns the record format.
///
/// # Invariants
///
/// - `get` after a successful `set` returns exactly the bytes written
///   (read-after-write visibility)
/// - `flush` makes every completed `set`/`remove` durable
/// - Backends must be `Send + Sync`; all methods take `&self` and
///   synchronize internally
///
/// # Implementors
///
/// - [`super::InMemoryBackend`] - For testing
/// - [`super::FileBackend`] - For persistent storage
pub trait StorageBackend: Send + Sync {
    /// Returns the bytes stored under `key`, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot be read.
    fn get(&self, key: &str) -> StorageResult<Option<Vec<u8>>>;

    /// Stores `value` under `key`, replacing any previous value.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    fn set(&self, key: &str, value: &[u8]) -> StorageResult<()>;

    /// Removes `key`. Returns whether a value was present.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    fn remove(&self, key: &str) -> StorageResult<bool>;

    /// Returns every stored key in ascending order.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot be read.
    fn keys(&self) -> StorageResult<Vec<String>>;

    /// Flushes all pending writes to durable storage.
    ///
    /// # Errors
    ///
    /// Returns an error if the flush operation fails.
    fn flush(&self) -> StorageResult<()>;
}

impl<B: StorageBackend + ?Sized> StorageBackend for Arc<B> {
    fn get(&self, key: &str) -> StorageResult<Option<Vec<u8>>> {
        (**self).get(key)
    }

    fn set(&self, key: &str, value: &[u8]) -> StorageResult<()> {
        (**self).set(key, value)
    }

    fn remove(&self, key: &str) -> StorageResult<bool> {
        (**self).remove(key)
    }

    fn keys(&self) -> StorageResult<Vec<String>> {
        (**self).keys()
    }

    fn flush(&self) -> StorageResult<()> {
        (**self).flush()
    }
}
