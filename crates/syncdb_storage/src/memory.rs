//! In-memory storage backend for testing.

use crate::backend::StorageBackend;
use crate::error::StorageResult;
use parking_lot::RwLock;
use std::collections::BTreeMap;

/// An in-memory storage backend.
///
/// Data is lost when the backend is dropped. Share it through an
/// `Arc<InMemoryBackend>` to simulate reopening a database.
///
/// # Example
///
/// ```rust
/// use syncdb_storage::{InMemoryBackend, StorageBackend};
///
/// let backend = InMemoryBackend::new();
/// backend.set("score", b"\x03\x02").unwrap();
/// assert_eq!(backend.get("score").unwrap(), Some(vec![3, 2]));
/// ```
#[derive(Debug, Default)]
pub struct InMemoryBackend {
    data: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl InMemoryBackend {
    /// Creates a new empty in-memory backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of stored keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    /// Returns true if nothing is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }

    /// Removes every stored key.
    pub fn clear(&self) {
        self.data.write().clear();
    }
}

impl StorageBackend for InMemoryBackend {
    fn get(&self, key: &str) -> StorageResult<Option<Vec<u8>>> {
        Ok(self.data.read().get(key).cloned())
    }

    fn set(&self, key: &str, value: &[u8]) -> StorageResult<()> {
        self.data.write().insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn remove(&self, key: &str) -> StorageResult<bool> {
        Ok(self.data.write().remove(key).is_some())
    }

    fn keys(&self) -> StorageResult<Vec<String>> {
        Ok(self.data.read().keys().cloned().collect())
    }

    fn flush(&self) -> StorageResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn new_backend_is_empty() {
        let backend = InMemoryBackend::new();
        assert!(backend.is_empty());
        assert!(backend.keys().unwrap().is_empty());
    }

    #[test]
    fn set_and_get() {
        let backend = InMemoryBackend::new();
        backend.set("a", b"one").unwrap();
        assert_eq!(backend.get("a").unwrap(), Some(b"one".to_vec()));
        assert_eq!(backend.get("b").unwrap(), None);
    }

    #[test]
    fn set_replaces_previous_value() {
        let backend = InMemoryBackend::new();
        backend.set("a", b"one").unwrap();
        backend.set("a", b"two").unwrap();
        assert_eq!(backend.get("a").unwrap(), Some(b"two".to_vec()));
        assert_eq!(backend.len(), 1);
    }

    #[test]
    fn remove_reports_presence() {
        let backend = InMemoryBackend::new();
        backend.set("a", b"one").unwrap();
        assert!(backend.remove("a").unwrap());
        assert!(!backend.remove("a").unwrap());
        assert_eq!(backend.get("a").unwrap(), None);
    }

    #[test]
    fn keys_are_sorted() {
        let backend = InMemoryBackend::new();
        for key in ["zeta", "alpha", "mid"] {
            backend.set(key, b"").unwrap();
        }
        assert_eq!(backend.keys().unwrap(), vec!["alpha", "mid", "zeta"]);
    }

    #[test]
    fn shared_through_arc() {
        let backend = Arc::new(InMemoryBackend::new());
        let other: Arc<dyn StorageBackend> = backend.clone();
        other.set("k", b"v").unwrap();
        assert_eq!(backend.get("k").unwrap(), Some(b"v".to_vec()));
    }

    #[test]
    fn concurrent_writers() {
        let backend = Arc::new(InMemoryBackend::new());
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let backend = Arc::clone(&backend);
                std::thread::spawn(move || {
                    for i in 0..50 {
                        backend.set(&format!("{t}-{i}"), &[t as u8]).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(backend.len(), 200);
    }
}
