//! # SyncDB Storage
//!
//! Flat key/value storage backends for SyncDB.
//!
//! Storage backends are **opaque byte stores** keyed by strings. SyncDB
//! decides what the keys mean and how values are encoded; a backend only
//! has to keep them.
//!
//! ## Design Principles
//!
//! - Backends are simple key/value stores (get, set, remove, keys, flush)
//! - No knowledge of SyncDB record formats or sync metadata
//! - Must be `Send + Sync` for concurrent access
//!
//! ## Available Backends
//!
//! - [`InMemoryBackend`] - For testing and ephemeral storage
//! - [`FileBackend`] - Append-only log file with checksummed records
//!
//! ## Example
//!
//! ```rust
//! use syncdb_storage::{InMemoryBackend, StorageBackend};
//!
//! let backend = InMemoryBackend::new();
//! backend.set("player~name", b"hello world").unwrap();
//! assert_eq!(backend.get("player~name").unwrap().as_deref(), Some(&b"hello world"[..]));
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod error;
mod file;
mod memory;

pub use backend::StorageBackend;
pub use error::{StorageError, StorageResult};
pub use file::{compute_crc32, FileBackend, FILE_MAGIC, FORMAT_VERSION};
pub use memory::InMemoryBackend;
