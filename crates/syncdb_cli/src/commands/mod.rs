//! CLI command implementations.

pub mod compact;
pub mod dump;
pub mod get;
pub mod inspect;

use std::path::Path;
use syncdb_core::{BackendStore, EntryStore, StoredState, SyncError};
use syncdb_storage::{FileBackend, StorageError};
use thiserror::Error;

/// Errors surfaced by CLI commands.
#[derive(Error, Debug)]
pub enum CliError {
    /// No database file at the given path.
    #[error("no database found at {0}")]
    NotFound(String),

    /// The key does not exist or is a tombstone.
    #[error("key not found: {0}")]
    MissingKey(String),

    /// Storage failure.
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// Failure while loading the table.
    #[error(transparent)]
    Sync(#[from] SyncError),

    /// JSON output failure.
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Result type for CLI commands.
pub type CliResult<T> = Result<T, CliError>;

/// Output format shared by the reporting commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Format {
    /// Human readable text.
    Text,
    /// Pretty-printed JSON.
    Json,
}

/// Opens the database file at `path` without creating it.
pub fn open_backend(path: &Path) -> CliResult<FileBackend> {
    if !path.is_file() {
        return Err(CliError::NotFound(path.display().to_string()));
    }
    let backend = FileBackend::open(path)?;
    if backend.recovered_bytes() > 0 {
        tracing::warn!(
            bytes = backend.recovered_bytes(),
            "discarded a torn tail while opening"
        );
    }
    Ok(backend)
}

/// Loads the persisted table at `path`.
pub fn load(path: &Path) -> CliResult<(BackendStore<FileBackend>, StoredState)> {
    let store = BackendStore::new(open_backend(path)?);
    let state = store.load()?;
    Ok((store, state))
}

/// Renders a byte count for humans.
pub fn format_size(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{bytes} B")
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use std::path::Path;
    use syncdb_core::{BackendStore, MockTransport, ResolverRegistry, SyncDb, SyncDbConfig};
    use syncdb_storage::FileBackend;

    /// Writes `a = 1`, `b = "x"` and a removed `gone` to a fresh file.
    pub fn write_sample(path: &Path) {
        let db = SyncDb::open(
            SyncDbConfig::default(),
            BackendStore::new(FileBackend::open(path).unwrap()),
            MockTransport::new(),
            ResolverRegistry::default(),
        )
        .unwrap();
        db.put("a", 1).unwrap();
        db.put("b", "x").unwrap();
        db.put("gone", true).unwrap();
        db.remove("gone").unwrap();
        db.flush().unwrap();
    }
}
