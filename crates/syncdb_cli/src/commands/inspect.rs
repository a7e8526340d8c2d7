//! Inspect command implementation.

use super::{format_size, load, CliResult, Format};
use serde::Serialize;
use std::path::Path;
use syncdb_core::{format_entry, Entry};
use syncdb_storage::StorageBackend;

/// Database inspection result.
#[derive(Debug, Serialize)]
pub struct InspectReport {
    /// Database path.
    pub path: String,
    /// File size in bytes.
    pub file_size: u64,
    /// Bytes held by superseded records.
    pub garbage_bytes: u64,
    /// Number of stored records, metadata included.
    pub record_count: usize,
    /// Number of live entries.
    pub entry_count: usize,
    /// Number of removed entries awaiting sync.
    pub tombstone_count: usize,
    /// Highest server version applied.
    pub cursor: u64,
    /// Keys the server has not acknowledged.
    pub dirty: Vec<String>,
    /// Per-entry details, if requested.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entries: Option<Vec<EntryReport>>,
}

/// One entry as shown by `inspect` and `get`.
#[derive(Debug, Serialize)]
pub struct EntryReport {
    /// Key.
    pub key: String,
    /// Committed local value.
    pub value: String,
    /// Local write counter.
    pub local_version: u64,
    /// Last value confirmed by the server.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_value: Option<String>,
    /// Server version of `server_value`.
    pub server_version: u64,
    /// Whether the entry awaits sync.
    pub dirty: bool,
    /// One-line rendering.
    #[serde(skip)]
    pub summary: String,
}

impl EntryReport {
    /// Builds the report for `entry`.
    pub fn new(entry: &Entry, dirty: bool) -> Self {
        Self {
            key: entry.key.clone(),
            value: entry.value.to_string(),
            local_version: entry.local_version,
            server_value: entry.server_value.as_ref().map(ToString::to_string),
            server_version: entry.server_version,
            dirty,
            summary: format_entry(entry),
        }
    }
}

/// Collects the report without printing it.
pub fn collect(path: &Path, with_entries: bool) -> CliResult<InspectReport> {
    let (store, state) = load(path)?;
    let backend = store.backend();

    let tombstone_count = state.entries.values().filter(|e| e.is_tombstone()).count();
    let entries = with_entries.then(|| {
        state
            .entries
            .values()
            .map(|e| EntryReport::new(e, state.dirty.contains(&e.key)))
            .collect()
    });

    Ok(InspectReport {
        path: path.display().to_string(),
        file_size: backend.size(),
        garbage_bytes: backend.garbage_bytes(),
        record_count: backend.keys()?.len(),
        entry_count: state.entries.len() - tombstone_count,
        tombstone_count,
        cursor: state.cursor,
        dirty: state.dirty.into_iter().collect(),
        entries,
    })
}

/// Runs the inspect command.
pub fn run(path: &Path, with_entries: bool, format: Format) -> CliResult<()> {
    let report = collect(path, with_entries)?;
    match format {
        Format::Json => println!("{}", serde_json::to_string_pretty(&report)?),
        Format::Text => print_text(&report),
    }
    Ok(())
}

fn print_text(report: &InspectReport) {
    println!("SyncDB Database Inspection");
    println!("==========================");
    println!();
    println!("Path: {}", report.path);
    println!();
    println!("Storage:");
    println!("  File size:  {}", format_size(report.file_size));
    println!("  Garbage:    {}", format_size(report.garbage_bytes));
    println!("  Records:    {}", report.record_count);
    println!();
    println!("Sync:");
    println!("  Cursor:     {}", report.cursor);
    println!("  Entries:    {}", report.entry_count);
    println!("  Tombstones: {}", report.tombstone_count);
    println!("  Dirty:      {}", report.dirty.len());
    for key in &report.dirty {
        println!("    {key}");
    }

    if let Some(entries) = &report.entries {
        println!();
        println!("Entries:");
        for entry in entries {
            let marker = if entry.dirty { "*" } else { " " };
            println!(" {marker} {}", entry.summary);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::fixtures::write_sample;

    #[test]
    fn counts_entries_and_dirty_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db.sdb");
        write_sample(&path);

        let report = collect(&path, true).unwrap();
        assert_eq!(report.entry_count, 2);
        assert_eq!(report.tombstone_count, 1);
        assert_eq!(report.cursor, 0);
        assert_eq!(report.dirty, vec!["a", "b", "gone"]);

        let entries = report.entries.unwrap();
        assert_eq!(entries[0].key, "a");
        assert_eq!(entries[0].value, "1");
        assert!(entries[0].server_value.is_none());
    }

    #[test]
    fn json_omits_entries_unless_asked() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db.sdb");
        write_sample(&path);

        let json = serde_json::to_value(collect(&path, false).unwrap()).unwrap();
        assert!(json.get("entries").is_none());
        assert_eq!(json["tombstone_count"], 1);
    }
}
