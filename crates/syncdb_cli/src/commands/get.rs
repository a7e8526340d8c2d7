//! Get command implementation.

use super::inspect::EntryReport;
use super::{load, CliError, CliResult, Format};
use std::path::Path;

/// Looks up one entry; tombstones count as missing.
pub fn lookup(path: &Path, key: &str) -> CliResult<EntryReport> {
    let (_, state) = load(path)?;
    match state.entries.get(key) {
        Some(entry) if !entry.is_tombstone() => {
            Ok(EntryReport::new(entry, state.dirty.contains(key)))
        }
        _ => Err(CliError::MissingKey(key.to_string())),
    }
}

/// Runs the get command.
pub fn run(path: &Path, key: &str, verbose: bool, format: Format) -> CliResult<()> {
    let report = lookup(path, key)?;
    match format {
        Format::Json => println!("{}", serde_json::to_string_pretty(&report)?),
        Format::Text if verbose => println!("{}", report.summary),
        Format::Text => println!("{}", report.value),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::fixtures::write_sample;

    #[test]
    fn live_and_removed_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db.sdb");
        write_sample(&path);

        let report = lookup(&path, "b").unwrap();
        assert_eq!(report.value, "\"x\"");
        assert!(report.dirty);
        assert!(matches!(
            lookup(&path, "gone"),
            Err(CliError::MissingKey(_))
        ));
        assert!(matches!(lookup(&path, "nope"), Err(CliError::MissingKey(_))));
    }
}
