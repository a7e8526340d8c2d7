//! Compact command implementation.

use super::{format_size, open_backend, CliResult};
use std::path::Path;

/// Compaction statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompactStats {
    /// Bytes before compaction.
    pub bytes_before: u64,
    /// Bytes after compaction, or the estimate for a dry run.
    pub bytes_after: u64,
}

impl CompactStats {
    /// Bytes reclaimed.
    pub fn saved(&self) -> u64 {
        self.bytes_before.saturating_sub(self.bytes_after)
    }
}

/// Rewrites the log keeping only live records.
pub fn compact(path: &Path, dry_run: bool) -> CliResult<CompactStats> {
    let backend = open_backend(path)?;
    let bytes_before = backend.size();
    if dry_run || backend.garbage_bytes() == 0 {
        return Ok(CompactStats {
            bytes_before,
            bytes_after: bytes_before - backend.garbage_bytes(),
        });
    }

    backend.compact()?;
    tracing::info!(before = bytes_before, after = backend.size(), "compacted");
    Ok(CompactStats {
        bytes_before,
        bytes_after: backend.size(),
    })
}

/// Runs the compact command.
pub fn run(path: &Path, dry_run: bool) -> CliResult<()> {
    println!("Compacting {}", path.display());
    if dry_run {
        println!("(dry run - no changes will be made)");
    }

    let stats = compact(path, dry_run)?;
    println!("  Size before: {}", format_size(stats.bytes_before));
    println!("  Size after:  {}", format_size(stats.bytes_after));
    println!(
        "  Space saved: {} ({:.1}%)",
        format_size(stats.saved()),
        if stats.bytes_before > 0 {
            stats.saved() as f64 / stats.bytes_before as f64 * 100.0
        } else {
            0.0
        }
    );
    if stats.saved() == 0 {
        println!("No compaction needed");
    }
    Ok(())
}
