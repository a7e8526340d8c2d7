//! Dump command implementation.
//!
//! Lists the raw records of a database file, decoding what it can. Corrupt
//! records are reported rather than aborting the dump.

use super::{open_backend, CliResult, Format};
use serde::Serialize;
use std::path::Path;
use syncdb_codec::{from_bytes, CodecResult, PayloadReader};
use syncdb_core::{decode_entry, format_entry, META_MODS_KEY, META_VERSION_KEY};
use syncdb_storage::StorageBackend;

const PREVIEW_BYTES: usize = 16;

/// One raw record.
#[derive(Debug, Serialize)]
pub struct RecordInfo {
    /// Storage key.
    pub key: String,
    /// Record kind: `cursor`, `dirty-set` or `entry`.
    pub kind: &'static str,
    /// Encoded size in bytes.
    pub size: usize,
    /// Leading bytes, hex-encoded.
    pub preview: String,
    /// Decoded form.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decoded: Option<String>,
    /// Decode failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Reads records whose key starts with `prefix`, at most `limit` of them.
pub fn read_records(
    path: &Path,
    prefix: Option<&str>,
    limit: Option<usize>,
) -> CliResult<Vec<RecordInfo>> {
    let backend = open_backend(path)?;
    let mut records = Vec::new();

    for key in backend.keys()? {
        if limit.is_some_and(|limit| records.len() >= limit) {
            break;
        }
        if prefix.is_some_and(|prefix| !key.starts_with(prefix)) {
            continue;
        }
        let Some(bytes) = backend.get(&key)? else {
            continue;
        };

        let (kind, decoded) = match key.as_str() {
            META_VERSION_KEY => ("cursor", decode_cursor(&bytes).map(|c| c.to_string())),
            META_MODS_KEY => ("dirty-set", from_bytes(&bytes).map(|v| v.to_string())),
            _ => ("entry", decode_entry(&key, &bytes).map(|e| format_entry(&e))),
        };
        let (decoded, error) = match decoded {
            Ok(text) => (Some(text), None),
            Err(err) => (None, Some(err.to_string())),
        };

        records.push(RecordInfo {
            preview: hex(&bytes[..bytes.len().min(PREVIEW_BYTES)]),
            size: bytes.len(),
            key,
            kind,
            decoded,
            error,
        });
    }
    Ok(records)
}

/// Runs the dump command.
pub fn run(
    path: &Path,
    prefix: Option<&str>,
    limit: Option<usize>,
    format: Format,
) -> CliResult<()> {
    let records = read_records(path, prefix, limit)?;
    match format {
        Format::Json => println!("{}", serde_json::to_string_pretty(&records)?),
        Format::Text => {
            for record in &records {
                let detail = record
                    .decoded
                    .as_deref()
                    .or(record.error.as_deref())
                    .unwrap_or("");
                println!(
                    "{:<10} {:<24} {:>6}  {:<32}  {}",
                    record.kind, record.key, record.size, record.preview, detail
                );
            }
            println!("{} records", records.len());
        }
    }
    Ok(())
}

fn decode_cursor(bytes: &[u8]) -> CodecResult<u64> {
    let mut reader = PayloadReader::new(bytes);
    let cursor = reader.read_varint()?;
    reader.expect_end()?;
    Ok(cursor)
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::fixtures::write_sample;

    #[test]
    fn lists_entries_and_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db.sdb");
        write_sample(&path);

        let records = read_records(&path, None, None).unwrap();
        let kinds: Vec<_> = records.iter().map(|r| (r.key.as_str(), r.kind)).collect();
        assert!(kinds.contains(&("a", "entry")));
        assert!(kinds.contains(&("syncm", "dirty-set")));
        assert!(records.iter().all(|r| r.error.is_none()));

        let a = records.iter().find(|r| r.key == "a").unwrap();
        assert_eq!(a.decoded.as_deref(), Some("a = 1 (local v1, server -)"));
    }

    #[test]
    fn prefix_and_limit() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db.sdb");
        write_sample(&path);

        let records = read_records(&path, Some("g"), None).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].key, "gone");
        assert_eq!(read_records(&path, None, Some(2)).unwrap().len(), 2);
    }

    #[test]
    fn hex_preview() {
        assert_eq!(hex(&[0x00, 0xab, 0x10]), "00ab10");
    }
}
