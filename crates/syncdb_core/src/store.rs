//! Persistence of entries, the dirty set and the server cursor.
//!
//! [`BackendStore`] lays a SyncDB table out on any flat
//! [`StorageBackend`]:
//!
//! | key     | value                                        |
//! |---------|----------------------------------------------|
//! | `syncv` | server cursor (varint)                       |
//! | `syncm` | dirty keys, an encoded `Set` of `Text`       |
//! | *key*   | entry record                                 |
//!
//! An entry record is
//! `format (u8) | local version | server version | local value | has server value (u8) | [server value]`.

use crate::dbutil::{is_reserved_key, ValidationError, META_MODS_KEY, META_VERSION_KEY};
use crate::entry::Entry;
use crate::error::{SyncError, SyncResult};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use syncdb_codec::{
    decode_value, encode_value, from_bytes, to_bytes, CodecError, PayloadReader, PayloadWriter,
    Value,
};
use syncdb_storage::{InMemoryBackend, StorageBackend};

const RECORD_FORMAT: u8 = 1;

/// Everything a database needs at open time.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StoredState {
    /// All entries by key.
    pub entries: BTreeMap<String, Entry>,
    /// Keys with changes the server has not acknowledged.
    pub dirty: BTreeSet<String>,
    /// Highest server version applied.
    pub cursor: u64,
}

/// Storage collaborator of a [`crate::SyncDb`].
pub trait EntryStore: Send + Sync {
    /// Loads the persisted table.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot be read or holds corrupt records.
    fn load(&self) -> SyncResult<StoredState>;

    /// Persists one entry together with its dirty flag.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    fn save_entry(&self, entry: &Entry, dirty: bool) -> SyncResult<()>;

    /// Persists the server cursor.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    fn save_cursor(&self, cursor: u64) -> SyncResult<()>;

    /// Flushes pending writes to durable storage.
    ///
    /// # Errors
    ///
    /// Returns an error if the flush fails.
    fn flush(&self) -> SyncResult<()> {
        Ok(())
    }
}

/// An [`EntryStore`] over a flat key/value [`StorageBackend`].
#[derive(Debug)]
pub struct BackendStore<B: StorageBackend> {
    backend: B,
    dirty: Mutex<Option<BTreeSet<String>>>,
}

impl BackendStore<InMemoryBackend> {
    /// Creates a store over a fresh in-memory backend.
    pub fn in_memory() -> Self {
        Self::new(InMemoryBackend::new())
    }
}

impl<B: StorageBackend> BackendStore<B> {
    /// Wraps `backend`.
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            dirty: Mutex::new(None),
        }
    }

    /// Returns the underlying backend.
    pub fn backend(&self) -> &B {
        &self.backend
    }

    fn read_dirty(&self) -> SyncResult<BTreeSet<String>> {
        let Some(bytes) = self.backend.get(META_MODS_KEY)? else {
            return Ok(BTreeSet::new());
        };
        let value = from_bytes(&bytes).map_err(|source| corrupt(META_MODS_KEY, source))?;
        match value {
            Value::Set(items) => items
                .into_iter()
                .map(|item| match item {
                    Value::Text(key) => Ok(key),
                    other => Err(corrupt(
                        META_MODS_KEY,
                        CodecError::TypeMismatch {
                            expected: "text",
                            found: other.kind().name(),
                        },
                    )),
                })
                .collect(),
            other => Err(corrupt(
                META_MODS_KEY,
                CodecError::TypeMismatch {
                    expected: "set",
                    found: other.kind().name(),
                },
            )),
        }
    }

    fn read_cursor(&self) -> SyncResult<u64> {
        let Some(bytes) = self.backend.get(META_VERSION_KEY)? else {
            return Ok(0);
        };
        let mut reader = PayloadReader::new(&bytes);
        let cursor = reader
            .read_varint()
            .and_then(|cursor| reader.expect_end().map(|()| cursor))
            .map_err(|source| corrupt(META_VERSION_KEY, source))?;
        Ok(cursor)
    }
}

impl<B: StorageBackend> EntryStore for BackendStore<B> {
    fn load(&self) -> SyncResult<StoredState> {
        let mut state = StoredState {
            cursor: self.read_cursor()?,
            dirty: self.read_dirty()?,
            ..StoredState::default()
        };
        for key in self.backend.keys()? {
            if is_reserved_key(&key) {
                continue;
            }
            if let Some(bytes) = self.backend.get(&key)? {
                let entry = decode_entry(&key, &bytes).map_err(|source| corrupt(&key, source))?;
                state.entries.insert(key, entry);
            }
        }
        // Dirty keys without a record cannot be pushed
        state.dirty.retain(|key| state.entries.contains_key(key));
        *self.dirty.lock() = Some(state.dirty.clone());
        Ok(state)
    }

    fn save_entry(&self, entry: &Entry, dirty: bool) -> SyncResult<()> {
        if is_reserved_key(&entry.key) {
            return Err(ValidationError::ReservedKey(entry.key.clone()).into());
        }
        self.backend.set(&entry.key, &encode_entry(entry))?;

        let mut cached = self.dirty.lock();
        if cached.is_none() {
            *cached = Some(self.read_dirty()?);
        }
        let set = cached.get_or_insert_with(BTreeSet::new);
        let changed = if dirty {
            set.insert(entry.key.clone())
        } else {
            set.remove(&entry.key)
        };
        if changed {
            let value = Value::Set(set.iter().map(|k| Value::Text(k.clone())).collect());
            self.backend.set(META_MODS_KEY, &to_bytes(&value))?;
        }
        Ok(())
    }

    fn save_cursor(&self, cursor: u64) -> SyncResult<()> {
        let mut writer = PayloadWriter::with_capacity(10);
        writer.write_varint(cursor);
        self.backend.set(META_VERSION_KEY, writer.as_bytes())?;
        Ok(())
    }

    fn flush(&self) -> SyncResult<()> {
        self.backend.flush()?;
        Ok(())
    }
}

/// Encodes an entry record.
pub fn encode_entry(entry: &Entry) -> Vec<u8> {
    let mut writer = PayloadWriter::new();
    writer.write_u8(RECORD_FORMAT);
    writer.write_varint(entry.local_version);
    writer.write_varint(entry.server_version);
    encode_value(&mut writer, &entry.value);
    match &entry.server_value {
        Some(value) => {
            writer.write_u8(1);
            encode_value(&mut writer, value);
        }
        None => writer.write_u8(0),
    }
    writer.into_vec()
}

/// Decodes an entry record stored under `key`.
///
/// # Errors
///
/// Returns a codec error if the record is malformed.
pub fn decode_entry(key: &str, bytes: &[u8]) -> Result<Entry, CodecError> {
    let mut reader = PayloadReader::new(bytes);
    let format = reader.read_u8()?;
    if format != RECORD_FORMAT {
        return Err(CodecError::non_canonical(format!(
            "unknown entry record format {format}"
        )));
    }
    let local_version = reader.read_varint()?;
    let server_version = reader.read_varint()?;
    let value = decode_value(&mut reader)?;
    let server_value = match reader.read_u8()? {
        0 => None,
        1 => Some(decode_value(&mut reader)?),
        other => {
            return Err(CodecError::non_canonical(format!(
                "invalid server value flag {other}"
            )))
        }
    };
    reader.expect_end()?;
    Ok(Entry {
        key: key.to_string(),
        value,
        local_version,
        server_value,
        server_version,
    })
}

fn corrupt(key: &str, source: CodecError) -> SyncError {
    SyncError::CorruptRecord {
        key: key.to_string(),
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn entry(key: &str, value: Value, local_version: u64) -> Entry {
        Entry {
            key: key.into(),
            value,
            local_version,
            server_value: None,
            server_version: 0,
        }
    }

    #[test]
    fn entry_record_roundtrip() {
        let mut e = entry("bag", Value::set(["a", "b"]), 3);
        assert_eq!(decode_entry("bag", &encode_entry(&e)).unwrap(), e);

        e.server_value = Some(Value::set(["a"]));
        e.server_version = 2;
        assert_eq!(decode_entry("bag", &encode_entry(&e)).unwrap(), e);
    }

    #[test]
    fn reject_bad_records() {
        let bytes = encode_entry(&entry("k", Value::Integer(1), 1));

        let mut bad_format = bytes.clone();
        bad_format[0] = 9;
        assert!(decode_entry("k", &bad_format).is_err());

        let mut trailing = bytes.clone();
        trailing.push(0);
        assert!(matches!(
            decode_entry("k", &trailing),
            Err(CodecError::TrailingBytes { count: 1 })
        ));

        assert!(decode_entry("k", &bytes[..bytes.len() - 1]).unwrap_err().is_truncation());
    }

    #[test]
    fn save_and_load() {
        let backend = Arc::new(InMemoryBackend::new());
        let store = BackendStore::new(Arc::clone(&backend));

        store.save_entry(&entry("a", Value::Integer(1), 1), true).unwrap();
        store.save_entry(&entry("b", Value::from("x"), 2), true).unwrap();
        store.save_entry(&entry("b", Value::from("y"), 3), false).unwrap();
        store.save_cursor(42).unwrap();

        // A fresh store over the same backend sees everything
        let reopened = BackendStore::new(backend);
        let state = reopened.load().unwrap();
        assert_eq!(state.cursor, 42);
        assert_eq!(state.dirty, BTreeSet::from(["a".to_string()]));
        assert_eq!(state.entries.len(), 2);
        assert_eq!(state.entries["b"].value, Value::from("y"));
        assert_eq!(state.entries["b"].local_version, 3);
    }

    #[test]
    fn empty_backend_loads_default() {
        let store = BackendStore::in_memory();
        assert_eq!(store.load().unwrap(), StoredState::default());
    }

    #[test]
    fn corrupt_entry_is_reported() {
        let store = BackendStore::in_memory();
        store.backend().set("broken", &[0xff]).unwrap();
        let err = store.load().unwrap_err();
        assert!(matches!(err, SyncError::CorruptRecord { ref key, .. } if key == "broken"));
    }

    #[test]
    fn corrupt_cursor_is_reported() {
        let store = BackendStore::in_memory();
        store.backend().set(META_VERSION_KEY, &[0x80]).unwrap();
        assert!(matches!(
            store.load(),
            Err(SyncError::CorruptRecord { .. })
        ));
    }

    #[test]
    fn reserved_keys_are_refused() {
        let store = BackendStore::in_memory();
        store.save_cursor(4).unwrap();
        store.save_entry(&entry("a", Value::Integer(1), 1), true).unwrap();

        for key in [META_MODS_KEY, META_VERSION_KEY] {
            assert!(matches!(
                store.save_entry(&entry(key, Value::Integer(5), 1), false),
                Err(SyncError::Validation(ValidationError::ReservedKey(_)))
            ));
        }

        let state = store.load().unwrap();
        assert_eq!(state.cursor, 4);
        assert_eq!(state.dirty.into_iter().collect::<Vec<_>>(), vec!["a"]);
    }
}
