//! File-based storage backend for persistent storage.
//!
//! The file is an append-only log of records:
//!
//! ```text
//! header  = magic "SDBK" | format version (u8)
//! record  = op (u8) | key_len (u32 LE) | value_len (u32 LE) | key | value | crc32 (u32 LE)
//! ```
//!
//! The CRC covers everything from `op` through `value`. On open the log is
//! replayed into an in-memory index; a torn or corrupt tail is truncated.

use crate::backend::StorageBackend;
use crate::error::{StorageError, StorageResult};
use fs2::FileExt;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Magic bytes at the start of every store file.
pub const FILE_MAGIC: [u8; 4] = *b"SDBK";

/// Current on-disk format version.
pub const FORMAT_VERSION: u8 = 1;

const HEADER_SIZE: usize = FILE_MAGIC.len() + 1;
const RECORD_OVERHEAD: usize = 1 + 4 + 4 + 4;
const MAX_FIELD_LEN: usize = u32::MAX as usize;

const OP_SET: u8 = 1;
const OP_REMOVE: u8 = 2;

/// A file-based storage backend.
///
/// Data survives process restarts. The whole key space is held in memory;
/// the file is only read at open time.
///
/// # Durability
///
/// - Every `set`/`remove` is written to the OS before it returns
/// - `flush()` calls `File::sync_data()` to ensure data is on disk
///
/// # Locking
///
/// The file is locked exclusively for the lifetime of the backend. A second
/// open of the same path fails with [`StorageError::Locked`].
///
/// # Example
///
/// ```no_run
/// use syncdb_storage::{FileBackend, StorageBackend};
/// use std::path::Path;
///
/// let backend = FileBackend::open(Path::new("player.sdb")).unwrap();
/// backend.set("coins", b"\x03\x14").unwrap();
/// backend.flush().unwrap();
/// ```
#[derive(Debug)]
pub struct FileBackend {
    path: PathBuf,
    inner: RwLock<Inner>,
    recovered_bytes: u64,
}

#[derive(Debug)]
struct Inner {
    file: File,
    index: BTreeMap<String, Vec<u8>>,
    size: u64,
    garbage: u64,
}

impl FileBackend {
    /// Opens or creates a file backend at the given path.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Locked`] if another handle holds the file,
    /// [`StorageError::Corrupted`] if the header is not a store header, or an
    /// I/O error.
    pub fn open(path: &Path) -> StorageResult<Self> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        if file.try_lock_exclusive().is_err() {
            return Err(StorageError::Locked(path.to_path_buf()));
        }

        let mut contents = Vec::new();
        file.read_to_end(&mut contents)?;

        if contents.is_empty() {
            file.write_all(&header())?;
            file.sync_data()?;
            return Ok(Self {
                path: path.to_path_buf(),
                inner: RwLock::new(Inner {
                    file,
                    index: BTreeMap::new(),
                    size: HEADER_SIZE as u64,
                    garbage: 0,
                }),
                recovered_bytes: 0,
            });
        }

        let replay = replay(&contents)?;
        let recovered_bytes = (contents.len() - replay.valid_len) as u64;
        if recovered_bytes > 0 {
            file.set_len(replay.valid_len as u64)?;
            file.sync_data()?;
        }

        Ok(Self {
            path: path.to_path_buf(),
            inner: RwLock::new(Inner {
                file,
                index: replay.index,
                size: replay.valid_len as u64,
                garbage: replay.garbage,
            }),
            recovered_bytes,
        })
    }

    /// Opens or creates a file backend, creating parent directories if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if directories cannot be created or file cannot be opened.
    pub fn open_with_create_dirs(path: &Path) -> StorageResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Self::open(path)
    }

    /// Returns the path to the underlying file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the current file size in bytes.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.inner.read().size
    }

    /// Returns the number of bytes held by superseded records.
    #[must_use]
    pub fn garbage_bytes(&self) -> u64 {
        self.inner.read().garbage
    }

    /// Returns how many trailing bytes were discarded when the file was opened.
    #[must_use]
    pub fn recovered_bytes(&self) -> u64 {
        self.recovered_bytes
    }

    /// Rewrites the log so it holds exactly one record per live key.
    ///
    /// The compacted log is written beside the original and renamed over it,
    /// so a crash leaves either the old or the new file intact.
    ///
    /// # Errors
    ///
    /// Returns an error if the compacted file cannot be written or renamed.
    pub fn compact(&self) -> StorageResult<()> {
        let mut inner = self.inner.write();
        let tmp_path = self.path.with_extension("compact");

        let mut tmp = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp_path)?;
        if tmp.try_lock_exclusive().is_err() {
            return Err(StorageError::Locked(tmp_path));
        }

        let mut buf = header().to_vec();
        for (key, value) in &inner.index {
            encode_record(&mut buf, OP_SET, key, value);
        }
        tmp.write_all(&buf)?;
        tmp.sync_all()?;
        std::fs::rename(&tmp_path, &self.path)?;

        inner.file = tmp;
        inner.size = buf.len() as u64;
        inner.garbage = 0;
        Ok(())
    }

    fn append(inner: &mut Inner, op: u8, key: &str, value: &[u8]) -> StorageResult<u64> {
        check_field(key.len())?;
        check_field(value.len())?;

        let mut buf = Vec::with_capacity(RECORD_OVERHEAD + key.len() + value.len());
        encode_record(&mut buf, op, key, value);

        inner.file.seek(SeekFrom::End(0))?;
        inner.file.write_all(&buf)?;
        inner.size += buf.len() as u64;
        Ok(buf.len() as u64)
    }
}

impl StorageBackend for FileBackend {
    fn get(&self, key: &str) -> StorageResult<Option<Vec<u8>>> {
        Ok(self.inner.read().index.get(key).cloned())
    }

    fn set(&self, key: &str, value: &[u8]) -> StorageResult<()> {
        let mut inner = self.inner.write();
        Self::append(&mut inner, OP_SET, key, value)?;
        if let Some(old) = inner.index.insert(key.to_string(), value.to_vec()) {
            inner.garbage += record_len(key, &old);
        }
        Ok(())
    }

    fn remove(&self, key: &str) -> StorageResult<bool> {
        let mut inner = self.inner.write();
        if !inner.index.contains_key(key) {
            return Ok(false);
        }
        let written = Self::append(&mut inner, OP_REMOVE, key, &[])?;
        if let Some(old) = inner.index.remove(key) {
            inner.garbage += record_len(key, &old) + written;
        }
        Ok(true)
    }

    fn keys(&self) -> StorageResult<Vec<String>> {
        Ok(self.inner.read().index.keys().cloned().collect())
    }

    fn flush(&self) -> StorageResult<()> {
        let inner = self.inner.read();
        inner.file.sync_data()?;
        Ok(())
    }
}

struct Replay {
    index: BTreeMap<String, Vec<u8>>,
    valid_len: usize,
    garbage: u64,
}

fn header() -> [u8; HEADER_SIZE] {
    let mut header = [0u8; HEADER_SIZE];
    header[..FILE_MAGIC.len()].copy_from_slice(&FILE_MAGIC);
    header[FILE_MAGIC.len()] = FORMAT_VERSION;
    header
}

fn check_field(len: usize) -> StorageResult<()> {
    if len > MAX_FIELD_LEN {
        return Err(StorageError::RecordTooLarge {
            len,
            max: MAX_FIELD_LEN,
        });
    }
    Ok(())
}

fn record_len(key: &str, value: &[u8]) -> u64 {
    (RECORD_OVERHEAD + key.len() + value.len()) as u64
}

#[allow(clippy::cast_possible_truncation)]
fn encode_record(buf: &mut Vec<u8>, op: u8, key: &str, value: &[u8]) {
    let start = buf.len();
    buf.push(op);
    buf.extend_from_slice(&(key.len() as u32).to_le_bytes());
    buf.extend_from_slice(&(value.len() as u32).to_le_bytes());
    buf.extend_from_slice(key.as_bytes());
    buf.extend_from_slice(value);
    let crc = compute_crc32(&buf[start..]);
    buf.extend_from_slice(&crc.to_le_bytes());
}

/// Replays the log, stopping at the first record that is incomplete or
/// fails its checksum.
fn replay(contents: &[u8]) -> StorageResult<Replay> {
    if contents.len() < HEADER_SIZE || contents[..FILE_MAGIC.len()] != FILE_MAGIC {
        return Err(StorageError::Corrupted("invalid file header".into()));
    }
    let version = contents[FILE_MAGIC.len()];
    if version != FORMAT_VERSION {
        return Err(StorageError::Corrupted(format!(
            "unsupported format version {version}"
        )));
    }

    let mut index: BTreeMap<String, Vec<u8>> = BTreeMap::new();
    let mut garbage = 0u64;
    let mut pos = HEADER_SIZE;

    while let Some((op, key, value, next)) = decode_record(contents, pos) {
        let this_len = (next - pos) as u64;
        match op {
            OP_SET => {
                if let Some(old) = index.insert(key.clone(), value) {
                    garbage += record_len(&key, &old);
                }
            }
            OP_REMOVE => {
                if let Some(old) = index.remove(&key) {
                    garbage += record_len(&key, &old);
                }
                garbage += this_len;
            }
            _ => break,
        }
        pos = next;
    }

    Ok(Replay {
        index,
        valid_len: pos,
        garbage,
    })
}

fn decode_record(contents: &[u8], pos: usize) -> Option<(u8, String, Vec<u8>, usize)> {
    let rest = contents.get(pos..)?;
    if rest.len() < RECORD_OVERHEAD {
        return None;
    }
    let op = rest[0];
    let key_len = u32::from_le_bytes(rest[1..5].try_into().ok()?) as usize;
    let value_len = u32::from_le_bytes(rest[5..9].try_into().ok()?) as usize;

    let body_end = 9usize.checked_add(key_len)?.checked_add(value_len)?;
    let crc_bytes = rest.get(body_end..body_end.checked_add(4)?)?;
    let stored_crc = u32::from_le_bytes(crc_bytes.try_into().ok()?);
    if compute_crc32(&rest[..body_end]) != stored_crc {
        return None;
    }

    let key = String::from_utf8(rest[9..9 + key_len].to_vec()).ok()?;
    let value = rest[9 + key_len..body_end].to_vec();
    Some((op, key, value, pos + body_end + 4))
}

/// Computes the CRC32 checksum of data (IEEE polynomial).
#[must_use]
pub fn compute_crc32(data: &[u8]) -> u32 {
    const CRC32_TABLE: [u32; 256] = {
        let mut table = [0u32; 256];
        let mut i = 0;
        while i < 256 {
            let mut crc = i as u32;
            let mut j = 0;
            while j < 8 {
                if crc & 1 != 0 {
                    crc = (crc >> 1) ^ 0xEDB8_8320;
                } else {
                    crc >>= 1;
                }
                j += 1;
            }
            table[i] = crc;
            i += 1;
        }
        table
    };

    let mut crc = 0xFFFF_FFFF_u32;
    for &byte in data {
        let index = ((crc ^ u32::from(byte)) & 0xFF) as usize;
        crc = (crc >> 8) ^ CRC32_TABLE[index];
    }
    !crc
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use tempfile::tempdir;

    #[test]
    fn crc32_known_value() {
        assert_eq!(compute_crc32(b"123456789"), 0xCBF4_3926);
        assert_eq!(compute_crc32(b""), 0);
    }

    #[test]
    fn create_new_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.sdb");

        let backend = FileBackend::open(&path).unwrap();
        assert!(path.exists());
        assert_eq!(backend.size(), HEADER_SIZE as u64);
        assert!(backend.keys().unwrap().is_empty());
    }

    #[test]
    fn persistence_across_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.sdb");

        {
            let backend = FileBackend::open(&path).unwrap();
            backend.set("coins", b"\x03\x14").unwrap();
            backend.set("name", b"bob").unwrap();
            backend.remove("name").unwrap();
            backend.flush().unwrap();
        }

        let backend = FileBackend::open(&path).unwrap();
        assert_eq!(backend.get("coins").unwrap(), Some(vec![0x03, 0x14]));
        assert_eq!(backend.get("name").unwrap(), None);
        assert_eq!(backend.recovered_bytes(), 0);
    }

    #[test]
    fn second_open_is_locked() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.sdb");

        let _first = FileBackend::open(&path).unwrap();
        let second = FileBackend::open(&path);
        assert!(matches!(second, Err(StorageError::Locked(_))));
    }

    #[test]
    fn torn_tail_is_truncated() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.sdb");

        let good_len = {
            let backend = FileBackend::open(&path).unwrap();
            backend.set("a", b"1").unwrap();
            backend.set("b", b"2").unwrap();
            backend.size()
        };

        // Half of a record header
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&[OP_SET, 5, 0]).unwrap();
        drop(file);

        let backend = FileBackend::open(&path).unwrap();
        assert_eq!(backend.recovered_bytes(), 3);
        assert_eq!(backend.size(), good_len);
        assert_eq!(backend.get("b").unwrap(), Some(b"2".to_vec()));

        // New writes land after the truncation point
        backend.set("c", b"3").unwrap();
        drop(backend);
        let backend = FileBackend::open(&path).unwrap();
        assert_eq!(backend.keys().unwrap(), vec!["a", "b", "c"]);
    }

    #[test]
    fn checksum_mismatch_drops_tail() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.sdb");

        {
            let backend = FileBackend::open(&path).unwrap();
            backend.set("a", b"1").unwrap();
            backend.set("b", b"2").unwrap();
        }

        // Flip a bit in the last record's value
        let mut bytes = std::fs::read(&path).unwrap();
        let value_pos = bytes.len() - 5;
        bytes[value_pos] ^= 0x01;
        std::fs::write(&path, &bytes).unwrap();

        let backend = FileBackend::open(&path).unwrap();
        assert_eq!(backend.get("a").unwrap(), Some(b"1".to_vec()));
        assert_eq!(backend.get("b").unwrap(), None);
        assert!(backend.recovered_bytes() > 0);
    }

    #[test]
    fn invalid_header_is_corruption() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.sdb");
        std::fs::write(&path, b"not a store").unwrap();

        let result = FileBackend::open(&path);
        assert!(matches!(result, Err(StorageError::Corrupted(_))));
    }

    #[test]
    fn compact_reclaims_garbage() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.sdb");

        let backend = FileBackend::open(&path).unwrap();
        for i in 0..20u8 {
            backend.set("counter", &[i]).unwrap();
        }
        backend.set("gone", b"x").unwrap();
        backend.remove("gone").unwrap();
        assert!(backend.garbage_bytes() > 0);

        let before = backend.size();
        backend.compact().unwrap();
        assert!(backend.size() < before);
        assert_eq!(backend.garbage_bytes(), 0);
        assert_eq!(backend.get("counter").unwrap(), Some(vec![19]));

        // Still writable and still locked after compaction
        backend.set("after", b"y").unwrap();
        assert!(matches!(
            FileBackend::open(&path),
            Err(StorageError::Locked(_))
        ));
        drop(backend);

        let backend = FileBackend::open(&path).unwrap();
        assert_eq!(backend.keys().unwrap(), vec!["after", "counter"]);
    }

    #[test]
    fn open_with_create_dirs() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("deep").join("store.sdb");

        let backend = FileBackend::open_with_create_dirs(&path).unwrap();
        backend.set("k", b"v").unwrap();
        assert!(path.exists());
    }

    #[derive(Debug, Clone)]
    enum Op {
        Set(String, Vec<u8>),
        Remove(String),
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        let key = "[a-d]{1,2}";
        prop_oneof![
            (key, prop::collection::vec(any::<u8>(), 0..16)).prop_map(|(k, v)| Op::Set(k, v)),
            key.prop_map(Op::Remove),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn reopen_matches_model(ops in prop::collection::vec(op_strategy(), 0..40), compact in any::<bool>()) {
            let dir = tempdir().unwrap();
            let path = dir.path().join("store.sdb");
            let mut model = BTreeMap::new();

            {
                let backend = FileBackend::open(&path).unwrap();
                for op in &ops {
                    match op {
                        Op::Set(k, v) => {
                            backend.set(k, v).unwrap();
                            model.insert(k.clone(), v.clone());
                        }
                        Op::Remove(k) => {
                            prop_assert_eq!(backend.remove(k).unwrap(), model.remove(k).is_some());
                        }
                    }
                }
                if compact {
                    backend.compact().unwrap();
                }
            }

            let backend = FileBackend::open(&path).unwrap();
            prop_assert_eq!(backend.keys().unwrap(), model.keys().cloned().collect::<Vec<_>>());
            for (k, v) in &model {
                let got = backend.get(k).unwrap();
                prop_assert_eq!(got.as_ref(), Some(v));
            }
        }
    }
}
