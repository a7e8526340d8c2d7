//! Wire messages exchanged with the sync server.
//!
//! ```text
//! Request  = version (u8) | token (u32) | cursor (varint) | count (varint)
//!            count × ( key-len (varint) | key | base version (varint) | value )
//! Response = token (u32) | status (u8) | cursor (varint) | count (varint)
//!            count × ( key-len (varint) | key | server version (varint) | value )
//! ```
//!
//! Fixed-width integers are big-endian and varints are unsigned LEB128.

use crate::error::{ProtocolError, ProtocolResult};
use std::fmt;
use syncdb_codec::{decode_value, encode_value, PayloadReader, PayloadWriter, Value};

/// Protocol version written at the start of every request.
pub const PROTOCOL_VERSION: u8 = 1;

/// Maximum number of entries accepted in one frame.
pub const MAX_FRAME_ENTRIES: u64 = 64 * 1024;

/// Maximum key length accepted on the wire, in bytes.
pub const MAX_WIRE_KEY_LEN: u64 = 64 * 1024;

/// Correlates a response with the request that caused it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SessionToken(pub u32);

impl SessionToken {
    /// Returns the raw token value.
    pub fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for SessionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}", self.0)
    }
}

/// One dirty key pushed to the server.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestEntry {
    /// The key.
    pub key: String,
    /// Server version the local change was made against.
    pub base_version: u64,
    /// The pending local value.
    pub value: Value,
}

/// A sync request frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    /// Session token.
    pub token: SessionToken,
    /// Highest server version this client has applied.
    pub cursor: u64,
    /// Dirty entries.
    pub entries: Vec<RequestEntry>,
}

impl Request {
    /// Encodes the request to bytes.
    pub fn encode(&self) -> Vec<u8> {
        let mut writer = PayloadWriter::new();
        writer.write_u8(PROTOCOL_VERSION);
        writer.write_u32(self.token.0);
        writer.write_varint(self.cursor);
        writer.write_varint(self.entries.len() as u64);
        for entry in &self.entries {
            writer.write_string(&entry.key);
            writer.write_varint(entry.base_version);
            encode_value(&mut writer, &entry.value);
        }
        writer.into_vec()
    }

    /// Decodes a request from bytes.
    ///
    /// # Errors
    ///
    /// Fails on unsupported versions, truncated or malformed entries and
    /// bytes left after the declared entries.
    pub fn decode(bytes: &[u8]) -> ProtocolResult<Self> {
        let mut reader = PayloadReader::new(bytes);
        let version = reader.read_u8()?;
        if version != PROTOCOL_VERSION {
            return Err(ProtocolError::UnsupportedVersion(version));
        }
        let token = SessionToken(reader.read_u32()?);
        let cursor = reader.read_varint()?;
        let entries = read_entries(&mut reader, |key, base_version, value| RequestEntry {
            key,
            base_version,
            value,
        })?;
        Ok(Self {
            token,
            cursor,
            entries,
        })
    }
}

/// Outcome the server reports for a whole request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ResponseStatus {
    /// Every pushed entry was taken as sent.
    Accepted = 0,
    /// At least one entry was overridden by a newer server value.
    Conflict = 1,
    /// The server refused the request outright.
    Rejected = 2,
}

impl ResponseStatus {
    /// Returns the wire byte for this status.
    pub fn as_byte(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for ResponseStatus {
    type Error = ProtocolError;

    fn try_from(byte: u8) -> ProtocolResult<Self> {
        match byte {
            0 => Ok(Self::Accepted),
            1 => Ok(Self::Conflict),
            2 => Ok(Self::Rejected),
            other => Err(ProtocolError::UnknownStatus(other)),
        }
    }
}

/// Authoritative state of one key as reported by the server.
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseEntry {
    /// The key.
    pub key: String,
    /// Server version of the value.
    pub server_version: u64,
    /// Server value.
    pub value: Value,
}

/// A sync response frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    /// Token of the request being answered.
    pub token: SessionToken,
    /// Overall status.
    pub status: ResponseStatus,
    /// New global server cursor.
    pub cursor: u64,
    /// Entries the client must know about.
    pub entries: Vec<ResponseEntry>,
}

impl Response {
    /// Encodes the response to bytes.
    pub fn encode(&self) -> Vec<u8> {
        let mut writer = PayloadWriter::new();
        writer.write_u32(self.token.0);
        writer.write_u8(self.status.as_byte());
        writer.write_varint(self.cursor);
        writer.write_varint(self.entries.len() as u64);
        for entry in &self.entries {
            writer.write_string(&entry.key);
            writer.write_varint(entry.server_version);
            encode_value(&mut writer, &entry.value);
        }
        writer.into_vec()
    }

    /// Decodes a response from bytes.
    ///
    /// # Errors
    ///
    /// Fails on unknown status bytes, truncated or malformed entries and
    /// bytes left after the declared entries.
    pub fn decode(bytes: &[u8]) -> ProtocolResult<Self> {
        let mut reader = PayloadReader::new(bytes);
        let token = SessionToken(reader.read_u32()?);
        let status = ResponseStatus::try_from(reader.read_u8()?)?;
        let cursor = reader.read_varint()?;
        let entries = read_entries(&mut reader, |key, server_version, value| ResponseEntry {
            key,
            server_version,
            value,
        })?;
        Ok(Self {
            token,
            status,
            cursor,
            entries,
        })
    }

    /// Looks up the entry for `key`.
    pub fn entry(&self, key: &str) -> Option<&ResponseEntry> {
        self.entries.iter().find(|e| e.key == key)
    }
}

fn read_entries<T>(
    reader: &mut PayloadReader<'_>,
    build: impl Fn(String, u64, Value) -> T,
) -> ProtocolResult<Vec<T>> {
    let count = reader.read_length(MAX_FRAME_ENTRIES)?;
    let mut entries = Vec::with_capacity(count.min(1024));
    for index in 0..count {
        let key_len = reader.read_length(MAX_WIRE_KEY_LEN)?;
        if key_len == 0 {
            return Err(ProtocolError::malformed(format!("entry {index} has an empty key")));
        }
        let key = std::str::from_utf8(reader.read_raw(key_len)?)
            .map_err(|_| ProtocolError::malformed(format!("entry {index} key is not UTF-8")))?
            .to_string();
        let version = reader.read_varint()?;
        let value = decode_value(reader)?;
        entries.push(build(key, version, value));
    }
    if !reader.is_empty() {
        return Err(ProtocolError::malformed(format!(
            "{} bytes after {count} declared entries",
            reader.remaining()
        )));
    }
    Ok(entries)
}
