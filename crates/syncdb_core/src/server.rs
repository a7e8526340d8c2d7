//! An in-process authoritative sync server.

use crate::transport::{PendingReply, Transport, TransportError};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use syncdb_codec::Value;
use syncdb_protocol::{Request, Response, ResponseEntry, ResponseStatus};

/// A value held by [`MemoryServer`].
#[derive(Debug, Clone, PartialEq)]
pub struct ServerEntry {
    /// Current value.
    pub value: Value,
    /// Server version at which it was written.
    pub version: u64,
}

#[derive(Debug, Default)]
struct ServerState {
    entries: BTreeMap<String, ServerEntry>,
    cursor: u64,
    rejecting: bool,
    requests: u64,
}

/// An authoritative server kept in memory.
///
/// Every accepted write gets the next global version. A pushed entry is
/// accepted when its base version is the key's current server version;
/// otherwise the server keeps its own value and reports a conflict. Each
/// response carries every key changed since the request's cursor plus every
/// pushed key.
#[derive(Debug, Default)]
pub struct MemoryServer {
    state: Mutex<ServerState>,
}

impl MemoryServer {
    /// Creates an empty server.
    pub fn new() -> Self {
        Self::default()
    }

    /// Handles an encoded request and returns the encoded response.
    ///
    /// # Errors
    ///
    /// Returns a non-retryable error if the request frame cannot be decoded.
    pub fn handle(&self, frame: &[u8]) -> Result<Vec<u8>, TransportError> {
        let request = Request::decode(frame)
            .map_err(|e| TransportError::fatal(format!("malformed request: {e}")))?;
        Ok(self.apply(&request).encode())
    }

    /// Applies a decoded request.
    pub fn apply(&self, request: &Request) -> Response {
        let mut state = self.state.lock();
        state.requests += 1;

        if state.rejecting {
            return Response {
                token: request.token,
                status: ResponseStatus::Rejected,
                cursor: state.cursor,
                entries: vec![],
            };
        }

        let mut conflict = false;
        let mut pushed = BTreeSet::new();
        for entry in &request.entries {
            let current = state.entries.get(&entry.key).map_or(0, |e| e.version);
            if entry.base_version >= current {
                state.cursor += 1;
                let version = state.cursor;
                state.entries.insert(
                    entry.key.clone(),
                    ServerEntry {
                        value: entry.value.clone(),
                        version,
                    },
                );
            } else {
                conflict = true;
            }
            pushed.insert(entry.key.as_str());
        }

        let entries = state
            .entries
            .iter()
            .filter(|(key, e)| e.version > request.cursor || pushed.contains(key.as_str()))
            .map(|(key, e)| ResponseEntry {
                key: key.clone(),
                server_version: e.version,
                value: e.value.clone(),
            })
            .collect();

        Response {
            token: request.token,
            status: if conflict {
                ResponseStatus::Conflict
            } else {
                ResponseStatus::Accepted
            },
            cursor: state.cursor,
            entries,
        }
    }

    /// Writes `value` as another client would. Returns the new version.
    pub fn put(&self, key: impl Into<String>, value: impl Into<Value>) -> u64 {
        let mut state = self.state.lock();
        state.cursor += 1;
        let version = state.cursor;
        state.entries.insert(
            key.into(),
            ServerEntry {
                value: value.into(),
                version,
            },
        );
        version
    }

    /// Returns the server's entry for `key`.
    pub fn get(&self, key: &str) -> Option<ServerEntry> {
        self.state.lock().entries.get(key).cloned()
    }

    /// Returns the global server version.
    pub fn cursor(&self) -> u64 {
        self.state.lock().cursor
    }

    /// Makes the server reject (or stop rejecting) every request.
    pub fn set_rejecting(&self, rejecting: bool) {
        self.state.lock().rejecting = rejecting;
    }

    /// Returns how many requests were handled.
    pub fn request_count(&self) -> u64 {
        self.state.lock().requests
    }
}

/// Answers synchronously on the calling thread.
impl Transport for MemoryServer {
    fn send(&self, frame: Vec<u8>) -> PendingReply {
        PendingReply::ready(self.handle(&frame))
    }
}
