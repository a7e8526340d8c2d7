//! The per-key record owned by a SyncDB table.

use syncdb_codec::Value;

/// Local and server-acknowledged state of one key.
///
/// `local_version >= server_version` holds at all times. The local version
/// grows by one on every local write; the server version only moves when a
/// sync response is applied.
#[derive(Debug, Clone, PartialEq)]
pub struct Entry {
    /// The key.
    pub key: String,
    /// Current local value. `Null` is a tombstone.
    pub value: Value,
    /// Local version.
    pub local_version: u64,
    /// Last value the server acknowledged, if the server knows the key.
    pub server_value: Option<Value>,
    /// Server version of `server_value`, 0 if unknown to the server.
    pub server_version: u64,
}

impl Entry {
    /// Creates an entry the server has never seen.
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: Value::Null,
            local_version: 0,
            server_value: None,
            server_version: 0,
        }
    }

    /// Returns the live value, treating the tombstone as absent.
    pub fn live_value(&self) -> Option<&Value> {
        (!self.value.is_null()).then_some(&self.value)
    }

    /// Returns true if the entry holds a tombstone.
    pub fn is_tombstone(&self) -> bool {
        self.value.is_null()
    }

    /// Records a local write.
    pub fn write_local(&mut self, value: Value) {
        self.value = value;
        self.local_version += 1;
    }

    /// Records the server's view of the key and commits `value` locally.
    pub(crate) fn commit_server(&mut self, value: Value, server_value: Value, server_version: u64) {
        self.value = value;
        self.server_value = Some(server_value);
        self.server_version = server_version;
        self.local_version = self.local_version.max(server_version);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_entry_is_unknown_to_server() {
        let entry = Entry::new("coins");
        assert_eq!(entry.local_version, 0);
        assert_eq!(entry.server_version, 0);
        assert!(entry.server_value.is_none());
        assert!(entry.live_value().is_none());
    }

    #[test]
    fn local_writes_bump_version() {
        let mut entry = Entry::new("coins");
        entry.write_local(Value::Integer(5));
        entry.write_local(Value::Integer(6));
        assert_eq!(entry.local_version, 2);
        assert_eq!(entry.live_value(), Some(&Value::Integer(6)));
    }

    #[test]
    fn commit_raises_local_version() {
        let mut entry = Entry::new("score");
        entry.write_local(Value::Integer(10));
        entry.commit_server(Value::Integer(7), Value::Integer(7), 2);
        assert_eq!(entry.local_version, 2);
        assert_eq!(entry.server_version, 2);

        // Never lowers it
        entry.write_local(Value::Integer(8));
        entry.write_local(Value::Integer(9));
        entry.commit_server(Value::Integer(9), Value::Integer(9), 3);
        assert_eq!(entry.local_version, 4);
    }
}
