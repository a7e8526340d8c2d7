//! Key helpers and write validation.
//!
//! Keys are flat strings, but applications often structure them:
//!
//! - A **sub-database** groups keys under a prefix: `prefix!key`
//! - A **map** stores one key per map entry: `prefix~mapkey`
//!
//! Resolvers can be bound to either kind of prefix.

use crate::config::Limits;
use crate::entry::Entry;
use syncdb_codec::{encoded_len, Value};
use thiserror::Error;

/// Separator between a map's name and its entry keys.
pub const MAP_KEY_SEP: &str = "~";

/// Separator between a sub-database prefix and its keys.
pub const SUBDB_KEY_SEP: &str = "!";

/// Reserved key holding the server cursor.
pub const META_VERSION_KEY: &str = "syncv";

/// Reserved key holding the set of dirty keys.
pub const META_MODS_KEY: &str = "syncm";

/// Reasons a local write is rejected.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// Keys may not be empty.
    #[error("key is empty")]
    EmptyKey,

    /// Key exceeds the configured length.
    #[error("key is {len} bytes (max {max})")]
    KeyTooLong {
        /// Key length in bytes.
        len: usize,
        /// Configured maximum.
        max: usize,
    },

    /// Key is reserved for sync metadata.
    #[error("key {0:?} is reserved")]
    ReservedKey(String),

    /// Handle names may not contain a key separator.
    #[error("name {0:?} contains a key separator")]
    InvalidName(String),

    /// Encoded value exceeds the configured size.
    #[error("value encodes to {size} bytes (max {max})")]
    ValueTooLarge {
        /// Encoded size in bytes.
        size: usize,
        /// Configured maximum.
        max: usize,
    },

    /// Value nests containers too deeply.
    #[error("value nests {depth} levels (max {max})")]
    TooDeep {
        /// Nesting depth of the value.
        depth: usize,
        /// Configured maximum.
        max: usize,
    },
}

/// Builds the fully qualified key of `key` in the sub-database `prefix`.
pub fn subdb_key(prefix: &str, key: &str) -> String {
    format!("{prefix}{SUBDB_KEY_SEP}{key}")
}

/// Returns the sub-database prefix of `fq_key`, if it has one.
pub fn subdb(fq_key: &str) -> Option<&str> {
    fq_key.split_once(SUBDB_KEY_SEP).map(|(prefix, _)| prefix)
}

/// Builds the key under which entry `key` of map `prefix` is stored.
pub fn map_key(prefix: &str, key: &str) -> String {
    format!("{prefix}{MAP_KEY_SEP}{key}")
}

/// Splits a map key into `(map prefix, entry key)`.
pub fn map_entry(fq_key: &str) -> Option<(&str, &str)> {
    fq_key.split_once(MAP_KEY_SEP)
}

/// Returns true for keys reserved for sync metadata.
pub fn is_reserved_key(key: &str) -> bool {
    key == META_VERSION_KEY || key == META_MODS_KEY
}

/// Checks that `key` may be written by an application.
///
/// # Errors
///
/// Returns a [`ValidationError`] for empty, oversized or reserved keys.
pub fn validate_key(key: &str, limits: &Limits) -> Result<(), ValidationError> {
    if key.is_empty() {
        return Err(ValidationError::EmptyKey);
    }
    if key.len() > limits.max_key_len {
        return Err(ValidationError::KeyTooLong {
            len: key.len(),
            max: limits.max_key_len,
        });
    }
    if is_reserved_key(key) {
        return Err(ValidationError::ReservedKey(key.to_string()));
    }
    Ok(())
}

/// Checks a name for a typed handle or sub-database: a valid key without
/// either separator.
///
/// # Errors
///
/// Returns a [`ValidationError`] for invalid keys and names containing
/// [`MAP_KEY_SEP`] or [`SUBDB_KEY_SEP`].
pub fn validate_name(name: &str, limits: &Limits) -> Result<(), ValidationError> {
    validate_key(name, limits)?;
    if name.contains(MAP_KEY_SEP) || name.contains(SUBDB_KEY_SEP) {
        return Err(ValidationError::InvalidName(name.to_string()));
    }
    Ok(())
}

/// Checks that `value` fits the configured limits.
///
/// # Errors
///
/// Returns a [`ValidationError`] if the value is too large or too deep.
pub fn validate_value(value: &Value, limits: &Limits) -> Result<(), ValidationError> {
    let depth = value.depth();
    if depth > limits.max_depth {
        return Err(ValidationError::TooDeep {
            depth,
            max: limits.max_depth,
        });
    }
    let size = encoded_size(value);
    if size > limits.max_value_size {
        return Err(ValidationError::ValueTooLarge {
            size,
            max: limits.max_value_size,
        });
    }
    Ok(())
}

/// Returns the encoded size of `value` in bytes.
pub fn encoded_size(value: &Value) -> usize {
    encoded_len(value)
}

/// Renders an entry on one line for logs and the CLI.
pub fn format_entry(entry: &Entry) -> String {
    let server = match &entry.server_value {
        Some(value) => format!("{value}@{}", entry.server_version),
        None => "-".to_string(),
    };
    format!(
        "{} = {} (local v{}, server {})",
        entry.key, entry.value, entry.local_version, server
    )
}
