//! Configuration for a SyncDB instance.

use std::time::Duration;

/// Default time `sync()` waits for the transport.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Size limits enforced on local writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    /// Maximum key length in bytes.
    pub max_key_len: usize,
    /// Maximum encoded value size in bytes.
    pub max_value_size: usize,
    /// Maximum container nesting depth.
    pub max_depth: usize,
}

impl Limits {
    /// Sets the maximum key length.
    pub fn with_max_key_len(mut self, len: usize) -> Self {
        self.max_key_len = len;
        self
    }

    /// Sets the maximum encoded value size.
    pub fn with_max_value_size(mut self, size: usize) -> Self {
        self.max_value_size = size;
        self
    }

    /// Sets the maximum nesting depth.
    pub fn with_max_depth(mut self, depth: usize) -> Self {
        self.max_depth = depth;
        self
    }
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_key_len: 256,
            max_value_size: 64 * 1024,
            max_depth: 16,
        }
    }
}

/// Configuration for a [`crate::SyncDb`].
#[derive(Debug, Clone, Default)]
pub struct SyncDbConfig {
    /// Timeout used by `sync()`.
    pub timeout: Option<Duration>,
    /// Write limits.
    pub limits: Limits,
    /// Base of the session token space. Random when unset.
    pub token_seed: Option<u32>,
}

impl SyncDbConfig {
    /// Creates a configuration with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the timeout used by `sync()`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Sets the write limits.
    pub fn with_limits(mut self, limits: Limits) -> Self {
        self.limits = limits;
        self
    }

    /// Fixes the session token base, making tokens reproducible.
    pub fn with_token_seed(mut self, seed: u32) -> Self {
        self.token_seed = Some(seed);
        self
    }

    /// Returns the effective sync timeout.
    pub fn effective_timeout(&self) -> Duration {
        self.timeout.unwrap_or(DEFAULT_TIMEOUT)
    }
}
