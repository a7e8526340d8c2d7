//! # SyncDB Core
//!
//! A client-side key/value store that works offline and reconciles with an
//! authoritative server on demand.
//!
//! This crate provides:
//! - [`SyncDb`], the database façade (local reads and writes, sync, change
//!   observers)
//! - [`Resolver`] / [`SetResolver`] conflict resolution with per-key,
//!   per-prefix and per-kind bindings
//! - [`EntryStore`] persistence over any [`syncdb_storage::StorageBackend`]
//! - [`Transport`] with mock, channel and in-process server implementations
//! - Typed handles: [`SyncValue`], [`SyncSet`], [`SyncMap`] and [`SubDb`]
//! - Key helpers for sub-databases and maps ([`subdb_key`], [`map_key`])
//!
//! ## Sync model
//!
//! 1. `put` writes locally, bumps the key's local version and marks it dirty
//! 2. `sync` snapshots the dirty set into a session and sends one request
//! 3. The server answers with its authoritative value for every pushed key
//!    and every key changed since the client's cursor
//! 4. Matching values are acknowledged, differing ones go through the bound
//!    resolver, untouched keys adopt the server value
//! 5. Observers are told about every value that changed, in commit order
//!
//! ## Key Invariants
//!
//! - Local writes never touch the network
//! - At most one session is in flight per database
//! - A failed exchange leaves every snapshotted key dirty
//! - A response is applied at most once

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod db;
mod dbutil;
mod entry;
mod error;
mod observer;
mod resolver;
mod server;
mod set_resolver;
mod store;
mod transport;
mod typed;

pub use config::{Limits, SyncDbConfig, DEFAULT_TIMEOUT};
pub use db::{FailureReason, MergeDecision, MergeHook, OutboundRequest, SyncDb, SyncOutcome};
pub use dbutil::{
    encoded_size, format_entry, is_reserved_key, map_entry, map_key, subdb, subdb_key,
    validate_key, validate_name, validate_value, ValidationError, MAP_KEY_SEP, META_MODS_KEY, META_VERSION_KEY,
    SUBDB_KEY_SEP,
};
pub use entry::Entry;
pub use error::{SyncError, SyncResult};
pub use observer::{Change, ChangeCallback, Subscription};
pub use resolver::{
    Conflict, Resolution, Resolver, ResolverRegistry, ResolverRegistryBuilder, TieBreak,
    ValueResolver,
};
pub use server::{MemoryServer, ServerEntry};
pub use set_resolver::{SetDelta, SetResolver};
pub use store::{decode_entry, encode_entry, BackendStore, EntryStore, StoredState};
pub use syncdb_codec::{Value, ValueKind};
pub use syncdb_protocol::{SessionState, SessionToken};
pub use transport::{
    ChannelTransport, Exchange, MockReply, MockTransport, PendingReply, ReplyResult, ReplySender,
    Transport, TransportError,
};
pub use typed::{Field, MapKey, SetEvent, SubDb, SyncMap, SyncSet, SyncValue};
