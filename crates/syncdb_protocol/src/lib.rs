//! # SyncDB Sync Protocol
//!
//! Wire messages and the session state machine for SyncDB.
//!
//! This crate provides:
//! - [`Request`] / [`Response`] frames and their binary encoding
//! - [`Session`], which tracks one exchange from snapshot to apply
//! - [`ProtocolError`] for framing and sequencing failures
//!
//! This is a pure protocol crate with no I/O operations.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod message;
mod session;

pub use error::{ProtocolError, ProtocolResult};
pub use message::{
    Request, RequestEntry, Response, ResponseEntry, ResponseStatus, SessionToken,
    MAX_FRAME_ENTRIES, MAX_WIRE_KEY_LEN, PROTOCOL_VERSION,
};
pub use session::{InFlightEntry, Session, SessionState};
