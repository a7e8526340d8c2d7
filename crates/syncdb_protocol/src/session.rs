//! Per-exchange session state machine.
//!
//! A session lives for exactly one request/response exchange:
//!
//! ```text
//! Idle -> Building -> Sent -> AwaitingResponse -> Applying -> Idle
//!            |          |            |               |
//!            +----------+------------+---------------+--> Failed -> Idle
//! ```

use crate::error::{ProtocolError, ProtocolResult};
use crate::message::{Request, RequestEntry, Response, SessionToken};
use std::collections::BTreeMap;
use syncdb_codec::Value;

/// The state of a sync session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No exchange in progress.
    Idle,
    /// The dirty set is being snapshotted.
    Building,
    /// The request has been handed to the transport.
    Sent,
    /// Waiting for the response.
    AwaitingResponse,
    /// Response entries are being applied.
    Applying,
    /// The exchange failed; pending keys return to the dirty set.
    Failed,
}

impl SessionState {
    /// Returns true while an exchange is in flight.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            SessionState::Building
                | SessionState::Sent
                | SessionState::AwaitingResponse
                | SessionState::Applying
        )
    }

    /// Returns true if a new session may start from this state.
    pub fn can_start_sync(&self) -> bool {
        matches!(self, SessionState::Idle)
    }

    /// Returns true if `self -> next` is a legal transition.
    pub fn can_transition_to(&self, next: SessionState) -> bool {
        use SessionState::{Applying, AwaitingResponse, Building, Failed, Idle, Sent};
        matches!(
            (self, next),
            (Idle, Building)
                | (Building, Sent)
                | (Sent, AwaitingResponse)
                | (AwaitingResponse, Applying)
                | (Applying, Idle)
                | (Building | Sent | AwaitingResponse | Applying, Failed)
                | (Failed, Idle)
        )
    }
}

/// A key snapshotted into a session.
#[derive(Debug, Clone, PartialEq)]
pub struct InFlightEntry {
    /// Value sent to the server.
    pub value: Value,
    /// Local version of the value when it was snapshotted.
    pub local_version: u64,
    /// Server version the value was written against.
    pub base_version: u64,
}

/// Transient state of one sync exchange.
#[derive(Debug, Clone)]
pub struct Session {
    token: SessionToken,
    sequence: u64,
    state: SessionState,
    cursor: u64,
    entries: BTreeMap<String, InFlightEntry>,
}

impl Session {
    /// Starts a session in the `Building` state.
    pub fn begin(token: SessionToken, sequence: u64) -> Self {
        Self {
            token,
            sequence,
            state: SessionState::Building,
            cursor: 0,
            entries: BTreeMap::new(),
        }
    }

    /// Returns the session token.
    pub fn token(&self) -> SessionToken {
        self.token
    }

    /// Returns the session's sequence number.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Returns the current state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Returns the server cursor the request was built against.
    pub fn cursor(&self) -> u64 {
        self.cursor
    }

    /// Moves to `next`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidTransition` if `next` is not reachable from the
    /// current state.
    pub fn transition(&mut self, next: SessionState) -> ProtocolResult<()> {
        if !self.state.can_transition_to(next) {
            return Err(ProtocolError::InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        Ok(())
    }

    /// Adds a key to the snapshot.
    ///
    /// # Errors
    ///
    /// Returns `InvalidTransition` unless the session is `Building`.
    pub fn add(&mut self, key: impl Into<String>, entry: InFlightEntry) -> ProtocolResult<()> {
        if self.state != SessionState::Building {
            return Err(ProtocolError::InvalidTransition {
                from: self.state,
                to: SessionState::Building,
            });
        }
        self.entries.insert(key.into(), entry);
        Ok(())
    }

    /// Seals the snapshot and produces the request frame (`Building -> Sent`).
    ///
    /// # Errors
    ///
    /// Returns `InvalidTransition` unless the session is `Building`.
    pub fn seal(&mut self, cursor: u64) -> ProtocolResult<Request> {
        self.transition(SessionState::Sent)?;
        self.cursor = cursor;
        Ok(Request {
            token: self.token,
            cursor,
            entries: self
                .entries
                .iter()
                .map(|(key, entry)| RequestEntry {
                    key: key.clone(),
                    base_version: entry.base_version,
                    value: entry.value.clone(),
                })
                .collect(),
        })
    }

    /// Checks that `response` answers this session and moves to `Applying`.
    ///
    /// A `Sent` session is moved through `AwaitingResponse` first.
    ///
    /// # Errors
    ///
    /// Returns `StaleSession` on a token mismatch, leaving the state alone,
    /// or `InvalidTransition` if the session is not waiting for a response.
    pub fn accept(&mut self, response: &Response) -> ProtocolResult<()> {
        if response.token != self.token {
            return Err(ProtocolError::StaleSession {
                expected: Some(self.token),
                received: response.token,
            });
        }
        if self.state == SessionState::Sent {
            self.transition(SessionState::AwaitingResponse)?;
        }
        self.transition(SessionState::Applying)
    }

    /// Returns the snapshot entry for `key`.
    pub fn entry(&self, key: &str) -> Option<&InFlightEntry> {
        self.entries.get(key)
    }

    /// Returns true if `key` is part of the snapshot.
    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Iterates over snapshotted keys in order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Returns the number of snapshotted keys.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if nothing was snapshotted.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Consumes the session, returning its snapshot.
    pub fn into_entries(self) -> BTreeMap<String, InFlightEntry> {
        self.entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::ResponseStatus;

    fn entry(value: i64, local_version: u64) -> InFlightEntry {
        InFlightEntry {
            value: Value::Integer(value),
            local_version,
            base_version: 0,
        }
    }

    fn response(token: u32) -> Response {
        Response {
            token: SessionToken(token),
            status: ResponseStatus::Accepted,
            cursor: 1,
            entries: vec![],
        }
    }

    #[test]
    fn happy_path() {
        let mut session = Session::begin(SessionToken(7), 1);
        assert_eq!(session.state(), SessionState::Building);
        session.add("a", entry(1, 1)).unwrap();
        session.add("b", entry(2, 3)).unwrap();

        let request = session.seal(10).unwrap();
        assert_eq!(request.token, SessionToken(7));
        assert_eq!(request.cursor, 10);
        assert_eq!(request.entries.len(), 2);
        assert_eq!(session.state(), SessionState::Sent);

        session.accept(&response(7)).unwrap();
        assert_eq!(session.state(), SessionState::Applying);
        session.transition(SessionState::Idle).unwrap();
        assert!(!session.state().is_active());
    }

    #[test]
    fn cannot_add_after_seal() {
        let mut session = Session::begin(SessionToken(1), 1);
        session.seal(0).unwrap();
        let err = session.add("late", entry(0, 1)).unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidTransition { .. }));
        assert!(session.is_empty());
    }

    #[test]
    fn mismatched_token_is_stale() {
        let mut session = Session::begin(SessionToken(1), 1);
        session.seal(0).unwrap();
        let err = session.accept(&response(2)).unwrap_err();
        assert_eq!(
            err,
            ProtocolError::StaleSession {
                expected: Some(SessionToken(1)),
                received: SessionToken(2),
            }
        );
        assert_eq!(session.state(), SessionState::Sent);
    }

    #[test]
    fn second_accept_is_invalid() {
        let mut session = Session::begin(SessionToken(1), 1);
        session.seal(0).unwrap();
        session.accept(&response(1)).unwrap();
        assert!(matches!(
            session.accept(&response(1)),
            Err(ProtocolError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn failure_returns_to_idle() {
        let mut session = Session::begin(SessionToken(1), 1);
        session.seal(0).unwrap();
        session.transition(SessionState::AwaitingResponse).unwrap();
        session.transition(SessionState::Failed).unwrap();
        assert!(!session.state().can_start_sync());
        session.transition(SessionState::Idle).unwrap();
        assert!(session.state().can_start_sync());
    }

    #[test]
    fn transition_table() {
        use SessionState::*;
        assert!(!Idle.can_transition_to(Sent));
        assert!(!Idle.can_transition_to(Failed));
        assert!(!Sent.can_transition_to(Applying));
        assert!(!Failed.can_transition_to(Building));
        assert!(Applying.can_transition_to(Failed));
    }

    #[test]
    fn snapshot_accessors() {
        let mut session = Session::begin(SessionToken(1), 4);
        session.add("x", entry(5, 2)).unwrap();
        assert_eq!(session.sequence(), 4);
        assert!(session.contains("x"));
        assert_eq!(session.entry("x").unwrap().local_version, 2);
        assert_eq!(session.keys().collect::<Vec<_>>(), vec!["x"]);
        assert_eq!(session.into_entries().len(), 1);
    }
}
