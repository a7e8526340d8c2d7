//! The SyncDB façade.

use crate::config::{Limits, SyncDbConfig};
use crate::dbutil::{validate_key, validate_value, ValidationError};
use crate::entry::Entry;
use crate::error::{SyncError, SyncResult};
use crate::observer::{Change, Observers, Subscription};
use crate::resolver::{Conflict, Resolution, Resolver, ResolverRegistry};
use crate::store::EntryStore;
use crate::transport::Transport;
use parking_lot::{Condvar, Mutex, MutexGuard, RwLock, RwLockReadGuard};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use syncdb_codec::Value;
use syncdb_protocol::{
    InFlightEntry, ProtocolError, Response, ResponseEntry, ResponseStatus, Session, SessionState,
    SessionToken,
};
use tracing::{debug, warn};

/// Outcomes of recent sessions kept for callers joining a sync.
const FINISHED_HISTORY: usize = 16;

/// Why a sync exchange failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    /// The transport did not answer in time.
    Timeout,
    /// The transport failed.
    Transport {
        /// Error message.
        message: String,
        /// Whether the exchange can be retried.
        retryable: bool,
    },
    /// The server refused the request.
    ServerRejected,
    /// The response frame could not be decoded.
    Malformed(String),
    /// The response did not belong to the session in flight.
    StaleSession,
    /// The local store failed.
    Storage(String),
    /// The exchange was abandoned before it completed.
    Aborted(String),
}

impl FailureReason {
    /// Returns true if trying again later may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout | Self::StaleSession | Self::Aborted(_) => true,
            Self::Transport { retryable, .. } => *retryable,
            Self::ServerRejected | Self::Malformed(_) | Self::Storage(_) => false,
        }
    }
}

impl From<&SyncError> for FailureReason {
    fn from(err: &SyncError) -> Self {
        match err {
            SyncError::Timeout => Self::Timeout,
            SyncError::Transport { message, retryable } => Self::Transport {
                message: message.clone(),
                retryable: *retryable,
            },
            SyncError::Protocol(ProtocolError::StaleSession { .. }) => Self::StaleSession,
            SyncError::Protocol(e) => Self::Malformed(e.to_string()),
            SyncError::Storage(_) | SyncError::CorruptRecord { .. } => {
                Self::Storage(err.to_string())
            }
            SyncError::SyncInProgress | SyncError::Validation(_) => Self::Aborted(err.to_string()),
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout => f.write_str("timed out"),
            Self::Transport { message, .. } => write!(f, "transport failed: {message}"),
            Self::ServerRejected => f.write_str("server rejected the request"),
            Self::Malformed(message) => write!(f, "malformed response: {message}"),
            Self::StaleSession => f.write_str("stale session"),
            Self::Storage(message) => write!(f, "storage failed: {message}"),
            Self::Aborted(message) => write!(f, "aborted: {message}"),
        }
    }
}

/// Result of one sync exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Every key was reconciled.
    Synced,
    /// These keys could not be resolved and stay dirty; all others committed.
    PartialConflict(Vec<String>),
    /// The exchange failed and the dirty set was restored.
    Failed(FailureReason),
}

impl SyncOutcome {
    /// Returns true for [`SyncOutcome::Synced`].
    pub fn is_synced(&self) -> bool {
        matches!(self, Self::Synced)
    }

    /// Returns true for [`SyncOutcome::Failed`].
    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed(_))
    }
}

/// Answer of a merge hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeDecision {
    /// Resolve the conflicts and apply the response.
    Apply,
    /// Drop the response; the session fails and its keys stay dirty.
    Decline,
}

/// Hook consulted before a response that needs conflict resolution is
/// applied. See [`SyncDb::on_before_merge`].
pub type MergeHook = Arc<dyn Fn(&[Conflict]) -> MergeDecision + Send + Sync>;

/// A request produced by [`SyncDb::begin_sync`] for the host to deliver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundRequest {
    /// Token of the new session.
    pub token: SessionToken,
    /// Encoded request frame.
    pub frame: Vec<u8>,
    /// Keys carried by the request.
    pub keys: Vec<String>,
}

#[derive(Debug)]
struct Table {
    entries: BTreeMap<String, Entry>,
    dirty: BTreeSet<String>,
    cursor: u64,
    session: Option<Session>,
    sequence: u64,
    finished: VecDeque<(u64, SyncOutcome)>,
    /// Set when server entries could not be stored; the next sync pulls
    /// again even with nothing dirty.
    pull_pending: bool,
}

/// What applying one response entry does.
enum Step {
    Invalid(ValidationError),
    Stale,
    Accept,
    Resolve(Conflict),
    Adopt,
}

fn conflicts(
    limits: &Limits,
    table: &Table,
    session: &Session,
    response: &Response,
) -> Vec<Conflict> {
    response
        .entries
        .iter()
        .filter_map(|incoming| match classify(limits, table, session, incoming) {
            Step::Resolve(conflict) => Some(conflict),
            _ => None,
        })
        .collect()
}

fn classify(limits: &Limits, table: &Table, session: &Session, incoming: &ResponseEntry) -> Step {
    let key = incoming.key.as_str();
    if let Err(err) = validate_key(key, limits) {
        return Step::Invalid(err);
    }
    let existing = table.entries.get(key);
    if incoming.server_version <= existing.map_or(0, |e| e.server_version) {
        return Step::Stale;
    }
    match session.entry(key) {
        Some(sent) if sent.value == incoming.value => Step::Accept,
        sent if sent.is_some() || table.dirty.contains(key) => Step::Resolve(Conflict {
            key: key.to_string(),
            local: existing.map_or(Value::Null, |e| e.value.clone()),
            local_version: existing.map_or(0, |e| e.local_version),
            server: incoming.value.clone(),
            server_version: incoming.server_version,
            base: existing.and_then(|e| e.server_value.clone()),
        }),
        _ => Step::Adopt,
    }
}

/// A local key/value database synchronized with an authoritative server.
///
/// Writes are local and never touch the network. [`SyncDb::sync`] pushes the
/// dirty keys, applies the server's answer and resolves conflicts with the
/// resolver bound to each key. Change observers run after the table lock is
/// released, on the thread that made the change, in commit order: a writer
/// whose commit came later waits for earlier callbacks to finish. Callbacks
/// may read and write the database but must not block on another thread
/// that writes to it.
///
/// # Example
///
/// ```rust
/// use std::sync::Arc;
/// use syncdb_core::{BackendStore, MemoryServer, ResolverRegistry, SyncDb, SyncDbConfig, Value};
///
/// let server = Arc::new(MemoryServer::new());
/// let db = SyncDb::open(
///     SyncDbConfig::default(),
///     BackendStore::in_memory(),
///     Arc::clone(&server),
///     ResolverRegistry::default(),
/// )
/// .unwrap();
///
/// db.put("coins", 20).unwrap();
/// assert!(db.is_dirty("coins"));
/// assert!(db.sync().is_synced());
/// assert!(!db.is_dirty("coins"));
/// assert_eq!(server.get("coins").unwrap().value, Value::Integer(20));
/// ```
pub struct SyncDb<S: EntryStore, T: Transport> {
    config: SyncDbConfig,
    store: S,
    transport: T,
    resolvers: RwLock<ResolverRegistry>,
    merge_hook: RwLock<Option<MergeHook>>,
    token_base: u32,
    table: Mutex<Table>,
    finished: Condvar,
    observers: Observers,
}

impl<S: EntryStore, T: Transport> SyncDb<S, T> {
    /// Opens a database over `store`, loading whatever it holds.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be loaded.
    pub fn open(
        config: SyncDbConfig,
        store: S,
        transport: T,
        resolvers: ResolverRegistry,
    ) -> SyncResult<Self> {
        let state = store.load()?;
        let token_base = config.token_seed.unwrap_or_else(rand::random);
        debug!(
            entries = state.entries.len(),
            dirty = state.dirty.len(),
            cursor = state.cursor,
            "opened database"
        );
        Ok(Self {
            config,
            store,
            transport,
            resolvers: RwLock::new(resolvers),
            merge_hook: RwLock::new(None),
            token_base,
            table: Mutex::new(Table {
                entries: state.entries,
                dirty: state.dirty,
                cursor: state.cursor,
                session: None,
                sequence: 0,
                finished: VecDeque::new(),
                pull_pending: false,
            }),
            finished: Condvar::new(),
            observers: Observers::default(),
        })
    }

    /// Returns the configuration.
    pub fn config(&self) -> &SyncDbConfig {
        &self.config
    }

    /// Returns the resolver bindings.
    pub fn resolvers(&self) -> RwLockReadGuard<'_, ResolverRegistry> {
        self.resolvers.read()
    }

    /// Binds a resolver to one key for conflicts from now on.
    pub fn bind_key(&self, key: impl Into<String>, resolver: impl Resolver + 'static) {
        self.resolvers.write().bind_key(key, resolver);
    }

    /// Binds a resolver to every key starting with `prefix`.
    pub fn bind_prefix(&self, prefix: impl Into<String>, resolver: impl Resolver + 'static) {
        self.resolvers.write().bind_prefix(prefix, resolver);
    }

    /// Returns the storage collaborator.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Returns the transport.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    // ---- reads ----

    /// Returns the value of `key`. Tombstones read as `None`.
    pub fn get(&self, key: &str) -> Option<Value> {
        self.table
            .lock()
            .entries
            .get(key)
            .and_then(Entry::live_value)
            .cloned()
    }

    /// Returns the value of `key`, or `default` if it has none.
    pub fn get_or(&self, key: &str, default: impl Into<Value>) -> Value {
        self.get(key).unwrap_or_else(|| default.into())
    }

    /// Returns a copy of the full entry for `key`, tombstones included.
    pub fn entry(&self, key: &str) -> Option<Entry> {
        self.table.lock().entries.get(key).cloned()
    }

    /// Returns every key holding a live value, in order.
    pub fn keys(&self) -> Vec<String> {
        self.table
            .lock()
            .entries
            .values()
            .filter(|e| !e.is_tombstone())
            .map(|e| e.key.clone())
            .collect()
    }

    /// Returns every live key starting with `prefix`, in order.
    pub fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
        self.table
            .lock()
            .entries
            .range::<str, _>((std::ops::Bound::Included(prefix), std::ops::Bound::Unbounded))
            .take_while(|(key, _)| key.starts_with(prefix))
            .filter(|(_, e)| !e.is_tombstone())
            .map(|(key, _)| key.clone())
            .collect()
    }

    /// Returns the server cursor: the highest server version applied.
    pub fn version(&self) -> u64 {
        self.table.lock().cursor
    }

    /// Returns true if `key` has changes the server has not acknowledged.
    pub fn is_dirty(&self, key: &str) -> bool {
        let table = self.table.lock();
        table.dirty.contains(key) || table.session.as_ref().is_some_and(|s| s.contains(key))
    }

    /// Returns every key with unacknowledged changes, in order.
    pub fn dirty_keys(&self) -> Vec<String> {
        let table = self.table.lock();
        let mut keys: BTreeSet<&str> = table.dirty.iter().map(String::as_str).collect();
        if let Some(session) = &table.session {
            keys.extend(session.keys());
        }
        keys.into_iter().map(str::to_string).collect()
    }

    /// Returns true if anything still has to reach the server.
    pub fn has_unsynced_changes(&self) -> bool {
        let table = self.table.lock();
        !table.dirty.is_empty() || table.session.is_some()
    }

    /// Returns the state of the session in flight, or `Idle`.
    pub fn sync_state(&self) -> SessionState {
        self.table
            .lock()
            .session
            .as_ref()
            .map_or(SessionState::Idle, Session::state)
    }

    // ---- writes ----

    /// Writes `value` locally and marks `key` dirty.
    ///
    /// # Errors
    ///
    /// Returns a validation error, leaving the table unchanged, if the key or
    /// value breaks the configured limits, or a storage error if the entry
    /// cannot be persisted.
    pub fn put(&self, key: &str, value: impl Into<Value>) -> SyncResult<()> {
        let value = value.into();
        self.update(key, |_| Some(value)).map(|_| ())
    }

    /// Rewrites `key` from its current value in one step.
    ///
    /// `f` sees the live value (`None` for absent keys and tombstones) and
    /// returns the value to write, or `None` to leave the key alone. It runs
    /// under the table lock and must not call back into the database.
    /// Returns whether a write happened.
    ///
    /// # Errors
    ///
    /// Same as [`SyncDb::put`].
    pub fn update<F>(&self, key: &str, f: F) -> SyncResult<bool>
    where
        F: FnOnce(Option<&Value>) -> Option<Value>,
    {
        validate_key(key, &self.config.limits)?;

        let pending = {
            let mut table = self.table.lock();
            let current = table.entries.get(key);
            let Some(value) = f(current.and_then(Entry::live_value)) else {
                return Ok(false);
            };
            validate_value(&value, &self.config.limits)?;

            let mut entry = current.cloned().unwrap_or_else(|| Entry::new(key));
            let old = entry.value.clone();
            entry.write_local(value);
            self.store.save_entry(&entry, true)?;

            let change = Change::between(key, Some(&old), Some(&entry.value));
            table.dirty.insert(key.to_string());
            table.entries.insert(key.to_string(), entry);
            change.map(|change| (self.observers.ticket(), change))
        };

        if let Some((ticket, change)) = pending {
            self.observers.deliver(ticket, &[change]);
        }
        Ok(true)
    }

    /// Deletes `key` by writing a tombstone.
    ///
    /// # Errors
    ///
    /// Same as [`SyncDb::put`].
    pub fn remove(&self, key: &str) -> SyncResult<()> {
        self.put(key, Value::Null)
    }

    /// Flushes the store.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot flush.
    pub fn flush(&self) -> SyncResult<()> {
        self.store.flush()
    }

    // ---- observers ----

    /// Calls `callback` whenever the value of `key` changes.
    pub fn on_change<F>(&self, key: impl Into<String>, callback: F) -> Subscription
    where
        F: Fn(&str, Option<&Value>, Option<&Value>) + Send + Sync + 'static,
    {
        self.observers.subscribe(Some(key.into()), callback)
    }

    /// Calls `callback` whenever any value changes.
    pub fn on_any_change<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&str, Option<&Value>, Option<&Value>) + Send + Sync + 'static,
    {
        self.observers.subscribe(None, callback)
    }

    /// Removes a subscription. Returns false if it was already gone.
    pub fn unsubscribe(&self, subscription: Subscription) -> bool {
        self.observers.unsubscribe(subscription)
    }

    /// Installs a hook consulted before applying a response that needs
    /// conflict resolution, replacing any earlier hook.
    ///
    /// The hook sees the conflicts the bound resolvers are about to settle.
    /// It runs under the table lock and must not call back into the
    /// database. Hosts that want to ask the user first can instead drive the
    /// step API and call [`SyncDb::pending_conflicts`] before
    /// [`SyncDb::complete_sync`].
    pub fn on_before_merge<F>(&self, hook: F)
    where
        F: Fn(&[Conflict]) -> MergeDecision + Send + Sync + 'static,
    {
        *self.merge_hook.write() = Some(Arc::new(hook));
    }

    /// Removes the merge hook.
    pub fn clear_merge_hook(&self) {
        *self.merge_hook.write() = None;
    }

    // ---- sync ----

    /// Syncs with the configured timeout.
    pub fn sync(&self) -> SyncOutcome {
        self.sync_with_timeout(self.config.effective_timeout())
    }

    /// Pushes dirty keys and applies the server's answer, waiting at most
    /// `timeout` for the transport.
    ///
    /// Returns `Synced` at once when nothing is dirty. If a session is
    /// already in flight this call waits for it, up to `timeout`, and returns
    /// its outcome.
    pub fn sync_with_timeout(&self, timeout: Duration) -> SyncOutcome {
        let deadline = Instant::now().checked_add(timeout);

        let outbound = {
            let mut table = self.table.lock();
            if let Some(sequence) = table.session.as_ref().map(Session::sequence) {
                debug!(sequence, "joining sync session in flight");
                return self.join(table, sequence, deadline);
            }
            match self.begin_locked(&mut table) {
                Ok(Some(outbound)) => outbound,
                Ok(None) => return SyncOutcome::Synced,
                Err(err) => return SyncOutcome::Failed(FailureReason::from(&err)),
            }
        };

        let remaining = deadline.map_or(Duration::MAX, |d| {
            d.saturating_duration_since(Instant::now())
        });
        let pending = self.transport.send(outbound.frame);
        self.note_delivered(outbound.token);
        match pending.wait(remaining) {
            Ok(frame) => match self.complete_sync(&frame) {
                Ok(outcome) => outcome,
                Err(err) => SyncOutcome::Failed(FailureReason::from(&err)),
            },
            Err(err) => {
                let reason = FailureReason::from(&err);
                self.abort_sync(outbound.token, reason.clone());
                SyncOutcome::Failed(reason)
            }
        }
    }

    /// Snapshots the dirty set into a new session and returns its request.
    ///
    /// Returns `None` when nothing is dirty and no earlier response is
    /// waiting to be pulled again. Writes made before the session completes
    /// go to the next pending set.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::SyncInProgress`] if a session is already in
    /// flight.
    pub fn begin_sync(&self) -> SyncResult<Option<OutboundRequest>> {
        let mut table = self.table.lock();
        self.begin_locked(&mut table)
    }

    /// Records that the request of session `token` was handed to the
    /// transport, moving it to `AwaitingResponse`.
    ///
    /// Returns false if that session is not in flight or was already marked.
    pub fn note_delivered(&self, token: SessionToken) -> bool {
        let mut table = self.table.lock();
        match table.session.as_mut() {
            Some(session) if session.token() == token && session.state() == SessionState::Sent => {
                session.transition(SessionState::AwaitingResponse).is_ok()
            }
            _ => false,
        }
    }

    /// Returns the conflicts applying `frame` would hand to resolvers,
    /// without applying anything.
    ///
    /// # Errors
    ///
    /// Returns a protocol error if the frame cannot be decoded or does not
    /// answer the session in flight. Unlike [`SyncDb::complete_sync`], the
    /// session is left in flight either way.
    pub fn pending_conflicts(&self, frame: &[u8]) -> SyncResult<Vec<Conflict>> {
        let response = Response::decode(frame)?;
        let table = self.table.lock();
        match table.session.as_ref() {
            Some(session) if session.token() == response.token => {
                Ok(conflicts(&self.config.limits, &table, session, &response))
            }
            session => Err(ProtocolError::StaleSession {
                expected: session.map(Session::token),
                received: response.token,
            }
            .into()),
        }
    }

    /// Applies a response frame to the session in flight.
    ///
    /// # Errors
    ///
    /// Returns a protocol error if the frame cannot be decoded or does not
    /// answer the session in flight. Decode failures and mismatched tokens
    /// end the session and return its keys to the dirty set; a response with
    /// no session in flight changes nothing.
    ///
    /// Entries that cannot be stored stay uncommitted and the cursor does
    /// not advance; the outcome is then `Failed(Storage)` and the next sync
    /// pulls them again.
    pub fn complete_sync(&self, frame: &[u8]) -> SyncResult<SyncOutcome> {
        let (outcome, pending) = {
            let mut table = self.table.lock();

            let response = match Response::decode(frame) {
                Ok(response) => response,
                Err(err) => {
                    if let Some(session) = table.session.take() {
                        let reason = FailureReason::Malformed(err.to_string());
                        self.fail_session(&mut table, session, reason);
                    }
                    return Err(err.into());
                }
            };

            let Some(mut session) = table.session.take() else {
                warn!(token = %response.token, "response arrived with no session in flight");
                return Err(ProtocolError::StaleSession {
                    expected: None,
                    received: response.token,
                }
                .into());
            };

            if let Err(err) = session.accept(&response) {
                warn!(
                    expected = %session.token(),
                    received = %response.token,
                    "discarding session after mismatched response"
                );
                self.fail_session(&mut table, session, FailureReason::StaleSession);
                return Err(err.into());
            }

            if response.status == ResponseStatus::Rejected {
                self.fail_session(&mut table, session, FailureReason::ServerRejected);
                return Ok(SyncOutcome::Failed(FailureReason::ServerRejected));
            }

            let hook = self.merge_hook.read().clone();
            if let Some(hook) = hook {
                let conflicts = conflicts(&self.config.limits, &table, &session, &response);
                if !conflicts.is_empty() && hook(&conflicts) == MergeDecision::Decline {
                    let reason = FailureReason::Aborted("merge declined".to_string());
                    self.fail_session(&mut table, session, reason.clone());
                    return Ok(SyncOutcome::Failed(reason));
                }
            }

            let (outcome, changes) = self.apply_response(&mut table, &session, &response);
            if let Err(err) = session.transition(SessionState::Idle) {
                debug!(error = %err, "session did not return to idle");
            }
            self.finish(&mut table, session.sequence(), outcome.clone());
            let pending = (!changes.is_empty()).then(|| (self.observers.ticket(), changes));
            (outcome, pending)
        };

        if let Some((ticket, changes)) = pending {
            self.observers.deliver(ticket, &changes);
        }
        Ok(outcome)
    }

    /// Abandons the session with `token`, returning its keys to the dirty set.
    ///
    /// Returns false if no such session is in flight.
    pub fn abort_sync(&self, token: SessionToken, reason: FailureReason) -> bool {
        let mut table = self.table.lock();
        if table.session.as_ref().map(Session::token) != Some(token) {
            return false;
        }
        if let Some(session) = table.session.take() {
            self.fail_session(&mut table, session, reason);
        }
        true
    }

    fn begin_locked(&self, table: &mut Table) -> SyncResult<Option<OutboundRequest>> {
        if table.session.is_some() {
            return Err(SyncError::SyncInProgress);
        }
        if table.dirty.is_empty() && !table.pull_pending {
            return Ok(None);
        }

        let sequence = table.sequence + 1;
        #[allow(clippy::cast_possible_truncation)]
        let token = SessionToken(self.token_base.wrapping_add(sequence as u32));
        let mut session = Session::begin(token, sequence);
        for key in &table.dirty {
            if let Some(entry) = table.entries.get(key) {
                session.add(
                    key.clone(),
                    InFlightEntry {
                        value: entry.value.clone(),
                        local_version: entry.local_version,
                        base_version: entry.server_version,
                    },
                )?;
            }
        }
        let request = session.seal(table.cursor)?;

        table.sequence = sequence;
        table.dirty.clear();
        let keys: Vec<String> = session.keys().map(str::to_string).collect();
        debug!(
            token = %token,
            sequence,
            keys = keys.len(),
            cursor = table.cursor,
            "sync session started"
        );
        table.session = Some(session);

        Ok(Some(OutboundRequest {
            token,
            frame: request.encode(),
            keys,
        }))
    }

    fn apply_response(
        &self,
        table: &mut Table,
        session: &Session,
        response: &Response,
    ) -> (SyncOutcome, Vec<Change>) {
        let resolvers = self.resolvers.read();
        let mut changes = Vec::new();
        let mut unresolved = Vec::new();
        let mut unsaved = Vec::new();
        let mut answered = BTreeSet::new();

        for incoming in &response.entries {
            let key = incoming.key.as_str();
            let step = classify(&self.config.limits, table, session, incoming);
            let existing = table.entries.get(key);
            let old = existing.map(|e| e.value.clone());
            let mut entry = existing.cloned().unwrap_or_else(|| Entry::new(key));

            let dirty = match step {
                Step::Invalid(err) => {
                    warn!(key, error = %err, "ignoring server entry with an invalid key");
                    continue;
                }
                Step::Stale => {
                    debug!(key, version = incoming.server_version, "ignoring entry that is not newer");
                    continue;
                }
                Step::Accept => {
                    let value = entry.value.clone();
                    entry.commit_server(value, incoming.value.clone(), incoming.server_version);
                    table.dirty.contains(key)
                }
                Step::Resolve(conflict) => match resolvers.resolve(&conflict) {
                    Resolution::Merged { value, outbound } => {
                        debug!(key, push = outbound.is_some(), "conflict resolved");
                        entry.commit_server(value, incoming.value.clone(), incoming.server_version);
                        outbound.is_some()
                    }
                    Resolution::Unresolved { reason } => {
                        warn!(key, %reason, "conflict left unresolved");
                        unresolved.push(key.to_string());
                        answered.insert(key);
                        table.dirty.insert(key.to_string());
                        continue;
                    }
                },
                Step::Adopt => {
                    entry.commit_server(
                        incoming.value.clone(),
                        incoming.value.clone(),
                        incoming.server_version,
                    );
                    false
                }
            };

            // Persist before committing; an unsaved key keeps its old state
            if let Err(err) = self.store.save_entry(&entry, dirty) {
                warn!(key, error = %err, "failed to persist applied entry");
                unsaved.push(format!("{key}: {err}"));
                continue;
            }
            if dirty {
                table.dirty.insert(key.to_string());
            } else {
                table.dirty.remove(key);
            }
            if let Some(change) = Change::between(key, old.as_ref(), Some(&entry.value)) {
                changes.push(change);
            }
            table.entries.insert(key.to_string(), entry);
            answered.insert(key);
        }

        for key in session.keys() {
            if !answered.contains(key) {
                table.dirty.insert(key.to_string());
            }
        }

        if !unsaved.is_empty() {
            warn!(
                unsaved = unsaved.len(),
                cursor = table.cursor,
                "keeping cursor behind entries that were not stored"
            );
            table.pull_pending = true;
            return (
                SyncOutcome::Failed(FailureReason::Storage(unsaved.join("; "))),
                changes,
            );
        }

        if response.cursor > table.cursor {
            if let Err(err) = self.store.save_cursor(response.cursor) {
                warn!(error = %err, "failed to persist server cursor");
                table.pull_pending = true;
                return (
                    SyncOutcome::Failed(FailureReason::Storage(err.to_string())),
                    changes,
                );
            }
            table.cursor = response.cursor;
        }
        table.pull_pending = false;

        debug!(
            token = %response.token,
            entries = response.entries.len(),
            unresolved = unresolved.len(),
            cursor = table.cursor,
            "sync session applied"
        );

        let outcome = if unresolved.is_empty() {
            SyncOutcome::Synced
        } else {
            SyncOutcome::PartialConflict(unresolved)
        };
        (outcome, changes)
    }

    fn fail_session(&self, table: &mut Table, mut session: Session, reason: FailureReason) {
        if let Err(err) = session.transition(SessionState::Failed) {
            debug!(error = %err, "session could not be marked failed");
        }
        warn!(token = %session.token(), %reason, "sync session failed");
        let sequence = session.sequence();
        table.dirty.extend(session.into_entries().into_keys());
        self.finish(table, sequence, SyncOutcome::Failed(reason));
    }

    fn finish(&self, table: &mut Table, sequence: u64, outcome: SyncOutcome) {
        if table.finished.len() == FINISHED_HISTORY {
            table.finished.pop_front();
        }
        table.finished.push_back((sequence, outcome));
        self.finished.notify_all();
    }

    fn join(
        &self,
        mut table: MutexGuard<'_, Table>,
        sequence: u64,
        deadline: Option<Instant>,
    ) -> SyncOutcome {
        loop {
            if let Some((_, outcome)) = table.finished.iter().find(|(seq, _)| *seq == sequence) {
                return outcome.clone();
            }
            let oldest = table.finished.front().map_or(0, |(seq, _)| *seq);
            if table.finished.len() == FINISHED_HISTORY && oldest > sequence {
                return SyncOutcome::Failed(FailureReason::StaleSession);
            }
            match deadline {
                Some(deadline) => {
                    if self.finished.wait_until(&mut table, deadline).timed_out() {
                        return table
                            .finished
                            .iter()
                            .find(|(seq, _)| *seq == sequence)
                            .map_or(SyncOutcome::Failed(FailureReason::Timeout), |(_, o)| {
                                o.clone()
                            });
                    }
                }
                None => self.finished.wait(&mut table),
            }
        }
    }
}

impl<S: EntryStore, T: Transport> fmt::Debug for SyncDb<S, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let table = self.table.lock();
        f.debug_struct("SyncDb")
            .field("entries", &table.entries.len())
            .field("dirty", &table.dirty.len())
            .field("cursor", &table.cursor)
            .field("in_flight", &table.session.is_some())
            .finish()
    }
}
