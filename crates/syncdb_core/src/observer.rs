//! Change notifications.

use parking_lot::{Condvar, Mutex, RwLock};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};
use syncdb_codec::Value;

/// Callback invoked with `(key, old value, new value)`.
///
/// Absent keys and tombstones are reported as `None`.
pub type ChangeCallback = Arc<dyn Fn(&str, Option<&Value>, Option<&Value>) + Send + Sync>;

/// Handle returned by a subscription, used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Subscription(u64);

/// A committed change waiting to be announced.
#[derive(Debug, Clone, PartialEq)]
pub struct Change {
    /// The key.
    pub key: String,
    /// Value before the change.
    pub old: Option<Value>,
    /// Value after the change.
    pub new: Option<Value>,
}

impl Change {
    /// Builds a change, or `None` if nothing visibly changed.
    pub fn between(key: &str, old: Option<&Value>, new: Option<&Value>) -> Option<Self> {
        let old = old.filter(|v| !v.is_null());
        let new = new.filter(|v| !v.is_null());
        (old != new).then(|| Change {
            key: key.to_string(),
            old: old.cloned(),
            new: new.cloned(),
        })
    }
}

struct Observer {
    id: u64,
    key: Option<String>,
    callback: ChangeCallback,
}

/// Place of a batch of changes in commit order.
///
/// Taken while the table lock is held, so tickets follow commit order.
#[must_use]
#[derive(Debug)]
pub(crate) struct Ticket(u64);

#[derive(Debug, Default)]
struct Dispatch {
    issued: u64,
    next: u64,
    owner: Option<ThreadId>,
    /// Tickets delivered out of turn by a callback that wrote to the database.
    nested: BTreeSet<u64>,
}

/// Registered observers in registration order.
///
/// Batches are delivered one at a time in ticket order. A callback that
/// writes to the database gets its own changes delivered immediately, on the
/// same thread, instead of waiting behind itself.
#[derive(Default)]
pub(crate) struct Observers {
    next_id: AtomicU64,
    observers: RwLock<Vec<Observer>>,
    dispatch: Mutex<Dispatch>,
    turn: Condvar,
}

struct Turn<'a>(&'a Observers);

impl Drop for Turn<'_> {
    fn drop(&mut self) {
        let mut dispatch = self.0.dispatch.lock();
        dispatch.owner = None;
        dispatch.next += 1;
        loop {
            let next = dispatch.next;
            if !dispatch.nested.remove(&next) {
                break;
            }
            dispatch.next += 1;
        }
        self.0.turn.notify_all();
    }
}

impl Observers {
    pub(crate) fn subscribe<F>(&self, key: Option<String>, callback: F) -> Subscription
    where
        F: Fn(&str, Option<&Value>, Option<&Value>) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let callback: ChangeCallback = Arc::new(callback);
        self.observers.write().push(Observer { id, key, callback });
        Subscription(id)
    }

    pub(crate) fn unsubscribe(&self, subscription: Subscription) -> bool {
        let mut observers = self.observers.write();
        let before = observers.len();
        observers.retain(|o| o.id != subscription.0);
        observers.len() != before
    }

    pub(crate) fn len(&self) -> usize {
        self.observers.read().len()
    }

    /// Reserves the next place in delivery order. Call with the table lock held.
    pub(crate) fn ticket(&self) -> Ticket {
        let mut dispatch = self.dispatch.lock();
        let ticket = Ticket(dispatch.issued);
        dispatch.issued += 1;
        ticket
    }

    /// Delivers `changes` once every earlier ticket has been delivered.
    /// Must be called without the table lock.
    pub(crate) fn deliver(&self, ticket: Ticket, changes: &[Change]) {
        let me = thread::current().id();
        {
            let mut dispatch = self.dispatch.lock();
            if dispatch.owner == Some(me) {
                dispatch.nested.insert(ticket.0);
                drop(dispatch);
                self.notify(changes);
                return;
            }
            while dispatch.next != ticket.0 {
                self.turn.wait(&mut dispatch);
            }
            dispatch.owner = Some(me);
        }
        // Advances the turn even if a callback panics
        let _turn = Turn(self);
        self.notify(changes);
    }

    /// Invokes matching callbacks in registration order.
    fn notify(&self, changes: &[Change]) {
        if changes.is_empty() {
            return;
        }
        // Callbacks may subscribe or unsubscribe
        let snapshot: Vec<(Option<String>, ChangeCallback)> = self
            .observers
            .read()
            .iter()
            .map(|o| (o.key.clone(), Arc::clone(&o.callback)))
            .collect();
        for change in changes {
            for (key, callback) in &snapshot {
                if key.as_deref().map_or(true, |k| k == change.key) {
                    callback(&change.key, change.old.as_ref(), change.new.as_ref());
                }
            }
        }
    }
}

impl std::fmt::Debug for Observers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Observers").field("count", &self.len()).finish()
    }
}
