//! Typed handles over database keys.
//!
//! A handle names one key (or one key prefix), carries the Rust type stored
//! there and binds the key's resolver when it is created:
//!
//! - [`SyncValue`]: one value with a default
//! - [`SyncSet`]: a set-valued key with element add/remove events
//! - [`SyncMap`]: one key per map entry, stored as `name~key`
//! - [`SubDb`]: a named scope whose handles live under `name!`
//!
//! Handles hold an `Arc` of the database and can be cloned freely.
//!
//! ```rust,ignore
//! let db = Arc::new(SyncDb::open(config, store, transport, registry)?);
//! let coins = db.value("coins", 0i64, ValueResolver::IntMax)?;
//! coins.update(|n| n + 5)?;
//!
//! let player = db.subdb("player")?;
//! let items: SyncMap<_, _, String, i64> = player.map("items", ValueResolver::IntMax)?;
//! items.insert("potion".to_string(), 3)?;
//! ```

use crate::dbutil::{map_key, subdb_key, validate_name};
use crate::db::SyncDb;
use crate::error::SyncResult;
use crate::observer::Subscription;
use crate::resolver::Resolver;
use crate::set_resolver::SetResolver;
use crate::store::EntryStore;
use crate::transport::Transport;
use std::collections::{BTreeMap, BTreeSet};
use std::marker::PhantomData;
use std::sync::Arc;
use syncdb_codec::Value;
use tracing::debug;

/// A Rust type that can be stored as a [`Value`].
///
/// Implemented for every type convertible to and from [`Value`], which
/// covers `bool`, `i64`, `f64`, `String`, `Vec<u8>` and [`Value`] itself.
pub trait Field: Clone + Send + Sync + 'static {
    /// Converts to the stored form.
    fn to_value(&self) -> Value;

    /// Converts from the stored form, or `None` on a kind mismatch.
    fn from_value(value: Value) -> Option<Self>;
}

impl<T> Field for T
where
    T: Clone + Send + Sync + 'static + Into<Value> + TryFrom<Value>,
{
    fn to_value(&self) -> Value {
        self.clone().into()
    }

    fn from_value(value: Value) -> Option<Self> {
        T::try_from(value).ok()
    }
}

/// A map key, written into the storage key after the map name.
pub trait MapKey: Ord + Clone + Send + Sync + 'static {
    /// Renders the key.
    fn encode_key(&self) -> String;

    /// Parses a rendered key.
    fn decode_key(key: &str) -> Option<Self>;
}

impl MapKey for String {
    fn encode_key(&self) -> String {
        self.clone()
    }

    fn decode_key(key: &str) -> Option<Self> {
        Some(key.to_string())
    }
}

macro_rules! int_map_key {
    ($($ty:ty),*) => {$(
        impl MapKey for $ty {
            fn encode_key(&self) -> String {
                self.to_string()
            }

            fn decode_key(key: &str) -> Option<Self> {
                key.parse().ok()
            }
        }
    )*};
}

int_map_key!(i64, u32, u64);

fn decode<V: Field>(key: &str, value: Option<&Value>) -> Option<V> {
    let value = value?;
    let decoded = V::from_value(value.clone());
    if decoded.is_none() {
        debug!(key, kind = ?value.kind(), "stored value does not match handle type");
    }
    decoded
}

fn stored_set(value: Option<&Value>) -> BTreeSet<Value> {
    match value {
        Some(Value::Set(set)) => set.clone(),
        _ => BTreeSet::new(),
    }
}

impl<S: EntryStore + 'static, T: Transport + 'static> SyncDb<S, T> {
    /// Returns a handle on the value stored under `name`, binding `resolver`
    /// to it. Missing values and values of another type read as `default`.
    ///
    /// # Errors
    ///
    /// Returns a validation error if `name` is not a valid handle name.
    pub fn value<V: Field>(
        self: &Arc<Self>,
        name: &str,
        default: V,
        resolver: impl Resolver + 'static,
    ) -> SyncResult<SyncValue<S, T, V>> {
        validate_name(name, &self.config().limits)?;
        Ok(SyncValue::bind(Arc::clone(self), name.to_string(), default, resolver))
    }

    /// Returns a handle on the set stored under `name`.
    ///
    /// # Errors
    ///
    /// Returns a validation error if `name` is not a valid handle name.
    pub fn set<E: Field + Ord>(
        self: &Arc<Self>,
        name: &str,
        resolver: SetResolver,
    ) -> SyncResult<SyncSet<S, T, E>> {
        validate_name(name, &self.config().limits)?;
        Ok(SyncSet::bind(Arc::clone(self), name.to_string(), resolver))
    }

    /// Returns a handle on the map named `name`. `resolver` applies to every
    /// entry of the map.
    ///
    /// # Errors
    ///
    /// Returns a validation error if `name` is not a valid handle name.
    pub fn map<K: MapKey, V: Field>(
        self: &Arc<Self>,
        name: &str,
        resolver: impl Resolver + 'static,
    ) -> SyncResult<SyncMap<S, T, K, V>> {
        validate_name(name, &self.config().limits)?;
        Ok(SyncMap::bind(Arc::clone(self), name.to_string(), resolver))
    }

    /// Returns the sub-database named `name`.
    ///
    /// # Errors
    ///
    /// Returns a validation error if `name` is not a valid handle name.
    pub fn subdb(self: &Arc<Self>, name: &str) -> SyncResult<SubDb<S, T>> {
        validate_name(name, &self.config().limits)?;
        Ok(SubDb {
            db: Arc::clone(self),
            name: name.to_string(),
        })
    }
}

/// A typed value under one key.
pub struct SyncValue<S: EntryStore, T: Transport, V: Field> {
    db: Arc<SyncDb<S, T>>,
    key: String,
    default: V,
}

impl<S: EntryStore, T: Transport, V: Field> Clone for SyncValue<S, T, V> {
    fn clone(&self) -> Self {
        Self {
            db: Arc::clone(&self.db),
            key: self.key.clone(),
            default: self.default.clone(),
        }
    }
}

impl<S: EntryStore, T: Transport, V: Field> SyncValue<S, T, V> {
    fn bind(
        db: Arc<SyncDb<S, T>>,
        key: String,
        default: V,
        resolver: impl Resolver + 'static,
    ) -> Self {
        db.bind_key(key.clone(), resolver);
        Self { db, key, default }
    }

    /// Returns the storage key.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Returns the default value.
    pub fn default_value(&self) -> &V {
        &self.default
    }

    /// Returns the current value, or the default.
    pub fn get(&self) -> V {
        decode(&self.key, self.db.get(&self.key).as_ref()).unwrap_or_else(|| self.default.clone())
    }

    /// Writes a new value.
    ///
    /// # Errors
    ///
    /// Same as [`SyncDb::put`].
    pub fn set(&self, value: V) -> SyncResult<()> {
        self.db.put(&self.key, value.to_value())
    }

    /// Replaces the value with `f(current)` in one step and returns the new
    /// value. `f` must not call back into the database.
    ///
    /// # Errors
    ///
    /// Same as [`SyncDb::put`].
    pub fn update(&self, f: impl FnOnce(V) -> V) -> SyncResult<V> {
        let mut written = None;
        self.db.update(&self.key, |current| {
            let current = decode(&self.key, current).unwrap_or_else(|| self.default.clone());
            let next = f(current);
            let value = next.to_value();
            written = Some(next);
            Some(value)
        })?;
        Ok(written.unwrap_or_else(|| self.default.clone()))
    }

    /// Removes the value; reads return the default again.
    ///
    /// # Errors
    ///
    /// Same as [`SyncDb::put`].
    pub fn clear(&self) -> SyncResult<()> {
        self.db.remove(&self.key)
    }

    /// Calls `callback` with `(old, new)` whenever the value changes.
    pub fn on_change<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&V, &V) + Send + Sync + 'static,
    {
        let default = self.default.clone();
        self.db.on_change(self.key.clone(), move |key, old, new| {
            let old = decode(key, old).unwrap_or_else(|| default.clone());
            let new = decode(key, new).unwrap_or_else(|| default.clone());
            callback(&old, &new);
        })
    }
}

/// One element added to or removed from a [`SyncSet`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SetEvent<E> {
    /// The element is now present.
    Added(E),
    /// The element is gone.
    Removed(E),
}

/// A typed set under one key.
///
/// Elements that do not decode as `E` are skipped on read but kept in
/// storage.
pub struct SyncSet<S: EntryStore, T: Transport, E: Field + Ord> {
    db: Arc<SyncDb<S, T>>,
    key: String,
    _marker: PhantomData<E>,
}

impl<S: EntryStore, T: Transport, E: Field + Ord> Clone for SyncSet<S, T, E> {
    fn clone(&self) -> Self {
        Self {
            db: Arc::clone(&self.db),
            key: self.key.clone(),
            _marker: PhantomData,
        }
    }
}

impl<S: EntryStore, T: Transport, E: Field + Ord> SyncSet<S, T, E> {
    fn bind(db: Arc<SyncDb<S, T>>, key: String, resolver: SetResolver) -> Self {
        db.bind_key(key.clone(), resolver);
        Self {
            db,
            key,
            _marker: PhantomData,
        }
    }

    /// Returns the storage key.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Returns the elements in order.
    pub fn elements(&self) -> BTreeSet<E> {
        stored_set(self.db.get(&self.key).as_ref())
            .into_iter()
            .filter_map(E::from_value)
            .collect()
    }

    /// Returns true if `element` is present.
    pub fn contains(&self, element: &E) -> bool {
        stored_set(self.db.get(&self.key).as_ref()).contains(&element.to_value())
    }

    /// Returns the number of elements.
    pub fn len(&self) -> usize {
        self.elements().len()
    }

    /// Returns true if the set has no elements.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Adds `element`. Returns false if it was already present.
    ///
    /// # Errors
    ///
    /// Same as [`SyncDb::put`].
    pub fn insert(&self, element: E) -> SyncResult<bool> {
        let element = element.to_value();
        self.db.update(&self.key, |current| {
            let mut set = stored_set(current);
            set.insert(element).then(|| Value::Set(set))
        })
    }

    /// Removes `element`. Returns false if it was absent.
    ///
    /// # Errors
    ///
    /// Same as [`SyncDb::put`].
    pub fn remove(&self, element: &E) -> SyncResult<bool> {
        let element = element.to_value();
        self.db.update(&self.key, |current| {
            let mut set = stored_set(current);
            set.remove(&element).then(|| Value::Set(set))
        })
    }

    /// Removes every element.
    ///
    /// # Errors
    ///
    /// Same as [`SyncDb::put`].
    pub fn clear(&self) -> SyncResult<()> {
        self.db
            .update(&self.key, |current| {
                (!stored_set(current).is_empty()).then(|| Value::Set(BTreeSet::new()))
            })
            .map(|_| ())
    }

    /// Calls `callback` once per element added or removed, by local writes
    /// and by syncs alike. Removals are reported before additions.
    pub fn on_element<F>(&self, callback: F) -> Subscription
    where
        F: Fn(SetEvent<E>) + Send + Sync + 'static,
    {
        self.db.on_change(self.key.clone(), move |_, old, new| {
            let old = stored_set(old);
            let new = stored_set(new);
            for gone in old.difference(&new).cloned().filter_map(E::from_value) {
                callback(SetEvent::Removed(gone));
            }
            for added in new.difference(&old).cloned().filter_map(E::from_value) {
                callback(SetEvent::Added(added));
            }
        })
    }
}

/// A typed map whose entries are separate keys `name~key`.
///
/// The key set is whatever live entries exist under the map's prefix, so
/// entries added by other clients appear after a sync.
pub struct SyncMap<S: EntryStore, T: Transport, K: MapKey, V: Field> {
    db: Arc<SyncDb<S, T>>,
    name: String,
    prefix: String,
    _marker: PhantomData<(K, V)>,
}

impl<S: EntryStore, T: Transport, K: MapKey, V: Field> Clone for SyncMap<S, T, K, V> {
    fn clone(&self) -> Self {
        Self {
            db: Arc::clone(&self.db),
            name: self.name.clone(),
            prefix: self.prefix.clone(),
            _marker: PhantomData,
        }
    }
}

impl<S: EntryStore, T: Transport, K: MapKey, V: Field> SyncMap<S, T, K, V> {
    fn bind(db: Arc<SyncDb<S, T>>, name: String, resolver: impl Resolver + 'static) -> Self {
        let prefix = map_key(&name, "");
        db.bind_prefix(prefix.clone(), resolver);
        Self {
            db,
            name,
            prefix,
            _marker: PhantomData,
        }
    }

    /// Returns the map name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the storage key of the entry for `key`.
    pub fn storage_key(&self, key: &K) -> String {
        map_key(&self.name, &key.encode_key())
    }

    /// Returns the value for `key`.
    pub fn get(&self, key: &K) -> Option<V> {
        let fq = self.storage_key(key);
        decode(&fq, self.db.get(&fq).as_ref())
    }

    /// Returns true if `key` has a live entry.
    pub fn contains_key(&self, key: &K) -> bool {
        self.db.get(&self.storage_key(key)).is_some()
    }

    /// Writes `value` for `key` and returns the previous value.
    ///
    /// # Errors
    ///
    /// Same as [`SyncDb::put`].
    pub fn insert(&self, key: K, value: V) -> SyncResult<Option<V>> {
        let fq = self.storage_key(&key);
        let mut previous = None;
        self.db.update(&fq, |current| {
            previous = decode(&fq, current);
            Some(value.to_value())
        })?;
        Ok(previous)
    }

    /// Removes the entry for `key` and returns its value.
    ///
    /// # Errors
    ///
    /// Same as [`SyncDb::put`].
    pub fn remove(&self, key: &K) -> SyncResult<Option<V>> {
        let fq = self.storage_key(key);
        let mut previous = None;
        self.db.update(&fq, |current| {
            let current = current?;
            previous = decode(&fq, Some(current));
            Some(Value::Null)
        })?;
        Ok(previous)
    }

    /// Returns the keys with live entries, in key order.
    pub fn keys(&self) -> Vec<K> {
        let mut keys: Vec<K> = self
            .db
            .keys_with_prefix(&self.prefix)
            .iter()
            .filter_map(|fq| fq.strip_prefix(&self.prefix))
            .filter_map(K::decode_key)
            .collect();
        keys.sort();
        keys
    }

    /// Returns every entry that decodes as `(K, V)`.
    pub fn entries(&self) -> BTreeMap<K, V> {
        self.keys()
            .into_iter()
            .filter_map(|k| self.get(&k).map(|v| (k, v)))
            .collect()
    }

    /// Returns the number of live entries.
    pub fn len(&self) -> usize {
        self.keys().len()
    }

    /// Returns true if the map has no live entries.
    pub fn is_empty(&self) -> bool {
        self.keys().is_empty()
    }

    /// Calls `callback` with `(key, old, new)` whenever an entry changes.
    /// Removed entries are reported with `new` as `None`.
    pub fn on_change<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&K, Option<&V>, Option<&V>) + Send + Sync + 'static,
    {
        let prefix = self.prefix.clone();
        self.db.on_any_change(move |fq, old, new| {
            let Some(key) = fq.strip_prefix(&prefix).and_then(K::decode_key) else {
                return;
            };
            let old = decode::<V>(fq, old);
            let new = decode::<V>(fq, new);
            callback(&key, old.as_ref(), new.as_ref());
        })
    }
}

/// A named scope of keys stored as `name!key`.
///
/// Handles created through a sub-database live under its prefix, so two
/// sub-databases can use the same handle names.
pub struct SubDb<S: EntryStore, T: Transport> {
    db: Arc<SyncDb<S, T>>,
    name: String,
}

impl<S: EntryStore, T: Transport> Clone for SubDb<S, T> {
    fn clone(&self) -> Self {
        Self {
            db: Arc::clone(&self.db),
            name: self.name.clone(),
        }
    }
}

impl<S: EntryStore, T: Transport> SubDb<S, T> {
    /// Returns the sub-database name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the storage key of `key` in this sub-database.
    pub fn key(&self, key: &str) -> String {
        subdb_key(&self.name, key)
    }

    /// Returns a value handle scoped to this sub-database.
    ///
    /// # Errors
    ///
    /// Returns a validation error if `name` is not a valid handle name.
    pub fn value<V: Field>(
        &self,
        name: &str,
        default: V,
        resolver: impl Resolver + 'static,
    ) -> SyncResult<SyncValue<S, T, V>> {
        validate_name(name, &self.db.config().limits)?;
        Ok(SyncValue::bind(Arc::clone(&self.db), self.key(name), default, resolver))
    }

    /// Returns a set handle scoped to this sub-database.
    ///
    /// # Errors
    ///
    /// Returns a validation error if `name` is not a valid handle name.
    pub fn set<E: Field + Ord>(
        &self,
        name: &str,
        resolver: SetResolver,
    ) -> SyncResult<SyncSet<S, T, E>> {
        validate_name(name, &self.db.config().limits)?;
        Ok(SyncSet::bind(Arc::clone(&self.db), self.key(name), resolver))
    }

    /// Returns a map handle scoped to this sub-database.
    ///
    /// # Errors
    ///
    /// Returns a validation error if `name` is not a valid handle name.
    pub fn map<K: MapKey, V: Field>(
        &self,
        name: &str,
        resolver: impl Resolver + 'static,
    ) -> SyncResult<SyncMap<S, T, K, V>> {
        validate_name(name, &self.db.config().limits)?;
        Ok(SyncMap::bind(Arc::clone(&self.db), self.key(name), resolver))
    }

    /// Returns every live storage key in this sub-database.
    pub fn keys(&self) -> Vec<String> {
        self.db.keys_with_prefix(&self.key(""))
    }

    /// Binds `resolver` to every key of this sub-database. Handles bound to
    /// a single key keep their own resolver.
    pub fn bind_all(&self, resolver: impl Resolver + 'static) {
        self.db.bind_prefix(self.key(""), resolver);
    }

    /// Removes every live key of this sub-database and returns how many
    /// were removed.
    ///
    /// # Errors
    ///
    /// Same as [`SyncDb::put`]; keys removed before the error stay removed.
    pub fn remove_all(&self) -> SyncResult<usize> {
        let keys = self.keys();
        for key in &keys {
            self.db.remove(key)?;
        }
        Ok(keys.len())
    }
}
