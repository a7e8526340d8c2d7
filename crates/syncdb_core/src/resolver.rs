//! Conflict resolution for values changed on both sides.

use crate::set_resolver::SetResolver;
use std::collections::HashMap;
use std::sync::Arc;
use syncdb_codec::{Value, ValueKind};

/// A key that changed both locally and on the server since the last sync.
#[derive(Debug, Clone, PartialEq)]
pub struct Conflict {
    /// The key.
    pub key: String,
    /// Current local value.
    pub local: Value,
    /// Local version.
    pub local_version: u64,
    /// Value the server now holds.
    pub server: Value,
    /// Server version.
    pub server_version: u64,
    /// Last value both sides agreed on, if any.
    pub base: Option<Value>,
}

/// The result of resolving a [`Conflict`].
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// The conflict was settled.
    Merged {
        /// Value to commit locally.
        value: Value,
        /// Value to push back, present exactly when `value` differs from
        /// the server's.
        outbound: Option<Value>,
    },
    /// The resolver could not settle the conflict; the entry stays dirty.
    Unresolved {
        /// Why.
        reason: String,
    },
}

impl Resolution {
    /// Commits `value`, pushing it back if it differs from the server value.
    pub fn merged(value: Value, server: &Value) -> Self {
        let outbound = (&value != server).then(|| value.clone());
        Self::Merged { value, outbound }
    }

    /// Leaves the conflict unresolved.
    pub fn unresolved(reason: impl Into<String>) -> Self {
        Self::Unresolved {
            reason: reason.into(),
        }
    }

    /// Returns the merged value, if any.
    pub fn value(&self) -> Option<&Value> {
        match self {
            Self::Merged { value, .. } => Some(value),
            Self::Unresolved { .. } => None,
        }
    }

    /// Returns true if the merged value must be pushed back.
    pub fn needs_push(&self) -> bool {
        matches!(self, Self::Merged { outbound: Some(_), .. })
    }
}

/// Settles conflicts for the keys it is bound to.
///
/// Resolvers run while the database is locked and must not call back into
/// it.
pub trait Resolver: Send + Sync {
    /// Resolves one conflict.
    fn resolve(&self, conflict: &Conflict) -> Resolution;

    /// Short name used in logs.
    fn name(&self) -> &str {
        "custom"
    }
}

impl<F> Resolver for F
where
    F: Fn(&Conflict) -> Resolution + Send + Sync,
{
    fn resolve(&self, conflict: &Conflict) -> Resolution {
        self(conflict)
    }
}

/// Which side wins when versions are equal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TieBreak {
    /// The server value wins.
    #[default]
    ServerWins,
    /// The local value wins.
    ClientWins,
}

/// Built-in value resolvers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueResolver {
    /// The higher version wins.
    LastWriterWins {
        /// Winner on equal versions.
        tie_break: TieBreak,
    },
    /// Always take the server value.
    Server,
    /// Always keep the local value.
    Client,
    /// Smaller integer wins.
    IntMin,
    /// Larger integer wins.
    IntMax,
    /// Larger float wins.
    FloatMax,
    /// `true` if either side is `true`.
    True,
    /// `false` if either side is `false`.
    False,
}

impl Default for ValueResolver {
    fn default() -> Self {
        Self::LastWriterWins {
            tie_break: TieBreak::ServerWins,
        }
    }
}

impl Resolver for ValueResolver {
    fn resolve(&self, c: &Conflict) -> Resolution {
        let server = &c.server;
        match *self {
            Self::LastWriterWins { tie_break } => {
                let client_wins = c.local_version > c.server_version
                    || (c.local_version == c.server_version && tie_break == TieBreak::ClientWins);
                let winner = if client_wins { &c.local } else { server };
                Resolution::merged(winner.clone(), server)
            }
            Self::Server => Resolution::merged(server.clone(), server),
            Self::Client => Resolution::merged(c.local.clone(), server),
            Self::IntMin | Self::IntMax => match (c.local.as_integer(), server.as_integer()) {
                (Some(l), Some(s)) => {
                    let n = if *self == Self::IntMin { l.min(s) } else { l.max(s) };
                    Resolution::merged(Value::Integer(n), server)
                }
                _ => mismatch(self.name(), "integer", c),
            },
            Self::FloatMax => match (c.local.as_float(), server.as_float()) {
                (Some(l), Some(s)) => {
                    let n = if l.total_cmp(&s).is_gt() { l } else { s };
                    Resolution::merged(Value::Float(n), server)
                }
                _ => mismatch(self.name(), "float", c),
            },
            Self::True | Self::False => match (c.local.as_bool(), server.as_bool()) {
                (Some(l), Some(s)) => {
                    let b = if *self == Self::True { l || s } else { l && s };
                    Resolution::merged(Value::Bool(b), server)
                }
                _ => mismatch(self.name(), "boolean", c),
            },
        }
    }

    fn name(&self) -> &str {
        match self {
            Self::LastWriterWins { .. } => "last-writer-wins",
            Self::Server => "server",
            Self::Client => "client",
            Self::IntMin => "int-min",
            Self::IntMax => "int-max",
            Self::FloatMax => "float-max",
            Self::True => "true",
            Self::False => "false",
        }
    }
}

fn mismatch(name: &str, expected: &str, c: &Conflict) -> Resolution {
    Resolution::unresolved(format!(
        "{name} expects {expected} values, got {} and {}",
        c.local.kind(),
        c.server.kind()
    ))
}

/// Resolver bindings for a database.
///
/// Lookup order: exact key, longest matching prefix, kind of the server
/// value, then the default.
#[derive(Clone)]
pub struct ResolverRegistry {
    keys: HashMap<String, Arc<dyn Resolver>>,
    prefixes: Vec<(String, Arc<dyn Resolver>)>,
    kinds: HashMap<ValueKind, Arc<dyn Resolver>>,
    default: Arc<dyn Resolver>,
}

impl ResolverRegistry {
    /// Starts building a registry.
    pub fn builder() -> ResolverRegistryBuilder {
        ResolverRegistryBuilder::default()
    }

    /// Returns the resolver bound to `key`, given the kind of the server value.
    pub fn resolver_for(&self, key: &str, kind: ValueKind) -> &dyn Resolver {
        if let Some(resolver) = self.keys.get(key) {
            return resolver.as_ref();
        }
        let longest = self
            .prefixes
            .iter()
            .filter(|(prefix, _)| key.starts_with(prefix.as_str()))
            .max_by_key(|(prefix, _)| prefix.len());
        if let Some((_, resolver)) = longest {
            return resolver.as_ref();
        }
        if let Some(resolver) = self.kinds.get(&kind) {
            return resolver.as_ref();
        }
        self.default.as_ref()
    }

    /// Binds a resolver to one key, replacing any earlier binding.
    pub fn bind_key(&mut self, key: impl Into<String>, resolver: impl Resolver + 'static) {
        self.keys.insert(key.into(), Arc::new(resolver));
    }

    /// Binds a resolver to every key starting with `prefix`, replacing any
    /// earlier binding of the same prefix.
    pub fn bind_prefix(&mut self, prefix: impl Into<String>, resolver: impl Resolver + 'static) {
        let prefix = prefix.into();
        self.prefixes.retain(|(p, _)| *p != prefix);
        self.prefixes.push((prefix, Arc::new(resolver)));
    }

    /// Resolves `conflict` with its bound resolver.
    pub fn resolve(&self, conflict: &Conflict) -> Resolution {
        self.resolver_for(&conflict.key, conflict.server.kind())
            .resolve(conflict)
    }
}

impl Default for ResolverRegistry {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl std::fmt::Debug for ResolverRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolverRegistry")
            .field("keys", &self.keys.len())
            .field("prefixes", &self.prefixes.len())
            .field("kinds", &self.kinds.len())
            .field("default", &self.default.name())
            .finish()
    }
}

/// Builder for [`ResolverRegistry`].
///
/// Sets resolve with [`SetResolver::Merge`] and everything else with
/// [`ValueResolver::default`] unless bound otherwise.
pub struct ResolverRegistryBuilder {
    registry: ResolverRegistry,
}

impl Default for ResolverRegistryBuilder {
    fn default() -> Self {
        let mut kinds: HashMap<ValueKind, Arc<dyn Resolver>> = HashMap::new();
        kinds.insert(ValueKind::Set, Arc::new(SetResolver::Merge));
        Self {
            registry: ResolverRegistry {
                keys: HashMap::new(),
                prefixes: Vec::new(),
                kinds,
                default: Arc::new(ValueResolver::default()),
            },
        }
    }
}

impl ResolverRegistryBuilder {
    /// Binds a resolver to one key.
    pub fn bind_key(mut self, key: impl Into<String>, resolver: impl Resolver + 'static) -> Self {
        self.registry.bind_key(key, resolver);
        self
    }

    /// Binds a resolver to every key starting with `prefix`.
    ///
    /// Use [`crate::subdb_key`] or [`crate::map_key`] with an empty key to
    /// build the prefix of a sub-database or map.
    pub fn bind_prefix(
        mut self,
        prefix: impl Into<String>,
        resolver: impl Resolver + 'static,
    ) -> Self {
        self.registry.bind_prefix(prefix, resolver);
        self
    }

    /// Binds a resolver to every server value of `kind`.
    pub fn bind_kind(mut self, kind: ValueKind, resolver: impl Resolver + 'static) -> Self {
        self.registry.kinds.insert(kind, Arc::new(resolver));
        self
    }

    /// Replaces the fallback resolver.
    pub fn default_resolver(mut self, resolver: impl Resolver + 'static) -> Self {
        self.registry.default = Arc::new(resolver);
        self
    }

    /// Finishes the registry.
    pub fn build(self) -> ResolverRegistry {
        self.registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dbutil::{map_key, subdb_key};

    fn conflict(local: Value, local_version: u64, server: Value, server_version: u64) -> Conflict {
        Conflict {
            key: "k".into(),
            local,
            local_version,
            server,
            server_version,
            base: None,
        }
    }

    #[test]
    fn last_writer_wins() {
        let lww = ValueResolver::default();

        // Newer server version wins, nothing to push
        let r = lww.resolve(&conflict(Value::Integer(10), 1, Value::Integer(7), 2));
        assert_eq!(
            r,
            Resolution::Merged {
                value: Value::Integer(7),
                outbound: None
            }
        );

        // Newer local version wins and is pushed back
        let r = lww.resolve(&conflict(Value::Integer(10), 3, Value::Integer(7), 2));
        assert_eq!(r.value(), Some(&Value::Integer(10)));
        assert!(r.needs_push());
    }

    #[test]
    fn tie_break() {
        let c = conflict(Value::from("mine"), 2, Value::from("theirs"), 2);
        let server_wins = ValueResolver::LastWriterWins {
            tie_break: TieBreak::ServerWins,
        };
        let client_wins = ValueResolver::LastWriterWins {
            tie_break: TieBreak::ClientWins,
        };
        assert_eq!(server_wins.resolve(&c).value(), Some(&Value::from("theirs")));
        assert_eq!(client_wins.resolve(&c).value(), Some(&Value::from("mine")));
    }

    #[test]
    fn numeric_resolvers() {
        let c = conflict(Value::Integer(3), 1, Value::Integer(9), 1);
        assert_eq!(ValueResolver::IntMin.resolve(&c).value(), Some(&Value::Integer(3)));
        assert!(ValueResolver::IntMin.resolve(&c).needs_push());
        assert_eq!(ValueResolver::IntMax.resolve(&c).value(), Some(&Value::Integer(9)));
        assert!(!ValueResolver::IntMax.resolve(&c).needs_push());

        let c = conflict(Value::Float(2.5), 1, Value::Float(-1.0), 1);
        assert_eq!(ValueResolver::FloatMax.resolve(&c).value(), Some(&Value::Float(2.5)));
    }

    #[test]
    fn boolean_resolvers() {
        let c = conflict(Value::Bool(true), 1, Value::Bool(false), 1);
        assert_eq!(ValueResolver::True.resolve(&c).value(), Some(&Value::Bool(true)));
        assert_eq!(ValueResolver::False.resolve(&c).value(), Some(&Value::Bool(false)));
    }

    #[test]
    fn type_mismatch_is_unresolved() {
        let c = conflict(Value::from("x"), 1, Value::Integer(1), 1);
        assert!(matches!(
            ValueResolver::IntMax.resolve(&c),
            Resolution::Unresolved { .. }
        ));
        assert!(matches!(
            ValueResolver::True.resolve(&c),
            Resolution::Unresolved { .. }
        ));
    }

    #[test]
    fn server_and_client() {
        let c = conflict(Value::Integer(1), 5, Value::Integer(2), 1);
        assert_eq!(ValueResolver::Server.resolve(&c).value(), Some(&Value::Integer(2)));
        assert_eq!(ValueResolver::Client.resolve(&c).value(), Some(&Value::Integer(1)));
    }

    #[test]
    fn closure_resolver() {
        let sum = |c: &Conflict| {
            let total = c.local.as_integer().unwrap_or(0) + c.server.as_integer().unwrap_or(0);
            Resolution::merged(Value::Integer(total), &c.server)
        };
        let c = conflict(Value::Integer(2), 1, Value::Integer(3), 1);
        assert_eq!(sum.resolve(&c).value(), Some(&Value::Integer(5)));
        assert_eq!(sum.name(), "custom");
    }

    #[test]
    fn registry_lookup_order() {
        let registry = ResolverRegistry::builder()
            .bind_key("player!gold", ValueResolver::IntMin)
            .bind_prefix(subdb_key("player", ""), ValueResolver::IntMax)
            .bind_prefix(map_key("player!flags", ""), ValueResolver::True)
            .bind_kind(ValueKind::Float, ValueResolver::FloatMax)
            .default_resolver(ValueResolver::Server)
            .build();

        assert_eq!(registry.resolver_for("player!gold", ValueKind::Integer).name(), "int-min");
        assert_eq!(registry.resolver_for("player!xp", ValueKind::Integer).name(), "int-max");
        // Longest prefix wins
        assert_eq!(registry.resolver_for("player!flags~door", ValueKind::Bool).name(), "true");
        assert_eq!(registry.resolver_for("speed", ValueKind::Float).name(), "float-max");
        assert_eq!(registry.resolver_for("speed", ValueKind::Text).name(), "server");
        // Sets merge by default
        assert_eq!(registry.resolver_for("bag", ValueKind::Set).name(), "set-merge");
    }

    #[test]
    fn default_registry() {
        let registry = ResolverRegistry::default();
        assert_eq!(
            registry.resolver_for("anything", ValueKind::Integer).name(),
            "last-writer-wins"
        );
        let r = registry.resolve(&conflict(Value::Integer(10), 1, Value::Integer(7), 2));
        assert_eq!(r.value(), Some(&Value::Integer(7)));
    }

    #[test]
    fn rebinding_in_place() {
        let mut registry = ResolverRegistry::default();
        registry.bind_prefix("stats!", ValueResolver::IntMax);
        registry.bind_prefix("stats!", ValueResolver::IntMin);
        registry.bind_key("name", ValueResolver::Client);

        assert_eq!(registry.resolver_for("stats!hp", ValueKind::Integer).name(), "int-min");
        assert_eq!(registry.resolver_for("name", ValueKind::Text).name(), "client");
    }
}
