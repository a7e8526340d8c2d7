//! Conflict resolution for set-valued keys.
//!
//! [`SetResolver::Merge`] reconciles both sides against the last agreed set:
//!
//! ```text
//! merged = (base - local_removes - server_removes) + local_adds + server_adds
//! ```
//!
//! so concurrent additions are never lost and removals are idempotent.

use crate::resolver::{Conflict, Resolution, Resolver};
use std::collections::BTreeSet;
use syncdb_codec::Value;

/// Additions and removals that turn one set into another.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SetDelta {
    /// Elements added.
    pub adds: BTreeSet<Value>,
    /// Elements removed.
    pub removes: BTreeSet<Value>,
}

impl SetDelta {
    /// Computes the delta from `base` to `target`.
    pub fn between(base: &BTreeSet<Value>, target: &BTreeSet<Value>) -> Self {
        Self {
            adds: target.difference(base).cloned().collect(),
            removes: base.difference(target).cloned().collect(),
        }
    }

    /// Applies the delta to `set`. Additions win over removals.
    pub fn apply(&self, set: &BTreeSet<Value>) -> BTreeSet<Value> {
        set.difference(&self.removes)
            .chain(self.adds.iter())
            .cloned()
            .collect()
    }

    /// Combines two deltas made against the same base.
    pub fn merge(&self, other: &SetDelta) -> SetDelta {
        SetDelta {
            adds: self.adds.union(&other.adds).cloned().collect(),
            removes: self.removes.union(&other.removes).cloned().collect(),
        }
    }

    /// Returns true if the delta changes nothing.
    pub fn is_empty(&self) -> bool {
        self.adds.is_empty() && self.removes.is_empty()
    }
}

/// Built-in set resolvers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetResolver {
    /// Three-way merge of both sides' changes against the common base.
    Merge,
    /// Every element present on either side.
    Union,
    /// Only elements present on both sides.
    Intersection,
    /// The server set.
    Server,
}

impl SetResolver {
    /// Resolves two sets against an optional common base.
    pub fn resolve_sets(
        self,
        base: Option<&BTreeSet<Value>>,
        local: &BTreeSet<Value>,
        server: &BTreeSet<Value>,
    ) -> BTreeSet<Value> {
        match self {
            Self::Merge => {
                let empty = BTreeSet::new();
                let base = base.unwrap_or(&empty);
                let local_delta = SetDelta::between(base, local);
                let server_delta = SetDelta::between(base, server);
                local_delta.merge(&server_delta).apply(base)
            }
            Self::Union => local.union(server).cloned().collect(),
            Self::Intersection => local.intersection(server).cloned().collect(),
            Self::Server => server.clone(),
        }
    }
}

impl Resolver for SetResolver {
    fn resolve(&self, c: &Conflict) -> Resolution {
        let (Some(local), Some(server)) = (as_set(&c.local), as_set(&c.server)) else {
            return Resolution::unresolved(format!(
                "{} expects set values, got {} and {}",
                self.name(),
                c.local.kind(),
                c.server.kind()
            ));
        };
        let base = match c.base.as_ref().map(as_set) {
            Some(None) => {
                return Resolution::unresolved(format!("{} base is not a set", self.name()))
            }
            Some(Some(base)) => Some(base),
            None => None,
        };
        let merged = self.resolve_sets(base.as_ref(), &local, &server);
        Resolution::merged(Value::Set(merged), &Value::Set(server))
    }

    fn name(&self) -> &str {
        match self {
            Self::Merge => "set-merge",
            Self::Union => "set-union",
            Self::Intersection => "set-intersection",
            Self::Server => "set-server",
        }
    }
}

/// `Null` reads as the empty set.
fn as_set(value: &Value) -> Option<BTreeSet<Value>> {
    match value {
        Value::Set(items) => Some(items.clone()),
        Value::Null => Some(BTreeSet::new()),
        _ => None,
    }
}
