//! Cross-namespace reference authorization derived from ReferenceGrants.
//!
//! Each grant authorizes the cartesian product of its `from` and `to`
//! entries. Two grants may authorize the same pair, so pairs are counted and
//! an authorization is only revoked when the last grant declaring it goes
//! away.

use ahash::AHashMap as HashMap;
use bigip_gateway_controller_k8s_api::{
    gateway::{ReferenceGrant, GROUP},
    Resource, ResourceExt,
};
use std::fmt;

/// The referencing side of an authorization: objects of a kind in a
/// namespace.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GrantFrom {
    pub group: String,
    pub kind: String,
    pub namespace: String,
}

/// The referenced side of an authorization. A `None` name authorizes every
/// object of the kind in the namespace.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GrantTo {
    pub group: String,
    pub kind: String,
    pub namespace: String,
    pub name: Option<String>,
}

/// Identifies one side of a reference check.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObjectRef {
    pub group: String,
    pub kind: String,
    pub namespace: String,
    pub name: String,
}

#[derive(Debug, Default)]
pub struct ReferenceGrantIndex {
    counts: HashMap<(GrantFrom, GrantTo), usize>,
}

// === impl ReferenceGrantIndex ===

impl ReferenceGrantIndex {
    pub fn set(&mut self, grant: &ReferenceGrant) {
        for pair in Self::pairs(grant) {
            *self.counts.entry(pair).or_default() += 1;
        }
    }

    pub fn unset(&mut self, grant: &ReferenceGrant) {
        for pair in Self::pairs(grant) {
            if let Some(count) = self.counts.get_mut(&pair) {
                *count -= 1;
                if *count == 0 {
                    self.counts.remove(&pair);
                }
            }
        }
    }

    /// Checks the exact `to` key and, for a named target, its wildcard form.
    pub fn exists(&self, from: &GrantFrom, to: &GrantTo) -> bool {
        let exact = self.count(from, to) > 0;
        if exact || to.name.is_none() {
            return exact;
        }
        let wildcard = GrantTo {
            name: None,
            ..to.clone()
        };
        self.count(from, &wildcard) > 0
    }

    /// The number of grants currently declaring the pair.
    pub fn count(&self, from: &GrantFrom, to: &GrantTo) -> usize {
        // Keys are owned pairs, so a lookup needs an owned key.
        self.counts
            .get(&(from.clone(), to.clone()))
            .copied()
            .unwrap_or(0)
    }

    /// The number of distinct authorized pairs.
    pub fn len(&self) -> usize {
        self.counts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    fn pairs(grant: &ReferenceGrant) -> impl Iterator<Item = (GrantFrom, GrantTo)> + '_ {
        let namespace = grant.namespace().unwrap_or_default();
        grant.spec.from.iter().flat_map(move |from| {
            let from = GrantFrom::new(&from.group, &from.kind, &from.namespace);
            let namespace = namespace.clone();
            grant.spec.to.iter().map(move |to| {
                let to = GrantTo::new(&to.group, &to.kind, &namespace, to.name.as_deref());
                (from.clone(), to)
            })
        })
    }
}

/// Decides whether `from` may hold a reference to `to`.
///
/// References within a namespace are always permitted. Across namespaces,
/// only Gateway API objects may refer, and only when a grant in the target
/// namespace authorizes the pair.
pub fn can_refer(index: &ReferenceGrantIndex, from: &ObjectRef, to: &ObjectRef) -> bool {
    if from.namespace == to.namespace {
        return true;
    }
    if from.group != GROUP {
        return false;
    }
    let grant_from = GrantFrom::new(&from.group, &from.kind, &from.namespace);
    let grant_to = GrantTo::new(&to.group, &to.kind, &to.namespace, Some(&to.name));
    index.exists(&grant_from, &grant_to)
}

fn normalize_group(group: &str) -> String {
    if group == "core" {
        return String::new();
    }
    group.to_string()
}

// === impl GrantFrom ===

impl GrantFrom {
    pub fn new(group: &str, kind: &str, namespace: &str) -> Self {
        Self {
            group: normalize_group(group),
            kind: kind.to_string(),
            namespace: namespace.to_string(),
        }
    }
}

impl fmt::Display for GrantFrom {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let group = if self.group.is_empty() { "-" } else { &self.group };
        write!(f, "{}/{}/{}", group, self.kind, self.namespace)
    }
}

// === impl GrantTo ===

impl GrantTo {
    pub fn new(group: &str, kind: &str, namespace: &str, name: Option<&str>) -> Self {
        Self {
            group: normalize_group(group),
            kind: kind.to_string(),
            namespace: namespace.to_string(),
            name: name.map(Into::into),
        }
    }
}

impl fmt::Display for GrantTo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let group = if self.group.is_empty() { "-" } else { &self.group };
        let name = self.name.as_deref().unwrap_or("*");
        write!(f, "{}/{}/{}/{}", group, self.kind, self.namespace, name)
    }
}

// === impl ObjectRef ===

impl ObjectRef {
    /// Describes a cached object by its type's group and kind.
    pub fn of<K>(obj: &K) -> Self
    where
        K: Resource<DynamicType = ()>,
    {
        Self {
            group: normalize_group(&K::group(&())),
            kind: K::kind(&()).into_owned(),
            namespace: obj.namespace().unwrap_or_default(),
            name: obj.name_unchecked(),
        }
    }

    /// Describes a referenced object that may not be cached.
    pub fn named<K>(namespace: &str, name: &str) -> Self
    where
        K: Resource<DynamicType = ()>,
    {
        Self {
            group: normalize_group(&K::group(&())),
            kind: K::kind(&()).into_owned(),
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}/{}", self.kind, self.namespace, self.name)
    }
}
