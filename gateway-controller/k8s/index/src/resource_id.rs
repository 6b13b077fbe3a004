use bigip_gateway_controller_k8s_api::{Resource, ResourceExt};

/// Identifies a cached object. Cluster-scoped objects have an empty
/// namespace.
///
/// Displays as the canonical `namespace/name` key, or `name` for
/// cluster-scoped objects.
#[derive(Clone, Debug, Default, Eq, Hash, PartialEq, Ord, PartialOrd)]
pub struct ResourceId {
    pub namespace: String,
    pub name: String,
}

impl ResourceId {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    pub fn cluster(name: impl Into<String>) -> Self {
        Self::new(String::new(), name)
    }

    /// The id of an object, or `None` when it carries no name.
    pub fn of<K: Resource>(obj: &K) -> Option<Self> {
        let name = obj.meta().name.clone()?;
        Some(Self::new(obj.namespace().unwrap_or_default(), name))
    }

    /// Parses a canonical key.
    pub fn parse(key: &str) -> Self {
        match key.split_once('/') {
            Some((namespace, name)) => Self::new(namespace, name),
            None => Self::cluster(key),
        }
    }
}

impl std::fmt::Display for ResourceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.namespace.is_empty() {
            return self.name.fmt(f);
        }
        write!(f, "{}/{}", self.namespace, self.name)
    }
}
