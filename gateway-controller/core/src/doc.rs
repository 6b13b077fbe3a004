use serde::Serialize;
use std::collections::BTreeMap;

/// The fields of one device resource.
pub type Record = serde_json::Map<String, serde_json::Value>;

/// Resources of one folder, keyed by resource path (e.g. `ltm/pool/ns.svc`).
pub type Folder = BTreeMap<String, Record>;

/// The desired state of one partition: folders of resources.
///
/// Every map is ordered, so two documents built from the same topology
/// serialize identically.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct ConfigDoc(BTreeMap<String, Folder>);

// === impl ConfigDoc ===

impl ConfigDoc {
    pub fn is_empty(&self) -> bool {
        self.0.values().all(BTreeMap::is_empty)
    }

    /// The number of resources across all folders.
    pub fn len(&self) -> usize {
        self.0.values().map(BTreeMap::len).sum()
    }

    pub fn folder(&self, name: &str) -> Option<&Folder> {
        self.0.get(name)
    }

    pub fn folder_mut(&mut self, name: &str) -> &mut Folder {
        self.0.entry(name.to_string()).or_default()
    }

    pub fn insert(&mut self, folder: &str, path: impl Into<String>, record: Record) {
        self.folder_mut(folder).insert(path.into(), record);
    }

    pub fn get(&self, folder: &str, path: &str) -> Option<&Record> {
        self.0.get(folder)?.get(path)
    }

    pub fn folders(&self) -> impl Iterator<Item = (&String, &Folder)> {
        self.0.iter()
    }

    /// Iterates `(folder, path, record)` in order.
    pub fn resources(&self) -> impl Iterator<Item = (&str, &str, &Record)> {
        self.0.iter().flat_map(|(folder, resources)| {
            resources
                .iter()
                .map(move |(path, record)| (folder.as_str(), path.as_str(), record))
        })
    }

    /// Merges another document into this one. Resources in `other` replace
    /// resources with the same folder and path.
    pub fn merge(&mut self, other: ConfigDoc) {
        for (folder, resources) in other.0 {
            self.0.entry(folder).or_default().extend(resources);
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(&self.0).unwrap_or_default()
    }
}

impl FromIterator<(String, Folder)> for ConfigDoc {
    fn from_iter<T: IntoIterator<Item = (String, Folder)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}
