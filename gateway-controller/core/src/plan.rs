//! Derives device operations from a pair of snapshots.
//!
//! Creates and updates are ordered so that referenced objects (certificates,
//! nodes, pools, rules) exist before the objects that use them (profiles,
//! virtuals). Deletes run in the opposite order.

use crate::{ConfigDoc, Record};
use std::cmp::Reverse;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Operation {
    Create {
        folder: String,
        path: String,
        record: Record,
    },
    Update {
        folder: String,
        path: String,
        record: Record,
    },
    Delete { folder: String, path: String },
}

/// Returns the operations converging `from` to `to`. Identical documents
/// produce no operations.
pub fn plan(from: &ConfigDoc, to: &ConfigDoc) -> Vec<Operation> {
    let mut upserts = Vec::new();
    for (folder, path, record) in to.resources() {
        match from.get(folder, path) {
            None => upserts.push(Operation::Create {
                folder: folder.to_string(),
                path: path.to_string(),
                record: record.clone(),
            }),
            Some(prior) if prior != record => upserts.push(Operation::Update {
                folder: folder.to_string(),
                path: path.to_string(),
                record: record.clone(),
            }),
            Some(_) => {}
        }
    }

    let mut deletes = from
        .resources()
        .filter(|(folder, path, _)| to.get(folder, path).is_none())
        .map(|(folder, path, _)| Operation::Delete {
            folder: folder.to_string(),
            path: path.to_string(),
        })
        .collect::<Vec<_>>();

    // Stable sorts keep the document's path order within a rank.
    upserts.sort_by_key(|op| rank(op.path()));
    deletes.sort_by_key(|op| Reverse(rank(op.path())));

    upserts.extend(deletes);
    upserts
}

fn rank(path: &str) -> usize {
    const ORDER: &[&str] = &[
        "shared/file-transfer",
        "sys/file",
        "net/arp",
        "net/fdb",
        "ltm/node",
        "ltm/monitor",
        "ltm/pool",
        "ltm/rule",
        "ltm/profile",
        "ltm/snat",
        "ltm/virtual-address",
        "ltm/virtual",
    ];
    ORDER
        .iter()
        .position(|prefix| {
            path.strip_prefix(prefix)
                .map(|rest| rest.starts_with('/'))
                .unwrap_or(false)
        })
        .unwrap_or(ORDER.len())
}

// === impl Operation ===

impl Operation {
    pub fn path(&self) -> &str {
        match self {
            Self::Create { path, .. } | Self::Update { path, .. } | Self::Delete { path, .. } => {
                path
            }
        }
    }

    pub fn folder(&self) -> &str {
        match self {
            Self::Create { folder, .. }
            | Self::Update { folder, .. }
            | Self::Delete { folder, .. } => folder,
        }
    }

    pub fn verb(&self) -> &'static str {
        match self {
            Self::Create { .. } => "create",
            Self::Update { .. } => "update",
            Self::Delete { .. } => "delete",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn doc(entries: &[(&str, serde_json::Value)]) -> ConfigDoc {
        let mut doc = ConfigDoc::default();
        for (path, value) in entries {
            let record = value.as_object().cloned().unwrap_or_default();
            doc.insert("", *path, record);
        }
        doc
    }

    #[test]
    fn identical_documents_plan_nothing() {
        let d = doc(&[
            ("ltm/pool/ns.svc", json!({"monitor": "min 1 of tcp"})),
            ("ltm/virtual/gw.http", json!({"destination": "10.1.1.1:80"})),
        ]);
        assert!(plan(&d, &d.clone()).is_empty());
        assert!(plan(&ConfigDoc::default(), &ConfigDoc::default()).is_empty());
    }

    #[test]
    fn creates_dependencies_first_and_deletes_them_last() {
        let from = doc(&[
            ("ltm/pool/ns.old", json!({})),
            ("ltm/virtual/gw.old", json!({})),
        ]);
        let to = doc(&[
            ("ltm/virtual/gw.new", json!({})),
            ("ltm/rule/gw.new", json!({})),
            ("ltm/pool/ns.new", json!({})),
        ]);
        let paths = plan(&from, &to)
            .iter()
            .map(|op| format!("{} {}", op.verb(), op.path()))
            .collect::<Vec<_>>();
        assert_eq!(
            paths,
            vec![
                "create ltm/pool/ns.new",
                "create ltm/rule/gw.new",
                "create ltm/virtual/gw.new",
                "delete ltm/virtual/gw.old",
                "delete ltm/pool/ns.old",
            ]
        );
    }

    #[test]
    fn changed_records_are_updated() {
        let from = doc(&[("ltm/pool/ns.svc", json!({"members": []}))]);
        let to = doc(&[("ltm/pool/ns.svc", json!({"members": ["10.0.0.1:80"]}))]);
        let ops = plan(&from, &to);
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].verb(), "update");
    }
}
