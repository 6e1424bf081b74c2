// System
use std::collections::BTreeMap;

// Local
use crate::cache::NodeSnapshot;
use crate::error::{Error, Result};

/// The ordered set of node label keys that are copied onto pods.
///
/// Built once at startup from the repeated `--label` flag. Repeating a key is allowed and has no
/// further effect; the first occurrence fixes its position.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TransferSpec {
    keys: Vec<String>,
}

impl TransferSpec {
    pub fn new<I, S>(keys: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut unique: Vec<String> = Vec::new();
        for key in keys {
            let key = key.into();
            if key.is_empty() {
                return Err(Error::InvalidConfig(
                    "label keys to transfer must not be empty".to_string(),
                ));
            }
            if !unique.contains(&key) {
                unique.push(key);
            }
        }
        Ok(Self { keys: unique })
    }

    pub fn keys(&self) -> &[String] {
        &self.keys
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }
}

/// The labels every pod on a given node should carry for the keys in the [`TransferSpec`].
pub type ProjectedLabels = BTreeMap<String, String>;

/// Compute the managed labels for pods scheduled on `node`.
///
/// Every key of `spec` is present in the result. A key the node does not carry maps to the empty
/// string so that pods still get a deterministic value for it.
pub fn project(node: &NodeSnapshot, spec: &TransferSpec) -> ProjectedLabels {
    spec.keys()
        .iter()
        .map(|key| {
            let value = node.labels.get(key).cloned().unwrap_or_default();
            (key.clone(), value)
        })
        .collect()
}
