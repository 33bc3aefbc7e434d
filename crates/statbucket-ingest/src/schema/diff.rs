//! Presence-only comparison of observed columns against a snapshot

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Columns classified against the current snapshot.
///
/// `added` follows observed order; `removed` and `unchanged` follow snapshot
/// order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaDiff {
    pub unchanged: Vec<String>,
    pub added: Vec<String>,
    pub removed: Vec<String>,
}

impl SchemaDiff {
    pub fn compute<S: AsRef<str>, O: AsRef<str>>(current: &[S], observed: &[O]) -> Self {
        let current_set: HashSet<&str> = current.iter().map(AsRef::as_ref).collect();
        let observed_set: HashSet<&str> = observed.iter().map(AsRef::as_ref).collect();

        let mut added = Vec::new();
        let mut seen = HashSet::new();
        for name in observed.iter().map(AsRef::as_ref) {
            if !current_set.contains(name) && seen.insert(name) {
                added.push(name.to_string());
            }
        }

        let (unchanged, removed): (Vec<String>, Vec<String>) = current
            .iter()
            .map(|c| c.as_ref().to_string())
            .partition(|c| observed_set.contains(c.as_str()));

        Self {
            unchanged,
            added,
            removed,
        }
    }

    /// No columns added or removed
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}
