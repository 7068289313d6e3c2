//! Diff algebra over two manifests.

use crate::manifest::Manifest;

/// The work a sync has to do, as two sorted path lists.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiffResult {
    /// Present in source and missing or hash-different in target
    pub uploads: Vec<String>,
    /// Present in target, absent from source (delete propagation only)
    pub deletes: Vec<String>,
}

impl DiffResult {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.uploads.is_empty() && self.deletes.is_empty()
    }
}

/// Compute the source→target sync work. Pure; no I/O.
///
/// A mode-only change (same hash, different bits) does not force a
/// re-upload. Both output sequences are lexicographically sorted and
/// disjoint by construction.
#[must_use]
pub fn compute_diff(source: &Manifest, target: &Manifest, delete_enabled: bool) -> DiffResult {
    let mut result = DiffResult::default();

    for (path, se) in source {
        match target.get(path) {
            Some(te) if te.hash == se.hash => {}
            _ => result.uploads.push(path.clone()),
        }
    }

    if delete_enabled {
        for path in target.keys() {
            if !source.contains_key(path) {
                result.deletes.push(path.clone());
            }
        }
    }

    result.uploads.sort();
    result.deletes.sort();
    result
}
