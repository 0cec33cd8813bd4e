//! Global item exclusions
//!
//! Items that already exist in the base backup but must not be merged into
//! the new snapshot (replaced or deleted files) are grouped by the canonical
//! prefix of the drive they came from.

use std::collections::{HashMap, HashSet};

use drivesnap_core::domain::BackupPath;

/// Canonical drive prefix -> excluded item names
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExcludeSet {
    entries: HashMap<String, HashSet<String>>,
}

impl ExcludeSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merges `items` into the set recorded for `prefix`.
    pub fn add(&mut self, prefix: &BackupPath, items: impl IntoIterator<Item = String>) {
        self.entries
            .entry(prefix.to_string())
            .or_default()
            .extend(items);
    }

    #[must_use]
    pub fn get(&self, prefix: &BackupPath) -> Option<&HashSet<String>> {
        self.entries.get(&prefix.to_string())
    }

    /// The set recorded under the longest prefix of `path`, if any.
    #[must_use]
    pub fn longest_prefix(&self, path: &BackupPath) -> Option<&HashSet<String>> {
        self.entries
            .iter()
            .filter_map(|(key, items)| {
                let prefix: BackupPath = key.parse().ok()?;
                prefix
                    .is_prefix_of(path)
                    .then_some((prefix.folders().len(), items))
            })
            .max_by_key(|(depth, _)| *depth)
            .map(|(_, items)| items)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Iterates over `(prefix, items)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &HashSet<String>)> {
        self.entries.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use drivesnap_core::domain::{Category, DriveId, ResourceScope, Service};

    fn root(drive: &str) -> BackupPath {
        ResourceScope::new("t", "u", Service::OneDrive, Category::Files)
            .unwrap()
            .drive_root(&DriveId::new(drive.to_string()).unwrap())
            .unwrap()
    }

    #[test]
    fn test_add_merges() {
        let mut set = ExcludeSet::new();
        set.add(&root("d1"), ["a.data".to_string()]);
        set.add(&root("d1"), ["a.meta".to_string()]);

        assert_eq!(set.len(), 1);
        assert_eq!(set.get(&root("d1")).unwrap().len(), 2);
        assert!(set.get(&root("d2")).is_none());
    }

    #[test]
    fn test_longest_prefix() {
        let mut set = ExcludeSet::new();
        set.add(&root("d1"), ["x".to_string()]);
        set.add(&root("d2"), ["y".to_string()]);

        let nested = root("d1").append("a").unwrap().append("b").unwrap();
        let found = set.longest_prefix(&nested).unwrap();
        assert!(found.contains("x"));

        let unrelated = root("d3").append("a").unwrap();
        assert!(set.longest_prefix(&unrelated).is_none());
    }
}
