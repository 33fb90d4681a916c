//! Id-set reconciliation between two device collections

use std::collections::BTreeSet;

use crate::device::DeviceId;

/// Partition of two id sets: what the observed side adds, drops and shares
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdDiff {
    /// Present in `observed`, absent from `known`
    pub new: BTreeSet<DeviceId>,
    /// Present in `known`, absent from `observed`
    pub missing: BTreeSet<DeviceId>,
    /// Present in both
    pub existing: BTreeSet<DeviceId>,
}

impl IdDiff {
    /// Diff two id collections purely on membership
    pub fn between<'a, K, O>(known: K, observed: O) -> Self
    where
        K: IntoIterator<Item = &'a DeviceId>,
        O: IntoIterator<Item = &'a DeviceId>,
    {
        let known: BTreeSet<DeviceId> = known.into_iter().cloned().collect();
        let observed: BTreeSet<DeviceId> = observed.into_iter().cloned().collect();

        Self {
            new: observed.difference(&known).cloned().collect(),
            missing: known.difference(&observed).cloned().collect(),
            existing: known.intersection(&observed).cloned().collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.new.is_empty() && self.missing.is_empty() && self.existing.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(list: &[&str]) -> Vec<DeviceId> {
        list.iter().map(|s| DeviceId::from(*s)).collect()
    }

    #[test]
    fn test_partitions() {
        let known = ids(&["a", "b", "c"]);
        let observed = ids(&["b", "c", "d"]);
        let diff = IdDiff::between(&known, &observed);

        assert_eq!(diff.new, ids(&["d"]).into_iter().collect());
        assert_eq!(diff.missing, ids(&["a"]).into_iter().collect());
        assert_eq!(diff.existing, ids(&["b", "c"]).into_iter().collect());
    }

    #[test]
    fn test_partitions_cover_union_disjointly() {
        let known = ids(&["a", "b", "x"]);
        let observed = ids(&["b", "y", "z"]);
        let diff = IdDiff::between(&known, &observed);

        let total = diff.new.len() + diff.missing.len() + diff.existing.len();
        assert_eq!(total, 5);
        assert!(diff.new.is_disjoint(&diff.missing));
        assert!(diff.new.is_disjoint(&diff.existing));
        assert!(diff.missing.is_disjoint(&diff.existing));
    }

    #[test]
    fn test_duplicates_collapse() {
        let known = ids(&["a", "a"]);
        let observed = ids(&["a"]);
        let diff = IdDiff::between(&known, &observed);
        assert!(diff.new.is_empty());
        assert!(diff.missing.is_empty());
        assert_eq!(diff.existing.len(), 1);
    }

    #[test]
    fn test_empty() {
        let none: Vec<DeviceId> = Vec::new();
        let diff = IdDiff::between(&none, &none);
        assert!(diff.is_empty());
    }
}
