//! Key and value traits, plus the grouped dependency record.

use std::fmt::Debug;
use std::hash::Hash;

use indexmap::set::Slice;
use indexmap::IndexSet;

/// Identity of a cacheable computation: a computation kind plus its argument.
///
/// Implement this for a closed enum of every kind of key the engine evaluates. Equality and
/// hashing are the only identity used for caching, so arguments must be canonical.
///
/// # Example
///
/// ```
/// use evalgraph::Key;
///
/// #[derive(Clone, Debug, Hash, PartialEq, Eq)]
/// enum BuildKey {
///     File(String),
///     Package(String),
/// }
///
/// #[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
/// enum BuildKind {
///     File,
///     Package,
/// }
///
/// impl Key for BuildKey {
///     type Kind = BuildKind;
///
///     fn kind(&self) -> BuildKind {
///         match self {
///             BuildKey::File(_) => BuildKind::File,
///             BuildKey::Package(_) => BuildKind::Package,
///         }
///     }
/// }
/// ```
pub trait Key: Clone + Hash + Eq + Debug + Send + Sync + 'static {
    /// Tag selecting the function that computes keys of this kind.
    type Kind: Copy + Hash + Eq + Debug + Send + Sync + 'static;

    /// The computation kind of this key.
    fn kind(&self) -> Self::Kind;
}

/// Convenience trait for the values produced by functions.
///
/// `PartialEq` drives change pruning: a recomputed value equal to the previous one does not
/// count as a change for dependents.
pub trait Value: PartialEq + Debug + Send + Sync + 'static {}
impl<T: PartialEq + Debug + Send + Sync + 'static> Value for T {}

/// Dependencies recorded for one evaluation, partitioned into the groups they were requested in.
///
/// Order is request order. A key appears at most once across all groups.
#[derive(Debug, Clone)]
pub struct GroupedKeys<K> {
    keys: IndexSet<K, ahash::RandomState>,
    /// Exclusive end offset of each group in `keys`.
    ends: Vec<usize>,
}

impl<K> Default for GroupedKeys<K> {
    fn default() -> Self {
        Self {
            keys: IndexSet::default(),
            ends: Vec::new(),
        }
    }
}

impl<K: Key> GroupedKeys<K> {
    /// Create an empty record.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a group, dropping keys already recorded. Empty groups are not stored.
    pub fn push_group(&mut self, group: impl IntoIterator<Item = K>) {
        let start = self.keys.len();
        self.keys.extend(group);
        if self.keys.len() > start {
            self.ends.push(self.keys.len());
        }
    }

    /// Whether `key` was recorded in any group.
    pub fn contains(&self, key: &K) -> bool {
        self.keys.contains(key)
    }

    /// The group at `index`, if any.
    pub fn group(&self, index: usize) -> Option<&Slice<K>> {
        let end = *self.ends.get(index)?;
        let start = index.checked_sub(1).map_or(0, |prev| self.ends[prev]);
        Some(&self.keys.as_slice()[start..end])
    }

    /// Number of groups.
    pub fn group_count(&self) -> usize {
        self.ends.len()
    }

    /// Iterate over the groups.
    pub fn groups(&self) -> impl Iterator<Item = &Slice<K>> + '_ {
        (0..self.ends.len()).filter_map(move |index| self.group(index))
    }

    /// Iterate over all keys in request order.
    pub fn iter(&self) -> impl Iterator<Item = &K> + '_ {
        self.keys.iter()
    }

}

impl<K> GroupedKeys<K> {
    /// Total number of keys.
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Returns true if nothing was recorded.
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

impl<K: Key> PartialEq for GroupedKeys<K> {
    fn eq(&self, other: &Self) -> bool {
        self.ends == other.ends && self.keys.iter().eq(other.keys.iter())
    }
}

impl<K: Key> Eq for GroupedKeys<K> {}

impl<K: Key> FromIterator<Vec<K>> for GroupedKeys<K> {
    fn from_iter<T: IntoIterator<Item = Vec<K>>>(iter: T) -> Self {
        let mut keys = GroupedKeys::new();
        for group in iter {
            keys.push_group(group);
        }
        keys
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Debug, Hash, PartialEq, Eq)]
    struct K(u32);

    impl Key for K {
        type Kind = ();

        fn kind(&self) {}
    }

    fn group(keys: &GroupedKeys<K>, index: usize) -> Option<Vec<K>> {
        keys.group(index).map(|group| group.iter().cloned().collect())
    }

    #[test]
    fn groups_drop_duplicates_across_groups() {
        let mut keys = GroupedKeys::new();
        keys.push_group([K(1), K(2), K(1)]);
        keys.push_group([K(2), K(3)]);
        keys.push_group([K(3)]);

        assert_eq!(keys.group_count(), 2);
        assert_eq!(group(&keys, 0), Some(vec![K(1), K(2)]));
        assert_eq!(group(&keys, 1), Some(vec![K(3)]));
        assert_eq!(group(&keys, 2), None);
        assert_eq!(keys.len(), 3);
        assert!(keys.contains(&K(3)));
        assert!(!keys.contains(&K(4)));
    }

    #[test]
    fn iteration_follows_request_order() {
        let keys: GroupedKeys<K> = vec![vec![K(5), K(4)], vec![K(9)]].into_iter().collect();
        let order: Vec<u32> = keys.iter().map(|k| k.0).collect();
        assert_eq!(order, vec![5, 4, 9]);
    }

    #[test]
    fn equality_respects_order_and_grouping() {
        let a: GroupedKeys<K> = vec![vec![K(1), K(2)]].into_iter().collect();
        let b: GroupedKeys<K> = vec![vec![K(2), K(1)]].into_iter().collect();
        let c: GroupedKeys<K> = vec![vec![K(1)], vec![K(2)]].into_iter().collect();
        assert_eq!(a, a.clone());
        assert_ne!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn large_groups_keep_first_occurrence() {
        let mut keys = GroupedKeys::new();
        keys.push_group((0..50_000).map(K));
        keys.push_group((0..50_000).rev().map(K));
        keys.push_group([K(50_000)]);

        assert_eq!(keys.group_count(), 2);
        assert_eq!(keys.len(), 50_001);
        assert_eq!(keys.group(0).map(|g| g.len()), Some(50_000));
        assert_eq!(keys.iter().nth(49_999), Some(&K(49_999)));
    }
}
