//! Strongly-typed transitive metadata carried inside values.
//!
//! Build-graph values often carry sets of items collected from all their transitive
//! dependencies: libraries to link, include paths, defines. [`Metadata`] holds one such set.
//! Each item is either *propagated* (visible to every transitive dependent) or *direct
//! only* (visible to the immediate dependent, not beyond).
//!
//! Sets are shared rather than copied, so a value that merges the metadata of its
//! dependencies costs time proportional to what it adds, not to the size of the closure.
//!
//! ```
//! use evalgraph::metadata::{Metadata, MetadataBuilder};
//!
//! let base: Metadata<&str> = MetadataBuilder::new().add("libbase.a").build();
//! let util = MetadataBuilder::new()
//!     .add("libutil.a")
//!     .add_transitive_and_propagate(&base)
//!     .build();
//! let app = MetadataBuilder::new()
//!     .add_transitive_and_propagate(&util)
//!     .build();
//!
//! assert_eq!(app.items(), vec!["libbase.a", "libutil.a"]);
//! ```

use std::fmt;
use std::hash::Hash;
use std::sync::Arc;

use indexmap::IndexSet;

/// An immutable set of items shared between values.
///
/// Iteration order is dependencies first: the items of every nested set (in insertion
/// order), then the set's own items. Duplicates keep their first position.
pub struct TransitiveSet<T> {
    inner: Arc<SetNode<T>>,
}

struct SetNode<T> {
    direct: Vec<T>,
    transitive: Vec<TransitiveSet<T>>,
}

impl<T> Clone for TransitiveSet<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> Default for TransitiveSet<T> {
    fn default() -> Self {
        Self::new(Vec::new(), Vec::new())
    }
}

impl<T> TransitiveSet<T> {
    fn new(direct: Vec<T>, transitive: Vec<TransitiveSet<T>>) -> Self {
        Self {
            inner: Arc::new(SetNode { direct, transitive }),
        }
    }

    /// Returns true if neither this set nor any nested set has an item.
    pub fn is_empty(&self) -> bool {
        self.inner.direct.is_empty()
            && self.inner.transitive.iter().all(TransitiveSet::is_empty)
    }
}

impl<T: Clone + Hash + Eq> TransitiveSet<T> {
    /// Flatten into a deduplicated list.
    pub fn to_list(&self) -> Vec<T> {
        let mut items: IndexSet<T, ahash::RandomState> = IndexSet::default();
        let mut visited: ahash::HashSet<*const SetNode<T>> = ahash::HashSet::default();
        // Post-order walk with an explicit stack; shared subsets are expanded once.
        let mut stack: Vec<(&SetNode<T>, usize)> = vec![(&*self.inner, 0)];
        visited.insert(Arc::as_ptr(&self.inner));
        while let Some((node, child)) = stack.pop() {
            if let Some(next) = node.transitive.get(child) {
                stack.push((node, child + 1));
                if visited.insert(Arc::as_ptr(&next.inner)) {
                    stack.push((&*next.inner, 0));
                }
            } else {
                for item in &node.direct {
                    if !items.contains(item) {
                        items.insert(item.clone());
                    }
                }
            }
        }
        items.into_iter().collect()
    }
}

impl<T: Clone + Hash + Eq> PartialEq for TransitiveSet<T> {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner) || self.to_list() == other.to_list()
    }
}

impl<T: Clone + Hash + Eq> Eq for TransitiveSet<T> {}

impl<T: Clone + Hash + Eq + fmt::Debug> fmt::Debug for TransitiveSet<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.to_list()).finish()
    }
}

/// Metadata is one kind of transitive information attached to a value.
#[derive(Clone, PartialEq, Eq)]
pub struct Metadata<T: Clone + Hash + Eq> {
    propagated: TransitiveSet<T>,
    direct_only: TransitiveSet<T>,
}

impl<T: Clone + Hash + Eq> Default for Metadata<T> {
    fn default() -> Self {
        Self::empty()
    }
}

impl<T: Clone + Hash + Eq> Metadata<T> {
    /// Empty metadata.
    pub fn empty() -> Self {
        Self {
            propagated: TransitiveSet::default(),
            direct_only: TransitiveSet::default(),
        }
    }

    /// Every item visible at this value: propagated items first, then direct-only ones.
    pub fn items(&self) -> Vec<T> {
        let mut items: IndexSet<T, ahash::RandomState> =
            self.propagated.to_list().into_iter().collect();
        items.extend(self.direct_only.to_list());
        items.into_iter().collect()
    }

    /// The items dependents of this value receive.
    pub fn propagated(&self) -> &TransitiveSet<T> {
        &self.propagated
    }

    /// Returns true if there is no item at all.
    pub fn is_empty(&self) -> bool {
        self.propagated.is_empty() && self.direct_only.is_empty()
    }
}

impl<T: Clone + Hash + Eq + fmt::Debug> fmt::Debug for Metadata<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Metadata")
            .field("propagated", &self.propagated)
            .field("direct_only", &self.direct_only)
            .finish()
    }
}

/// Builder for [`Metadata`].
pub struct MetadataBuilder<T> {
    items: Vec<T>,
    propagated: Vec<TransitiveSet<T>>,
    direct_only: Vec<TransitiveSet<T>>,
}

impl<T: Clone + Hash + Eq> Default for MetadataBuilder<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Hash + Eq> MetadataBuilder<T> {
    /// Create an empty builder.
    pub fn new() -> Self {
        Self {
            items: Vec::new(),
            propagated: Vec::new(),
            direct_only: Vec::new(),
        }
    }

    /// Add an item owned by this value. It is propagated to dependents.
    pub fn add(mut self, item: T) -> Self {
        self.items.push(item);
        self
    }

    /// Add several items owned by this value.
    pub fn add_all(mut self, items: impl IntoIterator<Item = T>) -> Self {
        self.items.extend(items);
        self
    }

    /// Merge a dependency's propagated items and pass them on to dependents.
    pub fn add_transitive_and_propagate(mut self, dependency: &Metadata<T>) -> Self {
        if !dependency.propagated.is_empty() {
            self.propagated.push(dependency.propagated.clone());
        }
        self
    }

    /// Merge a dependency's propagated items for this value only.
    pub fn add_transitive_without_propagating(mut self, dependency: &Metadata<T>) -> Self {
        if !dependency.propagated.is_empty() {
            self.direct_only.push(dependency.propagated.clone());
        }
        self
    }

    /// Build the metadata.
    pub fn build(self) -> Metadata<T> {
        Metadata {
            propagated: TransitiveSet::new(self.items, self.propagated),
            direct_only: TransitiveSet::new(Vec::new(), self.direct_only),
        }
    }
}
