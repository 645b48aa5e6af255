use std::cmp::Ordering;

use crate::ts::Node;
use crate::variants::{Allele, SiteIndex};

/// An index into the edge arena of a [`TreeSequenceBuilder`]. Edge records are only ever
/// appended or rewritten in place, never freed, so ids stay valid for the lifetime of the
/// builder.
///
/// [`TreeSequenceBuilder`]: crate::ts::TreeSequenceBuilder
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub(crate) struct EdgeId(pub(crate) u32);

impl EdgeId {
    pub(crate) fn usize(&self) -> usize {
        self.0 as usize
    }
}

/// An edge of the tree sequence: during the half-open site interval `[left, right)`, `child`
/// copies from `parent`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) struct Edge {
    pub(crate) left: SiteIndex,
    pub(crate) right: SiteIndex,
    pub(crate) parent: Node,
    pub(crate) child: Node,
}

/// Key of the left-endpoint interval index, ordered by `(left, time[parent], child)`.
/// The parent time is denormalized into the key so the index does not consult the node table
/// on comparisons.
#[derive(Clone, Copy, Debug)]
pub(crate) struct LeftIndexKey {
    pub(crate) left: SiteIndex,
    pub(crate) parent_time: f64,
    pub(crate) child: Node,
    pub(crate) edge: EdgeId,
}

impl Ord for LeftIndexKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.left
            .cmp(&other.left)
            .then(self.parent_time.total_cmp(&other.parent_time))
            .then(self.child.cmp(&other.child))
    }
}

impl PartialOrd for LeftIndexKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for LeftIndexKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for LeftIndexKey {}

/// Key of the right-endpoint interval index, ordered by `(right, -time[parent], child)`.
/// The inverted time order removes edges bottom-up when a site boundary cuts several stacked
/// edges at once.
#[derive(Clone, Copy, Debug)]
pub(crate) struct RightIndexKey {
    pub(crate) right: SiteIndex,
    pub(crate) parent_time: f64,
    pub(crate) child: Node,
    pub(crate) edge: EdgeId,
}

impl Ord for RightIndexKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.right
            .cmp(&other.right)
            .then(other.parent_time.total_cmp(&self.parent_time))
            .then(self.child.cmp(&other.child))
    }
}

impl PartialOrd for RightIndexKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for RightIndexKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for RightIndexKey {}

/// Key of the path-segment index, ordered by `(parent, child, left)`. Used to find children
/// copying from a given parent when resolving shared recombination breakpoints.
#[derive(Clone, Copy, Debug)]
pub(crate) struct PathIndexKey {
    pub(crate) parent: Node,
    pub(crate) child: Node,
    pub(crate) left: SiteIndex,
    pub(crate) edge: EdgeId,
}

impl PathIndexKey {
    /// Smallest possible key referencing `parent`, for range scans over one parent.
    pub(crate) fn lower_bound(parent: Node) -> Self {
        Self {
            parent,
            child: Node(0),
            left: SiteIndex(0),
            edge: EdgeId(0),
        }
    }

    /// Smallest possible key referencing the successor of `parent`, for range scans over one
    /// parent.
    pub(crate) fn upper_bound(parent: Node) -> Self {
        Self {
            parent: Node(parent.0 + 1),
            child: Node(0),
            left: SiteIndex(0),
            edge: EdgeId(0),
        }
    }
}

impl Ord for PathIndexKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.parent
            .cmp(&other.parent)
            .then(self.child.cmp(&other.child))
            .then(self.left.cmp(&other.left))
    }
}

impl PartialOrd for PathIndexKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for PathIndexKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for PathIndexKey {}

/// Bulk export of the node table as parallel arrays.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct NodeTable {
    pub flags: Vec<u32>,
    pub time: Vec<f64>,
}

/// Bulk export of the edge table as parallel arrays, in insertion order.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EdgeTable {
    pub left: Vec<SiteIndex>,
    pub right: Vec<SiteIndex>,
    pub parent: Vec<Node>,
    pub child: Vec<Node>,
}

impl EdgeTable {
    pub fn len(&self) -> usize {
        self.left.len()
    }

    pub fn is_empty(&self) -> bool {
        self.left.is_empty()
    }
}

/// Bulk export of the mutation table as parallel arrays, ordered by site. `parent` holds, for
/// every mutation, the index of the preceding mutation at the same site on the nearest ancestor
/// node, or `None`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MutationTable {
    pub site: Vec<SiteIndex>,
    pub node: Vec<Node>,
    pub derived_state: Vec<Allele>,
    pub parent: Vec<Option<usize>>,
}

impl MutationTable {
    pub fn len(&self) -> usize {
        self.site.len()
    }

    pub fn is_empty(&self) -> bool {
        self.site.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_left_index_order() {
        let key = |left: usize, time: f64, child: u32| LeftIndexKey {
            left: SiteIndex::from_usize(left),
            parent_time: time,
            child: Node(child),
            edge: EdgeId(0),
        };

        assert!(key(0, 5.0, 1) < key(1, 0.5, 0));
        assert!(key(2, 0.5, 1) < key(2, 5.0, 0));
        assert!(key(2, 0.5, 1) < key(2, 0.5, 2));
    }

    #[test]
    fn test_right_index_inverts_time() {
        let key = |right: usize, time: f64, child: u32| RightIndexKey {
            right: SiteIndex::from_usize(right),
            parent_time: time,
            child: Node(child),
            edge: EdgeId(0),
        };

        // same boundary: the edge below the older parent is removed first
        assert!(key(4, 5.0, 1) < key(4, 0.5, 0));
        assert!(key(3, 0.5, 0) < key(4, 5.0, 1));
    }

    #[test]
    fn test_path_index_bounds() {
        let key = PathIndexKey {
            parent: Node(3),
            child: Node(7),
            left: SiteIndex::from_usize(5),
            edge: EdgeId(1),
        };

        assert!(PathIndexKey::lower_bound(Node(3)) <= key);
        assert!(key < PathIndexKey::upper_bound(Node(3)));
        assert!(key >= PathIndexKey::upper_bound(Node(2)));
    }
}
