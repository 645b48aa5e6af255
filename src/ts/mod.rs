use std::fmt::{Display, Formatter};

use crate::variants::SiteIndex;

mod builder;
mod edge_table;
mod marginal_tree;
mod matcher;
mod traceback;

pub use builder::TreeSequenceBuilder;
pub use edge_table::{EdgeTable, MutationTable, NodeTable};
pub use matcher::{AncestorMatcher, PathMatch};

/// An index into the node table of a [`TreeSequenceBuilder`] which uniquely identifies a node
/// of the inferred genealogy. Node ids are allocated monotonically; node 0 conventionally is
/// the root ancestor below the virtual root.
#[derive(
    Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, serde::Serialize, serde::Deserialize,
)]
pub struct Node(pub u32);

impl Node {
    /// Create a node id from a raw index.
    pub fn from_usize(index: usize) -> Self {
        Self(index as u32)
    }

    /// Get the underlying value as a usize for array addressing.
    pub(crate) fn usize(&self) -> usize {
        self.0 as usize
    }
}

impl Display for Node {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Display::fmt(&self.0, f)
    }
}

/// Node flag bit marking sample nodes.
pub const NODE_IS_SAMPLE: u32 = 1;

/// Path-insertion flag: collapse recombination breakpoints shared between children into
/// synthesized internal nodes (see [`TreeSequenceBuilder::add_path`]).
pub const RESOLVE_SHARED_RECOMBS: u32 = 1;

pub(crate) const KNOWN_BUILDER_FLAGS: u32 = RESOLVE_SHARED_RECOMBS;

/// One segment of a copying path: the half-open site interval `[left, right)` during which the
/// path's child copies from `parent`.
#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub struct PathSegment {
    left: SiteIndex,
    right: SiteIndex,
    parent: Node,
}

impl PathSegment {
    /// Create a new path segment
    pub fn new(left: SiteIndex, right: SiteIndex, parent: Node) -> Self {
        Self {
            left,
            right,
            parent,
        }
    }

    /// Get the (inclusive) left site index of the segment
    pub fn left(&self) -> SiteIndex {
        self.left
    }

    /// Get the (exclusive) right site index of the segment
    pub fn right(&self) -> SiteIndex {
        self.right
    }

    /// Get the parent node the child copies from in this segment
    pub fn parent(&self) -> Node {
        self.parent
    }
}
