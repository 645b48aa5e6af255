use crate::error::{Result, StemmaError};
use crate::ts::builder::Mutation;
use crate::ts::Node;
use crate::variants::{Allele, ANCESTRAL_STATE};

/// Likelihood sentinel of compressed nodes. Compressed nodes inherit the likelihood of their
/// nearest explicit ancestor.
pub(crate) const NULL_LIKELIHOOD: f64 = -1.0;

/// Sentinel of unresolved path-cache entries. Mutation states are validated to be 0 or 1 on
/// insertion, so the sentinel never collides with a cached allele.
const CACHE_UNSET: Allele = -1;

/// The marginal genealogy at the site a matcher currently visits, represented as a
/// quintuply linked forest over parallel arrays indexed by node id.
///
/// Nodes without an edge covering the current site are roots of the forest (conceptually
/// children of the virtual root). The structure doubles as the likelihood state of the
/// Li-Stephens pass: a sparse set of nodes carries explicit likelihoods, every other node
/// inherits the value of its nearest explicit ancestor, and the set is compressed after every
/// site so that no node's likelihood equals its parent's.
#[derive(Debug, Default)]
pub(crate) struct MarginalTree {
    parent: Vec<Option<Node>>,
    left_child: Vec<Option<Node>>,
    right_child: Vec<Option<Node>>,
    left_sib: Vec<Option<Node>>,
    right_sib: Vec<Option<Node>>,

    /// Explicit likelihoods; [`NULL_LIKELIHOOD`] for compressed nodes.
    likelihood: Vec<f64>,

    /// The nodes carrying explicit likelihoods.
    likelihood_nodes: Vec<Node>,

    /// Memoized allele lookups of the current site.
    path_cache: Vec<Allele>,
    cache_touched: Vec<Node>,
}

impl MarginalTree {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Reset the tree to an edgeless forest of `num_nodes` roots. The previous match's scratch
    /// is dropped wholesale.
    pub(crate) fn reset(&mut self, num_nodes: usize) -> Result<()> {
        fn reinit<T: Clone>(buffer: &mut Vec<T>, len: usize, value: T) -> Result<()> {
            buffer.clear();
            buffer
                .try_reserve(len)
                .map_err(|_| StemmaError::OutOfMemory)?;
            buffer.resize(len, value);
            Ok(())
        }

        reinit(&mut self.parent, num_nodes, None)?;
        reinit(&mut self.left_child, num_nodes, None)?;
        reinit(&mut self.right_child, num_nodes, None)?;
        reinit(&mut self.left_sib, num_nodes, None)?;
        reinit(&mut self.right_sib, num_nodes, None)?;
        reinit(&mut self.likelihood, num_nodes, NULL_LIKELIHOOD)?;
        reinit(&mut self.path_cache, num_nodes, CACHE_UNSET)?;
        self.likelihood_nodes.clear();
        self.cache_touched.clear();
        Ok(())
    }

    pub(crate) fn num_nodes(&self) -> usize {
        self.parent.len()
    }

    pub(crate) fn parent(&self, node: Node) -> Option<Node> {
        self.parent[node.usize()]
    }

    /// Attach `child` below `parent`, prepending it to the parent's child list.
    pub(crate) fn attach(&mut self, child: Node, parent: Node) {
        debug_assert!(self.parent[child.usize()].is_none(), "child already attached");

        self.parent[child.usize()] = Some(parent);
        self.left_sib[child.usize()] = None;
        let first = self.left_child[parent.usize()];
        self.right_sib[child.usize()] = first;
        match first {
            Some(first) => self.left_sib[first.usize()] = Some(child),
            None => self.right_child[parent.usize()] = Some(child),
        }
        self.left_child[parent.usize()] = Some(child);
    }

    /// Cut `child` off its parent, fixing up the sibling linkage. The child becomes a root.
    pub(crate) fn detach(&mut self, child: Node) {
        let parent = self.parent[child.usize()].unwrap();
        let left_sib = self.left_sib[child.usize()];
        let right_sib = self.right_sib[child.usize()];

        match left_sib {
            Some(sib) => self.right_sib[sib.usize()] = right_sib,
            None => self.left_child[parent.usize()] = right_sib,
        }
        match right_sib {
            Some(sib) => self.left_sib[sib.usize()] = left_sib,
            None => self.right_child[parent.usize()] = left_sib,
        }

        self.parent[child.usize()] = None;
        self.left_sib[child.usize()] = None;
        self.right_sib[child.usize()] = None;
    }

    pub(crate) fn is_explicit(&self, node: Node) -> bool {
        self.likelihood[node.usize()] != NULL_LIKELIHOOD
    }

    pub(crate) fn likelihood(&self, node: Node) -> f64 {
        debug_assert!(self.is_explicit(node));
        self.likelihood[node.usize()]
    }

    pub(crate) fn set_likelihood(&mut self, node: Node, value: f64) {
        debug_assert!(self.is_explicit(node));
        self.likelihood[node.usize()] = value;
    }

    /// The nodes currently carrying explicit likelihoods.
    pub(crate) fn likelihood_nodes(&self) -> &[Node] {
        &self.likelihood_nodes
    }

    /// The number of extant lineages the transition step divides the recombination mass over.
    pub(crate) fn num_likelihood_nodes(&self) -> usize {
        self.likelihood_nodes.len()
    }

    /// The likelihood governing `node`, climbing to the nearest explicit ancestor if the node
    /// itself is compressed.
    pub(crate) fn effective_likelihood(&self, node: Node) -> f64 {
        if self.is_explicit(node) {
            return self.likelihood[node.usize()];
        }
        let ancestor = self
            .nearest_explicit_ancestor(node)
            .expect("compressed node without explicit ancestor");
        self.likelihood[ancestor.usize()]
    }

    fn nearest_explicit_ancestor(&self, node: Node) -> Option<Node> {
        let mut current = self.parent[node.usize()];
        while let Some(ancestor) = current {
            if self.is_explicit(ancestor) {
                return Some(ancestor);
            }
            current = self.parent[ancestor.usize()];
        }
        None
    }

    /// Add `node` to the explicit set with the given likelihood.
    pub(crate) fn insert_explicit(&mut self, node: Node, likelihood: f64) {
        debug_assert!(!self.is_explicit(node));
        self.likelihood[node.usize()] = likelihood;
        self.likelihood_nodes.push(node);
    }

    /// Make `node` explicit if it is compressed, inheriting its nearest explicit ancestor's
    /// likelihood.
    pub(crate) fn ensure_explicit(&mut self, node: Node) {
        if !self.is_explicit(node) {
            let inherited = self.effective_likelihood(node);
            self.insert_explicit(node, inherited);
        }
    }

    /// Drop `node` from the explicit set again.
    pub(crate) fn remove_explicit(&mut self, node: Node) {
        debug_assert!(self.is_explicit(node));
        self.likelihood[node.usize()] = NULL_LIKELIHOOD;
        let position = self
            .likelihood_nodes
            .iter()
            .position(|&candidate| candidate == node)
            .unwrap();
        self.likelihood_nodes.swap_remove(position);
    }

    /// Compress the likelihood state: walk the explicit set once and prune every node whose
    /// likelihood equals its nearest explicit ancestor's. Roots stay explicit.
    pub(crate) fn compress(&mut self) {
        let mut nodes = std::mem::take(&mut self.likelihood_nodes);
        nodes.retain(|&node| match self.nearest_explicit_ancestor(node) {
            Some(ancestor)
                if self.likelihood[ancestor.usize()] == self.likelihood[node.usize()] =>
            {
                self.likelihood[node.usize()] = NULL_LIKELIHOOD;
                false
            }
            _ => true,
        });
        self.likelihood_nodes = nodes;
    }

    /// The allele `node` carries at the current site: the derived state of the nearest
    /// ancestor-or-self holding one of the site's mutations, ancestral otherwise. Lookups are
    /// memoized in the path cache until [`Self::reset_path_cache`] is called.
    pub(crate) fn allele_at(&mut self, node: Node, mutations: &[Mutation]) -> Allele {
        let touched_before = self.cache_touched.len();
        let mut current = node;
        let allele = loop {
            let cached = self.path_cache[current.usize()];
            if cached != CACHE_UNSET {
                break cached;
            }
            if let Some(mutation) = mutations.iter().find(|m| m.node == current) {
                break mutation.derived_state;
            }
            self.cache_touched.push(current);
            match self.parent[current.usize()] {
                Some(parent) => current = parent,
                None => break ANCESTRAL_STATE,
            }
        };

        for &visited in &self.cache_touched[touched_before..] {
            self.path_cache[visited.usize()] = allele;
        }
        allele
    }

    /// Invalidate the path cache after a site step, resetting only the touched entries.
    pub(crate) fn reset_path_cache(&mut self) {
        while let Some(node) = self.cache_touched.pop() {
            self.path_cache[node.usize()] = CACHE_UNSET;
        }
    }
}
