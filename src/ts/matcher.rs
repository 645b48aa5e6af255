use std::io::{self, Write};

use log::{debug, trace};

use crate::error::{Result, StemmaError};
use crate::ts::marginal_tree::MarginalTree;
use crate::ts::traceback::Traceback;
use crate::ts::{Node, PathSegment, TreeSequenceBuilder};
use crate::variants::{Allele, SiteIndex, ANCESTRAL_STATE, DERIVED_STATE, UNKNOWN_STATE};

/// Flag value of nodes the backward pass has no recombination decision for; such nodes defer
/// to their nearest recorded ancestor.
const REQUIRED_UNSET: i8 = -1;

/// The result of threading one haplotype through a tree sequence: the maximum-likelihood
/// copying path, the haplotype that path actually carries, and the sites where it disagrees
/// with the input.
#[derive(Clone, Debug, PartialEq)]
pub struct PathMatch {
    /// The allele the chosen parent carries at every site of the match window.
    pub matched: Vec<Allele>,
    /// The copying path, sorted by left endpoint and contiguous over the window.
    pub path: Vec<PathSegment>,
    /// Sites where the matched haplotype disagrees with the input, ascending.
    pub mismatches: Vec<SiteIndex>,
}

/// Edge data copied out of the builder's interval indices for the site sweeps.
#[derive(Clone, Copy, Debug)]
struct EdgeEvent {
    left: SiteIndex,
    right: SiteIndex,
    parent: Node,
    child: Node,
}

/// A Li-Stephens copier threading haplotypes through the tree sequence accumulated in a
/// [`TreeSequenceBuilder`].
///
/// The matcher takes a read-only snapshot of the builder's interval indices on construction;
/// the shared borrow rules out mutation of the builder for as long as the matcher lives, so
/// callers shard haplotypes across independent matchers between builder epochs.
///
/// All scratch memory (the marginal tree, likelihoods, the traceback arena) is owned by the
/// matcher and reset wholesale at the start of every [`find_path`].
///
/// [`find_path`]: AncestorMatcher::find_path
pub struct AncestorMatcher<'ts> {
    builder: &'ts TreeSequenceBuilder,
    observation_error: f64,

    /// Edges ordered by `(left, time[parent], child)`.
    insertion_order: Vec<EdgeEvent>,
    /// Edges ordered by `(right, -time[parent], child)`.
    removal_order: Vec<EdgeEvent>,

    tree: MarginalTree,
    traceback: Traceback,
    /// Per relative site, a node achieving the maximum likelihood.
    max_likelihood_node: Vec<Option<Node>>,
    /// Backward-pass scratch mapping nodes to their recorded recombination decision.
    recombination_required: Vec<i8>,
    /// Snapshot of the explicit likelihood set taken before every site update.
    likelihood_nodes_tmp: Vec<Node>,

    total_traceback_size: usize,
    total_sites_matched: usize,
}

impl<'ts> AncestorMatcher<'ts> {
    /// Create a matcher over the current state of the given tree sequence builder.
    ///
    /// # Parameters
    /// - `observation_error`: the probability `mu` of observing an allele differing from the
    ///   copied parent, in `[0, 0.5]`
    pub fn new(builder: &'ts TreeSequenceBuilder, observation_error: f64) -> Result<Self> {
        if !(0.0..=0.5).contains(&observation_error) {
            return Err(StemmaError::bad_param(format!(
                "observation error {} outside [0, 0.5]",
                observation_error
            )));
        }

        let copy_event = |edge: &crate::ts::edge_table::Edge| EdgeEvent {
            left: edge.left,
            right: edge.right,
            parent: edge.parent,
            child: edge.child,
        };
        Ok(Self {
            builder,
            observation_error,
            insertion_order: builder.edges_by_left().map(copy_event).collect(),
            removal_order: builder.edges_by_right().map(copy_event).collect(),
            tree: MarginalTree::new(),
            traceback: Traceback::new(),
            max_likelihood_node: Vec::new(),
            recombination_required: Vec::new(),
            likelihood_nodes_tmp: Vec::new(),
            total_traceback_size: 0,
            total_sites_matched: 0,
        })
    }

    /// Find the maximum-likelihood copying path of `haplotype` over the site window
    /// `[start, end)`.
    ///
    /// The forward pass walks the sites left to right, materializing the marginal genealogy at
    /// every site from the interval indices, propagating the copying likelihoods over the
    /// compressed explicit set and recording per-site recombination decisions in the traceback.
    /// The backward pass walks the traceback right to left, un-advancing the tree, and emits
    /// one path segment per copied stretch.
    pub fn find_path(
        &mut self,
        start: SiteIndex,
        end: SiteIndex,
        haplotype: &[Allele],
    ) -> Result<PathMatch> {
        let num_nodes = self.builder.num_nodes();
        self.validate_window(start, end, haplotype, num_nodes)?;
        let num_window_sites = (end.0 - start.0) as usize;

        self.tree.reset(num_nodes)?;
        self.traceback.reset();
        reinit(&mut self.max_likelihood_node, num_window_sites, None)?;
        reinit(&mut self.recombination_required, num_nodes, REQUIRED_UNSET)?;

        // seek the sweep cursors to the window start and materialize the tree there
        let mut insert_cursor = 0;
        while insert_cursor < self.insertion_order.len()
            && self.insertion_order[insert_cursor].left <= start
        {
            let event = self.insertion_order[insert_cursor];
            if event.right > start {
                self.tree.attach(event.child, event.parent);
            }
            insert_cursor += 1;
        }
        let mut remove_cursor = 0;
        while remove_cursor < self.removal_order.len()
            && self.removal_order[remove_cursor].right <= start
        {
            remove_cursor += 1;
        }

        // every root of the forest starts out with an explicit likelihood of one; everything
        // below inherits it
        for node in 0..num_nodes {
            let node = Node(node as u32);
            if self.tree.parent(node).is_none() {
                self.tree.insert_explicit(node, 1.0);
            }
        }

        self.forward_pass(start, end, haplotype, &mut insert_cursor, &mut remove_cursor)?;

        self.total_traceback_size += self.traceback.total_size();
        self.total_sites_matched += num_window_sites;
        trace!(
            "forward pass over [{}, {}) recorded {} traceback states",
            start,
            end,
            self.traceback.total_size()
        );

        let result = self.backward_pass(start, end, haplotype, insert_cursor, remove_cursor);
        debug!(
            "matched [{}, {}): {} path segments, {} mismatches",
            start,
            end,
            result.path.len(),
            result.mismatches.len()
        );
        Ok(result)
    }

    fn validate_window(
        &self,
        start: SiteIndex,
        end: SiteIndex,
        haplotype: &[Allele],
        num_nodes: usize,
    ) -> Result<()> {
        if num_nodes == 0 {
            return Err(StemmaError::bad_param(
                "cannot match against a tree sequence without nodes",
            ));
        }
        if start >= end || end.usize() > self.builder.num_sites() {
            return Err(StemmaError::bad_param(format!(
                "invalid site window [{}, {})",
                start, end
            )));
        }
        if haplotype.len() != (end.0 - start.0) as usize {
            return Err(StemmaError::bad_param(format!(
                "haplotype of length {} over window [{}, {})",
                haplotype.len(),
                start,
                end
            )));
        }
        if haplotype
            .iter()
            .any(|&state| ![ANCESTRAL_STATE, DERIVED_STATE, UNKNOWN_STATE].contains(&state))
        {
            return Err(StemmaError::bad_param("invalid allele in haplotype"));
        }
        Ok(())
    }

    fn forward_pass(
        &mut self,
        start: SiteIndex,
        end: SiteIndex,
        haplotype: &[Allele],
        insert_cursor: &mut usize,
        remove_cursor: &mut usize,
    ) -> Result<()> {
        let mu = self.observation_error;

        for raw_site in start.0..end.0 {
            let site = SiteIndex(raw_site);
            let relative = (raw_site - start.0) as usize;

            if site > start {
                // retire edges ending here, then expose edges starting here
                while *remove_cursor < self.removal_order.len()
                    && self.removal_order[*remove_cursor].right == site
                {
                    let event = self.removal_order[*remove_cursor];
                    *remove_cursor += 1;
                    // the cut subtree keeps its likelihood through its newly explicit root
                    self.tree.ensure_explicit(event.child);
                    self.tree.detach(event.child);
                }
                while *insert_cursor < self.insertion_order.len()
                    && self.insertion_order[*insert_cursor].left == site
                {
                    let event = self.insertion_order[*insert_cursor];
                    *insert_cursor += 1;
                    self.tree.attach(event.child, event.parent);
                    if self.tree.likelihood(event.child)
                        == self.tree.effective_likelihood(event.parent)
                    {
                        self.tree.remove_explicit(event.child);
                    }
                }
            }

            // nodes mutated at this site emit differently from their ancestors and must
            // carry their own likelihood before the update
            let mutations = self.builder.mutations_at(site);
            for mutation in mutations {
                self.tree.ensure_explicit(mutation.node);
            }

            self.traceback.begin_site();
            self.likelihood_nodes_tmp.clear();
            self.likelihood_nodes_tmp
                .extend_from_slice(self.tree.likelihood_nodes());

            let state = haplotype[relative];
            let rho = self.builder.recombination_rate(site);
            let num_lineages = self.likelihood_nodes_tmp.len() as f64;
            let p_recomb = rho / num_lineages;

            for index in 0..self.likelihood_nodes_tmp.len() {
                let node = self.likelihood_nodes_tmp[index];

                let (p_transition, recombination_required) = if site == start {
                    (self.tree.likelihood(node), false)
                } else {
                    let p_no_recomb = self.tree.likelihood(node) * (1.0 - rho);
                    if p_recomb > p_no_recomb {
                        (p_recomb, true)
                    } else {
                        (p_no_recomb, false)
                    }
                };

                let allele = self.tree.allele_at(node, mutations);
                let p_emission = if state == UNKNOWN_STATE {
                    1.0
                } else if allele == state {
                    1.0 - mu
                } else {
                    mu
                };

                self.tree.set_likelihood(node, p_transition * p_emission);
                self.traceback.push(node, recombination_required);
            }

            // normalize to a maximum of one and remember the winner, smallest id on ties
            let mut best: Option<(Node, f64)> = None;
            for &node in &self.likelihood_nodes_tmp {
                let likelihood = self.tree.likelihood(node);
                let better = match best {
                    None => true,
                    Some((best_node, best_likelihood)) => {
                        likelihood > best_likelihood
                            || (likelihood == best_likelihood && node < best_node)
                    }
                };
                if better {
                    best = Some((node, likelihood));
                }
            }
            let (best_node, best_likelihood) =
                best.expect("site update without likelihood nodes");
            if best_likelihood <= 0.0 {
                return Err(StemmaError::generic(format!(
                    "likelihoods vanished at site {}",
                    site
                )));
            }
            for index in 0..self.likelihood_nodes_tmp.len() {
                let node = self.likelihood_nodes_tmp[index];
                let normalized = self.tree.likelihood(node) / best_likelihood;
                self.tree.set_likelihood(node, normalized);
            }
            debug_assert!(self.tree.likelihood(best_node) == 1.0);
            self.max_likelihood_node[relative] = Some(best_node);

            self.tree.reset_path_cache();
            self.tree.compress();
        }
        Ok(())
    }

    fn backward_pass(
        &mut self,
        start: SiteIndex,
        end: SiteIndex,
        haplotype: &[Allele],
        mut insert_cursor: usize,
        mut remove_cursor: usize,
    ) -> PathMatch {
        let num_window_sites = (end.0 - start.0) as usize;
        let mut matched = vec![UNKNOWN_STATE; num_window_sites];
        let mut path = Vec::new();
        let mut mismatches = Vec::new();

        let mut current_parent = self.max_likelihood_node[num_window_sites - 1]
            .expect("no max likelihood node at last site");
        let mut right = end;

        for raw_site in (start.0..end.0).rev() {
            let site = SiteIndex(raw_site);
            let relative = (raw_site - start.0) as usize;

            for state in self.traceback.site_states(relative) {
                self.recombination_required[state.node.usize()] =
                    state.recombination_required as i8;
            }

            // the allele this site copies is read before any switch: a recombination at this
            // site separates it from the sites below
            let allele = self
                .tree
                .allele_at(current_parent, self.builder.mutations_at(site));
            matched[relative] = allele;
            if haplotype[relative] != UNKNOWN_STATE && allele != haplotype[relative] {
                mismatches.push(site);
            }

            if site > start {
                // resolve the decision of the current parent, deferring to the nearest
                // explicit ancestor recorded at this site
                let mut node = current_parent;
                while self.recombination_required[node.usize()] == REQUIRED_UNSET {
                    node = self
                        .tree
                        .parent(node)
                        .expect("traceback misses the root of the current parent");
                }
                if self.recombination_required[node.usize()] == 1 {
                    path.push(PathSegment::new(site, right, current_parent));
                    right = site;
                    current_parent = self.max_likelihood_node[relative - 1]
                        .expect("no max likelihood node before recombination");
                }
            }

            for state in self.traceback.site_states(relative) {
                self.recombination_required[state.node.usize()] = REQUIRED_UNSET;
            }
            self.tree.reset_path_cache();

            // un-advance the tree into the previous site, undoing this site's edge events
            if site > start {
                while insert_cursor > 0 && self.insertion_order[insert_cursor - 1].left == site {
                    insert_cursor -= 1;
                    self.tree.detach(self.insertion_order[insert_cursor].child);
                }
                while remove_cursor > 0 && self.removal_order[remove_cursor - 1].right == site {
                    remove_cursor -= 1;
                    let event = self.removal_order[remove_cursor];
                    self.tree.attach(event.child, event.parent);
                }
            }
        }

        path.push(PathSegment::new(start, right, current_parent));
        path.reverse();
        mismatches.reverse();

        PathMatch {
            matched,
            path,
            mismatches,
        }
    }

    /// Mean number of traceback states recorded per matched site, over the lifetime of this
    /// matcher. With effective likelihood compression this stays near the lineage count
    /// instead of the node count.
    pub fn mean_traceback_size(&self) -> f64 {
        if self.total_sites_matched == 0 {
            return 0.0;
        }
        self.total_traceback_size as f64 / self.total_sites_matched as f64
    }

    /// Total number of traceback states recorded over the lifetime of this matcher.
    pub fn total_traceback_size(&self) -> usize {
        self.total_traceback_size
    }

    /// Dump the matcher state for diagnostics.
    pub fn print_state(&self, out: &mut dyn Write) -> io::Result<()> {
        writeln!(
            out,
            "ancestor matcher: {} nodes, {} edges, observation error {}",
            self.builder.num_nodes(),
            self.insertion_order.len(),
            self.observation_error
        )?;
        writeln!(
            out,
            "traceback: {} states over {} sites (mean {:.2})",
            self.total_traceback_size,
            self.total_sites_matched,
            self.mean_traceback_size()
        )?;
        writeln!(
            out,
            "explicit likelihood nodes: {:?}",
            self.tree.likelihood_nodes()
        )?;
        Ok(())
    }
}

fn reinit<T: Clone>(buffer: &mut Vec<T>, len: usize, value: T) -> Result<()> {
    buffer.clear();
    buffer
        .try_reserve(len)
        .map_err(|_| StemmaError::OutOfMemory)?;
    buffer.resize(len, value);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::variants::SequencePosition;

    fn builder(num_sites: usize) -> TreeSequenceBuilder {
        TreeSequenceBuilder::new(
            SequencePosition::from_vec((1..=num_sites).collect()),
            vec![1e-2; num_sites],
            0,
        )
        .unwrap()
    }

    fn site(index: usize) -> SiteIndex {
        SiteIndex::from_usize(index)
    }

    #[test]
    fn test_match_against_empty_tree_sequence() {
        // a lone root node: every haplotype copies from it over a single edge
        let mut ts = builder(2);
        let root = ts.add_node(1.0, false);

        let mut matcher = AncestorMatcher::new(&ts, 1e-2).unwrap();
        let result = matcher.find_path(site(0), site(2), &[0, 1]).unwrap();

        assert_eq!(result.path, vec![PathSegment::new(site(0), site(2), root)]);
        assert_eq!(result.matched, vec![0, 0]);
        assert_eq!(result.mismatches, vec![site(1)]);
    }

    #[test]
    fn test_perfect_match_over_single_ancestor() {
        let mut ts = builder(5);
        let root = ts.add_node(2.0, false);
        let ancestor = ts.add_node(1.0, false);
        ts.add_path(ancestor, &[PathSegment::new(site(0), site(5), root)], 0)
            .unwrap();
        ts.add_mutations(ancestor, &[site(1), site(3)], &[DERIVED_STATE; 2])
            .unwrap();

        let mut matcher = AncestorMatcher::new(&ts, 1e-2).unwrap();
        let result = matcher
            .find_path(site(0), site(5), &[0, 1, 0, 1, 0])
            .unwrap();

        assert_eq!(
            result.path,
            vec![PathSegment::new(site(0), site(5), ancestor)]
        );
        assert_eq!(result.matched, vec![0, 1, 0, 1, 0]);
        assert!(result.mismatches.is_empty());
    }

    #[test]
    fn test_forced_recombination_between_disjoint_ancestors() {
        // ancestor a explains sites [0, 5), ancestor b sites [5, 10); a haplotype agreeing
        // with both must switch parents exactly at site 5
        let mut ts = builder(10);
        let root = ts.add_node(2.0, false);
        let ancestor_a = ts.add_node(1.0, false);
        let ancestor_b = ts.add_node(1.0, false);
        ts.add_path(ancestor_a, &[PathSegment::new(site(0), site(5), root)], 0)
            .unwrap();
        ts.add_path(ancestor_b, &[PathSegment::new(site(5), site(10), root)], 0)
            .unwrap();
        ts.add_mutations(
            ancestor_a,
            &[site(0), site(1), site(2), site(3), site(4)],
            &[DERIVED_STATE; 5],
        )
        .unwrap();
        ts.add_mutations(
            ancestor_b,
            &[site(5), site(6), site(7), site(8), site(9)],
            &[DERIVED_STATE; 5],
        )
        .unwrap();

        let mut matcher = AncestorMatcher::new(&ts, 1e-2).unwrap();
        let result = matcher.find_path(site(0), site(10), &[1; 10]).unwrap();

        assert_eq!(
            result.path,
            vec![
                PathSegment::new(site(0), site(5), ancestor_a),
                PathSegment::new(site(5), site(10), ancestor_b),
            ]
        );
        assert_eq!(result.matched, vec![1; 10]);
        assert!(result.mismatches.is_empty());
    }

    #[test]
    fn test_match_follows_recombined_path() {
        // the tree sequence contains a recombined child; matching its exact haplotype
        // reproduces it without mismatches
        let mut ts = builder(10);
        let root = ts.add_node(3.0, false);
        let ancestor_a = ts.add_node(2.0, false);
        let ancestor_b = ts.add_node(2.0, false);
        ts.add_path(ancestor_a, &[PathSegment::new(site(0), site(10), root)], 0)
            .unwrap();
        ts.add_path(ancestor_b, &[PathSegment::new(site(0), site(10), root)], 0)
            .unwrap();
        ts.add_mutations(ancestor_a, &[site(1)], &[DERIVED_STATE]).unwrap();
        ts.add_mutations(ancestor_b, &[site(8)], &[DERIVED_STATE]).unwrap();

        let mut matcher = AncestorMatcher::new(&ts, 1e-2).unwrap();
        let result = matcher
            .find_path(site(0), site(10), &[0, 1, 0, 0, 0, 0, 0, 0, 1, 0])
            .unwrap();

        assert_eq!(result.path.len(), 2);
        assert_eq!(result.path[0].parent(), ancestor_a);
        assert_eq!(result.path[1].parent(), ancestor_b);
        assert_eq!(result.path[0].right(), result.path[1].left());
        assert!(result.mismatches.is_empty());
    }

    #[test]
    fn test_unknown_states_never_mismatch() {
        let mut ts = builder(3);
        let _root = ts.add_node(1.0, false);

        let mut matcher = AncestorMatcher::new(&ts, 1e-2).unwrap();
        let result = matcher
            .find_path(site(0), site(3), &[UNKNOWN_STATE, 0, UNKNOWN_STATE])
            .unwrap();

        assert!(result.mismatches.is_empty());
        assert_eq!(result.matched, vec![0, 0, 0]);
    }

    #[test]
    fn test_subwindow_match() {
        let mut ts = builder(10);
        let root = ts.add_node(2.0, false);
        let ancestor = ts.add_node(1.0, false);
        ts.add_path(ancestor, &[PathSegment::new(site(2), site(8), root)], 0)
            .unwrap();
        ts.add_mutations(ancestor, &[site(4)], &[DERIVED_STATE]).unwrap();

        let mut matcher = AncestorMatcher::new(&ts, 1e-2).unwrap();
        let result = matcher.find_path(site(3), site(7), &[0, 1, 0, 0]).unwrap();

        assert_eq!(
            result.path,
            vec![PathSegment::new(site(3), site(7), ancestor)]
        );
        assert!(result.mismatches.is_empty());
    }

    #[test]
    fn test_window_validation() {
        let mut ts = builder(4);
        ts.add_node(1.0, false);
        let mut matcher = AncestorMatcher::new(&ts, 1e-2).unwrap();

        assert!(matcher.find_path(site(2), site(2), &[]).is_err());
        assert!(matcher.find_path(site(0), site(5), &[0; 5]).is_err());
        assert!(matcher.find_path(site(0), site(4), &[0; 3]).is_err());
        assert!(matcher.find_path(site(0), site(4), &[7, 0, 0, 0]).is_err());
    }

    #[test]
    fn test_rejects_invalid_observation_error() {
        let ts = builder(4);
        assert!(AncestorMatcher::new(&ts, 0.7).is_err());
        assert!(AncestorMatcher::new(&ts, -0.1).is_err());
    }

    #[test]
    fn test_traceback_statistics() {
        let mut ts = builder(4);
        ts.add_node(1.0, false);
        let mut matcher = AncestorMatcher::new(&ts, 1e-2).unwrap();

        assert_eq!(matcher.mean_traceback_size(), 0.0);
        matcher.find_path(site(0), site(4), &[0; 4]).unwrap();

        // a single root node leaves exactly one explicit likelihood per site
        assert_eq!(matcher.total_traceback_size(), 4);
        assert_eq!(matcher.mean_traceback_size(), 1.0);
    }
}
