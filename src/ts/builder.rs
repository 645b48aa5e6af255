use std::collections::HashMap;
use std::hash::BuildHasherDefault;
use std::io::{self, Write};

use indexset::BTreeSet;
use log::{debug, trace};
use twox_hash::XxHash64;

use crate::error::{Result, StemmaError};
use crate::ts::edge_table::{
    Edge, EdgeId, EdgeTable, LeftIndexKey, MutationTable, NodeTable, PathIndexKey, RightIndexKey,
};
use crate::ts::{Node, PathSegment, KNOWN_BUILDER_FLAGS, NODE_IS_SAMPLE, RESOLVE_SHARED_RECOMBS};
use crate::variants::{Allele, SequencePosition, SiteIndex, ANCESTRAL_STATE, DERIVED_STATE};

/// A single mutation record: the tree node it sits on and the state it mutates the site into.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) struct Mutation {
    pub(crate) node: Node,
    pub(crate) derived_state: Allele,
}

/// A run of consecutive incoming path segments found identically in an existing child's path.
struct SharedRun {
    partner: Node,
    /// position of the first matched edge in the partner's path
    start_pos: usize,
    /// number of matched segments (>= 2)
    len: usize,
}

/// The incremental edge database at the heart of the inference: nodes carry times and flags,
/// every child carries at most one copying path, and all edges are kept in three sorted
/// interval indices so matchers can materialize the marginal genealogy at any site.
///
/// Nodes and edges accumulate monotonically; nothing is ever removed. Shared-recombination
/// resolution only rewrites existing edge records onto synthesized internal nodes.
pub struct TreeSequenceBuilder {
    positions: Vec<SequencePosition>,
    recombination_rate: Vec<f64>,
    flags: u32,

    time: Vec<f64>,
    node_flags: Vec<u32>,
    /// Nodes created by shared-recombination resolution; eligible for grouping-edge reuse.
    /// This marker is in-memory state only and intentionally not part of the dumped tables.
    synthesized: Vec<bool>,

    /// Edge arena; records are appended or rewritten in place, never freed.
    edges: Vec<Edge>,
    /// Per-child edge list, sorted by left endpoint.
    paths: Vec<Vec<EdgeId>>,

    left_index: BTreeSet<LeftIndexKey>,
    right_index: BTreeSet<RightIndexKey>,
    path_index: BTreeSet<PathIndexKey>,

    /// Per-site mutation lists in list order (newest calls prepend).
    site_mutations: Vec<Vec<Mutation>>,
    num_mutations: usize,
}

impl TreeSequenceBuilder {
    /// Create a builder over a genome of `positions.len()` sites.
    ///
    /// # Parameters
    /// - `positions`: the physical position of every site, strictly increasing
    /// - `recombination_rate`: the per-site recombination probability in `[0, 1]`; the entry of
    ///   site 0 is never read
    /// - `flags`: builder-level configuration, see [`RESOLVE_SHARED_RECOMBS`]
    pub fn new(
        positions: Vec<SequencePosition>,
        recombination_rate: Vec<f64>,
        flags: u32,
    ) -> Result<Self> {
        check_flags(flags)?;
        if recombination_rate.len() != positions.len() {
            return Err(StemmaError::bad_param(format!(
                "{} recombination rates for {} sites",
                recombination_rate.len(),
                positions.len()
            )));
        }
        if positions.windows(2).any(|pair| pair[0] >= pair[1]) {
            return Err(StemmaError::bad_param(
                "site positions must be strictly increasing",
            ));
        }
        if recombination_rate
            .iter()
            .any(|&rate| !(0.0..=1.0).contains(&rate))
        {
            return Err(StemmaError::bad_param(
                "recombination rates must lie in [0, 1]",
            ));
        }

        let num_sites = positions.len();
        Ok(Self {
            positions,
            recombination_rate,
            flags,
            time: Vec::new(),
            node_flags: Vec::new(),
            synthesized: Vec::new(),
            edges: Vec::new(),
            paths: Vec::new(),
            left_index: BTreeSet::new(),
            right_index: BTreeSet::new(),
            path_index: BTreeSet::new(),
            site_mutations: (0..num_sites).map(|_| Vec::new()).collect(),
            num_mutations: 0,
        })
    }

    /// Number of variant sites of the genome.
    pub fn num_sites(&self) -> usize {
        self.positions.len()
    }

    /// Number of nodes allocated so far.
    pub fn num_nodes(&self) -> usize {
        self.time.len()
    }

    /// Number of edges inserted so far.
    pub fn num_edges(&self) -> usize {
        self.edges.len()
    }

    /// Number of mutations recorded so far.
    pub fn num_mutations(&self) -> usize {
        self.num_mutations
    }

    /// The time of a node.
    pub fn node_time(&self, node: Node) -> f64 {
        self.time[node.usize()]
    }

    /// Whether a node is a sample node.
    pub fn is_sample(&self, node: Node) -> bool {
        self.node_flags[node.usize()] & NODE_IS_SAMPLE != 0
    }

    /// The physical position of a site.
    pub fn position(&self, site: SiteIndex) -> SequencePosition {
        self.positions[site.usize()]
    }

    /// The recombination probability between a site and its predecessor.
    pub fn recombination_rate(&self, site: SiteIndex) -> f64 {
        self.recombination_rate[site.usize()]
    }

    /// Append a node with the given time. Ancestors are expected to arrive oldest first, but
    /// the ordering is only enforced through the edges that later reference the node.
    pub fn add_node(&mut self, time: f64, is_sample: bool) -> Node {
        self.push_node(time, if is_sample { NODE_IS_SAMPLE } else { 0 }, false)
    }

    fn push_node(&mut self, time: f64, flags: u32, synthesized: bool) -> Node {
        let node = Node(self.time.len() as u32);
        self.time.push(time);
        self.node_flags.push(flags);
        self.synthesized.push(synthesized);
        self.paths.push(Vec::new());
        node
    }

    /// Insert the copying path of `child`.
    ///
    /// The segments must be sorted by left endpoint, contiguous, lie within the genome, and
    /// reference parents strictly older than the child. A child can carry only one path.
    ///
    /// When [`RESOLVE_SHARED_RECOMBS`] is set (on the builder or in `flags`), recombination
    /// breakpoints this path shares with an already inserted path are collapsed: a new internal
    /// node is synthesized between the children and the shared parents (or an existing
    /// synthesized node is reused), and both children route through it. Either the whole path
    /// (with all rewrites) is inserted, or, on a validation error, nothing is.
    pub fn add_path(&mut self, child: Node, segments: &[PathSegment], flags: u32) -> Result<()> {
        check_flags(flags)?;
        self.validate_path(child, segments)?;
        self.edges
            .try_reserve(2 * segments.len() + 2)
            .map_err(|_| StemmaError::OutOfMemory)?;

        let resolve = (self.flags | flags) & RESOLVE_SHARED_RECOMBS != 0;
        let segments = if resolve && segments.len() > 1 {
            self.resolve_shared_recombs(child, segments)
        } else {
            segments.to_vec()
        };

        for segment in &segments {
            let edge = self.push_edge(segment.left(), segment.right(), segment.parent(), child);
            self.index_edge(edge);
            self.paths[child.usize()].push(edge);
        }

        trace!(
            "inserted path of {} for {} segments, {} edges total",
            child,
            segments.len(),
            self.edges.len()
        );
        Ok(())
    }

    fn validate_path(&self, child: Node, segments: &[PathSegment]) -> Result<()> {
        if child.usize() >= self.num_nodes() {
            return Err(StemmaError::bad_param(format!("unknown child {}", child)));
        }
        if !self.paths[child.usize()].is_empty() {
            return Err(StemmaError::bad_param(format!(
                "child {} already has a path",
                child
            )));
        }
        if segments.is_empty() {
            return Err(StemmaError::bad_param("empty path"));
        }
        for segment in segments {
            if segment.left() >= segment.right() || segment.right().usize() > self.num_sites() {
                return Err(StemmaError::bad_param(format!(
                    "segment [{}, {}) of child {} out of range",
                    segment.left(),
                    segment.right(),
                    child
                )));
            }
            if segment.parent().usize() >= self.num_nodes() {
                return Err(StemmaError::bad_param(format!(
                    "unknown parent {}",
                    segment.parent()
                )));
            }
            if self.time[segment.parent().usize()] <= self.time[child.usize()] {
                return Err(StemmaError::bad_param(format!(
                    "parent {} is not older than child {}",
                    segment.parent(),
                    child
                )));
            }
        }
        if segments
            .windows(2)
            .any(|pair| pair[1].left() != pair[0].right())
        {
            return Err(StemmaError::bad_param(
                "path segments must be sorted and contiguous",
            ));
        }
        Ok(())
    }

    /// Scan the incoming path for runs of segments shared with existing paths and collapse
    /// every resolvable run, returning the rewritten segment list.
    fn resolve_shared_recombs(&mut self, child: Node, segments: &[PathSegment]) -> Vec<PathSegment> {
        let mut result = Vec::with_capacity(segments.len());
        let mut cursor = 0;
        while cursor < segments.len() {
            let tail = &segments[cursor..];
            let collapsed = self
                .find_shared_run(child, tail)
                .and_then(|run| self.collapse_run(child, &tail[..run.len], run));
            match collapsed {
                Some((segment, run_len)) => {
                    result.push(segment);
                    cursor += run_len;
                }
                None => {
                    result.push(segments[cursor]);
                    cursor += 1;
                }
            }
        }
        result
    }

    /// Find the longest run of segments starting at `tail[0]` that appears, with identical
    /// intervals and parents, as a consecutive run in another child's path. Runs shorter than
    /// two segments carry no recombination breakpoint and are not reported.
    fn find_shared_run(&self, child: Node, tail: &[PathSegment]) -> Option<SharedRun> {
        if tail.len() < 2 {
            return None;
        }
        let first = tail[0];
        let probe =
            PathIndexKey::lower_bound(first.parent())..PathIndexKey::upper_bound(first.parent());

        let mut best: Option<SharedRun> = None;
        for key in self.path_index.range(probe) {
            if key.child == child || key.left != first.left() {
                continue;
            }
            let partner_path = &self.paths[key.child.usize()];
            let start_pos = partner_path
                .iter()
                .position(|&edge| edge == key.edge)
                .unwrap();

            let len = partner_path[start_pos..]
                .iter()
                .zip(tail)
                .take_while(|(&edge, segment)| {
                    let edge = &self.edges[edge.usize()];
                    edge.left == segment.left()
                        && edge.right == segment.right()
                        && edge.parent == segment.parent()
                })
                .count();

            if len >= 2 && best.as_ref().map_or(true, |b| len > b.len) {
                best = Some(SharedRun {
                    partner: key.child,
                    start_pos,
                    len,
                });
            }
        }
        best
    }

    /// Collapse a matched run: reuse the partner if it is a synthesized grouping node covering
    /// exactly this run, otherwise synthesize a new internal node, rewrite the partner's run
    /// records onto it and route the partner through it. Returns the segment that replaces the
    /// run in the incoming path, or `None` if no strictly intermediate time exists.
    fn collapse_run(
        &mut self,
        child: Node,
        run: &[PathSegment],
        shared: SharedRun,
    ) -> Option<(PathSegment, usize)> {
        let run_left = run[0].left();
        let run_right = run[run.len() - 1].right();

        if self.synthesized[shared.partner.usize()]
            && shared.start_pos == 0
            && shared.len == self.paths[shared.partner.usize()].len()
            && self.time[shared.partner.usize()] > self.time[child.usize()]
        {
            trace!(
                "reusing synthesized node {} for shared recombination of {}",
                shared.partner,
                child
            );
            return Some((
                PathSegment::new(run_left, run_right, shared.partner),
                shared.len,
            ));
        }

        let children_time = self.time[child.usize()].max(self.time[shared.partner.usize()]);
        let parents_time = run
            .iter()
            .map(|segment| self.time[segment.parent().usize()])
            .fold(f64::INFINITY, f64::min);
        if parents_time <= children_time {
            return None;
        }

        let grouping_node = self.push_node((children_time + parents_time) / 2.0, 0, true);
        debug!(
            "synthesized node {} collapsing {} shared segments of {} and {}",
            grouping_node, shared.len, shared.partner, child
        );

        // the partner's matched records become the grouping node's path
        let run_edges: Vec<EdgeId> = self.paths[shared.partner.usize()]
            [shared.start_pos..shared.start_pos + shared.len]
            .to_vec();
        for &edge in &run_edges {
            self.unindex_edge(edge);
        }
        self.paths[shared.partner.usize()]
            .drain(shared.start_pos..shared.start_pos + shared.len);
        for &edge in &run_edges {
            self.edges[edge.usize()].child = grouping_node;
            self.index_edge(edge);
            self.paths[grouping_node.usize()].push(edge);
        }

        // the partner routes through the grouping node with a single spanning edge
        let spanning = self.push_edge(run_left, run_right, grouping_node, shared.partner);
        self.index_edge(spanning);
        self.paths[shared.partner.usize()].insert(shared.start_pos, spanning);

        Some((
            PathSegment::new(run_left, run_right, grouping_node),
            shared.len,
        ))
    }

    /// Record mutations on `node`. Every site receives its record at the front of its mutation
    /// list; the order of records within this call is preserved.
    pub fn add_mutations(
        &mut self,
        node: Node,
        sites: &[SiteIndex],
        derived_states: &[Allele],
    ) -> Result<()> {
        if node.usize() >= self.num_nodes() {
            return Err(StemmaError::bad_param(format!("unknown node {}", node)));
        }
        if sites.len() != derived_states.len() {
            return Err(StemmaError::bad_param(format!(
                "{} sites but {} derived states",
                sites.len(),
                derived_states.len()
            )));
        }
        for (site, &state) in sites.iter().zip(derived_states) {
            if site.usize() >= self.num_sites() {
                return Err(StemmaError::bad_param(format!("unknown site {}", site)));
            }
            if state != ANCESTRAL_STATE && state != DERIVED_STATE {
                return Err(StemmaError::bad_param(format!(
                    "invalid derived state {} at site {}",
                    state, site
                )));
            }
        }

        // prepending in reverse keeps the call's records in order at the front of each list
        for (site, &derived_state) in sites.iter().zip(derived_states).rev() {
            self.site_mutations[site.usize()].insert(
                0,
                Mutation {
                    node,
                    derived_state,
                },
            );
        }
        self.num_mutations += sites.len();
        Ok(())
    }

    fn push_edge(&mut self, left: SiteIndex, right: SiteIndex, parent: Node, child: Node) -> EdgeId {
        let edge = EdgeId(self.edges.len() as u32);
        self.edges.push(Edge {
            left,
            right,
            parent,
            child,
        });
        edge
    }

    fn left_key(&self, edge: EdgeId) -> LeftIndexKey {
        let record = &self.edges[edge.usize()];
        LeftIndexKey {
            left: record.left,
            parent_time: self.time[record.parent.usize()],
            child: record.child,
            edge,
        }
    }

    fn right_key(&self, edge: EdgeId) -> RightIndexKey {
        let record = &self.edges[edge.usize()];
        RightIndexKey {
            right: record.right,
            parent_time: self.time[record.parent.usize()],
            child: record.child,
            edge,
        }
    }

    fn path_key(&self, edge: EdgeId) -> PathIndexKey {
        let record = &self.edges[edge.usize()];
        PathIndexKey {
            parent: record.parent,
            child: record.child,
            left: record.left,
            edge,
        }
    }

    fn index_edge(&mut self, edge: EdgeId) {
        let left = self.left_index.insert(self.left_key(edge));
        let right = self.right_index.insert(self.right_key(edge));
        let path = self.path_index.insert(self.path_key(edge));
        debug_assert!(left && right && path, "edge {:?} already indexed", edge);
    }

    fn unindex_edge(&mut self, edge: EdgeId) {
        let left = self.left_index.remove(&self.left_key(edge));
        let right = self.right_index.remove(&self.right_key(edge));
        let path = self.path_index.remove(&self.path_key(edge));
        debug_assert!(left && right && path, "edge {:?} was not indexed", edge);
    }

    /// Edges in left-endpoint index order, for matchers sweeping sites left to right.
    pub(crate) fn edges_by_left(&self) -> impl Iterator<Item = &Edge> + '_ {
        self.left_index
            .iter()
            .map(|key| &self.edges[key.edge.usize()])
    }

    /// Edges in right-endpoint index order, for matchers retiring edges at their right ends.
    pub(crate) fn edges_by_right(&self) -> impl Iterator<Item = &Edge> + '_ {
        self.right_index
            .iter()
            .map(|key| &self.edges[key.edge.usize()])
    }

    /// The mutation list of a site, in list order.
    pub(crate) fn mutations_at(&self, site: SiteIndex) -> &[Mutation] {
        &self.site_mutations[site.usize()]
    }

    /// The parent of `node` at `site`, following the node's path, or `None` where the node is a
    /// root of the marginal tree.
    pub(crate) fn parent_at(&self, node: Node, site: SiteIndex) -> Option<Node> {
        let path = &self.paths[node.usize()];
        let after = path.partition_point(|&edge| self.edges[edge.usize()].left <= site);
        if after == 0 {
            return None;
        }
        let record = &self.edges[path[after - 1].usize()];
        (site < record.right).then_some(record.parent)
    }

    /// Export the node table.
    pub fn dump_nodes(&self) -> NodeTable {
        NodeTable {
            flags: self.node_flags.clone(),
            time: self.time.clone(),
        }
    }

    /// Export the edge table in insertion order.
    pub fn dump_edges(&self) -> EdgeTable {
        let mut table = EdgeTable::default();
        for edge in &self.edges {
            table.left.push(edge.left);
            table.right.push(edge.right);
            table.parent.push(edge.parent);
            table.child.push(edge.child);
        }
        table
    }

    /// Export the mutation table, ordered by site and list order within a site. The `parent`
    /// column carries the table index of the preceding mutation at the same site on the nearest
    /// ancestor node.
    pub fn dump_mutations(&self) -> MutationTable {
        let mut table = MutationTable::default();
        for site in 0..self.num_sites() {
            let site = SiteIndex::from_usize(site);
            let mut dumped: HashMap<Node, usize, BuildHasherDefault<XxHash64>> =
                Default::default();
            for mutation in &self.site_mutations[site.usize()] {
                let mut parent = None;
                let mut ancestor = self.parent_at(mutation.node, site);
                while let Some(node) = ancestor {
                    if let Some(&index) = dumped.get(&node) {
                        parent = Some(index);
                        break;
                    }
                    ancestor = self.parent_at(node, site);
                }

                dumped.insert(mutation.node, table.len());
                table.site.push(site);
                table.node.push(mutation.node);
                table.derived_state.push(mutation.derived_state);
                table.parent.push(parent);
            }
        }
        table
    }

    /// Restore a node table dumped from another builder. Only valid on a builder without nodes.
    pub fn restore_nodes(&mut self, table: &NodeTable) -> Result<()> {
        if self.num_nodes() != 0 {
            return Err(StemmaError::bad_param(
                "cannot restore nodes into a non-empty builder",
            ));
        }
        if table.flags.len() != table.time.len() {
            return Err(StemmaError::bad_param(
                "node table columns differ in length",
            ));
        }
        for (&flags, &time) in table.flags.iter().zip(&table.time) {
            self.push_node(time, flags, false);
        }
        Ok(())
    }

    /// Restore an edge table dumped from another builder, rebuilding all three interval
    /// indices and the per-child paths. Only valid on a builder without edges.
    pub fn restore_edges(&mut self, table: &EdgeTable) -> Result<()> {
        if self.num_edges() != 0 {
            return Err(StemmaError::bad_param(
                "cannot restore edges into a builder with edges",
            ));
        }
        if table.right.len() != table.left.len()
            || table.parent.len() != table.left.len()
            || table.child.len() != table.left.len()
        {
            return Err(StemmaError::bad_param(
                "edge table columns differ in length",
            ));
        }

        for index in 0..table.len() {
            let (left, right) = (table.left[index], table.right[index]);
            let (parent, child) = (table.parent[index], table.child[index]);
            if left >= right || right.usize() > self.num_sites() {
                return Err(StemmaError::bad_param(format!(
                    "restored segment [{}, {}) out of range",
                    left, right
                )));
            }
            if parent.usize() >= self.num_nodes() || child.usize() >= self.num_nodes() {
                return Err(StemmaError::bad_param(format!(
                    "restored edge references unknown node {} or {}",
                    parent, child
                )));
            }
            if self.time[parent.usize()] <= self.time[child.usize()] {
                return Err(StemmaError::bad_param(format!(
                    "restored parent {} is not older than child {}",
                    parent, child
                )));
            }
        }

        // overlap between sibling segments only becomes visible once the per-child paths are
        // sorted, so sort them up front; nothing is mutated before all validation passed
        let mut sorted_paths: Vec<Vec<usize>> = vec![Vec::new(); self.num_nodes()];
        for index in 0..table.len() {
            let path = &mut sorted_paths[table.child[index].usize()];
            let position = path.partition_point(|&other| table.left[other] < table.left[index]);
            path.insert(position, index);
        }
        for path in &sorted_paths {
            for pair in path.windows(2) {
                if table.left[pair[1]] < table.right[pair[0]] {
                    return Err(StemmaError::bad_param(format!(
                        "restored segments of child {} overlap at {}",
                        table.child[pair[0]],
                        table.left[pair[1]]
                    )));
                }
            }
        }

        self.edges
            .try_reserve(table.len())
            .map_err(|_| StemmaError::OutOfMemory)?;
        for index in 0..table.len() {
            self.push_edge(
                table.left[index],
                table.right[index],
                table.parent[index],
                table.child[index],
            );
        }
        for (child, path) in sorted_paths.into_iter().enumerate() {
            self.paths[child] = path.into_iter().map(|index| EdgeId(index as u32)).collect();
        }
        for index in 0..table.len() {
            self.index_edge(EdgeId(index as u32));
        }
        Ok(())
    }

    /// Restore a mutation table dumped from another builder. Only valid on a builder without
    /// mutations; the `parent` column is recomputed on the next dump.
    pub fn restore_mutations(&mut self, table: &MutationTable) -> Result<()> {
        if self.num_mutations != 0 {
            return Err(StemmaError::bad_param(
                "cannot restore mutations into a builder with mutations",
            ));
        }
        if table.node.len() != table.site.len() || table.derived_state.len() != table.site.len() {
            return Err(StemmaError::bad_param(
                "mutation table columns differ in length",
            ));
        }
        for (site, node) in table.site.iter().zip(&table.node) {
            if site.usize() >= self.num_sites() || node.usize() >= self.num_nodes() {
                return Err(StemmaError::bad_param(format!(
                    "restored mutation references unknown site {} or node {}",
                    site, node
                )));
            }
        }

        // append in dump order so a later dump reproduces the table verbatim
        for index in 0..table.len() {
            self.site_mutations[table.site[index].usize()].push(Mutation {
                node: table.node[index],
                derived_state: table.derived_state[index],
            });
        }
        self.num_mutations = table.len();
        Ok(())
    }

    /// Dump the builder state for diagnostics.
    pub fn print_state(&self, out: &mut dyn Write) -> io::Result<()> {
        writeln!(
            out,
            "tree sequence builder: {} sites, {} nodes, {} edges, {} mutations, flags {:#x}",
            self.num_sites(),
            self.num_nodes(),
            self.num_edges(),
            self.num_mutations,
            self.flags
        )?;
        for (node, (&time, &flags)) in self.time.iter().zip(&self.node_flags).enumerate() {
            writeln!(
                out,
                "node {}\ttime {}\tflags {:#x}\t{} path segments",
                node,
                time,
                flags,
                self.paths[node].len()
            )?;
        }
        for (index, edge) in self.edges.iter().enumerate() {
            writeln!(
                out,
                "edge {}\t[{}, {})\tparent {}\tchild {}",
                index, edge.left, edge.right, edge.parent, edge.child
            )?;
        }
        for (site, mutations) in self.site_mutations.iter().enumerate() {
            for mutation in mutations {
                writeln!(
                    out,
                    "mutation at {}\tnode {}\tstate {}",
                    site, mutation.node, mutation.derived_state
                )?;
            }
        }
        Ok(())
    }
}

fn check_flags(flags: u32) -> Result<()> {
    if flags & !KNOWN_BUILDER_FLAGS != 0 {
        return Err(StemmaError::UnknownFlag { flags });
    }
    Ok(())
}
