#![allow(dead_code)]

use stemma::ancestors::AncestorBuilder;
use stemma::ts::{AncestorMatcher, Node, PathMatch, TreeSequenceBuilder};
use stemma::variants::{Allele, GenotypeMatrix, SequencePosition, SiteIndex};

/// The outcome of running the full inference driver over a sample panel.
pub struct Inference {
    pub ts: TreeSequenceBuilder,
    /// One entry per sample row: the node it became and the path match that produced it.
    pub samples: Vec<(Node, PathMatch)>,
}

/// A minimal inference driver: generate ancestors, thread them into the tree sequence oldest
/// epoch first, then match every sample row against the finished ancestral tree sequence.
///
/// Ancestors of equal age are matched against the builder state of the previous epoch and
/// inserted together afterwards, so they never copy from one another.
pub fn infer(matrix: &GenotypeMatrix, rho: f64, mu: f64, flags: u32) -> Inference {
    let builder = AncestorBuilder::from_genotypes(matrix).unwrap();
    let ancestors = builder.generate_ancestors().unwrap();

    let num_sites = matrix.num_sites();
    let mut ts = TreeSequenceBuilder::new(
        SequencePosition::from_vec((1..=num_sites).collect()),
        vec![rho; num_sites],
        flags,
    )
    .unwrap();

    // the oldest ancestor is the all-ancestral root; it becomes node 0 and needs no path
    ts.add_node(ancestors[0].relative_age(), false);

    let mut epoch_start = 1;
    while epoch_start < ancestors.len() {
        let epoch_age = ancestors[epoch_start].relative_age();
        let epoch_end = epoch_start
            + ancestors[epoch_start..]
                .iter()
                .take_while(|a| a.relative_age() == epoch_age)
                .count();

        let results: Vec<PathMatch> = {
            let mut matcher = AncestorMatcher::new(&ts, mu).unwrap();
            ancestors[epoch_start..epoch_end]
                .iter()
                .map(|ancestor| {
                    matcher
                        .find_path(ancestor.start(), ancestor.end(), ancestor.haplotype())
                        .unwrap()
                })
                .collect()
        };

        for (ancestor, result) in ancestors[epoch_start..epoch_end].iter().zip(results) {
            let node = ts.add_node(ancestor.relative_age(), false);
            ts.add_path(node, &result.path, 0).unwrap();
            let states: Vec<Allele> = result.mismatches.iter().map(|&s| ancestor[s]).collect();
            ts.add_mutations(node, &result.mismatches, &states).unwrap();
        }
        epoch_start = epoch_end;
    }

    // samples are matched against the ancestral tree sequence only, never against each other
    let sample_results: Vec<(Vec<Allele>, PathMatch)> = {
        let mut matcher = AncestorMatcher::new(&ts, mu).unwrap();
        (0..matrix.num_samples())
            .map(|sample| {
                let haplotype = matrix.sample_row(sample);
                let result = matcher
                    .find_path(
                        SiteIndex::from_usize(0),
                        SiteIndex::from_usize(num_sites),
                        &haplotype,
                    )
                    .unwrap();
                (haplotype, result)
            })
            .collect()
    };

    let mut samples = Vec::new();
    for (haplotype, result) in sample_results {
        let node = ts.add_node(0.0, true);
        ts.add_path(node, &result.path, 0).unwrap();
        let states: Vec<Allele> = result
            .mismatches
            .iter()
            .map(|&s| haplotype[s.unwrap() as usize])
            .collect();
        ts.add_mutations(node, &result.mismatches, &states).unwrap();
        samples.push((node, result));
    }

    Inference { ts, samples }
}

/// Assert the structural edge invariants of a builder: parents strictly older than children,
/// and every child's segments sorted, non-overlapping and contiguous.
pub fn assert_edge_invariants(ts: &TreeSequenceBuilder) {
    let nodes = ts.dump_nodes();
    let edges = ts.dump_edges();

    for index in 0..edges.len() {
        assert!(
            nodes.time[edges.parent[index].0 as usize] > nodes.time[edges.child[index].0 as usize],
            "edge {} violates the time ordering",
            index
        );
    }

    let mut by_child: Vec<Vec<usize>> = vec![Vec::new(); nodes.time.len()];
    for index in 0..edges.len() {
        by_child[edges.child[index].0 as usize].push(index);
    }
    for path in &mut by_child {
        path.sort_by_key(|&index| edges.left[index]);
        for pair in path.windows(2) {
            assert_eq!(
                edges.right[pair[0]],
                edges.left[pair[1]],
                "path segments are not contiguous"
            );
        }
    }
}
