//! End-to-end inference runs over small sample panels, driving all three engines the way an
//! outer driver would: ancestor generation, epoch-wise ancestor matching, sample matching.

mod common;

use stemma::ts::{Node, PathSegment};
use stemma::variants::{GenotypeMatrix, SiteIndex};

fn site(index: usize) -> SiteIndex {
    SiteIndex::from_usize(index)
}

#[test]
fn test_two_samples_two_singleton_sites() {
    // two singleton sites seed no ancestors, so both samples thread through the lone root
    // with one mismatch each
    let matrix = GenotypeMatrix::new(vec![0, 1, 1, 0], 2, 2).unwrap();
    let inference = common::infer(&matrix, 1e-2, 1e-2, 0);

    assert_eq!(inference.ts.num_nodes(), 3);
    assert_eq!(inference.ts.num_edges(), 2);
    assert_eq!(inference.ts.num_mutations(), 2);

    let (_, result) = &inference.samples[0];
    assert_eq!(result.path, vec![PathSegment::new(site(0), site(2), Node(0))]);
    assert_eq!(result.mismatches, vec![site(1)]);

    let (_, result) = &inference.samples[1];
    assert_eq!(result.path, vec![PathSegment::new(site(0), site(2), Node(0))]);
    assert_eq!(result.mismatches, vec![site(0)]);
}

#[test]
fn test_sample_matching_its_ancestor_exactly() {
    // the first two samples carry exactly the haplotype of the single inferred ancestor and
    // must copy it over one edge without mismatches
    let matrix = GenotypeMatrix::new(vec![1, 1, 0, 1, 1, 0, 0, 0, 0], 3, 3).unwrap();
    let inference = common::infer(&matrix, 1e-2, 1e-2, 0);

    // root plus one frequency-2 ancestor plus three samples
    assert_eq!(inference.ts.num_nodes(), 5);

    let ancestor = Node(1);
    for sample in 0..2 {
        let (_, result) = &inference.samples[sample];
        assert_eq!(result.path, vec![PathSegment::new(site(0), site(3), ancestor)]);
        assert!(result.mismatches.is_empty());
    }

    // the all-ancestral sample copies the root instead
    let (_, result) = &inference.samples[2];
    assert_eq!(result.path, vec![PathSegment::new(site(0), site(3), Node(0))]);
    assert!(result.mismatches.is_empty());
}

#[test]
fn test_small_panel_structure() {
    let matrix = GenotypeMatrix::new(
        vec![
            0, 0, 0, 0, 0, 0, //
            1, 0, 0, 0, 1, 0, //
            1, 0, 0, 0, 1, 0, //
            1, 1, 0, 0, 0, 0, //
            1, 1, 0, 0, 0, 0, //
            0, 0, 1, 1, 0, 0, //
            0, 0, 1, 1, 0, 1, //
            0, 0, 1, 0, 0, 1, //
        ],
        8,
        6,
    )
    .unwrap();
    let inference = common::infer(&matrix, 1e-2, 1e-2, 0);

    common::assert_edge_invariants(&inference.ts);
    assert_eq!(inference.samples.len(), 8);

    // every sample is attached over its full span, and the matched haplotype agrees with the
    // input everywhere outside the reported mismatches
    for sample in 0..8 {
        let (_, result) = &inference.samples[sample];
        assert_eq!(result.path.first().unwrap().left(), site(0));
        assert_eq!(result.path.last().unwrap().right(), site(6));
        let row = matrix.sample_row(sample);
        for index in 0..6 {
            if !result.mismatches.contains(&site(index)) {
                assert_eq!(result.matched[index], row[index]);
            }
        }
    }

    // the inferred tables survive a dump/restore round trip unchanged
    let (nodes, edges, mutations) = (
        inference.ts.dump_nodes(),
        inference.ts.dump_edges(),
        inference.ts.dump_mutations(),
    );
    let mut restored = stemma::ts::TreeSequenceBuilder::new(
        stemma::variants::SequencePosition::from_vec((1..=6).collect()),
        vec![1e-2; 6],
        0,
    )
    .unwrap();
    restored.restore_nodes(&nodes).unwrap();
    restored.restore_edges(&edges).unwrap();
    restored.restore_mutations(&mutations).unwrap();
    assert_eq!(restored.dump_nodes(), nodes);
    assert_eq!(restored.dump_edges(), edges);
    assert_eq!(restored.dump_mutations(), mutations);
}
