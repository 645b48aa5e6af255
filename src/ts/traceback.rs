use crate::ts::Node;

/// One recorded likelihood decision: whether `node` required a recombination to achieve its
/// likelihood at the site the entry was recorded for.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) struct TracebackState {
    pub(crate) node: Node,
    pub(crate) recombination_required: bool,
}

/// Per-site traceback storage of the Li-Stephens forward pass.
///
/// All entries live in one flat arena with a per-site offset vector on top; the whole structure
/// is reset wholesale at the start of every match. Entries are never recycled while a match is
/// running, so the backward pass observes the forward pass's records unchanged.
#[derive(Clone, Debug, Default)]
pub(crate) struct Traceback {
    states: Vec<TracebackState>,
    /// offsets[i] is the arena offset of the first entry of relative site i
    offsets: Vec<usize>,
}

impl Traceback {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Drop all recorded sites, retaining the arena capacity.
    pub(crate) fn reset(&mut self) {
        self.states.clear();
        self.offsets.clear();
    }

    /// Open the record of the next site. All subsequent pushes belong to this site.
    pub(crate) fn begin_site(&mut self) {
        self.offsets.push(self.states.len());
    }

    pub(crate) fn push(&mut self, node: Node, recombination_required: bool) {
        debug_assert!(!self.offsets.is_empty(), "no site opened");
        self.states.push(TracebackState {
            node,
            recombination_required,
        });
    }

    /// The recorded states of the site at the given offset relative to the match start.
    pub(crate) fn site_states(&self, relative_site: usize) -> &[TracebackState] {
        let start = self.offsets[relative_site];
        let end = self
            .offsets
            .get(relative_site + 1)
            .copied()
            .unwrap_or(self.states.len());
        &self.states[start..end]
    }

    /// Number of sites recorded.
    pub(crate) fn num_sites(&self) -> usize {
        self.offsets.len()
    }

    /// Total number of entries across all sites.
    pub(crate) fn total_size(&self) -> usize {
        self.states.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_site_partitioning() {
        let mut traceback = Traceback::new();

        traceback.begin_site();
        traceback.push(Node(0), false);
        traceback.push(Node(1), true);
        traceback.begin_site();
        traceback.push(Node(0), false);
        traceback.begin_site();

        assert_eq!(traceback.num_sites(), 3);
        assert_eq!(traceback.site_states(0).len(), 2);
        assert!(traceback.site_states(0)[1].recombination_required);
        assert_eq!(traceback.site_states(1).len(), 1);
        assert!(traceback.site_states(2).is_empty());
        assert_eq!(traceback.total_size(), 3);

        traceback.reset();
        assert_eq!(traceback.num_sites(), 0);
        assert_eq!(traceback.total_size(), 0);
    }
}
