use std::fmt::{Debug, Formatter};
use std::ops::Index;

use crate::variants::{Allele, SiteIndex};

mod builder;

pub use builder::AncestorBuilder;

/// An inferred ancestral haplotype. The sequence only carries states for the sites inside its
/// span `[start, end)`; everything outside the span is unknown by construction and callers are
/// expected to encode it with [`UNKNOWN_STATE`] where a dense genome-length vector is needed.
///
/// [`UNKNOWN_STATE`]: crate::variants::UNKNOWN_STATE
#[derive(Clone, PartialEq)]
pub struct AncestralSequence {
    state: Vec<Allele>,
    focal_sites: Vec<SiteIndex>,
    /// first site with a known state, inclusive
    start: SiteIndex,
    /// last site with a known state, exclusive
    end: SiteIndex,
    age: f64,
}

impl AncestralSequence {
    pub(crate) fn new(
        state: Vec<Allele>,
        focal_sites: Vec<SiteIndex>,
        start: SiteIndex,
        end: SiteIndex,
        age: f64,
    ) -> Self {
        debug_assert!(state.len() == end.usize() - start.usize());
        Self {
            state,
            focal_sites,
            start,
            end,
            age,
        }
    }

    /// Get the haplotype states of this ancestor. The first element corresponds to the site
    /// [`start`], the last to the site before [`end`], so indices into this slice do not
    /// correspond to genome site indices unless the ancestor spans the whole genome.
    ///
    /// [`start`]: Self::start
    /// [`end`]: Self::end
    pub fn haplotype(&self) -> &[Allele] {
        &self.state
    }

    /// Get an enumerated iterator over the haplotype states, yielding the genome [`SiteIndex`]
    /// of each state alongside it.
    pub fn site_iter(&self) -> impl DoubleEndedIterator<Item = (SiteIndex, &'_ Allele)> + '_ {
        self.state
            .iter()
            .enumerate()
            .map(|(offset, state)| (SiteIndex(self.start.0 + offset as u32), state))
    }

    /// The focal sites this ancestor was generated from. Empty for the root ancestor.
    pub fn focal_sites(&self) -> &[SiteIndex] {
        &self.focal_sites
    }

    /// First site with a known state (inclusive).
    pub fn start(&self) -> SiteIndex {
        self.start
    }

    /// Last site with a known state (exclusive).
    pub fn end(&self) -> SiteIndex {
        self.end
    }

    /// The inferred relative age of the ancestor, derived from the derived-allele frequency of
    /// its focal sites. Only meaningful as an ordering between ancestors of the same panel.
    pub fn relative_age(&self) -> f64 {
        self.age
    }

    /// Number of sites with a known state.
    pub fn len(&self) -> usize {
        self.state.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.is_empty()
    }
}

impl Debug for AncestralSequence {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str("AncestralSequence { ")?;
        write!(f, "age={},\t", self.age)?;
        write!(
            f,
            "focal_sites={:?},\t",
            self.focal_sites.iter().map(|s| s.0).collect::<Vec<_>>()
        )?;

        f.write_str("state=[ ")?;
        for site in 0..self.start.usize() {
            f.write_str("-")?;
            if site + 1 < self.end.usize() {
                f.write_str(", ")?;
            }
        }
        for (offset, state) in self.state.iter().enumerate() {
            write!(f, "{}", state)?;
            if self.start.usize() + offset + 1 < self.end.usize() {
                f.write_str(", ")?;
            }
        }
        f.write_str(" ] }")?;
        Ok(())
    }
}

/// Index an ancestral sequence by the absolute genome [`SiteIndex`]. Panics if the site lies
/// outside the span of the ancestor.
impl Index<SiteIndex> for AncestralSequence {
    type Output = Allele;

    fn index(&self, index: SiteIndex) -> &Self::Output {
        &self.state[index.usize() - self.start.usize()]
    }
}
