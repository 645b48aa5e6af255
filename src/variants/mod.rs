use std::fmt::{Display, Formatter};
use std::ops::{Add, Sub};

use crate::error::{Result, StemmaError};

/// State of a single allele call. The encoding is shared by every engine:
/// 0 is the ancestral state, 1 the derived state, and [`UNKNOWN_STATE`] marks
/// sites outside an inferred haplotype's span.
pub type Allele = i8;

/// The ancestral (reference) state of a site.
pub const ANCESTRAL_STATE: Allele = 0;

/// The derived (mutated) state of a site.
pub const DERIVED_STATE: Allele = 1;

/// Sentinel for sites where no state is known.
pub const UNKNOWN_STATE: Allele = -1;

/// A position in a DNA sequence. This newtype ensures that sequence positions and site indices
/// (indices into the variant site vector) aren't mixed up.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize,
)]
pub struct SequencePosition(u32);

impl SequencePosition {
    /// Create a new sequence position from a usize.
    pub fn from_usize(position: usize) -> Self {
        Self(position as u32)
    }

    #[inline]
    pub fn from_vec(positions: Vec<usize>) -> Vec<Self> {
        positions.into_iter().map(Self::from_usize).collect()
    }

    /// Get the underlying value of the sequence position.
    pub fn unwrap(&self) -> u32 {
        self.0
    }
}

impl Display for SequencePosition {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An index into the genome's variant site vector. The new-type guarantees that site indices
/// aren't mixed up with [`SequencePosition`]s.
#[derive(
    Copy, Clone, Debug, Ord, PartialOrd, Eq, PartialEq, Hash, serde::Serialize, serde::Deserialize,
)]
pub struct SiteIndex(pub(crate) u32);

impl SiteIndex {
    /// Create a new site index from a raw index.
    pub fn from_usize(index: usize) -> Self {
        Self(index as u32)
    }

    /// Get the underlying value of the site index.
    pub fn unwrap(&self) -> u32 {
        self.0
    }

    /// Get the underlying value as a usize for array addressing.
    pub(crate) fn usize(&self) -> usize {
        self.0 as usize
    }
}

impl Display for SiteIndex {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Display::fmt(&self.0, f)
    }
}

impl Add<u32> for SiteIndex {
    type Output = SiteIndex;

    fn add(self, rhs: u32) -> Self::Output {
        SiteIndex(self.0 + rhs)
    }
}

impl Sub<u32> for SiteIndex {
    type Output = SiteIndex;

    fn sub(self, rhs: u32) -> Self::Output {
        SiteIndex(self.0 - rhs)
    }
}

/// A row-major `samples x sites` matrix of allele calls. This is the raw input surface of the
/// crate: the [`AncestorBuilder`] consumes it column by column, and its rows double as the
/// sample haplotypes that are matched against the finished ancestral tree sequence.
///
/// [`AncestorBuilder`]: crate::ancestors::AncestorBuilder
#[derive(Clone, Debug)]
pub struct GenotypeMatrix {
    data: Vec<Allele>,
    num_samples: usize,
    num_sites: usize,
}

impl GenotypeMatrix {
    /// Create a matrix from row-major data. The data length must be `num_samples * num_sites`.
    pub fn new(data: Vec<Allele>, num_samples: usize, num_sites: usize) -> Result<Self> {
        if data.len() != num_samples * num_sites {
            return Err(StemmaError::bad_param(format!(
                "genotype matrix has {} entries, expected {} samples x {} sites",
                data.len(),
                num_samples,
                num_sites
            )));
        }
        Ok(Self {
            data,
            num_samples,
            num_sites,
        })
    }

    /// Number of samples (rows).
    pub fn num_samples(&self) -> usize {
        self.num_samples
    }

    /// Number of variant sites (columns).
    pub fn num_sites(&self) -> usize {
        self.num_sites
    }

    /// The allele of `sample` at `site`.
    pub fn get(&self, sample: usize, site: SiteIndex) -> Allele {
        self.data[sample * self.num_sites + site.usize()]
    }

    /// Copy out the genotype column of a single site, one entry per sample.
    pub fn site_column(&self, site: SiteIndex) -> Vec<Allele> {
        (0..self.num_samples)
            .map(|sample| self.get(sample, site))
            .collect()
    }

    /// Copy out the haplotype row of a single sample, one entry per site.
    pub fn sample_row(&self, sample: usize) -> Vec<Allele> {
        self.data[sample * self.num_sites..(sample + 1) * self.num_sites].to_vec()
    }

    /// The number of samples carrying the derived state at `site`.
    pub fn site_frequency(&self, site: SiteIndex) -> usize {
        (0..self.num_samples)
            .filter(|&sample| self.get(sample, site) == DERIVED_STATE)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_matrix_addressing() {
        let matrix = GenotypeMatrix::new(vec![0, 1, 0, 1, 1, 0], 2, 3).unwrap();

        assert_eq!(matrix.site_column(SiteIndex::from_usize(0)), vec![0, 1]);
        assert_eq!(matrix.site_column(SiteIndex::from_usize(1)), vec![1, 1]);
        assert_eq!(matrix.sample_row(1), vec![1, 1, 0]);
        assert_eq!(matrix.site_frequency(SiteIndex::from_usize(1)), 2);
    }

    #[test]
    fn test_matrix_shape_mismatch() {
        assert!(GenotypeMatrix::new(vec![0, 1, 0], 2, 2).is_err());
    }
}
