//! Inference of ancestral haplotypes and succinct tree sequences from a panel of aligned
//! genetic samples.
//!
//! The crate consists of three engines that an outer driver sequences across ancestor epochs:
//!
//! - [`ancestors::AncestorBuilder`] groups variant sites by derived-allele frequency and
//!   genotype pattern and synthesizes one putative ancestral haplotype per focal-site group.
//! - [`ts::TreeSequenceBuilder`] is the incremental edge database: nodes, copying paths kept
//!   in three sorted interval indices, mutations, shared-recombination resolution, and bulk
//!   dump/restore of its tables.
//! - [`ts::AncestorMatcher`] threads a haplotype through the accumulated tree sequence with a
//!   Li-Stephens hidden Markov model and returns the maximum-likelihood copying path.
//!
//! Every engine is single-threaded per instance; callers parallelize at haplotype granularity
//! by sharding across matchers that share one immutably borrowed builder.

pub mod ancestors;
mod error;
pub mod ts;
pub mod variants;

pub use error::{Result, StemmaError};
