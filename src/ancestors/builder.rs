use std::collections::HashMap;
use std::hash::BuildHasherDefault;
use std::io::{self, Write};
use std::sync::Arc;

use log::debug;
use rayon::iter::{IntoParallelRefIterator, ParallelIterator};
use twox_hash::XxHash64;

use crate::ancestors::AncestralSequence;
use crate::error::{Result, StemmaError};
use crate::variants::{
    Allele, GenotypeMatrix, SiteIndex, ANCESTRAL_STATE, DERIVED_STATE, UNKNOWN_STATE,
};

/// Sites of one derived-allele frequency, grouped by their genotype pattern. The site lists grow
/// by prepend, so they hold descending site ids until they are emitted as focal groups.
type PatternMap = HashMap<Arc<[Allele]>, Vec<SiteIndex>, BuildHasherDefault<XxHash64>>;

/// A single recorded variant site. The genotype pattern is shared with the key of the
/// frequency map it is filed under.
struct BuilderSite {
    frequency: usize,
    genotypes: Arc<[Allele]>,
}

/// Collects variant sites one at a time, groups them by derived-allele frequency and genotype
/// pattern, and synthesizes one putative ancestral haplotype per focal-site group by
/// majority-vote consensus across the samples carrying the derived allele.
///
/// Sites must be added in ascending site-id order. Sites with a frequency below 2 are recorded
/// (they still carry mutations in the final tree sequence) but never seed ancestors.
pub struct AncestorBuilder {
    num_samples: usize,
    sites: Vec<BuilderSite>,
    /// frequency_map[f] maps unique genotype patterns to the sites they occur at.
    /// Each of these sites has derived-allele frequency f.
    frequency_map: Vec<PatternMap>,
}

impl AncestorBuilder {
    /// Create a new builder for a panel of `num_samples` aligned samples.
    pub fn new(num_samples: usize) -> Self {
        Self {
            num_samples,
            sites: Vec::new(),
            frequency_map: (0..=num_samples).map(|_| PatternMap::default()).collect(),
        }
    }

    /// Create a builder and feed it every column of a genotype matrix, computing the
    /// derived-allele frequencies on the fly.
    pub fn from_genotypes(matrix: &GenotypeMatrix) -> Result<Self> {
        let mut builder = Self::new(matrix.num_samples());
        for site in 0..matrix.num_sites() {
            let site = SiteIndex::from_usize(site);
            let genotypes = matrix.site_column(site);
            builder.add_site(site, matrix.site_frequency(site), &genotypes)?;
        }
        Ok(builder)
    }

    /// Record one variant site. The genotype vector is copied into shared storage keyed by its
    /// byte value inside the frequency map; identical patterns at the same frequency coalesce
    /// into one group.
    ///
    /// # Parameters
    /// - `site`: the site id, which must be exactly the next unrecorded id
    /// - `frequency`: the number of samples carrying the derived allele at this site
    /// - `genotypes`: one allele call per sample
    pub fn add_site(
        &mut self,
        site: SiteIndex,
        frequency: usize,
        genotypes: &[Allele],
    ) -> Result<()> {
        if site.usize() != self.sites.len() {
            return Err(StemmaError::bad_param(format!(
                "site {} added out of order, expected {}",
                site,
                self.sites.len()
            )));
        }
        if genotypes.len() != self.num_samples {
            return Err(StemmaError::bad_param(format!(
                "site {} has {} genotypes, expected {}",
                site,
                genotypes.len(),
                self.num_samples
            )));
        }
        if frequency > self.num_samples {
            return Err(StemmaError::bad_param(format!(
                "site {} has frequency {} > {} samples",
                site, frequency, self.num_samples
            )));
        }

        let map = &mut self.frequency_map[frequency];
        let pattern: Arc<[Allele]> = match map.get_key_value(genotypes) {
            Some((pattern, _)) => Arc::clone(pattern),
            None => Arc::from(genotypes),
        };
        map.entry(Arc::clone(&pattern)).or_default().insert(0, site);
        self.sites.push(BuilderSite {
            frequency,
            genotypes: pattern,
        });
        Ok(())
    }

    /// Number of sites recorded so far.
    pub fn num_sites(&self) -> usize {
        self.sites.len()
    }

    /// Number of samples in the panel.
    pub fn num_samples(&self) -> usize {
        self.num_samples
    }

    /// Emit the focal-site groups that seed ancestors, ordered oldest first (descending
    /// frequency, ascending first focal site within a frequency). A pattern group is split
    /// between two of its focal sites when an older site in between only partially agrees with
    /// the carrier set, since the focal sites then belong to different subtrees of the ancestry.
    pub fn focal_groups(&self) -> Vec<Vec<SiteIndex>> {
        let mut groups = Vec::new();
        for frequency in (2..self.frequency_map.len()).rev() {
            let mut bucket: Vec<(Vec<SiteIndex>, &Arc<[Allele]>)> = self.frequency_map[frequency]
                .iter()
                .map(|(pattern, sites)| {
                    // site lists grow by prepend, restore ascending order
                    let mut sites = sites.clone();
                    sites.reverse();
                    (sites, pattern)
                })
                .collect();
            bucket.sort_unstable_by_key(|(sites, _)| sites[0]);

            for (sites, pattern) in bucket {
                self.split_group(sites, pattern, frequency, &mut groups);
            }
        }
        groups
    }

    /// Break a pattern group apart wherever an intermediate older site disagrees with part of
    /// the carrier set, and push the resulting focal groups.
    fn split_group(
        &self,
        sites: Vec<SiteIndex>,
        pattern: &[Allele],
        frequency: usize,
        groups: &mut Vec<Vec<SiteIndex>>,
    ) {
        if sites.len() == 1 {
            groups.push(sites);
            return;
        }

        let carriers: Vec<usize> = pattern
            .iter()
            .enumerate()
            .filter(|&(_, &state)| state == DERIVED_STATE)
            .map(|(sample, _)| sample)
            .collect();

        let mut part = Vec::new();
        for focal_pair in 0..sites.len() - 1 {
            part.push(sites[focal_pair]);

            let must_split = (sites[focal_pair].usize() + 1..sites[focal_pair + 1].usize())
                .filter(|&between| self.sites[between].frequency > frequency)
                .any(|between| {
                    let consensus = carriers
                        .iter()
                        .filter(|&&sample| {
                            self.sites[between].genotypes[sample] == DERIVED_STATE
                        })
                        .count();
                    consensus != carriers.len() && consensus != 0
                });

            if must_split {
                groups.push(std::mem::take(&mut part));
            }
        }
        part.push(*sites.last().unwrap());
        groups.push(part);
    }

    /// For a given focal-site group, synthesize the ancestral haplotype that uses those sites.
    /// All focal sites must share one genotype pattern with frequency >= 2 and be given in
    /// ascending order.
    ///
    /// The haplotype carries the derived state at every focal site. Sites between focal sites
    /// and in the flanks are set to the majority state among the samples carrying the derived
    /// allele, where only sites older than the focal frequency are voted on. Extension into the
    /// flanks stops once the set of samples still consistent with the ancestor has shrunk to a
    /// single sample.
    pub fn make_ancestor(&self, focal_sites: &[SiteIndex]) -> Result<AncestralSequence> {
        if focal_sites.is_empty() {
            return Err(StemmaError::bad_param("empty focal site group"));
        }
        if focal_sites.windows(2).any(|pair| pair[0] >= pair[1]) {
            return Err(StemmaError::bad_param("focal sites must be ascending"));
        }
        if focal_sites.last().unwrap().usize() >= self.sites.len() {
            return Err(StemmaError::bad_param(format!(
                "focal site {} out of range ({} sites)",
                focal_sites.last().unwrap(),
                self.sites.len()
            )));
        }

        let frequency = self.sites[focal_sites[0].usize()].frequency;
        if frequency < 2 {
            return Err(StemmaError::bad_param(
                "focal sites with frequency < 2 cannot seed an ancestor",
            ));
        }
        if focal_sites
            .iter()
            .any(|site| self.sites[site.usize()].frequency != frequency)
        {
            return Err(StemmaError::bad_param(
                "focal sites must share one frequency",
            ));
        }

        let pattern = Arc::clone(&self.sites[focal_sites[0].usize()].genotypes);
        let carriers: Vec<usize> = pattern
            .iter()
            .enumerate()
            .filter(|&(_, &state)| state == DERIVED_STATE)
            .map(|(sample, _)| sample)
            .collect();
        debug_assert!(carriers.len() == frequency);

        let mut state = vec![UNKNOWN_STATE; self.sites.len()];
        for site in focal_sites {
            state[site.usize()] = DERIVED_STATE;
        }

        // infer the states between focal sites from the full carrier set
        for pair in focal_sites.windows(2) {
            for between in pair[0].usize() + 1..pair[1].usize() {
                state[between] = if self.sites[between].frequency > frequency {
                    self.consensus_state(between, &carriers, carriers.len())
                } else {
                    ANCESTRAL_STATE
                };
            }
        }

        // extend into the flanks until the carrier set collapses
        let leftmost = self.extend_ancestor(
            (0..focal_sites[0].usize()).rev(),
            &carriers,
            frequency,
            &mut state,
        );
        let last_focal = focal_sites.last().unwrap().usize();
        let rightmost =
            self.extend_ancestor(last_focal + 1..self.sites.len(), &carriers, frequency, &mut state);

        let start = leftmost.unwrap_or(focal_sites[0].usize());
        let end = rightmost.unwrap_or(last_focal) + 1;

        debug!(
            "generated ancestor over [{}, {}) from {} focal sites at frequency {}",
            start,
            end,
            focal_sites.len(),
            frequency
        );

        Ok(AncestralSequence::new(
            state[start..end].to_vec(),
            focal_sites.to_vec(),
            SiteIndex::from_usize(start),
            SiteIndex::from_usize(end),
            frequency as f64 / self.num_samples as f64,
        ))
    }

    /// Majority state at `site` among the given carriers, counting `remaining` voters.
    /// A tie reads ancestral.
    fn consensus_state(&self, site: usize, carriers: &[usize], remaining: usize) -> Allele {
        let ones = carriers
            .iter()
            .filter(|&&sample| self.sites[site].genotypes[sample] == DERIVED_STATE)
            .count();
        if 2 * ones > remaining {
            DERIVED_STATE
        } else {
            ANCESTRAL_STATE
        }
    }

    /// Extend the ancestor over the sites produced by `site_iter` (ordered away from the focal
    /// sites). Only sites older than the focal frequency are voted on; younger sites read
    /// ancestral. A carrier that disagrees with the consensus at two consecutively evaluated
    /// older sites is dropped from the vote, and the extension stops once at most one carrier
    /// remains.
    ///
    /// Returns the site id the extension reached, or `None` if no site was written.
    fn extend_ancestor(
        &self,
        site_iter: impl Iterator<Item = usize>,
        carriers: &[usize],
        focal_frequency: usize,
        state: &mut [Allele],
    ) -> Option<usize> {
        let mut active = vec![true; carriers.len()];
        // disagreement flags of the previously evaluated older site
        let mut marks = vec![false; carriers.len()];
        let mut derived = vec![false; carriers.len()];
        let mut remaining = carriers.len();
        let mut furthest = None;

        for site in site_iter {
            furthest = Some(site);

            if self.sites[site].frequency <= focal_frequency {
                state[site] = ANCESTRAL_STATE;
                continue;
            }

            let mut ones = 0;
            for (index, &sample) in carriers.iter().enumerate() {
                derived[index] = self.sites[site].genotypes[sample] == DERIVED_STATE;
                if derived[index] && active[index] {
                    ones += 1;
                }
            }

            let consensus = if 2 * ones > remaining {
                DERIVED_STATE
            } else {
                ANCESTRAL_STATE
            };
            state[site] = consensus;

            for index in 0..carriers.len() {
                let disagrees = derived[index] != (consensus == DERIVED_STATE);
                if marks[index] && disagrees {
                    active[index] = false;
                }
                marks[index] = disagrees;
            }
            remaining = active.iter().filter(|&&a| a).count();

            if remaining <= 1 {
                break;
            }
        }

        furthest
    }

    /// Generate one ancestor per focal group, plus the all-ancestral root sequence spanning the
    /// whole genome, sorted oldest first.
    pub fn generate_ancestors(&self) -> Result<Vec<AncestralSequence>> {
        let groups = self.focal_groups();
        let mut ancestors: Vec<AncestralSequence> = groups
            .par_iter()
            .map(|group| self.make_ancestor(group))
            .collect::<Result<Vec<_>>>()?;

        ancestors.push(AncestralSequence::new(
            vec![ANCESTRAL_STATE; self.sites.len()],
            Vec::new(),
            SiteIndex::from_usize(0),
            SiteIndex::from_usize(self.sites.len()),
            1.0,
        ));

        ancestors.sort_by(|a, b| {
            b.relative_age()
                .total_cmp(&a.relative_age())
                .then(a.start().cmp(&b.start()))
                .then_with(|| a.focal_sites().cmp(b.focal_sites()))
        });

        debug!(
            "generated {} ancestors from {} focal groups over {} sites",
            ancestors.len(),
            groups.len(),
            self.sites.len()
        );
        Ok(ancestors)
    }

    /// Dump the builder state for diagnostics.
    pub fn print_state(&self, out: &mut dyn Write) -> io::Result<()> {
        writeln!(
            out,
            "ancestor builder: {} samples, {} sites",
            self.num_samples,
            self.sites.len()
        )?;
        for (frequency, map) in self.frequency_map.iter().enumerate() {
            if map.is_empty() {
                continue;
            }
            writeln!(
                out,
                "frequency {}: {} patterns, {} sites",
                frequency,
                map.len(),
                map.values().map(Vec::len).sum::<usize>()
            )?;
        }
        for (site, record) in self.sites.iter().enumerate() {
            writeln!(
                out,
                "site {}\tfrequency {}\tgenotypes {:?}",
                site, record.frequency, record.genotypes
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn builder_from_sites(sites: &[Vec<Allele>]) -> AncestorBuilder {
        let mut builder = AncestorBuilder::new(sites[0].len());
        for (index, genotypes) in sites.iter().enumerate() {
            let frequency = genotypes.iter().filter(|&&s| s == DERIVED_STATE).count();
            builder
                .add_site(SiteIndex::from_usize(index), frequency, genotypes)
                .unwrap();
        }
        builder
    }

    #[test]
    fn compute_trivial_ancestors() {
        let builder = builder_from_sites(&[
            vec![0, 0, 1, 0, 1],
            vec![0, 1, 1, 0, 0],
            vec![0, 1, 0, 0, 1],
            vec![0, 0, 0, 1, 1],
        ]);

        let ancestors = builder.generate_ancestors().unwrap();
        assert_eq!(ancestors.len(), 5);

        // root ancestor is oldest
        assert_eq!(ancestors[0].haplotype(), &[0, 0, 0, 0]);
        assert_eq!(ancestors[0].focal_sites(), &[]);

        // all sites share one frequency, so no ancestor votes on any other site
        assert!(ancestors.iter().any(|a| a.haplotype() == [1, 0, 0, 0]));
        assert!(ancestors.iter().any(|a| a.haplotype() == [0, 1, 0, 0]));
        assert!(ancestors.iter().any(|a| a.haplotype() == [0, 0, 1, 0]));
        assert!(ancestors.iter().any(|a| a.haplotype() == [0, 0, 0, 1]));
    }

    #[test]
    fn compute_multi_focal_ancestors() {
        let builder = builder_from_sites(&[
            vec![0, 0, 0, 1, 1],
            vec![0, 1, 1, 0, 0],
            vec![0, 1, 1, 0, 0],
            vec![0, 0, 0, 1, 1],
        ]);

        let groups = builder.focal_groups();
        assert_eq!(groups.len(), 2);
        assert!(groups.contains(&vec![
            SiteIndex::from_usize(0),
            SiteIndex::from_usize(3)
        ]));
        assert!(groups.contains(&vec![
            SiteIndex::from_usize(1),
            SiteIndex::from_usize(2)
        ]));

        let ancestors = builder.generate_ancestors().unwrap();
        assert_eq!(ancestors.len(), 3);
        assert_eq!(ancestors[0].haplotype(), &[0, 0, 0, 0]);
        assert!(ancestors.iter().any(|a| a.haplotype() == [1, 0, 0, 1]));
        assert!(ancestors.iter().any(|a| a.haplotype() == [0, 1, 1, 0]));
    }

    #[test]
    fn older_site_consensus() {
        // both carriers of the focal site carry the older site, so the flank reads derived
        let builder = builder_from_sites(&[vec![1, 1, 1, 0], vec![1, 1, 0, 0]]);

        let ancestor = builder
            .make_ancestor(&[SiteIndex::from_usize(1)])
            .unwrap();
        assert_eq!(ancestor.start(), SiteIndex::from_usize(0));
        assert_eq!(ancestor.end(), SiteIndex::from_usize(2));
        assert_eq!(ancestor.haplotype(), &[1, 1]);
    }

    #[test]
    fn consensus_tie_reads_ancestral() {
        // the two carriers split evenly on the older site
        let builder = builder_from_sites(&[vec![1, 0, 1, 1], vec![1, 1, 0, 0]]);

        let ancestor = builder
            .make_ancestor(&[SiteIndex::from_usize(1)])
            .unwrap();
        assert_eq!(ancestor.haplotype(), &[0, 1]);
    }

    #[test]
    fn carrier_dropout_stops_extension() {
        // carrier 0 disagrees with the consensus at two consecutive older sites and is
        // dropped, leaving a single carrier, which stops the leftward extension
        let builder = builder_from_sites(&[
            vec![1, 0, 1, 1],
            vec![1, 0, 1, 1],
            vec![1, 1, 0, 0],
        ]);

        let ancestor = builder
            .make_ancestor(&[SiteIndex::from_usize(2)])
            .unwrap();
        assert_eq!(ancestor.start(), SiteIndex::from_usize(0));
        assert_eq!(ancestor.haplotype(), &[0, 0, 1]);
    }

    #[test]
    fn monomorphic_and_singleton_sites_seed_no_ancestors() {
        let builder = builder_from_sites(&[
            vec![0, 0, 0, 0],
            vec![0, 1, 0, 0],
            vec![0, 1, 1, 0],
        ]);

        let groups = builder.focal_groups();
        assert_eq!(groups, vec![vec![SiteIndex::from_usize(2)]]);
    }

    #[test]
    fn group_split_on_partial_agreement() {
        // sites 0 and 3 share a pattern, but the older site in between agrees with only one
        // of the two carriers, so the group is split into two ancestors
        let builder = builder_from_sites(&[
            vec![1, 1, 0, 0, 0],
            vec![1, 0, 1, 1, 0],
            vec![0, 0, 0, 0, 0],
            vec![1, 1, 0, 0, 0],
        ]);

        let groups = builder.focal_groups();
        assert!(groups.contains(&vec![SiteIndex::from_usize(0)]));
        assert!(groups.contains(&vec![SiteIndex::from_usize(3)]));
    }

    #[test]
    fn rejects_bad_focal_groups() {
        let builder = builder_from_sites(&[vec![0, 1, 1, 0], vec![0, 1, 0, 0]]);

        assert!(builder.make_ancestor(&[]).is_err());
        assert!(builder
            .make_ancestor(&[SiteIndex::from_usize(5)])
            .is_err());
        // singletons never seed ancestors
        assert!(builder
            .make_ancestor(&[SiteIndex::from_usize(1)])
            .is_err());
        // mixed frequencies
        assert!(builder
            .make_ancestor(&[SiteIndex::from_usize(0), SiteIndex::from_usize(1)])
            .is_err());
    }

    #[test]
    fn rejects_out_of_order_sites() {
        let mut builder = AncestorBuilder::new(2);
        builder
            .add_site(SiteIndex::from_usize(0), 1, &[0, 1])
            .unwrap();
        assert!(builder
            .add_site(SiteIndex::from_usize(2), 1, &[1, 0])
            .is_err());
        assert!(builder
            .add_site(SiteIndex::from_usize(1), 1, &[1, 0, 0])
            .is_err());
    }

    #[test]
    fn patterns_coalesce_per_frequency() {
        let builder = builder_from_sites(&[
            vec![0, 1, 1, 0],
            vec![0, 1, 1, 0],
            vec![0, 1, 1, 0],
        ]);

        let groups = builder.focal_groups();
        assert_eq!(
            groups,
            vec![vec![
                SiteIndex::from_usize(0),
                SiteIndex::from_usize(1),
                SiteIndex::from_usize(2)
            ]]
        );
    }
}
