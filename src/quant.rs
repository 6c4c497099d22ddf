use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use log::{debug, info};
use rayon::prelude::*;
use thiserror::Error;

pub mod coverage;
pub mod equivalence_class;
pub mod readers;
pub mod set_cover;
pub mod stats;
pub mod taxonomy;

use coverage::CoverageTracker;
use equivalence_class::EquivalenceClassBuilder;
use readers::{MappingSource, Reference};
use set_cover::greedy_set_cover;
use stats::ReadStats;
use taxonomy::{read_name2taxid, Rank, Taxonomy};

#[derive(Debug, Error)]
pub enum QuantError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid mapping stream header, expected '# LT:S' or '# LT:P'")]
    InvalidHeader,
    #[error("malformed mapping record near read '{0}'")]
    MalformedRecord(String),
    #[error("alignment file error: {0}")]
    Sam(#[from] rust_htslib::errors::Error),
    #[error("ranked abundance output requires taxonomy and name-to-taxid files")]
    MissingTaxonomy,
}

pub type Result<T> = std::result::Result<T, QuantError>;

#[derive(Debug, Clone)]
pub struct QuantOpts {
    /*
    level: taxonomic rank the final abundances are rolled up to
    max_iter: EM iteration cap
    eps: per-target convergence threshold on the count delta
    min_cnt: abundance floor below which a strain becomes a pruning candidate
    segment_size: coverage bin width in bases
    range_factorization: bucket parameter for class keys, 0 disables
    flat_abundance: report per reference instead of per taxon
    require_concordance: drop discordant hits (paired-end input only)
    only_unique: accept reads with a single resolved target
    only_perfect: accept hits whose score covers the whole read
    */
    pub level: Rank,
    pub max_iter: usize,
    pub eps: f64,
    pub min_cnt: f64,
    pub segment_size: usize,
    pub range_factorization: u32,
    pub flat_abundance: bool,
    pub require_concordance: bool,
    pub only_unique: bool,
    pub only_perfect: bool,
}

impl Default for QuantOpts {
    fn default() -> QuantOpts {
        QuantOpts {
            level: Rank::Species,
            max_iter: 1000,
            eps: 0.001,
            min_cnt: 0.0,
            segment_size: 200,
            range_factorization: 4,
            flat_abundance: false,
            require_concordance: false,
            only_unique: false,
            only_perfect: false,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EmSummary {
    pub iterations: usize,
    pub converged: bool,
}

/// How often the EM loop re-runs the pruning heuristic.
const THRESHOLDING_ITER_STEP: usize = 10;

/// The engine state handed from phase to phase: the load phase fills the
/// class table, coverage bins, and initial counts; the EM phase owns the
/// count and validity arrays; serialization reads the frozen result.
pub struct Quantifier {
    opts: QuantOpts,
    taxonomy: Option<Taxonomy>,
    ref_name_2_tax_id: HashMap<String, u32>,
    eqb: EquivalenceClassBuilder,
    coverage: CoverageTracker,
    references: Vec<Reference>,
    strain_cnt: Vec<f64>,
    strain_valid: Vec<bool>,
    score_acc: Vec<f64>,
    read_cnt: usize,
    stats: ReadStats,
}

impl Quantifier {
    /// Flat-abundance estimator, no taxonomy involved.
    pub fn new(opts: QuantOpts) -> Quantifier {
        let eqb = EquivalenceClassBuilder::new(opts.range_factorization);
        let coverage = CoverageTracker::new(opts.segment_size);
        Quantifier {
            opts,
            taxonomy: None,
            ref_name_2_tax_id: HashMap::new(),
            eqb,
            coverage,
            references: Vec::new(),
            strain_cnt: Vec::new(),
            strain_valid: Vec::new(),
            score_acc: Vec::new(),
            read_cnt: 0,
            stats: ReadStats::default(),
        }
    }

    /// Ranked estimator: loads the taxonomy tree and the reference-name to
    /// taxid table up front; both stay read-only afterwards.
    pub fn with_taxonomy<P: AsRef<Path>, Q: AsRef<Path>>(
        opts: QuantOpts,
        taxonomy_tree: P,
        name2taxid: Q,
    ) -> Result<Quantifier> {
        let taxonomy = Taxonomy::from_file(taxonomy_tree)?;
        let table = read_name2taxid(name2taxid)?;
        let mut q = Quantifier::new(opts);
        q.taxonomy = Some(taxonomy);
        q.ref_name_2_tax_id = table;
        Ok(q)
    }

    fn ensure_target(&mut self, id: usize) {
        if id >= self.strain_cnt.len() {
            self.strain_cnt.resize(id + 1, 0.0);
            self.score_acc.resize(id + 1, 0.0);
        }
    }

    /// The load phase: streams records out of `source`, applies the hit
    /// filters, seeds the strain table with each read's score share, and
    /// folds the accepted reads into equivalence classes and coverage bins.
    pub fn load_mappings<S: MappingSource>(&mut self, mut source: S) -> Result<()> {
        info!("loading mapping stream");
        while let Some(record) = source.next_record()? {
            self.stats.total += 1;
            if record.hits.is_empty() {
                self.stats.unmapped += 1;
                continue;
            }
            let mut hits: Vec<&readers::MappingHit> = record.hits.iter().collect();
            if self.opts.require_concordance && source.is_paired() {
                let before = hits.len();
                hits.retain(|h| h.concordant);
                self.stats.discordant += before - hits.len();
                if hits.is_empty() {
                    self.stats.conflicting += 1;
                    continue;
                }
            }
            if self.opts.only_perfect {
                hits.retain(|h| h.score >= record.read_len as f64);
                if hits.is_empty() {
                    self.stats.filtered += 1;
                    continue;
                }
            }

            // resolve names and collapse repeated targets, first hit wins
            let refs = source.references();
            let mut per_target: Vec<(usize, f64, i64)> = Vec::with_capacity(hits.len());
            for h in &hits {
                if !self.opts.flat_abundance
                    && !self.ref_name_2_tax_id.contains_key(&refs[h.target_id].name)
                {
                    continue;
                }
                if per_target.iter().any(|&(t, _, _)| t == h.target_id) {
                    continue;
                }
                per_target.push((h.target_id, h.score, h.position));
            }
            if per_target.is_empty() {
                self.stats.not_found += 1;
                continue;
            }
            if self.opts.only_unique && per_target.len() > 1 {
                self.stats.filtered += 1;
                continue;
            }
            if per_target.len() > 1 {
                self.stats.multi_mapped += 1;
            }

            per_target.sort_by_key(|&(t, _, _)| t);
            let score_sum: f64 = per_target.iter().map(|&(_, s, _)| s).sum();
            let mut tgts = Vec::with_capacity(per_target.len());
            let mut probs = Vec::with_capacity(per_target.len());
            for &(t, score, position) in &per_target {
                let prob = if score_sum > 0.0 {
                    score / score_sum
                } else {
                    1.0 / per_target.len() as f64
                };
                self.ensure_target(t);
                self.strain_cnt[t] += prob;
                self.score_acc[t] += score;
                self.coverage.add_reference(t, refs[t].len);
                self.coverage.record_hit(t, position);
                tgts.push(t);
                probs.push(prob);
            }
            self.eqb.add_group(tgts, probs);
            self.read_cnt += 1;
        }

        self.references = source.references().to_vec();
        let n = self.references.len();
        self.strain_cnt.resize(n, 0.0);
        self.score_acc.resize(n, 0.0);
        self.strain_valid = vec![true; n];
        for (id, r) in self.references.iter().enumerate() {
            self.coverage.add_reference(id, r.len);
        }
        self.coverage.finalize();
        self.stats.log_summary();
        Ok(())
    }

    /// The EM phase. Freezes the class table, then alternates the M-step
    /// (redistribute each class's count across its valid members in
    /// proportion to current counts) and the E-step (swap accumulators in,
    /// check the max delta) until convergence or the iteration cap, running
    /// the pruning heuristic every few iterations while it still helps.
    pub fn run_em(&mut self) -> EmSummary {
        let total_count = self.eqb.finish();
        info!(
            "{} reads in {} equivalence classes",
            total_count,
            self.eqb.num_classes()
        );
        info!("total accepted reads: {}", self.read_cnt);

        let n = self.references.len();
        let mut strain_cnt = std::mem::take(&mut self.strain_cnt);
        let mut strain_valid = std::mem::take(&mut self.strain_valid);
        strain_cnt.resize(n, 0.0);
        strain_valid.resize(n, true);

        let mut cntr = 0;
        let mut converged = false;
        let mut can_help = true;

        while cntr < self.opts.max_iter && !converged {
            if cntr % THRESHOLDING_ITER_STEP == 0 && can_help {
                can_help = self.prune_pass(&strain_cnt, &mut strain_valid);
            }

            // M-step: every class redistributes its read count over its
            // valid members; classes whose members all sit at zero
            // contribute nothing this round
            let new_strain_cnt = self
                .eqb
                .classes()
                .par_iter()
                .fold(
                    || vec![0.0f64; n],
                    |mut acc, (group, value)| {
                        let tgts = group.tgts();
                        let weights = value.weights();
                        let mut tmp = vec![0.0f64; tgts.len()];
                        let mut denom = 0.0;
                        for (i, &tgt) in tgts.iter().enumerate() {
                            if strain_valid[tgt] {
                                tmp[i] = weights[i] * strain_cnt[tgt];
                                denom += tmp[i];
                            }
                        }
                        if denom > 0.0 {
                            let count = value.count() as f64;
                            for (i, &tgt) in tgts.iter().enumerate() {
                                if tmp[i] > 0.0 {
                                    acc[tgt] += count * tmp[i] / denom;
                                }
                            }
                        }
                        acc
                    },
                )
                .reduce(
                    || vec![0.0f64; n],
                    |mut a, b| {
                        for (x, y) in a.iter_mut().zip(b) {
                            *x += y;
                        }
                        a
                    },
                );

            // E-step: swap in the new counts, convergence on the max delta
            converged = true;
            let mut max_diff = 0.0f64;
            for i in 0..n {
                let next = if strain_valid[i] { new_strain_cnt[i] } else { 0.0 };
                let adiff = (next - strain_cnt[i]).abs();
                if adiff > self.opts.eps {
                    converged = false;
                }
                max_diff = max_diff.max(adiff);
                strain_cnt[i] = next;
            }
            cntr += 1;
            debug!("iteration {}: max count delta {}", cntr, max_diff);
        }

        let valid_cnt = strain_valid.iter().filter(|v| **v).count();
        let final_mass: f64 = strain_cnt
            .iter()
            .zip(&strain_valid)
            .filter(|(_, v)| **v)
            .map(|(c, _)| c)
            .sum();
        info!(
            "EM finished after {} iterations (converged: {}), {} valid references, {} mass",
            cntr, converged, valid_cnt, final_mass
        );

        self.strain_cnt = strain_cnt;
        self.strain_valid = strain_valid;
        EmSummary { iterations: cntr, converged }
    }

    /// One pruning pass. Strains at or below the abundance floor are
    /// dispensable; a class whose every valid member is dispensable is
    /// endangered and goes into a set-cover instance (dispensable strains
    /// as sets, endangered classes as unit-weight elements) that decides
    /// which of them must stay valid. Dispensable strains touching no
    /// endangered class are dropped outright. Returns whether the pass
    /// changed anything, the fixed-point signal for the caller.
    fn prune_pass(&self, strain_cnt: &[f64], strain_valid: &mut [bool]) -> bool {
        let n = strain_cnt.len();
        let dispensable: Vec<bool> = strain_cnt.iter().map(|&c| c <= self.opts.min_cnt).collect();

        // candidate strain -> endangered classes it could keep covered;
        // previously invalidated strains stay in play so the cover may
        // revert one when nothing better covers a class
        let mut candidates: HashMap<usize, Vec<usize>> = HashMap::new();
        let mut element_count = 0usize;
        for (group, _) in self.eqb.classes() {
            let tgts = group.tgts();
            let valid_members = tgts.iter().filter(|&&t| strain_valid[t]).count();
            let dispensable_valid = tgts
                .iter()
                .filter(|&&t| strain_valid[t] && dispensable[t])
                .count();
            if valid_members == 0 || dispensable_valid < valid_members {
                continue;
            }
            let element = element_count;
            element_count += 1;
            for &t in tgts {
                if dispensable[t] {
                    candidates.entry(t).or_default().push(element);
                }
            }
        }

        let mut removed_immediate = 0usize;
        for i in 0..n {
            if strain_valid[i] && dispensable[i] && !candidates.contains_key(&i) {
                strain_valid[i] = false;
                removed_immediate += 1;
            }
        }

        if element_count == 0 {
            if removed_immediate > 0 {
                debug!("pruning: {} references removed outright", removed_immediate);
            }
            return removed_immediate > 0;
        }

        let mut candidate_list: Vec<(usize, Vec<usize>)> = candidates.into_iter().collect();
        candidate_list.sort_by_key(|(t, _)| *t);
        let mut set_targets = Vec::with_capacity(candidate_list.len());
        let mut sets = Vec::with_capacity(candidate_list.len());
        let mut weights = Vec::with_capacity(candidate_list.len());
        for (t, elements) in candidate_list {
            set_targets.push(t);
            weights.push(elements.len() as f64);
            sets.push(elements);
        }

        let chosen = greedy_set_cover(&sets, &weights, element_count);
        let keep: HashSet<usize> = chosen.iter().map(|&i| set_targets[i]).collect();

        let mut removed_by_cover = 0usize;
        let mut reverted = 0usize;
        for &t in &set_targets {
            if keep.contains(&t) {
                if !strain_valid[t] {
                    strain_valid[t] = true;
                    reverted += 1;
                }
            } else if strain_valid[t] {
                strain_valid[t] = false;
                removed_by_cover += 1;
            }
        }
        debug!(
            "pruning: {} removed outright, {} removed by cover, {} reverted",
            removed_immediate, removed_by_cover, reverted
        );
        removed_immediate + removed_by_cover + reverted > 0
    }

    /// Rolls the per-strain counts up the taxonomy to the configured rank.
    /// Strains whose walk reaches the root without meeting the rank are
    /// dropped, as are strains without a taxid.
    pub fn rollup(&self) -> Result<HashMap<u32, f64>> {
        let taxonomy = self.taxonomy.as_ref().ok_or(QuantError::MissingTaxonomy)?;
        let mut out: HashMap<u32, f64> = HashMap::new();
        for (id, r) in self.references.iter().enumerate() {
            if !self.valid(id) || self.strain_cnt[id] <= 0.0 {
                continue;
            }
            let tid = match self.ref_name_2_tax_id.get(&r.name) {
                Some(&tid) => tid,
                None => continue,
            };
            if let Some(ancestor) = taxonomy.rollup_to(tid, self.opts.level) {
                *out.entry(ancestor).or_insert(0.0) += self.strain_cnt[id];
            }
        }
        Ok(out)
    }

    /// Writes the abundance table: per-taxon rows in ranked mode, one row
    /// per reference (zero counts included) in flat mode. Rows come out in
    /// ascending key order so identical runs produce identical files.
    pub fn serialize_abundance<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        info!("writing abundance results to {}", path.as_ref().display());
        let mut out = BufWriter::new(File::create(path)?);
        if self.opts.flat_abundance {
            for (id, r) in self.references.iter().enumerate() {
                let cnt = if self.valid(id) { self.strain_cnt[id] } else { 0.0 };
                writeln!(out, "{}\tflat\t{}\t{}", r.name, cnt, self.coverage.fraction(id))?;
            }
        } else {
            let mut rows: Vec<(u32, f64)> = self.rollup()?.into_iter().collect();
            rows.sort_by_key(|&(tid, _)| tid);
            for (tid, cnt) in rows {
                writeln!(out, "{}\t{}\t{}", tid, self.opts.level.as_str(), cnt)?;
            }
        }
        Ok(())
    }

    /// Companion dump: accumulated mapping score per reference id.
    pub fn serialize_coverage<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let mut out = BufWriter::new(File::create(path)?);
        for (id, score) in self.score_acc.iter().enumerate() {
            writeln!(out, "{}\t{}", id, score)?;
        }
        Ok(())
    }

    fn valid(&self, id: usize) -> bool {
        self.strain_valid.get(id).copied().unwrap_or(true)
    }

    pub fn stats(&self) -> &ReadStats {
        &self.stats
    }

    pub fn references(&self) -> &[Reference] {
        &self.references
    }

    pub fn strain_counts(&self) -> &[f64] {
        &self.strain_cnt
    }

    pub fn strain_validity(&self) -> &[bool] {
        &self.strain_valid
    }

    pub fn coverage_fraction(&self, id: usize) -> f64 {
        self.coverage.fraction(id)
    }
}

#[cfg(test)]
mod tests {
    use super::readers::{MappingHit, MappingRecord};
    use super::*;
    use std::io::Write as IoWrite;

    struct VecSource {
        refs: Vec<Reference>,
        records: Vec<MappingRecord>,
        idx: usize,
        paired: bool,
    }

    impl VecSource {
        fn new(refs: Vec<(&str, usize)>, records: Vec<MappingRecord>) -> VecSource {
            VecSource {
                refs: refs
                    .into_iter()
                    .map(|(name, len)| Reference { name: name.to_string(), len })
                    .collect(),
                records,
                idx: 0,
                paired: false,
            }
        }
    }

    impl MappingSource for VecSource {
        fn next_record(&mut self) -> Result<Option<MappingRecord>> {
            let rec = self.records.get(self.idx).cloned();
            self.idx += 1;
            Ok(rec)
        }

        fn references(&self) -> &[Reference] {
            &self.refs
        }

        fn is_paired(&self) -> bool {
            self.paired
        }
    }

    fn record(hits: &[(usize, f64)]) -> MappingRecord {
        MappingRecord {
            read_len: 100,
            hits: hits
                .iter()
                .map(|&(target_id, score)| MappingHit {
                    target_id,
                    position: 0,
                    score,
                    concordant: true,
                })
                .collect(),
        }
    }

    fn flat_opts() -> QuantOpts {
        QuantOpts { flat_abundance: true, ..QuantOpts::default() }
    }

    #[test]
    fn even_class_splits_in_one_iteration() {
        let records = (0..10).map(|_| record(&[(0, 50.0), (1, 50.0)])).collect();
        let source = VecSource::new(vec![("A", 1000), ("B", 1000)], records);
        let mut q = Quantifier::new(flat_opts());
        q.load_mappings(source).unwrap();
        let summary = q.run_em();
        assert!(summary.converged);
        assert_eq!(summary.iterations, 1);
        assert!((q.strain_counts()[0] - 5.0).abs() < 1e-9);
        assert!((q.strain_counts()[1] - 5.0).abs() < 1e-9);
    }

    #[test]
    fn disjoint_classes_keep_their_counts() {
        let mut records: Vec<_> = (0..3).map(|_| record(&[(0, 80.0)])).collect();
        records.extend((0..7).map(|_| record(&[(1, 80.0)])));
        let source = VecSource::new(vec![("A", 1000), ("B", 1000)], records);
        let mut q = Quantifier::new(flat_opts());
        q.load_mappings(source).unwrap();
        let summary = q.run_em();
        assert!(summary.converged);
        assert!((q.strain_counts()[0] - 3.0).abs() < 1e-9);
        assert!((q.strain_counts()[1] - 7.0).abs() < 1e-9);
    }

    #[test]
    fn zero_iterations_return_the_seed_distribution() {
        let records = vec![record(&[(0, 60.0), (1, 20.0)])];
        let source = VecSource::new(vec![("A", 1000), ("B", 1000)], records);
        let mut q = Quantifier::new(QuantOpts {
            max_iter: 0,
            ..flat_opts()
        });
        q.load_mappings(source).unwrap();
        let summary = q.run_em();
        assert_eq!(summary.iterations, 0);
        assert!(!summary.converged);
        assert!((q.strain_counts()[0] - 0.75).abs() < 1e-12);
        assert!((q.strain_counts()[1] - 0.25).abs() < 1e-12);
    }

    #[test]
    fn mass_is_conserved_across_iterations() {
        let mut records: Vec<_> = (0..5).map(|_| record(&[(0, 90.0), (1, 10.0)])).collect();
        records.extend((0..4).map(|_| record(&[(1, 50.0), (2, 50.0)])));
        records.push(record(&[(2, 70.0)]));
        let source = VecSource::new(vec![("A", 1000), ("B", 1000), ("C", 1000)], records);
        let mut q = Quantifier::new(flat_opts());
        q.load_mappings(source).unwrap();

        let seed: f64 = q.strain_counts().iter().sum();
        assert!((seed - 10.0).abs() < 1e-9);

        q.run_em();
        let total: f64 = q
            .strain_counts()
            .iter()
            .zip(q.strain_validity())
            .filter(|(_, v)| **v)
            .map(|(c, _)| c)
            .sum();
        assert!((total - 10.0).abs() < 1e-6);
    }

    #[test]
    fn sole_cover_strain_survives_the_floor() {
        // C sits at the floor but is the only member of its class, so the
        // cover must keep it; E maps nothing and is dropped outright
        let mut records = vec![record(&[(0, 80.0)])];
        records.extend((0..5).map(|_| record(&[(1, 80.0)])));
        let source = VecSource::new(vec![("C", 1000), ("D", 1000), ("E", 1000)], records);
        let mut q = Quantifier::new(QuantOpts {
            min_cnt: 1.0,
            ..flat_opts()
        });
        q.load_mappings(source).unwrap();
        q.run_em();
        assert!(q.strain_validity()[0], "sole-cover strain must stay valid");
        assert!(q.strain_validity()[1]);
        assert!(!q.strain_validity()[2], "unmapped strain should be pruned");
        assert!((q.strain_counts()[0] - 1.0).abs() < 1e-9);
        assert!((q.strain_counts()[1] - 5.0).abs() < 1e-9);
    }

    #[test]
    fn covered_low_abundance_strain_is_pruned() {
        // B only ever co-maps with A, which is abundant; once B drops to
        // the floor the class is still covered by A, so B goes away and
        // its share flows to A
        let mut records: Vec<_> = (0..9).map(|_| record(&[(0, 100.0)])).collect();
        records.push(record(&[(0, 90.0), (1, 10.0)]));
        let source = VecSource::new(vec![("A", 1000), ("B", 1000)], records);
        let mut q = Quantifier::new(QuantOpts {
            min_cnt: 0.5,
            ..flat_opts()
        });
        q.load_mappings(source).unwrap();
        q.run_em();
        assert!(q.strain_validity()[0]);
        assert!(!q.strain_validity()[1]);
        assert!((q.strain_counts()[0] - 10.0).abs() < 1e-6);
        assert_eq!(q.strain_counts()[1], 0.0);
    }

    #[test]
    fn every_class_keeps_a_valid_member_after_pruning() {
        let mut records: Vec<_> = (0..3).map(|_| record(&[(0, 50.0), (1, 50.0)])).collect();
        records.push(record(&[(2, 40.0)]));
        records.push(record(&[(3, 40.0), (4, 60.0)]));
        let source = VecSource::new(
            vec![("A", 500), ("B", 500), ("C", 500), ("D", 500), ("E", 500)],
            records,
        );
        let mut q = Quantifier::new(QuantOpts {
            min_cnt: 2.0,
            ..flat_opts()
        });
        q.load_mappings(source).unwrap();
        q.run_em();
        for (group, _) in q.eqb.classes() {
            let covered = group.tgts().iter().any(|&t| q.strain_validity()[t]);
            assert!(covered, "class {:?} lost all valid members", group.tgts());
        }
    }

    #[test]
    fn unmapped_and_unresolvable_reads_are_counted_not_classed() {
        let records = vec![
            record(&[(0, 50.0)]),
            MappingRecord { read_len: 100, hits: Vec::new() },
            record(&[(1, 50.0)]),
        ];
        let source = VecSource::new(vec![("known", 1000), ("unknown", 1000)], records);
        let opts = QuantOpts::default(); // ranked mode, name table below
        let mut q = Quantifier::new(opts);
        q.opts.flat_abundance = false;
        q.ref_name_2_tax_id.insert("known".to_string(), 7);
        q.load_mappings(source).unwrap();
        assert_eq!(q.stats().total, 3);
        assert_eq!(q.stats().unmapped, 1);
        assert_eq!(q.stats().not_found, 1);
        assert_eq!(q.stats().accepted(), 1);
        assert_eq!(q.eqb.num_classes(), 1);
    }

    #[test]
    fn flat_output_includes_zero_count_rows() {
        let records = vec![record(&[(0, 50.0)]), record(&[(1, 50.0)])];
        let source = VecSource::new(vec![("A", 1000), ("B", 1000), ("C", 1000)], records);
        let mut q = Quantifier::new(flat_opts());
        q.load_mappings(source).unwrap();
        q.run_em();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("flat.tsv");
        q.serialize_abundance(&path).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[2].starts_with("C\tflat\t0\t0"));
    }

    #[test]
    fn rollup_attributes_species_mass_to_genus() {
        let dir = tempfile::tempdir().unwrap();
        let tree_path = dir.path().join("nodes.dmp");
        let names_path = dir.path().join("name2taxid.map");
        let mut tree = File::create(&tree_path).unwrap();
        writeln!(tree, "1\t|\t1\t|\tno rank\t|").unwrap();
        writeln!(tree, "2\t|\t1\t|\tfamily\t|").unwrap();
        writeln!(tree, "3\t|\t2\t|\tgenus\t|").unwrap();
        writeln!(tree, "4\t|\t3\t|\tspecies\t|").unwrap();
        let mut names = File::create(&names_path).unwrap();
        writeln!(names, "refS 4").unwrap();

        let opts = QuantOpts {
            level: Rank::Genus,
            ..QuantOpts::default()
        };
        let mut q = Quantifier::with_taxonomy(opts, &tree_path, &names_path).unwrap();
        let records = (0..6).map(|_| record(&[(0, 80.0)])).collect();
        q.load_mappings(VecSource::new(vec![("refS", 1000)], records))
            .unwrap();
        q.run_em();

        let rolled = q.rollup().unwrap();
        assert_eq!(rolled.len(), 1);
        assert!((rolled[&3] - 6.0).abs() < 1e-9);
        assert!(!rolled.contains_key(&4), "species must not appear at genus level");
    }

    #[test]
    fn repeated_runs_agree_within_tolerance() {
        let build = || {
            let mut records: Vec<_> =
                (0..20).map(|_| record(&[(0, 60.0), (1, 40.0)])).collect();
            records.extend((0..10).map(|_| record(&[(1, 30.0), (2, 70.0)])));
            VecSource::new(vec![("A", 800), ("B", 800), ("C", 800)], records)
        };
        let mut first = Quantifier::new(flat_opts());
        first.load_mappings(build()).unwrap();
        first.run_em();
        let mut second = Quantifier::new(flat_opts());
        second.load_mappings(build()).unwrap();
        second.run_em();
        for (a, b) in first.strain_counts().iter().zip(second.strain_counts()) {
            assert!((a - b).abs() < 1e-9);
        }
    }
}
