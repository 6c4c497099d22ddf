use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};

fn calculate_hash<T: Hash>(t: &T) -> u64 {
    let mut s = DefaultHasher::new();
    t.hash(&mut s);
    s.finish()
}

/// The identity of one equivalence class: the sorted, deduplicated target
/// ids a read's hits resolve to, plus the range-bucket ids appended by the
/// factorization. Two reads collapse into the same class exactly when their
/// canonical keys hash equal.
#[derive(Debug, Clone)]
pub struct TargetGroup {
    /*
    tgts: sorted, deduplicated reference ids in this class
    key: tgts followed by the per-target range-bucket ids, in the same order
    hash: hash over key, stable identity of the class
    */
    tgts: Vec<usize>,
    key: Vec<usize>,
    hash: u64,
}

impl TargetGroup {
    fn new(tgts: Vec<usize>, buckets: Vec<usize>) -> TargetGroup {
        let mut key = Vec::with_capacity(tgts.len() + buckets.len());
        key.extend_from_slice(&tgts);
        key.extend_from_slice(&buckets);
        let hash = calculate_hash(&key);
        TargetGroup { tgts, key, hash }
    }

    pub fn tgts(&self) -> &[usize] {
        &self.tgts
    }

    pub fn hash_value(&self) -> u64 {
        self.hash
    }
}

impl PartialEq for TargetGroup {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl Eq for TargetGroup {}

impl Hash for TargetGroup {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key.hash(state);
    }
}

#[derive(Debug, Clone)]
pub struct ClassValue {
    /*
    weights: per-target multipliers, accumulated per read and normalized to
             sum 1 when the builder is frozen
    count: number of reads that mapped to exactly this class
    */
    weights: Vec<f64>,
    count: usize,
}

impl ClassValue {
    fn normalize(&mut self) {
        let sum: f64 = self.weights.iter().sum();
        if sum > 0.0 {
            let norm = 1.0 / sum;
            for w in self.weights.iter_mut() {
                *w *= norm;
            }
        }
    }

    pub fn weights(&self) -> &[f64] {
        &self.weights
    }

    pub fn count(&self) -> usize {
        self.count
    }
}

/// Deduplicates per-read target sets into counted equivalence classes.
///
/// The table grows monotonically through the load phase and is frozen by
/// `finish()` before the EM engine takes over. Adding after `finish()` is a
/// caller bug.
#[derive(Debug, Clone)]
pub struct EquivalenceClassBuilder {
    active: bool,
    range_bins: u32,
    count_map: HashMap<TargetGroup, ClassValue>,
    count_vec: Vec<(TargetGroup, ClassValue)>,
    total_count: usize,
}

impl EquivalenceClassBuilder {
    /// `range_bins` is the factorization parameter: 0 keys classes on the
    /// target set alone, b > 0 refines the key with sqrt(n) + b probability
    /// buckets per target.
    pub fn new(range_bins: u32) -> EquivalenceClassBuilder {
        EquivalenceClassBuilder {
            active: true,
            range_bins,
            count_map: HashMap::new(),
            count_vec: Vec::new(),
            total_count: 0,
        }
    }

    /// Records one read mapping to `tgts` with the given per-target
    /// probabilities. `tgts` must be non-empty, sorted, and deduplicated;
    /// `probs` must be the same length and sum to 1.
    pub fn add_group(&mut self, tgts: Vec<usize>, probs: Vec<f64>) {
        debug_assert!(self.active, "add_group after finish");
        debug_assert!(!tgts.is_empty());
        debug_assert_eq!(tgts.len(), probs.len());
        debug_assert!(tgts.windows(2).all(|w| w[0] < w[1]));

        let buckets = if self.range_bins > 0 {
            let range_count = (tgts.len() as f64).sqrt().floor() + self.range_bins as f64;
            probs.iter().map(|p| (p * range_count) as usize).collect()
        } else {
            Vec::new()
        };
        let group = TargetGroup::new(tgts, buckets);
        match self.count_map.entry(group) {
            std::collections::hash_map::Entry::Occupied(mut e) => {
                let v = e.get_mut();
                v.count += 1;
                for (w, p) in v.weights.iter_mut().zip(&probs) {
                    *w += p;
                }
            }
            std::collections::hash_map::Entry::Vacant(e) => {
                e.insert(ClassValue { weights: probs, count: 1 });
            }
        }
    }

    /// Freezes the table: normalizes every class's weight vector and moves
    /// the classes into a stable, hash-ordered vector. Returns the total
    /// read count across classes. Idempotent.
    pub fn finish(&mut self) -> usize {
        if !self.active {
            return self.total_count;
        }
        self.active = false;
        self.count_vec.reserve(self.count_map.len());
        for (group, mut value) in self.count_map.drain() {
            value.normalize();
            self.total_count += value.count;
            self.count_vec.push((group, value));
        }
        // stable order so downstream iteration is reproducible
        self.count_vec.sort_by_key(|(g, _)| g.hash);
        self.total_count
    }

    pub fn classes(&self) -> &[(TargetGroup, ClassValue)] {
        debug_assert!(!self.active, "classes read before finish");
        &self.count_vec
    }

    pub fn num_classes(&self) -> usize {
        if self.active {
            self.count_map.len()
        } else {
            self.count_vec.len()
        }
    }
}
