use std::collections::HashMap;

/// Fixed-width positional bins per reference, accumulated while the mapping
/// stream loads and reduced to a covered-bin fraction afterwards.
#[derive(Debug, Clone)]
pub struct CoverageTracker {
    segment_size: usize,
    bins: HashMap<usize, Vec<u32>>,
    fraction: HashMap<usize, f64>,
}

impl CoverageTracker {
    pub fn new(segment_size: usize) -> CoverageTracker {
        assert!(segment_size > 0, "segment size must be positive");
        CoverageTracker {
            segment_size,
            bins: HashMap::new(),
            fraction: HashMap::new(),
        }
    }

    /// Registers a reference with `max(1, len / segment_size)` bins.
    /// No-op when the reference is already known.
    pub fn add_reference(&mut self, id: usize, len: usize) {
        self.bins
            .entry(id)
            .or_insert_with(|| vec![0; (len / self.segment_size).max(1)]);
    }

    /// Counts a hit at the leftmost mapping position. Negative positions
    /// land in bin 0, positions past the reference end in the last bin.
    /// Hits to unregistered references are dropped.
    pub fn record_hit(&mut self, id: usize, position: i64) {
        let bins = match self.bins.get_mut(&id) {
            Some(b) => b,
            None => return,
        };
        let bin = if position < 0 {
            0
        } else {
            (position as usize / self.segment_size).min(bins.len() - 1)
        };
        bins[bin] += 1;
    }

    /// Computes the covered-bin fraction for every registered reference.
    pub fn finalize(&mut self) {
        for (id, bins) in &self.bins {
            let covered = bins.iter().filter(|c| **c > 0).count();
            self.fraction.insert(*id, covered as f64 / bins.len() as f64);
        }
    }

    /// Coverage fraction of a reference, 0 when it was never registered.
    pub fn fraction(&self, id: usize) -> f64 {
        self.fraction.get(&id).copied().unwrap_or(0.0)
    }
}
