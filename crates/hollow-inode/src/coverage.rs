/// An ordered set of disjoint half-open byte intervals.
///
/// Tracks which ranges of a non-materialized blob have been served to the
/// kernel; once the whole blob is covered the inode can drop its cache
/// interest, since the kernel holds the data now.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CoverageSet {
    /// Sorted by start, pairwise disjoint and non-adjacent.
    intervals: Vec<(u64, u64)>,
}

impl CoverageSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `[start, end)`, merging with any overlapping or adjacent
    /// intervals. Empty ranges are ignored.
    pub fn add(&mut self, start: u64, end: u64) {
        if start >= end {
            return;
        }
        // The merge window: every interval that touches [start, end].
        let lo = self.intervals.partition_point(|&(_, e)| e < start);
        let hi = self.intervals.partition_point(|&(s, _)| s <= end);

        let mut merged = (start, end);
        if lo < hi {
            merged.0 = merged.0.min(self.intervals[lo].0);
            merged.1 = merged.1.max(self.intervals[hi - 1].1);
        }
        self.intervals.splice(lo..hi, [merged]);
    }

    /// True iff the union of the set contains `[start, end)` entirely.
    pub fn covers(&self, start: u64, end: u64) -> bool {
        if start >= end {
            return true;
        }
        let idx = self.intervals.partition_point(|&(s, _)| s <= start);
        if idx == 0 {
            return false;
        }
        let (s, e) = self.intervals[idx - 1];
        s <= start && end <= e
    }

    pub fn clear(&mut self) {
        self.intervals.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.intervals.is_empty()
    }
}
