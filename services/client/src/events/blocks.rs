//! Sets of half-open byte ranges.
//!
//! A [`BlockSet`] is always normalized: spans are sorted, disjoint, and
//! touching spans are coalesced, so `[0,10) + [10,20)` stores as `[0,20)`.

use remora_proto::FileBlock;

/// A normalized set of half-open `[lo, hi)` byte ranges.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockSet {
    spans: Vec<(u64, u64)>,
}

impl BlockSet {
    pub fn new() -> Self {
        BlockSet::default()
    }

    /// A set holding the single range `[lo, hi)`; empty when `lo >= hi`.
    pub fn single(lo: u64, hi: u64) -> Self {
        let mut set = BlockSet::new();
        set.insert(lo, hi);
        set
    }

    pub fn is_empty(&self) -> bool {
        self.spans.is_empty()
    }

    /// Insert `[lo, hi)`, merging with overlapping or touching spans.
    pub fn insert(&mut self, lo: u64, hi: u64) {
        if lo >= hi {
            return;
        }
        let mut merged_lo = lo;
        let mut merged_hi = hi;
        let mut out = Vec::with_capacity(self.spans.len() + 1);
        let mut placed = false;
        for &(a, b) in &self.spans {
            if b < merged_lo || a > merged_hi {
                // Entirely before or after the new span; emit in order.
                if a > merged_hi && !placed {
                    out.push((merged_lo, merged_hi));
                    placed = true;
                }
                out.push((a, b));
            } else {
                // Overlaps or touches; absorb.
                merged_lo = merged_lo.min(a);
                merged_hi = merged_hi.max(b);
            }
        }
        if !placed {
            out.push((merged_lo, merged_hi));
            out.sort_unstable();
        }
        self.spans = out;
    }

    /// Union with another set.
    pub fn union(&mut self, other: &BlockSet) {
        for &(lo, hi) in &other.spans {
            self.insert(lo, hi);
        }
    }

    /// Keep only the part of the set below `limit`, i.e. `self ∩ [0, limit)`.
    pub fn truncate_at(&mut self, limit: u64) {
        self.spans.retain_mut(|span| {
            if span.0 >= limit {
                return false;
            }
            if span.1 > limit {
                span.1 = limit;
            }
            true
        });
    }

    /// Total number of bytes covered.
    pub fn covered(&self) -> u64 {
        self.spans.iter().map(|&(lo, hi)| hi - lo).sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = (u64, u64)> + '_ {
        self.spans.iter().copied()
    }

    /// Wire representation (offset + size per span).
    pub fn to_wire(&self) -> Vec<FileBlock> {
        self.spans
            .iter()
            .map(|&(lo, hi)| FileBlock {
                offset: lo,
                size: hi - lo,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spans(set: &BlockSet) -> Vec<(u64, u64)> {
        set.iter().collect()
    }

    #[test]
    fn touching_spans_coalesce() {
        let mut set = BlockSet::new();
        set.insert(0, 10);
        set.insert(10, 20);
        set.insert(20, 25);
        assert_eq!(spans(&set), vec![(0, 25)]);
    }

    #[test]
    fn disjoint_spans_stay_disjoint_and_sorted() {
        let mut set = BlockSet::new();
        set.insert(30, 40);
        set.insert(0, 10);
        set.insert(15, 20);
        assert_eq!(spans(&set), vec![(0, 10), (15, 20), (30, 40)]);
    }

    #[test]
    fn overlap_absorbs_multiple_spans() {
        let mut set = BlockSet::new();
        set.insert(0, 10);
        set.insert(20, 30);
        set.insert(5, 25);
        assert_eq!(spans(&set), vec![(0, 30)]);
    }

    #[test]
    fn empty_range_is_ignored() {
        let mut set = BlockSet::new();
        set.insert(10, 10);
        set.insert(10, 5);
        assert!(set.is_empty());
    }

    #[test]
    fn truncate_clips_and_drops() {
        let mut set = BlockSet::new();
        set.insert(0, 40);
        set.insert(60, 80);
        set.truncate_at(50);
        assert_eq!(spans(&set), vec![(0, 40)]);

        let mut set = BlockSet::single(0, 100);
        set.truncate_at(50);
        assert_eq!(spans(&set), vec![(0, 50)]);
        assert_eq!(set.covered(), 50);
    }

    #[test]
    fn union_merges_both_sets() {
        let mut a = BlockSet::single(0, 10);
        let b = BlockSet::single(10, 25);
        a.union(&b);
        assert_eq!(spans(&a), vec![(0, 25)]);
    }
}
