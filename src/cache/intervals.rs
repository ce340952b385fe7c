//! Block-interval arithmetic for cache coverage bookkeeping.
//!
//! The cache records, per source fingerprint, which contiguous block ranges
//! are fully synced. Two operations matter:
//!
//! - **merge**: adding a newly synced range must keep the stored set disjoint
//!   and maximal (adjacent ranges coalesce)
//! - **subtract**: given a requested range, compute the minimal set of
//!   sub-ranges still missing from the cache
//!
//! Both are ordered sweeps over the sorted interval list. Ranges are
//! inclusive on both ends, matching `eth_getLogs` semantics.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::types::BlockNumber;

// ═══════════════════════════════════════════════════════════════════════════════
// BLOCK RANGE
// ═══════════════════════════════════════════════════════════════════════════════

/// An inclusive block range `[from, to]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockRange {
    /// First block, inclusive.
    pub from: BlockNumber,
    /// Last block, inclusive.
    pub to: BlockNumber,
}

impl BlockRange {
    /// Create a range. `from` must not exceed `to`.
    #[must_use]
    pub fn new(from: u64, to: u64) -> Self {
        debug_assert!(from <= to, "inverted range [{from}, {to}]");
        Self { from: BlockNumber::new(from), to: BlockNumber::new(to) }
    }

    /// Number of blocks covered.
    #[must_use]
    pub const fn len(&self) -> u64 {
        self.to.value() - self.from.value() + 1
    }

    /// Ranges always contain at least one block.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        false
    }

    /// True when `block` falls within the range.
    #[must_use]
    pub fn contains(&self, block: BlockNumber) -> bool {
        self.from <= block && block <= self.to
    }

    /// Split into two halves for range-limit retries.
    ///
    /// Returns `None` for single-block ranges, which cannot shrink further.
    #[must_use]
    pub fn halve(&self) -> Option<(Self, Self)> {
        if self.len() < 2 {
            return None;
        }
        let mid = self.from.value() + (self.len() / 2) - 1;
        Some((Self::new(self.from.value(), mid), Self::new(mid + 1, self.to.value())))
    }

    /// Split into spans of at most `size` blocks, in order.
    #[must_use]
    pub fn chunks(&self, size: u64) -> Vec<Self> {
        let size = size.max(1);
        let mut out = Vec::new();
        let mut cursor = self.from.value();
        while cursor <= self.to.value() {
            let end = cursor.saturating_add(size - 1).min(self.to.value());
            out.push(Self::new(cursor, end));
            cursor = end + 1;
        }
        out
    }
}

impl fmt::Display for BlockRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.from, self.to)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// INTERVAL SET
// ═══════════════════════════════════════════════════════════════════════════════

/// A disjoint, maximal, ascending set of block ranges.
///
/// The two invariants hold after every operation:
/// 1. ranges are pairwise disjoint and non-adjacent
/// 2. ranges are sorted by `from`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IntervalSet {
    ranges: Vec<BlockRange>,
}

impl IntervalSet {
    /// Empty set.
    #[must_use]
    pub const fn new() -> Self {
        Self { ranges: Vec::new() }
    }

    /// Build from stored ranges, normalizing as needed.
    #[must_use]
    pub fn from_ranges(mut ranges: Vec<BlockRange>) -> Self {
        ranges.sort_unstable();
        let mut set = Self::new();
        for range in ranges {
            set.insert(range);
        }
        set
    }

    /// The ranges in ascending order.
    #[must_use]
    pub fn ranges(&self) -> &[BlockRange] {
        &self.ranges
    }

    /// True when no blocks are covered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Merge a range into the set, coalescing overlaps and adjacency.
    pub fn insert(&mut self, range: BlockRange) {
        let mut merged = range;
        let mut out = Vec::with_capacity(self.ranges.len() + 1);
        let mut placed = false;

        for &existing in &self.ranges {
            // Adjacency counts as overlap: [1,5] and [6,9] coalesce.
            let overlaps = existing.from.value() <= merged.to.value().saturating_add(1)
                && merged.from.value() <= existing.to.value().saturating_add(1);
            if overlaps {
                merged = BlockRange::new(
                    merged.from.value().min(existing.from.value()),
                    merged.to.value().max(existing.to.value()),
                );
            } else if existing.to < merged.from {
                out.push(existing);
            } else {
                if !placed {
                    out.push(merged);
                    placed = true;
                }
                out.push(existing);
            }
        }
        if !placed {
            out.push(merged);
        }
        self.ranges = out;
    }

    /// True when every block of `range` is covered by a single stored range.
    ///
    /// Because the set is maximal, a contiguous requested range can only be
    /// fully covered by one stored range.
    #[must_use]
    pub fn covers(&self, range: BlockRange) -> bool {
        self.ranges.iter().any(|r| r.from <= range.from && range.to <= r.to)
    }

    /// Compute `range \ self`: the minimal sub-ranges not yet covered.
    ///
    /// This is the ordered sweep from the cache design: walk stored ranges
    /// left to right, emitting the gaps that intersect the request.
    #[must_use]
    pub fn subtract_from(&self, range: BlockRange) -> Vec<BlockRange> {
        let mut out = Vec::new();
        let mut cursor = range.from.value();

        for covered in &self.ranges {
            if covered.to.value() < cursor {
                continue;
            }
            if covered.from.value() > range.to.value() {
                break;
            }
            if covered.from.value() > cursor {
                out.push(BlockRange::new(cursor, covered.from.value() - 1));
            }
            cursor = covered.to.value().saturating_add(1);
            if cursor > range.to.value() {
                return out;
            }
        }

        if cursor <= range.to.value() {
            out.push(BlockRange::new(cursor, range.to.value()));
        }
        out
    }

    /// Truncate coverage so nothing at or above `block` remains claimed.
    ///
    /// Used on reorg rollback together with `deleteFromBlock`.
    pub fn truncate_from(&mut self, block: BlockNumber) {
        let mut out = Vec::with_capacity(self.ranges.len());
        for &range in &self.ranges {
            if range.to < block {
                out.push(range);
            } else if range.from < block {
                out.push(BlockRange::new(range.from.value(), block.value() - 1));
            }
        }
        self.ranges = out;
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn set(ranges: &[(u64, u64)]) -> IntervalSet {
        IntervalSet::from_ranges(ranges.iter().map(|&(a, b)| BlockRange::new(a, b)).collect())
    }

    #[test]
    fn insert_coalesces_overlap_and_adjacency() {
        let mut s = IntervalSet::new();
        s.insert(BlockRange::new(10, 20));
        s.insert(BlockRange::new(30, 40));
        s.insert(BlockRange::new(21, 29)); // bridges the gap
        assert_eq!(s.ranges(), &[BlockRange::new(10, 40)]);

        s.insert(BlockRange::new(41, 50)); // adjacent
        assert_eq!(s.ranges(), &[BlockRange::new(10, 50)]);
    }

    #[test]
    fn insert_keeps_disjoint_ranges_ordered() {
        let mut s = IntervalSet::new();
        s.insert(BlockRange::new(50, 60));
        s.insert(BlockRange::new(10, 20));
        s.insert(BlockRange::new(30, 40));
        assert_eq!(
            s.ranges(),
            &[BlockRange::new(10, 20), BlockRange::new(30, 40), BlockRange::new(50, 60)]
        );
    }

    #[test]
    fn subtract_yields_gaps_only() {
        let s = set(&[(10, 20), (30, 40)]);
        let missing = s.subtract_from(BlockRange::new(5, 45));
        assert_eq!(
            missing,
            vec![BlockRange::new(5, 9), BlockRange::new(21, 29), BlockRange::new(41, 45)]
        );
    }

    #[test]
    fn subtract_of_covered_range_is_empty() {
        let s = set(&[(0, 100)]);
        assert!(s.subtract_from(BlockRange::new(10, 90)).is_empty());
        assert!(s.covers(BlockRange::new(10, 90)));
    }

    #[test]
    fn subtract_of_empty_set_is_identity() {
        let s = IntervalSet::new();
        assert_eq!(s.subtract_from(BlockRange::new(3, 7)), vec![BlockRange::new(3, 7)]);
    }

    #[test]
    fn truncate_cuts_and_drops() {
        let mut s = set(&[(10, 20), (30, 40)]);
        s.truncate_from(BlockNumber::new(35));
        assert_eq!(s.ranges(), &[BlockRange::new(10, 20), BlockRange::new(30, 34)]);

        s.truncate_from(BlockNumber::new(15));
        assert_eq!(s.ranges(), &[BlockRange::new(10, 14)]);

        s.truncate_from(BlockNumber::new(5));
        assert!(s.is_empty());
    }

    #[test]
    fn halve_splits_evenly() {
        let (lo, hi) = BlockRange::new(0, 4095).halve().unwrap();
        assert_eq!(lo, BlockRange::new(0, 2047));
        assert_eq!(hi, BlockRange::new(2048, 4095));
        assert!(BlockRange::new(7, 7).halve().is_none());
    }

    #[test]
    fn chunks_cover_exactly() {
        let chunks = BlockRange::new(0, 4095).chunks(1024);
        assert_eq!(chunks.len(), 4);
        assert_eq!(chunks[0], BlockRange::new(0, 1023));
        assert_eq!(chunks[3], BlockRange::new(3072, 4095));

        let chunks = BlockRange::new(0, 10).chunks(4);
        assert_eq!(chunks.last().unwrap(), &BlockRange::new(8, 10));
    }

    mod properties {
        use proptest::prelude::*;

        use super::*;

        fn arb_range() -> impl Strategy<Value = BlockRange> {
            (0u64..500, 0u64..50).prop_map(|(from, len)| BlockRange::new(from, from + len))
        }

        proptest! {
            /// After any insertion sequence the set is disjoint, maximal,
            /// and sorted.
            #[test]
            fn insert_preserves_invariants(ranges in proptest::collection::vec(arb_range(), 0..40)) {
                let mut set = IntervalSet::new();
                for range in ranges {
                    set.insert(range);
                }
                for pair in set.ranges().windows(2) {
                    // Sorted, disjoint, and non-adjacent (maximal)
                    prop_assert!(pair[0].to.value() + 1 < pair[1].from.value());
                }
            }

            /// Subtraction then insertion of the missing parts covers the
            /// requested range.
            #[test]
            fn subtract_is_exact_complement(
                ranges in proptest::collection::vec(arb_range(), 0..20),
                request in arb_range(),
            ) {
                let mut set = IntervalSet::new();
                for range in ranges {
                    set.insert(range);
                }
                let missing = set.subtract_from(request);

                // Missing parts are disjoint from coverage and within the request
                for m in &missing {
                    prop_assert!(m.from >= request.from && m.to <= request.to);
                    for c in set.ranges() {
                        prop_assert!(m.to < c.from || m.from > c.to);
                    }
                }

                // Inserting them makes the request fully covered
                for m in missing {
                    set.insert(m);
                }
                prop_assert!(set.covers(request));
            }
        }
    }
}
