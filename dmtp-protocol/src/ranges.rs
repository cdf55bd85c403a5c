//! Byte range tracking
//!
//! A sorted, merge-on-insert set of half-open byte intervals. Used for the
//! sender's dropped ranges, the receiver's peer-declared dropped ranges, and
//! the receiver's record of which stream bytes have arrived.

use std::fmt;

/// Half-open byte range `[start, end)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ByteRange {
    /// First byte in the range
    pub start: u64,
    /// One past the last byte in the range
    pub end: u64,
}

impl ByteRange {
    /// Create a new range
    pub fn new(start: u64, end: u64) -> Self {
        debug_assert!(start <= end);
        ByteRange { start, end }
    }

    /// Create a range from an offset and a length
    pub fn with_len(offset: u64, len: u64) -> Self {
        ByteRange {
            start: offset,
            end: offset.saturating_add(len),
        }
    }

    /// Length of the range in bytes
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    /// Check if the range is empty
    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }

    /// Check if the range contains an offset
    pub fn contains(&self, offset: u64) -> bool {
        self.start <= offset && offset < self.end
    }

    /// Check if two ranges share at least one byte
    pub fn overlaps(&self, other: &ByteRange) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// Merge with another range if they overlap or touch
    pub fn try_merge(&self, other: &ByteRange) -> Option<ByteRange> {
        if other.start <= self.end && self.start <= other.end {
            Some(ByteRange {
                start: self.start.min(other.start),
                end: self.end.max(other.end),
            })
        } else {
            None
        }
    }
}

impl fmt::Display for ByteRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

/// Sorted set of non-overlapping, non-adjacent byte ranges
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RangeSet {
    ranges: Vec<ByteRange>,
}

impl RangeSet {
    /// Create an empty set
    pub fn new() -> Self {
        RangeSet { ranges: Vec::new() }
    }

    /// Insert `[start, end)`, merging with overlapping or adjacent ranges
    ///
    /// Returns the number of bytes that were not already covered.
    pub fn insert(&mut self, start: u64, end: u64) -> u64 {
        if start >= end {
            return 0;
        }

        // First range whose end reaches `start` (touching counts)
        let first = self.ranges.partition_point(|r| r.end < start);
        // One past the last range whose start is within reach of `end`
        let last = self.ranges.partition_point(|r| r.start <= end);

        let mut merged = ByteRange::new(start, end);
        let mut already_covered = 0;
        for existing in &self.ranges[first..last] {
            let overlap_start = existing.start.max(start);
            let overlap_end = existing.end.min(end);
            if overlap_start < overlap_end {
                already_covered += overlap_end - overlap_start;
            }
            merged.start = merged.start.min(existing.start);
            merged.end = merged.end.max(existing.end);
        }

        self.ranges.splice(first..last, std::iter::once(merged));
        (end - start) - already_covered
    }

    /// Insert a range
    pub fn insert_range(&mut self, range: ByteRange) -> u64 {
        self.insert(range.start, range.end)
    }

    /// Check if an offset is covered
    pub fn contains(&self, offset: u64) -> bool {
        self.range_containing(offset).is_some()
    }

    /// Get the range covering an offset, if any
    pub fn range_containing(&self, offset: u64) -> Option<ByteRange> {
        let idx = self.ranges.partition_point(|r| r.end <= offset);
        self.ranges.get(idx).copied().filter(|r| r.contains(offset))
    }

    /// Check if any byte of `[start, end)` is covered
    pub fn overlaps(&self, start: u64, end: u64) -> bool {
        if start >= end {
            return false;
        }
        let idx = self.ranges.partition_point(|r| r.end <= start);
        self.ranges.get(idx).map_or(false, |r| r.start < end)
    }

    /// Check if all of `[start, end)` is covered
    pub fn covers(&self, start: u64, end: u64) -> bool {
        if start >= end {
            return true;
        }
        self.range_containing(start).map_or(false, |r| r.end >= end)
    }

    /// Advance `offset` past every covered range it falls into
    pub fn skip_covered(&self, offset: u64) -> u64 {
        // Ranges never touch, so one hop is enough
        self.range_containing(offset).map_or(offset, |r| r.end)
    }

    /// First range starting at or after `offset`, or containing it
    pub fn next_from(&self, offset: u64) -> Option<ByteRange> {
        let idx = self.ranges.partition_point(|r| r.end <= offset);
        self.ranges.get(idx).copied()
    }

    /// Remove every byte below `offset`
    pub fn remove_below(&mut self, offset: u64) {
        self.ranges.retain(|r| r.end > offset);
        if let Some(first) = self.ranges.first_mut() {
            if first.start < offset {
                first.start = offset;
            }
        }
    }

    /// First range in the set
    pub fn first(&self) -> Option<ByteRange> {
        self.ranges.first().copied()
    }

    /// Last range in the set
    pub fn last(&self) -> Option<ByteRange> {
        self.ranges.last().copied()
    }

    /// Iterate ranges in ascending order
    pub fn iter(&self) -> impl Iterator<Item = ByteRange> + '_ {
        self.ranges.iter().copied()
    }

    /// Number of disjoint ranges
    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    /// Check if the set is empty
    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Total number of covered bytes
    pub fn covered_bytes(&self) -> u64 {
        self.ranges.iter().map(ByteRange::len).sum()
    }

    /// Remove all ranges
    pub fn clear(&mut self) {
        self.ranges.clear();
    }
}

impl<'a> IntoIterator for &'a RangeSet {
    type Item = &'a ByteRange;
    type IntoIter = std::slice::Iter<'a, ByteRange>;

    fn into_iter(self) -> Self::IntoIter {
        self.ranges.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ranges(set: &RangeSet) -> Vec<(u64, u64)> {
        set.iter().map(|r| (r.start, r.end)).collect()
    }

    #[test]
    fn test_byte_range_merge() {
        let r1 = ByteRange::new(10, 15);
        let r2 = ByteRange::new(15, 20);

        // Touching ranges merge
        let merged = r1.try_merge(&r2).unwrap();
        assert_eq!(merged, ByteRange::new(10, 20));

        // Disjoint ranges do not
        assert!(r1.try_merge(&ByteRange::new(16, 20)).is_none());
    }

    #[test]
    fn test_insert_disjoint_sorted() {
        let mut set = RangeSet::new();
        set.insert(200, 500);
        set.insert(0, 100);
        set.insert(700, 800);

        assert_eq!(ranges(&set), vec![(0, 100), (200, 500), (700, 800)]);
        assert_eq!(set.covered_bytes(), 500);
    }

    #[test]
    fn test_insert_merges_adjacent_and_overlapping() {
        let mut set = RangeSet::new();
        set.insert(10, 20);
        set.insert(30, 40);
        assert_eq!(set.insert(20, 30), 10);
        assert_eq!(ranges(&set), vec![(10, 40)]);

        // Fully covered insert adds nothing
        assert_eq!(set.insert(15, 35), 0);

        // Spanning insert swallows everything
        set.insert(50, 60);
        assert_eq!(set.insert(0, 100), 100 - 40);
        assert_eq!(ranges(&set), vec![(0, 100)]);
    }

    #[test]
    fn test_insert_reports_new_bytes() {
        let mut set = RangeSet::new();
        assert_eq!(set.insert(0, 100), 100);
        assert_eq!(set.insert(50, 150), 50);
        assert_eq!(set.insert(150, 150), 0);
    }

    #[test]
    fn test_contains_and_overlaps() {
        let mut set = RangeSet::new();
        set.insert(0, 100);
        set.insert(200, 500);

        assert!(set.contains(0));
        assert!(set.contains(99));
        assert!(!set.contains(100));
        assert!(set.overlaps(90, 110));
        assert!(!set.overlaps(100, 200));
        assert!(set.covers(250, 500));
        assert!(!set.covers(50, 250));
    }

    #[test]
    fn test_skip_covered() {
        let mut set = RangeSet::new();
        set.insert(0, 100);
        set.insert(200, 500);

        assert_eq!(set.skip_covered(0), 100);
        assert_eq!(set.skip_covered(150), 150);
        assert_eq!(set.skip_covered(250), 500);
    }

    #[test]
    fn test_remove_below() {
        let mut set = RangeSet::new();
        set.insert(0, 100);
        set.insert(200, 500);

        set.remove_below(250);
        assert_eq!(ranges(&set), vec![(250, 500)]);

        set.remove_below(1000);
        assert!(set.is_empty());
    }

    #[test]
    fn test_next_from() {
        let mut set = RangeSet::new();
        set.insert(200, 500);

        assert_eq!(set.next_from(0), Some(ByteRange::new(200, 500)));
        assert_eq!(set.next_from(300), Some(ByteRange::new(200, 500)));
        assert_eq!(set.next_from(500), None);
    }
}
