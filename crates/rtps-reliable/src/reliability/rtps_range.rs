// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! RTPS sequence number ranges.
//!
//! Ranges are exclusive `[start, end)`, matching the GAP encoding where
//! `gapStart..gapList.base` is the contiguous irrelevant span. Empty ranges
//! are allowed (a writer with empty history announces `[last+1, last+1)`).

use std::ops::Range;

/// Sequence number range `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RtpsRange {
    start: u64,
    end: u64,
}

impl RtpsRange {
    /// Create range from exclusive boundaries `[start, end)`.
    /// `end < start` is clamped to an empty range.
    #[must_use]
    pub fn new(start: u64, end: u64) -> Self {
        Self {
            start,
            end: end.max(start),
        }
    }

    /// Create range from inclusive boundaries `[start, end_inclusive]`.
    #[must_use]
    #[allow(clippy::range_plus_one)]
    pub fn from_inclusive(start: u64, end_inclusive: u64) -> Self {
        Self::new(start, end_inclusive.saturating_add(1))
    }

    /// Single-element range `[seq, seq+1)`.
    #[must_use]
    pub fn from_sequence(seq: u64) -> Self {
        Self::new(seq, seq + 1)
    }

    /// Sequences strictly between `last_seen` and `next_seq`: `[last_seen+1, next_seq)`.
    #[must_use]
    pub fn from_gap(last_seen: u64, next_seq: u64) -> Self {
        Self::new(last_seen + 1, next_seq)
    }

    #[must_use]
    pub fn start(&self) -> u64 {
        self.start
    }

    #[must_use]
    pub fn end(&self) -> u64 {
        self.end
    }

    #[must_use]
    pub fn contains(&self, seq: u64) -> bool {
        self.start <= seq && seq < self.end
    }

    #[must_use]
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// Iterate sequences in range.
    pub fn iter(&self) -> Range<u64> {
        self.start..self.end
    }

    /// Collapse a sorted, deduplicated list of sequences into maximal ranges.
    #[must_use]
    pub fn coalesce(sorted: &[u64]) -> Vec<RtpsRange> {
        let mut out: Vec<RtpsRange> = Vec::new();
        for &seq in sorted {
            match out.last_mut() {
                Some(last) if last.end == seq => last.end = seq + 1,
                _ => out.push(RtpsRange::from_sequence(seq)),
            }
        }
        out
    }
}

impl From<Range<u64>> for RtpsRange {
    fn from(range: Range<u64>) -> Self {
        Self::new(range.start, range.end)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rtps_range_new() {
        let r = RtpsRange::new(10, 20);
        assert_eq!(r.start(), 10);
        assert_eq!(r.end(), 20);
        assert_eq!(r.len(), 10);
        assert!(RtpsRange::new(5, 3).is_empty());
    }

    #[test]
    fn test_rtps_range_from_inclusive_and_gap() {
        assert_eq!(RtpsRange::from_inclusive(10, 15), RtpsRange::new(10, 16));
        let gap = RtpsRange::from_gap(10, 15);
        assert_eq!(gap.iter().collect::<Vec<_>>(), vec![11, 12, 13, 14]);
        assert!(RtpsRange::from_gap(10, 11).is_empty());
    }

    #[test]
    fn test_coalesce() {
        let ranges = RtpsRange::coalesce(&[1, 2, 3, 7, 9, 10]);
        assert_eq!(
            ranges,
            vec![
                RtpsRange::new(1, 4),
                RtpsRange::new(7, 8),
                RtpsRange::new(9, 11)
            ]
        );
        assert!(RtpsRange::coalesce(&[]).is_empty());
    }
}
