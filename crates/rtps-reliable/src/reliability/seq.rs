// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Sequence number space for one writer.
//!
//! Sequence numbers start at 1 and are never reused. The writer assigns them
//! under its endpoint lock, so `reserve`/`commit` is a two-step protocol: a
//! number only counts as used once the history accepted the change, which
//! keeps the announced range free of holes caused by rejected writes.

/// `SEQUENCENUMBER_UNKNOWN` on the wire (high = -1, low = 0).
pub const SEQUENCE_NUMBER_UNKNOWN: i64 = -(1 << 32);

/// Per-writer sequence number allocator.
#[derive(Debug, Default, Clone)]
pub struct SeqNumGenerator {
    last: u64,
}

impl SeqNumGenerator {
    /// Create a generator whose first number is 1.
    #[must_use]
    pub fn new() -> Self {
        Self { last: 0 }
    }

    /// Number the next accepted change will carry.
    #[must_use]
    pub fn reserve(&self) -> u64 {
        self.last + 1
    }

    /// Mark `seq` as used. Must be the value returned by `reserve()`.
    pub fn commit(&mut self, seq: u64) {
        debug_assert_eq!(seq, self.last + 1, "sequence numbers are committed in order");
        self.last = seq;
    }

    /// Highest number handed out (0 before the first write).
    #[must_use]
    pub fn last(&self) -> u64 {
        self.last
    }
}

/// Split into the RTPS `(high: i32, low: u32)` wire pair.
#[must_use]
pub fn to_wire(seq: u64) -> (i32, u32) {
    ((seq >> 32) as i32, seq as u32)
}

/// Join an RTPS `(high, low)` wire pair. Negative values are invalid.
#[must_use]
pub fn from_wire(high: i32, low: u32) -> Option<u64> {
    if high < 0 {
        return None;
    }
    Some(((high as u64) << 32) | u64::from(low))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seqgen_starts_at_one() {
        let mut gen = SeqNumGenerator::new();
        assert_eq!(gen.last(), 0);
        assert_eq!(gen.reserve(), 1, "First sequence number should be 1");
        gen.commit(1);
        assert_eq!(gen.reserve(), 2);
    }

    #[test]
    fn test_reserve_without_commit_is_reused() {
        let gen = SeqNumGenerator::new();
        assert_eq!(gen.reserve(), gen.reserve());
    }

    #[test]
    fn test_wire_split() {
        let seq = (7u64 << 32) | 42;
        let (high, low) = to_wire(seq);
        assert_eq!((high, low), (7, 42));
        assert_eq!(from_wire(high, low), Some(seq));
        assert_eq!(from_wire(-1, 0), None);
    }
}
