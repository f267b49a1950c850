// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! WriterProxy: reader-side bookkeeping for one matched remote writer.
//!
//! Tracks `available_up_to` (highest sequence number below which every
//! change was either delivered or declared irrelevant), a buffer of changes
//! that arrived ahead of a hole, and the irrelevant ranges announced by GAP
//! or by a HEARTBEAT whose `first_sn` moved past what we have.
//!
//! The missing set is derived, never stored:
//! `missing = (available_up_to, max_known] - pending - irrelevant`.

use super::messages::SequenceNumberSet;
use super::rtps_range::RtpsRange;
use crate::config::DEFAULT_MAX_OUT_OF_ORDER;
use crate::core::change::CacheChange;
use crate::core::guid::Guid;
use crate::core::timed_event::EventHandle;
use crate::transport::Locator;
use std::collections::BTreeMap;

/// Changes released by a HEARTBEAT.
#[derive(Debug, Default)]
pub struct HeartbeatOutcome {
    /// Sequence numbers the writer no longer offers and we never received.
    pub lost: u64,
    /// Changes made deliverable, in order.
    pub delivered: Vec<CacheChange>,
}

/// Reader-side mirror of one remote writer.
#[derive(Debug)]
pub struct WriterProxy {
    pub guid: Guid,
    pub locators: Vec<Locator>,
    reliable: bool,
    available_up_to: u64,
    pending: BTreeMap<u64, CacheChange>,
    max_pending: usize,
    /// Irrelevant ranges above `available_up_to`: start -> end (exclusive).
    irrelevant: BTreeMap<u64, u64>,
    max_known: u64,
    last_heartbeat_count: Option<u32>,
    acknack_count: u32,
    nack_frag_count: u32,
    pub(crate) heartbeat_response: Option<EventHandle>,
}

impl WriterProxy {
    #[must_use]
    pub fn new(guid: Guid, locators: Vec<Locator>, reliable: bool) -> Self {
        Self {
            guid,
            locators,
            reliable,
            available_up_to: 0,
            pending: BTreeMap::new(),
            max_pending: DEFAULT_MAX_OUT_OF_ORDER,
            irrelevant: BTreeMap::new(),
            max_known: 0,
            last_heartbeat_count: None,
            acknack_count: 0,
            nack_frag_count: 0,
            heartbeat_response: None,
        }
    }

    /// Bound the out-of-order buffer. Changes that do not fit are dropped
    /// and stay missing, so the writer resends them later.
    #[must_use]
    pub fn with_max_pending(mut self, max_pending: usize) -> Self {
        self.max_pending = max_pending.max(1);
        self
    }

    #[must_use]
    pub fn is_reliable(&self) -> bool {
        self.reliable
    }

    /// Highest sequence number with nothing missing at or below it.
    #[must_use]
    pub fn available_up_to(&self) -> u64 {
        self.available_up_to
    }

    /// Highest sequence number seen or announced.
    #[must_use]
    pub fn max_known(&self) -> u64 {
        self.max_known
    }

    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    #[must_use]
    pub fn is_irrelevant(&self, seq: u64) -> bool {
        (seq <= self.available_up_to && !self.pending.contains_key(&seq))
            || self
                .irrelevant
                .range(..=seq)
                .next_back()
                .is_some_and(|(_, end)| seq < *end)
    }

    /// Whether `seq` was already delivered or skipped.
    #[must_use]
    pub fn is_duplicate(&self, seq: u64) -> bool {
        seq <= self.available_up_to || self.pending.contains_key(&seq)
    }

    /// Accept a change. Returns the changes deliverable now, in order.
    ///
    /// Reliable: buffers until every predecessor arrived or was declared
    /// irrelevant. Best-effort: delivers anything newer than the last one.
    pub fn received_change(&mut self, change: CacheChange) -> Vec<CacheChange> {
        let seq = change.sequence_number;
        if seq <= self.available_up_to {
            return Vec::new();
        }
        self.max_known = self.max_known.max(seq);

        if !self.reliable {
            self.available_up_to = seq;
            self.irrelevant.clear();
            return vec![change];
        }
        if self.is_irrelevant(seq) || self.pending.contains_key(&seq) {
            return Vec::new();
        }
        if self.pending.len() >= self.max_pending && seq != self.available_up_to + 1 {
            // Keep the changes closest to the hole.
            match self.pending.keys().next_back().copied() {
                Some(highest) if highest > seq => {
                    self.pending.remove(&highest);
                }
                _ => return Vec::new(),
            }
        }
        self.pending.insert(seq, change);
        self.advance()
    }

    /// Apply GAP ranges. Returns changes released by the skip.
    pub fn process_gap(&mut self, ranges: &[RtpsRange]) -> Vec<CacheChange> {
        for range in ranges {
            self.mark_irrelevant(*range);
        }
        self.advance()
    }

    /// Everything below `first_sn` is no longer offered by the writer.
    pub fn lost_changes_update(&mut self, first_sn: u64) -> HeartbeatOutcome {
        let range = RtpsRange::new(self.available_up_to + 1, first_sn);
        if range.is_empty() {
            return HeartbeatOutcome::default();
        }
        let received = self.pending.range(range.start()..range.end()).count() as u64;
        let lost = range.len() - received - self.irrelevant_within(range);
        self.mark_irrelevant(range);
        HeartbeatOutcome {
            lost,
            delivered: self.advance(),
        }
    }

    /// Apply a HEARTBEAT. Returns `None` for stale counts.
    pub fn process_heartbeat(
        &mut self,
        first_sn: u64,
        last_sn: u64,
        count: u32,
    ) -> Option<HeartbeatOutcome> {
        if self.last_heartbeat_count.is_some_and(|last| count <= last) {
            return None;
        }
        self.last_heartbeat_count = Some(count);
        self.max_known = self.max_known.max(last_sn);
        Some(self.lost_changes_update(first_sn))
    }

    /// Missing sequence numbers, ascending, at most `limit` of them.
    #[must_use]
    pub fn missing_changes(&self, limit: usize) -> Vec<u64> {
        let mut out = Vec::new();
        let mut seq = self.available_up_to + 1;
        while seq <= self.max_known && out.len() < limit {
            if let Some((_, end)) = self
                .irrelevant
                .range(..=seq)
                .next_back()
                .filter(|(_, end)| seq < **end)
            {
                seq = *end;
                continue;
            }
            if !self.pending.contains_key(&seq) {
                out.push(seq);
            }
            seq += 1;
        }
        out
    }

    #[must_use]
    pub fn has_missing(&self) -> bool {
        !self.missing_changes(1).is_empty()
    }

    /// ACKNACK state: base = `available_up_to + 1`, bits = missing within 256.
    #[must_use]
    pub fn acknack_set(&self) -> SequenceNumberSet {
        let base = self.available_up_to + 1;
        let window = base + u64::from(SequenceNumberSet::MAX_BITS);
        let missing = self
            .missing_changes(SequenceNumberSet::MAX_BITS as usize)
            .into_iter()
            .filter(|s| *s < window);
        SequenceNumberSet::from_sequences(base, missing)
    }

    /// Next ACKNACK count (starts at 1).
    pub fn next_acknack_count(&mut self) -> u32 {
        self.acknack_count = self.acknack_count.wrapping_add(1);
        self.acknack_count
    }

    /// Next NACK_FRAG count (starts at 1).
    pub fn next_nack_frag_count(&mut self) -> u32 {
        self.nack_frag_count = self.nack_frag_count.wrapping_add(1);
        self.nack_frag_count
    }

    fn mark_irrelevant(&mut self, range: RtpsRange) {
        let range = RtpsRange::new(range.start().max(self.available_up_to + 1), range.end());
        if range.is_empty() {
            return;
        }
        self.max_known = self.max_known.max(range.end() - 1);
        // Keep ranges disjoint: merge everything overlapping or adjacent.
        let (mut start, mut end) = (range.start(), range.end());
        let touching: Vec<(u64, u64)> = self
            .irrelevant
            .range(..=end)
            .filter(|(_, e)| **e >= start)
            .map(|(s, e)| (*s, *e))
            .collect();
        for (s, e) in touching {
            self.irrelevant.remove(&s);
            start = start.min(s);
            end = end.max(e);
        }
        self.irrelevant.insert(start, end);
    }

    fn irrelevant_within(&self, range: RtpsRange) -> u64 {
        let mut covered = 0;
        let mut cursor = range.start();
        for (&start, &end) in &self.irrelevant {
            let s = start.max(cursor);
            let e = end.min(range.end());
            if s < e {
                // Pending changes inside an irrelevant range were counted as received.
                let received = self.pending.range(s..e).count() as u64;
                covered += e - s - received;
                cursor = e;
            }
        }
        covered
    }

    /// Move `available_up_to` forward over received and irrelevant changes.
    fn advance(&mut self) -> Vec<CacheChange> {
        let mut out = Vec::new();
        loop {
            let next = self.available_up_to + 1;
            if let Some(change) = self.pending.remove(&next) {
                self.available_up_to = next;
                out.push(change);
                continue;
            }
            let skip_to = self
                .irrelevant
                .range(..=next)
                .next_back()
                .map(|(_, end)| *end)
                .filter(|end| *end > next);
            match skip_to {
                Some(end) => {
                    // Changes we already hold inside the skipped span stay deliverable.
                    let held: Vec<u64> = self.pending.range(next..end).map(|(s, _)| *s).collect();
                    for seq in held {
                        if let Some(change) = self.pending.remove(&seq) {
                            out.push(change);
                        }
                    }
                    self.available_up_to = end - 1;
                }
                None => break,
            }
        }
        let floor = self.available_up_to;
        self.irrelevant.retain(|_, end| *end > floor + 1);
        out
    }
}
