// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! ReaderProxy: writer-side bookkeeping for one matched remote reader.
//!
//! Per change state machine:
//!
//! ```text
//!   add_change          mark_sent                 ACKNACK base > seq
//!  ──────────▶ UNSENT ────────────▶ UNACKNOWLEDGED ───────────────────▶ (acknowledged)
//!                                     │      ▲
//!                        ACKNACK bit  ▼      │ resent
//!                                   REQUESTED
//! ```
//!
//! `UNDERWAY` is UNACKNOWLEDGED within `nack_suppression_duration` of its last
//! send: requests for it are ignored so a NACK racing the retransmission
//! does not trigger another one.
//!
//! The proxy is plain data. It stores sequence numbers only; the owning
//! writer looks changes up in its history and does all the sending.

use crate::core::guid::Guid;
use crate::core::timed_event::EventHandle;
use crate::qos::Durability;
use crate::transport::Locator;
use std::collections::{BTreeMap, BTreeSet};
use std::time::{Duration, Instant};

/// State of one change with respect to one reader.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChangeForReaderStatus {
    Unsent,
    /// Sent within the nack suppression window.
    Underway,
    Unacknowledged,
    Requested,
    Acknowledged,
}

#[derive(Debug, Clone)]
struct ChangeForReader {
    status: ChangeForReaderStatus,
    last_sent: Option<Instant>,
    requested_fragments: BTreeSet<u32>,
    /// First fragment not yet handed to the transport (paced sends).
    next_fragment: u32,
}

impl ChangeForReader {
    fn with_status(status: ChangeForReaderStatus) -> Self {
        Self {
            status,
            last_sent: None,
            requested_fragments: BTreeSet::new(),
            next_fragment: 1,
        }
    }
}

/// Result of applying a fresh ACKNACK.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AckNackOutcome {
    /// The acknowledged base moved forward.
    pub newly_acked: bool,
    /// Sequence numbers that became REQUESTED.
    pub requested: usize,
    /// Requests ignored because the change is UNDERWAY.
    pub suppressed: usize,
}

/// Writer-side mirror of one remote reader.
#[derive(Debug)]
pub struct ReaderProxy {
    pub guid: Guid,
    pub locators: Vec<Locator>,
    pub reliable: bool,
    pub durability: Durability,
    nack_suppression: Duration,
    changes: BTreeMap<u64, ChangeForReader>,
    /// Everything below this is acknowledged.
    acked_base: u64,
    last_acknack_count: Option<u32>,
    last_nack_frag_count: Option<u32>,
    last_activity: Instant,
    pub(crate) nack_response: Option<EventHandle>,
}

impl ReaderProxy {
    #[must_use]
    pub fn new(
        guid: Guid,
        locators: Vec<Locator>,
        reliable: bool,
        durability: Durability,
        nack_suppression: Duration,
    ) -> Self {
        Self {
            guid,
            locators,
            reliable,
            durability,
            nack_suppression,
            changes: BTreeMap::new(),
            acked_base: 1,
            last_acknack_count: None,
            last_nack_frag_count: None,
            last_activity: Instant::now(),
            nack_response: None,
        }
    }

    /// Track a new change as UNSENT.
    pub fn add_change(&mut self, seq: u64) {
        if seq < self.acked_base {
            return;
        }
        self.changes
            .entry(seq)
            .or_insert_with(|| ChangeForReader::with_status(ChangeForReaderStatus::Unsent));
    }

    /// The change left for the transport.
    ///
    /// Best-effort readers never acknowledge, so the entry is dropped.
    pub fn mark_sent(&mut self, seq: u64, now: Instant) {
        if !self.reliable {
            self.changes.remove(&seq);
            return;
        }
        if let Some(entry) = self.changes.get_mut(&seq) {
            entry.status = if self.nack_suppression.is_zero() {
                ChangeForReaderStatus::Unacknowledged
            } else {
                ChangeForReaderStatus::Underway
            };
            entry.last_sent = Some(now);
            entry.requested_fragments.clear();
            entry.next_fragment = 1;
        }
    }

    /// Apply an ACKNACK.
    ///
    /// Returns `None` for stale or replayed ACKNACKs (`count` not above the
    /// last one seen).
    pub fn process_acknack<I>(
        &mut self,
        ack_base: u64,
        requested: I,
        count: u32,
        now: Instant,
    ) -> Option<AckNackOutcome>
    where
        I: IntoIterator<Item = u64>,
    {
        if self.last_acknack_count.is_some_and(|last| count <= last) {
            return None;
        }
        self.last_acknack_count = Some(count);
        self.last_activity = now;

        let mut outcome = AckNackOutcome::default();
        if ack_base > self.acked_base {
            self.acked_base = ack_base;
            self.changes = self.changes.split_off(&ack_base);
            outcome.newly_acked = true;
        }

        for seq in requested {
            if seq < self.acked_base {
                continue;
            }
            let entry = self
                .changes
                .entry(seq)
                .or_insert_with(|| ChangeForReader::with_status(ChangeForReaderStatus::Unacknowledged));
            if entry.status == ChangeForReaderStatus::Underway
                && entry
                    .last_sent
                    .map_or(true, |t| now.saturating_duration_since(t) >= self.nack_suppression)
            {
                entry.status = ChangeForReaderStatus::Unacknowledged;
            }
            match entry.status {
                ChangeForReaderStatus::Unacknowledged => {
                    entry.status = ChangeForReaderStatus::Requested;
                    outcome.requested += 1;
                }
                ChangeForReaderStatus::Underway => outcome.suppressed += 1,
                // Unsent goes out anyway; Requested is already queued.
                _ => {}
            }
        }
        Some(outcome)
    }

    /// Apply a NACK_FRAG. Returns true when at least one fragment became requested.
    pub fn process_nack_frag<I>(&mut self, seq: u64, fragments: I, count: u32, now: Instant) -> bool
    where
        I: IntoIterator<Item = u32>,
    {
        if self.last_nack_frag_count.is_some_and(|last| count <= last) {
            return false;
        }
        self.last_nack_frag_count = Some(count);
        self.last_activity = now;
        if seq < self.acked_base {
            return false;
        }
        let entry = self
            .changes
            .entry(seq)
            .or_insert_with(|| ChangeForReader::with_status(ChangeForReaderStatus::Unacknowledged));
        let before = entry.requested_fragments.len();
        entry.requested_fragments.extend(fragments);
        entry.requested_fragments.len() > before
    }

    /// Status of `seq` for this reader.
    #[must_use]
    pub fn status(&self, seq: u64) -> ChangeForReaderStatus {
        if seq < self.acked_base {
            return ChangeForReaderStatus::Acknowledged;
        }
        match self.changes.get(&seq) {
            Some(entry) => entry.status,
            None => ChangeForReaderStatus::Acknowledged,
        }
    }

    fn with_status(&self, status: ChangeForReaderStatus) -> Vec<u64> {
        self.changes
            .iter()
            .filter(|(_, e)| e.status == status)
            .map(|(seq, _)| *seq)
            .collect()
    }

    #[must_use]
    pub fn unsent_changes(&self) -> Vec<u64> {
        self.with_status(ChangeForReaderStatus::Unsent)
    }

    /// Sent changes still waiting for acknowledgment (any sent state).
    #[must_use]
    pub fn unacknowledged_changes(&self) -> Vec<u64> {
        self.changes
            .iter()
            .filter(|(_, e)| e.status != ChangeForReaderStatus::Unsent)
            .map(|(seq, _)| *seq)
            .collect()
    }

    #[must_use]
    pub fn requested_changes(&self) -> Vec<u64> {
        self.with_status(ChangeForReaderStatus::Requested)
    }

    /// Drain fragment requests for changes that are not already being resent whole.
    pub fn take_requested_fragments(&mut self) -> Vec<(u64, Vec<u32>)> {
        self.changes
            .iter_mut()
            .filter(|(_, e)| {
                !e.requested_fragments.is_empty() && e.status != ChangeForReaderStatus::Requested
            })
            .map(|(seq, e)| {
                let frags = std::mem::take(&mut e.requested_fragments);
                (*seq, frags.into_iter().collect())
            })
            .collect()
    }

    /// Put back fragment requests the flow budget could not cover.
    pub fn requeue_fragments<I>(&mut self, seq: u64, fragments: I)
    where
        I: IntoIterator<Item = u32>,
    {
        if let Some(entry) = self.changes.get_mut(&seq) {
            entry.requested_fragments.extend(fragments);
        }
    }

    /// First fragment of `seq` not yet sent (paced fragment sends).
    #[must_use]
    pub fn next_fragment(&self, seq: u64) -> u32 {
        self.changes.get(&seq).map_or(1, |e| e.next_fragment)
    }

    pub fn set_next_fragment(&mut self, seq: u64, fragment: u32) {
        if let Some(entry) = self.changes.get_mut(&seq) {
            entry.next_fragment = fragment;
        }
    }

    /// Lowest sequence number this reader still needs.
    #[must_use]
    pub fn lowest_pending(&self) -> Option<u64> {
        self.changes.keys().next().copied()
    }

    /// Anything unsent, unacknowledged or requested.
    #[must_use]
    pub fn has_pending(&self) -> bool {
        !self.changes.is_empty()
    }

    #[must_use]
    pub fn has_unacknowledged(&self) -> bool {
        self.changes
            .values()
            .any(|e| e.status != ChangeForReaderStatus::Unsent)
    }

    /// Everything up to and including `seq` is acknowledged.
    #[must_use]
    pub fn is_acked(&self, seq: u64) -> bool {
        seq < self.acked_base || (!self.reliable && !self.changes.contains_key(&seq))
    }

    /// Everything below the returned value is acknowledged.
    #[must_use]
    pub fn acked_base(&self) -> u64 {
        self.acked_base
    }

    /// Forget one change (e.g. announced irrelevant through GAP before ever being sent).
    pub fn remove_change(&mut self, seq: u64) {
        self.changes.remove(&seq);
    }

    /// Reliable reader silent for longer than `lease` while owing acknowledgments.
    #[must_use]
    pub fn is_lease_expired(&self, now: Instant, lease: Duration) -> bool {
        self.reliable
            && self.has_unacknowledged()
            && now.saturating_duration_since(self.last_activity) > lease
    }

    /// Refresh liveliness without an ACKNACK (e.g. on match).
    pub fn touch(&mut self, now: Instant) {
        self.last_activity = now;
    }
}
