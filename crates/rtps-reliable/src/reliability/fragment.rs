// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Sample fragmentation (DATA_FRAG) and reassembly.
//!
//! - **Fragmenter**: decides whether a change fits one DATA and cuts it into
//!   numbered fragments (1-based) otherwise
//! - **FragmentAssembler**: per (writer GUID, sequence number) buffers that
//!   collect fragments until the sample is complete
//!
//! Fragment numbers are the "virtual" slots NACK_FRAG requests; a reader
//! asks for the fragments it lacks, the writer resends only those.

use super::messages::{fragment_count, DataFrag, FragmentNumberSet};
use crate::config::{
    DATA_FRAG_OVERHEAD, DATA_OVERHEAD, DEFAULT_FRAGMENT_TIMEOUT, DEFAULT_MAX_PENDING_REASSEMBLIES,
    DEFAULT_MAX_SAMPLE_SIZE, MAX_BITMAP_BITS,
};
use crate::core::change::{CacheChange, ChangeKind, InstanceKey, KEYLESS};
use crate::core::guid::{EntityId, Guid};
use lru::LruCache;
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::ops::Range;
use std::time::{Duration, Instant};

// ============================================================================
// Fragmenter (Sender Side)
// ============================================================================

/// Splits changes that do not fit one message.
#[derive(Debug, Clone, Copy)]
pub struct Fragmenter {
    max_message_size: usize,
    fragment_size: u16,
}

impl Fragmenter {
    /// Fragment size is the message budget minus framing, rounded down to 4 bytes.
    #[must_use]
    pub fn new(max_message_size: usize) -> Self {
        let raw = max_message_size.saturating_sub(DATA_FRAG_OVERHEAD);
        let capped = raw.min(usize::from(u16::MAX)) / 4 * 4;
        Self {
            max_message_size,
            fragment_size: capped.max(4) as u16,
        }
    }

    #[must_use]
    pub fn fragment_size(&self) -> u16 {
        self.fragment_size
    }

    /// Whether a payload of `len` bytes needs DATA_FRAG.
    #[must_use]
    pub fn needs_fragmentation(&self, len: usize) -> bool {
        len + DATA_OVERHEAD > self.max_message_size
    }

    /// Number of fragments for a payload of `len` bytes.
    #[must_use]
    pub fn fragment_count(&self, len: usize) -> u32 {
        fragment_count(len, usize::from(self.fragment_size))
    }

    /// Byte range of fragment `number` (1-based) within a payload of `len` bytes.
    #[must_use]
    pub fn fragment_range(&self, len: usize, number: u32) -> Range<usize> {
        let size = usize::from(self.fragment_size);
        let start = (number.saturating_sub(1) as usize * size).min(len);
        start..(start + size).min(len)
    }

    /// DATA_FRAG carrying fragment `number` of `change`.
    #[must_use]
    pub fn data_frag(&self, change: &CacheChange, reader_id: EntityId, number: u32) -> DataFrag {
        let range = self.fragment_range(change.payload.len(), number);
        DataFrag {
            reader_id,
            writer_id: change.writer_guid.entity_id,
            writer_sn: change.sequence_number,
            fragment_starting_num: number,
            fragments_in_submessage: 1,
            fragment_size: self.fragment_size,
            sample_size: change.payload.len() as u32,
            key_hash: key_hash_of(change),
            kind: change.kind,
            payload: change.payload[range].to_vec(),
        }
    }
}

/// Key hash carried inline (omitted for keyless topics).
#[must_use]
pub fn key_hash_of(change: &CacheChange) -> Option<InstanceKey> {
    if change.instance_key == KEYLESS {
        None
    } else {
        Some(change.instance_key)
    }
}

// ============================================================================
// FragmentAssembler (Receiver Side)
// ============================================================================

/// A sample rebuilt from its fragments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedSample {
    pub writer_guid: Guid,
    pub sequence_number: u64,
    pub key_hash: Option<InstanceKey>,
    pub kind: ChangeKind,
    pub payload: Vec<u8>,
}

impl CompletedSample {
    /// Turn into a CacheChange owned by the receiving reader.
    #[must_use]
    pub fn into_change(self) -> CacheChange {
        CacheChange {
            writer_guid: self.writer_guid,
            sequence_number: self.sequence_number,
            instance_key: self.key_hash.unwrap_or(KEYLESS),
            kind: self.kind,
            payload: self.payload.into(),
            source_timestamp: None,
        }
    }
}

/// Fragments are kept sparse, keyed by fragment number, so memory follows
/// what actually arrived rather than the announced sample size.
#[derive(Debug)]
struct Reassembly {
    sample_size: usize,
    fragment_size: usize,
    total: u32,
    fragments: HashMap<u32, Vec<u8>>,
    key_hash: Option<InstanceKey>,
    kind: ChangeKind,
    started_at: Instant,
}

impl Reassembly {
    fn new(frag: &DataFrag, now: Instant) -> Self {
        Self {
            sample_size: frag.sample_size as usize,
            fragment_size: usize::from(frag.fragment_size),
            total: frag.fragment_count(),
            fragments: HashMap::new(),
            key_hash: frag.key_hash,
            kind: frag.kind,
            started_at: now,
        }
    }

    fn matches(&self, frag: &DataFrag) -> bool {
        self.sample_size == frag.sample_size as usize
            && self.fragment_size == usize::from(frag.fragment_size)
    }

    fn insert(&mut self, frag: &DataFrag) {
        for i in 0..u32::from(frag.fragments_in_submessage) {
            let number = frag.fragment_starting_num + i;
            if number == 0 || number > self.total {
                break;
            }
            let offset = (number - 1) as usize * self.fragment_size;
            let len = self.fragment_size.min(self.sample_size - offset);
            let src_at = i as usize * self.fragment_size;
            let Some(src) = frag.payload.get(src_at..src_at + len) else {
                break;
            };
            self.fragments.entry(number).or_insert_with(|| src.to_vec());
        }
        if frag.key_hash.is_some() {
            self.key_hash = frag.key_hash;
        }
    }

    fn is_complete(&self) -> bool {
        self.fragments.len() == self.total as usize
    }

    fn reassemble(mut self) -> Vec<u8> {
        let mut payload = Vec::with_capacity(self.sample_size);
        for number in 1..=self.total {
            if let Some(bytes) = self.fragments.remove(&number) {
                payload.extend_from_slice(&bytes);
            }
        }
        payload
    }

    fn missing(&self) -> FragmentNumberSet {
        let first = (1..=self.total)
            .find(|n| !self.fragments.contains_key(n))
            .unwrap_or(self.total + 1);
        let last = self.total.min(first.saturating_add(MAX_BITMAP_BITS - 1));
        let missing = (first..=last).filter(|n| !self.fragments.contains_key(n));
        FragmentNumberSet::from_fragments(first, missing)
    }
}

/// Reassembler statistics.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct AssemblerStats {
    pub fragments_received: u64,
    pub samples_completed: u64,
    pub buffers_evicted: u64,
    pub buffers_expired: u64,
    /// DATA_FRAGs announcing an empty or oversized sample.
    pub fragments_rejected: u64,
}

/// Bounded set of in-progress reassemblies for one reader.
pub struct FragmentAssembler {
    buffers: LruCache<(Guid, u64), Reassembly>,
    timeout: Duration,
    max_sample_size: usize,
    stats: AssemblerStats,
}

impl FragmentAssembler {
    /// `capacity` bounds concurrent partial samples (least recently touched evicted first).
    #[must_use]
    pub fn new(capacity: usize, timeout: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            buffers: LruCache::new(capacity),
            timeout,
            max_sample_size: DEFAULT_MAX_SAMPLE_SIZE,
            stats: AssemblerStats::default(),
        }
    }

    /// Refuse samples announced larger than `bytes`.
    #[must_use]
    pub fn with_max_sample_size(mut self, bytes: usize) -> Self {
        self.max_sample_size = bytes;
        self
    }

    /// Add one DATA_FRAG. Returns the sample once every fragment arrived.
    ///
    /// A sample announced as a single fragment completes immediately.
    pub fn add_fragment(
        &mut self,
        writer_guid: Guid,
        frag: &DataFrag,
        now: Instant,
    ) -> Option<CompletedSample> {
        self.stats.fragments_received += 1;
        let sample_size = frag.sample_size as usize;
        if sample_size == 0 || frag.fragment_size == 0 || sample_size > self.max_sample_size {
            self.stats.fragments_rejected += 1;
            log::debug!(
                "[FragmentAssembler::add_fragment] {} seq={} rejected: sample_size={} limit={}",
                writer_guid,
                frag.writer_sn,
                sample_size,
                self.max_sample_size
            );
            return None;
        }
        let key = (writer_guid, frag.writer_sn);

        let replace = self.buffers.get(&key).is_some_and(|r| !r.matches(frag));
        if replace {
            log::warn!(
                "[FragmentAssembler::add_fragment] geometry changed for {} seq={}, restarting",
                writer_guid,
                frag.writer_sn
            );
            self.buffers.pop(&key);
        }
        if !self.buffers.contains(&key) {
            let evicted = self.buffers.push(key, Reassembly::new(frag, now));
            if let Some(((guid, seq), _)) = evicted.filter(|(k, _)| *k != key) {
                self.stats.buffers_evicted += 1;
                log::debug!(
                    "[FragmentAssembler::add_fragment] evicted partial sample {} seq={}",
                    guid,
                    seq
                );
            }
        }

        let reassembly = self.buffers.get_mut(&key)?;
        reassembly.insert(frag);
        if !reassembly.is_complete() {
            return None;
        }
        let done = self.buffers.pop(&key)?;
        self.stats.samples_completed += 1;
        Some(CompletedSample {
            writer_guid,
            sequence_number: frag.writer_sn,
            key_hash: done.key_hash,
            kind: done.kind,
            payload: done.reassemble(),
        })
    }

    /// Fragments still missing for a partially received sample.
    #[must_use]
    pub fn missing_fragments(&self, writer_guid: Guid, seq: u64) -> Option<FragmentNumberSet> {
        self.buffers.peek(&(writer_guid, seq)).map(Reassembly::missing)
    }

    /// Sequence numbers with a partial buffer for `writer_guid`, ascending.
    #[must_use]
    pub fn pending_samples(&self, writer_guid: Guid) -> Vec<u64> {
        let mut seqs: Vec<u64> = self
            .buffers
            .iter()
            .filter(|((guid, _), _)| *guid == writer_guid)
            .map(|((_, seq), _)| *seq)
            .collect();
        seqs.sort_unstable();
        seqs
    }

    #[must_use]
    pub fn contains(&self, writer_guid: Guid, seq: u64) -> bool {
        self.buffers.contains(&(writer_guid, seq))
    }

    /// Drop one partial sample (it will never complete).
    pub fn discard(&mut self, writer_guid: Guid, seq: u64) -> bool {
        self.buffers.pop(&(writer_guid, seq)).is_some()
    }

    /// Drop partial samples of `writer_guid` for which `done(seq)` holds.
    pub fn discard_where<F>(&mut self, writer_guid: Guid, mut done: F) -> usize
    where
        F: FnMut(u64) -> bool,
    {
        let stale: Vec<u64> = self
            .pending_samples(writer_guid)
            .into_iter()
            .filter(|seq| done(*seq))
            .collect();
        for seq in &stale {
            self.buffers.pop(&(writer_guid, *seq));
        }
        stale.len()
    }

    /// Drop every partial sample of `writer_guid`.
    pub fn discard_writer(&mut self, writer_guid: Guid) -> usize {
        self.discard_where(writer_guid, |_| true)
    }

    /// Drop partial samples older than the timeout.
    pub fn evict_expired(&mut self, now: Instant) -> usize {
        let timeout = self.timeout;
        let expired: Vec<(Guid, u64)> = self
            .buffers
            .iter()
            .filter(|(_, r)| now.saturating_duration_since(r.started_at) >= timeout)
            .map(|(k, _)| *k)
            .collect();
        for key in &expired {
            self.buffers.pop(key);
        }
        self.stats.buffers_expired += expired.len() as u64;
        expired.len()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    #[must_use]
    pub fn stats(&self) -> AssemblerStats {
        self.stats
    }
}

impl Default for FragmentAssembler {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PENDING_REASSEMBLIES, DEFAULT_FRAGMENT_TIMEOUT)
    }
}

impl std::fmt::Debug for FragmentAssembler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FragmentAssembler")
            .field("pending", &self.buffers.len())
            .field("timeout", &self.timeout)
            .field("max_sample_size", &self.max_sample_size)
            .field("stats", &self.stats)
            .finish()
    }
}
