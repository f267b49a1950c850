// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! History cache: the ordered store of CacheChanges owned by one endpoint.
//!
//! Changes are keyed by sequence number; proxies only ever hold sequence
//! numbers and look changes up here, so eviction never leaves a dangling
//! reference behind. Enforces QoS History and ResourceLimits:
//! - KEEP_LAST(depth): oldest change of the same instance is evicted
//! - KEEP_ALL: insert is rejected once a bound is reached (the writer
//!   decides whether to block, reclaim or fail)
//!
//! The cache is plain data: the owning endpoint serializes access with
//! its own lock.

use crate::core::change::{CacheChange, InstanceKey};
use crate::error::{Error, Result};
use crate::qos::{History, QosProfile, ResourceLimits, LENGTH_UNLIMITED};
use std::collections::{BTreeMap, HashMap, VecDeque};

/// Ordered, bounded store of changes for one local endpoint.
#[derive(Debug)]
pub struct SampleHistory {
    changes: BTreeMap<u64, CacheChange>,
    /// Sequence numbers per instance, ascending.
    instances: HashMap<InstanceKey, VecDeque<u64>>,
    history: History,
    limits: ResourceLimits,
    last_added: u64,
}

impl SampleHistory {
    #[must_use]
    pub fn new(history: History, limits: ResourceLimits) -> Self {
        Self {
            changes: BTreeMap::new(),
            instances: HashMap::new(),
            history,
            limits,
            last_added: 0,
        }
    }

    /// Create from an endpoint QoS profile.
    #[must_use]
    pub fn from_qos(qos: &QosProfile) -> Self {
        Self::new(qos.history, qos.resource_limits)
    }

    /// Maximum changes kept per instance.
    fn per_instance_bound(&self) -> usize {
        match self.history {
            History::KeepLast(depth) => (depth as usize).min(self.limits.max_samples_per_instance),
            History::KeepAll => self.limits.max_samples_per_instance,
        }
    }

    /// Insert `change`.
    ///
    /// Returns the change evicted to make room (KEEP_LAST only).
    ///
    /// # Errors
    /// - `SequenceRegression` if the sequence number is not above the last added
    /// - `ResourceExhausted` if a KEEP_ALL or resource bound is reached
    pub fn add(&mut self, change: CacheChange) -> Result<Option<CacheChange>> {
        let seq = change.sequence_number;
        if seq <= self.last_added {
            return Err(Error::SequenceRegression {
                last: self.last_added,
                got: seq,
            });
        }

        let key = change.instance_key;
        let instance_len = match self.instances.get(&key) {
            Some(seqs) => seqs.len(),
            None => {
                if self.limits.max_instances != LENGTH_UNLIMITED
                    && self.instances.len() >= self.limits.max_instances
                {
                    return Err(Error::ResourceExhausted(format!(
                        "max_instances={} reached",
                        self.limits.max_instances
                    )));
                }
                0
            }
        };

        let bound = self.per_instance_bound();
        let evict = instance_len >= bound;
        if evict && matches!(self.history, History::KeepAll) {
            return Err(Error::ResourceExhausted(format!(
                "max_samples_per_instance={} reached",
                bound
            )));
        }

        let len_after_evict = self.changes.len() - usize::from(evict);
        if self.limits.max_samples != LENGTH_UNLIMITED && len_after_evict >= self.limits.max_samples
        {
            return Err(Error::ResourceExhausted(format!(
                "max_samples={} reached",
                self.limits.max_samples
            )));
        }

        let evicted = if evict {
            let oldest = self
                .instances
                .get_mut(&key)
                .and_then(VecDeque::pop_front);
            oldest.and_then(|old| self.changes.remove(&old))
        } else {
            None
        };
        if let Some(old) = &evicted {
            log::trace!(
                "[SampleHistory::add] KEEP_LAST evicted seq={} for seq={}",
                old.sequence_number,
                seq
            );
        }

        self.instances.entry(key).or_default().push_back(seq);
        self.changes.insert(seq, change);
        self.last_added = seq;
        Ok(evicted)
    }

    /// Remove one change.
    pub fn remove(&mut self, seq: u64) -> Option<CacheChange> {
        let change = self.changes.remove(&seq)?;
        if let Some(seqs) = self.instances.get_mut(&change.instance_key) {
            seqs.retain(|s| *s != seq);
            if seqs.is_empty() {
                self.instances.remove(&change.instance_key);
            }
        }
        Some(change)
    }

    /// Remove every change with sequence number `<= seq`. Returns how many were removed.
    pub fn remove_up_to(&mut self, seq: u64) -> usize {
        let keep = self.changes.split_off(&seq.saturating_add(1));
        let removed = std::mem::replace(&mut self.changes, keep);
        for change in removed.values() {
            if let Some(seqs) = self.instances.get_mut(&change.instance_key) {
                while seqs.front().is_some_and(|s| *s <= seq) {
                    seqs.pop_front();
                }
            }
        }
        self.instances.retain(|_, seqs| !seqs.is_empty());
        removed.len()
    }

    #[must_use]
    pub fn get(&self, seq: u64) -> Option<&CacheChange> {
        self.changes.get(&seq)
    }

    #[must_use]
    pub fn contains(&self, seq: u64) -> bool {
        self.changes.contains_key(&seq)
    }

    /// Lowest sequence number present.
    #[must_use]
    pub fn min(&self) -> Option<u64> {
        self.changes.keys().next().copied()
    }

    /// Highest sequence number present.
    #[must_use]
    pub fn max(&self) -> Option<u64> {
        self.changes.keys().next_back().copied()
    }

    /// Highest sequence number ever accepted (survives removal).
    #[must_use]
    pub fn last_added(&self) -> u64 {
        self.last_added
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.changes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    /// True when a new change for a new instance would be rejected by `max_samples`.
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.limits.max_samples != LENGTH_UNLIMITED && self.changes.len() >= self.limits.max_samples
    }

    #[must_use]
    pub fn instance_count(&self) -> usize {
        self.instances.len()
    }

    /// Changes in ascending sequence order.
    pub fn iter(&self) -> impl Iterator<Item = &CacheChange> {
        self.changes.values()
    }

    /// Sequence numbers present, ascending.
    pub fn sequence_numbers(&self) -> impl Iterator<Item = u64> + '_ {
        self.changes.keys().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::change::KEYLESS;
    use crate::core::guid::Guid;

    fn change(seq: u64, key: u8) -> CacheChange {
        CacheChange::alive(Guid::default(), seq, [key; 16], &[seq as u8; 8])
    }

    #[test]
    fn test_keep_last_keeps_newest_per_instance() {
        let mut h = SampleHistory::new(History::KeepLast(2), ResourceLimits::default());
        for seq in 1..=5 {
            h.add(change(seq, 1)).expect("add should succeed");
        }
        assert_eq!(h.sequence_numbers().collect::<Vec<_>>(), vec![4, 5]);
        assert_eq!(h.min(), Some(4));
        assert_eq!(h.max(), Some(5));
    }

    #[test]
    fn test_keep_last_is_per_instance() {
        let mut h = SampleHistory::new(History::KeepLast(1), ResourceLimits::default());
        h.add(change(1, 1)).expect("add");
        h.add(change(2, 2)).expect("add");
        let evicted = h.add(change(3, 1)).expect("add");
        assert_eq!(evicted.map(|c| c.sequence_number), Some(1));
        assert_eq!(h.sequence_numbers().collect::<Vec<_>>(), vec![2, 3]);
        assert_eq!(h.instance_count(), 2);
    }

    #[test]
    fn test_rejects_sequence_regression() {
        let mut h = SampleHistory::new(History::KeepAll, ResourceLimits::default());
        h.add(change(5, 0)).expect("add");
        assert!(matches!(
            h.add(change(5, 0)),
            Err(Error::SequenceRegression { last: 5, got: 5 })
        ));
        assert!(h.add(change(3, 0)).is_err());
        h.remove(5);
        // Removal does not reopen old numbers
        assert!(h.add(change(4, 0)).is_err());
    }

    #[test]
    fn test_keep_all_bound_rejects() {
        let limits = ResourceLimits {
            max_samples: 2,
            ..ResourceLimits::default()
        };
        let mut h = SampleHistory::new(History::KeepAll, limits);
        h.add(change(1, 0)).expect("add");
        h.add(change(2, 0)).expect("add");
        assert!(h.is_full());
        assert!(matches!(h.add(change(3, 0)), Err(Error::ResourceExhausted(_))));
        assert_eq!(h.len(), 2);
        h.remove_up_to(1);
        h.add(change(3, 0)).expect("room after reclaim");
    }

    #[test]
    fn test_max_instances() {
        let limits = ResourceLimits {
            max_instances: 1,
            ..ResourceLimits::default()
        };
        let mut h = SampleHistory::new(History::KeepLast(4), limits);
        h.add(change(1, 1)).expect("add");
        assert!(h.add(change(2, 2)).is_err());
        h.add(change(3, 1)).expect("same instance is fine");
    }

    #[test]
    fn test_remove_up_to_updates_instances() {
        let mut h = SampleHistory::new(History::KeepAll, ResourceLimits::default());
        for seq in 1..=6 {
            h.add(change(seq, (seq % 2) as u8)).expect("add");
        }
        assert_eq!(h.remove_up_to(4), 4);
        assert_eq!(h.sequence_numbers().collect::<Vec<_>>(), vec![5, 6]);
        assert_eq!(h.instance_count(), 2);
        assert_eq!(h.remove_up_to(10), 2);
        assert!(h.is_empty());
        assert_eq!(h.instance_count(), 0);
        assert_eq!(h.last_added(), 6);
    }

    #[test]
    fn test_get_outside_range_is_none() {
        let mut h = SampleHistory::new(History::KeepLast(3), ResourceLimits::default());
        h.add(CacheChange::alive(Guid::default(), 2, KEYLESS, b"x"))
            .expect("add");
        assert!(h.get(1).is_none());
        assert!(h.get(3).is_none());
        assert_eq!(h.get(2).map(|c| c.len()), Some(1));
    }
}
