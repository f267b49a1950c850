// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Metrics for Reliable QoS
//!
//! Tracks protocol traffic, retransmissions and loss for one endpoint.
//!
//! # Thread Safety
//!
//! All methods use atomic operations (Relaxed ordering) for lock-free updates.
//! `snapshot()` is not a consistent cut across counters; each value is exact
//! on its own.

use std::sync::atomic::{AtomicU64, Ordering};

/// Reliable QoS metrics collector.
#[derive(Debug, Default)]
pub struct ReliableMetrics {
    data_sent: AtomicU64,
    data_received: AtomicU64,
    retransmissions: AtomicU64,
    fragments_resent: AtomicU64,
    heartbeats_sent: AtomicU64,
    heartbeats_received: AtomicU64,
    acknacks_sent: AtomicU64,
    acknacks_received: AtomicU64,
    gaps_sent: AtomicU64,
    gaps_received: AtomicU64,
    nacks_suppressed: AtomicU64,
    samples_lost: AtomicU64,
    duplicates_dropped: AtomicU64,
    flow_deferrals: AtomicU64,
    malformed_dropped: AtomicU64,
}

/// Plain copy of every counter.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub data_sent: u64,
    pub data_received: u64,
    pub retransmissions: u64,
    pub fragments_resent: u64,
    pub heartbeats_sent: u64,
    pub heartbeats_received: u64,
    pub acknacks_sent: u64,
    pub acknacks_received: u64,
    pub gaps_sent: u64,
    pub gaps_received: u64,
    pub nacks_suppressed: u64,
    pub samples_lost: u64,
    pub duplicates_dropped: u64,
    pub flow_deferrals: u64,
    pub malformed_dropped: u64,
}

macro_rules! counters {
    ($($field:ident => $inc:ident),* $(,)?) => {
        impl ReliableMetrics {
            $(
                pub fn $inc(&self, n: u64) {
                    self.$field.fetch_add(n, Ordering::Relaxed);
                }
            )*

            /// Copy every counter.
            #[must_use]
            pub fn snapshot(&self) -> MetricsSnapshot {
                MetricsSnapshot {
                    $($field: self.$field.load(Ordering::Relaxed),)*
                }
            }

            /// Reset every counter to zero.
            pub fn reset(&self) {
                $(self.$field.store(0, Ordering::Relaxed);)*
            }
        }
    };
}

counters! {
    data_sent => add_data_sent,
    data_received => add_data_received,
    retransmissions => add_retransmissions,
    fragments_resent => add_fragments_resent,
    heartbeats_sent => add_heartbeats_sent,
    heartbeats_received => add_heartbeats_received,
    acknacks_sent => add_acknacks_sent,
    acknacks_received => add_acknacks_received,
    gaps_sent => add_gaps_sent,
    gaps_received => add_gaps_received,
    nacks_suppressed => add_nacks_suppressed,
    samples_lost => add_samples_lost,
    duplicates_dropped => add_duplicates_dropped,
    flow_deferrals => add_flow_deferrals,
    malformed_dropped => add_malformed_dropped,
}

impl ReliableMetrics {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}
