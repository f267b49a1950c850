// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Reliable QoS protocol engine.
//!
//! Endpoint state machines sit on top of plain-data building blocks:
//!
//! - `history_cache`: per-endpoint ordered store of changes
//! - `reader_proxy` / `writer_proxy`: per-remote-peer acknowledgment state
//! - `fragment`: DATA_FRAG splitting and reassembly
//! - `messages`: wire codec for the RTPS submessages the engine exchanges
//! - `writer` / `reader`: StatefulWriter and StatefulReader
//!
//! # Architecture
//!
//! ```text
//!   app ─write()─▶ StatefulWriter ──DATA/HEARTBEAT/GAP──▶ transport ──▶ StatefulReader ─take()─▶ app
//!                   │ history                                            │ writer proxies
//!                   │ reader proxies ◀──────────ACKNACK/NACK_FRAG────────┘
//!                   └ nack response / heartbeat events (scheduler thread)
//! ```
//!
//! Endpoints build outbound submessages while holding their own lock and
//! send them after releasing it.

pub mod fragment;
pub mod history_cache;
pub mod messages;
pub mod metrics;
pub mod reader;
pub mod reader_proxy;
pub mod rtps_range;
pub mod seq;
pub mod writer;
pub mod writer_proxy;

pub use fragment::{AssemblerStats, CompletedSample, FragmentAssembler, Fragmenter};
pub use history_cache::SampleHistory;
pub use messages::{
    AckNack, Data, DataFrag, FragmentNumberSet, Gap, Heartbeat, HeartbeatFrag, NackFrag,
    RtpsMessage, SequenceNumberSet, Submessage,
};
pub use metrics::{MetricsSnapshot, ReliableMetrics};
pub use reader::{ReaderEvent, StatefulReader};
pub use reader_proxy::{AckNackOutcome, ChangeForReaderStatus, ReaderProxy};
pub use rtps_range::RtpsRange;
pub use seq::SeqNumGenerator;
pub use writer::{StatefulWriter, WriterEvent};
pub use writer_proxy::{HeartbeatOutcome, WriterProxy};

use crate::core::guid::{Guid, GuidPrefix};
use crate::qos::QosProfile;
use crate::transport::{Locator, MessageSender};

/// Remote endpoint as announced by discovery.
#[derive(Debug, Clone)]
pub struct RemoteEndpoint {
    pub guid: Guid,
    pub locators: Vec<Locator>,
    pub qos: QosProfile,
}

impl RemoteEndpoint {
    #[must_use]
    pub fn new(guid: Guid, locators: Vec<Locator>, qos: QosProfile) -> Self {
        Self {
            guid,
            locators,
            qos,
        }
    }
}

/// Submessages for one remote participant, built under the endpoint lock.
#[derive(Debug)]
pub(crate) struct Outbound {
    pub dest: GuidPrefix,
    pub locators: Vec<Locator>,
    pub submessages: Vec<Submessage>,
}

/// Hand every batch to the transport. Failures are logged, never surfaced:
/// the reliability protocol repairs whatever did not make it.
pub(crate) fn send_outbound(sender: &MessageSender, origin: Guid, outbound: Vec<Outbound>) {
    for out in outbound {
        if out.submessages.is_empty() {
            continue;
        }
        if let Err(e) = sender.send(out.dest, &out.locators, &out.submessages) {
            log::warn!("[send_outbound] {} -> {}: {}", origin, out.dest, e);
        }
    }
}
