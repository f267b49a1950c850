// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Shared helpers: two participants on one in-process hub, wired together
//! the way discovery would.

#![allow(dead_code)]

use rtps_reliable::reliability::messages::{RtpsMessage, Submessage};
use rtps_reliable::{
    DomainContext, IntraProcessHub, Participant, QosProfile, StatefulReader, StatefulWriter,
};
use std::sync::Arc;
use std::time::{Duration, Instant};

pub struct Pair {
    pub domain: DomainContext,
    pub hub: Arc<IntraProcessHub>,
    pub publisher: Arc<Participant>,
    pub subscriber: Arc<Participant>,
}

impl Pair {
    pub fn new() -> Self {
        Self::with_hub(IntraProcessHub::new())
    }

    pub fn with_hub(hub: Arc<IntraProcessHub>) -> Self {
        let domain = DomainContext::new(0).expect("domain");
        let publisher = domain.create_participant(hub.clone()).expect("publisher");
        let subscriber = domain.create_participant(hub.clone()).expect("subscriber");
        Self {
            domain,
            hub,
            publisher,
            subscriber,
        }
    }

    pub fn writer(&self, qos: QosProfile) -> Arc<StatefulWriter> {
        self.publisher.create_writer(qos).expect("writer")
    }

    pub fn reader(&self, qos: QosProfile) -> Arc<StatefulReader> {
        self.subscriber.create_reader(qos).expect("reader")
    }

    /// Match both sides, reader first so nothing the writer sends on match is lost.
    pub fn connect(&self, writer: &StatefulWriter, reader: &StatefulReader) {
        let w = self.publisher.describe(writer.guid()).expect("local writer");
        let r = self.subscriber.describe(reader.guid()).expect("local reader");
        self.subscriber
            .on_matched(reader.guid(), w)
            .expect("reader matches writer");
        self.publisher
            .on_matched(writer.guid(), r)
            .expect("writer matches reader");
    }
}

/// Poll `cond` until it holds or `timeout` elapses.
pub fn wait_until<F: FnMut() -> bool>(timeout: Duration, mut cond: F) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    cond()
}

/// Take samples until `count` arrived or `timeout` elapses.
pub fn collect(reader: &StatefulReader, count: usize, timeout: Duration) -> Vec<u64> {
    let deadline = Instant::now() + timeout;
    let mut seqs = Vec::new();
    while seqs.len() < count {
        let left = deadline.saturating_duration_since(Instant::now());
        if left.is_zero() || !reader.wait_for_data(left) {
            break;
        }
        seqs.extend(reader.take_all().iter().map(|c| c.sequence_number));
    }
    seqs
}

/// DATA sequence numbers carried by one encoded message.
pub fn data_seqs(bytes: &[u8]) -> Vec<u64> {
    RtpsMessage::decode(bytes)
        .map(|msg| {
            msg.submessages
                .iter()
                .filter_map(|s| match s {
                    Submessage::Data(d) => Some(d.writer_sn),
                    _ => None,
                })
                .collect()
        })
        .unwrap_or_default()
}
