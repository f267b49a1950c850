// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Samples larger than one message travel as DATA_FRAG and are repaired
//! fragment by fragment.

#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]
#![allow(clippy::cast_possible_truncation)]

mod common;

use common::{wait_until, Pair};
use rtps_reliable::reliability::messages::{RtpsMessage, Submessage};
use rtps_reliable::{IntraProcessHub, QosProfile};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

const TIMEOUT: Duration = Duration::from_secs(5);

fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

/// `(writer_sn, fragment_starting_num)` of every DATA_FRAG in one message.
fn fragments(bytes: &[u8]) -> Vec<(u64, u32)> {
    RtpsMessage::decode(bytes)
        .map(|msg| {
            msg.submessages
                .iter()
                .filter_map(|s| match s {
                    Submessage::DataFrag(f) => Some((f.writer_sn, f.fragment_starting_num)),
                    _ => None,
                })
                .collect()
        })
        .unwrap_or_default()
}

#[test]
fn large_sample_is_reassembled() {
    let pair = Pair::with_hub(IntraProcessHub::with_max_message_size(1024));
    let writer = pair.writer(QosProfile::reliable().keep_all());
    let reader = pair.reader(QosProfile::reliable().keep_all());
    pair.connect(&writer, &reader);

    let sample = payload(10_000);
    writer.write(&sample).expect("write");

    assert!(reader.wait_for_data(TIMEOUT));
    let change = reader.take().expect("one sample");
    assert_eq!(change.sequence_number, 1);
    assert_eq!(&*change.payload, sample.as_slice());
    assert_eq!(reader.pending_reassemblies(), 0);
    assert!(pair.hub.stats().messages_sent >= 12);
}

#[test]
fn lost_fragment_is_resent_alone() {
    let hub = IntraProcessHub::with_max_message_size(1024);
    let dropped = AtomicBool::new(false);
    hub.set_drop_filter(move |_, bytes| {
        fragments(bytes).contains(&(1, 3)) && !dropped.swap(true, Ordering::SeqCst)
    });
    let pair = Pair::with_hub(hub);
    let writer = pair.writer(QosProfile::reliable().keep_all());
    let reader = pair.reader(QosProfile::reliable().keep_all());
    pair.connect(&writer, &reader);

    let sample = payload(10_000);
    writer.write(&sample).expect("write");

    assert!(reader.wait_for_data(TIMEOUT));
    let change = reader.take().expect("one sample");
    assert_eq!(&*change.payload, sample.as_slice());
    assert_eq!(pair.hub.stats().messages_dropped, 1);

    let stats = writer.metrics().snapshot();
    assert!(stats.fragments_resent >= 1);
    writer
        .wait_for_acknowledgments(TIMEOUT)
        .expect("sample acknowledged");
}

#[test]
fn small_and_large_samples_interleave() {
    let pair = Pair::with_hub(IntraProcessHub::with_max_message_size(1024));
    let writer = pair.writer(QosProfile::reliable().keep_all());
    let reader = pair.reader(QosProfile::reliable().keep_all());
    pair.connect(&writer, &reader);

    let big = payload(5_000);
    writer.write(b"small").expect("write");
    writer.write(&big).expect("write");
    writer.write(b"tail").expect("write");

    let mut got = Vec::new();
    assert!(wait_until(TIMEOUT, || {
        got.extend(reader.take_all());
        got.len() == 3
    }));
    assert_eq!(&*got[0].payload, b"small");
    assert_eq!(&*got[1].payload, big.as_slice());
    assert_eq!(&*got[2].payload, b"tail");
}
