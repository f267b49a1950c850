// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Asynchronous writers paced by named flow controllers.

#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::cast_possible_truncation)]

mod common;

use common::{collect, Pair};
use parking_lot::Mutex;
use rtps_reliable::reliability::messages::{RtpsMessage, Submessage};
use rtps_reliable::{FlowControllerConfig, IntraProcessHub, QosProfile};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

const TIMEOUT: Duration = Duration::from_secs(10);

#[test]
fn bytes_per_period_bounds_throughput() {
    let pair = Pair::with_hub(IntraProcessHub::with_max_message_size(2048));
    let flow = FlowControllerConfig::new("slow", 4096, Duration::from_millis(50));
    let writer = pair.writer(QosProfile::reliable().keep_all().flow_controlled(flow.clone()));
    let reader = pair.reader(QosProfile::reliable().keep_all());
    pair.connect(&writer, &reader);

    let started = Instant::now();
    for _ in 0..20 {
        writer.write(&[0xAB; 1000]).expect("asynchronous write never blocks");
    }
    let seqs = collect(&reader, 20, TIMEOUT);
    let elapsed = started.elapsed();

    assert_eq!(seqs, (1..=20).collect::<Vec<_>>());
    // ~22 KB at 4 KB per 50 ms needs several refills.
    assert!(elapsed >= Duration::from_millis(150), "too fast: {:?}", elapsed);

    let controller = pair.publisher.flow_controller(flow).expect("shared controller");
    let stats = controller.stats();
    assert!(stats.deferrals > 0);
    assert!(stats.bytes_released >= 20 * 1000);
    assert!(writer.metrics().snapshot().flow_deferrals > 0);
}

/// Fragment numbers of sequence 1 carried by one message.
fn fragment_numbers(bytes: &[u8]) -> Vec<u32> {
    RtpsMessage::decode(bytes)
        .map(|msg| {
            msg.submessages
                .iter()
                .filter_map(|s| match s {
                    Submessage::DataFrag(f) if f.writer_sn == 1 => Some(f.fragment_starting_num),
                    _ => None,
                })
                .collect()
        })
        .unwrap_or_default()
}

#[test]
fn fragment_repair_stays_within_period_budget() {
    const BUDGET: usize = 4096;
    const MESSAGE: usize = 2048;
    const PERIOD: Duration = Duration::from_millis(300);

    let hub = IntraProcessHub::with_max_message_size(MESSAGE);
    let released = Arc::new(Mutex::new(Vec::<(Instant, usize)>::new()));
    let dropped = Mutex::new(HashSet::new());
    {
        let released = Arc::clone(&released);
        hub.set_drop_filter(move |_, bytes| {
            let numbers = fragment_numbers(bytes);
            if numbers.is_empty() {
                return false;
            }
            released.lock().push((Instant::now(), bytes.len()));
            // Only fragment 1 survives the first pass; the rest need NACK_FRAG.
            numbers
                .iter()
                .any(|n| *n > 1 && dropped.lock().insert(*n))
        });
    }
    let pair = Pair::with_hub(hub);
    let flow = FlowControllerConfig::new("repair", BUDGET, PERIOD);
    let writer = pair.writer(
        QosProfile::reliable()
            .keep_all()
            .heartbeat_period(Duration::from_millis(50))
            .flow_controlled(flow),
    );
    let reader = pair.reader(QosProfile::reliable().keep_all());
    pair.connect(&writer, &reader);

    let sample: Vec<u8> = (0..20_000).map(|i| (i % 251) as u8).collect();
    writer.write(&sample).expect("write");

    assert!(reader.wait_for_data(TIMEOUT));
    let change = reader.take().expect("sample repaired");
    assert_eq!(&*change.payload, sample.as_slice());
    assert!(writer.metrics().snapshot().fragments_resent >= 1);

    // A window shorter than one period overlaps at most two of them.
    let mut log = released.lock().clone();
    log.sort_by_key(|(at, _)| *at);
    let window = PERIOD / 3;
    let bound = 2 * (BUDGET + MESSAGE);
    for (i, (start, _)) in log.iter().enumerate() {
        let bytes: usize = log[i..]
            .iter()
            .take_while(|(at, _)| at.duration_since(*start) < window)
            .map(|(_, len)| len)
            .sum();
        assert!(
            bytes <= bound,
            "{} bytes released within {:?} (budget {} per {:?})",
            bytes,
            window,
            BUDGET,
            PERIOD
        );
    }
}

#[test]
fn round_robin_serves_every_writer() {
    let pair = Pair::with_hub(IntraProcessHub::with_max_message_size(2048));
    let flow = FlowControllerConfig::new("shared", 4096, Duration::from_millis(20)).round_robin();
    let qos = QosProfile::reliable().keep_all().flow_controlled(flow.clone());
    let writer_a = pair.writer(qos.clone());
    let writer_b = pair.writer(qos);
    let reader_a = pair.reader(QosProfile::reliable().keep_all());
    let reader_b = pair.reader(QosProfile::reliable().keep_all());
    pair.connect(&writer_a, &reader_a);
    pair.connect(&writer_b, &reader_b);

    for _ in 0..10 {
        writer_a.write(&[0xA; 1500]).expect("write a");
        writer_b.write(&[0xB; 1500]).expect("write b");
    }

    let expected: Vec<u64> = (1..=10).collect();
    assert_eq!(collect(&reader_a, 10, TIMEOUT), expected);
    assert_eq!(collect(&reader_b, 10, TIMEOUT), expected);
    assert_eq!(pair.publisher.flow_controller(flow).expect("shared").queued(), 0);
}

#[test]
fn controller_below_one_message_is_rejected() {
    let pair = Pair::with_hub(IntraProcessHub::with_max_message_size(2048));
    let flow = FlowControllerConfig::new("tiny", 1024, Duration::from_millis(10));
    let err = pair
        .publisher
        .create_writer(QosProfile::reliable().flow_controlled(flow))
        .expect_err("budget below one message");
    assert!(matches!(err, rtps_reliable::Error::InvalidQos(_)));
}
