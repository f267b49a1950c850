// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! History and codec benchmarks
//!
//! Measures the hot paths of a reliable writer that do not touch a transport:
//! - SampleHistory add under KEEP_LAST eviction and KEEP_ALL reclaim
//! - RTPS message encode/decode for DATA batches and ACKNACK bitmaps

#![allow(clippy::uninlined_format_args)]
#![allow(clippy::cast_possible_truncation)]

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use rtps_reliable::reliability::messages::{
    AckNack, Data, RtpsMessage, SequenceNumberSet, Submessage,
};
use rtps_reliable::reliability::SampleHistory;
use rtps_reliable::core::KEYLESS;
use rtps_reliable::{CacheChange, ChangeKind, EntityId, Guid, GuidPrefix, QosProfile};
use std::hint::black_box as bb;
use std::sync::Arc;

fn writer_guid() -> Guid {
    Guid::new(GuidPrefix([1; 12]), EntityId::writer(1))
}

/// KEEP_LAST(depth): every add past the depth evicts the oldest change
fn bench_keep_last_add(c: &mut Criterion) {
    let mut group = c.benchmark_group("history_keep_last_add");
    let guid = writer_guid();
    let payload = vec![0xAB; 256];

    for depth in [1u32, 16, 256] {
        group.bench_with_input(BenchmarkId::from_parameter(depth), &depth, |b, &depth| {
            let mut history = SampleHistory::from_qos(&QosProfile::reliable().keep_last(depth));
            let mut seq = 0u64;
            b.iter(|| {
                seq += 1;
                let change = CacheChange::alive(guid, seq, KEYLESS, &payload);
                bb(history.add(change).expect("keep_last never refuses"));
            });
        });
    }
    group.finish();
}

/// KEEP_ALL: fill a window then release it the way acknowledgments do
fn bench_keep_all_reclaim(c: &mut Criterion) {
    let guid = writer_guid();
    let payload = vec![0xCD; 256];

    c.bench_function("history_keep_all_fill_and_reclaim_1024", |b| {
        let mut history = SampleHistory::from_qos(&QosProfile::reliable().keep_all());
        let mut seq = 0u64;
        b.iter(|| {
            for _ in 0..1024 {
                seq += 1;
                let change = CacheChange::alive(guid, seq, KEYLESS, &payload);
                bb(history.add(change).expect("unbounded"));
            }
            bb(history.remove_up_to(seq));
        });
    });
}

fn data_batch(count: u64, size: usize) -> RtpsMessage {
    let mut msg = RtpsMessage::new(GuidPrefix([1; 12]));
    let payload: Arc<[u8]> = Arc::from(vec![0x5A; size]);
    msg.submessages.push(Submessage::InfoDst(GuidPrefix([2; 12])));
    for seq in 1..=count {
        msg.submessages.push(Submessage::Data(Data {
            reader_id: EntityId::UNKNOWN,
            writer_id: EntityId::writer(1),
            writer_sn: seq,
            key_hash: None,
            kind: ChangeKind::Alive,
            payload: Some(Arc::clone(&payload)),
        }));
    }
    msg
}

fn bench_codec(c: &mut Criterion) {
    let mut group = c.benchmark_group("codec_data_batch");
    for (count, size) in [(1u64, 64usize), (16, 1024), (64, 512)] {
        let msg = data_batch(count, size);
        let bytes = msg.encode();
        group.throughput(Throughput::Bytes(bytes.len() as u64));
        let label = format!("{}x{}B", count, size);
        group.bench_with_input(BenchmarkId::new("encode", &label), &msg, |b, msg| {
            b.iter(|| bb(msg.encode()));
        });
        group.bench_with_input(BenchmarkId::new("decode", &label), &bytes, |b, bytes| {
            b.iter(|| bb(RtpsMessage::decode(bytes).expect("valid message")));
        });
    }
    group.finish();

    let acknack = {
        let mut msg = RtpsMessage::new(GuidPrefix([2; 12]));
        msg.submessages.push(Submessage::AckNack(AckNack {
            reader_id: EntityId::reader(1),
            writer_id: EntityId::writer(1),
            reader_sn_state: SequenceNumberSet::from_sequences(1000, (1000..1256).step_by(3)),
            count: 7,
            final_flag: false,
        }));
        msg.encode()
    };
    c.bench_function("codec_acknack_decode_256_bits", |b| {
        b.iter(|| bb(RtpsMessage::decode(&acknack).expect("valid acknack")));
    });
}

criterion_group!(benches, bench_keep_last_add, bench_keep_all_reclaim, bench_codec);
criterion_main!(benches);
