// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Reader proxies expire when their participant goes silent.

#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

mod common;

use common::{collect, wait_until, Pair};
use parking_lot::Mutex;
use rtps_reliable::{QosProfile, WriterEvent};
use std::sync::Arc;
use std::time::Duration;

#[test]
fn silent_reader_is_reported_lost() {
    let pair = Pair::new();
    let writer = pair.writer(
        QosProfile::reliable()
            .keep_all()
            .heartbeat_period(Duration::from_millis(20))
            .lease_duration(Duration::from_millis(200)),
    );
    let events = Arc::new(Mutex::new(Vec::new()));
    {
        let events = Arc::clone(&events);
        writer.set_listener(move |event| events.lock().push(event.clone()));
    }
    let reader = pair.reader(QosProfile::reliable().keep_all());
    pair.connect(&writer, &reader);

    writer.write(b"first").expect("write");
    assert_eq!(collect(&reader, 1, Duration::from_secs(5)), vec![1]);
    writer
        .wait_for_acknowledgments(Duration::from_secs(5))
        .expect("first sample acknowledged");

    pair.domain
        .delete_participant(pair.subscriber.guid_prefix())
        .expect("delete subscriber");
    writer.write(b"second").expect("write");

    let reader_guid = reader.guid();
    assert!(wait_until(Duration::from_secs(5), || {
        events.lock().contains(&WriterEvent::ReaderLost(reader_guid))
    }));
    assert!(writer.matched_readers().is_empty());

    let events = events.lock();
    assert_eq!(events[0], WriterEvent::ReaderMatched(reader_guid));
    assert!(events.contains(&WriterEvent::Acknowledged {
        reader: reader_guid,
        up_to: 1
    }));
}

#[test]
fn idle_reader_keeps_its_lease() {
    let pair = Pair::new();
    let writer = pair.writer(
        QosProfile::reliable()
            .keep_all()
            .heartbeat_period(Duration::from_millis(20))
            .lease_duration(Duration::from_millis(100)),
    );
    let reader = pair.reader(QosProfile::reliable().keep_all());
    pair.connect(&writer, &reader);

    writer.write(b"only").expect("write");
    assert_eq!(collect(&reader, 1, Duration::from_secs(5)), vec![1]);

    // Nothing is owed, so silence alone does not expire the proxy.
    std::thread::sleep(Duration::from_millis(300));
    assert_eq!(writer.matched_readers(), vec![reader.guid()]);
}
