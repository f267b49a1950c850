// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! StatefulReader: reader half of the reliable delivery engine.
//!
//! One `WriterProxy` per matched writer orders incoming changes and derives
//! the missing set. Inbound submessages only update state; the ACKNACK (plus
//! NACK_FRAGs for partial samples) goes out when the writer proxy's
//! heartbeat response event expires, so bursts of HEARTBEATs coalesce into
//! one answer.
//!
//! Delivered changes wait in a bounded queue until the application calls
//! `take()`. The queue follows the endpoint history QoS: KEEP_LAST keeps
//! the newest `depth` changes per instance, KEEP_ALL stops at `max_samples`.

use super::fragment::FragmentAssembler;
use super::messages::{
    AckNack, Data, DataFrag, Gap, Heartbeat, HeartbeatFrag, NackFrag, SequenceNumberSet, Submessage,
};
use super::metrics::ReliableMetrics;
use super::writer_proxy::WriterProxy;
use super::{send_outbound, Outbound, RemoteEndpoint};
use crate::config::{
    DEFAULT_FRAGMENT_TIMEOUT, DEFAULT_MAX_OUT_OF_ORDER, DEFAULT_MAX_PENDING_REASSEMBLIES,
};
use crate::core::change::{CacheChange, Time, KEYLESS};
use crate::core::guid::{Guid, GuidPrefix};
use crate::core::timed_event::{EventAction, SchedulerHandle};
use crate::error::{Error, Result};
use crate::qos::{History, QosProfile, LENGTH_UNLIMITED};
use crate::transport::MessageSender;
use parking_lot::{Condvar, Mutex, RwLock};
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

/// Notifications delivered to the reader listener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReaderEvent {
    /// New changes are waiting in the queue.
    DataAvailable,
    /// `count` changes of `writer` will never arrive.
    SampleLost { writer: Guid, count: u64 },
    WriterMatched(Guid),
    WriterUnmatched(Guid),
}

type ReaderListener = Arc<dyn Fn(&ReaderEvent) + Send + Sync>;

struct ReaderState {
    proxies: BTreeMap<Guid, WriterProxy>,
    assembler: FragmentAssembler,
    queue: VecDeque<CacheChange>,
}

/// Reliable (or best-effort) reader endpoint.
pub struct StatefulReader {
    guid: Guid,
    qos: QosProfile,
    state: Mutex<ReaderState>,
    data_ready: Condvar,
    sender: Arc<MessageSender>,
    scheduler: SchedulerHandle,
    metrics: Arc<ReliableMetrics>,
    listener: RwLock<Option<ReaderListener>>,
    self_ref: Weak<StatefulReader>,
}

impl StatefulReader {
    /// Create a reader.
    ///
    /// # Errors
    /// `InvalidQos` when the profile does not validate.
    pub fn new(
        guid: Guid,
        qos: QosProfile,
        sender: Arc<MessageSender>,
        scheduler: SchedulerHandle,
        metrics: Arc<ReliableMetrics>,
    ) -> Result<Arc<Self>> {
        qos.validate()?;
        log::debug!(
            "[StatefulReader::new] {} reliable={} durability={:?}",
            guid,
            qos.is_reliable(),
            qos.durability
        );
        Ok(Arc::new_cyclic(|weak| StatefulReader {
            guid,
            qos,
            state: Mutex::new(ReaderState {
                proxies: BTreeMap::new(),
                assembler: FragmentAssembler::new(
                    DEFAULT_MAX_PENDING_REASSEMBLIES,
                    DEFAULT_FRAGMENT_TIMEOUT,
                ),
                queue: VecDeque::new(),
            }),
            data_ready: Condvar::new(),
            sender,
            scheduler,
            metrics,
            listener: RwLock::new(None),
            self_ref: weak.clone(),
        }))
    }

    #[must_use]
    pub fn guid(&self) -> Guid {
        self.guid
    }

    #[must_use]
    pub fn qos(&self) -> &QosProfile {
        &self.qos
    }

    #[must_use]
    pub fn metrics(&self) -> &ReliableMetrics {
        &self.metrics
    }

    pub fn set_listener<F>(&self, listener: F)
    where
        F: Fn(&ReaderEvent) + Send + Sync + 'static,
    {
        *self.listener.write() = Some(Arc::new(listener));
    }

    pub fn clear_listener(&self) {
        *self.listener.write() = None;
    }

    // ========================================================================
    // Application API
    // ========================================================================

    /// Remove and return the oldest delivered change.
    pub fn take(&self) -> Option<CacheChange> {
        self.state.lock().queue.pop_front()
    }

    /// Remove and return every delivered change, oldest first.
    pub fn take_all(&self) -> Vec<CacheChange> {
        self.state.lock().queue.drain(..).collect()
    }

    /// Changes waiting to be taken.
    #[must_use]
    pub fn available(&self) -> usize {
        self.state.lock().queue.len()
    }

    /// Block until at least one change is available. Returns `false` on timeout.
    pub fn wait_for_data(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while state.queue.is_empty() {
            if self.data_ready.wait_until(&mut state, deadline).timed_out() {
                return !state.queue.is_empty();
            }
        }
        true
    }

    #[must_use]
    pub fn matched_writers(&self) -> Vec<Guid> {
        self.state.lock().proxies.keys().copied().collect()
    }

    /// Highest sequence number of `writer` with nothing missing below it.
    #[must_use]
    pub fn available_up_to(&self, writer: Guid) -> Option<u64> {
        self.state
            .lock()
            .proxies
            .get(&writer)
            .map(WriterProxy::available_up_to)
    }

    /// Partial samples currently being reassembled.
    #[must_use]
    pub fn pending_reassemblies(&self) -> usize {
        self.state.lock().assembler.len()
    }

    pub(crate) fn is_matched(&self, writer: Guid) -> bool {
        self.state.lock().proxies.contains_key(&writer)
    }

    // ========================================================================
    // Discovery
    // ========================================================================

    /// Start tracking a remote writer. Reliable readers send a preemptive
    /// ACKNACK right away.
    ///
    /// # Errors
    /// `QosIncompatible` for a best-effort writer on a reliable reader or a
    /// VOLATILE writer on a TRANSIENT_LOCAL reader.
    pub fn match_writer(&self, remote: &RemoteEndpoint) -> Result<()> {
        if (self.qos.is_reliable() && !remote.qos.is_reliable())
            || self.qos.durability > remote.qos.durability
        {
            return Err(Error::QosIncompatible);
        }
        {
            let mut state = self.state.lock();
            if let Some(existing) = state.proxies.get_mut(&remote.guid) {
                existing.locators.clone_from(&remote.locators);
                return Ok(());
            }
            let mut proxy = WriterProxy::new(
                remote.guid,
                remote.locators.clone(),
                self.qos.is_reliable(),
            )
            .with_max_pending(self.qos.resource_limits.max_samples.min(DEFAULT_MAX_OUT_OF_ORDER));
            if self.qos.is_reliable() {
                let weak = self.self_ref.clone();
                let writer = remote.guid;
                let event = self.scheduler.register(move || {
                    if let Some(reader) = weak.upgrade() {
                        reader.on_heartbeat_response(writer);
                    }
                    EventAction::Done
                });
                event.arm(Duration::ZERO);
                proxy.heartbeat_response = Some(event);
            }
            state.proxies.insert(remote.guid, proxy);
        }
        log::debug!(
            "[StatefulReader::match_writer] {} matched {}",
            self.guid,
            remote.guid
        );
        self.notify(vec![ReaderEvent::WriterMatched(remote.guid)]);
        Ok(())
    }

    /// Stop tracking a remote writer. Returns `false` if it was not matched.
    pub fn unmatch_writer(&self, writer: Guid) -> bool {
        let removed = {
            let mut state = self.state.lock();
            let removed = state.proxies.remove(&writer);
            if removed.is_some() {
                state.assembler.discard_writer(writer);
            }
            removed
        };
        if removed.is_none() {
            return false;
        }
        drop(removed);
        log::debug!(
            "[StatefulReader::unmatch_writer] {} unmatched {}",
            self.guid,
            writer
        );
        self.notify(vec![ReaderEvent::WriterUnmatched(writer)]);
        true
    }

    // ========================================================================
    // Inbound
    // ========================================================================

    pub(crate) fn on_data(&self, source: GuidPrefix, data: &Data, timestamp: Option<Time>) {
        self.metrics.add_data_received(1);
        let writer = Guid::new(source, data.writer_id);
        let change = CacheChange {
            writer_guid: writer,
            sequence_number: data.writer_sn,
            instance_key: data.key_hash.unwrap_or(KEYLESS),
            kind: data.kind,
            payload: data.payload.clone().unwrap_or_else(|| Arc::from(&[][..])),
            source_timestamp: timestamp,
        };
        self.accept(writer, change);
    }

    pub(crate) fn on_data_frag(&self, source: GuidPrefix, frag: &DataFrag, timestamp: Option<Time>) {
        let writer = Guid::new(source, frag.writer_id);
        let mut events = Vec::new();
        {
            let mut state = self.state.lock();
            let ReaderState {
                proxies,
                assembler,
                queue,
            } = &mut *state;
            let Some(proxy) = proxies.get_mut(&writer) else {
                log::trace!("[StatefulReader::on_data_frag] {} unknown writer {}", self.guid, writer);
                return;
            };
            if proxy.is_duplicate(frag.writer_sn) || proxy.is_irrelevant(frag.writer_sn) {
                self.metrics.add_duplicates_dropped(1);
                return;
            }
            let Some(sample) = assembler.add_fragment(writer, frag, Instant::now()) else {
                return;
            };
            self.metrics.add_data_received(1);
            let mut change = sample.into_change();
            change.source_timestamp = timestamp;
            let delivered = proxy.received_change(change);
            if self.enqueue(queue, delivered) {
                events.push(ReaderEvent::DataAvailable);
            }
        }
        self.notify(events);
    }

    pub(crate) fn on_gap(&self, source: GuidPrefix, gap: &Gap) {
        self.metrics.add_gaps_received(1);
        let writer = Guid::new(source, gap.writer_id);
        let mut events = Vec::new();
        {
            let mut state = self.state.lock();
            let ReaderState {
                proxies,
                assembler,
                queue,
            } = &mut *state;
            let Some(proxy) = proxies.get_mut(&writer) else {
                return;
            };
            let ranges = gap.ranges();
            log::trace!("[StatefulReader::on_gap] {} from {}: {:?}", self.guid, writer, ranges);
            let delivered = proxy.process_gap(&ranges);
            let discarded = assembler.discard_where(writer, |seq| proxy.is_irrelevant(seq));
            if discarded > 0 {
                log::debug!(
                    "[StatefulReader::on_gap] {} dropped {} partial sample(s) of {}",
                    self.guid,
                    discarded,
                    writer
                );
            }
            if self.enqueue(queue, delivered) {
                events.push(ReaderEvent::DataAvailable);
            }
        }
        self.notify(events);
    }

    pub(crate) fn on_heartbeat(&self, source: GuidPrefix, hb: &Heartbeat) {
        self.metrics.add_heartbeats_received(1);
        let writer = Guid::new(source, hb.writer_id);
        let now = Instant::now();
        let mut events = Vec::new();
        {
            let mut state = self.state.lock();
            let ReaderState {
                proxies,
                assembler,
                queue,
            } = &mut *state;
            let Some(proxy) = proxies.get_mut(&writer) else {
                return;
            };
            if !proxy.is_reliable() {
                return;
            }
            let Some(outcome) = proxy.process_heartbeat(hb.first_sn, hb.last_sn, hb.count) else {
                log::trace!(
                    "[StatefulReader::on_heartbeat] {} stale count {} from {}",
                    self.guid,
                    hb.count,
                    writer
                );
                return;
            };
            if outcome.lost > 0 {
                log::debug!(
                    "[StatefulReader::on_heartbeat] {} lost {} change(s) of {} below {}",
                    self.guid,
                    outcome.lost,
                    writer,
                    hb.first_sn
                );
                self.metrics.add_samples_lost(outcome.lost);
                events.push(ReaderEvent::SampleLost {
                    writer,
                    count: outcome.lost,
                });
            }
            assembler.discard_where(writer, |seq| proxy.is_irrelevant(seq));
            assembler.evict_expired(now);
            if self.enqueue(queue, outcome.delivered) {
                events.push(ReaderEvent::DataAvailable);
            }

            let partial = !assembler.pending_samples(writer).is_empty();
            let must_answer = !hb.final_flag || proxy.has_missing() || partial;
            if must_answer {
                if let Some(event) = &proxy.heartbeat_response {
                    event.arm(self.qos.heartbeat_response_delay);
                }
            }
        }
        self.notify(events);
    }

    pub(crate) fn on_heartbeat_frag(&self, source: GuidPrefix, hb: &HeartbeatFrag) {
        let writer = Guid::new(source, hb.writer_id);
        let state = self.state.lock();
        let Some(proxy) = state.proxies.get(&writer) else {
            return;
        };
        let incomplete = state
            .assembler
            .missing_fragments(writer, hb.writer_sn)
            .is_some_and(|missing| missing.iter().any(|n| n <= hb.last_fragment_num));
        if incomplete {
            if let Some(event) = &proxy.heartbeat_response {
                event.arm(self.qos.heartbeat_response_delay);
            }
        }
    }

    // ========================================================================
    // Timed events
    // ========================================================================

    /// Answer the writer with an ACKNACK and NACK_FRAGs for partial samples.
    fn on_heartbeat_response(&self, writer: Guid) {
        let outbound = {
            let mut state = self.state.lock();
            let ReaderState {
                proxies, assembler, ..
            } = &mut *state;
            let Some(proxy) = proxies.get_mut(&writer) else {
                return;
            };

            let mut submessages = Vec::new();
            let partial = assembler.pending_samples(writer);
            // Partial samples are repaired fragment by fragment, not resent whole.
            let set = proxy.acknack_set();
            let requested = SequenceNumberSet::from_sequences(
                set.base(),
                set.iter().filter(|seq| !partial.contains(seq)),
            );
            let count = proxy.next_acknack_count();
            log::trace!(
                "[StatefulReader::on_heartbeat_response] {} -> {} ACKNACK base={} missing={:?}",
                self.guid,
                writer,
                requested.base(),
                requested.iter().collect::<Vec<_>>()
            );
            submessages.push(Submessage::AckNack(AckNack {
                reader_id: self.guid.entity_id,
                writer_id: writer.entity_id,
                final_flag: requested.is_empty(),
                reader_sn_state: requested,
                count,
            }));

            for seq in partial {
                let Some(missing) = assembler.missing_fragments(writer, seq) else {
                    continue;
                };
                if missing.is_empty() {
                    continue;
                }
                submessages.push(Submessage::NackFrag(NackFrag {
                    reader_id: self.guid.entity_id,
                    writer_id: writer.entity_id,
                    writer_sn: seq,
                    fragment_number_state: missing,
                    count: proxy.next_nack_frag_count(),
                }));
            }
            self.metrics.add_acknacks_sent(1);
            vec![Outbound {
                dest: writer.prefix,
                locators: proxy.locators.clone(),
                submessages,
            }]
        };
        send_outbound(&self.sender, self.guid, outbound);
    }

    // ========================================================================
    // Delivery (called with the state lock held)
    // ========================================================================

    fn accept(&self, writer: Guid, change: CacheChange) {
        let mut events = Vec::new();
        {
            let mut state = self.state.lock();
            let ReaderState {
                proxies,
                assembler,
                queue,
            } = &mut *state;
            let Some(proxy) = proxies.get_mut(&writer) else {
                log::trace!("[StatefulReader::accept] {} unknown writer {}", self.guid, writer);
                return;
            };
            let seq = change.sequence_number;
            if proxy.is_duplicate(seq) {
                self.metrics.add_duplicates_dropped(1);
                return;
            }
            assembler.discard(writer, seq);
            let delivered = proxy.received_change(change);
            if self.enqueue(queue, delivered) {
                events.push(ReaderEvent::DataAvailable);
            }
        }
        self.notify(events);
    }

    /// Append in-order changes to the application queue. Returns true if any.
    fn enqueue(&self, queue: &mut VecDeque<CacheChange>, changes: Vec<CacheChange>) -> bool {
        if changes.is_empty() {
            return false;
        }
        let depth = self.qos.depth_per_instance();
        let max_samples = self.qos.resource_limits.max_samples;
        for change in changes {
            if depth != LENGTH_UNLIMITED {
                let same_instance = queue
                    .iter()
                    .filter(|c| c.instance_key == change.instance_key)
                    .count();
                if same_instance >= depth {
                    if let Some(pos) = queue
                        .iter()
                        .position(|c| c.instance_key == change.instance_key)
                    {
                        if let History::KeepAll = self.qos.history {
                            log::warn!(
                                "[StatefulReader::enqueue] {} instance queue full, dropping oldest seq={}",
                                self.guid,
                                queue[pos].sequence_number
                            );
                        }
                        queue.remove(pos);
                    }
                }
            }
            if max_samples != LENGTH_UNLIMITED && queue.len() >= max_samples {
                if let Some(old) = queue.pop_front() {
                    log::warn!(
                        "[StatefulReader::enqueue] {} queue full ({}), dropping oldest seq={}",
                        self.guid,
                        max_samples,
                        old.sequence_number
                    );
                }
            }
            queue.push_back(change);
        }
        true
    }

    fn notify(&self, events: Vec<ReaderEvent>) {
        if events.is_empty() {
            return;
        }
        if events.contains(&ReaderEvent::DataAvailable) {
            self.data_ready.notify_all();
        }
        let listener = self.listener.read().clone();
        if let Some(listener) = listener {
            for event in &events {
                listener(event);
            }
        }
    }
}

impl std::fmt::Debug for StatefulReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatefulReader")
            .field("guid", &self.guid)
            .field("reliable", &self.qos.is_reliable())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::change::ChangeKind;
    use crate::core::guid::EntityId;
    use crate::core::timed_event::TimedEventScheduler;
    use crate::reliability::fragment::Fragmenter;
    use crate::reliability::messages::RtpsMessage;
    use crate::reliability::rtps_range::RtpsRange;
    use crate::transport::{Locator, MessageReceiver, Transport};

    #[derive(Default)]
    struct Capture {
        sent: Mutex<Vec<Vec<u8>>>,
    }

    impl Transport for Capture {
        fn send(&self, _: &Locator, bytes: &[u8]) -> Result<()> {
            self.sent.lock().push(bytes.to_vec());
            Ok(())
        }

        fn attach(&self, _: Locator, _: Weak<dyn MessageReceiver>) -> Result<()> {
            Ok(())
        }

        fn detach(&self, _: &Locator) {}
    }

    impl Capture {
        fn drain(&self) -> Vec<Submessage> {
            std::mem::take(&mut *self.sent.lock())
                .iter()
                .flat_map(|bytes| RtpsMessage::decode(bytes).expect("valid message").submessages)
                .collect()
        }
    }

    struct Fixture {
        _sched: TimedEventScheduler,
        capture: Arc<Capture>,
        reader: Arc<StatefulReader>,
    }

    const WRITER_PREFIX: GuidPrefix = GuidPrefix([1; 12]);

    fn writer_guid() -> Guid {
        Guid::new(WRITER_PREFIX, EntityId::writer(1))
    }

    fn fixture(qos: QosProfile) -> Fixture {
        let sched = TimedEventScheduler::new().expect("scheduler");
        let capture = Arc::new(Capture::default());
        let sender = Arc::new(MessageSender::new(GuidPrefix([2; 12]), capture.clone()));
        let reader = StatefulReader::new(
            Guid::new(GuidPrefix([2; 12]), EntityId::reader(1)),
            qos,
            sender,
            sched.handle(),
            Arc::new(ReliableMetrics::new()),
        )
        .expect("valid qos");
        Fixture {
            _sched: sched,
            capture,
            reader,
        }
    }

    fn matched(qos: QosProfile) -> Fixture {
        let fx = fixture(qos);
        let remote = RemoteEndpoint::new(
            writer_guid(),
            vec![Locator::intra(WRITER_PREFIX)],
            QosProfile::reliable().transient_local(),
        );
        fx.reader.match_writer(&remote).expect("match");
        fx
    }

    fn data(seq: u64, payload: &[u8]) -> Data {
        Data {
            reader_id: EntityId::UNKNOWN,
            writer_id: writer_guid().entity_id,
            writer_sn: seq,
            key_hash: None,
            kind: ChangeKind::Alive,
            payload: Some(Arc::from(payload)),
        }
    }

    fn heartbeat(first: u64, last: u64, count: u32, final_flag: bool) -> Heartbeat {
        Heartbeat {
            reader_id: EntityId::UNKNOWN,
            writer_id: writer_guid().entity_id,
            first_sn: first,
            last_sn: last,
            count,
            final_flag,
            liveliness: false,
        }
    }

    fn taken_seqs(reader: &StatefulReader) -> Vec<u64> {
        reader.take_all().iter().map(|c| c.sequence_number).collect()
    }

    fn acknacks(subs: &[Submessage]) -> Vec<AckNack> {
        subs.iter()
            .filter_map(|s| match s {
                Submessage::AckNack(a) => Some(a.clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_out_of_order_delivered_in_order() {
        let fx = matched(QosProfile::reliable().keep_all());
        fx.reader.on_data(WRITER_PREFIX, &data(2, b"b"), None);
        assert_eq!(fx.reader.available(), 0);
        fx.reader.on_data(WRITER_PREFIX, &data(1, b"a"), None);
        fx.reader.on_data(WRITER_PREFIX, &data(1, b"a"), None);
        assert_eq!(taken_seqs(&fx.reader), vec![1, 2]);
        assert_eq!(fx.reader.metrics().snapshot().duplicates_dropped, 1);
    }

    #[test]
    fn test_best_effort_delivers_immediately() {
        let fx = matched(QosProfile::best_effort().keep_all());
        fx.reader.on_data(WRITER_PREFIX, &data(3, b"c"), None);
        fx.reader.on_data(WRITER_PREFIX, &data(1, b"a"), None);
        fx.reader.on_data(WRITER_PREFIX, &data(5, b"e"), None);
        assert_eq!(taken_seqs(&fx.reader), vec![3, 5]);
    }

    #[test]
    fn test_gap_releases_pending() {
        let fx = matched(QosProfile::reliable().keep_all());
        fx.reader.on_data(WRITER_PREFIX, &data(3, b"c"), None);
        let gap = Gap::contiguous(EntityId::UNKNOWN, writer_guid().entity_id, RtpsRange::new(1, 3))
            .expect("non-empty range");
        fx.reader.on_gap(WRITER_PREFIX, &gap);
        assert_eq!(taken_seqs(&fx.reader), vec![3]);
        assert_eq!(fx.reader.available_up_to(writer_guid()), Some(3));
    }

    #[test]
    fn test_heartbeat_reports_lost_samples() {
        let fx = matched(QosProfile::reliable().keep_all());
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        fx.reader.set_listener(move |e| sink.lock().push(e.clone()));

        fx.reader.on_data(WRITER_PREFIX, &data(1, b"a"), None);
        fx.reader.on_data(WRITER_PREFIX, &data(5, b"e"), None);
        fx.reader.on_heartbeat(WRITER_PREFIX, &heartbeat(5, 5, 1, false));
        assert_eq!(taken_seqs(&fx.reader), vec![1, 5]);
        assert!(events.lock().contains(&ReaderEvent::SampleLost {
            writer: writer_guid(),
            count: 3
        }));
        assert_eq!(fx.reader.metrics().snapshot().samples_lost, 3);
    }

    #[test]
    fn test_heartbeat_answered_with_missing_set() {
        let fx = matched(QosProfile::reliable().keep_all());
        std::thread::sleep(Duration::from_millis(50));
        let initial = acknacks(&fx.capture.drain());
        assert_eq!(initial.len(), 1, "preemptive ACKNACK on match");
        assert_eq!(initial[0].ack_base(), 1);

        fx.reader.on_data(WRITER_PREFIX, &data(1, b"a"), None);
        fx.reader.on_data(WRITER_PREFIX, &data(3, b"c"), None);
        fx.reader.on_heartbeat(WRITER_PREFIX, &heartbeat(1, 4, 1, false));
        std::thread::sleep(Duration::from_millis(100));
        let answers = acknacks(&fx.capture.drain());
        assert_eq!(answers.len(), 1);
        assert_eq!(answers[0].ack_base(), 2);
        assert_eq!(answers[0].reader_sn_state.iter().collect::<Vec<_>>(), vec![2, 4]);
        assert!(answers[0].count > initial[0].count);
    }

    #[test]
    fn test_final_heartbeat_with_nothing_missing_not_answered() {
        let fx = matched(QosProfile::reliable().keep_all());
        std::thread::sleep(Duration::from_millis(50));
        fx.capture.drain();
        fx.reader.on_data(WRITER_PREFIX, &data(1, b"a"), None);
        fx.reader.on_heartbeat(WRITER_PREFIX, &heartbeat(1, 1, 1, true));
        std::thread::sleep(Duration::from_millis(50));
        assert!(acknacks(&fx.capture.drain()).is_empty());

        // Stale count is ignored outright
        fx.reader.on_heartbeat(WRITER_PREFIX, &heartbeat(1, 3, 1, false));
        std::thread::sleep(Duration::from_millis(50));
        assert!(fx.capture.drain().is_empty());
    }

    #[test]
    fn test_fragments_reassembled_and_nacked() {
        let fx = matched(QosProfile::reliable().keep_all());
        std::thread::sleep(Duration::from_millis(50));
        fx.capture.drain();

        let fragmenter = Fragmenter::new(1000);
        let payload: Vec<u8> = (0..3000u32).map(|i| (i % 251) as u8).collect();
        let change = CacheChange::alive(writer_guid(), 1, KEYLESS, &payload);
        let total = fragmenter.fragment_count(payload.len());
        assert!(total >= 3);
        for n in (1..=total).filter(|n| *n != 2) {
            let frag = fragmenter.data_frag(&change, EntityId::UNKNOWN, n);
            fx.reader.on_data_frag(WRITER_PREFIX, &frag, None);
        }
        assert_eq!(fx.reader.pending_reassemblies(), 1);

        fx.reader.on_heartbeat(WRITER_PREFIX, &heartbeat(1, 1, 1, false));
        std::thread::sleep(Duration::from_millis(100));
        let subs = fx.capture.drain();
        let nack = subs
            .iter()
            .find_map(|s| match s {
                Submessage::NackFrag(n) => Some(n.clone()),
                _ => None,
            })
            .expect("NACK_FRAG for partial sample");
        assert_eq!(nack.fragment_number_state.iter().collect::<Vec<_>>(), vec![2]);
        let ack = &acknacks(&subs)[0];
        assert!(ack.reader_sn_state.is_empty(), "partial sample not nacked whole");

        let frag = fragmenter.data_frag(&change, EntityId::UNKNOWN, 2);
        fx.reader.on_data_frag(WRITER_PREFIX, &frag, None);
        let got = fx.reader.take().expect("reassembled sample");
        assert_eq!(&got.payload[..], &payload[..]);
    }

    #[test]
    fn test_keep_last_queue_depth() {
        let fx = matched(QosProfile::reliable().keep_last(2));
        for seq in 1..=4 {
            fx.reader.on_data(WRITER_PREFIX, &data(seq, b"x"), None);
        }
        assert_eq!(taken_seqs(&fx.reader), vec![3, 4]);
    }

    #[test]
    fn test_incompatible_writer_rejected() {
        let fx = fixture(QosProfile::reliable());
        let remote = RemoteEndpoint::new(writer_guid(), Vec::new(), QosProfile::best_effort());
        assert!(matches!(fx.reader.match_writer(&remote), Err(Error::QosIncompatible)));

        let fx = fixture(QosProfile::reliable().transient_local());
        let remote = RemoteEndpoint::new(writer_guid(), Vec::new(), QosProfile::reliable());
        assert!(matches!(fx.reader.match_writer(&remote), Err(Error::QosIncompatible)));
    }

    #[test]
    fn test_wait_for_data() {
        let fx = matched(QosProfile::reliable().keep_all());
        assert!(!fx.reader.wait_for_data(Duration::from_millis(10)));
        let reader = Arc::clone(&fx.reader);
        let feeder = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            reader.on_data(WRITER_PREFIX, &data(1, b"a"), None);
        });
        assert!(fx.reader.wait_for_data(Duration::from_secs(5)));
        feeder.join().expect("feeder");
        assert!(fx.reader.unmatch_writer(writer_guid()));
        assert!(!fx.reader.unmatch_writer(writer_guid()));
    }

    #[test]
    fn test_match_and_unmatch_notify_listener() {
        let fx = fixture(QosProfile::reliable().keep_all());
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        fx.reader.set_listener(move |e| sink.lock().push(e.clone()));

        let remote = RemoteEndpoint::new(
            writer_guid(),
            vec![Locator::intra(WRITER_PREFIX)],
            QosProfile::reliable(),
        );
        fx.reader.match_writer(&remote).expect("match");
        assert!(fx.reader.unmatch_writer(writer_guid()));
        assert_eq!(
            *events.lock(),
            vec![
                ReaderEvent::WriterMatched(writer_guid()),
                ReaderEvent::WriterUnmatched(writer_guid()),
            ]
        );
    }
}
