// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! StatefulWriter: writer half of the reliable delivery engine.
//!
//! The writer owns its history and one `ReaderProxy` per matched reader.
//! Proxies are plain data; all orchestration happens here:
//!
//! - `write()`: store the change (blocking up to `max_blocking_time` when a
//!   KEEP_ALL bound is reached), mark it UNSENT for every proxy, then send
//!   inline (synchronous) or hand off to the flow controller (asynchronous)
//! - periodic heartbeat: announce `[first, last]` to reliable readers still
//!   owed something, drop readers whose lease expired, reclaim history
//! - ACKNACK / NACK_FRAG: update the proxy and arm its NACK response event
//! - NACK response expiry: resend requested changes and fragments, GAP
//!   whatever is no longer in history, piggyback a HEARTBEAT
//!
//! Submessages are built under the endpoint lock and sent after it is
//! released. Lock order: writer, flow controller, scheduler.

use super::fragment::{key_hash_of, Fragmenter};
use super::history_cache::SampleHistory;
use super::messages::{AckNack, Data, Gap, Heartbeat, HeartbeatFrag, NackFrag, Submessage};
use super::metrics::ReliableMetrics;
use super::reader_proxy::{ChangeForReaderStatus, ReaderProxy};
use super::rtps_range::RtpsRange;
use super::seq::SeqNumGenerator;
use super::{send_outbound, Outbound, RemoteEndpoint};
use crate::config::{DATA_FRAG_OVERHEAD, DATA_OVERHEAD};
use crate::congestion::{FlowClient, FlowController, FlushResult};
use crate::core::change::{CacheChange, ChangeKind, InstanceKey, Time, KEYLESS};
use crate::core::guid::{EntityId, Guid, GuidPrefix};
use crate::core::timed_event::{EventAction, EventHandle, SchedulerHandle};
use crate::error::{Error, Result};
use crate::qos::{Durability, PublishMode, QosProfile};
use crate::transport::MessageSender;
use parking_lot::{Condvar, Mutex, RwLock};
use std::collections::BTreeMap;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

/// Notifications delivered to the writer listener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriterEvent {
    ReaderMatched(Guid),
    ReaderUnmatched(Guid),
    /// Reliable reader removed after its lease expired.
    ReaderLost(Guid),
    /// `reader` acknowledged every change up to and including `up_to`.
    Acknowledged { reader: Guid, up_to: u64 },
}

type WriterListener = Arc<dyn Fn(&WriterEvent) + Send + Sync>;

#[derive(Debug)]
struct WriterState {
    history: SampleHistory,
    proxies: BTreeMap<Guid, ReaderProxy>,
    seq_gen: SeqNumGenerator,
    heartbeat_count: u32,
    heartbeat_frag_count: u32,
}

/// Which proxy queues a send pass drains.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pass {
    Unsent,
    Repair,
    /// Repairs first, then new changes.
    All,
}

#[derive(Debug, Default)]
struct Batch {
    outbound: Vec<Outbound>,
    bytes: usize,
    /// Budget ran out with traffic still pending.
    more: bool,
}

#[derive(Debug, Default)]
struct ProxyBatch {
    submessages: Vec<Submessage>,
    bytes: usize,
    blocked: bool,
    sent_data: bool,
}

/// Reliable (or best-effort) writer endpoint.
pub struct StatefulWriter {
    guid: Guid,
    qos: QosProfile,
    state: Mutex<WriterState>,
    /// Signalled when history space may have been freed.
    space: Condvar,
    /// Signalled when a reader acknowledges or goes away.
    acked: Condvar,
    sender: Arc<MessageSender>,
    fragmenter: Fragmenter,
    scheduler: SchedulerHandle,
    flow: Option<Arc<FlowController>>,
    metrics: Arc<ReliableMetrics>,
    listener: RwLock<Option<WriterListener>>,
    heartbeat: Option<EventHandle>,
    async_flush: Option<EventHandle>,
    self_ref: Weak<StatefulWriter>,
}

impl StatefulWriter {
    /// Create a writer. Reliable writers start their periodic heartbeat.
    ///
    /// # Errors
    /// `InvalidQos` when the profile does not validate.
    pub fn new(
        guid: Guid,
        qos: QosProfile,
        sender: Arc<MessageSender>,
        scheduler: SchedulerHandle,
        flow: Option<Arc<FlowController>>,
        metrics: Arc<ReliableMetrics>,
    ) -> Result<Arc<Self>> {
        qos.validate()?;
        let fragmenter = Fragmenter::new(sender.max_message_size());
        let writer = Arc::new_cyclic(|weak: &Weak<StatefulWriter>| {
            let heartbeat = qos.is_reliable().then(|| {
                let weak = weak.clone();
                let period = qos.heartbeat_period;
                scheduler.schedule_after(period, move || match weak.upgrade() {
                    Some(writer) => {
                        writer.on_heartbeat_timer();
                        EventAction::Reschedule(period)
                    }
                    None => EventAction::Done,
                })
            });
            let async_flush = (qos.publish_mode == PublishMode::Asynchronous && flow.is_none())
                .then(|| {
                    let weak = weak.clone();
                    scheduler.register(move || {
                        if let Some(writer) = weak.upgrade() {
                            writer.flush(usize::MAX);
                        }
                        EventAction::Done
                    })
                });
            StatefulWriter {
                guid,
                state: Mutex::new(WriterState {
                    history: SampleHistory::from_qos(&qos),
                    proxies: BTreeMap::new(),
                    seq_gen: SeqNumGenerator::new(),
                    heartbeat_count: 0,
                    heartbeat_frag_count: 0,
                }),
                qos,
                space: Condvar::new(),
                acked: Condvar::new(),
                sender,
                fragmenter,
                scheduler: scheduler.clone(),
                flow,
                metrics,
                listener: RwLock::new(None),
                heartbeat,
                async_flush,
                self_ref: weak.clone(),
            }
        });
        log::debug!(
            "[StatefulWriter::new] {} reliable={} durability={:?} history={:?}",
            guid,
            writer.qos.is_reliable(),
            writer.qos.durability,
            writer.qos.history
        );
        Ok(writer)
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

    /// Install the event listener (replaces any previous one).
    pub fn set_listener<F>(&self, listener: F)
    where
        F: Fn(&WriterEvent) + Send + Sync + 'static,
    {
        *self.listener.write() = Some(Arc::new(listener));
    }

    pub fn clear_listener(&self) {
        *self.listener.write() = None;
    }

    // ========================================================================
    // Application API
    // ========================================================================

    /// Write a sample of a keyless topic. Returns its sequence number.
    ///
    /// # Errors
    /// - `ResourceExhausted` when the history is full and `max_blocking_time` is zero
    /// - `WriteTimeout` when no space was freed within `max_blocking_time`
    pub fn write(&self, payload: &[u8]) -> Result<u64> {
        self.write_change(KEYLESS, ChangeKind::Alive, payload)
    }

    /// Write a sample of instance `key`.
    pub fn write_instance(&self, key: InstanceKey, payload: &[u8]) -> Result<u64> {
        self.write_change(key, ChangeKind::Alive, payload)
    }

    /// Dispose instance `key`.
    pub fn dispose(&self, key: InstanceKey) -> Result<u64> {
        self.write_change(key, ChangeKind::Disposed, &[])
    }

    /// Unregister instance `key`.
    pub fn unregister(&self, key: InstanceKey) -> Result<u64> {
        self.write_change(key, ChangeKind::Unregistered, &[])
    }

    fn write_change(&self, instance_key: InstanceKey, kind: ChangeKind, payload: &[u8]) -> Result<u64> {
        let deadline = Instant::now() + self.qos.max_blocking_time;
        let payload: Arc<[u8]> = Arc::from(payload);
        let mut state = self.state.lock();
        let mut reclaimed = false;

        let seq = loop {
            let seq = state.seq_gen.reserve();
            let change = CacheChange {
                writer_guid: self.guid,
                sequence_number: seq,
                instance_key,
                kind,
                payload: Arc::clone(&payload),
                source_timestamp: Some(Time::now()),
            };
            match state.history.add(change) {
                Ok(evicted) => {
                    if let Some(old) = evicted {
                        log::trace!(
                            "[StatefulWriter::write] {} evicted seq={}",
                            self.guid,
                            old.sequence_number
                        );
                    }
                    break seq;
                }
                Err(Error::ResourceExhausted(reason)) => {
                    if !reclaimed {
                        reclaimed = true;
                        if self.reclaim(&mut state, true) > 0 {
                            continue;
                        }
                    }
                    if self.qos.max_blocking_time.is_zero() {
                        log::debug!("[StatefulWriter::write] {} history full: {}", self.guid, reason);
                        return Err(Error::ResourceExhausted(reason));
                    }
                    if self.space.wait_until(&mut state, deadline).timed_out() {
                        log::debug!(
                            "[StatefulWriter::write] {} blocked for {:?}, giving up",
                            self.guid,
                            self.qos.max_blocking_time
                        );
                        return Err(Error::WriteTimeout);
                    }
                    reclaimed = false;
                }
                Err(e) => return Err(e),
            }
        };

        state.seq_gen.commit(seq);
        for proxy in state.proxies.values_mut() {
            proxy.add_change(seq);
        }
        let batch = match self.qos.publish_mode {
            PublishMode::Synchronous => {
                self.collect(&mut state, None, Pass::Unsent, usize::MAX, Instant::now())
            }
            PublishMode::Asynchronous => Batch::default(),
        };
        if self.qos.durability == Durability::Volatile {
            self.reclaim(&mut state, false);
        }
        drop(state);

        send_outbound(&self.sender, self.guid, batch.outbound);
        if self.qos.publish_mode == PublishMode::Asynchronous {
            self.schedule_send();
        }
        Ok(seq)
    }

    /// Block until every reliable reader acknowledged everything written so far.
    ///
    /// # Errors
    /// `WriteTimeout` if some reader is still behind after `timeout`.
    pub fn wait_for_acknowledgments(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        loop {
            let last = state.seq_gen.last();
            let done = state
                .proxies
                .values()
                .filter(|p| p.reliable)
                .all(|p| p.acked_base() > last);
            if done {
                return Ok(());
            }
            if self.acked.wait_until(&mut state, deadline).timed_out() {
                return Err(Error::WriteTimeout);
            }
        }
    }

    /// Highest sequence number written (0 before the first write).
    #[must_use]
    pub fn last_sequence_number(&self) -> u64 {
        self.state.lock().seq_gen.last()
    }

    #[must_use]
    pub fn history_len(&self) -> usize {
        self.state.lock().history.len()
    }

    /// Sequence numbers currently held in history, ascending.
    #[must_use]
    pub fn history_sequence_numbers(&self) -> Vec<u64> {
        self.state.lock().history.sequence_numbers().collect()
    }

    #[must_use]
    pub fn matched_readers(&self) -> Vec<Guid> {
        self.state.lock().proxies.keys().copied().collect()
    }

    /// Status of change `seq` for `reader`, `None` if the reader is unknown.
    #[must_use]
    pub fn reader_status(&self, reader: Guid, seq: u64) -> Option<ChangeForReaderStatus> {
        self.state.lock().proxies.get(&reader).map(|p| p.status(seq))
    }

    // ========================================================================
    // Discovery
    // ========================================================================

    /// Start tracking a remote reader.
    ///
    /// A TRANSIENT_LOCAL reader of a TRANSIENT_LOCAL writer receives the
    /// history; any other reliable reader receives a GAP up to the last
    /// sequence number so it does not wait for changes written before it.
    ///
    /// # Errors
    /// `QosIncompatible` for a reliable reader on a best-effort writer or a
    /// TRANSIENT_LOCAL reader on a VOLATILE writer.
    pub fn match_reader(&self, remote: &RemoteEndpoint) -> Result<()> {
        let reliable = remote.qos.is_reliable();
        if (reliable && !self.qos.is_reliable()) || remote.qos.durability > self.qos.durability {
            return Err(Error::QosIncompatible);
        }
        let now = Instant::now();
        let mut state = self.state.lock();
        if let Some(existing) = state.proxies.get_mut(&remote.guid) {
            existing.locators.clone_from(&remote.locators);
            return Ok(());
        }

        let mut proxy = ReaderProxy::new(
            remote.guid,
            remote.locators.clone(),
            reliable,
            remote.qos.durability,
            self.qos.nack_suppression_duration,
        );
        if reliable {
            let weak = self.self_ref.clone();
            let reader = remote.guid;
            proxy.nack_response = Some(self.scheduler.register(move || {
                if let Some(writer) = weak.upgrade() {
                    writer.on_nack_response(reader);
                }
                EventAction::Done
            }));
        }
        proxy.touch(now);

        let last = state.seq_gen.last();
        let replay = self.qos.durability == Durability::TransientLocal
            && remote.qos.durability == Durability::TransientLocal;
        let first_offered = if replay {
            for seq in state.history.sequence_numbers() {
                proxy.add_change(seq);
            }
            state.history.min().unwrap_or(last + 1)
        } else {
            last + 1
        };

        let mut submessages = Vec::new();
        if reliable {
            if let Some(gap) = Gap::contiguous(
                remote.guid.entity_id,
                self.guid.entity_id,
                RtpsRange::new(1, first_offered),
            ) {
                self.metrics.add_gaps_sent(1);
                submessages.push(Submessage::Gap(gap));
            }
        }
        state.proxies.insert(remote.guid, proxy);

        if self.qos.publish_mode == PublishMode::Synchronous {
            let batch = self.collect(&mut state, Some(remote.guid), Pass::Unsent, usize::MAX, now);
            for out in batch.outbound {
                submessages.extend(out.submessages);
            }
        }
        if reliable && !matches!(submessages.last(), Some(Submessage::Heartbeat(_))) {
            let WriterState {
                history,
                heartbeat_count,
                ..
            } = &mut *state;
            let hb = self.next_heartbeat(history, last, heartbeat_count, remote.guid.entity_id);
            self.metrics.add_heartbeats_sent(1);
            submessages.push(Submessage::Heartbeat(hb));
        }
        drop(state);

        log::debug!(
            "[StatefulWriter::match_reader] {} matched {} (reliable={}, replay={})",
            self.guid,
            remote.guid,
            reliable,
            replay
        );
        send_outbound(
            &self.sender,
            self.guid,
            vec![Outbound {
                dest: remote.guid.prefix,
                locators: remote.locators.clone(),
                submessages,
            }],
        );
        if self.qos.publish_mode == PublishMode::Asynchronous {
            self.schedule_send();
        }
        self.emit(vec![WriterEvent::ReaderMatched(remote.guid)]);
        Ok(())
    }

    /// Stop tracking a remote reader. Returns `false` if it was not matched.
    pub fn unmatch_reader(&self, reader: Guid) -> bool {
        let removed = {
            let mut state = self.state.lock();
            let removed = state.proxies.remove(&reader);
            if removed.is_some() {
                self.reclaim(&mut state, false);
            }
            removed
        };
        // Dropping the proxy cancels its NACK response event.
        let Some(proxy) = removed else {
            return false;
        };
        drop(proxy);
        self.space.notify_all();
        self.acked.notify_all();
        log::debug!("[StatefulWriter::unmatch_reader] {} unmatched {}", self.guid, reader);
        self.emit(vec![WriterEvent::ReaderUnmatched(reader)]);
        true
    }

    // ========================================================================
    // Inbound
    // ========================================================================

    pub(crate) fn on_acknack(&self, source: GuidPrefix, acknack: &AckNack) {
        self.metrics.add_acknacks_received(1);
        let reader = Guid::new(source, acknack.reader_id);
        let now = Instant::now();
        let mut events = Vec::new();
        {
            let mut state = self.state.lock();
            let last = state.seq_gen.last();
            let Some(proxy) = state.proxies.get_mut(&reader) else {
                log::trace!("[StatefulWriter::on_acknack] {} unknown reader {}", self.guid, reader);
                return;
            };
            let base = acknack.ack_base().min(last + 1);
            let requested = acknack.reader_sn_state.iter().filter(|seq| *seq <= last);
            let Some(outcome) = proxy.process_acknack(base, requested, acknack.count, now) else {
                log::trace!(
                    "[StatefulWriter::on_acknack] {} stale count {} from {}",
                    self.guid,
                    acknack.count,
                    reader
                );
                return;
            };
            if outcome.suppressed > 0 {
                self.metrics.add_nacks_suppressed(outcome.suppressed as u64);
            }
            if outcome.requested > 0 {
                log::trace!(
                    "[StatefulWriter::on_acknack] {} {} requested {} change(s)",
                    self.guid,
                    reader,
                    outcome.requested
                );
                if let Some(event) = &proxy.nack_response {
                    event.arm(self.qos.nack_response_delay);
                }
            }
            if outcome.newly_acked {
                events.push(WriterEvent::Acknowledged {
                    reader,
                    up_to: proxy.acked_base() - 1,
                });
                self.reclaim(&mut state, false);
            }
        }
        if !events.is_empty() {
            self.space.notify_all();
            self.acked.notify_all();
        }
        self.emit(events);
    }

    pub(crate) fn on_nack_frag(&self, source: GuidPrefix, nack_frag: &NackFrag) {
        let reader = Guid::new(source, nack_frag.reader_id);
        let mut state = self.state.lock();
        if nack_frag.writer_sn > state.seq_gen.last() {
            return;
        }
        let Some(proxy) = state.proxies.get_mut(&reader) else {
            return;
        };
        let requested = proxy.process_nack_frag(
            nack_frag.writer_sn,
            nack_frag.fragment_number_state.iter(),
            nack_frag.count,
            Instant::now(),
        );
        if requested {
            log::trace!(
                "[StatefulWriter::on_nack_frag] {} {} requested fragments of seq={}",
                self.guid,
                reader,
                nack_frag.writer_sn
            );
            if let Some(event) = &proxy.nack_response {
                event.arm(self.qos.nack_response_delay);
            }
        }
    }

    // ========================================================================
    // Timed events
    // ========================================================================

    fn on_heartbeat_timer(&self) {
        let now = Instant::now();
        let (lost, outbound, has_unsent) = {
            let mut state = self.state.lock();
            let lease = self.qos.lease_duration;
            let expired: Vec<Guid> = state
                .proxies
                .values()
                .filter(|p| p.is_lease_expired(now, lease))
                .map(|p| p.guid)
                .collect();
            let lost: Vec<ReaderProxy> = expired
                .iter()
                .filter_map(|guid| state.proxies.remove(guid))
                .collect();

            let last = state.seq_gen.last();
            let WriterState {
                history,
                proxies,
                heartbeat_count,
                ..
            } = &mut *state;
            let mut outbound = Vec::new();
            let owed: Vec<&ReaderProxy> = proxies
                .values()
                .filter(|p| p.reliable && p.has_pending())
                .collect();
            if !owed.is_empty() {
                let hb = self.next_heartbeat(history, last, heartbeat_count, EntityId::UNKNOWN);
                for proxy in owed {
                    outbound.push(Outbound {
                        dest: proxy.guid.prefix,
                        locators: proxy.locators.clone(),
                        submessages: vec![Submessage::Heartbeat(Heartbeat {
                            reader_id: proxy.guid.entity_id,
                            ..hb
                        })],
                    });
                }
                self.metrics.add_heartbeats_sent(outbound.len() as u64);
            }
            let has_unsent = proxies.values().any(|p| !p.unsent_changes().is_empty());
            self.reclaim(&mut state, false);
            (lost, outbound, has_unsent)
        };

        send_outbound(&self.sender, self.guid, outbound);
        if has_unsent && self.qos.publish_mode == PublishMode::Asynchronous {
            self.schedule_send();
        }
        if !lost.is_empty() {
            let events: Vec<WriterEvent> = lost
                .iter()
                .map(|proxy| {
                    log::debug!(
                        "[StatefulWriter::on_heartbeat_timer] {} lease expired for {}",
                        self.guid,
                        proxy.guid
                    );
                    WriterEvent::ReaderLost(proxy.guid)
                })
                .collect();
            drop(lost);
            self.space.notify_all();
            self.acked.notify_all();
            self.emit(events);
        }
    }

    fn on_nack_response(&self, reader: Guid) {
        if self.flow.is_some() {
            self.schedule_send();
            return;
        }
        let batch = {
            let mut state = self.state.lock();
            self.collect(&mut state, Some(reader), Pass::Repair, usize::MAX, Instant::now())
        };
        send_outbound(&self.sender, self.guid, batch.outbound);
    }

    /// Hand pending traffic to the flow controller or the async flush event.
    fn schedule_send(&self) {
        if let Some(flow) = &self.flow {
            let client: Weak<dyn FlowClient> = self.self_ref.clone();
            flow.submit(self.flow_id(), client);
        } else if let Some(event) = &self.async_flush {
            event.arm(Duration::ZERO);
        }
    }

    fn flow_id(&self) -> u64 {
        u64::from(u32::from_be_bytes(self.guid.entity_id.0))
    }

    // ========================================================================
    // Send passes (called with the state lock held)
    // ========================================================================

    /// Build traffic for every proxy (or only `only`) within `budget` bytes.
    fn collect(
        &self,
        state: &mut WriterState,
        only: Option<Guid>,
        pass: Pass,
        budget: usize,
        now: Instant,
    ) -> Batch {
        let last = state.seq_gen.last();
        let WriterState {
            history,
            proxies,
            heartbeat_count,
            heartbeat_frag_count,
            ..
        } = state;
        let mut batch = Batch::default();

        for proxy in proxies.values_mut() {
            if only.is_some_and(|guid| guid != proxy.guid) {
                continue;
            }
            let left = budget.saturating_sub(batch.bytes);
            let mut part = self.collect_for(history, proxy, pass, left, heartbeat_frag_count, now);
            if part.sent_data && proxy.reliable && self.qos.is_reliable() {
                let hb = self.next_heartbeat(history, last, heartbeat_count, proxy.guid.entity_id);
                let hb = Submessage::Heartbeat(hb);
                part.bytes += hb.encoded_len();
                part.submessages.push(hb);
                self.metrics.add_heartbeats_sent(1);
            }
            batch.bytes += part.bytes;
            if !part.submessages.is_empty() {
                batch.outbound.push(Outbound {
                    dest: proxy.guid.prefix,
                    locators: proxy.locators.clone(),
                    submessages: part.submessages,
                });
            }
            if part.blocked {
                batch.more = true;
                break;
            }
        }
        batch
    }

    fn collect_for(
        &self,
        history: &SampleHistory,
        proxy: &mut ReaderProxy,
        pass: Pass,
        budget: usize,
        heartbeat_frag_count: &mut u32,
        now: Instant,
    ) -> ProxyBatch {
        let mut part = ProxyBatch::default();
        let mut irrelevant = Vec::new();

        if pass != Pass::Unsent {
            for seq in proxy.requested_changes() {
                let Some(change) = history.get(seq) else {
                    irrelevant.push(seq);
                    proxy.mark_sent(seq, now);
                    continue;
                };
                let (cost, complete) = self.append_change(
                    &mut part.submessages,
                    proxy,
                    change,
                    budget.saturating_sub(part.bytes),
                );
                part.bytes += cost;
                part.sent_data |= cost > 0;
                if !complete {
                    part.blocked = true;
                    break;
                }
                proxy.mark_sent(seq, now);
                self.metrics.add_retransmissions(1);
            }

            if !part.blocked && part.bytes < budget {
                let mut requests = proxy.take_requested_fragments().into_iter();
                while let Some((seq, fragments)) = requests.next() {
                    let Some(change) = history.get(seq) else {
                        irrelevant.push(seq);
                        continue;
                    };
                    let total = self.fragmenter.fragment_count(change.len());
                    let mut resent = 0u64;
                    let mut numbers = fragments.into_iter().filter(|n| (1..=total).contains(n));
                    while let Some(number) = numbers.next() {
                        let frag = self.fragmenter.data_frag(change, proxy.guid.entity_id, number);
                        let cost = frag.payload.len() + DATA_FRAG_OVERHEAD;
                        if cost > budget.saturating_sub(part.bytes) {
                            proxy.requeue_fragments(seq, std::iter::once(number).chain(numbers));
                            for (rest_seq, rest) in requests.by_ref() {
                                proxy.requeue_fragments(rest_seq, rest);
                            }
                            part.blocked = true;
                            break;
                        }
                        part.bytes += cost;
                        part.submessages.push(Submessage::DataFrag(frag));
                        resent += 1;
                    }
                    if resent > 0 {
                        *heartbeat_frag_count = heartbeat_frag_count.wrapping_add(1);
                        part.submessages.push(Submessage::HeartbeatFrag(HeartbeatFrag {
                            reader_id: proxy.guid.entity_id,
                            writer_id: self.guid.entity_id,
                            writer_sn: seq,
                            last_fragment_num: total,
                            count: *heartbeat_frag_count,
                        }));
                        self.metrics.add_fragments_resent(resent);
                        part.sent_data = true;
                    }
                }
            } else if pass != Pass::Repair {
                part.blocked = true;
            }
        }

        if pass != Pass::Repair && !part.blocked {
            for seq in proxy.unsent_changes() {
                let Some(change) = history.get(seq) else {
                    // Evicted (KEEP_LAST) before it ever left.
                    irrelevant.push(seq);
                    proxy.mark_sent(seq, now);
                    continue;
                };
                let (cost, complete) = self.append_change(
                    &mut part.submessages,
                    proxy,
                    change,
                    budget.saturating_sub(part.bytes),
                );
                part.bytes += cost;
                part.sent_data |= cost > 0;
                if !complete {
                    part.blocked = true;
                    break;
                }
                proxy.mark_sent(seq, now);
                self.metrics.add_data_sent(1);
            }
        }

        if !irrelevant.is_empty() && proxy.reliable {
            irrelevant.sort_unstable();
            irrelevant.dedup();
            let gaps = Gap::from_sequences(proxy.guid.entity_id, self.guid.entity_id, &irrelevant);
            log::debug!(
                "[StatefulWriter::collect] {} GAP {:?} to {}",
                self.guid,
                irrelevant,
                proxy.guid
            );
            self.metrics.add_gaps_sent(gaps.len() as u64);
            let mut submessages: Vec<Submessage> = gaps.into_iter().map(Submessage::Gap).collect();
            part.bytes += submessages.iter().map(Submessage::encoded_len).sum::<usize>();
            submessages.append(&mut part.submessages);
            part.submessages = submessages;
        }
        part
    }

    /// Append DATA, or the next DATA_FRAGs, for `change`.
    ///
    /// Costs are upper bounds including message framing. Returns the bytes
    /// used and whether the change went out completely.
    fn append_change(
        &self,
        submessages: &mut Vec<Submessage>,
        proxy: &mut ReaderProxy,
        change: &CacheChange,
        budget: usize,
    ) -> (usize, bool) {
        let reader_id = proxy.guid.entity_id;
        if !self.fragmenter.needs_fragmentation(change.len()) {
            let cost = change.len() + DATA_OVERHEAD;
            if cost > budget {
                return (0, false);
            }
            submessages.push(Submessage::InfoTs(change.source_timestamp));
            submessages.push(Submessage::Data(Data {
                reader_id,
                writer_id: self.guid.entity_id,
                writer_sn: change.sequence_number,
                key_hash: key_hash_of(change),
                kind: change.kind,
                payload: (change.kind == ChangeKind::Alive).then(|| Arc::clone(&change.payload)),
            }));
            return (cost, true);
        }

        let seq = change.sequence_number;
        let total = self.fragmenter.fragment_count(change.len());
        let mut next = proxy.next_fragment(seq);
        let mut used = 0;
        while next <= total {
            let frag = self.fragmenter.data_frag(change, reader_id, next);
            let cost = frag.payload.len() + DATA_FRAG_OVERHEAD;
            if used + cost > budget {
                break;
            }
            if used == 0 {
                submessages.push(Submessage::InfoTs(change.source_timestamp));
            }
            submessages.push(Submessage::DataFrag(frag));
            used += cost;
            next += 1;
        }
        proxy.set_next_fragment(seq, next);
        (used, next > total)
    }

    fn next_heartbeat(
        &self,
        history: &SampleHistory,
        last: u64,
        count: &mut u32,
        reader_id: EntityId,
    ) -> Heartbeat {
        *count = count.wrapping_add(1);
        Heartbeat {
            reader_id,
            writer_id: self.guid.entity_id,
            first_sn: history.min().unwrap_or(last + 1),
            last_sn: last,
            count: *count,
            final_flag: false,
            liveliness: false,
        }
    }

    /// Drop changes no matched reader still needs. Returns how many went.
    ///
    /// VOLATILE writers reclaim eagerly. TRANSIENT_LOCAL writers keep
    /// acknowledged changes for late joiners; under history pressure only
    /// the oldest one goes, so the rest stay available for replay.
    fn reclaim(&self, state: &mut WriterState, pressure: bool) -> usize {
        let transient = self.qos.durability == Durability::TransientLocal;
        if transient && !pressure {
            return 0;
        }
        let floor = state
            .proxies
            .values()
            .filter_map(ReaderProxy::lowest_pending)
            .min()
            .unwrap_or(state.seq_gen.last() + 1);
        if floor <= 1 {
            return 0;
        }
        let removed = if transient {
            match state.history.min() {
                Some(oldest) if oldest < floor => usize::from(state.history.remove(oldest).is_some()),
                _ => 0,
            }
        } else {
            state.history.remove_up_to(floor - 1)
        };
        if removed > 0 {
            log::trace!(
                "[StatefulWriter::reclaim] {} removed {} change(s) below {}",
                self.guid,
                removed,
                floor
            );
        }
        removed
    }

    fn emit(&self, events: Vec<WriterEvent>) {
        if events.is_empty() {
            return;
        }
        let listener = self.listener.read().clone();
        if let Some(listener) = listener {
            for event in &events {
                listener(event);
            }
        }
    }
}

impl FlowClient for StatefulWriter {
    fn flush(&self, budget: usize) -> FlushResult {
        let batch = {
            let mut state = self.state.lock();
            let batch = self.collect(&mut state, None, Pass::All, budget, Instant::now());
            if self.qos.durability == Durability::Volatile {
                self.reclaim(&mut state, false);
            }
            batch
        };
        if batch.more {
            self.metrics.add_flow_deferrals(1);
        }
        send_outbound(&self.sender, self.guid, batch.outbound);
        FlushResult {
            bytes: batch.bytes,
            more: batch.more,
        }
    }
}

impl Drop for StatefulWriter {
    fn drop(&mut self) {
        if let Some(flow) = &self.flow {
            flow.remove(self.flow_id());
        }
    }
}

impl std::fmt::Debug for StatefulWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatefulWriter")
            .field("guid", &self.guid)
            .field("reliable", &self.qos.is_reliable())
            .field("heartbeat", &self.heartbeat.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::guid::GuidPrefix;
    use crate::core::timed_event::TimedEventScheduler;
    use crate::reliability::messages::{FragmentNumberSet, RtpsMessage, SequenceNumberSet};
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
        writer: Arc<StatefulWriter>,
    }

    fn writer_guid() -> Guid {
        Guid::new(GuidPrefix([1; 12]), EntityId::writer(1))
    }

    fn reader_guid() -> Guid {
        Guid::new(GuidPrefix([2; 12]), EntityId::reader(1))
    }

    fn fixture(qos: QosProfile) -> Fixture {
        let sched = TimedEventScheduler::new().expect("scheduler");
        let capture = Arc::new(Capture::default());
        let sender = Arc::new(MessageSender::new(GuidPrefix([1; 12]), capture.clone()));
        let writer = StatefulWriter::new(
            writer_guid(),
            qos,
            sender,
            sched.handle(),
            None,
            Arc::new(ReliableMetrics::new()),
        )
        .expect("valid qos");
        Fixture {
            _sched: sched,
            capture,
            writer,
        }
    }

    fn remote_reader(qos: QosProfile) -> RemoteEndpoint {
        RemoteEndpoint::new(
            reader_guid(),
            vec![Locator::intra(GuidPrefix([2; 12]))],
            qos,
        )
    }

    fn acknack(base: u64, missing: &[u64], count: u32) -> AckNack {
        AckNack {
            reader_id: reader_guid().entity_id,
            writer_id: writer_guid().entity_id,
            reader_sn_state: SequenceNumberSet::from_sequences(base, missing.iter().copied()),
            count,
            final_flag: false,
        }
    }

    fn data_seqs(subs: &[Submessage]) -> Vec<u64> {
        subs.iter()
            .filter_map(|s| match s {
                Submessage::Data(d) => Some(d.writer_sn),
                _ => None,
            })
            .collect()
    }

    fn slow_heartbeats() -> QosProfile {
        QosProfile::reliable().heartbeat_period(Duration::from_secs(60))
    }

    #[test]
    fn test_keep_last_history_holds_last_n() {
        let fx = fixture(slow_heartbeats().keep_last(2).transient_local());
        for i in 0..5u8 {
            fx.writer.write(&[i]).expect("write");
        }
        assert_eq!(fx.writer.history_sequence_numbers(), vec![4, 5]);
        assert_eq!(fx.writer.last_sequence_number(), 5);
    }

    #[test]
    fn test_keep_all_without_blocking_fails_when_unacknowledged() {
        let qos = slow_heartbeats()
            .keep_all()
            .max_samples(2)
            .max_blocking_time(Duration::ZERO);
        let fx = fixture(qos);
        fx.writer.match_reader(&remote_reader(QosProfile::reliable())).expect("match");
        fx.writer.write(b"one").expect("first");
        fx.writer.write(b"two").expect("second");
        let err = fx.writer.write(b"three");
        assert!(matches!(err, Err(Error::ResourceExhausted(_))));
        assert_eq!(fx.writer.last_sequence_number(), 2);
    }

    #[test]
    fn test_blocked_write_resumes_after_ack() {
        let qos = slow_heartbeats()
            .keep_all()
            .max_samples(1)
            .max_blocking_time(Duration::from_secs(5));
        let fx = fixture(qos);
        fx.writer.match_reader(&remote_reader(QosProfile::reliable())).expect("match");
        fx.writer.write(b"one").expect("first");

        let writer = Arc::clone(&fx.writer);
        let blocked = std::thread::spawn(move || writer.write(b"two"));
        std::thread::sleep(Duration::from_millis(50));
        fx.writer.on_acknack(reader_guid().prefix, &acknack(2, &[], 1));
        assert_eq!(blocked.join().expect("writer thread").expect("unblocked"), 2);
    }

    #[test]
    fn test_blocked_write_times_out() {
        let qos = slow_heartbeats()
            .keep_all()
            .max_samples(1)
            .max_blocking_time(Duration::from_millis(30));
        let fx = fixture(qos);
        fx.writer.match_reader(&remote_reader(QosProfile::reliable())).expect("match");
        fx.writer.write(b"one").expect("first");
        assert!(matches!(fx.writer.write(b"two"), Err(Error::WriteTimeout)));
    }

    #[test]
    fn test_volatile_late_joiner_gets_gap() {
        let fx = fixture(slow_heartbeats().keep_last(5));
        for _ in 0..3 {
            fx.writer.write(b"x").expect("write");
        }
        fx.capture.drain();
        fx.writer.match_reader(&remote_reader(QosProfile::reliable())).expect("match");
        let subs = fx.capture.drain();
        let gap = subs
            .iter()
            .find_map(|s| match s {
                Submessage::Gap(g) => Some(g.clone()),
                _ => None,
            })
            .expect("GAP sent on match");
        assert_eq!(gap.ranges(), vec![RtpsRange::new(1, 4)]);
        assert!(data_seqs(&subs).is_empty());
        assert!(matches!(subs.last(), Some(Submessage::Heartbeat(_))));
    }

    #[test]
    fn test_transient_local_replays_history() {
        let fx = fixture(slow_heartbeats().keep_last(2).transient_local());
        for _ in 0..5 {
            fx.writer.write(b"x").expect("write");
        }
        fx.capture.drain();
        let reader_qos = QosProfile::reliable().transient_local();
        fx.writer.match_reader(&remote_reader(reader_qos)).expect("match");
        let subs = fx.capture.drain();
        assert_eq!(data_seqs(&subs), vec![4, 5]);
        let gap = subs.iter().find_map(|s| match s {
            Submessage::Gap(g) => Some(g.ranges()),
            _ => None,
        });
        assert_eq!(gap, Some(vec![RtpsRange::new(1, 4)]));
    }

    #[test]
    fn test_incompatible_reader_rejected() {
        let fx = fixture(QosProfile::best_effort());
        let err = fx.writer.match_reader(&remote_reader(QosProfile::reliable()));
        assert!(matches!(err, Err(Error::QosIncompatible)));

        let fx = fixture(slow_heartbeats());
        let err = fx
            .writer
            .match_reader(&remote_reader(QosProfile::reliable().transient_local()));
        assert!(matches!(err, Err(Error::QosIncompatible)));
    }

    #[test]
    fn test_nack_triggers_retransmission() {
        let fx = fixture(slow_heartbeats().keep_last(10).nack_response_delay(Duration::ZERO));
        fx.writer.match_reader(&remote_reader(QosProfile::reliable())).expect("match");
        for _ in 0..4 {
            fx.writer.write(b"x").expect("write");
        }
        fx.capture.drain();

        fx.writer.on_acknack(reader_guid().prefix, &acknack(2, &[2, 4], 1));
        std::thread::sleep(Duration::from_millis(100));
        let subs = fx.capture.drain();
        assert_eq!(data_seqs(&subs), vec![2, 4]);
        assert!(matches!(subs.last(), Some(Submessage::Heartbeat(_))));
        assert_eq!(fx.writer.metrics().snapshot().retransmissions, 2);
        assert_eq!(
            fx.writer.reader_status(reader_guid(), 1),
            Some(ChangeForReaderStatus::Acknowledged)
        );
    }

    #[test]
    fn test_stale_acknack_ignored() {
        let fx = fixture(slow_heartbeats().keep_last(10));
        fx.writer.match_reader(&remote_reader(QosProfile::reliable())).expect("match");
        fx.writer.write(b"x").expect("write");
        fx.writer.write(b"y").expect("write");
        fx.writer.on_acknack(reader_guid().prefix, &acknack(3, &[], 5));
        fx.writer.on_acknack(reader_guid().prefix, &acknack(1, &[1], 4));
        assert_eq!(
            fx.writer.reader_status(reader_guid(), 1),
            Some(ChangeForReaderStatus::Acknowledged)
        );
    }

    #[test]
    fn test_request_for_evicted_change_answered_with_gap() {
        let fx = fixture(
            slow_heartbeats()
                .keep_last(1)
                .transient_local()
                .nack_response_delay(Duration::ZERO),
        );
        fx.writer.match_reader(&remote_reader(QosProfile::reliable())).expect("match");
        fx.writer.write(b"a").expect("write");
        fx.writer.write(b"b").expect("write");
        fx.capture.drain();

        fx.writer.on_acknack(reader_guid().prefix, &acknack(1, &[1], 1));
        std::thread::sleep(Duration::from_millis(100));
        let subs = fx.capture.drain();
        let gap = subs.iter().find_map(|s| match s {
            Submessage::Gap(g) => Some(g.clone()),
            _ => None,
        });
        assert!(gap.expect("GAP for evicted change").contains(1));
        assert!(data_seqs(&subs).is_empty());
    }

    #[test]
    fn test_wait_for_acknowledgments_and_events() {
        let fx = fixture(slow_heartbeats().keep_last(10));
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        fx.writer.set_listener(move |e| sink.lock().push(e.clone()));
        fx.writer.match_reader(&remote_reader(QosProfile::reliable())).expect("match");
        fx.writer.write(b"x").expect("write");

        assert!(matches!(
            fx.writer.wait_for_acknowledgments(Duration::from_millis(20)),
            Err(Error::WriteTimeout)
        ));
        fx.writer.on_acknack(reader_guid().prefix, &acknack(2, &[], 1));
        fx.writer
            .wait_for_acknowledgments(Duration::from_millis(20))
            .expect("acknowledged");
        assert!(fx.writer.unmatch_reader(reader_guid()));

        let events = events.lock();
        assert_eq!(
            *events,
            vec![
                WriterEvent::ReaderMatched(reader_guid()),
                WriterEvent::Acknowledged {
                    reader: reader_guid(),
                    up_to: 1
                },
                WriterEvent::ReaderUnmatched(reader_guid()),
            ]
        );
    }

    #[test]
    fn test_reader_lease_expiry() {
        let qos = QosProfile::reliable()
            .heartbeat_period(Duration::from_millis(10))
            .lease_duration(Duration::from_millis(30));
        let fx = fixture(qos);
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        fx.writer.set_listener(move |e| sink.lock().push(e.clone()));
        fx.writer.match_reader(&remote_reader(QosProfile::reliable())).expect("match");
        fx.writer.write(b"x").expect("write");

        std::thread::sleep(Duration::from_millis(300));
        assert!(fx.writer.matched_readers().is_empty());
        assert!(events
            .lock()
            .contains(&WriterEvent::ReaderLost(reader_guid())));
    }

    #[test]
    fn test_large_sample_is_fragmented() {
        let fx = fixture(slow_heartbeats().keep_last(1));
        fx.writer.match_reader(&remote_reader(QosProfile::reliable())).expect("match");
        fx.capture.drain();
        let payload = vec![7u8; 150_000];
        fx.writer.write(&payload).expect("write");
        let frags: Vec<_> = fx
            .capture
            .drain()
            .into_iter()
            .filter_map(|s| match s {
                Submessage::DataFrag(f) => Some(f),
                _ => None,
            })
            .collect();
        assert_eq!(frags.len() as u32, frags[0].fragment_count());
        let total: usize = frags.iter().map(|f| f.payload.len()).sum();
        assert_eq!(total, payload.len());
    }

    #[test]
    fn test_transient_local_pressure_drops_only_oldest() {
        let qos = slow_heartbeats()
            .keep_all()
            .transient_local()
            .max_samples(3)
            .max_blocking_time(Duration::ZERO);
        let fx = fixture(qos);
        for _ in 0..4 {
            fx.writer.write(b"x").expect("write");
        }
        assert_eq!(fx.writer.history_sequence_numbers(), vec![2, 3, 4]);

        fx.capture.drain();
        let reader_qos = QosProfile::reliable().transient_local();
        fx.writer.match_reader(&remote_reader(reader_qos)).expect("match");
        assert_eq!(data_seqs(&fx.capture.drain()), vec![2, 3, 4]);
    }

    #[test]
    fn test_fragment_repair_respects_flush_budget() {
        let qos = slow_heartbeats()
            .keep_last(1)
            .nack_response_delay(Duration::from_secs(60));
        let fx = fixture(qos);
        fx.writer.match_reader(&remote_reader(QosProfile::reliable())).expect("match");
        fx.capture.drain();
        fx.writer.write(&vec![3u8; 150_000]).expect("write");
        let first: Vec<_> = fx
            .capture
            .drain()
            .into_iter()
            .filter_map(|s| match s {
                Submessage::DataFrag(f) => Some(f),
                _ => None,
            })
            .collect();
        let total = first[0].fragment_count();
        assert!(total >= 3);
        let frag_cost = first[0].payload.len() + DATA_FRAG_OVERHEAD;

        fx.writer.on_nack_frag(
            reader_guid().prefix,
            &NackFrag {
                reader_id: reader_guid().entity_id,
                writer_id: writer_guid().entity_id,
                writer_sn: 1,
                fragment_number_state: FragmentNumberSet::from_fragments(1, 1..=total),
                count: 1,
            },
        );

        let frag_numbers = |subs: Vec<Submessage>| -> Vec<u32> {
            subs.into_iter()
                .filter_map(|s| match s {
                    Submessage::DataFrag(f) => Some(f.fragment_starting_num),
                    _ => None,
                })
                .collect()
        };

        let result = fx.writer.flush(2 * frag_cost);
        assert!(result.more, "remaining fragments wait for the next period");
        assert_eq!(frag_numbers(fx.capture.drain()), vec![1, 2]);

        let result = fx.writer.flush(usize::MAX);
        assert!(!result.more);
        assert_eq!(frag_numbers(fx.capture.drain()), (3..=total).collect::<Vec<_>>());
    }
}
