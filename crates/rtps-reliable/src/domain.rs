// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Domain context and participants.
//!
//! `DomainContext` owns the event thread shared by every endpoint of the
//! domain, and the participants created through it. There is no global
//! registry: callers hold the context and create/delete explicitly.
//!
//! A `Participant` owns its endpoints, its named flow controllers and one
//! `MessageSender`. It is the `MessageReceiver` attached to the transport:
//! inbound messages are decoded here and routed by INFO_DST prefix and
//! entity id to the local writer or readers.
//!
//! ```text
//!  transport ──on_receive──▶ Participant ──security decode──▶ RtpsMessage::decode
//!                                │
//!          ┌─────────────────────┼───────────────────────┐
//!    ACKNACK/NACK_FRAG     DATA/DATA_FRAG/GAP      HEARTBEAT(_FRAG)
//!          ▼                     ▼                       ▼
//!    StatefulWriter        StatefulReader(s)       StatefulReader(s)
//! ```

use crate::congestion::FlowController;
use crate::core::change::Time;
use crate::core::guid::{EntityId, Guid, GuidPrefix};
use crate::core::timed_event::{SchedulerHandle, TimedEventScheduler};
use crate::error::{Error, Result};
use crate::qos::{FlowControllerConfig, QosProfile};
use crate::reliability::messages::{RtpsMessage, Submessage};
use crate::reliability::metrics::ReliableMetrics;
use crate::reliability::{RemoteEndpoint, StatefulReader, StatefulWriter};
use crate::transport::{Locator, MessageReceiver, MessageSender, SecurityFilter, Transport};
use dashmap::DashMap;
use std::sync::atomic::{AtomicU16, AtomicU32, Ordering};
use std::sync::{Arc, Weak};

// ============================================================================
// DomainContext
// ============================================================================

/// Explicit owner of one domain's participants and event thread.
pub struct DomainContext {
    domain_id: u32,
    // Participants go before the scheduler their endpoints use.
    participants: DashMap<GuidPrefix, Arc<Participant>>,
    scheduler: TimedEventScheduler,
    next_participant_id: AtomicU16,
}

impl DomainContext {
    /// Create a domain context and start its event thread.
    ///
    /// # Errors
    /// `InvalidState` if the event thread cannot be spawned.
    pub fn new(domain_id: u32) -> Result<Self> {
        let scheduler = TimedEventScheduler::new()?;
        log::debug!("[DomainContext::new] domain {}", domain_id);
        Ok(Self {
            domain_id,
            participants: DashMap::new(),
            scheduler,
            next_participant_id: AtomicU16::new(1),
        })
    }

    #[must_use]
    pub fn domain_id(&self) -> u32 {
        self.domain_id
    }

    #[must_use]
    pub fn scheduler(&self) -> SchedulerHandle {
        self.scheduler.handle()
    }

    /// Create a participant reachable at its in-process locator.
    ///
    /// # Errors
    /// Propagates `Transport::attach` failures.
    pub fn create_participant(&self, transport: Arc<dyn Transport>) -> Result<Arc<Participant>> {
        let prefix = self.next_prefix();
        self.attach_participant(prefix, Locator::intra(prefix), transport)
    }

    /// Create a participant reachable at `locator`.
    ///
    /// # Errors
    /// Propagates `Transport::attach` failures.
    pub fn create_participant_at(
        &self,
        transport: Arc<dyn Transport>,
        locator: Locator,
    ) -> Result<Arc<Participant>> {
        let prefix = self.next_prefix();
        self.attach_participant(prefix, locator, transport)
    }

    /// Detach and drop a participant with all its endpoints.
    ///
    /// # Errors
    /// `UnknownEndpoint` if no participant has that prefix.
    pub fn delete_participant(&self, prefix: GuidPrefix) -> Result<()> {
        let (_, participant) = self
            .participants
            .remove(&prefix)
            .ok_or(Error::UnknownEndpoint)?;
        participant.shutdown();
        log::debug!("[DomainContext::delete_participant] {}", prefix);
        Ok(())
    }

    #[must_use]
    pub fn participant(&self, prefix: GuidPrefix) -> Option<Arc<Participant>> {
        self.participants.get(&prefix).map(|p| Arc::clone(p.value()))
    }

    #[must_use]
    pub fn participant_count(&self) -> usize {
        self.participants.len()
    }

    fn next_prefix(&self) -> GuidPrefix {
        let id = self.next_participant_id.fetch_add(1, Ordering::Relaxed);
        GuidPrefix::for_participant(self.domain_id, id)
    }

    fn attach_participant(
        &self,
        prefix: GuidPrefix,
        locator: Locator,
        transport: Arc<dyn Transport>,
    ) -> Result<Arc<Participant>> {
        let participant = Arc::new(Participant::new(
            prefix,
            locator,
            Arc::clone(&transport),
            self.scheduler.handle(),
        ));
        let weak = Arc::downgrade(&participant);
        let receiver: Weak<dyn MessageReceiver> = weak;
        transport.attach(locator, receiver)?;
        self.participants.insert(prefix, Arc::clone(&participant));
        log::debug!(
            "[DomainContext::create_participant] {} at {}",
            prefix,
            locator
        );
        Ok(participant)
    }
}

impl Drop for DomainContext {
    fn drop(&mut self) {
        for entry in self.participants.iter() {
            entry.value().shutdown();
        }
        self.participants.clear();
    }
}

impl std::fmt::Debug for DomainContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DomainContext")
            .field("domain_id", &self.domain_id)
            .field("participants", &self.participants.len())
            .finish()
    }
}

// ============================================================================
// Participant
// ============================================================================

/// Local participant: endpoint factory and inbound message router.
pub struct Participant {
    prefix: GuidPrefix,
    locator: Locator,
    sender: Arc<MessageSender>,
    scheduler: SchedulerHandle,
    writers: DashMap<EntityId, Arc<StatefulWriter>>,
    readers: DashMap<EntityId, Arc<StatefulReader>>,
    flow_controllers: DashMap<String, Arc<FlowController>>,
    next_entity_key: AtomicU32,
    metrics: Arc<ReliableMetrics>,
}

impl Participant {
    fn new(
        prefix: GuidPrefix,
        locator: Locator,
        transport: Arc<dyn Transport>,
        scheduler: SchedulerHandle,
    ) -> Self {
        Self {
            prefix,
            locator,
            sender: Arc::new(MessageSender::new(prefix, transport)),
            scheduler,
            writers: DashMap::new(),
            readers: DashMap::new(),
            flow_controllers: DashMap::new(),
            next_entity_key: AtomicU32::new(1),
            metrics: Arc::new(ReliableMetrics::new()),
        }
    }

    #[must_use]
    pub fn guid_prefix(&self) -> GuidPrefix {
        self.prefix
    }

    #[must_use]
    pub fn locator(&self) -> Locator {
        self.locator
    }

    /// Participant-level counters (malformed input).
    #[must_use]
    pub fn metrics(&self) -> &ReliableMetrics {
        &self.metrics
    }

    /// Install or remove the filter applied to every message in and out.
    pub fn set_security_filter(&self, filter: Option<Arc<dyn SecurityFilter>>) {
        self.sender.set_security_filter(filter);
    }

    // ------------------------------------------------------------------------
    // Endpoints
    // ------------------------------------------------------------------------

    /// Create a writer. A QoS naming a flow controller attaches the writer
    /// to the participant's controller of that name (created on first use).
    ///
    /// # Errors
    /// `InvalidQos` for an invalid profile or flow controller config.
    pub fn create_writer(&self, qos: QosProfile) -> Result<Arc<StatefulWriter>> {
        qos.validate()?;
        let flow = match &qos.flow_controller {
            Some(config) => Some(self.flow_controller(config.clone())?),
            None => None,
        };
        let guid = Guid::new(self.prefix, EntityId::writer(self.next_key()));
        let writer = StatefulWriter::new(
            guid,
            qos,
            Arc::clone(&self.sender),
            self.scheduler.clone(),
            flow,
            Arc::new(ReliableMetrics::new()),
        )?;
        self.writers.insert(guid.entity_id, Arc::clone(&writer));
        Ok(writer)
    }

    /// Create a reader.
    ///
    /// # Errors
    /// `InvalidQos` for an invalid profile.
    pub fn create_reader(&self, qos: QosProfile) -> Result<Arc<StatefulReader>> {
        let guid = Guid::new(self.prefix, EntityId::reader(self.next_key()));
        let reader = StatefulReader::new(
            guid,
            qos,
            Arc::clone(&self.sender),
            self.scheduler.clone(),
            Arc::new(ReliableMetrics::new()),
        )?;
        self.readers.insert(guid.entity_id, Arc::clone(&reader));
        Ok(reader)
    }

    /// Get or create the named flow controller.
    ///
    /// # Errors
    /// `InvalidQos` when the budget per period is below one message.
    pub fn flow_controller(&self, config: FlowControllerConfig) -> Result<Arc<FlowController>> {
        if let Some(existing) = self.flow_controllers.get(&config.name) {
            if existing.config() != &config {
                log::warn!(
                    "[Participant::flow_controller] '{}' already exists with a different config, keeping it",
                    config.name
                );
            }
            return Ok(Arc::clone(existing.value()));
        }
        let name = config.name.clone();
        let controller =
            FlowController::new(config, &self.scheduler, self.sender.max_message_size())?;
        Ok(Arc::clone(
            self.flow_controllers
                .entry(name)
                .or_insert(controller)
                .value(),
        ))
    }

    /// # Errors
    /// `UnknownEndpoint` if the writer does not belong to this participant.
    pub fn delete_writer(&self, guid: Guid) -> Result<()> {
        if guid.prefix != self.prefix {
            return Err(Error::UnknownEndpoint);
        }
        self.writers
            .remove(&guid.entity_id)
            .map(|_| ())
            .ok_or(Error::UnknownEndpoint)
    }

    /// # Errors
    /// `UnknownEndpoint` if the reader does not belong to this participant.
    pub fn delete_reader(&self, guid: Guid) -> Result<()> {
        if guid.prefix != self.prefix {
            return Err(Error::UnknownEndpoint);
        }
        self.readers
            .remove(&guid.entity_id)
            .map(|_| ())
            .ok_or(Error::UnknownEndpoint)
    }

    #[must_use]
    pub fn writer(&self, guid: Guid) -> Option<Arc<StatefulWriter>> {
        if guid.prefix != self.prefix {
            return None;
        }
        self.writers.get(&guid.entity_id).map(|w| Arc::clone(w.value()))
    }

    #[must_use]
    pub fn reader(&self, guid: Guid) -> Option<Arc<StatefulReader>> {
        if guid.prefix != self.prefix {
            return None;
        }
        self.readers.get(&guid.entity_id).map(|r| Arc::clone(r.value()))
    }

    /// Descriptor of a local endpoint as discovery would announce it.
    #[must_use]
    pub fn describe(&self, guid: Guid) -> Option<RemoteEndpoint> {
        let qos = if guid.entity_id.is_writer() {
            self.writer(guid)?.qos().clone()
        } else {
            self.reader(guid)?.qos().clone()
        };
        Some(RemoteEndpoint::new(guid, vec![self.locator], qos))
    }

    // ------------------------------------------------------------------------
    // Discovery events
    // ------------------------------------------------------------------------

    /// A remote endpoint matched local endpoint `local`.
    ///
    /// # Errors
    /// - `UnknownEndpoint` if `local` is not one of ours
    /// - `QosIncompatible` if the QoS pair cannot be matched
    pub fn on_matched(&self, local: Guid, remote: RemoteEndpoint) -> Result<()> {
        if let Some(writer) = self.writer(local) {
            return writer.match_reader(&remote);
        }
        if let Some(reader) = self.reader(local) {
            return reader.match_writer(&remote);
        }
        Err(Error::UnknownEndpoint)
    }

    /// A remote endpoint went away. Returns `false` if it was not matched.
    ///
    /// # Errors
    /// `UnknownEndpoint` if `local` is not one of ours.
    pub fn on_unmatched(&self, local: Guid, remote: Guid) -> Result<bool> {
        if let Some(writer) = self.writer(local) {
            return Ok(writer.unmatch_reader(remote));
        }
        if let Some(reader) = self.reader(local) {
            return Ok(reader.unmatch_writer(remote));
        }
        Err(Error::UnknownEndpoint)
    }

    // ------------------------------------------------------------------------
    // Inbound routing
    // ------------------------------------------------------------------------

    fn next_key(&self) -> u32 {
        self.next_entity_key.fetch_add(1, Ordering::Relaxed)
    }

    /// Readers a reader-side submessage is addressed to. ENTITYID_UNKNOWN
    /// means every local reader matched with the writer.
    fn target_readers(&self, reader_id: EntityId, writer: Guid) -> Vec<Arc<StatefulReader>> {
        if reader_id.is_unknown() {
            self.readers
                .iter()
                .filter(|r| r.value().is_matched(writer))
                .map(|r| Arc::clone(r.value()))
                .collect()
        } else {
            self.readers
                .get(&reader_id)
                .map(|r| Arc::clone(r.value()))
                .into_iter()
                .collect()
        }
    }

    fn target_writer(&self, writer_id: EntityId) -> Option<Arc<StatefulWriter>> {
        self.writers.get(&writer_id).map(|w| Arc::clone(w.value()))
    }

    fn route(&self, message: RtpsMessage) {
        let source = message.guid_prefix;
        let mut for_us = true;
        let mut timestamp: Option<Time> = None;
        for sub in &message.submessages {
            match sub {
                Submessage::InfoDst(dest) => {
                    for_us = dest.is_unknown() || *dest == self.prefix;
                }
                Submessage::InfoTs(ts) => timestamp = *ts,
                _ if !for_us => {}
                Submessage::Data(data) => {
                    let writer = Guid::new(source, data.writer_id);
                    for reader in self.target_readers(data.reader_id, writer) {
                        reader.on_data(source, data, timestamp);
                    }
                }
                Submessage::DataFrag(frag) => {
                    let writer = Guid::new(source, frag.writer_id);
                    for reader in self.target_readers(frag.reader_id, writer) {
                        reader.on_data_frag(source, frag, timestamp);
                    }
                }
                Submessage::Gap(gap) => {
                    let writer = Guid::new(source, gap.writer_id);
                    for reader in self.target_readers(gap.reader_id, writer) {
                        reader.on_gap(source, gap);
                    }
                }
                Submessage::Heartbeat(hb) => {
                    let writer = Guid::new(source, hb.writer_id);
                    for reader in self.target_readers(hb.reader_id, writer) {
                        reader.on_heartbeat(source, hb);
                    }
                }
                Submessage::HeartbeatFrag(hb) => {
                    let writer = Guid::new(source, hb.writer_id);
                    for reader in self.target_readers(hb.reader_id, writer) {
                        reader.on_heartbeat_frag(source, hb);
                    }
                }
                Submessage::AckNack(acknack) => {
                    if let Some(writer) = self.target_writer(acknack.writer_id) {
                        writer.on_acknack(source, acknack);
                    }
                }
                Submessage::NackFrag(nack) => {
                    if let Some(writer) = self.target_writer(nack.writer_id) {
                        writer.on_nack_frag(source, nack);
                    }
                }
            }
        }
    }

    /// Stop receiving and drop every endpoint.
    fn shutdown(&self) {
        self.sender.transport().detach(&self.locator);
        self.writers.clear();
        self.readers.clear();
        self.flow_controllers.clear();
    }
}

impl MessageReceiver for Participant {
    fn on_receive(&self, bytes: &[u8]) {
        let decoded;
        let bytes = match self.sender.security_filter() {
            Some(filter) => match filter.decode(bytes) {
                Ok(plain) => {
                    decoded = plain;
                    &decoded[..]
                }
                Err(e) => {
                    self.metrics.add_malformed_dropped(1);
                    log::warn!("[Participant::on_receive] {} security decode failed: {}", self.prefix, e);
                    return;
                }
            },
            None => bytes,
        };
        match RtpsMessage::decode(bytes) {
            Ok(message) => self.route(message),
            Err(e) => {
                self.metrics.add_malformed_dropped(1);
                log::warn!("[Participant::on_receive] {} dropped message: {}", self.prefix, e);
            }
        }
    }
}

impl std::fmt::Debug for Participant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Participant")
            .field("prefix", &self.prefix)
            .field("locator", &self.locator)
            .field("writers", &self.writers.len())
            .field("readers", &self.readers.len())
            .finish()
    }
}
