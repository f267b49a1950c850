// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! # rtps-reliable - RTPS reliable delivery engine
//!
//! Sample history, writer/reader proxies, heartbeat/ACKNACK/GAP repair,
//! fragmentation and publish-rate flow control for an RTPS-style
//! publish/subscribe middleware. Discovery and sockets stay outside: the
//! engine consumes match/unmatch events and a `Transport` capability.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use rtps_reliable::{DomainContext, IntraProcessHub, QosProfile, Result};
//! use std::time::Duration;
//!
//! fn main() -> Result<()> {
//!     let domain = DomainContext::new(0)?;
//!     let hub = IntraProcessHub::new();
//!     let alice = domain.create_participant(hub.clone())?;
//!     let bob = domain.create_participant(hub)?;
//!
//!     let qos = QosProfile::reliable().keep_all();
//!     let writer = alice.create_writer(qos.clone())?;
//!     let reader = bob.create_reader(qos)?;
//!
//!     // Normally driven by discovery
//!     if let (Some(w), Some(r)) = (alice.describe(writer.guid()), bob.describe(reader.guid())) {
//!         alice.on_matched(writer.guid(), r)?;
//!         bob.on_matched(reader.guid(), w)?;
//!     }
//!
//!     writer.write(b"hello")?;
//!     if reader.wait_for_data(Duration::from_secs(1)) {
//!         let sample = reader.take();
//!         println!("{:?}", sample.map(|s| s.sequence_number));
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! +---------------------------------------------------------------------+
//! |  DomainContext -> Participant -> StatefulWriter / StatefulReader    |
//! +---------------------------------------------------------------------+
//! |  SampleHistory | ReaderProxy / WriterProxy | Fragmenter / Assembler |
//! +---------------------------------------------------------------------+
//! |  TimedEventScheduler (heartbeats, NACK responses, refills)          |
//! |  FlowController (token bucket, FIFO / round-robin)                  |
//! +---------------------------------------------------------------------+
//! |  MessageSender -> [SecurityFilter] -> Transport                     |
//! +---------------------------------------------------------------------+
//! ```
//!
//! ## Modules Overview
//!
//! - [`reliability`] - endpoint state machines, proxies, wire codec
//! - [`qos`] - QoS profiles (and YAML loading with `qos-loaders`)
//! - [`congestion`] - flow controllers
//! - [`transport`] - transport boundary and in-process hub
//! - [`domain`] - domain context and participants

/// Protocol constants and engine defaults.
pub mod config;
/// Publish pacing (token bucket, flow controllers).
pub mod congestion;
/// GUIDs, cache changes and the timed event scheduler.
pub mod core;
/// Domain context, participants and inbound routing.
pub mod domain;
/// Crate-wide error type.
pub mod error;
/// `QoS` profiles consumed by the engine.
pub mod qos;
/// Reliable delivery engine (history, proxies, writer, reader, codec).
pub mod reliability;
/// Transport boundary (send capability, receive upcall, security filter).
pub mod transport;

pub use crate::core::{CacheChange, ChangeKind, EntityId, Guid, GuidPrefix, InstanceKey};
pub use congestion::{FlowController, FlowStats};
pub use domain::{DomainContext, Participant};
pub use error::{Error, Result};
pub use qos::{
    Durability, FlowControllerConfig, FlowScheduler, History, PublishMode, QosProfile,
    Reliability, ResourceLimits,
};
pub use reliability::{
    MetricsSnapshot, ReaderEvent, ReliableMetrics, RemoteEndpoint, StatefulReader,
    StatefulWriter, WriterEvent,
};
pub use transport::{IntraProcessHub, Locator, MessageReceiver, SecurityFilter, Transport};

/// Crate version string.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
