// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Transport boundary of the engine.
//!
//! The engine only needs two capabilities from the outside world:
//! - `Transport::send(locator, bytes)` for outbound messages
//! - an inbound upcall (`MessageReceiver::on_receive`) fed by whatever
//!   receive loop the transport runs
//!
//! Socket mechanics, locator selection across several transports and
//! buffering stay outside. An optional `SecurityFilter` wraps every
//! message crossing the boundary.
//!
//! # Implementations
//!
//! - `IntraProcessHub` - in-process delivery on crossbeam channels, with
//!   loss injection for tests

pub mod intra;
pub mod sender;

pub use intra::{HubStats, IntraProcessHub};
pub use sender::MessageSender;

use crate::config::DEFAULT_MAX_MESSAGE_SIZE;
use crate::core::guid::GuidPrefix;
use crate::error::Result;
use std::fmt;
use std::sync::Weak;

/// RTPS locator: transport kind, port and 16-byte address.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Locator {
    pub kind: i32,
    pub port: u32,
    pub address: [u8; 16],
}

impl Locator {
    pub const KIND_INVALID: i32 = -1;
    pub const KIND_UDPV4: i32 = 1;
    pub const KIND_UDPV6: i32 = 2;
    /// Vendor-specific kind for in-process delivery.
    pub const KIND_INTRA: i32 = 0x0100_0000;

    /// UDPv4 locator (address in the last 4 bytes).
    #[must_use]
    pub fn udpv4(ip: [u8; 4], port: u16) -> Self {
        let mut address = [0u8; 16];
        address[12..16].copy_from_slice(&ip);
        Self {
            kind: Self::KIND_UDPV4,
            port: u32::from(port),
            address,
        }
    }

    /// In-process locator addressing the participant `prefix`.
    #[must_use]
    pub fn intra(prefix: GuidPrefix) -> Self {
        let mut address = [0u8; 16];
        address[4..16].copy_from_slice(&prefix.0);
        Self {
            kind: Self::KIND_INTRA,
            port: 0,
            address,
        }
    }
}

impl fmt::Display for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            Self::KIND_UDPV4 => {
                let a = &self.address[12..16];
                write!(f, "udpv4://{}.{}.{}.{}:{}", a[0], a[1], a[2], a[3], self.port)
            }
            Self::KIND_INTRA => {
                let mut prefix = [0u8; 12];
                prefix.copy_from_slice(&self.address[4..16]);
                write!(f, "intra://{}", GuidPrefix(prefix))
            }
            kind => write!(f, "locator(kind={}, port={})", kind, self.port),
        }
    }
}

impl fmt::Debug for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Locator({})", self)
    }
}

/// Inbound upcall registered with a transport.
pub trait MessageReceiver: Send + Sync {
    /// One complete RTPS message (possibly security-encoded).
    fn on_receive(&self, bytes: &[u8]);
}

/// Outbound send capability.
pub trait Transport: Send + Sync {
    /// Send one message to `locator`.
    ///
    /// # Errors
    /// `SendFailed` when the transport cannot hand the bytes off.
    fn send(&self, locator: &Locator, bytes: &[u8]) -> Result<()>;

    /// Largest message the transport accepts.
    fn max_message_size(&self) -> usize {
        DEFAULT_MAX_MESSAGE_SIZE
    }

    /// Start delivering traffic addressed to `locator` to `receiver`.
    ///
    /// The transport holds only a weak reference; delivery stops once the
    /// receiver is dropped.
    fn attach(&self, locator: Locator, receiver: Weak<dyn MessageReceiver>) -> Result<()>;

    /// Stop delivering traffic for `locator`.
    fn detach(&self, locator: &Locator);
}

/// Optional transform applied to every message crossing the transport boundary.
pub trait SecurityFilter: Send + Sync {
    /// Protect an outbound message.
    fn encode(&self, message: &[u8]) -> Vec<u8>;

    /// Unprotect an inbound message.
    ///
    /// # Errors
    /// Any error drops the message.
    fn decode(&self, message: &[u8]) -> Result<Vec<u8>>;
}
