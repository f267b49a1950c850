// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Protocol constants and engine defaults.
//!
//! Every wire constant and default timing used by the engine lives here.
//! QoS values override the defaults per endpoint.

use std::time::Duration;

// =======================================================================
// RTPS message framing
// =======================================================================

/// RTPS message magic.
pub const RTPS_MAGIC: &[u8; 4] = b"RTPS";

/// Protocol version emitted in the message header (2.3).
pub const PROTOCOL_VERSION: [u8; 2] = [2, 3];

/// Vendor id emitted in the message header.
pub const VENDOR_ID: [u8; 2] = [0x01, 0xAA];

/// RTPS header: magic(4) + version(2) + vendor(2) + guidPrefix(12).
pub const RTPS_HEADER_LEN: usize = 20;

/// Submessage header: id(1) + flags(1) + octetsToNextHeader(2).
pub const SUBMESSAGE_HEADER_LEN: usize = 4;

/// Submessage identifiers (RTPS v2.3 Sec.9.4.5.1.1).
pub mod submessage_id {
    /// Padding (skipped on receive).
    pub const PAD: u8 = 0x01;
    /// Reader acknowledgment / negative acknowledgment.
    pub const ACKNACK: u8 = 0x06;
    /// Writer announcement of available sequence range.
    pub const HEARTBEAT: u8 = 0x07;
    /// Writer declaration of irrelevant sequence numbers.
    pub const GAP: u8 = 0x08;
    /// Source timestamp for following submessages.
    pub const INFO_TS: u8 = 0x09;
    /// Destination GUID prefix for following submessages.
    pub const INFO_DST: u8 = 0x0e;
    /// Reader request for missing fragments.
    pub const NACK_FRAG: u8 = 0x12;
    /// Writer announcement of available fragments.
    pub const HEARTBEAT_FRAG: u8 = 0x13;
    /// Sample.
    pub const DATA: u8 = 0x15;
    /// Sample fragment(s).
    pub const DATA_FRAG: u8 = 0x16;
}

/// Submessage flag bits.
pub mod flags {
    /// Endianness (set = little-endian).
    pub const ENDIANNESS: u8 = 0x01;
    /// HEARTBEAT/ACKNACK: no response required.
    pub const FINAL: u8 = 0x02;
    /// HEARTBEAT: manual liveliness assertion.
    pub const LIVELINESS: u8 = 0x04;
    /// DATA/DATA_FRAG: inline QoS present.
    pub const INLINE_QOS: u8 = 0x02;
    /// DATA: serialized payload present.
    pub const DATA_PRESENT: u8 = 0x04;
    /// DATA_FRAG: fragments carry a serialized key.
    pub const KEY: u8 = 0x04;
    /// INFO_TS: timestamp invalidated (no body).
    pub const INVALIDATE: u8 = 0x02;
}

/// Inline QoS parameter ids.
pub mod pid {
    /// End of parameter list.
    pub const SENTINEL: u16 = 0x0001;
    /// 16-byte instance key hash.
    pub const KEY_HASH: u16 = 0x0070;
    /// Status info flags (disposed / unregistered).
    pub const STATUS_INFO: u16 = 0x0071;
}

/// Serialized payload encapsulation id (CDR little-endian).
pub const ENCAPSULATION_CDR_LE: [u8; 2] = [0x00, 0x01];

// =======================================================================
// Sizes
// =======================================================================

/// Default maximum size of one encoded RTPS message.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 65_000;

/// Worst-case bytes of framing around one DATA_FRAG fragment:
/// RTPS header + INFO_DST + INFO_TS + DATA_FRAG header with full inline QoS + padding.
pub const DATA_FRAG_OVERHEAD: usize = RTPS_HEADER_LEN + 16 + 12 + 4 + 32 + 40 + 4;

/// Worst-case bytes of framing around one DATA payload.
pub const DATA_OVERHEAD: usize = RTPS_HEADER_LEN + 16 + 12 + 4 + 20 + 40 + 4 + 4;

/// Maximum bitmap width of SequenceNumberSet / FragmentNumberSet.
pub const MAX_BITMAP_BITS: u32 = 256;

/// Maximum number of partially received samples buffered per reader.
pub const DEFAULT_MAX_PENDING_REASSEMBLIES: usize = 64;

/// Upper bound on changes a reader holds ahead of a hole, per writer.
pub const DEFAULT_MAX_OUT_OF_ORDER: usize = 4096;

/// Largest sample a reader agrees to reassemble from DATA_FRAGs.
pub const DEFAULT_MAX_SAMPLE_SIZE: usize = 16 * 1024 * 1024;

// =======================================================================
// Timing defaults
// =======================================================================

/// Default writer heartbeat period.
pub const DEFAULT_HEARTBEAT_PERIOD: Duration = Duration::from_millis(100);

/// Default delay between a NACK and the retransmission pass it triggers.
pub const DEFAULT_NACK_RESPONSE_DELAY: Duration = Duration::from_millis(5);

/// Default window after a send during which NACKs for that change are ignored.
pub const DEFAULT_NACK_SUPPRESSION_DURATION: Duration = Duration::ZERO;

/// Default delay between a HEARTBEAT and the ACKNACK answering it.
pub const DEFAULT_HEARTBEAT_RESPONSE_DELAY: Duration = Duration::from_millis(5);

/// Default time a reliable reader may stay silent while owing acknowledgments.
pub const DEFAULT_LEASE_DURATION: Duration = Duration::from_secs(30);

/// Default time a writer may block waiting for history room.
pub const DEFAULT_MAX_BLOCKING_TIME: Duration = Duration::from_millis(100);

/// Default lifetime of an incomplete fragment reassembly.
pub const DEFAULT_FRAGMENT_TIMEOUT: Duration = Duration::from_secs(5);
