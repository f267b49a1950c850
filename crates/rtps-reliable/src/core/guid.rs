// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! RTPS GUID primitives: participant prefix, entity id, full GUID.

use std::fmt;

/// 12-byte participant identifier shared by all endpoints of one participant.
#[derive(Copy, Clone, Eq, PartialEq, Hash, PartialOrd, Ord, Default)]
pub struct GuidPrefix(pub [u8; 12]);

impl GuidPrefix {
    /// GUIDPREFIX_UNKNOWN (INFO_DST with this prefix addresses everyone).
    pub const UNKNOWN: GuidPrefix = GuidPrefix([0; 12]);

    /// Build a prefix for participant `participant_id` of `domain_id` in this process.
    ///
    /// # Layout
    /// - bytes 0-1: vendor id
    /// - bytes 2-5: process id (big-endian)
    /// - bytes 6-9: domain id (big-endian)
    /// - bytes 10-11: participant id (big-endian)
    #[must_use]
    pub fn for_participant(domain_id: u32, participant_id: u16) -> Self {
        let mut prefix = [0u8; 12];
        prefix[0..2].copy_from_slice(&crate::config::VENDOR_ID);
        prefix[2..6].copy_from_slice(&std::process::id().to_be_bytes());
        prefix[6..10].copy_from_slice(&domain_id.to_be_bytes());
        prefix[10..12].copy_from_slice(&participant_id.to_be_bytes());
        Self(prefix)
    }

    #[must_use]
    pub fn is_unknown(&self) -> bool {
        *self == Self::UNKNOWN
    }
}

impl fmt::Display for GuidPrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, byte) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ".")?;
            }
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl fmt::Debug for GuidPrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GuidPrefix({})", self)
    }
}

/// 4-byte endpoint identifier within a participant: 3-byte key + 1-byte kind.
#[derive(Copy, Clone, Eq, PartialEq, Hash, PartialOrd, Ord, Default)]
pub struct EntityId(pub [u8; 4]);

impl EntityId {
    /// ENTITYID_UNKNOWN (reader side wildcard in writer submessages).
    pub const UNKNOWN: EntityId = EntityId([0; 4]);
    /// ENTITYID_PARTICIPANT.
    pub const PARTICIPANT: EntityId = EntityId([0x00, 0x00, 0x01, 0xC1]);

    /// User-defined writer, keyed topic.
    pub const KIND_WRITER_WITH_KEY: u8 = 0x02;
    /// User-defined writer, keyless topic.
    pub const KIND_WRITER_NO_KEY: u8 = 0x03;
    /// User-defined reader, keyless topic.
    pub const KIND_READER_NO_KEY: u8 = 0x04;
    /// User-defined reader, keyed topic.
    pub const KIND_READER_WITH_KEY: u8 = 0x07;

    /// User writer entity with a 24-bit key.
    #[must_use]
    pub fn writer(key: u32) -> Self {
        Self::with_kind(key, Self::KIND_WRITER_WITH_KEY)
    }

    /// User reader entity with a 24-bit key.
    #[must_use]
    pub fn reader(key: u32) -> Self {
        Self::with_kind(key, Self::KIND_READER_WITH_KEY)
    }

    fn with_kind(key: u32, kind: u8) -> Self {
        let k = key.to_be_bytes();
        Self([k[1], k[2], k[3], kind])
    }

    /// Entity kind octet.
    #[must_use]
    pub fn kind(&self) -> u8 {
        self.0[3]
    }

    #[must_use]
    pub fn is_writer(&self) -> bool {
        matches!(
            self.kind(),
            Self::KIND_WRITER_WITH_KEY | Self::KIND_WRITER_NO_KEY
        )
    }

    #[must_use]
    pub fn is_reader(&self) -> bool {
        matches!(
            self.kind(),
            Self::KIND_READER_WITH_KEY | Self::KIND_READER_NO_KEY
        )
    }

    #[must_use]
    pub fn is_unknown(&self) -> bool {
        *self == Self::UNKNOWN
    }
}

impl fmt::Debug for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "EntityId({:02x}.{:02x}.{:02x}.{:02x})",
            self.0[0], self.0[1], self.0[2], self.0[3]
        )
    }
}

/// RTPS GUID (Globally Unique Identifier)
///
/// # Display Format
/// Hex with dots: "01.aa.00.00.30.39.00.00.00.00.00.01|00.00.01.02"
#[derive(Copy, Clone, Eq, PartialEq, Hash, PartialOrd, Ord, Default)]
pub struct Guid {
    pub prefix: GuidPrefix,
    pub entity_id: EntityId,
}

impl Guid {
    #[must_use]
    pub fn new(prefix: GuidPrefix, entity_id: EntityId) -> Self {
        Self { prefix, entity_id }
    }

    /// Create GUID from raw bytes (16 bytes total).
    #[must_use]
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        let mut prefix = [0u8; 12];
        let mut entity_id = [0u8; 4];
        prefix.copy_from_slice(&bytes[0..12]);
        entity_id.copy_from_slice(&bytes[12..16]);
        Self::new(GuidPrefix(prefix), EntityId(entity_id))
    }

    /// Convert GUID to 16-byte array.
    #[must_use]
    pub fn as_bytes(&self) -> [u8; 16] {
        let mut bytes = [0u8; 16];
        bytes[0..12].copy_from_slice(&self.prefix.0);
        bytes[12..16].copy_from_slice(&self.entity_id.0);
        bytes
    }
}

impl fmt::Display for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|", self.prefix)?;
        let e = self.entity_id.0;
        write!(f, "{:02x}.{:02x}.{:02x}.{:02x}", e[0], e[1], e[2], e[3])
    }
}

impl fmt::Debug for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Guid({})", self)
    }
}
