// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! RTPS reliability protocol messages
//!
//! Wire codec for every submessage the engine produces or consumes:
//! - DATA / DATA_FRAG: samples and sample fragments
//! - HEARTBEAT / HEARTBEAT_FRAG: writer announces available sequences / fragments
//! - ACKNACK / NACK_FRAG: reader acknowledges and requests sequences / fragments
//! - GAP: writer declares sequences irrelevant
//! - INFO_DST / INFO_TS: destination prefix and source timestamp
//!
//! Only little-endian submessages are produced and accepted. Any truncated
//! or inconsistent input yields `Error::Malformed`; decoding never panics.
//!
//! ```text
//! +------+-----+------+----------------+   +----+-----+------+---------
//! | RTPS | 2.3 | vend | guidPrefix(12) |   | id | flg | len  | body ...
//! +------+-----+------+----------------+   +----+-----+------+---------
//!        RTPS header (20 bytes)             submessage header (4 bytes)
//! ```

use super::rtps_range::RtpsRange;
use super::seq;
use crate::config::{self, flags, pid, submessage_id, MAX_BITMAP_BITS};
use crate::core::change::{ChangeKind, InstanceKey, Time};
use crate::core::guid::{EntityId, GuidPrefix};
use crate::error::{Error, Result};
use std::sync::Arc;

const WORD_BITS: u32 = 32;
const BITMAP_WORDS: usize = (MAX_BITMAP_BITS / WORD_BITS) as usize;

fn malformed(what: &str) -> Error {
    Error::Malformed(what.to_string())
}

// ============================================================================
// Byte cursor
// ============================================================================

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.remaining() < n {
            return Err(malformed("truncated submessage body"));
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn rest(&mut self) -> &'a [u8] {
        let out = &self.buf[self.pos..];
        self.pos = self.buf.len();
        out
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn u16(&mut self) -> Result<u16> {
        Ok(u16::from_le_bytes(self.array()?))
    }

    fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.array()?))
    }

    fn i32(&mut self) -> Result<i32> {
        Ok(i32::from_le_bytes(self.array()?))
    }

    fn entity_id(&mut self) -> Result<EntityId> {
        Ok(EntityId(self.array()?))
    }

    fn sequence_number(&mut self) -> Result<u64> {
        let high = self.i32()?;
        let low = self.u32()?;
        seq::from_wire(high, low).ok_or_else(|| malformed("negative sequence number"))
    }
}

fn put_u16(buf: &mut Vec<u8>, v: u16) {
    buf.extend_from_slice(&v.to_le_bytes());
}

fn put_u32(buf: &mut Vec<u8>, v: u32) {
    buf.extend_from_slice(&v.to_le_bytes());
}

fn put_sequence_number(buf: &mut Vec<u8>, sn: u64) {
    let (high, low) = seq::to_wire(sn);
    buf.extend_from_slice(&high.to_le_bytes());
    put_u32(buf, low);
}

fn pad4(buf: &mut Vec<u8>, start: usize) {
    while (buf.len() - start) % 4 != 0 {
        buf.push(0);
    }
}

// ============================================================================
// Bitmap sets
// ============================================================================

/// Up to 256 bits, MSB-first within each 32-bit word (RTPS bitmap layout).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
struct Bitmap {
    num_bits: u32,
    words: [u32; BITMAP_WORDS],
}

impl Bitmap {
    fn set(&mut self, offset: u32) -> bool {
        if offset >= MAX_BITMAP_BITS {
            return false;
        }
        self.words[(offset / WORD_BITS) as usize] |= 1 << (31 - offset % WORD_BITS);
        self.num_bits = self.num_bits.max(offset + 1);
        true
    }

    fn get(&self, offset: u32) -> bool {
        offset < self.num_bits
            && self.words[(offset / WORD_BITS) as usize] & (1 << (31 - offset % WORD_BITS)) != 0
    }

    fn word_count(&self) -> usize {
        self.num_bits.div_ceil(WORD_BITS) as usize
    }

    fn offsets(&self) -> impl Iterator<Item = u32> + '_ {
        (0..self.num_bits).filter(move |&o| self.get(o))
    }

    fn encode(&self, buf: &mut Vec<u8>) {
        put_u32(buf, self.num_bits);
        for word in &self.words[..self.word_count()] {
            put_u32(buf, *word);
        }
    }

    fn decode(cur: &mut Cursor<'_>) -> Result<Self> {
        let num_bits = cur.u32()?;
        if num_bits > MAX_BITMAP_BITS {
            return Err(malformed("bitmap wider than 256 bits"));
        }
        let mut bitmap = Bitmap {
            num_bits,
            words: [0; BITMAP_WORDS],
        };
        for idx in 0..bitmap.word_count() {
            bitmap.words[idx] = cur.u32()?;
        }
        Ok(bitmap)
    }
}

/// SequenceNumberSet used by ACKNACK and GAP: a base plus up to 256 following bits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequenceNumberSet {
    base: u64,
    bits: Bitmap,
}

impl SequenceNumberSet {
    /// Maximum number of bitmap bits (RTPS limit).
    pub const MAX_BITS: u32 = MAX_BITMAP_BITS;

    /// Create an empty set with the provided base sequence number.
    #[must_use]
    pub fn empty(base: u64) -> Self {
        Self {
            base,
            bits: Bitmap::default(),
        }
    }

    /// Build from sequences; those outside `[base, base+256)` are skipped.
    #[must_use]
    pub fn from_sequences<I: IntoIterator<Item = u64>>(base: u64, sequences: I) -> Self {
        let mut set = Self::empty(base);
        for seq in sequences {
            set.insert(seq);
        }
        set
    }

    /// Add `seq`; returns false when it does not fit the bitmap window.
    pub fn insert(&mut self, seq: u64) -> bool {
        if seq < self.base || seq - self.base >= u64::from(MAX_BITMAP_BITS) {
            return false;
        }
        self.bits.set((seq - self.base) as u32)
    }

    #[must_use]
    pub fn contains(&self, seq: u64) -> bool {
        seq >= self.base
            && seq - self.base < u64::from(MAX_BITMAP_BITS)
            && self.bits.get((seq - self.base) as u32)
    }

    /// Base sequence number of the set.
    #[must_use]
    pub fn base(&self) -> u64 {
        self.base
    }

    /// Number of bitmap bits actually used.
    #[must_use]
    pub fn num_bits(&self) -> u32 {
        self.bits.num_bits
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.iter().next().is_none()
    }

    /// Iterate through all sequence numbers contained in the set.
    pub fn iter(&self) -> impl Iterator<Item = u64> + '_ {
        self.bits.offsets().map(move |o| self.base + u64::from(o))
    }

    fn encode(&self, buf: &mut Vec<u8>) {
        put_sequence_number(buf, self.base);
        self.bits.encode(buf);
    }

    fn decode(cur: &mut Cursor<'_>) -> Result<Self> {
        let base = cur.sequence_number()?;
        if base == 0 {
            return Err(malformed("sequence number set base must be >= 1"));
        }
        let bits = Bitmap::decode(cur)?;
        Ok(Self { base, bits })
    }
}

/// FragmentNumberSet used by NACK_FRAG (fragment numbers start at 1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FragmentNumberSet {
    base: u32,
    bits: Bitmap,
}

impl FragmentNumberSet {
    #[must_use]
    pub fn empty(base: u32) -> Self {
        Self {
            base,
            bits: Bitmap::default(),
        }
    }

    /// Build from fragment numbers; those outside `[base, base+256)` are skipped.
    #[must_use]
    pub fn from_fragments<I: IntoIterator<Item = u32>>(base: u32, fragments: I) -> Self {
        let mut set = Self::empty(base);
        for frag in fragments {
            set.insert(frag);
        }
        set
    }

    pub fn insert(&mut self, frag: u32) -> bool {
        if frag < self.base {
            return false;
        }
        self.bits.set(frag - self.base)
    }

    #[must_use]
    pub fn base(&self) -> u32 {
        self.base
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.iter().next().is_none()
    }

    pub fn iter(&self) -> impl Iterator<Item = u32> + '_ {
        self.bits.offsets().map(move |o| self.base + o)
    }

    fn encode(&self, buf: &mut Vec<u8>) {
        put_u32(buf, self.base);
        self.bits.encode(buf);
    }

    fn decode(cur: &mut Cursor<'_>) -> Result<Self> {
        let base = cur.u32()?;
        if base == 0 {
            return Err(malformed("fragment number set base must be >= 1"));
        }
        let bits = Bitmap::decode(cur)?;
        Ok(Self { base, bits })
    }
}

// ============================================================================
// Inline QoS (key hash + status info)
// ============================================================================

fn needs_inline_qos(key_hash: &Option<InstanceKey>, kind: ChangeKind) -> bool {
    key_hash.is_some() || kind != ChangeKind::Alive
}

fn encode_inline_qos(buf: &mut Vec<u8>, key_hash: &Option<InstanceKey>, kind: ChangeKind) {
    if let Some(key) = key_hash {
        put_u16(buf, pid::KEY_HASH);
        put_u16(buf, 16);
        buf.extend_from_slice(key);
    }
    if kind != ChangeKind::Alive {
        put_u16(buf, pid::STATUS_INFO);
        put_u16(buf, 4);
        // STATUS_INFO flags are big-endian regardless of submessage endianness
        buf.extend_from_slice(&kind.status_bits().to_be_bytes());
    }
    put_u16(buf, pid::SENTINEL);
    put_u16(buf, 0);
}

fn decode_inline_qos(cur: &mut Cursor<'_>) -> Result<(Option<InstanceKey>, ChangeKind)> {
    let mut key_hash = None;
    let mut kind = ChangeKind::Alive;
    loop {
        let id = cur.u16()?;
        let len = cur.u16()? as usize;
        if id == pid::SENTINEL {
            break;
        }
        let value = cur.take(len)?;
        match id {
            pid::KEY_HASH if len >= 16 => {
                let mut key = [0u8; 16];
                key.copy_from_slice(&value[..16]);
                key_hash = Some(key);
            }
            pid::STATUS_INFO if len >= 4 => {
                let bits = u32::from_be_bytes([value[0], value[1], value[2], value[3]]);
                kind = ChangeKind::from_status_bits(bits);
            }
            _ => {}
        }
    }
    Ok((key_hash, kind))
}

// ============================================================================
// DATA
// ============================================================================

/// DATA submessage (RTPS v2.3 Sec.8.3.7.2).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Data {
    pub reader_id: EntityId,
    pub writer_id: EntityId,
    pub writer_sn: u64,
    pub key_hash: Option<InstanceKey>,
    pub kind: ChangeKind,
    /// `None` for key-only changes (dispose/unregister without payload).
    pub payload: Option<Arc<[u8]>>,
}

impl Data {
    const OCTETS_TO_INLINE_QOS: u16 = 16;

    fn flags(&self) -> u8 {
        let mut f = flags::ENDIANNESS;
        if needs_inline_qos(&self.key_hash, self.kind) {
            f |= flags::INLINE_QOS;
        }
        if self.payload.is_some() {
            f |= flags::DATA_PRESENT;
        }
        f
    }

    fn encode_body(&self, buf: &mut Vec<u8>) {
        put_u16(buf, 0);
        put_u16(buf, Self::OCTETS_TO_INLINE_QOS);
        buf.extend_from_slice(&self.reader_id.0);
        buf.extend_from_slice(&self.writer_id.0);
        put_sequence_number(buf, self.writer_sn);
        if needs_inline_qos(&self.key_hash, self.kind) {
            encode_inline_qos(buf, &self.key_hash, self.kind);
        }
        if let Some(payload) = &self.payload {
            let pad = (4 - payload.len() % 4) % 4;
            buf.extend_from_slice(&config::ENCAPSULATION_CDR_LE);
            buf.extend_from_slice(&[0, pad as u8]);
            buf.extend_from_slice(payload);
            buf.extend(std::iter::repeat(0).take(pad));
        }
    }

    fn decode_body(flag_bits: u8, body: &[u8]) -> Result<Self> {
        let mut cur = Cursor::new(body);
        let _extra_flags = cur.u16()?;
        let octets_to_inline_qos = cur.u16()?;
        let reader_id = cur.entity_id()?;
        let writer_id = cur.entity_id()?;
        let writer_sn = cur.sequence_number()?;
        if writer_sn == 0 {
            return Err(malformed("DATA sequence number must be >= 1"));
        }
        let skip = octets_to_inline_qos
            .checked_sub(Self::OCTETS_TO_INLINE_QOS)
            .ok_or_else(|| malformed("DATA octetsToInlineQos too small"))?;
        cur.take(skip as usize)?;

        let (key_hash, kind) = if flag_bits & flags::INLINE_QOS != 0 {
            decode_inline_qos(&mut cur)?
        } else {
            (None, ChangeKind::Alive)
        };

        let payload = if flag_bits & flags::DATA_PRESENT != 0 {
            let header = cur.take(4)?;
            let pad = (header[3] & 0x03) as usize;
            let rest = cur.rest();
            if rest.len() < pad {
                return Err(malformed("DATA padding exceeds payload"));
            }
            Some(Arc::from(&rest[..rest.len() - pad]))
        } else {
            None
        };

        Ok(Self {
            reader_id,
            writer_id,
            writer_sn,
            key_hash,
            kind,
            payload,
        })
    }
}

// ============================================================================
// DATA_FRAG
// ============================================================================

/// DATA_FRAG submessage (RTPS v2.3 Sec.8.3.7.3). Fragment numbers start at 1.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataFrag {
    pub reader_id: EntityId,
    pub writer_id: EntityId,
    pub writer_sn: u64,
    pub fragment_starting_num: u32,
    pub fragments_in_submessage: u16,
    pub fragment_size: u16,
    pub sample_size: u32,
    pub key_hash: Option<InstanceKey>,
    pub kind: ChangeKind,
    pub payload: Vec<u8>,
}

impl DataFrag {
    const OCTETS_TO_INLINE_QOS: u16 = 28;

    /// Total number of fragments making up the sample.
    #[must_use]
    pub fn fragment_count(&self) -> u32 {
        fragment_count(self.sample_size as usize, self.fragment_size as usize)
    }

    /// Bytes this submessage should carry given its header fields.
    fn expected_payload_len(&self) -> Result<usize> {
        if self.fragment_size == 0 || self.fragment_starting_num == 0 {
            return Err(malformed("DATA_FRAG fragment size and number must be >= 1"));
        }
        let offset = (self.fragment_starting_num as usize - 1) * self.fragment_size as usize;
        let sample = self.sample_size as usize;
        if offset >= sample.max(1) {
            return Err(malformed("DATA_FRAG fragment beyond sample size"));
        }
        let span = self.fragments_in_submessage as usize * self.fragment_size as usize;
        Ok(span.min(sample - offset))
    }

    fn flags(&self) -> u8 {
        let mut f = flags::ENDIANNESS;
        if needs_inline_qos(&self.key_hash, self.kind) {
            f |= flags::INLINE_QOS;
        }
        f
    }

    fn encode_body(&self, buf: &mut Vec<u8>) {
        put_u16(buf, 0);
        put_u16(buf, Self::OCTETS_TO_INLINE_QOS);
        buf.extend_from_slice(&self.reader_id.0);
        buf.extend_from_slice(&self.writer_id.0);
        put_sequence_number(buf, self.writer_sn);
        put_u32(buf, self.fragment_starting_num);
        put_u16(buf, self.fragments_in_submessage);
        put_u16(buf, self.fragment_size);
        put_u32(buf, self.sample_size);
        if needs_inline_qos(&self.key_hash, self.kind) {
            encode_inline_qos(buf, &self.key_hash, self.kind);
        }
        buf.extend_from_slice(&self.payload);
    }

    fn decode_body(flag_bits: u8, body: &[u8]) -> Result<Self> {
        let mut cur = Cursor::new(body);
        let _extra_flags = cur.u16()?;
        let octets_to_inline_qos = cur.u16()?;
        let reader_id = cur.entity_id()?;
        let writer_id = cur.entity_id()?;
        let writer_sn = cur.sequence_number()?;
        if writer_sn == 0 {
            return Err(malformed("DATA_FRAG sequence number must be >= 1"));
        }
        let mut frag = Self {
            reader_id,
            writer_id,
            writer_sn,
            fragment_starting_num: cur.u32()?,
            fragments_in_submessage: cur.u16()?,
            fragment_size: cur.u16()?,
            sample_size: cur.u32()?,
            key_hash: None,
            kind: ChangeKind::Alive,
            payload: Vec::new(),
        };
        let skip = octets_to_inline_qos
            .checked_sub(Self::OCTETS_TO_INLINE_QOS)
            .ok_or_else(|| malformed("DATA_FRAG octetsToInlineQos too small"))?;
        cur.take(skip as usize)?;
        if flag_bits & flags::INLINE_QOS != 0 {
            let (key_hash, kind) = decode_inline_qos(&mut cur)?;
            frag.key_hash = key_hash;
            frag.kind = kind;
        }
        let len = frag.expected_payload_len()?;
        frag.payload = cur.take(len)?.to_vec();
        Ok(frag)
    }
}

/// Number of fragments of `fragment_size` needed for `sample_size` bytes (at least 1).
#[must_use]
pub fn fragment_count(sample_size: usize, fragment_size: usize) -> u32 {
    if fragment_size == 0 {
        return 1;
    }
    sample_size.div_ceil(fragment_size).max(1) as u32
}

// ============================================================================
// HEARTBEAT / HEARTBEAT_FRAG
// ============================================================================

/// HEARTBEAT submessage (RTPS v2.3 Sec.8.3.7.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Heartbeat {
    pub reader_id: EntityId,
    pub writer_id: EntityId,
    /// First (oldest) sequence number available in the writer history.
    pub first_sn: u64,
    /// Last sequence number written (`first_sn - 1` when history is empty).
    pub last_sn: u64,
    /// Monotonic heartbeat counter (anti-replay).
    pub count: u32,
    /// No response required.
    pub final_flag: bool,
    pub liveliness: bool,
}

impl Heartbeat {
    fn flags(&self) -> u8 {
        let mut f = flags::ENDIANNESS;
        if self.final_flag {
            f |= flags::FINAL;
        }
        if self.liveliness {
            f |= flags::LIVELINESS;
        }
        f
    }

    fn encode_body(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.reader_id.0);
        buf.extend_from_slice(&self.writer_id.0);
        put_sequence_number(buf, self.first_sn);
        put_sequence_number(buf, self.last_sn);
        put_u32(buf, self.count);
    }

    fn decode_body(flag_bits: u8, body: &[u8]) -> Result<Self> {
        let mut cur = Cursor::new(body);
        let hb = Self {
            reader_id: cur.entity_id()?,
            writer_id: cur.entity_id()?,
            first_sn: cur.sequence_number()?,
            last_sn: cur.sequence_number()?,
            count: cur.u32()?,
            final_flag: flag_bits & flags::FINAL != 0,
            liveliness: flag_bits & flags::LIVELINESS != 0,
        };
        if hb.first_sn == 0 || hb.last_sn + 1 < hb.first_sn {
            return Err(malformed("HEARTBEAT range is inconsistent"));
        }
        Ok(hb)
    }
}

/// HEARTBEAT_FRAG submessage (RTPS v2.3 Sec.8.3.7.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatFrag {
    pub reader_id: EntityId,
    pub writer_id: EntityId,
    pub writer_sn: u64,
    pub last_fragment_num: u32,
    pub count: u32,
}

impl HeartbeatFrag {
    fn encode_body(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.reader_id.0);
        buf.extend_from_slice(&self.writer_id.0);
        put_sequence_number(buf, self.writer_sn);
        put_u32(buf, self.last_fragment_num);
        put_u32(buf, self.count);
    }

    fn decode_body(body: &[u8]) -> Result<Self> {
        let mut cur = Cursor::new(body);
        Ok(Self {
            reader_id: cur.entity_id()?,
            writer_id: cur.entity_id()?,
            writer_sn: cur.sequence_number()?,
            last_fragment_num: cur.u32()?,
            count: cur.u32()?,
        })
    }
}

// ============================================================================
// ACKNACK / NACK_FRAG
// ============================================================================

/// ACKNACK submessage (RTPS v2.3 Sec.8.3.7.1).
///
/// `reader_sn_state.base()` acknowledges everything below it; set bits
/// request retransmission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckNack {
    pub reader_id: EntityId,
    pub writer_id: EntityId,
    pub reader_sn_state: SequenceNumberSet,
    pub count: u32,
    pub final_flag: bool,
}

impl AckNack {
    /// All sequence numbers below this are acknowledged.
    #[must_use]
    pub fn ack_base(&self) -> u64 {
        self.reader_sn_state.base()
    }

    fn flags(&self) -> u8 {
        if self.final_flag {
            flags::ENDIANNESS | flags::FINAL
        } else {
            flags::ENDIANNESS
        }
    }

    fn encode_body(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.reader_id.0);
        buf.extend_from_slice(&self.writer_id.0);
        self.reader_sn_state.encode(buf);
        put_u32(buf, self.count);
    }

    fn decode_body(flag_bits: u8, body: &[u8]) -> Result<Self> {
        let mut cur = Cursor::new(body);
        Ok(Self {
            reader_id: cur.entity_id()?,
            writer_id: cur.entity_id()?,
            reader_sn_state: SequenceNumberSet::decode(&mut cur)?,
            count: cur.u32()?,
            final_flag: flag_bits & flags::FINAL != 0,
        })
    }
}

/// NACK_FRAG submessage (RTPS v2.3 Sec.8.3.7.7).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NackFrag {
    pub reader_id: EntityId,
    pub writer_id: EntityId,
    pub writer_sn: u64,
    pub fragment_number_state: FragmentNumberSet,
    pub count: u32,
}

impl NackFrag {
    fn encode_body(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.reader_id.0);
        buf.extend_from_slice(&self.writer_id.0);
        put_sequence_number(buf, self.writer_sn);
        self.fragment_number_state.encode(buf);
        put_u32(buf, self.count);
    }

    fn decode_body(body: &[u8]) -> Result<Self> {
        let mut cur = Cursor::new(body);
        Ok(Self {
            reader_id: cur.entity_id()?,
            writer_id: cur.entity_id()?,
            writer_sn: cur.sequence_number()?,
            fragment_number_state: FragmentNumberSet::decode(&mut cur)?,
            count: cur.u32()?,
        })
    }
}

// ============================================================================
// GAP
// ============================================================================

/// GAP submessage (RTPS v2.3 Sec.8.3.7.4).
///
/// Irrelevant sequences are `[gap_start, gap_list.base)` plus every bit set
/// in `gap_list`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Gap {
    pub reader_id: EntityId,
    pub writer_id: EntityId,
    pub gap_start: u64,
    pub gap_list: SequenceNumberSet,
}

impl Gap {
    /// GAP covering the contiguous range `[start, end)`. `None` for an empty range.
    #[must_use]
    pub fn contiguous(reader_id: EntityId, writer_id: EntityId, range: RtpsRange) -> Option<Self> {
        if range.is_empty() {
            return None;
        }
        Some(Self {
            reader_id,
            writer_id,
            gap_start: range.start(),
            gap_list: SequenceNumberSet::empty(range.end()),
        })
    }

    /// Minimal list of GAPs covering sorted, deduplicated `sequences`.
    ///
    /// The first run of each GAP goes into `[gap_start, base)`; later
    /// sequences within 256 of `base` become bitmap bits.
    #[must_use]
    pub fn from_sequences(reader_id: EntityId, writer_id: EntityId, sequences: &[u64]) -> Vec<Self> {
        let mut gaps: Vec<Gap> = Vec::new();
        for range in RtpsRange::coalesce(sequences) {
            if let Some(gap) = gaps.last_mut() {
                if range.iter().all(|s| gap.gap_list.insert(s)) {
                    continue;
                }
                // Partially inserted bits are still valid; cover the rest with a new GAP.
                let uncovered: Vec<u64> = range.iter().filter(|s| !gap.contains(*s)).collect();
                if let Some(&first) = uncovered.first() {
                    let last = uncovered[uncovered.len() - 1];
                    gaps.extend(Self::contiguous(
                        reader_id,
                        writer_id,
                        RtpsRange::from_inclusive(first, last),
                    ));
                }
                continue;
            }
            gaps.extend(Self::contiguous(reader_id, writer_id, range));
        }
        gaps
    }

    #[must_use]
    pub fn contains(&self, seq: u64) -> bool {
        (self.gap_start..self.gap_list.base()).contains(&seq) || self.gap_list.contains(seq)
    }

    /// Irrelevant sequences as disjoint ranges in ascending order.
    #[must_use]
    pub fn ranges(&self) -> Vec<RtpsRange> {
        let mut out = Vec::new();
        let head = RtpsRange::new(self.gap_start, self.gap_list.base());
        if !head.is_empty() {
            out.push(head);
        }
        let bits: Vec<u64> = self.gap_list.iter().collect();
        out.extend(RtpsRange::coalesce(&bits));
        out
    }

    fn encode_body(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.reader_id.0);
        buf.extend_from_slice(&self.writer_id.0);
        put_sequence_number(buf, self.gap_start);
        self.gap_list.encode(buf);
    }

    fn decode_body(body: &[u8]) -> Result<Self> {
        let mut cur = Cursor::new(body);
        let gap = Self {
            reader_id: cur.entity_id()?,
            writer_id: cur.entity_id()?,
            gap_start: cur.sequence_number()?,
            gap_list: SequenceNumberSet::decode(&mut cur)?,
        };
        if gap.gap_start == 0 || gap.gap_list.base() < gap.gap_start {
            return Err(malformed("GAP list base precedes gap start"));
        }
        Ok(gap)
    }
}

// ============================================================================
// Submessage / Message
// ============================================================================

/// One decoded submessage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Submessage {
    Data(Data),
    DataFrag(DataFrag),
    Heartbeat(Heartbeat),
    HeartbeatFrag(HeartbeatFrag),
    AckNack(AckNack),
    NackFrag(NackFrag),
    Gap(Gap),
    InfoDst(GuidPrefix),
    /// `None` when the timestamp is invalidated.
    InfoTs(Option<Time>),
}

impl Submessage {
    /// Submessage kind name (for logs).
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Submessage::Data(_) => "DATA",
            Submessage::DataFrag(_) => "DATA_FRAG",
            Submessage::Heartbeat(_) => "HEARTBEAT",
            Submessage::HeartbeatFrag(_) => "HEARTBEAT_FRAG",
            Submessage::AckNack(_) => "ACKNACK",
            Submessage::NackFrag(_) => "NACK_FRAG",
            Submessage::Gap(_) => "GAP",
            Submessage::InfoDst(_) => "INFO_DST",
            Submessage::InfoTs(_) => "INFO_TS",
        }
    }

    fn id_and_flags(&self) -> (u8, u8) {
        let e = flags::ENDIANNESS;
        match self {
            Submessage::Data(d) => (submessage_id::DATA, d.flags()),
            Submessage::DataFrag(d) => (submessage_id::DATA_FRAG, d.flags()),
            Submessage::Heartbeat(h) => (submessage_id::HEARTBEAT, h.flags()),
            Submessage::HeartbeatFrag(_) => (submessage_id::HEARTBEAT_FRAG, e),
            Submessage::AckNack(a) => (submessage_id::ACKNACK, a.flags()),
            Submessage::NackFrag(_) => (submessage_id::NACK_FRAG, e),
            Submessage::Gap(_) => (submessage_id::GAP, e),
            Submessage::InfoDst(_) => (submessage_id::INFO_DST, e),
            Submessage::InfoTs(None) => (submessage_id::INFO_TS, e | flags::INVALIDATE),
            Submessage::InfoTs(Some(_)) => (submessage_id::INFO_TS, e),
        }
    }

    /// Append header + body (padded to 4 bytes) to `buf`.
    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        let (id, flag_bits) = self.id_and_flags();
        let header_at = buf.len();
        buf.extend_from_slice(&[id, flag_bits, 0, 0]);
        let body_at = buf.len();
        match self {
            Submessage::Data(d) => d.encode_body(buf),
            Submessage::DataFrag(d) => d.encode_body(buf),
            Submessage::Heartbeat(h) => h.encode_body(buf),
            Submessage::HeartbeatFrag(h) => h.encode_body(buf),
            Submessage::AckNack(a) => a.encode_body(buf),
            Submessage::NackFrag(n) => n.encode_body(buf),
            Submessage::Gap(g) => g.encode_body(buf),
            Submessage::InfoDst(prefix) => buf.extend_from_slice(&prefix.0),
            Submessage::InfoTs(Some(t)) => {
                buf.extend_from_slice(&t.seconds.to_le_bytes());
                put_u32(buf, t.fraction);
            }
            Submessage::InfoTs(None) => {}
        }
        pad4(buf, body_at);
        // 0 means "extends to end of message"; only reachable for bodies above 64 KiB.
        let len = u16::try_from(buf.len() - body_at).unwrap_or(0);
        buf[header_at + 2..header_at + 4].copy_from_slice(&len.to_le_bytes());
    }

    /// Encoded size including the submessage header.
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        let mut scratch = Vec::new();
        self.encode_into(&mut scratch);
        scratch.len()
    }

    fn decode(id: u8, flag_bits: u8, body: &[u8]) -> Result<Option<Self>> {
        let sub = match id {
            submessage_id::DATA => Submessage::Data(Data::decode_body(flag_bits, body)?),
            submessage_id::DATA_FRAG => {
                Submessage::DataFrag(DataFrag::decode_body(flag_bits, body)?)
            }
            submessage_id::HEARTBEAT => {
                Submessage::Heartbeat(Heartbeat::decode_body(flag_bits, body)?)
            }
            submessage_id::HEARTBEAT_FRAG => {
                Submessage::HeartbeatFrag(HeartbeatFrag::decode_body(body)?)
            }
            submessage_id::ACKNACK => Submessage::AckNack(AckNack::decode_body(flag_bits, body)?),
            submessage_id::NACK_FRAG => Submessage::NackFrag(NackFrag::decode_body(body)?),
            submessage_id::GAP => Submessage::Gap(Gap::decode_body(body)?),
            submessage_id::INFO_DST => {
                let mut cur = Cursor::new(body);
                Submessage::InfoDst(GuidPrefix(cur.array()?))
            }
            submessage_id::INFO_TS => {
                if flag_bits & flags::INVALIDATE != 0 {
                    Submessage::InfoTs(None)
                } else {
                    let mut cur = Cursor::new(body);
                    Submessage::InfoTs(Some(Time {
                        seconds: cur.i32()?,
                        fraction: cur.u32()?,
                    }))
                }
            }
            _ => return Ok(None),
        };
        Ok(Some(sub))
    }
}

/// A full RTPS message: source prefix plus submessages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpsMessage {
    pub guid_prefix: GuidPrefix,
    pub submessages: Vec<Submessage>,
}

impl RtpsMessage {
    #[must_use]
    pub fn new(guid_prefix: GuidPrefix) -> Self {
        Self {
            guid_prefix,
            submessages: Vec::new(),
        }
    }

    /// Write the 20-byte RTPS header.
    pub fn encode_header(guid_prefix: &GuidPrefix, buf: &mut Vec<u8>) {
        buf.extend_from_slice(config::RTPS_MAGIC);
        buf.extend_from_slice(&config::PROTOCOL_VERSION);
        buf.extend_from_slice(&config::VENDOR_ID);
        buf.extend_from_slice(&guid_prefix.0);
    }

    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(256);
        Self::encode_header(&self.guid_prefix, &mut buf);
        for sub in &self.submessages {
            sub.encode_into(&mut buf);
        }
        buf
    }

    /// Parse a message. Unknown submessage ids are skipped.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < config::RTPS_HEADER_LEN {
            return Err(malformed("message shorter than RTPS header"));
        }
        if &bytes[0..4] != config::RTPS_MAGIC {
            return Err(malformed("bad RTPS magic"));
        }
        if bytes[4] != config::PROTOCOL_VERSION[0] {
            return Err(malformed("unsupported protocol major version"));
        }
        let mut prefix = [0u8; 12];
        prefix.copy_from_slice(&bytes[8..20]);
        let mut message = Self::new(GuidPrefix(prefix));

        let mut pos = config::RTPS_HEADER_LEN;
        while pos < bytes.len() {
            if bytes.len() - pos < config::SUBMESSAGE_HEADER_LEN {
                return Err(malformed("truncated submessage header"));
            }
            let id = bytes[pos];
            let flag_bits = bytes[pos + 1];
            let octets = u16::from_le_bytes([bytes[pos + 2], bytes[pos + 3]]) as usize;
            let body_at = pos + config::SUBMESSAGE_HEADER_LEN;
            let body_len = if octets == 0 && id != submessage_id::PAD && id != submessage_id::INFO_TS
            {
                bytes.len() - body_at
            } else {
                octets
            };
            if body_at + body_len > bytes.len() {
                return Err(malformed("submessage length exceeds message"));
            }
            if flag_bits & flags::ENDIANNESS == 0 && id != submessage_id::PAD {
                return Err(malformed("big-endian submessages are not supported"));
            }
            let body = &bytes[body_at..body_at + body_len];
            match Submessage::decode(id, flag_bits, body)? {
                Some(sub) => message.submessages.push(sub),
                None => log::trace!("[RtpsMessage::decode] skipping submessage id 0x{:02x}", id),
            }
            pos = body_at + body_len;
        }
        Ok(message)
    }
}
