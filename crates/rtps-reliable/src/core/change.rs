// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! CacheChange: one immutable sample version.

use super::guid::Guid;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// 16-byte instance key hash. All-zero means "keyless topic".
pub type InstanceKey = [u8; 16];

/// Key used by keyless writes.
pub const KEYLESS: InstanceKey = [0; 16];

/// Lifecycle state carried by a change.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum ChangeKind {
    #[default]
    Alive,
    Disposed,
    Unregistered,
}

impl ChangeKind {
    /// STATUS_INFO flag bits (RTPS v2.3 Sec.9.6.3.9).
    #[must_use]
    pub fn status_bits(self) -> u32 {
        match self {
            ChangeKind::Alive => 0,
            ChangeKind::Disposed => 0x1,
            ChangeKind::Unregistered => 0x2,
        }
    }

    #[must_use]
    pub fn from_status_bits(bits: u32) -> Self {
        if bits & 0x1 != 0 {
            ChangeKind::Disposed
        } else if bits & 0x2 != 0 {
            ChangeKind::Unregistered
        } else {
            ChangeKind::Alive
        }
    }
}

/// RTPS Time_t (seconds + 2^-32 fractions since the UNIX epoch).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Time {
    pub seconds: i32,
    pub fraction: u32,
}

impl Time {
    #[must_use]
    pub fn now() -> Self {
        let since = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO);
        Self::from_duration(since)
    }

    #[must_use]
    pub fn from_duration(d: Duration) -> Self {
        let fraction = ((u64::from(d.subsec_nanos()) << 32) / 1_000_000_000) as u32;
        Self {
            seconds: d.as_secs() as i32,
            fraction,
        }
    }

    #[must_use]
    pub fn as_duration(&self) -> Duration {
        let nanos = (u64::from(self.fraction) * 1_000_000_000) >> 32;
        Duration::from_secs(self.seconds.max(0) as u64) + Duration::from_nanos(nanos)
    }
}

/// One sample version, owned by the history that created it.
///
/// Payload bytes sit behind an `Arc`, so handing a change to a reader queue
/// or a retransmission batch never copies the sample.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CacheChange {
    pub writer_guid: Guid,
    pub sequence_number: u64,
    pub instance_key: InstanceKey,
    pub kind: ChangeKind,
    pub payload: Arc<[u8]>,
    pub source_timestamp: Option<Time>,
}

impl CacheChange {
    /// ALIVE change stamped with the current time.
    #[must_use]
    pub fn alive(
        writer_guid: Guid,
        sequence_number: u64,
        instance_key: InstanceKey,
        payload: &[u8],
    ) -> Self {
        Self {
            writer_guid,
            sequence_number,
            instance_key,
            kind: ChangeKind::Alive,
            payload: Arc::from(payload),
            source_timestamp: Some(Time::now()),
        }
    }

    /// Payload length in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_bits_roundtrip() {
        for kind in [ChangeKind::Alive, ChangeKind::Disposed, ChangeKind::Unregistered] {
            assert_eq!(ChangeKind::from_status_bits(kind.status_bits()), kind);
        }
    }

    #[test]
    fn test_time_conversion() {
        let d = Duration::new(1_700_000_000, 500_000_000);
        let t = Time::from_duration(d);
        assert_eq!(t.seconds, 1_700_000_000);
        assert_eq!(t.fraction, 1 << 31);
        let back = t.as_duration();
        let diff = if back > d { back - d } else { d - back };
        assert!(diff < Duration::from_micros(1));
    }

    #[test]
    fn test_clone_shares_payload() {
        let change = CacheChange::alive(Guid::default(), 1, KEYLESS, b"abc");
        let copy = change.clone();
        assert!(Arc::ptr_eq(&change.payload, &copy.payload));
        assert_eq!(copy.len(), 3);
    }
}
