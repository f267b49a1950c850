// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Outbound message assembly.
//!
//! Packs submessages for one destination participant into as few RTPS
//! messages as the transport size limit allows. Every message starts with
//! INFO_DST so the receiver can route it; the security filter (if any) is
//! applied to the complete message right before the transport call.
//!
//! Only the first locator of a destination is used.

use super::{Locator, SecurityFilter, Transport};
use crate::config::{RTPS_HEADER_LEN, SUBMESSAGE_HEADER_LEN};
use crate::core::guid::GuidPrefix;
use crate::error::{Error, Result};
use crate::reliability::messages::{RtpsMessage, Submessage};
use parking_lot::RwLock;
use std::sync::Arc;

const INFO_DST_LEN: usize = SUBMESSAGE_HEADER_LEN + 12;

/// Sends submessages on behalf of one participant.
pub struct MessageSender {
    prefix: GuidPrefix,
    transport: Arc<dyn Transport>,
    security: RwLock<Option<Arc<dyn SecurityFilter>>>,
    max_message_size: usize,
}

impl MessageSender {
    #[must_use]
    pub fn new(prefix: GuidPrefix, transport: Arc<dyn Transport>) -> Self {
        let max_message_size = transport
            .max_message_size()
            .min(crate::config::DEFAULT_MAX_MESSAGE_SIZE);
        Self {
            prefix,
            transport,
            security: RwLock::new(None),
            max_message_size,
        }
    }

    /// Source prefix written in every message header.
    #[must_use]
    pub fn prefix(&self) -> GuidPrefix {
        self.prefix
    }

    /// Effective message size limit (transport limit, capped by the default).
    #[must_use]
    pub fn max_message_size(&self) -> usize {
        self.max_message_size
    }

    #[must_use]
    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn set_security_filter(&self, filter: Option<Arc<dyn SecurityFilter>>) {
        *self.security.write() = filter;
    }

    #[must_use]
    pub fn security_filter(&self) -> Option<Arc<dyn SecurityFilter>> {
        self.security.read().clone()
    }

    /// Encode `submessages` for `dest` and hand them to the transport.
    ///
    /// Returns the number of bytes handed off (before security encoding).
    ///
    /// # Errors
    /// `SendFailed` when there is no locator or the transport refuses a message.
    pub fn send(
        &self,
        dest: GuidPrefix,
        locators: &[Locator],
        submessages: &[Submessage],
    ) -> Result<usize> {
        if submessages.is_empty() {
            return Ok(0);
        }
        let locator = locators
            .first()
            .ok_or_else(|| Error::SendFailed(format!("no locator for {}", dest)))?;

        let mut sent = 0;
        for message in self.pack(dest, submessages) {
            sent += message.len();
            self.send_raw(locator, &message)?;
        }
        Ok(sent)
    }

    /// Encoded sizes of the messages `send` would produce.
    #[must_use]
    pub fn packed_sizes(&self, dest: GuidPrefix, submessages: &[Submessage]) -> Vec<usize> {
        self.pack(dest, submessages).iter().map(Vec::len).collect()
    }

    fn pack(&self, dest: GuidPrefix, submessages: &[Submessage]) -> Vec<Vec<u8>> {
        let mut messages = Vec::new();
        let mut current = self.start_message(dest);
        let mut scratch = Vec::new();
        let mut iter = submessages.iter();
        while let Some(sub) = iter.next() {
            scratch.clear();
            sub.encode_into(&mut scratch);
            // INFO_TS applies to the submessage after it: never split the pair.
            if matches!(sub, Submessage::InfoTs(_)) {
                if let Some(next) = iter.next() {
                    next.encode_into(&mut scratch);
                }
            }
            let empty = current.len() == RTPS_HEADER_LEN + INFO_DST_LEN;
            if !empty && current.len() + scratch.len() > self.max_message_size {
                messages.push(std::mem::replace(&mut current, self.start_message(dest)));
            }
            if current.len() + scratch.len() > self.max_message_size {
                log::warn!(
                    "[MessageSender::pack] {} of {} bytes exceeds message size {}",
                    sub.name(),
                    scratch.len(),
                    self.max_message_size
                );
            }
            current.extend_from_slice(&scratch);
        }
        messages.push(current);
        messages
    }

    fn start_message(&self, dest: GuidPrefix) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.max_message_size.min(4096));
        RtpsMessage::encode_header(&self.prefix, &mut buf);
        Submessage::InfoDst(dest).encode_into(&mut buf);
        buf
    }

    fn send_raw(&self, locator: &Locator, message: &[u8]) -> Result<()> {
        let filter = self.security.read().clone();
        match filter {
            Some(filter) => self.transport.send(locator, &filter.encode(message)),
            None => self.transport.send(locator, message),
        }
    }
}

impl std::fmt::Debug for MessageSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageSender")
            .field("prefix", &self.prefix)
            .field("max_message_size", &self.max_message_size)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::guid::EntityId;
    use crate::reliability::messages::Heartbeat;
    use crate::transport::MessageReceiver;
    use parking_lot::Mutex;
    use std::sync::Weak;

    #[derive(Default)]
    struct Capture {
        sent: Mutex<Vec<(Locator, Vec<u8>)>>,
    }

    impl Transport for Capture {
        fn send(&self, locator: &Locator, bytes: &[u8]) -> Result<()> {
            self.sent.lock().push((*locator, bytes.to_vec()));
            Ok(())
        }

        fn max_message_size(&self) -> usize {
            200
        }

        fn attach(&self, _: Locator, _: Weak<dyn MessageReceiver>) -> Result<()> {
            Ok(())
        }

        fn detach(&self, _: &Locator) {}
    }

    fn heartbeat(count: u32) -> Submessage {
        Submessage::Heartbeat(Heartbeat {
            reader_id: EntityId::UNKNOWN,
            writer_id: EntityId::writer(1),
            first_sn: 1,
            last_sn: 1,
            count,
            final_flag: false,
            liveliness: false,
        })
    }

    #[test]
    fn test_batches_split_at_size_limit() {
        let capture = Arc::new(Capture::default());
        let sender = MessageSender::new(GuidPrefix([1; 12]), capture.clone());
        let dest = GuidPrefix([2; 12]);
        let subs: Vec<Submessage> = (1..=10).map(heartbeat).collect();
        let loc = Locator::intra(dest);
        sender.send(dest, &[loc], &subs).expect("send should succeed");

        let sent = capture.sent.lock();
        assert!(sent.len() > 1);
        let mut seen = 0;
        for (locator, bytes) in sent.iter() {
            assert_eq!(*locator, loc);
            assert!(bytes.len() <= 200);
            let msg = RtpsMessage::decode(bytes).expect("valid message");
            assert_eq!(msg.submessages[0], Submessage::InfoDst(dest));
            seen += msg.submessages.len() - 1;
        }
        assert_eq!(seen, 10);
    }

    #[test]
    fn test_no_locator_is_send_failed() {
        let sender = MessageSender::new(GuidPrefix([1; 12]), Arc::new(Capture::default()));
        let err = sender.send(GuidPrefix([2; 12]), &[], &[heartbeat(1)]);
        assert!(matches!(err, Err(Error::SendFailed(_))));
    }
}
