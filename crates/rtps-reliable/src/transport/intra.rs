// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! In-process transport.
//!
//! Every attached locator gets an unbounded crossbeam channel and one
//! receive thread that feeds the registered `MessageReceiver`. A drop
//! predicate can discard outbound messages to simulate loss.
//!
//! ```text
//!  send(loc, bytes) ──▶ [drop filter] ──▶ channel(loc) ──▶ rx thread ──▶ receiver.on_receive
//! ```

use super::{Locator, MessageReceiver, Transport};
use crate::config::DEFAULT_MAX_MESSAGE_SIZE;
use crate::error::{Error, Result};
use crossbeam::channel::{self, Sender};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};

/// Returns `true` to drop the message.
pub type DropFilter = dyn Fn(&Locator, &[u8]) -> bool + Send + Sync;

/// Hub counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct HubStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub bytes_sent: u64,
}

/// In-process message hub shared by every participant of a test or process.
pub struct IntraProcessHub {
    routes: DashMap<Locator, Sender<Vec<u8>>>,
    threads: Mutex<Vec<(Locator, JoinHandle<()>)>>,
    drop_filter: RwLock<Option<Arc<DropFilter>>>,
    max_message_size: usize,
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
    bytes_sent: AtomicU64,
}

impl IntraProcessHub {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Self::with_max_message_size(DEFAULT_MAX_MESSAGE_SIZE)
    }

    /// Hub advertising a smaller message size (forces fragmentation in tests).
    #[must_use]
    pub fn with_max_message_size(max_message_size: usize) -> Arc<Self> {
        Arc::new(Self {
            routes: DashMap::new(),
            threads: Mutex::new(Vec::new()),
            drop_filter: RwLock::new(None),
            max_message_size,
            messages_sent: AtomicU64::new(0),
            messages_dropped: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
        })
    }

    /// Install a loss predicate (replaces any previous one).
    pub fn set_drop_filter<F>(&self, filter: F)
    where
        F: Fn(&Locator, &[u8]) -> bool + Send + Sync + 'static,
    {
        *self.drop_filter.write() = Some(Arc::new(filter));
    }

    pub fn clear_drop_filter(&self) {
        *self.drop_filter.write() = None;
    }

    #[must_use]
    pub fn stats(&self) -> HubStats {
        HubStats {
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.messages_dropped.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
        }
    }

    /// Number of attached locators.
    #[must_use]
    pub fn route_count(&self) -> usize {
        self.routes.len()
    }

    fn join_thread(&self, locator: &Locator) {
        let handle = {
            let mut threads = self.threads.lock();
            threads
                .iter()
                .position(|(loc, _)| loc == locator)
                .map(|idx| threads.swap_remove(idx).1)
        };
        if let Some(handle) = handle {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

impl Transport for IntraProcessHub {
    fn send(&self, locator: &Locator, bytes: &[u8]) -> Result<()> {
        let filter = self.drop_filter.read().clone();
        if filter.is_some_and(|should_drop| should_drop(locator, bytes)) {
            self.messages_dropped.fetch_add(1, Ordering::Relaxed);
            log::trace!("[IntraProcessHub::send] dropped {} bytes to {}", bytes.len(), locator);
            return Ok(());
        }
        let route = self
            .routes
            .get(locator)
            .ok_or_else(|| Error::SendFailed(format!("no route to {}", locator)))?;
        route
            .send(bytes.to_vec())
            .map_err(|_| Error::SendFailed(format!("receiver for {} is gone", locator)))?;
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    fn max_message_size(&self) -> usize {
        self.max_message_size
    }

    fn attach(&self, locator: Locator, receiver: Weak<dyn MessageReceiver>) -> Result<()> {
        if self.routes.contains_key(&locator) {
            return Err(Error::InvalidState(format!("{} already attached", locator)));
        }
        let (tx, rx) = channel::unbounded::<Vec<u8>>();
        let handle = thread::Builder::new()
            .name("rtps-intra-rx".into())
            .spawn(move || {
                while let Ok(bytes) = rx.recv() {
                    match receiver.upgrade() {
                        Some(receiver) => receiver.on_receive(&bytes),
                        None => break,
                    }
                }
            })
            .map_err(|e| Error::InvalidState(format!("failed to spawn receive thread: {}", e)))?;
        self.routes.insert(locator, tx);
        self.threads.lock().push((locator, handle));
        log::debug!("[IntraProcessHub::attach] {}", locator);
        Ok(())
    }

    fn detach(&self, locator: &Locator) {
        // Dropping the last sender ends the receive loop.
        if self.routes.remove(locator).is_some() {
            self.join_thread(locator);
            log::debug!("[IntraProcessHub::detach] {}", locator);
        }
    }
}

impl Drop for IntraProcessHub {
    fn drop(&mut self) {
        self.routes.clear();
        let threads = std::mem::take(&mut *self.threads.lock());
        for (_, handle) in threads {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

impl std::fmt::Debug for IntraProcessHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IntraProcessHub")
            .field("routes", &self.routes.len())
            .field("stats", &self.stats())
            .finish()
    }
}
