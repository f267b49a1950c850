// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Publish-rate flow controller.
//!
//! Asynchronous writers do not send on the application thread. They
//! `submit` themselves to a controller, which calls back `FlowClient::flush`
//! with the byte budget left in the current period. A client that still has
//! traffic when the budget runs out stays queued and is served again by the
//! refill event at the start of the next period.
//!
//! ```text
//!  writer.write() ──submit──▶ queue ──service──▶ writer.flush(budget) ──▶ transport
//!                               ▲                                │
//!                               └──── refill tick (scheduler) ◀──┘ more pending
//! ```
//!
//! Schedulers:
//! - `Fifo`: the head client is served until drained or out of budget
//! - `RoundRobin`: each turn is capped at one message; a client that still
//!   has traffic goes to the back

use super::token_bucket::TokenBucket;
use crate::core::timed_event::{EventAction, EventHandle, SchedulerHandle};
use crate::error::Result;
use crate::qos::{FlowControllerConfig, FlowScheduler};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

/// What a client did with the budget it was offered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushResult {
    /// Bytes handed to the transport.
    pub bytes: usize,
    /// Traffic is still waiting.
    pub more: bool,
}

/// A writer paced by a flow controller.
pub trait FlowClient: Send + Sync {
    /// Send pending traffic worth at most `budget` bytes.
    fn flush(&self, budget: usize) -> FlushResult;
}

/// Controller counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FlowStats {
    pub bytes_released: u64,
    pub deferrals: u64,
}

struct Queued {
    id: u64,
    client: Weak<dyn FlowClient>,
}

struct FlowState {
    bucket: TokenBucket,
    queue: VecDeque<Queued>,
    servicing: bool,
}

/// Token-bucket pacer shared by every writer configured with the same name.
pub struct FlowController {
    config: FlowControllerConfig,
    state: Mutex<FlowState>,
    refill: EventHandle,
    /// Largest budget offered per turn (one message under round-robin).
    quantum: usize,
    bytes_released: AtomicU64,
    deferrals: AtomicU64,
}

impl FlowController {
    /// Create a controller.
    ///
    /// # Errors
    /// `InvalidQos` when the budget per period is below one message.
    pub fn new(
        config: FlowControllerConfig,
        scheduler: &SchedulerHandle,
        max_message_size: usize,
    ) -> Result<Arc<Self>> {
        config.validate(max_message_size)?;
        let bucket = TokenBucket::new(config.bytes_per_period as u64, config.period);
        let quantum = match config.scheduler {
            FlowScheduler::Fifo => usize::MAX,
            FlowScheduler::RoundRobin => max_message_size,
        };
        let controller = Arc::new_cyclic(|weak: &Weak<FlowController>| {
            let weak = weak.clone();
            let refill = scheduler.register(move || {
                if let Some(controller) = weak.upgrade() {
                    controller.service();
                }
                EventAction::Done
            });
            FlowController {
                config,
                state: Mutex::new(FlowState {
                    bucket,
                    queue: VecDeque::new(),
                    servicing: false,
                }),
                refill,
                quantum,
                bytes_released: AtomicU64::new(0),
                deferrals: AtomicU64::new(0),
            }
        });
        log::debug!(
            "[FlowController::new] '{}' {} bytes / {:?} ({:?})",
            controller.config.name,
            controller.config.bytes_per_period,
            controller.config.period,
            controller.config.scheduler
        );
        Ok(controller)
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.config.name
    }

    #[must_use]
    pub fn config(&self) -> &FlowControllerConfig {
        &self.config
    }

    /// Queue `client` (no-op if already queued) and serve as budget allows.
    pub fn submit(&self, id: u64, client: Weak<dyn FlowClient>) {
        {
            let mut state = self.state.lock();
            if !state.queue.iter().any(|q| q.id == id) {
                state.queue.push_back(Queued { id, client });
            }
        }
        self.service();
    }

    /// Forget a client (writer deleted).
    pub fn remove(&self, id: u64) {
        self.state.lock().queue.retain(|q| q.id != id);
    }

    /// Clients waiting for budget.
    #[must_use]
    pub fn queued(&self) -> usize {
        self.state.lock().queue.len()
    }

    #[must_use]
    pub fn stats(&self) -> FlowStats {
        FlowStats {
            bytes_released: self.bytes_released.load(Ordering::Relaxed),
            deferrals: self.deferrals.load(Ordering::Relaxed),
        }
    }

    /// Serve queued clients until the queue is empty or the budget is spent.
    ///
    /// Only one thread serves at a time; concurrent callers just enqueue.
    fn service(&self) {
        {
            let mut state = self.state.lock();
            if state.servicing {
                return;
            }
            state.servicing = true;
        }

        loop {
            let next = {
                let mut state = self.state.lock();
                let budget = state.bucket.available(Instant::now());
                if budget == 0 || state.queue.is_empty() {
                    self.finish(&mut state);
                    return;
                }
                state.queue.pop_front().map(|q| (q, budget))
            };
            let Some((queued, budget)) = next else {
                continue;
            };
            let Some(client) = queued.client.upgrade() else {
                continue;
            };

            let budget = usize::try_from(budget).unwrap_or(usize::MAX).min(self.quantum);
            let result = client.flush(budget);

            let mut state = self.state.lock();
            let now = Instant::now();
            let bytes = result.bytes as u64;
            if !state.bucket.try_consume(bytes, now) {
                // A trailing HEARTBEAT may overrun the period by one message.
                state.bucket.force_consume(bytes, now);
            }
            self.bytes_released
                .fetch_add(result.bytes as u64, Ordering::Relaxed);
            if result.more {
                match self.config.scheduler {
                    FlowScheduler::Fifo => state.queue.push_front(queued),
                    FlowScheduler::RoundRobin => state.queue.push_back(queued),
                }
                if result.bytes == 0 {
                    // Next message does not fit what is left of this period.
                    self.finish(&mut state);
                    return;
                }
            }
        }
    }

    /// Leave service mode; wake up at the next period if anyone is waiting.
    fn finish(&self, state: &mut FlowState) {
        state.servicing = false;
        if !state.queue.is_empty() {
            self.deferrals.fetch_add(1, Ordering::Relaxed);
            let delay = state.bucket.time_until_refill(Instant::now());
            self.refill.arm(delay);
        }
    }
}

impl std::fmt::Debug for FlowController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowController")
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish()
    }
}
