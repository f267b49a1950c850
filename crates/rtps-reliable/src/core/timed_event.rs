// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Timed event scheduler: deferred and periodic callbacks on one thread.
//!
//! Heartbeats, NACK response delays, heartbeat response delays, flow
//! controller refills and asynchronous flushes all run here. The scheduler
//! knows nothing about RTPS: it orders `(deadline, callback)` pairs in a
//! min-heap and runs expired callbacks in deadline order.
//!
//! ```text
//!  owner (writer/reader)            scheduler thread
//!  ─────────────────────            ────────────────
//!  handle = sched.register(cb)
//!  handle.arm(5ms) ───push───▶ heap[(t+5ms, id, gen)]
//!                                   ...sleep until t+5ms
//!                                   pop, gen matches? ─▶ cb()  (lock released)
//!  drop(handle) ──────────────▶ slot removed, stale heap entries skipped
//! ```
//!
//! # Handles
//!
//! `EventHandle` is RAII: dropping it removes the event. Callbacks capture
//! `Weak` references to their owner so a callback racing a drop becomes a
//! no-op. Cancelling while the callback runs never blocks; the running
//! callback completes, its requested reschedule is ignored.
//!
//! Each heap entry carries the slot generation at arm time. Any arm,
//! restart or cancel bumps the generation, so stale entries are discarded
//! on pop instead of being searched for and removed.

use crate::error::{Error, Result};
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// What the scheduler does with an event after its callback returns.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventAction {
    /// Leave the event disarmed.
    Done,
    /// Re-arm after the given delay (periodic events).
    Reschedule(Duration),
}

type Callback = Box<dyn FnMut() -> EventAction + Send>;

struct Slot {
    callback: Option<Callback>,
    generation: u64,
    deadline: Option<Instant>,
}

#[derive(Default)]
struct SchedulerState {
    heap: BinaryHeap<Reverse<(Instant, u64, u64)>>,
    slots: HashMap<u64, Slot>,
    next_id: u64,
}

impl SchedulerState {
    fn arm_slot(&mut self, id: u64, deadline: Instant) -> bool {
        let Some(slot) = self.slots.get_mut(&id) else {
            return false;
        };
        slot.generation += 1;
        slot.deadline = Some(deadline);
        self.heap.push(Reverse((deadline, id, slot.generation)));
        true
    }
}

struct Shared {
    state: Mutex<SchedulerState>,
    wake: Condvar,
    stop: AtomicBool,
}

/// Owns the event-processing thread. Stopping happens on drop.
pub struct TimedEventScheduler {
    shared: Arc<Shared>,
    thread: Option<JoinHandle<()>>,
}

impl TimedEventScheduler {
    /// Spawn the event thread.
    pub fn new() -> Result<Self> {
        let shared = Arc::new(Shared {
            state: Mutex::new(SchedulerState::default()),
            wake: Condvar::new(),
            stop: AtomicBool::new(false),
        });
        let worker = Arc::clone(&shared);
        let thread = thread::Builder::new()
            .name("rtps-events".into())
            .spawn(move || run(&worker))
            .map_err(|e| Error::InvalidState(format!("failed to spawn event thread: {}", e)))?;
        log::debug!("[TimedEventScheduler] started");
        Ok(Self {
            shared,
            thread: Some(thread),
        })
    }

    /// Cloneable handle used by endpoints to register events.
    #[must_use]
    pub fn handle(&self) -> SchedulerHandle {
        SchedulerHandle {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl Drop for TimedEventScheduler {
    fn drop(&mut self) {
        self.shared.stop.store(true, Ordering::Release);
        {
            let _state = self.shared.state.lock();
            self.shared.wake.notify_all();
        }
        if let Some(thread) = self.thread.take() {
            if thread.thread().id() != thread::current().id() {
                let _ = thread.join();
            }
        }
        log::debug!("[TimedEventScheduler] stopped");
    }
}

fn run(shared: &Shared) {
    let mut state = shared.state.lock();
    loop {
        if shared.stop.load(Ordering::Acquire) {
            break;
        }
        let Some(Reverse((deadline, id, generation))) = state.heap.peek().copied() else {
            shared.wake.wait(&mut state);
            continue;
        };
        if deadline > Instant::now() {
            let _ = shared.wake.wait_until(&mut state, deadline);
            continue;
        }
        state.heap.pop();

        let Some(slot) = state.slots.get_mut(&id) else {
            continue;
        };
        if slot.generation != generation {
            continue;
        }
        slot.deadline = None;
        let Some(mut callback) = slot.callback.take() else {
            continue;
        };

        let action = MutexGuard::unlocked(&mut state, || callback());

        match state.slots.get_mut(&id) {
            Some(slot) => {
                slot.callback = Some(callback);
                // Untouched while running: honor the requested reschedule.
                if slot.generation == generation {
                    if let EventAction::Reschedule(period) = action {
                        state.arm_slot(id, Instant::now() + period);
                    }
                }
            }
            None => MutexGuard::unlocked(&mut state, || drop(callback)),
        }
    }
}

/// Cloneable access to a running scheduler.
#[derive(Clone)]
pub struct SchedulerHandle {
    shared: Arc<Shared>,
}

impl SchedulerHandle {
    /// Register a disarmed event. Arm it through the returned handle.
    pub fn register<F>(&self, callback: F) -> EventHandle
    where
        F: FnMut() -> EventAction + Send + 'static,
    {
        let mut state = self.shared.state.lock();
        let id = state.next_id;
        state.next_id += 1;
        state.slots.insert(
            id,
            Slot {
                callback: Some(Box::new(callback)),
                generation: 0,
                deadline: None,
            },
        );
        EventHandle {
            id,
            shared: Arc::clone(&self.shared),
        }
    }

    /// Register and arm an event in one step.
    pub fn schedule_after<F>(&self, delay: Duration, callback: F) -> EventHandle
    where
        F: FnMut() -> EventAction + Send + 'static,
    {
        let handle = self.register(callback);
        handle.restart(delay);
        handle
    }

    /// Disarm `handle` (same as `handle.cancel()`).
    pub fn cancel(&self, handle: &EventHandle) {
        handle.cancel();
    }

    /// Re-arm `handle` at `now + delay` (same as `handle.restart(delay)`).
    pub fn restart(&self, handle: &EventHandle, delay: Duration) {
        handle.restart(delay);
    }

    /// Number of currently armed events.
    #[must_use]
    pub fn armed_events(&self) -> usize {
        let state = self.shared.state.lock();
        state.slots.values().filter(|s| s.deadline.is_some()).count()
    }
}

/// RAII handle for one registered event. Dropping it removes the event.
pub struct EventHandle {
    id: u64,
    shared: Arc<Shared>,
}

impl EventHandle {
    /// Arm at `now + delay` unless already armed.
    ///
    /// Returns `false` when the event was already pending: repeated arms
    /// before expiry coalesce into the first deadline.
    pub fn arm(&self, delay: Duration) -> bool {
        let mut state = self.shared.state.lock();
        let armed = state
            .slots
            .get(&self.id)
            .is_some_and(|slot| slot.deadline.is_some());
        if armed {
            return false;
        }
        let ok = state.arm_slot(self.id, Instant::now() + delay);
        if ok {
            self.shared.wake.notify_one();
        }
        ok
    }

    /// Arm at `now + delay`, replacing any pending deadline.
    pub fn restart(&self, delay: Duration) {
        let mut state = self.shared.state.lock();
        if state.arm_slot(self.id, Instant::now() + delay) {
            self.shared.wake.notify_one();
        }
    }

    /// Disarm. Safe while the callback is running (it completes, no reschedule).
    pub fn cancel(&self) {
        let mut state = self.shared.state.lock();
        if let Some(slot) = state.slots.get_mut(&self.id) {
            slot.generation += 1;
            slot.deadline = None;
        }
    }

    #[must_use]
    pub fn is_armed(&self) -> bool {
        let state = self.shared.state.lock();
        state
            .slots
            .get(&self.id)
            .is_some_and(|slot| slot.deadline.is_some())
    }
}

impl Drop for EventHandle {
    fn drop(&mut self) {
        let removed = {
            let mut state = self.shared.state.lock();
            state.slots.remove(&self.id)
        };
        drop(removed);
    }
}

impl std::fmt::Debug for EventHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventHandle").field("id", &self.id).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;

    #[test]
    fn test_callbacks_run_in_deadline_order() {
        let sched = TimedEventScheduler::new().expect("scheduler should start");
        let handle = sched.handle();
        let (tx, rx) = mpsc::channel();

        let mut events = Vec::new();
        for (label, delay_ms) in [(3u32, 30u64), (1, 10), (2, 20)] {
            let tx = tx.clone();
            events.push(handle.schedule_after(Duration::from_millis(delay_ms), move || {
                let _ = tx.send(label);
                EventAction::Done
            }));
        }

        let order: Vec<u32> = (0..3)
            .map(|_| rx.recv_timeout(Duration::from_secs(2)).expect("event should fire"))
            .collect();
        assert_eq!(order, vec![1, 2, 3]);
    }

    #[test]
    fn test_arm_coalesces() {
        let sched = TimedEventScheduler::new().expect("scheduler should start");
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        let event = sched.handle().register(move || {
            c.fetch_add(1, Ordering::SeqCst);
            EventAction::Done
        });

        assert!(event.arm(Duration::from_millis(20)));
        assert!(!event.arm(Duration::from_millis(20)));
        assert!(!event.arm(Duration::from_millis(1)));
        thread::sleep(Duration::from_millis(100));
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(!event.is_armed());

        // Armable again after expiry
        assert!(event.arm(Duration::from_millis(1)));
        thread::sleep(Duration::from_millis(50));
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_cancel_and_drop_prevent_firing() {
        let sched = TimedEventScheduler::new().expect("scheduler should start");
        let count = Arc::new(AtomicUsize::new(0));

        let c = Arc::clone(&count);
        let cancelled = sched.handle().schedule_after(Duration::from_millis(20), move || {
            c.fetch_add(1, Ordering::SeqCst);
            EventAction::Done
        });
        cancelled.cancel();

        let c = Arc::clone(&count);
        let dropped = sched.handle().schedule_after(Duration::from_millis(20), move || {
            c.fetch_add(1, Ordering::SeqCst);
            EventAction::Done
        });
        drop(dropped);

        thread::sleep(Duration::from_millis(80));
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_restart_moves_deadline() {
        let sched = TimedEventScheduler::new().expect("scheduler should start");
        let fired = Arc::new(AtomicUsize::new(0));
        let f = Arc::clone(&fired);
        let event = sched.handle().schedule_after(Duration::from_millis(20), move || {
            f.fetch_add(1, Ordering::SeqCst);
            EventAction::Done
        });
        event.restart(Duration::from_millis(200));
        thread::sleep(Duration::from_millis(60));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        event.restart(Duration::ZERO);
        thread::sleep(Duration::from_millis(50));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_periodic_reschedule() {
        let sched = TimedEventScheduler::new().expect("scheduler should start");
        let ticks = Arc::new(AtomicUsize::new(0));
        let t = Arc::clone(&ticks);
        let event = sched.handle().schedule_after(Duration::from_millis(5), move || {
            t.fetch_add(1, Ordering::SeqCst);
            EventAction::Reschedule(Duration::from_millis(5))
        });
        thread::sleep(Duration::from_millis(100));
        event.cancel();
        let seen = ticks.load(Ordering::SeqCst);
        assert!(seen >= 3, "expected several ticks, got {}", seen);
        thread::sleep(Duration::from_millis(30));
        let after = ticks.load(Ordering::SeqCst);
        assert!(after <= seen + 1);
    }

    #[test]
    fn test_cancel_from_own_callback_is_safe() {
        let sched = TimedEventScheduler::new().expect("scheduler should start");
        let slot: Arc<Mutex<Option<EventHandle>>> = Arc::new(Mutex::new(None));
        let ticks = Arc::new(AtomicUsize::new(0));
        let (s, t) = (Arc::clone(&slot), Arc::clone(&ticks));
        let event = sched.handle().register(move || {
            t.fetch_add(1, Ordering::SeqCst);
            if let Some(h) = s.lock().as_ref() {
                h.cancel();
            }
            EventAction::Reschedule(Duration::from_millis(1))
        });
        *slot.lock() = Some(event);
        if let Some(h) = slot.lock().as_ref() {
            h.arm(Duration::ZERO);
        }
        thread::sleep(Duration::from_millis(50));
        assert_eq!(ticks.load(Ordering::SeqCst), 1);
        assert_eq!(sched.handle().armed_events(), 0);
    }
}
