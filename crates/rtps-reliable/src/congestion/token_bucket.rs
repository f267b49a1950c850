// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Periodic token bucket.
//!
//! Flow controllers grant `capacity` bytes per `period`. Unused tokens do
//! not carry over: every elapsed period resets the bucket to full, so the
//! bytes released in any one period never exceed the configured budget.

use std::time::{Duration, Instant};

/// Byte budget replenished once per period.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    /// Current token count (in bytes).
    tokens: u64,

    /// Tokens granted per period.
    capacity: u64,

    period: Duration,

    /// Start of the current period.
    period_start: Instant,
}

impl TokenBucket {
    /// Create a bucket starting full.
    #[must_use]
    pub fn new(capacity: u64, period: Duration) -> Self {
        Self::starting_at(capacity, period, Instant::now())
    }

    /// Create a bucket starting full at `now`.
    #[must_use]
    pub fn starting_at(capacity: u64, period: Duration, now: Instant) -> Self {
        Self {
            tokens: capacity,
            capacity,
            period,
            period_start: now,
        }
    }

    /// Consume `bytes` if available. Never consumes partially.
    pub fn try_consume(&mut self, bytes: u64, now: Instant) -> bool {
        self.refill(now);
        if self.tokens >= bytes {
            self.tokens -= bytes;
            true
        } else {
            false
        }
    }

    /// Consume regardless of the balance (clamps at zero).
    pub fn force_consume(&mut self, bytes: u64, now: Instant) {
        self.refill(now);
        self.tokens = self.tokens.saturating_sub(bytes);
    }

    /// Tokens available in the current period.
    pub fn available(&mut self, now: Instant) -> u64 {
        self.refill(now);
        self.tokens
    }

    #[must_use]
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    #[must_use]
    pub fn period(&self) -> Duration {
        self.period
    }

    /// Time until the next period starts.
    #[must_use]
    pub fn time_until_refill(&self, now: Instant) -> Duration {
        (self.period_start + self.period).saturating_duration_since(now)
    }

    /// Start a new period if the current one is over.
    pub fn refill(&mut self, now: Instant) {
        if now.saturating_duration_since(self.period_start) < self.period {
            return;
        }
        self.tokens = self.capacity;
        if self.period.is_zero() {
            self.period_start = now;
            return;
        }
        // Align to the period grid so drift does not grant extra periods.
        let elapsed = now.duration_since(self.period_start).as_nanos();
        let whole = elapsed / self.period.as_nanos();
        let advance = self.period.as_nanos() * whole;
        self.period_start += Duration::from_nanos(advance.min(u128::from(u64::MAX)) as u64);
    }
}
