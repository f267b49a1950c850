// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Quality of Service configuration consumed by the reliability engine.
//!
//! A `QosProfile` is a plain value: writers and readers copy it at creation
//! and never look at it again except through their own fields.
//!
//! # Example
//!
//! ```
//! use rtps_reliable::qos::{QosProfile, History};
//!
//! let qos = QosProfile::reliable().keep_last(2).transient_local();
//! assert!(qos.validate().is_ok());
//! assert_eq!(qos.history, History::KeepLast(2));
//! ```

#[cfg(feature = "qos-loaders")]
pub mod yaml;

use crate::config;
use crate::error::{Error, Result};
use std::time::Duration;

/// Value meaning "no limit" in `ResourceLimits`.
pub const LENGTH_UNLIMITED: usize = usize::MAX;

/// Complete QoS for one local endpoint.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QosProfile {
    /// Delivery guarantee.
    pub reliability: Reliability,
    /// Retention policy of the endpoint history.
    pub history: History,
    /// Whether history is replayed to late-joining readers.
    pub durability: Durability,
    /// Hard bounds on the history.
    pub resource_limits: ResourceLimits,
    /// How long `write()` may wait for room in a full history.
    pub max_blocking_time: Duration,
    /// Writer heartbeat period.
    pub heartbeat_period: Duration,
    /// Delay between a NACK and the retransmission it triggers.
    pub nack_response_delay: Duration,
    /// NACKs for a change sent less than this long ago are ignored.
    pub nack_suppression_duration: Duration,
    /// Delay between a HEARTBEAT and the reader's ACKNACK.
    pub heartbeat_response_delay: Duration,
    /// A reliable reader silent for this long while owing ACKs is dropped.
    pub lease_duration: Duration,
    /// Inline or deferred sending.
    pub publish_mode: PublishMode,
    /// Optional rate limit (asynchronous publish mode only).
    pub flow_controller: Option<FlowControllerConfig>,
}

impl Default for QosProfile {
    fn default() -> Self {
        Self {
            reliability: Reliability::BestEffort,
            history: History::KeepLast(1),
            durability: Durability::Volatile,
            resource_limits: ResourceLimits::default(),
            max_blocking_time: config::DEFAULT_MAX_BLOCKING_TIME,
            heartbeat_period: config::DEFAULT_HEARTBEAT_PERIOD,
            nack_response_delay: config::DEFAULT_NACK_RESPONSE_DELAY,
            nack_suppression_duration: config::DEFAULT_NACK_SUPPRESSION_DURATION,
            heartbeat_response_delay: config::DEFAULT_HEARTBEAT_RESPONSE_DELAY,
            lease_duration: config::DEFAULT_LEASE_DURATION,
            publish_mode: PublishMode::Synchronous,
            flow_controller: None,
        }
    }
}

impl QosProfile {
    /// Best-effort, volatile, KEEP_LAST(1).
    #[must_use]
    pub fn best_effort() -> Self {
        Self::default()
    }

    /// Reliable, volatile, KEEP_LAST(1).
    #[must_use]
    pub fn reliable() -> Self {
        Self {
            reliability: Reliability::Reliable,
            ..Self::default()
        }
    }

    /// Set KEEP_LAST history with the given depth.
    #[must_use]
    pub fn keep_last(mut self, depth: u32) -> Self {
        self.history = History::KeepLast(depth);
        self
    }

    /// Set KEEP_ALL history.
    #[must_use]
    pub fn keep_all(mut self) -> Self {
        self.history = History::KeepAll;
        self
    }

    /// Set TRANSIENT_LOCAL durability.
    #[must_use]
    pub fn transient_local(mut self) -> Self {
        self.durability = Durability::TransientLocal;
        self
    }

    /// Set the history bound in samples.
    #[must_use]
    pub fn max_samples(mut self, max_samples: usize) -> Self {
        self.resource_limits.max_samples = max_samples;
        self
    }

    /// Set how long a write may block on a full history.
    #[must_use]
    pub fn max_blocking_time(mut self, timeout: Duration) -> Self {
        self.max_blocking_time = timeout;
        self
    }

    /// Set the heartbeat period.
    #[must_use]
    pub fn heartbeat_period(mut self, period: Duration) -> Self {
        self.heartbeat_period = period;
        self
    }

    /// Set the NACK response delay.
    #[must_use]
    pub fn nack_response_delay(mut self, delay: Duration) -> Self {
        self.nack_response_delay = delay;
        self
    }

    /// Set the reader heartbeat response delay.
    #[must_use]
    pub fn heartbeat_response_delay(mut self, delay: Duration) -> Self {
        self.heartbeat_response_delay = delay;
        self
    }

    /// Set the reader lease duration.
    #[must_use]
    pub fn lease_duration(mut self, lease: Duration) -> Self {
        self.lease_duration = lease;
        self
    }

    /// Switch to asynchronous publishing through the given flow controller.
    #[must_use]
    pub fn flow_controlled(mut self, flow: FlowControllerConfig) -> Self {
        self.publish_mode = PublishMode::Asynchronous;
        self.flow_controller = Some(flow);
        self
    }

    /// Whether this endpoint takes part in ACK/NACK repair.
    #[must_use]
    pub fn is_reliable(&self) -> bool {
        self.reliability == Reliability::Reliable
    }

    /// Samples kept per instance (KEEP_LAST depth capped by resource limits).
    #[must_use]
    pub fn depth_per_instance(&self) -> usize {
        match self.history {
            History::KeepLast(depth) => {
                (depth as usize).min(self.resource_limits.max_samples_per_instance)
            }
            History::KeepAll => self.resource_limits.max_samples_per_instance,
        }
    }

    /// Validate QoS configuration.
    ///
    /// # Validation Rules
    ///
    /// - History::KeepLast(n) where n > 0
    /// - History::KeepAll requires ResourceLimits.max_samples > 0
    /// - max_samples >= max_samples_per_instance (when both bounded)
    /// - reliable endpoints need a non-zero heartbeat period
    /// - flow controllers need asynchronous publish mode and a non-zero period
    pub fn validate(&self) -> Result<()> {
        match self.history {
            History::KeepLast(0) => {
                return Err(Error::InvalidQos(
                    "History::KeepLast(n) requires n > 0".to_string(),
                ));
            }
            History::KeepAll if self.resource_limits.max_samples == 0 => {
                return Err(Error::InvalidQos(
                    "History::KeepAll requires ResourceLimits.max_samples > 0".to_string(),
                ));
            }
            _ => {}
        }

        let rl = &self.resource_limits;
        if rl.max_samples == 0 || rl.max_instances == 0 || rl.max_samples_per_instance == 0 {
            return Err(Error::InvalidQos(
                "resource limits must be positive".to_string(),
            ));
        }
        if rl.max_samples != LENGTH_UNLIMITED
            && rl.max_samples_per_instance != LENGTH_UNLIMITED
            && rl.max_samples < rl.max_samples_per_instance
        {
            return Err(Error::InvalidQos(format!(
                "max_samples ({}) must be >= max_samples_per_instance ({})",
                rl.max_samples, rl.max_samples_per_instance
            )));
        }

        if self.is_reliable() && self.heartbeat_period.is_zero() {
            return Err(Error::InvalidQos(
                "reliable endpoints require heartbeat_period > 0".to_string(),
            ));
        }

        if let Some(flow) = &self.flow_controller {
            if self.publish_mode != PublishMode::Asynchronous {
                return Err(Error::InvalidQos(
                    "flow_controller requires asynchronous publish mode".to_string(),
                ));
            }
            if flow.period.is_zero() {
                return Err(Error::InvalidQos(
                    "flow_controller period must be > 0".to_string(),
                ));
            }
        }

        Ok(())
    }
}

/// Reliability policy.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum Reliability {
    /// Fire-and-forget (no ACKs, no retransmission).
    #[default]
    BestEffort,
    /// Heartbeat/ACKNACK driven repair.
    Reliable,
}

/// History policy.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum History {
    /// Keep the last N samples per instance (oldest evicted first).
    KeepLast(u32),
    /// Keep everything within `ResourceLimits`; writes block or fail when full.
    KeepAll,
}

impl Default for History {
    fn default() -> Self {
        Self::KeepLast(1)
    }
}

/// Durability policy.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum Durability {
    /// Late joiners only see samples written after they matched.
    #[default]
    Volatile,
    /// Writer replays its history to late-joining readers.
    TransientLocal,
}

/// Resource limits for a history.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ResourceLimits {
    /// Maximum samples across all instances.
    pub max_samples: usize,
    /// Maximum distinct instance keys.
    pub max_instances: usize,
    /// Maximum samples for one instance.
    pub max_samples_per_instance: usize,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            max_samples: LENGTH_UNLIMITED,
            max_instances: LENGTH_UNLIMITED,
            max_samples_per_instance: LENGTH_UNLIMITED,
        }
    }
}

/// When DATA leaves the writer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum PublishMode {
    /// Sent inline from `write()`.
    #[default]
    Synchronous,
    /// Sent from the event thread, paced by an optional flow controller.
    Asynchronous,
}

/// Order in which deferred writers sharing a flow controller are served.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum FlowScheduler {
    /// First writer deferred is drained first.
    #[default]
    Fifo,
    /// Deferred writers take turns, one message each.
    RoundRobin,
}

/// Token-bucket flow controller settings.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FlowControllerConfig {
    /// Controllers with the same name on one participant are shared.
    pub name: String,
    /// Bytes allowed per period.
    pub bytes_per_period: usize,
    /// Refill period.
    pub period: Duration,
    /// Service order of deferred writers.
    pub scheduler: FlowScheduler,
}

impl FlowControllerConfig {
    /// Create a FIFO controller config.
    #[must_use]
    pub fn new(name: impl Into<String>, bytes_per_period: usize, period: Duration) -> Self {
        Self {
            name: name.into(),
            bytes_per_period,
            period,
            scheduler: FlowScheduler::Fifo,
        }
    }

    /// Use round-robin service between writers.
    #[must_use]
    pub fn round_robin(mut self) -> Self {
        self.scheduler = FlowScheduler::RoundRobin;
        self
    }

    /// Reject a rate that cannot carry one full message per period.
    pub fn validate(&self, max_message_size: usize) -> Result<()> {
        if self.period.is_zero() {
            return Err(Error::InvalidQos(format!(
                "flow controller '{}': period must be > 0",
                self.name
            )));
        }
        if self.bytes_per_period < max_message_size {
            return Err(Error::InvalidQos(format!(
                "flow controller '{}': {} bytes per period is below one message ({} bytes)",
                self.name, self.bytes_per_period, max_message_size
            )));
        }
        Ok(())
    }
}
