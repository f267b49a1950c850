// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! # Core Primitives
//!
//! Protocol-agnostic building blocks shared by every endpoint.
//!
//! | Module | Description |
//! |--------|-------------|
//! | `guid` | GUID prefix, entity id, full GUID |
//! | `change` | CacheChange, change kinds, RTPS time |
//! | `timed_event` | Deferred/periodic callback thread with RAII handles |

pub mod change;
pub mod guid;
pub mod timed_event;

pub use change::{CacheChange, ChangeKind, InstanceKey, Time, KEYLESS};
pub use guid::{EntityId, Guid, GuidPrefix};
pub use timed_event::{EventAction, EventHandle, SchedulerHandle, TimedEventScheduler};
