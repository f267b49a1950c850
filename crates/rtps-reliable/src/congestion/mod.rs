// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Publish pacing for asynchronous writers.

pub mod flow_controller;
pub mod token_bucket;

pub use flow_controller::{FlowClient, FlowController, FlowStats, FlushResult};
pub use token_bucket::TokenBucket;
