// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Broker health tracking.
//!
//! Every dispatch reports its latency here. Slow or failing brokers are
//! isolated for a duration taken from a step table:
//!
//! | latency (ms) | isolated for (ms) |
//! |---|---|
//! | < 550 | 0 |
//! | >= 550 | 30 000 |
//! | >= 1 000 | 60 000 |
//! | >= 2 000 | 120 000 |
//! | >= 3 000 | 180 000 |
//! | >= 15 000 | 600 000 |
//!
//! Isolating failures (timeouts, connection errors, busy brokers) are
//! charged the configured isolation latency, 30 s by default.

pub mod latency;
pub mod strategy;

pub use latency::{FaultItem, LatencyFaultTolerance};
pub use strategy::FaultStrategy;
