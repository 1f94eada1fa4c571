// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Per-broker latency and isolation records.
//!
//! Records are created lazily on the first report for a broker. A record's
//! latency and deadline are always written together while holding the
//! broker's map entry, so a reader never sees one without the other.

use std::time::{Duration, Instant};

use dashmap::DashMap;

/// Latency/isolation state of one broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FaultItem {
    /// Latency of the most recent dispatch.
    pub current_latency: Duration,
    /// Broker is skipped by selection until this instant.
    pub not_available_until: Instant,
}

impl FaultItem {
    /// Whether the isolation window has passed at `now`.
    pub fn is_available_at(&self, now: Instant) -> bool {
        now >= self.not_available_until
    }

    /// Isolation time left at `now` (zero when available).
    pub fn remaining_at(&self, now: Instant) -> Duration {
        self.not_available_until.saturating_duration_since(now)
    }
}

/// Broker fault table.
#[derive(Debug, Default)]
pub struct LatencyFaultTolerance {
    items: DashMap<String, FaultItem>,
}

impl LatencyFaultTolerance {
    /// Empty table; every broker is available.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a dispatch latency and isolate the broker for `not_available`.
    pub fn update_fault_item(&self, broker: &str, latency: Duration, not_available: Duration) {
        self.update_fault_item_at(broker, latency, not_available, Instant::now());
    }

    pub(crate) fn update_fault_item_at(
        &self,
        broker: &str,
        latency: Duration,
        not_available: Duration,
        now: Instant,
    ) {
        let item = FaultItem {
            current_latency: latency,
            not_available_until: now + not_available,
        };
        match self.items.get_mut(broker) {
            Some(mut entry) => *entry = item,
            None => {
                self.items.insert(broker.to_string(), item);
            }
        }
    }

    /// Unseen brokers are available.
    pub fn is_available(&self, broker: &str) -> bool {
        self.is_available_at(broker, Instant::now())
    }

    /// Availability of `broker` at `now`.
    pub fn is_available_at(&self, broker: &str, now: Instant) -> bool {
        self.items
            .get(broker)
            .map_or(true, |item| item.is_available_at(now))
    }

    /// Isolation deadline if `broker` is unavailable at `now`.
    pub fn isolated_until(&self, broker: &str, now: Instant) -> Option<Instant> {
        self.items
            .get(broker)
            .filter(|item| !item.is_available_at(now))
            .map(|item| item.not_available_until)
    }

    /// Current record of `broker`, if it was ever reported.
    pub fn get(&self, broker: &str) -> Option<FaultItem> {
        self.items.get(broker).map(|item| *item)
    }

    /// Forget a broker (e.g. removed from every route).
    pub fn remove(&self, broker: &str) -> Option<FaultItem> {
        self.items.remove(broker).map(|(_, item)| item)
    }

    /// Least-bad known broker: available ones first, then lowest latency,
    /// then earliest deadline.
    pub fn pick_one_at_least(&self) -> Option<String> {
        let now = Instant::now();
        self.items
            .iter()
            .min_by_key(|entry| {
                let item = entry.value();
                (
                    !item.is_available_at(now),
                    item.current_latency,
                    item.not_available_until,
                )
            })
            .map(|entry| entry.key().clone())
    }

    /// Copy of every record, sorted by broker name.
    pub fn snapshot(&self) -> Vec<(String, FaultItem)> {
        let mut out: Vec<_> = self
            .items
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    /// Number of brokers with a record.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// No broker was reported yet.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}
