// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Latency-driven broker isolation and fault-aware queue selection.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use super::latency::{FaultItem, LatencyFaultTolerance};
use crate::config::{IsolationStep, ProducerConfig};
use crate::message::MessageQueue;
use crate::route::TopicPublishInfo;

/// Broker health tracker and queue selector.
///
/// With isolation disabled every broker is available and reports only
/// refresh the recorded latency.
#[derive(Debug)]
pub struct FaultStrategy {
    enabled: AtomicBool,
    steps: Vec<IsolationStep>,
    isolation_latency: Duration,
    tolerance: LatencyFaultTolerance,
    reports: AtomicU64,
}

impl FaultStrategy {
    /// Tracker with an explicit step table.
    pub fn new(enabled: bool, steps: Vec<IsolationStep>, isolation_latency: Duration) -> Self {
        Self {
            enabled: AtomicBool::new(enabled),
            steps,
            isolation_latency,
            tolerance: LatencyFaultTolerance::new(),
            reports: AtomicU64::new(0),
        }
    }

    /// Tracker configured from the producer's isolation keys.
    pub fn from_config(config: &ProducerConfig) -> Self {
        Self::new(
            config.send_latency_fault_enable,
            config.isolation_steps.clone(),
            Duration::from_millis(config.isolation_latency_ms),
        )
    }

    /// Whether latency-based isolation is active.
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    /// Toggle isolation at runtime; existing records are kept.
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    /// Isolation duration for `latency`: the duration of the highest step
    /// whose latency threshold is reached, zero below the first step.
    pub fn compute_not_available_duration(&self, latency: Duration) -> Duration {
        let latency_ms = latency.as_millis() as u64;
        self.steps
            .iter()
            .rev()
            .find(|step| latency_ms >= step.latency_ms)
            .map_or(Duration::ZERO, |step| Duration::from_millis(step.duration_ms))
    }

    /// Feed the outcome of one dispatch.
    ///
    /// `isolate` charges the configured isolation latency instead of the
    /// measured one.
    pub fn update_fault_item(&self, broker: &str, latency: Duration, isolate: bool) {
        self.update_fault_item_at(broker, latency, isolate, Instant::now());
    }

    pub(crate) fn update_fault_item_at(
        &self,
        broker: &str,
        latency: Duration,
        isolate: bool,
        now: Instant,
    ) {
        self.reports.fetch_add(1, Ordering::Relaxed);
        if !self.is_enabled() {
            self.tolerance
                .update_fault_item_at(broker, latency, Duration::ZERO, now);
            return;
        }

        let charged = if isolate {
            self.isolation_latency
        } else {
            latency
        };
        let duration = self.compute_not_available_duration(charged);
        if !duration.is_zero() {
            log::debug!(
                "[fault] isolating {} for {:?} (latency {:?}, isolate {})",
                broker,
                duration,
                latency,
                isolate
            );
        }
        self.tolerance
            .update_fault_item_at(broker, latency, duration, now);
    }

    /// Number of dispatch outcomes reported so far.
    pub fn reports(&self) -> u64 {
        self.reports.load(Ordering::Relaxed)
    }

    /// Whether `broker` may be selected now.
    pub fn is_available(&self, broker: &str) -> bool {
        self.is_available_at(broker, Instant::now())
    }

    /// [`FaultStrategy::is_available`] at a given instant.
    pub fn is_available_at(&self, broker: &str, now: Instant) -> bool {
        !self.is_enabled() || self.tolerance.is_available_at(broker, now)
    }

    /// Pick a queue for the next attempt. `None` only for an empty route.
    pub fn select_one_message_queue(
        &self,
        tp_info: &TopicPublishInfo,
        last_broker: Option<&str>,
    ) -> Option<MessageQueue> {
        self.select_one_message_queue_at(tp_info, last_broker, Instant::now())
    }

    pub(crate) fn select_one_message_queue_at(
        &self,
        tp_info: &TopicPublishInfo,
        last_broker: Option<&str>,
        now: Instant,
    ) -> Option<MessageQueue> {
        if !self.is_enabled() {
            return tp_info.select_one_message_queue(last_broker);
        }

        let queues = tp_info.queues();
        let len = queues.len();
        if len == 0 {
            return None;
        }
        let start = tp_info.next_index();
        let position = |i: usize| start.wrapping_add(i) % len;

        for i in 0..len {
            let mq = &queues[position(i)];
            if Some(mq.broker_name.as_str()) != last_broker
                && self.tolerance.is_available_at(&mq.broker_name, now)
            {
                return Some(mq.clone());
            }
        }

        // Nothing healthy off the last broker: take the queue whose broker
        // recovers first. Ties go to another broker, then to scan order.
        let best = (0..len).min_by_key(|&i| {
            let mq = &queues[position(i)];
            let ready_at = self
                .tolerance
                .isolated_until(&mq.broker_name, now)
                .unwrap_or(now);
            let on_last = Some(mq.broker_name.as_str()) == last_broker;
            (ready_at, on_last, i)
        })?;
        let mq = &queues[position(best)];
        log::debug!(
            "[fault] no healthy broker for {}, falling back to {}",
            mq.topic,
            mq.broker_name
        );
        Some(mq.clone())
    }

    /// Record of `broker`, if any.
    pub fn get(&self, broker: &str) -> Option<FaultItem> {
        self.tolerance.get(broker)
    }

    /// Forget `broker`.
    pub fn remove(&self, broker: &str) -> Option<FaultItem> {
        self.tolerance.remove(broker)
    }

    /// Least-bad known broker.
    pub fn pick_one_at_least(&self) -> Option<String> {
        self.tolerance.pick_one_at_least()
    }

    /// Every record, sorted by broker name.
    pub fn snapshot(&self) -> Vec<(String, FaultItem)> {
        self.tolerance.snapshot()
    }
}

impl Default for FaultStrategy {
    fn default() -> Self {
        Self::from_config(&ProducerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MS: Duration = Duration::from_millis(1);

    fn enabled() -> FaultStrategy {
        let config = ProducerConfig::default().send_latency_fault_enable(true);
        FaultStrategy::from_config(&config)
    }

    fn route(layout: &[(&str, i32)]) -> TopicPublishInfo {
        TopicPublishInfo::new(
            layout
                .iter()
                .map(|(broker, id)| MessageQueue::new("orders", *broker, *id))
                .collect(),
        )
    }

    #[test]
    fn test_step_table() {
        let s = enabled();
        assert_eq!(s.compute_not_available_duration(Duration::ZERO), Duration::ZERO);
        assert_eq!(s.compute_not_available_duration(100 * MS), Duration::ZERO);
        assert_eq!(s.compute_not_available_duration(549 * MS), Duration::ZERO);
        assert_eq!(s.compute_not_available_duration(550 * MS), 30_000 * MS);
        assert_eq!(s.compute_not_available_duration(1_500 * MS), 60_000 * MS);
        assert_eq!(s.compute_not_available_duration(30_000 * MS), 600_000 * MS);
    }

    #[test]
    fn test_step_table_is_monotonic() {
        let s = enabled();
        let mut previous = Duration::ZERO;
        for ms in (0..20_000u32).step_by(37) {
            let d = s.compute_not_available_duration(ms * MS);
            assert!(d >= previous);
            previous = d;
        }
    }

    #[test]
    fn test_isolate_charges_isolation_latency() {
        let s = enabled();
        let now = Instant::now();
        s.update_fault_item_at("broker-a", 5 * MS, true, now);
        assert!(!s.is_available_at("broker-a", now));
        assert!(!s.is_available_at("broker-a", now + 599_999 * MS));
        assert!(s.is_available_at("broker-a", now + 600_000 * MS));
        assert_eq!(s.get("broker-a").expect("record").current_latency, 5 * MS);
    }

    #[test]
    fn test_disabled_records_latency_only() {
        let s = FaultStrategy::default();
        assert!(!s.is_enabled());
        s.update_fault_item("broker-a", 20_000 * MS, true);
        assert!(s.is_available("broker-a"));
        let item = s.get("broker-a").expect("record");
        assert_eq!(item.current_latency, 20_000 * MS);
        assert_eq!(s.reports(), 1);
    }

    #[test]
    fn test_skips_isolated_broker() {
        let s = enabled();
        let now = Instant::now();
        let info = route(&[("broker-a", 0), ("broker-a", 1), ("broker-b", 0)]);
        s.update_fault_item_at("broker-a", 600 * MS, false, now);

        for _ in 0..100 {
            let mq = s
                .select_one_message_queue_at(&info, None, now)
                .expect("queue");
            assert_eq!(mq, MessageQueue::new("orders", "broker-b", 0));
        }
    }

    #[test]
    fn test_avoids_last_broker_when_healthy_alternative() {
        let s = enabled();
        let info = route(&[("broker-a", 0), ("broker-b", 0), ("broker-c", 0)]);
        for _ in 0..30 {
            let mq = s
                .select_one_message_queue(&info, Some("broker-b"))
                .expect("queue");
            assert_ne!(mq.broker_name, "broker-b");
        }
    }

    #[test]
    fn test_fallback_prefers_earliest_recovery() {
        let s = enabled();
        let now = Instant::now();
        let info = route(&[("broker-a", 0), ("broker-b", 0), ("broker-c", 0)]);
        s.update_fault_item_at("broker-a", 3_000 * MS, false, now);
        s.update_fault_item_at("broker-b", 600 * MS, false, now);
        s.update_fault_item_at("broker-c", 15_000 * MS, false, now);

        for _ in 0..10 {
            let mq = s
                .select_one_message_queue_at(&info, None, now)
                .expect("queue");
            assert_eq!(mq.broker_name, "broker-b");
        }
    }

    #[test]
    fn test_fallback_tie_prefers_other_broker_then_scan_order() {
        let s = enabled();
        let now = Instant::now();
        let info = route(&[("broker-a", 0), ("broker-b", 0), ("broker-c", 0)]);
        for broker in ["broker-a", "broker-b", "broker-c"] {
            s.update_fault_item_at(broker, 600 * MS, false, now);
        }

        // Equal deadlines: never the last broker, and the first eligible
        // queue in scan order from the cursor.
        let mut seen = Vec::new();
        for _ in 0..6 {
            let mq = s
                .select_one_message_queue_at(&info, Some("broker-a"), now)
                .expect("queue");
            assert_ne!(mq.broker_name, "broker-a");
            seen.push(mq.broker_name);
        }
        assert_eq!(
            seen,
            ["broker-b", "broker-b", "broker-c", "broker-b", "broker-b", "broker-c"]
        );
    }

    #[test]
    fn test_only_last_broker_healthy_is_chosen() {
        let s = enabled();
        let now = Instant::now();
        let info = route(&[("broker-a", 0), ("broker-b", 0)]);
        s.update_fault_item_at("broker-b", 600 * MS, false, now);

        let mq = s
            .select_one_message_queue_at(&info, Some("broker-a"), now)
            .expect("queue");
        assert_eq!(mq.broker_name, "broker-a");
    }

    #[test]
    fn test_empty_route() {
        let s = enabled();
        assert!(s
            .select_one_message_queue(&TopicPublishInfo::new(Vec::new()), None)
            .is_none());
    }
}
