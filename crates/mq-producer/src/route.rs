// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Topic routes.
//!
//! The naming service is reached through [`RouteProvider`]. Fetched routes
//! are turned into [`TopicPublishInfo`] (the writable queues of a topic plus
//! a round-robin cursor) and cached in [`TopicRouteCache`]. A refresh swaps
//! in a whole new `Arc<TopicPublishInfo>`; senders holding the old one keep
//! a consistent, possibly stale, view. The cursor survives refreshes.
//!
//! Broker master addresses live in a separate copy-on-write table
//! (`ArcSwap<HashMap>`), read without locking on every dispatch.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use dashmap::DashMap;

use crate::error::{ClientError, RemotingError, Result};
use crate::executor::PeriodicTask;
use crate::message::MessageQueue;

/// Broker id of a master node.
pub const MASTER_ID: i64 = 0;

/// Queue permission bits.
pub mod perm {
    /// Queue is preferred by consumers.
    pub const PRIORITY: u32 = 0x1 << 3;
    /// Queue is readable.
    pub const READ: u32 = 0x1 << 2;
    /// Queue is writable.
    pub const WRITE: u32 = 0x1 << 1;
    /// Permission inherited from the topic config.
    pub const INHERIT: u32 = 0x1;

    /// Whether `perm` allows writes.
    pub fn is_writeable(perm: u32) -> bool {
        perm & WRITE == WRITE
    }
}

/// Queue layout of one broker for a topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueData {
    /// Broker hosting the queues.
    pub broker_name: String,
    /// Queues consumers read from.
    pub read_queue_nums: u32,
    /// Queues producers write to.
    pub write_queue_nums: u32,
    /// Permission bits, see [`perm`].
    pub perm: u32,
}

impl QueueData {
    /// Readable and writeable queue data.
    pub fn read_write(broker_name: impl Into<String>, queue_nums: u32) -> Self {
        Self {
            broker_name: broker_name.into(),
            read_queue_nums: queue_nums,
            write_queue_nums: queue_nums,
            perm: perm::READ | perm::WRITE,
        }
    }
}

/// Addresses of one broker set, keyed by broker id (0 is the master).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BrokerData {
    /// Broker set name, shared by master and slaves.
    pub broker_name: String,
    /// `host:port` per broker id.
    pub broker_addrs: BTreeMap<i64, String>,
}

impl BrokerData {
    /// Broker set with only a master address.
    pub fn with_master(broker_name: impl Into<String>, addr: impl Into<String>) -> Self {
        let mut broker_addrs = BTreeMap::new();
        broker_addrs.insert(MASTER_ID, addr.into());
        Self {
            broker_name: broker_name.into(),
            broker_addrs,
        }
    }

    /// Address of broker id [`MASTER_ID`].
    pub fn master_addr(&self) -> Option<&str> {
        self.broker_addrs.get(&MASTER_ID).map(String::as_str)
    }
}

/// Route metadata returned by the naming service.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TopicRouteData {
    /// Ordered-topic configuration, if the topic is ordered.
    pub order_topic_conf: Option<String>,
    /// Queue layout per broker.
    pub queue_datas: Vec<QueueData>,
    /// Addresses per broker set.
    pub broker_datas: Vec<BrokerData>,
}

/// Naming-service collaborator.
pub trait RouteProvider: Send + Sync {
    /// Current route of `topic`.
    fn fetch_topic_route(&self, topic: &str) -> std::result::Result<TopicRouteData, RemotingError>;
}

/// Writable queues of a topic plus the shared round-robin cursor.
#[derive(Debug)]
pub struct TopicPublishInfo {
    order_topic: bool,
    queues: Vec<MessageQueue>,
    cursor: Arc<AtomicUsize>,
    route: TopicRouteData,
}

impl TopicPublishInfo {
    /// Build from explicit queues (fresh cursor).
    pub fn new(queues: Vec<MessageQueue>) -> Self {
        Self {
            order_topic: false,
            queues,
            cursor: Arc::new(AtomicUsize::new(0)),
            route: TopicRouteData::default(),
        }
    }

    /// Build from route data: every writable broker with a master address
    /// contributes `write_queue_nums` queues, brokers in name order.
    pub fn from_route(topic: &str, route: TopicRouteData) -> Self {
        let mut queue_datas: Vec<&QueueData> = route
            .queue_datas
            .iter()
            .filter(|qd| perm::is_writeable(qd.perm))
            .collect();
        queue_datas.sort_by(|a, b| a.broker_name.cmp(&b.broker_name));

        let mut queues = Vec::new();
        for qd in queue_datas {
            let has_master = route
                .broker_datas
                .iter()
                .any(|bd| bd.broker_name == qd.broker_name && bd.master_addr().is_some());
            if !has_master {
                log::debug!(
                    "[route] {} skips broker {} without master",
                    topic,
                    qd.broker_name
                );
                continue;
            }
            for queue_id in 0..qd.write_queue_nums {
                queues.push(MessageQueue::new(topic, &qd.broker_name, queue_id as i32));
            }
        }

        Self {
            order_topic: route.order_topic_conf.as_deref().is_some_and(|c| !c.is_empty()),
            queues,
            cursor: Arc::new(AtomicUsize::new(0)),
            route,
        }
    }

    /// Share `previous`'s cursor so round-robin continues after a refresh.
    pub fn with_cursor_of(mut self, previous: &TopicPublishInfo) -> Self {
        self.cursor = Arc::clone(&previous.cursor);
        self
    }

    /// The route has at least one writable queue.
    pub fn ok(&self) -> bool {
        !self.queues.is_empty()
    }

    /// Whether the naming service marks the topic as ordered.
    pub fn is_order_topic(&self) -> bool {
        self.order_topic
    }

    /// Writable queues, brokers in name order.
    pub fn queues(&self) -> &[MessageQueue] {
        &self.queues
    }

    /// Route data this info was built from.
    pub fn route(&self) -> &TopicRouteData {
        &self.route
    }

    /// Advance the cursor, returning its previous value.
    pub fn next_index(&self) -> usize {
        self.cursor.fetch_add(1, Ordering::Relaxed)
    }

    /// Round-robin choice that avoids `last_broker` when another broker
    /// hosts a queue. `None` only for an empty route.
    pub fn select_one_message_queue(&self, last_broker: Option<&str>) -> Option<MessageQueue> {
        let len = self.queues.len();
        if len == 0 {
            return None;
        }
        let start = self.next_index();

        if let Some(last) = last_broker {
            for i in 0..len {
                let mq = &self.queues[start.wrapping_add(i) % len];
                if mq.broker_name != last {
                    return Some(mq.clone());
                }
            }
        }
        Some(self.queues[start % len].clone())
    }
}

/// Cache of publish routes and broker master addresses.
pub struct TopicRouteCache {
    provider: Arc<dyn RouteProvider>,
    routes: DashMap<String, Arc<TopicPublishInfo>>,
    broker_addrs: ArcSwap<HashMap<String, String>>,
}

impl TopicRouteCache {
    /// Empty cache over `provider`.
    pub fn new(provider: Arc<dyn RouteProvider>) -> Self {
        Self {
            provider,
            routes: DashMap::new(),
            broker_addrs: ArcSwap::from_pointee(HashMap::new()),
        }
    }

    /// Cached route, fetching it on first use.
    ///
    /// An empty cached route is re-fetched, so a topic created after the
    /// first send becomes usable without waiting for the refresher.
    pub fn get_or_fetch(&self, topic: &str) -> Result<Arc<TopicPublishInfo>> {
        if let Some(info) = self.routes.get(topic) {
            if info.ok() {
                return Ok(Arc::clone(&info));
            }
        }
        self.refresh(topic)
    }

    /// Cached route without fetching.
    pub fn get(&self, topic: &str) -> Option<Arc<TopicPublishInfo>> {
        self.routes.get(topic).map(|info| Arc::clone(&info))
    }

    /// Fetch `topic` from the provider and swap in the new route.
    pub fn refresh(&self, topic: &str) -> Result<Arc<TopicPublishInfo>> {
        let route = self.provider.fetch_topic_route(topic).map_err(|e| {
            log::warn!("[route] fetch {} failed: {}", topic, e);
            ClientError::RouteUnavailable {
                topic: topic.to_string(),
            }
        })?;

        self.update_broker_addrs(&route.broker_datas);

        let mut info = TopicPublishInfo::from_route(topic, route);
        if let Some(previous) = self.routes.get(topic) {
            info = info.with_cursor_of(&previous);
        }
        let info = Arc::new(info);
        self.routes.insert(topic.to_string(), Arc::clone(&info));

        log::debug!(
            "[route] {} refreshed: {} writable queues",
            topic,
            info.queues().len()
        );
        Ok(info)
    }

    /// Refresh every cached topic; failures keep the previous route.
    pub fn refresh_all(&self) -> usize {
        let topics: Vec<String> = self.routes.iter().map(|e| e.key().clone()).collect();
        topics
            .iter()
            .filter(|topic| self.refresh(topic).is_ok())
            .count()
    }

    fn update_broker_addrs(&self, broker_datas: &[BrokerData]) {
        self.broker_addrs.rcu(|current| {
            let mut next = HashMap::clone(current);
            for bd in broker_datas {
                if let Some(addr) = bd.master_addr() {
                    next.insert(bd.broker_name.clone(), addr.to_string());
                }
            }
            next
        });
    }

    /// Master address of `broker`.
    pub fn find_broker_address(&self, broker: &str) -> Option<String> {
        self.broker_addrs.load().get(broker).cloned()
    }

    /// Cached topic names, sorted.
    pub fn topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.routes.iter().map(|e| e.key().clone()).collect();
        topics.sort();
        topics
    }
}

/// Background thread calling [`TopicRouteCache::refresh_all`] periodically.
pub struct RouteRefresher {
    task: PeriodicTask,
}

impl RouteRefresher {
    /// Start refreshing every cached topic each `interval`.
    pub fn spawn(cache: Arc<TopicRouteCache>, interval: Duration) -> std::io::Result<Self> {
        let task = PeriodicTask::spawn("mq-route-refresh", interval, move || {
            let refreshed = cache.refresh_all();
            log::trace!("[route] refreshed {} topics", refreshed);
        })?;
        Ok(Self { task })
    }

    /// Stop polling and join the thread.
    pub fn shutdown(self) {
        self.task.shutdown();
    }
}
