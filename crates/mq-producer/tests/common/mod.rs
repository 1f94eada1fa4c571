// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Scripted broker cluster shared by the integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use mq_producer::message::{property, string_to_properties};
use mq_producer::util::create_message_id;
use mq_producer::{
    BrokerData, EndTransactionRequestHeader, Message, Producer, ProducerConfig, QueueData, RemotingError,
    RouteProvider, SendCompletion, SendMessageRequest, SendMessageResponse, SendStatus,
    TopicRouteData, Transport,
};

/// What a broker does with the next request.
#[derive(Debug, Clone)]
pub enum Outcome {
    Ok,
    Status(SendStatus),
    Timeout,
    /// Hold the request for the given time, then time out.
    SlowTimeout(Duration),
    Connect,
    Code(i32),
}

/// One dispatch as seen by the cluster.
#[derive(Debug, Clone)]
pub struct Dispatch {
    pub addr: String,
    pub broker: String,
    pub request: SendMessageRequest,
    pub oneway: bool,
}

/// One end-transaction report.
#[derive(Debug, Clone)]
pub struct EndReport {
    pub addr: String,
    pub header: EndTransactionRequestHeader,
    pub remark: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AsyncMode {
    /// Complete on a fresh thread.
    Threaded,
    /// Complete before `invoke_async` returns.
    Inline,
    /// Drop the continuation without calling it.
    Lose,
}

pub struct MockTransport {
    brokers: HashMap<String, String>,
    outcomes: Mutex<HashMap<String, Outcome>>,
    scripts: Mutex<HashMap<String, Vec<Outcome>>>,
    pub dispatches: Mutex<Vec<Dispatch>>,
    pub end_reports: Mutex<Vec<EndReport>>,
    async_mode: Mutex<AsyncMode>,
    fail_end_transaction: AtomicBool,
    next_offset: AtomicI64,
}

pub fn broker_addr(index: usize) -> String {
    format!("10.0.0.{}:10911", index + 1)
}

impl MockTransport {
    pub fn new(brokers: &[&str]) -> Self {
        let brokers = brokers
            .iter()
            .enumerate()
            .map(|(i, name)| (broker_addr(i), name.to_string()))
            .collect();
        Self {
            brokers,
            outcomes: Mutex::new(HashMap::new()),
            scripts: Mutex::new(HashMap::new()),
            dispatches: Mutex::new(Vec::new()),
            end_reports: Mutex::new(Vec::new()),
            async_mode: Mutex::new(AsyncMode::Threaded),
            fail_end_transaction: AtomicBool::new(false),
            next_offset: AtomicI64::new(1_000),
        }
    }

    /// Every request to `broker` gets `outcome`.
    pub fn set_outcome(&self, broker: &str, outcome: Outcome) {
        self.outcomes.lock().insert(broker.to_string(), outcome);
    }

    /// The next requests to `broker` get `outcomes` in order, then the
    /// standing outcome.
    pub fn script(&self, broker: &str, outcomes: Vec<Outcome>) {
        self.scripts.lock().insert(broker.to_string(), outcomes);
    }

    pub fn set_async_mode(&self, mode: AsyncMode) {
        *self.async_mode.lock() = mode;
    }

    pub fn fail_end_transaction(&self, fail: bool) {
        self.fail_end_transaction.store(fail, Ordering::Relaxed);
    }

    pub fn dispatch_count(&self) -> usize {
        self.dispatches.lock().len()
    }

    pub fn dispatched_brokers(&self) -> Vec<String> {
        self.dispatches
            .lock()
            .iter()
            .map(|d| d.broker.clone())
            .collect()
    }

    pub fn last_dispatch(&self) -> Option<Dispatch> {
        self.dispatches.lock().last().cloned()
    }

    pub fn end_reports(&self) -> Vec<EndReport> {
        self.end_reports.lock().clone()
    }

    fn next_outcome(&self, broker: &str) -> Outcome {
        if let Some(script) = self.scripts.lock().get_mut(broker) {
            if !script.is_empty() {
                return script.remove(0);
            }
        }
        self.outcomes
            .lock()
            .get(broker)
            .cloned()
            .unwrap_or(Outcome::Ok)
    }

    fn handle(
        &self,
        addr: &str,
        request: &SendMessageRequest,
        oneway: bool,
    ) -> Result<SendMessageResponse, RemotingError> {
        let broker = self
            .brokers
            .get(addr)
            .cloned()
            .unwrap_or_else(|| "unknown".to_string());
        self.dispatches.lock().push(Dispatch {
            addr: addr.to_string(),
            broker: broker.clone(),
            request: request.clone(),
            oneway,
        });

        let status = match self.next_outcome(&broker) {
            Outcome::Ok => SendStatus::SendOk,
            Outcome::Status(status) => status,
            Outcome::Timeout => {
                return Err(RemotingError::Timeout {
                    addr: addr.to_string(),
                    timeout: Duration::from_millis(100),
                })
            }
            Outcome::SlowTimeout(hold) => {
                std::thread::sleep(hold);
                return Err(RemotingError::Timeout {
                    addr: addr.to_string(),
                    timeout: hold,
                });
            }
            Outcome::Connect => {
                return Err(RemotingError::Connect {
                    addr: addr.to_string(),
                    reason: "connection refused".into(),
                })
            }
            Outcome::Code(code) => return Err(RemotingError::broker(addr, code, "scripted")),
        };

        let store: SocketAddr = addr.parse().map_err(|_| RemotingError::Connect {
            addr: addr.to_string(),
            reason: "bad address".into(),
        })?;
        let offset = self.next_offset.fetch_add(100, Ordering::Relaxed);
        Ok(SendMessageResponse {
            status,
            offset_msg_id: create_message_id(store, offset),
            queue_id: request.header.queue_id,
            queue_offset: offset / 100,
            transaction_id: None,
            region_id: Some("DefaultRegion".into()),
        })
    }
}

impl Transport for MockTransport {
    fn invoke_sync(
        &self,
        addr: &str,
        request: &SendMessageRequest,
        _timeout: Duration,
    ) -> Result<SendMessageResponse, RemotingError> {
        self.handle(addr, request, false)
    }

    fn invoke_async(
        &self,
        addr: &str,
        request: SendMessageRequest,
        _timeout: Duration,
        on_complete: SendCompletion,
    ) {
        let mode = *self.async_mode.lock();
        let outcome = self.handle(addr, &request, false);
        match mode {
            AsyncMode::Inline => on_complete(outcome),
            AsyncMode::Threaded => {
                std::thread::spawn(move || on_complete(outcome));
            }
            AsyncMode::Lose => drop(on_complete),
        }
    }

    fn invoke_oneway(&self, addr: &str, request: &SendMessageRequest) -> Result<(), RemotingError> {
        self.handle(addr, request, true).map(|_| ())
    }

    fn end_transaction_oneway(
        &self,
        addr: &str,
        header: &EndTransactionRequestHeader,
        remark: Option<&str>,
        _timeout: Duration,
    ) -> Result<(), RemotingError> {
        self.end_reports.lock().push(EndReport {
            addr: addr.to_string(),
            header: header.clone(),
            remark: remark.map(str::to_string),
        });
        if self.fail_end_transaction.load(Ordering::Relaxed) {
            return Err(RemotingError::SendRequest {
                addr: addr.to_string(),
                reason: "scripted".into(),
            });
        }
        Ok(())
    }
}

/// Fixed routes, one entry per topic.
pub struct StaticRoutes {
    routes: Mutex<HashMap<String, TopicRouteData>>,
}

impl StaticRoutes {
    pub fn new() -> Self {
        Self {
            routes: Mutex::new(HashMap::new()),
        }
    }

    /// `layout` is `(broker, write queue count)`; broker `i` listens on
    /// [`broker_addr`]`(i)`.
    pub fn add_topic(&self, topic: &str, layout: &[(&str, u32)]) {
        let route = TopicRouteData {
            order_topic_conf: None,
            queue_datas: layout
                .iter()
                .map(|(broker, n)| QueueData::read_write(*broker, *n))
                .collect(),
            broker_datas: layout
                .iter()
                .enumerate()
                .map(|(i, (broker, _))| BrokerData::with_master(*broker, broker_addr(i)))
                .collect(),
        };
        self.routes.lock().insert(topic.to_string(), route);
    }
}

impl RouteProvider for StaticRoutes {
    fn fetch_topic_route(&self, topic: &str) -> Result<TopicRouteData, RemotingError> {
        self.routes
            .lock()
            .get(topic)
            .cloned()
            .ok_or_else(|| RemotingError::broker("namesrv", 17, format!("no route for {topic}")))
    }
}

pub const TOPIC: &str = "orders";

/// Running producer over a cluster serving [`TOPIC`] with `layout`.
pub fn cluster(
    config: ProducerConfig,
    layout: &[(&str, u32)],
) -> (Producer, Arc<MockTransport>, Arc<StaticRoutes>) {
    let names: Vec<&str> = layout.iter().map(|(b, _)| *b).collect();
    let transport = Arc::new(MockTransport::new(&names));
    let routes = Arc::new(StaticRoutes::new());
    routes.add_topic(TOPIC, layout);

    let producer = Producer::builder(config.route_poll_interval(Duration::ZERO))
        .transport(transport.clone())
        .route_provider(routes.clone())
        .build()
        .expect("build producer");
    producer.start().expect("start producer");
    (producer, transport, routes)
}

/// Reply answering the request carried by `dispatch`.
pub fn reply_to(dispatch: &Dispatch, body: &[u8]) -> Message {
    let properties = string_to_properties(&dispatch.request.header.properties);
    let mut reply = Message::new("reply-topic", body.to_vec());
    if let Some(id) = properties.get(property::CORRELATION_ID) {
        reply.put_property(property::CORRELATION_ID, id.clone());
    }
    reply
}

/// Poll `cond` until it holds or `timeout` elapses.
pub fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = std::time::Instant::now() + timeout;
    while std::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    cond()
}
