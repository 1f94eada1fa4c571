// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! mq-producer-sim - Drive the producer against a simulated cluster
//!
//! Each broker gets a latency and a failure rate. The tool sends a burst of
//! messages and prints where they landed, which brokers ended up isolated
//! and the producer counters.

use clap::{Parser, ValueEnum};
use mq_producer::util::create_message_id;
use mq_producer::{
    BrokerData, EndTransactionRequestHeader, Message, Producer, ProducerConfig, QueueData,
    RemotingError, RouteProvider, SendCompletion, SendMessageRequest, SendMessageResponse,
    SendStatus, Sender, TopicRouteData, Transport,
};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Simulated broker: `name:queues:latency_ms:failure_rate`
#[derive(Debug, Clone)]
struct BrokerSpec {
    name: String,
    queues: u32,
    latency: Duration,
    failure_rate: f64,
}

impl FromStr for BrokerSpec {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(':').collect();
        if parts.len() != 4 {
            return Err(format!(
                "expected name:queues:latency_ms:failure_rate, got '{}'",
                s
            ));
        }
        let queues = parts[1]
            .parse()
            .map_err(|e| format!("bad queue count '{}': {}", parts[1], e))?;
        let latency_ms: u64 = parts[2]
            .parse()
            .map_err(|e| format!("bad latency '{}': {}", parts[2], e))?;
        let failure_rate: f64 = parts[3]
            .parse()
            .map_err(|e| format!("bad failure rate '{}': {}", parts[3], e))?;
        if !(0.0..=1.0).contains(&failure_rate) {
            return Err(format!("failure rate {} not in 0..=1", failure_rate));
        }
        Ok(Self {
            name: parts[0].to_string(),
            queues,
            latency: Duration::from_millis(latency_ms),
            failure_rate,
        })
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Mode {
    Sync,
    Async,
    Oneway,
}

/// MQ producer simulator
#[derive(Parser, Debug)]
#[command(name = "mq-producer-sim")]
#[command(version = "0.1.0")]
#[command(about = "Send messages through the producer to a simulated broker cluster")]
struct Args {
    /// Broker definitions (repeatable)
    #[arg(
        short,
        long = "broker",
        default_values = ["broker-a:4:5:0.0", "broker-b:4:5:0.0", "broker-c:4:700:0.3"]
    )]
    brokers: Vec<BrokerSpec>,

    /// Producer configuration file (TOML)
    #[arg(short, long)]
    config: Option<std::path::PathBuf>,

    /// Topic to send to
    #[arg(short, long, default_value = "sim-topic")]
    topic: String,

    /// Number of messages
    #[arg(short = 'n', long, default_value = "200")]
    messages: usize,

    /// Send mode
    #[arg(short, long, value_enum, default_value = "sync")]
    mode: Mode,

    /// Disable latency-based isolation
    #[arg(long)]
    no_fault: bool,

    /// Message body size in bytes
    #[arg(long, default_value = "128")]
    body_size: usize,
}

struct SimBroker {
    spec: BrokerSpec,
    addr: String,
}

/// Transport answering from the simulated brokers.
struct SimTransport {
    brokers: HashMap<String, SimBroker>,
    next_offset: AtomicI64,
    end_reports: AtomicUsize,
}

impl SimTransport {
    fn new(specs: &[BrokerSpec]) -> Self {
        let brokers = specs
            .iter()
            .enumerate()
            .map(|(i, spec)| {
                let addr = format!("127.0.{}.{}:10911", i / 250, i % 250 + 1);
                (
                    addr.clone(),
                    SimBroker {
                        spec: spec.clone(),
                        addr,
                    },
                )
            })
            .collect();
        Self {
            brokers,
            next_offset: AtomicI64::new(0),
            end_reports: AtomicUsize::new(0),
        }
    }

    fn route(&self, topic: &str) -> TopicRouteData {
        let mut route = TopicRouteData::default();
        for broker in self.brokers.values() {
            route
                .queue_datas
                .push(QueueData::read_write(&broker.spec.name, broker.spec.queues));
            route
                .broker_datas
                .push(BrokerData::with_master(&broker.spec.name, &broker.addr));
        }
        log::debug!("route for {}: {} brokers", topic, route.broker_datas.len());
        route
    }

    /// Latency with +/-20% jitter, then success or a timeout.
    fn answer(
        &self,
        addr: &str,
        request: &SendMessageRequest,
    ) -> (Duration, Result<SendMessageResponse, RemotingError>) {
        let Some(broker) = self.brokers.get(addr) else {
            let err = RemotingError::Connect {
                addr: addr.to_string(),
                reason: "unknown broker".into(),
            };
            return (Duration::ZERO, Err(err));
        };

        let base = broker.spec.latency.as_secs_f64();
        let latency = Duration::from_secs_f64(base * (0.8 + fastrand::f64() * 0.4));
        if fastrand::f64() < broker.spec.failure_rate {
            let err = RemotingError::Timeout {
                addr: addr.to_string(),
                timeout: latency,
            };
            return (latency, Err(err));
        }

        let store: SocketAddr = match addr.parse() {
            Ok(store) => store,
            Err(e) => {
                let err = RemotingError::Connect {
                    addr: addr.to_string(),
                    reason: e.to_string(),
                };
                return (latency, Err(err));
            }
        };
        let offset = self.next_offset.fetch_add(1, Ordering::Relaxed);
        let response = SendMessageResponse {
            status: SendStatus::SendOk,
            offset_msg_id: create_message_id(store, offset * 256),
            queue_id: request.header.queue_id,
            queue_offset: offset,
            transaction_id: None,
            region_id: Some("SimRegion".into()),
        };
        (latency, Ok(response))
    }
}

impl Transport for SimTransport {
    fn invoke_sync(
        &self,
        addr: &str,
        request: &SendMessageRequest,
        timeout: Duration,
    ) -> Result<SendMessageResponse, RemotingError> {
        let (latency, outcome) = self.answer(addr, request);
        if latency > timeout {
            std::thread::sleep(timeout);
            return Err(RemotingError::Timeout {
                addr: addr.to_string(),
                timeout,
            });
        }
        std::thread::sleep(latency);
        outcome
    }

    fn invoke_async(
        &self,
        addr: &str,
        request: SendMessageRequest,
        timeout: Duration,
        on_complete: SendCompletion,
    ) {
        let (latency, outcome) = self.answer(addr, &request);
        let addr = addr.to_string();
        std::thread::spawn(move || {
            if latency > timeout {
                std::thread::sleep(timeout);
                on_complete(Err(RemotingError::Timeout { addr, timeout }));
            } else {
                std::thread::sleep(latency);
                on_complete(outcome);
            }
        });
    }

    fn invoke_oneway(&self, addr: &str, request: &SendMessageRequest) -> Result<(), RemotingError> {
        self.answer(addr, request).1.map(|_| ())
    }

    fn end_transaction_oneway(
        &self,
        _addr: &str,
        _header: &EndTransactionRequestHeader,
        _remark: Option<&str>,
        _timeout: Duration,
    ) -> Result<(), RemotingError> {
        self.end_reports.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

struct SimRoutes(Arc<SimTransport>);

impl RouteProvider for SimRoutes {
    fn fetch_topic_route(&self, topic: &str) -> Result<TopicRouteData, RemotingError> {
        Ok(self.0.route(topic))
    }
}

fn main() {
    env_logger::init();
    let args = Args::parse();

    if let Err(e) = run(&args) {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn run(args: &Args) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = match &args.config {
        Some(path) => ProducerConfig::from_file(path)?,
        None => ProducerConfig::new("sim-producer"),
    };
    config.send_latency_fault_enable = !args.no_fault;

    println!("=== MQ Producer Simulation ===\n");
    for spec in &args.brokers {
        println!(
            "  {:<12} {} queues, ~{:?} latency, {:.0}% failures",
            spec.name,
            spec.queues,
            spec.latency,
            spec.failure_rate * 100.0
        );
    }
    println!(
        "  mode {:?}, {} messages, isolation {}\n",
        args.mode,
        args.messages,
        if config.send_latency_fault_enable {
            "on"
        } else {
            "off"
        }
    );

    let transport = Arc::new(SimTransport::new(&args.brokers));
    let producer = Producer::builder(config)
        .transport(transport.clone())
        .route_provider(Arc::new(SimRoutes(transport.clone())))
        .build()?;
    producer.start()?;

    let distribution = Arc::new(Mutex::new(BTreeMap::<String, usize>::new()));
    let failures = Arc::new(AtomicUsize::new(0));
    let body = vec![b'x'; args.body_size.max(1)];
    let start = Instant::now();

    match args.mode {
        Mode::Sync => {
            for _ in 0..args.messages {
                match producer.send(&Message::new(&args.topic, body.clone())) {
                    Ok(result) => {
                        *distribution
                            .lock()
                            .entry(result.message_queue.to_string())
                            .or_default() += 1;
                    }
                    Err(e) => {
                        log::debug!("send failed: {}", e);
                        failures.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
        }
        Mode::Async => {
            let done = Arc::new(AtomicUsize::new(0));
            for _ in 0..args.messages {
                let distribution = Arc::clone(&distribution);
                let failures = Arc::clone(&failures);
                let done = Arc::clone(&done);
                producer.send_async(
                    Message::new(&args.topic, body.clone()),
                    move |result: mq_producer::Result<mq_producer::SendResult>| {
                        match result {
                            Ok(result) => {
                                *distribution
                                    .lock()
                                    .entry(result.message_queue.to_string())
                                    .or_default() += 1;
                            }
                            Err(_) => {
                                failures.fetch_add(1, Ordering::Relaxed);
                            }
                        }
                        done.fetch_add(1, Ordering::Relaxed);
                    },
                );
            }
            let deadline = Instant::now() + Duration::from_secs(60);
            while done.load(Ordering::Relaxed) < args.messages && Instant::now() < deadline {
                std::thread::sleep(Duration::from_millis(10));
            }
        }
        Mode::Oneway => {
            for _ in 0..args.messages {
                if producer
                    .send_oneway(&Message::new(&args.topic, body.clone()))
                    .is_err()
                {
                    failures.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    }
    let elapsed = start.elapsed();

    println!("--- Queue distribution ---");
    if matches!(args.mode, Mode::Oneway) {
        println!("  (oneway sends are not acknowledged)");
    }
    for (queue, count) in distribution.lock().iter() {
        println!("  {:<70} {:>6}", queue, count);
    }
    println!("  failed: {}", failures.load(Ordering::Relaxed));

    println!("\n--- Fault table ---");
    let now = Instant::now();
    for (broker, item) in producer.fault_strategy().snapshot() {
        let remaining = item.remaining_at(now);
        println!(
            "  {:<12} last latency {:>10}  {}",
            broker,
            format!("{:?}", item.current_latency),
            if remaining.is_zero() {
                "available".to_string()
            } else {
                format!("isolated for {:?}", remaining)
            }
        );
    }

    let stats = producer.stats();
    println!("\n--- Producer stats ---");
    println!("  sent ok:          {}", stats.sent_ok);
    println!("  send failed:      {}", stats.send_failed);
    println!("  retries:          {}", stats.retries);
    println!("  oneway:           {}", stats.oneway);
    println!("  async completed:  {}", stats.async_completed);
    println!("  tracker reports:  {}", producer.fault_strategy().reports());
    println!(
        "  elapsed:          {:?} ({:.0} msg/s)",
        elapsed,
        args.messages as f64 / elapsed.as_secs_f64().max(f64::EPSILON)
    );

    producer.shutdown();
    Ok(())
}
