// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Async send continuations.

#![allow(clippy::uninlined_format_args)]

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam::channel::{unbounded, Receiver};

use common::{cluster, wait_until, AsyncMode, Outcome, TOPIC};

use mq_producer::{
    ClientError, Message, MessageQueue, ProducerConfig, RemotingError, Result, SelectByHash,
    SendResult, SendStatus, Sender,
};

const THREE_BROKERS: &[(&str, u32)] = &[("broker-a", 1), ("broker-b", 1), ("broker-c", 1)];
const WAIT: Duration = Duration::from_secs(5);

fn msg(body: &str) -> Message {
    Message::new(TOPIC, body.as_bytes().to_vec())
}

/// Callback forwarding its result and thread name.
fn recorder() -> (
    impl FnOnce(Result<SendResult>) + Send + 'static,
    Receiver<(Result<SendResult>, Option<String>)>,
) {
    let (tx, rx) = unbounded();
    let callback = move |result: Result<SendResult>| {
        let thread = std::thread::current().name().map(str::to_string);
        let _ = tx.send((result, thread));
    };
    (callback, rx)
}

#[test]
fn test_async_success_fires_once_on_callback_pool() {
    let (producer, transport, _) = cluster(ProducerConfig::default(), THREE_BROKERS);
    let (callback, rx) = recorder();

    producer.send_async(msg("hello"), callback);

    let (result, thread) = rx.recv_timeout(WAIT).expect("callback fired");
    let result = result.expect("send ok");
    assert_eq!(result.message_queue.broker_name, "broker-a");
    let thread = thread.expect("pool threads are named");
    assert!(thread.starts_with("mq-send-callback-"), "ran on {}", thread);

    assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
    assert_eq!(transport.dispatch_count(), 1);
    let stats = producer.stats();
    assert_eq!(stats.async_completed, 1);
    assert_eq!(stats.sent_ok, 1);
}

#[test]
fn test_async_exhaustion_fires_once() {
    let (producer, transport, _) = cluster(ProducerConfig::default(), THREE_BROKERS);
    for broker in ["broker-a", "broker-b", "broker-c"] {
        transport.set_outcome(broker, Outcome::Timeout);
    }
    let (callback, rx) = recorder();

    producer.send_async(msg("doomed"), callback);

    let (result, _) = rx.recv_timeout(WAIT).expect("callback fired");
    match result {
        Err(ClientError::AttemptsExhausted { attempts, .. }) => assert_eq!(attempts, 2),
        other => panic!("unexpected outcome {other:?}"),
    }
    assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
    assert_eq!(transport.dispatched_brokers(), ["broker-a", "broker-b"]);
    assert_eq!(producer.fault_strategy().reports(), 2);
    assert_eq!(producer.stats().send_failed, 1);
}

#[test]
fn test_async_retry_with_inline_completion() {
    let (producer, transport, _) = cluster(ProducerConfig::default(), THREE_BROKERS);
    transport.set_async_mode(AsyncMode::Inline);
    transport.script("broker-a", vec![Outcome::Connect]);
    let (callback, rx) = recorder();

    producer.send_async(msg("inline"), callback);

    let (result, _) = rx.recv_timeout(WAIT).expect("callback fired");
    assert_eq!(
        result.expect("retry succeeds").message_queue.broker_name,
        "broker-b"
    );
    assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
    assert_eq!(producer.stats().retries, 1);
}

#[test]
fn test_lost_continuation_reports_dropped() {
    let (producer, transport, _) = cluster(ProducerConfig::default(), THREE_BROKERS);
    transport.set_async_mode(AsyncMode::Lose);
    let (callback, rx) = recorder();

    producer.send_async(msg("void"), callback);

    let (result, _) = rx.recv_timeout(WAIT).expect("callback fired");
    assert!(matches!(result, Err(ClientError::CallbackDropped)));
    assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
    assert_eq!(transport.dispatch_count(), 1);
}

#[test]
fn test_async_local_failure_goes_to_callback() {
    let (producer, transport, _) = cluster(ProducerConfig::default(), THREE_BROKERS);
    let (callback, rx) = recorder();

    producer.send_async(Message::new(TOPIC, Vec::new()), callback);

    let (result, _) = rx.recv_timeout(WAIT).expect("callback fired");
    assert!(matches!(result, Err(ClientError::Validation(_))));
    assert_eq!(transport.dispatch_count(), 0);
}

#[test]
fn test_async_to_queue_single_attempt() {
    let (producer, transport, _) = cluster(ProducerConfig::default(), THREE_BROKERS);
    transport.set_outcome("broker-c", Outcome::Connect);
    let (callback, rx) = recorder();

    producer.send_to_queue_async(msg("pinned"), MessageQueue::new(TOPIC, "broker-c", 0), callback);

    let (result, _) = rx.recv_timeout(WAIT).expect("callback fired");
    assert!(matches!(
        result,
        Err(ClientError::Remoting(RemotingError::Connect { .. }))
    ));
    assert_eq!(transport.dispatched_brokers(), ["broker-c"]);
}

#[test]
fn test_async_with_selector() {
    let (producer, transport, _) = cluster(ProducerConfig::default(), &[("broker-a", 8)]);
    let selector = Arc::new(SelectByHash);

    let mut queues = Vec::new();
    for _ in 0..3 {
        let (callback, rx) = recorder();
        producer.send_with_selector_async(
            msg("ordered"),
            Arc::clone(&selector),
            "order-42".to_string(),
            callback,
        );
        let (result, _) = rx.recv_timeout(WAIT).expect("callback fired");
        queues.push(result.expect("send ok").message_queue);
    }
    assert_eq!(transport.dispatch_count(), 3);
    assert!(queues.windows(2).all(|w| w[0] == w[1]));
}

#[test]
fn test_panicking_callback_does_not_poison_pool() {
    let (producer, _transport, _) = cluster(ProducerConfig::default(), THREE_BROKERS);
    producer.send_async(msg("boom"), |_result: Result<SendResult>| {
        panic!("callback bug");
    });

    let (callback, rx) = recorder();
    producer.send_async(msg("after"), callback);
    let (result, _) = rx.recv_timeout(WAIT).expect("callback fired");
    assert!(result.is_ok());
}

#[test]
fn test_concurrent_async_sends_each_complete_once() {
    let (producer, transport, _) = cluster(ProducerConfig::default(), THREE_BROKERS);
    transport.set_outcome("broker-b", Outcome::Timeout);
    let producer = Arc::new(producer);
    let completed = Arc::new(AtomicUsize::new(0));

    std::thread::scope(|scope| {
        for t in 0..4 {
            let producer = Arc::clone(&producer);
            let completed = Arc::clone(&completed);
            scope.spawn(move || {
                for i in 0..25 {
                    let completed = Arc::clone(&completed);
                    producer.send_async(msg(&format!("{t}-{i}")), move |_result: Result<SendResult>| {
                        completed.fetch_add(1, Ordering::SeqCst);
                    });
                }
            });
        }
    });

    assert!(wait_until(WAIT, || completed.load(Ordering::SeqCst) == 100));
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(completed.load(Ordering::SeqCst), 100);
    assert_eq!(producer.stats().async_completed, 100);
}

#[test]
fn test_async_stored_not_ok_result_survives_later_failure() {
    let config = ProducerConfig::default()
        .async_max_attempt_times(2)
        .retry_another_broker_when_not_store_ok(true);
    let (producer, transport, _) = cluster(config, THREE_BROKERS);
    transport.set_outcome("broker-a", Outcome::Status(SendStatus::FlushDiskTimeout));
    transport.set_outcome("broker-b", Outcome::Timeout);
    let (callback, rx) = recorder();

    producer.send_async(msg("slow disk"), callback);

    let (result, _) = rx.recv_timeout(WAIT).expect("callback fired");
    let result = result.expect("first store is kept");
    assert_eq!(result.status, SendStatus::FlushDiskTimeout);
    assert_eq!(result.message_queue.broker_name, "broker-a");
    assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
    assert_eq!(transport.dispatched_brokers(), ["broker-a", "broker-b"]);
}

#[test]
fn test_async_deadline_stops_retries() {
    let config = ProducerConfig::default().async_max_attempt_times(3);
    let (producer, transport, _) = cluster(config, THREE_BROKERS);
    for broker in ["broker-a", "broker-b", "broker-c"] {
        transport.set_outcome(broker, Outcome::SlowTimeout(Duration::from_millis(100)));
    }
    let (callback, rx) = recorder();

    producer.send_async_with_timeout(msg("late"), Duration::from_millis(150), callback);

    let (result, _) = rx.recv_timeout(WAIT).expect("callback fired");
    match result {
        Err(ClientError::Timeout { elapsed, timeout }) => {
            assert_eq!(timeout, Duration::from_millis(150));
            assert!(elapsed >= timeout);
        }
        other => panic!("unexpected outcome {other:?}"),
    }
    assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
    assert!(transport.dispatch_count() < 3);
}

#[test]
fn test_async_explicit_timeouts() {
    let (producer, transport, _) = cluster(ProducerConfig::default(), THREE_BROKERS);

    let (callback, rx) = recorder();
    producer.send_to_queue_async_with_timeout(
        msg("pinned"),
        MessageQueue::new(TOPIC, "broker-c", 0),
        Duration::ZERO,
        callback,
    );
    let (result, _) = rx.recv_timeout(WAIT).expect("callback fired");
    assert!(matches!(result, Err(ClientError::Timeout { .. })));

    let (callback, rx) = recorder();
    producer.send_with_selector_async_with_timeout(
        msg("ordered"),
        Arc::new(SelectByHash),
        "order-42".to_string(),
        Duration::ZERO,
        callback,
    );
    let (result, _) = rx.recv_timeout(WAIT).expect("callback fired");
    assert!(matches!(result, Err(ClientError::Timeout { .. })));
    assert_eq!(transport.dispatch_count(), 0);

    let (callback, rx) = recorder();
    producer.send_to_queue_async_with_timeout(
        msg("pinned"),
        MessageQueue::new(TOPIC, "broker-c", 0),
        Duration::from_secs(3),
        callback,
    );
    let (result, _) = rx.recv_timeout(WAIT).expect("callback fired");
    assert_eq!(result.expect("send ok").message_queue.broker_name, "broker-c");
}
