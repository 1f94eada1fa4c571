// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Request/reply: correlation, timeouts and single completion.

#![allow(clippy::uninlined_format_args)]

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam::channel::{unbounded, Receiver};

use common::{cluster, reply_to, wait_until, MockTransport, Outcome, TOPIC};

use mq_producer::message::{property, string_to_properties};
use mq_producer::{
    ClientError, Message, MessageQueue, Producer, ProducerConfig, ReplyReceiver, Requester,
    Result, SelectByHash,
};

const THREE_BROKERS: &[(&str, u32)] = &[("broker-a", 1), ("broker-b", 1), ("broker-c", 1)];
const WAIT: Duration = Duration::from_secs(5);

fn msg(body: &str) -> Message {
    Message::new(TOPIC, body.as_bytes().to_vec())
}

/// Reply to the `n`-th dispatch (1-based) once it shows up.
fn answer(producer: &Producer, transport: &MockTransport, n: usize, body: &[u8]) {
    assert!(wait_until(WAIT, || transport.dispatch_count() >= n));
    let dispatch = transport.dispatches.lock()[n - 1].clone();
    producer.receive_reply_message(reply_to(&dispatch, body));
}

/// Callback forwarding its result and thread name.
fn recorder() -> (
    impl FnOnce(Result<Message>) + Send + 'static,
    Receiver<(Result<Message>, Option<String>)>,
) {
    let (tx, rx) = unbounded();
    let callback = move |result: Result<Message>| {
        let thread = std::thread::current().name().map(str::to_string);
        let _ = tx.send((result, thread));
    };
    (callback, rx)
}

#[test]
fn test_request_returns_reply() {
    let (producer, transport, _) = cluster(ProducerConfig::new("rpc-group"), THREE_BROKERS);

    let reply = std::thread::scope(|scope| {
        scope.spawn(|| answer(&producer, &transport, 1, b"pong"));
        producer.request(&msg("ping"), Duration::from_secs(3))
    })
    .expect("reply");

    assert_eq!(reply.body(), b"pong");
    let dispatches = transport.dispatches.lock().clone();
    assert_eq!(dispatches.len(), 1);
    let props = string_to_properties(&dispatches[0].request.header.properties);
    assert_eq!(
        props.get(property::CORRELATION_ID).map(String::as_str),
        reply.correlation_id()
    );
    assert_eq!(props.get(property::MESSAGE_TTL).map(String::as_str), Some("3000"));
    let reply_to_client = props
        .get(property::MESSAGE_REPLY_TO_CLIENT)
        .expect("reply address");
    assert!(reply_to_client.ends_with("@DEFAULT"), "{}", reply_to_client);

    assert_eq!(producer.pending_requests(), 0);
    assert_eq!(producer.stats().replies_received, 1);
}

#[test]
fn test_request_times_out_without_reply() {
    let (producer, transport, _) = cluster(ProducerConfig::default(), THREE_BROKERS);

    let err = producer
        .request(&msg("ping"), Duration::from_millis(100))
        .expect_err("nobody answers");
    let correlation_id = match err {
        ClientError::RequestTimeout {
            correlation_id,
            timeout,
        } => {
            assert_eq!(timeout, Duration::from_millis(100));
            correlation_id
        }
        other => panic!("unexpected error {other:?}"),
    };
    assert_eq!(producer.pending_requests(), 0);
    assert_eq!(producer.stats().request_timeouts, 1);

    // a late reply finds nothing to complete
    let late = reply_to(&transport.last_dispatch().expect("sent"), b"late");
    assert_eq!(late.correlation_id(), Some(correlation_id.as_str()));
    producer.receive_reply_message(late);
    assert_eq!(producer.stats().replies_received, 0);
}

#[test]
fn test_request_send_failure_is_returned() {
    let (producer, transport, _) = cluster(ProducerConfig::default(), THREE_BROKERS);
    transport.set_outcome("broker-a", Outcome::Code(13));

    let err = producer
        .request(&msg("ping"), Duration::from_secs(3))
        .expect_err("request rejected");
    assert_eq!(
        err.response_code(),
        Some(mq_producer::ResponseCode::MessageIllegal)
    );
    assert_eq!(producer.pending_requests(), 0);

    let err = producer
        .request(&Message::new(TOPIC, Vec::new()), Duration::from_secs(3))
        .expect_err("empty body");
    assert!(matches!(err, ClientError::Validation(_)));
    assert_eq!(producer.pending_requests(), 0);
}

#[test]
fn test_async_request_reply_fires_once_on_callback_pool() {
    let (producer, transport, _) = cluster(ProducerConfig::default(), THREE_BROKERS);
    let (callback, rx) = recorder();

    producer.request_async(msg("ping"), Duration::from_secs(3), callback);
    answer(&producer, &transport, 1, b"pong");

    let (result, thread) = rx.recv_timeout(WAIT).expect("callback fired");
    assert_eq!(result.expect("reply").body(), b"pong");
    let thread = thread.expect("pool threads are named");
    assert!(thread.starts_with("mq-send-callback-"), "ran on {}", thread);

    // a duplicate reply is dropped
    answer(&producer, &transport, 1, b"again");
    assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
    assert_eq!(producer.stats().replies_received, 1);
    assert_eq!(producer.pending_requests(), 0);
}

#[test]
fn test_async_request_expires_without_reply() {
    let config = ProducerConfig::default().housekeeping_interval(Duration::from_millis(50));
    let (producer, _transport, _) = cluster(config, THREE_BROKERS);
    let (callback, rx) = recorder();

    producer.request_async(msg("ping"), Duration::from_millis(50), callback);
    assert_eq!(producer.pending_requests(), 1);

    let (result, _) = rx.recv_timeout(WAIT).expect("callback fired");
    assert!(matches!(result, Err(ClientError::RequestTimeout { .. })));
    assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
    assert_eq!(producer.pending_requests(), 0);
    assert_eq!(producer.stats().request_timeouts, 1);
}

#[test]
fn test_async_request_send_failure_fires_once() {
    let (producer, transport, _) = cluster(ProducerConfig::default(), THREE_BROKERS);
    for broker in ["broker-a", "broker-b", "broker-c"] {
        transport.set_outcome(broker, Outcome::Timeout);
    }
    let (callback, rx) = recorder();

    producer.request_async(msg("ping"), Duration::from_secs(3), callback);

    let (result, _) = rx.recv_timeout(WAIT).expect("callback fired");
    assert!(matches!(result, Err(ClientError::AttemptsExhausted { .. })));
    assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
    assert_eq!(producer.pending_requests(), 0);
}

#[test]
fn test_request_to_queue_and_with_selector() {
    let (producer, transport, _) = cluster(ProducerConfig::default(), THREE_BROKERS);
    let pinned = MessageQueue::new(TOPIC, "broker-c", 0);
    let last = |mqs: &[MessageQueue], _: &Message, _: &()| mqs.last().cloned();

    std::thread::scope(|scope| {
        scope.spawn(|| answer(&producer, &transport, 1, b"from-c"));
        let reply = producer
            .request_to_queue(&msg("ping"), &pinned, Duration::from_secs(3))
            .expect("reply");
        assert_eq!(reply.body(), b"from-c");
    });
    std::thread::scope(|scope| {
        scope.spawn(|| answer(&producer, &transport, 2, b"selected"));
        let reply = producer
            .request_with_selector(&msg("ping"), &last, &(), Duration::from_secs(3))
            .expect("reply");
        assert_eq!(reply.body(), b"selected");
    });
    assert_eq!(transport.dispatched_brokers(), ["broker-c", "broker-c"]);

    let (callback, rx) = recorder();
    producer.request_to_queue_async(msg("ping"), pinned.clone(), Duration::from_secs(3), callback);
    answer(&producer, &transport, 3, b"async-c");
    let (result, _) = rx.recv_timeout(WAIT).expect("callback fired");
    assert_eq!(result.expect("reply").body(), b"async-c");

    let (callback, rx) = recorder();
    producer.request_with_selector_async(
        msg("ping"),
        Arc::new(SelectByHash),
        "order-42".to_string(),
        Duration::from_secs(3),
        callback,
    );
    answer(&producer, &transport, 4, b"async-hash");
    let (result, _) = rx.recv_timeout(WAIT).expect("callback fired");
    assert_eq!(result.expect("reply").body(), b"async-hash");

    assert_eq!(transport.dispatch_count(), 4);
    assert_eq!(producer.pending_requests(), 0);
    assert_eq!(producer.stats().replies_received, 4);
}

#[test]
fn test_reply_without_pending_request_is_dropped() {
    let (producer, _transport, _) = cluster(ProducerConfig::default(), THREE_BROKERS);

    producer.receive_reply_message(msg("no correlation"));
    producer.receive_reply_message(
        msg("stranger").with_property(property::CORRELATION_ID, "unknown-id"),
    );
    assert_eq!(producer.stats().replies_received, 0);
    assert_eq!(producer.pending_requests(), 0);
}

#[test]
fn test_shutdown_fails_pending_requests() {
    let (producer, transport, _) = cluster(ProducerConfig::default(), THREE_BROKERS);
    let completed = Arc::new(AtomicUsize::new(0));
    let (callback, rx) = recorder();

    producer.request_async(msg("ping"), Duration::from_secs(30), callback);
    assert!(wait_until(WAIT, || transport.dispatch_count() == 1));
    assert!(wait_until(WAIT, || producer.pending_requests() == 1));

    producer.shutdown();
    let (result, _) = rx.recv_timeout(WAIT).expect("callback fired");
    assert!(matches!(
        result,
        Err(ClientError::NotRunning("SHUTDOWN_ALREADY"))
    ));
    assert_eq!(producer.pending_requests(), 0);

    let counter = Arc::clone(&completed);
    producer.request_async(msg("late"), Duration::from_secs(3), move |r: Result<Message>| {
        assert!(matches!(r, Err(ClientError::NotRunning(_))));
        counter.fetch_add(1, Ordering::SeqCst);
    });
    assert_eq!(completed.load(Ordering::SeqCst), 1);
    assert!(matches!(
        producer.request(&msg("late"), Duration::from_secs(3)),
        Err(ClientError::NotRunning(_))
    ));
}
