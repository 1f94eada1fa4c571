// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Request/reply over the producer.
//!
//! A request is an ordinary message carrying a correlation id, the id of
//! the requesting client and a time-to-live. Whoever consumes it answers
//! with a reply message that the broker pushes back to the requesting
//! client; the transport hands the reply to
//! [`ReplyReceiver::receive_reply_message`](super::ReplyReceiver), which
//! completes the pending request with the same correlation id.
//!
//! Every request completes exactly once: with the reply, with the send
//! failure, or with [`ClientError::RequestTimeout`]. Async requests whose
//! reply never comes are swept by the producer's housekeeping pass.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;

use super::send::{AsyncChoice, AsyncSend, QueueChoice};
use super::{deliver_callback, ProducerInner, SendStats, ServiceState};
use crate::error::{ClientError, Result};
use crate::message::{property, Message, SendResult};
use crate::util::{client_id, create_uniq_id};

/// Extra time a request stays pending past its timeout, so that sync
/// waiters always expire on their own first.
const EXPIRY_GRACE: Duration = Duration::from_secs(1);

/// Completion of an async request. Called exactly once.
///
/// Implemented for every `FnOnce(Result<Message>) + Send + 'static`.
pub trait RequestCallback: Send + 'static {
    fn on_complete(self: Box<Self>, result: Result<Message>);
}

impl<F> RequestCallback for F
where
    F: FnOnce(Result<Message>) + Send + 'static,
{
    fn on_complete(self: Box<Self>, result: Result<Message>) {
        (*self)(result)
    }
}

type Completion = Box<dyn FnOnce(Result<Message>) + Send + 'static>;

/// One request waiting for its reply.
pub(crate) struct RequestResponseFuture {
    correlation_id: String,
    begin: Instant,
    timeout: Duration,
    send_ok: AtomicBool,
    completion: Mutex<Option<Completion>>,
}

impl RequestResponseFuture {
    fn new(correlation_id: String, timeout: Duration, completion: Completion) -> Self {
        Self {
            correlation_id,
            begin: Instant::now(),
            timeout,
            send_ok: AtomicBool::new(false),
            completion: Mutex::new(Some(completion)),
        }
    }

    /// Deliver `result` unless the request already completed.
    fn complete(&self, result: Result<Message>) -> bool {
        let completion = self.completion.lock().take();
        match completion {
            Some(completion) => {
                completion(result);
                true
            }
            None => false,
        }
    }

    fn mark_send_ok(&self) {
        self.send_ok.store(true, Ordering::Relaxed);
    }

    fn is_expired_at(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.begin) > self.timeout + EXPIRY_GRACE
    }

    fn timeout_error(&self) -> ClientError {
        ClientError::RequestTimeout {
            correlation_id: self.correlation_id.clone(),
            timeout: self.timeout,
        }
    }
}

/// Pending requests keyed by correlation id.
#[derive(Default)]
pub(crate) struct RequestTable {
    pending: DashMap<String, Arc<RequestResponseFuture>>,
}

impl RequestTable {
    fn insert(&self, future: Arc<RequestResponseFuture>) {
        self.pending.insert(future.correlation_id.clone(), future);
    }

    fn remove(&self, correlation_id: &str) -> Option<Arc<RequestResponseFuture>> {
        self.pending.remove(correlation_id).map(|(_, future)| future)
    }

    /// Remove and return every request past its timeout plus grace.
    fn remove_expired_at(&self, now: Instant) -> Vec<Arc<RequestResponseFuture>> {
        let expired: Vec<String> = self
            .pending
            .iter()
            .filter(|entry| entry.value().is_expired_at(now))
            .map(|entry| entry.key().clone())
            .collect();
        expired.iter().filter_map(|id| self.remove(id)).collect()
    }

    fn drain(&self) -> Vec<Arc<RequestResponseFuture>> {
        let ids: Vec<String> = self.pending.iter().map(|e| e.key().clone()).collect();
        ids.iter().filter_map(|id| self.remove(id)).collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.pending.len()
    }
}

impl ProducerInner {
    /// Stamp correlation id, reply address and time-to-live.
    fn prepare_request(&self, msg: &mut Message, timeout: Duration) -> String {
        let correlation_id = create_uniq_id();
        msg.put_property(property::CORRELATION_ID, correlation_id.clone());
        msg.put_property(
            property::MESSAGE_REPLY_TO_CLIENT,
            client_id(&self.config.instance_name, self.config.unit_name.as_deref()),
        );
        msg.put_property(property::MESSAGE_TTL, timeout.as_millis().to_string());
        correlation_id
    }

    /// Send `msg` and block until its reply arrives or `timeout` passes.
    pub(crate) fn request_sync(
        &self,
        mut msg: Message,
        choice: QueueChoice<'_>,
        timeout: Duration,
    ) -> Result<Message> {
        self.make_sure_running()?;
        let begin = Instant::now();
        let correlation_id = self.prepare_request(&mut msg, timeout);

        let (tx, rx) = crossbeam::channel::bounded(1);
        let future = Arc::new(RequestResponseFuture::new(
            correlation_id.clone(),
            timeout,
            Box::new(move |result: Result<Message>| {
                let _ = tx.send(result);
            }),
        ));
        // registered before sending: a fast reply may beat the send result
        self.requests.insert(Arc::clone(&future));

        if let Err(e) = self.send_sync(msg, choice, timeout) {
            self.requests.remove(&correlation_id);
            return Err(e);
        }
        future.mark_send_ok();

        let remaining = timeout.saturating_sub(begin.elapsed());
        if let Ok(result) = rx.recv_timeout(remaining) {
            return result;
        }

        self.requests.remove(&correlation_id);
        if future.complete(Err(future.timeout_error())) {
            SendStats::incr(&self.stats.request_timeouts);
            log::debug!("[request] {} timed out after {:?}", correlation_id, timeout);
        }
        // either our timeout or a reply that won the race
        rx.recv().unwrap_or_else(|_| Err(future.timeout_error()))
    }

    /// Validate, send and register `msg`; the reply, the send failure or
    /// the timeout goes to `callback`.
    pub(crate) fn request_async(
        inner: &Arc<ProducerInner>,
        mut msg: Message,
        choice: AsyncChoice,
        timeout: Duration,
        callback: Box<dyn RequestCallback>,
    ) {
        let pool = inner.callback_pool.load_full();
        let completion: Completion = Box::new(move |result: Result<Message>| {
            deliver_callback(pool.as_deref(), Box::new(move || callback.on_complete(result)));
        });

        let correlation_id = inner.prepare_request(&mut msg, timeout);
        let future = Arc::new(RequestResponseFuture::new(
            correlation_id,
            timeout,
            completion,
        ));
        if let Err(e) = inner.make_sure_running() {
            future.complete(Err(e));
            return;
        }
        inner.requests.insert(Arc::clone(&future));

        let send_inner = Arc::clone(inner);
        let on_sent = move |result: Result<SendResult>| match result {
            Ok(_) => future.mark_send_ok(),
            Err(e) => {
                send_inner.requests.remove(&future.correlation_id);
                log::debug!(
                    "[request] {} send failed: {}",
                    future.correlation_id,
                    e
                );
                future.complete(Err(e));
            }
        };
        AsyncSend::start(inner, msg, choice, timeout, Box::new(on_sent));
    }

    /// Complete the pending request `reply` answers.
    pub(crate) fn receive_reply(&self, reply: Message) {
        let Some(correlation_id) = reply.correlation_id().map(str::to_string) else {
            log::warn!("[request] reply on {} without correlation id, dropped", reply.topic());
            return;
        };
        match self.requests.remove(&correlation_id) {
            Some(future) => {
                SendStats::incr(&self.stats.replies_received);
                future.complete(Ok(reply));
            }
            None => log::warn!(
                "[request] reply {} matches no pending request, dropped",
                correlation_id
            ),
        }
    }

    /// Fail requests past their timeout. Returns how many were expired.
    pub(crate) fn expire_requests_at(&self, now: Instant) -> usize {
        let expired = self.requests.remove_expired_at(now);
        for future in &expired {
            let state = if future.send_ok.load(Ordering::Relaxed) {
                "no reply"
            } else {
                "send still pending"
            };
            log::debug!(
                "[request] {} expired after {:?} ({})",
                future.correlation_id,
                future.timeout,
                state
            );
            if future.complete(Err(future.timeout_error())) {
                SendStats::incr(&self.stats.request_timeouts);
            }
        }
        expired.len()
    }

    /// Fail every pending request; used on shutdown.
    pub(crate) fn fail_pending_requests(&self) {
        for future in self.requests.drain() {
            future.complete(Err(ClientError::NotRunning(
                ServiceState::ShutdownAlready.as_str(),
            )));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counting_future(
        id: &str,
        timeout: Duration,
        hits: &Arc<AtomicUsize>,
    ) -> Arc<RequestResponseFuture> {
        let hits = Arc::clone(hits);
        Arc::new(RequestResponseFuture::new(
            id.to_string(),
            timeout,
            Box::new(move |_: Result<Message>| {
                hits.fetch_add(1, Ordering::SeqCst);
            }),
        ))
    }

    #[test]
    fn test_future_completes_once() {
        let hits = Arc::new(AtomicUsize::new(0));
        let future = counting_future("c-1", Duration::from_secs(1), &hits);
        assert!(future.complete(Ok(Message::new("reply", b"a".to_vec()))));
        assert!(!future.complete(Err(future.timeout_error())));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_table_expires_past_grace() {
        let hits = Arc::new(AtomicUsize::new(0));
        let table = RequestTable::default();
        let short = counting_future("short", Duration::from_millis(10), &hits);
        let long = counting_future("long", Duration::from_secs(60), &hits);
        let begin = short.begin;
        table.insert(short);
        table.insert(long);

        // inside the grace window nothing expires
        assert!(table
            .remove_expired_at(begin + Duration::from_millis(500))
            .is_empty());

        let expired = table.remove_expired_at(begin + Duration::from_secs(2));
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].correlation_id, "short");
        assert_eq!(table.len(), 1);

        assert_eq!(table.drain().len(), 1);
        assert_eq!(table.len(), 0);
    }
}
