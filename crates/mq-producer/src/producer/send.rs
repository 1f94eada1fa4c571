// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Send loop.
//!
//! Every mode runs the same cycle: pick a queue (avoiding the broker of the
//! previous attempt), resolve the broker's master address, dispatch with the
//! time left before the deadline, report the latency to the fault strategy,
//! then stop, retry or fail.
//!
//! | mode | attempts |
//! |---|---|
//! | sync, sync with selector | `max_attempt_times` |
//! | async, async with selector | `async_max_attempt_times` |
//! | oneway, explicit queue | 1 |

use std::sync::Arc;
use std::time::{Duration, Instant};

use super::{deliver_callback, ProducerInner, SendCallback, SendStats};
use crate::batch::generate_batch;
use crate::error::{ClientError, Result};
use crate::message::{property, sys_flag, Message, MessageQueue, SendResult};
use crate::route::TopicPublishInfo;
use crate::transport::{
    SendMessageRequest, SendMessageRequestHeader, SendMessageResponse,
    AUTO_CREATE_TOPIC_KEY_TOPIC,
};
use crate::util::{create_uniq_id, now_millis};
use crate::validator::check_message;

/// Queues per topic when a broker auto-creates it.
const DEFAULT_TOPIC_QUEUE_NUMS: i32 = 4;

/// How the queue of each attempt is chosen (borrowing form).
pub(crate) enum QueueChoice<'a> {
    /// Fault-aware selection over the topic route.
    Auto,
    /// Caller-provided queue, single attempt.
    Fixed(&'a MessageQueue),
    /// User selector; its answer is used as is.
    Select(&'a dyn Fn(&[MessageQueue], &Message) -> Option<MessageQueue>),
}

/// Owned form carried by async continuations.
pub(crate) enum AsyncChoice {
    Auto,
    Fixed(MessageQueue),
    Select(Arc<dyn Fn(&[MessageQueue], &Message) -> Option<MessageQueue> + Send + Sync>),
}

impl AsyncChoice {
    fn as_choice(&self) -> QueueChoice<'_> {
        match self {
            Self::Auto => QueueChoice::Auto,
            Self::Fixed(mq) => QueueChoice::Fixed(mq),
            Self::Select(select) => QueueChoice::Select(select.as_ref()),
        }
    }
}

/// Message ready for dispatch: id stamped, body compressed, header built.
/// Only the queue id changes between attempts.
pub(crate) struct PreparedSend {
    pub(crate) message: Message,
    header: SendMessageRequestHeader,
    body: Arc<[u8]>,
}

impl PreparedSend {
    fn request_for(&self, mq: &MessageQueue) -> SendMessageRequest {
        let mut header = self.header.clone();
        header.queue_id = mq.queue_id;
        SendMessageRequest {
            header,
            body: Arc::clone(&self.body),
        }
    }

    fn msg_id(&self) -> String {
        self.message.unique_key().unwrap_or_default().to_string()
    }

    fn to_send_result(&self, mq: &MessageQueue, response: SendMessageResponse) -> SendResult {
        SendResult {
            status: response.status,
            msg_id: self.msg_id(),
            offset_msg_id: Some(response.offset_msg_id),
            message_queue: MessageQueue::new(&mq.topic, &mq.broker_name, response.queue_id),
            queue_offset: response.queue_offset,
            transaction_id: response.transaction_id,
            region_id: response.region_id,
        }
    }
}

impl ProducerInner {
    /// Stamp the unique id, compress, and build the request header.
    pub(crate) fn prepare(&self, mut message: Message, batch: bool) -> Result<PreparedSend> {
        if !batch && message.unique_key().is_none() {
            message.put_property(property::UNIQ_CLIENT_MESSAGE_ID_KEYIDX, create_uniq_id());
        }

        let mut flag = 0;
        let mut body: Arc<[u8]> = Arc::from(message.body());
        if !batch && message.body().len() > self.config.compress_body_threshold {
            let compressed = self
                .compressor
                .compress(message.body(), self.config.compress_level)
                .map_err(ClientError::Compression)?;
            log::trace!(
                "[send] compressed body {} -> {} bytes",
                message.body().len(),
                compressed.len()
            );
            body = Arc::from(compressed);
            flag |= sys_flag::COMPRESSED;
        }

        if message.property(property::TRANSACTION_PREPARED) == Some("true") {
            flag |= sys_flag::TRANSACTION_PREPARED_TYPE;
        }

        let header = SendMessageRequestHeader {
            producer_group: self.config.group_name.clone(),
            topic: message.topic().to_string(),
            default_topic: AUTO_CREATE_TOPIC_KEY_TOPIC.to_string(),
            default_topic_queue_nums: DEFAULT_TOPIC_QUEUE_NUMS,
            queue_id: 0,
            sys_flag: flag,
            born_timestamp: now_millis(),
            flag: message.flag(),
            properties: message.properties_string(),
            reconsume_times: 0,
            unit_mode: self.config.unit_name.is_some(),
            batch,
            max_reconsume_times: message
                .property(property::MAX_RECONSUME_TIMES)
                .and_then(|v| v.parse().ok()),
        };

        Ok(PreparedSend {
            message,
            header,
            body,
        })
    }

    /// Queue for the next attempt.
    fn choose_queue(
        &self,
        tp_info: &TopicPublishInfo,
        choice: &QueueChoice<'_>,
        msg: &Message,
        last_broker: Option<&str>,
    ) -> Result<MessageQueue> {
        match choice {
            QueueChoice::Auto => self
                .fault
                .select_one_message_queue(tp_info, last_broker)
                .ok_or_else(|| ClientError::RouteUnavailable {
                    topic: msg.topic().to_string(),
                }),
            QueueChoice::Fixed(mq) => Ok((*mq).clone()),
            QueueChoice::Select(select) => {
                let mq = select(tp_info.queues(), msg).ok_or_else(|| {
                    ClientError::SelectorFailed("selector returned no queue".into())
                })?;
                if mq.topic != msg.topic() {
                    return Err(ClientError::SelectorFailed(format!(
                        "selector returned {} for topic {}",
                        mq,
                        msg.topic()
                    )));
                }
                Ok(mq)
            }
        }
    }

    /// Checks shared by every mode, run before any network activity.
    fn check_send_preconditions(
        &self,
        msg: &Message,
        choice: &QueueChoice<'_>,
    ) -> Result<Arc<TopicPublishInfo>> {
        self.make_sure_running()?;
        check_message(msg, self.config.max_message_size)?;
        if let QueueChoice::Fixed(mq) = choice {
            if mq.topic != msg.topic() {
                return Err(ClientError::Validation(format!(
                    "message topic {} does not match queue {}",
                    msg.topic(),
                    mq
                )));
            }
        }

        let tp_info = self.routes.get_or_fetch(msg.topic())?;
        if !tp_info.ok() {
            return Err(ClientError::RouteUnavailable {
                topic: msg.topic().to_string(),
            });
        }
        Ok(tp_info)
    }

    fn broker_address(&self, broker: &str) -> Result<String> {
        self.routes
            .find_broker_address(broker)
            .ok_or_else(|| ClientError::BrokerNotFound {
                broker: broker.to_string(),
            })
    }

    /// One synchronous dispatch, reported to the fault strategy.
    fn dispatch_sync(
        &self,
        prepared: &PreparedSend,
        mq: &MessageQueue,
        timeout: Duration,
    ) -> Result<SendResult> {
        let addr = match self.broker_address(&mq.broker_name) {
            Ok(addr) => addr,
            Err(e) => {
                self.fault
                    .update_fault_item(&mq.broker_name, Duration::ZERO, true);
                return Err(e);
            }
        };

        let request = prepared.request_for(mq);
        let start = Instant::now();
        let outcome = self.transport.invoke_sync(&addr, &request, timeout);
        let latency = start.elapsed();

        match outcome {
            Ok(response) => {
                self.fault
                    .update_fault_item(&mq.broker_name, latency, false);
                Ok(prepared.to_send_result(mq, response))
            }
            Err(e) => {
                self.fault
                    .update_fault_item(&mq.broker_name, latency, e.should_isolate());
                Err(e.into())
            }
        }
    }

    pub(crate) fn send_sync(
        &self,
        msg: Message,
        choice: QueueChoice<'_>,
        timeout: Duration,
    ) -> Result<SendResult> {
        let result = self.send_sync_impl(msg, &choice, timeout, false);
        self.count_result(&result);
        result
    }

    pub(crate) fn send_batch(
        &self,
        msgs: Vec<Message>,
        choice: QueueChoice<'_>,
        timeout: Duration,
    ) -> Result<SendResult> {
        let result = generate_batch(msgs, self.config.max_message_size)
            .and_then(|batch| self.send_sync_impl(batch, &choice, timeout, true));
        self.count_result(&result);
        result
    }

    fn count_result(&self, result: &Result<SendResult>) {
        match result {
            Ok(_) => SendStats::incr(&self.stats.sent_ok),
            Err(_) => SendStats::incr(&self.stats.send_failed),
        }
    }

    fn send_sync_impl(
        &self,
        msg: Message,
        choice: &QueueChoice<'_>,
        timeout: Duration,
        batch: bool,
    ) -> Result<SendResult> {
        let begin = Instant::now();
        let tp_info = self.check_send_preconditions(&msg, choice)?;
        let prepared = self.prepare(msg, batch)?;
        let topic = prepared.message.topic();

        if let QueueChoice::Fixed(mq) = choice {
            let elapsed = begin.elapsed();
            if elapsed >= timeout {
                return Err(ClientError::Timeout { elapsed, timeout });
            }
            return self.dispatch_sync(&prepared, mq, timeout - elapsed);
        }

        let max_attempts = self.config.max_attempt_times;
        let mut last_broker: Option<String> = None;
        let mut last_error: Option<ClientError> = None;
        let mut last_result: Option<SendResult> = None;

        for attempt in 1..=max_attempts {
            let elapsed = begin.elapsed();
            if elapsed >= timeout {
                log::warn!(
                    "[send] {} timed out before attempt {} ({:?})",
                    topic,
                    attempt,
                    elapsed
                );
                // a stored, not-OK result beats a bare timeout
                return match last_result {
                    Some(result) => Ok(result),
                    None => Err(ClientError::Timeout { elapsed, timeout }),
                };
            }

            let mq = self.choose_queue(&tp_info, choice, &prepared.message, last_broker.as_deref())?;
            last_broker = Some(mq.broker_name.clone());
            if attempt > 1 {
                SendStats::incr(&self.stats.retries);
            }

            match self.dispatch_sync(&prepared, &mq, timeout - elapsed) {
                Ok(result) if result.status.is_ok() => return Ok(result),
                Ok(result) => {
                    if !self.config.retry_another_broker_when_not_store_ok {
                        return Ok(result);
                    }
                    log::debug!(
                        "[send] {} stored with {:?} on {}, trying another broker",
                        topic,
                        result.status,
                        mq.broker_name
                    );
                    last_result = Some(result);
                }
                Err(e) if e.is_retryable() => {
                    log::debug!(
                        "[send] attempt {}/{} for {} on {} failed: {}",
                        attempt,
                        max_attempts,
                        topic,
                        mq.broker_name,
                        e
                    );
                    last_error = Some(e);
                }
                Err(e) => {
                    log::warn!("[send] {} failed on {}: {}", topic, mq.broker_name, e);
                    return Err(e);
                }
            }
        }

        if let Some(result) = last_result {
            return Ok(result);
        }

        let elapsed = begin.elapsed();
        log::warn!(
            "[send] {} failed after {} attempts in {:?}",
            topic,
            max_attempts,
            elapsed
        );
        Err(ClientError::AttemptsExhausted {
            attempts: max_attempts,
            topic: topic.to_string(),
            elapsed,
            last: Box::new(last_error.unwrap_or(ClientError::RouteUnavailable {
                topic: topic.to_string(),
            })),
        })
    }

    pub(crate) fn send_oneway(&self, msg: Message, choice: QueueChoice<'_>) -> Result<()> {
        let tp_info = self.check_send_preconditions(&msg, &choice)?;
        let prepared = self.prepare(msg, false)?;
        let mq = self.choose_queue(&tp_info, &choice, &prepared.message, None)?;
        let addr = match self.broker_address(&mq.broker_name) {
            Ok(addr) => addr,
            Err(e) => {
                self.fault
                    .update_fault_item(&mq.broker_name, Duration::ZERO, true);
                return Err(e);
            }
        };

        let request = prepared.request_for(&mq);
        let start = Instant::now();
        let outcome = self.transport.invoke_oneway(&addr, &request);
        let latency = start.elapsed();
        SendStats::incr(&self.stats.oneway);

        match outcome {
            Ok(()) => self
                .fault
                .update_fault_item(&mq.broker_name, latency, false),
            Err(e) => {
                self.fault
                    .update_fault_item(&mq.broker_name, latency, e.should_isolate());
                log::warn!(
                    "[send] oneway {} to {} failed: {}",
                    prepared.message.topic(),
                    mq.broker_name,
                    e
                );
            }
        }
        Ok(())
    }
}

/// Callback that fires exactly once: on [`PendingCallback::complete`], or
/// with [`ClientError::CallbackDropped`] if dropped without completing.
pub(crate) struct PendingCallback {
    inner: Arc<ProducerInner>,
    callback: Option<Box<dyn SendCallback>>,
}

impl PendingCallback {
    pub(crate) fn new(inner: Arc<ProducerInner>, callback: Box<dyn SendCallback>) -> Self {
        Self {
            inner,
            callback: Some(callback),
        }
    }

    pub(crate) fn complete(mut self, result: Result<SendResult>) {
        if let Some(callback) = self.callback.take() {
            self.deliver(callback, result);
        }
    }

    fn deliver(&self, callback: Box<dyn SendCallback>, result: Result<SendResult>) {
        self.inner.count_result(&result);
        SendStats::incr(&self.inner.stats.async_completed);

        let pool = self.inner.callback_pool.load_full();
        deliver_callback(pool.as_deref(), Box::new(move || callback.on_complete(result)));
    }
}

impl Drop for PendingCallback {
    fn drop(&mut self) {
        if let Some(callback) = self.callback.take() {
            log::warn!("[send] async send lost its continuation");
            self.deliver(callback, Err(ClientError::CallbackDropped));
        }
    }
}

/// Async send continuation. Owns everything an attempt needs, so the
/// transport completion can resume the loop from any thread.
pub(crate) struct AsyncSend {
    inner: Arc<ProducerInner>,
    prepared: Arc<PreparedSend>,
    tp_info: Arc<TopicPublishInfo>,
    choice: AsyncChoice,
    max_attempts: u32,
    attempt: u32,
    begin: Instant,
    timeout: Duration,
    last_broker: Option<String>,
    /// Latest stored-but-not-OK result, delivered if no later attempt
    /// succeeds.
    last_result: Option<SendResult>,
    callback: PendingCallback,
}

impl AsyncSend {
    /// Validate and dispatch the first attempt. Every outcome, including
    /// local failures, goes to `callback`.
    pub(crate) fn start(
        inner: &Arc<ProducerInner>,
        msg: Message,
        choice: AsyncChoice,
        timeout: Duration,
        callback: Box<dyn SendCallback>,
    ) {
        let begin = Instant::now();
        let callback = PendingCallback::new(Arc::clone(inner), callback);

        let setup = inner
            .check_send_preconditions(&msg, &choice.as_choice())
            .and_then(|tp_info| Ok((tp_info, inner.prepare(msg, false)?)));
        let (tp_info, prepared) = match setup {
            Ok(setup) => setup,
            Err(e) => return callback.complete(Err(e)),
        };

        let max_attempts = match choice {
            AsyncChoice::Fixed(_) => 1,
            _ => inner.config.async_max_attempt_times,
        };

        let send = AsyncSend {
            inner: Arc::clone(inner),
            prepared: Arc::new(prepared),
            tp_info,
            choice,
            max_attempts,
            attempt: 0,
            begin,
            timeout,
            last_broker: None,
            last_result: None,
            callback,
        };
        send.next_attempt(None);
    }

    fn next_attempt(mut self, last_error: Option<ClientError>) {
        if self.attempt >= self.max_attempts {
            return self.exhausted(last_error);
        }

        let elapsed = self.begin.elapsed();
        if elapsed >= self.timeout {
            let timeout = self.timeout;
            let result = match self.last_result.take() {
                Some(result) => Ok(result),
                None => Err(ClientError::Timeout { elapsed, timeout }),
            };
            return self.callback.complete(result);
        }

        let selected = self.inner.choose_queue(
            &self.tp_info,
            &self.choice.as_choice(),
            &self.prepared.message,
            self.last_broker.as_deref(),
        );
        let mq = match selected {
            Ok(mq) => mq,
            Err(e) => return self.callback.complete(Err(e)),
        };
        self.attempt += 1;
        self.last_broker = Some(mq.broker_name.clone());
        if self.attempt > 1 {
            SendStats::incr(&self.inner.stats.retries);
        }

        let addr = match self.inner.broker_address(&mq.broker_name) {
            Ok(addr) => addr,
            Err(e) => {
                self.inner
                    .fault
                    .update_fault_item(&mq.broker_name, Duration::ZERO, true);
                return self.on_failure(e);
            }
        };

        let request = self.prepared.request_for(&mq);
        let transport = Arc::clone(&self.inner.transport);
        let remaining = self.timeout - elapsed;
        let start = Instant::now();
        transport.invoke_async(
            &addr,
            request,
            remaining,
            Box::new(move |outcome| self.on_response(mq, start, outcome)),
        );
    }

    fn on_response(
        mut self,
        mq: MessageQueue,
        start: Instant,
        outcome: std::result::Result<SendMessageResponse, crate::error::RemotingError>,
    ) {
        let latency = start.elapsed();
        match outcome {
            Ok(response) => {
                self.inner
                    .fault
                    .update_fault_item(&mq.broker_name, latency, false);
                let result = self.prepared.to_send_result(&mq, response);
                let retry_not_ok = !result.status.is_ok()
                    && self.inner.config.retry_another_broker_when_not_store_ok
                    && self.attempt < self.max_attempts
                    && !matches!(self.choice, AsyncChoice::Fixed(_));
                if retry_not_ok {
                    log::debug!(
                        "[send] async {} stored with {:?} on {}, trying another broker",
                        mq.topic,
                        result.status,
                        mq.broker_name
                    );
                    self.last_result = Some(result);
                    return self.next_attempt(None);
                }
                self.callback.complete(Ok(result));
            }
            Err(e) => {
                self.inner
                    .fault
                    .update_fault_item(&mq.broker_name, latency, e.should_isolate());
                self.on_failure(e.into());
            }
        }
    }

    fn on_failure(self, err: ClientError) {
        if matches!(self.choice, AsyncChoice::Fixed(_)) || !err.is_retryable() {
            log::warn!(
                "[send] async {} failed: {}",
                self.prepared.message.topic(),
                err
            );
            return self.callback.complete(Err(err));
        }
        log::debug!(
            "[send] async attempt {}/{} for {} failed: {}",
            self.attempt,
            self.max_attempts,
            self.prepared.message.topic(),
            err
        );
        self.next_attempt(Some(err));
    }

    fn exhausted(mut self, last_error: Option<ClientError>) {
        if let Some(result) = self.last_result.take() {
            return self.callback.complete(Ok(result));
        }
        let topic = self.prepared.message.topic().to_string();
        let elapsed = self.begin.elapsed();
        log::warn!(
            "[send] async {} failed after {} attempts in {:?}",
            topic,
            self.attempt,
            elapsed
        );
        let last = last_error.unwrap_or(ClientError::RouteUnavailable {
            topic: topic.clone(),
        });
        self.callback.complete(Err(ClientError::AttemptsExhausted {
            attempts: self.attempt,
            topic,
            elapsed,
            last: Box::new(last),
        }));
    }
}
