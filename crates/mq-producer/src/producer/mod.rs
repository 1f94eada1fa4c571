// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! The producer engine.
//!
//! [`Producer`] is the single concrete engine. Its capabilities are split
//! into traits:
//! - [`Sender`]: sync, async, oneway and batch sends, with automatic,
//!   explicit or user-selected queues;
//! - [`Requester`]: request/reply, sync or async;
//! - [`ReplyReceiver`]: entry point for replies pushed by the broker;
//! - [`TransactionCheckResponder`]: answers broker-initiated transaction
//!   state checks.
//!
//! Half-message sends live on [`Producer::send_message_in_transaction`].
//!
//! # Lifecycle
//!
//! ```text
//! CreateJust --start()--> Running --shutdown()--> ShutdownAlready
//!      \--start() fails--> StartFailed
//! ```
//!
//! `start` spawns the callback pool, the transaction check pool, the
//! housekeeping thread and, unless disabled, the route refresher. Every
//! send checks that the producer is running before doing anything else.
//!
//! Housekeeping runs every `housekeeping_interval`: it fails requests whose
//! reply never came and forgets transaction records older than
//! `transaction_record_ttl`.

mod request;
mod send;
mod transaction;

pub use request::RequestCallback;
pub use transaction::{
    ListenerError, TransactionDecision, TransactionListener, TransactionRecord, TransactionTable,
};

use std::any::Any;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use arc_swap::ArcSwapOption;
use parking_lot::{Mutex, RwLock};

use crate::compress::{Compressor, ZlibCompressor};
use crate::config::{ConfigError, ProducerConfig};
use crate::error::{ClientError, Result};
use crate::executor::{Job, PeriodicTask, WorkerPool};
use crate::fault::FaultStrategy;
use crate::message::{Message, MessageExt, MessageQueue, SendResult, TransactionSendResult};
use crate::route::{RouteProvider, RouteRefresher, TopicRouteCache};
use crate::selector::MessageQueueSelector;
use crate::transport::{CheckTransactionStateRequestHeader, Transport};

use request::RequestTable;

/// Producer lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    /// Built, not started.
    CreateJust,
    /// Accepting sends.
    Running,
    /// Stopped by `shutdown`.
    ShutdownAlready,
    /// `start` failed; the producer cannot be restarted.
    StartFailed,
}

impl ServiceState {
    /// Upper-case name used in errors and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CreateJust => "CREATE_JUST",
            Self::Running => "RUNNING",
            Self::ShutdownAlready => "SHUTDOWN_ALREADY",
            Self::StartFailed => "START_FAILED",
        }
    }
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Completion of an async send. Called exactly once.
///
/// Implemented for every `FnOnce(Result<SendResult>) + Send + 'static`.
pub trait SendCallback: Send + 'static {
    /// Receive the outcome of the send.
    fn on_complete(self: Box<Self>, result: Result<SendResult>);
}

impl<F> SendCallback for F
where
    F: FnOnce(Result<SendResult>) + Send + 'static,
{
    fn on_complete(self: Box<Self>, result: Result<SendResult>) {
        (*self)(result)
    }
}

/// Run a user callback on `pool`, or inline when there is no pool or it
/// rejects the job. Panics are contained either way.
pub(crate) fn deliver_callback(pool: Option<&WorkerPool>, job: Job) {
    match pool {
        Some(pool) => pool.execute_or_run(job),
        None => {
            if catch_unwind(AssertUnwindSafe(job)).is_err() {
                log::error!("[producer] callback panicked");
            }
        }
    }
}

/// Send capability.
///
/// Variants without a timeout use `send_msg_timeout`. A timeout bounds all
/// attempts of one send together.
pub trait Sender {
    /// Send synchronously with the configured timeout and retries.
    fn send(&self, msg: &Message) -> Result<SendResult>;

    /// Send synchronously; `timeout` bounds all attempts together.
    fn send_with_timeout(&self, msg: &Message, timeout: Duration) -> Result<SendResult>;

    /// Send to one queue, single attempt.
    fn send_to_queue(&self, msg: &Message, mq: &MessageQueue) -> Result<SendResult>;

    /// [`Sender::send_to_queue`] with an explicit timeout.
    fn send_to_queue_with_timeout(
        &self,
        msg: &Message,
        mq: &MessageQueue,
        timeout: Duration,
    ) -> Result<SendResult>;

    /// Send to the queue chosen by `selector` for `arg`.
    fn send_with_selector<A, S>(&self, msg: &Message, selector: &S, arg: &A) -> Result<SendResult>
    where
        A: ?Sized,
        S: MessageQueueSelector<A>;

    /// [`Sender::send_with_selector`] with an explicit timeout.
    fn send_with_selector_with_timeout<A, S>(
        &self,
        msg: &Message,
        selector: &S,
        arg: &A,
        timeout: Duration,
    ) -> Result<SendResult>
    where
        A: ?Sized,
        S: MessageQueueSelector<A>;

    /// Send without blocking; `callback` receives the outcome.
    fn send_async<C: SendCallback>(&self, msg: Message, callback: C);

    /// [`Sender::send_async`] with an explicit timeout.
    fn send_async_with_timeout<C: SendCallback>(
        &self,
        msg: Message,
        timeout: Duration,
        callback: C,
    );

    /// Async send to one queue, single attempt.
    fn send_to_queue_async<C: SendCallback>(&self, msg: Message, mq: MessageQueue, callback: C);

    /// [`Sender::send_to_queue_async`] with an explicit timeout.
    fn send_to_queue_async_with_timeout<C: SendCallback>(
        &self,
        msg: Message,
        mq: MessageQueue,
        timeout: Duration,
        callback: C,
    );

    /// Async send to the queue chosen by `selector` for `arg`.
    fn send_with_selector_async<A, S, C>(
        &self,
        msg: Message,
        selector: Arc<S>,
        arg: A,
        callback: C,
    ) where
        A: Send + Sync + 'static,
        S: MessageQueueSelector<A> + 'static,
        C: SendCallback;

    /// [`Sender::send_with_selector_async`] with an explicit timeout.
    fn send_with_selector_async_with_timeout<A, S, C>(
        &self,
        msg: Message,
        selector: Arc<S>,
        arg: A,
        timeout: Duration,
        callback: C,
    ) where
        A: Send + Sync + 'static,
        S: MessageQueueSelector<A> + 'static,
        C: SendCallback;

    /// Single dispatch, outcome not awaited. Only local failures are
    /// returned.
    fn send_oneway(&self, msg: &Message) -> Result<()>;

    /// Oneway send to one queue.
    fn send_oneway_to_queue(&self, msg: &Message, mq: &MessageQueue) -> Result<()>;

    /// Oneway send to the queue chosen by `selector` for `arg`.
    fn send_oneway_with_selector<A, S>(&self, msg: &Message, selector: &S, arg: &A) -> Result<()>
    where
        A: ?Sized,
        S: MessageQueueSelector<A>;

    /// Send up to 32 messages of one topic as a single request.
    fn send_batch(&self, msgs: Vec<Message>) -> Result<SendResult>;

    /// [`Sender::send_batch`] with an explicit timeout.
    fn send_batch_with_timeout(&self, msgs: Vec<Message>, timeout: Duration) -> Result<SendResult>;

    /// Batch send to one queue, single attempt.
    fn send_batch_to_queue(&self, msgs: Vec<Message>, mq: &MessageQueue) -> Result<SendResult>;

    /// [`Sender::send_batch_to_queue`] with an explicit timeout.
    fn send_batch_to_queue_with_timeout(
        &self,
        msgs: Vec<Message>,
        mq: &MessageQueue,
        timeout: Duration,
    ) -> Result<SendResult>;
}

/// Request/reply capability.
///
/// The request is sent like any message, with the retries of its send
/// mode; `timeout` covers the send and the wait for the reply together.
/// Expiry yields [`ClientError::RequestTimeout`].
pub trait Requester {
    /// Send `msg` and block until the reply arrives.
    fn request(&self, msg: &Message, timeout: Duration) -> Result<Message>;

    /// Request through one queue, single send attempt.
    fn request_to_queue(
        &self,
        msg: &Message,
        mq: &MessageQueue,
        timeout: Duration,
    ) -> Result<Message>;

    /// Request through the queue chosen by `selector` for `arg`.
    fn request_with_selector<A, S>(
        &self,
        msg: &Message,
        selector: &S,
        arg: &A,
        timeout: Duration,
    ) -> Result<Message>
    where
        A: ?Sized,
        S: MessageQueueSelector<A>;

    /// Send `msg`; `callback` receives the reply or the failure.
    fn request_async<C: RequestCallback>(&self, msg: Message, timeout: Duration, callback: C);

    /// Async request through one queue.
    fn request_to_queue_async<C: RequestCallback>(
        &self,
        msg: Message,
        mq: MessageQueue,
        timeout: Duration,
        callback: C,
    );

    /// Async request through the queue chosen by `selector` for `arg`.
    fn request_with_selector_async<A, S, C>(
        &self,
        msg: Message,
        selector: Arc<S>,
        arg: A,
        timeout: Duration,
        callback: C,
    ) where
        A: Send + Sync + 'static,
        S: MessageQueueSelector<A> + 'static,
        C: RequestCallback;
}

/// Reply delivery, called by the transport.
pub trait ReplyReceiver {
    /// Complete the pending request whose correlation id `reply` carries.
    /// Replies matching no pending request are logged and dropped.
    fn receive_reply_message(&self, reply: Message);
}

/// Broker-initiated transaction check capability.
pub trait TransactionCheckResponder {
    /// Queue a check; the answer is reported to `broker_addr` from the
    /// check pool. Saturated pools drop the request.
    fn check_transaction_state(
        &self,
        broker_addr: &str,
        msg: MessageExt,
        header: CheckTransactionStateRequestHeader,
    );
}

/// Producer counters.
#[derive(Debug, Default)]
pub struct SendStats {
    /// Sync, batch and async sends that returned a result.
    pub sent_ok: AtomicU64,
    /// Sync, batch and async sends that failed.
    pub send_failed: AtomicU64,
    /// Attempts after the first.
    pub retries: AtomicU64,
    /// Oneway dispatches.
    pub oneway: AtomicU64,
    /// Async callbacks delivered.
    pub async_completed: AtomicU64,
    /// Transactions committed by the local listener.
    pub tx_committed: AtomicU64,
    /// Transactions rolled back, including unstored half messages.
    pub tx_rolled_back: AtomicU64,
    /// Transactions left to broker checks.
    pub tx_unknown: AtomicU64,
    /// Broker transaction checks answered.
    pub checks_processed: AtomicU64,
    /// Broker transaction checks dropped by a saturated pool.
    pub checks_rejected: AtomicU64,
    /// Replies matched to a pending request.
    pub replies_received: AtomicU64,
    /// Requests failed because no reply came in time.
    pub request_timeouts: AtomicU64,
}

impl SendStats {
    /// Copy the counters.
    pub fn snapshot(&self) -> SendStatsSnapshot {
        SendStatsSnapshot {
            sent_ok: self.sent_ok.load(Ordering::Relaxed),
            send_failed: self.send_failed.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            oneway: self.oneway.load(Ordering::Relaxed),
            async_completed: self.async_completed.load(Ordering::Relaxed),
            tx_committed: self.tx_committed.load(Ordering::Relaxed),
            tx_rolled_back: self.tx_rolled_back.load(Ordering::Relaxed),
            tx_unknown: self.tx_unknown.load(Ordering::Relaxed),
            checks_processed: self.checks_processed.load(Ordering::Relaxed),
            checks_rejected: self.checks_rejected.load(Ordering::Relaxed),
            replies_received: self.replies_received.load(Ordering::Relaxed),
            request_timeouts: self.request_timeouts.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Snapshot of [`SendStats`]; fields mirror the counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SendStatsSnapshot {
    pub sent_ok: u64,
    pub send_failed: u64,
    pub retries: u64,
    pub oneway: u64,
    pub async_completed: u64,
    pub tx_committed: u64,
    pub tx_rolled_back: u64,
    pub tx_unknown: u64,
    pub checks_processed: u64,
    pub checks_rejected: u64,
    pub replies_received: u64,
    pub request_timeouts: u64,
}

/// State shared with async continuations and pool jobs.
pub(crate) struct ProducerInner {
    pub(crate) config: ProducerConfig,
    pub(crate) state: Mutex<ServiceState>,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) routes: Arc<TopicRouteCache>,
    pub(crate) fault: FaultStrategy,
    pub(crate) compressor: Arc<dyn Compressor>,
    pub(crate) callback_pool: ArcSwapOption<WorkerPool>,
    pub(crate) check_pool: ArcSwapOption<WorkerPool>,
    pub(crate) refresher: Mutex<Option<RouteRefresher>>,
    pub(crate) housekeeper: Mutex<Option<PeriodicTask>>,
    pub(crate) listener: RwLock<Option<Arc<dyn TransactionListener>>>,
    pub(crate) transactions: TransactionTable,
    pub(crate) requests: RequestTable,
    pub(crate) stats: SendStats,
}

impl ProducerInner {
    pub(crate) fn make_sure_running(&self) -> Result<()> {
        let state = *self.state.lock();
        if state == ServiceState::Running {
            Ok(())
        } else {
            Err(ClientError::NotRunning(state.as_str()))
        }
    }

    pub(crate) fn transaction_listener(&self) -> Option<Arc<dyn TransactionListener>> {
        self.listener.read().clone()
    }

    /// One housekeeping pass.
    fn housekeep(&self, now: Instant) {
        let requests = self.expire_requests_at(now);
        let transactions = self
            .transactions
            .expire_older_than(self.config.transaction_record_ttl_duration(), now);
        if transactions > 0 {
            log::debug!(
                "[tx] forgot {} transaction records older than {:?}",
                transactions,
                self.config.transaction_record_ttl_duration()
            );
        }
        log::trace!(
            "[producer] housekeeping expired {} requests, {} transaction records",
            requests,
            transactions
        );
    }
}

/// Builder for [`Producer`].
pub struct ProducerBuilder {
    config: ProducerConfig,
    transport: Option<Arc<dyn Transport>>,
    route_provider: Option<Arc<dyn RouteProvider>>,
    compressor: Arc<dyn Compressor>,
    listener: Option<Arc<dyn TransactionListener>>,
}

impl ProducerBuilder {
    /// Network transport to the brokers. Required.
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Source of topic routes. Required.
    pub fn route_provider(mut self, provider: Arc<dyn RouteProvider>) -> Self {
        self.route_provider = Some(provider);
        self
    }

    /// Replace the default zlib compressor.
    pub fn compressor(mut self, compressor: Arc<dyn Compressor>) -> Self {
        self.compressor = compressor;
        self
    }

    /// Listener for transactional sends and broker checks.
    pub fn transaction_listener(mut self, listener: Arc<dyn TransactionListener>) -> Self {
        self.listener = Some(listener);
        self
    }

    /// Validate the configuration and build a producer in `CreateJust`.
    pub fn build(self) -> Result<Producer> {
        self.config.validate()?;
        let transport = self
            .transport
            .ok_or_else(|| ConfigError::Invalid("transport not set".into()))?;
        let provider = self
            .route_provider
            .ok_or_else(|| ConfigError::Invalid("route provider not set".into()))?;

        let inner = ProducerInner {
            fault: FaultStrategy::from_config(&self.config),
            config: self.config,
            state: Mutex::new(ServiceState::CreateJust),
            transport,
            routes: Arc::new(TopicRouteCache::new(provider)),
            compressor: self.compressor,
            callback_pool: ArcSwapOption::empty(),
            check_pool: ArcSwapOption::empty(),
            refresher: Mutex::new(None),
            housekeeper: Mutex::new(None),
            listener: RwLock::new(self.listener),
            transactions: TransactionTable::new(),
            requests: RequestTable::default(),
            stats: SendStats::default(),
        };
        Ok(Producer {
            inner: Arc::new(inner),
        })
    }
}

/// Message producer.
///
/// ```no_run
/// # use std::sync::Arc;
/// # use mq_producer::{Message, Producer, ProducerConfig, Sender};
/// # fn demo(transport: Arc<dyn mq_producer::Transport>,
/// #         routes: Arc<dyn mq_producer::RouteProvider>) -> mq_producer::Result<()> {
/// let producer = Producer::builder(ProducerConfig::new("order-producer"))
///     .transport(transport)
///     .route_provider(routes)
///     .build()?;
/// producer.start()?;
///
/// let result = producer.send(&Message::new("orders", b"created".to_vec()))?;
/// println!("stored as {} on {}", result.msg_id, result.message_queue);
///
/// producer.shutdown();
/// # Ok(())
/// # }
/// ```
pub struct Producer {
    inner: Arc<ProducerInner>,
}

impl Producer {
    /// Start building a producer for `config`.
    pub fn builder(config: ProducerConfig) -> ProducerBuilder {
        ProducerBuilder {
            config,
            transport: None,
            route_provider: None,
            compressor: Arc::new(ZlibCompressor),
            listener: None,
        }
    }

    /// Spawn worker pools, housekeeping and the route refresher.
    pub fn start(&self) -> Result<()> {
        let mut state = self.inner.state.lock();
        if *state != ServiceState::CreateJust {
            return Err(ClientError::AlreadyStarted(state.as_str()));
        }

        match self.start_services() {
            Ok(()) => {
                *state = ServiceState::Running;
                log::info!(
                    "[producer] {} started (instance {})",
                    self.inner.config.group_name,
                    self.inner.config.instance_name
                );
                Ok(())
            }
            Err(e) => {
                *state = ServiceState::StartFailed;
                self.stop_services();
                log::error!(
                    "[producer] {} failed to start: {}",
                    self.inner.config.group_name,
                    e
                );
                Err(ClientError::Start(e))
            }
        }
    }

    fn start_services(&self) -> std::io::Result<()> {
        let config = &self.inner.config;
        let callback_pool = WorkerPool::new(
            "mq-send-callback",
            config.callback_thread_pool_size,
            config.callback_queue_capacity,
        )?;
        self.inner.callback_pool.store(Some(Arc::new(callback_pool)));

        let check_pool = WorkerPool::new(
            "mq-tx-check",
            config.check_thread_pool_size,
            config.check_request_hold_max,
        )?;
        self.inner.check_pool.store(Some(Arc::new(check_pool)));

        let weak: Weak<ProducerInner> = Arc::downgrade(&self.inner);
        let housekeeper = PeriodicTask::spawn(
            "mq-housekeeping",
            config.housekeeping_interval_duration(),
            move || {
                if let Some(inner) = weak.upgrade() {
                    inner.housekeep(Instant::now());
                }
            },
        )?;
        *self.inner.housekeeper.lock() = Some(housekeeper);

        if let Some(interval) = config.route_poll_interval_duration() {
            let refresher = RouteRefresher::spawn(Arc::clone(&self.inner.routes), interval)?;
            *self.inner.refresher.lock() = Some(refresher);
        }
        Ok(())
    }

    fn stop_services(&self) {
        if let Some(refresher) = self.inner.refresher.lock().take() {
            refresher.shutdown();
        }
        if let Some(housekeeper) = self.inner.housekeeper.lock().take() {
            housekeeper.shutdown();
        }
        if let Some(pool) = self.inner.check_pool.swap(None) {
            pool.shutdown();
        }
        if let Some(pool) = self.inner.callback_pool.swap(None) {
            pool.shutdown();
        }
    }

    /// Stop background work. Pending send callbacks are still delivered;
    /// pending requests fail with `NotRunning`.
    pub fn shutdown(&self) {
        let mut state = self.inner.state.lock();
        if *state != ServiceState::Running {
            return;
        }
        *state = ServiceState::ShutdownAlready;
        drop(state);

        self.stop_services();
        self.inner.fail_pending_requests();
        log::info!("[producer] {} shut down", self.inner.config.group_name);
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ServiceState {
        *self.inner.state.lock()
    }

    /// Configuration the producer was built with.
    pub fn config(&self) -> &ProducerConfig {
        &self.inner.config
    }

    /// Broker health tracker (diagnostics and manual reports).
    pub fn fault_strategy(&self) -> &FaultStrategy {
        &self.inner.fault
    }

    /// Snapshot of the send counters.
    pub fn stats(&self) -> SendStatsSnapshot {
        self.inner.stats.snapshot()
    }

    /// Transactions awaiting a definitive decision.
    pub fn transactions(&self) -> &TransactionTable {
        &self.inner.transactions
    }

    /// Requests waiting for their reply.
    pub fn pending_requests(&self) -> usize {
        self.inner.requests.len()
    }

    /// Replace the transaction listener.
    pub fn set_transaction_listener(&self, listener: Arc<dyn TransactionListener>) {
        *self.inner.listener.write() = Some(listener);
    }

    /// Writable queues of `topic`, fetching the route if needed.
    pub fn fetch_publish_message_queues(&self, topic: &str) -> Result<Vec<MessageQueue>> {
        let info = self.inner.routes.get_or_fetch(topic)?;
        Ok(info.queues().to_vec())
    }

    /// Send a half message, run the local transaction and report the
    /// decision to the broker.
    pub fn send_message_in_transaction(
        &self,
        msg: Message,
        arg: Option<&dyn Any>,
    ) -> Result<TransactionSendResult> {
        self.inner.send_message_in_transaction(msg, arg)
    }

    fn default_timeout(&self) -> Duration {
        self.inner.config.send_msg_timeout_duration()
    }
}

impl Drop for Producer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl Sender for Producer {
    fn send(&self, msg: &Message) -> Result<SendResult> {
        self.send_with_timeout(msg, self.default_timeout())
    }

    fn send_with_timeout(&self, msg: &Message, timeout: Duration) -> Result<SendResult> {
        self.inner
            .send_sync(msg.clone(), send::QueueChoice::Auto, timeout)
    }

    fn send_to_queue(&self, msg: &Message, mq: &MessageQueue) -> Result<SendResult> {
        self.send_to_queue_with_timeout(msg, mq, self.default_timeout())
    }

    fn send_to_queue_with_timeout(
        &self,
        msg: &Message,
        mq: &MessageQueue,
        timeout: Duration,
    ) -> Result<SendResult> {
        self.inner
            .send_sync(msg.clone(), send::QueueChoice::Fixed(mq), timeout)
    }

    fn send_with_selector<A, S>(&self, msg: &Message, selector: &S, arg: &A) -> Result<SendResult>
    where
        A: ?Sized,
        S: MessageQueueSelector<A>,
    {
        self.send_with_selector_with_timeout(msg, selector, arg, self.default_timeout())
    }

    fn send_with_selector_with_timeout<A, S>(
        &self,
        msg: &Message,
        selector: &S,
        arg: &A,
        timeout: Duration,
    ) -> Result<SendResult>
    where
        A: ?Sized,
        S: MessageQueueSelector<A>,
    {
        let select = |mqs: &[MessageQueue], m: &Message| selector.select(mqs, m, arg);
        self.inner
            .send_sync(msg.clone(), send::QueueChoice::Select(&select), timeout)
    }

    fn send_async<C: SendCallback>(&self, msg: Message, callback: C) {
        self.send_async_with_timeout(msg, self.default_timeout(), callback);
    }

    fn send_async_with_timeout<C: SendCallback>(
        &self,
        msg: Message,
        timeout: Duration,
        callback: C,
    ) {
        send::AsyncSend::start(
            &self.inner,
            msg,
            send::AsyncChoice::Auto,
            timeout,
            Box::new(callback),
        );
    }

    fn send_to_queue_async<C: SendCallback>(&self, msg: Message, mq: MessageQueue, callback: C) {
        self.send_to_queue_async_with_timeout(msg, mq, self.default_timeout(), callback);
    }

    fn send_to_queue_async_with_timeout<C: SendCallback>(
        &self,
        msg: Message,
        mq: MessageQueue,
        timeout: Duration,
        callback: C,
    ) {
        send::AsyncSend::start(
            &self.inner,
            msg,
            send::AsyncChoice::Fixed(mq),
            timeout,
            Box::new(callback),
        );
    }

    fn send_with_selector_async<A, S, C>(
        &self,
        msg: Message,
        selector: Arc<S>,
        arg: A,
        callback: C,
    ) where
        A: Send + Sync + 'static,
        S: MessageQueueSelector<A> + 'static,
        C: SendCallback,
    {
        self.send_with_selector_async_with_timeout(
            msg,
            selector,
            arg,
            self.default_timeout(),
            callback,
        );
    }

    fn send_with_selector_async_with_timeout<A, S, C>(
        &self,
        msg: Message,
        selector: Arc<S>,
        arg: A,
        timeout: Duration,
        callback: C,
    ) where
        A: Send + Sync + 'static,
        S: MessageQueueSelector<A> + 'static,
        C: SendCallback,
    {
        send::AsyncSend::start(
            &self.inner,
            msg,
            selector_choice(selector, arg),
            timeout,
            Box::new(callback),
        );
    }

    fn send_oneway(&self, msg: &Message) -> Result<()> {
        self.inner.send_oneway(msg.clone(), send::QueueChoice::Auto)
    }

    fn send_oneway_to_queue(&self, msg: &Message, mq: &MessageQueue) -> Result<()> {
        self.inner
            .send_oneway(msg.clone(), send::QueueChoice::Fixed(mq))
    }

    fn send_oneway_with_selector<A, S>(&self, msg: &Message, selector: &S, arg: &A) -> Result<()>
    where
        A: ?Sized,
        S: MessageQueueSelector<A>,
    {
        let select = |mqs: &[MessageQueue], m: &Message| selector.select(mqs, m, arg);
        self.inner
            .send_oneway(msg.clone(), send::QueueChoice::Select(&select))
    }

    fn send_batch(&self, msgs: Vec<Message>) -> Result<SendResult> {
        self.send_batch_with_timeout(msgs, self.default_timeout())
    }

    fn send_batch_with_timeout(&self, msgs: Vec<Message>, timeout: Duration) -> Result<SendResult> {
        self.inner
            .send_batch(msgs, send::QueueChoice::Auto, timeout)
    }

    fn send_batch_to_queue(&self, msgs: Vec<Message>, mq: &MessageQueue) -> Result<SendResult> {
        self.send_batch_to_queue_with_timeout(msgs, mq, self.default_timeout())
    }

    fn send_batch_to_queue_with_timeout(
        &self,
        msgs: Vec<Message>,
        mq: &MessageQueue,
        timeout: Duration,
    ) -> Result<SendResult> {
        self.inner
            .send_batch(msgs, send::QueueChoice::Fixed(mq), timeout)
    }
}

/// Owned selector choice for async sends and requests.
fn selector_choice<A, S>(selector: Arc<S>, arg: A) -> send::AsyncChoice
where
    A: Send + Sync + 'static,
    S: MessageQueueSelector<A> + 'static,
{
    let select = move |mqs: &[MessageQueue], m: &Message| selector.select(mqs, m, &arg);
    send::AsyncChoice::Select(Arc::new(select))
}

impl Requester for Producer {
    fn request(&self, msg: &Message, timeout: Duration) -> Result<Message> {
        self.inner
            .request_sync(msg.clone(), send::QueueChoice::Auto, timeout)
    }

    fn request_to_queue(
        &self,
        msg: &Message,
        mq: &MessageQueue,
        timeout: Duration,
    ) -> Result<Message> {
        self.inner
            .request_sync(msg.clone(), send::QueueChoice::Fixed(mq), timeout)
    }

    fn request_with_selector<A, S>(
        &self,
        msg: &Message,
        selector: &S,
        arg: &A,
        timeout: Duration,
    ) -> Result<Message>
    where
        A: ?Sized,
        S: MessageQueueSelector<A>,
    {
        let select = |mqs: &[MessageQueue], m: &Message| selector.select(mqs, m, arg);
        self.inner
            .request_sync(msg.clone(), send::QueueChoice::Select(&select), timeout)
    }

    fn request_async<C: RequestCallback>(&self, msg: Message, timeout: Duration, callback: C) {
        ProducerInner::request_async(
            &self.inner,
            msg,
            send::AsyncChoice::Auto,
            timeout,
            Box::new(callback),
        );
    }

    fn request_to_queue_async<C: RequestCallback>(
        &self,
        msg: Message,
        mq: MessageQueue,
        timeout: Duration,
        callback: C,
    ) {
        ProducerInner::request_async(
            &self.inner,
            msg,
            send::AsyncChoice::Fixed(mq),
            timeout,
            Box::new(callback),
        );
    }

    fn request_with_selector_async<A, S, C>(
        &self,
        msg: Message,
        selector: Arc<S>,
        arg: A,
        timeout: Duration,
        callback: C,
    ) where
        A: Send + Sync + 'static,
        S: MessageQueueSelector<A> + 'static,
        C: RequestCallback,
    {
        ProducerInner::request_async(
            &self.inner,
            msg,
            selector_choice(selector, arg),
            timeout,
            Box::new(callback),
        );
    }
}

impl ReplyReceiver for Producer {
    fn receive_reply_message(&self, reply: Message) {
        self.inner.receive_reply(reply);
    }
}

impl TransactionCheckResponder for Producer {
    fn check_transaction_state(
        &self,
        broker_addr: &str,
        msg: MessageExt,
        header: CheckTransactionStateRequestHeader,
    ) {
        transaction::submit_check(&self.inner, broker_addr, msg, header);
    }
}
