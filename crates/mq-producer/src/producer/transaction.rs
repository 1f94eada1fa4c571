// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Two-phase transactional sends.
//!
//! 1. The message is stored as a half message (invisible to consumers).
//! 2. The local transaction runs through the [`TransactionListener`].
//! 3. The decision is reported with one oneway end-transaction request.
//!
//! When the decision is `Unknown`, or the report is lost, the broker later
//! asks the producer to check the transaction. Checks run on a dedicated
//! bounded pool; a saturated pool drops the check and the broker asks again.

use std::any::Any;
use std::error::Error;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;

use super::{ProducerInner, SendStats};
use crate::error::{ClientError, Result};
use crate::message::{
    property, LocalTransactionState, Message, MessageExt, SendResult, SendStatus,
    TransactionSendResult,
};
use crate::producer::send::QueueChoice;
use crate::transport::{CheckTransactionStateRequestHeader, EndTransactionRequestHeader};
use crate::util::{create_uniq_id, decode_message_id};

/// Error type listeners may return.
pub type ListenerError = Box<dyn Error + Send + Sync>;

/// Application side of a transaction.
pub trait TransactionListener: Send + Sync {
    /// Run the local transaction for a stored half message.
    fn execute_local_transaction(
        &self,
        msg: &Message,
        arg: Option<&dyn Any>,
    ) -> std::result::Result<LocalTransactionState, ListenerError>;

    /// Answer a broker check for a half message still undecided.
    fn check_local_transaction(
        &self,
        msg: &MessageExt,
    ) -> std::result::Result<LocalTransactionState, ListenerError>;
}

/// Outcome of a listener call, carried to the end-transaction report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransactionDecision {
    Commit,
    Rollback,
    Unknown,
    /// The listener failed or panicked; reported as unknown.
    Error(String),
}

impl TransactionDecision {
    /// Run a listener call, turning errors and panics into `Error`.
    fn from_listener<F>(call: F) -> Self
    where
        F: FnOnce() -> std::result::Result<LocalTransactionState, ListenerError>,
    {
        match catch_unwind(AssertUnwindSafe(call)) {
            Ok(Ok(state)) => state.into(),
            Ok(Err(e)) => Self::Error(e.to_string()),
            Err(panic) => Self::Error(panic_message(panic.as_ref())),
        }
    }

    /// State reported to the broker.
    pub fn state(&self) -> LocalTransactionState {
        match self {
            Self::Commit => LocalTransactionState::CommitMessage,
            Self::Rollback => LocalTransactionState::RollbackMessage,
            Self::Unknown | Self::Error(_) => LocalTransactionState::Unknown,
        }
    }

    /// Failure reason, if the listener failed.
    pub fn error(&self) -> Option<&str> {
        match self {
            Self::Error(reason) => Some(reason),
            _ => None,
        }
    }
}

impl From<LocalTransactionState> for TransactionDecision {
    fn from(state: LocalTransactionState) -> Self {
        match state {
            LocalTransactionState::CommitMessage => Self::Commit,
            LocalTransactionState::RollbackMessage => Self::Rollback,
            LocalTransactionState::Unknown => Self::Unknown,
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("panic: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("panic: {s}")
    } else {
        "panic".to_string()
    }
}

/// A half message awaiting a definitive decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionRecord {
    /// Broker-assigned transaction id, or the message id when none.
    pub transaction_id: String,
    /// Client-side unique id of the half message.
    pub msg_id: String,
    /// Store id returned by the broker.
    pub offset_msg_id: Option<String>,
    pub queue_offset: i64,
    /// Commit log offset decoded from `offset_msg_id`, 0 if undecodable.
    pub commit_log_offset: i64,
    /// Broker holding the half message.
    pub broker_name: String,
    /// Last local decision; only `Unknown` records stay in the table.
    pub state: LocalTransactionState,
    /// When the half message was stored.
    pub created_at: Instant,
}

/// Open transactions keyed by transaction id.
#[derive(Debug, Default)]
pub struct TransactionTable {
    records: DashMap<String, TransactionRecord>,
}

impl TransactionTable {
    /// Empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a half message, replacing any record with the same id.
    pub fn insert(&self, record: TransactionRecord) {
        self.records.insert(record.transaction_id.clone(), record);
    }

    /// Update the state of a known transaction. Returns false if unknown.
    pub fn update_state(&self, transaction_id: &str, state: LocalTransactionState) -> bool {
        match self.records.get_mut(transaction_id) {
            Some(mut record) => {
                record.state = state;
                true
            }
            None => false,
        }
    }

    /// Stop tracking a transaction.
    pub fn remove(&self, transaction_id: &str) -> Option<TransactionRecord> {
        self.records.remove(transaction_id).map(|(_, record)| record)
    }

    /// Copy of the record for `transaction_id`.
    pub fn get(&self, transaction_id: &str) -> Option<TransactionRecord> {
        self.records.get(transaction_id).map(|r| r.clone())
    }

    /// Apply a decision: definitive states close the record.
    fn settle(&self, transaction_id: &str, state: LocalTransactionState) {
        if state.is_final() {
            self.remove(transaction_id);
        } else {
            self.update_state(transaction_id, state);
        }
    }

    /// Drop records created more than `ttl` before `now`. The broker keeps
    /// checking those transactions; the record only mirrors its state.
    /// Returns how many were dropped.
    pub fn expire_older_than(&self, ttl: Duration, now: Instant) -> usize {
        let mut expired = 0;
        self.records.retain(|_, record| {
            let keep = now.saturating_duration_since(record.created_at) <= ttl;
            if !keep {
                expired += 1;
            }
            keep
        });
        expired
    }

    /// Number of open transactions.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// True when no transaction is open.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl ProducerInner {
    pub(crate) fn send_message_in_transaction(
        &self,
        mut msg: Message,
        arg: Option<&dyn Any>,
    ) -> Result<TransactionSendResult> {
        let listener = self
            .transaction_listener()
            .ok_or(ClientError::NoTransactionListener)?;

        msg.clear_property(property::DELAY_TIME_LEVEL);
        msg.put_property(property::TRANSACTION_PREPARED, "true");
        msg.put_property(property::PRODUCER_GROUP, self.config.group_name.clone());
        if msg.unique_key().is_none() {
            msg.put_property(property::UNIQ_CLIENT_MESSAGE_ID_KEYIDX, create_uniq_id());
        }

        let send_result = self.send_sync(
            msg.clone(),
            QueueChoice::Auto,
            self.config.send_msg_timeout_duration(),
        )?;

        let decision = match send_result.status {
            SendStatus::SendOk => {
                let transaction_id = send_result
                    .transaction_id
                    .clone()
                    .unwrap_or_else(|| send_result.msg_id.clone());
                msg.set_transaction_id(transaction_id.clone());
                self.transactions
                    .insert(new_record(&transaction_id, &send_result));

                let decision = TransactionDecision::from_listener(|| {
                    listener.execute_local_transaction(&msg, arg)
                });
                if let Some(reason) = decision.error() {
                    log::warn!(
                        "[tx] local transaction {} failed: {}",
                        transaction_id,
                        reason
                    );
                }
                self.transactions
                    .settle(&transaction_id, decision.state());
                decision
            }
            status => {
                log::debug!(
                    "[tx] half message {} stored with {:?}, rolling back",
                    send_result.msg_id,
                    status
                );
                TransactionDecision::Rollback
            }
        };

        let local_state = decision.state();
        self.count_decision(local_state);
        let remark = decision
            .error()
            .map(|reason| format!("executeLocalTransactionBranch exception: {reason}"));
        self.end_transaction(&send_result, local_state, remark.as_deref());

        Ok(TransactionSendResult {
            send_result,
            local_state,
        })
    }

    fn count_decision(&self, state: LocalTransactionState) {
        let counter = match state {
            LocalTransactionState::CommitMessage => &self.stats.tx_committed,
            LocalTransactionState::RollbackMessage => &self.stats.tx_rolled_back,
            LocalTransactionState::Unknown => &self.stats.tx_unknown,
        };
        SendStats::incr(counter);
    }

    /// Report the decision for a half message. Failures are logged only.
    fn end_transaction(
        &self,
        send_result: &SendResult,
        state: LocalTransactionState,
        remark: Option<&str>,
    ) {
        let id = send_result
            .offset_msg_id
            .as_deref()
            .and_then(decode_message_id)
            .or_else(|| decode_message_id(&send_result.msg_id));
        let Some(id) = id else {
            log::warn!(
                "[tx] cannot decode store offset of {}, end report skipped",
                send_result.msg_id
            );
            return;
        };

        let broker = &send_result.message_queue.broker_name;
        let Some(addr) = self.routes.find_broker_address(broker) else {
            log::warn!("[tx] broker {} unknown, end report skipped", broker);
            return;
        };

        let header = EndTransactionRequestHeader {
            producer_group: self.config.group_name.clone(),
            tran_state_table_offset: send_result.queue_offset,
            commit_log_offset: id.offset,
            commit_or_rollback: state.sys_flag(),
            from_transaction_check: false,
            msg_id: send_result.msg_id.clone(),
            transaction_id: send_result.transaction_id.clone(),
        };

        if let Err(e) = self.transport.end_transaction_oneway(
            &addr,
            &header,
            remark,
            self.config.end_transaction_timeout(),
        ) {
            log::warn!(
                "[tx] end transaction {} ({}) to {} failed: {}",
                send_result.msg_id,
                state,
                addr,
                e
            );
        }
    }

    /// Body of a transaction check job.
    fn process_transaction_check(
        &self,
        broker_addr: &str,
        msg: MessageExt,
        header: CheckTransactionStateRequestHeader,
    ) {
        SendStats::incr(&self.stats.checks_processed);
        let Some(listener) = self.transaction_listener() else {
            log::warn!(
                "[tx] check for {} without a listener, ignored",
                msg.report_msg_id()
            );
            return;
        };

        let decision = TransactionDecision::from_listener(|| listener.check_local_transaction(&msg));
        let state = decision.state();
        if let Some(reason) = decision.error() {
            log::warn!("[tx] check of {} failed: {}", msg.report_msg_id(), reason);
        }

        let transaction_id = header
            .transaction_id
            .clone()
            .or_else(|| msg.message.transaction_id().map(str::to_string));
        if let Some(id) = &transaction_id {
            self.transactions.settle(id, state);
        }

        let end = EndTransactionRequestHeader {
            producer_group: self.config.group_name.clone(),
            tran_state_table_offset: header.tran_state_table_offset,
            commit_log_offset: header.commit_log_offset,
            commit_or_rollback: state.sys_flag(),
            from_transaction_check: true,
            msg_id: msg.report_msg_id().to_string(),
            transaction_id,
        };
        let remark = decision
            .error()
            .map(|reason| format!("checkLocalTransactionState Exception: {reason}"));

        log::debug!(
            "[tx] check of {} answered {} to {}",
            end.msg_id,
            state,
            broker_addr
        );
        if let Err(e) = self.transport.end_transaction_oneway(
            broker_addr,
            &end,
            remark.as_deref(),
            self.config.end_transaction_timeout(),
        ) {
            log::warn!(
                "[tx] check report for {} to {} failed: {}",
                end.msg_id,
                broker_addr,
                e
            );
        }
    }
}

fn new_record(transaction_id: &str, send_result: &SendResult) -> TransactionRecord {
    TransactionRecord {
        transaction_id: transaction_id.to_string(),
        msg_id: send_result.msg_id.clone(),
        offset_msg_id: send_result.offset_msg_id.clone(),
        queue_offset: send_result.queue_offset,
        commit_log_offset: send_result
            .offset_msg_id
            .as_deref()
            .and_then(decode_message_id)
            .map_or(0, |id| id.offset),
        broker_name: send_result.message_queue.broker_name.clone(),
        state: LocalTransactionState::Unknown,
        created_at: Instant::now(),
    }
}

/// Queue a broker check on the check pool.
pub(crate) fn submit_check(
    inner: &Arc<ProducerInner>,
    broker_addr: &str,
    msg: MessageExt,
    header: CheckTransactionStateRequestHeader,
) {
    let Some(pool) = inner.check_pool.load_full() else {
        log::warn!(
            "[tx] check for {} received while not running, ignored",
            msg.report_msg_id()
        );
        return;
    };

    let job_inner = Arc::clone(inner);
    let addr = broker_addr.to_string();
    let msg_id = msg.report_msg_id().to_string();
    let job = Box::new(move || job_inner.process_transaction_check(&addr, msg, header));
    if pool.try_execute(job).is_err() {
        SendStats::incr(&inner.stats.checks_rejected);
        log::warn!(
            "[tx] check pool saturated, check for {} from {} dropped",
            msg_id,
            broker_addr
        );
    }
}
