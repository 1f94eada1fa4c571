// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Remoting collaborator.
//!
//! The producer hands fully built requests to a [`Transport`] and never
//! touches sockets or header encoding itself.
//!
//! # Async contract
//!
//! [`Transport::invoke_async`] must call `on_complete` exactly once, also
//! for failures detected before anything reaches the wire. It may call it
//! inline, before returning. The producer tolerates a lost continuation
//! (the callback then reports [`ClientError::CallbackDropped`]) but a
//! transport must not rely on that.
//!
//! # Replies
//!
//! Replies to request messages are pushed by the broker to the requesting
//! client. The transport hands each one to
//! [`ReplyReceiver::receive_reply_message`] of the producer that sent the
//! request.
//!
//! [`ClientError::CallbackDropped`]: crate::error::ClientError::CallbackDropped
//! [`ReplyReceiver::receive_reply_message`]: crate::producer::ReplyReceiver::receive_reply_message

use std::sync::Arc;
use std::time::Duration;

use crate::error::RemotingError;
use crate::message::SendStatus;

/// Topic brokers use to auto-create unknown topics.
pub const AUTO_CREATE_TOPIC_KEY_TOPIC: &str = "TBW102";

/// Header of a send request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendMessageRequestHeader {
    pub producer_group: String,
    pub topic: String,
    pub default_topic: String,
    pub default_topic_queue_nums: i32,
    pub queue_id: i32,
    pub sys_flag: i32,
    pub born_timestamp: u64,
    pub flag: i32,
    pub properties: String,
    pub reconsume_times: i32,
    pub unit_mode: bool,
    pub batch: bool,
    pub max_reconsume_times: Option<i32>,
}

/// Send request: header plus a shared body so retries do not copy it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendMessageRequest {
    pub header: SendMessageRequestHeader,
    /// Body as sent (compressed or batch-framed when flagged).
    pub body: Arc<[u8]>,
}

/// Broker answer to an accepted send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendMessageResponse {
    /// Store outcome.
    pub status: SendStatus,
    /// Broker id encoding store address + commit log offset.
    pub offset_msg_id: String,
    pub queue_id: i32,
    pub queue_offset: i64,
    pub transaction_id: Option<String>,
    pub region_id: Option<String>,
}

/// Header of the end-transaction report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndTransactionRequestHeader {
    pub producer_group: String,
    pub tran_state_table_offset: i64,
    pub commit_log_offset: i64,
    /// One of the transaction sys-flag values.
    pub commit_or_rollback: i32,
    pub from_transaction_check: bool,
    pub msg_id: String,
    pub transaction_id: Option<String>,
}

/// Header of a broker-initiated transaction check.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CheckTransactionStateRequestHeader {
    pub tran_state_table_offset: i64,
    pub commit_log_offset: i64,
    pub msg_id: Option<String>,
    pub transaction_id: Option<String>,
    pub offset_msg_id: Option<String>,
}

/// Completion of an async send.
pub type SendCompletion =
    Box<dyn FnOnce(Result<SendMessageResponse, RemotingError>) + Send + 'static>;

/// Request/response transport to brokers.
pub trait Transport: Send + Sync {
    /// Send and wait for the broker's answer.
    fn invoke_sync(
        &self,
        addr: &str,
        request: &SendMessageRequest,
        timeout: Duration,
    ) -> Result<SendMessageResponse, RemotingError>;

    /// Send without blocking; see the module docs for the completion rules.
    fn invoke_async(
        &self,
        addr: &str,
        request: SendMessageRequest,
        timeout: Duration,
        on_complete: SendCompletion,
    );

    /// Fire and forget. Errors only cover handing the request off.
    fn invoke_oneway(&self, addr: &str, request: &SendMessageRequest)
        -> Result<(), RemotingError>;

    /// Report a transaction decision, oneway.
    fn end_transaction_oneway(
        &self,
        addr: &str,
        header: &EndTransactionRequestHeader,
        remark: Option<&str>,
        timeout: Duration,
    ) -> Result<(), RemotingError>;
}
