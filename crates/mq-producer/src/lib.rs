// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Producer runtime for a broker-based message queue.
//!
//! The crate takes application messages, picks a queue on the broker
//! cluster and ships them sync, async or oneway, with a two-phase protocol
//! for transactional messages.
//!
//! # Architecture
//!
//! ```text
//! caller ──► Producer (Sender) ──► FaultStrategy ──► Transport ──► broker
//!                 │                    ▲                │
//!                 │                    └── latency ─────┘
//!                 └─► TransactionListener ──► end-transaction report
//! broker check ──► TransactionCheckResponder ──► check pool ──► listener
//! broker reply ──► ReplyReceiver ──► pending request (by correlation id)
//! ```
//!
//! - [`fault`]: per-broker latency records and fault-aware queue selection.
//! - [`producer`]: the send loop, async continuations, request/reply and
//!   transactions.
//! - [`route`]: route cache over a [`RouteProvider`].
//! - [`transport`]: the [`Transport`] collaborator the producer sends with.
//!
//! Sockets, header encoding and the naming service are out of scope; they
//! are reached through the collaborator traits.

pub mod batch;
pub mod compress;
pub mod config;
pub mod error;
pub mod executor;
pub mod fault;
pub mod message;
pub mod producer;
pub mod route;
pub mod selector;
pub mod transport;
pub mod util;
pub mod validator;

pub use compress::{Compressor, ZlibCompressor};
pub use config::{ConfigError, IsolationStep, ProducerConfig};
pub use error::{ClientError, RemotingError, ResponseCode, Result};
pub use fault::{FaultItem, FaultStrategy};
pub use message::{
    LocalTransactionState, Message, MessageExt, MessageQueue, SendResult, SendStatus,
    TransactionSendResult,
};
pub use producer::{
    ListenerError, Producer, ProducerBuilder, ReplyReceiver, RequestCallback, Requester,
    SendCallback, SendStatsSnapshot, Sender, ServiceState, TransactionCheckResponder,
    TransactionDecision, TransactionListener,
};
pub use route::{BrokerData, QueueData, RouteProvider, TopicPublishInfo, TopicRouteData};
pub use selector::{MessageQueueSelector, SelectByHash, SelectByRandom};
pub use transport::{
    CheckTransactionStateRequestHeader, EndTransactionRequestHeader, SendCompletion,
    SendMessageRequest, SendMessageResponse, Transport,
};
