// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Error types for the producer runtime.
//!
//! Two layers:
//! - [`RemotingError`] is what a [`Transport`](crate::transport::Transport)
//!   reports for one request (network failure or a broker response code).
//! - [`ClientError`] is what callers of the producer see. Retryable
//!   remoting failures never surface individually; they end up wrapped in
//!   [`ClientError::AttemptsExhausted`] when the retry budget runs out.

use crate::config::ConfigError;
use std::time::Duration;
use thiserror::Error;

/// Result type for producer operations.
pub type Result<T> = std::result::Result<T, ClientError>;

/// Broker response codes the send path cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResponseCode {
    SystemError,
    SystemBusy,
    RequestCodeNotSupported,
    TopicNotExist,
    ServiceNotAvailable,
    NoPermission,
    MessageIllegal,
    NotInCurrentUnit,
    /// Any code the client has no special handling for.
    Other(i32),
}

impl ResponseCode {
    /// Map a raw broker code.
    pub fn from_code(code: i32) -> Self {
        match code {
            1 => Self::SystemError,
            2 => Self::SystemBusy,
            3 => Self::RequestCodeNotSupported,
            13 => Self::MessageIllegal,
            14 => Self::ServiceNotAvailable,
            16 => Self::NoPermission,
            17 => Self::TopicNotExist,
            180 => Self::NotInCurrentUnit,
            other => Self::Other(other),
        }
    }

    /// Raw broker code.
    pub fn code(&self) -> i32 {
        match self {
            Self::SystemError => 1,
            Self::SystemBusy => 2,
            Self::RequestCodeNotSupported => 3,
            Self::MessageIllegal => 13,
            Self::ServiceNotAvailable => 14,
            Self::NoPermission => 16,
            Self::TopicNotExist => 17,
            Self::NotInCurrentUnit => 180,
            Self::Other(code) => *code,
        }
    }

    /// Broker refused the request but another broker may accept it.
    pub fn is_retryable_rejection(&self) -> bool {
        matches!(
            self,
            Self::TopicNotExist
                | Self::ServiceNotAvailable
                | Self::SystemError
                | Self::NoPermission
                | Self::NotInCurrentUnit
        )
    }
}

/// Failure reported by the transport for a single request.
#[derive(Debug, Clone, Error)]
pub enum RemotingError {
    #[error("connect to {addr} failed: {reason}")]
    Connect { addr: String, reason: String },

    #[error("send request to {addr} failed: {reason}")]
    SendRequest { addr: String, reason: String },

    #[error("wait response from {addr} timed out after {timeout:?}")]
    Timeout { addr: String, timeout: Duration },

    #[error("too many requests in flight to {addr}")]
    TooMuchRequest { addr: String },

    #[error("broker {addr} responded {code:?}: {remark}")]
    Broker {
        addr: String,
        code: ResponseCode,
        remark: String,
    },
}

impl RemotingError {
    /// Build a broker error from a raw response code.
    pub fn broker(addr: impl Into<String>, code: i32, remark: impl Into<String>) -> Self {
        Self::Broker {
            addr: addr.into(),
            code: ResponseCode::from_code(code),
            remark: remark.into(),
        }
    }

    /// Whether this failure should take the broker out of selection.
    ///
    /// Network-level trouble and `SystemBusy` isolate; explicit broker
    /// rejections do not.
    pub fn should_isolate(&self) -> bool {
        match self {
            Self::Connect { .. }
            | Self::SendRequest { .. }
            | Self::Timeout { .. }
            | Self::TooMuchRequest { .. } => true,
            Self::Broker { code, .. } => *code == ResponseCode::SystemBusy,
        }
    }

    /// Whether another attempt (possibly on another broker) makes sense.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Broker { code, .. } => {
                *code == ResponseCode::SystemBusy || code.is_retryable_rejection()
            }
            _ => true,
        }
    }
}

/// Errors surfaced to producer callers.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("invalid message: {0}")]
    Validation(String),

    #[error("producer is not running (state: {0})")]
    NotRunning(&'static str),

    #[error("producer cannot start from state {0}")]
    AlreadyStarted(&'static str),

    #[error("failed to start producer threads: {0}")]
    Start(#[source] std::io::Error),

    #[error("no route info for topic {topic}")]
    RouteUnavailable { topic: String },

    #[error("broker {broker} has no known master address")]
    BrokerNotFound { broker: String },

    #[error(transparent)]
    Remoting(#[from] RemotingError),

    #[error("send timed out after {elapsed:?} (timeout {timeout:?})")]
    Timeout { elapsed: Duration, timeout: Duration },

    #[error("send failed after {attempts} attempts in {elapsed:?}, topic {topic}")]
    AttemptsExhausted {
        attempts: u32,
        topic: String,
        elapsed: Duration,
        #[source]
        last: Box<ClientError>,
    },

    #[error("queue selector failed: {0}")]
    SelectorFailed(String),

    #[error("no transaction listener registered")]
    NoTransactionListener,

    #[error("body compression failed: {0}")]
    Compression(#[source] std::io::Error),

    #[error("send callback dropped before completion")]
    CallbackDropped,

    #[error("no reply for request {correlation_id} within {timeout:?}")]
    RequestTimeout {
        correlation_id: String,
        timeout: Duration,
    },

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl ClientError {
    /// The remoting failure at the root of this error, if any.
    pub fn remoting(&self) -> Option<&RemotingError> {
        match self {
            Self::Remoting(e) => Some(e),
            Self::AttemptsExhausted { last, .. } => last.remoting(),
            _ => None,
        }
    }

    /// Whether the send loop may try again, possibly on another broker.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Remoting(e) => e.is_retryable(),
            Self::BrokerNotFound { .. } => true,
            _ => false,
        }
    }

    /// Broker response code at the root of this error, if any.
    pub fn response_code(&self) -> Option<ResponseCode> {
        match self.remoting() {
            Some(RemotingError::Broker { code, .. }) => Some(*code),
            _ => None,
        }
    }
}
