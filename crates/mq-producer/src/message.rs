// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Message model: application messages, queues, and send results.

use std::collections::BTreeMap;
use std::fmt;

/// Well-known message property keys.
pub mod property {
    /// Message tags, used by consumers to filter.
    pub const TAGS: &str = "TAGS";
    /// Space-separated business keys.
    pub const KEYS: &str = "KEYS";
    /// Delay level of a scheduled message.
    pub const DELAY_TIME_LEVEL: &str = "DELAY";
    /// Whether the broker answers only once the message is stored.
    pub const WAIT_STORE_MSG_OK: &str = "WAIT";
    /// Marks a transactional half message.
    pub const TRANSACTION_PREPARED: &str = "TRAN_MSG";
    /// Producer group of a half message.
    pub const PRODUCER_GROUP: &str = "PGROUP";
    /// Client-side unique message id.
    pub const UNIQ_CLIENT_MESSAGE_ID_KEYIDX: &str = "UNIQ_KEY";
    /// Transaction id assigned to a half message.
    pub const TRANSACTION_ID: &str = "__transactionId__";
    /// Retry limit consumers apply to the message.
    pub const MAX_RECONSUME_TIMES: &str = "MAX_RECONSUME_TIMES";
    /// Links a request with its reply.
    pub const CORRELATION_ID: &str = "CORRELATION_ID";
    /// Client the broker pushes the reply to.
    pub const MESSAGE_REPLY_TO_CLIENT: &str = "REPLY_TO_CLIENT";
    /// Request time-to-live (ms).
    pub const MESSAGE_TTL: &str = "TTL";
}

/// Request sys-flag bits.
pub mod sys_flag {
    /// Body is zlib-compressed.
    pub const COMPRESSED: i32 = 0x1;
    /// Message carries several tags.
    pub const MULTI_TAGS: i32 = 0x1 << 1;
    /// Not transactional.
    pub const TRANSACTION_NOT_TYPE: i32 = 0;
    /// Half message.
    pub const TRANSACTION_PREPARED_TYPE: i32 = 0x1 << 2;
    /// Commit decision.
    pub const TRANSACTION_COMMIT_TYPE: i32 = 0x2 << 2;
    /// Rollback decision; also the mask of the transaction bits.
    pub const TRANSACTION_ROLLBACK_TYPE: i32 = 0x3 << 2;

    /// Extract the transaction bits of a sys flag.
    pub fn transaction_value(flag: i32) -> i32 {
        flag & TRANSACTION_ROLLBACK_TYPE
    }
}

/// Property encoding separators.
const NAME_VALUE_SEPARATOR: char = '\u{1}';
const PROPERTY_SEPARATOR: char = '\u{2}';

/// Topic prefix used by retry topics.
pub const RETRY_GROUP_TOPIC_PREFIX: &str = "%RETRY%";

/// One partition of a topic, hosted by one broker.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageQueue {
    /// Topic the queue belongs to.
    pub topic: String,
    /// Broker hosting the queue.
    pub broker_name: String,
    /// Queue index on that broker.
    pub queue_id: i32,
}

impl MessageQueue {
    /// Queue `queue_id` of `topic` on `broker_name`.
    pub fn new(topic: impl Into<String>, broker_name: impl Into<String>, queue_id: i32) -> Self {
        Self {
            topic: topic.into(),
            broker_name: broker_name.into(),
            queue_id,
        }
    }
}

impl fmt::Display for MessageQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "MessageQueue [topic={}, brokerName={}, queueId={}]",
            self.topic, self.broker_name, self.queue_id
        )
    }
}

/// Application message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
    topic: String,
    flag: i32,
    properties: BTreeMap<String, String>,
    body: Vec<u8>,
}

impl Message {
    /// Message for `topic` with `body` and no properties.
    pub fn new(topic: impl Into<String>, body: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            body: body.into(),
            ..Default::default()
        }
    }

    /// Builder: set tags.
    pub fn with_tags(mut self, tags: impl Into<String>) -> Self {
        self.put_property(property::TAGS, tags);
        self
    }

    /// Builder: set keys (joined with a space).
    pub fn with_keys<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let joined = keys
            .into_iter()
            .map(|k| k.as_ref().to_string())
            .collect::<Vec<_>>()
            .join(" ");
        self.put_property(property::KEYS, joined);
        self
    }

    /// Builder: set an arbitrary user property.
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.put_property(key, value);
        self
    }

    /// Destination topic.
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Change the destination topic.
    pub fn set_topic(&mut self, topic: impl Into<String>) {
        self.topic = topic.into();
    }

    /// Application-defined flag, passed through untouched.
    pub fn flag(&self) -> i32 {
        self.flag
    }

    /// Set the application-defined flag.
    pub fn set_flag(&mut self, flag: i32) {
        self.flag = flag;
    }

    /// Payload, never compressed.
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Replace the payload.
    pub fn set_body(&mut self, body: Vec<u8>) {
        self.body = body;
    }

    /// Tags, if set.
    pub fn tags(&self) -> Option<&str> {
        self.property(property::TAGS)
    }

    /// Space-separated keys, if set.
    pub fn keys(&self) -> Option<&str> {
        self.property(property::KEYS)
    }

    /// Delay level; 0 when unset or unparsable.
    pub fn delay_time_level(&self) -> i32 {
        self.property(property::DELAY_TIME_LEVEL)
            .and_then(|v| v.parse().ok())
            .unwrap_or(0)
    }

    /// Schedule the message at delay `level`.
    pub fn set_delay_time_level(&mut self, level: i32) {
        self.put_property(property::DELAY_TIME_LEVEL, level.to_string());
    }

    /// True unless the property is set to `false`.
    pub fn is_wait_store_msg_ok(&self) -> bool {
        self.property(property::WAIT_STORE_MSG_OK)
            .map(|v| v != "false")
            .unwrap_or(true)
    }

    /// Transaction id, if set.
    pub fn transaction_id(&self) -> Option<&str> {
        self.property(property::TRANSACTION_ID)
    }

    /// Set the transaction id.
    pub fn set_transaction_id(&mut self, id: impl Into<String>) {
        self.put_property(property::TRANSACTION_ID, id);
    }

    /// Correlation id linking a request and its reply.
    pub fn correlation_id(&self) -> Option<&str> {
        self.property(property::CORRELATION_ID)
    }

    /// Client-side unique id, if one has been stamped.
    pub fn unique_key(&self) -> Option<&str> {
        self.property(property::UNIQ_CLIENT_MESSAGE_ID_KEYIDX)
    }

    /// Value of property `key`.
    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    /// Set property `key`, replacing any previous value.
    pub fn put_property(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.properties.insert(key.into(), value.into());
    }

    /// Remove property `key`.
    pub fn clear_property(&mut self, key: &str) {
        self.properties.remove(key);
    }

    /// All properties, sorted by key.
    pub fn properties(&self) -> &BTreeMap<String, String> {
        &self.properties
    }

    /// Encode properties as `name\u{1}value\u{2}` pairs.
    pub fn properties_string(&self) -> String {
        properties_to_string(&self.properties)
    }
}

/// Encode a property map into its wire string form.
pub fn properties_to_string(properties: &BTreeMap<String, String>) -> String {
    let mut out = String::new();
    for (key, value) in properties {
        out.push_str(key);
        out.push(NAME_VALUE_SEPARATOR);
        out.push_str(value);
        out.push(PROPERTY_SEPARATOR);
    }
    out
}

/// Decode a property string produced by [`properties_to_string`].
pub fn string_to_properties(encoded: &str) -> BTreeMap<String, String> {
    encoded
        .split(PROPERTY_SEPARATOR)
        .filter_map(|pair| pair.split_once(NAME_VALUE_SEPARATOR))
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

/// Message as stored and echoed back by a broker (used by transaction checks).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageExt {
    /// Topic, properties and body as stored.
    pub message: Message,
    /// Id the broker knows the message by.
    pub msg_id: String,
    /// Store address + commit log offset id.
    pub offset_msg_id: Option<String>,
    pub queue_id: i32,
    pub queue_offset: i64,
    pub commit_log_offset: i64,
    /// `host:port` of the storing broker.
    pub store_host: Option<String>,
}

impl MessageExt {
    /// Stored form of `message` known by `msg_id`.
    pub fn new(message: Message, msg_id: impl Into<String>) -> Self {
        Self {
            message,
            msg_id: msg_id.into(),
            ..Default::default()
        }
    }

    /// Id reported to the broker: the client unique key if present.
    pub fn report_msg_id(&self) -> &str {
        self.message.unique_key().unwrap_or(&self.msg_id)
    }
}

/// Broker store outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendStatus {
    SendOk,
    FlushDiskTimeout,
    FlushSlaveTimeout,
    SlaveNotAvailable,
}

impl SendStatus {
    /// Stored and flushed as requested.
    pub fn is_ok(&self) -> bool {
        *self == SendStatus::SendOk
    }
}

/// Outcome of a successful dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendResult {
    /// Store outcome on the broker.
    pub status: SendStatus,
    /// Client unique id of the message.
    pub msg_id: String,
    /// Broker-assigned id encoding store address + commit log offset.
    pub offset_msg_id: Option<String>,
    /// Queue the message was stored in.
    pub message_queue: MessageQueue,
    /// Logical offset within that queue.
    pub queue_offset: i64,
    /// Broker transaction id of a half message.
    pub transaction_id: Option<String>,
    /// Region of the storing broker.
    pub region_id: Option<String>,
}

/// Decision of the local transaction branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LocalTransactionState {
    CommitMessage,
    RollbackMessage,
    #[default]
    Unknown,
}

impl LocalTransactionState {
    /// Sys flag carried by the end-transaction request.
    pub fn sys_flag(&self) -> i32 {
        match self {
            Self::CommitMessage => sys_flag::TRANSACTION_COMMIT_TYPE,
            Self::RollbackMessage => sys_flag::TRANSACTION_ROLLBACK_TYPE,
            Self::Unknown => sys_flag::TRANSACTION_NOT_TYPE,
        }
    }

    /// Commit or rollback; closes the transaction.
    pub fn is_final(&self) -> bool {
        !matches!(self, Self::Unknown)
    }
}

impl fmt::Display for LocalTransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::CommitMessage => "COMMIT_MESSAGE",
            Self::RollbackMessage => "ROLLBACK_MESSAGE",
            Self::Unknown => "UNKNOW",
        };
        f.write_str(name)
    }
}

/// Result of a transactional send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionSendResult {
    /// Outcome of the half-message send.
    pub send_result: SendResult,
    /// Decision reported to the broker.
    pub local_state: LocalTransactionState,
}
