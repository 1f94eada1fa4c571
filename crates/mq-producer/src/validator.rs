// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Local message checks run before any network activity.

use crate::error::{ClientError, Result};
use crate::message::{Message, RETRY_GROUP_TOPIC_PREFIX};
use regex::Regex;
use std::sync::OnceLock;

/// Maximum number of messages in one batch.
pub const MAX_MESSAGE_NUMBER_PER_BATCH: usize = 32;

/// Topic prefixes reserved for consumer/group ids.
const RESERVED_TOPIC_PREFIXES: [&str; 2] = ["CID", "GID"];

fn topic_regex() -> Option<&'static Regex> {
    static TOPIC_REGEX: OnceLock<Option<Regex>> = OnceLock::new();
    TOPIC_REGEX
        .get_or_init(|| Regex::new(r"^[a-zA-Z0-9\-_]{3,64}$").ok())
        .as_ref()
}

/// Check a topic name: 3-64 chars of `[a-zA-Z0-9-_]`, no reserved prefix.
pub fn check_topic(topic: &str) -> Result<()> {
    if topic.is_empty() {
        return Err(ClientError::Validation("topic is empty".into()));
    }
    if let Some(prefix) = RESERVED_TOPIC_PREFIXES
        .iter()
        .find(|p| topic.starts_with(*p))
    {
        return Err(ClientError::Validation(format!(
            "topic {topic} uses reserved prefix {prefix}"
        )));
    }
    if !topic_regex().is_some_and(|re| re.is_match(topic)) {
        return Err(ClientError::Validation(format!(
            "topic {topic} must be 3-64 characters of [a-zA-Z0-9-_]"
        )));
    }
    Ok(())
}

/// Check a message before send: topic rules and `0 < body <= max_body_size`.
pub fn check_message(msg: &Message, max_body_size: usize) -> Result<()> {
    check_topic(msg.topic())?;

    let len = msg.body().len();
    if len == 0 {
        return Err(ClientError::Validation("message body is empty".into()));
    }
    if len > max_body_size {
        return Err(ClientError::Validation(format!(
            "message body {len} bytes exceeds limit {max_body_size}"
        )));
    }
    Ok(())
}

/// Check batch members: non-empty, bounded count, one topic, no delay, no
/// retry topic, each member valid on its own.
pub fn check_batch(msgs: &[Message], max_body_size: usize) -> Result<()> {
    let first = msgs
        .first()
        .ok_or_else(|| ClientError::Validation("batch is empty".into()))?;

    if msgs.len() > MAX_MESSAGE_NUMBER_PER_BATCH {
        return Err(ClientError::Validation(format!(
            "batch of {} exceeds {} messages",
            msgs.len(),
            MAX_MESSAGE_NUMBER_PER_BATCH
        )));
    }

    for msg in msgs {
        if msg.topic() != first.topic() {
            return Err(ClientError::Validation(format!(
                "batch mixes topics {} and {}",
                first.topic(),
                msg.topic()
            )));
        }
        if msg.delay_time_level() > 0 {
            return Err(ClientError::Validation(
                "delayed messages are not supported in a batch".into(),
            ));
        }
        if msg.topic().starts_with(RETRY_GROUP_TOPIC_PREFIX) {
            return Err(ClientError::Validation(
                "retry topics are not supported in a batch".into(),
            ));
        }
        check_message(msg, max_body_size)?;
    }
    Ok(())
}
