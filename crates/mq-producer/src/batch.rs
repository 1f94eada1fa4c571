// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Batch framing.
//!
//! A batch travels as one logical message whose body is the concatenation of
//! its members, each framed as:
//!
//! ```text
//! total_size(i32) | magic(i32) | body_crc(u32) | flag(i32)
//! | body_len(i32) | body | properties_len(i16) | properties
//! ```
//!
//! All integers are big-endian.

use crate::error::{ClientError, Result};
use crate::message::{property, string_to_properties, Message};
use crate::util::create_uniq_id;
use crate::validator::check_batch;

/// Magic code written in every batch element.
pub const BATCH_ELEMENT_MAGIC: i32 = 0;

/// Fixed bytes per element, excluding body and properties.
const ELEMENT_OVERHEAD: usize = 4 + 4 + 4 + 4 + 4 + 2;

/// Validate `msgs`, stamp unique ids, and wrap them into one message.
///
/// Member properties are kept per element; the wrapper carries the topic
/// and the wait-store flag of the first member.
pub fn generate_batch(mut msgs: Vec<Message>, max_body_size: usize) -> Result<Message> {
    check_batch(&msgs, max_body_size)?;

    for msg in &mut msgs {
        if msg.unique_key().is_none() {
            msg.put_property(property::UNIQ_CLIENT_MESSAGE_ID_KEYIDX, create_uniq_id());
        }
    }

    let body = encode_batch(&msgs)?;
    let first = &msgs[0];
    let mut batch = Message::new(first.topic(), body);
    if !first.is_wait_store_msg_ok() {
        batch.put_property(property::WAIT_STORE_MSG_OK, "false");
    }

    let ids: Vec<&str> = msgs.iter().filter_map(Message::unique_key).collect();
    batch.put_property(property::UNIQ_CLIENT_MESSAGE_ID_KEYIDX, ids.join(","));
    Ok(batch)
}

/// Frame each message into one contiguous body.
pub fn encode_batch(msgs: &[Message]) -> Result<Vec<u8>> {
    let capacity = msgs
        .iter()
        .map(|m| ELEMENT_OVERHEAD + m.body().len() + m.properties_string().len())
        .sum();
    let mut out = Vec::with_capacity(capacity);

    for msg in msgs {
        let properties = msg.properties_string();
        let props_len = i16::try_from(properties.len()).map_err(|_| {
            ClientError::Validation(format!(
                "properties of {} bytes do not fit a batch element",
                properties.len()
            ))
        })?;
        let body = msg.body();
        let total = ELEMENT_OVERHEAD + body.len() + properties.len();

        out.extend_from_slice(&(total as i32).to_be_bytes());
        out.extend_from_slice(&BATCH_ELEMENT_MAGIC.to_be_bytes());
        out.extend_from_slice(&crc32fast::hash(body).to_be_bytes());
        out.extend_from_slice(&msg.flag().to_be_bytes());
        out.extend_from_slice(&(body.len() as i32).to_be_bytes());
        out.extend_from_slice(body);
        out.extend_from_slice(&props_len.to_be_bytes());
        out.extend_from_slice(properties.as_bytes());
    }
    Ok(out)
}

fn read_i32(buf: &[u8], pos: usize) -> Option<i32> {
    Some(i32::from_be_bytes(buf.get(pos..pos + 4)?.try_into().ok()?))
}

/// Split a framed batch body back into messages of `topic`.
///
/// Returns `None` on truncated input or a body CRC mismatch.
pub fn decode_batch(topic: &str, data: &[u8]) -> Option<Vec<Message>> {
    let mut msgs = Vec::new();
    let mut pos = 0;

    while pos < data.len() {
        let total = usize::try_from(read_i32(data, pos)?).ok()?;
        let element = data.get(pos..pos + total)?;

        let crc = read_i32(element, 8)? as u32;
        let flag = read_i32(element, 12)?;
        let body_len = usize::try_from(read_i32(element, 16)?).ok()?;
        let body = element.get(20..20 + body_len)?;
        if crc32fast::hash(body) != crc {
            return None;
        }

        let props_at = 20 + body_len;
        let props_len = i16::from_be_bytes(element.get(props_at..props_at + 2)?.try_into().ok()?);
        let props = element.get(props_at + 2..props_at + 2 + usize::try_from(props_len).ok()?)?;

        let mut msg = Message::new(topic, body.to_vec());
        msg.set_flag(flag);
        for (k, v) in string_to_properties(std::str::from_utf8(props).ok()?) {
            msg.put_property(k, v);
        }
        msgs.push(msg);
        pos += total;
    }
    Some(msgs)
}
