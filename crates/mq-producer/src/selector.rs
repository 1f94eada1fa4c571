// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! User queue selectors.
//!
//! A selector replaces fault-aware selection: it sees the writable queues
//! of the topic, the message and a caller-supplied argument, and its answer
//! is used as is. Typical use is ordered delivery, hashing a business key
//! so related messages share a queue.
//!
//! ```
//! use mq_producer::{Message, MessageQueue, MessageQueueSelector};
//!
//! let by_order_id = |mqs: &[MessageQueue], _msg: &Message, id: &u64| {
//!     mqs.get((*id % mqs.len() as u64) as usize).cloned()
//! };
//! let mqs = vec![MessageQueue::new("orders", "broker-a", 0), MessageQueue::new("orders", "broker-a", 1)];
//! let msg = Message::new("orders", b"paid".to_vec());
//! assert_eq!(by_order_id.select(&mqs, &msg, &7).map(|q| q.queue_id), Some(1));
//! ```

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use crate::message::{Message, MessageQueue};

/// Picks the queue for a message given a typed argument.
pub trait MessageQueueSelector<A: ?Sized>: Send + Sync {
    fn select(&self, mqs: &[MessageQueue], msg: &Message, arg: &A) -> Option<MessageQueue>;
}

impl<A: ?Sized, F> MessageQueueSelector<A> for F
where
    F: Fn(&[MessageQueue], &Message, &A) -> Option<MessageQueue> + Send + Sync,
{
    fn select(&self, mqs: &[MessageQueue], msg: &Message, arg: &A) -> Option<MessageQueue> {
        self(mqs, msg, arg)
    }
}

/// Same argument, same queue (while the route is unchanged).
#[derive(Debug, Default, Clone, Copy)]
pub struct SelectByHash;

impl<A: Hash + ?Sized> MessageQueueSelector<A> for SelectByHash {
    fn select(&self, mqs: &[MessageQueue], _msg: &Message, arg: &A) -> Option<MessageQueue> {
        if mqs.is_empty() {
            return None;
        }
        let mut hasher = DefaultHasher::new();
        arg.hash(&mut hasher);
        mqs.get((hasher.finish() % mqs.len() as u64) as usize).cloned()
    }
}

/// Uniformly random queue; the argument is ignored.
#[derive(Debug, Default, Clone, Copy)]
pub struct SelectByRandom;

impl<A: ?Sized> MessageQueueSelector<A> for SelectByRandom {
    fn select(&self, mqs: &[MessageQueue], _msg: &Message, _arg: &A) -> Option<MessageQueue> {
        if mqs.is_empty() {
            return None;
        }
        mqs.get(fastrand::usize(..mqs.len())).cloned()
    }
}
