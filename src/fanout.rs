//! Best-effort in-process broadcast.
//!
//! Subscribers register a channel pattern and receive every broadcast whose
//! channel matches at publish time. Nothing is persisted, retried or acked; a
//! subscriber whose buffer is full misses the message.

use std::{
    fmt,
    sync::{
        atomic::{AtomicI64, AtomicU64, Ordering},
        Arc,
    },
};

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::debug;

use crate::{
    error::{Error, Result},
    message::{Message, MessageId},
    utils,
};

const SEPARATOR: char = '.';
const WILDCARD_SINGLE: &str = "*";
const WILDCARD_MULTI: &str = ">";

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    /// `*`: exactly one segment.
    Single,
    /// `>`: the remaining segments, possibly none. Only valid last.
    Multi,
}

/// Dot-separated channel pattern.
///
/// `"orders.*"` matches `"orders.created"` but not `"orders.us.created"`;
/// `"orders.>"` matches `"orders"`, `"orders.created"` and `"orders.us.created"`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelPattern {
    segments: Vec<Segment>,
    original: String,
}

impl ChannelPattern {
    pub fn new(pattern: impl Into<String>) -> Result<Self> {
        let original = pattern.into();

        if original.is_empty() {
            return Err(Error::invalid_parameter("pattern cannot be empty"));
        }

        let parts: Vec<&str> = original.split(SEPARATOR).collect();
        let mut segments = Vec::with_capacity(parts.len());

        for (i, part) in parts.iter().enumerate() {
            if matches!(segments.last(), Some(Segment::Multi)) {
                return Err(Error::invalid_parameter(format!(
                    "'{WILDCARD_MULTI}' must be the last segment of {original:?}"
                )));
            }

            let segment = match *part {
                "" => {
                    return Err(Error::invalid_parameter(format!(
                        "empty segment at position {i} of {original:?}"
                    )))
                }
                WILDCARD_SINGLE => Segment::Single,
                WILDCARD_MULTI => Segment::Multi,
                literal if literal.contains('*') || literal.contains('>') => {
                    return Err(Error::invalid_parameter(format!(
                        "wildcards must be standalone segments, found {literal:?}"
                    )))
                }
                literal => Segment::Literal(literal.to_owned()),
            };

            segments.push(segment);
        }

        Ok(Self { segments, original })
    }

    pub fn has_wildcards(&self) -> bool {
        self.segments
            .iter()
            .any(|s| matches!(s, Segment::Single | Segment::Multi))
    }

    pub fn matches(&self, channel: &str) -> bool {
        let parts: Vec<&str> = channel.split(SEPARATOR).collect();
        let mut idx = 0;

        for segment in &self.segments {
            match segment {
                Segment::Multi => return true,
                Segment::Single => {
                    if idx >= parts.len() || parts[idx].is_empty() {
                        return false;
                    }
                }
                Segment::Literal(lit) => {
                    if parts.get(idx) != Some(&lit.as_str()) {
                        return false;
                    }
                }
            }
            idx += 1;
        }

        idx == parts.len()
    }

    pub fn as_str(&self) -> &str {
        &self.original
    }
}

impl fmt::Display for ChannelPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.original)
    }
}

/// Whether a subscription channel uses wildcard syntax.
pub fn is_pattern(channel: &str) -> bool {
    channel.contains('*') || channel.contains('>')
}

struct Subscriber {
    pattern: ChannelPattern,
    tx: mpsc::Sender<Message>,
}

/// Registry of pub/sub subscribers.
#[derive(Default)]
pub(crate) struct Fanout {
    subscribers: papaya::HashMap<u64, Arc<Subscriber>>,
    next_subscriber: AtomicU64,
    next_message: AtomicI64,
}

impl Fanout {
    pub fn register(&self, pattern: ChannelPattern, capacity: usize) -> (u64, mpsc::Receiver<Message>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let id = self.next_subscriber.fetch_add(1, Ordering::Relaxed);

        self.subscribers
            .pin()
            .insert(id, Arc::new(Subscriber { pattern, tx }));

        (id, rx)
    }

    pub fn unregister(&self, id: u64) {
        self.subscribers.pin().remove(&id);
    }

    /// Delivers to every matching subscriber and returns how many accepted it.
    pub fn broadcast(&self, channel: &str, payload: Bytes) -> usize {
        let message = Message {
            id: MessageId(self.next_message.fetch_add(1, Ordering::Relaxed) + 1),
            channel: channel.to_owned(),
            payload,
            attempt: 1,
            dedup_key: None,
            created_at: utils::now_ms(),
        };

        let subscribers = self.subscribers.pin();
        let mut delivered = 0;

        for (id, subscriber) in subscribers.iter() {
            if !subscriber.pattern.matches(channel) {
                continue;
            }

            match subscriber.tx.try_send(message.clone()) {
                Ok(()) => delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    debug!(subscriber = id, channel, "pub/sub subscriber lagging, message dropped");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {}
            }
        }

        delivered
    }
}
