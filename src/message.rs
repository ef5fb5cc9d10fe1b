//! Message types and lifecycle states.
//!
//! A message is an entry in a channel's log. It is appended by a publish
//! (directly, or later by the scheduler when it was published with a delay)
//! and then moves through a consumer group:
//!
//! 1. A claim makes it pending for one consumer with `attempt = 1`
//! 2. An ack removes the pending entry
//! 3. A retry removes the pending entry and schedules a copy with `attempt + 1`
//! 4. Once the retry budget is spent the message is dead-lettered instead
//!
//! Dead-lettered messages can be requeued, which appends a fresh copy with the
//! attempt counter reset to 1.

use std::{fmt, str::FromStr, time::Duration};

use bytes::Bytes;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::{
    error::{Error, Result},
    utils,
};

/// Log position assigned when an entry is appended to a channel.
///
/// Ids are strictly increasing across the whole store and never reused, so
/// ordering by id is FIFO order within a channel.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, sqlx::Type,
)]
#[serde(transparent)]
#[sqlx(transparent)]
pub struct MessageId(pub i64);

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for MessageId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        s.parse::<i64>()
            .map(MessageId)
            .map_err(|e| Error::invalid_parameter(format!("message id {s:?}: {e}")))
    }
}

/// A delivered entry of a channel log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub channel: String,
    pub payload: Bytes,
    /// 1 on first delivery, incremented by every retry and every stale reclaim.
    pub attempt: u32,
    /// Present when the producer asked for effectively-once handling.
    pub dedup_key: Option<String>,
    /// Append time (Unix ms).
    pub created_at: i64,
}

impl Message {
    /// Decodes the payload as JSON.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_slice(&self.payload).map_err(|e| Error::InvalidPayload { source: e })
    }
}

/// Options accepted by publish.
///
/// `deliver_at` takes precedence over `delay` when both are set.
#[derive(Debug, Clone, Default, bon::Builder)]
pub struct PublishOptions {
    pub delay: Option<Duration>,
    pub deliver_at: Option<chrono::DateTime<chrono::Utc>>,
    #[builder(into)]
    pub dedup_key: Option<String>,
}

impl PublishOptions {
    /// Due time in Unix ms, or `None` for immediate delivery.
    pub(crate) fn due_at(&self, now_ms: i64) -> Option<i64> {
        match (self.deliver_at, self.delay) {
            (Some(at), _) => Some(at.timestamp_millis()),
            (None, Some(delay)) => Some(now_ms.saturating_add(utils::duration_ms(delay))),
            (None, None) => None,
        }
    }
}

/// Result of a publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PublishReceipt {
    /// Appended to the channel log with this id.
    Published(MessageId),
    /// Held in the timestamp index; it has no log id until it is promoted.
    Scheduled,
    /// Handed to this many in-process pub/sub subscribers; nothing was stored.
    Broadcast(usize),
}

impl PublishReceipt {
    pub fn id(&self) -> Option<MessageId> {
        match self {
            Self::Published(id) => Some(*id),
            Self::Scheduled | Self::Broadcast(_) => None,
        }
    }
}

impl fmt::Display for PublishReceipt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Published(id) => write!(f, "{id}"),
            Self::Scheduled => write!(f, "SCHEDULED"),
            Self::Broadcast(receivers) => write!(f, "BROADCAST({receivers})"),
        }
    }
}

/// Where a newly created consumer group starts reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StartFrom {
    /// Every entry still in the log (`"0"`).
    #[default]
    Beginning,
    /// Only entries appended after the group is created (`"$"`).
    Latest,
    /// Entries with an id greater than the given one.
    After(MessageId),
}

impl FromStr for StartFrom {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "0" | "" => Ok(Self::Beginning),
            "$" => Ok(Self::Latest),
            other => other.parse().map(Self::After),
        }
    }
}

impl fmt::Display for StartFrom {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Beginning => write!(f, "0"),
            Self::Latest => write!(f, "$"),
            Self::After(id) => write!(f, "{id}"),
        }
    }
}

/// State transition applied by an ack, retry or dead-letter call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum Settlement {
    Acked,
    /// Rescheduled; the copy will be delivered with `attempt` at `due_at` (Unix ms).
    Retried { attempt: u32, due_at: i64 },
    DeadLettered,
    /// The pending entry was reclaimed by another consumer; nothing changed.
    Stale,
    /// No pending entry with that id (already settled, or never claimed).
    Unknown,
    /// Fire-and-forget delivery, nothing to settle.
    Ephemeral,
}

/// Why a message ended up in the dead-letter collection.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum DeadLetterReason {
    /// The handler failed on the last allowed attempt.
    MaxRetriesExceeded,
    /// The handler asked for the message to be dead-lettered.
    Rejected,
    /// A stale pending entry was reclaimed after its last allowed attempt.
    AbandonedOnReclaim,
}

/// A permanently failed message plus failure metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    /// Position in the dead-letter collection.
    pub id: i64,
    /// Log id the message had when it failed.
    pub message_id: MessageId,
    pub channel: String,
    pub group: String,
    pub payload: Bytes,
    pub attempts: u32,
    pub reason: DeadLetterReason,
    pub last_error: Option<String>,
    pub dedup_key: Option<String>,
    pub failed_at: chrono::DateTime<chrono::Utc>,
}

/// Selects dead-letter entries for listing or requeue. Empty matches everything.
#[derive(Debug, Clone, Default, Serialize, Deserialize, bon::Builder)]
pub struct DeadLetterFilter {
    #[builder(into)]
    pub channel: Option<String>,
    #[builder(into)]
    pub group: Option<String>,
    /// Dead-letter entry ids.
    #[serde(default)]
    #[builder(default)]
    pub ids: Vec<i64>,
    pub limit: Option<u32>,
}
