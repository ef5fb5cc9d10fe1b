//! The message lifecycle engine.
//!
//! Every state transition (publish, claim, ack, retry, dead-letter, requeue,
//! promotion of due scheduled entries) runs as one store script, so racing
//! processes sharing the database never observe a half-applied transition.

use std::sync::{Arc, Mutex};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use snafu::ResultExt;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use crate::{
    config::Config,
    db::{
        dead_letter::DeadLetterRow, entry::LogEntry, group::ConsumerGroup, pending::PendingEntry,
        scheduled::ScheduledEntry,
    },
    dedup::Dedup,
    error::{Error, InvalidPayloadSnafu, Result},
    fanout::{self, Fanout},
    message::{Message, MessageId, PublishOptions, PublishReceipt},
    middleware::{Middleware, Pipeline},
    scheduler::{Scheduler, SchedulerHandle},
    store::Store,
    utils,
};

mod dlq;
mod lifecycle;

pub(crate) use lifecycle::{Failure, Fence};

/// Per-channel counters for operators.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChannelStats {
    pub channel: String,
    pub log_length: u64,
    pub scheduled: u64,
    pub dead_letters: u64,
    pub groups: Vec<GroupStats>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GroupStats {
    pub name: String,
    pub cursor: MessageId,
    pub pending: u64,
    pub max_retries: u32,
}

struct Inner {
    store: Store,
    dedup: Dedup,
    config: Config,
    pipeline: Pipeline,
    fanout: Fanout,
    /// Woken after every local append so blocked claims re-check immediately.
    appended: Notify,
    scheduler: Mutex<Option<SchedulerHandle>>,
}

/// Handle to the engine. Cheap to clone; clones share the store connection,
/// middleware list and pub/sub registry.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<Inner>,
}

impl Engine {
    pub async fn connect() -> Result<Self> {
        Self::connect_with(Config::default()).await
    }

    pub async fn connect_with(config: Config) -> Result<Self> {
        let store = Store::connect(&config).await?;
        let dedup = Dedup::new(store.db().clone());

        let engine = Self {
            inner: Arc::new(Inner {
                store,
                dedup,
                config,
                pipeline: Pipeline::default(),
                fanout: Fanout::default(),
                appended: Notify::new(),
                scheduler: Mutex::new(None),
            }),
        };

        if engine.config().embedded_scheduler {
            let handle = Scheduler::new(&engine).spawn(CancellationToken::new());
            *engine
                .inner
                .scheduler
                .lock()
                .unwrap_or_else(|e| e.into_inner()) = Some(handle);
        }

        Ok(engine)
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn store(&self) -> &Store {
        &self.inner.store
    }

    pub fn dedup(&self) -> &Dedup {
        &self.inner.dedup
    }

    pub(crate) fn pipeline(&self) -> &Pipeline {
        &self.inner.pipeline
    }

    pub(crate) fn fanout(&self) -> &Fanout {
        &self.inner.fanout
    }

    pub(crate) fn appended(&self) -> &Notify {
        &self.inner.appended
    }

    /// Registers a middleware. Hooks run in registration order.
    pub fn use_middleware(&self, middleware: impl Middleware) {
        self.inner.pipeline.push(Arc::new(middleware));
    }

    /// Publishes a JSON-serialized payload. Nothing is written if serialization fails.
    pub async fn publish_json<T: Serialize + ?Sized>(
        &self,
        channel: &str,
        payload: &T,
        opts: PublishOptions,
    ) -> Result<PublishReceipt> {
        let payload = serde_json::to_vec(payload).context(InvalidPayloadSnafu)?;
        self.publish(channel, payload, opts).await
    }

    /// Appends to the channel log, or to the timestamp index when a delay or
    /// delivery time is set.
    #[instrument(skip(self, payload, opts), err(level = "warn"))]
    pub async fn publish(
        &self,
        channel: &str,
        payload: impl Into<Bytes>,
        opts: PublishOptions,
    ) -> Result<PublishReceipt> {
        validate_channel(channel)?;
        let payload = payload.into();

        self.pipeline().before_publish(channel, &payload);

        let now = utils::now_ms();
        let mut conn = self.store().db().acquire().await?;

        let receipt = match opts.due_at(now) {
            None => {
                let id = LogEntry::append(
                    &mut conn,
                    channel,
                    &payload,
                    1,
                    opts.dedup_key.as_deref(),
                    None,
                    now,
                )
                .await?;
                self.appended().notify_waiters();

                debug!(%id, "published");
                PublishReceipt::Published(id)
            }
            Some(due_at) => {
                let entry = ScheduledEntry::insert(
                    &mut conn,
                    channel,
                    &payload,
                    due_at,
                    1,
                    opts.dedup_key.as_deref(),
                    None,
                )
                .await?;

                debug!(entry, due_at, "scheduled");
                PublishReceipt::Scheduled
            }
        };

        self.pipeline().after_publish(channel, &receipt);

        Ok(receipt)
    }

    /// Fire-and-forget delivery to in-process pub/sub subscribers.
    ///
    /// Returns the number of subscribers that accepted the message.
    pub fn broadcast(&self, channel: &str, payload: impl Into<Bytes>) -> Result<usize> {
        validate_channel(channel)?;
        let payload = payload.into();

        self.pipeline().before_publish(channel, &payload);
        let delivered = self.fanout().broadcast(channel, payload);
        self.pipeline()
            .after_publish(channel, &PublishReceipt::Broadcast(delivered));

        Ok(delivered)
    }

    /// Range read of a channel log in id order, starting after `after`.
    ///
    /// Entries are reported with the attempt they were appended with.
    ///
    /// Shared entries stay in the log after a group acks or dead-letters them,
    /// since other groups read the same entries. Only group-scoped retry and
    /// requeue copies leave the log when settled. Dead-lettered messages are
    /// inspected through [`Engine::list_dead_letters`].
    pub async fn range(
        &self,
        channel: &str,
        after: Option<MessageId>,
        limit: u32,
    ) -> Result<Vec<Message>> {
        let mut conn = self.store().db().acquire().await?;

        Ok(
            LogEntry::range(&mut conn, channel, after.map(|id| id.0).unwrap_or(0), limit)
                .await?
                .into_iter()
                .map(|entry| {
                    let attempt = u32::try_from(entry.attempt).unwrap_or(1);
                    entry.into_message(attempt)
                })
                .collect(),
        )
    }

    /// Counters for `channel`. `log_length` counts entries as [`Engine::range`] sees them.
    pub async fn stats(&self, channel: &str) -> Result<ChannelStats> {
        let mut conn = self.store().db().acquire().await?;

        let log_length = LogEntry::count(&mut conn, channel).await?;
        let scheduled = ScheduledEntry::count(&mut conn, channel).await?;
        let dead_letters = DeadLetterRow::count(&mut conn, channel).await?;

        let mut groups = Vec::new();
        for group in ConsumerGroup::list(&mut conn, channel).await? {
            let pending = PendingEntry::count(&mut conn, channel, &group.name).await?;
            groups.push(GroupStats {
                cursor: MessageId(group.cursor),
                pending: pending as u64,
                max_retries: u32::try_from(group.max_retries).unwrap_or(u32::MAX),
                name: group.name,
            });
        }

        Ok(ChannelStats {
            channel: channel.to_owned(),
            log_length: log_length as u64,
            scheduled: scheduled as u64,
            dead_letters: dead_letters as u64,
            groups,
        })
    }

    /// Stops the embedded scheduler and closes the store connection pool.
    /// Running subscriptions should be stopped first.
    ///
    /// The embedded scheduler holds a clone of the engine, so it keeps running
    /// until this is called or the runtime shuts down.
    pub async fn close(&self) {
        let scheduler = self
            .inner
            .scheduler
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();

        if let Some(scheduler) = scheduler {
            scheduler.shutdown().await;
        }

        self.store().close().await;
    }
}

fn validate_channel(channel: &str) -> Result<()> {
    if channel.is_empty() {
        return Err(Error::invalid_parameter("channel cannot be empty"));
    }

    if fanout::is_pattern(channel) {
        return Err(Error::invalid_parameter(format!(
            "cannot publish to pattern {channel:?}"
        )));
    }

    Ok(())
}
