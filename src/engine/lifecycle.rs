//! Claim, ack, retry, dead-letter and reclaim.

use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::Engine;
use crate::{
    db::{
        dead_letter::{DeadLetterRow, NewDeadLetter},
        entry::LogEntry,
        group::ConsumerGroup,
        pending::PendingEntry,
        scheduled::ScheduledEntry,
    },
    error::Result,
    message::{DeadLetterReason, Message, MessageId, Settlement, StartFrom},
    utils,
};

/// The claim a settlement is issued under.
///
/// A reclaim hands the entry to another consumer and bumps its attempt, so a
/// handler still holding the old claim no longer matches and its settlement
/// is rejected as [`Settlement::Stale`].
#[derive(Debug, Clone, Copy)]
pub(crate) struct Fence<'a> {
    pub consumer: &'a str,
    pub attempt: u32,
}

impl Fence<'_> {
    fn holds(&self, pending: &PendingEntry) -> bool {
        pending.consumer == self.consumer && pending.attempt() == self.attempt
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum Failure<'a> {
    /// Reschedule after `backoff` unless the retry budget is spent.
    Retry {
        backoff: Duration,
        error: Option<&'a str>,
    },
    DeadLetter {
        reason: DeadLetterReason,
        error: Option<&'a str>,
    },
}

impl Engine {
    /// Creates the group if needed and sets its retry ceiling.
    ///
    /// `start_from` only matters when the group is created.
    #[instrument(skip(self))]
    pub async fn ensure_group(
        &self,
        channel: &str,
        group: &str,
        start_from: StartFrom,
        max_retries: u32,
    ) -> Result<ConsumerGroup> {
        let mut tx = self.store().script().await?;

        let mut existing = ConsumerGroup::ensure(
            &mut *tx,
            channel,
            group,
            start_from,
            max_retries,
            utils::now_ms(),
        )
        .await?;

        if existing.max_retries != max_retries as i64 {
            ConsumerGroup::set_max_retries(&mut *tx, channel, group, max_retries).await?;
            existing.max_retries = max_retries as i64;
        }

        tx.commit().await?;

        Ok(existing)
    }

    /// Claims up to `batch_size` new entries for `consumer`, waiting up to
    /// `block` for entries to arrive. An empty batch means the wait timed out.
    pub async fn claim(
        &self,
        channel: &str,
        group: &str,
        consumer: &str,
        batch_size: u32,
        block: Duration,
    ) -> Result<Vec<Message>> {
        self.claim_until(channel, group, consumer, batch_size, block, None)
            .await
    }

    /// Like [`Engine::claim`], but `cancel` cuts the wait short.
    ///
    /// Only the wait between attempts is interrupted. A claim script that has
    /// started always runs to completion, so committed claims are returned
    /// rather than dropped.
    pub(crate) async fn claim_until(
        &self,
        channel: &str,
        group: &str,
        consumer: &str,
        batch_size: u32,
        block: Duration,
        cancel: Option<&CancellationToken>,
    ) -> Result<Vec<Message>> {
        let deadline = Instant::now() + block;

        loop {
            let appended = self.appended().notified();
            tokio::pin!(appended);
            appended.as_mut().enable();

            let messages = self.claim_now(channel, group, consumer, batch_size).await?;

            let now = Instant::now();
            if !messages.is_empty() || now >= deadline {
                return Ok(messages);
            }

            // Appends from other processes do not notify, so poll as well.
            let wait = (deadline - now).min(self.config().claim_poll_interval());
            let cancelled = async {
                match cancel {
                    Some(cancel) => cancel.cancelled().await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                _ = cancelled => return Ok(Vec::new()),
                _ = tokio::time::timeout(wait, appended) => {}
            }
        }
    }

    #[instrument(skip(self), level = "trace")]
    async fn claim_now(
        &self,
        channel: &str,
        group: &str,
        consumer: &str,
        batch_size: u32,
    ) -> Result<Vec<Message>> {
        if batch_size == 0 {
            return Ok(Vec::new());
        }

        let now = utils::now_ms();
        let mut tx = self.store().script().await?;

        let grp = ConsumerGroup::ensure(
            &mut *tx,
            channel,
            group,
            self.config().start_from(),
            self.config().max_retries,
            now,
        )
        .await?;

        let entries =
            LogEntry::next_for_group(&mut *tx, channel, group, grp.cursor, batch_size).await?;

        let mut messages = Vec::with_capacity(entries.len());
        let mut cursor = grp.cursor;

        for entry in entries {
            let id = MessageId(entry.id);
            let attempt = u32::try_from(entry.attempt).unwrap_or(1).max(1);

            PendingEntry::insert(&mut *tx, channel, group, id, consumer, attempt, now).await?;

            cursor = cursor.max(entry.id);
            messages.push(entry.into_message(attempt));
        }

        if cursor != grp.cursor {
            ConsumerGroup::advance(&mut *tx, channel, group, cursor).await?;
        }

        // Commit even when nothing was claimed so a lazily created group persists.
        tx.commit().await?;

        if !messages.is_empty() {
            debug!(channel, group, consumer, claimed = messages.len(), "claimed batch");
        }

        Ok(messages)
    }

    /// Removes the pending entry. Acking an unknown or already settled id is a no-op.
    #[instrument(skip(self))]
    pub async fn ack(&self, channel: &str, group: &str, id: MessageId) -> Result<Settlement> {
        let mut tx = self.store().script().await?;

        if !PendingEntry::delete(&mut *tx, channel, group, id).await? {
            return Ok(Settlement::Unknown);
        }

        LogEntry::purge_scoped(&mut *tx, id, group).await?;

        tx.commit().await?;

        debug!("acked");
        Ok(Settlement::Acked)
    }

    /// Reschedules the message with `attempt + 1` after `backoff`, or
    /// dead-letters it once the group's retry ceiling is reached.
    pub async fn retry(
        &self,
        channel: &str,
        group: &str,
        id: MessageId,
        backoff: Duration,
    ) -> Result<Settlement> {
        self.fail(
            channel,
            group,
            id,
            None,
            Failure::Retry {
                backoff,
                error: None,
            },
        )
        .await
    }

    /// Like [`Engine::retry`], recording `error` if the message ends up dead-lettered.
    pub async fn retry_with_error(
        &self,
        channel: &str,
        group: &str,
        id: MessageId,
        backoff: Duration,
        error: &str,
    ) -> Result<Settlement> {
        self.fail(
            channel,
            group,
            id,
            None,
            Failure::Retry {
                backoff,
                error: Some(error),
            },
        )
        .await
    }

    /// Moves the message to the dead-letter collection regardless of its attempt.
    pub async fn dead_letter(
        &self,
        channel: &str,
        group: &str,
        id: MessageId,
        error: &str,
    ) -> Result<Settlement> {
        self.fail(
            channel,
            group,
            id,
            None,
            Failure::DeadLetter {
                reason: DeadLetterReason::Rejected,
                error: Some(error),
            },
        )
        .await
    }

    #[instrument(skip(self, fence, failure))]
    pub(crate) async fn fail(
        &self,
        channel: &str,
        group: &str,
        id: MessageId,
        fence: Option<Fence<'_>>,
        failure: Failure<'_>,
    ) -> Result<Settlement> {
        let now = utils::now_ms();
        let mut tx = self.store().script().await?;

        let Some(pending) = PendingEntry::get(&mut *tx, channel, group, id).await? else {
            return Ok(Settlement::Unknown);
        };

        if let Some(fence) = fence {
            if !fence.holds(&pending) {
                debug!(
                    owner = %pending.consumer,
                    current_attempt = pending.attempt,
                    "settlement from a superseded claim ignored"
                );
                return Ok(Settlement::Stale);
            }
        }

        let Some(entry) = LogEntry::get(&mut *tx, id).await? else {
            PendingEntry::delete(&mut *tx, channel, group, id).await?;
            tx.commit().await?;

            warn!("pending entry had no log entry, dropped");
            return Ok(Settlement::Unknown);
        };

        let max_retries = ConsumerGroup::get(&mut *tx, channel, group)
            .await?
            .map(|g| u32::try_from(g.max_retries).unwrap_or(u32::MAX))
            .unwrap_or(self.config().max_retries);

        let attempt = pending.attempt();

        let (reason, error) = match failure {
            Failure::Retry { backoff, .. } if attempt <= max_retries => {
                let next = attempt.saturating_add(1);
                let due_at = now.saturating_add(utils::duration_ms(backoff));

                ScheduledEntry::insert(
                    &mut *tx,
                    channel,
                    &entry.payload,
                    due_at,
                    next,
                    entry.dedup_key.as_deref(),
                    Some(group),
                )
                .await?;

                PendingEntry::delete(&mut *tx, channel, group, id).await?;
                LogEntry::purge_scoped(&mut *tx, id, group).await?;

                tx.commit().await?;

                debug!(attempt = next, due_at, "rescheduled");
                return Ok(Settlement::Retried {
                    attempt: next,
                    due_at,
                });
            }
            Failure::Retry { error, .. } => (DeadLetterReason::MaxRetriesExceeded, error),
            Failure::DeadLetter { reason, error } => (reason, error),
        };

        DeadLetterRow::insert(
            &mut *tx,
            NewDeadLetter {
                message_id: id,
                channel,
                group,
                payload: &entry.payload,
                attempts: attempt,
                reason,
                last_error: error,
                dedup_key: entry.dedup_key.as_deref(),
            },
            now,
        )
        .await?;

        PendingEntry::delete(&mut *tx, channel, group, id).await?;
        LogEntry::purge_scoped(&mut *tx, id, group).await?;

        tx.commit().await?;

        warn!(attempt, %reason, error, "dead-lettered");
        Ok(Settlement::DeadLettered)
    }

    /// Reassigns entries left pending longer than `min_idle` to `consumer`.
    ///
    /// Each reclaimed entry counts as a failed attempt: it comes back with
    /// `attempt + 1`, or is dead-lettered when the retry ceiling is reached.
    #[instrument(skip(self))]
    pub async fn reclaim_stale(
        &self,
        channel: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: u32,
    ) -> Result<Vec<Message>> {
        if count == 0 {
            return Ok(Vec::new());
        }

        let now = utils::now_ms();
        let min_idle_ms = utils::duration_ms(min_idle);
        let mut tx = self.store().script().await?;

        let Some(grp) = ConsumerGroup::get(&mut *tx, channel, group).await? else {
            return Ok(Vec::new());
        };
        let max_retries = u32::try_from(grp.max_retries).unwrap_or(u32::MAX);

        let stale = PendingEntry::stale(
            &mut *tx,
            channel,
            group,
            now.saturating_sub(min_idle_ms),
            count,
        )
        .await?;

        let mut messages = Vec::with_capacity(stale.len());
        let mut abandoned = 0usize;

        for pending in stale {
            let id = MessageId(pending.entry_id);
            let attempt = pending.attempt();

            let Some(entry) = LogEntry::get(&mut *tx, id).await? else {
                PendingEntry::delete(&mut *tx, channel, group, id).await?;
                continue;
            };

            if attempt > max_retries {
                let error = format!(
                    "consumer {} did not settle attempt {attempt} within {min_idle_ms}ms",
                    pending.consumer
                );

                DeadLetterRow::insert(
                    &mut *tx,
                    NewDeadLetter {
                        message_id: id,
                        channel,
                        group,
                        payload: &entry.payload,
                        attempts: attempt,
                        reason: DeadLetterReason::AbandonedOnReclaim,
                        last_error: Some(error.as_str()),
                        dedup_key: entry.dedup_key.as_deref(),
                    },
                    now,
                )
                .await?;

                PendingEntry::delete(&mut *tx, channel, group, id).await?;
                LogEntry::purge_scoped(&mut *tx, id, group).await?;

                abandoned += 1;
                continue;
            }

            let next = attempt.saturating_add(1);
            PendingEntry::reassign(&mut *tx, channel, group, id, consumer, next, now).await?;
            messages.push(entry.into_message(next));
        }

        tx.commit().await?;

        if !messages.is_empty() || abandoned > 0 {
            info!(
                reclaimed = messages.len(),
                abandoned, "reclaimed stale pending entries"
            );
        }

        Ok(messages)
    }

    /// Moves up to `batch_size` due entries from the timestamp index into
    /// their channel logs, in due order. Returns how many were promoted.
    ///
    /// Removal and append happen in the same script, so two schedulers racing
    /// on one store never promote an entry twice and never lose one.
    pub async fn promote_due(&self, batch_size: u32) -> Result<usize> {
        let now = utils::now_ms();
        let mut tx = self.store().script().await?;

        let due = ScheduledEntry::due(&mut *tx, now, batch_size).await?;
        if due.is_empty() {
            return Ok(0);
        }

        for entry in &due {
            ScheduledEntry::delete(&mut *tx, entry.id).await?;

            LogEntry::append(
                &mut *tx,
                &entry.channel,
                &entry.payload,
                u32::try_from(entry.attempt).unwrap_or(1).max(1),
                entry.dedup_key.as_deref(),
                entry.scope.as_deref(),
                now,
            )
            .await?;
        }

        tx.commit().await?;
        self.appended().notify_waiters();

        debug!(promoted = due.len(), "promoted due entries");
        Ok(due.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::Config, message::PublishOptions};

    fn pending(consumer: &str, attempt: i64) -> PendingEntry {
        PendingEntry {
            channel: "orders".to_owned(),
            grp: "billing".to_owned(),
            entry_id: 1,
            consumer: consumer.to_owned(),
            claimed_at: 0,
            attempt,
        }
    }

    #[test]
    fn fence_requires_same_consumer_and_attempt() {
        let fence = Fence {
            consumer: "c1",
            attempt: 1,
        };

        assert!(fence.holds(&pending("c1", 1)));
        assert!(!fence.holds(&pending("c1", 2)));
        assert!(!fence.holds(&pending("c2", 1)));
    }

    #[tokio::test]
    async fn superseded_claim_cannot_settle() {
        let tmpdir = tempfile::tempdir().unwrap();
        let engine = Engine::connect_with(Config {
            db_path: Some(tmpdir.path().join("relaymq.db").to_string_lossy().to_string()),
            embedded_scheduler: false,
            ..Default::default()
        })
        .await
        .unwrap();

        engine
            .publish("orders", "o-1", PublishOptions::default())
            .await
            .unwrap();

        let claimed = engine
            .claim("orders", "billing", "c1", 1, Duration::ZERO)
            .await
            .unwrap();
        let id = claimed[0].id;

        let reclaimed = engine
            .reclaim_stale("orders", "billing", "c2", Duration::ZERO, 10)
            .await
            .unwrap();
        assert_eq!(reclaimed.len(), 1);
        assert_eq!(reclaimed[0].attempt, 2);

        let old = Fence {
            consumer: "c1",
            attempt: 1,
        };

        let retried = engine
            .fail(
                "orders",
                "billing",
                id,
                Some(old),
                Failure::Retry {
                    backoff: Duration::ZERO,
                    error: Some("late failure"),
                },
            )
            .await
            .unwrap();
        assert_eq!(retried, Settlement::Stale);

        let rejected = engine
            .fail(
                "orders",
                "billing",
                id,
                Some(old),
                Failure::DeadLetter {
                    reason: DeadLetterReason::Rejected,
                    error: Some("late rejection"),
                },
            )
            .await
            .unwrap();
        assert_eq!(rejected, Settlement::Stale);

        let mut conn = engine.store().db().acquire().await.unwrap();
        let current = PendingEntry::get(&mut conn, "orders", "billing", id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(current.consumer, "c2");
        assert_eq!(current.attempt(), 2);
        drop(conn);

        let stats = engine.stats("orders").await.unwrap();
        assert_eq!(stats.scheduled, 0);
        assert_eq!(stats.dead_letters, 0);

        // The current owner still settles normally.
        let current = Fence {
            consumer: "c2",
            attempt: 2,
        };
        let settled = engine
            .fail(
                "orders",
                "billing",
                id,
                Some(current),
                Failure::Retry {
                    backoff: Duration::ZERO,
                    error: None,
                },
            )
            .await
            .unwrap();
        assert!(matches!(settled, Settlement::Retried { attempt: 3, .. }));
    }
}
