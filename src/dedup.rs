//! Idempotency-key markers for effectively-once processing.
//!
//! A key is marked only after the message carrying it was processed and
//! acked. Any later delivery of a message with the same key to the same
//! consumer group, including a redelivery of the very same entry whose ack
//! was lost, is skipped. Markers are scoped to `(channel, group)`, so other
//! groups still process their own first delivery.

use std::time::Duration;

use sqlx::SqlitePool;
use tracing::debug;

use crate::{db::dedup::DedupMarker, error::Result, utils};

#[derive(Clone)]
pub struct Dedup {
    db: SqlitePool,
}

impl Dedup {
    pub(crate) fn new(db: SqlitePool) -> Self {
        Self { db }
    }

    /// `false` for keys never marked and for markers past their retention.
    pub async fn is_processed(&self, channel: &str, group: &str, key: &str) -> Result<bool> {
        let mut conn = self.db.acquire().await?;
        DedupMarker::exists(&mut conn, channel, group, key, utils::now_ms()).await
    }

    /// Marks `key` as processed for `ttl`. Marking again extends the retention.
    pub async fn mark_processed(
        &self,
        channel: &str,
        group: &str,
        key: &str,
        ttl: Duration,
    ) -> Result<()> {
        let expires_at = utils::now_ms().saturating_add(utils::duration_ms(ttl));
        let mut conn = self.db.acquire().await?;
        DedupMarker::upsert(&mut conn, channel, group, key, expires_at).await?;

        debug!(channel, group, key, expires_at, "dedup key marked");
        Ok(())
    }

    pub async fn purge_expired(&self) -> Result<u64> {
        let mut conn = self.db.acquire().await?;
        DedupMarker::purge_expired(&mut conn, utils::now_ms()).await
    }
}
