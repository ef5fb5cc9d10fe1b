use tracing::{info, instrument};

use super::Engine;
use crate::{
    db::{dead_letter::DeadLetterRow, entry::LogEntry},
    error::Result,
    message::{DeadLetterEntry, DeadLetterFilter},
    utils,
};

impl Engine {
    /// Dead-letter entries matching `filter`, oldest first.
    pub async fn list_dead_letters(&self, filter: &DeadLetterFilter) -> Result<Vec<DeadLetterEntry>> {
        let mut conn = self.store().db().acquire().await?;

        DeadLetterRow::list(&mut conn, filter)
            .await?
            .into_iter()
            .map(DeadLetterEntry::try_from)
            .collect()
    }

    /// Moves matching dead-letter entries back into their channel logs.
    ///
    /// Each one is appended as a new entry with `attempt = 1` that only the
    /// group it failed in will see. Returns how many were requeued.
    #[instrument(skip(self))]
    pub async fn requeue_from_dlq(&self, filter: &DeadLetterFilter) -> Result<u64> {
        let now = utils::now_ms();
        let mut tx = self.store().script().await?;

        let rows = DeadLetterRow::list(&mut *tx, filter).await?;
        if rows.is_empty() {
            return Ok(0);
        }

        let mut requeued = 0u64;

        for row in rows {
            if !DeadLetterRow::delete(&mut *tx, row.id).await? {
                continue;
            }

            LogEntry::append(
                &mut *tx,
                &row.channel,
                &row.payload,
                1,
                row.dedup_key.as_deref(),
                Some(&row.grp),
                now,
            )
            .await?;

            requeued += 1;
        }

        tx.commit().await?;
        self.appended().notify_waiters();

        info!(requeued, "requeued dead letters");
        Ok(requeued)
    }
}
