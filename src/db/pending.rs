use serde::{Deserialize, Serialize};
use sqlx::{prelude::FromRow, SqliteConnection};

use crate::{error::Result, message::MessageId};

/// A claimed-but-unsettled entry in a group's pending list.
#[derive(Serialize, Deserialize, FromRow, Debug, Clone, PartialEq)]
pub struct PendingEntry {
    pub channel: String,
    pub grp: String,
    pub entry_id: i64,
    pub consumer: String,
    pub claimed_at: i64,
    pub attempt: i64,
}

impl PendingEntry {
    pub fn attempt(&self) -> u32 {
        u32::try_from(self.attempt).unwrap_or(u32::MAX)
    }

    pub async fn insert(
        db: &mut SqliteConnection,
        channel: &str,
        group: &str,
        id: MessageId,
        consumer: &str,
        attempt: u32,
        now: i64,
    ) -> Result<()> {
        sqlx::query(
            "
            INSERT INTO pending (channel, grp, entry_id, consumer, claimed_at, attempt)
            VALUES ($1, $2, $3, $4, $5, $6)
            ",
        )
        .bind(channel)
        .bind(group)
        .bind(id.0)
        .bind(consumer)
        .bind(now)
        .bind(attempt as i64)
        .execute(&mut *db)
        .await?;

        Ok(())
    }

    pub async fn get(
        db: &mut SqliteConnection,
        channel: &str,
        group: &str,
        id: MessageId,
    ) -> Result<Option<PendingEntry>> {
        Ok(sqlx::query_as(
            "SELECT * FROM pending WHERE channel = $1 AND grp = $2 AND entry_id = $3",
        )
        .bind(channel)
        .bind(group)
        .bind(id.0)
        .fetch_optional(&mut *db)
        .await?)
    }

    pub async fn delete(
        db: &mut SqliteConnection,
        channel: &str,
        group: &str,
        id: MessageId,
    ) -> Result<bool> {
        let res = sqlx::query("DELETE FROM pending WHERE channel = $1 AND grp = $2 AND entry_id = $3")
            .bind(channel)
            .bind(group)
            .bind(id.0)
            .execute(&mut *db)
            .await?;

        Ok(res.rows_affected() > 0)
    }

    /// Entries claimed at or before `claimed_before`, oldest first.
    pub async fn stale(
        db: &mut SqliteConnection,
        channel: &str,
        group: &str,
        claimed_before: i64,
        limit: u32,
    ) -> Result<Vec<PendingEntry>> {
        Ok(sqlx::query_as(
            "
            SELECT * FROM pending
            WHERE channel = $1 AND grp = $2 AND claimed_at <= $3
            ORDER BY claimed_at, entry_id
            LIMIT $4
            ",
        )
        .bind(channel)
        .bind(group)
        .bind(claimed_before)
        .bind(limit as i64)
        .fetch_all(&mut *db)
        .await?)
    }

    /// Hands the entry to `consumer` as a new attempt.
    pub async fn reassign(
        db: &mut SqliteConnection,
        channel: &str,
        group: &str,
        id: MessageId,
        consumer: &str,
        attempt: u32,
        now: i64,
    ) -> Result<()> {
        sqlx::query(
            "
            UPDATE pending SET consumer = $4, attempt = $5, claimed_at = $6
            WHERE channel = $1 AND grp = $2 AND entry_id = $3
            ",
        )
        .bind(channel)
        .bind(group)
        .bind(id.0)
        .bind(consumer)
        .bind(attempt as i64)
        .bind(now)
        .execute(&mut *db)
        .await?;

        Ok(())
    }

    pub async fn count(db: &mut SqliteConnection, channel: &str, group: &str) -> Result<i64> {
        Ok(
            sqlx::query_scalar("SELECT COUNT(*) FROM pending WHERE channel = $1 AND grp = $2")
                .bind(channel)
                .bind(group)
                .fetch_one(&mut *db)
                .await?,
        )
    }
}
