use bytes::Bytes;
use serde::{Deserialize, Serialize};
use sqlx::{prelude::FromRow, SqliteConnection};

use crate::{
    error::Result,
    message::{Message, MessageId},
};

/// One entry of a channel log.
///
/// `scope` is set on retry copies and DLQ requeues: such an entry is only
/// visible to the consumer group named there.
#[derive(Serialize, Deserialize, FromRow, Debug, Clone)]
pub struct LogEntry {
    pub id: i64,
    pub channel: String,
    pub payload: Vec<u8>,
    pub attempt: i64,
    pub dedup_key: Option<String>,
    pub scope: Option<String>,
    pub created_at: i64,
}

impl LogEntry {
    pub fn into_message(self, attempt: u32) -> Message {
        Message {
            id: MessageId(self.id),
            channel: self.channel,
            payload: Bytes::from(self.payload),
            attempt,
            dedup_key: self.dedup_key,
            created_at: self.created_at,
        }
    }

    pub async fn append(
        db: &mut SqliteConnection,
        channel: &str,
        payload: &[u8],
        attempt: u32,
        dedup_key: Option<&str>,
        scope: Option<&str>,
        now: i64,
    ) -> Result<MessageId> {
        let id: i64 = sqlx::query_scalar(
            "
            INSERT INTO entries (channel, payload, attempt, dedup_key, scope, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING id
            ",
        )
        .bind(channel)
        .bind(payload)
        .bind(attempt as i64)
        .bind(dedup_key)
        .bind(scope)
        .bind(now)
        .fetch_one(&mut *db)
        .await?;

        Ok(MessageId(id))
    }

    pub async fn get(db: &mut SqliteConnection, id: MessageId) -> Result<Option<LogEntry>> {
        Ok(sqlx::query_as("SELECT * FROM entries WHERE id = $1")
            .bind(id.0)
            .fetch_optional(&mut *db)
            .await?)
    }

    /// Entries past `cursor` that `group` may see, in log order.
    pub async fn next_for_group(
        db: &mut SqliteConnection,
        channel: &str,
        group: &str,
        cursor: i64,
        limit: u32,
    ) -> Result<Vec<LogEntry>> {
        Ok(sqlx::query_as(
            "
            SELECT * FROM entries
            WHERE channel = $1 AND id > $2 AND (scope IS NULL OR scope = $3)
            ORDER BY id
            LIMIT $4
            ",
        )
        .bind(channel)
        .bind(cursor)
        .bind(group)
        .bind(limit as i64)
        .fetch_all(&mut *db)
        .await?)
    }

    /// Range read of the whole log, regardless of scope.
    pub async fn range(
        db: &mut SqliteConnection,
        channel: &str,
        after: i64,
        limit: u32,
    ) -> Result<Vec<LogEntry>> {
        Ok(sqlx::query_as(
            "SELECT * FROM entries WHERE channel = $1 AND id > $2 ORDER BY id LIMIT $3",
        )
        .bind(channel)
        .bind(after)
        .bind(limit as i64)
        .fetch_all(&mut *db)
        .await?)
    }

    /// Removes an entry that only `group` could see. Shared entries stay in the log.
    pub async fn purge_scoped(db: &mut SqliteConnection, id: MessageId, group: &str) -> Result<()> {
        sqlx::query("DELETE FROM entries WHERE id = $1 AND scope = $2")
            .bind(id.0)
            .bind(group)
            .execute(&mut *db)
            .await?;

        Ok(())
    }

    pub async fn last_id(db: &mut SqliteConnection, channel: &str) -> Result<i64> {
        Ok(
            sqlx::query_scalar("SELECT COALESCE(MAX(id), 0) FROM entries WHERE channel = $1")
                .bind(channel)
                .fetch_one(&mut *db)
                .await?,
        )
    }

    pub async fn count(db: &mut SqliteConnection, channel: &str) -> Result<i64> {
        Ok(
            sqlx::query_scalar("SELECT COUNT(*) FROM entries WHERE channel = $1")
                .bind(channel)
                .fetch_one(&mut *db)
                .await?,
        )
    }
}
