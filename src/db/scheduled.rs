use serde::{Deserialize, Serialize};
use sqlx::{prelude::FromRow, SqliteConnection};

use crate::error::Result;

/// A message waiting in the timestamp index for its due time.
///
/// Used both for delayed first delivery and for retry backoff; retry copies
/// carry the incremented attempt and the owning group as `scope`.
#[derive(Serialize, Deserialize, FromRow, Debug, Clone, PartialEq)]
pub struct ScheduledEntry {
    pub id: i64,
    pub channel: String,
    pub payload: Vec<u8>,
    /// Unix ms.
    pub due_at: i64,
    pub attempt: i64,
    pub dedup_key: Option<String>,
    pub scope: Option<String>,
}

impl ScheduledEntry {
    pub async fn insert(
        db: &mut SqliteConnection,
        channel: &str,
        payload: &[u8],
        due_at: i64,
        attempt: u32,
        dedup_key: Option<&str>,
        scope: Option<&str>,
    ) -> Result<i64> {
        Ok(sqlx::query_scalar(
            "
            INSERT INTO scheduled (channel, payload, due_at, attempt, dedup_key, scope)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING id
            ",
        )
        .bind(channel)
        .bind(payload)
        .bind(due_at)
        .bind(attempt as i64)
        .bind(dedup_key)
        .bind(scope)
        .fetch_one(&mut *db)
        .await?)
    }

    /// Entries due at or before `now`. Ties on `due_at` come back in insertion order.
    pub async fn due(db: &mut SqliteConnection, now: i64, limit: u32) -> Result<Vec<ScheduledEntry>> {
        Ok(sqlx::query_as(
            "SELECT * FROM scheduled WHERE due_at <= $1 ORDER BY due_at, id LIMIT $2",
        )
        .bind(now)
        .bind(limit as i64)
        .fetch_all(&mut *db)
        .await?)
    }

    pub async fn delete(db: &mut SqliteConnection, id: i64) -> Result<bool> {
        let res = sqlx::query("DELETE FROM scheduled WHERE id = $1")
            .bind(id)
            .execute(&mut *db)
            .await?;

        Ok(res.rows_affected() > 0)
    }

    pub async fn count(db: &mut SqliteConnection, channel: &str) -> Result<i64> {
        Ok(
            sqlx::query_scalar("SELECT COUNT(*) FROM scheduled WHERE channel = $1")
                .bind(channel)
                .fetch_one(&mut *db)
                .await?,
        )
    }
}
