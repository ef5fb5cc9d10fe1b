use sqlx::SqliteConnection;

use crate::error::Result;

pub struct DedupMarker;

impl DedupMarker {
    pub async fn exists(
        db: &mut SqliteConnection,
        channel: &str,
        group: &str,
        key: &str,
        now: i64,
    ) -> Result<bool> {
        let found: Option<i64> = sqlx::query_scalar(
            "
            SELECT 1 FROM dedup
            WHERE channel = $1 AND grp = $2 AND dedup_key = $3 AND expires_at > $4
            ",
        )
        .bind(channel)
        .bind(group)
        .bind(key)
        .bind(now)
        .fetch_optional(&mut *db)
        .await?;

        Ok(found.is_some())
    }

    pub async fn upsert(
        db: &mut SqliteConnection,
        channel: &str,
        group: &str,
        key: &str,
        expires_at: i64,
    ) -> Result<()> {
        sqlx::query(
            "
            INSERT INTO dedup (channel, grp, dedup_key, expires_at) VALUES ($1, $2, $3, $4)
            ON CONFLICT (channel, grp, dedup_key) DO UPDATE SET expires_at = excluded.expires_at
            ",
        )
        .bind(channel)
        .bind(group)
        .bind(key)
        .bind(expires_at)
        .execute(&mut *db)
        .await?;

        Ok(())
    }

    pub async fn purge_expired(db: &mut SqliteConnection, now: i64) -> Result<u64> {
        let res = sqlx::query("DELETE FROM dedup WHERE expires_at <= $1")
            .bind(now)
            .execute(&mut *db)
            .await?;

        Ok(res.rows_affected())
    }
}
