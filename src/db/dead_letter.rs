use bytes::Bytes;
use sqlx::{prelude::FromRow, QueryBuilder, Sqlite, SqliteConnection};
use tokio_stream::StreamExt;

use crate::{
    error::{Error, Result},
    message::{DeadLetterEntry, DeadLetterFilter, DeadLetterReason, MessageId},
    utils,
};

#[derive(FromRow, Debug, Clone)]
pub struct DeadLetterRow {
    pub id: i64,
    pub message_id: i64,
    pub channel: String,
    pub grp: String,
    pub payload: Vec<u8>,
    pub attempts: i64,
    pub reason: String,
    pub last_error: Option<String>,
    pub dedup_key: Option<String>,
    pub failed_at: i64,
}

impl TryFrom<DeadLetterRow> for DeadLetterEntry {
    type Error = Error;

    fn try_from(row: DeadLetterRow) -> Result<Self> {
        let reason: DeadLetterReason = row
            .reason
            .parse()
            .map_err(|e| Error::internal(eyre::eyre!("dead letter {}: {e}", row.id)))?;

        Ok(DeadLetterEntry {
            id: row.id,
            message_id: MessageId(row.message_id),
            channel: row.channel,
            group: row.grp,
            payload: Bytes::from(row.payload),
            attempts: u32::try_from(row.attempts).unwrap_or(u32::MAX),
            reason,
            last_error: row.last_error,
            dedup_key: row.dedup_key,
            failed_at: utils::to_datetime(row.failed_at),
        })
    }
}

pub struct NewDeadLetter<'a> {
    pub message_id: MessageId,
    pub channel: &'a str,
    pub group: &'a str,
    pub payload: &'a [u8],
    pub attempts: u32,
    pub reason: DeadLetterReason,
    pub last_error: Option<&'a str>,
    pub dedup_key: Option<&'a str>,
}

impl DeadLetterRow {
    pub async fn insert(
        db: &mut SqliteConnection,
        entry: NewDeadLetter<'_>,
        now: i64,
    ) -> Result<i64> {
        Ok(sqlx::query_scalar(
            "
            INSERT INTO dead_letters
                (message_id, channel, grp, payload, attempts, reason, last_error, dedup_key, failed_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            RETURNING id
            ",
        )
        .bind(entry.message_id.0)
        .bind(entry.channel)
        .bind(entry.group)
        .bind(entry.payload)
        .bind(entry.attempts as i64)
        .bind(entry.reason.as_ref())
        .bind(entry.last_error)
        .bind(entry.dedup_key)
        .bind(now)
        .fetch_one(&mut *db)
        .await?)
    }

    /// Matching entries, oldest first.
    pub async fn list(
        db: &mut SqliteConnection,
        filter: &DeadLetterFilter,
    ) -> Result<Vec<DeadLetterRow>> {
        let mut query: QueryBuilder<Sqlite> =
            QueryBuilder::new("SELECT * FROM dead_letters WHERE 1 = 1");

        if let Some(channel) = &filter.channel {
            query.push(" AND channel = ").push_bind(channel.clone());
        }

        if let Some(group) = &filter.group {
            query.push(" AND grp = ").push_bind(group.clone());
        }

        if !filter.ids.is_empty() {
            query.push(" AND id IN (");
            let mut ids = query.separated(", ");
            for id in &filter.ids {
                ids.push_bind(*id);
            }
            ids.push_unseparated(")");
        }

        query.push(" ORDER BY id");

        if let Some(limit) = filter.limit {
            query.push(" LIMIT ").push_bind(limit as i64);
        }

        let mut stream = query.build_query_as::<DeadLetterRow>().fetch(&mut *db);

        let mut rows = Vec::new();

        while let Some(res) = stream.next().await.transpose()? {
            rows.push(res);
        }

        Ok(rows)
    }

    pub async fn delete(db: &mut SqliteConnection, id: i64) -> Result<bool> {
        let res = sqlx::query("DELETE FROM dead_letters WHERE id = $1")
            .bind(id)
            .execute(&mut *db)
            .await?;

        Ok(res.rows_affected() > 0)
    }

    pub async fn count(db: &mut SqliteConnection, channel: &str) -> Result<i64> {
        Ok(
            sqlx::query_scalar("SELECT COUNT(*) FROM dead_letters WHERE channel = $1")
                .bind(channel)
                .fetch_one(&mut *db)
                .await?,
        )
    }
}
