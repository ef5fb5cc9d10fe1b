use serde::{Deserialize, Serialize};
use sqlx::{prelude::FromRow, SqliteConnection};

use crate::{error::Result, message::StartFrom};

/// A named cursor over one channel's log.
#[derive(Serialize, Deserialize, FromRow, Debug, Clone, PartialEq)]
pub struct ConsumerGroup {
    pub channel: String,
    pub name: String,
    /// Highest log id handed out to the group.
    pub cursor: i64,
    pub max_retries: i64,
    pub created_at: i64,
}

impl ConsumerGroup {
    /// Creates the group if it does not exist yet and returns it.
    ///
    /// `start_from` and `max_retries` only apply on creation.
    pub async fn ensure(
        db: &mut SqliteConnection,
        channel: &str,
        name: &str,
        start_from: StartFrom,
        max_retries: u32,
        now: i64,
    ) -> Result<ConsumerGroup> {
        let cursor = match start_from {
            StartFrom::Beginning => 0,
            StartFrom::Latest => super::entry::LogEntry::last_id(&mut *db, channel).await?,
            StartFrom::After(id) => id.0,
        };

        sqlx::query(
            "
            INSERT INTO consumer_groups (channel, name, cursor, max_retries, created_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (channel, name) DO NOTHING
            ",
        )
        .bind(channel)
        .bind(name)
        .bind(cursor)
        .bind(max_retries as i64)
        .bind(now)
        .execute(&mut *db)
        .await?;

        Ok(sqlx::query_as("SELECT * FROM consumer_groups WHERE channel = $1 AND name = $2")
            .bind(channel)
            .bind(name)
            .fetch_one(&mut *db)
            .await?)
    }

    pub async fn get(
        db: &mut SqliteConnection,
        channel: &str,
        name: &str,
    ) -> Result<Option<ConsumerGroup>> {
        Ok(sqlx::query_as("SELECT * FROM consumer_groups WHERE channel = $1 AND name = $2")
            .bind(channel)
            .bind(name)
            .fetch_optional(&mut *db)
            .await?)
    }

    pub async fn set_max_retries(
        db: &mut SqliteConnection,
        channel: &str,
        name: &str,
        max_retries: u32,
    ) -> Result<()> {
        sqlx::query("UPDATE consumer_groups SET max_retries = $3 WHERE channel = $1 AND name = $2")
            .bind(channel)
            .bind(name)
            .bind(max_retries as i64)
            .execute(&mut *db)
            .await?;

        Ok(())
    }

    pub async fn advance(
        db: &mut SqliteConnection,
        channel: &str,
        name: &str,
        cursor: i64,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE consumer_groups SET cursor = MAX(cursor, $3) WHERE channel = $1 AND name = $2",
        )
        .bind(channel)
        .bind(name)
        .bind(cursor)
        .execute(&mut *db)
        .await?;

        Ok(())
    }

    pub async fn list(db: &mut SqliteConnection, channel: &str) -> Result<Vec<ConsumerGroup>> {
        Ok(
            sqlx::query_as("SELECT * FROM consumer_groups WHERE channel = $1 ORDER BY name")
                .bind(channel)
                .fetch_all(&mut *db)
                .await?,
        )
    }
}
