use std::time::Duration;

use sqlx::{
    sqlite::{
        SqliteAutoVacuum, SqliteConnectOptions, SqliteJournalMode, SqliteLockingMode,
        SqlitePoolOptions, SqliteSynchronous,
    },
    Sqlite, SqlitePool, Transaction,
};
use tracing::debug;

use crate::{config::Config, error::Result};

/// How long a connection waits on another process's write lock before failing.
const BUSY_TIMEOUT: Duration = Duration::from_secs(30);

/// Handle to the shared SQLite database holding every channel log, group,
/// timestamp index, dead-letter collection and dedup marker.
///
/// Several processes may open the same file; all cross-process coordination
/// goes through [`Store::script`].
#[derive(Clone)]
pub struct Store {
    db: SqlitePool,
}

impl Store {
    pub async fn connect(config: &Config) -> Result<Self> {
        let opts = SqliteConnectOptions::new()
            .filename(config.db_path())
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal)
            .locking_mode(SqliteLockingMode::Normal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(BUSY_TIMEOUT)
            .optimize_on_close(true, None)
            .auto_vacuum(SqliteAutoVacuum::Full);

        let pool = SqlitePoolOptions::new().connect_with(opts).await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        debug!(path = config.db_path(), "store ready");

        Ok(Self { db: pool })
    }

    pub fn db(&self) -> &SqlitePool {
        &self.db
    }

    /// Opens a transaction that already owns the database write lock.
    ///
    /// The first statement is a write, so SQLite takes the write lock before
    /// the script reads anything and no other writer can interleave with the
    /// read-modify-write steps that follow. Dropping the transaction without
    /// committing rolls every step back.
    pub async fn script(&self) -> Result<Transaction<'static, Sqlite>> {
        let mut tx = self.db.begin().await?;

        sqlx::query("UPDATE script_lock SET ticks = ticks + 1 WHERE id = 1")
            .execute(&mut *tx)
            .await?;

        Ok(tx)
    }

    pub async fn close(&self) {
        self.db.close().await;
    }
}
