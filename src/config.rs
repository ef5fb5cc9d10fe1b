use std::time::Duration;

use serde::Deserialize;

use crate::{backoff::Backoff, message::StartFrom};

/// Process-wide settings, read from `RELAYMQ_*` environment variables.
///
/// Every field has a default so an empty environment yields a working engine.
/// Per-subscription options fall back to these values when left unset.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    pub db_path: Option<String>,
    pub bind: String,

    /// Run a scheduler inside every connected engine. Disable when promotion
    /// is driven elsewhere, e.g. by a dedicated process.
    pub embedded_scheduler: bool,
    /// Scheduler tick.
    pub check_delay_interval_ms: u64,
    pub scheduled_batch_size: u32,

    /// How long a claim waits for new entries before returning empty.
    pub block_interval_ms: u64,
    /// Re-check interval while a claim is blocked, for appends from other processes.
    pub claim_poll_interval_ms: u64,

    /// Handlers a subscription runs at once.
    pub concurrency: usize,
    /// Entries a subscription claims per poll.
    pub batch_size: u32,

    pub max_retries: u32,
    pub retry_delay_ms: u64,

    pub exactly_once: bool,
    pub dedup_ttl_ms: u64,
    pub dedup_purge_interval_ms: u64,

    pub start_from: String,

    pub visibility_timeout_ms: u64,
    pub reclaim_interval_ms: u64,
    pub drain_timeout_ms: u64,
}

impl Config {
    pub fn load() -> eyre::Result<Self> {
        Ok(envy::prefixed("RELAYMQ_").from_env::<Self>()?)
    }

    pub fn db_path(&self) -> &str {
        self.db_path
            .as_ref()
            .map(|s| s.as_str())
            .unwrap_or("relaymq.db")
    }

    pub fn check_delay_interval(&self) -> Duration {
        Duration::from_millis(self.check_delay_interval_ms.max(1))
    }

    pub fn block_interval(&self) -> Duration {
        Duration::from_millis(self.block_interval_ms)
    }

    pub fn claim_poll_interval(&self) -> Duration {
        Duration::from_millis(self.claim_poll_interval_ms.max(1))
    }

    pub fn dedup_ttl(&self) -> Duration {
        Duration::from_millis(self.dedup_ttl_ms)
    }

    pub fn dedup_purge_interval(&self) -> Duration {
        Duration::from_millis(self.dedup_purge_interval_ms)
    }

    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_millis(self.visibility_timeout_ms)
    }

    pub fn reclaim_interval(&self) -> Duration {
        Duration::from_millis(self.reclaim_interval_ms.max(1))
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    pub fn backoff(&self) -> Backoff {
        Backoff::Fixed(Duration::from_millis(self.retry_delay_ms))
    }

    /// Falls back to [`StartFrom::Beginning`] when the configured value does not parse.
    pub fn start_from(&self) -> StartFrom {
        self.start_from.parse().unwrap_or(StartFrom::Beginning)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: None,
            bind: "127.0.0.1:8080".to_owned(),
            embedded_scheduler: true,
            check_delay_interval_ms: 100,
            scheduled_batch_size: 100,
            block_interval_ms: 1_000,
            claim_poll_interval_ms: 50,
            concurrency: 1,
            batch_size: 10,
            max_retries: 3,
            retry_delay_ms: 1_000,
            exactly_once: false,
            dedup_ttl_ms: 24 * 60 * 60 * 1_000,
            dedup_purge_interval_ms: 60_000,
            start_from: "0".to_owned(),
            visibility_timeout_ms: 30_000,
            reclaim_interval_ms: 5_000,
            drain_timeout_ms: 10_000,
        }
    }
}
