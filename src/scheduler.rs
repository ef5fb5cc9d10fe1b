//! Promotes due delayed entries into their channel logs.
//!
//! Any number of schedulers may run against one store. Each promotion pass
//! is a single script, so racing schedulers split the due entries between
//! them without promoting any entry twice.

use std::time::Duration;

use tokio::{task::JoinHandle, time::MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{engine::Engine, error::Result};

pub struct Scheduler {
    engine: Engine,
    interval: Duration,
    batch_size: u32,
    dedup_purge_interval: Duration,
}

/// A running scheduler. Dropping the handle leaves the task running until its
/// token is cancelled.
pub struct SchedulerHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl SchedulerHandle {
    /// Stops the loop after the pass in progress and waits for it to exit.
    pub async fn shutdown(self) {
        self.cancel.cancel();

        if let Err(e) = self.task.await {
            warn!(error = %e, "scheduler task ended abnormally");
        }
    }
}

impl Scheduler {
    pub fn new(engine: &Engine) -> Self {
        let config = engine.config();

        Self {
            engine: engine.clone(),
            interval: config.check_delay_interval(),
            batch_size: config.scheduled_batch_size.max(1),
            dedup_purge_interval: config.dedup_purge_interval(),
        }
    }

    pub fn spawn(self, cancel: CancellationToken) -> SchedulerHandle {
        let task = tokio::spawn(self.run(cancel.clone()));

        SchedulerHandle { cancel, task }
    }

    pub async fn run(self, cancel: CancellationToken) {
        info!(
            interval_ms = self.interval.as_millis() as u64,
            batch_size = self.batch_size,
            "scheduler started"
        );

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut purge = tokio::time::interval(self.dedup_purge_interval.max(self.interval));
        purge.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.tick().await {
                        warn!(error = %e, "promotion pass failed");
                    }
                }
                _ = purge.tick() => {
                    match self.engine.dedup().purge_expired().await {
                        Ok(0) => {}
                        Ok(purged) => debug!(purged, "purged expired dedup keys"),
                        Err(e) => warn!(error = %e, "dedup purge failed"),
                    }
                }
            }
        }

        info!("scheduler stopped");
    }

    /// Runs promotion passes until one comes back short of a full batch.
    pub async fn tick(&self) -> Result<usize> {
        let mut total = 0;

        loop {
            let promoted = self.engine.promote_due(self.batch_size).await?;
            total += promoted;

            if promoted < self.batch_size as usize {
                return Ok(total);
            }
        }
    }
}
