#![allow(dead_code)]

use std::{future::Future, ops::Deref, time::Duration};

use relaymq::{config::Config, engine::Engine};
use tempfile::TempDir;

pub struct TmpEngine {
    engine: Engine,
    config: Config,
    #[allow(unused)]
    tmpdir: TempDir,
}

impl Deref for TmpEngine {
    type Target = Engine;

    fn deref(&self) -> &Self::Target {
        &self.engine
    }
}

impl TmpEngine {
    pub fn engine(&self) -> Engine {
        self.engine.clone()
    }

    /// Another engine on the same database file, as a second process would open it.
    pub async fn open_another(&self) -> Engine {
        Engine::connect_with(self.config.clone()).await.unwrap()
    }
}

pub async fn setup() -> TmpEngine {
    setup_with(|_| {}).await
}

pub async fn setup_with(configure: impl FnOnce(&mut Config)) -> TmpEngine {
    let path = tempfile::tempdir().unwrap();

    let mut config = Config {
        db_path: Some(path.path().join("relaymq.db").to_string_lossy().to_string()),
        // Tests drive promotion by hand unless they opt in.
        embedded_scheduler: false,
        check_delay_interval_ms: 10,
        block_interval_ms: 50,
        claim_poll_interval_ms: 10,
        retry_delay_ms: 10,
        reclaim_interval_ms: 50,
        drain_timeout_ms: 2_000,
        ..Default::default()
    };
    configure(&mut config);

    TmpEngine {
        engine: Engine::connect_with(config.clone()).await.unwrap(),
        config,
        tmpdir: path,
    }
}

/// Polls `check` until it holds, failing the test after a few seconds.
pub async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);

    while !check().await {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not met in time"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
