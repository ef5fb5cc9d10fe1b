//! Message delivery over a shared SQLite store: channel logs, consumer
//! groups with acknowledgement tracking, delayed delivery, retry with
//! backoff, dead-lettering and effectively-once processing.
//!
//! A connected [`Engine`] runs its own [`Scheduler`] unless
//! `embedded_scheduler` is turned off, so delayed and retried messages are
//! promoted without further setup. [`Engine::close`] stops it.
//!
//! ```no_run
//! # async fn demo() -> relaymq::error::Result<()> {
//! use relaymq::{Delivery, Engine, PublishOptions, SubscribeOptions};
//!
//! let engine = Engine::connect().await?;
//!
//! engine
//!     .publish("orders", "hello", PublishOptions::default())
//!     .await?;
//!
//! let sub = engine
//!     .subscribe(
//!         "orders",
//!         |delivery: Delivery| async move {
//!             println!("{:?}", delivery.payload);
//!             Ok::<_, eyre::Report>(())
//!         },
//!         SubscribeOptions::builder().group("billing").build(),
//!     )
//!     .await?;
//!
//! sub.unsubscribe().await?;
//! engine.close().await;
//! # Ok(())
//! # }
//! ```

use actix_web::{
    middleware::{NormalizePath, TrailingSlash},
    web::{Data, JsonConfig},
    App, HttpServer,
};
use tracing::{info, level_filters::LevelFilter};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{util::SubscriberInitExt, EnvFilter, FmtSubscriber};

pub mod api;
pub mod backoff;
pub mod config;
pub mod db;
pub mod dedup;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod fanout;
pub mod message;
pub mod middleware;
pub mod scheduler;
pub mod store;
pub mod utils;

pub use backoff::Backoff;
pub use config::Config;
pub use dispatcher::{Delivery, Handler, SubscribeOptions, Subscription, SubscriptionState};
pub use engine::{ChannelStats, Engine, GroupStats};
pub use error::{Error, Result};
pub use fanout::ChannelPattern;
pub use message::{
    DeadLetterEntry, DeadLetterFilter, DeadLetterReason, Message, MessageId, PublishOptions,
    PublishReceipt, Settlement, StartFrom,
};
pub use middleware::Middleware;
pub use scheduler::{Scheduler, SchedulerHandle};

/// Returns a builder for the operator server: engine, scheduler and HTTP API.
///
/// Without an explicit config, settings are read from `RELAYMQ_*` variables.
#[bon::builder(finish_fn = start)]
pub async fn run(config: Option<Config>) -> eyre::Result<()> {
    #[cfg(debug_assertions)]
    FmtSubscriber::builder()
        .pretty()
        .with_env_filter(
            EnvFilter::builder()
                .with_env_var("RELAYMQ_LOG")
                .with_default_directive(LevelFilter::INFO.into())
                .from_env()?,
        )
        .finish()
        .try_init()?;

    #[cfg(not(debug_assertions))]
    FmtSubscriber::builder()
        .json()
        .with_env_filter(
            EnvFilter::builder()
                .with_env_var("RELAYMQ_LOG")
                .with_default_directive(LevelFilter::INFO.into())
                .from_env()?,
        )
        .finish()
        .try_init()?;

    let config = match config {
        Some(config) => config,
        None => Config::load()?,
    };
    let bind = config.bind.clone();

    let engine = Engine::connect_with(config).await?;

    if !engine.config().embedded_scheduler {
        info!("embedded scheduler disabled, delayed entries need an external scheduler");
    }

    let data = Data::new(engine.clone());

    info!(%bind, "serving operator api");

    HttpServer::new(move || {
        let json_cfg = JsonConfig::default().content_type_required(false);

        App::new()
            .wrap(TracingLogger::default())
            .wrap(NormalizePath::new(TrailingSlash::Trim))
            .service(api::channel::service())
            .service(api::dlq::service())
            .app_data(data.clone())
            .app_data(json_cfg)
    })
    .bind(bind.as_str())?
    .run()
    .await?;

    engine.close().await;

    Ok(())
}
