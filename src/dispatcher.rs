//! Subscription loops that claim entries and run handlers on them.
//!
//! A subscription on a channel log claims batches for its consumer group,
//! runs the handler on each message under a concurrency limit, and settles
//! every message: ack on success, retry with backoff on failure, dead-letter
//! once the group's retry ceiling is reached. Stale pending entries are swept
//! back in periodically, so messages claimed by a consumer that died are
//! redelivered.
//!
//! With `use_pub_sub` the subscription instead receives in-process broadcasts
//! matching a channel pattern, with nothing to settle.

use std::{
    fmt,
    future::Future,
    ops::Deref,
    panic::AssertUnwindSafe,
    sync::Arc,
    time::Duration,
};

use futures_util::{future::BoxFuture, FutureExt};
use tokio::{
    sync::{watch, Mutex, OwnedSemaphorePermit, Semaphore},
    task::{JoinError, JoinHandle, JoinSet},
    time::Instant,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, instrument, warn, Instrument};

use crate::{
    backoff::Backoff,
    config::Config,
    engine::{Engine, Failure, Fence},
    error::{Error, Result},
    fanout::{self, ChannelPattern},
    message::{DeadLetterReason, Message, Settlement, StartFrom},
    utils::panic_message,
};

/// Initial wait after a failed claim. Doubles up to [`MAX_ERROR_BACKOFF`].
const MIN_ERROR_BACKOFF: Duration = Duration::from_millis(100);
const MAX_ERROR_BACKOFF: Duration = Duration::from_secs(5);

/// Broadcasts buffered per pub/sub subscription before new ones are dropped.
const PUB_SUB_BUFFER: usize = 1024;

const DEFAULT_GROUP: &str = "default";

/// Per-subscription options. Unset fields fall back to [`Config`].
#[derive(Debug, Clone, Default, bon::Builder)]
pub struct SubscribeOptions {
    #[builder(into)]
    pub group: Option<String>,
    #[builder(into)]
    pub consumer: Option<String>,
    /// Where the group starts reading if it does not exist yet.
    pub start_from: Option<StartFrom>,
    pub backoff: Option<Backoff>,
    pub max_retries: Option<u32>,
    pub exactly_once: Option<bool>,
    pub dedup_ttl: Option<Duration>,
    /// Receive in-process broadcasts instead of claiming from the channel log.
    #[builder(default)]
    pub use_pub_sub: bool,
    pub concurrency: Option<usize>,
    pub batch_size: Option<u32>,
    pub block: Option<Duration>,
    pub visibility_timeout: Option<Duration>,
    pub reclaim_interval: Option<Duration>,
    pub drain_timeout: Option<Duration>,
}

#[derive(Debug)]
struct Settings {
    group: String,
    consumer: String,
    start_from: StartFrom,
    backoff: Backoff,
    max_retries: u32,
    exactly_once: bool,
    dedup_ttl: Duration,
    concurrency: usize,
    batch_size: u32,
    block: Duration,
    visibility_timeout: Duration,
    reclaim_interval: Duration,
    drain_timeout: Duration,
}

impl SubscribeOptions {
    fn resolve(self, config: &Config) -> Settings {
        Settings {
            group: self.group.unwrap_or_else(|| DEFAULT_GROUP.to_owned()),
            consumer: self.consumer.unwrap_or_else(default_consumer),
            start_from: self.start_from.unwrap_or_else(|| config.start_from()),
            backoff: self.backoff.unwrap_or_else(|| config.backoff()),
            max_retries: self.max_retries.unwrap_or(config.max_retries),
            exactly_once: self.exactly_once.unwrap_or(config.exactly_once),
            dedup_ttl: self.dedup_ttl.unwrap_or_else(|| config.dedup_ttl()),
            concurrency: self.concurrency.unwrap_or(config.concurrency).max(1),
            batch_size: self.batch_size.unwrap_or(config.batch_size).max(1),
            block: self.block.unwrap_or_else(|| config.block_interval()),
            visibility_timeout: self
                .visibility_timeout
                .unwrap_or_else(|| config.visibility_timeout()),
            reclaim_interval: self
                .reclaim_interval
                .unwrap_or_else(|| config.reclaim_interval())
                .max(Duration::from_millis(1)),
            drain_timeout: self.drain_timeout.unwrap_or_else(|| config.drain_timeout()),
        }
    }
}

fn default_consumer() -> String {
    format!("consumer-{}-{:08x}", std::process::id(), rand::random::<u32>())
}

/// Message handler run by a subscription.
///
/// Implemented for every `Fn(Delivery) -> impl Future<Output = eyre::Result<()>>`.
/// Returning `Ok` acks the message unless the handler already settled it;
/// returning `Err` or panicking retries it.
pub trait Handler: Send + Sync + 'static {
    fn call(&self, delivery: Delivery) -> BoxFuture<'static, eyre::Result<()>>;
}

impl<F, Fut> Handler for F
where
    F: Fn(Delivery) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = eyre::Result<()>> + Send + 'static,
{
    fn call(&self, delivery: Delivery) -> BoxFuture<'static, eyre::Result<()>> {
        Box::pin(self(delivery))
    }
}

enum Binding {
    Group(Arc<Settings>),
    Ephemeral,
}

struct DeliveryInner {
    engine: Engine,
    message: Message,
    binding: Binding,
    settlement: Mutex<Option<Settlement>>,
}

/// A message handed to a handler, plus the means to settle it.
///
/// Only the first settlement takes effect; later calls return it unchanged.
#[derive(Clone)]
pub struct Delivery {
    inner: Arc<DeliveryInner>,
}

enum Action<'a> {
    Ack { mark_processed: bool },
    Fail(Failure<'a>),
}

impl Delivery {
    fn new(engine: Engine, message: Message, binding: Binding) -> Self {
        Self {
            inner: Arc::new(DeliveryInner {
                engine,
                message,
                binding,
                settlement: Mutex::new(None),
            }),
        }
    }

    pub fn message(&self) -> &Message {
        &self.inner.message
    }

    /// The consumer group this was claimed for. `None` for pub/sub deliveries.
    pub fn group(&self) -> Option<&str> {
        match &self.inner.binding {
            Binding::Group(settings) => Some(&settings.group),
            Binding::Ephemeral => None,
        }
    }

    pub async fn ack(&self) -> Result<Settlement> {
        self.settle(Action::Ack {
            mark_processed: true,
        })
        .await
    }

    /// Redelivers after `delay`, or after the subscription's backoff when `None`.
    pub async fn retry(&self, delay: Option<Duration>) -> Result<Settlement> {
        let backoff = match (&self.inner.binding, delay) {
            (_, Some(delay)) => delay,
            (Binding::Group(settings), None) => settings.backoff.delay_for(self.attempt),
            (Binding::Ephemeral, None) => Duration::ZERO,
        };

        self.settle(Action::Fail(Failure::Retry {
            backoff,
            error: None,
        }))
        .await
    }

    /// Gives up on the message without further attempts.
    pub async fn dead_letter(&self, reason: impl Into<String>) -> Result<Settlement> {
        let reason = reason.into();

        self.settle(Action::Fail(Failure::DeadLetter {
            reason: DeadLetterReason::Rejected,
            error: Some(reason.as_str()),
        }))
        .await
    }

    /// The settlement applied so far, if any.
    pub async fn settlement(&self) -> Option<Settlement> {
        self.inner.settlement.lock().await.clone()
    }

    async fn settle(&self, action: Action<'_>) -> Result<Settlement> {
        let mut settled = self.inner.settlement.lock().await;
        if let Some(settlement) = settled.as_ref() {
            return Ok(settlement.clone());
        }

        let Binding::Group(settings) = &self.inner.binding else {
            *settled = Some(Settlement::Ephemeral);
            return Ok(Settlement::Ephemeral);
        };

        let engine = &self.inner.engine;
        let message = &self.inner.message;

        let settlement = match action {
            Action::Ack { mark_processed } => {
                let settlement = engine
                    .ack(&message.channel, &settings.group, message.id)
                    .await?;

                if mark_processed && settings.exactly_once && settlement == Settlement::Acked {
                    if let Some(key) = &message.dedup_key {
                        // The ack already landed; a missing marker only risks a duplicate run.
                        if let Err(e) = engine
                            .dedup()
                            .mark_processed(
                                &message.channel,
                                &settings.group,
                                key,
                                settings.dedup_ttl,
                            )
                            .await
                        {
                            warn!(error = %e, key = %key, "failed to mark dedup key");
                        }
                    }
                }

                settlement
            }
            Action::Fail(failure) => {
                engine
                    .fail(
                        &message.channel,
                        &settings.group,
                        message.id,
                        Some(Fence {
                            consumer: &settings.consumer,
                            attempt: message.attempt,
                        }),
                        failure,
                    )
                    .await?
            }
        };

        *settled = Some(settlement.clone());
        Ok(settlement)
    }
}

impl Deref for Delivery {
    type Target = Message;

    fn deref(&self) -> &Message {
        &self.inner.message
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("message", &self.inner.message)
            .field("group", &self.group())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum SubscriptionState {
    /// Waiting for handler capacity, or between polls.
    Idle,
    /// Waiting for messages.
    Polling,
    /// At least one handler is running.
    Processing,
    Stopped,
}

/// A running subscription. Dropping it stops polling without waiting for
/// in-flight handlers; use [`Subscription::unsubscribe`] to drain them.
pub struct Subscription {
    channel: String,
    group: Option<String>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
    state: watch::Receiver<SubscriptionState>,
}

impl Subscription {
    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn group(&self) -> Option<&str> {
        self.group.as_deref()
    }

    pub fn state(&self) -> SubscriptionState {
        *self.state.borrow()
    }

    /// Stops polling and waits for in-flight handlers up to the drain timeout.
    /// Handlers still running after that are left to finish on their own.
    pub async fn unsubscribe(mut self) -> Result<()> {
        self.cancel.cancel();

        if let Some(task) = self.task.take() {
            task.await.map_err(Error::internal)?;
        }

        Ok(())
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl Engine {
    /// Starts a subscription on `channel`.
    ///
    /// Without `use_pub_sub` the consumer group is created (or its retry
    /// ceiling updated) before this returns, so messages published afterwards
    /// are never missed by a group starting at the latest entry.
    #[instrument(skip(self, handler, opts), fields(group))]
    pub async fn subscribe(
        &self,
        channel: &str,
        handler: impl Handler,
        opts: SubscribeOptions,
    ) -> Result<Subscription> {
        let use_pub_sub = opts.use_pub_sub;
        let settings = opts.resolve(self.config());
        let handler: Arc<dyn Handler> = Arc::new(handler);
        let cancel = CancellationToken::new();
        let (state_tx, state_rx) = watch::channel(SubscriptionState::Idle);

        if use_pub_sub {
            let pattern = ChannelPattern::new(channel)?;

            let (id, rx) = self.fanout().register(pattern, PUB_SUB_BUFFER);

            let task = tokio::spawn(
                PubSubLoop {
                    engine: self.clone(),
                    subscriber: id,
                    rx,
                    concurrency: settings.concurrency,
                    drain_timeout: settings.drain_timeout,
                    handler,
                    cancel: cancel.clone(),
                    state: state_tx,
                }
                .run()
                .instrument(info_span!("pubsub", pattern = channel)),
            );

            return Ok(Subscription {
                channel: channel.to_owned(),
                group: None,
                cancel,
                task: Some(task),
                state: state_rx,
            });
        }

        if channel.is_empty() {
            return Err(Error::invalid_parameter("channel cannot be empty"));
        }

        if fanout::is_pattern(channel) {
            return Err(Error::invalid_parameter(format!(
                "pattern {channel:?} requires use_pub_sub"
            )));
        }

        tracing::Span::current().record("group", settings.group.as_str());

        self.ensure_group(
            channel,
            &settings.group,
            settings.start_from,
            settings.max_retries,
        )
        .await?;

        let settings = Arc::new(settings);

        let task = tokio::spawn(
            LogLoop {
                engine: self.clone(),
                channel: channel.to_owned(),
                settings: settings.clone(),
                handler,
                cancel: cancel.clone(),
                state: state_tx,
            }
            .run()
            .instrument(info_span!(
                "subscription",
                channel,
                group = %settings.group,
                consumer = %settings.consumer
            )),
        );

        Ok(Subscription {
            channel: channel.to_owned(),
            group: Some(settings.group.clone()),
            cancel,
            task: Some(task),
            state: state_rx,
        })
    }
}

struct LogLoop {
    engine: Engine,
    channel: String,
    settings: Arc<Settings>,
    handler: Arc<dyn Handler>,
    cancel: CancellationToken,
    state: watch::Sender<SubscriptionState>,
}

impl LogLoop {
    async fn run(self) {
        let settings = &self.settings;
        let semaphore = Arc::new(Semaphore::new(settings.concurrency));
        let mut in_flight = JoinSet::new();
        let mut error_delay = MIN_ERROR_BACKOFF;
        let mut next_reclaim = Instant::now();

        info!(
            concurrency = settings.concurrency,
            batch_size = settings.batch_size,
            "subscription started"
        );

        loop {
            reap(&mut in_flight);
            self.state.send_replace(idle_or_processing(&in_flight));

            let permit = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                permit = semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let room = (semaphore.available_permits() + 1).min(settings.batch_size as usize) as u32;
            let mut batch = Vec::new();

            if Instant::now() >= next_reclaim {
                next_reclaim = Instant::now() + settings.reclaim_interval;

                match self
                    .engine
                    .reclaim_stale(
                        &self.channel,
                        &settings.group,
                        &settings.consumer,
                        settings.visibility_timeout,
                        room,
                    )
                    .await
                {
                    Ok(reclaimed) => batch = reclaimed,
                    Err(e) => warn!(error = %e, "reclaim sweep failed"),
                }
            }

            if batch.is_empty() {
                if in_flight.is_empty() {
                    self.state.send_replace(SubscriptionState::Polling);
                }

                // Cancellation only interrupts the wait; committed claims are always dispatched.
                let claimed = self
                    .engine
                    .claim_until(
                        &self.channel,
                        &settings.group,
                        &settings.consumer,
                        room,
                        settings.block,
                        Some(&self.cancel),
                    )
                    .await;

                match claimed {
                    Ok(messages) => {
                        error_delay = MIN_ERROR_BACKOFF;
                        batch = messages;
                    }
                    Err(e) => {
                        if e.is_transient() {
                            warn!(error = %e, retry_in_ms = error_delay.as_millis() as u64, "claim failed");
                        } else {
                            error!(error = %e, retry_in_ms = error_delay.as_millis() as u64, "claim failed");
                        }

                        drop(permit);

                        tokio::select! {
                            biased;
                            _ = self.cancel.cancelled() => break,
                            _ = tokio::time::sleep(error_delay) => {}
                        }

                        error_delay = (error_delay * 2).min(MAX_ERROR_BACKOFF);
                        continue;
                    }
                }
            }

            let mut permit = Some(permit);

            for message in batch {
                let permit = match permit.take() {
                    Some(permit) => permit,
                    None => match semaphore.clone().acquire_owned().await {
                        Ok(permit) => permit,
                        Err(_) => break,
                    },
                };

                let span = info_span!("deliver", id = %message.id, attempt = message.attempt);
                let delivery = Delivery::new(
                    self.engine.clone(),
                    message,
                    Binding::Group(self.settings.clone()),
                );

                in_flight.spawn(
                    process(delivery, self.handler.clone(), permit).instrument(span),
                );
            }

            self.state.send_replace(idle_or_processing(&in_flight));
        }

        drain(&mut in_flight, settings.drain_timeout).await;
        self.state.send_replace(SubscriptionState::Stopped);

        info!("subscription stopped");
    }
}

struct PubSubLoop {
    engine: Engine,
    subscriber: u64,
    rx: tokio::sync::mpsc::Receiver<Message>,
    concurrency: usize,
    drain_timeout: Duration,
    handler: Arc<dyn Handler>,
    cancel: CancellationToken,
    state: watch::Sender<SubscriptionState>,
}

impl PubSubLoop {
    async fn run(mut self) {
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut in_flight = JoinSet::new();

        info!("pub/sub subscription started");

        loop {
            reap(&mut in_flight);
            self.state.send_replace(idle_or_processing(&in_flight));

            let permit = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                permit = semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            if in_flight.is_empty() {
                self.state.send_replace(SubscriptionState::Polling);
            }

            let message = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                message = self.rx.recv() => match message {
                    Some(message) => message,
                    None => break,
                },
            };

            let span = info_span!("deliver", channel = %message.channel, id = %message.id);
            let delivery = Delivery::new(self.engine.clone(), message, Binding::Ephemeral);

            in_flight.spawn(process(delivery, self.handler.clone(), permit).instrument(span));
            self.state.send_replace(SubscriptionState::Processing);
        }

        self.engine.fanout().unregister(self.subscriber);

        drain(&mut in_flight, self.drain_timeout).await;
        self.state.send_replace(SubscriptionState::Stopped);

        info!("pub/sub subscription stopped");
    }
}

/// Runs the handler on one delivery and settles it.
async fn process(delivery: Delivery, handler: Arc<dyn Handler>, _permit: OwnedSemaphorePermit) {
    let engine = delivery.inner.engine.clone();
    let pipeline = engine.pipeline();

    if let Binding::Group(settings) = &delivery.inner.binding {
        if settings.exactly_once {
            if let Some(key) = &delivery.dedup_key {
                match engine
                    .dedup()
                    .is_processed(&delivery.channel, &settings.group, key)
                    .await
                {
                    Ok(true) => {
                        debug!(key = %key, "already processed, skipping");

                        match delivery
                            .settle(Action::Ack {
                                mark_processed: false,
                            })
                            .await
                        {
                            Ok(settlement) => pipeline.after_process(delivery.message(), &settlement),
                            Err(e) => warn!(error = %e, "failed to ack duplicate"),
                        }

                        return;
                    }
                    Ok(false) => {}
                    // At-least-once still holds; the handler may see a duplicate.
                    Err(e) => warn!(error = %e, key = %key, "dedup lookup failed"),
                }
            }
        }
    }

    pipeline.before_process(delivery.message());

    let outcome = AssertUnwindSafe({
        let handler = handler.clone();
        let delivery = delivery.clone();
        async move { handler.call(delivery).await }
    })
    .catch_unwind()
    .await
    .unwrap_or_else(|panic| Err(eyre::eyre!("handler panicked: {}", panic_message(&*panic))));

    let settled = match outcome {
        Ok(()) => delivery.ack().await,
        Err(error) => {
            debug!(error = %error, "handler failed");
            pipeline.on_error(delivery.message(), &error);

            let error = format!("{error:#}");
            let backoff = match &delivery.inner.binding {
                Binding::Group(settings) => settings.backoff.delay_for(delivery.attempt),
                Binding::Ephemeral => Duration::ZERO,
            };

            delivery
                .settle(Action::Fail(Failure::Retry {
                    backoff,
                    error: Some(error.as_str()),
                }))
                .await
        }
    };

    match settled {
        Ok(settlement) => pipeline.after_process(delivery.message(), &settlement),
        Err(e) => warn!(error = %e, "failed to settle message, it will be reclaimed"),
    }
}

fn idle_or_processing(in_flight: &JoinSet<()>) -> SubscriptionState {
    if in_flight.is_empty() {
        SubscriptionState::Idle
    } else {
        SubscriptionState::Processing
    }
}

fn reap(in_flight: &mut JoinSet<()>) {
    while let Some(res) = in_flight.try_join_next() {
        log_join_error(res);
    }
}

fn log_join_error(res: std::result::Result<(), JoinError>) {
    if let Err(e) = res {
        error!(error = %e, "delivery task failed");
    }
}

async fn drain(in_flight: &mut JoinSet<()>, timeout: Duration) {
    if in_flight.is_empty() {
        return;
    }

    debug!(in_flight = in_flight.len(), "draining handlers");

    let drained = tokio::time::timeout(timeout, async {
        while let Some(res) = in_flight.join_next().await {
            log_join_error(res);
        }
    })
    .await;

    if drained.is_err() {
        warn!(
            remaining = in_flight.len(),
            "drain timed out, detaching running handlers"
        );
        in_flight.detach_all();
    }
}
