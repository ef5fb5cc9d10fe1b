use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use relaymq::{
    error::Error, Backoff, DeadLetterFilter, DeadLetterReason, Delivery, Message, Middleware,
    PublishOptions, PublishReceipt, Scheduler, Settlement, SubscribeOptions, SubscriptionState,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

mod common;

use common::{eventually, setup, setup_with, TmpEngine};

fn fast_retries() -> SubscribeOptions {
    SubscribeOptions::builder()
        .group("workers")
        .backoff(Backoff::Fixed(Duration::from_millis(10)))
        .build()
}

async fn pending(engine: &TmpEngine, channel: &str) -> u64 {
    engine
        .stats(channel)
        .await
        .unwrap()
        .groups
        .iter()
        .map(|g| g.pending)
        .sum()
}

#[tokio::test]
async fn test_successful_handler_auto_acks() {
    let engine = setup().await;
    let (tx, mut rx) = mpsc::unbounded_channel();

    let sub = engine
        .subscribe(
            "orders",
            move |delivery: Delivery| {
                let tx = tx.clone();
                async move {
                    tx.send(delivery.message().clone()).unwrap();
                    Ok::<_, eyre::Report>(())
                }
            },
            SubscribeOptions::default(),
        )
        .await
        .unwrap();

    let id = engine
        .publish_json("orders", &serde_json::json!({ "sku": 7 }), PublishOptions::default())
        .await
        .unwrap()
        .id()
        .unwrap();

    let message = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(message.id, id);
    assert_eq!(message.attempt, 1);
    assert_eq!(
        message.json::<serde_json::Value>().unwrap(),
        serde_json::json!({ "sku": 7 })
    );

    let engine = &engine;
    eventually(move || async move { pending(engine, "orders").await == 0 }).await;
    assert_eq!(sub.group(), Some("default"));

    sub.unsubscribe().await.unwrap();
}

#[tokio::test]
async fn test_failing_handler_retries_until_success() {
    let engine = setup().await;
    let scheduler = Scheduler::new(&engine).spawn(CancellationToken::new());
    let attempts = Arc::new(Mutex::new(Vec::new()));

    let seen = attempts.clone();
    let sub = engine
        .subscribe(
            "orders",
            move |delivery: Delivery| {
                let seen = seen.clone();
                async move {
                    seen.lock().unwrap().push(delivery.attempt);
                    if delivery.attempt < 3 {
                        eyre::bail!("attempt {} failed", delivery.attempt);
                    }
                    Ok(())
                }
            },
            fast_retries(),
        )
        .await
        .unwrap();

    engine
        .publish("orders", "flaky", PublishOptions::default())
        .await
        .unwrap();

    let (seen, engine) = (&attempts, &engine);
    eventually(move || async move { seen.lock().unwrap().len() == 3 }).await;
    eventually(move || async move { pending(engine, "orders").await == 0 }).await;

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(*attempts.lock().unwrap(), vec![1, 2, 3]);
    assert!(engine
        .list_dead_letters(&DeadLetterFilter::default())
        .await
        .unwrap()
        .is_empty());

    sub.unsubscribe().await.unwrap();
    scheduler.shutdown().await;
}

#[tokio::test]
async fn test_connected_engine_promotes_delays_and_retries() {
    let engine = setup_with(|config| config.embedded_scheduler = true).await;
    let attempts = Arc::new(Mutex::new(Vec::new()));

    engine
        .publish(
            "orders",
            "later",
            PublishOptions::builder()
                .delay(Duration::from_millis(100))
                .build(),
        )
        .await
        .unwrap();

    let log = attempts.clone();
    let sub = engine
        .subscribe(
            "orders",
            move |delivery: Delivery| {
                let log = log.clone();
                async move {
                    log.lock().unwrap().push(delivery.attempt);
                    if delivery.attempt == 1 {
                        eyre::bail!("first attempt fails");
                    }
                    Ok(())
                }
            },
            fast_retries(),
        )
        .await
        .unwrap();

    let (seen, engine) = (&attempts, &engine);
    eventually(move || async move { seen.lock().unwrap().len() == 2 }).await;
    eventually(move || async move { pending(engine, "orders").await == 0 }).await;

    assert_eq!(*attempts.lock().unwrap(), vec![1, 2]);
    assert_eq!(engine.stats("orders").await.unwrap().scheduled, 0);

    sub.unsubscribe().await.unwrap();
    engine.close().await;
}

#[tokio::test]
async fn test_always_failing_handler_runs_max_retries_plus_one() {
    let engine = setup().await;
    let scheduler = Scheduler::new(&engine).spawn(CancellationToken::new());
    let calls = Arc::new(AtomicUsize::new(0));

    let counter = calls.clone();
    let sub = engine
        .subscribe(
            "orders",
            move |_: Delivery| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(eyre::eyre!("always broken"))
                }
            },
            SubscribeOptions::builder()
                .group("workers")
                .max_retries(2)
                .backoff(Backoff::exponential(
                    Duration::from_millis(5),
                    Duration::from_millis(20),
                ))
                .build(),
        )
        .await
        .unwrap();

    engine
        .publish("orders", "poison", PublishOptions::default())
        .await
        .unwrap();

    let engine = &engine;
    eventually(move || async move {
        !engine
            .list_dead_letters(&DeadLetterFilter::default())
            .await
            .unwrap()
            .is_empty()
    })
    .await;

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    let dead = engine
        .list_dead_letters(&DeadLetterFilter::default())
        .await
        .unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].attempts, 3);
    assert_eq!(dead[0].reason, DeadLetterReason::MaxRetriesExceeded);
    assert_eq!(dead[0].last_error.as_deref(), Some("always broken"));

    sub.unsubscribe().await.unwrap();
    scheduler.shutdown().await;
}

#[tokio::test]
async fn test_requeued_message_is_redelivered_with_first_attempt() {
    let engine = setup().await;
    let (tx, mut rx) = mpsc::unbounded_channel();

    let sub = engine
        .subscribe(
            "orders",
            move |delivery: Delivery| {
                let tx = tx.clone();
                async move {
                    tx.send(delivery.attempt).unwrap();
                    delivery.dead_letter("rejected by handler").await?;
                    Ok::<_, eyre::Report>(())
                }
            },
            SubscribeOptions::builder().group("workers").build(),
        )
        .await
        .unwrap();

    engine
        .publish("orders", "bounce", PublishOptions::default())
        .await
        .unwrap();

    assert_eq!(rx.recv().await, Some(1));
    let engine = &engine;
    eventually(move || async move {
        engine
            .list_dead_letters(&DeadLetterFilter::default())
            .await
            .unwrap()
            .len()
            == 1
    })
    .await;

    let dead = engine
        .list_dead_letters(&DeadLetterFilter::default())
        .await
        .unwrap();
    assert_eq!(dead[0].reason, DeadLetterReason::Rejected);
    assert_eq!(dead[0].last_error.as_deref(), Some("rejected by handler"));

    let requeued = engine
        .requeue_from_dlq(&DeadLetterFilter::builder().channel("orders").build())
        .await
        .unwrap();
    assert_eq!(requeued, 1);

    let attempt = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap();
    assert_eq!(attempt, Some(1));

    sub.unsubscribe().await.unwrap();
}

#[tokio::test]
async fn test_panicking_handler_is_retried() {
    let engine = setup().await;
    let scheduler = Scheduler::new(&engine).spawn(CancellationToken::new());
    let attempts = Arc::new(Mutex::new(Vec::new()));

    let seen = attempts.clone();
    let sub = engine
        .subscribe(
            "orders",
            move |delivery: Delivery| {
                let seen = seen.clone();
                async move {
                    seen.lock().unwrap().push(delivery.attempt);
                    if delivery.attempt == 1 {
                        panic!("handler bug");
                    }
                    Ok::<_, eyre::Report>(())
                }
            },
            fast_retries(),
        )
        .await
        .unwrap();

    engine
        .publish("orders", "boom", PublishOptions::default())
        .await
        .unwrap();

    let (seen, engine) = (&attempts, &engine);
    eventually(move || async move { seen.lock().unwrap().len() == 2 }).await;
    eventually(move || async move { pending(engine, "orders").await == 0 }).await;
    assert_eq!(*attempts.lock().unwrap(), vec![1, 2]);

    sub.unsubscribe().await.unwrap();
    scheduler.shutdown().await;
}

#[tokio::test]
async fn test_exactly_once_skips_processed_keys() {
    let engine = setup_with(|config| config.exactly_once = true).await;
    let effects = Arc::new(Mutex::new(Vec::new()));

    // Claimed by a consumer that died before acking.
    engine
        .publish(
            "payments",
            "charge",
            PublishOptions::builder().dedup_key("charge-1").build(),
        )
        .await
        .unwrap();
    engine
        .claim("payments", "workers", "crashed", 1, Duration::ZERO)
        .await
        .unwrap();

    let log = effects.clone();
    let sub = engine
        .subscribe(
            "payments",
            move |delivery: Delivery| {
                let log = log.clone();
                async move {
                    log.lock()
                        .unwrap()
                        .push((delivery.dedup_key.clone(), delivery.attempt));
                    Ok::<_, eyre::Report>(())
                }
            },
            SubscribeOptions::builder()
                .group("workers")
                .visibility_timeout(Duration::from_millis(50))
                .reclaim_interval(Duration::from_millis(20))
                .build(),
        )
        .await
        .unwrap();

    // The reclaim sweep redelivers it once.
    let engine = &engine;
    eventually(move || async move {
        engine
            .dedup()
            .is_processed("payments", "workers", "charge-1")
            .await
            .unwrap()
    })
    .await;

    // A duplicate publish of the same charge is acked without running the handler.
    engine
        .publish(
            "payments",
            "charge again",
            PublishOptions::builder().dedup_key("charge-1").build(),
        )
        .await
        .unwrap();
    engine
        .publish(
            "payments",
            "refund",
            PublishOptions::builder().dedup_key("refund-1").build(),
        )
        .await
        .unwrap();

    eventually(move || async move {
        engine
            .dedup()
            .is_processed("payments", "workers", "refund-1")
            .await
            .unwrap()
    })
    .await;
    eventually(move || async move { pending(engine, "payments").await == 0 }).await;

    assert_eq!(
        *effects.lock().unwrap(),
        vec![
            (Some("charge-1".to_owned()), 2),
            (Some("refund-1".to_owned()), 1)
        ]
    );

    sub.unsubscribe().await.unwrap();
}

#[tokio::test]
async fn test_exactly_once_groups_process_independently() {
    let engine = setup_with(|config| config.exactly_once = true).await;

    engine
        .publish(
            "pay",
            "charge",
            PublishOptions::builder().dedup_key("k1").build(),
        )
        .await
        .unwrap();

    let mut subs = Vec::new();
    let mut counters = Vec::new();

    for group in ["billing", "email"] {
        let calls = Arc::new(AtomicUsize::new(0));
        counters.push(calls.clone());

        subs.push(
            engine
                .subscribe(
                    "pay",
                    move |_delivery: Delivery| {
                        let calls = calls.clone();
                        async move {
                            calls.fetch_add(1, Ordering::SeqCst);
                            Ok::<_, eyre::Report>(())
                        }
                    },
                    SubscribeOptions::builder().group(group).build(),
                )
                .await
                .unwrap(),
        );
    }

    let engine = &engine;
    for group in ["billing", "email"] {
        eventually(move || async move {
            engine
                .dedup()
                .is_processed("pay", group, "k1")
                .await
                .unwrap()
        })
        .await;
    }
    eventually(move || async move { pending(engine, "pay").await == 0 }).await;

    assert_eq!(counters[0].load(Ordering::SeqCst), 1);
    assert_eq!(counters[1].load(Ordering::SeqCst), 1);

    for sub in subs {
        sub.unsubscribe().await.unwrap();
    }
}

#[tokio::test]
async fn test_exactly_once_skips_redelivery_after_lost_ack() {
    let engine = setup_with(|config| config.exactly_once = true).await;
    let calls = Arc::new(AtomicUsize::new(0));

    engine
        .publish(
            "payments",
            "charge",
            PublishOptions::builder().dedup_key("charge-7").build(),
        )
        .await
        .unwrap();

    // Processed and marked by a consumer whose ack never landed.
    let claimed = engine
        .claim("payments", "workers", "crashed", 1, Duration::ZERO)
        .await
        .unwrap();
    assert_eq!(claimed.len(), 1);
    engine
        .dedup()
        .mark_processed("payments", "workers", "charge-7", Duration::from_secs(3_600))
        .await
        .unwrap();

    let counter = calls.clone();
    let sub = engine
        .subscribe(
            "payments",
            move |_delivery: Delivery| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, eyre::Report>(())
                }
            },
            SubscribeOptions::builder()
                .group("workers")
                .visibility_timeout(Duration::from_millis(50))
                .reclaim_interval(Duration::from_millis(20))
                .build(),
        )
        .await
        .unwrap();

    let engine = &engine;
    eventually(move || async move { pending(engine, "payments").await == 0 }).await;

    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(engine.stats("payments").await.unwrap().dead_letters, 0);

    sub.unsubscribe().await.unwrap();
}

#[derive(Clone)]
struct Recorder {
    name: &'static str,
    log: Arc<Mutex<Vec<String>>>,
}

impl Recorder {
    fn push(&self, event: impl std::fmt::Display) {
        self.log
            .lock()
            .unwrap()
            .push(format!("{}:{event}", self.name));
    }
}

impl Middleware for Recorder {
    fn before_publish(&self, _channel: &str, _payload: &[u8]) -> eyre::Result<()> {
        self.push("before_publish");
        eyre::bail!("observers cannot veto a publish")
    }

    fn after_publish(&self, _channel: &str, receipt: &PublishReceipt) -> eyre::Result<()> {
        self.push(format!("after_publish({receipt})"));
        Ok(())
    }

    fn before_process(&self, message: &Message) -> eyre::Result<()> {
        self.push(format!("before_process({})", message.attempt));
        Ok(())
    }

    fn after_process(&self, _message: &Message, settlement: &Settlement) -> eyre::Result<()> {
        let outcome = match settlement {
            Settlement::Acked => "acked",
            Settlement::DeadLettered => "dead_lettered",
            Settlement::Retried { .. } => "retried",
            _ => "other",
        };
        self.push(format!("after_process({outcome})"));
        Ok(())
    }

    fn on_error(&self, _message: &Message, error: &eyre::Report) -> eyre::Result<()> {
        self.push(format!("on_error({error})"));
        Ok(())
    }
}

#[tokio::test]
async fn test_middleware_runs_in_registration_order() {
    let engine = setup().await;
    let log = Arc::new(Mutex::new(Vec::new()));

    for name in ["a", "b"] {
        engine.use_middleware(Recorder {
            name,
            log: log.clone(),
        });
    }

    let sub = engine
        .subscribe(
            "orders",
            |delivery: Delivery| async move {
                if delivery.payload.as_ref() == b"bad" {
                    eyre::bail!("bad payload");
                }
                Ok(())
            },
            SubscribeOptions::builder()
                .group("workers")
                .max_retries(0)
                .build(),
        )
        .await
        .unwrap();

    let id = engine
        .publish("orders", "good", PublishOptions::default())
        .await
        .unwrap()
        .id()
        .unwrap();
    let events = &log;
    eventually(move || async move { events.lock().unwrap().len() == 8 }).await;

    let events = std::mem::take(&mut *log.lock().unwrap());
    let publish: Vec<String> = events
        .iter()
        .filter(|e| e.contains("publish"))
        .cloned()
        .collect();
    let process: Vec<String> = events
        .iter()
        .filter(|e| e.contains("process"))
        .cloned()
        .collect();

    assert_eq!(
        publish,
        vec![
            "a:before_publish".to_owned(),
            "b:before_publish".to_owned(),
            format!("a:after_publish({id})"),
            format!("b:after_publish({id})"),
        ]
    );
    assert_eq!(
        process,
        vec![
            "a:before_process(1)",
            "b:before_process(1)",
            "a:after_process(acked)",
            "b:after_process(acked)",
        ]
    );

    engine
        .publish("orders", "bad", PublishOptions::default())
        .await
        .unwrap();
    let events = &log;
    eventually(move || async move { events.lock().unwrap().len() == 10 }).await;

    let events = std::mem::take(&mut *log.lock().unwrap());
    let failure: Vec<String> = events
        .iter()
        .filter(|e| !e.contains("publish"))
        .cloned()
        .collect();
    assert_eq!(
        failure,
        vec![
            "a:before_process(1)",
            "b:before_process(1)",
            "a:on_error(bad payload)",
            "b:on_error(bad payload)",
            "a:after_process(dead_lettered)",
            "b:after_process(dead_lettered)",
        ]
    );

    sub.unsubscribe().await.unwrap();
}

#[tokio::test]
async fn test_pub_sub_matches_wildcards() {
    let engine = setup().await;
    let (tx, mut rx) = mpsc::unbounded_channel();

    let sub = engine
        .subscribe(
            "orders.*",
            move |delivery: Delivery| {
                let tx = tx.clone();
                async move {
                    let settlement = delivery.ack().await?;
                    tx.send((delivery.channel.clone(), settlement)).unwrap();
                    Ok::<_, eyre::Report>(())
                }
            },
            SubscribeOptions::builder().use_pub_sub(true).build(),
        )
        .await
        .unwrap();
    assert_eq!(sub.group(), None);

    assert_eq!(engine.broadcast("orders.created", "1").unwrap(), 1);
    assert_eq!(engine.broadcast("orders.us.created", "2").unwrap(), 0);
    assert_eq!(engine.broadcast("payments.created", "3").unwrap(), 0);

    let (channel, settlement) = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(channel, "orders.created");
    assert_eq!(settlement, Settlement::Ephemeral);

    sub.unsubscribe().await.unwrap();

    assert_eq!(engine.broadcast("orders.created", "4").unwrap(), 0);
}

#[tokio::test]
async fn test_patterns_require_pub_sub() {
    let engine = setup().await;

    let err = engine
        .subscribe(
            "orders.>",
            |_: Delivery| async { Ok::<_, eyre::Report>(()) },
            SubscribeOptions::default(),
        )
        .await
        .err()
        .unwrap();

    assert!(matches!(err, Error::InvalidParameter { .. }));
}

#[tokio::test]
async fn test_unsubscribe_drains_in_flight_handlers() {
    let engine = setup().await;
    let (started_tx, mut started_rx) = mpsc::unbounded_channel();
    let finished = Arc::new(AtomicUsize::new(0));

    let done = finished.clone();
    let sub = engine
        .subscribe(
            "orders",
            move |_: Delivery| {
                let started_tx = started_tx.clone();
                let done = done.clone();
                async move {
                    started_tx.send(()).unwrap();
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    done.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, eyre::Report>(())
                }
            },
            SubscribeOptions::builder().group("workers").build(),
        )
        .await
        .unwrap();

    engine
        .publish("orders", "slow", PublishOptions::default())
        .await
        .unwrap();

    started_rx.recv().await.unwrap();
    assert_eq!(sub.state(), SubscriptionState::Processing);

    sub.unsubscribe().await.unwrap();

    assert_eq!(finished.load(Ordering::SeqCst), 1);
    assert_eq!(pending(&engine, "orders").await, 0);
}

#[tokio::test]
async fn test_unsubscribe_interrupts_a_blocked_claim() {
    let engine = setup().await;
    let calls = Arc::new(AtomicUsize::new(0));

    let counter = calls.clone();
    let sub = engine
        .subscribe(
            "orders",
            move |_: Delivery| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, eyre::Report>(())
                }
            },
            SubscribeOptions::builder()
                .group("workers")
                .block(Duration::from_secs(30))
                .build(),
        )
        .await
        .unwrap();

    {
        let sub = &sub;
        eventually(move || async move { sub.state() == SubscriptionState::Polling }).await;
    }

    tokio::time::timeout(Duration::from_secs(5), sub.unsubscribe())
        .await
        .expect("unsubscribe waited out the claim block")
        .unwrap();

    engine
        .publish("orders", "after", PublishOptions::default())
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(pending(&engine, "orders").await, 0);
}

#[tokio::test]
async fn test_concurrency_limit_is_respected() {
    let engine = setup().await;
    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let handled = Arc::new(AtomicUsize::new(0));

    let (r, p, h) = (running.clone(), peak.clone(), handled.clone());
    let sub = engine
        .subscribe(
            "orders",
            move |_: Delivery| {
                let (running, peak, handled) = (r.clone(), p.clone(), h.clone());
                async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                    handled.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, eyre::Report>(())
                }
            },
            SubscribeOptions::builder()
                .group("workers")
                .concurrency(3)
                .batch_size(10)
                .build(),
        )
        .await
        .unwrap();

    for i in 0..12 {
        engine
            .publish("orders", format!("{i}"), PublishOptions::default())
            .await
            .unwrap();
    }

    let done = &handled;
    eventually(move || async move { done.load(Ordering::SeqCst) == 12 }).await;
    assert!(peak.load(Ordering::SeqCst) <= 3);

    sub.unsubscribe().await.unwrap();
}
