mod common;

use std::{collections::HashSet, sync::Arc, time::Duration};

use bulk_emitter::{
    conversions::{json::JsonSerializer, Payload},
    pipeline::{
        config::{ConfigError, DeliveryConfig},
        delivery::{BatchDelivery, LifecycleError, LifecycleState},
        destinations::{FailureKind, ItemFailure},
        failure::{FailureReason, RetryPolicy},
        items::{
            pooled::{BufferPool, PooledItemSourceFactory},
            ItemSource, ItemSourceFactory,
        },
    },
};
use common::{Script, ScriptedFactory};
use tokio::time::{sleep, Instant};
use tracing::Span;

fn delivery(config: DeliveryConfig, factory: &ScriptedFactory) -> BatchDelivery<ScriptedFactory> {
    BatchDelivery::new(config, factory.clone(), Span::none()).expect("valid config")
}

fn retrying(max_batch_size: usize, max_retries: u32, backoff: Duration) -> DeliveryConfig {
    DeliveryConfig {
        retry: RetryPolicy::new(max_retries).with_backoff(backoff, backoff),
        ..DeliveryConfig::new(max_batch_size, Duration::from_millis(1000))
    }
}

#[tokio::test(start_paused = true)]
async fn size_flush_then_idle_timer_sends_nothing() {
    let factory = ScriptedFactory::default();
    let delivery = delivery(DeliveryConfig::new(3, Duration::from_millis(1000)), &factory);
    delivery.start().unwrap();

    delivery.add(ItemSource::from("A")).unwrap();
    delivery.add(ItemSource::from("B")).unwrap();
    assert_eq!(delivery.emitter().pending(), 2);

    delivery.add(ItemSource::from("C")).unwrap();
    assert_eq!(delivery.emitter().pending(), 0);

    sleep(Duration::from_millis(10)).await;
    assert_eq!(factory.delivered_payloads(), vec!["A", "B", "C"]);

    sleep(Duration::from_millis(1000)).await;
    assert_eq!(factory.delivered().len(), 1);

    delivery.stop().await;
    assert_eq!(factory.delivered().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn timer_flushes_partial_batch() {
    let factory = ScriptedFactory::default();
    let delivery = delivery(DeliveryConfig::new(100, Duration::from_millis(500)), &factory);
    delivery.start().unwrap();

    delivery.add(ItemSource::from("lonely")).unwrap();
    sleep(Duration::from_millis(400)).await;
    assert!(factory.delivered().is_empty());

    sleep(Duration::from_millis(200)).await;
    assert_eq!(factory.delivered_payloads(), vec!["lonely"]);

    delivery.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_producers_lose_and_duplicate_nothing() {
    const THREADS: usize = 8;
    const PER_THREAD: usize = 1000;

    let factory = ScriptedFactory::default();
    let delivery = Arc::new(delivery(
        DeliveryConfig::new(16, Duration::from_millis(2)),
        &factory,
    ));
    delivery.start().unwrap();

    let producers = (0..THREADS)
        .map(|t| {
            let delivery = delivery.clone();
            std::thread::spawn(move || {
                for i in 0..PER_THREAD {
                    delivery
                        .add(ItemSource::from(format!("{t}:{i}").as_str()))
                        .unwrap();
                }
            })
        })
        .collect::<Vec<_>>();
    tokio::task::spawn_blocking(move || {
        for producer in producers {
            producer.join().unwrap();
        }
    })
    .await
    .unwrap();

    delivery.stop().await;

    let delivered = factory.delivered();
    let ids = delivered.iter().map(|d| d.id).collect::<HashSet<_>>();
    assert_eq!(ids.len(), delivered.len(), "a batch was delivered twice");

    for batch in &delivered {
        assert!(batch.payloads.len() <= 16);
        let mut last = vec![None; THREADS];
        for payload in &batch.payloads {
            let (t, i) = payload.split_once(':').unwrap();
            let (t, i): (usize, usize) = (t.parse().unwrap(), i.parse().unwrap());
            if let Some(prev) = last[t] {
                assert!(i > prev, "items of thread {t} reordered within a batch");
            }
            last[t] = Some(i);
        }
    }

    let mut seen = factory.delivered_payloads();
    let total = seen.len();
    seen.sort();
    seen.dedup();
    assert_eq!(total, THREADS * PER_THREAD);
    assert_eq!(seen.len(), THREADS * PER_THREAD);
}

#[tokio::test]
async fn lifecycle_rejects_misuse() {
    let factory = ScriptedFactory::default();
    let delivery = delivery(DeliveryConfig::new(10, Duration::from_millis(1000)), &factory);
    assert!(delivery.is_stopped());

    let rejected = delivery.add(ItemSource::from("early")).unwrap_err();
    assert_eq!(rejected.into_item().payload(), b"early");

    delivery.start().unwrap();
    assert!(delivery.is_started());
    assert!(matches!(delivery.start(), Err(LifecycleError::AlreadyStarted)));

    delivery.stop().await;
    assert!(delivery.is_stopped());
    assert!(delivery.add(ItemSource::from("late")).is_err());

    // a stopped instance can be started again
    delivery.start().unwrap();
    delivery.add(ItemSource::from("again")).unwrap();
    delivery.stop().await;
    assert_eq!(factory.delivered_payloads(), vec!["again"]);
}

#[test]
fn start_requires_a_runtime() {
    let factory = ScriptedFactory::default();
    let delivery = delivery(DeliveryConfig::default(), &factory);

    assert!(matches!(delivery.start(), Err(LifecycleError::NoRuntime)));
}

#[test]
fn invalid_config_fails_at_construction() {
    let result = BatchDelivery::new(
        DeliveryConfig::new(0, Duration::from_millis(1000)),
        ScriptedFactory::default(),
        Span::none(),
    );

    assert!(matches!(result, Err(ConfigError::ZeroBatchSize)));
}

#[tokio::test(start_paused = true)]
async fn stop_drains_partial_batch() {
    let factory = ScriptedFactory::default();
    let delivery = delivery(DeliveryConfig::new(10, Duration::from_secs(60)), &factory);
    delivery.start().unwrap();

    delivery.add(ItemSource::from("one")).unwrap();
    delivery.add(ItemSource::from("two")).unwrap();
    delivery.stop().await;

    assert_eq!(factory.delivered_payloads(), vec!["one", "two"]);
}

#[tokio::test(start_paused = true)]
async fn transient_failure_is_retried_in_a_new_batch() {
    let factory = ScriptedFactory::with_script(vec![Script::Timeout]);
    let delivery = delivery(retrying(2, 1, Duration::from_millis(10)), &factory);
    delivery.start().unwrap();

    delivery.add(ItemSource::from("A")).unwrap();
    delivery.add(ItemSource::from("B")).unwrap();
    sleep(Duration::from_millis(50)).await;

    let delivered = factory.delivered();
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].payloads, vec!["A", "B"]);
    assert!(factory.failures.dropped.lock().unwrap().is_empty());

    delivery.stop().await;
}

#[tokio::test(start_paused = true)]
async fn retries_are_bounded() {
    let factory = ScriptedFactory::with_script(vec![Script::Timeout, Script::Timeout]);
    let delivery = delivery(retrying(1, 1, Duration::from_millis(10)), &factory);
    delivery.start().unwrap();

    delivery.add(ItemSource::from("doomed")).unwrap();
    sleep(Duration::from_millis(100)).await;

    {
        let dropped = factory.failures.dropped.lock().unwrap();
        assert_eq!(dropped.len(), 1);
        assert_eq!(dropped[0].payloads, vec!["doomed"]);
        assert_eq!(dropped[0].attempts, vec![2]);
        assert!(matches!(
            dropped[0].reason,
            FailureReason::RetriesExhausted { attempts: 2, .. }
        ));
    }
    assert!(factory.delivered().is_empty());

    delivery.stop().await;
}

#[tokio::test(start_paused = true)]
async fn permanent_failure_is_not_retried() {
    let factory = ScriptedFactory::with_script(vec![Script::Reject(400)]);
    let delivery = delivery(retrying(1, 3, Duration::from_millis(10)), &factory);
    delivery.start().unwrap();

    delivery.add(ItemSource::from("malformed")).unwrap();
    sleep(Duration::from_millis(100)).await;

    {
        let dropped = factory.failures.dropped.lock().unwrap();
        assert_eq!(dropped.len(), 1);
        assert!(matches!(dropped[0].reason, FailureReason::Rejected(_)));
        assert_eq!(dropped[0].attempts, vec![0]);
    }
    assert!(factory.delivered().is_empty());

    delivery.stop().await;
}

#[tokio::test(start_paused = true)]
async fn partial_failure_splits_items() {
    let factory = ScriptedFactory::with_script(vec![Script::Partial(vec![
        ItemFailure {
            index: 1,
            kind: FailureKind::Permanent,
            reason: "mapper_parsing_exception".into(),
        },
        ItemFailure {
            index: 2,
            kind: FailureKind::Transient,
            reason: "es_rejected_execution_exception".into(),
        },
    ])]);
    let delivery = delivery(retrying(3, 1, Duration::from_millis(10)), &factory);
    delivery.start().unwrap();

    for payload in ["A", "B", "C"] {
        delivery.add(ItemSource::from(payload)).unwrap();
    }
    // the retried item waits in a new batch for the timer
    sleep(Duration::from_millis(1100)).await;

    let delivered = factory.delivered();
    assert_eq!(delivered.len(), 2);
    assert_eq!(delivered[1].payloads, vec!["C"]);
    assert_ne!(delivered[0].id, delivered[1].id);

    {
        let dropped = factory.failures.dropped.lock().unwrap();
        assert_eq!(dropped.len(), 1);
        assert_eq!(dropped[0].payloads, vec!["B"]);
        assert_eq!(
            dropped[0].reason,
            FailureReason::Rejected("mapper_parsing_exception".into())
        );
    }

    delivery.stop().await;
}

#[tokio::test(start_paused = true)]
async fn pending_retry_is_handed_to_failure_handler_on_stop() {
    let factory = ScriptedFactory::with_script(vec![Script::Timeout]);
    let delivery = delivery(retrying(1, 3, Duration::from_secs(30)), &factory);
    delivery.start().unwrap();

    delivery.add(ItemSource::from("in-backoff")).unwrap();
    sleep(Duration::from_millis(5)).await;

    let started = Instant::now();
    delivery.stop().await;
    assert!(started.elapsed() < Duration::from_secs(1));

    let dropped = factory.failures.dropped.lock().unwrap();
    assert_eq!(dropped.len(), 1);
    assert_eq!(dropped[0].payloads, vec!["in-backoff"]);
    assert!(matches!(dropped[0].reason, FailureReason::ShuttingDown(_)));
}

#[tokio::test(start_paused = true)]
async fn stop_hands_abandoned_batches_to_failure_handler() {
    let factory = ScriptedFactory::with_script(vec![Script::Stall(Duration::from_secs(60))]);
    let config = DeliveryConfig {
        shutdown_grace_period_ms: 100,
        max_in_flight: 1,
        ..DeliveryConfig::new(1, Duration::from_millis(1000))
    };
    let delivery = delivery(config, &factory);
    delivery.start().unwrap();

    // "a" stalls in flight, "b" waits for the only delivery slot, "c" stays queued
    for message in ["a", "b", "c"] {
        delivery.add(ItemSource::from(message)).unwrap();
    }
    sleep(Duration::from_millis(5)).await;

    let started = Instant::now();
    delivery.stop().await;

    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(100));
    assert!(elapsed < Duration::from_secs(60));
    assert!(delivery.is_stopped());

    {
        let dropped = factory.failures.dropped.lock().unwrap();
        let mut abandoned = dropped
            .iter()
            .inspect(|failed| assert_eq!(failed.reason, FailureReason::Abandoned))
            .flat_map(|failed| failed.payloads.clone())
            .collect::<Vec<_>>();
        abandoned.sort();
        assert_eq!(abandoned, vec!["a", "b", "c"]);
    }

    // the stalled delivery was cancelled, nothing shows up later
    sleep(Duration::from_secs(120)).await;
    assert!(factory.delivered().is_empty());
    assert_eq!(factory.failures.dropped.lock().unwrap().len(), 3);
}

#[tokio::test(start_paused = true)]
async fn start_is_rejected_while_stopping() {
    let factory = ScriptedFactory::with_script(vec![Script::Stall(Duration::from_millis(50))]);
    let delivery = delivery(DeliveryConfig::new(1, Duration::from_millis(1000)), &factory);
    delivery.start().unwrap();
    delivery.add(ItemSource::from("slow")).unwrap();

    let ((), (state, restart)) = tokio::join!(delivery.stop(), async {
        tokio::task::yield_now().await;
        (delivery.state(), delivery.start())
    });

    assert_eq!(state, LifecycleState::Stopping);
    assert!(matches!(restart, Err(LifecycleError::Stopping)));
    assert!(delivery.is_stopped());
    assert_eq!(factory.delivered_payloads(), vec!["slow"]);

    delivery.start().unwrap();
    delivery.add(ItemSource::from("after")).unwrap();
    delivery.stop().await;
    assert_eq!(factory.delivered_payloads(), vec!["slow", "after"]);
}

#[tokio::test(start_paused = true)]
async fn pooled_buffers_are_returned_after_delivery() {
    let pool = BufferPool::new(4, 4, 128);
    let items = PooledItemSourceFactory::new(JsonSerializer::default(), pool.clone());
    let factory = ScriptedFactory::default();
    let delivery = delivery(DeliveryConfig::new(2, Duration::from_millis(1000)), &factory);
    delivery.start().unwrap();

    for message in ["a", "b", "c", "d"] {
        let item = items.create(&Payload::from(message)).unwrap();
        delivery.add(item).unwrap();
    }
    assert_eq!(pool.available(), 0);

    delivery.stop().await;

    assert_eq!(factory.delivered().len(), 2);
    assert_eq!(pool.available(), 4);
}
