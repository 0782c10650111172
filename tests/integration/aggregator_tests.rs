use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use windowgate_aggregator::StreamAggregator;
use windowgate_common::{
    AggregationMessage, GateResult, PublishMode, RateLimitConfig, RateLimitKey, StreamMessage,
};
use windowgate_rate_limit::{ManualClock, RateLimiter};
use windowgate_store::{
    CounterStore, MemoryCounterStore, MemoryStream, StreamPublisher, StreamRecord,
};

const WINDOW: &str = "2026-10-19-11-51";

#[derive(Default)]
struct RecordingStore {
    increments: Mutex<Vec<(RateLimitKey, u64)>>,
}

#[async_trait]
impl CounterStore for RecordingStore {
    async fn increment(&self, key: &RateLimitKey, delta: u64) -> GateResult<()> {
        self.increments.lock().unwrap().push((key.clone(), delta));
        Ok(())
    }

    async fn get(&self, _key: &RateLimitKey) -> GateResult<u64> {
        Ok(0)
    }
}

fn request_count(entity: &str, count: u64) -> StreamRecord {
    StreamRecord {
        partition_key: entity.to_string(),
        payload: StreamMessage::RequestCount(AggregationMessage {
            entity_id: entity.to_string(),
            window_identifier: WINDOW.to_string(),
            count,
            timestamp: 1_792_410_690,
        })
        .encode()
        .unwrap(),
    }
}

fn aggregator(store: Arc<dyn CounterStore>, stream: Arc<MemoryStream>) -> StreamAggregator {
    StreamAggregator::new(store, stream, Duration::from_millis(10))
}

#[tokio::test]
async fn test_same_key_messages_become_one_increment() {
    let stream = Arc::new(MemoryStream::new(1, 100));
    stream
        .publish(vec![
            request_count("entity", 2),
            request_count("entity", 5),
            request_count("entity", 1),
        ])
        .await
        .unwrap();

    let store = Arc::new(RecordingStore::default());
    let report = aggregator(store.clone(), stream.clone())
        .poll_once()
        .await
        .unwrap()
        .unwrap();

    assert_eq!(report.messages, 3);
    assert_eq!(report.keys, 1);
    let increments = store.increments.lock().unwrap();
    assert_eq!(
        *increments,
        vec![(RateLimitKey::new("entity", WINDOW), 8)]
    );
    assert_eq!(stream.pending(), 0);
}

#[tokio::test]
async fn test_malformed_message_does_not_abort_batch() {
    let stream = Arc::new(MemoryStream::new(1, 100));
    stream
        .publish(vec![
            request_count("entity", 3),
            StreamRecord {
                partition_key: "entity".into(),
                payload: br#"{"type":"request_count","entity_id":"entity"}"#.to_vec(),
            },
        ])
        .await
        .unwrap();

    let store = Arc::new(MemoryCounterStore::new());
    let agg = aggregator(store.clone(), stream.clone());
    let report = agg.poll_once().await.unwrap().unwrap();

    assert_eq!(report.skipped, 1);
    assert_eq!(report.applied, 3);
    assert_eq!(
        store.get(&RateLimitKey::new("entity", WINDOW)).await.unwrap(),
        3
    );
    assert_eq!(stream.pending(), 0, "batch with skipped messages is still acknowledged");
    assert_eq!(agg.stats().skipped, 1);
}

#[tokio::test]
async fn test_limiter_to_store_pipeline() {
    for mode in [PublishMode::PerKey, PublishMode::Batched] {
        let clock = Arc::new(ManualClock::new(1_792_410_660));
        let store = Arc::new(MemoryCounterStore::new());
        let stream = Arc::new(MemoryStream::new(4, 100));

        let mut config = RateLimitConfig::default();
        config.publish_mode = mode;
        let limiter = RateLimiter::with_clock(&config, store.clone(), stream.clone(), clock.clone());

        for _ in 0..4 {
            limiter.check(Some("alpha")).await;
        }
        limiter.check(Some("beta")).await;
        limiter.shutdown_flush().await.unwrap();

        let agg = aggregator(store.clone(), stream.clone());
        while agg.poll_once().await.unwrap().is_some() {}

        let alpha = limiter.key_for(Some("alpha")).unwrap();
        let beta = limiter.key_for(Some("beta")).unwrap();
        assert_eq!(store.get(&alpha).await.unwrap(), 4, "{:?}", mode);
        assert_eq!(store.get(&beta).await.unwrap(), 1, "{:?}", mode);
        assert_eq!(agg.stats().applied, 5);
    }
}

#[tokio::test]
async fn test_in_process_aggregator_converges_limiters() {
    let clock = Arc::new(ManualClock::new(1_792_410_660));
    let store = Arc::new(MemoryCounterStore::new());
    let stream = Arc::new(MemoryStream::new(2, 100));

    let mut config = RateLimitConfig::default();
    config.max_requests = 5;
    let a = RateLimiter::with_clock(&config, store.clone(), stream.clone(), clock.clone());
    let b = RateLimiter::with_clock(&config, store.clone(), stream.clone(), clock.clone());

    let agg = Arc::new(aggregator(store.clone(), stream.clone()));
    let (tx, rx) = tokio::sync::watch::channel(false);
    let runner = {
        let agg = agg.clone();
        tokio::spawn(async move { agg.run(rx).await })
    };

    for _ in 0..3 {
        assert!(a.check(Some("t")).await.is_allowed());
    }
    a.shutdown_flush().await.unwrap();

    let key = a.key_for(Some("t")).unwrap();
    tokio::time::timeout(Duration::from_secs(2), async {
        while store.get(&key).await.unwrap() < 3 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("aggregator did not apply the flush");

    // b has never cached this key, so it reads the aggregated 3
    assert!(b.check(Some("t")).await.is_allowed());
    assert!(b.check(Some("t")).await.is_allowed());
    assert!(!b.check(Some("t")).await.is_allowed());

    tx.send(true).unwrap();
    runner.await.unwrap();
}
