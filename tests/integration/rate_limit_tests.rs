use std::sync::Arc;

use async_trait::async_trait;
use windowgate_common::{GateError, GateResult, RateLimitConfig, RateLimitKey, StreamMessage};
use windowgate_rate_limit::{Decision, ManualClock, RateLimiter};
use windowgate_store::{CounterStore, MemoryCounterStore, MemoryStream, StreamConsumer};

// 2026-10-19T11:51:00Z
const T0: i64 = 1_792_410_660;

fn config(limit: u64) -> RateLimitConfig {
    let mut config = RateLimitConfig::default();
    config.max_requests = limit;
    config
}

/// Drain everything on the stream into the store, one increment per message.
async fn settle(stream: &MemoryStream, store: &MemoryCounterStore) {
    while let Some(batch) = stream.next_batch().await.unwrap() {
        for delivered in &batch.messages {
            for increment in StreamMessage::decode(&delivered.payload).unwrap().into_increments() {
                let msg = increment.unwrap();
                store.increment(&msg.key(), msg.count).await.unwrap();
            }
        }
        stream.ack(&batch).await.unwrap();
    }
}

async fn admitted(limiter: &RateLimiter, token: &str, attempts: usize) -> usize {
    let mut admitted = 0;
    for _ in 0..attempts {
        if limiter.check(Some(token)).await.is_allowed() {
            admitted += 1;
        }
    }
    admitted
}

#[tokio::test]
async fn test_single_process_counts_down_to_rejection() {
    let limiter = RateLimiter::with_clock(
        &config(10),
        Arc::new(MemoryCounterStore::new()),
        Arc::new(MemoryStream::new(4, 100)),
        Arc::new(ManualClock::new(T0)),
    );

    let mut remaining = Vec::new();
    for _ in 0..10 {
        match limiter.check(Some("api-token")).await {
            Decision::Admitted(info) => remaining.push(info.remaining),
            other => panic!("expected admit, got {:?}", other),
        }
    }
    assert_eq!(remaining, vec![9, 8, 7, 6, 5, 4, 3, 2, 1, 0]);

    assert!(matches!(
        limiter.check(Some("api-token")).await,
        Decision::Rejected(_)
    ));
}

#[tokio::test]
async fn test_two_processes_overshoot_is_bounded() {
    let clock = Arc::new(ManualClock::new(T0));
    let store = Arc::new(MemoryCounterStore::new());
    let stream = Arc::new(MemoryStream::new(4, 100));

    let a = RateLimiter::with_clock(&config(10), store.clone(), stream.clone(), clock.clone());
    let b = RateLimiter::with_clock(&config(10), store.clone(), stream.clone(), clock.clone());

    // neither process sees the other before its cache goes stale
    let total = admitted(&a, "shared", 15).await + admitted(&b, "shared", 15).await;
    assert_eq!(total, 20, "up to 2L across two processes");

    // flushes reach the stream once the interval passes, then aggregate
    clock.advance(5);
    a.flush_if_needed().await.unwrap();
    b.flush_if_needed().await.unwrap();
    settle(&stream, &store).await;

    let key = a.key_for(Some("shared")).unwrap();
    assert_eq!(store.get(&key).await.unwrap(), 20);

    // after the invalidation interval both refresh and reject
    clock.advance(25);
    assert!(!a.check(Some("shared")).await.is_allowed());
    assert!(!b.check(Some("shared")).await.is_allowed());
}

#[tokio::test]
async fn test_overshoot_bound_scales_with_process_count() {
    let clock = Arc::new(ManualClock::new(T0));
    let store = Arc::new(MemoryCounterStore::new());
    let stream = Arc::new(MemoryStream::new(1, 100));

    let limiters: Vec<RateLimiter> = (0..3)
        .map(|_| RateLimiter::with_clock(&config(4), store.clone(), stream.clone(), clock.clone()))
        .collect();

    let mut total = 0;
    for limiter in &limiters {
        total += admitted(limiter, "token", 10).await;
    }

    assert_eq!(total, 12);
}

#[tokio::test]
async fn test_refresh_picks_up_other_processes() {
    let clock = Arc::new(ManualClock::new(T0));
    let store = Arc::new(MemoryCounterStore::new());
    let stream = Arc::new(MemoryStream::new(2, 100));

    let a = RateLimiter::with_clock(&config(10), store.clone(), stream.clone(), clock.clone());
    let b = RateLimiter::with_clock(&config(10), store.clone(), stream.clone(), clock.clone());

    // b reads the empty store first
    assert!(b.check(Some("t")).await.is_allowed());

    assert_eq!(admitted(&a, "t", 6).await, 6);
    clock.advance(5);
    a.flush_if_needed().await.unwrap();
    b.flush_if_needed().await.unwrap();
    settle(&stream, &store).await;

    clock.advance(25);
    // b's stale cache is replaced by the durable 7
    match b.check(Some("t")).await {
        Decision::Admitted(info) => assert_eq!(info.remaining, 2),
        other => panic!("expected admit, got {:?}", other),
    }
}

struct UnreachableStore;

#[async_trait]
impl CounterStore for UnreachableStore {
    async fn increment(&self, _key: &RateLimitKey, _delta: u64) -> GateResult<()> {
        Err(GateError::Store("connection refused".into()))
    }

    async fn get(&self, _key: &RateLimitKey) -> GateResult<u64> {
        Err(GateError::Store("connection refused".into()))
    }
}

#[tokio::test]
async fn test_store_outage_admits_from_zero() {
    let limiter = RateLimiter::with_clock(
        &config(10),
        Arc::new(UnreachableStore),
        Arc::new(MemoryStream::new(1, 100)),
        Arc::new(ManualClock::new(T0)),
    );

    match limiter.check(Some("t")).await {
        Decision::Admitted(info) => assert_eq!(info.remaining, 9),
        other => panic!("expected admit, got {:?}", other),
    }
    // the local buffer still enforces the limit within the process
    assert_eq!(admitted(&limiter, "t", 20).await, 9);
}

#[tokio::test]
async fn test_window_rollover_resets_budget() {
    let clock = Arc::new(ManualClock::new(T0 + 59));
    let limiter = RateLimiter::with_clock(
        &config(3),
        Arc::new(MemoryCounterStore::new()),
        Arc::new(MemoryStream::new(1, 100)),
        clock.clone(),
    );

    assert_eq!(admitted(&limiter, "t", 5).await, 3);

    // one second later a new window opens: the boundary burst
    clock.advance(1);
    assert_eq!(admitted(&limiter, "t", 5).await, 3);
}

#[tokio::test]
async fn test_shutdown_flush_publishes_remaining_increments() {
    let stream = Arc::new(MemoryStream::new(1, 100));
    let limiter = RateLimiter::with_clock(
        &config(10),
        Arc::new(MemoryCounterStore::new()),
        stream.clone(),
        Arc::new(ManualClock::new(T0)),
    );

    admitted(&limiter, "a", 3).await;
    admitted(&limiter, "b", 2).await;

    let report = limiter.shutdown_flush().await.unwrap();
    assert_eq!(report.keys, 2);
    assert_eq!(report.increments, 5);
    assert_eq!(stream.pending(), 2);
    assert_eq!(limiter.buffered_keys(), 0);
}
