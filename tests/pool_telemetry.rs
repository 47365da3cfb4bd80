use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use keypool::pool::ledger::{DAY_MS, HOUR_MS, day_start};
use keypool::pool::{MemoryStore, RetentionPolicy, UsageTelemetry};
use keypool::{Clock, UsageLedgerStore};

// 2024-03-10T00:00:00Z
const BASE_MS: u64 = 1_710_028_800_000;

struct SteppedClock {
    now: AtomicU64,
}

impl SteppedClock {
    fn at(now: u64) -> Arc<Self> {
        Arc::new(Self {
            now: AtomicU64::new(now),
        })
    }

    fn set(&self, now: u64) {
        self.now.store(now, Ordering::SeqCst);
    }
}

impl Clock for SteppedClock {
    fn now_epoch_millis(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

#[tokio::test]
async fn successes_in_one_hour_share_a_bucket() {
    let store = MemoryStore::new();
    let clock = SteppedClock::at(BASE_MS + 5 * 60 * 1000);
    let telemetry = UsageTelemetry::new(
        "http://127.0.0.1:8080",
        Arc::new(store.clone()),
        clock.clone(),
        RetentionPolicy::default(),
    );

    let latencies = [10u64, 20, 30, 40, 50, 60, 70];
    for (i, latency) in latencies.iter().enumerate() {
        clock.set(BASE_MS + 5 * 60 * 1000 + i as u64 * 60 * 1000);
        telemetry.record_success(*latency).await;
    }

    let ledger = telemetry.ledger().await.expect("ledger");
    assert_eq!(ledger.total_allocations, 7);
    assert_eq!(ledger.total_api_calls, 7);
    assert_eq!(ledger.hourly.len(), 1);
    assert_eq!(ledger.hourly[0].hour_start_ms, BASE_MS);
    assert_eq!(ledger.hourly[0].allocations, 7);
    assert!((ledger.hourly[0].average_response_time_ms - 40.0).abs() < 1e-9);
    assert_eq!(ledger.daily.len(), 1);
    assert_eq!(ledger.daily[0].date, "2024-03-10");
    assert!((ledger.average_response_time_ms - 40.0).abs() < 1e-9);
    assert_eq!(ledger.last_used_at_ms, Some(BASE_MS + 11 * 60 * 1000));
}

#[tokio::test]
async fn daily_buckets_keep_only_the_most_recent_window() {
    let store = MemoryStore::new();
    let clock = SteppedClock::at(BASE_MS);
    let telemetry = UsageTelemetry::new(
        "pool-a",
        Arc::new(store.clone()),
        clock.clone(),
        RetentionPolicy::default(),
    );

    for day in 0..35u64 {
        clock.set(BASE_MS + day * DAY_MS + HOUR_MS);
        telemetry.record_success(15).await;
    }

    let ledger = telemetry.ledger().await.expect("ledger");
    assert_eq!(ledger.total_allocations, 35);
    assert_eq!(ledger.daily.len(), 30);
    let first = ledger.daily.first().expect("first");
    let last = ledger.daily.last().expect("last");
    assert_eq!(first.day_start_ms, day_start(BASE_MS + 5 * DAY_MS));
    assert_eq!(last.day_start_ms, day_start(BASE_MS + 34 * DAY_MS));
    assert!(
        ledger
            .daily
            .windows(2)
            .all(|pair| pair[0].day_start_ms < pair[1].day_start_ms)
    );
    assert!(ledger.hourly.len() <= 24);
}

#[tokio::test]
async fn failures_count_as_calls_without_allocations() {
    let store = MemoryStore::new();
    let clock = SteppedClock::at(BASE_MS);
    let telemetry = UsageTelemetry::new(
        "pool-a",
        Arc::new(store.clone()),
        clock.clone(),
        RetentionPolicy::default(),
    );

    telemetry.record_success(100).await;
    telemetry.record_failure("all credentials quarantined").await;
    telemetry.record_failure("no healthy credentials").await;

    let ledger = telemetry.ledger().await.expect("ledger");
    assert_eq!(ledger.total_api_calls, 3);
    assert_eq!(ledger.successful_requests, 1);
    assert_eq!(ledger.failed_requests, 2);
    assert_eq!(ledger.total_allocations, 1);
    assert!((ledger.success_rate() - 100.0 / 3.0).abs() < 1e-9);
    assert_eq!(ledger.daily[0].failed_requests, 2);
}

#[tokio::test]
async fn instances_keep_separate_ledgers() {
    let store = MemoryStore::new();
    let clock = SteppedClock::at(BASE_MS);
    let a = UsageTelemetry::new(
        "pool-a",
        Arc::new(store.clone()),
        clock.clone(),
        RetentionPolicy::default(),
    );
    let b = UsageTelemetry::new(
        "pool-b",
        Arc::new(store.clone()),
        clock.clone(),
        RetentionPolicy::default(),
    );

    a.record_success(10).await;
    a.record_success(30).await;
    b.record_success(50).await;
    b.record_failure("no healthy credentials").await;

    assert_eq!(store.list_ledgers().await.expect("list").len(), 2);
    let aggregate = a.aggregate().await.expect("aggregate");
    assert_eq!(aggregate.instances, 2);
    assert_eq!(aggregate.total_allocations, 3);
    assert_eq!(aggregate.total_api_calls, 4);
    assert_eq!(aggregate.failed_requests, 1);
    assert!((aggregate.success_rate - 75.0).abs() < 1e-9);
}
