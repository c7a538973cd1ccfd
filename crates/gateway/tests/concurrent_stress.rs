//! Concurrency tests for the admission gate behind a [`Gateway`].
//!
//! These run real tasks on a multi-threaded runtime and check the gate's
//! bound, its draining shutdown, and the init / shutdown / reinit lifecycle.

#![allow(clippy::expect_used, clippy::panic)]

use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use docstore_gateway::{
    AdmissionController, CallContext, ErrorKind, Metrics,
    testutil::{make_order, memory_client, test_gateway},
};
use tokio::task::JoinSet;

/// Number of concurrent tasks.
const CONCURRENCY: usize = 48;

/// Admission capacity under test.
const CAPACITY: usize = 4;

// ---------------------------------------------------------------------------
// Records the highest number of simultaneous entries
// ---------------------------------------------------------------------------

#[derive(Default)]
struct PeakTracker {
    current: AtomicUsize,
    peak: AtomicUsize,
}

impl PeakTracker {
    async fn hold(&self, duration: Duration) {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(duration).await;
        self.current.fetch_sub(1, Ordering::SeqCst);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn admission_bound_holds_under_load() {
    let controller = Arc::new(
        AdmissionController::with_capacity(CAPACITY, Metrics::new()).expect("valid capacity"),
    );
    let tracker = Arc::new(PeakTracker::default());

    let mut set = JoinSet::new();
    for _ in 0..CONCURRENCY {
        let controller = Arc::clone(&controller);
        let tracker = Arc::clone(&tracker);
        set.spawn(async move {
            controller
                .execute(&CallContext::new(), async {
                    tracker.hold(Duration::from_millis(2)).await;
                    Ok(())
                })
                .await
        });
    }
    while let Some(joined) = set.join_next().await {
        joined.expect("task panicked").expect("admitted call should succeed");
    }

    let peak = tracker.peak.load(Ordering::SeqCst);
    assert!(peak <= CAPACITY, "peak concurrency {peak} exceeded capacity {CAPACITY}");
    assert!(peak > 0);
    assert_eq!(controller.current_load(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn gateway_writes_all_land_under_bounded_admission() {
    let client = Arc::new(memory_client());
    client.set_latency(Duration::from_millis(1));
    let gateway = Arc::new(test_gateway(Arc::clone(&client), CAPACITY));

    let mut set = JoinSet::new();
    for idx in 0..CONCURRENCY {
        let gateway = Arc::clone(&gateway);
        set.spawn(async move {
            gateway.put_item(&CallContext::new(), &make_order("stress", idx)).await
        });
    }
    while let Some(joined) = set.join_next().await {
        joined.expect("task panicked").expect("put should succeed");
    }

    assert_eq!(client.item_count("orders"), CONCURRENCY);
    assert_eq!(gateway.admission().current_load(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn shutdown_drains_in_flight_calls() {
    let client = Arc::new(memory_client());
    client.set_latency(Duration::from_millis(100));
    let gateway = Arc::new(test_gateway(Arc::clone(&client), CAPACITY));
    let gate = gateway.admission().gate().expect("gate initialized");

    let mut set = JoinSet::new();
    for idx in 0..3 {
        let gateway = Arc::clone(&gateway);
        set.spawn(async move {
            gateway.put_item(&CallContext::new(), &make_order("drain", idx)).await
        });
    }
    while gate.in_flight() < 3 {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    assert!(gateway.admission().shutdown().await);
    // Everything admitted before shutdown has finished by now.
    assert_eq!(client.item_count("orders"), 3);
    assert_eq!(gate.in_flight(), 0);

    while let Some(joined) = set.join_next().await {
        joined.expect("task panicked").expect("admitted put should complete");
    }

    let late = gateway.put_item(&CallContext::new(), &make_order("drain", 99)).await;
    let err = late.expect_err("no call is admitted after shutdown");
    assert_eq!(err.kind(), &ErrorKind::Shutdown);
    assert_eq!(client.item_count("orders"), 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_shutdown_closes_once() {
    let controller = Arc::new(
        AdmissionController::with_capacity(CAPACITY, Metrics::new()).expect("valid capacity"),
    );

    let mut set = JoinSet::new();
    for _ in 0..8 {
        let controller = Arc::clone(&controller);
        set.spawn(async move { controller.shutdown().await });
    }
    let mut performed = 0;
    while let Some(joined) = set.join_next().await {
        if joined.expect("task panicked") {
            performed += 1;
        }
    }

    assert_eq!(performed, 1);
    assert_eq!(controller.max_capacity(), 0);
}

#[tokio::test]
async fn reinit_after_shutdown_serves_gateway_again() {
    let client = Arc::new(memory_client());
    let gateway = test_gateway(Arc::clone(&client), CAPACITY);
    let ctx = CallContext::new();

    assert!(gateway.admission().shutdown().await);
    let err = gateway.put_item(&ctx, &make_order("c", 0)).await.expect_err("gate is closed");
    assert_eq!(err.kind(), &ErrorKind::Shutdown);

    gateway.admission().init(CAPACITY).expect("reinit");
    assert_eq!(gateway.admission().max_capacity(), CAPACITY);
    gateway.put_item(&ctx, &make_order("c", 0)).await.expect("fresh gate admits calls");
    assert_eq!(client.item_count("orders"), 1);

    // Init with an open gate keeps the original capacity.
    gateway.admission().init(CAPACITY * 2).expect("init is idempotent");
    assert_eq!(gateway.admission().max_capacity(), CAPACITY);
}

#[tokio::test]
async fn rejected_calls_are_counted() {
    let gateway = test_gateway(Arc::new(memory_client()), CAPACITY);
    gateway.admission().shutdown().await;

    for idx in 0..3 {
        let _ = gateway.put_item(&CallContext::new(), &make_order("c", idx)).await;
    }

    assert_eq!(gateway.metrics().snapshot().admission_rejected_count, 3);
}
