use std::{sync::Arc, time::Duration};

use tally::{
    CompositeKey, IncrementQueue, MetricTarget,
    drain::Phase,
    scheduler::TokioScheduler,
    store::MemoryStore,
};
use tokio::time::{Instant, sleep};
use uuid::Uuid;

const DELAY: Duration = Duration::from_millis(50);

async fn wait_for_idle(queue: &IncrementQueue) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while queue.task().phase().0 != Phase::Idle || !queue.map().is_empty() {
        assert!(Instant::now() < deadline, "drain cycle never completed");
        sleep(Duration::from_millis(5)).await;
    }
}

fn queue(store: &Arc<MemoryStore>) -> IncrementQueue {
    let scheduler = TokioScheduler::current().expect("inside a runtime");
    IncrementQueue::new(Arc::clone(store) as _, Arc::new(scheduler))
}

#[tokio::test(flavor = "multi_thread")]
async fn reports_within_window_are_written_once() {
    let store = Arc::new(MemoryStore::new("memory"));
    let queue = queue(&store);
    let entity = Uuid::from_u128(1);
    let dimension = Uuid::from_u128(2);
    let target = MetricTarget::new(Uuid::from_u128(3), 4);

    for _ in 0..100 {
        queue.report_increment(entity, dimension, Some(60_000), target, 1.0, DELAY);
    }
    assert_eq!(queue.task().phase().0, Phase::Scheduled);

    wait_for_idle(&queue).await;

    let key = CompositeKey::new(entity, target, Some(60_000), dimension);
    assert_eq!(store.total(&key), Some(100.0));
    assert_eq!(store.writes(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn failed_cycle_does_not_stop_later_cycles() {
    let store = Arc::new(MemoryStore::new("memory"));
    let queue = queue(&store);
    let target = MetricTarget::new(Uuid::from_u128(3), 4);

    store.fail_next(1);
    queue.report_increment(Uuid::from_u128(1), Uuid::nil(), None, target, 5.0, DELAY);
    wait_for_idle(&queue).await;
    assert_eq!(store.failures(), 1);
    assert_eq!(store.writes(), 0);

    queue.report_increment(Uuid::from_u128(1), Uuid::nil(), None, target, 2.0, DELAY);
    wait_for_idle(&queue).await;
    assert_eq!(store.writes(), 1);
    assert!((store.written_amount() - 2.0).abs() < f64::EPSILON);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_reporters_lose_nothing() {
    const REPORTERS: u32 = 8;
    const REPORTS: u32 = 1_000;

    let store = Arc::new(MemoryStore::new("memory"));
    let queue = queue(&store);
    let target = MetricTarget::new(Uuid::from_u128(3), 4);

    let handles: Vec<_> = (0..REPORTERS)
        .map(|r| {
            let queue = queue.clone();
            tokio::task::spawn_blocking(move || {
                for i in 0..REPORTS {
                    let entity = Uuid::from_u128(u128::from((r + i) % 5));
                    let delay = Duration::from_millis(1);
                    queue.report_increment(entity, Uuid::nil(), None, target, 1.0, delay);
                }
            })
        })
        .collect();
    for handle in handles {
        handle.await.expect("reporter panicked");
    }

    wait_for_idle(&queue).await;
    let written = store.written_amount();
    assert!((written - f64::from(REPORTERS * REPORTS)).abs() < f64::EPSILON);
    assert!(store.writes() <= u64::from(REPORTERS * REPORTS));
}
