use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use duraq::prelude::*;
use duraq::{ChannelNotifier, Sqlite, Storage};
use serde_json::json;
use tokio::sync::{mpsc, Semaphore};
use tokio::time::{sleep, timeout};

/// Processor scripted by task name. Tracks how many jobs run at once and
/// the order they were picked up in.
struct TestProcessor {
    running: AtomicUsize,
    max_running: AtomicUsize,
    order: Mutex<Vec<i64>>,
    gate: Semaphore,
}

impl TestProcessor {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            running: AtomicUsize::new(0),
            max_running: AtomicUsize::new(0),
            order: Mutex::new(Vec::new()),
            gate: Semaphore::new(0),
        })
    }
}

#[duraq::async_trait]
impl Processor for TestProcessor {
    async fn process(&self, job: &Job) -> ProcessResult {
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_running.fetch_max(now, Ordering::SeqCst);
        self.order.lock().unwrap().push(job.id);

        let result = match job.task.as_str() {
            "ok" => Outcome::Success.into(),
            "fail" => Outcome::Fail.into(),
            "boom" => Outcome::Critical.into(),
            "slow" => {
                sleep(Duration::from_millis(20)).await;
                Outcome::Success.into()
            }
            "gated" => {
                let permit = self.gate.acquire().await.expect("gate closed");
                permit.forget();
                Outcome::Success.into()
            }
            "err" => Err("something went sideways".into()),
            other => panic!("unexpected task: {other}"),
        };

        self.running.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

struct Harness {
    queue: Queue<Sqlite>,
    storage: Arc<Sqlite>,
    processor: Arc<TestProcessor>,
    events: mpsc::UnboundedReceiver<QueueEvent>,
}

async fn harness(concurrency: usize, retry_limit: i64) -> Harness {
    let storage = Arc::new(Sqlite::connect_in_memory().await.unwrap());
    let processor = TestProcessor::new();
    let (notifier, events) = ChannelNotifier::new();

    let queue = Queue::builder()
        .storage(Arc::clone(&storage))
        .processor(Arc::clone(&processor) as Arc<dyn Processor>)
        .notifier(Arc::new(notifier))
        .concurrency(concurrency)
        .retry_limit(retry_limit)
        .build();

    Harness {
        queue,
        storage,
        processor,
        events,
    }
}

async fn next_event(events: &mut mpsc::UnboundedReceiver<QueueEvent>) -> QueueEvent {
    timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("timed out waiting for an event")
        .expect("event channel closed")
}

async fn assert_no_event(events: &mut mpsc::UnboundedReceiver<QueueEvent>) {
    assert!(
        timeout(Duration::from_millis(100), events.recv())
            .await
            .is_err(),
        "expected no further events"
    );
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

fn failed_job(event: QueueEvent) -> Job {
    match event {
        QueueEvent::JobFailed(job) => job,
        other => panic!("expected JobFailed, got {other:?}"),
    }
}

#[tokio::test]
async fn success_emits_succeeded_then_drained() {
    let mut h = harness(2, 4).await;

    let job = h.queue.enqueue("ok", json!({"n": 1})).await.unwrap();
    h.queue.start();

    assert!(matches!(next_event(&mut h.events).await, QueueEvent::Started));
    match next_event(&mut h.events).await {
        QueueEvent::JobSucceeded(done) => assert_eq!(done.id, job.id),
        other => panic!("expected JobSucceeded, got {other:?}"),
    }
    assert!(matches!(next_event(&mut h.events).await, QueueEvent::Drained));

    assert_eq!(h.queue.count().await.unwrap(), 0);
    assert_eq!(h.queue.active_count(), 0);
}

#[tokio::test]
async fn failing_job_is_removed_after_retry_limit_attempts() {
    let mut h = harness(1, 4).await;

    h.queue.enqueue("fail", json!({})).await.unwrap();
    h.queue.start();

    assert!(matches!(next_event(&mut h.events).await, QueueEvent::Started));

    // retry_limit = 4 means four failed attempts total; the event carries
    // the claimed snapshot, so attempts reads 0 through 3.
    for expected_attempts in 0..4 {
        let job = failed_job(next_event(&mut h.events).await);
        assert_eq!(job.attempts, expected_attempts);
    }
    assert!(matches!(next_event(&mut h.events).await, QueueEvent::Drained));
    assert_no_event(&mut h.events).await;

    assert_eq!(h.queue.count().await.unwrap(), 0);
}

#[tokio::test]
async fn critical_outcome_removes_the_job_immediately() {
    let mut h = harness(1, 4).await;

    h.queue.enqueue("boom", json!({})).await.unwrap();
    h.queue.start();

    assert!(matches!(next_event(&mut h.events).await, QueueEvent::Started));
    let job = failed_job(next_event(&mut h.events).await);
    assert_eq!(job.attempts, 0);
    assert!(matches!(next_event(&mut h.events).await, QueueEvent::Drained));

    assert_eq!(h.queue.count().await.unwrap(), 0);
}

#[tokio::test]
async fn processor_errors_resolve_as_retryable_failures() {
    let mut h = harness(1, 2).await;

    h.queue.enqueue("err", json!({})).await.unwrap();
    h.queue.start();

    assert!(matches!(next_event(&mut h.events).await, QueueEvent::Started));
    assert_eq!(failed_job(next_event(&mut h.events).await).attempts, 0);
    assert_eq!(failed_job(next_event(&mut h.events).await).attempts, 1);
    assert!(matches!(next_event(&mut h.events).await, QueueEvent::Drained));

    assert_eq!(h.queue.count().await.unwrap(), 0);
}

#[tokio::test]
async fn concurrency_ceiling_is_never_exceeded() {
    let mut h = harness(2, 4).await;

    for i in 0..8 {
        h.queue.enqueue("slow", json!({"n": i})).await.unwrap();
    }
    h.queue.start();

    loop {
        if matches!(next_event(&mut h.events).await, QueueEvent::Drained) {
            break;
        }
    }

    assert!(h.processor.max_running.load(Ordering::SeqCst) <= 2);
    assert_eq!(h.queue.active_count(), 0);
    assert_eq!(h.queue.count().await.unwrap(), 0);
}

#[tokio::test]
async fn jobs_run_in_enqueue_order_under_serial_dispatch() {
    let mut h = harness(1, 4).await;

    let mut ids = Vec::new();
    for i in 0..5 {
        ids.push(h.queue.enqueue("ok", json!({"n": i})).await.unwrap().id);
    }
    h.queue.start();

    loop {
        if matches!(next_event(&mut h.events).await, QueueEvent::Drained) {
            break;
        }
    }

    assert_eq!(*h.processor.order.lock().unwrap(), ids);
}

#[tokio::test]
async fn start_and_stop_are_idempotent() {
    let mut h = harness(1, 4).await;

    h.queue.start();
    h.queue.start();
    h.queue.stop();
    h.queue.stop();

    assert!(matches!(next_event(&mut h.events).await, QueueEvent::Started));
    assert!(matches!(next_event(&mut h.events).await, QueueEvent::Stopped));
    assert_no_event(&mut h.events).await;
    assert!(!h.queue.is_running());
}

#[tokio::test]
async fn enqueue_while_stopped_persists_without_dispatching() {
    let mut h = harness(1, 4).await;

    let job = h.queue.enqueue("ok", json!({})).await.unwrap();
    assert_no_event(&mut h.events).await;

    assert_eq!(h.queue.count().await.unwrap(), 1);
    assert_eq!(h.queue.count_for_task("ok").await.unwrap(), 1);
    assert!(h.queue.exists("ok").await.unwrap());
    assert_eq!(h.queue.peek("ok").await.unwrap().unwrap().id, job.id);
    assert_eq!(h.queue.peek_any().await.unwrap().unwrap().id, job.id);

    h.queue.start();
    assert!(matches!(next_event(&mut h.events).await, QueueEvent::Started));
    assert!(matches!(
        next_event(&mut h.events).await,
        QueueEvent::JobSucceeded(_)
    ));
    assert!(matches!(next_event(&mut h.events).await, QueueEvent::Drained));
}

#[tokio::test]
async fn start_recovers_jobs_claimed_by_a_crashed_process() {
    let mut h = harness(1, 4).await;

    let job = h.queue.enqueue("ok", json!({})).await.unwrap();

    // Simulate a crash mid-flight: the claim flag is set in the store but
    // nobody will ever resolve the job.
    let stuck = h.storage.claim_up_to(1).await.unwrap();
    assert_eq!(stuck[0].id, job.id);
    assert!(h.storage.claim_up_to(1).await.unwrap().is_empty());

    h.queue.start();

    assert!(matches!(next_event(&mut h.events).await, QueueEvent::Started));
    match next_event(&mut h.events).await {
        QueueEvent::JobSucceeded(done) => assert_eq!(done.id, job.id),
        other => panic!("expected JobSucceeded, got {other:?}"),
    }
    assert!(matches!(next_event(&mut h.events).await, QueueEvent::Drained));
}

#[tokio::test]
async fn stop_does_not_cancel_dispatched_jobs() {
    let mut h = harness(1, 4).await;

    h.queue.enqueue("gated", json!({})).await.unwrap();
    h.queue.start();

    assert!(matches!(next_event(&mut h.events).await, QueueEvent::Started));
    {
        let queue = h.queue.clone();
        wait_until(move || queue.active_count() == 1).await;
    }

    h.queue.stop();
    assert!(matches!(next_event(&mut h.events).await, QueueEvent::Stopped));

    h.processor.gate.add_permits(1);
    assert!(matches!(
        next_event(&mut h.events).await,
        QueueEvent::JobSucceeded(_)
    ));
    assert!(matches!(next_event(&mut h.events).await, QueueEvent::Drained));
    assert_eq!(h.queue.count().await.unwrap(), 0);
}

#[tokio::test]
async fn empty_removes_persisted_jobs_but_in_flight_ones_still_resolve() {
    let mut h = harness(2, 4).await;

    // Two gated jobs fill both slots; the rest stay unclaimed.
    let gated_a = h.queue.enqueue("gated", json!({})).await.unwrap();
    let gated_b = h.queue.enqueue("gated", json!({})).await.unwrap();
    for _ in 0..3 {
        h.queue.enqueue("ok", json!({})).await.unwrap();
    }

    h.queue.start();
    assert!(matches!(next_event(&mut h.events).await, QueueEvent::Started));
    {
        let queue = h.queue.clone();
        wait_until(move || queue.active_count() == 2).await;
    }

    h.queue.empty();
    for _ in 0..500 {
        if h.storage.count().await.unwrap() == 0 {
            break;
        }
        sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(h.storage.count().await.unwrap(), 0);

    h.processor.gate.add_permits(2);

    // Both dispatched jobs still resolve normally; each resolution against
    // the now-empty store reports a drain.
    let mut succeeded = Vec::new();
    let mut drains = 0;
    while drains < 2 {
        match next_event(&mut h.events).await {
            QueueEvent::JobSucceeded(job) => succeeded.push(job.id),
            QueueEvent::Drained => drains += 1,
            other => panic!("unexpected event: {other:?}"),
        }
    }

    succeeded.sort_unstable();
    assert_eq!(succeeded, vec![gated_a.id, gated_b.id]);
    assert_eq!(h.queue.active_count(), 0);
    assert_eq!(h.queue.count().await.unwrap(), 0);

    // The unclaimed jobs never ran.
    assert_eq!(h.processor.order.lock().unwrap().len(), 2);
}

#[tokio::test]
async fn retry_limit_changes_apply_to_the_next_resolution() {
    let mut h = harness(1, 4).await;

    h.queue.enqueue("fail", json!({})).await.unwrap();
    h.queue.set_retry_limit(1);
    assert_eq!(h.queue.retry_limit(), 1);

    h.queue.start();

    assert!(matches!(next_event(&mut h.events).await, QueueEvent::Started));
    assert_eq!(failed_job(next_event(&mut h.events).await).attempts, 0);
    assert!(matches!(next_event(&mut h.events).await, QueueEvent::Drained));
    assert_no_event(&mut h.events).await;
}

#[tokio::test]
async fn concurrency_changes_apply_to_the_next_cycle() {
    let h = harness(1, 4).await;

    assert_eq!(h.queue.concurrency(), 1);
    h.queue.set_concurrency(8);
    assert_eq!(h.queue.concurrency(), 8);

    // Zero would never dispatch; it is clamped.
    h.queue.set_concurrency(0);
    assert_eq!(h.queue.concurrency(), 1);
}
