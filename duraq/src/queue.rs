//! The claim/execute/resolve engine.
//!
//! All queue state lives behind a single command loop: `start`, `stop`,
//! `empty`, enqueue wake-ups and job resolutions are commands drained by
//! one task, so capacity checks, claim transactions, counter updates and
//! the drain check never race. Job bodies run outside the loop as spawned
//! tasks, bounded by the concurrency limit; a slow job never stalls
//! claiming or resolving of other jobs.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;

use buildstructor::buildstructor;
use serde_json::Value as JsonValue;
use tokio::sync::mpsc;
use tracing::{debug, error, info, instrument, warn};

use crate::notifier::{Notifier, NullNotifier, QueueEvent};
use crate::result::Outcome;
use crate::storage::Storage;
use crate::{Job, Processor, StorageError};

pub(crate) const DEFAULT_CONCURRENCY: usize = 4;
pub(crate) const DEFAULT_RETRY_LIMIT: i64 = 4;

enum Command {
    Start,
    Stop,
    Empty,
    Cycle,
    Resolved(Job, Outcome),
}

/// State shared between handles and the command loop. The loop is the only
/// writer of `running` and `active`; the limits are written by handles and
/// read by the loop at cycle/resolve time, so changes take effect on the
/// next cycle rather than retroactively.
struct Shared {
    running: AtomicBool,
    active: AtomicUsize,
    concurrency: AtomicUsize,
    retry_limit: AtomicI64,
}

/// A durable job queue.
///
/// `Queue` is a cheap-to-clone handle; the engine itself runs on a spawned
/// command loop that outlives dropped handles for as long as dispatched
/// jobs are still resolving.
pub struct Queue<S>
where
    S: Storage + 'static,
{
    storage: Arc<S>,
    commands: mpsc::UnboundedSender<Command>,
    shared: Arc<Shared>,
}

impl<S> Clone for Queue<S>
where
    S: Storage + 'static,
{
    fn clone(&self) -> Self {
        Self {
            storage: Arc::clone(&self.storage),
            commands: self.commands.clone(),
            shared: Arc::clone(&self.shared),
        }
    }
}

#[buildstructor]
impl<S> Queue<S>
where
    S: Storage + 'static,
{
    /// Build a queue and spawn its command loop. Must be called within a
    /// tokio runtime. The queue starts stopped; call [`Queue::start`].
    #[builder]
    pub fn new(
        storage: Arc<S>,
        processor: Arc<dyn Processor>,
        notifier: Option<Arc<dyn Notifier>>,
        concurrency: Option<usize>,
        retry_limit: Option<i64>,
    ) -> Self {
        let notifier = notifier.unwrap_or_else(|| Arc::new(NullNotifier));
        let concurrency = concurrency.unwrap_or(DEFAULT_CONCURRENCY).max(1);
        let retry_limit = retry_limit.unwrap_or(DEFAULT_RETRY_LIMIT);

        let shared = Arc::new(Shared {
            running: AtomicBool::new(false),
            active: AtomicUsize::new(0),
            concurrency: AtomicUsize::new(concurrency),
            retry_limit: AtomicI64::new(retry_limit),
        });

        let (commands, receiver) = mpsc::unbounded_channel();

        let engine = EngineLoop {
            storage: Arc::clone(&storage),
            processor,
            notifier,
            shared: Arc::clone(&shared),
            commands: commands.clone(),
        };
        tokio::spawn(engine.run(receiver));

        Self {
            storage,
            commands,
            shared,
        }
    }
}

impl<S> Queue<S>
where
    S: Storage + 'static,
{
    /// Start claiming and dispatching jobs. Recovers jobs left in-flight by
    /// a prior crash before the first cycle. Idempotent while running.
    /// Returns without waiting for the effect to be visible.
    pub fn start(&self) {
        let _ = self.commands.send(Command::Start);
    }

    /// Stop claiming. Jobs already dispatched run to completion and resolve
    /// normally; only future cycles are suppressed. Idempotent while
    /// stopped.
    pub fn stop(&self) {
        let _ = self.commands.send(Command::Stop);
    }

    /// Delete all persisted jobs, independent of run state. Jobs currently
    /// dispatched keep running; their resolutions become no-ops against the
    /// store.
    pub fn empty(&self) {
        let _ = self.commands.send(Command::Empty);
    }

    /// Persist a job and wake the engine. Persistence succeeds or fails on
    /// its own; only a running engine will dispatch the job.
    #[instrument(skip(self, payload))]
    pub async fn enqueue(&self, task: &str, payload: JsonValue) -> Result<Job, StorageError> {
        let job = self.storage.persist(task, payload).await?;
        info!(id = job.id, task = %job.task, "job enqueued");

        let _ = self.commands.send(Command::Cycle);

        Ok(job)
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    /// Jobs currently dispatched to the processor but not yet resolved.
    pub fn active_count(&self) -> usize {
        self.shared.active.load(Ordering::Acquire)
    }

    pub fn concurrency(&self) -> usize {
        self.shared.concurrency.load(Ordering::Acquire)
    }

    /// Change the concurrency ceiling, effective on the next cycle. A
    /// ceiling of zero would never dispatch, so it is clamped to one.
    pub fn set_concurrency(&self, concurrency: usize) {
        self.shared
            .concurrency
            .store(concurrency.max(1), Ordering::Release);
    }

    pub fn retry_limit(&self) -> i64 {
        self.shared.retry_limit.load(Ordering::Acquire)
    }

    /// Change the maximum total number of failed attempts, effective the
    /// next time a failure resolves.
    pub fn set_retry_limit(&self, retry_limit: i64) {
        self.shared.retry_limit.store(retry_limit, Ordering::Release);
    }

    pub async fn count(&self) -> Result<u64, StorageError> {
        self.storage.count().await
    }

    pub async fn count_for_task(&self, task: &str) -> Result<u64, StorageError> {
        self.storage.count_for_task(task).await
    }

    pub async fn exists(&self, task: &str) -> Result<bool, StorageError> {
        self.storage.exists(task).await
    }

    pub async fn peek(&self, task: &str) -> Result<Option<Job>, StorageError> {
        self.storage.peek(task).await
    }

    pub async fn peek_any(&self) -> Result<Option<Job>, StorageError> {
        self.storage.peek_any().await
    }
}

struct EngineLoop<S>
where
    S: Storage + 'static,
{
    storage: Arc<S>,
    processor: Arc<dyn Processor>,
    notifier: Arc<dyn Notifier>,
    shared: Arc<Shared>,
    commands: mpsc::UnboundedSender<Command>,
}

impl<S> EngineLoop<S>
where
    S: Storage + 'static,
{
    /// Drain commands until every handle and every dispatched job has
    /// dropped its sender.
    async fn run(self, mut receiver: mpsc::UnboundedReceiver<Command>) {
        while let Some(command) = receiver.recv().await {
            match command {
                Command::Start => self.handle_start().await,
                Command::Stop => self.handle_stop(),
                Command::Empty => self.handle_empty().await,
                Command::Cycle => self.cycle().await,
                Command::Resolved(job, outcome) => self.resolve(job, outcome).await,
            }
        }
    }

    async fn handle_start(&self) {
        if self.shared.running.load(Ordering::Acquire) {
            return;
        }

        // Jobs left in-flight by a crashed process never resolved; make
        // them claimable again before the first cycle.
        if let Err(e) = self.storage.reset_claims().await {
            warn!(error = %e, "could not reset stale claims on start");
        }

        self.shared.running.store(true, Ordering::Release);
        info!("queue started");
        self.notifier.notify(QueueEvent::Started);

        self.cycle().await;
    }

    fn handle_stop(&self) {
        if !self.shared.running.load(Ordering::Acquire) {
            return;
        }

        self.shared.running.store(false, Ordering::Release);
        info!("queue stopped");
        self.notifier.notify(QueueEvent::Stopped);
    }

    async fn handle_empty(&self) {
        if let Err(e) = self.storage.clear().await {
            error!(error = %e, "failed to empty queue");
        }
    }

    /// One pass of claiming spare capacity and dispatching what was
    /// claimed. Runs inside the command loop, so computing capacity,
    /// claiming and bumping the active count are indivisible with respect
    /// to every other trigger.
    async fn cycle(&self) {
        if !self.shared.running.load(Ordering::Acquire) {
            return;
        }

        let active = self.shared.active.load(Ordering::Acquire);
        let concurrency = self.shared.concurrency.load(Ordering::Acquire);
        if active >= concurrency {
            return;
        }

        let capacity = (concurrency - active) as u32;
        let claimed = match self.storage.claim_up_to(capacity).await {
            Ok(jobs) => jobs,
            Err(e) => {
                // A failed claim transaction claims nothing; the next
                // trigger retries naturally.
                error!(error = %e, "claim failed");
                return;
            }
        };
        if claimed.is_empty() {
            return;
        }

        self.shared
            .active
            .store(active + claimed.len(), Ordering::Release);
        debug!(claimed = claimed.len(), active = active + claimed.len(), "dispatching");

        for job in claimed {
            let processor = Arc::clone(&self.processor);
            let commands = self.commands.clone();

            tokio::spawn(async move {
                let outcome = match processor.process(&job).await {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        warn!(id = job.id, task = %job.task, error = %e, "processor error");
                        Outcome::Fail
                    }
                };

                let _ = commands.send(Command::Resolved(job, outcome));
            });
        }
    }

    /// Fold a finished job back into the queue: mutate the store per the
    /// outcome, release the concurrency slot, emit events, and either
    /// re-cycle or report the drain.
    async fn resolve(&self, job: Job, outcome: Outcome) {
        let retry_limit = self.shared.retry_limit.load(Ordering::Acquire);

        let result = match outcome {
            Outcome::Success => self.storage.delete(job.id).await,
            Outcome::Fail if job.attempts + 1 < retry_limit => {
                self.storage.record_retry(job.id).await
            }
            Outcome::Fail => self.storage.delete(job.id).await,
            Outcome::Critical => {
                error!(id = job.id, task = %job.task, "job failed critically, removing");
                self.storage.delete(job.id).await
            }
        };
        if let Err(e) = result {
            error!(id = job.id, error = %e, "failed to record job outcome");
        }

        let active = self.shared.active.load(Ordering::Acquire);
        self.shared.active.store(active - 1, Ordering::Release);

        match outcome {
            Outcome::Success => {
                info!(id = job.id, task = %job.task, "job succeeded");
                self.notifier.notify(QueueEvent::JobSucceeded(job));
            }
            Outcome::Fail | Outcome::Critical => {
                info!(id = job.id, task = %job.task, attempts = job.attempts + 1, "job failed");
                self.notifier.notify(QueueEvent::JobFailed(job));
            }
        }

        match self.storage.count().await {
            Ok(0) => self.notifier.notify(QueueEvent::Drained),
            Ok(_) => self.cycle().await,
            Err(e) => {
                error!(error = %e, "failed to read queue depth");
                self.cycle().await;
            }
        }
    }
}
