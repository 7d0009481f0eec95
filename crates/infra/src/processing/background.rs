//! Worker pool that keeps one engine busy in the background.
//!
//! Layout of a running processor:
//!
//! - one feeder task: reserves a slot in the bounded queue, then claims; sleeps for
//!   `poll_interval` only when nothing was eligible
//! - `worker_count` worker tasks: take claimed objects off the queue and run the
//!   engine's process-and-unlock step on them
//! - one sweeper task: resets stale leases every `sweep_interval`
//!
//! `stop` cancels the feeder and sweeper, lets workers drain the queue, and aborts
//! them only when the drain outlives its budget.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::{Mutex, mpsc};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use leasehold_core::{ObjectKey, ProcessableObject, ProcessingStatus};

use crate::config::BackgroundProcessorConfig;
use crate::store::WorkStore;

use super::engine::{ClaimAttempt, Disposition, Engine, EngineError};
use super::processor::ObjectProcessor;

/// Point-in-time statistics of a background processor.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProcessorStats {
    pub name: String,
    pub running: bool,
    pub uptime_secs: u64,
    pub claimed: u64,
    pub completed: u64,
    pub retried: u64,
    pub rescheduled: u64,
    pub failed: u64,
    pub lost_claims: u64,
    pub discarded_unlocks: u64,
    pub processing_errors: u64,
    pub stale_locks_reset: u64,
    pub sweep_failures: u64,
    pub active: usize,
    pub queued: usize,
}

#[derive(Debug, Default)]
struct Counters {
    claimed: AtomicU64,
    completed: AtomicU64,
    retried: AtomicU64,
    rescheduled: AtomicU64,
    failed: AtomicU64,
    lost_claims: AtomicU64,
    discarded_unlocks: AtomicU64,
    processing_errors: AtomicU64,
    stale_locks_reset: AtomicU64,
    sweep_failures: AtomicU64,
    active: AtomicUsize,
    queued: AtomicUsize,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn record(&self, disposition: Disposition) {
        match disposition {
            Disposition::Completed => Self::bump(&self.completed),
            Disposition::Retried => Self::bump(&self.retried),
            Disposition::Rescheduled => Self::bump(&self.rescheduled),
            Disposition::Failed => Self::bump(&self.failed),
            Disposition::LeaseLost => Self::bump(&self.discarded_unlocks),
        }
    }
}

type Queue<Id, S> = Arc<Mutex<mpsc::Receiver<ProcessableObject<Id, S>>>>;

struct Running<Id, S> {
    shutdown: CancellationToken,
    tasks: JoinSet<()>,
    queue: Queue<Id, S>,
    started_at: Instant,
}

/// Aborts the wrapped task when dropped, so aborting a worker also aborts the
/// processing call it is waiting on.
struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

pub struct BackgroundProcessor<Id, S, P, St> {
    engine: Arc<Engine<Id, S, P, St>>,
    config: BackgroundProcessorConfig,
    counters: Arc<Counters>,
    running: Option<Running<Id, S>>,
}

impl<Id, S, P, St> BackgroundProcessor<Id, S, P, St>
where
    Id: ObjectKey,
    S: ProcessingStatus,
    P: ObjectProcessor<Id, S>,
    St: WorkStore<Id, S> + 'static,
{
    /// Build an engine owned by `config.lock_owner` and wrap it in a worker pool.
    pub fn new(processor: Arc<P>, store: St, config: BackgroundProcessorConfig) -> Self {
        let engine = Engine::new(processor, store, config.lock_owner.clone());
        Self::from_engine(engine, config)
    }

    pub fn from_engine(engine: Engine<Id, S, P, St>, config: BackgroundProcessorConfig) -> Self {
        Self {
            engine: Arc::new(engine),
            config,
            counters: Arc::new(Counters::default()),
            running: None,
        }
    }

    pub fn engine(&self) -> &Engine<Id, S, P, St> {
        &self.engine
    }

    pub fn config(&self) -> &BackgroundProcessorConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// Spawn the feeder, workers and sweeper on the current tokio runtime.
    pub fn start(&mut self) -> Result<(), EngineError> {
        if self.running.is_some() {
            return Err(EngineError::AlreadyRunning(self.config.name.clone()));
        }
        tokio::runtime::Handle::try_current()
            .map_err(|e| EngineError::Runtime(format!("no tokio runtime: {e}")))?;

        let shutdown = CancellationToken::new();
        let (tx, rx) = mpsc::channel(self.config.queue_capacity.max(1));
        let queue: Queue<Id, S> = Arc::new(Mutex::new(rx));
        let mut tasks = JoinSet::new();

        tasks.spawn(feed(
            self.engine.clone(),
            tx,
            self.config.poll_interval,
            shutdown.clone(),
            self.counters.clone(),
        ));

        let workers = self.config.worker_count.max(1);
        for worker in 0..workers {
            tasks.spawn(work(
                worker,
                self.engine.clone(),
                queue.clone(),
                self.counters.clone(),
            ));
        }

        tasks.spawn(sweep(
            self.engine.clone(),
            self.config.lock_timeout,
            self.config.sweep_interval.max(Duration::from_millis(1)),
            shutdown.clone(),
            self.counters.clone(),
        ));

        info!(
            processor = %self.config.name,
            owner = self.engine.owner(),
            workers,
            queue_capacity = self.config.queue_capacity,
            "background processor started"
        );

        self.running = Some(Running {
            shutdown,
            tasks,
            queue,
            started_at: Instant::now(),
        });
        Ok(())
    }

    /// Stop claiming, let in-flight and queued work finish, then shut down.
    ///
    /// Waits up to `processing_timeout × max(1, active + queued)`. Past that, workers
    /// are aborted and objects still queued are released back to pending; objects
    /// whose processing was aborted keep their lease until the sweep.
    pub async fn stop(&mut self) -> Result<(), EngineError> {
        let Some(mut running) = self.running.take() else {
            return Ok(());
        };

        running.shutdown.cancel();

        let in_flight = self.counters.active.load(Ordering::Relaxed)
            + self.counters.queued.load(Ordering::Relaxed);
        let factor = u32::try_from(in_flight.max(1)).unwrap_or(u32::MAX);
        let budget = self.config.processing_timeout.saturating_mul(factor);

        let graceful = tokio::time::timeout(budget, drain(&self.config.name, &mut running.tasks))
            .await
            .is_ok();
        if !graceful {
            warn!(
                processor = %self.config.name,
                budget_ms = budget.as_millis() as u64,
                "graceful stop timed out, aborting workers"
            );
            running.tasks.abort_all();
            drain(&self.config.name, &mut running.tasks).await;
            // Aborted workers never got to decrement.
            self.counters.active.store(0, Ordering::Relaxed);
        }

        let released = self.release_queued(&running.queue).await;

        info!(
            processor = %self.config.name,
            graceful,
            released,
            "background processor stopped"
        );
        Ok(())
    }

    pub fn stats(&self) -> ProcessorStats {
        let c = &self.counters;
        let load = |a: &AtomicU64| a.load(Ordering::Relaxed);
        ProcessorStats {
            name: self.config.name.clone(),
            running: self.running.is_some(),
            uptime_secs: self
                .running
                .as_ref()
                .map(|r| r.started_at.elapsed().as_secs())
                .unwrap_or(0),
            claimed: load(&c.claimed),
            completed: load(&c.completed),
            retried: load(&c.retried),
            rescheduled: load(&c.rescheduled),
            failed: load(&c.failed),
            lost_claims: load(&c.lost_claims),
            discarded_unlocks: load(&c.discarded_unlocks),
            processing_errors: load(&c.processing_errors),
            stale_locks_reset: load(&c.stale_locks_reset),
            sweep_failures: load(&c.sweep_failures),
            active: c.active.load(Ordering::Relaxed),
            queued: c.queued.load(Ordering::Relaxed),
        }
    }

    async fn release_queued(&self, queue: &Queue<Id, S>) -> usize {
        let mut rx = queue.lock().await;
        rx.close();

        let mut released = 0;
        while let Ok(mut object) = rx.try_recv() {
            self.counters.queued.fetch_sub(1, Ordering::Relaxed);
            match self.engine.release(&mut object).await {
                Ok(true) => released += 1,
                Ok(false) => {}
                Err(e) => warn!(
                    processor = %self.config.name,
                    object_id = %object.id,
                    error = %e,
                    "failed to release queued object"
                ),
            }
        }
        released
    }
}

async fn drain(name: &str, tasks: &mut JoinSet<()>) {
    while let Some(result) = tasks.join_next().await {
        if let Err(e) = result {
            if e.is_panic() {
                error!(processor = %name, error = %e, "background task panicked");
            }
        }
    }
}

async fn feed<Id, S, P, St>(
    engine: Arc<Engine<Id, S, P, St>>,
    tx: mpsc::Sender<ProcessableObject<Id, S>>,
    poll_interval: Duration,
    shutdown: CancellationToken,
    counters: Arc<Counters>,
) where
    Id: ObjectKey,
    S: ProcessingStatus,
    P: ObjectProcessor<Id, S>,
    St: WorkStore<Id, S> + 'static,
{
    let name = engine.processor().name().to_string();

    loop {
        let permit = tokio::select! {
            _ = shutdown.cancelled() => break,
            permit = tx.reserve() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };
        if shutdown.is_cancelled() {
            break;
        }

        match engine.claim_next().await {
            Ok(ClaimAttempt::Claimed(object)) => {
                Counters::bump(&counters.claimed);
                counters.queued.fetch_add(1, Ordering::Relaxed);
                permit.send(object);
            }
            Ok(ClaimAttempt::Lost) => {
                Counters::bump(&counters.lost_claims);
            }
            Ok(ClaimAttempt::Idle) => {
                drop(permit);
                if pause(&shutdown, poll_interval).await {
                    break;
                }
            }
            Err(e) => {
                drop(permit);
                error!(processor = %name, error = %e, "failed to claim object");
                if pause(&shutdown, poll_interval).await {
                    break;
                }
            }
        }
    }

    debug!(processor = %name, "feeder stopped");
}

/// Sleep unless shut down first. Returns `true` on shutdown.
async fn pause(shutdown: &CancellationToken, duration: Duration) -> bool {
    tokio::select! {
        _ = shutdown.cancelled() => true,
        _ = tokio::time::sleep(duration) => false,
    }
}

async fn work<Id, S, P, St>(
    worker: usize,
    engine: Arc<Engine<Id, S, P, St>>,
    queue: Queue<Id, S>,
    counters: Arc<Counters>,
) where
    Id: ObjectKey,
    S: ProcessingStatus,
    P: ObjectProcessor<Id, S>,
    St: WorkStore<Id, S> + 'static,
{
    let name = engine.processor().name().to_string();

    loop {
        let next = queue.lock().await.recv().await;
        let Some(object) = next else {
            break;
        };

        counters.queued.fetch_sub(1, Ordering::Relaxed);
        counters.active.fetch_add(1, Ordering::Relaxed);

        let object_id = object.id.clone();
        let task_engine = engine.clone();
        let mut task = AbortOnDrop(tokio::spawn(async move {
            task_engine.process_claimed(object).await
        }));
        let result = (&mut task.0).await;

        counters.active.fetch_sub(1, Ordering::Relaxed);

        match result {
            Ok(Ok(report)) => counters.record(report.disposition),
            Ok(Err(e)) => {
                Counters::bump(&counters.processing_errors);
                error!(
                    processor = %name,
                    worker,
                    object_id = %object_id,
                    error = %e,
                    "processing cycle failed, lease left for the sweep"
                );
            }
            Err(e) => {
                Counters::bump(&counters.processing_errors);
                error!(
                    processor = %name,
                    worker,
                    object_id = %object_id,
                    error = %e,
                    "processing task aborted, lease left for the sweep"
                );
            }
        }
    }

    debug!(processor = %name, worker, "worker stopped");
}

async fn sweep<Id, S, P, St>(
    engine: Arc<Engine<Id, S, P, St>>,
    lock_timeout: Duration,
    every: Duration,
    shutdown: CancellationToken,
    counters: Arc<Counters>,
) where
    Id: ObjectKey,
    S: ProcessingStatus,
    P: ObjectProcessor<Id, S>,
    St: WorkStore<Id, S> + 'static,
{
    let name = engine.processor().name().to_string();
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }

        match engine.reset_stale_locks(lock_timeout).await {
            Ok(0) => {}
            Ok(reset) => {
                counters.stale_locks_reset.fetch_add(reset, Ordering::Relaxed);
                info!(processor = %name, reset, "reset stale locks");
            }
            Err(e) => {
                Counters::bump(&counters.sweep_failures);
                warn!(processor = %name, error = %e, "stale lock sweep failed");
            }
        }
    }

    debug!(processor = %name, "sweeper stopped");
}

/// Lifecycle surface shared by every background processor, whatever its types.
#[async_trait]
pub trait ManagedProcessor: Send + Sync {
    fn name(&self) -> &str;

    fn start(&mut self) -> Result<(), EngineError>;

    async fn stop(&mut self) -> Result<(), EngineError>;

    fn stats(&self) -> ProcessorStats;
}

#[async_trait]
impl<Id, S, P, St> ManagedProcessor for BackgroundProcessor<Id, S, P, St>
where
    Id: ObjectKey,
    S: ProcessingStatus,
    P: ObjectProcessor<Id, S>,
    St: WorkStore<Id, S> + 'static,
{
    fn name(&self) -> &str {
        &self.config.name
    }

    fn start(&mut self) -> Result<(), EngineError> {
        BackgroundProcessor::start(self)
    }

    async fn stop(&mut self) -> Result<(), EngineError> {
        BackgroundProcessor::stop(self).await
    }

    fn stats(&self) -> ProcessorStats {
        BackgroundProcessor::stats(self)
    }
}
