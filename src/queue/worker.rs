//! Worker loop that drains the job queue.
//!
//! The worker dequeues until the queue's prefetch limit says no, runs each
//! job on its own task, and sleeps until a job finishes, new work arrives
//! or the poll interval passes.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{broadcast, mpsc};
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio::time::sleep;
use tracing::{debug, error, info, instrument};

use super::JobQueue;
use crate::core::{JobOutcome, JobProcessor};

pub const DEFAULT_POLL_INTERVAL_MS: u64 = 500;

const WORKER_EVENT_CAPACITY: usize = 64;

/// Configuration for the worker.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Polling interval in milliseconds.
    pub poll_interval_ms: u64,
    /// Whether to process jobs at all.
    pub enabled: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            enabled: true,
        }
    }
}

impl WorkerConfig {
    pub fn with_poll_interval(mut self, ms: u64) -> Self {
        self.poll_interval_ms = ms;
        self
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }
}

/// Event emitted by the worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerEvent {
    WorkerStarted,
    JobStarted { capture_id: String },
    JobFinished { capture_id: String, outcome: JobOutcome },
    WorkerStopped,
}

/// Handle for controlling a running worker.
pub struct WorkerHandle {
    shutdown_tx: mpsc::Sender<()>,
    event_rx: broadcast::Receiver<WorkerEvent>,
    join: JoinHandle<()>,
}

impl WorkerHandle {
    /// Stop taking jobs, let running ones finish, then return.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(()).await;
        if let Err(e) = self.join.await {
            error!(error = ?e, "Worker task failed");
        }
    }

    /// Get a receiver for worker events.
    pub fn events(&self) -> broadcast::Receiver<WorkerEvent> {
        self.event_rx.resubscribe()
    }
}

pub struct DigestionWorker {
    queue: Arc<JobQueue>,
    processor: Arc<JobProcessor>,
    config: WorkerConfig,
    event_tx: broadcast::Sender<WorkerEvent>,
}

impl DigestionWorker {
    pub fn new(processor: Arc<JobProcessor>, config: WorkerConfig) -> Self {
        let (event_tx, _) = broadcast::channel(WORKER_EVENT_CAPACITY);
        Self {
            queue: Arc::clone(processor.queue()),
            processor,
            config,
            event_tx,
        }
    }

    pub fn events(&self) -> broadcast::Receiver<WorkerEvent> {
        self.event_tx.subscribe()
    }

    /// Start the worker and return a handle for control.
    pub fn start(self) -> WorkerHandle {
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel(1);
        let event_rx = self.event_tx.subscribe();

        let join = tokio::spawn(async move {
            self.run(&mut shutdown_rx).await;
        });

        WorkerHandle {
            shutdown_tx,
            event_rx,
            join,
        }
    }

    fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.config.poll_interval_ms)
    }

    #[instrument(skip(self, shutdown_rx))]
    async fn run(&self, shutdown_rx: &mut mpsc::Receiver<()>) {
        if !self.config.enabled {
            info!("Worker is disabled, not starting");
            return;
        }

        info!(
            poll_interval_ms = self.config.poll_interval_ms,
            prefetch = self.queue.config().prefetch,
            "Worker started"
        );
        let _ = self.event_tx.send(WorkerEvent::WorkerStarted);

        let mut tasks = JoinSet::new();
        loop {
            self.spawn_ready(&mut tasks).await;

            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("Worker received shutdown signal");
                    break;
                }
                Some(result) = tasks.join_next(), if !tasks.is_empty() => {
                    self.report(result);
                }
                _ = self.queue.wait_for_work() => {}
                _ = sleep(self.poll_interval()) => {}
            }
        }

        if !tasks.is_empty() {
            info!(running = tasks.len(), "Waiting for running jobs");
        }
        while let Some(result) = tasks.join_next().await {
            self.report(result);
        }

        let _ = self.event_tx.send(WorkerEvent::WorkerStopped);
        info!("Worker stopped");
    }

    /// Process until nothing is queued or running. Returns how many jobs
    /// were settled.
    pub async fn run_until_idle(&self) -> usize {
        let mut tasks = JoinSet::new();
        let mut settled = 0;

        loop {
            self.spawn_ready(&mut tasks).await;

            if tasks.is_empty() {
                if self.queue.depth() == 0 {
                    break;
                }
                // Only backed-off jobs remain
                let wait = match self.queue.next_due().await {
                    Some(at) => (at - Utc::now()).to_std().unwrap_or(Duration::ZERO),
                    None => self.poll_interval(),
                };
                debug!(wait_ms = wait.as_millis() as u64, "Waiting for delayed jobs");
                sleep(wait.max(Duration::from_millis(10))).await;
                continue;
            }

            if let Some(result) = tasks.join_next().await {
                settled += 1;
                self.report(result);
            }
        }

        settled
    }

    /// Dispatch jobs until the queue has nothing more for us
    async fn spawn_ready(&self, tasks: &mut JoinSet<(String, JobOutcome)>) -> usize {
        let mut spawned = 0;
        loop {
            let job = match self.queue.dequeue().await {
                Ok(Some(job)) => job,
                Ok(None) => break,
                Err(e) => {
                    error!(error = %e, "Failed to dequeue job");
                    break;
                }
            };

            let capture_id = job.capture_id.clone();
            let _ = self.event_tx.send(WorkerEvent::JobStarted {
                capture_id: capture_id.clone(),
            });

            let processor = Arc::clone(&self.processor);
            tasks.spawn(async move {
                let outcome = processor.process(job).await;
                (capture_id, outcome)
            });
            spawned += 1;
        }
        if spawned > 0 {
            debug!(spawned, in_flight = self.queue.in_flight_count(), "Dispatched jobs");
        }
        spawned
    }

    fn report(&self, result: Result<(String, JobOutcome), JoinError>) {
        match result {
            Ok((capture_id, outcome)) => {
                let _ = self
                    .event_tx
                    .send(WorkerEvent::JobFinished { capture_id, outcome });
            }
            Err(e) => error!(error = ?e, "Job task panicked"),
        }
    }
}
