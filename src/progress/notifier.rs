//! Progress notification orchestrator.
//!
//! Turns stored progress into user-facing notifications: progress updates
//! with an ETA, a "still processing" nudge at most once per interval, and a
//! single timeout warning per job. Per-job state lives here, keyed by
//! capture id, and is dropped as soon as the job reaches a terminal state.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::ProgressStore;
use crate::domain::{JobProgress, ProgressNotification, ProgressUpdate, TimeoutWarning};

pub const DEFAULT_STILL_PROCESSING_MS: u64 = 10_000;
pub const DEFAULT_TIMEOUT_WARNING_MS: u64 = 30_000;
pub const DEFAULT_AVERAGE_JOB_MS: u64 = 20_000;
pub const DEFAULT_WATCH_INTERVAL: Duration = Duration::from_secs(1);

const NOTIFICATION_CAPACITY: usize = 256;

pub const TIMEOUT_WARNING_MESSAGE: &str =
    "This is taking longer than usual. We'll keep working on it.";

#[derive(Debug, Clone)]
pub struct NotifierConfig {
    /// First and repeat interval for "still processing"
    pub still_processing_ms: u64,
    pub timeout_warning_ms: u64,
    /// Assumed duration of one queued job ahead
    pub average_job_ms: u64,
    /// Poll interval of [`ProgressNotifier::spawn_watch`]
    pub watch_interval: Duration,
}

impl Default for NotifierConfig {
    fn default() -> Self {
        Self {
            still_processing_ms: DEFAULT_STILL_PROCESSING_MS,
            timeout_warning_ms: DEFAULT_TIMEOUT_WARNING_MS,
            average_job_ms: DEFAULT_AVERAGE_JOB_MS,
            watch_interval: DEFAULT_WATCH_INTERVAL,
        }
    }
}

#[derive(Debug, Default)]
struct JobNotifyState {
    last_percentage: Option<u8>,
    last_still_processing_ms: Option<u64>,
    timeout_warned: bool,
}

pub struct ProgressNotifier {
    config: NotifierConfig,
    jobs: Mutex<HashMap<String, JobNotifyState>>,
    tx: broadcast::Sender<ProgressNotification>,
}

impl Default for ProgressNotifier {
    fn default() -> Self {
        Self::new(NotifierConfig::default())
    }
}

impl ProgressNotifier {
    pub fn new(config: NotifierConfig) -> Self {
        let (tx, _) = broadcast::channel(NOTIFICATION_CAPACITY);
        Self {
            config,
            jobs: Mutex::new(HashMap::new()),
            tx,
        }
    }

    pub fn config(&self) -> &NotifierConfig {
        &self.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProgressNotification> {
        self.tx.subscribe()
    }

    fn lock_jobs(&self) -> MutexGuard<'_, HashMap<String, JobNotifyState>> {
        self.jobs.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// ETA for a job `position` places from the head of the queue
    pub fn queued_eta_ms(&self, position: usize) -> u64 {
        position as u64 * self.config.average_job_ms
    }

    /// Jobs with notification state
    pub fn tracked_jobs(&self) -> usize {
        self.lock_jobs().len()
    }

    /// Forget a job
    pub fn clear(&self, capture_id: &str) {
        self.lock_jobs().remove(capture_id);
    }

    /// Evaluate one observation and return (and broadcast) what it triggers
    pub fn observe(&self, progress: &JobProgress, now: DateTime<Utc>) -> Vec<ProgressNotification> {
        let elapsed_ms = progress.elapsed_ms(now);
        let mut out = Vec::new();

        if progress.status.is_terminal() {
            let seen = self.lock_jobs().remove(&progress.capture_id).is_some();
            if seen {
                out.push(ProgressNotification::Progress(ProgressUpdate {
                    capture_id: progress.capture_id.clone(),
                    user_id: progress.user_id.clone(),
                    status: progress.status,
                    percentage: progress.percentage,
                    elapsed_ms: progress.duration_ms.unwrap_or(elapsed_ms),
                    eta_ms: Some(0),
                }));
            }
            self.broadcast(&out);
            return out;
        }

        {
            let mut jobs = self.lock_jobs();
            let state = jobs.entry(progress.capture_id.clone()).or_default();

            if state.last_percentage != Some(progress.percentage) {
                state.last_percentage = Some(progress.percentage);
                out.push(ProgressNotification::Progress(ProgressUpdate {
                    capture_id: progress.capture_id.clone(),
                    user_id: progress.user_id.clone(),
                    status: progress.status,
                    percentage: progress.percentage,
                    elapsed_ms,
                    eta_ms: processing_eta_ms(elapsed_ms, progress.percentage),
                }));
            }

            let interval = self.config.still_processing_ms;
            let due = match state.last_still_processing_ms {
                None => elapsed_ms >= interval,
                Some(last) => elapsed_ms.saturating_sub(last) >= interval,
            };
            if due {
                state.last_still_processing_ms = Some(elapsed_ms);
                out.push(ProgressNotification::StillProcessing {
                    capture_id: progress.capture_id.clone(),
                    user_id: progress.user_id.clone(),
                    elapsed_ms,
                });
            }

            if !state.timeout_warned && elapsed_ms >= self.config.timeout_warning_ms {
                state.timeout_warned = true;
                warn!(capture_id = %progress.capture_id, elapsed_ms, "Job running past warning threshold");
                out.push(ProgressNotification::TimeoutWarning(TimeoutWarning {
                    capture_id: progress.capture_id.clone(),
                    user_id: progress.user_id.clone(),
                    elapsed_ms,
                    message: TIMEOUT_WARNING_MESSAGE.to_string(),
                }));
            }
        }

        self.broadcast(&out);
        out
    }

    fn broadcast(&self, notifications: &[ProgressNotification]) {
        for notification in notifications {
            // No subscribers is fine
            let _ = self.tx.send(notification.clone());
        }
    }

    /// Poll the store for one job until it ends, is forgotten, or `stop`
    /// fires. State for the job is cleared on the way out.
    pub fn spawn_watch(
        self: &Arc<Self>,
        store: Arc<dyn ProgressStore>,
        capture_id: String,
        stop: CancellationToken,
    ) -> JoinHandle<()> {
        let notifier = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(notifier.config.watch_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                match store.get_progress(&capture_id).await {
                    Ok(Some(progress)) => {
                        notifier.observe(&progress, Utc::now());
                        if progress.status.is_terminal() {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => debug!(capture_id = %capture_id, error = %e, "Progress read failed"),
                }
            }
            notifier.clear(&capture_id);
        })
    }
}

/// `max(0, elapsed / pct * 100 - elapsed)`, unknown at 0%
pub fn processing_eta_ms(elapsed_ms: u64, percentage: u8) -> Option<u64> {
    if percentage == 0 {
        return None;
    }
    let total = elapsed_ms as f64 / f64::from(percentage) * 100.0;
    Some((total - elapsed_ms as f64).max(0.0).round() as u64)
}
