//! Service facade over the digestion pipeline.
//!
//! Composes the queue, processor, progress store and notifier, and exposes
//! the operations callers need: submit, progress queries, cancel, queue
//! stats, metrics and a worker.

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use super::processor::{Collaborators, JobProcessor};
use crate::adapters::event_bus::EVENT_BUS_CAPACITY;
use crate::adapters::{
    BroadcastEventBus, CompletionProvider, ContentExtractor, DigestRecord,
    DirectoryContentSource, EventBus, FilePersistence, OpenAiProvider, PersistenceError,
    PersistenceGateway, ProviderError,
};
use crate::config::{ProgressBackend, ResolvedConfig};
use crate::digest::{
    default_counter, ChunkingConfig, ClientConfig, ContentChunker, DigestError, DigestionClient,
    TokenCounter,
};
use crate::domain::{
    is_valid_capture_id, ContentType, DigestionJob, JobProgress, Priority, ProgressNotification,
    MAX_CAPTURE_ID_LEN,
};
use crate::metrics;
use crate::progress::{
    InMemoryProgressStore, NotifierConfig, ProgressError, ProgressNotifier, ProgressStore,
    RedisProgressStore,
};
use crate::queue::{
    DeadLetter, DigestionWorker, JobQueue, QueueConfig, QueueError, QueueStats, WorkerConfig,
    WorkerHandle,
};

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Missing component: {0}")]
    MissingComponent(&'static str),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Progress(#[from] ProgressError),

    #[error(transparent)]
    Persistence(#[from] PersistenceError),

    #[error(transparent)]
    Provider(#[from] ProviderError),
}

/// Result of accepting a job
#[derive(Debug, Clone)]
pub struct Submission {
    pub job: DigestionJob,
    /// Queue depth after the enqueue
    pub depth: usize,
    /// Depth is over the overload threshold
    pub overloaded: bool,
    /// Zero-based dispatch position, if still queued
    pub position: Option<usize>,
    /// Estimated wait before the job starts
    pub eta_ms: Option<u64>,
}

/// What `cancel` did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// Withdrawn before a worker picked it up
    Removed,
    /// Running job told to stop at its next chunk boundary
    Signalled,
    NotFound,
}

pub struct DigestionService {
    queue: Arc<JobQueue>,
    processor: Arc<JobProcessor>,
    provider: Arc<dyn CompletionProvider>,
    progress: Arc<dyn ProgressStore>,
    persistence: Arc<dyn PersistenceGateway>,
    notifier: Arc<ProgressNotifier>,
    worker_config: WorkerConfig,
    background: CancellationToken,
}

impl DigestionService {
    pub fn builder() -> DigestionServiceBuilder {
        DigestionServiceBuilder::default()
    }

    /// Compose the production collaborators from resolved configuration
    pub async fn from_config(config: &ResolvedConfig) -> Result<Self, ServiceError> {
        let background = CancellationToken::new();

        let progress: Arc<dyn ProgressStore> = match config.progress.backend {
            ProgressBackend::Local => {
                let store = Arc::new(InMemoryProgressStore::with_retention(config.retention()));
                Arc::clone(&store).spawn_sweeper(config.sweep_interval(), background.child_token());
                store
            }
            ProgressBackend::Redis => Arc::new(
                RedisProgressStore::connect(&config.progress.redis_url, config.retention()).await?,
            ),
        };

        let journal = config.home.join(crate::config::paths::QUEUE_JOURNAL_FILE);
        let queue = JobQueue::open(&journal, config.queue_config()).await?;

        info!(
            home = %config.home.display(),
            progress_backend = progress.backend(),
            model = %config.provider.model,
            "Composing digestion service"
        );

        Self::builder()
            .queue(Arc::new(queue))
            .provider(Arc::new(OpenAiProvider::new(config.openai_config())))
            .client_config(config.client_config())
            .chunking(config.chunking)
            .extractor(Arc::new(DirectoryContentSource::new(&config.content_dir)))
            .persistence(Arc::new(FilePersistence::new(&config.results_dir)))
            .progress(progress)
            .notifier_config(config.notifier_config())
            .worker_config(config.worker_config())
            .background(background)
            .build()
    }

    pub fn queue(&self) -> &Arc<JobQueue> {
        &self.queue
    }

    pub fn processor(&self) -> &Arc<JobProcessor> {
        &self.processor
    }

    pub fn progress_backend(&self) -> &'static str {
        self.progress.backend()
    }

    /// Accept a capture for digestion
    #[instrument(skip(self), fields(priority = priority.as_str()))]
    pub async fn submit(
        &self,
        capture_id: &str,
        user_id: &str,
        content_type: ContentType,
        priority: Priority,
    ) -> Result<Submission, ServiceError> {
        if capture_id.trim().is_empty() {
            return Err(ServiceError::InvalidRequest("capture id is empty".to_string()));
        }
        if !is_valid_capture_id(capture_id) {
            return Err(ServiceError::InvalidRequest(format!(
                "capture id {capture_id:?} must be 1-{MAX_CAPTURE_ID_LEN} characters of [A-Za-z0-9_-]"
            )));
        }
        if user_id.trim().is_empty() {
            return Err(ServiceError::InvalidRequest("user id is empty".to_string()));
        }

        let job = DigestionJob::new(capture_id, user_id, content_type, priority);
        let enqueued = self.queue.enqueue(job.clone()).await?;
        let position = self.queue.position(capture_id).await;
        let eta_ms = position.map(|p| self.notifier.queued_eta_ms(p));

        info!(depth = enqueued.depth, ?position, "Job submitted");
        Ok(Submission {
            job,
            depth: enqueued.depth,
            overloaded: enqueued.overloaded,
            position,
            eta_ms,
        })
    }

    pub async fn get_progress(&self, capture_id: &str) -> Result<Option<JobProgress>, ServiceError> {
        Ok(self.progress.get_progress(capture_id).await?)
    }

    pub async fn get_user_active_jobs(&self, user_id: &str) -> Result<Vec<JobProgress>, ServiceError> {
        Ok(self.progress.get_user_active_jobs(user_id).await?)
    }

    /// Withdraw a queued job, or stop a running one at its next chunk
    /// boundary and fail its progress entry
    #[instrument(skip(self))]
    pub async fn cancel(&self, capture_id: &str) -> Result<CancelOutcome, ServiceError> {
        if self.queue.remove(capture_id).await? {
            info!("Removed queued job");
            return Ok(CancelOutcome::Removed);
        }

        if !self.processor.cancel(capture_id) {
            return Ok(CancelOutcome::NotFound);
        }

        let message = DigestError::Cancelled.user_message();
        if let Some(progress) = self.progress.fail_tracking(capture_id, message).await? {
            self.notifier.observe(&progress, chrono::Utc::now());
        }
        info!("Signalled running job");
        Ok(CancelOutcome::Signalled)
    }

    pub async fn queue_stats(&self) -> QueueStats {
        self.queue.stats().await
    }

    pub async fn dead_letters(&self) -> Vec<DeadLetter> {
        self.queue.dead_letters().await
    }

    /// Prometheus text exposition (empty until metrics are initialized)
    pub fn metrics_text(&self) -> String {
        metrics::render()
    }

    pub fn subscribe_notifications(&self) -> broadcast::Receiver<ProgressNotification> {
        self.notifier.subscribe()
    }

    pub async fn load_result(&self, capture_id: &str) -> Result<Option<DigestRecord>, ServiceError> {
        Ok(self.persistence.load(capture_id).await?)
    }

    pub async fn health(&self) -> Result<(), ServiceError> {
        Ok(self.provider.health_check().await?)
    }

    pub fn worker(&self) -> DigestionWorker {
        DigestionWorker::new(Arc::clone(&self.processor), self.worker_config.clone())
    }

    /// Start a background worker
    pub fn start_worker(&self) -> WorkerHandle {
        self.worker().start()
    }

    /// Process until the queue is empty. Returns how many jobs were settled.
    pub async fn run_until_idle(&self) -> usize {
        self.worker().run_until_idle().await
    }

    /// Stop background tasks (progress sweeper)
    pub fn shutdown(&self) {
        self.background.cancel();
    }
}

impl Drop for DigestionService {
    fn drop(&mut self) {
        self.background.cancel();
    }
}

/// Builder for [`DigestionService`]. Provider, extractor and persistence
/// are required; everything else has an in-process default.
#[derive(Default)]
pub struct DigestionServiceBuilder {
    queue: Option<Arc<JobQueue>>,
    queue_config: Option<QueueConfig>,
    provider: Option<Arc<dyn CompletionProvider>>,
    client_config: Option<ClientConfig>,
    chunking: Option<ChunkingConfig>,
    counter: Option<Arc<dyn TokenCounter>>,
    extractor: Option<Arc<dyn ContentExtractor>>,
    persistence: Option<Arc<dyn PersistenceGateway>>,
    events: Option<Arc<dyn EventBus>>,
    progress: Option<Arc<dyn ProgressStore>>,
    notifier_config: Option<NotifierConfig>,
    worker_config: Option<WorkerConfig>,
    background: Option<CancellationToken>,
}

impl DigestionServiceBuilder {
    pub fn queue(mut self, queue: Arc<JobQueue>) -> Self {
        self.queue = Some(queue);
        self
    }

    /// Config for the default in-memory queue
    pub fn queue_config(mut self, config: QueueConfig) -> Self {
        self.queue_config = Some(config);
        self
    }

    pub fn provider(mut self, provider: Arc<dyn CompletionProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    pub fn client_config(mut self, config: ClientConfig) -> Self {
        self.client_config = Some(config);
        self
    }

    pub fn chunking(mut self, config: ChunkingConfig) -> Self {
        self.chunking = Some(config);
        self
    }

    pub fn token_counter(mut self, counter: Arc<dyn TokenCounter>) -> Self {
        self.counter = Some(counter);
        self
    }

    pub fn extractor(mut self, extractor: Arc<dyn ContentExtractor>) -> Self {
        self.extractor = Some(extractor);
        self
    }

    pub fn persistence(mut self, persistence: Arc<dyn PersistenceGateway>) -> Self {
        self.persistence = Some(persistence);
        self
    }

    pub fn events(mut self, events: Arc<dyn EventBus>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn progress(mut self, progress: Arc<dyn ProgressStore>) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn notifier_config(mut self, config: NotifierConfig) -> Self {
        self.notifier_config = Some(config);
        self
    }

    pub fn worker_config(mut self, config: WorkerConfig) -> Self {
        self.worker_config = Some(config);
        self
    }

    fn background(mut self, token: CancellationToken) -> Self {
        self.background = Some(token);
        self
    }

    pub fn build(self) -> Result<DigestionService, ServiceError> {
        let provider = self.provider.ok_or(ServiceError::MissingComponent("provider"))?;
        let extractor = self.extractor.ok_or(ServiceError::MissingComponent("extractor"))?;
        let persistence = self
            .persistence
            .ok_or(ServiceError::MissingComponent("persistence"))?;

        let queue = match self.queue {
            Some(queue) => queue,
            None => Arc::new(JobQueue::in_memory(self.queue_config.unwrap_or_default())),
        };
        let events = self
            .events
            .unwrap_or_else(|| Arc::new(BroadcastEventBus::new(EVENT_BUS_CAPACITY)));
        let progress = self
            .progress
            .unwrap_or_else(|| Arc::new(InMemoryProgressStore::new()));
        let notifier = Arc::new(ProgressNotifier::new(
            self.notifier_config.unwrap_or_default(),
        ));
        let counter = self.counter.unwrap_or_else(default_counter);

        let client = DigestionClient::with_config(
            Arc::clone(&provider),
            self.client_config.unwrap_or_default(),
        );
        let chunker = ContentChunker::with_config(client, counter, self.chunking.unwrap_or_default());

        if queue.config().prefetch == 0 {
            warn!("Queue prefetch is 0, no job will ever be dispatched");
        }

        let processor = Arc::new(JobProcessor::new(
            Arc::clone(&queue),
            chunker,
            Collaborators {
                extractor,
                persistence: Arc::clone(&persistence),
                events,
                progress: Arc::clone(&progress),
                notifier: Arc::clone(&notifier),
            },
        ));

        Ok(DigestionService {
            queue,
            processor,
            provider,
            progress,
            persistence,
            notifier,
            worker_config: self.worker_config.unwrap_or_default(),
            background: self.background.unwrap_or_default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{MemoryContentSource, MemoryPersistence, ScriptedProvider};

    fn service() -> DigestionService {
        DigestionService::builder()
            .provider(Arc::new(ScriptedProvider::new()))
            .extractor(Arc::new(MemoryContentSource::new()))
            .persistence(Arc::new(MemoryPersistence::new()))
            .build()
            .unwrap()
    }

    #[test]
    fn test_builder_requires_provider() {
        let result = DigestionService::builder()
            .extractor(Arc::new(MemoryContentSource::new()))
            .persistence(Arc::new(MemoryPersistence::new()))
            .build();
        assert!(matches!(result, Err(ServiceError::MissingComponent("provider"))));
    }

    #[tokio::test]
    async fn test_submit_reports_position_and_eta() {
        let service = service();

        let first = service
            .submit("cap-1", "user-1", ContentType::Text, Priority::Normal)
            .await
            .unwrap();
        let second = service
            .submit("cap-2", "user-1", ContentType::Text, Priority::Normal)
            .await
            .unwrap();

        assert_eq!(first.position, Some(0));
        assert_eq!(first.eta_ms, Some(0));
        assert_eq!(second.depth, 2);
        assert_eq!(second.position, Some(1));
        assert_eq!(second.eta_ms, Some(20_000));
    }

    #[tokio::test]
    async fn test_submit_rejects_blank_ids() {
        let service = service();
        let result = service
            .submit(" ", "user-1", ContentType::Text, Priority::Normal)
            .await;
        assert!(matches!(result, Err(ServiceError::InvalidRequest(_))));
    }

    #[tokio::test]
    async fn test_submit_rejects_path_like_ids() {
        let service = service();
        for id in ["../evil", "a/b", "a\\b", "..", "dot.ted"] {
            let result = service
                .submit(id, "user-1", ContentType::Text, Priority::Normal)
                .await;
            assert!(matches!(result, Err(ServiceError::InvalidRequest(_))), "{id}");
        }
        assert_eq!(service.queue_stats().await.depth, 0);
    }

    #[tokio::test]
    async fn test_duplicate_submit_is_refused() {
        let service = service();
        service
            .submit("cap-1", "user-1", ContentType::Text, Priority::Normal)
            .await
            .unwrap();
        let result = service
            .submit("cap-1", "user-1", ContentType::Text, Priority::High)
            .await;
        assert!(matches!(result, Err(ServiceError::Queue(QueueError::AlreadyQueued(_)))));
    }

    #[tokio::test]
    async fn test_cancel_queued_job() {
        let service = service();
        service
            .submit("cap-1", "user-1", ContentType::Text, Priority::Normal)
            .await
            .unwrap();

        assert_eq!(service.cancel("cap-1").await.unwrap(), CancelOutcome::Removed);
        assert_eq!(service.queue_stats().await.depth, 0);
        assert_eq!(service.cancel("cap-1").await.unwrap(), CancelOutcome::NotFound);
    }
}
