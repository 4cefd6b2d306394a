//! Command-line interface for digestion.
//!
//! Provides commands for submitting captures, running a worker, checking
//! job status, inspecting the queue and showing configuration.

use std::io::{self, IsTerminal, Read};
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use uuid::Uuid;

use crate::adapters::DirectoryContentSource;
use crate::config;
use crate::core::DigestionService;
use crate::domain::{
    is_valid_capture_id, ContentType, Priority, ProgressNotification, MAX_CAPTURE_ID_LEN,
};
use crate::metrics;

/// digestion - Asynchronous content digestion pipeline
#[derive(Parser, Debug)]
#[command(name = "digestion")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Queue a capture for digestion
    Submit {
        /// Text file to digest (reads from stdin if not provided)
        file: Option<PathBuf>,

        /// Owner of the capture
        #[arg(short, long)]
        user: String,

        /// Capture ID (generated if not provided)
        #[arg(long)]
        capture_id: Option<String>,

        /// Scheduling tier
        #[arg(short, long, value_enum, default_value = "normal")]
        priority: PriorityArg,

        /// Kind of source content
        #[arg(short, long, value_enum, default_value = "text")]
        content_type: ContentTypeArg,
    },

    /// Run a worker against the queue
    Work {
        /// Exit once the queue is empty instead of waiting for new work
        #[arg(long)]
        drain: bool,

        /// Print metrics when the worker stops
        #[arg(long)]
        metrics: bool,
    },

    /// Show the status of a capture
    Status {
        /// Capture ID
        capture_id: String,
    },

    /// Show queue depth, in-flight jobs and dead letters
    Queue {
        /// List dead-lettered jobs
        #[arg(long)]
        dead_letters: bool,
    },

    /// Show current configuration
    Config,

    /// Check provider (and progress backend) connectivity
    Health,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum PriorityArg {
    Normal,
    High,
}

impl From<PriorityArg> for Priority {
    fn from(p: PriorityArg) -> Self {
        match p {
            PriorityArg::Normal => Priority::Normal,
            PriorityArg::High => Priority::High,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum ContentTypeArg {
    /// Typed or pasted text
    Text,

    /// Transcript of a voice capture
    Audio,
}

impl From<ContentTypeArg> for ContentType {
    fn from(t: ContentTypeArg) -> Self {
        match t {
            ContentTypeArg::Text => ContentType::Text,
            ContentTypeArg::Audio => ContentType::AudioTranscribed,
        }
    }
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<()> {
        match self.command {
            Commands::Submit {
                file,
                user,
                capture_id,
                priority,
                content_type,
            } => {
                submit(file, &user, capture_id, priority.into(), content_type.into()).await
            }
            Commands::Work { drain, metrics } => {
                work(drain, metrics).await
            }
            Commands::Status { capture_id } => {
                show_status(&capture_id).await
            }
            Commands::Queue { dead_letters } => {
                show_queue(dead_letters).await
            }
            Commands::Config => {
                show_config()
            }
            Commands::Health => {
                health().await
            }
        }
    }
}

async fn service() -> Result<DigestionService> {
    let cfg = config::config()?;
    DigestionService::from_config(cfg)
        .await
        .context("Failed to start digestion service")
}

/// Store the capture text and queue a job for it
async fn submit(
    file: Option<PathBuf>,
    user: &str,
    capture_id: Option<String>,
    priority: Priority,
    content_type: ContentType,
) -> Result<()> {
    let content = if let Some(path) = file {
        std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read input file: {}", path.display()))?
    } else if !io::stdin().is_terminal() {
        let mut buffer = String::new();
        io::stdin()
            .read_to_string(&mut buffer)
            .context("Failed to read from stdin")?;
        buffer
    } else {
        anyhow::bail!("No input provided. Pass a file or pipe to stdin");
    };

    if content.trim().is_empty() {
        anyhow::bail!("Input is empty");
    }

    let cfg = config::config()?;
    let capture_id = capture_id.unwrap_or_else(|| Uuid::new_v4().to_string());
    if !is_valid_capture_id(&capture_id) {
        anyhow::bail!(
            "Invalid capture id {:?}: use up to {} characters of letters, digits, '-' or '_'",
            capture_id,
            MAX_CAPTURE_ID_LEN
        );
    }

    let source = DirectoryContentSource::new(&cfg.content_dir);
    let stored = source
        .store(&capture_id, &content, content_type)
        .await
        .with_context(|| format!("Failed to store content for {}", capture_id))?;

    let service = service().await?;
    let submission = service
        .submit(&capture_id, user, content_type, priority)
        .await
        .with_context(|| format!("Failed to queue capture {}", capture_id))?;

    println!("{}", capture_id);
    eprintln!("  Content:  {}", stored.display());
    eprintln!("  Priority: {}", priority.as_str());
    eprintln!("  Depth:    {}", submission.depth);
    if let Some(position) = submission.position {
        eprintln!("  Position: {}", position);
    }
    if let Some(eta_ms) = submission.eta_ms {
        eprintln!("  ETA:      ~{}s", eta_ms / 1000);
    }
    if submission.overloaded {
        eprintln!("  Warning: queue is over its overload threshold");
    }

    Ok(())
}

/// Run a worker until drained or interrupted
async fn work(drain: bool, print_metrics: bool) -> Result<()> {
    metrics::init_metrics();
    let service = service().await?;

    let mut notifications = service.subscribe_notifications();
    let relay = tokio::spawn(async move {
        loop {
            match notifications.recv().await {
                Ok(notification) => log_notification(&notification),
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Notification relay lagged");
                }
                Err(RecvError::Closed) => break,
            }
        }
    });

    if drain {
        let settled = service.run_until_idle().await;
        eprintln!("[Drained queue: {} job(s) settled]", settled);
    } else {
        let handle = service.start_worker();
        tokio::signal::ctrl_c()
            .await
            .context("Failed to listen for Ctrl-C")?;
        info!("Shutting down worker");
        handle.shutdown().await;
    }

    relay.abort();
    if print_metrics {
        print!("{}", service.metrics_text());
    }
    service.shutdown();

    Ok(())
}

fn log_notification(notification: &ProgressNotification) {
    match notification {
        ProgressNotification::Progress(update) => info!(
            capture_id = %update.capture_id,
            status = ?update.status,
            percentage = update.percentage,
            eta_ms = ?update.eta_ms,
            "Progress"
        ),
        ProgressNotification::StillProcessing {
            capture_id,
            elapsed_ms,
            ..
        } => info!(capture_id = %capture_id, elapsed_ms, "Still processing"),
        ProgressNotification::TimeoutWarning(warning) => warn!(
            capture_id = %warning.capture_id,
            elapsed_ms = warning.elapsed_ms,
            "{}",
            warning.message
        ),
    }
}

/// Show progress, queue position and result for a capture
async fn show_status(capture_id: &str) -> Result<()> {
    let service = service().await?;

    println!("Capture: {}", capture_id);

    if let Some(position) = service.queue().position(capture_id).await {
        println!("Queue:   waiting (position {})", position);
    } else if service.queue().is_in_flight(capture_id).await {
        println!("Queue:   in flight");
    }

    if let Some(dead) = service
        .dead_letters()
        .await
        .into_iter()
        .find(|d| d.job.capture_id == capture_id)
    {
        println!("Queue:   dead-lettered ({}) at {}", dead.reason, dead.dead_lettered_at);
    }

    match service.get_progress(capture_id).await? {
        Some(progress) => {
            println!("Status:  {:?} ({}%)", progress.status, progress.percentage);
            println!("Started: {}", progress.started_at);
            if let Some(duration) = progress.duration_ms {
                println!("Took:    {}ms", duration);
            }
            if let Some(error) = &progress.error {
                println!("Error:   {}", error);
            }
        }
        None => println!("Status:  (no live progress on the {} backend)", service.progress_backend()),
    }

    if let Some(record) = service.load_result(capture_id).await? {
        println!();
        println!("Summary: {}", record.summary);
        println!("Ideas:");
        for idea in &record.ideas {
            println!("  - {}", idea);
        }
        if !record.todos.is_empty() {
            println!("Todos:");
            for todo in &record.todos {
                match &todo.deadline {
                    Some(deadline) => println!("  [{:?}] {} (by {})", todo.priority, todo.description, deadline),
                    None => println!("  [{:?}] {}", todo.priority, todo.description),
                }
            }
        }
        println!("Confidence: {:?}", record.confidence);
        if record.was_chunked {
            println!("Chunks:     {}", record.chunk_count.unwrap_or_default());
        }
    }

    Ok(())
}

/// Show queue statistics
async fn show_queue(list_dead_letters: bool) -> Result<()> {
    let service = service().await?;
    let stats = service.queue_stats().await;

    println!("Depth:        {}", stats.depth);
    println!("  Ready:      {}", stats.ready);
    println!("  Delayed:    {}", stats.delayed);
    println!("In flight:    {}", stats.in_flight);
    println!("Prefetch:     {}", stats.prefetch);
    println!("Dead letters: {}", stats.dead_letters);
    if stats.overloaded {
        println!("Queue is overloaded");
    }

    if list_dead_letters {
        let dead = service.dead_letters().await;
        if !dead.is_empty() {
            println!();
            println!("{:<38} {:<12} {:<24} {}", "CAPTURE ID", "USER", "DEAD-LETTERED", "REASON");
            println!("{}", "-".repeat(90));
        }
        for letter in dead {
            println!(
                "{:<38} {:<12} {:<24} {}",
                letter.job.capture_id,
                letter.job.user_id,
                letter.dead_lettered_at.format("%Y-%m-%d %H:%M:%S"),
                letter.reason
            );
        }
    }

    Ok(())
}

/// Show current configuration
fn show_config() -> Result<()> {
    let cfg = config::config()?;

    println!("Digestion Configuration");
    println!("=======================");
    println!();
    println!(
        "Config file: {}",
        cfg.config_file
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(none - using defaults)".to_string())
    );
    println!();
    println!("Paths:");
    println!("  Home (engine state): {}", cfg.home.display());
    println!("  Queue journal:       {}", config::paths::queue_journal()?.display());
    println!("  Content:             {}", cfg.content_dir.display());
    println!("  Results:             {}", cfg.results_dir.display());
    println!();
    println!("Queue:");
    println!("  Prefetch:           {}", cfg.queue.prefetch);
    println!("  Overload threshold: {}", cfg.queue.overload_threshold);
    println!("  Poll interval:      {}ms", cfg.queue.poll_interval_ms);
    println!();
    println!("Provider:");
    println!("  Base URL:    {}", cfg.provider.base_url);
    println!("  Model:       {}", cfg.provider.model);
    println!("  API key:     {}", if cfg.provider.api_key.is_some() { "(set)" } else { "(none)" });
    println!("  Timeout:     {}s", cfg.provider.timeout_seconds);
    println!("  Temperature: {}", cfg.provider.temperature);
    println!("  Max tokens:  {}", cfg.provider.max_output_tokens);
    println!();
    println!("Chunking:");
    println!("  Max tokens per chunk: {}", cfg.chunking.max_tokens_per_chunk);
    println!("  Overlap tokens:       {}", cfg.chunking.overlap_tokens);
    println!();
    println!("Progress:");
    println!("  Backend:   {}", cfg.progress.backend.as_str());
    if cfg.progress.backend == config::ProgressBackend::Redis {
        println!("  Redis URL: {}", cfg.progress.redis_url);
    }
    println!("  Active TTL: {}s", cfg.progress.active_ttl_seconds);
    println!("  Retention:  {}s", cfg.progress.retention_seconds);
    println!();
    println!("Notifications:");
    println!("  Still processing: {}ms", cfg.notifications.still_processing_ms);
    println!("  Timeout warning:  {}ms", cfg.notifications.timeout_warning_ms);
    println!("  Average job:      {}ms", cfg.notifications.average_job_ms);

    Ok(())
}

/// Check that the provider answers (composing the service also connects
/// the progress backend)
async fn health() -> Result<()> {
    let service = service().await?;
    println!("Progress backend: {} (ok)", service.progress_backend());

    match service.health().await {
        Ok(()) => {
            println!("Provider: ok");
            Ok(())
        }
        Err(e) => {
            println!("Provider: unavailable ({})", e);
            anyhow::bail!("Health check failed")
        }
    }
}
