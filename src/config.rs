//! Configuration for the digestion pipeline.
//!
//! Configuration sources (highest priority first):
//! 1. Environment variables (DIGESTION_HOME, DIGESTION_PROVIDER_URL, ...)
//! 2. Config file (.digestion/config.yaml)
//! 3. Defaults (~/.digestion)
//!
//! Config file discovery:
//! - Searches current directory and parents for .digestion/config.yaml
//! - `paths.home` is relative to the .digestion/ directory; other paths are
//!   relative to the project root (the directory holding .digestion/)

pub mod paths;

use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::adapters::provider::{DEFAULT_BASE_URL, DEFAULT_MODEL};
use crate::adapters::OpenAiConfig;
use crate::digest::client::{DEFAULT_MAX_OUTPUT_TOKENS, DEFAULT_TEMPERATURE};
use crate::digest::{ChunkingConfig, ClientConfig};
use crate::progress::notifier::{
    DEFAULT_AVERAGE_JOB_MS, DEFAULT_STILL_PROCESSING_MS, DEFAULT_TIMEOUT_WARNING_MS,
};
use crate::progress::{NotifierConfig, Retention};
use crate::queue::scheduler::{DEFAULT_OVERLOAD_THRESHOLD, DEFAULT_PREFETCH};
use crate::queue::worker::DEFAULT_POLL_INTERVAL_MS;
use crate::queue::{QueueConfig, WorkerConfig};

/// Global cached configuration (stores Result to handle init errors)
static CONFIG: OnceLock<Result<ResolvedConfig, String>> = OnceLock::new();

const DEFAULT_HOME_DIR: &str = ".digestion";
const DEFAULT_REDIS_URL: &str = "redis://localhost:6379";
const DEFAULT_TIMEOUT_SECONDS: u64 = 30;
const DEFAULT_ACTIVE_TTL_SECONDS: u64 = 600;
const DEFAULT_RETENTION_SECONDS: u64 = 300;
const DEFAULT_SWEEP_INTERVAL_SECONDS: u64 = 60;
const DEFAULT_WATCH_INTERVAL_MS: u64 = 1000;

/// Raw config file schema (matches YAML structure)
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub queue: Option<QueueFileConfig>,
    #[serde(default)]
    pub provider: Option<ProviderFileConfig>,
    #[serde(default)]
    pub chunking: Option<ChunkingFileConfig>,
    #[serde(default)]
    pub progress: Option<ProgressFileConfig>,
    #[serde(default)]
    pub notifications: Option<NotificationsFileConfig>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PathsConfig {
    /// Engine state directory (relative to .digestion/)
    pub home: Option<String>,
    /// Inbound capture text (relative to project root)
    pub content: Option<String>,
    /// Digest records (relative to project root)
    pub results: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueueFileConfig {
    pub prefetch: Option<usize>,
    pub overload_threshold: Option<usize>,
    pub poll_interval_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProviderFileConfig {
    pub base_url: Option<String>,
    pub model: Option<String>,
    pub api_key: Option<String>,
    pub timeout_seconds: Option<u64>,
    pub temperature: Option<f32>,
    pub max_output_tokens: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChunkingFileConfig {
    pub max_tokens_per_chunk: Option<usize>,
    pub overlap_tokens: Option<usize>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProgressFileConfig {
    pub backend: Option<ProgressBackend>,
    pub redis_url: Option<String>,
    pub active_ttl_seconds: Option<u64>,
    pub retention_seconds: Option<u64>,
    pub sweep_interval_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NotificationsFileConfig {
    pub still_processing_ms: Option<u64>,
    pub timeout_warning_ms: Option<u64>,
    pub average_job_ms: Option<u64>,
    pub watch_interval_ms: Option<u64>,
}

/// Which progress store to compose
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProgressBackend {
    #[default]
    Local,
    Redis,
}

impl ProgressBackend {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Redis => "redis",
        }
    }

    fn parse(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "local" | "memory" => Ok(Self::Local),
            "redis" => Ok(Self::Redis),
            other => anyhow::bail!("Unknown progress backend '{}' (expected local or redis)", other),
        }
    }
}

#[derive(Debug, Clone)]
pub struct QueueSettings {
    pub prefetch: usize,
    pub overload_threshold: usize,
    pub poll_interval_ms: u64,
}

#[derive(Debug, Clone)]
pub struct ProviderSettings {
    pub base_url: String,
    pub model: String,
    pub api_key: Option<String>,
    pub timeout_seconds: u64,
    pub temperature: f32,
    pub max_output_tokens: u32,
}

#[derive(Debug, Clone)]
pub struct ProgressSettings {
    pub backend: ProgressBackend,
    pub redis_url: String,
    pub active_ttl_seconds: u64,
    pub retention_seconds: u64,
    pub sweep_interval_seconds: u64,
}

#[derive(Debug, Clone)]
pub struct NotificationSettings {
    pub still_processing_ms: u64,
    pub timeout_warning_ms: u64,
    pub average_job_ms: u64,
    pub watch_interval_ms: u64,
}

/// Resolved configuration with absolute paths
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    /// Engine state (queue journal)
    pub home: PathBuf,
    /// Inbound capture text
    pub content_dir: PathBuf,
    /// Digest records
    pub results_dir: PathBuf,
    /// Path to config file (if found)
    pub config_file: Option<PathBuf>,
    pub queue: QueueSettings,
    pub provider: ProviderSettings,
    pub chunking: ChunkingConfig,
    pub progress: ProgressSettings,
    pub notifications: NotificationSettings,
}

impl ResolvedConfig {
    pub fn queue_config(&self) -> QueueConfig {
        QueueConfig {
            prefetch: self.queue.prefetch,
            overload_threshold: self.queue.overload_threshold,
            ..QueueConfig::default()
        }
    }

    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig::default().with_poll_interval(self.queue.poll_interval_ms)
    }

    pub fn client_config(&self) -> ClientConfig {
        ClientConfig {
            timeout: Duration::from_secs(self.provider.timeout_seconds),
            temperature: self.provider.temperature,
            max_output_tokens: self.provider.max_output_tokens,
        }
    }

    pub fn openai_config(&self) -> OpenAiConfig {
        OpenAiConfig {
            base_url: self.provider.base_url.clone(),
            api_key: self.provider.api_key.clone(),
            model: self.provider.model.clone(),
        }
    }

    pub fn retention(&self) -> Retention {
        Retention {
            active_ttl: Duration::from_secs(self.progress.active_ttl_seconds),
            terminal: Duration::from_secs(self.progress.retention_seconds),
        }
    }

    pub fn notifier_config(&self) -> NotifierConfig {
        NotifierConfig {
            still_processing_ms: self.notifications.still_processing_ms,
            timeout_warning_ms: self.notifications.timeout_warning_ms,
            average_job_ms: self.notifications.average_job_ms,
            watch_interval: Duration::from_millis(self.notifications.watch_interval_ms),
        }
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.progress.sweep_interval_seconds.max(1))
    }
}

/// Find config file by searching current directory and parents
fn find_config_file() -> Option<PathBuf> {
    let mut current = std::env::current_dir().ok()?;

    loop {
        let config_path = current.join(DEFAULT_HOME_DIR).join("config.yaml");
        if config_path.exists() {
            return Some(config_path);
        }

        if !current.pop() {
            break;
        }
    }

    None
}

/// Load and parse config file
fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Resolve a path that may be relative to the config file's parent
fn resolve_path(base: &Path, path_str: &str) -> PathBuf {
    let path = PathBuf::from(path_str);
    if path.is_absolute() {
        path
    } else {
        base.join(path)
            .canonicalize()
            .unwrap_or_else(|_| base.join(path_str))
    }
}

fn parse_env<T: std::str::FromStr>(env: &dyn Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>>
where
    T::Err: std::fmt::Display,
{
    match env(key) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| anyhow::anyhow!("Invalid {}='{}': {}", key, raw, e)),
        None => Ok(None),
    }
}

/// Combine a parsed config file, environment lookups and defaults
fn resolve(
    config_file: Option<(PathBuf, ConfigFile)>,
    env: &dyn Fn(&str) -> Option<String>,
    default_home: PathBuf,
) -> Result<ResolvedConfig> {
    let (config_path, file) = match config_file {
        Some((path, file)) => (Some(path), file),
        None => (None, ConfigFile::default()),
    };

    // .digestion/ and the project root holding it
    let dot_dir = config_path.as_deref().and_then(Path::parent);
    let base_dir = dot_dir.and_then(Path::parent);

    let home = if let Some(env_home) = env("DIGESTION_HOME") {
        PathBuf::from(env_home)
    } else if let (Some(dir), Some(home_path)) = (dot_dir, file.paths.home.as_deref()) {
        resolve_path(dir, home_path)
    } else {
        default_home
    };

    let content_dir = match (base_dir, file.paths.content.as_deref()) {
        (Some(base), Some(path)) => resolve_path(base, path),
        _ => home.join("content"),
    };
    let results_dir = match (base_dir, file.paths.results.as_deref()) {
        (Some(base), Some(path)) => resolve_path(base, path),
        _ => home.join("results"),
    };

    let queue_file = file.queue.as_ref();
    let queue = QueueSettings {
        prefetch: parse_env::<usize>(env, "DIGESTION_PREFETCH")?
            .or_else(|| queue_file.and_then(|q| q.prefetch))
            .unwrap_or(DEFAULT_PREFETCH)
            .max(1),
        overload_threshold: queue_file
            .and_then(|q| q.overload_threshold)
            .unwrap_or(DEFAULT_OVERLOAD_THRESHOLD),
        poll_interval_ms: queue_file
            .and_then(|q| q.poll_interval_ms)
            .unwrap_or(DEFAULT_POLL_INTERVAL_MS),
    };

    let provider_file = file.provider.as_ref();
    let provider = ProviderSettings {
        base_url: env("DIGESTION_PROVIDER_URL")
            .or_else(|| provider_file.and_then(|p| p.base_url.clone()))
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
        model: env("DIGESTION_MODEL")
            .or_else(|| provider_file.and_then(|p| p.model.clone()))
            .unwrap_or_else(|| DEFAULT_MODEL.to_string()),
        api_key: env("DIGESTION_API_KEY")
            .or_else(|| env("OPENAI_API_KEY"))
            .or_else(|| provider_file.and_then(|p| p.api_key.clone()))
            .filter(|key| !key.trim().is_empty()),
        timeout_seconds: provider_file
            .and_then(|p| p.timeout_seconds)
            .unwrap_or(DEFAULT_TIMEOUT_SECONDS),
        temperature: provider_file
            .and_then(|p| p.temperature)
            .unwrap_or(DEFAULT_TEMPERATURE),
        max_output_tokens: provider_file
            .and_then(|p| p.max_output_tokens)
            .unwrap_or(DEFAULT_MAX_OUTPUT_TOKENS),
    };

    let defaults = ChunkingConfig::default();
    let chunking_file = file.chunking.as_ref();
    let chunking = ChunkingConfig {
        max_tokens_per_chunk: chunking_file
            .and_then(|c| c.max_tokens_per_chunk)
            .unwrap_or(defaults.max_tokens_per_chunk),
        overlap_tokens: chunking_file
            .and_then(|c| c.overlap_tokens)
            .unwrap_or(defaults.overlap_tokens),
    };
    if chunking.overlap_tokens >= chunking.max_tokens_per_chunk {
        anyhow::bail!(
            "chunking.overlap_tokens ({}) must be smaller than max_tokens_per_chunk ({})",
            chunking.overlap_tokens,
            chunking.max_tokens_per_chunk
        );
    }

    let progress_file = file.progress.as_ref();
    let backend = match env("DIGESTION_PROGRESS_BACKEND") {
        Some(raw) => ProgressBackend::parse(&raw)?,
        None => progress_file.and_then(|p| p.backend).unwrap_or_default(),
    };
    let progress = ProgressSettings {
        backend,
        redis_url: env("REDIS_URL")
            .or_else(|| progress_file.and_then(|p| p.redis_url.clone()))
            .unwrap_or_else(|| DEFAULT_REDIS_URL.to_string()),
        active_ttl_seconds: progress_file
            .and_then(|p| p.active_ttl_seconds)
            .unwrap_or(DEFAULT_ACTIVE_TTL_SECONDS),
        retention_seconds: progress_file
            .and_then(|p| p.retention_seconds)
            .unwrap_or(DEFAULT_RETENTION_SECONDS),
        sweep_interval_seconds: progress_file
            .and_then(|p| p.sweep_interval_seconds)
            .unwrap_or(DEFAULT_SWEEP_INTERVAL_SECONDS),
    };

    let notifications_file = file.notifications.as_ref();
    let notifications = NotificationSettings {
        still_processing_ms: notifications_file
            .and_then(|n| n.still_processing_ms)
            .unwrap_or(DEFAULT_STILL_PROCESSING_MS),
        timeout_warning_ms: notifications_file
            .and_then(|n| n.timeout_warning_ms)
            .unwrap_or(DEFAULT_TIMEOUT_WARNING_MS),
        average_job_ms: notifications_file
            .and_then(|n| n.average_job_ms)
            .unwrap_or(DEFAULT_AVERAGE_JOB_MS),
        watch_interval_ms: notifications_file
            .and_then(|n| n.watch_interval_ms)
            .unwrap_or(DEFAULT_WATCH_INTERVAL_MS),
    };

    Ok(ResolvedConfig {
        home,
        content_dir,
        results_dir,
        config_file: config_path,
        queue,
        provider,
        chunking,
        progress,
        notifications,
    })
}

/// Load configuration from all sources
fn load_config() -> Result<ResolvedConfig> {
    let default_home = dirs::home_dir()
        .context("Failed to determine home directory")?
        .join(DEFAULT_HOME_DIR);

    let config_file = match find_config_file() {
        Some(path) => {
            let file = load_config_file(&path)?;
            Some((path, file))
        }
        None => None,
    };

    resolve(config_file, &|key| std::env::var(key).ok(), default_home)
}

/// Get the global configuration (loads once, then cached)
pub fn config() -> Result<&'static ResolvedConfig> {
    let result = CONFIG.get_or_init(|| load_config().map_err(|e| e.to_string()));

    match result {
        Ok(config) => Ok(config),
        Err(e) => anyhow::bail!("{}", e),
    }
}

/// Force reload configuration (useful for testing)
pub fn reload_config() -> Result<ResolvedConfig> {
    load_config()
}

/// Get the digestion home directory (engine state).
pub fn digestion_home() -> Result<PathBuf> {
    Ok(config()?.home.clone())
}
