use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::env::EnvSource;
use crate::database::DEFAULT_POOL_SIZE;
use crate::domain::RetryPolicy;
use crate::logging::DEFAULT_LOG_FILTER;
use crate::pipeline::purge::PurgeConfig;
use crate::pipeline::task_queue::{EnqueueOptions, TaskQueueConfig};
use crate::pipeline::worker_pool::WorkerPoolConfig;
use crate::{Error, Result};

/// Database settings. Without a URL the queue and recipe store live in memory.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: Option<String>,
    pub max_connections: u32,
}

/// Per-queue worker and retry settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Tasks processed in parallel.
    pub concurrency: usize,
    pub lock_duration_ms: u64,
    pub task_timeout_secs: u64,
    /// Attempts at the queue level.
    pub attempts: u32,
    pub backoff_ms: u64,
    /// Finished tasks retained per queue; `None` keeps them until purged.
    pub keep_completed: Option<u32>,
    pub keep_failed: Option<u32>,
}

impl QueueConfig {
    /// Recipe tasks are not retried by the queue: content generation is not
    /// safe to repeat blindly.
    pub fn recipe_defaults() -> Self {
        Self {
            concurrency: 2,
            lock_duration_ms: 60_000,
            task_timeout_secs: 1800,
            attempts: 1,
            backoff_ms: 2_000,
            keep_completed: Some(500),
            keep_failed: Some(500),
        }
    }

    /// Image tasks get a long lock window and a coarse outer retry budget.
    pub fn image_defaults() -> Self {
        Self {
            concurrency: 3,
            lock_duration_ms: 300_000,
            task_timeout_secs: 900,
            attempts: 4,
            backoff_ms: 2_000,
            keep_completed: Some(1000),
            keep_failed: Some(1000),
        }
    }

    pub fn worker_pool(&self) -> WorkerPoolConfig {
        WorkerPoolConfig {
            max_workers: self.concurrency,
            lock_duration_ms: self.lock_duration_ms,
            task_timeout_secs: self.task_timeout_secs,
            ..WorkerPoolConfig::default()
        }
    }

    pub fn enqueue_options(&self) -> EnqueueOptions {
        EnqueueOptions::default()
            .with_attempts(self.attempts, Duration::from_millis(self.backoff_ms))
            .with_retention(self.keep_completed, self.keep_failed)
    }

    fn apply_env(mut self, env: &EnvSource, prefix: &str) -> Result<Self> {
        let key = |name: &str| format!("{}_{}", prefix, name);
        self.concurrency = env.parse_or(&key("CONCURRENCY"), self.concurrency)?;
        self.lock_duration_ms = env.parse_or(&key("LOCK_DURATION_MS"), self.lock_duration_ms)?;
        self.task_timeout_secs = env.parse_or(&key("TASK_TIMEOUT_SECS"), self.task_timeout_secs)?;
        self.attempts = env.parse_or(&key("ATTEMPTS"), self.attempts)?;
        self.backoff_ms = env.parse_or(&key("BACKOFF_MS"), self.backoff_ms)?;
        if let Some(keep) = env.parse(&key("KEEP_COMPLETED"))? {
            self.keep_completed = Some(keep);
        }
        if let Some(keep) = env.parse(&key("KEEP_FAILED"))? {
            self.keep_failed = Some(keep);
        }
        Ok(self)
    }

    fn validate(&self, name: &str) -> Result<()> {
        if self.concurrency == 0 {
            return Err(Error::config(format!("{} concurrency must be at least 1", name)));
        }
        if self.attempts == 0 {
            return Err(Error::config(format!("{} attempts must be at least 1", name)));
        }
        if self.lock_duration_ms < 1_000 {
            return Err(Error::config(format!(
                "{} lock duration must be at least 1000ms",
                name
            )));
        }
        Ok(())
    }
}

/// An OpenAI-compatible HTTP endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceEndpoint {
    pub base_url: String,
    pub api_key: Option<String>,
    pub model: String,
    pub timeout_secs: u64,
}

impl ServiceEndpoint {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.max(1))
    }

    fn from_env(env: &EnvSource, prefix: &str, default_model: &str) -> Result<Self> {
        let key = |name: &str| format!("{}_{}", prefix, name);
        let base_url = env.string_or(&key("BASE_URL"), "https://api.openai.com/v1");
        url::Url::parse(&base_url)
            .map_err(|e| Error::config(format!("{}={:?}: {}", key("BASE_URL"), base_url, e)))?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: env.get(&key("KEY")).or_else(|| env.get("OPENAI_API_KEY")),
            model: env.string_or(&key("MODEL"), default_model),
            timeout_secs: env.parse_or(&key("TIMEOUT_SECS"), 120)?,
        })
    }
}

/// Where generated images are written and how they are addressed publicly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub root_dir: PathBuf,
    pub public_base_url: String,
}

/// Progressive result store settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublisherConfig {
    /// How long a partial result stays readable after its last update.
    pub ttl_secs: u64,
}

impl PublisherConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Directory for daily log files. Console only when unset.
    pub dir: Option<PathBuf>,
    pub filter: String,
    pub retention_days: u32,
}

/// Complete application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub task_queue: TaskQueueConfig,
    pub recipe_queue: QueueConfig,
    pub image_queue: QueueConfig,
    /// Retry policy applied to each image stage independently.
    pub image_stage_retry: RetryPolicy,
    /// Timeout of the image byte download.
    pub image_fetch_timeout_secs: u64,
    /// Upper bound on how long the orchestrator waits for image tasks.
    pub image_wait_timeout_secs: u64,
    pub content_service: ServiceEndpoint,
    pub image_service: ServiceEndpoint,
    pub storage: StorageConfig,
    pub publisher: PublisherConfig,
    pub purge: PurgeConfig,
    pub log: LogConfig,
}

impl AppConfig {
    /// Load from the process environment after reading `.env` if present.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_source(&EnvSource::Process)
    }

    pub fn from_source(env: &EnvSource) -> Result<Self> {
        let database = DatabaseConfig {
            url: env.get("DATABASE_URL"),
            max_connections: env.parse_or("DATABASE_MAX_CONNECTIONS", DEFAULT_POOL_SIZE)?,
        };

        let defaults = TaskQueueConfig::default();
        let task_queue = TaskQueueConfig {
            warning_threshold: env.parse_or("QUEUE_WARNING_DEPTH", defaults.warning_threshold)?,
            critical_threshold: env
                .parse_or("QUEUE_CRITICAL_DEPTH", defaults.critical_threshold)?,
            stalled_check_interval_ms: env.parse_or(
                "QUEUE_STALLED_CHECK_INTERVAL_MS",
                defaults.stalled_check_interval_ms,
            )?,
            max_stalled_count: env
                .parse_or("QUEUE_MAX_STALLED_COUNT", defaults.max_stalled_count)?,
            ..defaults
        };

        let stage_defaults = RetryPolicy::default();
        let image_stage_retry = RetryPolicy {
            max_attempts: env.parse_or("IMAGE_STAGE_ATTEMPTS", stage_defaults.max_attempts)?,
            base_delay_ms: env
                .parse_or("IMAGE_STAGE_BASE_DELAY_MS", stage_defaults.base_delay_ms)?,
            max_delay_ms: env.parse_or("IMAGE_STAGE_MAX_DELAY_MS", stage_defaults.max_delay_ms)?,
            use_jitter: env.flag_or("IMAGE_STAGE_JITTER", stage_defaults.use_jitter)?,
            ..stage_defaults
        };

        let storage_root = PathBuf::from(env.string_or("STORAGE_ROOT", "./data/storage"));
        let public_base_url = env.string_or("STORAGE_PUBLIC_URL", "http://localhost:8080/static");
        url::Url::parse(&public_base_url).map_err(|e| {
            Error::config(format!("STORAGE_PUBLIC_URL={:?}: {}", public_base_url, e))
        })?;

        let purge_defaults = PurgeConfig::default();
        let purge = PurgeConfig {
            retention_hours: env
                .parse_or("PURGE_RETENTION_HOURS", purge_defaults.retention_hours)?,
            time_window: env.get("PURGE_TIME_WINDOW"),
            batch_size: env.parse_or("PURGE_BATCH_SIZE", purge_defaults.batch_size)?,
            check_interval_secs: env
                .parse_or("PURGE_INTERVAL_SECS", purge_defaults.check_interval_secs)?,
        };

        let config = Self {
            database,
            task_queue,
            recipe_queue: QueueConfig::recipe_defaults().apply_env(env, "RECIPE_QUEUE")?,
            image_queue: QueueConfig::image_defaults().apply_env(env, "IMAGE_QUEUE")?,
            image_stage_retry,
            image_fetch_timeout_secs: env.parse_or("IMAGE_FETCH_TIMEOUT_SECS", 30)?,
            image_wait_timeout_secs: env.parse_or("IMAGE_WAIT_TIMEOUT_SECS", 600)?,
            content_service: ServiceEndpoint::from_env(env, "CONTENT_API", "gpt-4o-mini")?,
            image_service: ServiceEndpoint::from_env(env, "IMAGE_API", "dall-e-3")?,
            storage: StorageConfig {
                root_dir: storage_root,
                public_base_url: public_base_url.trim_end_matches('/').to_string(),
            },
            publisher: PublisherConfig {
                ttl_secs: env.parse_or("PARTIAL_RESULT_TTL_SECS", 3600)?,
            },
            purge,
            log: LogConfig {
                dir: env.get("LOG_DIR").map(PathBuf::from),
                filter: env
                    .get("LOG_FILTER")
                    .or_else(|| env.get("RUST_LOG"))
                    .unwrap_or_else(|| DEFAULT_LOG_FILTER.to_string()),
                retention_days: env.parse_or("LOG_RETENTION_DAYS", 7)?,
            },
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.recipe_queue.validate("recipe queue")?;
        self.image_queue.validate("image queue")?;

        if self.image_stage_retry.max_attempts == 0 {
            return Err(Error::config("IMAGE_STAGE_ATTEMPTS must be at least 1"));
        }
        if self.task_queue.warning_threshold > self.task_queue.critical_threshold {
            return Err(Error::config(
                "queue warning depth must not exceed critical depth",
            ));
        }
        if self.image_fetch_timeout_secs == 0 {
            return Err(Error::config("IMAGE_FETCH_TIMEOUT_SECS must be positive"));
        }
        Ok(())
    }

    pub fn image_fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.image_fetch_timeout_secs)
    }

    pub fn image_wait_timeout(&self) -> Duration {
        Duration::from_secs(self.image_wait_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_empty_environment() {
        let config = AppConfig::from_source(&EnvSource::from_pairs::<_, String, String>([]))
            .unwrap();

        assert!(config.database.url.is_none());
        assert_eq!(config.recipe_queue.concurrency, 2);
        assert_eq!(config.recipe_queue.attempts, 1);
        assert_eq!(config.image_queue.concurrency, 3);
        assert_eq!(config.image_queue.attempts, 4);
        assert_eq!(config.image_queue.lock_duration_ms, 300_000);
        assert_eq!(config.image_stage_retry.max_attempts, 3);
        assert_eq!(config.image_stage_retry.base_delay_ms, 2_000);
        assert_eq!(config.image_fetch_timeout(), Duration::from_secs(30));
        assert_eq!(config.publisher.ttl(), Duration::from_secs(3600));
        assert_eq!(config.log.filter, DEFAULT_LOG_FILTER);
    }

    #[test]
    fn test_overrides_and_key_fallbacks() {
        let env = EnvSource::from_pairs([
            ("DATABASE_URL", "sqlite::memory:"),
            ("IMAGE_QUEUE_CONCURRENCY", "8"),
            ("RECIPE_QUEUE_KEEP_COMPLETED", "5"),
            ("OPENAI_API_KEY", "sk-shared"),
            ("IMAGE_API_KEY", "sk-image"),
            ("CONTENT_API_BASE_URL", "http://localhost:9000/v1/"),
        ]);
        let config = AppConfig::from_source(&env).unwrap();

        assert_eq!(config.database.url.as_deref(), Some("sqlite::memory:"));
        assert_eq!(config.image_queue.concurrency, 8);
        assert_eq!(config.recipe_queue.keep_completed, Some(5));
        assert_eq!(config.content_service.api_key.as_deref(), Some("sk-shared"));
        assert_eq!(config.image_service.api_key.as_deref(), Some("sk-image"));
        assert_eq!(config.content_service.base_url, "http://localhost:9000/v1");
    }

    #[test]
    fn test_service_keys_are_read_per_service() {
        let env = EnvSource::from_pairs([
            ("CONTENT_API_KEY", "sk-content"),
            ("IMAGE_API_KEY", "sk-image"),
        ]);
        let config = AppConfig::from_source(&env).unwrap();

        assert_eq!(config.content_service.api_key.as_deref(), Some("sk-content"));
        assert_eq!(config.image_service.api_key.as_deref(), Some("sk-image"));
    }

    #[test]
    fn test_invalid_values_are_configuration_errors() {
        let bad_number = EnvSource::from_pairs([("IMAGE_QUEUE_ATTEMPTS", "four")]);
        assert!(matches!(
            AppConfig::from_source(&bad_number),
            Err(Error::Configuration(_))
        ));

        let zero_workers = EnvSource::from_pairs([("RECIPE_QUEUE_CONCURRENCY", "0")]);
        assert!(matches!(
            AppConfig::from_source(&zero_workers),
            Err(Error::Configuration(_))
        ));

        let bad_url = EnvSource::from_pairs([("STORAGE_PUBLIC_URL", "not a url")]);
        assert!(AppConfig::from_source(&bad_url).is_err());
    }

    #[test]
    fn test_queue_config_maps_to_runtime_types() {
        let image = QueueConfig::image_defaults();
        let options = image.enqueue_options();
        assert_eq!(options.attempts, 4);
        assert_eq!(options.backoff, Duration::from_secs(2));
        assert_eq!(image.worker_pool().max_workers, 3);
        assert_eq!(image.worker_pool().lock_duration(), Duration::from_secs(300));
    }
}
