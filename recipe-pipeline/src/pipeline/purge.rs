//! Periodic cleanup of finished tasks.
//!
//! Completed and failed tasks stay in the store so waiters and status
//! queries can read their outcome. This service deletes the ones older than
//! the retention window, in batches.

use chrono::{NaiveTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{Duration, MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::task_store::TaskStore;
use crate::Result;

/// Configuration for task purging.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PurgeConfig {
    /// Hours to retain finished tasks. 0 retains them indefinitely.
    #[serde(default = "default_retention_hours")]
    pub retention_hours: u32,

    /// Time window for purging (e.g., "02:00-05:00").
    /// If None, purging can run at any time.
    #[serde(default)]
    pub time_window: Option<String>,

    /// Maximum tasks deleted per batch.
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,

    /// Interval between purge checks in seconds.
    #[serde(default = "default_check_interval_secs")]
    pub check_interval_secs: u64,
}

fn default_retention_hours() -> u32 {
    24
}

fn default_batch_size() -> u32 {
    100
}

fn default_check_interval_secs() -> u64 {
    3600 // 1 hour
}

impl Default for PurgeConfig {
    fn default() -> Self {
        Self {
            retention_hours: default_retention_hours(),
            time_window: None,
            batch_size: default_batch_size(),
            check_interval_secs: default_check_interval_secs(),
        }
    }
}

impl PurgeConfig {
    pub fn with_retention_hours(mut self, hours: u32) -> Self {
        self.retention_hours = hours;
        self
    }

    pub fn with_time_window(mut self, window: Option<String>) -> Self {
        self.time_window = window;
        self
    }

    pub fn with_batch_size(mut self, size: u32) -> Self {
        self.batch_size = size;
        self
    }
}

/// Parsed time window for purging.
#[derive(Debug, Clone)]
struct TimeWindow {
    start: NaiveTime,
    end: NaiveTime,
}

impl TimeWindow {
    /// Parse a time window string like "02:00-05:00".
    fn parse(window: &str) -> Option<Self> {
        let (start, end) = window.split_once('-')?;
        let start = NaiveTime::parse_from_str(start.trim(), "%H:%M").ok()?;
        let end = NaiveTime::parse_from_str(end.trim(), "%H:%M").ok()?;
        Some(Self { start, end })
    }

    fn is_within(&self, time: NaiveTime) -> bool {
        if self.start <= self.end {
            time >= self.start && time < self.end
        } else {
            // Overnight, e.g. 23:00-02:00
            time >= self.start || time < self.end
        }
    }
}

/// Deletes finished tasks past the retention window.
pub struct TaskPurgeService {
    config: PurgeConfig,
    store: Arc<dyn TaskStore>,
    time_window: Option<TimeWindow>,
}

impl TaskPurgeService {
    pub fn new(config: PurgeConfig, store: Arc<dyn TaskStore>) -> Self {
        let time_window = config.time_window.as_deref().and_then(TimeWindow::parse);

        if config.time_window.is_some() && time_window.is_none() {
            warn!(
                "Invalid time window format: {:?}. Expected format: HH:MM-HH:MM",
                config.time_window
            );
        }

        Self {
            config,
            store,
            time_window,
        }
    }

    /// Check if purging is currently allowed based on time window.
    pub fn is_purge_allowed(&self) -> bool {
        self.time_window
            .as_ref()
            .is_none_or(|window| window.is_within(Utc::now().time()))
    }

    /// Run a single purge pass. Returns the number of tasks deleted.
    pub async fn run_purge(&self) -> Result<u64> {
        if self.config.retention_hours == 0 {
            debug!("Task purging disabled (retention_hours = 0)");
            return Ok(0);
        }

        if !self.is_purge_allowed() {
            debug!("Purge not allowed outside time window");
            return Ok(0);
        }

        let cutoff = Utc::now() - TimeDelta::hours(i64::from(self.config.retention_hours));
        let batch_size = self.config.batch_size.max(1);
        let mut total_deleted: u64 = 0;

        loop {
            let deleted = self.store.purge_finished_before(cutoff, batch_size).await?;
            total_deleted += deleted;

            if deleted < u64::from(batch_size) {
                break;
            }

            // Small delay between batches to reduce database load
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        if total_deleted > 0 {
            info!(
                "Purged {} finished tasks (retention: {}h)",
                total_deleted, self.config.retention_hours
            );
        } else {
            debug!("No tasks to purge");
        }

        Ok(total_deleted)
    }

    /// Start the background purge loop.
    pub fn start_background_task(
        self: &Arc<Self>,
        cancellation_token: CancellationToken,
    ) -> JoinHandle<()> {
        let service = self.clone();
        tokio::spawn(async move {
            let mut check_interval =
                interval(Duration::from_secs(service.config.check_interval_secs.max(1)));
            check_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            info!(
                "Task purge service started (retention: {}h, interval: {}s)",
                service.config.retention_hours, service.config.check_interval_secs
            );

            loop {
                tokio::select! {
                    _ = cancellation_token.cancelled() => {
                        info!("Task purge service shutting down");
                        break;
                    }
                    _ = check_interval.tick() => {
                        if let Err(e) = service.run_purge().await {
                            error!("Purge cycle failed: {}", e);
                        }
                    }
                }
            }
        })
    }

    pub fn config(&self) -> &PurgeConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::task_queue::{EnqueueOptions, Task, TaskState};
    use crate::pipeline::task_store::InMemoryTaskStore;
    use serde_json::json;

    fn finished(hours_ago: i64) -> Task {
        let mut task = Task::new("q", "t", json!({}), &EnqueueOptions::default());
        task.state = TaskState::Completed;
        task.finished_at = Some(Utc::now() - TimeDelta::hours(hours_ago));
        task
    }

    #[test]
    fn test_purge_config_default() {
        let config = PurgeConfig::default();
        assert_eq!(config.retention_hours, 24);
        assert_eq!(config.batch_size, 100);
        assert!(config.time_window.is_none());
    }

    #[test]
    fn test_time_window_parse() {
        let window = TimeWindow::parse("02:00-05:00").unwrap();
        assert_eq!(window.start, NaiveTime::from_hms_opt(2, 0, 0).unwrap());
        assert!(TimeWindow::parse("02:00").is_none());
        assert!(TimeWindow::parse("25:00-05:00").is_none());
    }

    #[test]
    fn test_time_window_overnight() {
        let window = TimeWindow::parse("23:00-02:00").unwrap();
        assert!(window.is_within(NaiveTime::from_hms_opt(23, 30, 0).unwrap()));
        assert!(window.is_within(NaiveTime::from_hms_opt(1, 0, 0).unwrap()));
        assert!(!window.is_within(NaiveTime::from_hms_opt(12, 0, 0).unwrap()));
    }

    #[tokio::test]
    async fn test_run_purge_deletes_in_batches() {
        let store = Arc::new(InMemoryTaskStore::new());
        for _ in 0..5 {
            store.insert(&finished(48)).await.unwrap();
        }
        store.insert(&finished(1)).await.unwrap();

        let service = TaskPurgeService::new(
            PurgeConfig::default().with_batch_size(2),
            store.clone(),
        );
        assert_eq!(service.run_purge().await.unwrap(), 5);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_zero_retention_disables_purge() {
        let store = Arc::new(InMemoryTaskStore::new());
        store.insert(&finished(48)).await.unwrap();

        let service = TaskPurgeService::new(
            PurgeConfig::default().with_retention_hours(0),
            store.clone(),
        );
        assert_eq!(service.run_purge().await.unwrap(), 0);
        assert_eq!(store.len(), 1);
    }
}
