//! Progressive partial-result store.
//!
//! The orchestrator publishes the initial recipe shape; each image task then
//! publishes its own step. Clients poll by request id and render whatever
//! has arrived so far.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::Result;
use crate::domain::Recipe;

/// Image state of one step in a partial result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepImageStatus {
    Pending,
    Ready,
    Failed,
}

/// Result of one image task. `image_url: None` marks the step as failed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepImageUpdate {
    pub step_index: usize,
    pub image_url: Option<String>,
}

impl StepImageUpdate {
    pub fn ready(step_index: usize, image_url: impl Into<String>) -> Self {
        Self {
            step_index,
            image_url: Some(image_url.into()),
        }
    }

    pub fn failed(step_index: usize) -> Self {
        Self {
            step_index,
            image_url: None,
        }
    }
}

/// What a polling client sees.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartialRecipe {
    pub request_id: String,
    pub recipe: Recipe,
    /// One entry per step of `recipe`.
    pub step_status: Vec<StepImageStatus>,
    pub updated_at: DateTime<Utc>,
}

impl PartialRecipe {
    fn from_snapshot(request_id: &str, snapshot: &Recipe) -> Self {
        let step_status = snapshot
            .steps
            .iter()
            .map(|s| match s.image_url {
                Some(_) => StepImageStatus::Ready,
                None => StepImageStatus::Pending,
            })
            .collect();
        Self {
            request_id: request_id.to_string(),
            recipe: snapshot.clone(),
            step_status,
            updated_at: Utc::now(),
        }
    }

    /// Take the snapshot's recipe fields but keep per-step image results
    /// already recorded by other writers.
    fn merge_snapshot(&mut self, snapshot: &Recipe) {
        let merged = Self::from_snapshot(&self.request_id, snapshot);
        let previous = std::mem::replace(self, merged);
        for (index, status) in previous.step_status.iter().enumerate() {
            if *status == StepImageStatus::Pending || index >= self.recipe.steps.len() {
                continue;
            }
            self.step_status[index] = *status;
            self.recipe.steps[index].image_url = previous.recipe.steps[index].image_url.clone();
        }
    }

    fn apply(&mut self, update: &StepImageUpdate) -> bool {
        let Some(step) = self.recipe.steps.get_mut(update.step_index) else {
            return false;
        };
        step.image_url = update.image_url.clone();
        self.step_status[update.step_index] = match update.image_url {
            Some(_) => StepImageStatus::Ready,
            None => StepImageStatus::Failed,
        };
        true
    }

    pub fn is_settled(&self) -> bool {
        self.step_status
            .iter()
            .all(|s| *s != StepImageStatus::Pending)
    }
}

/// Shared partial-result store.
///
/// Implementations must merge concurrent writes for the same request: two
/// image tasks finishing together both end up visible.
#[async_trait]
pub trait ProgressPublisher: Send + Sync {
    async fn publish_partial(
        &self,
        request_id: &str,
        snapshot: &Recipe,
        update: Option<StepImageUpdate>,
    ) -> Result<()>;

    async fn get_partial(&self, request_id: &str) -> Result<Option<PartialRecipe>>;
}

struct StoredPartial {
    partial: PartialRecipe,
    expires_at: Instant,
}

/// In-process publisher with a per-entry time to live.
pub struct InMemoryProgressPublisher {
    entries: DashMap<String, StoredPartial>,
    ttl: Duration,
}

impl InMemoryProgressPublisher {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop expired entries; returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, stored| stored.expires_at > now);
        before.saturating_sub(self.entries.len())
    }

    /// Sweep expired entries every TTL until `token` is cancelled.
    pub fn start_expiry_sweep(self: &Arc<Self>, token: CancellationToken) -> JoinHandle<()> {
        let publisher = Arc::clone(self);
        let period = self.ttl.max(Duration::from_secs(1));
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => {
                        let removed = publisher.purge_expired();
                        if removed > 0 {
                            debug!(removed, "Expired partial results");
                        }
                    }
                }
            }
        })
    }
}

#[async_trait]
impl ProgressPublisher for InMemoryProgressPublisher {
    async fn publish_partial(
        &self,
        request_id: &str,
        snapshot: &Recipe,
        update: Option<StepImageUpdate>,
    ) -> Result<()> {
        let now = Instant::now();
        let expires_at = now + self.ttl;

        // The entry guard holds the shard lock, so read-merge-write is atomic.
        let mut stored = match self.entries.entry(request_id.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().expires_at <= now {
                    occupied.insert(StoredPartial {
                        partial: PartialRecipe::from_snapshot(request_id, snapshot),
                        expires_at,
                    });
                } else {
                    occupied.get_mut().partial.merge_snapshot(snapshot);
                }
                occupied.into_ref()
            }
            Entry::Vacant(vacant) => vacant.insert(StoredPartial {
                partial: PartialRecipe::from_snapshot(request_id, snapshot),
                expires_at,
            }),
        };

        if let Some(update) = &update
            && !stored.partial.apply(update)
        {
            warn!(
                request_id,
                step_index = update.step_index,
                steps = stored.partial.recipe.steps.len(),
                "Ignoring image update for unknown step"
            );
        }
        stored.partial.updated_at = Utc::now();
        stored.expires_at = expires_at;
        Ok(())
    }

    async fn get_partial(&self, request_id: &str) -> Result<Option<PartialRecipe>> {
        let now = Instant::now();
        Ok(self
            .entries
            .get(request_id)
            .filter(|stored| stored.expires_at > now)
            .map(|stored| stored.partial.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::parse_generated_recipe;

    fn snapshot(steps: usize) -> Recipe {
        let steps: Vec<String> = (0..steps).map(|i| format!("\"step {}\"", i)).collect();
        let raw = format!(r#"{{"title": "Stew", "steps": [{}]}}"#, steps.join(","));
        Recipe::from_generated("r-1", "stew", parse_generated_recipe(&raw).unwrap())
    }

    #[tokio::test]
    async fn test_initial_publish_is_all_pending() {
        let publisher = InMemoryProgressPublisher::new(Duration::from_secs(60));
        publisher
            .publish_partial("req", &snapshot(3), None)
            .await
            .unwrap();

        let partial = publisher.get_partial("req").await.unwrap().unwrap();
        assert_eq!(partial.step_status, vec![StepImageStatus::Pending; 3]);
        assert!(!partial.is_settled());
    }

    #[tokio::test]
    async fn test_step_updates_do_not_clobber_each_other() {
        let publisher = Arc::new(InMemoryProgressPublisher::new(Duration::from_secs(60)));
        let base = snapshot(4);

        let writers: Vec<_> = (0..4)
            .map(|i| {
                let publisher = Arc::clone(&publisher);
                let base = base.clone();
                tokio::spawn(async move {
                    let update = if i == 2 {
                        StepImageUpdate::failed(i)
                    } else {
                        StepImageUpdate::ready(i, format!("https://cdn/{}.png", i))
                    };
                    publisher
                        .publish_partial("req", &base, Some(update))
                        .await
                        .unwrap();
                })
            })
            .collect();
        for writer in writers {
            writer.await.unwrap();
        }

        let partial = publisher.get_partial("req").await.unwrap().unwrap();
        assert!(partial.is_settled());
        assert_eq!(partial.step_status[2], StepImageStatus::Failed);
        assert_eq!(partial.recipe.steps[2].image_url, None);
        for i in [0, 1, 3] {
            assert_eq!(
                partial.recipe.steps[i].image_url.as_deref(),
                Some(format!("https://cdn/{}.png", i).as_str())
            );
        }
    }

    #[tokio::test]
    async fn test_late_initial_snapshot_keeps_step_results() {
        let publisher = InMemoryProgressPublisher::new(Duration::from_secs(60));
        let base = snapshot(2);
        publisher
            .publish_partial("req", &base, Some(StepImageUpdate::ready(1, "https://cdn/1.png")))
            .await
            .unwrap();
        publisher.publish_partial("req", &base, None).await.unwrap();

        let partial = publisher.get_partial("req").await.unwrap().unwrap();
        assert_eq!(partial.step_status[1], StepImageStatus::Ready);
        assert_eq!(
            partial.recipe.steps[1].image_url.as_deref(),
            Some("https://cdn/1.png")
        );
    }

    #[tokio::test]
    async fn test_out_of_range_update_is_ignored() {
        let publisher = InMemoryProgressPublisher::new(Duration::from_secs(60));
        publisher
            .publish_partial("req", &snapshot(1), Some(StepImageUpdate::ready(5, "u")))
            .await
            .unwrap();

        let partial = publisher.get_partial("req").await.unwrap().unwrap();
        assert_eq!(partial.step_status, vec![StepImageStatus::Pending]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_entries_expire_after_ttl() {
        let publisher = InMemoryProgressPublisher::new(Duration::from_secs(10));
        publisher
            .publish_partial("req", &snapshot(1), None)
            .await
            .unwrap();

        tokio::time::advance(Duration::from_secs(11)).await;

        assert!(publisher.get_partial("req").await.unwrap().is_none());
        assert_eq!(publisher.purge_expired(), 1);
        assert!(publisher.is_empty());
    }
}
