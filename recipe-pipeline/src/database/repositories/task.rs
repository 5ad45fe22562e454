//! SQLite-backed task store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::SqlitePool;

use crate::Result;
use crate::database::models::TaskDbModel;
use crate::database::retry::retry_on_busy;
use crate::database::time::to_ms;
use crate::pipeline::task_queue::{Task, TaskState};
use crate::pipeline::task_store::{STALLED_FAILURE_REASON, StalledRecovery, TaskCounts, TaskStore};

/// SQLx implementation of [`TaskStore`].
///
/// Every transition is a single statement, so claims stay atomic across
/// processes sharing the database file.
#[derive(Clone)]
pub struct SqlxTaskStore {
    pool: SqlitePool,
}

impl SqlxTaskStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TaskStore for SqlxTaskStore {
    async fn insert(&self, task: &Task) -> Result<()> {
        let m = TaskDbModel::from_task(task)?;
        retry_on_busy("tasks.insert", || async {
            sqlx::query(
                r#"
                INSERT INTO tasks (
                    id, queue, name, data, state, priority, progress, attempts_made,
                    max_attempts, backoff_ms, stalled_count, lock_owner, locked_until,
                    run_at, return_value, failed_reason, keep_completed, keep_failed,
                    created_at, processed_at, finished_at
                )
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&m.id)
            .bind(&m.queue)
            .bind(&m.name)
            .bind(&m.data)
            .bind(&m.state)
            .bind(m.priority)
            .bind(m.progress)
            .bind(m.attempts_made)
            .bind(m.max_attempts)
            .bind(m.backoff_ms)
            .bind(m.stalled_count)
            .bind(&m.lock_owner)
            .bind(m.locked_until)
            .bind(m.run_at)
            .bind(&m.return_value)
            .bind(&m.failed_reason)
            .bind(m.keep_completed)
            .bind(m.keep_failed)
            .bind(m.created_at)
            .bind(m.processed_at)
            .bind(m.finished_at)
            .execute(&self.pool)
            .await?;
            Ok(())
        })
        .await
    }

    async fn get(&self, id: &str) -> Result<Option<Task>> {
        sqlx::query_as::<_, TaskDbModel>("SELECT * FROM tasks WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .map(TaskDbModel::into_task)
            .transpose()
    }

    async fn claim_next(
        &self,
        queue: &str,
        worker_id: &str,
        lock_until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Option<Task>> {
        let now_ms = to_ms(now);
        let row = retry_on_busy("tasks.claim_next", || async {
            Ok(sqlx::query_as::<_, TaskDbModel>(
                r#"
                UPDATE tasks
                SET state = 'active',
                    attempts_made = attempts_made + 1,
                    progress = 0,
                    lock_owner = ?,
                    locked_until = ?,
                    processed_at = ?
                WHERE id = (
                    SELECT id FROM tasks
                    WHERE queue = ? AND state IN ('waiting', 'delayed') AND run_at <= ?
                    ORDER BY priority DESC, created_at, rowid
                    LIMIT 1
                )
                AND state IN ('waiting', 'delayed')
                RETURNING *
                "#,
            )
            .bind(worker_id)
            .bind(to_ms(lock_until))
            .bind(now_ms)
            .bind(queue)
            .bind(now_ms)
            .fetch_optional(&self.pool)
            .await?)
        })
        .await?;

        row.map(TaskDbModel::into_task).transpose()
    }

    async fn extend_lock(
        &self,
        id: &str,
        worker_id: &str,
        lock_until: DateTime<Utc>,
    ) -> Result<bool> {
        let result = retry_on_busy("tasks.extend_lock", || async {
            Ok(sqlx::query(
                "UPDATE tasks SET locked_until = ? WHERE id = ? AND state = 'active' AND lock_owner = ?",
            )
            .bind(to_ms(lock_until))
            .bind(id)
            .bind(worker_id)
            .execute(&self.pool)
            .await?)
        })
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn update_data(&self, id: &str, data: &Value) -> Result<bool> {
        let data = serde_json::to_string(data)?;
        let result = retry_on_busy("tasks.update_data", || async {
            Ok(sqlx::query("UPDATE tasks SET data = ? WHERE id = ?")
                .bind(&data)
                .bind(id)
                .execute(&self.pool)
                .await?)
        })
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn update_progress(&self, id: &str, progress: u8) -> Result<bool> {
        let progress = i64::from(progress.min(100));
        let result = retry_on_busy("tasks.update_progress", || async {
            Ok(
                sqlx::query("UPDATE tasks SET progress = ? WHERE id = ? AND progress < ?")
                    .bind(progress)
                    .bind(id)
                    .bind(progress)
                    .execute(&self.pool)
                    .await?,
            )
        })
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn mark_completed(
        &self,
        id: &str,
        worker_id: &str,
        return_value: &Value,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let value = serde_json::to_string(return_value)?;
        let result = retry_on_busy("tasks.mark_completed", || async {
            Ok(sqlx::query(
                r#"
                UPDATE tasks
                SET state = 'completed', return_value = ?, finished_at = ?,
                    lock_owner = NULL, locked_until = NULL
                WHERE id = ? AND state = 'active' AND lock_owner = ?
                "#,
            )
            .bind(&value)
            .bind(to_ms(now))
            .bind(id)
            .bind(worker_id)
            .execute(&self.pool)
            .await?)
        })
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn mark_failed(
        &self,
        id: &str,
        worker_id: &str,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let result = retry_on_busy("tasks.mark_failed", || async {
            Ok(sqlx::query(
                r#"
                UPDATE tasks
                SET state = 'failed', failed_reason = ?, finished_at = ?,
                    lock_owner = NULL, locked_until = NULL
                WHERE id = ? AND state = 'active' AND lock_owner = ?
                "#,
            )
            .bind(reason)
            .bind(to_ms(now))
            .bind(id)
            .bind(worker_id)
            .execute(&self.pool)
            .await?)
        })
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn mark_delayed(
        &self,
        id: &str,
        worker_id: &str,
        reason: &str,
        run_at: DateTime<Utc>,
    ) -> Result<bool> {
        let result = retry_on_busy("tasks.mark_delayed", || async {
            Ok(sqlx::query(
                r#"
                UPDATE tasks
                SET state = 'delayed', failed_reason = ?, run_at = ?,
                    lock_owner = NULL, locked_until = NULL
                WHERE id = ? AND state = 'active' AND lock_owner = ?
                "#,
            )
            .bind(reason)
            .bind(to_ms(run_at))
            .bind(id)
            .bind(worker_id)
            .execute(&self.pool)
            .await?)
        })
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn recover_stalled(
        &self,
        now: DateTime<Utc>,
        max_stalled_count: u32,
    ) -> Result<StalledRecovery> {
        let now_ms = to_ms(now);
        let limit = i64::from(max_stalled_count);
        let rows = retry_on_busy("tasks.recover_stalled", || async {
            Ok(sqlx::query_as::<_, TaskDbModel>(
                r#"
                UPDATE tasks
                SET stalled_count = stalled_count + 1,
                    lock_owner = NULL,
                    locked_until = NULL,
                    state = CASE WHEN stalled_count + 1 > ?1 THEN 'failed' ELSE 'waiting' END,
                    failed_reason = CASE WHEN stalled_count + 1 > ?1 THEN ?2 ELSE failed_reason END,
                    finished_at = CASE WHEN stalled_count + 1 > ?1 THEN ?3 ELSE finished_at END,
                    run_at = CASE WHEN stalled_count + 1 > ?1 THEN run_at ELSE ?3 END
                WHERE state = 'active' AND locked_until < ?3
                RETURNING *
                "#,
            )
            .bind(limit)
            .bind(STALLED_FAILURE_REASON)
            .bind(now_ms)
            .fetch_all(&self.pool)
            .await?)
        })
        .await?;

        let mut recovery = StalledRecovery::default();
        for row in rows {
            let task = row.into_task()?;
            if task.state == TaskState::Failed {
                recovery.failed.push(task);
            } else {
                recovery.requeued.push(task);
            }
        }
        Ok(recovery)
    }

    async fn remove(&self, id: &str) -> Result<bool> {
        let result = retry_on_busy("tasks.remove", || async {
            Ok(sqlx::query("DELETE FROM tasks WHERE id = ?")
                .bind(id)
                .execute(&self.pool)
                .await?)
        })
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn counts(&self, queue: &str) -> Result<TaskCounts> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT state, COUNT(*) FROM tasks WHERE queue = ? GROUP BY state")
                .bind(queue)
                .fetch_all(&self.pool)
                .await?;

        let mut counts = TaskCounts::default();
        for (state, n) in rows {
            let n = u64::try_from(n).unwrap_or(0);
            match state.parse::<TaskState>() {
                Ok(TaskState::Waiting) => counts.waiting += n,
                Ok(TaskState::Active) => counts.active += n,
                Ok(TaskState::Delayed) => counts.delayed += n,
                Ok(TaskState::Completed) => counts.completed += n,
                Ok(TaskState::Failed) => counts.failed += n,
                Err(_) => tracing::warn!(state = %state, "Unknown task state in counts"),
            }
        }
        Ok(counts)
    }

    async fn trim_finished(&self, queue: &str, state: TaskState, keep: u32) -> Result<u64> {
        let result = retry_on_busy("tasks.trim_finished", || async {
            Ok(sqlx::query(
                r#"
                DELETE FROM tasks WHERE id IN (
                    SELECT id FROM tasks
                    WHERE queue = ? AND state = ?
                    ORDER BY COALESCE(finished_at, created_at) DESC, rowid DESC
                    LIMIT -1 OFFSET ?
                )
                "#,
            )
            .bind(queue)
            .bind(state.as_ref())
            .bind(i64::from(keep))
            .execute(&self.pool)
            .await?)
        })
        .await?;
        Ok(result.rows_affected())
    }

    async fn purge_finished_before(&self, cutoff: DateTime<Utc>, limit: u32) -> Result<u64> {
        let result = retry_on_busy("tasks.purge_finished_before", || async {
            Ok(sqlx::query(
                r#"
                DELETE FROM tasks WHERE id IN (
                    SELECT id FROM tasks
                    WHERE state IN ('completed', 'failed') AND finished_at < ?
                    LIMIT ?
                )
                "#,
            )
            .bind(to_ms(cutoff))
            .bind(i64::from(limit))
            .execute(&self.pool)
            .await?)
        })
        .await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::connect;
    use crate::pipeline::task_queue::EnqueueOptions;
    use chrono::TimeDelta;
    use serde_json::json;

    async fn store() -> (SqlxTaskStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite:{}?mode=rwc", dir.path().join("tasks.db").display());
        let pool = connect(&url, 2).await.unwrap();
        (SqlxTaskStore::new(pool), dir)
    }

    fn task(priority: i32) -> Task {
        Task::new(
            "q",
            "t",
            json!({"cancelled": false}),
            &EnqueueOptions::default().with_priority(priority),
        )
    }

    #[tokio::test]
    async fn test_claim_order_and_lock() {
        let (store, _dir) = store().await;
        let low = task(0);
        let high = task(10);
        store.insert(&low).await.unwrap();
        store.insert(&high).await.unwrap();

        let now = Utc::now();
        let lock = now + TimeDelta::seconds(30);
        let first = store.claim_next("q", "w", lock, now).await.unwrap().unwrap();
        assert_eq!(first.id, high.id);
        assert_eq!(first.state, TaskState::Active);
        assert_eq!(first.attempts_made, 1);
        assert_eq!(first.lock_owner.as_deref(), Some("w"));

        let second = store.claim_next("q", "w", lock, now).await.unwrap().unwrap();
        assert_eq!(second.id, low.id);
        assert!(store.claim_next("q", "w", lock, now).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_data_and_progress_updates() {
        let (store, _dir) = store().await;
        let t = task(0);
        store.insert(&t).await.unwrap();

        assert!(
            store
                .update_data(&t.id, &json!({"cancelled": true}))
                .await
                .unwrap()
        );
        assert!(store.update_progress(&t.id, 40).await.unwrap());
        assert!(!store.update_progress(&t.id, 20).await.unwrap());

        let loaded = store.get(&t.id).await.unwrap().unwrap();
        assert_eq!(loaded.data["cancelled"], true);
        assert_eq!(loaded.progress, 40);
    }

    #[tokio::test]
    async fn test_complete_requires_owner_and_counts() {
        let (store, _dir) = store().await;
        let t = task(0);
        store.insert(&t).await.unwrap();
        let now = Utc::now();
        store
            .claim_next("q", "owner", now + TimeDelta::seconds(30), now)
            .await
            .unwrap();

        assert!(
            !store
                .mark_completed(&t.id, "other", &json!(1), now)
                .await
                .unwrap()
        );
        assert!(
            store
                .mark_completed(&t.id, "owner", &json!({"ok": true}), now)
                .await
                .unwrap()
        );

        let counts = store.counts("q").await.unwrap();
        assert_eq!(counts.completed, 1);
        assert_eq!(counts.pending(), 0);
        let done = store.get(&t.id).await.unwrap().unwrap();
        assert_eq!(done.return_value, Some(json!({"ok": true})));
    }

    #[tokio::test]
    async fn test_delayed_task_runs_after_run_at() {
        let (store, _dir) = store().await;
        let t = task(0);
        store.insert(&t).await.unwrap();
        let now = Utc::now();
        store
            .claim_next("q", "w", now + TimeDelta::seconds(30), now)
            .await
            .unwrap();
        let run_at = now + TimeDelta::seconds(5);
        assert!(store.mark_delayed(&t.id, "w", "boom", run_at).await.unwrap());

        let lock = now + TimeDelta::seconds(60);
        assert!(store.claim_next("q", "w", lock, now).await.unwrap().is_none());
        let retried = store
            .claim_next("q", "w", lock, run_at + TimeDelta::seconds(1))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(retried.attempts_made, 2);
        assert_eq!(retried.failed_reason.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn test_recover_stalled_requeues_then_fails() {
        let (store, _dir) = store().await;
        let t = task(0);
        store.insert(&t).await.unwrap();

        let now = Utc::now();
        store.claim_next("q", "w", now, now).await.unwrap();
        let later = now + TimeDelta::seconds(1);
        let first = store.recover_stalled(later, 1).await.unwrap();
        assert_eq!(first.requeued.len(), 1);
        assert!(first.failed.is_empty());

        store.claim_next("q", "w", later, later).await.unwrap();
        let second = store
            .recover_stalled(later + TimeDelta::seconds(1), 1)
            .await
            .unwrap();
        assert_eq!(second.failed.len(), 1);
        assert_eq!(
            second.failed[0].failed_reason.as_deref(),
            Some(STALLED_FAILURE_REASON)
        );
    }

    #[tokio::test]
    async fn test_trim_and_purge() {
        let (store, _dir) = store().await;
        let base = Utc::now() - TimeDelta::days(3);
        for i in 0..4 {
            let mut t = task(0);
            t.state = TaskState::Completed;
            t.finished_at = Some(base + TimeDelta::minutes(i));
            store.insert(&t).await.unwrap();
        }

        assert_eq!(
            store
                .trim_finished("q", TaskState::Completed, 3)
                .await
                .unwrap(),
            1
        );
        assert_eq!(
            store
                .purge_finished_before(Utc::now() - TimeDelta::days(1), 2)
                .await
                .unwrap(),
            2
        );
        assert_eq!(store.counts("q").await.unwrap().completed, 1);
    }
}
