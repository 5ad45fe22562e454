//! Task row model.

use serde_json::Value;
use sqlx::FromRow;

use crate::database::time::{from_ms, opt_from_ms, opt_to_ms, to_ms};
use crate::pipeline::task_queue::{Task, TaskState};
use crate::{Error, Result};

/// Row of the `tasks` table.
#[derive(Debug, Clone, FromRow)]
pub struct TaskDbModel {
    pub id: String,
    pub queue: String,
    pub name: String,
    /// JSON payload
    pub data: String,
    pub state: String,
    pub priority: i64,
    pub progress: i64,
    pub attempts_made: i64,
    pub max_attempts: i64,
    pub backoff_ms: i64,
    pub stalled_count: i64,
    pub lock_owner: Option<String>,
    pub locked_until: Option<i64>,
    pub run_at: i64,
    /// JSON return value
    pub return_value: Option<String>,
    pub failed_reason: Option<String>,
    pub keep_completed: Option<i64>,
    pub keep_failed: Option<i64>,
    pub created_at: i64,
    pub processed_at: Option<i64>,
    pub finished_at: Option<i64>,
}

impl TaskDbModel {
    pub fn from_task(task: &Task) -> Result<Self> {
        Ok(Self {
            id: task.id.clone(),
            queue: task.queue.clone(),
            name: task.name.clone(),
            data: serde_json::to_string(&task.data)?,
            state: task.state.to_string(),
            priority: i64::from(task.priority),
            progress: i64::from(task.progress),
            attempts_made: i64::from(task.attempts_made),
            max_attempts: i64::from(task.max_attempts),
            backoff_ms: i64::try_from(task.backoff_ms).unwrap_or(i64::MAX),
            stalled_count: i64::from(task.stalled_count),
            lock_owner: task.lock_owner.clone(),
            locked_until: opt_to_ms(task.locked_until),
            run_at: to_ms(task.run_at),
            return_value: task
                .return_value
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?,
            failed_reason: task.failed_reason.clone(),
            keep_completed: task.keep_completed.map(i64::from),
            keep_failed: task.keep_failed.map(i64::from),
            created_at: to_ms(task.created_at),
            processed_at: opt_to_ms(task.processed_at),
            finished_at: opt_to_ms(task.finished_at),
        })
    }

    pub fn into_task(self) -> Result<Task> {
        let state: TaskState = self.state.parse().map_err(|_| {
            Error::Database(format!("task {} has unknown state '{}'", self.id, self.state))
        })?;
        let data: Value = serde_json::from_str(&self.data)?;
        let return_value = self
            .return_value
            .as_deref()
            .map(serde_json::from_str)
            .transpose()?;

        Ok(Task {
            id: self.id,
            queue: self.queue,
            name: self.name,
            data,
            state,
            priority: clamp_i32(self.priority),
            progress: self.progress.clamp(0, 100) as u8,
            attempts_made: clamp_u32(self.attempts_made),
            max_attempts: clamp_u32(self.max_attempts),
            backoff_ms: u64::try_from(self.backoff_ms).unwrap_or(0),
            stalled_count: clamp_u32(self.stalled_count),
            lock_owner: self.lock_owner,
            locked_until: opt_from_ms(self.locked_until),
            run_at: from_ms(self.run_at),
            return_value,
            failed_reason: self.failed_reason,
            keep_completed: self.keep_completed.map(clamp_u32),
            keep_failed: self.keep_failed.map(clamp_u32),
            created_at: from_ms(self.created_at),
            processed_at: opt_from_ms(self.processed_at),
            finished_at: opt_from_ms(self.finished_at),
        })
    }
}

fn clamp_u32(v: i64) -> u32 {
    v.clamp(0, i64::from(u32::MAX)) as u32
}

fn clamp_i32(v: i64) -> i32 {
    v.clamp(i64::from(i32::MIN), i64::from(i32::MAX)) as i32
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::task_queue::EnqueueOptions;
    use serde_json::json;

    #[test]
    fn test_model_preserves_task_fields() {
        let mut task = Task::new(
            "image-generation",
            "image",
            json!({"stepIndex": 2}),
            &EnqueueOptions::default().with_retention(Some(10), None),
        );
        task.return_value = Some(json!({"imageUrl": "https://cdn/2.png"}));

        let model = TaskDbModel::from_task(&task).unwrap();
        assert_eq!(model.state, "waiting");
        assert_eq!(model.keep_completed, Some(10));

        let back = model.into_task().unwrap();
        assert_eq!(back.data, task.data);
        assert_eq!(back.return_value, task.return_value);
        assert_eq!(
            back.created_at.timestamp_millis(),
            task.created_at.timestamp_millis()
        );
    }

    #[test]
    fn test_unknown_state_is_rejected() {
        let task = Task::new("q", "t", json!({}), &EnqueueOptions::default());
        let mut model = TaskDbModel::from_task(&task).unwrap();
        model.state = "PAUSED".to_string();
        assert!(matches!(model.into_task(), Err(Error::Database(_))));
    }
}
