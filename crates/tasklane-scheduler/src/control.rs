//! Control plane: submit / list / get_status / update / cancel / retry / run_sweep.
//!
//! Validation, not-found and state-conflict errors are returned to the caller
//! and leave the record untouched. Dispatch errors never are: they land on the
//! record as a FAILED transition.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use tasklane_core::{
    ExecutionStep, Page, Priority, Recurrence, Result, StatusSnapshot, Task, TaskFilter,
    TaskLaneError, TaskQuery, TaskStatus,
};

use crate::cron;
use crate::engine::Engine;
use crate::notify::TaskEventKind;

/// Longest accepted description, in characters.
pub const MAX_DESCRIPTION_LEN: usize = 10_000;

const MAX_WRITE_ATTEMPTS: usize = 8;

/// Input of [`ControlPlane::submit`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubmitRequest {
    /// Falls back to `default_tenant` from config.
    #[serde(default)]
    pub tenant_id: Option<String>,
    pub description: String,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub scheduled_for: Option<DateTime<Utc>>,
    /// `hourly`, `daily`, `weekly`, `@every 15m`, or a 5-field cron expression.
    #[serde(default)]
    pub recurring_pattern: Option<String>,
    #[serde(default)]
    pub attachments: Vec<String>,
    #[serde(default)]
    pub metadata: Option<Value>,
    #[serde(default)]
    pub output_format: Option<String>,
    #[serde(default)]
    pub scheduled_post_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub parent_task_id: Option<String>,
}

impl SubmitRequest {
    pub fn new(description: impl Into<String>, priority: Priority) -> Self {
        Self {
            description: description.into(),
            priority,
            ..Default::default()
        }
    }
}

/// Allow-listed fields of [`ControlPlane::update`]. Unset fields are left alone.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskPatch {
    #[serde(default)]
    pub priority: Option<Priority>,
    #[serde(default)]
    pub status: Option<TaskStatus>,
    /// 0..=100; lower than the stored value leaves progress unchanged.
    #[serde(default)]
    pub progress: Option<i64>,
    #[serde(default)]
    pub step: Option<ExecutionStep>,
    #[serde(default)]
    pub error: Option<String>,
    /// Shallow-merged into the stored metadata object.
    #[serde(default)]
    pub metadata: Option<Value>,
}

impl TaskPatch {
    pub fn is_empty(&self) -> bool {
        self.priority.is_none()
            && self.status.is_none()
            && self.progress.is_none()
            && self.step.is_none()
            && self.error.is_none()
            && self.metadata.is_none()
    }

    fn validate(&self) -> Result<()> {
        if let Some(progress) = self.progress
            && !(0..=100).contains(&progress)
        {
            return Err(TaskLaneError::validation(format!(
                "progress must be within 0..=100, got {progress}"
            )));
        }
        if self.status == Some(TaskStatus::Submitted) {
            return Err(TaskLaneError::validation(
                "status cannot be set to submitted; use retry",
            ));
        }
        if let Some(status @ (TaskStatus::Queued | TaskStatus::InProgress)) = self.status {
            return Err(TaskLaneError::validation(format!(
                "status cannot be set to {status}; dispatch and workers own it"
            )));
        }
        if let Some(metadata) = &self.metadata
            && !metadata.is_object()
        {
            return Err(TaskLaneError::validation("metadata patch must be an object"));
        }
        Ok(())
    }

    fn fields(&self) -> Vec<&'static str> {
        [
            ("priority", self.priority.is_some()),
            ("status", self.status.is_some()),
            ("progress", self.progress.is_some()),
            ("step", self.step.is_some()),
            ("error", self.error.is_some()),
            ("metadata", self.metadata.is_some()),
        ]
        .into_iter()
        .filter_map(|(name, set)| set.then_some(name))
        .collect()
    }

    fn apply(&self, task: &mut Task, now: DateTime<Utc>) -> Result<()> {
        if let Some(priority) = self.priority {
            task.priority = priority;
        }
        if let Some(status) = self.status
            && status != task.status
        {
            task.transition(status, now)?;
        }
        if let Some(progress) = self.progress {
            task.advance_progress(progress);
        }
        if let Some(step) = &self.step {
            task.record_step(step.clone())?;
        }
        if let Some(error) = &self.error {
            task.error = Some(error.clone());
        }
        if let Some(Value::Object(patch)) = &self.metadata {
            if !task.metadata.is_object() {
                task.metadata = json!({});
            }
            if let Some(stored) = task.metadata.as_object_mut() {
                for (key, value) in patch {
                    stored.insert(key.clone(), value.clone());
                }
            }
        }
        task.updated_at = now;
        Ok(())
    }
}

#[derive(Clone)]
pub struct ControlPlane {
    engine: Arc<Engine>,
}

impl ControlPlane {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self { engine }
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    async fn load(&self, task_id: &str) -> Result<Task> {
        self.engine
            .store()
            .get(task_id)
            .await?
            .ok_or_else(|| TaskLaneError::NotFound(task_id.to_string()))
    }

    /// Create a SUBMITTED record; dispatch it right away when it is already due.
    pub async fn submit(&self, request: SubmitRequest) -> Result<Task> {
        let description = request.description.trim();
        if description.is_empty() {
            return Err(TaskLaneError::validation("description must not be empty"));
        }
        if description.chars().count() > MAX_DESCRIPTION_LEN {
            return Err(TaskLaneError::validation(format!(
                "description exceeds {MAX_DESCRIPTION_LEN} characters"
            )));
        }
        let tenant_id = request
            .tenant_id
            .unwrap_or_else(|| self.engine.config().default_tenant.clone());
        if tenant_id.trim().is_empty() {
            return Err(TaskLaneError::validation("tenant_id must not be empty"));
        }
        let recurrence = match &request.recurring_pattern {
            Some(pattern) => {
                let recurrence = Recurrence::parse(pattern)?;
                cron::validate(&recurrence)?;
                Some(recurrence)
            }
            None => None,
        };
        let metadata = match request.metadata {
            None | Some(Value::Null) => json!({}),
            Some(Value::Object(map)) => Value::Object(map),
            Some(_) => return Err(TaskLaneError::validation("metadata must be an object")),
        };
        if let Some(parent) = &request.parent_task_id {
            self.load(parent).await?;
        }

        let mut task = Task::new(tenant_id, description, request.priority);
        task.scheduled_for = request.scheduled_for;
        task.recurring_pattern = recurrence;
        task.attachments = request.attachments;
        task.metadata = metadata;
        task.output_format = request.output_format;
        task.scheduled_post_time = request.scheduled_post_time;
        task.parent_task_id = request.parent_task_id;

        let task = self.engine.store().insert(&task).await?;
        self.engine.notifier().publish(
            &task.tenant_id,
            &task.id,
            TaskEventKind::Created,
            json!({ "priority": task.priority, "scheduled_for": task.scheduled_for }),
        );
        tracing::info!("📝 Submitted {} ({}) for {}", task.id, task.priority, task.tenant_id);

        self.engine.admit(task, Utc::now()).await
    }

    /// Tenant-scoped listing, newest first.
    pub async fn list(&self, tenant_id: &str, filter: TaskFilter, page: Page) -> Result<Vec<Task>> {
        filter.validate()?;
        page.validate()?;
        self.engine
            .store()
            .query(&TaskQuery {
                tenant_id: tenant_id.to_string(),
                filter,
                page,
            })
            .await
    }

    pub async fn get_status(&self, task_id: &str) -> Result<StatusSnapshot> {
        Ok(self.load(task_id).await?.snapshot())
    }

    /// Apply an allow-listed patch. Terminal records reject any change.
    pub async fn update(&self, task_id: &str, patch: TaskPatch) -> Result<Task> {
        patch.validate()?;
        if patch.is_empty() {
            return self.load(task_id).await;
        }

        for _ in 0..MAX_WRITE_ATTEMPTS {
            let before = self.load(task_id).await?;
            if before.status.is_terminal() {
                return Err(TaskLaneError::conflict(format!(
                    "task {} is {} and can no longer change",
                    before.id, before.status
                )));
            }
            if before.status == TaskStatus::Failed
                && (patch.progress.is_some() || patch.step.is_some())
            {
                return Err(TaskLaneError::conflict(format!(
                    "task {} failed; progress is frozen until retry",
                    before.id
                )));
            }

            let mut after = before.clone();
            patch.apply(&mut after, Utc::now())?;
            let stored = match self.engine.store().update(&after).await {
                Ok(stored) => stored,
                Err(e) if e.is_stale_write() => continue,
                Err(e) => return Err(e),
            };

            self.engine.notifier().publish(
                &stored.tenant_id,
                &stored.id,
                TaskEventKind::Updated,
                json!({ "fields": patch.fields() }),
            );
            if stored.status != before.status {
                self.engine.publish_status(&stored);
                if stored.status.is_finished() {
                    self.engine.abandon_attempt(&stored).await;
                }
            }
            let stored = self.engine.reroute(&before, stored).await?;
            tracing::info!("✏️ Updated {} ({})", stored.id, patch.fields().join(", "));
            return Ok(stored);
        }
        Err(TaskLaneError::StaleWrite(task_id.to_string()))
    }

    /// Cancel a live task. Returns false when it already finished.
    pub async fn cancel(&self, task_id: &str) -> Result<bool> {
        for _ in 0..MAX_WRITE_ATTEMPTS {
            let mut task = self.load(task_id).await?;
            if task.status.is_finished() {
                return Ok(false);
            }
            if !task.status.is_cancellable() {
                return Err(TaskLaneError::conflict(format!(
                    "task {} is {} and cannot be cancelled",
                    task.id, task.status
                )));
            }

            task.transition(TaskStatus::Cancelled, Utc::now())?;
            let stored = match self.engine.store().update(&task).await {
                Ok(stored) => stored,
                Err(e) if e.is_stale_write() => continue,
                Err(e) => return Err(e),
            };

            self.engine.publish_status(&stored);
            self.engine.notifier().publish(
                &stored.tenant_id,
                &stored.id,
                TaskEventKind::Cancelled,
                json!({ "attempt": stored.attempt }),
            );
            self.engine.abandon_attempt(&stored).await;
            tracing::info!("🛑 Cancelled {}", stored.id);
            return Ok(true);
        }
        Err(TaskLaneError::StaleWrite(task_id.to_string()))
    }

    /// Reset a FAILED task and send it down the dispatch path again.
    pub async fn retry(&self, task_id: &str) -> Result<Task> {
        for _ in 0..MAX_WRITE_ATTEMPTS {
            let mut task = self.load(task_id).await?;
            if let Some(max) = self.engine.config().retry.max_retries
                && task.status == TaskStatus::Failed
                && task.retry_count >= max
            {
                return Err(TaskLaneError::conflict(format!(
                    "task {} reached the retry limit of {max}",
                    task.id
                )));
            }

            let now = Utc::now();
            task.reset_for_retry(now)?;
            let stored = match self.engine.store().update(&task).await {
                Ok(stored) => stored,
                Err(e) if e.is_stale_write() => continue,
                Err(e) => return Err(e),
            };

            self.engine.notifier().publish(
                &stored.tenant_id,
                &stored.id,
                TaskEventKind::Retried,
                json!({ "retry_count": stored.retry_count }),
            );
            self.engine.publish_status(&stored);
            tracing::info!("🔄 Retry #{} of {}", stored.retry_count, stored.id);

            return self.engine.admit(stored, now).await;
        }
        Err(TaskLaneError::StaleWrite(task_id.to_string()))
    }

    /// Administrative sweep. Returns how many records were queued.
    pub async fn run_sweep(&self, now: DateTime<Utc>) -> Result<usize> {
        self.engine.sweep(now).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lanes::InMemoryLaneBroker;
    use crate::registry::ProcessorRegistry;
    use crate::store::InMemoryTaskStore;
    use tasklane_core::TaskLaneConfig;

    fn control(config: TaskLaneConfig) -> ControlPlane {
        control_with_broker(config).0
    }

    fn control_with_broker(config: TaskLaneConfig) -> (ControlPlane, Arc<InMemoryLaneBroker>) {
        let mut registry = ProcessorRegistry::new();
        registry.set_default_handler(crate::testing::Succeed);
        let broker = Arc::new(InMemoryLaneBroker::default());
        let engine = Engine::new(
            config,
            Arc::new(InMemoryTaskStore::new()),
            broker.clone(),
            Arc::new(registry),
        );
        (ControlPlane::new(Arc::new(engine)), broker)
    }

    #[tokio::test]
    async fn test_submit_validation() {
        let cp = control(TaskLaneConfig::default());
        let err = cp.submit(SubmitRequest::new("   ", Priority::Normal)).await.unwrap_err();
        assert!(matches!(err, TaskLaneError::Validation(_)));

        let mut bad_pattern = SubmitRequest::new("report", Priority::Normal);
        bad_pattern.recurring_pattern = Some("every now and then".into());
        assert!(matches!(
            cp.submit(bad_pattern).await.unwrap_err(),
            TaskLaneError::Validation(_)
        ));

        let mut bad_metadata = SubmitRequest::new("report", Priority::Normal);
        bad_metadata.metadata = Some(json!([1, 2]));
        assert!(cp.submit(bad_metadata).await.is_err());

        let mut orphan = SubmitRequest::new("subtask", Priority::Normal);
        orphan.parent_task_id = Some("task-missing".into());
        assert!(matches!(
            cp.submit(orphan).await.unwrap_err(),
            TaskLaneError::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_submit_rejects_interval_past_calendar() {
        let cp = control(TaskLaneConfig::default());
        let mut request = SubmitRequest::new("report", Priority::Normal);
        request.recurring_pattern = Some("@every 100000000d".into());
        assert!(matches!(
            cp.submit(request).await.unwrap_err(),
            TaskLaneError::Validation(_)
        ));
    }

    #[tokio::test]
    async fn test_submit_uses_default_tenant() {
        let cp = control(TaskLaneConfig::default());
        let task = cp.submit(SubmitRequest::new("hello", Priority::Low)).await.unwrap();
        assert_eq!(task.tenant_id, "default");
        assert_eq!(task.status, TaskStatus::Queued);
    }

    #[tokio::test]
    async fn test_update_patch_rules() {
        let cp = control(TaskLaneConfig::default());
        let task = cp.submit(SubmitRequest::new("hello", Priority::Low)).await.unwrap();

        let patched = cp
            .update(
                &task.id,
                TaskPatch {
                    status: Some(TaskStatus::Planning),
                    progress: Some(15),
                    metadata: Some(json!({"owner": "ops"})),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(patched.status, TaskStatus::Planning);
        assert_eq!(patched.progress, 15);
        assert_eq!(patched.metadata["owner"], "ops");

        // Illegal edge.
        let err = cp
            .update(
                &task.id,
                TaskPatch {
                    status: Some(TaskStatus::Completed),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, TaskLaneError::StateConflict(_)));

        let err = cp
            .update(
                &task.id,
                TaskPatch {
                    progress: Some(101),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, TaskLaneError::Validation(_)));

        assert!(cp.cancel(&task.id).await.unwrap());
        let err = cp
            .update(
                &task.id,
                TaskPatch {
                    error: Some("late".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, TaskLaneError::StateConflict(_)));
    }

    #[tokio::test]
    async fn test_priority_patch_moves_queued_token() {
        let cp = control(TaskLaneConfig::default());
        let task = cp.submit(SubmitRequest::new("hello", Priority::Low)).await.unwrap();
        cp.update(
            &task.id,
            TaskPatch {
                priority: Some(Priority::Urgent),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        let broker = cp.engine().broker();
        let token = broker
            .dequeue(tasklane_core::Lane::Priority)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(token.task_id, task.id);
        assert!(broker
            .dequeue(tasklane_core::Lane::Background)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_patch_cannot_force_dispatch_states() {
        let cp = control(TaskLaneConfig::default());
        let mut request = SubmitRequest::new("hello", Priority::Normal);
        let now = Utc::now();
        request.scheduled_for = Some(now + chrono::Duration::hours(1));
        let task = cp.submit(request).await.unwrap();
        assert_eq!(task.status, TaskStatus::Submitted);

        for status in [TaskStatus::Queued, TaskStatus::InProgress] {
            let err = cp
                .update(
                    &task.id,
                    TaskPatch {
                        status: Some(status),
                        ..Default::default()
                    },
                )
                .await
                .unwrap_err();
            assert!(matches!(err, TaskLaneError::Validation(_)));
        }

        let stored = cp.engine().store().get(&task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Submitted);
        assert_eq!(stored.attempt, 0);
        assert_eq!(cp.run_sweep(now + chrono::Duration::hours(2)).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_failed_task_progress_is_frozen() {
        let cp = control(TaskLaneConfig::default());
        let task = cp.submit(SubmitRequest::new("hello", Priority::Normal)).await.unwrap();
        cp.update(
            &task.id,
            TaskPatch {
                status: Some(TaskStatus::Failed),
                progress: Some(40),
                error: Some("boom".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        let err = cp
            .update(
                &task.id,
                TaskPatch {
                    progress: Some(90),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, TaskLaneError::StateConflict(_)));

        let annotated = cp
            .update(
                &task.id,
                TaskPatch {
                    error: Some("boom: upstream 502".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(annotated.progress, 40);
        assert_eq!(annotated.status, TaskStatus::Failed);
        assert_eq!(annotated.error.as_deref(), Some("boom: upstream 502"));
    }

    #[tokio::test]
    async fn test_priority_patch_fails_task_when_no_lane_accepts() {
        let (cp, broker) = control_with_broker(TaskLaneConfig::default());
        let task = cp.submit(SubmitRequest::new("hello", Priority::Low)).await.unwrap();
        assert_eq!(task.status, TaskStatus::Queued);

        broker.set_accepting(false);
        let moved = cp
            .update(
                &task.id,
                TaskPatch {
                    priority: Some(Priority::Urgent),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(moved.status, TaskStatus::Failed);
        assert!(moved.error.as_deref().unwrap_or_default().starts_with("Dispatch error"));
        assert_eq!(broker.total_pending().await, 0);
        assert_eq!(cp.get_status(&task.id).await.unwrap().status, TaskStatus::Failed);
    }

    #[tokio::test]
    async fn test_cancel_and_retry_conflicts() {
        let cp = control(TaskLaneConfig::default());
        let task = cp.submit(SubmitRequest::new("hello", Priority::Normal)).await.unwrap();

        let err = cp.retry(&task.id).await.unwrap_err();
        assert!(matches!(err, TaskLaneError::StateConflict(_)));

        assert!(cp.cancel(&task.id).await.unwrap());
        assert!(!cp.cancel(&task.id).await.unwrap());
        assert!(matches!(
            cp.cancel("task-missing").await.unwrap_err(),
            TaskLaneError::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_retry_limit() {
        let mut config = TaskLaneConfig::default();
        config.retry.max_retries = Some(1);
        let cp = control(config);
        let task = cp.submit(SubmitRequest::new("hello", Priority::Normal)).await.unwrap();

        let fail = TaskPatch {
            status: Some(TaskStatus::Failed),
            error: Some("boom".into()),
            ..Default::default()
        };
        cp.update(&task.id, fail.clone()).await.unwrap();
        let retried = cp.retry(&task.id).await.unwrap();
        assert_eq!(retried.retry_count, 1);
        assert_eq!(retried.status, TaskStatus::Queued);
        assert_eq!(retried.attempt, 2);

        cp.update(&task.id, fail).await.unwrap();
        let err = cp.retry(&task.id).await.unwrap_err();
        assert!(matches!(err, TaskLaneError::StateConflict(_)));
    }
}
