//! Execution context: the only way a handler mutates its task during an attempt.
//!
//! Every operation re-reads the record and writes it back with a version
//! check, so there is no lock held across handler code. When the record no
//! longer belongs to this attempt (cancelled, failed by someone else,
//! superseded by a retry) the operation is dropped without error and the
//! context's cancellation token is tripped. Events are published only after
//! the write has been accepted by the store.

use std::sync::Arc;

use chrono::Utc;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

use tasklane_core::traits::TaskStore;
use tasklane_core::{
    DispatchToken, ExecutionStep, HandlerOutcome, Result, Task, TaskLaneError, TaskStatus,
};

use crate::notify::{Notifier, TaskEventKind};

/// Re-read/write rounds before a contended write gives up.
const MAX_WRITE_ATTEMPTS: usize = 8;

pub struct ExecutionContext {
    store: Arc<dyn TaskStore>,
    notifier: Arc<Notifier>,
    token: DispatchToken,
    tenant_id: String,
    agent: String,
    cancel: CancellationToken,
}

impl ExecutionContext {
    /// Take the IN_PROGRESS gate for `token`.
    ///
    /// Returns None when the attempt must be abandoned: the record is gone,
    /// the token is stale, or another worker won the claim.
    pub(crate) async fn claim(
        store: Arc<dyn TaskStore>,
        notifier: Arc<Notifier>,
        token: DispatchToken,
    ) -> Result<Option<(Self, Task)>> {
        for _ in 0..MAX_WRITE_ATTEMPTS {
            let Some(mut task) = store.get(&token.task_id).await? else {
                tracing::debug!("👻 {} vanished before claim", token);
                return Ok(None);
            };
            if task.attempt != token.attempt {
                tracing::debug!("⏭️ {} superseded by attempt {}", token, task.attempt);
                return Ok(None);
            }
            if !task.status.is_claimable() {
                tracing::debug!("⏭️ {} not claimable ({})", token, task.status);
                return Ok(None);
            }

            task.transition(TaskStatus::InProgress, Utc::now())?;
            match store.update(&task).await {
                Ok(stored) => {
                    notifier.publish(
                        &stored.tenant_id,
                        &stored.id,
                        TaskEventKind::StatusChanged,
                        json!({ "status": TaskStatus::InProgress, "attempt": stored.attempt }),
                    );
                    tracing::info!("🏃 Claimed {}", token);
                    let ctx = Self {
                        store,
                        notifier,
                        tenant_id: stored.tenant_id.clone(),
                        token,
                        agent: "worker".into(),
                        cancel: CancellationToken::new(),
                    };
                    return Ok(Some((ctx, stored)));
                }
                Err(e) if e.is_stale_write() => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(None)
    }

    pub(crate) fn set_agent(&mut self, agent: impl Into<String>) {
        self.agent = agent.into();
    }

    pub fn task_id(&self) -> &str {
        &self.token.task_id
    }

    pub fn attempt(&self) -> u32 {
        self.token.attempt
    }

    pub fn token(&self) -> &DispatchToken {
        &self.token
    }

    /// Name recorded on log entries written through this context.
    pub fn agent(&self) -> &str {
        &self.agent
    }

    /// Token tripped once this attempt is known to be abandoned; handlers may
    /// `select!` on `cancelled()` to stop early.
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Whether the attempt has been abandoned. Checks the stored record.
    pub async fn is_cancelled(&self) -> bool {
        if self.cancel.is_cancelled() {
            return true;
        }
        match self.store.get(self.task_id()).await {
            Ok(Some(task)) if self.owns(&task) => false,
            Ok(_) => {
                self.cancel.cancel();
                true
            }
            Err(_) => false,
        }
    }

    fn owns(&self, task: &Task) -> bool {
        task.attempt == self.token.attempt && !task.status.is_finished()
    }

    async fn mutate<F>(&self, kind: TaskEventKind, mut apply: F) -> Result<()>
    where
        F: FnMut(&mut Task) -> Result<Value> + Send,
    {
        for _ in 0..MAX_WRITE_ATTEMPTS {
            let Some(mut task) = self.store.get(self.task_id()).await? else {
                return Err(TaskLaneError::NotFound(self.task_id().to_string()));
            };
            if !self.owns(&task) {
                self.cancel.cancel();
                tracing::debug!(
                    "🛑 {} no longer owns {} ({}), dropping {}",
                    self.token,
                    task.id,
                    task.status,
                    kind
                );
                return Ok(());
            }

            let payload = apply(&mut task)?;
            task.updated_at = Utc::now();
            match self.store.update(&task).await {
                Ok(_) => {
                    self.notifier.publish(&self.tenant_id, &task.id, kind, payload);
                    return Ok(());
                }
                Err(e) if e.is_stale_write() => continue,
                Err(e) => return Err(e),
            }
        }
        Err(TaskLaneError::StaleWrite(self.task_id().to_string()))
    }

    /// Move along the state graph; `error` replaces the stored error message.
    pub async fn update_status(&self, status: TaskStatus, error: Option<String>) -> Result<()> {
        self.mutate(TaskEventKind::StatusChanged, |task| {
            task.transition(status, Utc::now())?;
            if let Some(error) = &error {
                task.error = Some(error.clone());
            }
            Ok(json!({ "status": status, "error": error }))
        })
        .await?;
        tracing::info!("📌 {} → {}", self.token, status);
        Ok(())
    }

    /// Clamp to [0, 100], never decreasing. A message is logged as a completed step.
    pub async fn update_progress(&self, percent: i64, message: Option<&str>) -> Result<()> {
        let agent = self.agent.clone();
        self.mutate(TaskEventKind::Progress, |task| {
            let progress = task.advance_progress(percent);
            if let Some(message) = message {
                task.record_step(ExecutionStep::note(agent.clone(), message))?;
            }
            Ok(json!({ "progress": progress, "message": message }))
        })
        .await
    }

    /// Append a step, or update the latest step while it is in progress.
    pub async fn add_execution_step(&self, step: ExecutionStep) -> Result<()> {
        self.mutate(TaskEventKind::StepAdded, |task| {
            task.record_step(step.clone())?;
            Ok(json!({
                "step_id": step.step_id,
                "action": step.action,
                "status": step.status,
            }))
        })
        .await
    }

    /// Last write wins.
    pub async fn set_output(&self, format: &str, payload: Value, media_ids: Vec<String>) -> Result<()> {
        self.mutate(TaskEventKind::OutputSet, |task| {
            task.output_format = Some(format.to_string());
            task.output_payload = Some(payload.clone());
            task.output_media = media_ids.clone();
            Ok(json!({ "output_format": format, "media": media_ids.len() }))
        })
        .await
    }

    pub async fn fail(&self, reason: impl Into<String>) -> Result<()> {
        self.update_status(TaskStatus::Failed, Some(reason.into())).await
    }

    /// Close the attempt with the handler's result: COMPLETED on success
    /// (keeping any output the handler already set), FAILED otherwise.
    pub(crate) async fn finish(&self, outcome: &HandlerOutcome) -> Result<()> {
        if !outcome.is_success() {
            let reason = outcome
                .error_message()
                .unwrap_or_else(|| "handler reported failure".into());
            return self.fail(reason).await;
        }

        self.mutate(TaskEventKind::StatusChanged, |task| {
            task.transition(TaskStatus::Completed, Utc::now())?;
            if task.output_payload.is_none() && !outcome.result_payload.is_null() {
                task.output_payload = Some(outcome.result_payload.clone());
            }
            Ok(json!({ "status": TaskStatus::Completed }))
        })
        .await?;
        tracing::info!("✅ {} completed", self.token);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryTaskStore;
    use tasklane_core::{Lane, Priority, StepStatus};

    async fn queued_task(store: &Arc<dyn TaskStore>) -> (Task, DispatchToken) {
        let mut task = Task::new("acme", "write a post", Priority::Normal);
        task.attempt = 1;
        task.transition(TaskStatus::Queued, Utc::now()).unwrap();
        let stored = store.insert(&task).await.unwrap();
        let token = DispatchToken::new(stored.id.clone(), 1, Lane::Default);
        (stored, token)
    }

    fn deps() -> (Arc<dyn TaskStore>, Arc<Notifier>) {
        (Arc::new(InMemoryTaskStore::new()), Arc::new(Notifier::default()))
    }

    #[tokio::test]
    async fn test_only_one_claim_wins() {
        let (store, notifier) = deps();
        let (_, token) = queued_task(&store).await;

        let (a, b) = tokio::join!(
            ExecutionContext::claim(store.clone(), notifier.clone(), token.clone()),
            ExecutionContext::claim(store.clone(), notifier.clone(), token.clone()),
        );
        let winners = [a.unwrap(), b.unwrap()].into_iter().flatten().count();
        assert_eq!(winners, 1);

        let stored = store.get(&token.task_id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::InProgress);
        assert!(stored.processing_started_at.is_some());
    }

    #[tokio::test]
    async fn test_stale_token_is_abandoned() {
        let (store, notifier) = deps();
        let (task, _) = queued_task(&store).await;
        let stale = DispatchToken::new(task.id.clone(), 0, Lane::Default);
        assert!(ExecutionContext::claim(store.clone(), notifier, stale)
            .await
            .unwrap()
            .is_none());
        assert_eq!(
            store.get(&task.id).await.unwrap().unwrap().status,
            TaskStatus::Queued
        );
    }

    #[tokio::test]
    async fn test_progress_steps_and_output() {
        let (store, notifier) = deps();
        let (task, token) = queued_task(&store).await;
        let (mut ctx, _) = ExecutionContext::claim(store.clone(), notifier.clone(), token)
            .await
            .unwrap()
            .unwrap();
        ctx.set_agent("writer");

        ctx.update_progress(40, Some("drafted")).await.unwrap();
        ctx.update_progress(10, None).await.unwrap();
        ctx.update_progress(140, None).await.unwrap();

        let step = ExecutionStep::start("writer", "polish");
        ctx.add_execution_step(step.clone()).await.unwrap();
        ctx.add_execution_step(step.clone().complete(None)).await.unwrap();
        assert!(ctx.add_execution_step(step.fail("again")).await.is_err());

        ctx.set_output("text", json!({"v": 1}), vec![]).await.unwrap();
        ctx.set_output("markdown", json!({"v": 2}), vec!["m1".into()]).await.unwrap();

        let stored = store.get(&task.id).await.unwrap().unwrap();
        assert_eq!(stored.progress, 100);
        assert_eq!(stored.execution_log.len(), 2);
        assert_eq!(stored.execution_log[0].agent, "writer");
        assert_eq!(stored.execution_log[0].action, "drafted");
        assert_eq!(stored.execution_log[1].status, StepStatus::Completed);
        assert_eq!(stored.output_format.as_deref(), Some("markdown"));
        assert_eq!(stored.output_media, ["m1"]);

        let kinds: Vec<_> = notifier.history_for(&task.id).into_iter().map(|e| e.kind).collect();
        assert_eq!(kinds.first(), Some(&TaskEventKind::StatusChanged));
        assert_eq!(kinds.iter().filter(|k| **k == TaskEventKind::Progress).count(), 3);
    }

    #[tokio::test]
    async fn test_illegal_transition_is_rejected() {
        let (store, notifier) = deps();
        let (_, token) = queued_task(&store).await;
        let (ctx, _) = ExecutionContext::claim(store, notifier, token)
            .await
            .unwrap()
            .unwrap();
        let err = ctx.update_status(TaskStatus::Queued, None).await.unwrap_err();
        assert!(matches!(err, TaskLaneError::StateConflict(_)));
    }

    #[tokio::test]
    async fn test_cancelled_record_silences_context() {
        let (store, notifier) = deps();
        let (task, token) = queued_task(&store).await;
        let (ctx, claimed) = ExecutionContext::claim(store.clone(), notifier.clone(), token)
            .await
            .unwrap()
            .unwrap();

        let mut cancelled = claimed.clone();
        cancelled.transition(TaskStatus::Cancelled, Utc::now()).unwrap();
        let cancelled = store.update(&cancelled).await.unwrap();

        ctx.update_progress(50, Some("late")).await.unwrap();
        ctx.finish(&HandlerOutcome::success(json!({"late": true}))).await.unwrap();

        let stored = store.get(&task.id).await.unwrap().unwrap();
        assert_eq!(stored, cancelled);
        assert!(ctx.cancellation().is_cancelled());
        assert!(ctx.is_cancelled().await);
    }

    #[tokio::test]
    async fn test_finish_success_and_failure() {
        let (store, notifier) = deps();
        let (task, token) = queued_task(&store).await;
        let (ctx, _) = ExecutionContext::claim(store.clone(), notifier.clone(), token)
            .await
            .unwrap()
            .unwrap();
        ctx.update_status(TaskStatus::Review, None).await.unwrap();
        ctx.finish(&HandlerOutcome::success(json!({"words": 300}))).await.unwrap();

        let done = store.get(&task.id).await.unwrap().unwrap();
        assert_eq!(done.status, TaskStatus::Completed);
        assert_eq!(done.progress, 100);
        assert_eq!(done.output_payload, Some(json!({"words": 300})));
        assert!(done.processing_ended_at.is_some());

        let (other, token) = queued_task(&store).await;
        let (ctx, _) = ExecutionContext::claim(store.clone(), notifier, token)
            .await
            .unwrap()
            .unwrap();
        ctx.update_progress(30, None).await.unwrap();
        ctx.finish(&HandlerOutcome::failure("quota exceeded")).await.unwrap();

        let failed = store.get(&other.id).await.unwrap().unwrap();
        assert_eq!(failed.status, TaskStatus::Failed);
        assert_eq!(failed.error.as_deref(), Some("quota exceeded"));
        assert_eq!(failed.progress, 30);
    }
}
