//! Dispatch engine: classification, routing, the due-task sweep and the
//! sweeper loop. Produces dispatch tokens; never runs handlers itself.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde_json::json;
use tokio_util::sync::CancellationToken;

use tasklane_core::traits::{IntentClassifier, LaneBroker, TaskStore};
use tasklane_core::{DispatchToken, Result, Task, TaskLaneConfig, TaskLaneError, TaskStatus};

use crate::classifier::KeywordClassifier;
use crate::cron;
use crate::notify::{Notifier, TaskEventKind};
use crate::registry::ProcessorRegistry;
use crate::router::QueueRouter;

const MAX_WRITE_ATTEMPTS: usize = 8;

pub struct Engine {
    config: TaskLaneConfig,
    store: Arc<dyn TaskStore>,
    broker: Arc<dyn LaneBroker>,
    registry: Arc<ProcessorRegistry>,
    classifier: Arc<dyn IntentClassifier>,
    notifier: Arc<Notifier>,
    router: QueueRouter,
    /// Cancellation handles of attempts currently held by workers, by token key.
    active: Mutex<HashMap<String, CancellationToken>>,
}

impl Engine {
    pub fn new(
        config: TaskLaneConfig,
        store: Arc<dyn TaskStore>,
        broker: Arc<dyn LaneBroker>,
        registry: Arc<ProcessorRegistry>,
    ) -> Self {
        let classifier = Arc::new(KeywordClassifier::new(&config.classifier));
        let notifier = Arc::new(Notifier::new(&config.notify));
        Self {
            config,
            store,
            broker,
            registry,
            classifier,
            notifier,
            router: QueueRouter,
            active: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_classifier(mut self, classifier: Arc<dyn IntentClassifier>) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn config(&self) -> &TaskLaneConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn TaskStore> {
        &self.store
    }

    pub fn broker(&self) -> &Arc<dyn LaneBroker> {
        &self.broker
    }

    pub fn registry(&self) -> &ProcessorRegistry {
        &self.registry
    }

    pub fn notifier(&self) -> &Arc<Notifier> {
        &self.notifier
    }

    pub fn router(&self) -> &QueueRouter {
        &self.router
    }

    pub(crate) fn publish_status(&self, task: &Task) {
        self.notifier.publish(
            &task.tenant_id,
            &task.id,
            TaskEventKind::StatusChanged,
            json!({ "status": task.status, "attempt": task.attempt, "error": task.error }),
        );
    }

    /// Send a SUBMITTED record down the dispatch path.
    ///
    /// Classifies it when needed, resolves a processor, bumps the attempt,
    /// writes QUEUED and enqueues the token. When no processor resolves, or the
    /// broker refuses the token, the record is written FAILED with the dispatch
    /// error instead. Returns the stored record.
    pub async fn dispatch(&self, mut task: Task) -> Result<Task> {
        if task.status != TaskStatus::Submitted {
            return Err(TaskLaneError::conflict(format!(
                "task {} is {}, only submitted tasks can be dispatched",
                task.id, task.status
            )));
        }

        let intent = match &task.parsed_intent {
            Some(intent) => intent.intent_type.clone(),
            None => {
                let classification = self.classifier.classify(&task.description);
                tracing::debug!(
                    "🏷️ {} classified as '{}' ({:.2}) by {}",
                    task.id,
                    classification.intent_type,
                    classification.confidence,
                    self.classifier.name()
                );
                let intent = classification.intent_type.clone();
                task.parsed_intent = Some(classification.into());
                intent
            }
        };

        let now = Utc::now();
        if self.registry.resolve(&intent).is_none() {
            let err = TaskLaneError::dispatch(format!("no processor registered for intent '{intent}'"));
            tracing::warn!("❌ {} not dispatched: {}", task.id, err);
            task.error = Some(err.to_string());
            task.transition(TaskStatus::Failed, now)?;
            let stored = self.store.update(&task).await?;
            self.publish_status(&stored);
            return Ok(stored);
        }

        task.attempt += 1;
        task.error = None;
        task.transition(TaskStatus::Queued, now)?;
        let mut stored = self.store.update(&task).await?;
        self.publish_status(&stored);

        let token = self.router.token(&stored);
        let lane = token.lane;
        if let Err(e) = self.broker.enqueue(lane, token.clone()).await {
            let err = TaskLaneError::dispatch(format!("lane '{lane}' unavailable: {e}"));
            tracing::warn!("❌ {} not enqueued: {}", token, err);
            stored.error = Some(err.to_string());
            stored.transition(TaskStatus::Failed, Utc::now())?;
            let failed = self.store.update(&stored).await?;
            self.publish_status(&failed);
            return Ok(failed);
        }

        tracing::info!("📋 Dispatched {} → {} ({})", stored.id, lane, intent);
        Ok(stored)
    }

    /// Dispatch `task` if it is due: one-off tasks go straight to `dispatch`,
    /// recurring templates fire one occurrence. Not-yet-due tasks are returned as is.
    pub async fn admit(&self, task: Task, now: DateTime<Utc>) -> Result<Task> {
        if !task.is_due(now) {
            return Ok(task);
        }
        if task.is_recurring() {
            let id = task.id.clone();
            return match self.fire_occurrence(task, now).await? {
                Some((template, _)) => Ok(template),
                None => self
                    .store
                    .get(&id)
                    .await?
                    .ok_or(TaskLaneError::NotFound(id)),
            };
        }
        let id = task.id.clone();
        match self.dispatch(task).await {
            // A sweep got there first; its write is the one that counts.
            Err(e) if e.is_stale_write() => {
                tracing::debug!("⏭️ {} dispatched concurrently", id);
                self.store
                    .get(&id)
                    .await?
                    .ok_or(TaskLaneError::NotFound(id))
            }
            result => result,
        }
    }

    /// Spawn and dispatch one occurrence of a recurring template.
    ///
    /// The template's next due time is advanced first with a versioned write,
    /// so concurrent sweeps cannot fire the same window twice; windows missed
    /// while nothing swept are skipped. Returns None when another sweep
    /// already claimed this window.
    pub async fn fire_occurrence(
        &self,
        mut template: Task,
        now: DateTime<Utc>,
    ) -> Result<Option<(Task, Task)>> {
        let Some(pattern) = template.recurring_pattern.clone() else {
            return Err(TaskLaneError::conflict(format!("task {} is not recurring", template.id)));
        };
        let due_at = template.scheduled_for.unwrap_or(now);

        let next = match cron::advance_past(&pattern, due_at, now) {
            Ok(next) => next,
            Err(e) => {
                tracing::warn!("❌ Recurring {} has an unusable pattern: {}", template.id, e);
                template.error = Some(e.to_string());
                template.transition(TaskStatus::Failed, now)?;
                let failed = self.store.update(&template).await?;
                self.publish_status(&failed);
                return Ok(None);
            }
        };

        template.scheduled_for = Some(next);
        template.occurrence_count += 1;
        template.last_occurrence_at = Some(now);
        template.updated_at = now;
        let template = match self.store.update(&template).await {
            Ok(stored) => stored,
            Err(e) if e.is_stale_write() => {
                tracing::debug!("⏭️ Occurrence of {} already claimed", template.id);
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        let mut child = Task::new(
            template.tenant_id.clone(),
            template.description.clone(),
            template.priority,
        );
        child.parent_task_id = Some(template.id.clone());
        child.scheduled_for = Some(due_at);
        child.parsed_intent = template.parsed_intent.clone();
        child.attachments = template.attachments.clone();
        child.metadata = template.metadata.clone();
        child.output_format = template.output_format.clone();
        child.scheduled_post_time = template.scheduled_post_time;
        let child = self.store.insert(&child).await?;

        self.notifier.publish(
            &child.tenant_id,
            &child.id,
            TaskEventKind::Created,
            json!({ "parent_task_id": template.id }),
        );
        self.notifier.publish(
            &template.tenant_id,
            &template.id,
            TaskEventKind::OccurrenceSpawned,
            json!({
                "occurrence": template.occurrence_count,
                "child_task_id": child.id,
                "next_due": next,
            }),
        );
        tracing::info!(
            "🔁 {} occurrence #{} → {} (next {})",
            template.id,
            template.occurrence_count,
            child.id,
            next
        );

        let child = self.dispatch(child).await?;
        Ok(Some((template, child)))
    }

    /// Promote everything due at `now`. Returns how many records were queued.
    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<usize> {
        let due = self.store.due_for_dispatch(now).await?;
        let mut dispatched = 0;

        for task in due {
            let id = task.id.clone();
            let result = if task.is_recurring() {
                self.fire_occurrence(task, now)
                    .await
                    .map(|fired| fired.map(|(_, child)| child))
            } else {
                self.dispatch(task).await.map(Some)
            };

            match result {
                Ok(Some(task)) if task.status == TaskStatus::Queued => dispatched += 1,
                Ok(_) => {}
                Err(e) if e.is_stale_write() => {
                    tracing::debug!("⏭️ {} changed during sweep, skipped", id);
                }
                Err(e) => tracing::warn!("⚠️ Sweep could not dispatch {}: {}", id, e),
            }
        }

        if dispatched > 0 {
            tracing::info!("🧹 Sweep dispatched {} task(s)", dispatched);
        }
        Ok(dispatched)
    }

    /// Re-enqueue tokens for records left QUEUED by a previous process.
    pub async fn recover_queued(&self) -> Result<usize> {
        let mut recovered = 0;
        for task in self.store.find_by_status(TaskStatus::Queued).await? {
            let token = self.router.token(&task);
            match self.broker.enqueue(token.lane, token.clone()).await {
                Ok(()) => recovered += 1,
                Err(e) => tracing::warn!("⚠️ Could not recover {}: {}", token, e),
            }
        }
        if recovered > 0 {
            tracing::info!("♻️ Recovered {} queued task(s)", recovered);
        }
        Ok(recovered)
    }

    /// Revoke the current attempt's token and signal its context, if running.
    pub async fn abandon_attempt(&self, task: &Task) {
        let token = self.router.token(task);
        let revoked = self.broker.revoke(&token).await;
        let running = self
            .active
            .lock()
            .ok()
            .and_then(|active| active.get(&token.key()).cloned());
        if let Some(cancel) = &running {
            cancel.cancel();
        }
        tracing::debug!(
            "🚫 Abandon {} (revoked: {}, running: {})",
            token,
            revoked,
            running.is_some()
        );
    }

    /// Move a queued token to the lane matching a changed priority.
    ///
    /// When neither lane takes the token back the record is written FAILED
    /// with the dispatch error. Returns the current record.
    pub(crate) async fn reroute(&self, before: &Task, after: Task) -> Result<Task> {
        let old = self.router.token(before);
        let new = self.router.token(&after);
        if old.lane == new.lane || after.status != TaskStatus::Queued {
            return Ok(after);
        }
        // Only a token still waiting can move; a claimed one runs where it is.
        if !self.broker.revoke(&old).await {
            return Ok(after);
        }
        let Err(e) = self.broker.enqueue(new.lane, new.clone()).await else {
            return Ok(after);
        };
        tracing::warn!("⚠️ Could not move {} to {}: {}", new, new.lane, e);
        if self.broker.enqueue(old.lane, old).await.is_ok() {
            return Ok(after);
        }

        let err = TaskLaneError::dispatch(format!("lane '{}' unavailable: {e}", new.lane));
        let mut current = after;
        for _ in 0..MAX_WRITE_ATTEMPTS {
            // A newer attempt or a finished record owns its own slot.
            if current.status != TaskStatus::Queued || current.attempt != new.attempt {
                return Ok(current);
            }
            current.error = Some(err.to_string());
            current.transition(TaskStatus::Failed, Utc::now())?;
            match self.store.update(&current).await {
                Ok(failed) => {
                    tracing::warn!("❌ {} lost its queue slot: {}", failed.id, err);
                    self.publish_status(&failed);
                    return Ok(failed);
                }
                Err(e) if e.is_stale_write() => {
                    current = self
                        .store
                        .get(&new.task_id)
                        .await?
                        .ok_or_else(|| TaskLaneError::NotFound(new.task_id.clone()))?;
                }
                Err(e) => return Err(e),
            }
        }
        Err(TaskLaneError::StaleWrite(new.task_id))
    }

    pub(crate) fn register_active(&self, token: &DispatchToken, cancel: CancellationToken) {
        if let Ok(mut active) = self.active.lock() {
            active.insert(token.key(), cancel);
        }
    }

    pub(crate) fn unregister_active(&self, token: &DispatchToken) {
        if let Ok(mut active) = self.active.lock() {
            active.remove(&token.key());
        }
    }

    /// Number of attempts currently executing.
    pub fn active_attempts(&self) -> usize {
        self.active.lock().map(|a| a.len()).unwrap_or(0)
    }

    /// Run `sweep` every `scheduler.sweep_interval_secs` until `shutdown` fires.
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        shutdown: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let engine = Arc::clone(self);
        let period = std::time::Duration::from_secs(engine.config.scheduler.sweep_interval_secs);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            tracing::info!("⏰ Sweeper started (every {}s)", period.as_secs());
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = interval.tick() => {
                        if let Err(e) = engine.sweep(Utc::now()).await {
                            tracing::warn!("⚠️ Sweep failed: {}", e);
                        }
                    }
                }
            }
            tracing::info!("⏰ Sweeper stopped");
        })
    }
}
