//! Worker pool and per-attempt execution harness.
//!
//! Each worker loops on one lane: dequeue → claim → run handler → finish → ack.
//! The harness bounds the handler by `attempt_timeout_secs` and converts
//! errors, panics and timeouts into a FAILED transition through the context.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use tasklane_core::{DispatchToken, HandlerOutcome, Lane, Result, Task, TaskLaneError};

use crate::context::ExecutionContext;
use crate::engine::Engine;

/// Execute one dispatch token to completion. Returns the record as left by the
/// attempt, or None when the token was abandoned (revoked, stale, or lost the claim).
pub async fn run_attempt(engine: &Engine, token: DispatchToken) -> Result<Option<Task>> {
    let result = execute(engine, &token).await;
    engine.broker().ack(&token).await;
    result
}

async fn execute(engine: &Engine, token: &DispatchToken) -> Result<Option<Task>> {
    if engine.broker().is_revoked(token).await {
        tracing::debug!("🚫 {} revoked before start", token);
        return Ok(None);
    }

    let claim = ExecutionContext::claim(
        engine.store().clone(),
        engine.notifier().clone(),
        token.clone(),
    )
    .await?;
    let Some((mut ctx, task)) = claim else {
        return Ok(None);
    };

    engine.register_active(token, ctx.cancellation());
    let outcome = run_handler(engine, &mut ctx, &task).await;
    engine.unregister_active(token);

    if let Err(e) = outcome {
        tracing::warn!("⚠️ {} could not record its outcome: {}", token, e);
    }
    engine.store().get(&token.task_id).await
}

async fn run_handler(engine: &Engine, ctx: &mut ExecutionContext, task: &Task) -> Result<()> {
    let intent = task
        .parsed_intent
        .as_ref()
        .map(|i| i.intent_type.clone())
        .unwrap_or_else(|| engine.config().classifier.fallback_intent.clone());

    let Some(factory) = engine.registry().resolve(&intent) else {
        return ctx
            .fail(format!("no processor registered for intent '{intent}'"))
            .await;
    };
    let handler = factory();
    ctx.set_agent(handler.name());
    let ctx = &*ctx;

    let run = AssertUnwindSafe(handler.handle(ctx, task)).catch_unwind();
    let timeout = engine.config().scheduler.attempt_timeout_secs;
    let result = match timeout {
        Some(secs) => match tokio::time::timeout(Duration::from_secs(secs), run).await {
            Ok(result) => result,
            Err(_) => {
                let err = TaskLaneError::Timeout(format!("{} exceeded {secs}s", ctx.token()));
                tracing::warn!("⏱️ {}", err);
                ctx.cancellation().cancel();
                return ctx.fail("timeout").await;
            }
        },
        None => run.await,
    };

    match result {
        Ok(Ok(outcome)) => ctx.finish(&outcome).await,
        Ok(Err(e)) => {
            tracing::warn!("❌ {} handler '{}' failed: {}", ctx.token(), handler.name(), e);
            ctx.finish(&HandlerOutcome::failure(e.to_string())).await
        }
        Err(panic) => {
            let msg = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".into());
            tracing::error!("💥 {} handler '{}' panicked: {}", ctx.token(), handler.name(), msg);
            ctx.fail(format!("handler panicked: {msg}")).await
        }
    }
}

/// Workers for every lane, sized from `[lanes]`.
pub struct WorkerPool {
    shutdown: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn start(engine: Arc<Engine>) -> Self {
        Self::start_with(engine, CancellationToken::new())
    }

    /// Start workers that stop when `shutdown` is cancelled.
    pub fn start_with(engine: Arc<Engine>, shutdown: CancellationToken) -> Self {
        let poll = Duration::from_millis(engine.config().scheduler.worker_poll_interval_ms.max(1));
        let mut handles = Vec::new();
        for lane in Lane::ALL {
            let count = engine.config().lanes.workers_for(lane);
            for worker_id in 0..count {
                handles.push(tokio::spawn(worker_loop(
                    Arc::clone(&engine),
                    lane,
                    worker_id,
                    shutdown.clone(),
                    poll,
                )));
            }
            tracing::info!("👷 Lane[{}] started {} worker(s)", lane, count);
        }
        Self { shutdown, handles }
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Stop taking new tokens and wait for in-flight attempts to finish.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        for handle in self.handles {
            if let Err(e) = handle.await {
                tracing::error!("Worker task ended abnormally: {}", e);
            }
        }
        tracing::info!("👷 Worker pool stopped");
    }
}

async fn worker_loop(
    engine: Arc<Engine>,
    lane: Lane,
    worker_id: usize,
    shutdown: CancellationToken,
    poll: Duration,
) {
    tracing::debug!("👷 Lane[{}] worker {} up", lane, worker_id);
    while !shutdown.is_cancelled() {
        match engine.broker().dequeue(lane).await {
            Ok(Some(token)) => match run_attempt(&engine, token.clone()).await {
                Ok(Some(task)) => {
                    tracing::debug!("👷 Lane[{}] worker {} left {} {}", lane, worker_id, token, task.status)
                }
                Ok(None) => {}
                Err(e) => tracing::warn!("⚠️ Lane[{}] worker {} on {}: {}", lane, worker_id, token, e),
            },
            Ok(None) => {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(poll) => {}
                }
            }
            Err(e) => {
                tracing::warn!("⚠️ Lane[{}] dequeue failed: {}", lane, e);
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(poll) => {}
                }
            }
        }
    }
    tracing::debug!("👷 Lane[{}] worker {} down", lane, worker_id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::{ControlPlane, SubmitRequest};
    use crate::lanes::InMemoryLaneBroker;
    use crate::registry::ProcessorRegistry;
    use crate::store::InMemoryTaskStore;
    use async_trait::async_trait;
    use tasklane_core::traits::LaneBroker;
    use tasklane_core::{Priority, TaskLaneConfig, TaskStatus};

    struct Panics;

    #[async_trait]
    impl crate::handler::TaskHandler for Panics {
        fn name(&self) -> &str {
            "panics"
        }
        async fn handle(&self, _ctx: &ExecutionContext, _task: &Task) -> Result<HandlerOutcome> {
            panic!("renderer exploded");
        }
    }

    struct Sleeps;

    #[async_trait]
    impl crate::handler::TaskHandler for Sleeps {
        fn name(&self) -> &str {
            "sleeps"
        }
        async fn handle(&self, _ctx: &ExecutionContext, _task: &Task) -> Result<HandlerOutcome> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(HandlerOutcome::success(serde_json::Value::Null))
        }
    }

    struct Errors;

    #[async_trait]
    impl crate::handler::TaskHandler for Errors {
        fn name(&self) -> &str {
            "errors"
        }
        async fn handle(&self, _ctx: &ExecutionContext, _task: &Task) -> Result<HandlerOutcome> {
            Err(TaskLaneError::Execution("model unavailable".into()))
        }
    }

    fn setup<H: crate::handler::TaskHandler + 'static>(
        handler: H,
        config: TaskLaneConfig,
    ) -> (Arc<Engine>, Arc<InMemoryLaneBroker>) {
        let mut registry = ProcessorRegistry::new();
        registry.set_default_handler(handler);
        let broker = Arc::new(InMemoryLaneBroker::default());
        let engine = Engine::new(
            config,
            Arc::new(InMemoryTaskStore::new()),
            broker.clone(),
            Arc::new(registry),
        );
        (Arc::new(engine), broker)
    }

    async fn submit_and_take(engine: &Arc<Engine>, broker: &InMemoryLaneBroker) -> DispatchToken {
        ControlPlane::new(engine.clone())
            .submit(SubmitRequest::new("render a banner", Priority::Normal))
            .await
            .unwrap();
        broker.dequeue(Lane::Default).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_panic_becomes_failure() {
        let (engine, broker) = setup(Panics, TaskLaneConfig::default());
        let token = submit_and_take(&engine, &broker).await;

        let task = run_attempt(&engine, token).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.error.as_deref(), Some("handler panicked: renderer exploded"));
        assert_eq!(broker.total_pending().await, 0);
        assert_eq!(engine.active_attempts(), 0);
    }

    #[tokio::test]
    async fn test_handler_error_becomes_failure() {
        let (engine, broker) = setup(Errors, TaskLaneConfig::default());
        let token = submit_and_take(&engine, &broker).await;

        let task = run_attempt(&engine, token).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.error.as_deref(), Some("Execution error: model unavailable"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_fails_attempt() {
        let mut config = TaskLaneConfig::default();
        config.scheduler.attempt_timeout_secs = Some(5);
        let (engine, broker) = setup(Sleeps, config);
        let token = submit_and_take(&engine, &broker).await;

        let task = run_attempt(&engine, token).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.error.as_deref(), Some("timeout"));
    }

    #[tokio::test]
    async fn test_revoked_token_is_skipped() {
        let (engine, broker) = setup(crate::testing::Succeed, TaskLaneConfig::default());
        let token = submit_and_take(&engine, &broker).await;
        assert!(broker.revoke(&token).await);

        assert!(run_attempt(&engine, token.clone()).await.unwrap().is_none());
        let stored = engine.store().get(&token.task_id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Queued);
    }

    #[tokio::test]
    async fn test_pool_drains_lanes() {
        let mut config = TaskLaneConfig::default();
        config.scheduler.worker_poll_interval_ms = 5;
        let (engine, _broker) = setup(crate::testing::Succeed, config);
        let cp = ControlPlane::new(engine.clone());
        let mut ids = Vec::new();
        for priority in [Priority::Urgent, Priority::Normal, Priority::Low] {
            ids.push(cp.submit(SubmitRequest::new("job", priority)).await.unwrap().id);
        }

        let pool = WorkerPool::start(engine.clone());
        assert_eq!(pool.len(), 7);

        for id in &ids {
            let mut done = false;
            for _ in 0..200 {
                let status = cp.get_status(id).await.unwrap().status;
                if status == TaskStatus::Completed {
                    done = true;
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            assert!(done, "{id} did not complete");
        }
        pool.shutdown().await;
    }
}
