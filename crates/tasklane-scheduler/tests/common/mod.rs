#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::sync::Notify;

use tasklane_core::traits::{LaneBroker, TaskStore};
use tasklane_core::{DispatchToken, ExecutionStep, HandlerOutcome, Lane, Result, Task, TaskLaneConfig};
use tasklane_scheduler::{
    ControlPlane, Engine, ExecutionContext, InMemoryLaneBroker, InMemoryTaskStore,
    ProcessorRegistry, TaskHandler,
};

pub struct Harness {
    pub cp: ControlPlane,
    pub engine: Arc<Engine>,
    pub broker: Arc<InMemoryLaneBroker>,
}

impl Harness {
    pub fn new(registry: ProcessorRegistry) -> Self {
        Self::with_store(registry, Arc::new(InMemoryTaskStore::new()), TaskLaneConfig::default())
    }

    pub fn with_store(
        registry: ProcessorRegistry,
        store: Arc<dyn TaskStore>,
        config: TaskLaneConfig,
    ) -> Self {
        let broker = Arc::new(InMemoryLaneBroker::from_config(&config.lanes));
        let engine = Arc::new(Engine::new(config, store, broker.clone(), Arc::new(registry)));
        Self {
            cp: ControlPlane::new(engine.clone()),
            engine,
            broker,
        }
    }

    /// Take the next token of a lane, as a worker would.
    pub async fn take(&self, lane: Lane) -> DispatchToken {
        self.broker
            .dequeue(lane)
            .await
            .unwrap()
            .expect("lane should hold a token")
    }
}

pub fn registry_with_default<H: TaskHandler + 'static>(handler: H) -> ProcessorRegistry {
    let mut registry = ProcessorRegistry::new();
    registry.set_default_handler(handler);
    registry
}

/// Plans, reports progress, then succeeds, or fails when `metadata.fail` is true.
pub struct Scripted;

#[async_trait]
impl TaskHandler for Scripted {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn handle(&self, ctx: &ExecutionContext, task: &Task) -> Result<HandlerOutcome> {
        let plan = ExecutionStep::start("scripted", "plan");
        ctx.add_execution_step(plan.clone()).await?;
        ctx.add_execution_step(plan.complete(None)).await?;
        ctx.update_progress(30, Some("planned")).await?;

        if task.metadata.get("fail").and_then(Value::as_bool) == Some(true) {
            return Ok(HandlerOutcome::failure("upstream rejected the draft"));
        }

        ctx.update_progress(60, Some("drafted")).await?;
        ctx.set_output(
            "markdown",
            json!({ "body": format!("# {}", task.description) }),
            vec![],
        )
        .await?;
        Ok(HandlerOutcome::success(json!({ "words": 42 })))
    }
}

/// Signals `started`, waits for `release`, then keeps mutating through the context.
#[derive(Clone, Default)]
pub struct Gate {
    pub started: Arc<Notify>,
    pub release: Arc<Notify>,
    pub saw_cancel: Arc<AtomicBool>,
}

#[async_trait]
impl TaskHandler for Gate {
    fn name(&self) -> &str {
        "gate"
    }

    async fn handle(&self, ctx: &ExecutionContext, _task: &Task) -> Result<HandlerOutcome> {
        ctx.update_progress(10, Some("started")).await?;
        self.started.notify_one();
        self.release.notified().await;

        self.saw_cancel
            .store(ctx.cancellation().is_cancelled(), Ordering::SeqCst);
        ctx.update_progress(90, Some("still going")).await?;
        ctx.set_output("text", json!("late output"), vec![]).await?;
        Ok(HandlerOutcome::success(json!({ "late": true })))
    }
}
