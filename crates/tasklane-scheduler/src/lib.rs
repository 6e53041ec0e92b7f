//! # TaskLane Scheduler
//!
//! Priority-lane task orchestration engine.
//!
//! ## Architecture
//! ```text
//! ControlPlane (submit / list / get_status / update / cancel / retry / run_sweep)
//!   └── Engine
//!         ├── IntentClassifier → ProcessorRegistry (resolve handler)
//!         ├── QueueRouter: URGENT → priority, NORMAL → default, LOW → background
//!         ├── LaneBroker.enqueue(DispatchToken {task_id, attempt})
//!         └── sweep(now): due SUBMITTED tasks + recurring templates
//!
//! WorkerPool (N workers per lane)
//!   └── dequeue → ExecutionContext::claim (IN_PROGRESS gate)
//!         → TaskHandler::handle(ctx, task) → finish → ack
//!
//! Notifier: history ring + broadcast + outbox → NotifySink (webhook)
//! ```

pub mod classifier;
pub mod context;
pub mod control;
pub mod cron;
pub mod delivery;
pub mod engine;
pub mod handler;
pub mod lanes;
pub mod notify;
pub mod persistence;
pub mod registry;
pub mod router;
pub mod store;
pub mod worker;

pub use classifier::KeywordClassifier;
pub use context::ExecutionContext;
pub use control::{ControlPlane, SubmitRequest, TaskPatch};
pub use delivery::WebhookSink;
pub use engine::Engine;
pub use handler::TaskHandler;
pub use lanes::{InMemoryLaneBroker, LaneStats};
pub use notify::{Notifier, NotifySink, Outbox, TaskEvent, TaskEventKind};
pub use persistence::SqliteTaskStore;
pub use registry::{HandlerFactory, ProcessorRegistry};
pub use router::QueueRouter;
pub use store::InMemoryTaskStore;
pub use worker::{WorkerPool, run_attempt};
