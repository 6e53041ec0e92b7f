//! # TaskLane Core
//!
//! Shared vocabulary of the TaskLane engine:
//! - Task record, status graph, priorities, execution steps
//! - Lanes and dispatch tokens
//! - List filters and pagination
//! - Error taxonomy and configuration
//! - Collaborator traits: durable store, lane broker, intent classifier

pub mod config;
pub mod error;
pub mod lane;
pub mod outcome;
pub mod query;
pub mod task;
pub mod traits;

pub use config::TaskLaneConfig;
pub use error::{Result, TaskLaneError};
pub use lane::{DispatchToken, Lane};
pub use outcome::{HandlerOutcome, OutcomeStatus};
pub use query::{Page, TaskFilter, TaskQuery};
pub use task::{
    ExecutionStep, ParsedIntent, Priority, Recurrence, StatusSnapshot, StepStatus, Task, TaskId,
    TaskStatus,
};
