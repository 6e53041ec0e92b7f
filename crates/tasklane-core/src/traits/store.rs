//! Durable store trait.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::query::TaskQuery;
use crate::task::{Task, TaskStatus};

/// Point read/write by id with optimistic concurrency, plus range queries.
///
/// `update` succeeds only when the stored `version` equals `task.version`;
/// the returned record carries the bumped version. A mismatch yields
/// [`crate::TaskLaneError::StaleWrite`], an unknown id `NotFound`.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Insert a new record. Fails if the id already exists.
    async fn insert(&self, task: &Task) -> Result<Task>;

    async fn get(&self, task_id: &str) -> Result<Option<Task>>;

    async fn update(&self, task: &Task) -> Result<Task>;

    /// Tenant-scoped listing, newest first.
    async fn query(&self, query: &TaskQuery) -> Result<Vec<Task>>;

    /// SUBMITTED records whose `scheduled_for` is unset or at/before `now`, oldest first.
    async fn due_for_dispatch(&self, now: DateTime<Utc>) -> Result<Vec<Task>>;

    async fn find_by_status(&self, status: TaskStatus) -> Result<Vec<Task>>;
}
