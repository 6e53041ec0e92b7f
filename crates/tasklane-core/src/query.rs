//! List filters and pagination.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, TaskLaneError};
use crate::task::{Priority, Task, TaskStatus};

pub const DEFAULT_PAGE_SIZE: usize = 50;
pub const MAX_PAGE_SIZE: usize = 500;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskFilter {
    /// Empty = any status.
    #[serde(default)]
    pub statuses: Vec<TaskStatus>,
    #[serde(default)]
    pub priority: Option<Priority>,
    #[serde(default)]
    pub created_after: Option<DateTime<Utc>>,
    #[serde(default)]
    pub created_before: Option<DateTime<Utc>>,
    #[serde(default)]
    pub scheduled_after: Option<DateTime<Utc>>,
    #[serde(default)]
    pub scheduled_before: Option<DateTime<Utc>>,
    #[serde(default)]
    pub parent_task_id: Option<String>,
}

impl TaskFilter {
    pub fn validate(&self) -> Result<()> {
        if let (Some(after), Some(before)) = (self.created_after, self.created_before)
            && after > before
        {
            return Err(TaskLaneError::validation(
                "created_after must not be later than created_before",
            ));
        }
        if let (Some(after), Some(before)) = (self.scheduled_after, self.scheduled_before)
            && after > before
        {
            return Err(TaskLaneError::validation(
                "scheduled_after must not be later than scheduled_before",
            ));
        }
        Ok(())
    }

    /// In-memory evaluation; windows are inclusive.
    pub fn matches(&self, task: &Task) -> bool {
        if !self.statuses.is_empty() && !self.statuses.contains(&task.status) {
            return false;
        }
        if self.priority.is_some_and(|p| p != task.priority) {
            return false;
        }
        if self.created_after.is_some_and(|t| task.created_at < t)
            || self.created_before.is_some_and(|t| task.created_at > t)
        {
            return false;
        }
        if self.scheduled_after.is_some() || self.scheduled_before.is_some() {
            let Some(at) = task.scheduled_for else {
                return false;
            };
            if self.scheduled_after.is_some_and(|t| at < t)
                || self.scheduled_before.is_some_and(|t| at > t)
            {
                return false;
            }
        }
        if let Some(parent) = &self.parent_task_id
            && task.parent_task_id.as_ref() != Some(parent)
        {
            return false;
        }
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page {
    pub offset: usize,
    pub limit: usize,
}

impl Default for Page {
    fn default() -> Self {
        Self {
            offset: 0,
            limit: DEFAULT_PAGE_SIZE,
        }
    }
}

impl Page {
    pub fn new(offset: usize, limit: usize) -> Self {
        Self { offset, limit }
    }

    pub fn validate(&self) -> Result<()> {
        if self.limit == 0 || self.limit > MAX_PAGE_SIZE {
            return Err(TaskLaneError::validation(format!(
                "page limit must be between 1 and {MAX_PAGE_SIZE}"
            )));
        }
        Ok(())
    }
}

/// Full range query handed to a [`crate::traits::TaskStore`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskQuery {
    pub tenant_id: String,
    pub filter: TaskFilter,
    pub page: Page,
}

/// Newest first, id as tiebreak so pages are stable.
pub fn sort_newest_first(tasks: &mut [Task]) {
    tasks.sort_by(|a, b| {
        b.created_at
            .cmp(&a.created_at)
            .then_with(|| b.id.cmp(&a.id))
    });
}
