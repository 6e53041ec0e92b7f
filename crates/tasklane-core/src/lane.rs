//! Lanes and dispatch tokens.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::task::{Priority, TaskId};

/// Named destination queue bound to one priority class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Lane {
    /// Low-latency lane for URGENT work.
    Priority,
    /// Default lane for NORMAL work.
    Default,
    /// Background lane for LOW work.
    Background,
}

impl Lane {
    pub const ALL: [Lane; 3] = [Lane::Priority, Lane::Default, Lane::Background];

    /// The lane a priority class is routed to.
    pub fn for_priority(priority: Priority) -> Self {
        match priority {
            Priority::Urgent => Lane::Priority,
            Priority::Normal => Lane::Default,
            Priority::Low => Lane::Background,
        }
    }

    /// Slot index (lower = drained first by `next`-style consumers).
    pub fn index(&self) -> usize {
        match self {
            Lane::Priority => 0,
            Lane::Default => 1,
            Lane::Background => 2,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Lane::Priority => "priority",
            Lane::Default => "default",
            Lane::Background => "background",
        }
    }
}

impl std::fmt::Display for Lane {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Handle for exactly one execution attempt of a task.
///
/// Workers claim tokens, not bare task ids: a token whose `attempt` no longer
/// matches the stored record belongs to a superseded attempt and is dropped.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DispatchToken {
    pub task_id: TaskId,
    pub attempt: u32,
    pub lane: Lane,
    pub issued_at: DateTime<Utc>,
}

impl DispatchToken {
    pub fn new(task_id: impl Into<TaskId>, attempt: u32, lane: Lane) -> Self {
        Self {
            task_id: task_id.into(),
            attempt,
            lane,
            issued_at: Utc::now(),
        }
    }

    /// Stable key identifying the attempt, e.g. `task-42#3`.
    pub fn key(&self) -> String {
        format!("{}#{}", self.task_id, self.attempt)
    }
}

impl std::fmt::Display for DispatchToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.key(), self.lane)
    }
}
