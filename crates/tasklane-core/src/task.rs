//! Task record: the durable representation of one unit of work and its history.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Result, TaskLaneError};

pub type TaskId = String;

/// Lifecycle status.
///
/// ```text
/// SUBMITTED → QUEUED → PLANNING → ASSIGNED → IN_PROGRESS → REVIEW → COMPLETED
///                                                             ↘ FAILED ─(retry)→ SUBMITTED
/// any non-terminal up to IN_PROGRESS → CANCELLED;  pre-execution / REVIEW → REJECTED
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Submitted,
    Queued,
    Planning,
    Assigned,
    InProgress,
    Review,
    Completed,
    Failed,
    Cancelled,
    Rejected,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 10] = [
        TaskStatus::Submitted,
        TaskStatus::Queued,
        TaskStatus::Planning,
        TaskStatus::Assigned,
        TaskStatus::InProgress,
        TaskStatus::Review,
        TaskStatus::Completed,
        TaskStatus::Failed,
        TaskStatus::Cancelled,
        TaskStatus::Rejected,
    ];

    /// Immutable once reached.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Cancelled | TaskStatus::Rejected
        )
    }

    /// Terminal, or FAILED (which only leaves through an explicit retry).
    pub fn is_finished(self) -> bool {
        self.is_terminal() || self == TaskStatus::Failed
    }

    pub fn is_cancellable(self) -> bool {
        matches!(
            self,
            TaskStatus::Submitted
                | TaskStatus::Queued
                | TaskStatus::Planning
                | TaskStatus::Assigned
                | TaskStatus::InProgress
        )
    }

    /// States from which a worker may claim a dispatch token.
    pub fn is_claimable(self) -> bool {
        matches!(
            self,
            TaskStatus::Queued | TaskStatus::Planning | TaskStatus::Assigned
        )
    }

    /// Forward edges of the state graph. The FAILED → SUBMITTED retry edge is
    /// deliberately absent: only [`Task::reset_for_retry`] may take it.
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        match self {
            Submitted => matches!(next, Queued | Failed | Cancelled | Rejected),
            Queued => matches!(
                next,
                Planning | Assigned | InProgress | Failed | Cancelled | Rejected
            ),
            Planning => matches!(next, Assigned | InProgress | Failed | Cancelled | Rejected),
            Assigned => matches!(next, InProgress | Failed | Cancelled),
            InProgress => matches!(next, Review | Completed | Failed | Cancelled),
            Review => matches!(next, Completed | Failed | Rejected),
            Completed | Failed | Cancelled | Rejected => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Submitted => "submitted",
            TaskStatus::Queued => "queued",
            TaskStatus::Planning => "planning",
            TaskStatus::Assigned => "assigned",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Review => "review",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
            TaskStatus::Rejected => "rejected",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = TaskLaneError;

    fn from_str(s: &str) -> Result<Self> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        TaskStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == normalized)
            .ok_or_else(|| TaskLaneError::validation(format!("unknown status '{s}'")))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Urgent,
    #[default]
    Normal,
    Low,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Urgent => "urgent",
            Priority::Normal => "normal",
            Priority::Low => "low",
        }
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Priority {
    type Err = TaskLaneError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "urgent" | "high" => Ok(Priority::Urgent),
            "normal" | "medium" => Ok(Priority::Normal),
            "low" => Ok(Priority::Low),
            other => Err(TaskLaneError::validation(format!(
                "unknown priority '{other}'"
            ))),
        }
    }
}

/// Recurrence rule of a template task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Recurrence {
    /// Fixed period measured from the previous due time.
    Interval { every_secs: u64 },
    /// 5-field cron expression (MIN HOUR DOM MON DOW), UTC.
    Cron { expression: String },
}

impl Recurrence {
    /// Parse `hourly`, `daily`, `weekly`, `@every <N>[s|m|h|d]` or a 5-field cron expression.
    ///
    /// Only the shape of cron expressions is checked here; field values are
    /// validated when the next occurrence is computed.
    pub fn parse(input: &str) -> Result<Self> {
        let pattern = input.trim();
        let cron = |e: &str| Recurrence::Cron {
            expression: e.to_string(),
        };
        match pattern.to_ascii_lowercase().as_str() {
            "hourly" | "@hourly" => return Ok(cron("0 * * * *")),
            "daily" | "@daily" => return Ok(cron("0 0 * * *")),
            "weekly" | "@weekly" => return Ok(cron("0 0 * * 0")),
            _ => {}
        }

        if let Some(rest) = pattern.strip_prefix("@every") {
            let every_secs = parse_duration_secs(rest.trim())?;
            return Ok(Recurrence::Interval { every_secs });
        }

        if pattern.split_whitespace().count() == 5 {
            let normalized = pattern.split_whitespace().collect::<Vec<_>>().join(" ");
            return Ok(cron(&normalized));
        }

        Err(TaskLaneError::validation(format!(
            "unrecognized recurring pattern '{input}'"
        )))
    }
}

impl std::fmt::Display for Recurrence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Recurrence::Interval { every_secs } => write!(f, "@every {every_secs}s"),
            Recurrence::Cron { expression } => f.write_str(expression),
        }
    }
}

fn parse_duration_secs(raw: &str) -> Result<u64> {
    let invalid = || TaskLaneError::validation(format!("invalid interval '{raw}'"));
    let (digits, unit) = match raw.find(|c: char| !c.is_ascii_digit()) {
        Some(idx) => raw.split_at(idx),
        None => (raw, "s"),
    };
    let n: u64 = digits.parse().map_err(|_| invalid())?;
    let factor = match unit.trim() {
        "s" | "" => 1,
        "m" => 60,
        "h" => 3600,
        "d" => 86_400,
        _ => return Err(invalid()),
    };
    match n.checked_mul(factor) {
        Some(0) | None => Err(invalid()),
        Some(secs) => Ok(secs),
    }
}

/// Classification result attached once the intent classifier has run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParsedIntent {
    pub intent_type: String,
    pub confidence: f32,
    /// Extracted entities (matched keywords, hashtags, ...).
    #[serde(default)]
    pub entities: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

/// One entry of the execution log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionStep {
    pub step_id: String,
    /// Handler/agent that produced this step.
    pub agent: String,
    pub action: String,
    pub status: StepStatus,
    #[serde(default)]
    pub output: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

impl ExecutionStep {
    /// A new in-progress step with a fresh id.
    pub fn start(agent: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            step_id: uuid::Uuid::new_v4().to_string(),
            agent: agent.into(),
            action: action.into(),
            status: StepStatus::InProgress,
            output: None,
            error: None,
            started_at: Utc::now(),
            completed_at: None,
        }
    }

    /// An already-completed step, used for progress messages.
    pub fn note(agent: impl Into<String>, action: impl Into<String>) -> Self {
        let mut step = Self::start(agent, action);
        step.status = StepStatus::Completed;
        step.completed_at = Some(step.started_at);
        step
    }

    pub fn complete(mut self, output: Option<Value>) -> Self {
        self.status = StepStatus::Completed;
        self.output = output;
        self.completed_at = Some(Utc::now());
        self
    }

    pub fn fail(mut self, error: impl Into<String>) -> Self {
        self.status = StepStatus::Failed;
        self.error = Some(error.into());
        self.completed_at = Some(Utc::now());
        self
    }
}

/// The central entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub tenant_id: String,

    pub description: String,
    #[serde(default)]
    pub parsed_intent: Option<ParsedIntent>,
    #[serde(default)]
    pub attachments: Vec<String>,
    #[serde(default)]
    pub metadata: Value,

    pub status: TaskStatus,
    pub priority: Priority,
    #[serde(default)]
    pub scheduled_for: Option<DateTime<Utc>>,
    #[serde(default)]
    pub recurring_pattern: Option<Recurrence>,
    /// Occurrences spawned so far (recurring templates only).
    #[serde(default)]
    pub occurrence_count: u32,
    #[serde(default)]
    pub last_occurrence_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub retry_count: u32,
    /// Number of dispatch attempts issued; the current token carries this value.
    #[serde(default)]
    pub attempt: u32,
    #[serde(default)]
    pub parent_task_id: Option<TaskId>,

    pub progress: u8,
    #[serde(default)]
    pub execution_log: Vec<ExecutionStep>,

    #[serde(default)]
    pub output_format: Option<String>,
    #[serde(default)]
    pub output_payload: Option<Value>,
    #[serde(default)]
    pub output_media: Vec<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub processing_started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub processing_ended_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub scheduled_post_time: Option<DateTime<Utc>>,

    #[serde(default)]
    pub error: Option<String>,

    /// Optimistic-concurrency version, bumped by the store on every write.
    #[serde(default)]
    pub version: u64,
}

impl Task {
    pub fn new(tenant_id: impl Into<String>, description: impl Into<String>, priority: Priority) -> Self {
        let now = Utc::now();
        Self {
            id: format!("task-{}", uuid::Uuid::new_v4().simple()),
            tenant_id: tenant_id.into(),
            description: description.into(),
            parsed_intent: None,
            attachments: Vec::new(),
            metadata: Value::Object(Default::default()),
            status: TaskStatus::Submitted,
            priority,
            scheduled_for: None,
            recurring_pattern: None,
            occurrence_count: 0,
            last_occurrence_at: None,
            retry_count: 0,
            attempt: 0,
            parent_task_id: None,
            progress: 0,
            execution_log: Vec::new(),
            output_format: None,
            output_payload: None,
            output_media: Vec::new(),
            created_at: now,
            updated_at: now,
            processing_started_at: None,
            processing_ended_at: None,
            scheduled_post_time: None,
            error: None,
            version: 0,
        }
    }

    pub fn is_recurring(&self) -> bool {
        self.recurring_pattern.is_some()
    }

    /// SUBMITTED and either unscheduled or scheduled at/before `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == TaskStatus::Submitted && self.scheduled_for.is_none_or(|at| at <= now)
    }

    /// Move along a forward edge of the state graph, maintaining processing timestamps.
    pub fn transition(&mut self, next: TaskStatus, now: DateTime<Utc>) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(TaskLaneError::conflict(format!(
                "task {} cannot move from {} to {}",
                self.id, self.status, next
            )));
        }
        if next == TaskStatus::InProgress && self.processing_started_at.is_none() {
            self.processing_started_at = Some(now);
        }
        if next.is_finished() {
            self.processing_ended_at = Some(now);
        }
        if next == TaskStatus::Completed {
            self.progress = 100;
        }
        self.status = next;
        self.updated_at = now;
        Ok(())
    }

    /// Take the FAILED → SUBMITTED edge.
    pub fn reset_for_retry(&mut self, now: DateTime<Utc>) -> Result<()> {
        if self.status != TaskStatus::Failed {
            return Err(TaskLaneError::conflict(format!(
                "task {} is {}, only failed tasks can be retried",
                self.id, self.status
            )));
        }
        self.status = TaskStatus::Submitted;
        self.error = None;
        self.processing_started_at = None;
        self.processing_ended_at = None;
        self.progress = 0;
        self.retry_count += 1;
        self.updated_at = now;
        Ok(())
    }

    /// Clamp to [0, 100] and never go backwards within an attempt.
    /// Returns the stored value.
    pub fn advance_progress(&mut self, percent: i64) -> u8 {
        let clamped = percent.clamp(0, 100) as u8;
        if clamped > self.progress {
            self.progress = clamped;
        }
        self.progress
    }

    pub fn latest_step(&self) -> Option<&ExecutionStep> {
        self.execution_log.last()
    }

    /// Append a step, or update the latest step when `step.step_id` matches it
    /// and it is still in progress. Any other existing id is rejected.
    pub fn record_step(&mut self, step: ExecutionStep) -> Result<()> {
        let Some(pos) = self
            .execution_log
            .iter()
            .position(|s| s.step_id == step.step_id)
        else {
            self.execution_log.push(step);
            return Ok(());
        };

        let is_latest = pos + 1 == self.execution_log.len();
        let existing = &mut self.execution_log[pos];
        if !is_latest || existing.status != StepStatus::InProgress {
            return Err(TaskLaneError::validation(format!(
                "step {} is not the latest in-progress step",
                step.step_id
            )));
        }
        existing.status = step.status;
        existing.output = step.output;
        existing.error = step.error;
        existing.completed_at = step.completed_at;
        Ok(())
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        StatusSnapshot {
            task_id: self.id.clone(),
            status: self.status,
            progress: self.progress,
            execution_log: self.execution_log.clone(),
            error: self.error.clone(),
            retry_count: self.retry_count,
            attempt: self.attempt,
            created_at: self.created_at,
            updated_at: self.updated_at,
            processing_started_at: self.processing_started_at,
            processing_ended_at: self.processing_ended_at,
            scheduled_for: self.scheduled_for,
        }
    }
}

/// Read-only status view returned by `get_status`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub task_id: TaskId,
    pub status: TaskStatus,
    pub progress: u8,
    pub execution_log: Vec<ExecutionStep>,
    pub error: Option<String>,
    pub retry_count: u32,
    pub attempt: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub processing_started_at: Option<DateTime<Utc>>,
    pub processing_ended_at: Option<DateTime<Utc>>,
    pub scheduled_for: Option<DateTime<Utc>>,
}
