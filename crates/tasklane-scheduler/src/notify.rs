//! Task event notifier, an outbound queue decoupled from record writes.
//!
//! `publish` is synchronous and infallible: it records the event in a bounded
//! history, fans it out to in-process subscribers, and hands it to the outbox
//! drained by delivery sinks on a background task. A slow or failing sink can
//! never delay or roll back the state transition that produced the event.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{broadcast, mpsc};

use tasklane_core::Result;
use tasklane_core::config::NotifyConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskEventKind {
    Created,
    StatusChanged,
    Progress,
    StepAdded,
    OutputSet,
    Updated,
    Retried,
    Cancelled,
    OccurrenceSpawned,
}

impl TaskEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskEventKind::Created => "created",
            TaskEventKind::StatusChanged => "status_changed",
            TaskEventKind::Progress => "progress",
            TaskEventKind::StepAdded => "step_added",
            TaskEventKind::OutputSet => "output_set",
            TaskEventKind::Updated => "updated",
            TaskEventKind::Retried => "retried",
            TaskEventKind::Cancelled => "cancelled",
            TaskEventKind::OccurrenceSpawned => "occurrence_spawned",
        }
    }
}

impl std::fmt::Display for TaskEventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One published state change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskEvent {
    pub tenant_id: String,
    pub task_id: String,
    pub kind: TaskEventKind,
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
}

/// Destination for outbox events (webhook, chat channel, ...).
#[async_trait]
pub trait NotifySink: Send + Sync {
    fn name(&self) -> &str;
    async fn deliver(&self, event: &TaskEvent) -> Result<()>;
}

pub struct Notifier {
    sender: broadcast::Sender<TaskEvent>,
    /// Recent events (in-memory ring buffer).
    history: Mutex<VecDeque<TaskEvent>>,
    history_size: usize,
    outbox: Option<mpsc::UnboundedSender<TaskEvent>>,
}

impl Notifier {
    /// Notifier without external sinks.
    pub fn new(config: &NotifyConfig) -> Self {
        let (sender, _) = broadcast::channel(config.broadcast_capacity.max(1));
        Self {
            sender,
            history: Mutex::new(VecDeque::with_capacity(config.history_size)),
            history_size: config.history_size,
            outbox: None,
        }
    }

    /// Notifier plus the receiving end of its outbox; run [`Outbox::drain`]
    /// on a background task to deliver events to sinks.
    pub fn with_outbox(config: &NotifyConfig) -> (Self, Outbox) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut notifier = Self::new(config);
        notifier.outbox = Some(tx);
        (notifier, Outbox { receiver: rx })
    }

    pub fn publish(&self, tenant_id: &str, task_id: &str, kind: TaskEventKind, payload: Value) {
        let event = TaskEvent {
            tenant_id: tenant_id.to_string(),
            task_id: task_id.to_string(),
            kind,
            payload,
            timestamp: Utc::now(),
        };
        tracing::debug!("🔔 {} {} ({})", kind, task_id, tenant_id);

        if self.history_size > 0
            && let Ok(mut history) = self.history.lock()
        {
            if history.len() >= self.history_size {
                history.pop_front();
            }
            history.push_back(event.clone());
        }

        if let Some(outbox) = &self.outbox
            && outbox.send(event.clone()).is_err()
        {
            tracing::warn!("⚠️ Notify outbox closed, dropping {} for {}", kind, task_id);
        }

        // No subscribers is fine.
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.sender.subscribe()
    }

    /// Recent events, oldest first.
    pub fn history(&self) -> Vec<TaskEvent> {
        self.history
            .lock()
            .map(|h| h.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Recent events of one task, oldest first.
    pub fn history_for(&self, task_id: &str) -> Vec<TaskEvent> {
        self.history()
            .into_iter()
            .filter(|e| e.task_id == task_id)
            .collect()
    }
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new(&NotifyConfig::default())
    }
}

/// Receiving end of the notifier outbox.
pub struct Outbox {
    receiver: mpsc::UnboundedReceiver<TaskEvent>,
}

impl Outbox {
    /// Deliver events to every sink until the notifier is dropped.
    /// Delivery errors are logged and the event is dropped for that sink.
    pub async fn drain(mut self, sinks: Vec<Arc<dyn NotifySink>>) {
        while let Some(event) = self.receiver.recv().await {
            for sink in &sinks {
                if let Err(e) = sink.deliver(&event).await {
                    tracing::warn!(
                        "⚠️ Notify sink '{}' failed for {} ({}): {e}",
                        sink.name(),
                        event.task_id,
                        event.kind
                    );
                }
            }
        }
        tracing::debug!("🔕 Notify outbox closed");
    }
}
