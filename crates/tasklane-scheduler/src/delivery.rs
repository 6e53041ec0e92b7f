//! Notify sinks that leave the process.

use async_trait::async_trait;

use tasklane_core::{Result, TaskLaneError};

use crate::notify::{NotifySink, TaskEvent};

/// Generic HTTP webhook: POST each event as JSON.
pub struct WebhookSink {
    url: String,
    headers: Vec<(String, String)>,
    client: reqwest::Client,
}

impl WebhookSink {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            headers: Vec::new(),
            client: reqwest::Client::new(),
        }
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }

    fn body(event: &TaskEvent) -> serde_json::Value {
        serde_json::json!({
            "tenant_id": event.tenant_id,
            "task_id": event.task_id,
            "event": event.kind.as_str(),
            "payload": event.payload,
            "timestamp": event.timestamp.to_rfc3339(),
        })
    }
}

#[async_trait]
impl NotifySink for WebhookSink {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn deliver(&self, event: &TaskEvent) -> Result<()> {
        let mut req = self
            .client
            .post(&self.url)
            .json(&Self::body(event))
            .timeout(std::time::Duration::from_secs(10));

        for (key, value) in &self.headers {
            req = req.header(key.as_str(), value.as_str());
        }

        let resp = req
            .send()
            .await
            .map_err(|e| TaskLaneError::Notify(format!("Webhook send failed: {e}")))?;

        if resp.status().is_success() {
            tracing::debug!("✅ Webhook event sent to {}: {} {}", self.url, event.kind, event.task_id);
            Ok(())
        } else {
            Err(TaskLaneError::Notify(format!("Webhook error {}", resp.status())))
        }
    }
}
