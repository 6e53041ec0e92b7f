//! Handler result object.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    Success,
    Failure,
}

/// What a handler returns when it is done with an attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandlerOutcome {
    pub status: OutcomeStatus,
    #[serde(default)]
    pub result_payload: Value,
}

impl HandlerOutcome {
    pub fn success(result_payload: Value) -> Self {
        Self {
            status: OutcomeStatus::Success,
            result_payload,
        }
    }

    /// Failure with `{"error": reason}` as payload.
    pub fn failure(reason: impl Into<String>) -> Self {
        Self {
            status: OutcomeStatus::Failure,
            result_payload: serde_json::json!({ "error": reason.into() }),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == OutcomeStatus::Success
    }

    /// Failure reason carried in the payload, if any.
    pub fn error_message(&self) -> Option<String> {
        match &self.result_payload {
            Value::String(s) => Some(s.clone()),
            other => other.get("error").and_then(|e| e.as_str()).map(String::from),
        }
    }
}
