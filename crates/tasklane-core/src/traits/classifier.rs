//! Intent classification strategy.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::task::ParsedIntent;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    pub intent_type: String,
    pub confidence: f32,
    #[serde(default)]
    pub entities: Value,
}

impl From<Classification> for ParsedIntent {
    fn from(c: Classification) -> Self {
        ParsedIntent {
            intent_type: c.intent_type,
            confidence: c.confidence,
            entities: c.entities,
        }
    }
}

/// Maps a free-text description to an intent type. Injected into the engine,
/// so keyword, model-backed or test classifiers are interchangeable.
pub trait IntentClassifier: Send + Sync {
    fn name(&self) -> &str;

    fn classify(&self, description: &str) -> Classification;
}
