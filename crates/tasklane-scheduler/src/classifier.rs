//! Deterministic keyword-substring intent classifier.

use serde_json::json;

use tasklane_core::config::{ClassifierConfig, IntentRule};
use tasklane_core::traits::{Classification, IntentClassifier};

const MATCH_CONFIDENCE: f32 = 0.9;
const FALLBACK_CONFIDENCE: f32 = 0.5;

/// First rule with any keyword contained in the lowercased description wins.
pub struct KeywordClassifier {
    rules: Vec<IntentRule>,
    fallback_intent: String,
}

impl KeywordClassifier {
    pub fn new(config: &ClassifierConfig) -> Self {
        let rules = config
            .rules
            .iter()
            .map(|rule| IntentRule {
                intent: rule.intent.clone(),
                keywords: rule.keywords.iter().map(|k| k.to_lowercase()).collect(),
            })
            .collect();
        Self {
            rules,
            fallback_intent: config.fallback_intent.clone(),
        }
    }
}

impl Default for KeywordClassifier {
    fn default() -> Self {
        Self::new(&ClassifierConfig::default())
    }
}

impl IntentClassifier for KeywordClassifier {
    fn name(&self) -> &str {
        "keyword"
    }

    fn classify(&self, description: &str) -> Classification {
        let text = description.to_lowercase();
        for rule in &self.rules {
            let matched: Vec<&str> = rule
                .keywords
                .iter()
                .filter(|k| !k.is_empty() && text.contains(k.as_str()))
                .map(String::as_str)
                .collect();
            if !matched.is_empty() {
                return Classification {
                    intent_type: rule.intent.clone(),
                    confidence: MATCH_CONFIDENCE,
                    entities: json!({ "keywords": matched }),
                };
            }
        }
        Classification {
            intent_type: self.fallback_intent.clone(),
            confidence: FALLBACK_CONFIDENCE,
            entities: json!({ "keywords": [] }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reference_vocabulary() {
        let c = KeywordClassifier::default();
        assert_eq!(c.classify("Write a Social POST about tea").intent_type, "content_creation");
        assert_eq!(c.classify("analyze the coffee market").intent_type, "market_analysis");
        assert_eq!(c.classify("do something obscure").intent_type, "general");
    }

    #[test]
    fn test_entities_and_confidence() {
        let c = KeywordClassifier::default();
        let hit = c.classify("competitor trend report");
        assert_eq!(hit.confidence, MATCH_CONFIDENCE);
        assert_eq!(hit.entities["keywords"], json!(["competitor", "trend"]));

        let miss = c.classify("hello");
        assert!(miss.confidence < hit.confidence);
    }

    #[test]
    fn test_custom_rules_take_order() {
        let config = ClassifierConfig {
            fallback_intent: "misc".into(),
            rules: vec![
                IntentRule { intent: "billing".into(), keywords: vec!["Invoice".into()] },
                IntentRule { intent: "content_creation".into(), keywords: vec!["post".into()] },
            ],
        };
        let c = KeywordClassifier::new(&config);
        assert_eq!(c.classify("post the invoice").intent_type, "billing");
        assert_eq!(c.classify("nothing").intent_type, "misc");
    }
}
