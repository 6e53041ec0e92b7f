//! Processor registry: intent type → handler factory, with an optional default.
//!
//! Built once at startup and shared behind an `Arc`; there is no global instance.

use std::collections::HashMap;
use std::sync::Arc;

use crate::handler::TaskHandler;

pub type HandlerFactory = Arc<dyn Fn() -> Arc<dyn TaskHandler> + Send + Sync>;

#[derive(Default, Clone)]
pub struct ProcessorRegistry {
    factories: HashMap<String, HandlerFactory>,
    default: Option<HandlerFactory>,
}

impl ProcessorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the factory for an intent type.
    pub fn register(&mut self, intent_type: impl Into<String>, factory: HandlerFactory) {
        let intent_type = intent_type.into();
        if self.factories.insert(intent_type.clone(), factory).is_some() {
            tracing::debug!("🔁 Processor for '{}' replaced", intent_type);
        }
    }

    /// Register one shared handler instance for an intent type.
    pub fn register_handler<H>(&mut self, intent_type: impl Into<String>, handler: H)
    where
        H: TaskHandler + 'static,
    {
        self.register(intent_type, shared(handler));
    }

    /// Many intent types, one factory.
    pub fn register_aliases(&mut self, intent_types: &[&str], factory: HandlerFactory) {
        for intent_type in intent_types {
            self.register(*intent_type, factory.clone());
        }
    }

    pub fn set_default(&mut self, factory: HandlerFactory) {
        self.default = Some(factory);
    }

    pub fn set_default_handler<H>(&mut self, handler: H)
    where
        H: TaskHandler + 'static,
    {
        self.set_default(shared(handler));
    }

    /// Specific factory, else the default, else None. Never fails.
    pub fn resolve(&self, intent_type: &str) -> Option<HandlerFactory> {
        self.factories
            .get(intent_type)
            .or(self.default.as_ref())
            .cloned()
    }

    pub fn has_default(&self) -> bool {
        self.default.is_some()
    }

    /// Registered intent types, sorted.
    pub fn intents(&self) -> Vec<String> {
        let mut intents: Vec<String> = self.factories.keys().cloned().collect();
        intents.sort();
        intents
    }
}

fn shared<H: TaskHandler + 'static>(handler: H) -> HandlerFactory {
    let handler: Arc<dyn TaskHandler> = Arc::new(handler);
    Arc::new(move || handler.clone())
}
