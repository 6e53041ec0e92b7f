//! Collaborator interfaces consumed by the engine.

pub mod broker;
pub mod classifier;
pub mod store;

pub use broker::LaneBroker;
pub use classifier::{Classification, IntentClassifier};
pub use store::TaskStore;
