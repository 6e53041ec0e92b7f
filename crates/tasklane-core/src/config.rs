//! TaskLane configuration system.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{Result, TaskLaneError};
use crate::lane::Lane;

/// Root configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskLaneConfig {
    #[serde(default = "default_tenant")]
    pub default_tenant: String,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub lanes: LaneConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub classifier: ClassifierConfig,
    #[serde(default)]
    pub notify: NotifyConfig,
}

fn default_tenant() -> String { "default".into() }

impl Default for TaskLaneConfig {
    fn default() -> Self {
        Self {
            default_tenant: default_tenant(),
            store: StoreConfig::default(),
            scheduler: SchedulerConfig::default(),
            lanes: LaneConfig::default(),
            retry: RetryConfig::default(),
            classifier: ClassifierConfig::default(),
            notify: NotifyConfig::default(),
        }
    }
}

impl TaskLaneConfig {
    /// Load config from the default path (~/.tasklane/config.toml).
    pub fn load() -> Result<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load config from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| TaskLaneError::Config(format!("Failed to read config: {e}")))?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| TaskLaneError::Config(format!("Failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Save config to a path, creating parent directories.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| TaskLaneError::Config(format!("Failed to serialize config: {e}")))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.default_tenant.trim().is_empty() {
            return Err(TaskLaneError::Config("default_tenant must not be empty".into()));
        }
        if self.scheduler.sweep_interval_secs == 0 {
            return Err(TaskLaneError::Config("scheduler.sweep_interval_secs must be > 0".into()));
        }
        if self.notify.broadcast_capacity == 0 {
            return Err(TaskLaneError::Config("notify.broadcast_capacity must be > 0".into()));
        }
        Ok(())
    }

    /// Get the default config path.
    pub fn default_path() -> PathBuf {
        Self::home_dir().join("config.toml")
    }

    /// Get the TaskLane home directory.
    pub fn home_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".tasklane")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    Sqlite,
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_backend")]
    pub backend: StoreBackend,
    #[serde(default = "default_store_path")]
    pub path: String,
}

fn default_backend() -> StoreBackend { StoreBackend::Sqlite }
fn default_store_path() -> String { "~/.tasklane/tasks.db".into() }

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            path: default_store_path(),
        }
    }
}

impl StoreConfig {
    /// Store path with `~` expanded.
    pub fn resolved_path(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.path).to_string())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
    #[serde(default = "default_poll_interval")]
    pub worker_poll_interval_ms: u64,
    /// Wall-clock bound per attempt enforced by the worker harness. None = unbounded.
    #[serde(default)]
    pub attempt_timeout_secs: Option<u64>,
}

fn default_sweep_interval() -> u64 { 30 }
fn default_poll_interval() -> u64 { 250 }

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: default_sweep_interval(),
            worker_poll_interval_ms: default_poll_interval(),
            attempt_timeout_secs: None,
        }
    }
}

/// Worker counts per lane.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LaneConfig {
    #[serde(default = "default_priority_workers")]
    pub priority_workers: usize,
    #[serde(default = "default_default_workers")]
    pub default_workers: usize,
    #[serde(default = "default_background_workers")]
    pub background_workers: usize,
}

fn default_priority_workers() -> usize { 4 }
fn default_default_workers() -> usize { 2 }
fn default_background_workers() -> usize { 1 }

impl Default for LaneConfig {
    fn default() -> Self {
        Self {
            priority_workers: default_priority_workers(),
            default_workers: default_default_workers(),
            background_workers: default_background_workers(),
        }
    }
}

impl LaneConfig {
    pub fn workers_for(&self, lane: Lane) -> usize {
        match lane {
            Lane::Priority => self.priority_workers,
            Lane::Default => self.default_workers,
            Lane::Background => self.background_workers,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Cap on manual retries. None = unbounded.
    #[serde(default)]
    pub max_retries: Option<u32>,
}

/// One keyword rule: any keyword (case-insensitive substring) selects `intent`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntentRule {
    pub intent: String,
    pub keywords: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifierConfig {
    #[serde(default = "default_fallback_intent")]
    pub fallback_intent: String,
    #[serde(default = "default_rules")]
    pub rules: Vec<IntentRule>,
}

fn default_fallback_intent() -> String { "general".into() }

fn default_rules() -> Vec<IntentRule> {
    let rule = |intent: &str, keywords: &[&str]| IntentRule {
        intent: intent.into(),
        keywords: keywords.iter().map(|k| k.to_string()).collect(),
    };
    vec![
        rule("content_creation", &["post", "content", "social", "caption", "tweet"]),
        rule("market_analysis", &["analyze", "analyse", "market", "competitor", "trend"]),
        rule("image_generation", &["image", "picture", "illustration", "photo"]),
    ]
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            fallback_intent: default_fallback_intent(),
            rules: default_rules(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifyConfig {
    #[serde(default = "default_history_size")]
    pub history_size: usize,
    #[serde(default = "default_broadcast_capacity")]
    pub broadcast_capacity: usize,
    #[serde(default)]
    pub webhook_url: Option<String>,
}

fn default_history_size() -> usize { 100 }
fn default_broadcast_capacity() -> usize { 1024 }

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            history_size: default_history_size(),
            broadcast_capacity: default_broadcast_capacity(),
            webhook_url: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: TaskLaneConfig = toml::from_str(
            r#"
            default_tenant = "acme"

            [lanes]
            priority_workers = 8

            [retry]
            max_retries = 3
            "#,
        )
        .unwrap();
        assert_eq!(config.default_tenant, "acme");
        assert_eq!(config.lanes.workers_for(Lane::Priority), 8);
        assert_eq!(config.lanes.workers_for(Lane::Default), 2);
        assert_eq!(config.retry.max_retries, Some(3));
        assert_eq!(config.store.backend, StoreBackend::Sqlite);
        assert_eq!(config.classifier.fallback_intent, "general");
        assert!(!config.classifier.rules.is_empty());
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        let mut config = TaskLaneConfig::default();
        config.store.backend = StoreBackend::Memory;
        config.scheduler.attempt_timeout_secs = Some(90);
        config.save_to(&path).unwrap();

        let loaded = TaskLaneConfig::load_from(&path).unwrap();
        assert_eq!(loaded.store.backend, StoreBackend::Memory);
        assert_eq!(loaded.scheduler.attempt_timeout_secs, Some(90));
    }

    #[test]
    fn test_invalid_config_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[scheduler]\nsweep_interval_secs = 0\n").unwrap();
        let err = TaskLaneConfig::load_from(&path).unwrap_err();
        assert!(matches!(err, TaskLaneError::Config(_)));
    }
}
