//! In-memory lane broker: one FIFO queue per lane with concurrency slots.
//!
//! Tokens are FIFO within a lane; lanes are independent of each other.
//! Revoked tokens are dropped from the queue, or flagged if already in flight.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use tasklane_core::config::LaneConfig;
use tasklane_core::traits::LaneBroker;
use tasklane_core::{DispatchToken, Lane, Result, TaskLaneError};

/// Per-lane state.
struct LaneState {
    queue: VecDeque<DispatchToken>,
    in_flight: HashSet<String>,
    max_concurrent: usize,
    total_enqueued: u64,
    total_processed: u64,
}

impl LaneState {
    fn new(max_concurrent: usize) -> Self {
        Self {
            queue: VecDeque::new(),
            in_flight: HashSet::new(),
            max_concurrent: max_concurrent.max(1),
            total_enqueued: 0,
            total_processed: 0,
        }
    }

    fn dequeue(&mut self) -> Option<DispatchToken> {
        if self.in_flight.len() >= self.max_concurrent {
            return None;
        }
        let token = self.queue.pop_front()?;
        self.in_flight.insert(token.key());
        Some(token)
    }

    fn complete(&mut self, key: &str) {
        if self.in_flight.remove(key) {
            self.total_processed += 1;
        }
    }
}

/// Lane broker kept in process memory.
pub struct InMemoryLaneBroker {
    lanes: [Arc<Mutex<LaneState>>; 3],
    revoked: Mutex<HashSet<String>>,
    accepting: std::sync::atomic::AtomicBool,
}

impl InMemoryLaneBroker {
    /// Concurrency limits per lane: priority, default, background.
    pub fn new(limits: [usize; 3]) -> Self {
        Self {
            lanes: limits.map(|limit| Arc::new(Mutex::new(LaneState::new(limit)))),
            revoked: Mutex::new(HashSet::new()),
            accepting: std::sync::atomic::AtomicBool::new(true),
        }
    }

    /// Slots sized to the configured worker counts.
    pub fn from_config(config: &LaneConfig) -> Self {
        Self::new(Lane::ALL.map(|lane| config.workers_for(lane)))
    }

    /// Toggle intake; a closed broker rejects `enqueue` like an unreachable one.
    pub fn set_accepting(&self, accepting: bool) {
        self.accepting
            .store(accepting, std::sync::atomic::Ordering::SeqCst);
    }

    fn lane(&self, lane: Lane) -> &Arc<Mutex<LaneState>> {
        &self.lanes[lane.index()]
    }

    /// Tokens currently waiting in a lane, in dispatch order.
    pub async fn queued(&self, lane: Lane) -> Vec<DispatchToken> {
        self.lane(lane).lock().await.queue.iter().cloned().collect()
    }

    /// Statistics for all lanes.
    pub async fn stats(&self) -> Vec<LaneStats> {
        let mut result = Vec::with_capacity(Lane::ALL.len());
        for lane in Lane::ALL {
            let state = self.lane(lane).lock().await;
            result.push(LaneStats {
                lane,
                queued: state.queue.len(),
                active: state.in_flight.len(),
                max_concurrent: state.max_concurrent,
                total_enqueued: state.total_enqueued,
                total_processed: state.total_processed,
            });
        }
        result
    }

    /// Total queued + in-flight tokens across all lanes.
    pub async fn total_pending(&self) -> usize {
        let mut total = 0;
        for lane in &self.lanes {
            let state = lane.lock().await;
            total += state.queue.len() + state.in_flight.len();
        }
        total
    }
}

impl Default for InMemoryLaneBroker {
    fn default() -> Self {
        Self::from_config(&LaneConfig::default())
    }
}

#[async_trait]
impl LaneBroker for InMemoryLaneBroker {
    async fn enqueue(&self, lane: Lane, token: DispatchToken) -> Result<()> {
        if !self.accepting.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(TaskLaneError::Broker(format!(
                "lane '{lane}' is not accepting dispatches"
            )));
        }
        let mut state = self.lane(lane).lock().await;
        tracing::debug!(
            "📥 Lane[{}] enqueue: {} (queue: {}, active: {})",
            lane,
            token.key(),
            state.queue.len(),
            state.in_flight.len()
        );
        state.queue.push_back(token);
        state.total_enqueued += 1;
        Ok(())
    }

    async fn dequeue(&self, lane: Lane) -> Result<Option<DispatchToken>> {
        let token = self.lane(lane).lock().await.dequeue();
        if let Some(token) = &token {
            tracing::debug!("📤 Lane[{}] dequeue: {}", lane, token.key());
        }
        Ok(token)
    }

    async fn revoke(&self, token: &DispatchToken) -> bool {
        let key = token.key();
        let mut state = self.lane(token.lane).lock().await;
        let before = state.queue.len();
        state.queue.retain(|t| t.key() != key);
        if state.queue.len() < before {
            tracing::debug!("🚫 Lane[{}] revoked queued token {}", token.lane, key);
            return true;
        }
        if state.in_flight.contains(&key) {
            self.revoked.lock().await.insert(key);
            tracing::debug!("🚫 Lane[{}] flagged in-flight token {}", token.lane, token.key());
            return true;
        }
        false
    }

    async fn ack(&self, token: &DispatchToken) {
        let key = token.key();
        self.lane(token.lane).lock().await.complete(&key);
        self.revoked.lock().await.remove(&key);
    }

    async fn is_revoked(&self, token: &DispatchToken) -> bool {
        self.revoked.lock().await.contains(&token.key())
    }
}

/// Statistics for a single lane.
#[derive(Debug, Clone, serde::Serialize)]
pub struct LaneStats {
    pub lane: Lane,
    pub queued: usize,
    pub active: usize,
    pub max_concurrent: usize,
    pub total_enqueued: u64,
    pub total_processed: u64,
}
