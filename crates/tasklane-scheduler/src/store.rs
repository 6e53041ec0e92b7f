//! In-memory task store, for tests and `backend = "memory"`.
//! Same contract as the SQLite store: version-checked updates, tenant-scoped queries.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use tasklane_core::query::sort_newest_first;
use tasklane_core::traits::TaskStore;
use tasklane_core::{Result, Task, TaskLaneError, TaskQuery, TaskStatus};

#[derive(Default)]
pub struct InMemoryTaskStore {
    tasks: RwLock<HashMap<String, Task>>,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.tasks.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.tasks.read().await.is_empty()
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn insert(&self, task: &Task) -> Result<Task> {
        let mut tasks = self.tasks.write().await;
        if tasks.contains_key(&task.id) {
            return Err(TaskLaneError::store(format!("task {} already exists", task.id)));
        }
        let mut stored = task.clone();
        stored.version = 1;
        tasks.insert(stored.id.clone(), stored.clone());
        tracing::debug!("💾 Inserted {}", stored.id);
        Ok(stored)
    }

    async fn get(&self, task_id: &str) -> Result<Option<Task>> {
        Ok(self.tasks.read().await.get(task_id).cloned())
    }

    async fn update(&self, task: &Task) -> Result<Task> {
        let mut tasks = self.tasks.write().await;
        let current = tasks
            .get_mut(&task.id)
            .ok_or_else(|| TaskLaneError::NotFound(task.id.clone()))?;
        if current.version != task.version {
            return Err(TaskLaneError::StaleWrite(task.id.clone()));
        }
        let mut stored = task.clone();
        stored.version = task.version + 1;
        *current = stored.clone();
        Ok(stored)
    }

    async fn query(&self, query: &TaskQuery) -> Result<Vec<Task>> {
        let tasks = self.tasks.read().await;
        let mut matched: Vec<Task> = tasks
            .values()
            .filter(|t| t.tenant_id == query.tenant_id && query.filter.matches(t))
            .cloned()
            .collect();
        sort_newest_first(&mut matched);
        Ok(matched
            .into_iter()
            .skip(query.page.offset)
            .take(query.page.limit)
            .collect())
    }

    async fn due_for_dispatch(&self, now: DateTime<Utc>) -> Result<Vec<Task>> {
        let tasks = self.tasks.read().await;
        let mut due: Vec<Task> = tasks.values().filter(|t| t.is_due(now)).cloned().collect();
        due.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(due)
    }

    async fn find_by_status(&self, status: TaskStatus) -> Result<Vec<Task>> {
        let tasks = self.tasks.read().await;
        let mut found: Vec<Task> = tasks.values().filter(|t| t.status == status).cloned().collect();
        found.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(found)
    }
}
