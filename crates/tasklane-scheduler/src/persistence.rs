//! SQLite-backed task store: survives restarts, supports concurrent writers.
//!
//! Each row keeps the full record as JSON next to the columns used for
//! filtering. Timestamps are fixed-width RFC 3339 (UTC, microseconds) so
//! text comparison matches time order.

use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Value as SqlValue;

use tasklane_core::traits::TaskStore;
use tasklane_core::{Result, Task, TaskLaneError, TaskQuery, TaskStatus};

pub struct SqliteTaskStore {
    conn: Mutex<rusqlite::Connection>,
}

fn db_err(e: rusqlite::Error) -> TaskLaneError {
    TaskLaneError::store(format!("SQLite: {e}"))
}

fn ts(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

impl SqliteTaskStore {
    /// Open or create the task database.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let conn = rusqlite::Connection::open(path).map_err(db_err)?;
        let store = Self::with_connection(conn)?;
        tracing::info!("💾 Task store opened at {}", path.display());
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::with_connection(rusqlite::Connection::open_in_memory().map_err(db_err)?)
    }

    fn with_connection(conn: rusqlite::Connection) -> Result<Self> {
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.migrate()?;
        Ok(store)
    }

    fn conn(&self) -> Result<std::sync::MutexGuard<'_, rusqlite::Connection>> {
        self.conn
            .lock()
            .map_err(|_| TaskLaneError::store("connection mutex poisoned"))
    }

    /// Run migrations to create tables.
    fn migrate(&self) -> Result<()> {
        self.conn()?
            .execute_batch(
                "
            CREATE TABLE IF NOT EXISTS tasks (
                id TEXT PRIMARY KEY,
                tenant_id TEXT NOT NULL,
                status TEXT NOT NULL,
                priority TEXT NOT NULL,
                parent_task_id TEXT,
                scheduled_for TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                version INTEGER NOT NULL,
                record TEXT NOT NULL          -- full task as JSON
            );

            CREATE INDEX IF NOT EXISTS idx_tasks_tenant_created
                ON tasks (tenant_id, created_at DESC);
            CREATE INDEX IF NOT EXISTS idx_tasks_status_scheduled
                ON tasks (status, scheduled_for);
            ",
            )
            .map_err(db_err)
    }

    fn load_records(
        conn: &rusqlite::Connection,
        sql: &str,
        params: &[SqlValue],
    ) -> Result<Vec<Task>> {
        let mut stmt = conn.prepare(sql).map_err(db_err)?;
        let rows = stmt
            .query_map(rusqlite::params_from_iter(params.iter()), |row| {
                row.get::<_, String>(0)
            })
            .map_err(db_err)?;
        let mut tasks = Vec::new();
        for row in rows {
            tasks.push(serde_json::from_str(&row.map_err(db_err)?)?);
        }
        Ok(tasks)
    }
}

#[async_trait]
impl TaskStore for SqliteTaskStore {
    async fn insert(&self, task: &Task) -> Result<Task> {
        let mut stored = task.clone();
        stored.version = 1;
        let record = serde_json::to_string(&stored)?;
        self.conn()?
            .execute(
                "INSERT INTO tasks
                 (id, tenant_id, status, priority, parent_task_id, scheduled_for,
                  created_at, updated_at, version, record)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                rusqlite::params![
                    stored.id,
                    stored.tenant_id,
                    stored.status.as_str(),
                    stored.priority.as_str(),
                    stored.parent_task_id,
                    stored.scheduled_for.map(ts),
                    ts(stored.created_at),
                    ts(stored.updated_at),
                    stored.version as i64,
                    record,
                ],
            )
            .map_err(db_err)?;
        tracing::debug!("💾 Inserted {}", stored.id);
        Ok(stored)
    }

    async fn get(&self, task_id: &str) -> Result<Option<Task>> {
        let conn = self.conn()?;
        let mut tasks = Self::load_records(
            &conn,
            "SELECT record FROM tasks WHERE id = ?1",
            &[SqlValue::Text(task_id.to_string())],
        )?;
        Ok(tasks.pop())
    }

    async fn update(&self, task: &Task) -> Result<Task> {
        let mut stored = task.clone();
        stored.version = task.version + 1;
        let record = serde_json::to_string(&stored)?;
        let conn = self.conn()?;
        let changed = conn
            .execute(
                "UPDATE tasks SET status = ?1, priority = ?2, parent_task_id = ?3,
                        scheduled_for = ?4, updated_at = ?5, version = ?6, record = ?7
                 WHERE id = ?8 AND version = ?9",
                rusqlite::params![
                    stored.status.as_str(),
                    stored.priority.as_str(),
                    stored.parent_task_id,
                    stored.scheduled_for.map(ts),
                    ts(stored.updated_at),
                    stored.version as i64,
                    record,
                    stored.id,
                    task.version as i64,
                ],
            )
            .map_err(db_err)?;
        if changed == 1 {
            return Ok(stored);
        }

        let exists: bool = conn
            .query_row(
                "SELECT EXISTS(SELECT 1 FROM tasks WHERE id = ?1)",
                [&task.id],
                |row| row.get(0),
            )
            .map_err(db_err)?;
        if exists {
            Err(TaskLaneError::StaleWrite(task.id.clone()))
        } else {
            Err(TaskLaneError::NotFound(task.id.clone()))
        }
    }

    async fn query(&self, query: &TaskQuery) -> Result<Vec<Task>> {
        let filter = &query.filter;
        let mut sql = String::from("SELECT record FROM tasks WHERE tenant_id = ?");
        let mut params = vec![SqlValue::Text(query.tenant_id.clone())];

        if !filter.statuses.is_empty() {
            let marks = vec!["?"; filter.statuses.len()].join(", ");
            sql.push_str(&format!(" AND status IN ({marks})"));
            params.extend(filter.statuses.iter().map(|s| SqlValue::Text(s.as_str().into())));
        }
        if let Some(priority) = filter.priority {
            sql.push_str(" AND priority = ?");
            params.push(SqlValue::Text(priority.as_str().into()));
        }
        let windows = [
            ("created_at >= ?", filter.created_after),
            ("created_at <= ?", filter.created_before),
            ("scheduled_for >= ?", filter.scheduled_after),
            ("scheduled_for <= ?", filter.scheduled_before),
        ];
        for (clause, bound) in windows {
            if let Some(at) = bound {
                sql.push_str(" AND ");
                sql.push_str(clause);
                params.push(SqlValue::Text(ts(at)));
            }
        }
        if let Some(parent) = &filter.parent_task_id {
            sql.push_str(" AND parent_task_id = ?");
            params.push(SqlValue::Text(parent.clone()));
        }
        sql.push_str(" ORDER BY created_at DESC, id DESC LIMIT ? OFFSET ?");
        params.push(SqlValue::Integer(query.page.limit as i64));
        params.push(SqlValue::Integer(query.page.offset as i64));

        let conn = self.conn()?;
        Self::load_records(&conn, &sql, &params)
    }

    async fn due_for_dispatch(&self, now: DateTime<Utc>) -> Result<Vec<Task>> {
        let conn = self.conn()?;
        Self::load_records(
            &conn,
            "SELECT record FROM tasks
             WHERE status = ?1 AND (scheduled_for IS NULL OR scheduled_for <= ?2)
             ORDER BY created_at ASC, id ASC",
            &[
                SqlValue::Text(TaskStatus::Submitted.as_str().into()),
                SqlValue::Text(ts(now)),
            ],
        )
    }

    async fn find_by_status(&self, status: TaskStatus) -> Result<Vec<Task>> {
        let conn = self.conn()?;
        Self::load_records(
            &conn,
            "SELECT record FROM tasks WHERE status = ?1 ORDER BY created_at ASC, id ASC",
            &[SqlValue::Text(status.as_str().into())],
        )
    }
}
