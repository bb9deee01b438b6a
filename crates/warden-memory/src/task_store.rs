//! SQLite task and step persistence.
//!
//! # Storage layout
//!
//! | table   | columns |
//! |---------|---------|
//! | `tasks` | `id` (UUID, primary key), `goal`, `description`, `status`, `state` (JSON [`TaskState`][warden_types::TaskState] including any checkpoint), `created_at`, `updated_at` |
//! | `steps` | `id` (UUID, primary key), `task_id`, `sequence`, `title`, `status`, `body` (JSON [`Step`]), `created_at`, `updated_at` |
//!
//! Timestamps are RFC-3339 UTC with fixed microsecond precision, so string
//! order is time order.
//!
//! # Example
//!
//! ```rust
//! use warden_memory::SqliteTaskStore;
//! use warden_runtime::TaskStore;
//! use warden_types::Task;
//!
//! let store = SqliteTaskStore::open_in_memory().unwrap();
//! let task = Task::new("summarize the logs", "");
//! store.save_task(&task).unwrap();
//! assert_eq!(store.load_task(task.id).unwrap().goal, "summarize the logs");
//! ```

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use tracing::{debug, info};
use uuid::Uuid;
use warden_runtime::TaskStore;
use warden_types::{Step, Task, TaskStatus, WardenError};

use crate::error::StoreError;

pub(crate) fn timestamp(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn bad_column(index: usize, message: impl Into<String>) -> rusqlite::Error {
    rusqlite::Error::InvalidColumnType(index, message.into(), rusqlite::types::Type::Text)
}

/// SQLite-backed [`TaskStore`].
pub struct SqliteTaskStore {
    conn: Mutex<Connection>,
}

impl SqliteTaskStore {
    /// Open (or create) the database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        info!(path = %path.display(), "opening task store");
        Self::init(Connection::open(path)?)
    }

    /// Open a temporary in-memory database (useful for testing).
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS tasks (
                id          TEXT NOT NULL PRIMARY KEY,
                goal        TEXT NOT NULL,
                description TEXT NOT NULL,
                status      TEXT NOT NULL,
                state       TEXT NOT NULL,
                created_at  TEXT NOT NULL,
                updated_at  TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS steps (
                id          TEXT NOT NULL PRIMARY KEY,
                task_id     TEXT NOT NULL,
                sequence    INTEGER NOT NULL,
                title       TEXT NOT NULL,
                status      TEXT NOT NULL,
                body        TEXT NOT NULL,
                created_at  TEXT NOT NULL,
                updated_at  TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS steps_by_task ON steps (task_id, sequence);",
        )?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }

    fn put_task(&self, task: &Task) -> Result<(), StoreError> {
        let state = serde_json::to_string(&task.state)?;
        self.conn()?.execute(
            "INSERT OR REPLACE INTO tasks (id, goal, description, status, state, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                task.id.to_string(),
                task.goal,
                task.description,
                task.status.as_str(),
                state,
                timestamp(&task.created_at),
                timestamp(&task.updated_at),
            ],
        )?;
        debug!(task_id = %task.id, status = %task.status, "task saved");
        Ok(())
    }

    fn get_task(&self, id: Uuid) -> Result<Task, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, goal, description, status, state, created_at, updated_at
             FROM tasks WHERE id = ?1",
        )?;
        stmt.query_row(params![id.to_string()], row_to_task)
            .optional()?
            .ok_or(StoreError::NotFound(id))
    }

    fn all_tasks(&self) -> Result<Vec<Task>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, goal, description, status, state, created_at, updated_at
             FROM tasks ORDER BY updated_at DESC",
        )?;
        let rows = stmt.query_map([], row_to_task)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    fn put_step(&self, step: &Step) -> Result<(), StoreError> {
        let body = serde_json::to_string(step)?;
        self.conn()?.execute(
            "INSERT OR REPLACE INTO steps (id, task_id, sequence, title, status, body, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                step.id.to_string(),
                step.task_id.to_string(),
                step.sequence,
                step.title,
                step.status.as_str(),
                body,
                timestamp(&step.created_at),
                timestamp(&step.updated_at),
            ],
        )?;
        Ok(())
    }

    fn task_steps(&self, task_id: Uuid) -> Result<Vec<Step>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT body FROM steps WHERE task_id = ?1 ORDER BY sequence ASC")?;
        let bodies = stmt
            .query_map(params![task_id.to_string()], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        bodies
            .iter()
            .map(|body| serde_json::from_str(body).map_err(StoreError::from))
            .collect()
    }
}

fn row_to_task(row: &rusqlite::Row<'_>) -> rusqlite::Result<Task> {
    let id: String = row.get(0)?;
    let status: String = row.get(3)?;
    let state: String = row.get(4)?;
    let created_at: String = row.get(5)?;
    let updated_at: String = row.get(6)?;
    Ok(Task {
        id: Uuid::parse_str(&id).map_err(|e| bad_column(0, e.to_string()))?,
        goal: row.get(1)?,
        description: row.get(2)?,
        status: status
            .parse::<TaskStatus>()
            .map_err(|e| bad_column(3, e.to_string()))?,
        state: serde_json::from_str(&state).map_err(|e| bad_column(4, e.to_string()))?,
        created_at: created_at
            .parse()
            .map_err(|e: chrono::ParseError| bad_column(5, e.to_string()))?,
        updated_at: updated_at
            .parse()
            .map_err(|e: chrono::ParseError| bad_column(6, e.to_string()))?,
    })
}

impl TaskStore for SqliteTaskStore {
    fn load_task(&self, id: Uuid) -> Result<Task, WardenError> {
        Ok(self.get_task(id)?)
    }

    fn save_task(&self, task: &Task) -> Result<(), WardenError> {
        Ok(self.put_task(task)?)
    }

    fn save_step(&self, step: &Step) -> Result<(), WardenError> {
        Ok(self.put_step(step)?)
    }

    fn steps(&self, task_id: Uuid) -> Result<Vec<Step>, WardenError> {
        Ok(self.task_steps(task_id)?)
    }

    fn list_tasks(&self) -> Result<Vec<Task>, WardenError> {
        Ok(self.all_tasks()?)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
