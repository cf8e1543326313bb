//! SQLite-backed checkpoint store.

use super::{Checkpoint, CheckpointStore};
use crate::errors::CheckpointError;
use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use std::path::Path;
use std::sync::Arc;

/// Async-safe handle to the checkpoint database.
///
/// All access runs on tokio's blocking pool so SQLite I/O never stalls the
/// async workers.
#[derive(Clone)]
pub struct SqliteCheckpointStore {
    inner: Arc<std::sync::Mutex<CheckpointDb>>,
}

impl SqliteCheckpointStore {
    /// Open (or create) the database at `path`, creating parent directories.
    pub fn open(path: &Path) -> Result<Self, CheckpointError> {
        Ok(Self::wrap(CheckpointDb::new(path)?))
    }

    pub fn in_memory() -> Result<Self, CheckpointError> {
        Ok(Self::wrap(CheckpointDb::new_in_memory()?))
    }

    fn wrap(db: CheckpointDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    async fn call<F, R>(&self, f: F) -> Result<R, CheckpointError>
    where
        F: FnOnce(&CheckpointDb) -> Result<R, CheckpointError> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db.lock().map_err(|_| CheckpointError::LockPoisoned)?;
            f(&guard)
        })
        .await
        .map_err(|_| CheckpointError::TaskPanicked)?
    }
}

#[async_trait]
impl CheckpointStore for SqliteCheckpointStore {
    async fn create(&self, checkpoint: Checkpoint) -> Result<Checkpoint, CheckpointError> {
        self.call(move |db| {
            db.insert(&checkpoint)?;
            Ok(checkpoint)
        })
        .await
    }

    async fn find_latest(&self, task_id: &str) -> Result<Option<Checkpoint>, CheckpointError> {
        let task_id = task_id.to_string();
        self.call(move |db| db.latest(&task_id)).await
    }

    async fn find_all(&self, task_id: &str) -> Result<Vec<Checkpoint>, CheckpointError> {
        let task_id = task_id.to_string();
        self.call(move |db| db.all(&task_id)).await
    }

    async fn delete_by_task(&self, task_id: &str) -> Result<usize, CheckpointError> {
        let task_id = task_id.to_string();
        self.call(move |db| db.delete(&task_id)).await
    }
}

const SELECT_COLUMNS: &str =
    "SELECT checkpoint_id, task_id, phase, progress, state, created_at FROM checkpoints";

struct CheckpointRow {
    checkpoint_id: String,
    task_id: String,
    phase: String,
    progress: String,
    state: String,
    created_at: String,
}

impl CheckpointRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            checkpoint_id: row.get(0)?,
            task_id: row.get(1)?,
            phase: row.get(2)?,
            progress: row.get(3)?,
            state: row.get(4)?,
            created_at: row.get(5)?,
        })
    }

    fn into_checkpoint(self) -> Result<Checkpoint, CheckpointError> {
        let created_at = DateTime::parse_from_rfc3339(&self.created_at)
            .with_context(|| format!("Invalid created_at '{}'", self.created_at))
            .map_err(CheckpointError::Database)?
            .with_timezone(&Utc);
        Ok(Checkpoint {
            id: self.checkpoint_id,
            task_id: self.task_id,
            phase: self.phase,
            progress: serde_json::from_str(&self.progress)?,
            state: serde_json::from_str(&self.state)?,
            created_at,
        })
    }
}

pub struct CheckpointDb {
    conn: Connection,
}

impl CheckpointDb {
    pub fn new(path: &Path) -> Result<Self, CheckpointError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))
                .map_err(CheckpointError::Database)?;
        }
        let conn = Connection::open(path)?;
        let db = Self { conn };
        db.run_migrations()?;
        Ok(db)
    }

    pub fn new_in_memory() -> Result<Self, CheckpointError> {
        let db = Self {
            conn: Connection::open_in_memory()?,
        };
        db.run_migrations()?;
        Ok(db)
    }

    fn run_migrations(&self) -> Result<(), CheckpointError> {
        self.conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS checkpoints (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                checkpoint_id TEXT NOT NULL UNIQUE,
                task_id TEXT NOT NULL,
                phase TEXT NOT NULL,
                progress TEXT NOT NULL,
                state TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_checkpoints_task ON checkpoints(task_id, id);",
        )?;
        Ok(())
    }

    pub fn insert(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        self.conn.execute(
            "INSERT INTO checkpoints (checkpoint_id, task_id, phase, progress, state, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                checkpoint.id,
                checkpoint.task_id,
                checkpoint.phase,
                serde_json::to_string(&checkpoint.progress)?,
                serde_json::to_string(&checkpoint.state)?,
                checkpoint.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn latest(&self, task_id: &str) -> Result<Option<Checkpoint>, CheckpointError> {
        let row = self
            .conn
            .query_row(
                &format!("{} WHERE task_id = ?1 ORDER BY id DESC LIMIT 1", SELECT_COLUMNS),
                params![task_id],
                CheckpointRow::from_row,
            )
            .optional()?;
        row.map(CheckpointRow::into_checkpoint).transpose()
    }

    pub fn all(&self, task_id: &str) -> Result<Vec<Checkpoint>, CheckpointError> {
        let mut stmt = self
            .conn
            .prepare(&format!("{} WHERE task_id = ?1 ORDER BY id ASC", SELECT_COLUMNS))?;
        let rows = stmt
            .query_map(params![task_id], CheckpointRow::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter().map(CheckpointRow::into_checkpoint).collect()
    }

    pub fn delete(&self, task_id: &str) -> Result<usize, CheckpointError> {
        Ok(self
            .conn
            .execute("DELETE FROM checkpoints WHERE task_id = ?1", params![task_id])?)
    }
}
