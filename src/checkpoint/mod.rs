//! Durable resume points.
//!
//! Checkpoints are append-only records of `{phase, progress, state}` per
//! task. "Latest" means last inserted, not newest timestamp, so rapid
//! successive saves stay ordered.

pub mod sqlite;

pub use sqlite::SqliteCheckpointStore;

use crate::errors::CheckpointError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::{Arc, Mutex};

/// Key added to resume state holding the checkpoint's phase.
pub const RESUME_PHASE_KEY: &str = "_phase";
/// Key added to resume state holding the checkpoint's progress.
pub const RESUME_PROGRESS_KEY: &str = "_progress";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: String,
    pub task_id: String,
    pub phase: String,
    pub progress: Value,
    pub state: Value,
    pub created_at: DateTime<Utc>,
}

impl Checkpoint {
    pub fn new(task_id: &str, phase: &str, state: Value, progress: Option<Value>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            task_id: task_id.to_string(),
            phase: phase.to_string(),
            progress: progress.unwrap_or(Value::Null),
            state,
            created_at: Utc::now(),
        }
    }
}

/// Append-only checkpoint persistence keyed by task id.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn create(&self, checkpoint: Checkpoint) -> Result<Checkpoint, CheckpointError>;
    async fn find_latest(&self, task_id: &str) -> Result<Option<Checkpoint>, CheckpointError>;
    /// All checkpoints for a task in insertion order.
    async fn find_all(&self, task_id: &str) -> Result<Vec<Checkpoint>, CheckpointError>;
    /// Returns the number of checkpoints removed.
    async fn delete_by_task(&self, task_id: &str) -> Result<usize, CheckpointError>;
}

/// Process-local store for tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    rows: Mutex<Vec<Checkpoint>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn rows(&self) -> Result<std::sync::MutexGuard<'_, Vec<Checkpoint>>, CheckpointError> {
        self.rows.lock().map_err(|_| CheckpointError::LockPoisoned)
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn create(&self, checkpoint: Checkpoint) -> Result<Checkpoint, CheckpointError> {
        self.rows()?.push(checkpoint.clone());
        Ok(checkpoint)
    }

    async fn find_latest(&self, task_id: &str) -> Result<Option<Checkpoint>, CheckpointError> {
        Ok(self.rows()?.iter().rev().find(|c| c.task_id == task_id).cloned())
    }

    async fn find_all(&self, task_id: &str) -> Result<Vec<Checkpoint>, CheckpointError> {
        Ok(self
            .rows()?
            .iter()
            .filter(|c| c.task_id == task_id)
            .cloned()
            .collect())
    }

    async fn delete_by_task(&self, task_id: &str) -> Result<usize, CheckpointError> {
        let mut rows = self.rows()?;
        let before = rows.len();
        rows.retain(|c| c.task_id != task_id);
        Ok(before - rows.len())
    }
}

/// Task-level checkpoint operations over a store.
#[derive(Clone)]
pub struct CheckpointManager {
    store: Arc<dyn CheckpointStore>,
}

impl CheckpointManager {
    pub fn new(store: Arc<dyn CheckpointStore>) -> Self {
        Self { store }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryCheckpointStore::new()))
    }

    pub async fn save_checkpoint(
        &self,
        task_id: &str,
        phase: &str,
        state: Value,
        progress: Option<Value>,
    ) -> Result<Checkpoint, CheckpointError> {
        let checkpoint = self
            .store
            .create(Checkpoint::new(task_id, phase, state, progress))
            .await?;
        tracing::debug!(task_id, phase, checkpoint_id = %checkpoint.id, "Checkpoint saved");
        Ok(checkpoint)
    }

    pub async fn get_latest_checkpoint(&self, task_id: &str) -> Result<Option<Checkpoint>, CheckpointError> {
        self.store.find_latest(task_id).await
    }

    pub async fn history(&self, task_id: &str) -> Result<Vec<Checkpoint>, CheckpointError> {
        self.store.find_all(task_id).await
    }

    pub async fn can_resume(&self, task_id: &str) -> Result<bool, CheckpointError> {
        Ok(self.store.find_latest(task_id).await?.is_some())
    }

    /// Latest state with `_phase` and `_progress` merged in.
    ///
    /// Works on a copy; the stored checkpoint is never modified. A non-object
    /// state is nested under `"state"`.
    pub async fn get_resume_state(&self, task_id: &str) -> Result<Option<Value>, CheckpointError> {
        let Some(checkpoint) = self.store.find_latest(task_id).await? else {
            return Ok(None);
        };
        Ok(Some(resume_state(&checkpoint)))
    }

    pub async fn clear_checkpoints(&self, task_id: &str) -> Result<usize, CheckpointError> {
        let removed = self.store.delete_by_task(task_id).await?;
        tracing::info!(task_id, removed, "Checkpoints cleared");
        Ok(removed)
    }
}

pub fn resume_state(checkpoint: &Checkpoint) -> Value {
    let mut merged = match &checkpoint.state {
        Value::Object(map) => map.clone(),
        other => {
            let mut map = Map::new();
            map.insert("state".to_string(), other.clone());
            map
        }
    };
    merged.insert(RESUME_PHASE_KEY.to_string(), Value::String(checkpoint.phase.clone()));
    merged.insert(RESUME_PROGRESS_KEY.to_string(), checkpoint.progress.clone());
    Value::Object(merged)
}
