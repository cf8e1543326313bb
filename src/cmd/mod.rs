//! CLI command implementations.
//!
//! | Module        | Commands handled |
//! |---------------|------------------|
//! | `run`         | `Run`            |
//! | `write`       | `Write`          |
//! | `batch`       | `Batch`          |
//! | `checkpoints` | `Checkpoints`    |
//! | `config`      | `Config`         |

pub mod batch;
pub mod checkpoints;
pub mod config;
pub mod run;
pub mod write;

pub use batch::cmd_batch;
pub use checkpoints::cmd_checkpoints;
pub use config::{cmd_config, cmd_config_init};
pub use run::cmd_run;
pub use write::cmd_write;

use anyhow::{Context, Result};
use scriptorium::checkpoint::{CheckpointManager, SqliteCheckpointStore};
use scriptorium::config::Config;
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;

/// Checkpoint manager over the configured SQLite database.
pub(crate) fn open_checkpoints(config: &Config) -> Result<CheckpointManager> {
    let store = SqliteCheckpointStore::open(config.db_path())
        .with_context(|| format!("Failed to open checkpoint db {}", config.db_path().display()))?;
    Ok(CheckpointManager::new(Arc::new(store)))
}

pub(crate) fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value)?;
    std::fs::write(path, json).with_context(|| format!("Failed to write {}", path.display()))?;
    eprintln!("{} {}", console::style("Wrote").dim(), path.display());
    Ok(())
}
