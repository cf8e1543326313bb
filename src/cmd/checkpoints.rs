//! Checkpoint inspection (`scriptorium checkpoints`).

use anyhow::Result;
use console::style;
use scriptorium::config::Config;

use super::super::CheckpointCommands;

pub async fn cmd_checkpoints(config: &Config, command: CheckpointCommands) -> Result<()> {
    let checkpoints = super::open_checkpoints(config)?;

    match command {
        CheckpointCommands::List { task_id } => {
            let history = checkpoints.history(&task_id).await?;
            if history.is_empty() {
                println!("No checkpoints for '{}'", task_id);
                return Ok(());
            }
            println!("{} ({} checkpoints)", style(&task_id).bold(), history.len());
            for checkpoint in history {
                let progress = if checkpoint.progress.is_null() {
                    String::new()
                } else {
                    checkpoint.progress.to_string()
                };
                println!(
                    "  {}  {:<18} {}  {}",
                    style(checkpoint.created_at.format("%Y-%m-%d %H:%M:%S")).dim(),
                    checkpoint.phase,
                    &checkpoint.id[..8.min(checkpoint.id.len())],
                    progress
                );
            }
        }
        CheckpointCommands::Show { task_id } => match checkpoints.get_resume_state(&task_id).await? {
            Some(state) => println!("{}", serde_json::to_string_pretty(&state)?),
            None => println!("No checkpoints for '{}'", task_id),
        },
        CheckpointCommands::Clear { task_id } => {
            let removed = checkpoints.clear_checkpoints(&task_id).await?;
            println!("Removed {} checkpoint(s) for '{}'", removed, task_id);
        }
    }

    Ok(())
}
