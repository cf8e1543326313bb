//! Directory batch runs (`scriptorium batch`).

use anyhow::{Context, Result};
use console::style;
use scriptorium::batch::{BatchRunner, BatchTask, TaskOutcome};
use scriptorium::config::Config;
use scriptorium::pipeline::build::live_pipeline;
use std::path::Path;
use std::sync::Arc;

/// One task per non-empty `*.txt` file, named by file stem, in name order.
pub(crate) fn collect_tasks(dir: &Path) -> Result<Vec<BatchTask>> {
    let entries = std::fs::read_dir(dir)
        .with_context(|| format!("Failed to read batch directory {}", dir.display()))?;
    let mut paths = Vec::new();
    for entry in entries {
        let path = entry?.path();
        if path.is_file() && path.extension().is_some_and(|e| e == "txt") {
            paths.push(path);
        }
    }
    paths.sort();

    let mut tasks = Vec::with_capacity(paths.len());
    for path in paths {
        let prompt = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let prompt = prompt.trim();
        if prompt.is_empty() {
            tracing::warn!(path = %path.display(), "Skipping empty prompt file");
            continue;
        }
        let id = path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_default();
        tasks.push(BatchTask::new(&id, prompt));
    }
    Ok(tasks)
}

pub async fn cmd_batch(
    config: &Config,
    dir: &Path,
    max_workers: Option<usize>,
    out: Option<&Path>,
) -> Result<()> {
    let tasks = collect_tasks(dir)?;
    if tasks.is_empty() {
        eprintln!("No *.txt prompts found in {}", dir.display());
        return Ok(());
    }

    let toml = config.toml.clone();
    let runner = BatchRunner::new(
        Arc::new(move || live_pipeline(&toml)),
        max_workers.unwrap_or(config.toml.batch.max_workers),
    );
    eprintln!(
        "{} {} prompts with {} workers",
        style("Batch").cyan().bold(),
        tasks.len(),
        runner.max_workers()
    );

    let summary = runner.run(tasks).await;
    for report in &summary.reports {
        match report.outcome {
            TaskOutcome::Succeeded { ref outcome } => eprintln!(
                "  {} {} ({} tokens)",
                style("✓").green(),
                report.task_id,
                outcome.tokens_used
            ),
            TaskOutcome::Failed { ref error } => {
                eprintln!("  {} {}: {}", style("✗").red(), report.task_id, error)
            }
        }
    }
    eprintln!(
        "{} succeeded, {} failed, {} tokens",
        summary.succeeded, summary.failed, summary.total_tokens_used
    );

    if let Some(path) = out {
        super::write_json(path, &summary)?;
    }
    if summary.failed > 0 {
        anyhow::bail!("{} of {} tasks failed", summary.failed, summary.reports.len());
    }
    Ok(())
}
