//! Single-prompt pipeline run (`scriptorium run`).

use anyhow::{Context, Result};
use console::style;
use scriptorium::chapters::PHASE_COMPLETED;
use scriptorium::config::Config;
use scriptorium::pipeline::PipelineOutcome;
use scriptorium::pipeline::build::live_pipeline;
use std::path::Path;

pub(crate) fn resolve_prompt(prompt: Option<&str>, prompt_file: Option<&Path>) -> Result<String> {
    let prompt = match (prompt, prompt_file) {
        (Some(p), _) => p.to_string(),
        (None, Some(path)) => std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read prompt file {}", path.display()))?,
        (None, None) => anyhow::bail!("Provide --prompt or --prompt-file"),
    };
    let prompt = prompt.trim().to_string();
    if prompt.is_empty() {
        anyhow::bail!("Prompt is empty");
    }
    Ok(prompt)
}

pub(crate) fn print_outcome(outcome: &PipelineOutcome) {
    eprintln!();
    eprintln!("{}", style("Pipeline complete").green().bold());
    if let Some(ref champion) = outcome.champion_id {
        eprintln!("  champion:     {}", champion);
    }
    eprintln!("  synthesized:  {}", outcome.synthesized);
    if let Some(ref compliance) = outcome.compliance {
        let score = format!("{:.2}", compliance.score);
        let score = if compliance.is_compliant {
            style(score).green()
        } else {
            style(score).yellow()
        };
        eprintln!("  compliance:   {} ({} violations)", score, compliance.violations.len());
    }
    eprintln!("  corrections:  {}", outcome.correction_attempts);
    if let Some(ref jury) = outcome.jury {
        eprintln!("  jury:         {:.2} ({})", jury.aggregated_score, if jury.passed { "passed" } else { "below bar" });
    }
    eprintln!("  retakes:      {}", outcome.reader_retake_count);
    eprintln!("  tokens:       {}", outcome.tokens_used);
    eprintln!();
}

pub async fn cmd_run(
    config: &Config,
    prompt: Option<&str>,
    prompt_file: Option<&Path>,
    task_id: Option<&str>,
    out: Option<&Path>,
) -> Result<()> {
    let prompt = resolve_prompt(prompt, prompt_file)?;
    let pipeline = live_pipeline(&config.toml)?;

    eprintln!(
        "{} {} stages",
        style("Running").cyan().bold(),
        pipeline.stage_names().len()
    );
    let outcome = pipeline.execute(&prompt, None).await?;

    if let Some(task_id) = task_id {
        let checkpoints = super::open_checkpoints(config)?;
        checkpoints
            .save_checkpoint(task_id, PHASE_COMPLETED, serde_json::to_value(&outcome)?, None)
            .await?;
    }

    print_outcome(&outcome);
    match out {
        Some(path) => super::write_json(path, &outcome)?,
        None => println!("{}", outcome.text),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_prompt_prefers_inline() {
        assert_eq!(resolve_prompt(Some("  a storm "), None).unwrap(), "a storm");
    }

    #[test]
    fn test_resolve_prompt_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("prompt.txt");
        std::fs::write(&path, "the lighthouse\n").unwrap();
        assert_eq!(resolve_prompt(None, Some(&path)).unwrap(), "the lighthouse");
    }

    #[test]
    fn test_resolve_prompt_rejects_blank() {
        assert!(resolve_prompt(Some("   "), None).is_err());
        assert!(resolve_prompt(None, None).is_err());
    }
}
