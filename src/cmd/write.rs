//! Multi-chapter writing (`scriptorium write`).

use anyhow::{Context, Result};
use console::style;
use scriptorium::chapters::ChapterRunner;
use scriptorium::config::Config;
use scriptorium::continuity::LlmStateExtractor;
use scriptorium::llm::TokenCounter;
use scriptorium::pipeline::build::{cli_client, renderer};
use scriptorium::pipeline::build_pipeline;
use serde::Deserialize;
use std::path::Path;
use std::sync::Arc;

#[derive(Deserialize)]
#[serde(untagged)]
enum PlanFile {
    Chapters { chapters: Vec<String> },
    List(Vec<String>),
}

/// Chapter prompts from a TOML (`chapters = [...]`) or JSON (array, or
/// `{"chapters": [...]}`) plan file.
pub(crate) fn load_plan(path: &Path) -> Result<Vec<String>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read plan {}", path.display()))?;
    let plan: PlanFile = match path.extension().and_then(|e| e.to_str()) {
        Some("json") => serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse plan {}", path.display()))?,
        _ => toml::from_str(&content)
            .with_context(|| format!("Failed to parse plan {}", path.display()))?,
    };
    let chapters = match plan {
        PlanFile::Chapters { chapters } | PlanFile::List(chapters) => chapters,
    };
    if chapters.is_empty() {
        anyhow::bail!("Plan {} lists no chapters", path.display());
    }
    Ok(chapters)
}

fn default_task_id(plan: &Path) -> String {
    plan.file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "work".to_string())
}

pub async fn cmd_write(
    config: &Config,
    plan: &Path,
    task_id: Option<&str>,
    out: Option<&Path>,
) -> Result<()> {
    let chapters = load_plan(plan)?;
    let task_id = task_id.map(str::to_string).unwrap_or_else(|| default_task_id(plan));

    let counter = TokenCounter::shared();
    let client = Arc::new(cli_client(&config.toml.llm, counter.clone()));
    let renderer = Arc::new(renderer(&config.toml.prompts)?);
    let pipeline = build_pipeline(&config.toml, client.clone(), renderer.clone())?;
    let runner = ChapterRunner::new(
        Arc::new(pipeline),
        Arc::new(LlmStateExtractor::new(client, renderer)),
        super::open_checkpoints(config)?,
        counter,
    );

    eprintln!(
        "{} '{}' ({} chapters)",
        style("Writing").cyan().bold(),
        task_id,
        chapters.len()
    );
    let result = runner.run(&task_id, &chapters).await?;

    if let Some(resumed) = result.resumed_from {
        eprintln!("  resumed after chapter {}", resumed);
    }
    for chapter in &result.chapters {
        let status = if chapter.restored() {
            style("restored").dim()
        } else {
            style("written").green()
        };
        eprintln!(
            "  chapter {:>2}: {} ({} tokens)",
            chapter.chapter_index + 1,
            status,
            chapter.tokens_used
        );
    }
    let worn: Vec<_> = result
        .state
        .motif_wear
        .iter()
        .filter(|m| m.wear_level >= scriptorium::continuity::WearLevel::Worn)
        .map(|m| m.motif.as_str())
        .collect();
    if !worn.is_empty() {
        eprintln!("  {} {}", style("worn motifs:").yellow(), worn.join(", "));
    }
    eprintln!("  total tokens: {}", result.total_tokens_used);

    match out {
        Some(path) => super::write_json(path, &result)?,
        None => println!("{}", result.full_text()),
    }
    Ok(())
}
