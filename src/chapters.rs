//! Multi-chapter runs with continuity and checkpoint resume.
//!
//! Chapters are written strictly in order. After each one, continuity is
//! extracted and folded into the [`CrossChapterState`], and a
//! `chapter_complete` checkpoint records everything needed to pick up at the
//! next chapter.

use crate::checkpoint::{CheckpointManager, RESUME_PHASE_KEY};
use crate::continuity::{ChapterContext, CrossChapterState, StateExtractor, create_initial_state, update_state};
use crate::llm::TokenCounter;
use crate::pipeline::{Pipeline, PipelineOutcome};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;

pub const PHASE_CHAPTER_COMPLETE: &str = "chapter_complete";
pub const PHASE_COMPLETED: &str = "completed";

/// What a chapter checkpoint stores.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChapterProgress {
    pub cross_chapter_state: CrossChapterState,
    pub chapter_texts: Vec<String>,
    pub tokens_used: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChapterOutcome {
    pub chapter_index: usize,
    pub text: String,
    /// Tokens spent on this chapter in this run; 0 for restored chapters.
    pub tokens_used: u64,
    /// `None` when the chapter was restored from a checkpoint.
    pub pipeline: Option<PipelineOutcome>,
}

impl ChapterOutcome {
    pub fn restored(&self) -> bool {
        self.pipeline.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkResult {
    pub chapters: Vec<ChapterOutcome>,
    pub state: CrossChapterState,
    /// Tokens across all runs of this task, including resumed ones.
    pub total_tokens_used: u64,
    /// Number of chapters restored from a checkpoint.
    pub resumed_from: Option<usize>,
}

impl WorkResult {
    pub fn full_text(&self) -> String {
        self.chapters
            .iter()
            .map(|c| c.text.as_str())
            .collect::<Vec<_>>()
            .join("\n\n")
    }
}

pub struct ChapterRunner {
    pipeline: Arc<Pipeline>,
    extractor: Arc<dyn StateExtractor>,
    checkpoints: CheckpointManager,
    counter: Arc<TokenCounter>,
}

impl ChapterRunner {
    pub fn new(
        pipeline: Arc<Pipeline>,
        extractor: Arc<dyn StateExtractor>,
        checkpoints: CheckpointManager,
        counter: Arc<TokenCounter>,
    ) -> Self {
        Self {
            pipeline,
            extractor,
            checkpoints,
            counter,
        }
    }

    async fn restore(&self, task_id: &str) -> Result<Option<ChapterProgress>> {
        let Some(resume) = self.checkpoints.get_resume_state(task_id).await? else {
            return Ok(None);
        };
        let phase = resume[RESUME_PHASE_KEY].as_str().unwrap_or_default().to_string();
        let progress: ChapterProgress = serde_json::from_value(resume)
            .with_context(|| format!("Checkpoint for '{}' is not a chapter checkpoint", task_id))?;
        tracing::info!(
            task_id,
            phase = %phase,
            completed = progress.chapter_texts.len(),
            "Resuming from checkpoint"
        );
        Ok(Some(progress))
    }

    pub async fn run(&self, task_id: &str, chapter_prompts: &[String]) -> Result<WorkResult> {
        let total = chapter_prompts.len();
        let restored = self.restore(task_id).await?;
        let resumed_from = restored.as_ref().map(|p| p.chapter_texts.len());
        let mut progress = restored.unwrap_or_else(|| ChapterProgress {
            cross_chapter_state: create_initial_state(),
            ..Default::default()
        });

        if progress.chapter_texts.len() > total {
            anyhow::bail!(
                "Checkpoint for '{}' has {} chapters but the plan has only {}",
                task_id,
                progress.chapter_texts.len(),
                total
            );
        }

        let mut chapters: Vec<ChapterOutcome> = progress
            .chapter_texts
            .iter()
            .enumerate()
            .map(|(chapter_index, text)| ChapterOutcome {
                chapter_index,
                text: text.clone(),
                tokens_used: 0,
                pipeline: None,
            })
            .collect();

        let start = progress.chapter_texts.len();
        for (chapter_index, prompt) in chapter_prompts.iter().enumerate().skip(start) {
            let chapter = self
                .run_chapter(&mut progress, chapter_index, total, prompt)
                .await
                .with_context(|| format!("Chapter {} of {} failed", chapter_index + 1, total))?;

            self.checkpoints
                .save_checkpoint(
                    task_id,
                    PHASE_CHAPTER_COMPLETE,
                    serde_json::to_value(&progress)?,
                    Some(json!({
                        "completed_chapters": progress.chapter_texts.len(),
                        "total_chapters": total,
                    })),
                )
                .await?;
            chapters.push(chapter);
        }

        if start < total {
            self.checkpoints
                .save_checkpoint(
                    task_id,
                    PHASE_COMPLETED,
                    serde_json::to_value(&progress)?,
                    Some(json!({ "completed_chapters": total, "total_chapters": total })),
                )
                .await?;
            tracing::info!(task_id, chapters = total, tokens = progress.tokens_used, "Work complete");
        }

        Ok(WorkResult {
            chapters,
            state: progress.cross_chapter_state,
            total_tokens_used: progress.tokens_used,
            resumed_from,
        })
    }

    async fn run_chapter(
        &self,
        progress: &mut ChapterProgress,
        chapter_index: usize,
        total: usize,
        prompt: &str,
    ) -> Result<ChapterOutcome> {
        let context = ChapterContext::from_state(
            &progress.cross_chapter_state,
            chapter_index,
            total,
            progress.chapter_texts.last().cloned(),
        );
        tracing::info!(chapter = chapter_index + 1, total, "Writing chapter");
        let outcome = self.pipeline.execute(prompt, Some(context)).await?;

        let snapshot = self.counter.snapshot();
        let state = &progress.cross_chapter_state;
        let extraction = self
            .extractor
            .extract(
                &outcome.text,
                chapter_index,
                &state.known_motifs(),
                &state.known_characters(),
            )
            .await?;
        let tokens_used = outcome.tokens_used + snapshot.delta(&self.counter);

        progress.cross_chapter_state = update_state(state, &extraction, chapter_index);
        progress.chapter_texts.push(outcome.text.clone());
        progress.tokens_used += tokens_used;

        Ok(ChapterOutcome {
            chapter_index,
            text: outcome.text.clone(),
            tokens_used,
            pipeline: Some(outcome),
        })
    }
}
