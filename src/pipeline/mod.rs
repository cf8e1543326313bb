//! The generation pipeline: an ordered list of stages threading a
//! [`PipelineContext`].
//!
//! Default order is Tournament → Synthesis → Compliance → Correction →
//! ReaderJury → Retake. Each stage takes the context by value and returns a
//! new one in which only its own fields changed. A stage whose inputs are
//! missing passes the context through; it fails only on a genuine error.

pub mod build;
pub mod stages;

pub use build::{PipelineBuilder, build_pipeline};
pub use stages::{
    ComplianceStage, CorrectionStage, ReaderJuryStage, RetakeStage, SynthesisStage,
    TournamentStage,
};

use crate::compliance::ComplianceResult;
use crate::continuity::ChapterContext;
use crate::correction::CorrectionResult;
use crate::errors::PipelineError;
use crate::jury::ReaderJuryResult;
use crate::retake::RetakeResult;
use crate::synthesis::ImprovementPlan;
use crate::tournament::TournamentResult;
use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// State threaded through the stages of one run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineContext {
    pub prompt: String,
    pub text: String,
    pub tokens_used: u64,
    pub correction_attempts: u32,
    pub reader_retake_count: u32,
    pub synthesized: bool,
    /// Id of the tournament champion.
    pub champion: Option<String>,
    pub tournament_result: Option<TournamentResult>,
    pub compliance_result: Option<ComplianceResult>,
    pub correction_result: Option<CorrectionResult>,
    pub reader_jury_result: Option<ReaderJuryResult>,
    pub retake_result: Option<RetakeResult>,
    pub improvement_plan: Option<ImprovementPlan>,
    pub chapter_context: Option<ChapterContext>,
}

impl PipelineContext {
    pub fn new(prompt: &str) -> Self {
        Self {
            prompt: prompt.to_string(),
            ..Default::default()
        }
    }

    pub fn with_chapter_context(mut self, context: ChapterContext) -> Self {
        self.chapter_context = Some(context);
        self
    }

    /// The prompt as generators should see it, including continuity notes.
    pub fn effective_prompt(&self) -> String {
        match self.chapter_context {
            Some(ref context) => context.compose_prompt(&self.prompt),
            None => self.prompt.clone(),
        }
    }
}

#[async_trait]
pub trait Stage: Send + Sync {
    fn name(&self) -> &'static str;
    async fn run(&self, context: PipelineContext) -> Result<PipelineContext>;
}

/// Final result of a pipeline run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineOutcome {
    pub text: String,
    pub tokens_used: u64,
    pub correction_attempts: u32,
    pub reader_retake_count: u32,
    pub synthesized: bool,
    pub champion_id: Option<String>,
    pub compliance: Option<ComplianceResult>,
    pub jury: Option<ReaderJuryResult>,
}

impl From<PipelineContext> for PipelineOutcome {
    fn from(context: PipelineContext) -> Self {
        Self {
            text: context.text,
            tokens_used: context.tokens_used,
            correction_attempts: context.correction_attempts,
            reader_retake_count: context.reader_retake_count,
            synthesized: context.synthesized,
            champion_id: context.champion,
            compliance: context.compliance_result,
            jury: context.reader_jury_result,
        }
    }
}

#[derive(Default)]
pub struct Pipeline {
    stages: Vec<Box<dyn Stage>>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_stage(mut self, stage: impl Stage + 'static) -> Self {
        self.stages.push(Box::new(stage));
        self
    }

    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    /// Run every stage in order.
    pub async fn run(&self, context: PipelineContext) -> Result<PipelineContext, PipelineError> {
        let mut context = context;
        for stage in &self.stages {
            let before = context.tokens_used;
            context = stage
                .run(context)
                .await
                .map_err(|source| PipelineError::StageFailed {
                    stage: stage.name(),
                    source,
                })?;
            tracing::debug!(
                stage = stage.name(),
                tokens = context.tokens_used - before,
                "Stage finished"
            );
        }
        Ok(context)
    }

    /// Run a prompt from scratch, optionally as one chapter of a longer work.
    pub async fn execute(
        &self,
        prompt: &str,
        chapter_context: Option<ChapterContext>,
    ) -> Result<PipelineOutcome, PipelineError> {
        let mut context = PipelineContext::new(prompt);
        context.chapter_context = chapter_context;
        let context = self.run(context).await?;
        tracing::info!(
            tokens = context.tokens_used,
            corrections = context.correction_attempts,
            retakes = context.reader_retake_count,
            synthesized = context.synthesized,
            "Pipeline complete"
        );
        Ok(context.into())
    }
}
