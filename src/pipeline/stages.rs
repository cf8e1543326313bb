//! The six standard pipeline stages.

use super::{PipelineContext, Stage};
use crate::compliance::ComplianceChecker;
use crate::correction::CorrectionLoop;
use crate::jury::ReaderJury;
use crate::retake::RetakeLoop;
use crate::synthesis::{SynthesisInput, Synthesizer};
use crate::tournament::TournamentArena;
use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;

/// Runs the bracket and seeds the context with the champion's text.
pub struct TournamentStage {
    arena: TournamentArena,
}

impl TournamentStage {
    pub fn new(arena: TournamentArena) -> Self {
        Self { arena }
    }
}

#[async_trait]
impl Stage for TournamentStage {
    fn name(&self) -> &'static str {
        "tournament"
    }

    async fn run(&self, context: PipelineContext) -> Result<PipelineContext> {
        if context.tournament_result.is_some() || context.prompt.trim().is_empty() {
            return Ok(context);
        }

        let result = self.arena.run_tournament(&context.effective_prompt()).await?;
        Ok(PipelineContext {
            text: result.champion_text.clone(),
            champion: Some(result.champion_id.clone()),
            tokens_used: context.tokens_used + result.total_tokens_used,
            tournament_result: Some(result),
            ..context
        })
    }
}

pub struct SynthesisStage {
    synthesizer: Arc<dyn Synthesizer>,
}

impl SynthesisStage {
    pub fn new(synthesizer: Arc<dyn Synthesizer>) -> Self {
        Self { synthesizer }
    }
}

#[async_trait]
impl Stage for SynthesisStage {
    fn name(&self) -> &'static str {
        "synthesis"
    }

    async fn run(&self, context: PipelineContext) -> Result<PipelineContext> {
        let Some(ref tournament) = context.tournament_result else {
            return Ok(context);
        };

        let result = self
            .synthesizer
            .synthesize(&SynthesisInput::from_tournament(tournament))
            .await?;
        if !result.applied {
            return Ok(context);
        }

        Ok(PipelineContext {
            text: result.synthesized_text,
            synthesized: true,
            tokens_used: context.tokens_used + result.tokens_used,
            improvement_plan: result.plan,
            ..context
        })
    }
}

/// Scores the current text. Model-backed rules run only when there is
/// chapter history to compare against.
pub struct ComplianceStage {
    checker: Arc<ComplianceChecker>,
}

impl ComplianceStage {
    pub fn new(checker: Arc<ComplianceChecker>) -> Self {
        Self { checker }
    }
}

#[async_trait]
impl Stage for ComplianceStage {
    fn name(&self) -> &'static str {
        "compliance"
    }

    async fn run(&self, context: PipelineContext) -> Result<PipelineContext> {
        if context.text.is_empty() {
            return Ok(context);
        }

        let result = match context.chapter_context.as_ref().filter(|c| c.has_history()) {
            Some(chapter) => {
                self.checker
                    .check_with_context(&context.text, Some(chapter))
                    .await?
            }
            None => self.checker.check(&context.text),
        };
        tracing::info!(
            score = result.score,
            violations = result.violations.len(),
            compliant = result.is_compliant,
            "Compliance checked"
        );

        Ok(PipelineContext {
            tokens_used: context.tokens_used + result.tokens_used,
            compliance_result: Some(result),
            ..context
        })
    }
}

pub struct CorrectionStage {
    correction: CorrectionLoop,
}

impl CorrectionStage {
    pub fn new(correction: CorrectionLoop) -> Self {
        Self { correction }
    }
}

#[async_trait]
impl Stage for CorrectionStage {
    fn name(&self) -> &'static str {
        "correction"
    }

    async fn run(&self, context: PipelineContext) -> Result<PipelineContext> {
        match context.compliance_result {
            Some(ref compliance) if !compliance.is_compliant => {}
            _ => return Ok(context),
        }

        let result = self
            .correction
            .run(&context.text, None, context.chapter_context.as_ref())
            .await?;
        if !result.success {
            tracing::warn!(
                attempts = result.attempts,
                score = result.final_compliance.score,
                "Shipping best-effort correction"
            );
        }

        Ok(PipelineContext {
            text: result.final_text.clone(),
            correction_attempts: context.correction_attempts + result.attempts,
            tokens_used: context.tokens_used + result.total_tokens_used,
            compliance_result: Some(result.final_compliance.clone()),
            correction_result: Some(result),
            ..context
        })
    }
}

pub struct ReaderJuryStage {
    jury: ReaderJury,
}

impl ReaderJuryStage {
    pub fn new(jury: ReaderJury) -> Self {
        Self { jury }
    }
}

#[async_trait]
impl Stage for ReaderJuryStage {
    fn name(&self) -> &'static str {
        "reader_jury"
    }

    async fn run(&self, context: PipelineContext) -> Result<PipelineContext> {
        if context.text.is_empty() {
            return Ok(context);
        }

        let result = self.jury.evaluate(&context.text).await?;
        Ok(PipelineContext {
            tokens_used: context.tokens_used + result.tokens_used,
            reader_jury_result: Some(result),
            ..context
        })
    }
}

/// Rewrites texts the jury rejected, seeded with the readers' feedback.
pub struct RetakeStage {
    retake: RetakeLoop,
}

impl RetakeStage {
    pub fn new(retake: RetakeLoop) -> Self {
        Self { retake }
    }
}

#[async_trait]
impl Stage for RetakeStage {
    fn name(&self) -> &'static str {
        "retake"
    }

    async fn run(&self, context: PipelineContext) -> Result<PipelineContext> {
        let feedback = match context.reader_jury_result {
            Some(ref jury) if !jury.passed => jury.feedback_text(),
            _ => return Ok(context),
        };

        let initial = Some(feedback.as_str()).filter(|f| !f.is_empty());
        let result = self.retake.run(&context.text, initial).await?;

        Ok(PipelineContext {
            text: result.final_text.clone(),
            reader_retake_count: context.reader_retake_count + result.retake_count,
            tokens_used: context.tokens_used + result.total_tokens_used,
            retake_result: Some(result),
            ..context
        })
    }
}
