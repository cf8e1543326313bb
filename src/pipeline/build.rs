//! Assembles the standard pipeline from configuration.

use super::{
    ComplianceStage, CorrectionStage, Pipeline, ReaderJuryStage, RetakeStage, SynthesisStage,
    TournamentStage,
};
use crate::compliance::ComplianceChecker;
use crate::compliance::rules::{ForbiddenWordsRule, RepetitionRule, RhythmRule};
use crate::config::{LlmSection, PromptsSection, ScriptoriumToml, SynthesisMode};
use crate::correction::{CorrectionLoop, LlmCorrector};
use crate::generator::{Generator, LlmGenerator};
use crate::judge::{Judge, LlmJudge};
use crate::jury::{LlmPersona, PersonaEvaluator, ReaderJury};
use crate::llm::{ClaudeCliClient, ClaudeCliConfig, LlmClient, TokenCounter};
use crate::prompts::{PromptRenderer, TemplateRenderer};
use crate::retake::{LlmRetaker, RetakeLoop};
use crate::synthesis::plan::{LlmImprovementAnalyzer, LlmImprovementExecutor, PlanSynthesizer};
use crate::synthesis::{LlmSynthesizer, Synthesizer};
use crate::tournament::TournamentArena;
use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;

/// Wires model-backed components into the six standard stages.
///
/// Every component shares one client, so the client's counter sees all
/// usage of a run. Generators and the judge can be replaced, which is how
/// offline runs and tests pin the bracket.
pub struct PipelineBuilder<'a> {
    config: &'a ScriptoriumToml,
    client: Arc<dyn LlmClient>,
    renderer: Arc<dyn PromptRenderer>,
    generators: Option<Vec<Arc<dyn Generator>>>,
    judge: Option<Arc<dyn Judge>>,
}

impl<'a> PipelineBuilder<'a> {
    pub fn new(
        config: &'a ScriptoriumToml,
        client: Arc<dyn LlmClient>,
        renderer: Arc<dyn PromptRenderer>,
    ) -> Self {
        Self {
            config,
            client,
            renderer,
            generators: None,
            judge: None,
        }
    }

    pub fn with_generators(mut self, generators: Vec<Arc<dyn Generator>>) -> Self {
        self.generators = Some(generators);
        self
    }

    pub fn with_judge(mut self, judge: Arc<dyn Judge>) -> Self {
        self.judge = Some(judge);
        self
    }

    fn generators(&self) -> Vec<Arc<dyn Generator>> {
        if let Some(ref generators) = self.generators {
            return generators.clone();
        }
        self.config
            .tournament
            .generators
            .iter()
            .map(|spec| {
                let generator = LlmGenerator::new(&spec.id, self.client.clone(), self.renderer.clone())
                    .with_style(&spec.style)
                    .with_temperature(spec.temperature);
                Arc::new(generator) as Arc<dyn Generator>
            })
            .collect()
    }

    fn synthesizer(&self) -> Arc<dyn Synthesizer> {
        match self.config.synthesis.mode {
            SynthesisMode::Simple => Arc::new(LlmSynthesizer::new(self.client.clone(), self.renderer.clone())),
            SynthesisMode::Plan => Arc::new(PlanSynthesizer::new(
                Arc::new(LlmImprovementAnalyzer::new(self.client.clone(), self.renderer.clone())),
                Arc::new(LlmImprovementExecutor::new(self.client.clone(), self.renderer.clone())),
            )),
        }
    }

    fn checker(&self) -> Result<ComplianceChecker> {
        let section = &self.config.compliance;
        let forbidden = ForbiddenWordsRule::new(&section.forbidden_words)
            .context("Invalid compliance.forbidden_words")?;
        let mut checker = ComplianceChecker::new(section.threshold)
            .with_rule(Arc::new(forbidden))
            .with_rule(Arc::new(RhythmRule::new(section.rhythm_window)));
        if section.repetition_check {
            checker = checker.with_async_rule(Arc::new(RepetitionRule::new(
                self.client.clone(),
                self.renderer.clone(),
            )));
        }
        Ok(checker)
    }

    fn jury(&self) -> ReaderJury {
        let evaluators = self
            .config
            .jury
            .personas
            .iter()
            .map(|persona| {
                Arc::new(LlmPersona::new(persona.clone(), self.client.clone(), self.renderer.clone()))
                    as Arc<dyn PersonaEvaluator>
            })
            .collect();
        ReaderJury::new(evaluators, self.client.counter().clone())
            .with_pass_threshold(self.config.jury.pass_threshold)
    }

    pub fn build(self) -> Result<Pipeline> {
        let counter = self.client.counter().clone();
        let judge = self
            .judge
            .clone()
            .unwrap_or_else(|| Arc::new(LlmJudge::new(self.client.clone(), self.renderer.clone())));

        let arena = TournamentArena::new(self.generators(), judge.clone(), counter.clone());
        let checker = Arc::new(self.checker()?);
        let correction = CorrectionLoop::new(
            checker.clone(),
            Arc::new(LlmCorrector::new(self.client.clone(), self.renderer.clone())),
        )
        .with_max_attempts(self.config.correction.max_attempts);
        let retake = RetakeLoop::new(
            judge,
            Arc::new(LlmRetaker::new(self.client.clone(), self.renderer.clone())),
            counter,
        )
        .with_max_retakes(self.config.retake.max_retakes)
        .with_thresholds(self.config.retake.min_score, self.config.retake.min_voice);

        let pipeline = Pipeline::new()
            .with_stage(TournamentStage::new(arena))
            .with_stage(SynthesisStage::new(self.synthesizer()))
            .with_stage(ComplianceStage::new(checker))
            .with_stage(CorrectionStage::new(correction))
            .with_stage(ReaderJuryStage::new(self.jury()))
            .with_stage(RetakeStage::new(retake));
        tracing::debug!(stages = ?pipeline.stage_names(), "Pipeline assembled");
        Ok(pipeline)
    }
}

pub fn build_pipeline(
    config: &ScriptoriumToml,
    client: Arc<dyn LlmClient>,
    renderer: Arc<dyn PromptRenderer>,
) -> Result<Pipeline> {
    PipelineBuilder::new(config, client, renderer).build()
}

/// A CLI-backed client reporting to `counter`.
pub fn cli_client(section: &LlmSection, counter: Arc<TokenCounter>) -> ClaudeCliClient {
    let mut config = ClaudeCliConfig::default()
        .with_command(&section.command)
        .with_model(section.model.clone())
        .with_timeout(Duration::from_secs(section.timeout_secs));
    config.extra_args = section.extra_args.clone();
    ClaudeCliClient::new("claude", config, counter)
}

/// Built-in templates with any on-disk overrides applied.
pub fn renderer(section: &PromptsSection) -> Result<TemplateRenderer> {
    let renderer = TemplateRenderer::builtin();
    match section.overrides_dir {
        Some(ref dir) => renderer
            .with_overrides(dir)
            .with_context(|| format!("Failed to load prompt overrides from {}", dir.display())),
        None => Ok(renderer),
    }
}

/// A live pipeline with its own token counter.
pub fn live_pipeline(config: &ScriptoriumToml) -> Result<Pipeline> {
    let client = Arc::new(cli_client(&config.llm, TokenCounter::shared()));
    build_pipeline(config, client, Arc::new(renderer(&config.prompts)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn offline() -> (Arc<dyn LlmClient>, Arc<dyn PromptRenderer>) {
        (
            Arc::new(crate::llm::ScriptedClient::new(vec![])),
            Arc::new(TemplateRenderer::builtin()),
        )
    }

    #[test]
    fn test_default_pipeline_has_six_stages() {
        let config = ScriptoriumToml::default();
        let (client, renderer) = offline();
        let pipeline = build_pipeline(&config, client, renderer).unwrap();
        assert_eq!(
            pipeline.stage_names(),
            ["tournament", "synthesis", "compliance", "correction", "reader_jury", "retake"]
        );
    }

    #[tokio::test]
    async fn test_odd_bracket_fails_in_tournament_stage() {
        let mut config = ScriptoriumToml::default();
        config.tournament.generators.truncate(3);
        assert_eq!(config.tournament.generators.len(), 3);
        let (client, renderer) = offline();
        let pipeline = build_pipeline(&config, client, renderer).unwrap();
        let err = pipeline.execute("a storm", None).await.unwrap_err();
        assert!(matches!(
            err,
            crate::errors::PipelineError::StageFailed { stage: "tournament", .. }
        ));
    }

    #[test]
    fn test_cli_client_carries_section() {
        let section = LlmSection {
            command: "my-claude".to_string(),
            model: Some("opus".to_string()),
            timeout_secs: 12,
            extra_args: vec!["--verbose".to_string()],
        };
        let client = cli_client(&section, TokenCounter::shared());
        assert_eq!(client.config().command, "my-claude");
        assert_eq!(client.config().timeout, Duration::from_secs(12));
        assert_eq!(client.config().extra_args, ["--verbose"]);
    }

    #[test]
    fn test_renderer_applies_overrides() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(format!("{}.system.md", crate::prompts::names::GENERATE)),
            "You are a terse chronicler.",
        )
        .unwrap();
        let section = PromptsSection {
            overrides_dir: Some(dir.path().to_path_buf()),
        };
        let rendered = renderer(&section)
            .unwrap()
            .render(crate::prompts::names::GENERATE, &serde_json::json!({"prompt": "p", "style": ""}))
            .unwrap();
        assert_eq!(rendered.system, "You are a terse chronicler.");
    }
}
