//! Blending non-champion strengths into the tournament champion.
//!
//! Two variants share the [`Synthesizer`] seam:
//! - [`LlmSynthesizer`]: one rewrite call that weaves praised excerpts into
//!   the champion text.
//! - [`plan::PlanSynthesizer`]: an analysis pass producing an
//!   [`plan::ImprovementPlan`] followed by an execution pass.
//!
//! Both return the champion text untouched, at zero cost, when no other
//! writer received praise in any match.

pub mod plan;

pub use plan::{
    ImprovementAction, ImprovementAnalyzer, ImprovementExecutor, ImprovementPlan,
    LlmImprovementAnalyzer, LlmImprovementExecutor, PlanSynthesizer,
};

use crate::generator::GenerationResult;
use crate::llm::{CompletionRequest, LlmClient};
use crate::prompts::{PromptRenderer, names};
use crate::tournament::{MatchResult, TournamentResult};
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;

/// Everything a synthesizer may draw from.
#[derive(Debug, Clone, Copy)]
pub struct SynthesisInput<'a> {
    pub champion_text: &'a str,
    pub champion_id: &'a str,
    pub all_generations: &'a [GenerationResult],
    pub rounds: &'a [MatchResult],
}

impl<'a> SynthesisInput<'a> {
    pub fn from_tournament(result: &'a TournamentResult) -> Self {
        Self {
            champion_text: &result.champion_text,
            champion_id: &result.champion_id,
            all_generations: &result.all_generations,
            rounds: &result.rounds,
        }
    }
}

/// Output of the single-pass variant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SynthesisOutput {
    pub synthesized_text: String,
    pub tokens_used: u64,
}

/// Output of any synthesizer, with the plan when one was produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SynthesisV2Result {
    pub synthesized_text: String,
    pub tokens_used: u64,
    pub plan: Option<ImprovementPlan>,
    /// Whether a rewrite was actually issued.
    #[serde(default)]
    pub applied: bool,
}

impl SynthesisV2Result {
    fn unchanged(champion_text: &str) -> Self {
        Self {
            synthesized_text: champion_text.to_string(),
            tokens_used: 0,
            plan: None,
            applied: false,
        }
    }
}

/// What one losing writer contributed across the matches they played.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contribution {
    pub writer_id: String,
    pub excerpts: Vec<String>,
    pub reasoning: Vec<String>,
}

/// Gather praised excerpts and judge reasoning for every non-champion.
///
/// Writers appear in generation order. Writers without any praised excerpt
/// are omitted.
pub fn collect_contributions(
    champion_id: &str,
    all_generations: &[GenerationResult],
    rounds: &[MatchResult],
) -> Vec<Contribution> {
    all_generations
        .iter()
        .filter(|g| g.generator_id != champion_id)
        .filter_map(|g| {
            let mut excerpts = Vec::new();
            let mut reasoning = Vec::new();
            for m in rounds {
                let Some(side) = m.side_of(&g.generator_id) else {
                    continue;
                };
                excerpts.extend(m.judge_result.excerpts_for(side).iter().cloned());
                if !m.judge_result.reasoning.is_empty() {
                    reasoning.push(m.judge_result.reasoning.clone());
                }
            }
            if excerpts.is_empty() {
                return None;
            }
            Some(Contribution {
                writer_id: g.generator_id.clone(),
                excerpts,
                reasoning,
            })
        })
        .collect()
}

/// Weaknesses the judge noted about the champion in its own matches.
pub fn champion_weaknesses(champion_id: &str, rounds: &[MatchResult]) -> Vec<String> {
    rounds
        .iter()
        .filter_map(|m| {
            m.side_of(champion_id)
                .map(|side| m.judge_result.weaknesses_for(side).to_vec())
        })
        .flatten()
        .collect()
}

#[async_trait]
pub trait Synthesizer: Send + Sync {
    async fn synthesize(&self, input: &SynthesisInput<'_>) -> Result<SynthesisV2Result>;
}

/// Single-pass synthesizer backed by a model call.
pub struct LlmSynthesizer {
    client: Arc<dyn LlmClient>,
    renderer: Arc<dyn PromptRenderer>,
}

impl LlmSynthesizer {
    pub fn new(client: Arc<dyn LlmClient>, renderer: Arc<dyn PromptRenderer>) -> Self {
        Self { client, renderer }
    }

    pub async fn synthesize_text(
        &self,
        champion_text: &str,
        champion_id: &str,
        all_generations: &[GenerationResult],
        rounds: &[MatchResult],
    ) -> Result<SynthesisOutput> {
        let contributions = collect_contributions(champion_id, all_generations, rounds);
        if contributions.is_empty() {
            tracing::debug!(champion = champion_id, "No praised excerpts, synthesis skipped");
            return Ok(SynthesisOutput {
                synthesized_text: champion_text.to_string(),
                tokens_used: 0,
            });
        }
        self.rewrite(champion_text, champion_id, &contributions).await
    }

    /// One model call blending `contributions` into the champion.
    async fn rewrite(
        &self,
        champion_text: &str,
        champion_id: &str,
        contributions: &[Contribution],
    ) -> Result<SynthesisOutput> {
        let excerpts: Vec<String> = contributions
            .iter()
            .flat_map(|c| c.excerpts.iter().map(move |e| format!("{}: {}", c.writer_id, e)))
            .collect();
        let reasoning: Vec<String> = contributions
            .iter()
            .flat_map(|c| c.reasoning.iter().cloned())
            .collect();

        let prompt = self.renderer.render(
            names::SYNTHESIZE,
            &json!({
                "champion_text": champion_text,
                "excerpts": excerpts,
                "reasoning": reasoning,
            }),
        )?;
        let completion = self
            .client
            .complete(&CompletionRequest::from_rendered(prompt))
            .await
            .context("Synthesis call failed")?;

        tracing::info!(
            champion = champion_id,
            writers = contributions.len(),
            excerpts = excerpts.len(),
            "Synthesized champion with praised excerpts"
        );

        Ok(SynthesisOutput {
            synthesized_text: completion.text.trim().to_string(),
            tokens_used: completion.total_tokens(),
        })
    }
}

#[async_trait]
impl Synthesizer for LlmSynthesizer {
    async fn synthesize(&self, input: &SynthesisInput<'_>) -> Result<SynthesisV2Result> {
        let contributions =
            collect_contributions(input.champion_id, input.all_generations, input.rounds);
        if contributions.is_empty() {
            return Ok(SynthesisV2Result::unchanged(input.champion_text));
        }
        let output = self
            .rewrite(input.champion_text, input.champion_id, &contributions)
            .await?;
        Ok(SynthesisV2Result {
            synthesized_text: output.synthesized_text,
            tokens_used: output.tokens_used,
            plan: None,
            applied: true,
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::judge::{JudgeResult, ScoreBreakdown, Side, SidePair};
    use crate::llm::ScriptedClient;
    use crate::prompts::TemplateRenderer;

    pub(crate) fn generation(id: &str) -> GenerationResult {
        GenerationResult {
            generator_id: id.to_string(),
            text: format!("text {}", id),
            tokens_used: 1,
        }
    }

    pub(crate) fn judged(a: &str, b: &str, winner: Side, result: JudgeResult) -> MatchResult {
        MatchResult {
            match_name: format!("{}_vs_{}", a, b),
            contestant_a_id: a.to_string(),
            contestant_b_id: b.to_string(),
            winner_id: if winner == Side::A { a } else { b }.to_string(),
            judge_result: result,
        }
    }

    fn verdict(reasoning: &str) -> JudgeResult {
        JudgeResult::new(
            Side::A,
            reasoning,
            SidePair::new(ScoreBreakdown::default(), ScoreBreakdown::default()),
        )
    }

    /// gen_1 beats gen_2 (gen_2 praised), gen_3 beats gen_4 (nothing praised), gen_1 beats gen_3.
    pub(crate) fn bracket_with_praise() -> (Vec<GenerationResult>, Vec<MatchResult>) {
        let gens = ["gen_1", "gen_2", "gen_3", "gen_4"].map(generation).to_vec();
        let rounds = vec![
            judged(
                "gen_1",
                "gen_2",
                Side::A,
                verdict("A is tighter")
                    .with_praised_excerpts(vec!["a line".into()], vec!["the moon hummed".into()])
                    .with_weaknesses(vec!["rushed ending".into()], vec![]),
            ),
            judged("gen_3", "gen_4", Side::A, verdict("close")),
            judged("gen_1", "gen_3", Side::A, verdict("A again")),
        ];
        (gens, rounds)
    }

    #[test]
    fn test_collect_contributions_skips_champion_and_empty() {
        let (gens, rounds) = bracket_with_praise();
        let contributions = collect_contributions("gen_1", &gens, &rounds);
        assert_eq!(contributions.len(), 1);
        assert_eq!(contributions[0].writer_id, "gen_2");
        assert_eq!(contributions[0].excerpts, vec!["the moon hummed"]);
        assert_eq!(contributions[0].reasoning, vec!["A is tighter"]);
    }

    #[test]
    fn test_champion_weaknesses() {
        let (_, rounds) = bracket_with_praise();
        assert_eq!(champion_weaknesses("gen_1", &rounds), vec!["rushed ending"]);
        assert!(champion_weaknesses("gen_4", &rounds).is_empty());
    }

    #[tokio::test]
    async fn test_no_excerpts_is_free_noop() {
        let client = Arc::new(ScriptedClient::new(vec![]));
        let synth = LlmSynthesizer::new(client.clone(), Arc::new(TemplateRenderer::builtin()));
        let gens = vec![generation("gen_1"), generation("gen_2")];
        let rounds = vec![judged("gen_1", "gen_2", Side::A, verdict("fine"))];

        let out = synth
            .synthesize_text("champion", "gen_1", &gens, &rounds)
            .await
            .unwrap();
        assert_eq!(out.synthesized_text, "champion");
        assert_eq!(out.tokens_used, 0);
        assert_eq!(client.call_count(), 0);

        let input = SynthesisInput {
            champion_text: "champion",
            champion_id: "gen_1",
            all_generations: &gens,
            rounds: &rounds,
        };
        let v2 = synth.synthesize(&input).await.unwrap();
        assert!(!v2.applied);
        assert!(v2.plan.is_none());
    }

    #[tokio::test]
    async fn test_rewrite_includes_excerpts() {
        let client = Arc::new(
            ScriptedClient::new(vec!["blended scene\n".to_string()]).with_tokens_per_call(40),
        );
        let synth = LlmSynthesizer::new(client.clone(), Arc::new(TemplateRenderer::builtin()));
        let (gens, rounds) = bracket_with_praise();
        let input = SynthesisInput {
            champion_text: "champion scene",
            champion_id: "gen_1",
            all_generations: &gens,
            rounds: &rounds,
        };

        let result = synth.synthesize(&input).await.unwrap();
        assert!(result.applied);
        assert_eq!(result.synthesized_text, "blended scene");
        assert_eq!(result.tokens_used, 40);

        assert_eq!(client.call_count(), 1);
        let request = &client.requests()[0];
        assert!(request.user.contains("champion scene"));
        assert!(request.user.contains("gen_2: the moon hummed"));
    }

    #[tokio::test]
    async fn test_synthesize_text_matches_trait_rewrite() {
        let client = Arc::new(
            ScriptedClient::new(vec!["blended scene".to_string()]).with_tokens_per_call(40),
        );
        let synth = LlmSynthesizer::new(client.clone(), Arc::new(TemplateRenderer::builtin()));
        let (gens, rounds) = bracket_with_praise();

        let out = synth
            .synthesize_text("champion scene", "gen_1", &gens, &rounds)
            .await
            .unwrap();
        assert_eq!(out.synthesized_text, "blended scene");
        assert_eq!(out.tokens_used, 40);
        assert_eq!(client.call_count(), 1);
        assert!(client.requests()[0].user.contains("gen_2: the moon hummed"));
    }
}
