//! Two-pass synthesis: analyze, then execute an explicit improvement plan.

use super::{Contribution, SynthesisInput, SynthesisOutput, SynthesisV2Result, Synthesizer};
use super::{champion_weaknesses, collect_contributions};
use crate::errors::ParseError;
use crate::llm::{CompletionRequest, LlmClient, complete_structured};
use crate::prompts::{PromptRenderer, names};
use crate::util::parse_json_object;
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImprovementAction {
    #[serde(default)]
    pub section: String,
    #[serde(default, rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub description: String,
    /// Writer id the improvement is borrowed from.
    #[serde(default)]
    pub source: String,
    /// 1 is most important.
    #[serde(default)]
    pub priority: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpressionSource {
    #[serde(default)]
    pub writer_id: String,
    #[serde(default)]
    pub expressions: Vec<String>,
    #[serde(default)]
    pub context: String,
}

/// A structured revision plan for the champion text.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImprovementPlan {
    #[serde(default)]
    pub champion_assessment: String,
    #[serde(default)]
    pub preserve_elements: Vec<String>,
    #[serde(default)]
    pub actions: Vec<ImprovementAction>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub structural_changes: Option<Vec<String>>,
    #[serde(default)]
    pub expression_sources: Vec<ExpressionSource>,
}

impl ImprovementPlan {
    /// Plan with no actions, used when the analysis could not be read.
    pub fn empty(assessment: &str) -> Self {
        Self {
            champion_assessment: assessment.to_string(),
            ..Default::default()
        }
    }

    /// Actions ordered by priority, ties kept in plan order.
    pub fn sorted_actions(&self) -> Vec<&ImprovementAction> {
        let mut actions: Vec<_> = self.actions.iter().collect();
        actions.sort_by_key(|a| a.priority);
        actions
    }
}

pub fn parse_improvement_plan(response: &str) -> Result<ImprovementPlan, ParseError> {
    let value = parse_json_object(response)?;
    Ok(serde_json::from_value(value)?)
}

/// Result of the analysis pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Analysis {
    pub plan: ImprovementPlan,
    pub tokens_used: u64,
}

#[async_trait]
pub trait ImprovementAnalyzer: Send + Sync {
    async fn analyze(
        &self,
        input: &SynthesisInput<'_>,
        contributions: &[Contribution],
    ) -> Result<Analysis>;
}

#[async_trait]
pub trait ImprovementExecutor: Send + Sync {
    async fn execute(&self, champion_text: &str, plan: &ImprovementPlan) -> Result<SynthesisOutput>;
}

pub struct LlmImprovementAnalyzer {
    client: Arc<dyn LlmClient>,
    renderer: Arc<dyn PromptRenderer>,
}

impl LlmImprovementAnalyzer {
    pub fn new(client: Arc<dyn LlmClient>, renderer: Arc<dyn PromptRenderer>) -> Self {
        Self { client, renderer }
    }
}

#[async_trait]
impl ImprovementAnalyzer for LlmImprovementAnalyzer {
    async fn analyze(
        &self,
        input: &SynthesisInput<'_>,
        contributions: &[Contribution],
    ) -> Result<Analysis> {
        let excerpts: Vec<String> = contributions
            .iter()
            .map(|c| format!("{}: {}", c.writer_id, c.excerpts.join(" / ")))
            .collect();
        let prompt = self.renderer.render(
            names::SYNTHESIS_ANALYZE,
            &json!({
                "champion_id": input.champion_id,
                "champion_text": input.champion_text,
                "excerpts": excerpts,
                "weaknesses": champion_weaknesses(input.champion_id, input.rounds),
            }),
        )?;
        let completion =
            complete_structured(self.client.as_ref(), CompletionRequest::from_rendered(prompt))
                .await
                .context("Synthesis analysis call failed")?;

        let plan = parse_improvement_plan(&completion.text).unwrap_or_else(|e| {
            tracing::warn!(error = %e, "Improvement plan unparseable, continuing with empty plan");
            ImprovementPlan::empty("")
        });

        Ok(Analysis {
            plan,
            tokens_used: completion.total_tokens(),
        })
    }
}

pub struct LlmImprovementExecutor {
    client: Arc<dyn LlmClient>,
    renderer: Arc<dyn PromptRenderer>,
}

impl LlmImprovementExecutor {
    pub fn new(client: Arc<dyn LlmClient>, renderer: Arc<dyn PromptRenderer>) -> Self {
        Self { client, renderer }
    }
}

#[async_trait]
impl ImprovementExecutor for LlmImprovementExecutor {
    async fn execute(&self, champion_text: &str, plan: &ImprovementPlan) -> Result<SynthesisOutput> {
        let actions: Vec<String> = plan
            .sorted_actions()
            .iter()
            .map(|a| {
                let mut line = format!("[{}] {} ({}): {}", a.priority, a.section, a.kind, a.description);
                if !a.source.is_empty() {
                    line.push_str(&format!(" (from {})", a.source));
                }
                line
            })
            .collect();
        let prompt = self.renderer.render(
            names::SYNTHESIS_EXECUTE,
            &json!({
                "champion_text": champion_text,
                "preserve_elements": plan.preserve_elements,
                "actions": actions,
                "structural_changes": plan.structural_changes.clone().unwrap_or_default(),
            }),
        )?;
        let completion = self
            .client
            .complete(&CompletionRequest::from_rendered(prompt))
            .await
            .context("Synthesis execution call failed")?;

        Ok(SynthesisOutput {
            synthesized_text: completion.text.trim().to_string(),
            tokens_used: completion.total_tokens(),
        })
    }
}

/// Analyzer + executor pair behind the [`Synthesizer`] seam.
pub struct PlanSynthesizer {
    analyzer: Arc<dyn ImprovementAnalyzer>,
    executor: Arc<dyn ImprovementExecutor>,
}

impl PlanSynthesizer {
    pub fn new(analyzer: Arc<dyn ImprovementAnalyzer>, executor: Arc<dyn ImprovementExecutor>) -> Self {
        Self { analyzer, executor }
    }
}

#[async_trait]
impl Synthesizer for PlanSynthesizer {
    async fn synthesize(&self, input: &SynthesisInput<'_>) -> Result<SynthesisV2Result> {
        let contributions =
            collect_contributions(input.champion_id, input.all_generations, input.rounds);
        if contributions.is_empty() {
            return Ok(SynthesisV2Result::unchanged(input.champion_text));
        }

        let analysis = self.analyzer.analyze(input, &contributions).await?;
        tracing::debug!(
            actions = analysis.plan.actions.len(),
            preserve = analysis.plan.preserve_elements.len(),
            "Improvement plan ready"
        );

        let output = self
            .executor
            .execute(input.champion_text, &analysis.plan)
            .await?;

        Ok(SynthesisV2Result {
            synthesized_text: output.synthesized_text,
            tokens_used: analysis.tokens_used + output.tokens_used,
            plan: Some(analysis.plan),
            applied: true,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ScriptedClient;
    use crate::prompts::TemplateRenderer;
    use crate::synthesis::tests::bracket_with_praise;

    const PLAN_JSON: &str = r#"{
        "champion_assessment": "strong opening, thin middle",
        "preserve_elements": ["first line"],
        "actions": [
            {"section": "ending", "type": "detail", "description": "add the humming moon", "source": "gen_2", "priority": 2},
            {"section": "middle", "type": "pacing", "description": "tighten", "source": "", "priority": 1}
        ],
        "structural_changes": ["merge scenes 2 and 3"],
        "expression_sources": [{"writer_id": "gen_2", "expressions": ["the moon hummed"], "context": "night"}]
    }"#;

    fn synthesizer(client: Arc<ScriptedClient>) -> PlanSynthesizer {
        let renderer: Arc<dyn PromptRenderer> = Arc::new(TemplateRenderer::builtin());
        PlanSynthesizer::new(
            Arc::new(LlmImprovementAnalyzer::new(client.clone(), renderer.clone())),
            Arc::new(LlmImprovementExecutor::new(client, renderer)),
        )
    }

    #[test]
    fn test_parse_plan() {
        let plan = parse_improvement_plan(PLAN_JSON).unwrap();
        assert_eq!(plan.actions.len(), 2);
        assert_eq!(plan.actions[0].kind, "detail");
        assert_eq!(plan.sorted_actions()[0].section, "middle");
        assert_eq!(plan.expression_sources[0].writer_id, "gen_2");
        assert_eq!(plan.structural_changes.as_deref(), Some(&["merge scenes 2 and 3".to_string()][..]));
    }

    #[test]
    fn test_parse_plan_rejects_garbage() {
        assert!(parse_improvement_plan("no plan today").is_err());
    }

    #[tokio::test]
    async fn test_plan_then_execute() {
        let client = Arc::new(
            ScriptedClient::new(vec![PLAN_JSON.to_string(), "revised".to_string()])
                .with_tokens_per_call(25),
        );
        let (gens, rounds) = bracket_with_praise();
        let input = SynthesisInput {
            champion_text: "champion scene",
            champion_id: "gen_1",
            all_generations: &gens,
            rounds: &rounds,
        };

        let result = synthesizer(client.clone()).synthesize(&input).await.unwrap();
        assert!(result.applied);
        assert_eq!(result.synthesized_text, "revised");
        assert_eq!(result.tokens_used, 50);
        assert_eq!(result.plan.unwrap().preserve_elements, vec!["first line"]);

        let requests = client.requests();
        assert!(requests[0].json);
        assert!(requests[0].user.contains("rushed ending"));
        let exec = &requests[1].user;
        assert!(exec.find("tighten").unwrap() < exec.find("humming moon").unwrap());
    }

    #[tokio::test]
    async fn test_unparseable_analysis_still_executes() {
        let client = Arc::new(ScriptedClient::new(vec![
            "I could not decide".to_string(),
            "rewritten anyway".to_string(),
        ]));
        let (gens, rounds) = bracket_with_praise();
        let input = SynthesisInput {
            champion_text: "champion scene",
            champion_id: "gen_1",
            all_generations: &gens,
            rounds: &rounds,
        };

        let result = synthesizer(client.clone()).synthesize(&input).await.unwrap();
        assert_eq!(result.synthesized_text, "rewritten anyway");
        let plan = result.plan.unwrap();
        assert!(plan.actions.is_empty());
        assert_eq!(client.call_count(), 2);
    }
}
