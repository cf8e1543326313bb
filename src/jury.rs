//! Panel of simulated readers.
//!
//! Each persona scores the text on the same five categories with its own
//! weights. Personas are evaluated concurrently and fail-fast: the jury's
//! score is meaningless with a missing reader, so one failure fails the
//! whole evaluation.

use crate::errors::ParseError;
use crate::llm::{CompletionRequest, LlmClient, TokenCounter, complete_structured};
use crate::prompts::{PromptRenderer, names};
use crate::util::{parse_json_object, round2, str_field, str_list};
use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::future::try_join_all;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Aggregated score at or above which the jury passes a text.
pub const DEFAULT_PASS_THRESHOLD: f64 = 0.80;

/// The five reader categories every persona scores.
pub const CATEGORIES: [&str; 5] = [
    "engagement",
    "character",
    "pacing",
    "prose",
    "emotional_impact",
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Persona {
    pub id: String,
    pub name: String,
    pub description: String,
    /// Category weights, expected to sum to 1.
    pub weights: BTreeMap<String, f64>,
}

impl Persona {
    pub fn new(id: &str, name: &str, description: &str, weights: [f64; 5]) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            description: description.to_string(),
            weights: CATEGORIES
                .iter()
                .map(|c| c.to_string())
                .zip(weights)
                .collect(),
        }
    }

    pub fn weight_total(&self) -> f64 {
        self.weights.values().sum()
    }

    /// The default panel.
    pub fn builtin() -> Vec<Persona> {
        vec![
            Persona::new(
                "genre_enthusiast",
                "Genre Enthusiast",
                "reads a book a week in this genre and wants momentum and payoff",
                [0.30, 0.15, 0.30, 0.10, 0.15],
            ),
            Persona::new(
                "literary_critic",
                "Literary Critic",
                "values precise prose, subtext and originality over plot mechanics",
                [0.10, 0.25, 0.10, 0.35, 0.20],
            ),
            Persona::new(
                "casual_reader",
                "Casual Reader",
                "reads on the commute and drops books that confuse or drag",
                [0.30, 0.20, 0.25, 0.05, 0.20],
            ),
            Persona::new(
                "editor",
                "Editor",
                "a developmental editor checking structure, clarity and consistency",
                [0.15, 0.25, 0.25, 0.25, 0.10],
            ),
        ]
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReaderFeedback {
    pub strengths: Vec<String>,
    pub weaknesses: Vec<String>,
    pub suggestion: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReaderEvaluation {
    pub persona_id: String,
    pub persona_name: String,
    pub category_scores: BTreeMap<String, f64>,
    pub weighted_score: f64,
    pub feedback: ReaderFeedback,
}

impl ReaderEvaluation {
    /// Weighted score is the sum of each category score times the persona's
    /// weight for it; categories without a weight contribute nothing.
    pub fn new(
        persona: &Persona,
        category_scores: BTreeMap<String, f64>,
        feedback: ReaderFeedback,
    ) -> Self {
        let weighted_score = category_scores
            .iter()
            .map(|(category, score)| score * persona.weights.get(category).copied().unwrap_or(0.0))
            .sum();
        Self {
            persona_id: persona.id.clone(),
            persona_name: persona.name.clone(),
            category_scores,
            weighted_score,
            feedback,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReaderJuryResult {
    pub evaluations: Vec<ReaderEvaluation>,
    pub aggregated_score: f64,
    pub passed: bool,
    pub summary: String,
    #[serde(default)]
    pub tokens_used: u64,
}

impl ReaderJuryResult {
    /// Weaknesses and suggestions from every reader, for a rewrite brief.
    pub fn feedback_text(&self) -> String {
        let mut lines = Vec::new();
        for e in &self.evaluations {
            for w in &e.feedback.weaknesses {
                lines.push(format!("- {}: {}", e.persona_name, w));
            }
            if !e.feedback.suggestion.is_empty() {
                lines.push(format!("- {} suggests: {}", e.persona_name, e.feedback.suggestion));
            }
        }
        lines.join("\n")
    }
}

fn summarize(evaluations: &[ReaderEvaluation], aggregated: f64, threshold: f64) -> String {
    let satisfied = evaluations
        .iter()
        .filter(|e| e.weighted_score >= threshold)
        .count();
    let mut summary = format!(
        "{}/{} readers at or above {:.2}; mean {:.2}",
        satisfied,
        evaluations.len(),
        threshold,
        aggregated
    );
    if let Some(lowest) = evaluations
        .iter()
        .min_by(|a, b| a.weighted_score.total_cmp(&b.weighted_score))
    {
        summary.push_str(&format!(
            ". Lowest: {} ({:.2})",
            lowest.persona_name, lowest.weighted_score
        ));
    }
    summary
}

#[async_trait]
pub trait PersonaEvaluator: Send + Sync {
    fn persona(&self) -> &Persona;
    async fn evaluate(&self, text: &str) -> Result<ReaderEvaluation>;
}

/// Parse one persona's JSON answer. Every weighted category must be scored.
pub fn parse_persona_response(persona: &Persona, response: &str) -> Result<ReaderEvaluation, ParseError> {
    let value = parse_json_object(response)?;
    let scores = value
        .get("scores")
        .and_then(|s| s.as_object())
        .ok_or(ParseError::MissingField("scores"))?;

    let mut category_scores = BTreeMap::new();
    for category in persona.weights.keys() {
        let score = scores
            .get(category)
            .and_then(|v| v.as_f64())
            .ok_or_else(|| ParseError::InvalidValue {
                field: "scores",
                value: category.clone(),
            })?;
        category_scores.insert(category.clone(), score.clamp(0.0, 1.0));
    }

    let feedback = ReaderFeedback {
        strengths: str_list(&value, "strengths"),
        weaknesses: str_list(&value, "weaknesses"),
        suggestion: str_field(&value, "suggestion"),
    };
    Ok(ReaderEvaluation::new(persona, category_scores, feedback))
}

pub struct LlmPersona {
    persona: Persona,
    client: Arc<dyn LlmClient>,
    renderer: Arc<dyn PromptRenderer>,
}

impl LlmPersona {
    pub fn new(persona: Persona, client: Arc<dyn LlmClient>, renderer: Arc<dyn PromptRenderer>) -> Self {
        Self {
            persona,
            client,
            renderer,
        }
    }
}

#[async_trait]
impl PersonaEvaluator for LlmPersona {
    fn persona(&self) -> &Persona {
        &self.persona
    }

    async fn evaluate(&self, text: &str) -> Result<ReaderEvaluation> {
        let categories: Vec<&String> = self.persona.weights.keys().collect();
        let prompt = self.renderer.render(
            names::PERSONA_EVALUATE,
            &json!({
                "persona_name": self.persona.name,
                "persona_description": self.persona.description,
                "categories": categories.iter().map(|c| c.as_str()).collect::<Vec<_>>().join(", "),
                "text": text,
            }),
        )?;
        let completion =
            complete_structured(self.client.as_ref(), CompletionRequest::from_rendered(prompt))
                .await
                .with_context(|| format!("Persona {} call failed", self.persona.id))?;

        parse_persona_response(&self.persona, &completion.text)
            .with_context(|| format!("Persona {} returned an unusable evaluation", self.persona.id))
    }
}

pub struct ReaderJury {
    evaluators: Vec<Arc<dyn PersonaEvaluator>>,
    pass_threshold: f64,
    counter: Arc<TokenCounter>,
}

impl ReaderJury {
    pub fn new(evaluators: Vec<Arc<dyn PersonaEvaluator>>, counter: Arc<TokenCounter>) -> Self {
        Self {
            evaluators,
            pass_threshold: DEFAULT_PASS_THRESHOLD,
            counter,
        }
    }

    pub fn with_pass_threshold(mut self, threshold: f64) -> Self {
        self.pass_threshold = threshold;
        self
    }

    pub fn persona_count(&self) -> usize {
        self.evaluators.len()
    }

    pub async fn evaluate(&self, text: &str) -> Result<ReaderJuryResult> {
        if self.evaluators.is_empty() {
            anyhow::bail!("Reader jury has no personas configured");
        }

        let snapshot = self.counter.snapshot();
        let evaluations = try_join_all(self.evaluators.iter().map(|e| e.evaluate(text))).await?;

        let aggregated_score = round2(
            evaluations.iter().map(|e| e.weighted_score).sum::<f64>() / evaluations.len() as f64,
        );
        let passed = aggregated_score >= self.pass_threshold;
        let summary = summarize(&evaluations, aggregated_score, self.pass_threshold);

        tracing::info!(score = aggregated_score, passed, readers = evaluations.len(), "Reader jury verdict");

        Ok(ReaderJuryResult {
            evaluations,
            aggregated_score,
            passed,
            summary,
            tokens_used: snapshot.delta(&self.counter),
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::llm::ScriptedClient;
    use crate::prompts::TemplateRenderer;

    /// Scores every category the same.
    pub(crate) struct FlatPersona {
        persona: Persona,
        score: f64,
    }

    impl FlatPersona {
        pub fn new(id: &str, score: f64) -> Self {
            Self {
                persona: Persona::new(id, id, "test reader", [0.2; 5]),
                score,
            }
        }
    }

    #[async_trait]
    impl PersonaEvaluator for FlatPersona {
        fn persona(&self) -> &Persona {
            &self.persona
        }

        async fn evaluate(&self, _text: &str) -> Result<ReaderEvaluation> {
            let scores = CATEGORIES.iter().map(|c| (c.to_string(), self.score)).collect();
            Ok(ReaderEvaluation::new(
                &self.persona,
                scores,
                ReaderFeedback {
                    weaknesses: vec![format!("{} wanted more", self.persona.id)],
                    ..Default::default()
                },
            ))
        }
    }

    struct OfflinePersona(Persona);

    #[async_trait]
    impl PersonaEvaluator for OfflinePersona {
        fn persona(&self) -> &Persona {
            &self.0
        }

        async fn evaluate(&self, _text: &str) -> Result<ReaderEvaluation> {
            anyhow::bail!("rate limited")
        }
    }

    pub(crate) fn jury_of(scores: &[f64]) -> ReaderJury {
        let evaluators = scores
            .iter()
            .enumerate()
            .map(|(i, s)| Arc::new(FlatPersona::new(&format!("reader_{}", i), *s)) as Arc<dyn PersonaEvaluator>)
            .collect();
        ReaderJury::new(evaluators, TokenCounter::shared())
    }

    #[test]
    fn test_builtin_weights_sum_to_one() {
        let personas = Persona::builtin();
        assert_eq!(personas.len(), 4);
        for p in personas {
            assert!((p.weight_total() - 1.0).abs() < 1e-9, "{}", p.id);
            assert_eq!(p.weights.len(), 5);
        }
    }

    #[test]
    fn test_weighted_score() {
        let persona = Persona::new("p", "P", "", [0.5, 0.5, 0.0, 0.0, 0.0]);
        let scores = BTreeMap::from([
            ("engagement".to_string(), 0.8),
            ("character".to_string(), 0.6),
            ("pacing".to_string(), 0.1),
        ]);
        let eval = ReaderEvaluation::new(&persona, scores, ReaderFeedback::default());
        assert!((eval.weighted_score - 0.7).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_mean_of_weighted_scores() {
        let result = jury_of(&[0.9, 0.9, 0.9]).evaluate("text").await.unwrap();
        assert_eq!(result.aggregated_score, 0.9);
        assert!(result.passed);
        assert!(result.summary.starts_with("3/3 readers"));

        let result = jury_of(&[0.9, 0.6]).evaluate("text").await.unwrap();
        assert_eq!(result.aggregated_score, 0.75);
        assert!(!result.passed);
        assert!(result.summary.contains("Lowest: reader_1 (0.60)"));
        assert!(result.feedback_text().contains("reader_0 wanted more"));
    }

    #[tokio::test]
    async fn test_pass_boundary() {
        assert!(jury_of(&[0.8]).evaluate("t").await.unwrap().passed);
        let strict = jury_of(&[0.8]).with_pass_threshold(0.85);
        assert!(!strict.evaluate("t").await.unwrap().passed);
    }

    #[tokio::test]
    async fn test_one_persona_failure_fails_jury() {
        let evaluators: Vec<Arc<dyn PersonaEvaluator>> = vec![
            Arc::new(FlatPersona::new("ok", 0.9)),
            Arc::new(OfflinePersona(Persona::new("down", "Down", "", [0.2; 5]))),
        ];
        let jury = ReaderJury::new(evaluators, TokenCounter::shared());
        assert!(jury.evaluate("t").await.is_err());
    }

    #[tokio::test]
    async fn test_empty_jury_is_error() {
        assert!(jury_of(&[]).evaluate("t").await.is_err());
    }

    #[test]
    fn test_parse_persona_requires_every_category() {
        let persona = Persona::new("p", "P", "", [0.2; 5]);
        let partial = r#"{"scores": {"engagement": 0.9, "character": 0.8}}"#;
        assert!(matches!(
            parse_persona_response(&persona, partial),
            Err(ParseError::InvalidValue { field: "scores", .. })
        ));
    }

    #[tokio::test]
    async fn test_llm_persona_parses_and_counts_tokens() {
        let response = r#"{"scores": {"engagement": 1.0, "character": 0.8, "pacing": 0.6, "prose": 0.9, "emotional_impact": 1.4},
            "strengths": ["hook"], "weaknesses": ["slow middle"], "suggestion": "cut the flashback"}"#;
        let counter = TokenCounter::shared();
        let client = Arc::new(
            ScriptedClient::new(vec![response.to_string()])
                .with_tokens_per_call(50)
                .with_counter(counter.clone()),
        );
        let persona = Persona::new("p", "Picky", "hard to please", [0.2; 5]);
        let evaluator = Arc::new(LlmPersona::new(persona, client.clone(), Arc::new(TemplateRenderer::builtin())));

        let jury = ReaderJury::new(vec![evaluator], counter);
        let result = jury.evaluate("scene").await.unwrap();
        let eval = &result.evaluations[0];
        assert_eq!(eval.category_scores["emotional_impact"], 1.0);
        assert!((eval.weighted_score - 0.86).abs() < 1e-9);
        assert_eq!(eval.feedback.suggestion, "cut the flashback");
        assert_eq!(result.tokens_used, 50);
        assert!(client.requests()[0].system.contains("You are Picky"));
    }

    #[tokio::test]
    async fn test_llm_persona_parse_failure_is_error() {
        let client = Arc::new(ScriptedClient::new(vec!["I liked it!".to_string()]));
        let persona = LlmPersona::new(
            Persona::new("p", "P", "", [0.2; 5]),
            client,
            Arc::new(TemplateRenderer::builtin()),
        );
        assert!(persona.evaluate("scene").await.is_err());
    }
}
