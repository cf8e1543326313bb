//! Pairwise judging of two texts.
//!
//! A [`Judge`] compares draft A against draft B and always names a winner:
//! there is no draw. Control flow downstream depends only on
//! [`JudgeResult::winner`] and the `overall`/`voice_accuracy` axes; the
//! enhanced fields (excerpts, weaknesses, axis comments, section analysis)
//! are advisory and feed synthesis and logs.
//!
//! ## Malformed responses
//!
//! [`parse_judge_response`] returns a `ParseError`; [`LlmJudge`] maps that to
//! [`JudgeResult::fallback`] (winner A, neutral 0.5 scores) so a bracket never
//! stalls on a garbled verdict.

use crate::errors::ParseError;
use crate::llm::{CompletionRequest, LlmClient, complete_structured};
use crate::prompts::{PromptRenderer, names};
use crate::util::{parse_json_object, str_field, str_list};
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Lower bound applied to every ingested score.
pub const SCORE_FLOOR: f64 = 0.05;
/// Upper bound applied to every ingested score.
pub const SCORE_CEILING: f64 = 0.95;
/// Score used when an axis is missing or the response is unusable.
pub const NEUTRAL_SCORE: f64 = 0.5;

/// One side of a pairwise comparison.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    #[default]
    A,
    B,
}

impl Side {
    pub fn other(self) -> Self {
        match self {
            Self::A => Self::B,
            Self::B => Self::A,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::A => write!(f, "A"),
            Self::B => write!(f, "B"),
        }
    }
}

impl std::str::FromStr for Side {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "A" => Ok(Self::A),
            "B" => Ok(Self::B),
            _ => Err(ParseError::InvalidValue {
                field: "winner",
                value: s.to_string(),
            }),
        }
    }
}

/// A value per side.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SidePair<T> {
    #[serde(rename = "A")]
    pub a: T,
    #[serde(rename = "B")]
    pub b: T,
}

impl<T> SidePair<T> {
    pub fn new(a: T, b: T) -> Self {
        Self { a, b }
    }

    pub fn get(&self, side: Side) -> &T {
        match side {
            Side::A => &self.a,
            Side::B => &self.b,
        }
    }
}

/// Per-axis scores for one text.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoreBreakdown {
    pub style: f64,
    pub compliance: f64,
    pub voice_accuracy: f64,
    pub originality: f64,
    pub structure: f64,
    pub amplitude: f64,
    pub agency: f64,
    pub stakes: f64,
    pub overall: f64,
}

impl Default for ScoreBreakdown {
    fn default() -> Self {
        Self::uniform(NEUTRAL_SCORE)
    }
}

impl ScoreBreakdown {
    pub const AXES: [&'static str; 9] = [
        "style",
        "compliance",
        "voice_accuracy",
        "originality",
        "structure",
        "amplitude",
        "agency",
        "stakes",
        "overall",
    ];

    pub fn uniform(score: f64) -> Self {
        Self {
            style: score,
            compliance: score,
            voice_accuracy: score,
            originality: score,
            structure: score,
            amplitude: score,
            agency: score,
            stakes: score,
            overall: score,
        }
    }

    /// Clamp an externally reported score into the trusted band.
    pub fn clamp_score(score: f64) -> f64 {
        if score.is_nan() {
            return NEUTRAL_SCORE;
        }
        score.clamp(SCORE_FLOOR, SCORE_CEILING)
    }

    /// Build from a judge's JSON object, clamping each axis. Missing axes are neutral.
    pub fn from_value(value: &Value) -> Self {
        let axis = |name: &str| {
            value
                .get(name)
                .and_then(|v| v.as_f64())
                .map(Self::clamp_score)
                .unwrap_or(NEUTRAL_SCORE)
        };
        Self {
            style: axis("style"),
            compliance: axis("compliance"),
            voice_accuracy: axis("voice_accuracy"),
            originality: axis("originality"),
            structure: axis("structure"),
            amplitude: axis("amplitude"),
            agency: axis("agency"),
            stakes: axis("stakes"),
            overall: axis("overall"),
        }
    }
}

/// Judge note on one section of the compared texts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SectionAnalysis {
    pub section: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub winner: Option<Side>,
    #[serde(default)]
    pub note: String,
}

/// Outcome of one pairwise comparison.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JudgeResult {
    pub winner: Side,
    pub reasoning: String,
    pub scores: SidePair<ScoreBreakdown>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub praised_excerpts: Option<SidePair<Vec<String>>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weaknesses: Option<SidePair<Vec<String>>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub axis_comments: Option<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub section_analysis: Option<Vec<SectionAnalysis>>,
}

impl JudgeResult {
    /// A verdict with scores only.
    pub fn new(winner: Side, reasoning: &str, scores: SidePair<ScoreBreakdown>) -> Self {
        Self {
            winner,
            reasoning: reasoning.to_string(),
            scores,
            praised_excerpts: None,
            weaknesses: None,
            axis_comments: None,
            section_analysis: None,
        }
    }

    /// The documented default for an unusable verdict: A wins, neutral scores.
    pub fn fallback(reason: &str) -> Self {
        Self::new(
            Side::A,
            &format!("Fallback verdict: {}", reason),
            SidePair::new(ScoreBreakdown::default(), ScoreBreakdown::default()),
        )
    }

    pub fn with_praised_excerpts(mut self, a: Vec<String>, b: Vec<String>) -> Self {
        self.praised_excerpts = Some(SidePair::new(a, b));
        self
    }

    pub fn with_weaknesses(mut self, a: Vec<String>, b: Vec<String>) -> Self {
        self.weaknesses = Some(SidePair::new(a, b));
        self
    }

    pub fn scores_for(&self, side: Side) -> &ScoreBreakdown {
        self.scores.get(side)
    }

    pub fn excerpts_for(&self, side: Side) -> &[String] {
        self.praised_excerpts
            .as_ref()
            .map(|p| p.get(side).as_slice())
            .unwrap_or(&[])
    }

    pub fn weaknesses_for(&self, side: Side) -> &[String] {
        self.weaknesses
            .as_ref()
            .map(|p| p.get(side).as_slice())
            .unwrap_or(&[])
    }
}

/// Compares two texts.
#[async_trait]
pub trait Judge: Send + Sync {
    async fn evaluate(&self, text_a: &str, text_b: &str) -> Result<JudgeResult>;
}

/// Parse a judge's JSON verdict.
pub fn parse_judge_response(response: &str) -> Result<JudgeResult, ParseError> {
    let value = parse_json_object(response)?;

    let winner: Side = value
        .get("winner")
        .and_then(|v| v.as_str())
        .ok_or(ParseError::MissingField("winner"))?
        .parse()?;

    let scores = value.get("scores");
    let side_scores = |key: &str| {
        scores
            .and_then(|s| s.get(key).or_else(|| s.get(key.to_lowercase())))
            .map(ScoreBreakdown::from_value)
            .unwrap_or_default()
    };

    let side_lists = |field: &str| -> Option<SidePair<Vec<String>>> {
        let obj = value.get(field)?;
        let list = |key: &str| {
            if obj.get(key).is_some() {
                str_list(obj, key)
            } else {
                str_list(obj, &key.to_lowercase())
            }
        };
        Some(SidePair::new(list("A"), list("B")))
    };

    let axis_comments = value.get("axis_comments").and_then(|v| v.as_object()).map(|obj| {
        obj.iter()
            .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
            .collect::<BTreeMap<_, _>>()
    });

    let section_analysis = value
        .get("section_analysis")
        .and_then(|v| v.as_array())
        .map(|items| {
            items
                .iter()
                .filter_map(|item| {
                    let section = item.get("section")?.as_str()?.to_string();
                    Some(SectionAnalysis {
                        section,
                        winner: item
                            .get("winner")
                            .and_then(|w| w.as_str())
                            .and_then(|w| w.parse().ok()),
                        note: str_field(item, "note"),
                    })
                })
                .collect()
        });

    Ok(JudgeResult {
        winner,
        reasoning: str_field(&value, "reasoning"),
        scores: SidePair::new(side_scores("A"), side_scores("B")),
        praised_excerpts: side_lists("praised_excerpts"),
        weaknesses: side_lists("weaknesses"),
        axis_comments,
        section_analysis,
    })
}

/// Judge backed by a model call.
pub struct LlmJudge {
    client: Arc<dyn LlmClient>,
    renderer: Arc<dyn PromptRenderer>,
}

impl LlmJudge {
    pub fn new(client: Arc<dyn LlmClient>, renderer: Arc<dyn PromptRenderer>) -> Self {
        Self { client, renderer }
    }
}

#[async_trait]
impl Judge for LlmJudge {
    async fn evaluate(&self, text_a: &str, text_b: &str) -> Result<JudgeResult> {
        let prompt = self
            .renderer
            .render(names::JUDGE, &json!({ "text_a": text_a, "text_b": text_b }))?;
        let completion =
            complete_structured(self.client.as_ref(), CompletionRequest::from_rendered(prompt))
                .await
                .context("Judge call failed")?;

        match parse_judge_response(&completion.text) {
            Ok(result) => Ok(result),
            Err(e) => {
                tracing::warn!(error = %e, "Judge response unparseable, using fallback verdict");
                Ok(JudgeResult::fallback(&e.to_string()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ScriptedClient;
    use crate::prompts::TemplateRenderer;

    #[test]
    fn test_side_parse_and_other() {
        assert_eq!("a".parse::<Side>().unwrap(), Side::A);
        assert_eq!(" B ".parse::<Side>().unwrap(), Side::B);
        assert!("draw".parse::<Side>().is_err());
        assert_eq!(Side::A.other(), Side::B);
    }

    #[test]
    fn test_scores_clamped_on_ingestion() {
        let scores = ScoreBreakdown::from_value(&json!({"overall": 1.0, "style": 0.0, "stakes": 0.7}));
        assert_eq!(scores.overall, SCORE_CEILING);
        assert_eq!(scores.style, SCORE_FLOOR);
        assert_eq!(scores.stakes, 0.7);
        assert_eq!(scores.agency, NEUTRAL_SCORE);
    }

    #[test]
    fn test_parse_full_response() {
        let response = r#"Here is my verdict:
```json
{
  "winner": "B",
  "reasoning": "B has sharper stakes",
  "scores": {"A": {"overall": 0.6, "voice_accuracy": 0.8}, "B": {"overall": 0.85}},
  "praised_excerpts": {"A": ["the kettle screamed"], "B": []},
  "weaknesses": {"A": ["slow middle"], "B": ["flat ending"]},
  "axis_comments": {"style": "both competent"},
  "section_analysis": [{"section": "opening", "winner": "A", "note": "vivid"}]
}
```"#;
        let result = parse_judge_response(response).unwrap();
        assert_eq!(result.winner, Side::B);
        assert_eq!(result.reasoning, "B has sharper stakes");
        assert_eq!(result.scores.a.overall, 0.6);
        assert_eq!(result.scores.a.voice_accuracy, 0.8);
        assert_eq!(result.scores.b.overall, 0.85);
        assert_eq!(result.excerpts_for(Side::A), ["the kettle screamed"]);
        assert!(result.excerpts_for(Side::B).is_empty());
        assert_eq!(result.weaknesses_for(Side::B), ["flat ending"]);
        assert_eq!(
            result.axis_comments.as_ref().unwrap().get("style").map(String::as_str),
            Some("both competent")
        );
        let sections = result.section_analysis.unwrap();
        assert_eq!(sections[0].winner, Some(Side::A));
    }

    #[test]
    fn test_parse_missing_winner_is_error() {
        let err = parse_judge_response(r#"{"reasoning": "tie"}"#).unwrap_err();
        assert!(matches!(err, ParseError::MissingField("winner")));
    }

    #[test]
    fn test_parse_draw_is_error() {
        assert!(parse_judge_response(r#"{"winner": "draw"}"#).is_err());
    }

    #[test]
    fn test_fallback_is_a_with_neutral_scores() {
        let fallback = JudgeResult::fallback("garbled");
        assert_eq!(fallback.winner, Side::A);
        assert_eq!(fallback.scores.a.overall, NEUTRAL_SCORE);
        assert_eq!(fallback.scores.b.voice_accuracy, NEUTRAL_SCORE);
        assert!(fallback.praised_excerpts.is_none());
    }

    #[tokio::test]
    async fn test_llm_judge_falls_back_on_garbage() {
        let client = Arc::new(ScriptedClient::new(vec!["I liked both!".to_string()]));
        let judge = LlmJudge::new(client.clone(), Arc::new(TemplateRenderer::builtin()));
        let result = judge.evaluate("one", "two").await.unwrap();
        assert_eq!(result.winner, Side::A);
        assert!(result.reasoning.starts_with("Fallback verdict"));
        assert!(client.requests()[0].user.contains("## Draft B\ntwo"));
    }

    #[tokio::test]
    async fn test_llm_judge_propagates_transport_error() {
        let client = Arc::new(ScriptedClient::new(vec![]));
        let judge = LlmJudge::new(client, Arc::new(TemplateRenderer::builtin()));
        assert!(judge.evaluate("one", "two").await.is_err());
    }
}
