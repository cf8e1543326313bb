//! Bounded rewrites of texts that score poorly with the judge.
//!
//! A text triggers a retake when its self-evaluation falls below the overall
//! threshold or below the voice-accuracy threshold. Each retake is compared
//! head to head against the text it would replace (previous as A, retake as
//! B) and adopted only when B wins. Rejected retakes still count.

use crate::judge::{Judge, ScoreBreakdown, Side};
use crate::llm::{CompletionRequest, LlmClient, TokenCounter};
use crate::prompts::{PromptRenderer, names};
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;

pub const DEFAULT_MAX_RETAKES: u32 = 2;
pub const DEFAULT_MIN_SCORE: f64 = 0.8;
pub const DEFAULT_MIN_VOICE: f64 = 0.7;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetakeOutput {
    pub retaken_text: String,
    pub tokens_used: u64,
}

#[async_trait]
pub trait Retaker: Send + Sync {
    async fn retake(&self, text: &str, feedback: &str) -> Result<RetakeOutput>;
}

pub struct LlmRetaker {
    client: Arc<dyn LlmClient>,
    renderer: Arc<dyn PromptRenderer>,
}

impl LlmRetaker {
    pub fn new(client: Arc<dyn LlmClient>, renderer: Arc<dyn PromptRenderer>) -> Self {
        Self { client, renderer }
    }
}

#[async_trait]
impl Retaker for LlmRetaker {
    async fn retake(&self, text: &str, feedback: &str) -> Result<RetakeOutput> {
        let prompt = self
            .renderer
            .render(names::RETAKE, &json!({ "text": text, "feedback": feedback }))?;
        let completion = self
            .client
            .complete(&CompletionRequest::from_rendered(prompt))
            .await
            .context("Retake call failed")?;
        Ok(RetakeOutput {
            retaken_text: completion.text.trim().to_string(),
            tokens_used: completion.total_tokens(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetakeResult {
    pub final_text: String,
    pub retake_count: u32,
    pub improved: bool,
    pub final_score: f64,
    pub total_tokens_used: u64,
}

enum RetakeState {
    SelfEvaluate {
        text: String,
    },
    Decide {
        text: String,
        scores: ScoreBreakdown,
        reasoning: String,
    },
    Retake {
        text: String,
        feedback: String,
    },
    Compare {
        previous: String,
        candidate: String,
    },
    Done {
        text: String,
        score: f64,
    },
}

pub struct RetakeLoop {
    judge: Arc<dyn Judge>,
    retaker: Arc<dyn Retaker>,
    counter: Arc<TokenCounter>,
    max_retakes: u32,
    min_score: f64,
    min_voice: f64,
}

impl RetakeLoop {
    pub fn new(judge: Arc<dyn Judge>, retaker: Arc<dyn Retaker>, counter: Arc<TokenCounter>) -> Self {
        Self {
            judge,
            retaker,
            counter,
            max_retakes: DEFAULT_MAX_RETAKES,
            min_score: DEFAULT_MIN_SCORE,
            min_voice: DEFAULT_MIN_VOICE,
        }
    }

    pub fn with_max_retakes(mut self, max_retakes: u32) -> Self {
        self.max_retakes = max_retakes;
        self
    }

    pub fn with_thresholds(mut self, min_score: f64, min_voice: f64) -> Self {
        self.min_score = min_score;
        self.min_voice = min_voice;
        self
    }

    /// Whether scores fall below either quality bar.
    pub fn needs_retake(&self, scores: &ScoreBreakdown) -> bool {
        scores.overall < self.min_score || scores.voice_accuracy < self.min_voice
    }

    pub async fn run(&self, text: &str, initial_feedback: Option<&str>) -> Result<RetakeResult> {
        let snapshot = self.counter.snapshot();
        let mut retake_count = 0u32;
        let mut state = RetakeState::SelfEvaluate {
            text: text.to_string(),
        };

        let (final_text, final_score) = loop {
            state = match state {
                RetakeState::SelfEvaluate { text } => {
                    let verdict = self
                        .judge
                        .evaluate(&text, &text)
                        .await
                        .context("Self-evaluation failed")?;
                    RetakeState::Decide {
                        scores: verdict.scores.a,
                        reasoning: verdict.reasoning,
                        text,
                    }
                }
                RetakeState::Decide {
                    text,
                    scores,
                    reasoning,
                } => {
                    if !self.needs_retake(&scores) || retake_count >= self.max_retakes {
                        RetakeState::Done {
                            text,
                            score: scores.overall,
                        }
                    } else {
                        tracing::info!(
                            overall = scores.overall,
                            voice = scores.voice_accuracy,
                            attempt = retake_count + 1,
                            "Below quality bar, retaking"
                        );
                        let feedback = match initial_feedback {
                            Some(initial) if retake_count == 0 => initial.to_string(),
                            _ => reasoning,
                        };
                        RetakeState::Retake { text, feedback }
                    }
                }
                RetakeState::Retake { text, feedback } => {
                    let output = self.retaker.retake(&text, &feedback).await?;
                    retake_count += 1;
                    tracing::debug!(attempt = retake_count, tokens = output.tokens_used, "Retake produced");
                    RetakeState::Compare {
                        previous: text,
                        candidate: output.retaken_text,
                    }
                }
                RetakeState::Compare {
                    previous,
                    candidate,
                } => {
                    let verdict = self
                        .judge
                        .evaluate(&previous, &candidate)
                        .await
                        .context("Retake comparison failed")?;
                    let adopted = verdict.winner == Side::B;
                    tracing::info!(attempt = retake_count, adopted, "Retake judged");
                    let (text, scores) = if adopted {
                        (candidate, verdict.scores.b)
                    } else {
                        (previous, verdict.scores.a)
                    };
                    RetakeState::Decide {
                        text,
                        scores,
                        reasoning: verdict.reasoning,
                    }
                }
                RetakeState::Done { text, score } => break (text, score),
            };
        };

        Ok(RetakeResult {
            improved: final_text != text,
            final_text,
            retake_count,
            final_score,
            total_tokens_used: snapshot.delta(&self.counter),
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::judge::{JudgeResult, SidePair};
    use crate::llm::ScriptedClient;
    use crate::prompts::TemplateRenderer;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    pub(crate) fn verdict(winner: Side, a: (f64, f64), b: (f64, f64), reasoning: &str) -> JudgeResult {
        let scores = |(overall, voice): (f64, f64)| ScoreBreakdown {
            overall,
            voice_accuracy: voice,
            ..ScoreBreakdown::default()
        };
        JudgeResult::new(winner, reasoning, SidePair::new(scores(a), scores(b)))
    }

    /// Plays back verdicts in order; repeats the last one when exhausted.
    pub(crate) struct ScriptedJudge {
        verdicts: Mutex<VecDeque<JudgeResult>>,
        last: Mutex<Option<JudgeResult>>,
        pub calls: Mutex<Vec<(String, String)>>,
    }

    impl ScriptedJudge {
        pub fn new(verdicts: Vec<JudgeResult>) -> Self {
            Self {
                verdicts: Mutex::new(verdicts.into()),
                last: Mutex::new(None),
                calls: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl Judge for ScriptedJudge {
        async fn evaluate(&self, text_a: &str, text_b: &str) -> Result<JudgeResult> {
            self.calls
                .lock()
                .unwrap()
                .push((text_a.to_string(), text_b.to_string()));
            let next = self.verdicts.lock().unwrap().pop_front();
            let mut last = self.last.lock().unwrap();
            if let Some(v) = next {
                *last = Some(v);
            }
            last.clone().ok_or_else(|| anyhow::anyhow!("no verdicts scripted"))
        }
    }

    /// Appends a marker per call and records the feedback received.
    pub(crate) struct NumberingRetaker {
        pub feedback: Mutex<Vec<String>>,
    }

    impl NumberingRetaker {
        pub fn new() -> Self {
            Self {
                feedback: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl Retaker for NumberingRetaker {
        async fn retake(&self, text: &str, feedback: &str) -> Result<RetakeOutput> {
            let mut seen = self.feedback.lock().unwrap();
            seen.push(feedback.to_string());
            Ok(RetakeOutput {
                retaken_text: format!("{} [retake {}]", text, seen.len()),
                tokens_used: 0,
            })
        }
    }

    fn retake_loop(judge: Arc<ScriptedJudge>, retaker: Arc<NumberingRetaker>) -> RetakeLoop {
        RetakeLoop::new(judge, retaker, TokenCounter::shared())
    }

    #[tokio::test]
    async fn test_good_text_skips_retake() {
        let judge = Arc::new(ScriptedJudge::new(vec![verdict(Side::A, (0.9, 0.85), (0.9, 0.85), "fine")]));
        let retaker = Arc::new(NumberingRetaker::new());
        let result = retake_loop(judge.clone(), retaker.clone()).run("draft", None).await.unwrap();
        assert_eq!(result.retake_count, 0);
        assert!(!result.improved);
        assert_eq!(result.final_text, "draft");
        assert_eq!(result.final_score, 0.9);
        assert!(retaker.feedback.lock().unwrap().is_empty());
        assert_eq!(judge.calls.lock().unwrap()[0], ("draft".to_string(), "draft".to_string()));
    }

    #[tokio::test]
    async fn test_low_voice_alone_triggers() {
        let judge = Arc::new(ScriptedJudge::new(vec![
            verdict(Side::A, (0.9, 0.5), (0.9, 0.5), "voice drifts"),
            verdict(Side::B, (0.9, 0.5), (0.9, 0.9), "B restores voice"),
        ]));
        let retaker = Arc::new(NumberingRetaker::new());
        let result = retake_loop(judge, retaker.clone()).run("draft", None).await.unwrap();
        assert_eq!(result.retake_count, 1);
        assert!(result.improved);
        assert_eq!(result.final_text, "draft [retake 1]");
        assert_eq!(retaker.feedback.lock().unwrap()[0], "voice drifts");
    }

    #[tokio::test]
    async fn test_rejected_retake_keeps_previous_but_counts() {
        let judge = Arc::new(ScriptedJudge::new(vec![
            verdict(Side::A, (0.5, 0.9), (0.5, 0.9), "weak"),
            verdict(Side::A, (0.6, 0.9), (0.4, 0.9), "original better"),
        ]));
        let retaker = Arc::new(NumberingRetaker::new());
        let result = retake_loop(judge.clone(), retaker.clone())
            .run("draft", Some("readers were bored"))
            .await
            .unwrap();
        assert_eq!(result.retake_count, DEFAULT_MAX_RETAKES);
        assert_eq!(result.final_text, "draft");
        assert!(!result.improved);
        assert_eq!(result.final_score, 0.6);

        let feedback = retaker.feedback.lock().unwrap();
        assert_eq!(feedback[0], "readers were bored");
        assert_eq!(feedback[1], "original better");

        let calls = judge.calls.lock().unwrap();
        assert_eq!(calls.len(), 3);
        assert_eq!(calls[1], ("draft".to_string(), "draft [retake 1]".to_string()));
    }

    #[tokio::test]
    async fn test_adopted_retake_is_next_baseline() {
        let judge = Arc::new(ScriptedJudge::new(vec![
            verdict(Side::A, (0.5, 0.9), (0.5, 0.9), "weak"),
            verdict(Side::B, (0.5, 0.9), (0.7, 0.9), "better but not there"),
            verdict(Side::B, (0.7, 0.9), (0.85, 0.9), "good now"),
        ]));
        let retaker = Arc::new(NumberingRetaker::new());
        let result = retake_loop(judge.clone(), retaker).run("draft", None).await.unwrap();
        assert_eq!(result.retake_count, 2);
        assert_eq!(result.final_text, "draft [retake 1] [retake 2]");
        assert_eq!(result.final_score, 0.85);
        assert!(result.improved);
        let calls = judge.calls.lock().unwrap();
        assert_eq!(calls[2].0, "draft [retake 1]");
    }

    #[tokio::test]
    async fn test_zero_max_retakes_never_rewrites() {
        let judge = Arc::new(ScriptedJudge::new(vec![verdict(Side::A, (0.1, 0.1), (0.1, 0.1), "bad")]));
        let retaker = Arc::new(NumberingRetaker::new());
        let result = retake_loop(judge, retaker.clone())
            .with_max_retakes(0)
            .run("draft", None)
            .await
            .unwrap();
        assert_eq!(result.retake_count, 0);
        assert!(retaker.feedback.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_llm_retaker_passes_feedback() {
        let client = Arc::new(ScriptedClient::new(vec!["new scene".to_string()]).with_tokens_per_call(9));
        let retaker = LlmRetaker::new(client.clone(), Arc::new(TemplateRenderer::builtin()));
        let out = retaker.retake("old scene", "more tension").await.unwrap();
        assert_eq!(out.retaken_text, "new scene");
        assert_eq!(out.tokens_used, 9);
        let user = &client.requests()[0].user;
        assert!(user.contains("old scene") && user.contains("more tension"));
    }
}
