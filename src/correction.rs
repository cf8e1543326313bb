//! Bounded correction of compliance violations.
//!
//! The loop is a small state machine:
//!
//! ```text
//! Check ──compliant──▶ Done(success, 0 attempts)
//!   │
//!   ▼
//! Correct ──▶ Recheck ──compliant──▶ Done(success)
//!   ▲           │
//!   │           ├─attempts == max──▶ Done(failure, last attempt)
//!   └───────────┘
//! ```
//!
//! Exhaustion is not an error: the result carries `success: false` and the
//! last corrected text.

use crate::compliance::{ComplianceChecker, ComplianceResult, Violation};
use crate::continuity::ChapterContext;
use crate::llm::{CompletionRequest, LlmClient};
use crate::prompts::{PromptRenderer, names};
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CorrectionOutput {
    pub corrected_text: String,
    pub tokens_used: u64,
}

#[async_trait]
pub trait Corrector: Send + Sync {
    async fn correct(
        &self,
        text: &str,
        violations: &[Violation],
        context: Option<&ChapterContext>,
    ) -> Result<CorrectionOutput>;
}

pub struct LlmCorrector {
    client: Arc<dyn LlmClient>,
    renderer: Arc<dyn PromptRenderer>,
}

impl LlmCorrector {
    pub fn new(client: Arc<dyn LlmClient>, renderer: Arc<dyn PromptRenderer>) -> Self {
        Self { client, renderer }
    }
}

#[async_trait]
impl Corrector for LlmCorrector {
    async fn correct(
        &self,
        text: &str,
        violations: &[Violation],
        context: Option<&ChapterContext>,
    ) -> Result<CorrectionOutput> {
        let listed: Vec<String> = violations.iter().map(Violation::describe).collect();
        let previous_summary = context
            .and_then(|c| c.last_summary())
            .map(|s| s.summary.as_str())
            .unwrap_or_default();
        let prompt = self.renderer.render(
            names::CORRECT,
            &json!({
                "text": text,
                "violations": listed,
                "previous_summary": previous_summary,
            }),
        )?;
        let completion = self
            .client
            .complete(&CompletionRequest::from_rendered(prompt))
            .await
            .context("Correction call failed")?;

        Ok(CorrectionOutput {
            corrected_text: completion.text.trim().to_string(),
            tokens_used: completion.total_tokens(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorrectionResult {
    pub success: bool,
    pub final_text: String,
    pub attempts: u32,
    pub total_tokens_used: u64,
    /// Violations found before the first correction; absent on the fast path.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_violations: Option<Vec<Violation>>,
    /// Compliance of `final_text`.
    pub final_compliance: ComplianceResult,
}

enum CorrectionState {
    Check,
    Correct {
        text: String,
        latest: Vec<Violation>,
    },
    Recheck {
        text: String,
    },
    Done(CorrectionResult),
}

pub struct CorrectionLoop {
    checker: Arc<ComplianceChecker>,
    corrector: Arc<dyn Corrector>,
    max_attempts: u32,
}

impl CorrectionLoop {
    pub fn new(checker: Arc<ComplianceChecker>, corrector: Arc<dyn Corrector>) -> Self {
        Self {
            checker,
            corrector,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    /// Clamped to at least one attempt.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    async fn check(&self, text: &str, context: Option<&ChapterContext>) -> Result<ComplianceResult> {
        match context {
            Some(ctx) => self.checker.check_with_context(text, Some(ctx)).await,
            None => Ok(self.checker.check(text)),
        }
    }

    pub async fn run(
        &self,
        text: &str,
        initial_violations: Option<&[Violation]>,
        context: Option<&ChapterContext>,
    ) -> Result<CorrectionResult> {
        let initial = initial_violations.unwrap_or_default();
        let mut attempts = 0u32;
        let mut tokens = 0u64;
        let mut original_violations: Option<Vec<Violation>> = None;
        let mut state = CorrectionState::Check;

        loop {
            state = match state {
                CorrectionState::Check => {
                    let result = self.check(text, context).await?;
                    tokens += result.tokens_used;
                    if result.is_compliant {
                        CorrectionState::Done(CorrectionResult {
                            success: true,
                            final_text: text.to_string(),
                            attempts: 0,
                            total_tokens_used: tokens,
                            original_violations: None,
                            final_compliance: result,
                        })
                    } else {
                        tracing::info!(
                            score = result.score,
                            violations = result.violations.len(),
                            "Text not compliant, starting correction"
                        );
                        original_violations = Some(result.violations.clone());
                        CorrectionState::Correct {
                            text: text.to_string(),
                            latest: result.violations,
                        }
                    }
                }
                CorrectionState::Correct { text, latest } => {
                    let merged: Vec<Violation> =
                        initial.iter().cloned().chain(latest).collect();
                    let output = self.corrector.correct(&text, &merged, context).await?;
                    attempts += 1;
                    tokens += output.tokens_used;
                    tracing::debug!(attempt = attempts, violations = merged.len(), "Correction applied");
                    CorrectionState::Recheck {
                        text: output.corrected_text,
                    }
                }
                CorrectionState::Recheck { text } => {
                    let result = self.check(&text, context).await?;
                    tokens += result.tokens_used;
                    if result.is_compliant || attempts >= self.max_attempts {
                        if !result.is_compliant {
                            tracing::warn!(
                                attempts,
                                score = result.score,
                                "Correction attempts exhausted, keeping last attempt"
                            );
                        }
                        CorrectionState::Done(CorrectionResult {
                            success: result.is_compliant,
                            final_text: text,
                            attempts,
                            total_tokens_used: tokens,
                            original_violations: original_violations.take(),
                            final_compliance: result,
                        })
                    } else {
                        CorrectionState::Correct {
                            text,
                            latest: result.violations,
                        }
                    }
                }
                CorrectionState::Done(result) => return Ok(result),
            };
        }
    }
}
