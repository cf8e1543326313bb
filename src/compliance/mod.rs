//! Rule-based compliance scoring.
//!
//! Synchronous rules look only at the text. Asynchronous rules may compare
//! against earlier chapters and therefore need a [`ChapterContext`] and a
//! model round trip; [`ComplianceChecker::check`] skips them entirely.

pub mod rules;

pub use rules::{ForbiddenWordsRule, RepetitionRule, RhythmRule};

use crate::continuity::ChapterContext;
use crate::util::round2;
use anyhow::Result;
use async_trait::async_trait;
use futures::future::try_join_all;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Score at or above which a text is compliant.
pub const DEFAULT_THRESHOLD: f64 = 0.75;

/// Per-violation penalty, scaled by violations per sentence.
const VIOLATION_WEIGHT: f64 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Warning,
    Error,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Warning => write!(f, "warning"),
            Severity::Error => write!(f, "error"),
        }
    }
}

/// Byte range in the checked text.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
    pub start: usize,
    pub end: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Violation {
    #[serde(rename = "type")]
    pub kind: String,
    pub position: Position,
    pub context: String,
    pub rule: String,
    pub severity: Severity,
}

impl Violation {
    pub fn new(rule: &str, kind: &str, severity: Severity) -> Self {
        Self {
            kind: kind.to_string(),
            position: Position::default(),
            context: String::new(),
            rule: rule.to_string(),
            severity,
        }
    }

    pub fn at(mut self, start: usize, end: usize) -> Self {
        self.position = Position { start, end };
        self
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = context.into();
        self
    }

    /// One-line description handed to correctors and shown in the CLI.
    pub fn describe(&self) -> String {
        if self.context.is_empty() {
            format!("[{}] {} ({})", self.severity, self.kind, self.rule)
        } else {
            format!(
                "[{}] {} ({}): \"{}\"",
                self.severity, self.kind, self.rule, self.context
            )
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComplianceResult {
    pub is_compliant: bool,
    pub score: f64,
    pub violations: Vec<Violation>,
    /// Model tokens spent by asynchronous rules.
    #[serde(default)]
    pub tokens_used: u64,
}

impl ComplianceResult {
    /// Score `violations` against `text` at the given threshold.
    pub fn evaluate(text: &str, violations: Vec<Violation>, threshold: f64) -> Self {
        let score = compliance_score(violations.len(), count_sentences(text));
        Self {
            is_compliant: score >= threshold,
            score,
            violations,
            tokens_used: 0,
        }
    }

    pub fn error_count(&self) -> usize {
        self.violations
            .iter()
            .filter(|v| v.severity == Severity::Error)
            .count()
    }
}

/// `1.0` for no violations, otherwise `1 - (violations / sentences) * 0.5`
/// floored at zero and rounded to two decimals.
pub fn compliance_score(violations: usize, sentences: usize) -> f64 {
    if violations == 0 {
        return 1.0;
    }
    let ratio = violations as f64 / sentences.max(1) as f64;
    round2((1.0 - ratio * VIOLATION_WEIGHT).max(0.0))
}

/// A trimmed sentence and its byte range in the source text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sentence<'a> {
    pub text: &'a str,
    pub start: usize,
    pub end: usize,
}

fn is_terminator(c: char) -> bool {
    matches!(c, '.' | '!' | '?' | '。' | '！' | '？' | '\n')
}

/// Split on sentence terminators and newlines, dropping empty fragments.
pub fn split_sentences(text: &str) -> Vec<Sentence<'_>> {
    let mut sentences = Vec::new();
    let mut push = |from: usize, to: usize| {
        let raw = &text[from..to];
        let trimmed = raw.trim();
        if !trimmed.is_empty() {
            let start = from + (raw.len() - raw.trim_start().len());
            sentences.push(Sentence {
                text: trimmed,
                start,
                end: start + trimmed.len(),
            });
        }
    };

    let mut from = 0;
    for (i, c) in text.char_indices() {
        if is_terminator(c) {
            push(from, i);
            from = i + c.len_utf8();
        }
    }
    push(from, text.len());
    sentences
}

pub fn count_sentences(text: &str) -> usize {
    split_sentences(text).len()
}

/// A rule that needs only the text.
pub trait SyncRule: Send + Sync {
    fn name(&self) -> &str;
    fn check(&self, text: &str) -> Vec<Violation>;
}

/// What an asynchronous rule found and what the check cost.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RuleReport {
    pub violations: Vec<Violation>,
    pub tokens_used: u64,
}

/// A rule that may consult earlier chapters through a model call.
#[async_trait]
pub trait AsyncRule: Send + Sync {
    fn name(&self) -> &str;
    async fn check(&self, text: &str, context: Option<&ChapterContext>) -> Result<RuleReport>;
}

#[derive(Clone)]
pub struct ComplianceChecker {
    threshold: f64,
    sync_rules: Vec<Arc<dyn SyncRule>>,
    async_rules: Vec<Arc<dyn AsyncRule>>,
}

impl Default for ComplianceChecker {
    fn default() -> Self {
        Self::new(DEFAULT_THRESHOLD)
    }
}

impl ComplianceChecker {
    pub fn new(threshold: f64) -> Self {
        Self {
            threshold,
            sync_rules: Vec::new(),
            async_rules: Vec::new(),
        }
    }

    pub fn with_rule(mut self, rule: Arc<dyn SyncRule>) -> Self {
        self.sync_rules.push(rule);
        self
    }

    pub fn with_async_rule(mut self, rule: Arc<dyn AsyncRule>) -> Self {
        self.async_rules.push(rule);
        self
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    pub fn rule_names(&self) -> Vec<&str> {
        self.sync_rules
            .iter()
            .map(|r| r.name())
            .chain(self.async_rules.iter().map(|r| r.name()))
            .collect()
    }

    fn sync_violations(&self, text: &str) -> Vec<Violation> {
        self.sync_rules.iter().flat_map(|r| r.check(text)).collect()
    }

    /// Run the synchronous rules only.
    pub fn check(&self, text: &str) -> ComplianceResult {
        ComplianceResult::evaluate(text, self.sync_violations(text), self.threshold)
    }

    /// Run the synchronous rules plus every asynchronous rule concurrently.
    pub async fn check_with_context(
        &self,
        text: &str,
        context: Option<&ChapterContext>,
    ) -> Result<ComplianceResult> {
        let mut violations = self.sync_violations(text);
        let reports =
            try_join_all(self.async_rules.iter().map(|rule| rule.check(text, context))).await?;
        let mut tokens_used = 0;
        for report in reports {
            tokens_used += report.tokens_used;
            violations.extend(report.violations);
        }

        let result = ComplianceResult {
            tokens_used,
            ..ComplianceResult::evaluate(text, violations, self.threshold)
        };
        tracing::debug!(
            score = result.score,
            violations = result.violations.len(),
            tokens = result.tokens_used,
            compliant = result.is_compliant,
            "Compliance checked"
        );
        Ok(result)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Reports a fixed number of violations regardless of the text.
    pub(crate) struct FixedRule(pub usize);

    impl SyncRule for FixedRule {
        fn name(&self) -> &str {
            "fixed"
        }

        fn check(&self, _text: &str) -> Vec<Violation> {
            (0..self.0)
                .map(|_| Violation::new("fixed", "test", Severity::Warning))
                .collect()
        }
    }

    /// Flags every occurrence of a marker word.
    pub(crate) struct MarkerRule(pub &'static str);

    impl SyncRule for MarkerRule {
        fn name(&self) -> &str {
            "marker"
        }

        fn check(&self, text: &str) -> Vec<Violation> {
            text.match_indices(self.0)
                .map(|(i, m)| Violation::new("marker", "marker", Severity::Error).at(i, i + m.len()))
                .collect()
        }
    }

    struct AsyncFixed(usize);

    #[async_trait]
    impl AsyncRule for AsyncFixed {
        fn name(&self) -> &str {
            "async_fixed"
        }

        async fn check(&self, _text: &str, _context: Option<&ChapterContext>) -> Result<RuleReport> {
            Ok(RuleReport {
                violations: (0..self.0)
                    .map(|_| Violation::new("async_fixed", "test", Severity::Error))
                    .collect(),
                tokens_used: 7,
            })
        }
    }

    struct AsyncBroken;

    #[async_trait]
    impl AsyncRule for AsyncBroken {
        fn name(&self) -> &str {
            "broken"
        }

        async fn check(&self, _text: &str, _context: Option<&ChapterContext>) -> Result<RuleReport> {
            anyhow::bail!("upstream timeout")
        }
    }

    pub(crate) fn ten_sentences() -> String {
        (1..=10).map(|i| format!("Sentence number {}.", i)).collect::<Vec<_>>().join(" ")
    }

    #[test]
    fn test_zero_violations_scores_one() {
        assert_eq!(compliance_score(0, 0), 1.0);
        assert_eq!(compliance_score(0, 7), 1.0);
        let result = ComplianceChecker::default().check("Anything at all.");
        assert_eq!(result.score, 1.0);
        assert!(result.is_compliant);
    }

    #[test]
    fn test_score_formula() {
        assert_eq!(compliance_score(1, 10), 0.95);
        assert_eq!(compliance_score(3, 4), 0.63);
        assert_eq!(compliance_score(2, 0), 0.0);
        assert_eq!(compliance_score(50, 10), 0.0);
    }

    #[test]
    fn test_score_monotonic_in_violations() {
        for sentences in 1..20 {
            let mut last = 1.0;
            for violations in 0..40 {
                let score = compliance_score(violations, sentences);
                assert!(score <= last, "v={} s={}", violations, sentences);
                assert!((0.0..=1.0).contains(&score));
                last = score;
            }
        }
    }

    #[test]
    fn test_split_sentences() {
        let text = "First one. Second!  Third?\nFourth line\n\n";
        let sentences = split_sentences(text);
        let texts: Vec<&str> = sentences.iter().map(|s| s.text).collect();
        assert_eq!(texts, ["First one", "Second", "Third", "Fourth line"]);
        assert_eq!(&text[sentences[1].start..sentences[1].end], "Second");
        assert_eq!(count_sentences("彼は来た。雨だ！"), 2);
        assert_eq!(count_sentences("Wait... what?"), 2);
        assert_eq!(count_sentences(""), 0);
    }

    #[test]
    fn test_one_violation_in_ten_sentences() {
        let checker = ComplianceChecker::default().with_rule(Arc::new(FixedRule(1)));
        let result = checker.check(&ten_sentences());
        assert_eq!(result.score, 0.95);
        assert!(result.is_compliant);
        assert_eq!(result.violations.len(), 1);
    }

    #[test]
    fn test_threshold_applies() {
        let checker = ComplianceChecker::new(0.99).with_rule(Arc::new(FixedRule(1)));
        assert!(!checker.check(&ten_sentences()).is_compliant);
    }

    #[tokio::test]
    async fn test_check_with_context_concatenates() {
        let checker = ComplianceChecker::default()
            .with_rule(Arc::new(FixedRule(1)))
            .with_async_rule(Arc::new(AsyncFixed(2)))
            .with_async_rule(Arc::new(AsyncFixed(1)));

        assert_eq!(checker.check(&ten_sentences()).violations.len(), 1);
        assert_eq!(checker.check(&ten_sentences()).tokens_used, 0);

        let result = checker.check_with_context(&ten_sentences(), None).await.unwrap();
        assert_eq!(result.violations.len(), 4);
        assert_eq!(result.violations[0].rule, "fixed");
        assert_eq!(result.score, 0.8);
        assert_eq!(result.error_count(), 3);
        assert_eq!(result.tokens_used, 14);
    }

    #[tokio::test]
    async fn test_async_rule_error_propagates() {
        let checker = ComplianceChecker::default().with_async_rule(Arc::new(AsyncBroken));
        assert!(checker.check_with_context("x.", None).await.is_err());
    }

    #[test]
    fn test_violation_describe() {
        let v = Violation::new("forbidden_words", "forbidden_word", Severity::Error).with_context("suddenly");
        assert_eq!(v.describe(), "[error] forbidden_word (forbidden_words): \"suddenly\"");
    }
}
