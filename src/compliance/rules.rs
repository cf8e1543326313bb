//! Built-in compliance rules.

use super::{AsyncRule, RuleReport, Severity, Sentence, SyncRule, Violation, split_sentences};
use crate::continuity::ChapterContext;
use crate::llm::{CompletionRequest, LlmClient, complete_structured};
use crate::prompts::{PromptRenderer, names};
use crate::util::{parse_json_object, str_field};
use anyhow::{Context, Result};
use async_trait::async_trait;
use regex::{Regex, RegexBuilder};
use serde_json::json;
use std::ops::Range;
use std::sync::Arc;

/// Characters of surrounding text kept as violation context.
const CONTEXT_RADIUS: usize = 30;

fn snippet(text: &str, start: usize, end: usize) -> String {
    let mut from = start.saturating_sub(CONTEXT_RADIUS);
    while !text.is_char_boundary(from) {
        from -= 1;
    }
    let mut to = (end + CONTEXT_RADIUS).min(text.len());
    while !text.is_char_boundary(to) {
        to += 1;
    }
    text[from..to].trim().replace('\n', " ")
}

/// Case-insensitive whole-word ban list.
pub struct ForbiddenWordsRule {
    pattern: Option<Regex>,
}

impl ForbiddenWordsRule {
    pub fn new<S: AsRef<str>>(words: &[S]) -> Result<Self, regex::Error> {
        let alternatives: Vec<String> = words
            .iter()
            .map(|w| w.as_ref().trim())
            .filter(|w| !w.is_empty())
            .map(regex::escape)
            .collect();
        if alternatives.is_empty() {
            return Ok(Self { pattern: None });
        }
        let pattern = RegexBuilder::new(&format!(r"\b(?:{})\b", alternatives.join("|")))
            .case_insensitive(true)
            .build()?;
        Ok(Self {
            pattern: Some(pattern),
        })
    }
}

impl SyncRule for ForbiddenWordsRule {
    fn name(&self) -> &str {
        "forbidden_words"
    }

    fn check(&self, text: &str) -> Vec<Violation> {
        let Some(ref pattern) = self.pattern else {
            return Vec::new();
        };
        pattern
            .find_iter(text)
            .map(|m| {
                Violation::new(self.name(), "forbidden_word", Severity::Error)
                    .at(m.start(), m.end())
                    .with_context(m.as_str())
            })
            .collect()
    }
}

/// Monotonous sentence rhythm.
///
/// Flags runs of `window` or more consecutive sentences that open with the
/// same word, and runs whose word counts all stay within `length_tolerance`
/// of the run's first sentence.
pub struct RhythmRule {
    window: usize,
    length_tolerance: usize,
}

impl Default for RhythmRule {
    fn default() -> Self {
        Self::new(3)
    }
}

impl RhythmRule {
    pub fn new(window: usize) -> Self {
        Self {
            window: window.max(2),
            length_tolerance: 2,
        }
    }

    pub fn with_length_tolerance(mut self, tolerance: usize) -> Self {
        self.length_tolerance = tolerance;
        self
    }

    fn runs<T: PartialEq>(
        &self,
        keys: &[T],
        same: impl Fn(&T, &T) -> bool,
    ) -> Vec<Range<usize>> {
        let mut runs = Vec::new();
        let mut start = 0;
        for i in 1..=keys.len() {
            if i < keys.len() && same(&keys[start], &keys[i]) {
                continue;
            }
            if i - start >= self.window {
                runs.push(start..i);
            }
            start = i;
        }
        runs
    }

    fn violation(&self, text: &str, sentences: &[Sentence<'_>], run: Range<usize>, kind: &str) -> Violation {
        let start = sentences[run.start].start;
        let end = sentences[run.end - 1].end;
        Violation::new(self.name(), kind, Severity::Warning)
            .at(start, end)
            .with_context(snippet(text, start, start))
    }
}

fn first_word(sentence: &str) -> String {
    sentence
        .split_whitespace()
        .next()
        .unwrap_or_default()
        .trim_matches(|c: char| !c.is_alphanumeric())
        .to_lowercase()
}

impl SyncRule for RhythmRule {
    fn name(&self) -> &str {
        "rhythm"
    }

    fn check(&self, text: &str) -> Vec<Violation> {
        let sentences = split_sentences(text);
        if sentences.len() < self.window {
            return Vec::new();
        }

        let openers: Vec<String> = sentences.iter().map(|s| first_word(s.text)).collect();
        let lengths: Vec<usize> = sentences
            .iter()
            .map(|s| s.text.split_whitespace().count())
            .collect();
        let tolerance = self.length_tolerance;

        let mut violations: Vec<Violation> = self
            .runs(&openers, |a, b| !a.is_empty() && a == b)
            .into_iter()
            .map(|run| self.violation(text, &sentences, run, "repeated_opening"))
            .collect();
        violations.extend(
            self.runs(&lengths, |a, b| a.abs_diff(*b) <= tolerance)
                .into_iter()
                .map(|run| self.violation(text, &sentences, run, "uniform_length")),
        );
        violations
    }
}

/// Cross-chapter repetition detected by a model.
pub struct RepetitionRule {
    client: Arc<dyn LlmClient>,
    renderer: Arc<dyn PromptRenderer>,
}

impl RepetitionRule {
    pub fn new(client: Arc<dyn LlmClient>, renderer: Arc<dyn PromptRenderer>) -> Self {
        Self { client, renderer }
    }
}

/// Read `{"violations": [{quote, reason, severity}]}`; anything else yields none.
fn parse_repetition_response(rule: &str, text: &str, response: &str) -> Vec<Violation> {
    let value = match parse_json_object(response) {
        Ok(v) => v,
        Err(e) => {
            tracing::warn!(error = %e, "Repetition check unparseable, treating as clean");
            return Vec::new();
        }
    };
    let Some(items) = value.get("violations").and_then(|v| v.as_array()) else {
        return Vec::new();
    };

    items
        .iter()
        .filter_map(|item| {
            let quote = str_field(item, "quote");
            if quote.is_empty() {
                return None;
            }
            let severity = match str_field(item, "severity").to_lowercase().as_str() {
                "error" => Severity::Error,
                _ => Severity::Warning,
            };
            let (start, end) = text
                .find(&quote)
                .map(|i| (i, i + quote.len()))
                .unwrap_or((0, 0));
            let reason = str_field(item, "reason");
            let context = if reason.is_empty() {
                quote
            } else {
                format!("{} ({})", quote, reason)
            };
            Some(
                Violation::new(rule, "repetition", severity)
                    .at(start, end)
                    .with_context(context),
            )
        })
        .collect()
}

#[async_trait]
impl AsyncRule for RepetitionRule {
    fn name(&self) -> &str {
        "repetition"
    }

    async fn check(&self, text: &str, context: Option<&ChapterContext>) -> Result<RuleReport> {
        let Some(context) = context.filter(|c| c.has_history()) else {
            return Ok(RuleReport::default());
        };

        let summaries: Vec<String> = context
            .previous_summaries
            .iter()
            .map(|s| format!("Chapter {}: {}", s.chapter_index + 1, s.summary))
            .collect();
        let prompt = self.renderer.render(
            names::REPETITION_CHECK,
            &json!({
                "previous_summaries": summaries,
                "previous_text": context.previous_text.as_deref().unwrap_or_default(),
                "text": text,
            }),
        )?;
        let completion =
            complete_structured(self.client.as_ref(), CompletionRequest::from_rendered(prompt))
                .await
                .context("Repetition check failed")?;

        Ok(RuleReport {
            violations: parse_repetition_response(self.name(), text, &completion.text),
            tokens_used: completion.total_tokens(),
        })
    }
}
