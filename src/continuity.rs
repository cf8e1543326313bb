//! Continuity carried across chapters.
//!
//! [`CrossChapterState`] is only ever replaced, never edited in place: after a
//! chapter completes, [`update_state`] folds that chapter's
//! [`ChapterExtraction`] into a new state. The next chapter reads it through a
//! [`ChapterContext`].

use crate::errors::ParseError;
use crate::llm::{CompletionRequest, LlmClient, complete_structured};
use crate::prompts::{PromptRenderer, names};
use crate::util::{parse_json_object, str_field};
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WearLevel {
    Fresh,
    Used,
    Worn,
    Exhausted,
}

impl fmt::Display for WearLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WearLevel::Fresh => "fresh",
            WearLevel::Used => "used",
            WearLevel::Worn => "worn",
            WearLevel::Exhausted => "exhausted",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CharacterState {
    #[serde(default)]
    pub character_name: String,
    #[serde(default)]
    pub emotional_state: String,
    #[serde(default)]
    pub knowledge_gained: Vec<String>,
    #[serde(default)]
    pub relationship_changes: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub physical_state: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MotifWearEntry {
    pub motif: String,
    pub usage_count: u32,
    pub last_used_chapter: usize,
    pub wear_level: WearLevel,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChapterSummary {
    pub chapter_index: usize,
    pub summary: String,
    pub dominant_tone: String,
    pub peak_intensity: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CrossChapterState {
    pub character_states: Vec<CharacterState>,
    pub motif_wear: Vec<MotifWearEntry>,
    pub variation_hint: Option<String>,
    pub chapter_summaries: Vec<ChapterSummary>,
}

impl CrossChapterState {
    pub fn known_motifs(&self) -> Vec<String> {
        self.motif_wear.iter().map(|m| m.motif.clone()).collect()
    }

    pub fn known_characters(&self) -> Vec<String> {
        self.character_states
            .iter()
            .map(|c| c.character_name.clone())
            .collect()
    }

    /// Motifs at or beyond the given wear level.
    pub fn motifs_at_least(&self, level: WearLevel) -> Vec<&MotifWearEntry> {
        self.motif_wear
            .iter()
            .filter(|m| m.wear_level >= level)
            .collect()
    }
}

/// What one chapter contributed to continuity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChapterExtraction {
    pub character_states: Vec<CharacterState>,
    pub motif_occurrences: BTreeMap<String, u32>,
    pub variation_hint: Option<String>,
    pub summary: String,
    pub dominant_tone: String,
    pub peak_intensity: f64,
}

impl ChapterExtraction {
    /// Extraction used when the extractor's answer could not be read.
    pub fn zeroed() -> Self {
        Self {
            character_states: Vec::new(),
            motif_occurrences: BTreeMap::new(),
            variation_hint: None,
            summary: String::new(),
            dominant_tone: "neutral".to_string(),
            peak_intensity: 0.0,
        }
    }
}

pub fn create_initial_state() -> CrossChapterState {
    CrossChapterState::default()
}

pub fn calculate_wear_level(usage_count: u32) -> WearLevel {
    match usage_count {
        0..=1 => WearLevel::Fresh,
        2..=3 => WearLevel::Used,
        4..=5 => WearLevel::Worn,
        _ => WearLevel::Exhausted,
    }
}

/// Accumulate motif usage.
///
/// Existing entries keep their order; motifs seen for the first time are
/// appended. Entries without new occurrences are carried forward unchanged.
pub fn calculate_motif_wear(
    existing: &[MotifWearEntry],
    new_occurrences: &BTreeMap<String, u32>,
    chapter_index: usize,
) -> Vec<MotifWearEntry> {
    let mut entries: Vec<MotifWearEntry> = existing
        .iter()
        .map(|entry| match new_occurrences.get(&entry.motif) {
            Some(&n) if n > 0 => {
                let usage_count = entry.usage_count.saturating_add(n);
                MotifWearEntry {
                    motif: entry.motif.clone(),
                    usage_count,
                    last_used_chapter: chapter_index,
                    wear_level: calculate_wear_level(usage_count),
                }
            }
            _ => entry.clone(),
        })
        .collect();

    for (motif, &count) in new_occurrences {
        if count == 0 || existing.iter().any(|e| &e.motif == motif) {
            continue;
        }
        entries.push(MotifWearEntry {
            motif: motif.clone(),
            usage_count: count,
            last_used_chapter: chapter_index,
            wear_level: calculate_wear_level(count),
        });
    }
    entries
}

/// Fold one chapter's extraction into a new state.
///
/// Character states are replaced wholesale by the extraction's list.
pub fn update_state(
    current: &CrossChapterState,
    extraction: &ChapterExtraction,
    chapter_index: usize,
) -> CrossChapterState {
    let mut chapter_summaries = current.chapter_summaries.clone();
    chapter_summaries.push(ChapterSummary {
        chapter_index,
        summary: extraction.summary.clone(),
        dominant_tone: extraction.dominant_tone.clone(),
        peak_intensity: extraction.peak_intensity,
    });

    CrossChapterState {
        character_states: extraction.character_states.clone(),
        motif_wear: calculate_motif_wear(
            &current.motif_wear,
            &extraction.motif_occurrences,
            chapter_index,
        ),
        variation_hint: extraction.variation_hint.clone(),
        chapter_summaries,
    }
}

/// Read-only view of continuity handed to the stages writing a chapter.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChapterContext {
    pub chapter_index: usize,
    pub total_chapters: usize,
    pub previous_summaries: Vec<ChapterSummary>,
    pub previous_text: Option<String>,
    pub character_states: Vec<CharacterState>,
    /// Motifs that are worn or exhausted.
    pub overused_motifs: Vec<MotifWearEntry>,
    pub variation_hint: Option<String>,
}

impl ChapterContext {
    pub fn from_state(
        state: &CrossChapterState,
        chapter_index: usize,
        total_chapters: usize,
        previous_text: Option<String>,
    ) -> Self {
        Self {
            chapter_index,
            total_chapters,
            previous_summaries: state.chapter_summaries.clone(),
            previous_text,
            character_states: state.character_states.clone(),
            overused_motifs: state
                .motifs_at_least(WearLevel::Worn)
                .into_iter()
                .cloned()
                .collect(),
            variation_hint: state.variation_hint.clone(),
        }
    }

    pub fn has_history(&self) -> bool {
        !self.previous_summaries.is_empty() || self.previous_text.is_some()
    }

    pub fn last_summary(&self) -> Option<&ChapterSummary> {
        self.previous_summaries.last()
    }

    /// Prefix `prompt` with what the writer must know and avoid.
    pub fn compose_prompt(&self, prompt: &str) -> String {
        let mut out = format!(
            "Chapter {} of {}.\n\n",
            self.chapter_index + 1,
            self.total_chapters
        );

        if !self.previous_summaries.is_empty() {
            out.push_str("## Story so far\n");
            for s in &self.previous_summaries {
                out.push_str(&format!(
                    "- Chapter {} ({}, intensity {:.1}): {}\n",
                    s.chapter_index + 1,
                    s.dominant_tone,
                    s.peak_intensity,
                    s.summary
                ));
            }
            out.push('\n');
        }

        if !self.character_states.is_empty() {
            out.push_str("## Characters (do not re-introduce known facts)\n");
            for c in &self.character_states {
                out.push_str(&format!("- {}: {}", c.character_name, c.emotional_state));
                if !c.knowledge_gained.is_empty() {
                    out.push_str(&format!("; knows {}", c.knowledge_gained.join(", ")));
                }
                if let Some(ref physical) = c.physical_state {
                    out.push_str(&format!("; {}", physical));
                }
                out.push('\n');
            }
            out.push('\n');
        }

        if !self.overused_motifs.is_empty() {
            out.push_str("## Overused motifs (avoid or vary)\n");
            for m in &self.overused_motifs {
                out.push_str(&format!("- {} ({}, used {} times)\n", m.motif, m.wear_level, m.usage_count));
            }
            out.push('\n');
        }

        if let Some(ref hint) = self.variation_hint {
            out.push_str(&format!("## Variation\n{}\n\n", hint));
        }

        out.push_str("## This chapter\n");
        out.push_str(prompt);
        out
    }
}

/// Reads continuity facts out of a finished chapter.
#[async_trait]
pub trait StateExtractor: Send + Sync {
    async fn extract(
        &self,
        text: &str,
        chapter_index: usize,
        known_motifs: &[String],
        known_characters: &[String],
    ) -> Result<ChapterExtraction>;
}

fn motif_counts(value: Option<&Value>) -> BTreeMap<String, u32> {
    let Some(obj) = value.and_then(|v| v.as_object()) else {
        return BTreeMap::new();
    };
    obj.iter()
        .filter_map(|(motif, count)| {
            let n = count
                .as_u64()
                .or_else(|| count.as_f64().map(|f| f.max(0.0).round() as u64))?;
            Some((motif.clone(), u32::try_from(n).unwrap_or(u32::MAX)))
        })
        .collect()
}

pub fn parse_extraction(response: &str) -> Result<ChapterExtraction, ParseError> {
    let value = parse_json_object(response)?;

    let character_states: Vec<CharacterState> = match value.get("character_states") {
        Some(states) => serde_json::from_value(states.clone())?,
        None => return Err(ParseError::MissingField("character_states")),
    };

    let variation_hint = value
        .get("variation_hint")
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from);

    let dominant_tone = match str_field(&value, "dominant_tone") {
        tone if tone.is_empty() => "neutral".to_string(),
        tone => tone,
    };

    Ok(ChapterExtraction {
        character_states,
        motif_occurrences: motif_counts(value.get("motif_occurrences")),
        variation_hint,
        summary: str_field(&value, "summary"),
        dominant_tone,
        peak_intensity: value
            .get("peak_intensity")
            .and_then(|v| v.as_f64())
            .unwrap_or(0.0)
            .clamp(0.0, 1.0),
    })
}

pub struct LlmStateExtractor {
    client: Arc<dyn LlmClient>,
    renderer: Arc<dyn PromptRenderer>,
}

impl LlmStateExtractor {
    pub fn new(client: Arc<dyn LlmClient>, renderer: Arc<dyn PromptRenderer>) -> Self {
        Self { client, renderer }
    }
}

#[async_trait]
impl StateExtractor for LlmStateExtractor {
    async fn extract(
        &self,
        text: &str,
        chapter_index: usize,
        known_motifs: &[String],
        known_characters: &[String],
    ) -> Result<ChapterExtraction> {
        let prompt = self.renderer.render(
            names::EXTRACT_STATE,
            &json!({
                "chapter_index": chapter_index + 1,
                "text": text,
                "known_motifs": known_motifs,
                "known_characters": known_characters,
            }),
        )?;
        let completion =
            complete_structured(self.client.as_ref(), CompletionRequest::from_rendered(prompt))
                .await
                .context("State extraction call failed")?;

        Ok(parse_extraction(&completion.text).unwrap_or_else(|e| {
            tracing::warn!(chapter = chapter_index, error = %e, "Extraction unparseable, using zeroed extraction");
            ChapterExtraction::zeroed()
        }))
    }
}
